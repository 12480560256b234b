#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use landscape_broker::{
    broker::{
        Exchange, ExchangeError, MessageId, MessageStore, PluginHandle, PluginRegistration,
        PluginTransport, Registration, RegistrationError, TransportError,
    },
    BrokerConfig, BrokerService, ConfigError, ConfigSource, Message, Scheduler,
};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[ctor::ctor]
fn init_tests() {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

/// Shared, ordered record of what happened during a test.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

#[derive(Default)]
pub struct RecordingExchange {
    sent: Mutex<Vec<(Message, bool)>>,
    next_id: AtomicUsize,
}

impl RecordingExchange {
    pub fn sent(&self) -> Vec<(Message, bool)> {
        self.sent.lock().unwrap().clone()
    }
}

impl Exchange for RecordingExchange {
    fn send(&self, message: Message, urgent: bool) -> Result<Option<MessageId>, ExchangeError> {
        self.sent.lock().unwrap().push((message, urgent));
        Ok(Some(self.next_id.fetch_add(1, Ordering::SeqCst) as MessageId))
    }

    fn is_urgent(&self) -> bool {
        self.sent.lock().unwrap().iter().any(|(_, urgent)| *urgent)
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    pub pending: Mutex<Vec<MessageId>>,
    pub accepted: Mutex<Vec<String>>,
}

impl MessageStore for InMemoryStore {
    fn is_pending(&self, id: MessageId) -> bool {
        self.pending.lock().unwrap().contains(&id)
    }

    fn get_accepted_types(&self) -> Vec<String> {
        self.accepted.lock().unwrap().clone()
    }
}

#[derive(Default)]
pub struct CountingRegistration {
    pub calls: AtomicUsize,
}

#[async_trait]
impl Registration for CountingRegistration {
    async fn register(&self) -> Result<(), RegistrationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out a fixed configuration and counts reloads.
pub struct StaticConfigSource {
    pub config: Mutex<BrokerConfig>,
    pub reloads: AtomicUsize,
}

impl StaticConfigSource {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config: Mutex::new(config),
            reloads: AtomicUsize::new(0),
        }
    }
}

impl ConfigSource for StaticConfigSource {
    fn reload(&self) -> Result<BrokerConfig, ConfigError> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(self.config.lock().unwrap().clone())
    }
}

#[derive(Clone, Copy, Debug)]
pub enum Behavior {
    Handles,
    Ignores,
    Errors,
    Stalls(Duration),
}

pub struct FakePlugin {
    name: String,
    behavior: Behavior,
    exit_fails: bool,
    journal: Journal,
    pub delivered: Mutex<Vec<Message>>,
    pub exits: AtomicUsize,
}

#[async_trait]
impl PluginHandle for FakePlugin {
    async fn deliver(&self, bytes: &[u8]) -> Result<bool, TransportError> {
        let message = Message::from_bytes(bytes).map_err(|e| TransportError::Remote(e.to_string()))?;
        self.journal.record(format!("{}:deliver", self.name));
        self.delivered.lock().unwrap().push(message);
        match self.behavior {
            Behavior::Handles => Ok(true),
            Behavior::Ignores => Ok(false),
            Behavior::Errors => Err(TransportError::Remote(format!("{} crashed", self.name))),
            Behavior::Stalls(delay) => {
                tokio::time::sleep(delay).await;
                Ok(true)
            }
        }
    }

    async fn exit(&self) -> Result<(), TransportError> {
        self.journal.record(format!("{}:exit", self.name));
        self.exits.fetch_add(1, Ordering::SeqCst);
        if self.exit_fails {
            Err(TransportError::Remote(format!("{} refused to exit", self.name)))
        } else {
            Ok(())
        }
    }
}

/// Transport over in-process [`FakePlugin`]s. Endpoints that were never
/// added are unreachable.
#[derive(Default)]
pub struct FakeTransport {
    plugins: Mutex<HashMap<String, Arc<FakePlugin>>>,
    pub connect_timeouts: Mutex<Vec<Duration>>,
    pub journal: Journal,
}

impl FakeTransport {
    pub fn add(&self, endpoint_id: &str, behavior: Behavior) -> Arc<FakePlugin> {
        self.add_plugin(endpoint_id, behavior, false)
    }

    pub fn add_plugin(&self, endpoint_id: &str, behavior: Behavior, exit_fails: bool) -> Arc<FakePlugin> {
        let plugin = Arc::new(FakePlugin {
            name: endpoint_id.to_string(),
            behavior,
            exit_fails,
            journal: self.journal.clone(),
            delivered: Mutex::new(Vec::new()),
            exits: AtomicUsize::new(0),
        });
        self.plugins
            .lock()
            .unwrap()
            .insert(endpoint_id.to_string(), plugin.clone());
        plugin
    }

    pub fn connect_timeouts(&self) -> Vec<Duration> {
        self.connect_timeouts.lock().unwrap().clone()
    }
}

#[async_trait]
impl PluginTransport for FakeTransport {
    async fn connect(
        &self,
        registration: &PluginRegistration,
        timeout: Duration,
    ) -> Result<Arc<dyn PluginHandle>, TransportError> {
        self.connect_timeouts.lock().unwrap().push(timeout);
        let plugin = self.plugins.lock().unwrap().get(&registration.endpoint_id).cloned();
        match plugin {
            Some(plugin) => Ok(plugin as Arc<dyn PluginHandle>),
            None => Err(TransportError::ConnectTimeout {
                endpoint: registration.endpoint_id.clone(),
                timeout,
            }),
        }
    }
}

/// A broker service wired to recording fakes.
pub struct Harness {
    pub service: BrokerService,
    pub exchange: Arc<RecordingExchange>,
    pub store: Arc<InMemoryStore>,
    pub registration: Arc<CountingRegistration>,
    pub transport: Arc<FakeTransport>,
    pub config_source: Arc<StaticConfigSource>,
}

impl Harness {
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self::with_config(scheduler, BrokerConfig::default())
    }

    pub fn with_config(scheduler: Arc<dyn Scheduler>, config: BrokerConfig) -> Self {
        let exchange = Arc::new(RecordingExchange::default());
        let store = Arc::new(InMemoryStore::default());
        let registration = Arc::new(CountingRegistration::default());
        let transport = Arc::new(FakeTransport::default());
        let config_source = Arc::new(StaticConfigSource::new(config.clone()));
        let service = BrokerService::builder(scheduler)
            .config(config)
            .config_source(config_source.clone())
            .exchange(exchange.clone())
            .registration(registration.clone())
            .message_store(store.clone())
            .transport(transport.clone())
            .build()
            .unwrap();
        Self {
            service,
            exchange,
            store,
            registration,
            transport,
            config_source,
        }
    }
}
