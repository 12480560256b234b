use std::sync::Arc;

use tracing::{debug, error, info, instrument};

use super::{
    broadcast::{BroadcastCoordinator, BroadcastOutcome},
    collaborators::{Exchange, MessageId, MessageStore, PluginTransport, Registration},
    registry::{PluginRegistration, PluginRegistry},
    shutdown::{ShutdownCoordinator, ShutdownPhase, StopOutcome},
    signal_bus::{BrokerSignal, SignalBus, SignalReceiver},
};
use crate::{
    config::{self, BrokerConfig, ConfigSource, SharedConfig},
    error::{BrokerError, BrokerResult},
    message::{Message, MessageError},
    reactor::{
        handler, CallId, EventArgs, EventType, HandlerError, Scheduler, Value, DEFAULT_PRIORITY,
    },
};

/// The broker's outward surface: what plugins and local tools call, and the
/// signals they can listen to.
///
/// Dropping the service removes its reactor subscriptions.
pub struct BrokerService {
    scheduler: Arc<dyn Scheduler>,
    config: SharedConfig,
    config_source: Arc<dyn ConfigSource>,
    exchange: Arc<dyn Exchange>,
    registration: Arc<dyn Registration>,
    message_store: Arc<dyn MessageStore>,
    registry: Arc<PluginRegistry>,
    broadcaster: Arc<BroadcastCoordinator>,
    shutdown: ShutdownCoordinator,
    signals: Arc<SignalBus>,
    subscriptions: Vec<CallId>,
}

impl BrokerService {
    pub fn builder(scheduler: Arc<dyn Scheduler>) -> BrokerBuilder {
        BrokerBuilder::new(scheduler)
    }

    pub fn ping(&self) -> bool {
        true
    }

    /// Queues `message` on the exchange.
    ///
    /// A message without a type is logged as an error but still forwarded;
    /// the exchange decides what to do with it.
    pub fn send_message(&self, message: Message, urgent: bool) -> BrokerResult<Option<MessageId>> {
        match message.message_type() {
            Some(message_type) => debug!(message_type, urgent, "got a message to send"),
            None => error!(error = %MessageError::MissingType, "got a message to send"),
        }
        Ok(self.exchange.send(message, urgent)?)
    }

    /// Decodes a serialized message and queues it like [`Self::send_message`].
    pub fn send_message_bytes(&self, bytes: &[u8], urgent: bool) -> BrokerResult<Option<MessageId>> {
        let message: Message = serde_json::from_slice(bytes).map_err(MessageError::from)?;
        self.send_message(message, urgent)
    }

    pub fn is_message_pending(&self, id: MessageId) -> bool {
        self.message_store.is_pending(id)
    }

    pub fn register_plugin(&self, endpoint_id: &str, path: &str) -> bool {
        self.registry.register(endpoint_id, path)
    }

    pub fn get_registered_plugins(&self) -> Vec<PluginRegistration> {
        self.registry.list_registered()
    }

    /// Reloads the configuration, then asks every plugin to exit so it
    /// restarts with the new settings.
    ///
    /// An invalid configuration is rejected before anything changes.
    #[instrument(level = "debug", skip(self))]
    pub async fn reload_configuration(&self) -> BrokerResult<StopOutcome> {
        let reloaded = self.config_source.reload()?;
        reloaded.validate()?;
        info!(config = ?reloaded, "configuration reloaded");
        *self.config.write().await = reloaded;
        Ok(self.shutdown.stop_plugins().await)
    }

    pub async fn register(&self) -> BrokerResult<()> {
        Ok(self.registration.register().await?)
    }

    pub fn get_accepted_message_types(&self) -> Vec<String> {
        self.message_store.get_accepted_types()
    }

    /// Graceful exit; see [`ShutdownCoordinator::exit`].
    pub async fn exit(&self) -> BrokerResult<StopOutcome> {
        Ok(self.shutdown.exit().await?)
    }

    pub fn shutdown_phase(&self) -> ShutdownPhase {
        self.shutdown.phase()
    }

    /// Broadcasts `message` directly, bypassing the reactor's `message` event.
    pub async fn broadcast_message(&self, message: &Message) -> BrokerResult<BroadcastOutcome> {
        self.broadcaster.broadcast(message).await
    }

    pub fn subscribe_signals(&self) -> SignalReceiver {
        self.signals.subscribe()
    }

    pub fn config(&self) -> SharedConfig {
        self.config.clone()
    }

    fn forward_signals(&mut self) {
        let forwards = [
            (EventType::ResynchronizeClients, BrokerSignal::Resynchronize),
            (EventType::ImpendingExchange, BrokerSignal::ImpendingExchange),
            (EventType::ExchangeFailed, BrokerSignal::ExchangeFailed),
            (EventType::RegistrationDone, BrokerSignal::RegistrationDone),
            (EventType::RegistrationFailed, BrokerSignal::RegistrationFailed),
        ];
        for (event_type, signal) in forwards {
            let signals = self.signals.clone();
            let id = self.scheduler.call_on(
                event_type,
                handler(move |_| {
                    signals.emit(signal.clone());
                    Ok(Value::Null)
                }),
                DEFAULT_PRIORITY,
            );
            self.subscriptions.push(id);
        }

        let signals = self.signals.clone();
        let id = self.scheduler.call_on(
            EventType::MessageTypeAcceptanceChanged,
            handler(move |args: &EventArgs| {
                let message_type = args
                    .require(0)?
                    .as_str()
                    .ok_or(HandlerError::ArgumentType {
                        index: 0,
                        expected: "string",
                    })?;
                let accepted = args.require(1)?.as_bool().ok_or(HandlerError::ArgumentType {
                    index: 1,
                    expected: "bool",
                })?;
                signals.emit(BrokerSignal::MessageTypeAcceptanceChanged {
                    message_type: message_type.to_string(),
                    accepted,
                });
                Ok(Value::Null)
            }),
            DEFAULT_PRIORITY,
        );
        self.subscriptions.push(id);
    }
}

impl Drop for BrokerService {
    fn drop(&mut self) {
        for id in self.subscriptions.drain(..) {
            self.scheduler.cancel_call(id);
        }
    }
}

/// Wires a [`BrokerService`] from its collaborators.
pub struct BrokerBuilder {
    scheduler: Arc<dyn Scheduler>,
    config: Option<BrokerConfig>,
    config_source: Option<Arc<dyn ConfigSource>>,
    exchange: Option<Arc<dyn Exchange>>,
    registration: Option<Arc<dyn Registration>>,
    message_store: Option<Arc<dyn MessageStore>>,
    transport: Option<Arc<dyn PluginTransport>>,
}

impl BrokerBuilder {
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            scheduler,
            config: None,
            config_source: None,
            exchange: None,
            registration: None,
            message_store: None,
            transport: None,
        }
    }

    pub fn config(mut self, config: BrokerConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn config_source(mut self, source: Arc<dyn ConfigSource>) -> Self {
        self.config_source = Some(source);
        self
    }

    pub fn exchange(mut self, exchange: Arc<dyn Exchange>) -> Self {
        self.exchange = Some(exchange);
        self
    }

    pub fn registration(mut self, registration: Arc<dyn Registration>) -> Self {
        self.registration = Some(registration);
        self
    }

    pub fn message_store(mut self, message_store: Arc<dyn MessageStore>) -> Self {
        self.message_store = Some(message_store);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn PluginTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Builds the service and subscribes it to the reactor's broker events.
    ///
    /// Without an explicit configuration the config source is loaded once.
    pub fn build(self) -> BrokerResult<BrokerService> {
        let config_source = self
            .config_source
            .ok_or(BrokerError::MissingCollaborator("config source"))?;
        let exchange = self
            .exchange
            .ok_or(BrokerError::MissingCollaborator("exchange"))?;
        let registration = self
            .registration
            .ok_or(BrokerError::MissingCollaborator("registration"))?;
        let message_store = self
            .message_store
            .ok_or(BrokerError::MissingCollaborator("message store"))?;
        let transport = self
            .transport
            .ok_or(BrokerError::MissingCollaborator("plugin transport"))?;

        let broker_config = match self.config {
            Some(config) => config,
            None => config_source.reload()?,
        };
        broker_config.validate()?;
        let signals = Arc::new(SignalBus::new(broker_config.signal_buffer_size));
        let config = config::shared(broker_config);

        let registry = Arc::new(PluginRegistry::new(transport, config.clone()));
        let broadcaster = Arc::new(BroadcastCoordinator::new(
            registry.clone(),
            exchange.clone(),
            config.clone(),
        ));
        let shutdown =
            ShutdownCoordinator::new(self.scheduler.clone(), registry.clone(), config.clone());
        let message_subscription = broadcaster.attach(&self.scheduler);

        let mut service = BrokerService {
            scheduler: self.scheduler,
            config,
            config_source,
            exchange,
            registration,
            message_store,
            registry,
            broadcaster,
            shutdown,
            signals,
            subscriptions: vec![message_subscription],
        };
        service.forward_signals();
        info!("broker service ready");
        Ok(service)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mockall::predicate::eq;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        broker::collaborators::{
            ExchangeError, MockExchange, MockMessageStore, MockPluginTransport, MockRegistration,
            RegistrationError,
        },
        config::{ConfigError, MockConfigSource},
        reactor::FakeReactor,
    };

    struct Mocks {
        exchange: MockExchange,
        store: MockMessageStore,
        registration: MockRegistration,
    }

    impl Mocks {
        fn new() -> Self {
            Self {
                exchange: MockExchange::new(),
                store: MockMessageStore::new(),
                registration: MockRegistration::new(),
            }
        }

        fn build(self, fake: &Arc<FakeReactor>) -> BrokerService {
            let scheduler: Arc<dyn Scheduler> = fake.clone();
            BrokerService::builder(scheduler)
                .config(BrokerConfig::default())
                .config_source(Arc::new(MockConfigSource::new()))
                .exchange(Arc::new(self.exchange))
                .registration(Arc::new(self.registration))
                .message_store(Arc::new(self.store))
                .transport(Arc::new(MockPluginTransport::new()))
                .build()
                .unwrap()
        }
    }

    #[test]
    fn test_builder_requires_collaborators() {
        let scheduler: Arc<dyn Scheduler> = Arc::new(FakeReactor::new());
        let result = BrokerService::builder(scheduler)
            .config_source(Arc::new(MockConfigSource::new()))
            .build();
        assert!(matches!(
            result,
            Err(BrokerError::MissingCollaborator("exchange"))
        ));
    }

    #[test]
    fn test_ping_and_plugin_registration() {
        let fake = Arc::new(FakeReactor::new());
        let service = Mocks::new().build(&fake);
        assert!(service.ping());
        assert!(service.register_plugin("plugin.manager", "/manager"));
        assert!(!service.register_plugin("plugin.manager", "/manager"));
        assert_eq!(
            service.get_registered_plugins(),
            vec![PluginRegistration::new("plugin.manager", "/manager")]
        );
    }

    #[test]
    fn test_send_message_forwards_even_without_type() {
        let fake = Arc::new(FakeReactor::new());
        let mut mocks = Mocks::new();
        mocks
            .exchange
            .expect_send()
            .times(2)
            .returning(|_, urgent| Ok(if urgent { Some(7) } else { None }));
        let service = mocks.build(&fake);

        assert_eq!(
            service.send_message(Message::new("foobar"), true).unwrap(),
            Some(7)
        );
        assert_eq!(
            service
                .send_message_bytes(br#"{"operation-id": 1}"#, false)
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_send_message_propagates_exchange_errors() {
        let fake = Arc::new(FakeReactor::new());
        let mut mocks = Mocks::new();
        mocks
            .exchange
            .expect_send()
            .returning(|_, _| Err(ExchangeError::Rejected("store full".into())));
        let service = mocks.build(&fake);

        assert!(matches!(
            service.send_message(Message::new("foobar"), false),
            Err(BrokerError::Exchange(_))
        ));
    }

    #[test]
    fn test_store_queries_are_delegated() {
        let fake = Arc::new(FakeReactor::new());
        let mut mocks = Mocks::new();
        mocks
            .store
            .expect_is_pending()
            .with(eq(3))
            .return_const(true);
        mocks
            .store
            .expect_get_accepted_types()
            .return_const(vec!["foobar".to_string()]);
        let service = mocks.build(&fake);

        assert!(service.is_message_pending(3));
        assert_eq!(service.get_accepted_message_types(), vec!["foobar"]);
    }

    #[tokio::test]
    async fn test_register_propagates_failure() {
        let fake = Arc::new(FakeReactor::new());
        let mut mocks = Mocks::new();
        mocks
            .registration
            .expect_register()
            .returning(|| Err(RegistrationError::Refused("bad account".into())));
        let service = mocks.build(&fake);

        assert!(matches!(
            service.register().await,
            Err(BrokerError::Registration(_))
        ));
    }

    #[tokio::test]
    async fn test_signals_follow_reactor_events() {
        let fake = Arc::new(FakeReactor::new());
        let service = Mocks::new().build(&fake);
        let mut signals = service.subscribe_signals();

        fake.fire(&EventType::ResynchronizeClients, EventArgs::new());
        fake.fire(
            &EventType::MessageTypeAcceptanceChanged,
            EventArgs::new().arg("foobar").arg(true),
        );

        assert_eq!(signals.recv().await.unwrap(), BrokerSignal::Resynchronize);
        assert_eq!(
            signals.recv().await.unwrap(),
            BrokerSignal::MessageTypeAcceptanceChanged {
                message_type: "foobar".to_string(),
                accepted: true,
            }
        );
    }

    #[tokio::test]
    async fn test_reload_rejects_invalid_configuration() {
        let fake = Arc::new(FakeReactor::new());
        let scheduler: Arc<dyn Scheduler> = fake.clone();
        let mut source = MockConfigSource::new();
        source.expect_reload().times(1).returning(|| {
            Ok(BrokerConfig {
                exit_timeout: Duration::ZERO,
                ..BrokerConfig::default()
            })
        });
        let mut transport = MockPluginTransport::new();
        transport.expect_connect().never();
        let service = BrokerService::builder(scheduler)
            .config(BrokerConfig::default())
            .config_source(Arc::new(source))
            .exchange(Arc::new(MockExchange::new()))
            .registration(Arc::new(MockRegistration::new()))
            .message_store(Arc::new(MockMessageStore::new()))
            .transport(Arc::new(transport))
            .build()
            .unwrap();
        service.register_plugin("plugin.manager", "/manager");

        let result = service.reload_configuration().await;

        assert!(matches!(
            result,
            Err(BrokerError::Config(ConfigError::Invalid {
                field: "exit_timeout",
                ..
            }))
        ));
        assert_eq!(
            service.config().read().await.exit_timeout,
            BrokerConfig::default().exit_timeout
        );
    }

    #[test]
    fn test_drop_removes_subscriptions() {
        let fake = Arc::new(FakeReactor::new());
        let service = Mocks::new().build(&fake);
        assert!(!fake.fire(&EventType::ImpendingExchange, EventArgs::new()).is_empty());

        drop(service);
        assert!(fake.fire(&EventType::ImpendingExchange, EventArgs::new()).is_empty());
    }
}
