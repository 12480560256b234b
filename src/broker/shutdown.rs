use std::sync::{Arc, Mutex};

use futures::future::join_all;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::registry::PluginRegistry;
use crate::{
    config::SharedConfig,
    reactor::{lock, EventArgs, EventType, Scheduler},
};

/// Progress of a graceful exit. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ShutdownPhase {
    Idle,
    PreExitFired,
    PluginsNotified,
    PostExitScheduled,
    Done,
}

#[derive(Debug, Error, PartialEq)]
pub enum ShutdownError {
    #[error("exit already requested (phase: {phase})")]
    AlreadyExiting { phase: ShutdownPhase },
}

/// How the plugins answered an exit request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopOutcome {
    pub asked: usize,
    pub failed: usize,
}

/// Tells plugins to exit and sequences the broker's own `pre-exit` and
/// `post-exit` events around it.
pub struct ShutdownCoordinator {
    scheduler: Arc<dyn Scheduler>,
    registry: Arc<PluginRegistry>,
    config: SharedConfig,
    phase: Arc<Mutex<ShutdownPhase>>,
}

impl ShutdownCoordinator {
    pub fn new(
        scheduler: Arc<dyn Scheduler>,
        registry: Arc<PluginRegistry>,
        config: SharedConfig,
    ) -> Self {
        Self {
            scheduler,
            registry,
            config,
            phase: Arc::new(Mutex::new(ShutdownPhase::Idle)),
        }
    }

    pub fn phase(&self) -> ShutdownPhase {
        *lock(&self.phase)
    }

    fn set_phase(&self, phase: ShutdownPhase) {
        debug!(%phase, "shutdown phase changed");
        *lock(&self.phase) = phase;
    }

    /// Asks every registered plugin to exit and waits for all of them to answer.
    ///
    /// Plugins are connected with the shutdown connect timeout, zero by
    /// default, so a plugin that is already gone or wedged is not waited for.
    /// Failures are logged and otherwise ignored.
    #[instrument(level = "debug", skip(self))]
    pub async fn stop_plugins(&self) -> StopOutcome {
        let (connect_timeout, exit_timeout) = {
            let config = self.config.read().await;
            (config.shutdown_connect_timeout, config.exit_timeout)
        };
        let plugins = self.registry.resolve(Some(connect_timeout)).await;

        let mut outcome = StopOutcome {
            asked: plugins.len(),
            failed: 0,
        };
        let mut exits = Vec::with_capacity(plugins.len());
        for plugin in plugins {
            match plugin.handle {
                Ok(handle) => exits.push(async move {
                    let result = tokio::time::timeout(exit_timeout, handle.exit()).await;
                    (plugin.registration, result)
                }),
                Err(_) => outcome.failed += 1,
            }
        }

        for (registration, result) in join_all(exits).await {
            match result {
                Ok(Ok(())) => debug!(plugin = %registration, "plugin acknowledged exit"),
                Ok(Err(e)) => {
                    outcome.failed += 1;
                    warn!(plugin = %registration, error = %e, "plugin failed to exit");
                }
                Err(_) => {
                    outcome.failed += 1;
                    warn!(plugin = %registration, timeout = ?exit_timeout, "plugin exit timed out");
                }
            }
        }
        info!(asked = outcome.asked, failed = outcome.failed, "plugins asked to exit");
        outcome
    }

    /// Starts a graceful exit.
    ///
    /// Fires `pre-exit`, waits for every plugin to answer the exit request,
    /// then schedules `post-exit` after the configured delay and returns
    /// without waiting for it. A broker exits once; later requests fail.
    #[instrument(level = "debug", skip(self))]
    pub async fn exit(&self) -> Result<StopOutcome, ShutdownError> {
        {
            let mut phase = lock(&self.phase);
            if *phase != ShutdownPhase::Idle {
                return Err(ShutdownError::AlreadyExiting { phase: *phase });
            }
            *phase = ShutdownPhase::PreExitFired;
        }
        info!("broker exiting");
        self.scheduler.fire(&EventType::PreExit, EventArgs::new());

        let outcome = self.stop_plugins().await;
        self.set_phase(ShutdownPhase::PluginsNotified);

        let delay = self.config.read().await.post_exit_delay;
        let scheduler = Arc::downgrade(&self.scheduler);
        let phase = self.phase.clone();
        self.set_phase(ShutdownPhase::PostExitScheduled);
        self.scheduler.call_later(
            delay,
            Box::new(move || {
                if let Some(scheduler) = scheduler.upgrade() {
                    scheduler.fire(&EventType::PostExit, EventArgs::new());
                }
                *lock(&phase) = ShutdownPhase::Done;
            }),
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use mockall::predicate::eq;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        broker::{
            collaborators::{MockPluginHandle, MockPluginTransport, PluginHandle, TransportError},
            registry::PluginRegistration,
        },
        config::{shared, BrokerConfig},
        reactor::{handler, FakeReactor, Value, DEFAULT_PRIORITY},
    };

    fn exiting_handle(result: Result<(), TransportError>) -> Arc<dyn PluginHandle> {
        let mut handle = MockPluginHandle::new();
        handle
            .expect_exit()
            .times(1)
            .returning(move || result.clone());
        Arc::new(handle)
    }

    fn coordinator(fake: &Arc<FakeReactor>, transport: MockPluginTransport) -> ShutdownCoordinator {
        let config = shared(BrokerConfig::default());
        let registry = Arc::new(PluginRegistry::new(Arc::new(transport), config.clone()));
        registry.register("plugin.a", "/a");
        registry.register("plugin.b", "/b");
        ShutdownCoordinator::new(fake.clone(), registry, config)
    }

    fn counting(fake: &FakeReactor, event: EventType) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        fake.call_on(
            event,
            handler(move |_| {
                count_clone.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }),
            DEFAULT_PRIORITY,
        );
        count
    }

    #[tokio::test]
    async fn test_stop_plugins_connects_with_zero_timeout_and_swallows_failures() {
        let mut transport = MockPluginTransport::new();
        transport
            .expect_connect()
            .withf(|registration, timeout| registration.endpoint_id == "plugin.a" && timeout.is_zero())
            .returning(|_, _| Ok(exiting_handle(Err(TransportError::Remote("wedged".into())))));
        transport
            .expect_connect()
            .withf(|registration, timeout| registration.endpoint_id == "plugin.b" && timeout.is_zero())
            .returning(|_, _| Ok(exiting_handle(Ok(()))));
        let fake = Arc::new(FakeReactor::new());
        let coordinator = coordinator(&fake, transport);

        let outcome = coordinator.stop_plugins().await;
        assert_eq!(outcome, StopOutcome { asked: 2, failed: 1 });
        assert_eq!(coordinator.phase(), ShutdownPhase::Idle);
    }

    #[tokio::test]
    async fn test_exit_sequence() {
        let mut transport = MockPluginTransport::new();
        transport
            .expect_connect()
            .with(eq(PluginRegistration::new("plugin.a", "/a")), eq(Duration::ZERO))
            .returning(|_, _| Ok(exiting_handle(Ok(()))));
        transport
            .expect_connect()
            .with(eq(PluginRegistration::new("plugin.b", "/b")), eq(Duration::ZERO))
            .returning(|registration, timeout| {
                Err(TransportError::ConnectTimeout {
                    endpoint: registration.endpoint_id.clone(),
                    timeout,
                })
            });
        let fake = Arc::new(FakeReactor::new());
        let pre_exit = counting(&fake, EventType::PreExit);
        let post_exit = counting(&fake, EventType::PostExit);
        let coordinator = coordinator(&fake, transport);

        let outcome = coordinator.exit().await.unwrap();
        assert_eq!(outcome, StopOutcome { asked: 2, failed: 1 });
        assert_eq!(pre_exit.load(Ordering::SeqCst), 1);
        assert_eq!(post_exit.load(Ordering::SeqCst), 0);
        assert_eq!(coordinator.phase(), ShutdownPhase::PostExitScheduled);

        fake.advance(0.5);
        assert_eq!(post_exit.load(Ordering::SeqCst), 0);
        fake.advance(0.5);
        assert_eq!(post_exit.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.phase(), ShutdownPhase::Done);
    }

    #[tokio::test]
    async fn test_second_exit_is_rejected() {
        let mut transport = MockPluginTransport::new();
        transport
            .expect_connect()
            .times(2)
            .returning(|_, _| Ok(exiting_handle(Ok(()))));
        let fake = Arc::new(FakeReactor::new());
        let pre_exit = counting(&fake, EventType::PreExit);
        let coordinator = coordinator(&fake, transport);

        coordinator.exit().await.unwrap();
        assert_eq!(
            coordinator.exit().await,
            Err(ShutdownError::AlreadyExiting {
                phase: ShutdownPhase::PostExitScheduled
            })
        );
        assert_eq!(pre_exit.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(ShutdownPhase::PreExitFired.to_string(), "pre-exit-fired");
        assert_eq!(ShutdownPhase::Done.to_string(), "done");
    }
}
