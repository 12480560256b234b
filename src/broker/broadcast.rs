use std::sync::{Arc, Weak};

use futures::future::join_all;
use tracing::{debug, error, instrument, warn};

use super::{collaborators::Exchange, registry::PluginRegistry};
use crate::{
    config::SharedConfig,
    error::{error_chain, BrokerResult},
    message::{unhandled_operation_text, Message, FAILED, RESYNCHRONIZE},
    reactor::{handler, CallId, EventType, HandlerError, Scheduler, Value, DEFAULT_PRIORITY},
};

/// What happened to one broadcast, once every delivery settled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    /// Plugins that accepted the message, whether or not they handled it.
    pub delivered: usize,
    /// At least one plugin reported the message as handled.
    pub handled: bool,
    /// Plugins that could not be reached, errored or timed out.
    pub failed: usize,
    /// A failing `operation-result` was queued on the exchange.
    pub failure_sent: bool,
}

/// Delivers inbound messages to every registered plugin.
pub struct BroadcastCoordinator {
    registry: Arc<PluginRegistry>,
    exchange: Arc<dyn Exchange>,
    config: SharedConfig,
}

impl BroadcastCoordinator {
    pub fn new(
        registry: Arc<PluginRegistry>,
        exchange: Arc<dyn Exchange>,
        config: SharedConfig,
    ) -> Self {
        Self {
            registry,
            exchange,
            config,
        }
    }

    /// Serializes `message` once and delivers it to every registered plugin.
    ///
    /// All deliveries settle before the outcome is judged. An operation nobody
    /// handled is answered with a failing `operation-result`.
    #[instrument(level = "debug", skip_all, fields(message_type = ?message.message_type()))]
    pub async fn broadcast(&self, message: &Message) -> BrokerResult<BroadcastOutcome> {
        let bytes = message.to_bytes()?;
        let deliver_timeout = self.config.read().await.deliver_timeout;
        let plugins = self.registry.resolve(None).await;

        let mut outcome = BroadcastOutcome::default();
        let mut deliveries = Vec::with_capacity(plugins.len());
        for plugin in plugins {
            match plugin.handle {
                Ok(handle) => {
                    let bytes = &bytes;
                    deliveries.push(async move {
                        let result =
                            tokio::time::timeout(deliver_timeout, handle.deliver(bytes)).await;
                        (plugin.registration, result)
                    });
                }
                Err(_) => outcome.failed += 1,
            }
        }

        for (registration, result) in join_all(deliveries).await {
            match result {
                Ok(Ok(handled)) => {
                    outcome.delivered += 1;
                    outcome.handled |= handled;
                }
                Ok(Err(e)) => {
                    outcome.failed += 1;
                    warn!(plugin = %registration, error = %e, "message delivery failed");
                }
                Err(_) => {
                    outcome.failed += 1;
                    warn!(plugin = %registration, timeout = ?deliver_timeout, "message delivery timed out");
                }
            }
        }
        debug!(?outcome, "message delivered");

        if let Some(response) = unhandled_operation(message, outcome.handled) {
            error!(
                message_type = message.message_type().unwrap_or_default(),
                "nobody handled the message"
            );
            match self.exchange.send(response, true) {
                Ok(_) => outcome.failure_sent = true,
                Err(e) => error!(error = %error_chain(&e), "failed to queue operation failure"),
            }
        }
        Ok(outcome)
    }

    /// Subscribes to [`EventType::Message`] so that every fired message is
    /// broadcast as a task on `scheduler`.
    ///
    /// The subscription holds weak references only; once the coordinator is
    /// dropped the handler does nothing.
    pub fn attach(self: &Arc<Self>, scheduler: &Arc<dyn Scheduler>) -> CallId {
        let coordinator: Weak<Self> = Arc::downgrade(self);
        let weak_scheduler: Weak<dyn Scheduler> = Arc::downgrade(scheduler);
        scheduler.call_on(
            EventType::Message,
            handler(move |args| {
                let message = args
                    .require(0)?
                    .as_message()
                    .cloned()
                    .ok_or(HandlerError::ArgumentType {
                        index: 0,
                        expected: "message",
                    })?;
                let (Some(coordinator), Some(scheduler)) =
                    (coordinator.upgrade(), weak_scheduler.upgrade())
                else {
                    return Ok(Value::Null);
                };
                scheduler.spawn(Box::pin(async move {
                    if let Err(e) = coordinator.broadcast(&message).await {
                        error!(error = %error_chain(&e), "broadcast failed");
                    }
                }));
                Ok(Value::Null)
            }),
            DEFAULT_PRIORITY,
        )
    }
}

/// The failure to send back for `message` when no plugin handled it.
///
/// Only operations (messages carrying an `operation-id`) get one, and never
/// `resynchronize`.
pub fn unhandled_operation(message: &Message, handled: bool) -> Option<Message> {
    if handled {
        return None;
    }
    let operation_id = message.operation_id()?;
    let message_type = message.message_type()?;
    if message_type == RESYNCHRONIZE {
        return None;
    }
    Some(Message::operation_result(
        operation_id.clone(),
        FAILED,
        &unhandled_operation_text(message_type),
    ))
}
