//! Interfaces of the services the broker talks to but does not own.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

use super::registry::PluginRegistration;
use crate::message::Message;

/// Identifier the message store assigns to a queued message.
pub type MessageId = u64;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("could not reach plugin {endpoint} within {timeout:?}")]
    ConnectTimeout { endpoint: String, timeout: Duration },
    #[error("plugin {endpoint} is unreachable: {reason}")]
    Unreachable { endpoint: String, reason: String },
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
    #[error("plugin returned an error: {0}")]
    Remote(String),
}

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("message rejected: {0}")]
    Rejected(String),
    #[error("message store unavailable: {0}")]
    StoreUnavailable(String),
}

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("registration refused: {0}")]
    Refused(String),
    #[error("registration failed: {0}")]
    Failed(String),
}

/// Queues messages for the next exchange with the server.
#[cfg_attr(test, mockall::automock)]
pub trait Exchange: Send + Sync {
    /// Queues `message`, returning its id when the store keeps one.
    /// `urgent` asks for an exchange as soon as possible.
    fn send(&self, message: Message, urgent: bool) -> Result<Option<MessageId>, ExchangeError>;

    fn is_urgent(&self) -> bool;
}

#[cfg_attr(test, mockall::automock)]
pub trait MessageStore: Send + Sync {
    fn is_pending(&self, id: MessageId) -> bool;

    fn get_accepted_types(&self) -> Vec<String>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Registration: Send + Sync {
    async fn register(&self) -> Result<(), RegistrationError>;
}

/// A connected plugin endpoint.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PluginHandle: Send + Sync {
    /// Hands a serialized message to the plugin; `Ok(true)` means it handled it.
    async fn deliver(&self, bytes: &[u8]) -> Result<bool, TransportError>;

    /// Asks the plugin to exit.
    async fn exit(&self) -> Result<(), TransportError>;
}

/// Turns a registration into a live handle.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PluginTransport: Send + Sync {
    /// Connects to `registration`, retrying for up to `timeout`.
    /// A zero timeout makes a single attempt.
    async fn connect(
        &self,
        registration: &PluginRegistration,
        timeout: Duration,
    ) -> Result<Arc<dyn PluginHandle>, TransportError>;
}
