//! # landscape-broker
//!
//! Concurrency and coordination core of a host management agent's broker
//! process.
//!
//! ## Layers
//!
//! ### 1. Reactor
//! A single-threaded scheduler owns all timing and eventing ([`reactor`]):
//! - Timed calls: one-shot and repeating
//! - Prioritized synchronous events
//! - Hand-off of blocking work to worker threads and back
//!
//! [`reactor::Reactor`] runs on the wall clock; [`reactor::FakeReactor`]
//! runs on a virtual clock that tests advance by hand.
//!
//! ### 2. Broker
//! Components written against the [`reactor::Scheduler`] trait ([`broker`]):
//! - Plugin registry and resolution
//! - Message broadcast with synthesized failures for unhandled operations
//! - Graceful shutdown sequencing
//! - The service surface and its outbound signals
//!
//! ### 3. Support
//! - Message envelope ([`message`])
//! - Configuration ([`config`])
//! - Errors ([`error`])
//!
//! ## Flow
//!
//! ```text
//! exchange ─▶ fire(message) ─▶ BroadcastCoordinator ─▶ plugins
//!                                    │ nobody handled an operation
//!                                    ▼
//!                          exchange.send(operation-result, urgent)
//! ```

pub mod broker;
pub mod config;
pub mod error;
pub mod message;
pub mod reactor;

pub use broker::{BrokerBuilder, BrokerService, BrokerSignal};
pub use config::{BrokerConfig, ConfigError, ConfigSource, FileConfigSource, SharedConfig};
pub use error::{BrokerError, BrokerResult};
pub use message::{Message, MessageError};
pub use reactor::{FakeReactor, Reactor, Scheduler};

#[cfg(test)]
#[ctor::ctor]
fn init_tests() {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}
