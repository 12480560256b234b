//! # Broker core
//!
//! Routes messages between the exchange and the plugins and coordinates
//! the broker's shutdown.
//!
//! ## Components
//!
//! - **PluginRegistry**: plugins that announced themselves, resolved to live
//!   handles on demand
//! - **BroadcastCoordinator**: delivers each inbound message to every plugin
//!   and answers operations nobody handled
//! - **ShutdownCoordinator**: `pre-exit`, plugin exit requests, `post-exit`
//! - **BrokerService**: the surface external callers use, plus outbound
//!   signals through the **SignalBus**
//!
//! Collaborators the broker does not own are traits in [`collaborators`].

pub mod broadcast;
pub mod collaborators;
pub mod registry;
pub mod service;
pub mod shutdown;
pub mod signal_bus;

pub use broadcast::{unhandled_operation, BroadcastCoordinator, BroadcastOutcome};
pub use collaborators::{
    Exchange, ExchangeError, MessageId, MessageStore, PluginHandle, PluginTransport,
    Registration, RegistrationError, TransportError,
};
pub use registry::{PluginRegistration, PluginRegistry, ResolvedPlugin};
pub use service::{BrokerBuilder, BrokerService};
pub use shutdown::{ShutdownCoordinator, ShutdownError, ShutdownPhase, StopOutcome};
pub use signal_bus::{BrokerSignal, SignalBus, SignalError, SignalReceiver};
