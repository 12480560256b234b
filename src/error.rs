use thiserror::Error;

use crate::broker::{
    collaborators::{ExchangeError, RegistrationError, TransportError},
    shutdown::ShutdownError,
    signal_bus::SignalError,
};
use crate::config::ConfigError;
use crate::message::MessageError;
use crate::reactor::ReactorError;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Reactor error: {0}")]
    Reactor(#[from] ReactorError),
    #[error("Message error: {0}")]
    Message(#[from] MessageError),
    #[error("Exchange error: {0}")]
    Exchange(#[from] ExchangeError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Registration error: {0}")]
    Registration(#[from] RegistrationError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Shutdown error: {0}")]
    Shutdown(#[from] ShutdownError),
    #[error("Signal error: {0}")]
    Signal(#[from] SignalError),

    #[error("Missing collaborator: {0}")]
    MissingCollaborator(&'static str),
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Renders `err` and every source below it as `outer: inner: root`.
pub(crate) fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        // thiserror's `{0}` formatting often repeats the source already.
        if !rendered.ends_with(&text) {
            rendered.push_str(": ");
            rendered.push_str(&text);
        }
        source = cause.source();
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("connection refused")]
    struct Root;

    #[derive(Debug, Error)]
    #[error("plugin unreachable")]
    struct Outer(#[source] Root);

    #[test]
    fn test_error_chain_joins_sources() {
        assert_eq!(
            error_chain(&Outer(Root)),
            "plugin unreachable: connection refused"
        );
    }

    #[test]
    fn test_error_chain_skips_repeated_text() {
        let err = BrokerError::from(ConfigError::Invalid {
            field: "signal_buffer_size",
            message: "must be positive".to_string(),
        });
        let rendered = error_chain(&err);
        assert_eq!(rendered.matches("must be positive").count(), 1);
    }
}
