use thiserror::Error;
use tokio::sync::broadcast;
use tracing::trace;

/// Notifications the broker emits to its outside listeners.
#[derive(Debug, Clone, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum BrokerSignal {
    Resynchronize,
    ImpendingExchange,
    ExchangeFailed,
    RegistrationDone,
    RegistrationFailed,
    MessageTypeAcceptanceChanged { message_type: String, accepted: bool },
}

#[derive(Debug, Error, PartialEq)]
pub enum SignalError {
    #[error("missed {count} signals")]
    Lagged { count: u64 },
    #[error("signal bus closed")]
    Closed,
}

pub type SignalResult<T> = Result<T, SignalError>;

/// Fan-out of [`BrokerSignal`]s to any number of subscribers.
pub struct SignalBus {
    sender: broadcast::Sender<BrokerSignal>,
    // Keeps the channel open while nobody listens.
    _internal_receiver: broadcast::Receiver<BrokerSignal>,
}

impl SignalBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, internal_receiver) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            _internal_receiver: internal_receiver,
        }
    }

    pub fn subscribe(&self) -> SignalReceiver {
        SignalReceiver::new(self.sender.subscribe())
    }

    /// Emits `signal` and returns how many subscribers it reached.
    pub fn emit(&self, signal: BrokerSignal) -> usize {
        let name = signal.to_string();
        match self.sender.send(signal) {
            Ok(receivers) => {
                let subscribers = receivers.saturating_sub(1);
                trace!(signal = %name, subscribers, "broker signal emitted");
                subscribers
            }
            Err(e) => {
                trace!(signal = %name, error = %e, "broker signal dropped");
                0
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count().saturating_sub(1)
    }
}

pub struct SignalReceiver {
    receiver: broadcast::Receiver<BrokerSignal>,
}

impl SignalReceiver {
    fn new(receiver: broadcast::Receiver<BrokerSignal>) -> Self {
        Self { receiver }
    }

    /// Waits for the next signal.
    ///
    /// A receiver that fell behind is moved to the newest position and
    /// reports how many signals it missed.
    pub async fn recv(&mut self) -> SignalResult<BrokerSignal> {
        match self.receiver.recv().await {
            Ok(signal) => Ok(signal),
            Err(broadcast::error::RecvError::Lagged(count)) => {
                self.receiver = self.receiver.resubscribe();
                Err(SignalError::Lagged { count })
            }
            Err(broadcast::error::RecvError::Closed) => Err(SignalError::Closed),
        }
    }

    /// Returns the next signal if one is already queued.
    pub fn try_recv(&mut self) -> Option<BrokerSignal> {
        self.receiver.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = SignalBus::new(16);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        assert_eq!(bus.emit(BrokerSignal::Resynchronize), 2);

        assert_eq!(first.recv().await.unwrap(), BrokerSignal::Resynchronize);
        assert_eq!(second.recv().await.unwrap(), BrokerSignal::Resynchronize);
    }

    #[tokio::test]
    async fn test_emit_without_subscribers() {
        let bus = SignalBus::new(4);
        assert_eq!(bus.emit(BrokerSignal::ExchangeFailed), 0);
        let mut late = bus.subscribe();
        assert_eq!(late.try_recv(), None);
    }

    #[tokio::test]
    async fn test_lagged_receiver_recovers() {
        let bus = SignalBus::new(2);
        let mut receiver = bus.subscribe();
        for _ in 0..5 {
            bus.emit(BrokerSignal::ImpendingExchange);
        }

        assert!(matches!(
            receiver.recv().await,
            Err(SignalError::Lagged { .. })
        ));
        bus.emit(BrokerSignal::RegistrationDone);
        assert_eq!(receiver.recv().await.unwrap(), BrokerSignal::RegistrationDone);
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(BrokerSignal::Resynchronize.to_string(), "resynchronize");
        assert_eq!(
            BrokerSignal::MessageTypeAcceptanceChanged {
                message_type: "foobar".to_string(),
                accepted: true,
            }
            .to_string(),
            "message-type-acceptance-changed"
        );
    }
}
