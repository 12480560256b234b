//! Event keys, payloads and the subscription table behind `call_on` / `fire`.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use thiserror::Error;

use super::timer::CallId;
use crate::message::Message;

/// Priority given to a subscription when the caller has no preference.
pub const DEFAULT_PRIORITY: i32 = 0;

/// Key an event is fired and subscribed under.
///
/// The broker's own lifecycle and exchange events are named variants;
/// anything else goes through `Custom`, or `Namespaced` for composite keys
/// such as `("message", "foobar")`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventType {
    Run,
    Stop,
    Message,
    PreExit,
    PostExit,
    ResynchronizeClients,
    ImpendingExchange,
    ExchangeFailed,
    RegistrationDone,
    RegistrationFailed,
    MessageTypeAcceptanceChanged,
    Custom(String),
    Namespaced { namespace: String, name: String },
}

impl EventType {
    /// Key for `name`. A name that belongs to one of the named variants
    /// resolves to that variant, so `custom("message")` is [`EventType::Message`].
    pub fn custom(name: impl Into<String>) -> Self {
        let name = name.into();
        match name.as_str() {
            "run" => Self::Run,
            "stop" => Self::Stop,
            "message" => Self::Message,
            "pre-exit" => Self::PreExit,
            "post-exit" => Self::PostExit,
            "resynchronize-clients" => Self::ResynchronizeClients,
            "impending-exchange" => Self::ImpendingExchange,
            "exchange-failed" => Self::ExchangeFailed,
            "registration-done" => Self::RegistrationDone,
            "registration-failed" => Self::RegistrationFailed,
            "message-type-acceptance-changed" => Self::MessageTypeAcceptanceChanged,
            _ => Self::Custom(name),
        }
    }

    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Namespaced {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Run => f.write_str("run"),
            EventType::Stop => f.write_str("stop"),
            EventType::Message => f.write_str("message"),
            EventType::PreExit => f.write_str("pre-exit"),
            EventType::PostExit => f.write_str("post-exit"),
            EventType::ResynchronizeClients => f.write_str("resynchronize-clients"),
            EventType::ImpendingExchange => f.write_str("impending-exchange"),
            EventType::ExchangeFailed => f.write_str("exchange-failed"),
            EventType::RegistrationDone => f.write_str("registration-done"),
            EventType::RegistrationFailed => f.write_str("registration-failed"),
            EventType::MessageTypeAcceptanceChanged => {
                f.write_str("message-type-acceptance-changed")
            }
            EventType::Custom(name) => f.write_str(name),
            EventType::Namespaced { namespace, name } => write!(f, "{}:{}", namespace, name),
        }
    }
}

/// Payload value passed to handlers and returned from them.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Duration(Duration),
    List(Vec<Value>),
    Map(HashMap<String, Value>),
    Message(Message),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_message(&self) -> Option<&Message> {
        match self {
            Value::Message(message) => Some(message),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(value.into())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<Duration> for Value {
    fn from(value: Duration) -> Self {
        Value::Duration(value)
    }
}

impl From<Message> for Value {
    fn from(value: Message) -> Self {
        Value::Message(value)
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Null
    }
}

/// Arguments handed to every handler of one `fire`: positional values plus
/// an optional keyword set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventArgs {
    pub positional: Vec<Value>,
    pub keywords: HashMap<String, Value>,
}

impl EventArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    pub fn keyword(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.keywords.insert(name.to_string(), value.into());
        self
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.positional.get(index)
    }

    pub fn get_keyword(&self, name: &str) -> Option<&Value> {
        self.keywords.get(name)
    }

    /// Positional argument `index`, or `HandlerError::MissingArgument`.
    pub fn require(&self, index: usize) -> HandlerResult<&Value> {
        self.get(index).ok_or(HandlerError::MissingArgument(index))
    }
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("missing positional argument {0}")]
    MissingArgument(usize),
    #[error("argument {index} has the wrong type, expected {expected}")]
    ArgumentType { index: usize, expected: &'static str },
    #[error("handler failed: {0}")]
    Failed(String),
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

pub type HandlerResult<T = Value> = Result<T, HandlerError>;

/// Event handler. Its return value is collected into `fire`'s result list;
/// an `Err` is logged and left out.
pub type Handler = Arc<dyn Fn(&EventArgs) -> HandlerResult + Send + Sync + 'static>;

/// Wraps a closure as a [`Handler`].
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&EventArgs) -> HandlerResult + Send + Sync + 'static,
{
    Arc::new(f)
}

struct Subscription {
    id: CallId,
    handler: Handler,
    priority: i32,
    sequence: u64,
}

/// Subscriptions per event type, each list kept sorted by `(priority, sequence)`.
#[derive(Default)]
pub(crate) struct EventTable {
    subscriptions: HashMap<EventType, Vec<Subscription>>,
    index: HashMap<CallId, EventType>,
    sequence: u64,
}

impl EventTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: CallId, event_type: EventType, handler: Handler, priority: i32) {
        self.sequence += 1;
        let subscription = Subscription {
            id,
            handler,
            priority,
            sequence: self.sequence,
        };
        let entries = self.subscriptions.entry(event_type.clone()).or_default();
        // Later registrations sort after earlier ones with the same priority.
        let position = entries.partition_point(|existing| existing.priority <= priority);
        entries.insert(position, subscription);
        self.index.insert(id, event_type);
    }

    /// Returns `true` if a live subscription was removed.
    pub fn remove(&mut self, id: CallId) -> bool {
        let Some(event_type) = self.index.remove(&id) else {
            return false;
        };
        if let Some(entries) = self.subscriptions.get_mut(&event_type) {
            entries.retain(|subscription| subscription.id != id);
            if entries.is_empty() {
                self.subscriptions.remove(&event_type);
            }
        }
        true
    }

    pub fn contains(&self, id: CallId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Handlers for `event_type` in dispatch order.
    pub fn snapshot(&self, event_type: &EventType) -> Vec<(CallId, i32, Handler)> {
        self.subscriptions
            .get(event_type)
            .map(|entries| {
                entries
                    .iter()
                    .map(|s| (s.id, s.priority, s.handler.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    #[cfg(test)]
    fn sequences(&self, event_type: &EventType) -> Vec<u64> {
        self.subscriptions
            .get(event_type)
            .map(|entries| entries.iter().map(|s| s.sequence).collect())
            .unwrap_or_default()
    }
}
