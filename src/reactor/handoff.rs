//! Moving work off the loop thread and results back onto it.

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    thread,
};

use thiserror::Error;
use tracing::{debug, error};

use super::event::Value;
use crate::error::error_chain;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Blocking work run by `call_in_thread`.
pub type ThreadAction = Box<dyn FnOnce() -> Result<Value, BoxError> + Send + 'static>;
/// Receives a worker's result on the loop thread.
pub type Callback = Box<dyn FnOnce(Value) + Send + 'static>;
/// Receives a worker's failure on the loop thread.
pub type Errback = Box<dyn FnOnce(ThreadError) + Send + 'static>;
/// Work queued onto the loop thread with `call_in_main`.
pub type MainAction = Box<dyn FnOnce() + Send + 'static>;

/// Why a `call_in_thread` action did not produce a value.
#[derive(Debug, Error)]
pub enum ThreadError {
    #[error("action on thread {thread} failed: {source}")]
    Failed {
        thread: String,
        #[source]
        source: BoxError,
    },
    #[error("action on thread {thread} panicked: {message}")]
    Panicked { thread: String, message: String },
}

impl ThreadError {
    /// Label of the thread the action ran on.
    pub fn thread(&self) -> &str {
        match self {
            ThreadError::Failed { thread, .. } | ThreadError::Panicked { thread, .. } => thread,
        }
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, ThreadError::Panicked { .. })
    }
}

/// Transient record of one dispatched action, consumed exactly once on the
/// loop thread by [`ThreadHandoff::complete`].
pub(crate) struct ThreadHandoff {
    result: Result<Value, ThreadError>,
    callback: Option<Callback>,
    errback: Option<Errback>,
}

impl ThreadHandoff {
    /// Runs `action` on the current thread and captures its outcome.
    pub fn execute(
        action: ThreadAction,
        callback: Option<Callback>,
        errback: Option<Errback>,
    ) -> Self {
        let thread = thread_label();
        let result = match panic::catch_unwind(AssertUnwindSafe(action)) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(ThreadError::Failed { thread, source }),
            Err(payload) => Err(ThreadError::Panicked {
                thread,
                message: panic_message(payload.as_ref()),
            }),
        };
        Self {
            result,
            callback,
            errback,
        }
    }

    /// Delivers the outcome. Must be called on the loop thread.
    pub fn complete(self) {
        match self.result {
            Ok(value) => match self.callback {
                Some(callback) => callback(value),
                None => debug!("thread action finished without a callback"),
            },
            Err(failure) => match self.errback {
                Some(errback) => errback(failure),
                None => error!(
                    thread = failure.thread(),
                    error = %error_chain(&failure),
                    "unhandled failure in thread action"
                ),
            },
        }
    }
}

/// Runs a loop-thread action, logging a panic instead of unwinding through the loop.
pub(crate) fn run_guarded(what: &str, action: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(action)) {
        error!(
            what,
            panic = %panic_message(payload.as_ref()),
            "panic caught on the reactor thread"
        );
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn thread_label() -> String {
    let current = thread::current();
    match current.name() {
        Some(name) => format!("{} ({:?})", name, current.id()),
        None => format!("{:?}", current.id()),
    }
}
