//! # Reactor
//!
//! Single authority for timing and eventing in the broker process.
//!
//! ## Components
//!
//! - **Timed calls**: one-shot (`call_later`) and repeating (`call_every`)
//!   calls, ordered by deadline
//! - **Event bus**: prioritized synchronous publish/subscribe (`call_on` / `fire`)
//! - **Thread hand-off**: blocking work on worker threads whose results come
//!   back to the loop thread (`call_in_thread` / `call_in_main`)
//! - **Async completions**: futures driven on the loop thread (`spawn`)
//!
//! Two implementations share one contract: [`Reactor`] runs on the wall clock,
//! [`FakeReactor`] on a virtual clock advanced by tests.
//!
//! ## Ordering
//!
//! ```text
//! tick ─▶ drain hand-offs ─▶ fire due calls ─▶ poll spawned tasks ─▶ wait
//!                                                                    │
//!         next deadline │ hand-off arrives │ stop() ◀───────────────┘
//! ```
//!
//! Handlers, timed calls and hand-offs run to completion before the next item
//! is considered. Handlers of one event run in ascending priority order,
//! registration order breaking ties.

mod shared;
pub mod event;
pub mod fake;
pub mod handoff;
pub mod real;
pub mod timer;

use std::time::Duration;

use futures::future::BoxFuture;

pub use event::{
    handler, EventArgs, EventType, Handler, HandlerError, HandlerResult, Value, DEFAULT_PRIORITY,
};
pub use fake::FakeReactor;
pub use handoff::{BoxError, Callback, Errback, MainAction, ThreadAction, ThreadError};
pub use real::{Reactor, ReactorError, ReactorResult};
pub(crate) use shared::lock;
pub use timer::{CallId, TimedAction};

/// The scheduling contract every broker component is written against.
///
/// Components receive an `Arc<dyn Scheduler>` at construction; there is no
/// process-wide instance.
pub trait Scheduler: Send + Sync {
    /// Current time in seconds.
    fn time(&self) -> f64;

    /// Runs `action` once, at or after `now + delay`.
    fn call_later(&self, delay: Duration, action: TimedAction) -> CallId;

    /// Runs `action` every `interval`, first after one interval, until cancelled.
    fn call_every(&self, interval: Duration, action: TimedAction) -> CallId;

    /// Deactivates a timed call or subscription. Unknown and already
    /// cancelled ids are ignored.
    fn cancel_call(&self, id: CallId);

    fn call_on(&self, event_type: EventType, handler: Handler, priority: i32) -> CallId;

    /// Runs the handlers of `event_type` and returns their results in
    /// invocation order. Failing handlers are logged and skipped.
    fn fire(&self, event_type: &EventType, args: EventArgs) -> Vec<Value>;

    /// Runs `action` on a worker thread; `callback` or `errback` receive the
    /// outcome on the loop thread. Without an errback failures are logged.
    fn call_in_thread(
        &self,
        callback: Option<Callback>,
        errback: Option<Errback>,
        action: ThreadAction,
    );

    /// Runs `action` on the loop thread when it next processes hand-offs.
    fn call_in_main(&self, action: MainAction);

    /// Drives `task` to completion on the loop thread.
    fn spawn(&self, task: BoxFuture<'static, ()>);

    /// Fires `Run`, then services the loop until `stop`.
    fn run(&self);

    /// Fires `Stop` and makes `run` return.
    fn stop(&self);
}
