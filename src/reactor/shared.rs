use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use tracing::{debug, error, trace, warn};

use super::{
    event::{EventArgs, EventTable, EventType, Handler, Value},
    handoff::panic_message,
    timer::{CallId, TimedAction, TimerQueue},
};
use crate::error::error_chain;

/// Shortest interval a repeating call may have; a zero interval would never
/// let the clock move past it.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// State and dispatch logic shared by [`super::Reactor`] and [`super::FakeReactor`].
///
/// Locks are never held while user code runs, so handlers and timed calls
/// may schedule, cancel and fire freely.
pub(crate) struct ReactorCore {
    next_id: AtomicU64,
    timers: Mutex<TimerQueue>,
    events: Mutex<EventTable>,
    running: AtomicBool,
}

impl ReactorCore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            timers: Mutex::new(TimerQueue::new()),
            events: Mutex::new(EventTable::new()),
            running: AtomicBool::new(false),
        }
    }

    fn next_id(&self) -> CallId {
        CallId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn schedule(
        &self,
        due: Duration,
        interval: Option<Duration>,
        action: TimedAction,
    ) -> CallId {
        let id = self.next_id();
        let interval = interval.map(|interval| {
            if interval < MIN_INTERVAL {
                warn!(?interval, "repeating call interval raised to the minimum");
            }
            interval.max(MIN_INTERVAL)
        });
        lock(&self.timers).schedule(id, due, interval, action);
        trace!(%id, ?due, ?interval, "scheduled call");
        id
    }

    pub fn cancel(&self, id: CallId) {
        let cancelled = lock(&self.timers).cancel(id) || lock(&self.events).remove(id);
        if cancelled {
            debug!(%id, "cancelled call");
        } else {
            trace!(%id, "cancel of an inactive call ignored");
        }
    }

    pub fn subscribe(&self, event_type: EventType, handler: Handler, priority: i32) -> CallId {
        let id = self.next_id();
        debug!(%id, event = %event_type, priority, "subscribed");
        lock(&self.events).insert(id, event_type, handler, priority);
        id
    }

    pub fn fire(&self, event_type: &EventType, args: &EventArgs) -> Vec<Value> {
        let handlers = lock(&self.events).snapshot(event_type);
        trace!(event = %event_type, handlers = handlers.len(), "firing event");

        let mut results = Vec::with_capacity(handlers.len());
        for (id, priority, handler) in handlers {
            // An earlier handler may have cancelled this one.
            if !lock(&self.events).contains(id) {
                continue;
            }
            match panic::catch_unwind(AssertUnwindSafe(|| handler(args))) {
                Ok(Ok(value)) => results.push(value),
                Ok(Err(e)) => error!(
                    event = %event_type,
                    subscription = %id,
                    priority,
                    args = ?args,
                    error = %error_chain(&e),
                    "event handler failed"
                ),
                Err(payload) => error!(
                    event = %event_type,
                    subscription = %id,
                    priority,
                    args = ?args,
                    panic = %panic_message(payload.as_ref()),
                    "event handler panicked"
                ),
            }
        }
        results
    }

    pub fn next_due(&self) -> Option<Duration> {
        lock(&self.timers).next_due()
    }

    pub fn due_calls(&self, now: Duration) -> Vec<CallId> {
        lock(&self.timers).pop_due(now)
    }

    pub fn next_due_call(&self, limit: Duration) -> Option<(CallId, Duration)> {
        lock(&self.timers).pop_next_due(limit)
    }

    /// Runs one popped timed call and reschedules it if it repeats.
    pub fn fire_call(&self, id: CallId, not_before: Duration) {
        let Some(mut action) = lock(&self.timers).take_action(id) else {
            return;
        };
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(&mut action)) {
            error!(
                call = %id,
                panic = %panic_message(payload.as_ref()),
                "timed call panicked"
            );
        }
        lock(&self.timers).finish(id, action, not_before);
    }

    pub fn pending_calls(&self) -> usize {
        lock(&self.timers).len()
    }

    pub fn subscription_count(&self) -> usize {
        lock(&self.events).len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns the previous value.
    pub fn set_running(&self, running: bool) -> bool {
        self.running.swap(running, Ordering::SeqCst)
    }
}

/// Locks `mutex`, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
