use std::{sync::Mutex, time::Duration};

use futures::future::{join_all, BoxFuture};
use tracing::{debug, trace, warn};

use super::{
    shared::{lock, ReactorCore},
    event::{EventArgs, EventType, Handler, Value},
    handoff::{run_guarded, Callback, Errback, MainAction, ThreadAction, ThreadHandoff},
    timer::{CallId, TimedAction},
    Scheduler,
};

/// Virtual-time reactor for deterministic tests.
///
/// The clock starts at zero and only moves through [`FakeReactor::advance`].
/// Thread hand-offs run inline on the caller's thread. Spawned futures wait
/// in a queue until [`FakeReactor::settle`] drives them.
pub struct FakeReactor {
    core: ReactorCore,
    now: Mutex<Duration>,
    spawned: Mutex<Vec<BoxFuture<'static, ()>>>,
}

impl Default for FakeReactor {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeReactor {
    pub fn new() -> Self {
        Self {
            core: ReactorCore::new(),
            now: Mutex::new(Duration::ZERO),
            spawned: Mutex::new(Vec::new()),
        }
    }

    /// Moves the clock forward by `seconds`, firing every call that becomes due.
    ///
    /// Negative or non-finite values are ignored.
    pub fn advance(&self, seconds: f64) {
        match Duration::try_from_secs_f64(seconds) {
            Ok(step) => self.advance_by(step),
            Err(e) => warn!(seconds, error = %e, "ignoring invalid advance"),
        }
    }

    /// Moves the clock forward by `step`.
    ///
    /// Calls fire one at a time in deadline order with the clock set to their
    /// deadline, so repeating calls catch up on every missed interval.
    pub fn advance_by(&self, step: Duration) {
        let target = self.elapsed().saturating_add(step);
        trace!(?target, "advancing fake clock");
        while let Some((id, due)) = self.core.next_due_call(target) {
            {
                let mut now = lock(&self.now);
                *now = (*now).max(due);
            }
            self.core.fire_call(id, Duration::ZERO);
        }
        *lock(&self.now) = target;
    }

    /// Drives every spawned future to completion, including futures spawned
    /// while settling.
    pub async fn settle(&self) {
        loop {
            let batch = std::mem::take(&mut *lock(&self.spawned));
            if batch.is_empty() {
                break;
            }
            debug!(tasks = batch.len(), "settling spawned tasks");
            join_all(batch).await;
        }
    }

    pub fn spawned_tasks(&self) -> usize {
        lock(&self.spawned).len()
    }

    pub fn pending_calls(&self) -> usize {
        self.core.pending_calls()
    }

    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    fn elapsed(&self) -> Duration {
        *lock(&self.now)
    }
}

impl Scheduler for FakeReactor {
    fn time(&self) -> f64 {
        self.elapsed().as_secs_f64()
    }

    fn call_later(&self, delay: Duration, action: TimedAction) -> CallId {
        self.core
            .schedule(self.elapsed().saturating_add(delay), None, action)
    }

    fn call_every(&self, interval: Duration, action: TimedAction) -> CallId {
        self.core
            .schedule(self.elapsed().saturating_add(interval), Some(interval), action)
    }

    fn cancel_call(&self, id: CallId) {
        self.core.cancel(id);
    }

    fn call_on(&self, event_type: EventType, handler: Handler, priority: i32) -> CallId {
        self.core.subscribe(event_type, handler, priority)
    }

    fn fire(&self, event_type: &EventType, args: EventArgs) -> Vec<Value> {
        self.core.fire(event_type, &args)
    }

    fn call_in_thread(
        &self,
        callback: Option<Callback>,
        errback: Option<Errback>,
        action: ThreadAction,
    ) {
        ThreadHandoff::execute(action, callback, errback).complete();
    }

    fn call_in_main(&self, action: MainAction) {
        run_guarded("hand-off", action);
    }

    fn spawn(&self, task: BoxFuture<'static, ()>) {
        lock(&self.spawned).push(task);
    }

    /// Advances from deadline to deadline until stopped.
    ///
    /// Returns once no timed calls remain, since nothing else could move the
    /// virtual clock.
    fn run(&self) {
        self.core.set_running(true);
        self.core.fire(&EventType::Run, &EventArgs::new());
        while self.core.is_running() {
            match self.core.next_due() {
                Some(due) => self.advance_by(due.saturating_sub(self.elapsed())),
                None => {
                    debug!("no timed calls left, stopping fake reactor");
                    self.stop();
                }
            }
        }
    }

    fn stop(&self) {
        if !self.core.set_running(false) {
            debug!("stop requested while the fake reactor is not running");
            return;
        }
        self.core.fire(&EventType::Stop, &EventArgs::new());
    }
}
