use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use chrono::Utc;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::{
    runtime::{Builder, Runtime},
    sync::{mpsc, Notify},
};
use tracing::{debug, info, warn};

use super::{
    shared::{lock, ReactorCore},
    event::{EventArgs, EventType, Handler, Value},
    handoff::{run_guarded, Callback, Errback, MainAction, ThreadAction, ThreadHandoff},
    timer::{CallId, TimedAction},
    Scheduler,
};

#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("failed to build the reactor runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

pub type ReactorResult<T> = Result<T, ReactorError>;

/// Wall-clock reactor.
///
/// `run` blocks the calling thread, which becomes the loop thread. The loop
/// sleeps until the next deadline, a hand-off from a worker thread, or
/// `stop`. Futures passed to `spawn` are driven by the same thread while the
/// loop is waiting, and `call_in_thread` work runs on the runtime's blocking
/// pool.
///
/// `run` must not be called from inside another tokio runtime.
pub struct Reactor {
    core: ReactorCore,
    origin: Instant,
    runtime: Runtime,
    handoff_tx: mpsc::UnboundedSender<MainAction>,
    handoff_rx: Mutex<Option<mpsc::UnboundedReceiver<MainAction>>>,
    wakeup: Notify,
}

impl Reactor {
    pub fn new() -> ReactorResult<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .thread_name("reactor-worker")
            .build()?;
        let (handoff_tx, handoff_rx) = mpsc::unbounded_channel();
        Ok(Self {
            core: ReactorCore::new(),
            origin: Instant::now(),
            runtime,
            handoff_tx,
            handoff_rx: Mutex::new(Some(handoff_rx)),
            wakeup: Notify::new(),
        })
    }

    /// Number of live timed calls.
    pub fn pending_calls(&self) -> usize {
        self.core.pending_calls()
    }

    fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }

    fn enqueue(&self, action: MainAction) {
        if self.handoff_tx.send(action).is_err() {
            warn!("reactor hand-off queue is closed, dropping action");
        }
    }

    async fn run_loop(&self, handoffs: &mut mpsc::UnboundedReceiver<MainAction>) {
        while self.core.is_running() {
            while let Ok(action) = handoffs.try_recv() {
                run_guarded("hand-off", action);
            }
            if !self.core.is_running() {
                break;
            }

            let now = self.elapsed();
            // The whole batch fires even if one of them stops the reactor.
            for id in self.core.due_calls(now) {
                self.core.fire_call(id, now);
            }
            if !self.core.is_running() {
                break;
            }

            // Let spawned tasks make progress even when timers are always due.
            tokio::task::yield_now().await;

            // A deadline past what `Instant` can represent never comes.
            let deadline = self
                .core
                .next_due()
                .and_then(|due| self.origin.checked_add(due));
            let sleep = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at.into()).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = sleep => {}
                received = handoffs.recv() => {
                    if let Some(action) = received {
                        run_guarded("hand-off", action);
                    }
                }
                _ = self.wakeup.notified() => {}
            }
        }
    }
}

impl Scheduler for Reactor {
    fn time(&self) -> f64 {
        Utc::now().timestamp_micros() as f64 / 1_000_000.0
    }

    fn call_later(&self, delay: Duration, action: TimedAction) -> CallId {
        let id = self
            .core
            .schedule(self.elapsed().saturating_add(delay), None, action);
        self.wakeup.notify_one();
        id
    }

    fn call_every(&self, interval: Duration, action: TimedAction) -> CallId {
        let id = self
            .core
            .schedule(self.elapsed().saturating_add(interval), Some(interval), action);
        self.wakeup.notify_one();
        id
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
        let handoff_tx = self.handoff_tx.clone();
        self.runtime.spawn_blocking(move || {
            let handoff = ThreadHandoff::execute(action, callback, errback);
            if handoff_tx.send(Box::new(move || handoff.complete())).is_err() {
                warn!("reactor is gone, dropping thread result");
            }
        });
    }

    fn call_in_main(&self, action: MainAction) {
        self.enqueue(action);
    }

    fn spawn(&self, task: BoxFuture<'static, ()>) {
        self.runtime.spawn(task);
    }

    fn run(&self) {
        let Some(mut handoffs) = lock(&self.handoff_rx).take() else {
            warn!("reactor is already running");
            return;
        };
        self.core.set_running(true);
        info!("reactor starting");
        self.core.fire(&EventType::Run, &EventArgs::new());

        self.runtime.block_on(self.run_loop(&mut handoffs));

        *lock(&self.handoff_rx) = Some(handoffs);
        info!("reactor stopped");
    }

    fn stop(&self) {
        if !self.core.set_running(false) {
            debug!("stop requested while the reactor is not running");
            return;
        }
        self.core.fire(&EventType::Stop, &EventArgs::new());
        self.wakeup.notify_one();
    }
}
