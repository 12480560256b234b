use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashMap},
    fmt,
    time::Duration,
};

/// Identifier returned by every scheduling call.
///
/// Timed calls and event subscriptions share one id space, so a single
/// `cancel_call` can deactivate either of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(u64);

impl CallId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

/// Work scheduled with `call_later` / `call_every`.
pub type TimedAction = Box<dyn FnMut() + Send + 'static>;

/// A live timed call. Removing it from the table is what deactivates it.
pub(crate) struct TimedCall {
    due: Duration,
    interval: Option<Duration>,
    action: Option<TimedAction>,
    sequence: u64,
}

/// Heap entry pointing at a timed call.
///
/// An entry is stale when the call was cancelled or rescheduled after the
/// entry was pushed; stale entries are skipped when popped.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ScheduledCall {
    due: Duration,
    sequence: u64,
    id: CallId,
}

impl PartialOrd for ScheduledCall {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledCall {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max heap; earliest due (then earliest sequence) must pop first.
        match other.due.cmp(&self.due) {
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            ordering => ordering,
        }
    }
}

/// Deadline-ordered table of timed calls, measured from the owning reactor's origin.
#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<ScheduledCall>,
    calls: HashMap<CallId, TimedCall>,
    sequence: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(
        &mut self,
        id: CallId,
        due: Duration,
        interval: Option<Duration>,
        action: TimedAction,
    ) {
        let sequence = self.next_sequence();
        self.calls.insert(
            id,
            TimedCall {
                due,
                interval,
                action: Some(action),
                sequence,
            },
        );
        self.heap.push(ScheduledCall { due, sequence, id });
    }

    /// Returns `true` if a live call was removed.
    pub fn cancel(&mut self, id: CallId) -> bool {
        self.calls.remove(&id).is_some()
    }

    pub fn contains(&self, id: CallId) -> bool {
        self.calls.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Deadline of the earliest live call.
    pub fn next_due(&mut self) -> Option<Duration> {
        self.discard_stale();
        self.heap.peek().map(|entry| entry.due)
    }

    /// Pops every live call due at or before `now`, in firing order.
    ///
    /// Calls rescheduled while these fire are not part of the batch.
    pub fn pop_due(&mut self, now: Duration) -> Vec<CallId> {
        let mut due = Vec::new();
        while let Some(id) = self.pop_next_due(now).map(|(id, _)| id) {
            due.push(id);
        }
        due
    }

    /// Pops the earliest live call due at or before `limit`.
    pub fn pop_next_due(&mut self, limit: Duration) -> Option<(CallId, Duration)> {
        self.discard_stale();
        match self.heap.peek() {
            Some(entry) if entry.due <= limit => self.heap.pop().map(|entry| (entry.id, entry.due)),
            _ => None,
        }
    }

    /// Takes the action out of a call so it can run without the queue borrowed.
    ///
    /// One-shot calls leave the table here, so they can never fire twice and
    /// cancelling them from inside their own action is a no-op.
    pub fn take_action(&mut self, id: CallId) -> Option<TimedAction> {
        let call = self.calls.get_mut(&id)?;
        if call.interval.is_none() {
            return self.calls.remove(&id).and_then(|call| call.action);
        }
        call.action.take()
    }

    /// Puts a repeating call back on the heap after it fired.
    ///
    /// Nothing happens when the call was cancelled while it ran. The next
    /// deadline is never earlier than `not_before`; a call whose next deadline
    /// overflows is dropped.
    pub fn finish(&mut self, id: CallId, action: TimedAction, not_before: Duration) {
        let sequence = self.sequence + 1;
        let Some(call) = self.calls.get_mut(&id) else {
            return;
        };
        let Some(interval) = call.interval else {
            return;
        };
        let Some(next) = call.due.checked_add(interval) else {
            // Past the last representable deadline; it can never fire again.
            self.calls.remove(&id);
            return;
        };
        self.sequence = sequence;
        call.due = next.max(not_before);
        call.sequence = sequence;
        call.action = Some(action);
        self.heap.push(ScheduledCall {
            due: call.due,
            sequence,
            id,
        });
    }

    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    fn discard_stale(&mut self) {
        while let Some(entry) = self.heap.peek() {
            let live = self
                .calls
                .get(&entry.id)
                .is_some_and(|call| call.sequence == entry.sequence);
            if live {
                return;
            }
            self.heap.pop();
        }
    }
}
