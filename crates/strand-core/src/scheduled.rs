//! Deadline-ordered scheduled tasks.
//!
//! Entries live in a binary min-heap keyed by `(deadline, id)`. Ids come from
//! a per-executor monotonic counter, so the ordering is total: an id tie is
//! impossible. Cancellation marks the shared state; dead entries are skipped
//! at pop time rather than extracted from the middle of the heap.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One-shot unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Re-runnable unit of work for periodic schedules.
pub type RepeatingTask = Box<dyn FnMut() + Send + 'static>;

/// Re-arm policy after a scheduled task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    /// Run once and retire.
    Once,
    /// Next deadline = previous deadline + period.
    FixedRate(Duration),
    /// Next deadline = completion time + delay.
    FixedDelay(Duration),
}

/// Shared cancellation state between the heap entry and its handle.
#[derive(Debug)]
pub(crate) struct ScheduledState {
    cancelled: AtomicBool,
}

impl ScheduledState {
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Cancels a scheduled task. Cancellation is best-effort: a task already
/// dequeued for execution runs to completion.
#[derive(Debug, Clone)]
pub struct ScheduledHandle {
    state: Arc<ScheduledState>,
}

impl ScheduledHandle {
    /// Marks the task dead. It will be skipped when its deadline pops.
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
    }

    /// Returns `true` once [`cancel`](Self::cancel) was called.
    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }
}

pub(crate) enum TaskKind {
    Once(Option<Task>),
    Repeating(RepeatingTask),
}

/// Heap entry: a deadline, a tie-breaking id and the work itself.
pub(crate) struct ScheduledEntry {
    pub(crate) id: u64,
    pub(crate) deadline: Duration,
    pub(crate) period: Period,
    pub(crate) kind: TaskKind,
    pub(crate) state: Arc<ScheduledState>,
}

impl ScheduledEntry {
    pub(crate) fn new(id: u64, deadline: Duration, period: Period, kind: TaskKind) -> Self {
        Self {
            id,
            deadline,
            period,
            kind,
            state: Arc::new(ScheduledState {
                cancelled: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn handle(&self) -> ScheduledHandle {
        ScheduledHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl PartialEq for ScheduledEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for ScheduledEntry {}

impl PartialOrd for ScheduledEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEntry {
    /// Reversed so `BinaryHeap` (a max-heap) pops the earliest
    /// `(deadline, id)` first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// The scheduled-task queue: min-heap plus the id counter.
pub(crate) struct ScheduledQueue {
    pub(crate) heap: BinaryHeap<ScheduledEntry>,
    next_id: u64,
}

impl ScheduledQueue {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_id: 0,
        }
    }

    pub(crate) fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Pops every live entry whose deadline is at or before `now`.
    /// Cancelled entries encountered on the way are dropped.
    pub(crate) fn pop_expired(&mut self, now: Duration) -> Vec<ScheduledEntry> {
        let mut expired = Vec::new();
        while let Some(head) = self.heap.peek() {
            if head.state.is_cancelled() {
                self.heap.pop();
                continue;
            }
            if head.deadline > now {
                break;
            }
            expired.push(self.heap.pop().expect("peeked entry"));
        }
        expired
    }

    /// Deadline of the earliest live entry, if any.
    pub(crate) fn next_deadline(&mut self) -> Option<Duration> {
        while let Some(head) = self.heap.peek() {
            if head.state.is_cancelled() {
                self.heap.pop();
                continue;
            }
            return Some(head.deadline);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u64, deadline_ms: u64) -> ScheduledEntry {
        ScheduledEntry::new(
            id,
            Duration::from_millis(deadline_ms),
            Period::Once,
            TaskKind::Once(Some(Box::new(|| {}))),
        )
    }

    #[test]
    fn pops_in_deadline_then_id_order() {
        let mut queue = ScheduledQueue::new();
        queue.heap.push(entry(2, 50));
        queue.heap.push(entry(0, 100));
        queue.heap.push(entry(1, 50));

        let expired = queue.pop_expired(Duration::from_millis(100));
        let order: Vec<u64> = expired.iter().map(|e| e.id).collect();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn cancelled_entries_are_skipped() {
        let mut queue = ScheduledQueue::new();
        let doomed = entry(0, 10);
        doomed.handle().cancel();
        queue.heap.push(doomed);
        queue.heap.push(entry(1, 20));

        assert_eq!(queue.next_deadline(), Some(Duration::from_millis(20)));
        let expired = queue.pop_expired(Duration::from_millis(30));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, 1);
    }
}
