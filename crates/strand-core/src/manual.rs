use crate::scheduled::{ScheduledEntry, ScheduledQueue, TaskKind};
use crate::{Executor, ExecutorError, Period, RepeatingTask, ScheduledHandle, Task};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

struct ManualInner {
    queue: Mutex<VecDeque<Task>>,
    scheduled: Mutex<ScheduledQueue>,
    /// Virtual clock; only [`ManualExecutor::advance_time`] moves it.
    time: Mutex<Duration>,
    /// Re-entrancy guard: a task submitting a task must not recurse into the
    /// drain loop, or submission order would invert.
    draining: AtomicBool,
}

impl ManualInner {
    fn queue_lock(&self) -> MutexGuard<'_, VecDeque<Task>> {
        self.queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn scheduled_lock(&self) -> MutexGuard<'_, ScheduledQueue> {
        self.scheduled
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn now(&self) -> Duration {
        *self
            .time
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Executor without a worker thread: tasks run inline on the calling thread
/// and scheduled tasks fire when the virtual clock is advanced.
///
/// This is the deterministic test vehicle behind the embedded channel. The
/// calling thread *is* the event loop, so [`Executor::in_event_loop`] is
/// always `true` and time only moves through
/// [`advance_time`](Self::advance_time).
pub struct ManualExecutor {
    inner: Arc<ManualInner>,
}

impl ManualExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(ManualInner {
                queue: Mutex::new(VecDeque::new()),
                scheduled: Mutex::new(ScheduledQueue::new()),
                time: Mutex::new(Duration::ZERO),
                draining: AtomicBool::new(false),
            }),
        })
    }

    /// Moves the virtual clock forward and runs everything that became due,
    /// including repeated firings of periodic tasks that fell behind.
    pub fn advance_time(&self, delta: Duration) {
        {
            let mut time = self
                .inner
                .time
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *time += delta;
        }
        self.drain();
    }

    /// Runs every task currently queued (but does not move the clock).
    pub fn run_pending_tasks(&self) {
        self.drain();
    }

    /// Number of tasks waiting in the FIFO queue.
    pub fn pending_tasks(&self) -> usize {
        self.inner.queue_lock().len()
    }

    /// Deadline of the next scheduled task on the virtual clock.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.inner.scheduled_lock().next_deadline()
    }

    fn drain(&self) {
        if self.inner.draining.swap(true, Ordering::AcqRel) {
            return;
        }
        loop {
            self.promote_expired();
            let task = self.inner.queue_lock().pop_front();
            match task {
                Some(task) => task(),
                None => break,
            }
        }
        self.inner.draining.store(false, Ordering::Release);
    }

    fn promote_expired(&self) {
        let now = self.inner.now();
        let expired = self.inner.scheduled_lock().pop_expired(now);
        if expired.is_empty() {
            return;
        }
        let mut queue = self.inner.queue_lock();
        for mut entry in expired {
            match entry.kind {
                TaskKind::Once(ref mut task) => {
                    if let Some(task) = task.take() {
                        queue.push_back(task);
                    }
                }
                TaskKind::Repeating(_) => {
                    let rearm_inner = Arc::clone(&self.inner);
                    queue.push_back(Box::new(move || {
                        let mut entry = entry;
                        if entry.state.is_cancelled() {
                            return;
                        }
                        if let TaskKind::Repeating(task) = &mut entry.kind {
                            task();
                        }
                        entry.deadline = match entry.period {
                            Period::FixedRate(period) => entry.deadline + period,
                            Period::FixedDelay(delay) => rearm_inner.now() + delay,
                            Period::Once => return,
                        };
                        rearm_inner.scheduled_lock().heap.push(entry);
                    }));
                }
            }
        }
    }

    fn schedule_entry(
        &self,
        initial: Duration,
        period: Period,
        kind: TaskKind,
    ) -> Result<ScheduledHandle, ExecutorError> {
        let deadline = self.inner.now() + initial;
        let mut scheduled = self.inner.scheduled_lock();
        let id = scheduled.next_id();
        let entry = ScheduledEntry::new(id, deadline, period, kind);
        let handle = entry.handle();
        scheduled.heap.push(entry);
        Ok(handle)
    }
}

impl Executor for ManualExecutor {
    fn execute(&self, task: Task) -> Result<(), ExecutorError> {
        self.inner.queue_lock().push_back(task);
        self.drain();
        Ok(())
    }

    fn schedule(&self, delay: Duration, task: Task) -> Result<ScheduledHandle, ExecutorError> {
        self.schedule_entry(delay, Period::Once, TaskKind::Once(Some(task)))
    }

    fn schedule_at_fixed_rate(
        &self,
        initial: Duration,
        period: Duration,
        task: RepeatingTask,
    ) -> Result<ScheduledHandle, ExecutorError> {
        assert!(period > Duration::ZERO, "fixed-rate period must be non-zero");
        self.schedule_entry(initial, Period::FixedRate(period), TaskKind::Repeating(task))
    }

    fn schedule_with_fixed_delay(
        &self,
        initial: Duration,
        delay: Duration,
        task: RepeatingTask,
    ) -> Result<ScheduledHandle, ExecutorError> {
        assert!(delay > Duration::ZERO, "fixed delay must be non-zero");
        self.schedule_entry(initial, Period::FixedDelay(delay), TaskKind::Repeating(task))
    }

    fn in_event_loop(&self) -> bool {
        true
    }

    fn now(&self) -> Duration {
        self.inner.now()
    }

    fn is_shutting_down(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn execute_runs_inline_in_submission_order() {
        let exec = ManualExecutor::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let log_outer = Arc::clone(&log);
        let exec_inner = Arc::clone(&exec);
        exec.execute(Box::new(move || {
            log_outer.lock().unwrap().push(1);
            let log_nested = Arc::clone(&log_outer);
            exec_inner
                .execute(Box::new(move || log_nested.lock().unwrap().push(3)))
                .unwrap();
            log_outer.lock().unwrap().push(2);
        }))
        .unwrap();

        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn scheduled_tasks_fire_on_virtual_time() {
        let exec = ManualExecutor::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired2 = Arc::clone(&fired);
        exec.schedule(
            Duration::from_millis(100),
            Box::new(move || {
                fired2.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        exec.advance_time(Duration::from_millis(99));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        exec.advance_time(Duration::from_millis(1));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fixed_rate_catches_up_missed_periods() {
        let exec = ManualExecutor::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired2 = Arc::clone(&fired);
        exec.schedule_at_fixed_rate(
            Duration::from_millis(10),
            Duration::from_millis(10),
            Box::new(move || {
                fired2.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        exec.advance_time(Duration::from_millis(35));
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn cancelled_schedules_never_fire() {
        let exec = ManualExecutor::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired2 = Arc::clone(&fired);
        let handle = exec
            .schedule(
                Duration::from_millis(10),
                Box::new(move || {
                    fired2.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        handle.cancel();

        exec.advance_time(Duration::from_millis(20));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
