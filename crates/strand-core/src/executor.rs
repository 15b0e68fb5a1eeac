use crate::scheduled::{ScheduledEntry, ScheduledQueue, TaskKind};
use crate::{ExecutorError, Period, Promise, RepeatingTask, ScheduledHandle, Task};
use crossbeam_utils::sync::{Parker, Unparker};
use crossbeam_utils::CachePadded;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// Tasks drained per loop iteration before the wake/deadline check runs
/// again. Bounds latency of scheduled tasks under a flooded FIFO queue.
const TASKS_PER_RUN: usize = 64;

/// Where work runs: a serialized execution context with a monotonic clock.
///
/// All events targeting a channel are funneled through its owning executor,
/// which replaces per-channel locks with single-owner discipline.
pub trait Executor: Send + Sync {
    /// Enqueues a task. Per-submitter FIFO order is preserved.
    fn execute(&self, task: Task) -> Result<(), ExecutorError>;

    /// Runs `task` once after `delay`.
    fn schedule(&self, delay: Duration, task: Task) -> Result<ScheduledHandle, ExecutorError>;

    /// Runs `task` repeatedly; the next deadline is the previous deadline
    /// plus `period`, independent of task runtime.
    fn schedule_at_fixed_rate(
        &self,
        initial: Duration,
        period: Duration,
        task: RepeatingTask,
    ) -> Result<ScheduledHandle, ExecutorError>;

    /// Runs `task` repeatedly; the next deadline is the completion time of
    /// the previous run plus `delay`.
    fn schedule_with_fixed_delay(
        &self,
        initial: Duration,
        delay: Duration,
        task: RepeatingTask,
    ) -> Result<ScheduledHandle, ExecutorError>;

    /// Returns `true` when the caller is the executor's own thread.
    fn in_event_loop(&self) -> bool;

    /// Monotonic time since the executor's epoch. Scheduled deadlines are
    /// expressed on this clock.
    fn now(&self) -> Duration;

    /// Returns `true` from the moment shutdown was initiated.
    fn is_shutting_down(&self) -> bool;
}

/// Lifecycle of an event executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
enum Lifecycle {
    Running = 0,
    /// Quiet period: still accepting, draining toward exit.
    ShuttingDown = 1,
    /// No longer accepting; the worker is finishing its queue.
    Shutdown = 2,
    Terminated = 3,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Lifecycle::Running,
            1 => Lifecycle::ShuttingDown,
            2 => Lifecycle::Shutdown,
            _ => Lifecycle::Terminated,
        }
    }
}

struct ExecInner {
    queue: Mutex<VecDeque<Task>>,
    scheduled: Mutex<ScheduledQueue>,
    state: CachePadded<AtomicU8>,
    unparker: Unparker,
    worker: OnceLock<ThreadId>,
    epoch: Instant,
    /// Nanoseconds-since-epoch of the last accepted task; resets the quiet
    /// period during graceful shutdown.
    last_accept: AtomicU64,
    /// (quiet period, hard deadline) captured at shutdown initiation.
    shutdown_window: Mutex<Option<(Duration, Duration)>>,
    termination: Promise<()>,
}

impl ExecInner {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.state.load(Ordering::Acquire))
    }

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
}

/// Single-threaded event executor.
///
/// One worker thread owns a FIFO task queue and a min-heap of scheduled
/// tasks keyed by `(deadline, id)`. The loop drains expired deadlines into
/// the FIFO queue, runs a bounded batch of tasks, then parks until the
/// earlier of the next deadline and a foreign wake.
pub struct EventExecutor {
    inner: Arc<ExecInner>,
}

impl EventExecutor {
    /// Spawns the worker thread and returns the handle.
    pub fn new(name: &str) -> Arc<Self> {
        let parker = Parker::new();
        let inner = Arc::new(ExecInner {
            queue: Mutex::new(VecDeque::new()),
            scheduled: Mutex::new(ScheduledQueue::new()),
            state: CachePadded::new(AtomicU8::new(Lifecycle::Running as u8)),
            unparker: parker.unparker().clone(),
            worker: OnceLock::new(),
            epoch: Instant::now(),
            last_accept: AtomicU64::new(0),
            shutdown_window: Mutex::new(None),
            termination: Promise::new(),
        });

        let worker_inner = Arc::clone(&inner);
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_loop(&worker_inner, &parker))
            .expect("spawn event executor worker");

        Arc::new(Self { inner })
    }

    /// Completed when the worker thread has exited.
    pub fn termination_promise(&self) -> Promise<()> {
        self.inner.termination.clone()
    }

    /// Returns `true` once the worker exited.
    pub fn is_terminated(&self) -> bool {
        self.inner.lifecycle() == Lifecycle::Terminated
    }

    /// Initiates graceful shutdown. The executor keeps accepting tasks for
    /// `quiet_period` past the last submission and exits no later than
    /// `timeout` after this call. Returns the termination promise.
    pub fn shutdown_gracefully(&self, quiet_period: Duration, timeout: Duration) -> Promise<()> {
        let now = self.inner.now();
        {
            let mut window = self
                .inner
                .shutdown_window
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if window.is_none() {
                *window = Some((quiet_period, now + timeout));
            }
        }
        let _ = self.inner.state.compare_exchange(
            Lifecycle::Running as u8,
            Lifecycle::ShuttingDown as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.inner.unparker.unpark();
        self.termination_promise()
    }

    /// Number of tasks waiting in the FIFO queue.
    pub fn pending_tasks(&self) -> usize {
        self.inner.queue_lock().len()
    }

    fn submit(&self, task: Task) -> Result<(), ExecutorError> {
        if self.inner.lifecycle() >= Lifecycle::Shutdown {
            return Err(ExecutorError::Terminated);
        }
        self.inner.queue_lock().push_back(task);
        self.inner
            .last_accept
            .store(self.inner.now().as_nanos() as u64, Ordering::Release);
        self.inner.unparker.unpark();
        Ok(())
    }

    fn schedule_entry(
        &self,
        initial: Duration,
        period: Period,
        kind: TaskKind,
    ) -> Result<ScheduledHandle, ExecutorError> {
        if self.inner.lifecycle() >= Lifecycle::Shutdown {
            return Err(ExecutorError::Terminated);
        }
        let deadline = self.inner.now() + initial;
        let handle = {
            let mut scheduled = self.inner.scheduled_lock();
            let id = scheduled.next_id();
            let entry = ScheduledEntry::new(id, deadline, period, kind);
            let handle = entry.handle();
            scheduled.heap.push(entry);
            handle
        };
        self.inner.unparker.unpark();
        Ok(handle)
    }
}

impl Executor for EventExecutor {
    fn execute(&self, task: Task) -> Result<(), ExecutorError> {
        self.submit(task)
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
        self.schedule_entry(initial, Period::FixedRate(period), TaskKind::Repeating(task))
    }

    fn schedule_with_fixed_delay(
        &self,
        initial: Duration,
        delay: Duration,
        task: RepeatingTask,
    ) -> Result<ScheduledHandle, ExecutorError> {
        self.schedule_entry(initial, Period::FixedDelay(delay), TaskKind::Repeating(task))
    }

    fn in_event_loop(&self) -> bool {
        self.inner.worker.get().copied() == Some(thread::current().id())
    }

    fn now(&self) -> Duration {
        self.inner.now()
    }

    fn is_shutting_down(&self) -> bool {
        self.inner.lifecycle() >= Lifecycle::ShuttingDown
    }
}

/// The worker loop: drain deadlines, run a batch, park until the next wake.
fn run_loop(inner: &Arc<ExecInner>, parker: &Parker) {
    let _ = inner.worker.set(thread::current().id());

    loop {
        let now = inner.now();
        promote_expired(inner, now);
        let ran = run_batch(inner, TASKS_PER_RUN);

        let queue_empty = inner.queue_lock().is_empty();
        if inner.lifecycle() >= Lifecycle::ShuttingDown && queue_empty {
            let window = *inner
                .shutdown_window
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some((quiet, hard_deadline)) = window {
                let now = inner.now();
                let last = Duration::from_nanos(inner.last_accept.load(Ordering::Acquire));
                if now >= hard_deadline || now.saturating_sub(last) >= quiet {
                    break;
                }
            }
        }

        if ran == 0 && queue_empty {
            let next = inner.scheduled_lock().next_deadline();
            let shutting_down = inner.lifecycle() >= Lifecycle::ShuttingDown;
            match next {
                Some(deadline) => {
                    let now = inner.now();
                    if deadline > now {
                        let mut wait = deadline - now;
                        if shutting_down {
                            // Bounded park so the quiet-period and hard-timeout
                            // checks keep running.
                            wait = wait.min(Duration::from_millis(1));
                        }
                        parker.park_timeout(wait);
                    }
                }
                None => {
                    if shutting_down {
                        parker.park_timeout(Duration::from_millis(1));
                    } else {
                        parker.park();
                    }
                }
            }
        }
    }

    // Stop accepting, then drain what was admitted before the cutoff.
    inner
        .state
        .store(Lifecycle::Shutdown as u8, Ordering::Release);
    loop {
        let task = inner.queue_lock().pop_front();
        match task {
            Some(task) => run_task(task),
            None => break,
        }
    }
    inner
        .state
        .store(Lifecycle::Terminated as u8, Ordering::Release);
    let _ = inner.termination.try_success(());
}

/// Moves every expired scheduled task into the FIFO queue, preserving
/// `(deadline, id)` order. Repeating tasks re-arm themselves after running.
fn promote_expired(inner: &Arc<ExecInner>, now: Duration) {
    let expired = inner.scheduled_lock().pop_expired(now);
    if expired.is_empty() {
        return;
    }
    let mut queue = inner.queue_lock();
    for mut entry in expired {
        match entry.kind {
            TaskKind::Once(ref mut task) => {
                if let Some(task) = task.take() {
                    queue.push_back(task);
                }
            }
            TaskKind::Repeating(_) => {
                let rearm_inner = Arc::clone(inner);
                queue.push_back(Box::new(move || {
                    let mut entry = entry;
                    if entry.state.is_cancelled() {
                        return;
                    }
                    if let TaskKind::Repeating(task) = &mut entry.kind {
                        if let Err(panic) = catch_unwind(AssertUnwindSafe(task)) {
                            log_task_panic(&panic);
                        }
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

fn run_batch(inner: &Arc<ExecInner>, limit: usize) -> usize {
    let mut ran = 0;
    while ran < limit {
        let task = inner.queue_lock().pop_front();
        match task {
            Some(task) => {
                run_task(task);
                ran += 1;
            }
            None => break,
        }
    }
    ran
}

/// Task panics are contained and logged; the loop must outlive any single
/// submission.
fn run_task(task: Task) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(task)) {
        log_task_panic(&panic);
    }
}

fn log_task_panic(panic: &(dyn std::any::Any + Send)) {
    let msg = panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic".to_string());
    tracing::error!(panic = %msg, "task panicked in event executor");
}
