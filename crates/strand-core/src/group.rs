use crate::{EventExecutor, Promise};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Fixed pool of event executors with a round-robin chooser.
///
/// The chooser uses a mask when the pool size is a power of two and a modulo
/// otherwise. The group owns lifecycle: graceful shutdown fans out to every
/// member and the group's termination promise completes once all workers
/// have exited.
pub struct ExecutorGroup {
    executors: Vec<Arc<EventExecutor>>,
    next: AtomicUsize,
    power_of_two: bool,
    shutting_down: AtomicBool,
    termination: Promise<()>,
}

impl ExecutorGroup {
    /// Spawns `threads` executors named `{name}-0..n`.
    pub fn new(name: &str, threads: usize) -> Self {
        assert!(threads > 0, "executor group needs at least one thread");
        let executors: Vec<Arc<EventExecutor>> = (0..threads)
            .map(|i| EventExecutor::new(&format!("{name}-{i}")))
            .collect();

        let termination: Promise<()> = Promise::new();
        let remaining = Arc::new(AtomicUsize::new(executors.len()));
        for executor in &executors {
            let remaining = Arc::clone(&remaining);
            let termination = termination.clone();
            executor.termination_promise().add_listener(move |_| {
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let _ = termination.try_success(());
                }
            });
        }

        Self {
            power_of_two: threads.is_power_of_two(),
            executors,
            next: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
            termination,
        }
    }

    /// Number of executors in the pool.
    pub fn size(&self) -> usize {
        self.executors.len()
    }

    /// Picks the next executor round-robin.
    pub fn next(&self) -> Arc<EventExecutor> {
        let ticket = self.next.fetch_add(1, Ordering::Relaxed);
        let index = if self.power_of_two {
            ticket & (self.executors.len() - 1)
        } else {
            ticket % self.executors.len()
        };
        Arc::clone(&self.executors[index])
    }

    /// All members, in construction order.
    pub fn executors(&self) -> &[Arc<EventExecutor>] {
        &self.executors
    }

    /// Initiates graceful shutdown on every member.
    ///
    /// Members keep accepting tasks for `quiet_period` past their last
    /// submission and exit no later than `timeout`. The returned promise is
    /// the group's termination promise.
    pub fn shutdown_gracefully(&self, quiet_period: Duration, timeout: Duration) -> Promise<()> {
        self.shutting_down.store(true, Ordering::Release);
        for executor in &self.executors {
            executor.shutdown_gracefully(quiet_period, timeout);
        }
        self.termination.clone()
    }

    /// Returns `true` from the moment shutdown was initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Returns `true` once every member has terminated.
    pub fn is_terminated(&self) -> bool {
        self.executors.iter().all(|e| e.is_terminated())
    }

    /// Completed when every member has terminated.
    pub fn termination_promise(&self) -> Promise<()> {
        self.termination.clone()
    }
}
