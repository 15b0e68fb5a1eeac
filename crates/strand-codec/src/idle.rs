use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;
use strand_channel::{Ctx, Handler, Msg};
use strand_core::{Cause, Promise, ScheduledHandle};

/// Which direction went idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleState {
    /// No inbound traffic for the configured window.
    ReaderIdle,
    /// No completed writes for the configured window.
    WriterIdle,
    /// Neither direction made progress.
    AllIdle,
}

/// User event fired by [`IdleHandler`] when a direction goes idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleStateEvent {
    /// The idle direction.
    pub state: IdleState,
    /// `true` for the first event since the direction was last active.
    pub first: bool,
}

/// Idle windows. Zero disables a direction; non-zero values are clamped to
/// at least one millisecond.
#[derive(Debug, Clone, Copy)]
pub struct IdleConfig {
    pub reader_idle: Duration,
    pub writer_idle: Duration,
    pub all_idle: Duration,
    /// Treat outbound-buffer progress as write activity: suppresses writer
    /// idle events while a slow peer is still draining a large write.
    pub observe_output: bool,
}

impl IdleConfig {
    pub fn new(reader_idle: Duration, writer_idle: Duration, all_idle: Duration) -> Self {
        Self {
            reader_idle: clamp(reader_idle),
            writer_idle: clamp(writer_idle),
            all_idle: clamp(all_idle),
            observe_output: false,
        }
    }

    pub fn with_observe_output(mut self, observe: bool) -> Self {
        self.observe_output = observe;
        self
    }
}

fn clamp(idle: Duration) -> Duration {
    if idle.is_zero() {
        Duration::ZERO
    } else {
        idle.max(Duration::from_millis(1))
    }
}

struct IdleTimes {
    last_read: Duration,
    last_write: Duration,
    reading: bool,
    first_reader: bool,
    first_writer: bool,
    first_all: bool,
    /// Snapshot of (first-unflushed identity, pending bytes) from the last
    /// output observation.
    out_snapshot: (Option<u64>, usize),
}

struct IdleRuntime {
    config: IdleConfig,
    times: Mutex<IdleTimes>,
    stopped: AtomicBool,
    /// One live deadline task per direction.
    handles: Mutex<[Option<ScheduledHandle>; 3]>,
}

fn slot(state: IdleState) -> usize {
    match state {
        IdleState::ReaderIdle => 0,
        IdleState::WriterIdle => 1,
        IdleState::AllIdle => 2,
    }
}

impl IdleRuntime {
    fn times_lock(&self) -> MutexGuard<'_, IdleTimes> {
        self.times
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let mut handles = self
            .handles
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for handle in handles.iter_mut() {
            if let Some(handle) = handle.take() {
                handle.cancel();
            }
        }
    }

    fn keep(&self, state: IdleState, handle: ScheduledHandle) {
        self.handles
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)[slot(state)] = Some(handle);
    }

    /// Returns `true` when the outbound buffer moved since the last check,
    /// updating the stored snapshot.
    fn output_changed(&self, ctx: &Ctx) -> bool {
        let Some(channel) = ctx.channel() else {
            return false;
        };
        let snapshot = channel.outbound_snapshot();
        let mut times = self.times_lock();
        if times.out_snapshot != snapshot {
            times.out_snapshot = snapshot;
            return true;
        }
        false
    }
}

/// Fires [`IdleStateEvent`]s when the channel sees no read, write or either
/// for the configured windows.
///
/// On activation, one deadline task per enabled direction is scheduled on
/// the channel's executor. Each firing recomputes the remaining delay from
/// the last relevant activity: expired windows emit the event and re-arm at
/// the full interval, otherwise the task re-arms at the remainder. Timeouts
/// are deadlines, not interrupts — they never preempt a running handler.
pub struct IdleHandler {
    config: IdleConfig,
    runtime: OnceLock<Arc<IdleRuntime>>,
}

impl IdleHandler {
    pub fn new(config: IdleConfig) -> Self {
        Self {
            config,
            runtime: OnceLock::new(),
        }
    }

    fn runtime(&self) -> Option<&Arc<IdleRuntime>> {
        self.runtime.get()
    }

    fn initialize(&self, ctx: &Ctx) {
        let Some(executor) = ctx.executor() else {
            return;
        };
        let now = executor.now();
        let out_snapshot = ctx
            .channel()
            .map_or((None, 0), |channel| channel.outbound_snapshot());
        let runtime = Arc::new(IdleRuntime {
            config: self.config,
            times: Mutex::new(IdleTimes {
                last_read: now,
                last_write: now,
                reading: false,
                first_reader: true,
                first_writer: true,
                first_all: true,
                out_snapshot,
            }),
            stopped: AtomicBool::new(false),
            handles: Mutex::new([None, None, None]),
        });
        if self.runtime.set(Arc::clone(&runtime)).is_err() {
            return;
        }

        // The deadline tasks need a context handle that outlives this call.
        let Some(ctx_arc) = ctx
            .channel()
            .and_then(|channel| channel.pipeline().ctx(ctx.name()))
        else {
            return;
        };
        if !self.config.reader_idle.is_zero() {
            arm(&runtime, &ctx_arc, self.config.reader_idle, IdleState::ReaderIdle);
        }
        if !self.config.writer_idle.is_zero() {
            arm(&runtime, &ctx_arc, self.config.writer_idle, IdleState::WriterIdle);
        }
        if !self.config.all_idle.is_zero() {
            arm(&runtime, &ctx_arc, self.config.all_idle, IdleState::AllIdle);
        }
    }
}

/// Schedules one deadline check for `state` after `delay`.
fn arm(runtime: &Arc<IdleRuntime>, ctx: &Arc<Ctx>, delay: Duration, state: IdleState) {
    let Some(executor) = ctx.executor() else {
        return;
    };
    let task_runtime = Arc::clone(runtime);
    let task_ctx = Arc::clone(ctx);
    match executor.schedule(
        delay,
        Box::new(move || deadline_fired(&task_runtime, &task_ctx, state)),
    ) {
        Ok(handle) => runtime.keep(state, handle),
        Err(e) => tracing::debug!(error = %e, "scheduling idle deadline failed"),
    }
}

fn deadline_fired(runtime: &Arc<IdleRuntime>, ctx: &Arc<Ctx>, state: IdleState) {
    if runtime.stopped() || ctx.is_removed() {
        return;
    }
    let Some(executor) = ctx.executor() else {
        return;
    };
    let now = executor.now();

    let (interval, next_delay, first) = {
        let mut times = runtime.times_lock();
        match state {
            IdleState::ReaderIdle => {
                let interval = runtime.config.reader_idle;
                // A read burst in progress counts as activity.
                let next = if times.reading {
                    interval
                } else {
                    interval.saturating_sub(now.saturating_sub(times.last_read))
                };
                let first = times.first_reader;
                if next.is_zero() {
                    times.first_reader = false;
                }
                (interval, next, first)
            }
            IdleState::WriterIdle => {
                let interval = runtime.config.writer_idle;
                let next = interval.saturating_sub(now.saturating_sub(times.last_write));
                let first = times.first_writer;
                if next.is_zero() {
                    times.first_writer = false;
                }
                (interval, next, first)
            }
            IdleState::AllIdle => {
                let interval = runtime.config.all_idle;
                let last = times.last_read.max(times.last_write);
                let next = if times.reading {
                    interval
                } else {
                    interval.saturating_sub(now.saturating_sub(last))
                };
                let first = times.first_all;
                if next.is_zero() {
                    times.first_all = false;
                }
                (interval, next, first)
            }
        }
    };

    if next_delay.is_zero() {
        // Writer-facing checks consult the outbound buffer first: a moving
        // flush is not idleness.
        let observes = runtime.config.observe_output
            && matches!(state, IdleState::WriterIdle | IdleState::AllIdle);
        if observes && runtime.output_changed(ctx) {
            arm(runtime, ctx, interval, state);
            return;
        }
        arm(runtime, ctx, interval, state);
        ctx.fire_user_event(Box::new(IdleStateEvent { state, first }));
    } else {
        arm(runtime, ctx, next_delay, state);
    }
}

impl Handler for IdleHandler {
    fn handler_added(&self, ctx: &Ctx) -> Result<(), Cause> {
        if ctx.channel().is_some_and(|channel| channel.is_active()) {
            self.initialize(ctx);
        }
        Ok(())
    }

    fn channel_active(&self, ctx: &Ctx) -> Result<(), Cause> {
        self.initialize(ctx);
        ctx.fire_channel_active();
        Ok(())
    }

    fn channel_inactive(&self, ctx: &Ctx) -> Result<(), Cause> {
        if let Some(runtime) = self.runtime() {
            runtime.stop();
        }
        ctx.fire_channel_inactive();
        Ok(())
    }

    fn handler_removed(&self, _ctx: &Ctx) -> Result<(), Cause> {
        if let Some(runtime) = self.runtime() {
            runtime.stop();
        }
        Ok(())
    }

    fn channel_read(&self, ctx: &Ctx, msg: Msg) -> Result<(), Cause> {
        if let Some(runtime) = self.runtime() {
            if !runtime.config.reader_idle.is_zero() || !runtime.config.all_idle.is_zero() {
                let mut times = runtime.times_lock();
                times.reading = true;
                times.first_reader = true;
                times.first_all = true;
            }
        }
        ctx.fire_channel_read(msg);
        Ok(())
    }

    fn channel_read_complete(&self, ctx: &Ctx) -> Result<(), Cause> {
        if let Some(runtime) = self.runtime() {
            if let Some(executor) = ctx.executor() {
                let mut times = runtime.times_lock();
                if times.reading {
                    times.reading = false;
                    times.last_read = executor.now();
                }
            }
        }
        ctx.fire_channel_read_complete();
        Ok(())
    }

    fn write(&self, ctx: &Ctx, msg: Msg, promise: Promise<()>) -> Result<(), Cause> {
        if let Some(runtime) = self.runtime() {
            if !runtime.config.writer_idle.is_zero() || !runtime.config.all_idle.is_zero() {
                // Write activity is counted at completion time, when the
                // transport actually accepted the bytes.
                let listener_runtime = Arc::clone(runtime);
                let listener_executor = ctx.executor();
                promise.add_listener(move |_| {
                    if let Some(executor) = &listener_executor {
                        let mut times = listener_runtime.times_lock();
                        times.last_write = executor.now();
                        times.first_writer = true;
                        times.first_all = true;
                    }
                });
            }
        }
        ctx.write(msg, promise);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_clamps_sub_millisecond_windows() {
        let config = IdleConfig::new(
            Duration::from_micros(10),
            Duration::ZERO,
            Duration::from_millis(5),
        );
        assert_eq!(config.reader_idle, Duration::from_millis(1));
        assert_eq!(config.writer_idle, Duration::ZERO);
        assert_eq!(config.all_idle, Duration::from_millis(5));
    }
}
