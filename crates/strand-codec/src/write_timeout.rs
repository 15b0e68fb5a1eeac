use crate::CodecError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use strand_channel::{Ctx, Handler, HandlerCaps, Msg};
use strand_core::{Cause, Promise, ScheduledHandle};

/// Fails writes that do not complete within a deadline.
///
/// Each intercepted write schedules a deadline task and registers it in a
/// pending set keyed by a monotonic id. If the deadline fires with the
/// promise still incomplete, the promise fails with
/// [`CodecError::WriteTimeout`], the error travels the pipeline as
/// `exception_caught`, and the channel is closed. Completion before the
/// deadline cancels the task and drops the entry; handler removal cancels
/// everything still pending.
pub struct WriteTimeoutHandler {
    timeout: Duration,
    next_id: AtomicU64,
    pending: Arc<Mutex<HashMap<u64, ScheduledHandle>>>,
}

impl WriteTimeoutHandler {
    pub fn new(timeout: Duration) -> Self {
        assert!(!timeout.is_zero(), "write timeout must be non-zero");
        Self {
            timeout,
            next_id: AtomicU64::new(0),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Writes currently supervised.
    pub fn pending_deadlines(&self) -> usize {
        self.lock_pending().len()
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, ScheduledHandle>> {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Handler for WriteTimeoutHandler {
    fn capabilities(&self) -> HandlerCaps {
        HandlerCaps::OUTBOUND
    }

    fn write(&self, ctx: &Ctx, msg: Msg, promise: Promise<()>) -> Result<(), Cause> {
        let scheduled = ctx.executor().and_then(|executor| {
            let ctx_arc = ctx
                .channel()
                .and_then(|channel| channel.pipeline().ctx(ctx.name()))?;
            let watched = promise.clone();
            let timeout = self.timeout;
            executor
                .schedule(
                    timeout,
                    Box::new(move || {
                        if watched.is_done() {
                            return;
                        }
                        let cause: Cause = Arc::new(CodecError::WriteTimeout { timeout });
                        if watched.try_failure(Arc::clone(&cause)) {
                            ctx_arc.fire_exception_caught(cause);
                            if let Some(channel) = ctx_arc.channel() {
                                channel.close();
                            }
                        }
                    }),
                )
                .ok()
        });

        if let Some(handle) = scheduled {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            self.lock_pending().insert(id, handle.clone());
            let pending = Arc::clone(&self.pending);
            promise.add_listener(move |_| {
                handle.cancel();
                pending
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .remove(&id);
            });
        }

        ctx.write(msg, promise);
        Ok(())
    }

    fn handler_removed(&self, _ctx: &Ctx) -> Result<(), Cause> {
        for (_, handle) in self.lock_pending().drain() {
            handle.cancel();
        }
        Ok(())
    }
}
