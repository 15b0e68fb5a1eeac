use crate::error::{CancelledError, Cause, PromiseError};
use crate::Executor;
use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Terminal result of a promise.
#[derive(Debug)]
pub enum Outcome<T> {
    /// Completed with a value.
    Success(T),
    /// Completed with a failure cause.
    Failure(Cause),
    /// Completed by cancellation.
    Cancelled,
}

type Listener<T> = Box<dyn FnOnce(&Outcome<T>) + Send + 'static>;

/// Identifies a registered listener so it can be removed before completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

enum State<T> {
    Incomplete {
        uncancellable: bool,
        listeners: Vec<(u64, Listener<T>)>,
        waiters: usize,
    },
    Complete(Arc<Outcome<T>>),
}

struct Inner<T> {
    state: Mutex<State<T>>,
    done: Condvar,
    next_listener: std::sync::atomic::AtomicU64,
    /// Listeners of a bound promise run on this executor.
    executor: Option<Arc<dyn Executor>>,
}

/// Single-assignment completion object.
///
/// The terminal transition (success, failure or cancellation) happens at most
/// once. Listeners registered before completion fire exactly once in
/// registration order — on the bound executor when there is one, otherwise on
/// the completing thread. Listeners added after completion run immediately on
/// the registering thread.
///
/// Blocking waits ([`await_done`](Self::await_done), [`sync`](Self::sync))
/// refuse to run on the bound executor's own thread: parking the loop that
/// would complete the promise can never finish.
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Promise<T>
where
    T: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Promise<T>
where
    T: Send + Sync + 'static,
{
    /// Unbound promise: listeners run on the completing thread.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Promise bound to an executor; completion listeners are dispatched
    /// through it.
    pub fn bound(executor: Arc<dyn Executor>) -> Self {
        Self::build(Some(executor))
    }

    fn build(executor: Option<Arc<dyn Executor>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Incomplete {
                    uncancellable: false,
                    listeners: Vec::new(),
                    waiters: 0,
                }),
                done: Condvar::new(),
                next_listener: std::sync::atomic::AtomicU64::new(0),
                executor,
            }),
        }
    }

    // ---------------------------------------------------------------------
    // INSPECTION
    // ---------------------------------------------------------------------

    /// Returns `true` once a terminal transition happened.
    pub fn is_done(&self) -> bool {
        matches!(*self.lock(), State::Complete(_))
    }

    /// Returns `true` when completed successfully.
    pub fn is_success(&self) -> bool {
        matches!(
            &*self.lock(),
            State::Complete(outcome) if matches!(outcome.as_ref(), Outcome::Success(_))
        )
    }

    /// Returns `true` when completed by cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            &*self.lock(),
            State::Complete(outcome) if matches!(outcome.as_ref(), Outcome::Cancelled)
        )
    }

    /// Returns `true` while cancellation can still succeed.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            &*self.lock(),
            State::Incomplete {
                uncancellable: false,
                ..
            }
        )
    }

    /// The failure cause, if completed unsuccessfully. Cancellation reports
    /// a [`CancelledError`] cause.
    pub fn cause(&self) -> Option<Cause> {
        match &*self.lock() {
            State::Complete(outcome) => match outcome.as_ref() {
                Outcome::Failure(cause) => Some(Arc::clone(cause)),
                Outcome::Cancelled => Some(Arc::new(CancelledError)),
                Outcome::Success(_) => None,
            },
            State::Incomplete { .. } => None,
        }
    }

    /// The success value if already available, without waiting.
    pub fn get_now(&self) -> Option<T>
    where
        T: Clone,
    {
        match &*self.lock() {
            State::Complete(outcome) => match outcome.as_ref() {
                Outcome::Success(value) => Some(value.clone()),
                _ => None,
            },
            State::Incomplete { .. } => None,
        }
    }

    // ---------------------------------------------------------------------
    // COMPLETION
    // ---------------------------------------------------------------------

    /// Completes with a value; fails on double-completion.
    pub fn set_success(&self, value: T) -> Result<(), PromiseError> {
        self.complete(Outcome::Success(value))
    }

    /// Completes with a failure cause; fails on double-completion.
    pub fn set_failure(&self, cause: Cause) -> Result<(), PromiseError> {
        self.complete(Outcome::Failure(cause))
    }

    /// Completes with a value; returns `false` if already complete.
    pub fn try_success(&self, value: T) -> bool {
        self.complete(Outcome::Success(value)).is_ok()
    }

    /// Completes with a failure; returns `false` if already complete.
    pub fn try_failure(&self, cause: Cause) -> bool {
        self.complete(Outcome::Failure(cause)).is_ok()
    }

    /// Latches the promise against cancellation. Returns `true` when the
    /// promise is now uncancellable and not already cancelled.
    pub fn set_uncancellable(&self) -> bool {
        let mut state = self.lock();
        match &mut *state {
            State::Incomplete { uncancellable, .. } => {
                *uncancellable = true;
                true
            }
            State::Complete(outcome) => !matches!(outcome.as_ref(), Outcome::Cancelled),
        }
    }

    /// Best-effort cancellation. Succeeds only while incomplete and not
    /// latched uncancellable; races with `set_success`/`set_failure`.
    pub fn cancel(&self) -> bool {
        {
            let state = self.lock();
            if let State::Incomplete { uncancellable, .. } = &*state {
                if *uncancellable {
                    return false;
                }
            } else {
                return false;
            }
        }
        self.complete(Outcome::Cancelled).is_ok()
    }

    fn complete(&self, outcome: Outcome<T>) -> Result<(), PromiseError> {
        let listeners;
        let shared;
        {
            let mut state = self.lock();
            match &mut *state {
                State::Complete(_) => return Err(PromiseError::AlreadyComplete),
                State::Incomplete {
                    uncancellable,
                    listeners: pending,
                    ..
                } => {
                    if matches!(outcome, Outcome::Cancelled) && *uncancellable {
                        return Err(PromiseError::AlreadyComplete);
                    }
                    listeners = mem::take(pending)
                        .into_iter()
                        .map(|(_, listener)| listener)
                        .collect();
                    shared = Arc::new(outcome);
                    *state = State::Complete(Arc::clone(&shared));
                }
            }
        }
        // Waiters are woken exactly once: the single terminal transition.
        self.inner.done.notify_all();
        self.dispatch(listeners, shared);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // LISTENERS
    // ---------------------------------------------------------------------

    /// Registers a completion listener. Before completion it is queued in
    /// registration order; after completion it runs immediately on the
    /// calling thread. The returned id removes the listener while the
    /// promise is still incomplete.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        let id = self
            .inner
            .next_listener
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let immediate = {
            let mut state = self.lock();
            match &mut *state {
                State::Incomplete { listeners, .. } => {
                    listeners.push((id, Box::new(listener)));
                    None
                }
                State::Complete(outcome) => {
                    Some((Box::new(listener) as Listener<T>, Arc::clone(outcome)))
                }
            }
        };
        if let Some((listener, outcome)) = immediate {
            run_listener(listener, &outcome);
        }
        ListenerId(id)
    }

    /// Unregisters a pending listener. Returns `false` when the listener
    /// already ran (or was removed before).
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut state = self.lock();
        match &mut *state {
            State::Incomplete { listeners, .. } => {
                let before = listeners.len();
                listeners.retain(|(listener_id, _)| *listener_id != id.0);
                listeners.len() != before
            }
            State::Complete(_) => false,
        }
    }

    fn dispatch(&self, listeners: Vec<Listener<T>>, outcome: Arc<Outcome<T>>) {
        if listeners.is_empty() {
            return;
        }
        match &self.inner.executor {
            Some(executor) => {
                let submitted = executor.execute(Box::new({
                    let outcome = Arc::clone(&outcome);
                    let mut listeners = listeners;
                    move || {
                        for listener in listeners.drain(..) {
                            run_listener(listener, &outcome);
                        }
                    }
                }));
                if let Err(e) = submitted {
                    tracing::warn!(error = %e, "executor rejected listener dispatch");
                }
            }
            None => {
                for listener in listeners {
                    run_listener(listener, &outcome);
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // WAITING
    // ---------------------------------------------------------------------

    /// Blocks the calling thread until completion. Returns immediately when
    /// the promise is already complete; the deadlock check only applies to a
    /// wait that would actually park.
    pub fn await_done(&self) -> Result<(), PromiseError> {
        if self.is_done() {
            return Ok(());
        }
        self.check_not_in_loop()?;
        let mut state = self.lock();
        loop {
            match &mut *state {
                State::Complete(_) => return Ok(()),
                State::Incomplete { waiters, .. } => {
                    *waiters += 1;
                }
            }
            state = self
                .inner
                .done
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let State::Incomplete { waiters, .. } = &mut *state {
                *waiters = waiters.saturating_sub(1);
            }
        }
    }

    /// Blocks until completion or until `timeout` elapses. Returns `true`
    /// when the promise completed within the window.
    pub fn await_timeout(&self, timeout: Duration) -> Result<bool, PromiseError> {
        if self.is_done() {
            return Ok(true);
        }
        self.check_not_in_loop()?;
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if matches!(*state, State::Complete(_)) {
                return Ok(true);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            if let State::Incomplete { waiters, .. } = &mut *state {
                *waiters += 1;
            }
            let (guard, _timed_out) = self
                .inner
                .done
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            state = guard;
            if let State::Incomplete { waiters, .. } = &mut *state {
                *waiters = waiters.saturating_sub(1);
            }
        }
    }

    /// Waits for completion and rethrows failure or cancellation.
    pub fn sync(&self) -> Result<T, PromiseError>
    where
        T: Clone,
    {
        self.await_done()?;
        match &*self.lock() {
            State::Complete(outcome) => match outcome.as_ref() {
                Outcome::Success(value) => Ok(value.clone()),
                Outcome::Failure(cause) => Err(PromiseError::Failed(Arc::clone(cause))),
                Outcome::Cancelled => Err(PromiseError::Cancelled),
            },
            State::Incomplete { .. } => unreachable!("await_done returned on incomplete promise"),
        }
    }

    fn check_not_in_loop(&self) -> Result<(), PromiseError> {
        if let Some(executor) = &self.inner.executor {
            if executor.in_event_loop() {
                return Err(PromiseError::BlockingInLoop);
            }
        }
        Ok(())
    }
}

impl<T> Promise<T> {
    fn lock(&self) -> std::sync::MutexGuard<'_, State<T>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl<T> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.lock() {
            State::Incomplete { .. } => "incomplete",
            State::Complete(outcome) => match outcome.as_ref() {
                Outcome::Success(_) => "success",
                Outcome::Failure(_) => "failure",
                Outcome::Cancelled => "cancelled",
            },
        };
        f.debug_struct("Promise").field("state", &state).finish()
    }
}

/// Listener panics are caught and logged, never re-raised: completion must
/// stay single-shot even in the face of a misbehaving callback.
fn run_listener<T>(listener: Listener<T>, outcome: &Outcome<T>) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(outcome))) {
        let msg = panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic".to_string());
        tracing::warn!(panic = %msg, "promise listener panicked");
    }
}
