//! Event Executors and Promises for the Strand Runtime
//!
//! One executor owns one worker thread: a FIFO task queue plus a min-heap of
//! scheduled tasks keyed by `(deadline, id)`. Channels pin to an executor at
//! registration, so per-channel state needs no locks — single-owner
//! discipline replaces them. A group multiplexes executors behind a
//! round-robin chooser and owns graceful shutdown.
//!
//! # Key Features
//!
//! - `Promise<T>`: single-assignment completion with ordered listeners,
//!   blocking waits for foreign threads and a deadlock guard on the loop
//! - `EventExecutor`: park/wake worker loop, one-shot and periodic schedules
//! - `ManualExecutor`: inline execution with a virtual clock for tests
//! - `ExecutorGroup`: power-of-two/modulo chooser, quiet-period shutdown
//! - `ConstantPool`: process-unique named constants
//!
//! # Example
//!
//! ```
//! use strand_core::{Executor, ExecutorGroup, Promise};
//! use std::time::Duration;
//!
//! let group = ExecutorGroup::new("worker", 2);
//! let executor = group.next();
//!
//! let promise: Promise<u32> = Promise::new();
//! let completion = promise.clone();
//! executor
//!     .execute(Box::new(move || {
//!         completion.set_success(42).unwrap();
//!     }))
//!     .unwrap();
//!
//! assert_eq!(promise.sync().unwrap(), 42);
//! group
//!     .shutdown_gracefully(Duration::from_millis(10), Duration::from_secs(1))
//!     .await_done()
//!     .unwrap();
//! ```

mod constant;
mod error;
mod executor;
mod group;
mod manual;
mod promise;
mod scheduled;

pub use constant::{Constant, ConstantPool};
pub use error::{CancelledError, Cause, ConstantError, ExecutorError, PromiseError};
pub use executor::{EventExecutor, Executor};
pub use group::ExecutorGroup;
pub use manual::ManualExecutor;
pub use promise::{ListenerId, Outcome, Promise};
pub use scheduled::{Period, RepeatingTask, ScheduledHandle, Task};
