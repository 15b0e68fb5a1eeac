//! Typed channel attributes keyed by pool constants.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use strand_core::{Constant, ConstantPool};

fn key_pool() -> &'static ConstantPool {
    static POOL: OnceLock<ConstantPool> = OnceLock::new();
    POOL.get_or_init(ConstantPool::new)
}

/// Process-unique attribute key. Two `value_of` calls with the same name
/// observe the same key; ids are stable for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttrKey {
    constant: Constant,
}

impl AttrKey {
    /// The key registered under `name`, created on first use.
    pub fn value_of(name: &str) -> Self {
        Self {
            constant: key_pool().value_of(name),
        }
    }

    /// The key's name.
    pub fn name(&self) -> &str {
        self.constant.name()
    }

    fn id(&self) -> u64 {
        self.constant.id()
    }
}

impl std::fmt::Display for AttrKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.constant.fmt(f)
    }
}

/// Attribute storage attached to every channel.
#[derive(Debug, Default)]
pub struct AttrMap {
    entries: Mutex<HashMap<u64, Box<dyn Any + Send + Sync>>>,
}

impl AttrMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn set<T: Any + Send + Sync>(&self, key: &AttrKey, value: T) {
        self.lock().insert(key.id(), Box::new(value));
    }

    /// Clones the value stored under `key`.
    pub fn get<T: Any + Send + Sync + Clone>(&self, key: &AttrKey) -> Option<T> {
        self.lock()
            .get(&key.id())
            .and_then(|boxed| boxed.downcast_ref::<T>())
            .cloned()
    }

    /// Removes and returns the value stored under `key`.
    pub fn remove<T: Any + Send + Sync>(&self, key: &AttrKey) -> Option<T> {
        let boxed = self.lock().remove(&key.id())?;
        match boxed.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(other) => {
                // Type mismatch: put the entry back untouched.
                self.lock().insert(key.id(), other);
                None
            }
        }
    }

    /// Returns `true` when a value is stored under `key`.
    pub fn contains(&self, key: &AttrKey) -> bool {
        self.lock().contains_key(&key.id())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Box<dyn Any + Send + Sync>>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
