//! Process-wide named constants.
//!
//! A pool maps names to [`Constant`]s with ids that are unique across every
//! pool in the process and stable for its lifetime. Typed attribute keys and
//! event names build on this.

use crate::ConstantError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Ids are drawn from one process-wide counter so constants from different
/// pools never collide.
static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Named constant with a process-unique id.
///
/// Equality, ordering and hashing go by id only; the name is carried for
/// display.
#[derive(Debug, Clone)]
pub struct Constant {
    id: u64,
    name: Arc<str>,
}

impl Constant {
    /// The process-unique id.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The name the constant was created under.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for Constant {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Constant {}

impl std::hash::Hash for Constant {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for Constant {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Constant {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl std::fmt::Display for Constant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Thread-safe name -> [`Constant`] mapping.
#[derive(Debug, Default)]
pub struct ConstantPool {
    entries: Mutex<HashMap<String, Constant>>,
}

impl ConstantPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the constant registered under `name`, creating it on first
    /// use. Idempotent: every later call observes the same id.
    pub fn value_of(&self, name: &str) -> Constant {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries
            .entry(name.to_string())
            .or_insert_with(|| Constant {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                name: Arc::from(name),
            })
            .clone()
    }

    /// Creates a constant under a previously unused name.
    pub fn new_instance(&self, name: &str) -> Result<Constant, ConstantError> {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if entries.contains_key(name) {
            return Err(ConstantError::Duplicate {
                name: name.to_string(),
            });
        }
        let constant = Constant {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            name: Arc::from(name),
        };
        entries.insert(name.to_string(), constant.clone());
        Ok(constant)
    }

    /// Returns `true` when `name` is already registered.
    pub fn exists(&self, name: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_of_is_idempotent() {
        let pool = ConstantPool::new();
        let a = pool.value_of("alpha");
        let b = pool.value_of("alpha");
        assert_eq!(a, b);
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn distinct_names_get_distinct_ids() {
        let pool = ConstantPool::new();
        let a = pool.value_of("alpha");
        let b = pool.value_of("beta");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn ids_are_unique_across_pools() {
        let first = ConstantPool::new();
        let second = ConstantPool::new();
        assert_ne!(first.value_of("same").id(), second.value_of("same").id());
    }

    #[test]
    fn new_instance_rejects_duplicates() {
        let pool = ConstantPool::new();
        pool.new_instance("solo").unwrap();
        assert_eq!(
            pool.new_instance("solo").unwrap_err(),
            ConstantError::Duplicate {
                name: "solo".to_string()
            }
        );
    }

    #[test]
    fn ordering_follows_creation_ids() {
        let pool = ConstantPool::new();
        let a = pool.value_of("first");
        let b = pool.value_of("second");
        assert!(a < b);
    }
}
