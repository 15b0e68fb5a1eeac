//! Buffer allocation with live/freed accounting.

use crate::leak::{LeakDetector, LeakLevel};
use crate::{ByteBuf, CompositeBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Thread-safe allocation accounting (uses atomics).
///
/// Counters outlive the allocator handle: every storage region keeps a
/// reference so deallocations are recorded even after the allocator is gone.
#[derive(Debug, Default)]
pub struct AllocCounters {
    allocated: AtomicU64,
    deallocated: AtomicU64,
    /// Regions reclaimed by drop with a live reference count.
    reclaimed: AtomicU64,
    bytes_allocated: AtomicU64,
    bytes_freed: AtomicU64,
}

impl AllocCounters {
    /// Total buffers handed out.
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Buffers explicitly released down to count 0.
    pub fn deallocated(&self) -> u64 {
        self.deallocated.load(Ordering::Relaxed)
    }

    /// Buffers dropped while their count was still positive.
    pub fn reclaimed(&self) -> u64 {
        self.reclaimed.load(Ordering::Relaxed)
    }

    /// Buffers currently alive (allocated minus freed minus reclaimed).
    pub fn live(&self) -> u64 {
        self.allocated() - self.deallocated() - self.reclaimed()
    }

    /// Total bytes handed out across all allocations.
    pub fn bytes_allocated(&self) -> u64 {
        self.bytes_allocated.load(Ordering::Relaxed)
    }

    /// Total bytes returned by explicit release.
    pub fn bytes_freed(&self) -> u64 {
        self.bytes_freed.load(Ordering::Relaxed)
    }

    pub(crate) fn note_allocated(&self, bytes: usize) {
        self.allocated.fetch_add(1, Ordering::Relaxed);
        self.bytes_allocated.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn note_deallocated(&self, bytes: usize) {
        self.deallocated.fetch_add(1, Ordering::Relaxed);
        self.bytes_freed.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn note_reclaimed(&self) {
        self.reclaimed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Source of reference-counted buffers. Buffers are born with count 1.
pub trait BufAllocator: Send + Sync {
    /// Allocates a buffer with `initial` capacity, growable up to `max`.
    fn allocate(&self, initial: usize, max: usize) -> ByteBuf;

    /// Creates an empty composite buffer holding up to `max_components`.
    fn composite(&self, max_components: usize) -> CompositeBuf;
}

/// Heap-backed allocator with accounting and sampled leak tracking.
#[derive(Clone)]
pub struct HeapAllocator {
    counters: Arc<AllocCounters>,
    detector: Arc<LeakDetector>,
}

impl HeapAllocator {
    /// Allocator with leak detection at the given level.
    pub fn new(level: LeakLevel) -> Self {
        Self {
            counters: Arc::new(AllocCounters::default()),
            detector: Arc::new(LeakDetector::new(level)),
        }
    }

    /// Allocator with leak detection disabled. Preferred in tests that assert
    /// on counter conservation.
    pub fn unsampled() -> Self {
        Self::new(LeakLevel::Disabled)
    }

    /// Allocation accounting for this allocator.
    pub fn counters(&self) -> &AllocCounters {
        &self.counters
    }

    /// The leak detector sampling this allocator's buffers.
    pub fn leak_detector(&self) -> &LeakDetector {
        &self.detector
    }
}

impl Default for HeapAllocator {
    /// Leak level comes from the environment (`STRAND_LEAK_DETECTION`),
    /// falling back to `Simple`.
    fn default() -> Self {
        Self::new(LeakLevel::from_env())
    }
}

impl BufAllocator for HeapAllocator {
    fn allocate(&self, initial: usize, max: usize) -> ByteBuf {
        let tracker = self.detector.track("allocate");
        ByteBuf::allocate(initial, max, Arc::clone(&self.counters), tracker)
    }

    fn composite(&self, max_components: usize) -> CompositeBuf {
        CompositeBuf::new(max_components, Arc::clone(&self.counters))
    }
}
