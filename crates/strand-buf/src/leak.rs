//! Sampled leak detection for reference-counted buffers.
//!
//! A sampled allocation carries a [`LeakTracker`]. Explicit release closes
//! the tracker; storage reclaimed by drop with a live count reports a leak
//! through `tracing`. Reporting is best-effort: it never blocks the dropping
//! thread and tolerates running with no subscriber installed.

use rand::Rng;
use std::collections::{HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

/// How aggressively allocations are tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeakLevel {
    /// No tracking at all.
    Disabled,
    /// One tracker per sampling interval; creation site only.
    Simple,
    /// Sampled like `Simple`, plus access records.
    Advanced,
    /// Every allocation tracked with access records.
    Paranoid,
}

impl LeakLevel {
    /// Reads `STRAND_LEAK_DETECTION` once per process; defaults to `Simple`.
    pub fn from_env() -> Self {
        static LEVEL: OnceLock<LeakLevel> = OnceLock::new();
        *LEVEL.get_or_init(|| {
            match std::env::var("STRAND_LEAK_DETECTION")
                .unwrap_or_default()
                .to_ascii_lowercase()
                .as_str()
            {
                "disabled" | "off" => LeakLevel::Disabled,
                "advanced" => LeakLevel::Advanced,
                "paranoid" => LeakLevel::Paranoid,
                _ => LeakLevel::Simple,
            }
        })
    }

    /// Returns `true` when access records are collected.
    #[inline]
    pub fn records_accesses(&self) -> bool {
        matches!(self, Self::Advanced | Self::Paranoid)
    }
}

/// One recorded touch point of a tracked buffer.
#[derive(Debug, Clone)]
struct Record {
    site: &'static str,
    seq: u64,
}

/// Shared report state: dedup set plus a counter tests can observe.
#[derive(Debug, Default)]
struct ReportSink {
    reported_sets: Mutex<HashSet<u64>>,
    leaks: AtomicU64,
}

impl ReportSink {
    /// Reports once per distinct record set. Uses `try_lock` so a contended
    /// dedup set drops the report rather than stalling the dropping thread.
    fn report(&self, record_hash: u64, message: &str) {
        let fresh = match self.reported_sets.try_lock() {
            Ok(mut seen) => seen.insert(record_hash),
            Err(_) => false,
        };
        if fresh {
            self.leaks.fetch_add(1, Ordering::Relaxed);
            tracing::error!(target: "strand_buf::leak", "{message}");
        }
    }
}

/// Per-resource tracker carrying a bounded list of access records.
pub struct LeakTracker {
    records: Mutex<VecDeque<Record>>,
    seq: AtomicU64,
    dropped_records: AtomicU32,
    closed: AtomicBool,
    record_accesses: bool,
    target_records: usize,
    sink: Arc<ReportSink>,
}

impl LeakTracker {
    fn new(
        site: &'static str,
        record_accesses: bool,
        target_records: usize,
        sink: Arc<ReportSink>,
    ) -> Self {
        let mut records = VecDeque::with_capacity(target_records);
        records.push_back(Record { site, seq: 0 });
        Self {
            records: Mutex::new(records),
            seq: AtomicU64::new(1),
            dropped_records: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            record_accesses,
            target_records,
            sink,
        }
    }

    /// Records an access site. Once the list is at its target, older entries
    /// are dropped with geometric backoff; the newest record is always kept.
    pub fn record(&self, site: &'static str) {
        if !self.record_accesses || self.closed.load(Ordering::Acquire) {
            return;
        }
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let Ok(mut records) = self.records.try_lock() else {
            return;
        };
        if records.len() < self.target_records {
            records.push_back(Record { site, seq });
            return;
        }
        let dropped = self.dropped_records.fetch_add(1, Ordering::Relaxed);
        let backoff = 1u32 << dropped.min(16);
        let mut rng = rand::thread_rng();
        if rng.gen_ratio(1, backoff) && records.len() > 1 {
            // Evict a random older record to make room; the newest slot stays.
            let victim = rng.gen_range(0..records.len() - 1);
            records.remove(victim);
            records.push_back(Record { site, seq });
        } else if let Some(newest) = records.back_mut() {
            *newest = Record { site, seq };
        }
    }

    /// Marks the resource as explicitly released.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Returns `true` once the resource was explicitly released.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Called when the resource is reclaimed with a live reference count.
    pub(crate) fn report_unreleased(&self, refs: usize) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let (hash, trail) = match self.records.try_lock() {
            Ok(records) => {
                let mut hasher = std::collections::hash_map::DefaultHasher::new();
                for record in records.iter() {
                    record.site.hash(&mut hasher);
                }
                let trail: Vec<&'static str> = records.iter().map(|r| r.site).collect();
                (hasher.finish(), trail)
            }
            Err(_) => return,
        };
        self.sink.report(
            hash,
            &format!(
                "buffer reclaimed with {refs} live reference(s) and no explicit release; \
                 recent accesses: {trail:?}"
            ),
        );
    }
}

impl std::fmt::Debug for LeakTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeakTracker")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Samples allocations and reports those reclaimed without release.
pub struct LeakDetector {
    level: LeakLevel,
    sample_interval: u32,
    target_records: usize,
    sample_counter: AtomicU32,
    sink: Arc<ReportSink>,
}

/// One tracker per this many allocations at `Simple`/`Advanced`.
pub const DEFAULT_SAMPLE_INTERVAL: u32 = 128;

/// Bounded access-record list length.
pub const DEFAULT_TARGET_RECORDS: usize = 4;

impl LeakDetector {
    /// Detector with default sampling (1 in 128) and record bounds.
    pub fn new(level: LeakLevel) -> Self {
        Self {
            level,
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            target_records: DEFAULT_TARGET_RECORDS,
            sample_counter: AtomicU32::new(0),
            sink: Arc::new(ReportSink::default()),
        }
    }

    /// Overrides the sampling interval (must be non-zero).
    pub fn with_sample_interval(mut self, interval: u32) -> Self {
        assert!(interval > 0, "sample interval must be non-zero");
        self.sample_interval = interval;
        self
    }

    /// Overrides the access-record bound (must be non-zero).
    pub fn with_target_records(mut self, target: usize) -> Self {
        assert!(target > 0, "target records must be non-zero");
        self.target_records = target;
        self
    }

    /// The configured level.
    pub fn level(&self) -> LeakLevel {
        self.level
    }

    /// Hands out a tracker for a new resource, or `None` when this
    /// allocation is not sampled.
    pub fn track(&self, site: &'static str) -> Option<Arc<LeakTracker>> {
        let sampled = match self.level {
            LeakLevel::Disabled => false,
            LeakLevel::Paranoid => true,
            LeakLevel::Simple | LeakLevel::Advanced => {
                self.sample_counter.fetch_add(1, Ordering::Relaxed) % self.sample_interval == 0
            }
        };
        if !sampled {
            return None;
        }
        Some(Arc::new(LeakTracker::new(
            site,
            self.level.records_accesses(),
            self.target_records,
            Arc::clone(&self.sink),
        )))
    }

    /// Leaks reported so far (post-dedup).
    pub fn reported_leaks(&self) -> u64 {
        self.sink.leaks.load(Ordering::Relaxed)
    }
}
