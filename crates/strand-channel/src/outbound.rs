use crate::Msg;
use std::collections::VecDeque;
use strand_core::{Cause, Promise};

struct PendingWrite {
    id: u64,
    msg: Option<Msg>,
    promise: Promise<()>,
    size: usize,
}

/// Per-channel queue of writes awaiting flush and transmission.
///
/// Entries enter unflushed; `mark_all_flushed` moves the watermark and
/// `pop_flushed` hands entries to the transport in order. Only the owning
/// executor mutates the buffer. The `current` identity token and the pending
/// byte count exist for observers such as the idle supervisor: either
/// changing between two checks means the transport is making progress.
#[derive(Default)]
pub struct OutboundBuffer {
    entries: VecDeque<PendingWrite>,
    /// Entries at the front already marked flushed.
    flushed: usize,
    next_id: u64,
    total_pending: usize,
}

impl OutboundBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a write. Returns the entry's identity token.
    pub fn add(&mut self, msg: Msg, size: usize, promise: Promise<()>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.total_pending += size;
        self.entries.push_back(PendingWrite {
            id,
            msg: Some(msg),
            promise,
            size,
        });
        id
    }

    /// Marks every queued entry ready for transmission.
    pub fn mark_all_flushed(&mut self) {
        self.flushed = self.entries.len();
    }

    /// Removes the first flushed entry for transmission.
    pub fn pop_flushed(&mut self) -> Option<(Msg, Promise<()>)> {
        if self.flushed == 0 {
            return None;
        }
        let mut entry = self.entries.pop_front()?;
        self.flushed -= 1;
        self.total_pending -= entry.size;
        let msg = entry.msg.take()?;
        Some((msg, entry.promise))
    }

    /// Identity token of the first pending entry, or `None` when empty.
    pub fn current(&self) -> Option<u64> {
        self.entries.front().map(|e| e.id)
    }

    /// Total bytes queued and not yet handed to the transport.
    pub fn total_pending_bytes(&self) -> usize {
        self.total_pending
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fails every queued entry with `cause` and releases the messages.
    pub fn fail_all(&mut self, cause: &Cause) -> usize {
        let mut failed = 0;
        while let Some(mut entry) = self.entries.pop_front() {
            if let Some(msg) = entry.msg.take() {
                crate::release_msg(msg);
            }
            let _ = entry.promise.try_failure(Cause::clone(cause));
            failed += 1;
        }
        self.flushed = 0;
        self.total_pending = 0;
        failed
    }
}
