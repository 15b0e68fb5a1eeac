use crate::alloc::AllocCounters;
use crate::invariants::{
    debug_assert_capacity_bounds, debug_assert_cursor_order, debug_assert_final_release,
};
use crate::leak::LeakTracker;
use crate::BufError;
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// =============================================================================
// OWNERSHIP & ALIASING PROTOCOL
// =============================================================================
//
// A `ByteBuf` is a view (base offset + cursor pair) over shared `Storage`.
// Memory safety is carried by the `Arc<Storage>`; *logical* lifetime is
// carried by the explicit atomic reference count. The two are deliberately
// separate: a handle whose count reached 0 still points at valid memory, but
// every access fails with `IllegalRefCount` so misuse is deterministic rather
// than undefined.
//
// The byte region is accessed through an `UnsafeCell` under these rules:
//
// 1. Reads only touch `[base + reader, base + writer)` of the issuing view.
//    A view's writer never exceeds the storage writer at view creation time.
// 2. Writes only touch `[base + writer, ..)` of the single writable (primary)
//    view. Slices and duplicates are read-only, so appended bytes are never
//    inside any other view's readable window.
// 3. Operations that *move* bytes (compaction) or *reallocate* the region
//    (growth) require the count to be exactly 1, i.e. no aliases exist.
//
// Rule 2 + rule 3 make every concurrently reachable range disjoint from every
// concurrently mutated range, which is what the `unsafe impl Send/Sync` below
// relies on.
//
// =============================================================================

/// Shared backing region for a family of buffer views.
pub(crate) struct Storage {
    /// Explicit reference count. 0 means logically dead.
    refs: CachePadded<AtomicUsize>,
    /// The byte region. `len()` is the current capacity.
    mem: UnsafeCell<Vec<u8>>,
    /// Hard growth limit.
    max_capacity: usize,
    /// Allocator accounting, survives the allocator handle itself.
    counters: Arc<AllocCounters>,
    /// Present when the leak detector sampled this allocation.
    tracker: Option<Arc<LeakTracker>>,
}

// Safety: access to `mem` follows the aliasing protocol above; all other
// fields are atomics or immutable after construction.
unsafe impl Send for Storage {}
unsafe impl Sync for Storage {}

impl Storage {
    /// Frees the byte region. Called exactly once, on the 1 -> 0 transition.
    fn deallocate(&self) {
        // Count is 0: no handle may access the bytes anymore, so taking the
        // vector through the cell is exclusive by protocol.
        let mem = unsafe { &mut *self.mem.get() };
        let freed = mem.capacity();
        *mem = Vec::new();
        self.counters.note_deallocated(freed);
        if let Some(tracker) = &self.tracker {
            tracker.close();
        }
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        // All views are gone. A live count here means the buffer was dropped
        // without an explicit release: report, then let the memory go.
        let refs = self.refs.load(Ordering::Acquire);
        if refs > 0 {
            self.counters.note_reclaimed();
            if let Some(tracker) = &self.tracker {
                tracker.report_unreleased(refs);
            }
        }
    }
}

/// Reference-counted byte buffer with independent read and write cursors.
///
/// Created through a [`BufAllocator`](crate::BufAllocator) with count 1.
/// [`retain`](Self::retain) and [`release`](Self::release) move the count;
/// the backing region is freed on the exact 1 -> 0 transition and every
/// later access fails with [`BufError::IllegalRefCount`].
///
/// Slices and duplicates share the storage and the counter. Compaction and
/// growth demand an exclusive count so aliased readers never observe bytes
/// moving underneath them.
pub struct ByteBuf {
    storage: Arc<Storage>,
    /// Offset of this view into the storage region.
    base: usize,
    /// Read cursor, relative to `base`.
    reader: usize,
    /// Write cursor, relative to `base`.
    writer: usize,
    /// Fixed extent for derived views; `None` for the growable primary.
    view_cap: Option<usize>,
    read_only: bool,
}

impl ByteBuf {
    /// Creates the primary view over a fresh region. Count starts at 1.
    pub(crate) fn allocate(
        initial: usize,
        max: usize,
        counters: Arc<AllocCounters>,
        tracker: Option<Arc<LeakTracker>>,
    ) -> Self {
        let initial = initial.min(max);
        counters.note_allocated(initial);
        Self {
            storage: Arc::new(Storage {
                refs: CachePadded::new(AtomicUsize::new(1)),
                mem: UnsafeCell::new(vec![0u8; initial]),
                max_capacity: max,
                counters,
                tracker,
            }),
            base: 0,
            reader: 0,
            writer: 0,
            view_cap: None,
            read_only: false,
        }
    }

    // ---------------------------------------------------------------------
    // REFERENCE COUNTING
    // ---------------------------------------------------------------------

    /// Returns the current reference count.
    #[inline]
    pub fn ref_count(&self) -> usize {
        self.storage.refs.load(Ordering::Acquire)
    }

    /// Increments the reference count by 1.
    pub fn retain(&self) -> Result<(), BufError> {
        self.retain_n(1)
    }

    /// Increments the reference count by `n`.
    ///
    /// Fails with [`BufError::IllegalRefCount`] if the count is already 0 or
    /// the addition would overflow.
    pub fn retain_n(&self, n: usize) -> Result<(), BufError> {
        let refs = &self.storage.refs;
        let mut cur = refs.load(Ordering::Acquire);
        loop {
            if cur == 0 {
                return Err(BufError::IllegalRefCount { count: 0 });
            }
            let next = cur
                .checked_add(n)
                .ok_or(BufError::IllegalRefCount { count: cur })?;
            match refs.compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    if let Some(tracker) = &self.storage.tracker {
                        tracker.record("retain");
                    }
                    return Ok(());
                }
                Err(observed) => cur = observed,
            }
        }
    }

    /// Decrements the reference count by 1. Returns `true` when this release
    /// freed the storage.
    pub fn release(&self) -> Result<bool, BufError> {
        self.release_n(1)
    }

    /// Decrements the reference count by `n`.
    ///
    /// Fails with [`BufError::IllegalRefCount`] on underflow. The storage is
    /// deallocated exactly once, by the caller that moves the count to 0.
    pub fn release_n(&self, n: usize) -> Result<bool, BufError> {
        let refs = &self.storage.refs;
        let mut cur = refs.load(Ordering::Acquire);
        loop {
            if cur == 0 || cur < n {
                return Err(BufError::IllegalRefCount { count: cur });
            }
            match refs.compare_exchange_weak(cur, cur - n, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    if cur == n {
                        debug_assert_final_release!(cur, n);
                        self.storage.deallocate();
                        return Ok(true);
                    }
                    if let Some(tracker) = &self.storage.tracker {
                        tracker.record("release");
                    }
                    return Ok(false);
                }
                Err(observed) => cur = observed,
            }
        }
    }

    #[inline]
    fn ensure_accessible(&self) -> Result<(), BufError> {
        let count = self.ref_count();
        if count == 0 {
            return Err(BufError::IllegalRefCount { count: 0 });
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // CURSORS & CAPACITY
    // ---------------------------------------------------------------------

    /// Current read cursor.
    #[inline]
    pub fn reader_index(&self) -> usize {
        self.reader
    }

    /// Current write cursor.
    #[inline]
    pub fn writer_index(&self) -> usize {
        self.writer
    }

    /// Bytes available for reading: `writer - reader`.
    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.writer - self.reader
    }

    /// Returns `true` when at least one byte is readable.
    #[inline]
    pub fn is_readable(&self) -> bool {
        self.writer > self.reader
    }

    /// Bytes writable without growing: `capacity - writer`.
    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.capacity() - self.writer
    }

    /// Current capacity of this view.
    #[inline]
    pub fn capacity(&self) -> usize {
        match self.view_cap {
            Some(cap) => cap,
            // Len reads are safe: reallocation requires an exclusive count.
            None => unsafe { (*self.storage.mem.get()).len() },
        }
    }

    /// Hard growth limit of the backing storage.
    #[inline]
    pub fn max_capacity(&self) -> usize {
        self.storage.max_capacity
    }

    /// Returns `true` when writes are rejected on this view.
    #[inline]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Moves the read cursor. Must stay within `0..=writer`.
    pub fn set_reader_index(&mut self, index: usize) -> Result<(), BufError> {
        self.ensure_accessible()?;
        if index > self.writer {
            return Err(BufError::IndexOutOfBounds {
                index,
                start: 0,
                end: self.writer,
            });
        }
        self.reader = index;
        debug_assert_cursor_order!(self.reader, self.writer);
        Ok(())
    }

    /// Moves the write cursor. Must stay within `reader..=capacity`.
    pub fn set_writer_index(&mut self, index: usize) -> Result<(), BufError> {
        self.ensure_accessible()?;
        if self.read_only {
            return Err(BufError::ReadOnly);
        }
        if index < self.reader || index > self.capacity() {
            return Err(BufError::IndexOutOfBounds {
                index,
                start: self.reader,
                end: self.capacity(),
            });
        }
        self.writer = index;
        debug_assert_cursor_order!(self.reader, self.writer);
        Ok(())
    }

    /// Resets both cursors to 0 without touching the bytes.
    pub fn clear(&mut self) {
        self.reader = 0;
        self.writer = 0;
    }

    /// Advances the read cursor by `n`.
    pub fn skip_bytes(&mut self, n: usize) -> Result<(), BufError> {
        self.ensure_accessible()?;
        if n > self.readable_bytes() {
            return Err(BufError::IndexOutOfBounds {
                index: self.reader + n,
                start: self.reader,
                end: self.writer,
            });
        }
        self.reader += n;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // READS
    // ---------------------------------------------------------------------

    /// Borrows the readable region `[reader, writer)`.
    pub fn readable_slice(&self) -> &[u8] {
        // Safety: the readable window is immutable while the count is live;
        // appends land strictly above `writer` (protocol rule 2).
        unsafe {
            let mem = &*self.storage.mem.get();
            std::slice::from_raw_parts(
                mem.as_ptr().add(self.base + self.reader),
                self.writer - self.reader,
            )
        }
    }

    /// Reads the byte at the read cursor and advances it.
    pub fn read_byte(&mut self) -> Result<u8, BufError> {
        let b = self.get_byte(self.reader)?;
        self.reader += 1;
        Ok(b)
    }

    /// Returns the byte at `index` (view-relative) without moving cursors.
    pub fn get_byte(&self, index: usize) -> Result<u8, BufError> {
        self.ensure_accessible()?;
        if index >= self.writer {
            return Err(BufError::IndexOutOfBounds {
                index,
                start: 0,
                end: self.writer,
            });
        }
        // Safety: index < writer, inside the stable readable window.
        let b = unsafe { *(*self.storage.mem.get()).as_ptr().add(self.base + index) };
        Ok(b)
    }

    /// Finds the first occurrence of `byte` at or after `from`, bounded by the
    /// write cursor. Returns the view-relative index.
    pub fn find_first(&self, from: usize, byte: u8) -> Option<usize> {
        if self.ref_count() == 0 {
            return None;
        }
        let start = from.max(self.reader);
        if start >= self.writer {
            return None;
        }
        // Safety: [start, writer) is the stable readable window.
        let window = unsafe {
            let mem = &*self.storage.mem.get();
            std::slice::from_raw_parts(mem.as_ptr().add(self.base + start), self.writer - start)
        };
        window.iter().position(|&b| b == byte).map(|pos| start + pos)
    }

    /// Copies `len` readable bytes into `dst` and advances the read cursor.
    pub fn read_bytes(&mut self, dst: &mut [u8]) -> Result<(), BufError> {
        self.ensure_accessible()?;
        let len = dst.len();
        if len > self.readable_bytes() {
            return Err(BufError::IndexOutOfBounds {
                index: self.reader + len,
                start: self.reader,
                end: self.writer,
            });
        }
        dst.copy_from_slice(&self.readable_slice()[..len]);
        self.reader += len;
        Ok(())
    }

    /// Copies the whole readable region out without moving cursors.
    pub fn copy_to_vec(&self) -> Vec<u8> {
        self.readable_slice().to_vec()
    }

    // ---------------------------------------------------------------------
    // WRITES
    // ---------------------------------------------------------------------

    /// Appends one byte at the write cursor.
    pub fn write_byte(&mut self, byte: u8) -> Result<(), BufError> {
        self.write_bytes(&[byte])
    }

    /// Appends `src` at the write cursor, growing up to max capacity.
    pub fn write_bytes(&mut self, src: &[u8]) -> Result<(), BufError> {
        self.ensure_accessible()?;
        if self.read_only {
            return Err(BufError::ReadOnly);
        }
        self.ensure_writable(src.len())?;
        // Safety: [writer, writer + len) is exclusive to this primary view
        // (protocol rule 2) and inside capacity after ensure_writable.
        unsafe {
            let mem = &mut *self.storage.mem.get();
            let dst = std::slice::from_raw_parts_mut(
                mem.as_mut_ptr().add(self.base + self.writer),
                src.len(),
            );
            dst.copy_from_slice(src);
        }
        self.writer += src.len();
        debug_assert_cursor_order!(self.reader, self.writer);
        debug_assert_capacity_bounds!(self.writer, self.capacity(), self.max_capacity());
        Ok(())
    }

    /// Guarantees room for `n` more bytes, reallocating if permitted.
    ///
    /// Reallocation moves bytes, so it demands an exclusive count; with
    /// aliases present the call fails with [`BufError::AliasedExpand`].
    pub fn ensure_writable(&mut self, n: usize) -> Result<(), BufError> {
        self.ensure_accessible()?;
        if self.read_only {
            return Err(BufError::ReadOnly);
        }
        if self.writer + n <= self.capacity() {
            return Ok(());
        }
        let max = self.storage.max_capacity;
        let needed = self.base + self.writer + n;
        if needed > max {
            return Err(BufError::CapacityExceeded {
                requested: n,
                writer: self.writer,
                max,
            });
        }
        let refs = self.ref_count();
        if refs != 1 {
            return Err(BufError::AliasedExpand { refs });
        }
        let new_cap = needed.next_power_of_two().min(max);
        // Safety: count is exactly 1, no alias can observe the move.
        unsafe {
            (*self.storage.mem.get()).resize(new_cap, 0);
        }
        debug_assert_capacity_bounds!(self.writer, self.capacity(), self.max_capacity());
        Ok(())
    }

    /// Drops already-read bytes by sliding `[reader, writer)` to the front.
    ///
    /// Compacts only when the count is exactly 1; aliased slices index into
    /// the region and must not see bytes move. Returns `true` if compaction
    /// happened.
    pub fn discard_some_read_bytes(&mut self) -> Result<bool, BufError> {
        self.ensure_accessible()?;
        if self.reader == 0 || self.read_only || self.ref_count() != 1 {
            return Ok(false);
        }
        // Safety: exclusive count, no alias observes the move.
        unsafe {
            let mem = &mut *self.storage.mem.get();
            mem.copy_within(self.base + self.reader..self.base + self.writer, self.base);
        }
        self.writer -= self.reader;
        self.reader = 0;
        debug_assert_cursor_order!(self.reader, self.writer);
        Ok(true)
    }

    // ---------------------------------------------------------------------
    // VIEWS
    // ---------------------------------------------------------------------

    /// Read-only view over `[index, index + len)` sharing storage and counter
    /// without incrementing it.
    pub fn slice(&self, index: usize, len: usize) -> Result<ByteBuf, BufError> {
        self.ensure_accessible()?;
        if index + len > self.writer {
            return Err(BufError::IndexOutOfBounds {
                index: index + len,
                start: 0,
                end: self.writer,
            });
        }
        Ok(ByteBuf {
            storage: Arc::clone(&self.storage),
            base: self.base + index,
            reader: 0,
            writer: len,
            view_cap: Some(len),
            read_only: true,
        })
    }

    /// Like [`slice`](Self::slice) but retains the counter first, so releasing
    /// the returned view decrements the original's count.
    pub fn retained_slice(&self, index: usize, len: usize) -> Result<ByteBuf, BufError> {
        self.retain()?;
        match self.slice(index, len) {
            Ok(view) => Ok(view),
            Err(e) => {
                // Roll the retain back; the view never existed.
                let _ = self.release();
                Err(e)
            }
        }
    }

    /// View over the next `len` readable bytes; advances the read cursor.
    pub fn read_slice(&mut self, len: usize) -> Result<ByteBuf, BufError> {
        let view = self.slice(self.reader, len)?;
        self.reader += len;
        Ok(view)
    }

    /// Retained view over the next `len` readable bytes; advances the cursor.
    pub fn read_retained_slice(&mut self, len: usize) -> Result<ByteBuf, BufError> {
        let view = self.retained_slice(self.reader, len)?;
        self.reader += len;
        Ok(view)
    }

    /// Full-range view with independent cursors, sharing the counter without
    /// incrementing it.
    pub fn duplicate(&self) -> Result<ByteBuf, BufError> {
        self.ensure_accessible()?;
        Ok(ByteBuf {
            storage: Arc::clone(&self.storage),
            base: self.base,
            reader: self.reader,
            writer: self.writer,
            view_cap: Some(self.writer),
            read_only: true,
        })
    }

    /// [`duplicate`](Self::duplicate) plus a retain.
    pub fn retained_duplicate(&self) -> Result<ByteBuf, BufError> {
        self.retain()?;
        match self.duplicate() {
            Ok(view) => Ok(view),
            Err(e) => {
                let _ = self.release();
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for ByteBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteBuf")
            .field("reader", &self.reader)
            .field("writer", &self.writer)
            .field("capacity", &self.capacity())
            .field("refs", &self.ref_count())
            .field("read_only", &self.read_only)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::{BufAllocator, BufError, HeapAllocator};

    #[test]
    fn cursor_pair_tracks_reads_and_writes() {
        let alloc = HeapAllocator::unsampled();
        let mut buf = alloc.allocate(16, 64);

        buf.write_bytes(b"hello").unwrap();
        assert_eq!(buf.readable_bytes(), 5);
        assert_eq!(buf.read_byte().unwrap(), b'h');
        assert_eq!(buf.reader_index(), 1);
        assert_eq!(buf.readable_slice(), b"ello");
        buf.release().unwrap();
    }

    #[test]
    fn grows_to_max_capacity_then_fails() {
        let alloc = HeapAllocator::unsampled();
        let mut buf = alloc.allocate(4, 8);

        buf.write_bytes(b"abcdefgh").unwrap();
        assert_eq!(buf.capacity(), 8);
        let err = buf.write_byte(b'x').unwrap_err();
        assert!(matches!(err, BufError::CapacityExceeded { max: 8, .. }));
        buf.release().unwrap();
    }

    #[test]
    fn release_past_zero_fails() {
        let alloc = HeapAllocator::unsampled();
        let buf = alloc.allocate(4, 8);

        assert!(buf.release().unwrap());
        assert_eq!(
            buf.release().unwrap_err(),
            BufError::IllegalRefCount { count: 0 }
        );
        assert_eq!(
            buf.get_byte(0),
            Err(BufError::IllegalRefCount { count: 0 })
        );
    }

    #[test]
    fn retained_slice_shares_the_counter() {
        let alloc = HeapAllocator::unsampled();
        let mut buf = alloc.allocate(16, 64);
        buf.write_bytes(b"abcdef").unwrap();

        let slice = buf.retained_slice(2, 3).unwrap();
        assert_eq!(buf.ref_count(), 2);
        assert_eq!(slice.readable_slice(), b"cde");

        assert!(!slice.release().unwrap());
        assert_eq!(buf.ref_count(), 1);
        assert!(buf.release().unwrap());
    }

    #[test]
    fn compaction_is_refused_under_aliasing() {
        let alloc = HeapAllocator::unsampled();
        let mut buf = alloc.allocate(16, 64);
        buf.write_bytes(b"abcdef").unwrap();
        buf.skip_bytes(3).unwrap();

        let slice = buf.retained_slice(0, 2).unwrap();
        assert!(!buf.discard_some_read_bytes().unwrap());
        slice.release().unwrap();

        assert!(buf.discard_some_read_bytes().unwrap());
        assert_eq!(buf.reader_index(), 0);
        assert_eq!(buf.readable_slice(), b"def");
        buf.release().unwrap();
    }

    #[test]
    fn find_first_respects_the_from_offset() {
        let alloc = HeapAllocator::unsampled();
        let mut buf = alloc.allocate(16, 64);
        buf.write_bytes(b"a\nb\nc").unwrap();

        assert_eq!(buf.find_first(0, b'\n'), Some(1));
        assert_eq!(buf.find_first(2, b'\n'), Some(3));
        assert_eq!(buf.find_first(4, b'\n'), None);
        buf.release().unwrap();
    }
}
