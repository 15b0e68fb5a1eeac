use crate::alloc::AllocCounters;
use crate::invariants::debug_assert_component_mapped;
use crate::{BufError, ByteBuf};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// One owned span inside a composite buffer.
struct Component {
    buf: ByteBuf,
    /// Read cursor of `buf` at insertion; reads are relative to it.
    start: usize,
    /// Virtual offset of the first byte within the composite.
    offset: usize,
    len: usize,
}

/// Ordered sequence of buffers exposed through virtual indices.
///
/// Appending a component never copies. The composite carries its own
/// reference count; releasing it to 0 cascades a release into every
/// component. A virtual index maps to exactly one component's local offset.
pub struct CompositeBuf {
    refs: AtomicUsize,
    components: VecDeque<Component>,
    /// Virtual read cursor.
    reader: usize,
    /// Virtual write cursor: sum of component lengths.
    writer: usize,
    max_components: usize,
    counters: Arc<AllocCounters>,
}

impl CompositeBuf {
    pub(crate) fn new(max_components: usize, counters: Arc<AllocCounters>) -> Self {
        Self {
            refs: AtomicUsize::new(1),
            components: VecDeque::new(),
            reader: 0,
            writer: 0,
            max_components,
            counters,
        }
    }

    // ---------------------------------------------------------------------
    // REFERENCE COUNTING
    // ---------------------------------------------------------------------

    /// Current reference count of the composite itself.
    #[inline]
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// Increments the composite's count.
    pub fn retain(&self) -> Result<(), BufError> {
        let mut cur = self.refs.load(Ordering::Acquire);
        loop {
            if cur == 0 {
                return Err(BufError::IllegalRefCount { count: 0 });
            }
            let next = cur
                .checked_add(1)
                .ok_or(BufError::IllegalRefCount { count: cur })?;
            match self
                .refs
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(()),
                Err(observed) => cur = observed,
            }
        }
    }

    /// Decrements the composite's count; at 0 every component is released.
    pub fn release(&mut self) -> Result<bool, BufError> {
        let mut cur = self.refs.load(Ordering::Acquire);
        loop {
            if cur == 0 {
                return Err(BufError::IllegalRefCount { count: 0 });
            }
            match self.refs.compare_exchange_weak(
                cur,
                cur - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if cur == 1 {
                        for component in self.components.drain(..) {
                            component.buf.release()?;
                        }
                        self.reader = 0;
                        self.writer = 0;
                        return Ok(true);
                    }
                    return Ok(false);
                }
                Err(observed) => cur = observed,
            }
        }
    }

    #[inline]
    fn ensure_accessible(&self) -> Result<(), BufError> {
        if self.ref_count() == 0 {
            return Err(BufError::IllegalRefCount { count: 0 });
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // COMPONENTS
    // ---------------------------------------------------------------------

    /// Number of live components.
    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    /// Configured component limit.
    pub fn max_components(&self) -> usize {
        self.max_components
    }

    /// Appends `buf`'s readable bytes as a new component. Zero-copy: the
    /// composite takes ownership of the handle. An unreadable buffer is
    /// released on the spot.
    pub fn add_component(&mut self, buf: ByteBuf) -> Result<(), BufError> {
        self.ensure_accessible()?;
        if self.components.len() >= self.max_components {
            // Ownership transferred regardless: the rejected handle is released.
            buf.release()?;
            return Err(BufError::TooManyComponents {
                max: self.max_components,
            });
        }
        let len = buf.readable_bytes();
        if len == 0 {
            buf.release()?;
            return Ok(());
        }
        let start = buf.reader_index();
        let offset = self.writer;
        self.components.push_back(Component {
            buf,
            start,
            offset,
            len,
        });
        self.writer += len;
        Ok(())
    }

    /// Finds the component covering virtual index `index`.
    fn component_at(&self, index: usize) -> &Component {
        let pos = self
            .components
            .partition_point(|c| c.offset + c.len <= index);
        let component = &self.components[pos];
        debug_assert_component_mapped!(index, component.offset, component.len);
        component
    }

    /// Releases components fully below the read cursor and rebases the
    /// virtual indices.
    pub fn discard_read_components(&mut self) -> Result<(), BufError> {
        self.ensure_accessible()?;
        let mut dropped = 0usize;
        while let Some(first) = self.components.front() {
            if first.offset + first.len > self.reader {
                break;
            }
            dropped += first.len;
            if let Some(component) = self.components.pop_front() {
                component.buf.release()?;
            }
        }
        if dropped > 0 {
            for component in &mut self.components {
                component.offset -= dropped;
            }
            self.reader -= dropped;
            self.writer -= dropped;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // CURSORS & READS
    // ---------------------------------------------------------------------

    /// Virtual read cursor.
    #[inline]
    pub fn reader_index(&self) -> usize {
        self.reader
    }

    /// Virtual write cursor (total accumulated length).
    #[inline]
    pub fn writer_index(&self) -> usize {
        self.writer
    }

    /// Bytes available for reading.
    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.writer - self.reader
    }

    /// Moves the virtual read cursor.
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
        Ok(())
    }

    /// Advances the virtual read cursor by `n`.
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

    /// Returns the byte at virtual index `index`.
    pub fn get_byte(&self, index: usize) -> Result<u8, BufError> {
        self.ensure_accessible()?;
        if index >= self.writer {
            return Err(BufError::IndexOutOfBounds {
                index,
                start: 0,
                end: self.writer,
            });
        }
        let component = self.component_at(index);
        component
            .buf
            .get_byte(component.start + (index - component.offset))
    }

    /// Reads the byte at the read cursor and advances it.
    pub fn read_byte(&mut self) -> Result<u8, BufError> {
        let b = self.get_byte(self.reader)?;
        self.reader += 1;
        Ok(b)
    }

    /// Finds the first `byte` at or after virtual index `from`, crossing
    /// component boundaries transparently.
    pub fn find_first(&self, from: usize, byte: u8) -> Option<usize> {
        if self.ref_count() == 0 {
            return None;
        }
        let start = from.max(self.reader);
        if start >= self.writer {
            return None;
        }
        let first = self
            .components
            .partition_point(|c| c.offset + c.len <= start);
        for component in self.components.iter().skip(first) {
            let local_from = start.saturating_sub(component.offset);
            let window = &component.buf.readable_slice()[local_from..component.len];
            if let Some(pos) = window.iter().position(|&b| b == byte) {
                return Some(component.offset + local_from + pos);
            }
        }
        None
    }

    /// Copies `len` bytes starting at the read cursor into a vector and
    /// advances the cursor.
    pub fn read_vec(&mut self, len: usize) -> Result<Vec<u8>, BufError> {
        self.ensure_accessible()?;
        if len > self.readable_bytes() {
            return Err(BufError::IndexOutOfBounds {
                index: self.reader + len,
                start: self.reader,
                end: self.writer,
            });
        }
        let mut out = Vec::with_capacity(len);
        let mut index = self.reader;
        let end = index + len;
        while index < end {
            let component = self.component_at(index);
            let local = index - component.offset;
            let take = (component.len - local).min(end - index);
            out.extend_from_slice(&component.buf.readable_slice()[local..local + take]);
            index += take;
        }
        self.reader = end;
        Ok(out)
    }

    /// Copies the whole readable region out without moving cursors.
    pub fn copy_to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.readable_bytes());
        let mut index = self.reader;
        while index < self.writer {
            let component = self.component_at(index);
            let local = index - component.offset;
            let take = component.len - local;
            out.extend_from_slice(&component.buf.readable_slice()[local..local + take]);
            index += take;
        }
        out
    }

    /// Allocation accounting shared with the owning allocator.
    pub(crate) fn counters(&self) -> &Arc<AllocCounters> {
        &self.counters
    }
}

impl std::fmt::Debug for CompositeBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeBuf")
            .field("components", &self.components.len())
            .field("reader", &self.reader)
            .field("writer", &self.writer)
            .field("refs", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::{BufAllocator, HeapAllocator};

    fn buf_with(alloc: &HeapAllocator, bytes: &[u8]) -> crate::ByteBuf {
        let mut buf = alloc.allocate(bytes.len().max(1), bytes.len().max(1) * 4);
        buf.write_bytes(bytes).unwrap();
        buf
    }

    #[test]
    fn virtual_indices_span_components() {
        let alloc = HeapAllocator::unsampled();
        let mut composite = alloc.composite(8);
        composite.add_component(buf_with(&alloc, b"abc")).unwrap();
        composite.add_component(buf_with(&alloc, b"def")).unwrap();

        assert_eq!(composite.readable_bytes(), 6);
        assert_eq!(composite.get_byte(0).unwrap(), b'a');
        assert_eq!(composite.get_byte(3).unwrap(), b'd');
        assert_eq!(composite.get_byte(5).unwrap(), b'f');
        composite.release().unwrap();
    }

    #[test]
    fn find_first_crosses_component_boundaries() {
        let alloc = HeapAllocator::unsampled();
        let mut composite = alloc.composite(8);
        composite.add_component(buf_with(&alloc, b"ab")).unwrap();
        composite.add_component(buf_with(&alloc, b"c\nd")).unwrap();

        assert_eq!(composite.find_first(0, b'\n'), Some(3));
        assert_eq!(composite.find_first(4, b'\n'), None);
        composite.release().unwrap();
    }

    #[test]
    fn release_cascades_into_components() {
        let alloc = HeapAllocator::unsampled();
        let mut composite = alloc.composite(8);
        composite.add_component(buf_with(&alloc, b"abc")).unwrap();
        composite.add_component(buf_with(&alloc, b"def")).unwrap();

        assert_eq!(alloc.counters().live(), 2);
        composite.release().unwrap();
        assert_eq!(alloc.counters().live(), 0);
    }

    #[test]
    fn discard_read_components_rebases_offsets() {
        let alloc = HeapAllocator::unsampled();
        let mut composite = alloc.composite(8);
        composite.add_component(buf_with(&alloc, b"abc")).unwrap();
        composite.add_component(buf_with(&alloc, b"def")).unwrap();

        composite.skip_bytes(4).unwrap();
        composite.discard_read_components().unwrap();
        assert_eq!(composite.component_count(), 1);
        assert_eq!(composite.reader_index(), 1);
        assert_eq!(composite.read_byte().unwrap(), b'e');
        composite.release().unwrap();
    }

    #[test]
    fn component_limit_is_enforced() {
        let alloc = HeapAllocator::unsampled();
        let mut composite = alloc.composite(1);
        composite.add_component(buf_with(&alloc, b"abc")).unwrap();
        let err = composite
            .add_component(buf_with(&alloc, b"def"))
            .unwrap_err();
        assert!(matches!(err, crate::BufError::TooManyComponents { max: 1 }));
        composite.release().unwrap();
    }
}
