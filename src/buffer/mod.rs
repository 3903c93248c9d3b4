mod error;
mod text;

pub use error::BufferError;
pub use text::strip_ansi;

use std::borrow::Cow;
use std::io;
use std::num::NonZeroUsize;

/// Fixed-capacity byte ring. Writes never fail; once `capacity` bytes are
/// held, each new byte evicts the oldest one.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    data: Box<[u8]>,
    cursor: usize,
    written: u64,
}

/// Physical arrangement of the live bytes, derived from `(written, cursor)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    /// Never filled: live bytes are `data[..cursor]`.
    Linear,
    /// Filled and the last write ended on the boundary: all of `data` in order.
    Full,
    /// Wrapped with the cursor mid-buffer: `data[cursor..]` then `data[..cursor]`.
    Wrapped,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Result<Self, BufferError> {
        NonZeroUsize::new(capacity)
            .map(Self::with_capacity)
            .ok_or(BufferError::InvalidCapacity(capacity))
    }

    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        Self {
            data: vec![0u8; capacity.get()].into_boxed_slice(),
            cursor: 0,
            written: 0,
        }
    }

    /// Appends `buf`, overwriting the oldest bytes once the ring is full.
    pub fn write(&mut self, buf: &[u8]) {
        self.written = self.written.saturating_add(buf.len() as u64);

        let size = self.data.len();
        // Only the tail of an oversized write can survive.
        let buf = if buf.len() > size {
            &buf[buf.len() - size..]
        } else {
            buf
        };

        let remain = size - self.cursor;
        if buf.len() > remain {
            let (head, tail) = buf.split_at(remain);
            self.data[self.cursor..].copy_from_slice(head);
            self.data[..tail.len()].copy_from_slice(tail);
        } else {
            self.data[self.cursor..self.cursor + buf.len()].copy_from_slice(buf);
        }

        self.cursor = (self.cursor + buf.len()) % size;
    }

    fn layout(&self) -> Layout {
        let size = self.data.len() as u64;
        if self.written < size {
            Layout::Linear
        } else if self.cursor == 0 {
            // Exact fill lands the cursor back on 0; that is a full ring, not an empty one.
            Layout::Full
        } else {
            Layout::Wrapped
        }
    }

    /// Live bytes as `(older, newer)` segments. The second slice is empty
    /// unless the ring has wrapped with the cursor mid-buffer.
    pub fn as_slices(&self) -> (&[u8], &[u8]) {
        match self.layout() {
            Layout::Linear => (&self.data[..self.cursor], &self.data[..0]),
            Layout::Full => (&self.data[..], &self.data[..0]),
            Layout::Wrapped => (&self.data[self.cursor..], &self.data[..self.cursor]),
        }
    }

    /// Live bytes oldest first. Borrows when storage is already in logical
    /// order, allocates only when two segments have to be joined.
    pub fn snapshot(&self) -> Cow<'_, [u8]> {
        match self.as_slices() {
            (older, []) => Cow::Borrowed(older),
            (older, newer) => {
                let mut out = Vec::with_capacity(older.len() + newer.len());
                out.extend_from_slice(older);
                out.extend_from_slice(newer);
                Cow::Owned(out)
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Every byte ever passed to `write`, including evicted ones. Saturates at `u64::MAX`.
    pub fn total_written(&self) -> u64 {
        self.written
    }

    /// Number of live bytes, `min(total_written, capacity)`.
    pub fn len(&self) -> usize {
        match self.layout() {
            Layout::Linear => self.cursor,
            Layout::Full | Layout::Wrapped => self.data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.layout() != Layout::Linear
    }

    /// Bytes written and since overwritten.
    pub fn evicted(&self) -> u64 {
        self.written - self.len() as u64
    }

    /// Forgets all content. Storage is kept and not zeroed.
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.written = 0;
    }
}

impl io::Write for RingBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        RingBuffer::write(self, buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
