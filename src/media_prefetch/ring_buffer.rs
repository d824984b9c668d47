// src/media_prefetch/ring_buffer.rs - Fixed capacity byte ring with wraparound cursors
//
// The ring does not own its cursors: the writer keeps its write position in the
// worker state and the reader keeps the read head in the shared state. Each
// side passes the other side's frontier in as a bound.

use super::prefetch_fatal;

pub struct RingBuffer {
    data: Box<[u8]>,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be > 0");
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Whether `bytes` can be written at `write_pos` without reaching `read_head`.
    ///
    /// The writer may never catch up to the reader: `write_pos == read_head`
    /// means "empty", so a completely full ring would be indistinguishable from
    /// an empty one.
    pub fn can_write(&self, write_pos: usize, read_head: usize, bytes: usize) -> bool {
        let capacity = self.capacity();
        if bytes >= capacity {
            return false;
        }

        let new_write_pos = (write_pos + bytes) % capacity;

        // If we wrapped around the buffer, we must have crossed the read head
        // exactly once, otherwise never.
        let does_wrap = new_write_pos < write_pos;
        let does_catch_up_read_head = (write_pos < read_head) != (new_write_pos < read_head);

        does_catch_up_read_head == does_wrap
    }

    /// Whether `bytes` can be read at `read_pos` without passing `read_tail`.
    ///
    /// Unlike writing, reading may end exactly at the tail.
    pub fn can_read(&self, read_pos: usize, read_tail: usize, bytes: usize) -> bool {
        let capacity = self.capacity();
        if bytes >= capacity {
            return false;
        }

        let new_read_pos = (read_pos + bytes) % capacity;
        let does_wrap = new_read_pos < read_pos;
        let does_cross_tail = (read_pos <= read_tail) != (new_read_pos <= read_tail);

        does_cross_tail == does_wrap
    }

    /// Copies `data` in at `write_pos` and advances it. Violating the space
    /// check is a logic error and aborts.
    pub fn write(&mut self, write_pos: &mut usize, read_head: usize, data: &[u8]) {
        if !self.can_write(*write_pos, read_head, data.len()) {
            prefetch_fatal("ring buffer write overrun");
        }

        let pos = *write_pos;
        let nonwrapped = data.len().min(self.capacity() - pos);
        self.data[pos..pos + nonwrapped].copy_from_slice(&data[..nonwrapped]);
        self.data[..data.len() - nonwrapped].copy_from_slice(&data[nonwrapped..]);

        *write_pos = (pos + data.len()) % self.capacity();
    }

    /// Copies `out.len()` bytes from `read_pos` and advances it.
    pub fn read(&self, read_pos: &mut usize, read_tail: usize, out: &mut [u8]) {
        if !self.can_read(*read_pos, read_tail, out.len()) {
            prefetch_fatal("ring buffer read overrun");
        }

        let pos = *read_pos;
        let bytes = out.len();
        let nonwrapped = bytes.min(self.capacity() - pos);
        out[..nonwrapped].copy_from_slice(&self.data[pos..pos + nonwrapped]);
        out[nonwrapped..].copy_from_slice(&self.data[..bytes - nonwrapped]);

        *read_pos = (pos + bytes) % self.capacity();
    }

    /// Number of bytes between `read_head` and `read_tail`.
    pub fn occupied(capacity: usize, read_head: usize, read_tail: usize) -> usize {
        (read_tail + capacity - read_head) % capacity
    }

    #[cfg(test)]
    pub(crate) fn bytes(&self) -> &[u8] {
        &self.data
    }
}
