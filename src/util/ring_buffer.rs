// src/util/ring_buffer.rs - Growable circular byte buffer
//
// Core features:
// - Geometric growth on overflow, capacity retained across pops
// - FIFO reads of fixed-size records and raw byte runs
// - Random-access peek for walking queued records
// - No internal locking, callers own synchronization

/// Circular byte buffer.
///
/// Bytes are written at the tail and read from the head. The buffer grows by doubling
/// whenever a write does not fit and never shrinks until [`free`](RingBuffer::free).
#[derive(Debug, Default, Clone)]
pub struct RingBuffer {
    data: Vec<u8>,
    start_pos: usize,
    end_pos: usize,
    size: usize,
}

impl RingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let mut buffer = Self::new();
        buffer.reserve(capacity);
        buffer
    }

    /// Number of readable bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Releases the storage and resets the buffer.
    pub fn free(&mut self) {
        self.data = Vec::new();
        self.start_pos = 0;
        self.end_pos = 0;
        self.size = 0;
    }

    /// Drops all readable bytes but keeps the capacity.
    pub fn clear(&mut self) {
        self.start_pos = 0;
        self.end_pos = 0;
        self.size = 0;
    }

    /// Ensures the buffer can hold at least `capacity` bytes without growing.
    ///
    /// Existing content is linearized into the new storage.
    pub fn reserve(&mut self, capacity: usize) {
        if capacity <= self.data.len() {
            return;
        }

        let mut new_data = vec![0u8; capacity];
        if self.size > 0 {
            self.copy_out(0, &mut new_data[..self.size]);
        }

        self.data = new_data;
        self.start_pos = 0;
        self.end_pos = if self.size == capacity { 0 } else { self.size };
    }

    fn ensure_capacity(&mut self, additional: usize) {
        let required = self.size + additional;
        if required <= self.data.len() {
            return;
        }

        let mut new_capacity = self.data.len().max(1);
        while new_capacity < required {
            new_capacity *= 2;
        }
        self.reserve(new_capacity);
    }

    /// Appends bytes at the tail.
    pub fn push_back(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.ensure_capacity(bytes.len());

        let capacity = self.data.len();
        let back_room = capacity - self.end_pos;
        if bytes.len() <= back_room {
            self.data[self.end_pos..self.end_pos + bytes.len()].copy_from_slice(bytes);
        } else {
            let (head, tail) = bytes.split_at(back_room);
            self.data[self.end_pos..].copy_from_slice(head);
            self.data[..tail.len()].copy_from_slice(tail);
        }

        self.end_pos = (self.end_pos + bytes.len()) % capacity;
        self.size += bytes.len();
    }

    /// Appends `len` zero bytes at the tail.
    pub fn push_back_zeroed(&mut self, len: usize) {
        if len == 0 {
            return;
        }
        self.push_back(&vec![0u8; len]);
    }

    /// Copies `out.len()` bytes starting `offset` bytes after the head, without consuming them.
    ///
    /// # Returns
    /// * `false` - Not enough readable bytes, `out` is left untouched
    pub fn peek_at(&self, offset: usize, out: &mut [u8]) -> bool {
        if offset + out.len() > self.size {
            return false;
        }
        self.copy_out(offset, out);
        true
    }

    /// Copies `out.len()` bytes from the head without consuming them.
    pub fn peek_front(&self, out: &mut [u8]) -> bool {
        self.peek_at(0, out)
    }

    /// Copies and consumes `out.len()` bytes from the head.
    pub fn pop_front(&mut self, out: &mut [u8]) -> bool {
        if !self.peek_front(out) {
            return false;
        }
        self.advance(out.len());
        true
    }

    /// Consumes up to `n` bytes from the head and returns them.
    pub fn pop_front_vec(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.size);
        let mut out = vec![0u8; n];
        self.copy_out(0, &mut out);
        self.advance(n);
        out
    }

    /// Discards up to `n` bytes from the head.
    pub fn advance(&mut self, n: usize) {
        let n = n.min(self.size);
        if n == 0 {
            return;
        }
        self.start_pos = (self.start_pos + n) % self.data.len();
        self.size -= n;
        if self.size == 0 {
            self.start_pos = 0;
            self.end_pos = 0;
        }
    }

    fn copy_out(&self, offset: usize, out: &mut [u8]) {
        if out.is_empty() {
            return;
        }
        let capacity = self.data.len();
        let pos = (self.start_pos + offset) % capacity;
        let first = out.len().min(capacity - pos);
        out[..first].copy_from_slice(&self.data[pos..pos + first]);
        if first < out.len() {
            let rest = out.len() - first;
            out[first..].copy_from_slice(&self.data[..rest]);
        }
    }
}
