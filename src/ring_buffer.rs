/// Error returned when an append would not fit.
///
/// Appends are all-or-nothing: on error the buffer is left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PushError {
    /// The data is larger than the whole buffer (message too large).
    #[error("{requested} bytes can never fit a {capacity} byte buffer")]
    TooLarge { requested: usize, capacity: usize },
    /// Not enough free space right now (producer outpacing the drain).
    #[error("{requested} bytes requested but only {available} free")]
    Full { requested: usize, available: usize },
}

/// Bounded byte queue with a read cursor (`head`) and a write cursor
/// (`head + len`, wrapped).
///
/// Not synchronized: sockets keep each buffer behind its own mutex.
/// `filled` and `spare_mut` expose the contiguous regions so the engine can
/// hand them straight to `recv`/`send` without an intermediate copy.
pub struct RingBuffer {
    data: Box<[u8]>,
    head: usize,
    len: usize,
}

impl RingBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes queued and not yet consumed.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Free space left for appends.
    pub fn available(&self) -> usize {
        self.capacity() - self.len
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    fn tail(&self) -> usize {
        let capacity = self.capacity();
        if capacity == 0 {
            0
        } else {
            (self.head + self.len) % capacity
        }
    }

    /// Append all of `src` or nothing.
    ///
    /// # Errors
    /// - `PushError::TooLarge` if `src` exceeds the buffer capacity
    /// - `PushError::Full` if there is not enough free space
    pub fn push(&mut self, src: &[u8]) -> Result<(), PushError> {
        if src.len() > self.capacity() {
            return Err(PushError::TooLarge {
                requested: src.len(),
                capacity: self.capacity(),
            });
        }
        if src.len() > self.available() {
            return Err(PushError::Full {
                requested: src.len(),
                available: self.available(),
            });
        }

        let mut written = 0;
        while written < src.len() {
            let spare = self.spare_mut();
            let n = spare.len().min(src.len() - written);
            spare[..n].copy_from_slice(&src[written..written + n]);
            self.commit(n);
            written += n;
        }
        Ok(())
    }

    /// Copy out and consume up to `dst.len()` bytes. Returns bytes copied.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let n = self.peek(dst);
        self.consume(n);
        n
    }

    /// Copy up to `dst.len()` bytes without consuming them.
    pub fn peek(&self, dst: &mut [u8]) -> usize {
        let want = dst.len().min(self.len);
        let first = self.filled();
        let n1 = first.len().min(want);
        dst[..n1].copy_from_slice(&first[..n1]);
        if n1 < want {
            // Wrapped: the remainder starts at offset 0.
            let n2 = want - n1;
            dst[n1..want].copy_from_slice(&self.data[..n2]);
        }
        want
    }

    /// Contiguous queued bytes starting at the read cursor. May be shorter
    /// than `len()` when the data wraps.
    pub fn filled(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        let end = (self.head + self.len).min(self.capacity());
        &self.data[self.head..end]
    }

    /// Drop `n` bytes from the front.
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.len, "consume past end of ring buffer");
        self.len -= n;
        if self.len == 0 {
            // Rewind so the next fill gets the whole buffer contiguously.
            self.head = 0;
        } else {
            self.head = (self.head + n) % self.capacity();
        }
    }

    /// Contiguous free region starting at the write cursor. Fill it, then
    /// `commit` the number of bytes written.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        if self.len == self.capacity() {
            return &mut [];
        }
        let tail = self.tail();
        let end = if tail >= self.head {
            self.capacity()
        } else {
            self.head
        };
        &mut self.data[tail..end]
    }

    /// Mark `n` bytes of the spare region as filled.
    pub fn commit(&mut self, n: usize) {
        assert!(n <= self.available(), "commit past ring buffer capacity");
        self.len += n;
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("len", &self.len)
            .field("head", &self.head)
            .finish()
    }
}
