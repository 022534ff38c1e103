/// Default chunk size: the payload of a default-MTU ATT write.
pub const DEFAULT_CHUNK_SIZE: usize = 20;

/// Splits payloads into fixed-size chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteFramer {
    chunk_size: usize,
}

impl ByteFramer {
    /// Creates a framer. A zero chunk size is treated as one.
    #[must_use]
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    /// Returns the chunk size.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Returns how many chunks a payload of `len` bytes needs.
    #[must_use]
    pub fn chunk_count(&self, len: usize) -> usize {
        len.div_ceil(self.chunk_size)
    }

    /// Splits `payload` into owned chunks, preserving order.
    ///
    /// ```
    /// let chunks = gattlink::ByteFramer::new(4).split(b"abcdefghij");
    /// assert_eq!(vec![b"abcd".to_vec(), b"efgh".to_vec(), b"ij".to_vec()], chunks);
    /// ```
    #[must_use]
    pub fn split(&self, payload: &[u8]) -> Vec<Vec<u8>> {
        payload.chunks(self.chunk_size).map(<[u8]>::to_vec).collect()
    }
}

impl Default for ByteFramer {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

/// A payload being delivered one chunk at a time.
///
/// Tracks which chunk is current; a chunk only advances once acknowledged.
#[derive(Debug, Clone)]
pub struct ChunkedPayload<'a> {
    payload: &'a [u8],
    framer: ByteFramer,
    index: usize,
}

impl<'a> ChunkedPayload<'a> {
    /// Wraps `payload` for delivery in chunks of `chunk_size` bytes.
    #[must_use]
    pub fn new(payload: &'a [u8], chunk_size: usize) -> Self {
        Self {
            payload,
            framer: ByteFramer::new(chunk_size),
            index: 0,
        }
    }

    /// Returns the chunk awaiting delivery, or `None` once all are acknowledged.
    #[must_use]
    pub fn current(&self) -> Option<&'a [u8]> {
        let start = self.index.checked_mul(self.framer.chunk_size())?;
        if start >= self.payload.len() {
            return None;
        }
        let end = (start + self.framer.chunk_size()).min(self.payload.len());
        self.payload.get(start..end)
    }

    /// Marks the current chunk delivered and moves on.
    pub fn acknowledge(&mut self) {
        if self.current().is_some() {
            self.index += 1;
        }
    }

    /// Zero-based index of the current chunk.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Total number of chunks.
    #[must_use]
    pub fn total(&self) -> usize {
        self.framer.chunk_count(self.payload.len())
    }

    /// Bytes covered by acknowledged chunks.
    #[must_use]
    pub fn bytes_acknowledged(&self) -> usize {
        (self.index * self.framer.chunk_size()).min(self.payload.len())
    }

    /// Returns whether every chunk has been acknowledged.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.current().is_none()
    }
}
