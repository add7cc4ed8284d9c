//! Outgoing bytes for one connection.
//!
//! A response is appended once and then drained by the sender in as many
//! partial writes as the socket needs. Capacity starts at the configured
//! size and doubles when an append does not fit.

#[derive(Debug, Default)]
pub struct ResponseBytes {
    buf: Vec<u8>,
    sent: usize,
}

impl ResponseBytes {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            sent: 0,
        }
    }

    pub fn append(&mut self, bytes: &[u8]) {
        let needed = self.buf.len() + bytes.len();
        if needed > self.buf.capacity() {
            let mut capacity = self.buf.capacity().max(1);
            while capacity < needed {
                capacity *= 2;
            }
            self.buf.reserve_exact(capacity - self.buf.len());
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes not yet handed to the transport.
    pub fn remaining(&self) -> &[u8] {
        &self.buf[self.sent..]
    }

    pub fn advance(&mut self, n: usize) {
        self.sent = (self.sent + n).min(self.buf.len());
    }

    pub fn is_drained(&self) -> bool {
        self.sent >= self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Total bytes queued, sent or not.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn sent(&self) -> usize {
        self.sent
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Swaps the contents out, leaving an empty buffer behind.
    pub fn take(&mut self) -> Vec<u8> {
        self.sent = 0;
        std::mem::take(&mut self.buf)
    }
}
