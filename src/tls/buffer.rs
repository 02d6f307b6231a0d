//! Pending plaintext writes
//!
//! Plaintext submitted while the engine cannot accept it (typically before
//! the handshake has finished) is parked in at most two slots: the primary
//! write that will be retried as-is, and an overflow slot that accumulates
//! everything submitted after it. Overflow is only ever promoted into the
//! primary slot, so bytes reach the engine in submission order.

use super::config::TlsError;

/// Growable byte buffer with geometric (doubling) growth
#[derive(Debug, Default)]
pub struct WriteBuffer {
    data: Vec<u8>,
}

impl WriteBuffer {
    /// Create a buffer sized exactly to `data`
    pub fn from_slice(data: &[u8]) -> Result<Self, TlsError> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(data.len())
            .map_err(|_| TlsError::OutOfMemory)?;
        buf.extend_from_slice(data);
        Ok(WriteBuffer { data: buf })
    }

    /// Append bytes, doubling the capacity until they fit
    pub fn append(&mut self, data: &[u8]) -> Result<(), TlsError> {
        let needed = self.data.len() + data.len();
        if self.data.capacity() < needed {
            let mut capacity = self.data.capacity().max(1);
            while capacity < needed {
                capacity *= 2;
            }
            self.data
                .try_reserve_exact(capacity - self.data.len())
                .map_err(|_| TlsError::OutOfMemory)?;
        }
        self.data.extend_from_slice(data);
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Drop the first `n` bytes
    fn consume(&mut self, n: usize) {
        self.data.drain(..n.min(self.data.len()));
    }
}

/// Two-slot write queue: one in-flight write plus one overflow
#[derive(Debug, Default)]
pub struct PendingWrites {
    primary: Option<WriteBuffer>,
    overflow: Option<WriteBuffer>,
}

impl PendingWrites {
    pub fn new() -> Self {
        PendingWrites::default()
    }

    /// Whether a primary write is waiting for the engine
    pub fn has_pending(&self) -> bool {
        self.primary.is_some()
    }

    /// Park a write the engine refused for now
    pub fn stash(&mut self, data: &[u8]) -> Result<(), TlsError> {
        debug_assert!(self.primary.is_none());
        self.primary = Some(WriteBuffer::from_slice(data)?);
        Ok(())
    }

    /// Queue bytes behind the pending primary write
    pub fn queue_overflow(&mut self, data: &[u8]) -> Result<(), TlsError> {
        match self.overflow.as_mut() {
            Some(overflow) => overflow.append(data),
            None => {
                self.overflow = Some(WriteBuffer::from_slice(data)?);
                Ok(())
            }
        }
    }

    pub fn primary(&self) -> Option<&[u8]> {
        self.primary.as_ref().map(WriteBuffer::as_slice)
    }

    pub fn overflow(&self) -> Option<&[u8]> {
        self.overflow.as_ref().map(WriteBuffer::as_slice)
    }

    /// The engine took `n` bytes of the primary write
    ///
    /// A partial write leaves the unsent tail as the primary, still ahead
    /// of the overflow.
    pub fn advance(&mut self, n: usize) {
        match self.primary.as_mut() {
            Some(primary) if n < primary.len() => {
                primary.consume(n);
                log::trace!("partial pending write, {} bytes left", primary.len());
            }
            Some(_) => self.promote(),
            None => {}
        }
    }

    /// The primary write was delivered; overflow becomes the next primary
    pub fn promote(&mut self) {
        self.primary = self.overflow.take();
        log::trace!(
            "pending write delivered, {} bytes promoted from overflow",
            self.primary.as_ref().map_or(0, WriteBuffer::len)
        );
    }
}
