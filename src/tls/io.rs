//! In-memory transport
//!
//! The engine never touches a socket. Ciphertext from the peer is appended to
//! the inbound buffer by the host, and everything the engine emits lands in
//! the outbound buffer until the host drains it.

use bytes::{Buf, Bytes, BytesMut};
use std::io::{self, Read, Write};

/// Inbound/outbound ciphertext buffers for one session
#[derive(Debug, Default)]
pub struct MemoryIo {
    inbound: BytesMut,
    outbound: BytesMut,
}

impl MemoryIo {
    pub fn new() -> Self {
        MemoryIo::default()
    }

    /// Queue ciphertext received from the peer
    pub fn feed(&mut self, data: &[u8]) {
        self.inbound.extend_from_slice(data);
    }

    /// Take all ciphertext queued for the peer
    pub fn drain(&mut self) -> Bytes {
        self.outbound.split().freeze()
    }

    /// Bytes the engine has not consumed yet
    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    /// Bytes waiting to be sent to the peer
    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }
}

impl Read for MemoryIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // An empty memory buffer means "retry later", never end of stream
        if self.inbound.is_empty() {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }

        let n = buf.len().min(self.inbound.len());
        buf[..n].copy_from_slice(&self.inbound[..n]);
        self.inbound.advance(n);
        Ok(n)
    }
}

impl Write for MemoryIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.outbound.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
