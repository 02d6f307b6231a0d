//! Session table
//!
//! The host runtime refers to sessions by opaque handles. The table owns
//! the sessions together with the certificate-context cache and the SNI
//! directory they share, and maps handles back to sessions. A handle the
//! table does not know is reported as a bad argument.

use super::config::{OpenFlags, SessionConfig, TlsError};
use super::context::CertCache;
use super::session::{Plaintext, TlsSession};
use super::sni::SniDirectory;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Opaque session handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(u64);

impl SessionHandle {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tls#{}", self.0)
    }
}

/// Session parameters in the shape the host runtime passes them
///
/// Empty strings mean "not set".
#[derive(Debug, Clone, Default)]
pub struct OpenRequest<'a> {
    pub cert_file: &'a str,
    pub ciphers: &'a str,
    pub protocol_options: &'a str,
    pub dh_file: &'a str,
    pub ca_file: &'a str,
    pub servername: &'a str,
    pub alpn: &'a [u8],
}

/// Handle-addressed registry of sessions
pub struct SessionTable {
    certs: Arc<CertCache>,
    sni: Arc<SniDirectory>,
    sessions: RwLock<HashMap<SessionHandle, Arc<TlsSession>>>,
    next_handle: AtomicU64,
}

impl Default for SessionTable {
    fn default() -> Self {
        SessionTable::new()
    }
}

impl SessionTable {
    pub fn new() -> Self {
        SessionTable::with_registries(Arc::new(CertCache::new()), Arc::new(SniDirectory::new()))
    }

    /// Table sharing an existing cache and SNI directory
    pub fn with_registries(certs: Arc<CertCache>, sni: Arc<SniDirectory>) -> Self {
        SessionTable {
            certs,
            sni,
            sessions: RwLock::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn certs(&self) -> &Arc<CertCache> {
        &self.certs
    }

    pub fn sni(&self) -> &Arc<SniDirectory> {
        &self.sni
    }

    /// Open a session from a built configuration
    pub fn open(&self, config: SessionConfig) -> Result<SessionHandle, TlsError> {
        let session = TlsSession::open(config, &self.certs, &self.sni)?;
        let handle = SessionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.sessions.write().insert(handle, Arc::new(session));
        Ok(handle)
    }

    /// Open a session from host open flags and string parameters
    pub fn open_with_flags(&self, flags: u32, request: &OpenRequest<'_>) -> Result<SessionHandle, TlsError> {
        let flags = OpenFlags::from_bits(flags)?;
        let config = flags
            .builder()
            .cert_file(request.cert_file)
            .ciphers(request.ciphers)
            .protocol_options(request.protocol_options)
            .dh_file(request.dh_file)
            .ca_file(request.ca_file)
            .servername(request.servername)
            .alpn_wire(request.alpn)
            .build()?;
        self.open(config)
    }

    /// Look up a session
    pub fn session(&self, handle: SessionHandle) -> Result<Arc<TlsSession>, TlsError> {
        self.sessions
            .read()
            .get(&handle)
            .cloned()
            .ok_or_else(|| TlsError::BadArgument(format!("unknown session {}", handle)))
    }

    pub fn feed_ciphertext(&self, handle: SessionHandle, data: &[u8]) -> Result<(), TlsError> {
        self.session(handle)?.feed_ciphertext(data)
    }

    pub fn drain_ciphertext(&self, handle: SessionHandle) -> Result<Bytes, TlsError> {
        self.session(handle)?.drain_ciphertext()
    }

    pub fn submit_plaintext(&self, handle: SessionHandle, data: &[u8]) -> Result<(), TlsError> {
        self.session(handle)?.submit_plaintext(data)
    }

    pub fn read_plaintext(&self, handle: SessionHandle, max: usize) -> Result<Plaintext, TlsError> {
        self.session(handle)?.read_plaintext(max)
    }

    pub fn verify_result(&self, handle: SessionHandle) -> Result<i32, TlsError> {
        self.session(handle)?.verify_result()
    }

    pub fn peer_certificate(&self, handle: SessionHandle) -> Result<Vec<u8>, TlsError> {
        self.session(handle)?.peer_certificate()
    }

    /// Invalidate a session; the handle stays known until `close`
    pub fn invalidate(&self, handle: SessionHandle) -> Result<(), TlsError> {
        self.session(handle)?.invalidate();
        Ok(())
    }

    /// Invalidate and forget a session, returning whether it was known
    pub fn close(&self, handle: SessionHandle) -> bool {
        let removed = self.sessions.write().remove(&handle);
        match removed {
            Some(session) => {
                session.invalidate();
                true
            }
            None => false,
        }
    }

    /// Number of open sessions
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn add_mapping(&self, domain: &str, cert_file: &str) {
        self.sni.add(domain, cert_file);
    }

    pub fn remove_mapping(&self, domain: &str) -> bool {
        self.sni.remove(domain)
    }

    pub fn lookup_mapping(&self, domain: &str) -> Option<String> {
        self.sni.lookup(domain)
    }
}
