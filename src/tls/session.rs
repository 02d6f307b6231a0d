//! TLS sessions driven through memory buffers
//!
//! A `TlsSession` never touches a socket. The host feeds it ciphertext that
//! arrived from the peer, drains the ciphertext it produced, submits
//! plaintext to encrypt, and reads decrypted plaintext. The handshake runs
//! whenever the session is read from.
//!
//! Plaintext submitted before the engine can encrypt it is kept in a
//! primary buffer plus one overflow buffer and written out in submission
//! order once the handshake completes.
//!
//! Every operation serializes on the session mutex. `invalidate` takes the
//! same mutex, so once it returns no operation on the session is running
//! and every later one fails with `TlsError::Closed`.

use super::buffer::PendingWrites;
use super::config::{annotate, Role, SessionConfig, TlsError};
use super::context::{CertCache, CertContext, ContextKey};
use super::ffi;
use super::handshake::{self, hooks_index, SessionHooks};
use super::io::MemoryIo;
use super::sni::SniDirectory;
use bytes::Bytes;
use foreign_types::{ForeignType, ForeignTypeRef};
use openssl::ssl::{ErrorCode, Ssl, SslOptions, SslStream, SslVerifyMode};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// Initial plaintext read chunk; the read buffer doubles when less than
/// this much room is left
const READ_CHUNK: usize = 1024;

/// Result of `TlsSession::read_plaintext`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plaintext {
    /// Decrypted application data
    pub data: Bytes,
    /// The engine produced ciphertext the host should drain and send
    pub more_pending: bool,
}

struct SessionState {
    valid: bool,
    stream: SslStream<MemoryIo>,
    pending: PendingWrites,
}

/// One TLS connection, server or client side
pub struct TlsSession {
    role: Role,
    hooks: Arc<SessionHooks>,
    state: Mutex<SessionState>,
}

impl TlsSession {
    /// Create a session bound to the cached context for its configuration
    pub fn open(
        config: SessionConfig,
        certs: &Arc<CertCache>,
        sni: &Arc<SniDirectory>,
    ) -> Result<Self, TlsError> {
        let key = ContextKey::for_session(&config, &config.cert_file);
        let context = certs.resolve(&key)?;

        let mut ssl = Ssl::new(context.ssl_context()).map_err(TlsError::SessionCreate)?;
        // The context carries only the caller's options; the role-forced
        // flags are per session so both roles can share one context
        let options = config.effective_options();
        // SAFETY: the pointer comes from a live `Ssl` owned by this frame
        unsafe {
            ffi::SSL_set_options(ssl.as_ptr(), options.bits() as ffi::SslOptionBits);
        }
        if config.verify_none {
            ssl.set_verify(SslVerifyMode::NONE);
        }

        let role = config.role;
        let hooks = Arc::new(SessionHooks::new(
            config,
            certs.clone(),
            sni.clone(),
            context,
        ));
        ssl.set_ex_data(hooks_index()?, hooks.clone());
        // SAFETY: the pointer comes from a live `Ssl`, and the callback only
        // reads the hooks stored on it
        unsafe {
            ffi::SSL_set_info_callback(ssl.as_ptr(), Some(handshake::handshake_info_callback));
        }

        match role {
            Role::Accept => ssl.set_accept_state(),
            Role::Connect => {
                let config = hooks.config();
                if let Some(servername) = config.servername() {
                    ssl.set_hostname(servername)?;
                }
                if let Some(alpn) = config.alpn() {
                    ssl.set_alpn_protos(alpn)?;
                }
                ssl.set_connect_state();
            }
        }

        let stream = SslStream::new(ssl, MemoryIo::new()).map_err(TlsError::SessionCreate)?;
        log::debug!(
            "opened {} session with certificate {:?}",
            role.as_str(),
            hooks.config().cert_file()
        );

        Ok(TlsSession {
            role,
            hooks,
            state: Mutex::new(SessionState {
                valid: true,
                stream,
                pending: PendingWrites::new(),
            }),
        })
    }

    fn lock_valid(&self) -> Result<MutexGuard<'_, SessionState>, TlsError> {
        let state = self.state.lock();
        if !state.valid {
            return Err(TlsError::Closed);
        }
        Ok(state)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn config(&self) -> &SessionConfig {
        self.hooks.config()
    }

    /// Whether `invalidate` has not been called yet
    pub fn is_valid(&self) -> bool {
        self.state.lock().valid
    }

    /// Whether the initial handshake has completed
    pub fn is_established(&self) -> bool {
        self.state.lock().stream.ssl().is_init_finished()
    }

    /// Handshakes seen so far; more than one means renegotiation
    pub fn handshakes(&self) -> u32 {
        self.hooks.handshakes()
    }

    /// Certificate file of the context currently bound to the session
    pub fn cert_file(&self) -> String {
        self.hooks.cert_file()
    }

    /// Context currently bound to the session
    pub fn current_context(&self) -> Arc<CertContext> {
        self.hooks.context()
    }

    /// Options the engine is running this session with
    pub fn options(&self) -> SslOptions {
        let state = self.state.lock();
        // SAFETY: the pointer comes from the `Ssl` owned by the locked state
        let raw = unsafe { ffi::SSL_get_options(state.stream.ssl().as_ptr()) };
        SslOptions::from_bits_truncate(raw as _)
    }

    /// Append ciphertext received from the peer
    pub fn feed_ciphertext(&self, data: &[u8]) -> Result<(), TlsError> {
        let mut state = self.lock_valid()?;
        state.stream.get_mut().feed(data);
        Ok(())
    }

    /// Take all ciphertext the engine has produced so far
    pub fn drain_ciphertext(&self) -> Result<Bytes, TlsError> {
        let mut state = self.lock_valid()?;
        Ok(state.stream.get_mut().drain())
    }

    /// Encrypt `data`, or queue it until the engine can
    pub fn submit_plaintext(&self, data: &[u8]) -> Result<(), TlsError> {
        let mut guard = self.lock_valid()?;
        let state = &mut *guard;

        if data.is_empty() {
            return Ok(());
        }
        if state.pending.has_pending() {
            return state.pending.queue_overflow(data);
        }

        match state.stream.ssl_write(data) {
            Ok(n) if n < data.len() => {
                log::trace!("short write, {} of {} bytes queued", data.len() - n, data.len());
                state.pending.stash(&data[n..])
            }
            Ok(_) => Ok(()),
            Err(e) if matches!(e.code(), ErrorCode::WANT_READ | ErrorCode::WANT_WRITE) => {
                log::trace!("{} bytes queued until the engine can write", data.len());
                state.pending.stash(data)
            }
            Err(e) => Err(TlsError::Write(annotate("SSL_write failed", e.ssl_error()))),
        }
    }

    /// Advance the handshake and return decrypted plaintext
    ///
    /// At most `max` bytes are returned; `0` means no limit. While the
    /// handshake is in progress the data is empty and `more_pending` is set.
    pub fn read_plaintext(&self, max: usize) -> Result<Plaintext, TlsError> {
        let mut guard = self.lock_valid()?;
        let state = &mut *guard;

        if self.hooks.handshakes() > 1 {
            return Err(TlsError::Renegotiation);
        }

        let mut more_pending = false;
        if !state.stream.ssl().is_init_finished() {
            more_pending = true;
            // Stale queue entries would be read as this handshake's failure
            // SAFETY: clears only this thread's error queue
            unsafe { openssl_sys::ERR_clear_error() };
            if let Err(e) = state.stream.do_handshake() {
                if e.code() != ErrorCode::WANT_READ {
                    return Err(self.handshake_failure(&e));
                }
            }
        }

        if !state.stream.ssl().is_init_finished() {
            return Ok(Plaintext {
                data: Bytes::new(),
                more_pending: true,
            });
        }

        // Primary first, then whatever overflowed while it was pending. A
        // short write leaves its tail as the primary for the next read.
        for _ in 0..2 {
            let Some(data) = state.pending.primary() else {
                break;
            };
            let written = match state.stream.ssl_write(data) {
                Ok(n) => n,
                Err(e) => return Err(TlsError::Write(annotate("SSL_write failed", e.ssl_error()))),
            };
            more_pending = true;
            let complete = written == data.len();
            state.pending.advance(written);
            if !complete {
                break;
            }
        }

        let data = read_available(&mut state.stream, max)?;

        if self.hooks.handshakes() > 1 {
            return Err(TlsError::Renegotiation);
        }

        Ok(Plaintext { data, more_pending })
    }

    fn handshake_failure(&self, err: &openssl::ssl::Error) -> TlsError {
        if handshake::is_benign_failure(err) {
            log::debug!("peer is not speaking TLS: {}", err);
            return TlsError::Closed;
        }
        if let Some(reason) = self.hooks.sni_error() {
            return TlsError::HandshakeFailed(annotate(&reason, err.ssl_error()));
        }
        TlsError::HandshakeFailed(annotate("SSL_do_handshake failed", err.ssl_error()))
    }

    /// Peer certificate verification outcome, `0` meaning success
    pub fn verify_result(&self) -> Result<i32, TlsError> {
        let state = self.lock_valid()?;
        Ok(state.stream.ssl().verify_result().as_raw())
    }

    /// DER encoding of the certificate the peer presented
    pub fn peer_certificate(&self) -> Result<Vec<u8>, TlsError> {
        let state = self.lock_valid()?;
        let cert = state.stream.ssl().peer_certificate().ok_or(TlsError::NotFound)?;
        Ok(cert.to_der()?)
    }

    /// Mark the session unusable
    ///
    /// Waits for any in-flight operation to finish. Calling it again is a
    /// no-op. Resources are released when the last reference is dropped.
    pub fn invalidate(&self) {
        let mut state = self.state.lock();
        if state.valid {
            log::debug!("{} session invalidated", self.role.as_str());
            state.valid = false;
        }
    }

    #[cfg(test)]
    fn ssl_ptr(&self) -> *mut openssl_sys::SSL {
        self.state.lock().stream.ssl().as_ptr()
    }
}

/// Read decrypted records until the engine has nothing more or `max` is hit
fn read_available(stream: &mut SslStream<MemoryIo>, max: usize) -> Result<Bytes, TlsError> {
    let mut size = READ_CHUNK;
    let mut buf = Vec::new();
    buf.try_reserve_exact(size)
        .map_err(|_| TlsError::OutOfMemory)?;
    buf.resize(size, 0);

    let mut len = 0;
    while max == 0 || len < max {
        let limit = if max == 0 || max >= size { size } else { max };
        match stream.ssl_read(&mut buf[len..limit]) {
            Ok(0) => break,
            Ok(n) => {
                len += n;
                if size - len < READ_CHUNK {
                    size *= 2;
                    buf.try_reserve_exact(size - buf.len())
                        .map_err(|_| TlsError::OutOfMemory)?;
                    buf.resize(size, 0);
                }
            }
            Err(e) => {
                match e.code() {
                    ErrorCode::WANT_READ => {}
                    ErrorCode::ZERO_RETURN => log::debug!("peer sent close_notify"),
                    _ => log::debug!("SSL_read stopped: {}", e),
                }
                break;
            }
        }
    }

    buf.truncate(len);
    Ok(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::testutil::{pump, write_cert};
    use std::thread;
    use tempfile::TempDir;

    struct Pair {
        _dir: TempDir,
        client: TlsSession,
        server: TlsSession,
    }

    fn pair(options: &str) -> Pair {
        let dir = TempDir::new().unwrap();
        let cert = write_cert(dir.path(), "server.pem", "server.test");
        let certs = Arc::new(CertCache::new());
        let sni = Arc::new(SniDirectory::new());

        let server = SessionConfig::accept()
            .cert_file(cert)
            .protocol_options(options)
            .build()
            .unwrap();
        let client = SessionConfig::connect()
            .servername("server.test")
            .protocol_options(options)
            .build()
            .unwrap();

        Pair {
            client: TlsSession::open(client, &certs, &sni).unwrap(),
            server: TlsSession::open(server, &certs, &sni).unwrap(),
            _dir: dir,
        }
    }

    #[test]
    fn test_handshake_and_exchange() {
        let pair = pair("");
        pump(&pair.client, &pair.server);

        assert!(pair.client.is_established());
        assert!(pair.server.is_established());
        assert_eq!(pair.server.handshakes(), 1);

        pair.client.submit_plaintext(b"ping").unwrap();
        let (_, server_plain) = pump(&pair.client, &pair.server);
        assert_eq!(server_plain, b"ping");

        pair.server.submit_plaintext(b"pong").unwrap();
        let (client_plain, _) = pump(&pair.client, &pair.server);
        assert_eq!(client_plain, b"pong");
    }

    #[test]
    fn test_read_reports_handshake_progress() {
        let pair = pair("");

        let first = pair.client.read_plaintext(0).unwrap();
        assert!(first.data.is_empty());
        assert!(first.more_pending);
        assert!(!pair.client.drain_ciphertext().unwrap().is_empty());

        // Nothing fed yet, so the server has nothing to say
        let idle = pair.server.read_plaintext(0).unwrap();
        assert!(idle.more_pending);
        assert!(pair.server.drain_ciphertext().unwrap().is_empty());
    }

    #[test]
    fn test_writes_before_handshake_keep_order() {
        let pair = pair("");

        pair.server.submit_plaintext(b"one,").unwrap();
        pair.server.submit_plaintext(b"two,").unwrap();
        pair.server.submit_plaintext(b"three").unwrap();
        pair.server.submit_plaintext(b"").unwrap();

        let (client_plain, _) = pump(&pair.client, &pair.server);
        assert_eq!(client_plain, b"one,two,three");
    }

    #[test]
    fn test_roles_share_one_context() {
        let dir = TempDir::new().unwrap();
        let cert = write_cert(dir.path(), "shared.pem", "shared.test");
        let certs = Arc::new(CertCache::new());
        let sni = Arc::new(SniDirectory::new());

        let accept = SessionConfig::accept()
            .cert_file(cert.clone())
            .protocol_options("no_tlsv1")
            .build()
            .unwrap();
        let connect = SessionConfig::connect()
            .cert_file(cert)
            .protocol_options("no_tlsv1")
            .compression_none(true)
            .build()
            .unwrap();
        let accept = TlsSession::open(accept, &certs, &sni).unwrap();
        let connect = TlsSession::open(connect, &certs, &sni).unwrap();

        assert!(Arc::ptr_eq(&accept.current_context(), &connect.current_context()));
        assert_eq!(certs.len(), 1);

        assert!(accept
            .options()
            .contains(SslOptions::NO_TLSV1 | SslOptions::NO_TICKET | SslOptions::ALL));
        assert!(connect
            .options()
            .contains(SslOptions::NO_TLSV1 | SslOptions::NO_TICKET | SslOptions::NO_COMPRESSION));
        // Forced flags stay on the session, not the shared context
        let context = connect.current_context();
        // SAFETY: the context is kept alive by `context`
        let raw = unsafe { openssl_sys::SSL_CTX_get_options(context.ssl_context().as_ptr()) };
        let context_options = SslOptions::from_bits_truncate(raw as _);
        assert!(context_options.contains(SslOptions::NO_TLSV1));
        assert!(!context_options.contains(SslOptions::NO_TICKET));
    }

    #[test]
    fn test_read_limit() {
        let pair = pair("");
        pump(&pair.client, &pair.server);

        let payload = vec![b'x'; 5000];
        pair.client.submit_plaintext(&payload).unwrap();
        let wire = pair.client.drain_ciphertext().unwrap();
        pair.server.feed_ciphertext(&wire).unwrap();

        let first = pair.server.read_plaintext(100).unwrap();
        assert_eq!(first.data.len(), 100);
        assert!(!first.more_pending);

        let rest = pair.server.read_plaintext(0).unwrap();
        assert_eq!(rest.data.len(), 4900);
    }

    #[test]
    fn test_large_read_grows_buffer() {
        let pair = pair("");
        pump(&pair.client, &pair.server);

        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        pair.client.submit_plaintext(&payload).unwrap();
        let (_, server_plain) = pump(&pair.client, &pair.server);
        assert_eq!(server_plain, payload);
    }

    #[test]
    fn test_renegotiation_is_refused() {
        let pair = pair("no_tlsv1_3");
        pair.client.submit_plaintext(b"before").unwrap();
        let (_, server_plain) = pump(&pair.client, &pair.server);
        assert_eq!(server_plain, b"before");

        // SAFETY: the session outlives the call and no operation is running
        let started = unsafe { ffi::SSL_renegotiate(pair.server.ssl_ptr()) };
        assert_eq!(started, 1);

        let server_result = pair.server.read_plaintext(0);
        let wire = pair.server.drain_ciphertext().unwrap();
        pair.client.feed_ciphertext(&wire).unwrap();
        let client_result = pair.client.read_plaintext(0);

        assert!(matches!(server_result, Err(TlsError::Renegotiation)));
        assert!(matches!(client_result, Err(TlsError::Renegotiation)));
        assert!(pair.client.handshakes() > 1);

        // Stays refused
        assert!(matches!(pair.client.read_plaintext(0), Err(TlsError::Renegotiation)));
        assert!(matches!(pair.server.read_plaintext(0), Err(TlsError::Renegotiation)));
    }

    #[test]
    fn test_invalidate_closes_every_operation() {
        let pair = pair("");
        pump(&pair.client, &pair.server);

        pair.server.invalidate();
        pair.server.invalidate();
        assert!(!pair.server.is_valid());

        assert!(pair.server.feed_ciphertext(b"x").unwrap_err().is_closed());
        assert!(pair.server.drain_ciphertext().unwrap_err().is_closed());
        assert!(pair.server.submit_plaintext(b"x").unwrap_err().is_closed());
        assert!(pair.server.read_plaintext(0).unwrap_err().is_closed());
        assert!(pair.server.verify_result().unwrap_err().is_closed());
        assert!(pair.server.peer_certificate().unwrap_err().is_closed());
    }

    #[test]
    fn test_invalidate_during_traffic() {
        let pair = pair("");
        pump(&pair.client, &pair.server);
        let server = Arc::new(pair.server);

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let server = server.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        for result in [
                            server.submit_plaintext(b"data").map(|_| ()),
                            server.read_plaintext(0).map(|_| ()),
                            server.drain_ciphertext().map(|_| ()),
                        ] {
                            if let Err(e) = result {
                                assert!(e.is_closed(), "unexpected error {}", e);
                            }
                        }
                    }
                })
            })
            .collect();

        server.invalidate();
        for worker in workers {
            worker.join().unwrap();
        }
        assert!(server.read_plaintext(0).unwrap_err().is_closed());
    }

    #[test]
    fn test_garbage_before_handshake_is_a_close() {
        let pair = pair("");
        pair.server
            .feed_ciphertext(b"GET / HTTP/1.1\r\nHost: server.test\r\n\r\n")
            .unwrap();

        let err = pair.server.read_plaintext(0).unwrap_err();
        assert!(err.is_closed(), "unexpected error {}", err);
        // The session itself was not invalidated
        assert!(pair.server.is_valid());
    }

    #[test]
    fn test_peer_certificate() {
        let pair = pair("");
        assert!(matches!(pair.client.peer_certificate(), Err(TlsError::NotFound)));

        pump(&pair.client, &pair.server);

        let der = pair.client.peer_certificate().unwrap();
        let info = crate::tls::CertInfo::from_der(&der).unwrap();
        assert_eq!(info.subject, "server.test");

        // Self-signed and no CA configured
        assert_ne!(pair.client.verify_result().unwrap(), 0);
        // The client offered no certificate
        assert!(matches!(pair.server.peer_certificate(), Err(TlsError::NotFound)));
    }
}
