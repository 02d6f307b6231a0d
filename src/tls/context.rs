//! Certificate contexts
//!
//! A certificate context is a compiled `SslContext` for one combination of
//! certificate file, cipher list, option bits, DH parameter file and CA file.
//! Compiling one means parsing PEM files and building cipher tables, so the
//! compiled contexts are cached and shared by every session using the same
//! combination. A cached context is recompiled when one of the files it was
//! built from shows a different modification time.
//!
//! Staleness is checked with `stat` only. A file that changes between the
//! check and the compile is not noticed until its mtime changes again.

use super::cert::CertInfo;
use super::config::{SessionConfig, TlsError, DEFAULT_CIPHERS};
use super::handshake;
use openssl::dh::Dh;
use openssl::ssl::{
    SslContext, SslContextBuilder, SslFiletype, SslMethod, SslMode, SslOptions,
    SslSessionCacheMode, SslVerifyMode,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::SystemTime;

/// Identity of a compiled context
///
/// Empty strings mean "not configured".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextKey {
    pub cert_file: String,
    pub ciphers: String,
    pub options: SslOptions,
    pub dh_file: String,
    pub ca_file: String,
}

impl Hash for ContextKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.cert_file.hash(state);
        self.ciphers.hash(state);
        self.options.bits().hash(state);
        self.dh_file.hash(state);
        self.ca_file.hash(state);
    }
}

impl ContextKey {
    /// Key for `cert_file` combined with the rest of a session's settings
    pub fn for_session(config: &SessionConfig, cert_file: &str) -> Self {
        ContextKey {
            cert_file: cert_file.to_string(),
            ciphers: config.ciphers.clone(),
            options: config.options,
            dh_file: config.dh_file.clone(),
            ca_file: config.ca_file.clone(),
        }
    }
}

/// Last observed modification times of a context's files
///
/// `None` is recorded for unconfigured files and for files that could not
/// be stat'ed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchedMtimes {
    pub cert: Option<SystemTime>,
    pub dh: Option<SystemTime>,
    pub ca: Option<SystemTime>,
}

impl WatchedMtimes {
    /// Refresh against the filesystem, returning whether anything changed
    ///
    /// All three files are always re-stat'ed so the recorded times are
    /// current even when the first one already differs.
    fn observe(&mut self, key: &ContextKey) -> bool {
        let cert = observe_file(&key.cert_file, &mut self.cert);
        let dh = observe_file(&key.dh_file, &mut self.dh);
        let ca = observe_file(&key.ca_file, &mut self.ca);
        cert || dh || ca
    }
}

fn observe_file(path: &str, known: &mut Option<SystemTime>) -> bool {
    if path.is_empty() {
        return false;
    }

    match fs::metadata(path).and_then(|meta| meta.modified()) {
        Ok(mtime) if *known == Some(mtime) => false,
        Ok(mtime) => {
            *known = Some(mtime);
            true
        }
        Err(_) => {
            // A missing file always counts as changed
            *known = None;
            true
        }
    }
}

/// Compiled, shareable server configuration
pub struct CertContext {
    key: ContextKey,
    ssl_ctx: SslContext,
    mtimes: WatchedMtimes,
}

impl fmt::Debug for CertContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertContext")
            .field("key", &self.key)
            .field("mtimes", &self.mtimes)
            .finish()
    }
}

impl CertContext {
    /// Compile a context for `key`
    pub fn compile(key: &ContextKey, mtimes: WatchedMtimes) -> Result<Self, TlsError> {
        let mut builder =
            SslContextBuilder::new(SslMethod::tls()).map_err(TlsError::ContextCreate)?;

        // Without a certificate the context serves client sessions, or
        // server sessions that pick one through SNI
        if !key.cert_file.is_empty() {
            builder
                .set_certificate_chain_file(&key.cert_file)
                .map_err(TlsError::CertificateChain)?;
            builder
                .set_private_key_file(&key.cert_file, SslFiletype::PEM)
                .map_err(TlsError::PrivateKey)?;
            builder.check_private_key().map_err(TlsError::KeyMismatch)?;
        }

        handshake::install_servername_callback(&mut builder);

        let ciphers = if key.ciphers.is_empty() {
            DEFAULT_CIPHERS
        } else {
            key.ciphers.as_str()
        };
        builder.set_cipher_list(ciphers).map_err(TlsError::CipherList)?;

        // ECDHE curves are negotiated automatically by the library
        setup_dh(&mut builder, &key.dh_file)?;

        builder.set_options(key.options);
        builder.set_session_cache_mode(SslSessionCacheMode::OFF);
        builder.set_num_tickets(0)?;

        if key.ca_file.is_empty() {
            if let Err(e) = builder.set_default_verify_paths() {
                log::warn!("failed to load default CA paths: {}", e);
            }
        } else if let Err(e) = builder.set_ca_file(&key.ca_file) {
            log::warn!("failed to load CA file {}: {}", key.ca_file, e);
        }

        // Pending writes may be retried from a different address
        builder.set_mode(SslMode::RELEASE_BUFFERS | SslMode::ACCEPT_MOVING_WRITE_BUFFER);

        // Peer certificates are requested but never fail the handshake;
        // the outcome is reported through the verify result
        builder.set_verify_callback(SslVerifyMode::PEER | SslVerifyMode::CLIENT_ONCE, |_, _| true);

        Ok(CertContext {
            key: key.clone(),
            ssl_ctx: builder.build(),
            mtimes,
        })
    }

    pub fn key(&self) -> &ContextKey {
        &self.key
    }

    pub fn ssl_context(&self) -> &SslContext {
        &self.ssl_ctx
    }

    pub fn mtimes(&self) -> WatchedMtimes {
        self.mtimes
    }

    /// Whether the context carries a local certificate
    pub fn has_certificate(&self) -> bool {
        self.ssl_ctx.certificate().is_some()
    }

    /// Subject information of the local certificate
    pub fn cert_info(&self) -> Option<CertInfo> {
        self.ssl_ctx.certificate().map(CertInfo::from_x509_ref)
    }
}

fn setup_dh(builder: &mut SslContextBuilder, dh_file: &str) -> Result<(), TlsError> {
    builder.set_options(SslOptions::SINGLE_DH_USE);

    if dh_file.is_empty() {
        // RFC 5114 1024-bit MODP group with 160-bit prime order subgroup
        let dh = Dh::get_1024_160().map_err(|e| TlsError::DhParams(e.to_string()))?;
        if let Err(e) = builder.set_tmp_dh(&dh) {
            // Refused by the library security level; ECDHE still works
            log::debug!("built-in DH group not installed: {}", e);
        }
        return Ok(());
    }

    let pem = fs::read(dh_file).map_err(|e| TlsError::DhParams(format!("{}: {}", dh_file, e)))?;
    let dh = Dh::params_from_pem(&pem).map_err(|e| TlsError::DhParams(format!("{}: {}", dh_file, e)))?;
    builder
        .set_tmp_dh(&dh)
        .map_err(|e| TlsError::DhParams(format!("{}: {}", dh_file, e)))
}

/// Cache of compiled contexts, one per `ContextKey`
#[derive(Debug, Default)]
pub struct CertCache {
    entries: RwLock<HashMap<ContextKey, Arc<CertContext>>>,
}

impl CertCache {
    pub fn new() -> Self {
        CertCache::default()
    }

    /// Get the compiled context for `key`, compiling it if absent or stale
    ///
    /// A failed compile leaves any previous entry in place.
    pub fn resolve(&self, key: &ContextKey) -> Result<Arc<CertContext>, TlsError> {
        let existing = self.entries.read().get(key).cloned();

        let mut mtimes = existing
            .as_ref()
            .map(|ctx| ctx.mtimes)
            .unwrap_or_default();
        let modified = mtimes.observe(key);

        if let Some(ctx) = existing.as_ref() {
            if !modified {
                log::trace!("certificate context cache hit for {:?}", key.cert_file);
                return Ok(ctx.clone());
            }
        }

        let mut entries = self.entries.write();

        // Another thread may have recompiled while the lock was released
        if let Some(current) = entries.get(key) {
            let replaced = existing
                .as_ref()
                .map_or(true, |old| !Arc::ptr_eq(old, current));
            if replaced && current.mtimes == mtimes {
                return Ok(current.clone());
            }
        }

        log::debug!(
            "compiling certificate context for cert {:?} (dh {:?}, ca {:?})",
            key.cert_file,
            key.dh_file,
            key.ca_file
        );
        let ctx = Arc::new(CertContext::compile(key, mtimes)?);

        // The replaced context stays alive for sessions still holding it
        entries.insert(key.clone(), ctx.clone());
        Ok(ctx)
    }

    /// Cached context for `key` without freshness checks
    pub fn get(&self, key: &ContextKey) -> Option<Arc<CertContext>> {
        self.entries.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop every cached context
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}
