//! Handshake hooks
//!
//! The engine calls back into this module while a handshake is running:
//! the servername callback asks the session's `IdentityResolver` whether a
//! different certificate context must be bound before the handshake goes on,
//! and the info callback counts handshakes so renegotiation can be refused.
//!
//! Both callbacks find the session through `SessionHooks`, stored as ex data
//! on the session's `Ssl`.

use super::config::{annotate, Role, SessionConfig};
use super::context::{CertCache, CertContext, ContextKey};
use super::ffi;
use super::sni::SniDirectory;
use foreign_types::ForeignTypeRef;
use libc::c_int;
use openssl::error::ErrorStack;
use openssl::ex_data::Index;
use openssl::ssl::{self, NameType, SniError, Ssl, SslAlert, SslContextBuilder, SslRef, SslVersion};
use openssl_sys::SSL;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

/// Reported when a server session has no certificate and SNI found none
pub const NO_MATCHING_CERTIFICATE: &str =
    "Failed to find a certificate matching the domain in SNI extension";

/// Decision taken for the hostname a client requested
#[derive(Debug)]
pub enum Identity {
    /// Bind this context before continuing the handshake
    Switch(Arc<CertContext>),
    /// The bound context is fine
    Keep,
    /// Abort the handshake with a fatal alert
    Fatal(String),
}

/// Picks the certificate context for a requested hostname
pub trait IdentityResolver: Send + Sync {
    fn resolve_identity(&self, requested: Option<&str>) -> Identity;
}

struct Binding {
    cert_file: String,
    context: Arc<CertContext>,
    sni_error: Option<String>,
}

/// Per-session state shared with the engine callbacks
pub struct SessionHooks {
    config: SessionConfig,
    certs: Arc<CertCache>,
    sni: Arc<SniDirectory>,
    handshakes: AtomicU32,
    binding: Mutex<Binding>,
}

impl SessionHooks {
    pub(crate) fn new(
        config: SessionConfig,
        certs: Arc<CertCache>,
        sni: Arc<SniDirectory>,
        context: Arc<CertContext>,
    ) -> Self {
        SessionHooks {
            binding: Mutex::new(Binding {
                cert_file: config.cert_file.clone(),
                context,
                sni_error: None,
            }),
            config,
            certs,
            sni,
            handshakes: AtomicU32::new(0),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Completed handshakes, plus any started after the first completed
    pub fn handshakes(&self) -> u32 {
        self.handshakes.load(Ordering::Acquire)
    }

    fn note_handshake_start(&self) {
        // Only a handshake started after the first one finished counts
        let _ = self
            .handshakes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n > 0 {
                    Some(n + 1)
                } else {
                    None
                }
            });
    }

    fn note_handshake_done(&self) {
        let _ = self
            .handshakes
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Certificate file of the bound context
    pub fn cert_file(&self) -> String {
        self.binding.lock().cert_file.clone()
    }

    pub fn context(&self) -> Arc<CertContext> {
        self.binding.lock().context.clone()
    }

    /// First SNI failure seen by this session
    pub fn sni_error(&self) -> Option<String> {
        self.binding.lock().sni_error.clone()
    }

    fn record_sni_error(&self, message: String) {
        let mut binding = self.binding.lock();
        if binding.sni_error.is_none() {
            binding.sni_error = Some(message);
        }
    }

    fn bind(&self, context: Arc<CertContext>) {
        let mut binding = self.binding.lock();
        binding.cert_file = context.key().cert_file.clone();
        binding.context = context;
    }
}

impl IdentityResolver for SessionHooks {
    fn resolve_identity(&self, requested: Option<&str>) -> Identity {
        let current = self.cert_file();

        match requested.and_then(|name| self.sni.lookup(name)) {
            Some(file) if file == current => Identity::Keep,
            Some(file) => {
                let key = ContextKey::for_session(&self.config, &file);
                match self.certs.resolve(&key) {
                    Ok(context) => Identity::Switch(context),
                    Err(e) => Identity::Fatal(e.to_string()),
                }
            }
            None if current.is_empty() => Identity::Fatal(NO_MATCHING_CERTIFICATE.to_string()),
            None => Identity::Keep,
        }
    }
}

static HOOKS_INDEX: OnceLock<Index<Ssl, Arc<SessionHooks>>> = OnceLock::new();

/// Ex data slot holding a session's hooks
pub(crate) fn hooks_index() -> Result<Index<Ssl, Arc<SessionHooks>>, ErrorStack> {
    if let Some(index) = HOOKS_INDEX.get() {
        return Ok(*index);
    }
    let index = Ssl::new_ex_index()?;
    Ok(*HOOKS_INDEX.get_or_init(|| index))
}

fn hooks_of(ssl: &SslRef) -> Option<Arc<SessionHooks>> {
    let index = hooks_index().ok()?;
    ssl.ex_data(index).cloned()
}

/// Register the SNI callback on a context being compiled
pub(crate) fn install_servername_callback(builder: &mut SslContextBuilder) {
    builder.set_servername_callback(|ssl: &mut SslRef, _alert: &mut SslAlert| {
        let Some(hooks) = hooks_of(ssl) else {
            return Ok(());
        };
        if hooks.config.role != Role::Accept {
            return Ok(());
        }

        let requested = ssl.servername(NameType::HOST_NAME).map(str::to_string);
        match hooks.resolve_identity(requested.as_deref()) {
            Identity::Keep => Ok(()),
            Identity::Switch(context) => {
                if let Err(e) = ssl.set_ssl_context(context.ssl_context()) {
                    hooks.record_sni_error(annotate("SSL_set_SSL_CTX failed", Some(&e)));
                    return Err(SniError::ALERT_FATAL);
                }
                log::debug!(
                    "SNI {:?} switched session to certificate {:?}",
                    requested,
                    context.key().cert_file
                );
                hooks.bind(context);
                Ok(())
            }
            Identity::Fatal(reason) => {
                log::debug!("SNI {:?} rejected: {}", requested, reason);
                hooks.record_sni_error(reason);
                Err(SniError::ALERT_FATAL)
            }
        }
    });
}

/// Info callback counting handshake starts and completions
pub(crate) unsafe extern "C" fn handshake_info_callback(ssl: *const SSL, where_: c_int, _ret: c_int) {
    let ssl = SslRef::from_ptr(ssl as *mut SSL);
    let Some(hooks) = hooks_of(ssl) else {
        return;
    };

    if where_ & ffi::SSL_CB_HANDSHAKE_START != 0 {
        // TLS 1.3 reports post-handshake messages as handshake starts
        if ssl.version2() != Some(SslVersion::TLS1_3) {
            hooks.note_handshake_start();
        }
    } else if where_ & ffi::SSL_CB_HANDSHAKE_DONE != 0 {
        hooks.note_handshake_done();
    }
}

/// Whether a handshake failure looks like non-TLS traffic
pub(crate) fn is_benign_failure(err: &ssl::Error) -> bool {
    const BENIGN: [c_int; 7] = [
        ffi::SSL_R_DATA_LENGTH_TOO_LONG,
        ffi::SSL_R_PACKET_LENGTH_TOO_LONG,
        ffi::SSL_R_UNKNOWN_PROTOCOL,
        ffi::SSL_R_UNEXPECTED_MESSAGE,
        ffi::SSL_R_WRONG_VERSION_NUMBER,
        ffi::SSL_R_HTTP_REQUEST,
        ffi::SSL_R_HTTPS_PROXY_REQUEST,
    ];

    err.ssl_error()
        .and_then(|stack| stack.errors().first())
        .map(|first| BENIGN.contains(&openssl_sys::ERR_GET_REASON(first.code())))
        .unwrap_or(false)
}
