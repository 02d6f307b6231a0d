//! Memory-buffer TLS sessions
//!
//! This module runs TLS connections without owning any socket. The host
//! moves ciphertext in and out of each session and exchanges plaintext with
//! it; the library never blocks waiting for the network.
//!
//! # Architecture
//!
//! 1. `SessionConfig` describes one session (role, certificate, ciphers, options)
//! 2. `CertCache` compiles and shares one `CertContext` per distinct set of
//!    certificate-related settings, recompiling when a source file changes
//! 3. `SniDirectory` maps hostnames to certificate files for server sessions
//! 4. `TlsSession` drives the engine through memory buffers
//! 5. `SessionTable` hands out opaque handles for the host runtime
//!
//! # Features
//!
//! - Accept (server) and connect (client) sessions
//! - Certificate selection by SNI, with single-label wildcards
//! - Plaintext buffering until the handshake completes
//! - Refusal of renegotiation once the first handshake is done
//! - Peer certificate and verification result reporting
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tlsbuf::tls::{CertCache, SessionConfig, SniDirectory, TlsSession};
//!
//! let certs = Arc::new(CertCache::new());
//! let sni = Arc::new(SniDirectory::new());
//! sni.add("*.example.com", "/etc/tls/wildcard.pem");
//!
//! let config = SessionConfig::accept()
//!     .cert_file("/etc/tls/default.pem")
//!     .protocol_options("no_sslv3|no_tlsv1")
//!     .build()
//!     .unwrap();
//! let session = TlsSession::open(config, &certs, &sni).unwrap();
//!
//! // Bytes received from the peer
//! session.feed_ciphertext(b"...").unwrap();
//! let plain = session.read_plaintext(0).unwrap();
//! if plain.more_pending {
//!     let outgoing = session.drain_ciphertext().unwrap();
//!     // send `outgoing` to the peer
//! #   drop(outgoing);
//! }
//! ```

pub mod buffer;
pub mod cert;
pub mod config;
pub mod context;
mod ffi;
pub mod handshake;
pub mod io;
pub mod session;
pub mod sni;
pub mod table;

#[cfg(test)]
mod testutil;

pub use cert::CertInfo;
pub use config::{
    parse_protocol_options, OpenFlags, OptionTable, Role, SessionConfig, SessionConfigBuilder,
    TlsError, DEFAULT_CIPHERS, DEFAULT_OPTION_TABLE,
};
pub use context::{CertCache, CertContext, ContextKey, WatchedMtimes};
pub use handshake::{Identity, IdentityResolver, SessionHooks, NO_MATCHING_CERTIFICATE};
pub use session::{Plaintext, TlsSession};
pub use sni::SniDirectory;
pub use table::{OpenRequest, SessionHandle, SessionTable};

/// Result type for TLS operations
pub type Result<T> = std::result::Result<T, TlsError>;
