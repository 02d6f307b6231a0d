//! Session configuration
//!
//! This module provides the configuration builder for accept (server) and
//! connect (client) sessions, the decoding of the host runtime's open flags,
//! the protocol-option token table, and the crate error type.

use openssl::error::ErrorStack;
use openssl::ssl::SslOptions;

/// Cipher list installed when the caller supplies an empty one
pub const DEFAULT_CIPHERS: &str = "DEFAULT:!EXPORT:!LOW:!RC4:!SSLv2";

/// Session role, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Server side of the handshake
    Accept,
    /// Client side of the handshake
    Connect,
}

impl Role {
    /// Get role as string
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Accept => "accept",
            Role::Connect => "connect",
        }
    }
}

/// TLS errors
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("bad argument: {0}")]
    BadArgument(String),

    #[error("closed")]
    Closed,

    #[error("not found")]
    NotFound,

    #[error("out of memory")]
    OutOfMemory,

    #[error("SSL_CTX_new failed: {0}")]
    ContextCreate(ErrorStack),

    #[error("SSL_CTX_use_certificate_file failed: {0}")]
    CertificateChain(ErrorStack),

    #[error("SSL_CTX_use_PrivateKey_file failed: {0}")]
    PrivateKey(ErrorStack),

    #[error("SSL_CTX_check_private_key failed: {0}")]
    KeyMismatch(ErrorStack),

    #[error("SSL_CTX_set_cipher_list failed: {0}")]
    CipherList(ErrorStack),

    #[error("Setting DH parameters failed: {0}")]
    DhParams(String),

    #[error("SSL_new failed: {0}")]
    SessionCreate(ErrorStack),

    #[error("{0}")]
    HandshakeFailed(String),

    #[error("client renegotiations forbidden")]
    Renegotiation,

    #[error("{0}")]
    Write(String),

    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] ErrorStack),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TlsError {
    /// Whether the error reports an invalidated session
    pub fn is_closed(&self) -> bool {
        matches!(self, TlsError::Closed)
    }
}

/// Append the OpenSSL error queue to a message, if the queue is not empty
pub(crate) fn annotate(message: &str, stack: Option<&ErrorStack>) -> String {
    match stack {
        Some(stack) if !stack.errors().is_empty() => format!("{}: {}", message, stack),
        _ => message.to_string(),
    }
}

/// Name to option-bit lookup table for protocol-option tokens
pub type OptionTable<'a> = &'a [(&'a str, SslOptions)];

/// Option names understood by default
pub const DEFAULT_OPTION_TABLE: OptionTable<'static> = &[
    ("all", SslOptions::ALL),
    ("no_query_mtu", SslOptions::NO_QUERY_MTU),
    ("cookie_exchange", SslOptions::COOKIE_EXCHANGE),
    ("no_ticket", SslOptions::NO_TICKET),
    ("no_compression", SslOptions::NO_COMPRESSION),
    ("no_renegotiation", SslOptions::NO_RENEGOTIATION),
    ("cipher_server_preference", SslOptions::CIPHER_SERVER_PREFERENCE),
    ("tls_rollback_bug", SslOptions::TLS_ROLLBACK_BUG),
    ("single_dh_use", SslOptions::SINGLE_DH_USE),
    ("single_ecdh_use", SslOptions::SINGLE_ECDH_USE),
    ("dont_insert_empty_fragments", SslOptions::DONT_INSERT_EMPTY_FRAGMENTS),
    ("allow_unsafe_legacy_renegotiation", SslOptions::ALLOW_UNSAFE_LEGACY_RENEGOTIATION),
    ("no_sslv2", SslOptions::NO_SSLV2),
    ("no_sslv3", SslOptions::NO_SSLV3),
    ("no_tlsv1", SslOptions::NO_TLSV1),
    ("no_tlsv1_1", SslOptions::NO_TLSV1_1),
    ("no_tlsv1_2", SslOptions::NO_TLSV1_2),
    ("no_tlsv1_3", SslOptions::NO_TLSV1_3),
];

/// Resolve a `|` separated list of option names through `table`
///
/// Unknown names are ignored.
pub fn parse_protocol_options(table: OptionTable<'_>, spec: &str) -> SslOptions {
    spec.split('|')
        .filter(|token| !token.is_empty())
        .filter_map(|token| {
            table
                .iter()
                .find(|(name, _)| *name == token)
                .map(|(_, option)| *option)
        })
        .fold(SslOptions::empty(), |acc, option| acc | option)
}

/// Open flags as passed by the host runtime
///
/// The low 16 bits carry the command (accept or connect), the upper bits
/// carry compatibility sub-flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags {
    pub role: Role,
    pub verify_none: bool,
    pub compression_none: bool,
}

impl OpenFlags {
    pub const ACCEPT: u32 = 1;
    pub const CONNECT: u32 = 2;
    pub const VERIFY_NONE: u32 = 0x10000;
    pub const COMPRESSION_NONE: u32 = 0x100000;

    /// Decode host flags
    pub fn from_bits(bits: u32) -> Result<Self, TlsError> {
        let role = match bits & 0xffff {
            Self::ACCEPT => Role::Accept,
            Self::CONNECT => Role::Connect,
            command => {
                return Err(TlsError::BadArgument(format!(
                    "unknown session command {:#x}",
                    command
                )))
            }
        };

        Ok(OpenFlags {
            role,
            verify_none: bits & Self::VERIFY_NONE != 0,
            compression_none: bits & Self::COMPRESSION_NONE != 0,
        })
    }

    /// Encode back to host flags
    pub fn bits(&self) -> u32 {
        let mut bits = match self.role {
            Role::Accept => Self::ACCEPT,
            Role::Connect => Self::CONNECT,
        };
        if self.verify_none {
            bits |= Self::VERIFY_NONE;
        }
        if self.compression_none {
            bits |= Self::COMPRESSION_NONE;
        }
        bits
    }

    /// Start a session configuration with these flags applied
    pub fn builder(self) -> SessionConfigBuilder {
        SessionConfigBuilder::new(self.role)
            .verify_none(self.verify_none)
            .compression_none(self.compression_none)
    }
}

/// Session configuration (immutable after building)
///
/// `options` holds only the caller's options and is part of the certificate
/// context key, so sessions of either role share contexts. The flags forced
/// for the role are kept apart in `forced` and applied to each session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub(crate) role: Role,
    pub(crate) cert_file: String,
    pub(crate) ciphers: String,
    pub(crate) options: SslOptions,
    pub(crate) forced: SslOptions,
    pub(crate) dh_file: String,
    pub(crate) ca_file: String,
    pub(crate) verify_none: bool,
    pub(crate) servername: Option<String>,
    pub(crate) alpn: Option<Vec<u8>>,
}

impl SessionConfig {
    /// Create a new accept (server) configuration builder
    pub fn accept() -> SessionConfigBuilder {
        SessionConfigBuilder::new(Role::Accept)
    }

    /// Create a new connect (client) configuration builder
    pub fn connect() -> SessionConfigBuilder {
        SessionConfigBuilder::new(Role::Connect)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Initial certificate file (empty for none)
    pub fn cert_file(&self) -> &str {
        &self.cert_file
    }

    pub fn ciphers(&self) -> &str {
        &self.ciphers
    }

    /// Caller-supplied options, as used in the context key
    pub fn options(&self) -> SslOptions {
        self.options
    }

    /// Options the session runs with: caller options plus role-forced flags
    pub fn effective_options(&self) -> SslOptions {
        self.options | self.forced
    }

    pub fn dh_file(&self) -> &str {
        &self.dh_file
    }

    pub fn ca_file(&self) -> &str {
        &self.ca_file
    }

    pub fn servername(&self) -> Option<&str> {
        self.servername.as_deref()
    }

    /// ALPN protocol list in wire format
    pub fn alpn(&self) -> Option<&[u8]> {
        self.alpn.as_deref()
    }
}

/// Session configuration builder
pub struct SessionConfigBuilder {
    role: Role,
    cert_file: String,
    ciphers: String,
    options: SslOptions,
    dh_file: String,
    ca_file: String,
    verify_none: bool,
    compression_none: bool,
    servername: Option<String>,
    alpn: Option<Vec<u8>>,
}

impl SessionConfigBuilder {
    fn new(role: Role) -> Self {
        SessionConfigBuilder {
            role,
            cert_file: String::new(),
            ciphers: String::new(),
            options: SslOptions::empty(),
            dh_file: String::new(),
            ca_file: String::new(),
            verify_none: false,
            compression_none: false,
            servername: None,
            alpn: None,
        }
    }

    /// PEM file holding the certificate chain and private key
    pub fn cert_file(mut self, path: impl Into<String>) -> Self {
        self.cert_file = path.into();
        self
    }

    /// Cipher list (empty selects `DEFAULT_CIPHERS`)
    pub fn ciphers(mut self, ciphers: impl Into<String>) -> Self {
        self.ciphers = ciphers.into();
        self
    }

    /// Add options by name, resolved through `DEFAULT_OPTION_TABLE`
    pub fn protocol_options(self, spec: &str) -> Self {
        self.protocol_options_with(DEFAULT_OPTION_TABLE, spec)
    }

    /// Add options by name, resolved through a caller-supplied table
    pub fn protocol_options_with(mut self, table: OptionTable<'_>, spec: &str) -> Self {
        self.options |= parse_protocol_options(table, spec);
        self
    }

    /// Add raw option bits
    pub fn options(mut self, options: SslOptions) -> Self {
        self.options |= options;
        self
    }

    /// PEM file with Diffie-Hellman parameters
    pub fn dh_file(mut self, path: impl Into<String>) -> Self {
        self.dh_file = path.into();
        self
    }

    /// PEM file with trusted CA certificates
    pub fn ca_file(mut self, path: impl Into<String>) -> Self {
        self.ca_file = path.into();
        self
    }

    /// Disable peer certificate verification for this session
    pub fn verify_none(mut self, verify_none: bool) -> Self {
        self.verify_none = verify_none;
        self
    }

    /// Disable record compression for this session
    pub fn compression_none(mut self, compression_none: bool) -> Self {
        self.compression_none = compression_none;
        self
    }

    /// Set SNI servername (connect only)
    pub fn servername(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.servername = if name.is_empty() { None } else { Some(name) };
        self
    }

    /// Set ALPN protocols (connect only)
    pub fn alpn(mut self, protocols: &[&str]) -> Result<Self, TlsError> {
        // Encode ALPN protocols (length-prefixed)
        let mut alpn_bytes = Vec::new();
        for proto in protocols {
            let len = u8::try_from(proto.len())
                .ok()
                .filter(|len| *len > 0)
                .ok_or_else(|| {
                    TlsError::BadArgument(format!("invalid ALPN protocol name {:?}", proto))
                })?;
            alpn_bytes.push(len);
            alpn_bytes.extend_from_slice(proto.as_bytes());
        }
        self.alpn = if alpn_bytes.is_empty() { None } else { Some(alpn_bytes) };
        Ok(self)
    }

    /// Set ALPN protocols already in wire format (connect only)
    pub fn alpn_wire(mut self, wire: &[u8]) -> Self {
        self.alpn = if wire.is_empty() { None } else { Some(wire.to_vec()) };
        self
    }

    /// Build the session configuration
    pub fn build(self) -> Result<SessionConfig, TlsError> {
        if self.role == Role::Accept && (self.servername.is_some() || self.alpn.is_some()) {
            return Err(TlsError::BadArgument(
                "servername and ALPN are only valid for connect sessions".to_string(),
            ));
        }

        let mut forced = SslOptions::NO_TICKET | SslOptions::NO_SSLV2;
        if self.role == Role::Accept {
            forced |= SslOptions::ALL;
        }
        if self.compression_none {
            forced |= SslOptions::NO_COMPRESSION;
        }

        Ok(SessionConfig {
            role: self.role,
            cert_file: self.cert_file,
            ciphers: self.ciphers,
            options: self.options,
            forced,
            dh_file: self.dh_file,
            ca_file: self.ca_file,
            verify_none: self.verify_none,
            servername: self.servername,
            alpn: self.alpn,
        })
    }
}
