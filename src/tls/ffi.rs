//! libssl entry points not wrapped by the `openssl` crate

#![allow(non_camel_case_types)]

use libc::c_int;
use openssl_sys::SSL;

pub const SSL_CB_HANDSHAKE_START: c_int = 0x10;
pub const SSL_CB_HANDSHAKE_DONE: c_int = 0x20;

// Reasons reported for bytes that are not a TLS client hello at all
pub const SSL_R_DATA_LENGTH_TOO_LONG: c_int = 146;
pub const SSL_R_HTTPS_PROXY_REQUEST: c_int = 155;
pub const SSL_R_HTTP_REQUEST: c_int = 156;
pub const SSL_R_PACKET_LENGTH_TOO_LONG: c_int = 198;
pub const SSL_R_UNEXPECTED_MESSAGE: c_int = 244;
pub const SSL_R_UNKNOWN_PROTOCOL: c_int = 252;
pub const SSL_R_WRONG_VERSION_NUMBER: c_int = 267;

// Option bits are `uint64_t` in OpenSSL 3 and `unsigned long` before it
pub type SslOptionBits = u64;

pub type SSL_info_callback = Option<unsafe extern "C" fn(ssl: *const SSL, where_: c_int, ret: c_int)>;

extern "C" {
    pub fn SSL_set_info_callback(ssl: *mut SSL, callback: SSL_info_callback);
    pub fn SSL_set_options(ssl: *mut SSL, options: SslOptionBits) -> SslOptionBits;
    pub fn SSL_get_options(ssl: *const SSL) -> SslOptionBits;

    #[cfg(test)]
    pub fn SSL_renegotiate(ssl: *mut SSL) -> c_int;
}
