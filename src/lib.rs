//! tlsbuf - non-blocking TLS over memory buffers
//!
//! This crate provides TLS sessions that are driven entirely through byte
//! buffers, a shared cache of compiled certificate contexts, and an SNI
//! directory for picking server certificates by hostname.

pub mod tls;
