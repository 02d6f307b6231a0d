//! Certificate summaries
//!
//! Extracts the names from a certificate: the one a compiled context
//! presents, or the DER-encoded certificate a peer presented.

use super::config::TlsError;
use openssl::nid::Nid;
use openssl::x509::{X509NameRef, X509Ref, X509};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Certificate information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertInfo {
    /// Certificate subject (Common Name)
    pub subject: String,
    /// Certificate issuer (Common Name)
    pub issuer: String,
    /// Subject Alternative Names (DNS names and IP addresses)
    pub subject_alt_names: Vec<String>,
}

impl CertInfo {
    pub fn from_x509_ref(cert: &X509Ref) -> Self {
        CertInfo {
            subject: common_name(cert.subject_name()),
            issuer: common_name(cert.issuer_name()),
            subject_alt_names: subject_alt_names(cert),
        }
    }

    /// Parse a DER-encoded certificate, as returned for the peer
    pub fn from_der(der: &[u8]) -> Result<Self, TlsError> {
        let cert = X509::from_der(der)?;
        Ok(CertInfo::from_x509_ref(&cert))
    }

    /// Whether `name` is the subject or one of the DNS alternative names
    pub fn covers(&self, name: &str) -> bool {
        self.subject.eq_ignore_ascii_case(name)
            || self
                .subject_alt_names
                .iter()
                .filter_map(|san| san.strip_prefix("DNS:"))
                .any(|dns| dns.eq_ignore_ascii_case(name))
    }
}

fn common_name(name: &X509NameRef) -> String {
    name.entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "<undef>".to_string())
}

fn subject_alt_names(cert: &X509Ref) -> Vec<String> {
    let Some(sans) = cert.subject_alt_names() else {
        return Vec::new();
    };

    sans.iter()
        .filter_map(|name| {
            if let Some(dns) = name.dnsname() {
                return Some(format!("DNS:{}", dns));
            }
            match name.ipaddress()? {
                ip if ip.len() == 4 => {
                    let octets: [u8; 4] = ip.try_into().ok()?;
                    Some(format!("IP:{}", Ipv4Addr::from(octets)))
                }
                ip if ip.len() == 16 => {
                    let octets: [u8; 16] = ip.try_into().ok()?;
                    Some(format!("IP:{}", Ipv6Addr::from(octets)))
                }
                _ => None,
            }
        })
        .collect()
}
