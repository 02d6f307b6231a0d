//! Shared fixtures for the integration tests

#![allow(dead_code)]

use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::x509::extension::{BasicConstraints, SubjectAlternativeName};
use openssl::x509::{X509Name, X509};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tlsbuf::tls::{TlsError, TlsSession};

/// Write a self-signed certificate and its key for `cn` into `dir`
///
/// The certificate is marked as a CA so it can also serve as a trust anchor.
pub fn write_cert(dir: &Path, name: &str, cn: &str) -> String {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();

    let mut subject = X509Name::builder().unwrap();
    subject.append_entry_by_nid(Nid::COMMONNAME, cn).unwrap();
    let subject = subject.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(7).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&subject).unwrap();
    builder.set_issuer_name(&subject).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(30).unwrap()).unwrap();
    builder
        .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
        .unwrap();
    let san = SubjectAlternativeName::new()
        .dns(cn)
        .build(&builder.x509v3_context(None, None))
        .unwrap();
    builder.append_extension(san).unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    let cert = builder.build();

    let path = dir.join(name);
    let mut file = File::create(&path).unwrap();
    file.write_all(&cert.to_pem().unwrap()).unwrap();
    file.write_all(&key.private_key_to_pem_pkcs8().unwrap()).unwrap();
    path.to_str().unwrap().to_string()
}

/// Move the mtime of `path` forward so stat sees a change
pub fn bump_mtime(path: &str) {
    let file = File::options().write(true).open(path).unwrap();
    let mtime = fs::metadata(path).unwrap().modified().unwrap();
    file.set_modified(mtime + Duration::from_secs(5)).unwrap();
}

/// Plaintext collected on each side by `pump`
#[derive(Debug, Default)]
pub struct Exchanged {
    pub client: Vec<u8>,
    pub server: Vec<u8>,
}

/// Shuttle ciphertext between two sessions until the wire goes quiet
pub fn pump(client: &TlsSession, server: &TlsSession) -> Result<Exchanged, TlsError> {
    let mut exchanged = Exchanged::default();

    for _ in 0..16 {
        exchanged
            .client
            .extend_from_slice(&client.read_plaintext(0)?.data);
        let to_server = client.drain_ciphertext()?;
        server.feed_ciphertext(&to_server)?;

        exchanged
            .server
            .extend_from_slice(&server.read_plaintext(0)?.data);
        let to_client = server.drain_ciphertext()?;
        client.feed_ciphertext(&to_client)?;

        if to_server.is_empty()
            && to_client.is_empty()
            && client.is_established()
            && server.is_established()
        {
            break;
        }
    }

    Ok(exchanged)
}
