//! Test fixtures: throwaway certificates and an in-memory wire

use super::session::TlsSession;
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{BasicConstraints, SubjectAlternativeName};
use openssl::x509::{X509Name, X509};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::time::Duration;

/// Self-signed P-256 certificate for `cn`, usable as its own CA
pub fn self_signed(cn: &str) -> (X509, PKey<Private>) {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();

    let mut name = X509Name::builder().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, cn).unwrap();
    let name = name.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(30).unwrap()).unwrap();
    builder
        .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
        .unwrap();
    let san = SubjectAlternativeName::new()
        .dns(cn)
        .dns(&format!("*.{}", cn))
        .ip("127.0.0.1")
        .ip("::1")
        .build(&builder.x509v3_context(None, None))
        .unwrap();
    builder.append_extension(san).unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();

    (builder.build(), key)
}

/// Write certificate and key for `cn` as one PEM file at `path`
pub fn write_cert_at(path: &Path, cn: &str) {
    let (cert, key) = self_signed(cn);
    let mut file = File::create(path).unwrap();
    file.write_all(&cert.to_pem().unwrap()).unwrap();
    file.write_all(&key.private_key_to_pem_pkcs8().unwrap()).unwrap();
}

/// Write certificate and key for `cn` into `dir`, returning the path
pub fn write_cert(dir: &Path, name: &str, cn: &str) -> String {
    let path = dir.join(name);
    write_cert_at(&path, cn);
    path.to_str().unwrap().to_string()
}

/// Move the mtime of `path` forward so stat sees a change
pub fn bump_mtime(path: &Path) {
    let file = File::options().write(true).open(path).unwrap();
    let mtime = fs::metadata(path).unwrap().modified().unwrap();
    file.set_modified(mtime + Duration::from_secs(5)).unwrap();
}

/// Shuttle ciphertext between two sessions until neither produces any
///
/// Returns the plaintext each side read, client first.
pub fn pump(client: &TlsSession, server: &TlsSession) -> (Vec<u8>, Vec<u8>) {
    let mut client_plain = Vec::new();
    let mut server_plain = Vec::new();

    for _ in 0..16 {
        client_plain.extend_from_slice(&client.read_plaintext(0).unwrap().data);
        let to_server = client.drain_ciphertext().unwrap();
        server.feed_ciphertext(&to_server).unwrap();

        server_plain.extend_from_slice(&server.read_plaintext(0).unwrap().data);
        let to_client = server.drain_ciphertext().unwrap();
        client.feed_ciphertext(&to_client).unwrap();

        if to_server.is_empty()
            && to_client.is_empty()
            && client.is_established()
            && server.is_established()
        {
            break;
        }
    }

    (client_plain, server_plain)
}
