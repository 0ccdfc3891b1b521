//! Self-signed certificate generation for the reporter and test hostnames.
//!
//! The dummy certificate covers the wildcard test suffixes; clients are not
//! expected to trust it, its only job is to complete handshakes whose wire
//! image is being recorded.

use std::fs;
use std::path::Path;

use anyhow::Context;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use time::{Duration, OffsetDateTime};
use tracing::info;

/// Validity window for generated certificates.
const VALIDITY_DAYS: i64 = 2 * 365;

/// Writes a fresh self-signed certificate/key pair for the given DNS names.
pub fn generate_certificate(cert_path: &Path, key_path: &Path, names: &[String]) -> anyhow::Result<()> {
    let mut params = CertificateParams::new(names.to_vec())
        .context("invalid subject alternative names")?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, names.first().map(String::as_str).unwrap_or("tlswitness"));
    params.distinguished_name = dn;

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(1);
    params.not_after = now + Duration::days(VALIDITY_DAYS);

    let key_pair = KeyPair::generate().context("failed to generate key pair")?;
    let certificate = params
        .self_signed(&key_pair)
        .context("failed to self-sign certificate")?;

    fs::write(cert_path, certificate.pem())
        .with_context(|| format!("failed to write {}", cert_path.display()))?;
    fs::write(key_path, key_pair.serialize_pem())
        .with_context(|| format!("failed to write {}", key_path.display()))?;
    Ok(())
}

/// Generates the pair only when either file is missing. Returns whether a
/// new certificate was written.
pub fn ensure_certificate(cert_path: &Path, key_path: &Path, names: &[String]) -> anyhow::Result<bool> {
    if cert_path.exists() && key_path.exists() {
        return Ok(false);
    }
    generate_certificate(cert_path, key_path, names)?;
    info!(
        "generated self-signed certificate for {:?} at {}",
        names,
        cert_path.display()
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_parseable_pair() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("test.crt");
        let key_path = dir.path().join("test.key");

        generate_certificate(&cert_path, &key_path, &["example.org".to_string()]).unwrap();

        let pem = fs::read_to_string(&cert_path).unwrap();
        assert!(pem.contains("BEGIN CERTIFICATE"));
        let key = fs::read_to_string(&key_path).unwrap();
        assert!(key.contains("PRIVATE KEY"));
    }

    #[test]
    fn ensure_does_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("test.crt");
        let key_path = dir.path().join("test.key");

        assert!(ensure_certificate(&cert_path, &key_path, &["a.example".to_string()]).unwrap());
        let original = fs::read(&cert_path).unwrap();
        assert!(!ensure_certificate(&cert_path, &key_path, &["b.example".to_string()]).unwrap());
        assert_eq!(fs::read(&cert_path).unwrap(), original);
    }

    #[test]
    fn accepts_wildcard_names() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("wild.crt");
        let key_path = dir.path().join("wild.key");
        generate_certificate(
            &cert_path,
            &key_path,
            &["*.l4.test.example".to_string(), "*.l6.test.example".to_string()],
        )
        .unwrap();
        assert!(cert_path.exists());
    }
}
