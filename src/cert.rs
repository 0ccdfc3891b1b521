//! Certificate and private key loading with cheap hot-reload.
//!
//! Every TLS handshake asks for the current certificate, so the fast path is
//! a read lock plus, at most once per burst, a single `stat` of the
//! certificate file. A changed mtime routes the next caller through the
//! write-locked reload; a failed reload keeps the previously cached
//! certificate in place and surfaces the error to the handshake that
//! triggered it.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Context;
use parking_lot::{Mutex, RwLock};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use rustls_pemfile::{certs, private_key};
use tracing::info;

struct Cached {
    certificate: Option<Arc<CertifiedKey>>,
    uptodate: bool,
}

pub struct CertificateLoader {
    certificate_file: PathBuf,
    private_key_file: PathBuf,
    cache: RwLock<Cached>,

    // Freshness checking: `checking` is a single-flight guard so a burst of
    // handshakes stats the file once, `mtime` is only touched by the guard
    // holder.
    checking: AtomicBool,
    mtime: Mutex<Option<SystemTime>>,
}

impl CertificateLoader {
    pub fn new(certificate_file: impl Into<PathBuf>, private_key_file: impl Into<PathBuf>) -> Self {
        Self {
            certificate_file: certificate_file.into(),
            private_key_file: private_key_file.into(),
            cache: RwLock::new(Cached {
                certificate: None,
                uptodate: false,
            }),
            checking: AtomicBool::new(false),
            mtime: Mutex::new(None),
        }
    }

    /// Loads the configured certificate from file and returns the (cached)
    /// result. While a reload fails, the previous certificate stays cached
    /// but the error is propagated, aborting the handshake that asked.
    pub fn load(&self) -> anyhow::Result<Arc<CertifiedKey>> {
        if let Some(certificate) = self.load_from_cache() {
            return Ok(certificate);
        }

        // Out of date; reload or keep the old certificate (if any).
        let mut cache = self.cache.write();
        let certificate = Arc::new(load_certified_key(
            &self.certificate_file,
            &self.private_key_file,
        )?);
        info!("(re)loaded certificate from {}", self.certificate_file.display());
        cache.certificate = Some(certificate.clone());
        cache.uptodate = true;
        Ok(certificate)
    }

    fn load_from_cache(&self) -> Option<Arc<CertifiedKey>> {
        let cache = self.cache.read();
        if cache.uptodate && self.cache_is_fresh() {
            cache.certificate.clone()
        } else {
            None
        }
    }

    /// Returns true when the cached certificate does not need a reload.
    /// Runs under the read lock; losers of the single-flight race report
    /// "fresh" immediately so they never block on the filesystem.
    fn cache_is_fresh(&self) -> bool {
        if self
            .checking
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return true;
        }

        let fresh = match std::fs::metadata(&self.certificate_file).and_then(|m| m.modified()) {
            // Not provably stale: loading would likely fail anyway.
            Err(_) => true,
            Ok(modified) => {
                let mut mtime = self.mtime.lock();
                if *mtime == Some(modified) {
                    true
                } else {
                    *mtime = Some(modified);
                    false
                }
            }
        };

        self.checking.store(false, Ordering::Release);
        fresh
    }
}

/// Reads a PEM certificate chain and private key into a rustls
/// [`CertifiedKey`], using the installed crypto provider.
fn load_certified_key(certificate_file: &Path, private_key_file: &Path) -> anyhow::Result<CertifiedKey> {
    let chain = load_certificates(certificate_file)?;
    let key = load_private_key(private_key_file)?;

    let provider = CryptoProvider::get_default()
        .context("no process-level crypto provider installed")?;
    let signing_key = provider
        .key_provider
        .load_private_key(key)
        .with_context(|| format!("unusable private key in {}", private_key_file.display()))?;

    Ok(CertifiedKey::new(chain, signing_key))
}

fn load_certificates(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open certificate file {}", path.display()))?;
    let chain: Vec<CertificateDer<'static>> = certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to parse certificates in {}", path.display()))?;
    if chain.is_empty() {
        anyhow::bail!("no certificates found in {}", path.display());
    }
    Ok(chain)
}

fn load_private_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open private key file {}", path.display()))?;
    private_key(&mut BufReader::new(file))
        .with_context(|| format!("failed to parse private key in {}", path.display()))?
        .with_context(|| format!("no private key found in {}", path.display()))
}
