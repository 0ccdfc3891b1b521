//! Per-handshake TLS configuration.
//!
//! Every ClientHello selects a certificate (the reporter certificate for the
//! reporter hostname, the dummy certificate for everything else) and, for
//! test hostnames, gets its own server configuration whose key-log sink is
//! rewired into the connection's capture. The global `SSLKEYLOGFILE` sink
//! keeps receiving every session's lines either way.

use std::fmt;
use std::sync::Arc;

use rustls::server::{ClientHello, ResolvesServerCert, ServerConfig};
use rustls::sign::CertifiedKey;
use rustls::{KeyLog, KeyLogFile};

use crate::capture::CaptureState;
use crate::cert::CertificateLoader;
use crate::claim::is_test_host;
use crate::config::Config;

/// Builds the per-connection TLS configuration for each accepted
/// ClientHello.
pub struct TlsConfigurator {
    reporter_host: String,
    suffix_ipv4: String,
    suffix_ipv6: String,
    reporter_cert: Arc<CertificateLoader>,
    dummy_cert: Arc<CertificateLoader>,
    key_log: Arc<dyn KeyLog>,
}

impl TlsConfigurator {
    pub fn new(
        config: &Config,
        reporter_cert: Arc<CertificateLoader>,
        dummy_cert: Arc<CertificateLoader>,
    ) -> Self {
        Self {
            reporter_host: config.host_reporter.clone(),
            suffix_ipv4: config.host_suffix_ipv4.clone(),
            suffix_ipv6: config.host_suffix_ipv6.clone(),
            reporter_cert,
            dummy_cert,
            // KeyLogFile is a no-op unless SSLKEYLOGFILE is set.
            key_log: Arc::new(KeyLogFile::new()),
        }
    }

    pub fn is_test_host(&self, host: &str) -> bool {
        is_test_host(host, &self.suffix_ipv4, &self.suffix_ipv6)
    }

    /// Certificate selection: the reporter hostname gets the reporter
    /// certificate, every other claimed hostname the wildcard dummy. A load
    /// failure aborts this handshake but leaves other sessions serving.
    fn select_certificate(&self, sni: &str) -> anyhow::Result<Arc<CertifiedKey>> {
        if sni == self.reporter_host {
            self.reporter_cert.load()
        } else {
            self.dummy_cert.load()
        }
    }

    /// Builds the server configuration for one connection.
    ///
    /// Test hostnames advertise no ALPN (the canned response speaks plain
    /// HTTP/1.1, keeping HTTP/2 off) and, when the connection carries a
    /// capture, log TLS session keys into it. The reporter keeps the shared
    /// h2-capable configuration.
    pub fn config_for_client(
        &self,
        sni: &str,
        capture: Option<&Arc<CaptureState>>,
    ) -> anyhow::Result<Arc<ServerConfig>> {
        let certified = self.select_certificate(sni)?;
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(SingleCertResolver(certified)));

        if self.is_test_host(sni) {
            config.key_log = match capture {
                Some(capture) => Arc::new(CaptureKeyLog {
                    capture: capture.clone(),
                    chained: self.key_log.clone(),
                }),
                None => self.key_log.clone(),
            };
        } else {
            config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
            config.key_log = self.key_log.clone();
        }
        Ok(Arc::new(config))
    }
}

/// Hands the already-selected certificate to rustls.
struct SingleCertResolver(Arc<CertifiedKey>);

impl fmt::Debug for SingleCertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SingleCertResolver")
    }
}

impl ResolvesServerCert for SingleCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

/// Key-log sink writing NSS-format lines into a capture, chaining the
/// previously configured global sink.
struct CaptureKeyLog {
    capture: Arc<CaptureState>,
    chained: Arc<dyn KeyLog>,
}

impl fmt::Debug for CaptureKeyLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CaptureKeyLog")
    }
}

impl KeyLog for CaptureKeyLog {
    fn log(&self, label: &str, client_random: &[u8], secret: &[u8]) {
        self.capture.append_key_log(&format!(
            "{} {} {}",
            label,
            hex::encode(client_random),
            hex::encode(secret)
        ));
        self.chained.log(label, client_random, secret);
    }

    fn will_log(&self, _label: &str) -> bool {
        true
    }
}
