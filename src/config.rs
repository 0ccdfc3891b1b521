//! Configuration with TOML parsing.
//!
//! All operational values are externalized; defaults describe a development
//! deployment serving `l.ls-l.info` on port 4433 with self-signed
//! certificates.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::models::{SubtestSpec, VERSION_TLS12, VERSION_TLS13};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the demultiplexing listener binds to.
    pub listen_address: String,
    /// Optional dedicated listener for flash socket policy requests.
    pub flash_listen_address: Option<String>,
    /// Upstream origin receiving unclaimed traffic. Unset means unclaimed
    /// sessions are refused.
    pub origin_address: Option<String>,

    /// Hostname of the administrative reporter API.
    pub host_reporter: String,
    /// Suffix (including leading dot) of IPv4 test hostnames.
    pub host_suffix_ipv4: String,
    /// Suffix (including leading dot) of IPv6 test hostnames.
    pub host_suffix_ipv6: String,

    pub reporter_certificate: PathBuf,
    pub reporter_private_key: PathBuf,
    pub dummy_certificate: PathBuf,
    pub dummy_private_key: PathBuf,
    /// Generate self-signed certificates at startup when the files above
    /// are missing.
    pub generate_missing_certificates: bool,

    pub database_path: PathBuf,
    /// URL prefix of the reporter API routes.
    pub reporter_api_prefix: String,

    /// Maximum allowed time after test creation in which updates (like
    /// client results and captures) are accepted.
    pub mutable_test_period_secs: u64,
    /// Deadline for the initial peek on a fresh connection.
    pub initial_read_timeout_secs: u64,
    /// Read timeout of the upper HTTP server.
    pub read_timeout_secs: u64,
    /// Write timeout of the upper HTTP server.
    pub write_timeout_secs: u64,

    /// Test cases that the client should execute.
    pub subtests: Vec<SubtestSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:4433".to_string(),
            flash_listen_address: None,
            origin_address: None,
            host_reporter: "l.ls-l.info".to_string(),
            host_suffix_ipv4: ".l4.ls-l.info".to_string(),
            host_suffix_ipv6: ".l6.ls-l.info".to_string(),
            reporter_certificate: PathBuf::from("certs/reporter.crt"),
            reporter_private_key: PathBuf::from("certs/reporter.key"),
            dummy_certificate: PathBuf::from("certs/dummy.crt"),
            dummy_private_key: PathBuf::from("certs/dummy.key"),
            generate_missing_certificates: true,
            database_path: PathBuf::from("tlswitness.db"),
            reporter_api_prefix: "/api/v1".to_string(),
            mutable_test_period_secs: 15 * 60,
            initial_read_timeout_secs: 10,
            read_timeout_secs: 30,
            write_timeout_secs: 180,
            subtests: vec![
                SubtestSpec {
                    number: 1,
                    max_tls_version: VERSION_TLS12,
                    is_ipv6: false,
                },
                SubtestSpec {
                    number: 2,
                    max_tls_version: VERSION_TLS12,
                    is_ipv6: true,
                },
                SubtestSpec {
                    number: 3,
                    max_tls_version: VERSION_TLS13,
                    is_ipv6: false,
                },
                SubtestSpec {
                    number: 4,
                    max_tls_version: VERSION_TLS13,
                    is_ipv6: true,
                },
            ],
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn write(&self, path: &Path) -> anyhow::Result<()> {
        let rendered = toml::to_string_pretty(self).context("failed to render config")?;
        std::fs::write(path, rendered)
            .with_context(|| format!("failed to write config file {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.socket_addr()?;
        if let Some(flash) = &self.flash_listen_address {
            flash
                .parse::<SocketAddr>()
                .with_context(|| format!("invalid flash_listen_address {flash:?}"))?;
        }
        anyhow::ensure!(!self.host_reporter.is_empty(), "host_reporter must be set");
        anyhow::ensure!(
            self.host_reporter == self.host_reporter.to_lowercase(),
            "host_reporter must be lowercase"
        );
        for suffix in [&self.host_suffix_ipv4, &self.host_suffix_ipv6] {
            anyhow::ensure!(
                suffix.starts_with('.'),
                "test host suffix {suffix:?} must start with a dot"
            );
        }
        anyhow::ensure!(
            self.mutable_test_period_secs > 0,
            "mutable_test_period_secs must be positive"
        );
        anyhow::ensure!(
            self.initial_read_timeout_secs > 0,
            "initial_read_timeout_secs must be positive"
        );
        anyhow::ensure!(!self.subtests.is_empty(), "at least one subtest must be configured");
        let mut numbers = HashSet::new();
        for spec in &self.subtests {
            anyhow::ensure!(spec.number > 0, "subtest numbers must be positive");
            anyhow::ensure!(
                numbers.insert(spec.number),
                "duplicate subtest number {}",
                spec.number
            );
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listen_address
            .parse()
            .with_context(|| format!("invalid listen_address {:?}", self.listen_address))
    }

    /// Port the main listener serves on, used in the policy document.
    pub fn listen_port(&self) -> anyhow::Result<u16> {
        Ok(self.socket_addr()?.port())
    }

    pub fn initial_read_timeout(&self) -> Duration {
        Duration::from_secs(self.initial_read_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.listen_port().unwrap(), 4433);
        assert_eq!(config.subtests.len(), 4);
    }

    #[test]
    fn toml_values_override_defaults() {
        let config: Config = toml::from_str(
            r#"
            listen_address = "127.0.0.1:8443"
            host_reporter = "reporter.example"
            origin_address = "127.0.0.1:8080"

            [[subtests]]
            number = 1
            max_tls_version = 772
            is_ipv6 = false
            "#,
        )
        .unwrap();
        assert_eq!(config.listen_address, "127.0.0.1:8443");
        assert_eq!(config.host_reporter, "reporter.example");
        assert_eq!(config.origin_address.as_deref(), Some("127.0.0.1:8080"));
        assert_eq!(config.subtests.len(), 1);
        assert_eq!(config.subtests[0].max_tls_version, VERSION_TLS13);
        // Untouched fields keep their defaults.
        assert_eq!(config.reporter_api_prefix, "/api/v1");
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = Config::default();
        config.listen_address = "not an address".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.host_suffix_ipv4 = "l4.example".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.host_reporter = "UPPER.example".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.subtests[1].number = config.subtests[0].number;
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let config = Config::default();
        config.write(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.listen_address, config.listen_address);
        assert_eq!(loaded.subtests.len(), config.subtests.len());
    }
}
