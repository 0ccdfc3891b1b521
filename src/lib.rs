//! tlswitness - a TLS endpoint that records the wire image of test
//! handshakes to detect interception.
//!
//! A single TCP port simultaneously:
//! - serves the administrative reporter API over HTTPS,
//! - terminates TLS on ephemeral test hostnames, recording the exact byte
//!   stream observed on the wire together with the session key log,
//! - transparently forwards anything else to an upstream origin,
//! - answers flash socket policy requests for the legacy client transport.

pub mod capture;
pub mod cert;
pub mod certgen;
pub mod claim;
pub mod config;
pub mod listener;
pub mod models;
pub mod peek;
pub mod policy;
pub mod proxy;
pub mod reporter;
pub mod server;
pub mod sni;
pub mod storage;
pub mod tls;

// Re-export commonly used types
pub use capture::{CaptureNotifier, CaptureState, CaptureStream};
pub use cert::CertificateLoader;
pub use claim::HostClaimer;
pub use config::Config;
pub use listener::{ClaimDecision, ConnQueue, DemuxListener, RequestClaimer};
pub use peek::PeekableStream;
pub use policy::{FlashPolicyRule, FlashPolicyServer};
pub use reporter::{PeerIp, ReporterState};
pub use server::TlsServer;
pub use sni::parse_client_hello;
pub use storage::Storage;
pub use tls::TlsConfigurator;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
