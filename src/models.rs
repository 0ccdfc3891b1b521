//! Data models shared between the capture pipeline, the storage layer and
//! the reporter API. Field names follow the JSON wire format consumed by the
//! test client.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// TLS protocol version numbers as they appear on the wire and in captures.
pub const VERSION_TLS12: u16 = 0x0303;
pub const VERSION_TLS13: u16 = 0x0304;

/// A user-initiated test run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Test {
    #[serde(skip)]
    pub id: i64,
    pub test_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub client_ip: IpAddr,
    pub client_version: String,
    pub flash_version: String,
    pub user_agent: String,
    pub user_comment: String,
    pub has_failed: bool,
    pub is_mitm: bool,
    pub is_pending: bool,
}

/// Specification of a subtest, as advertised to the client on test creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtestSpec {
    pub number: i64,
    pub max_tls_version: u16,
    pub is_ipv6: bool,
}

/// Actual instantiation of a subtest belonging to a test run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtest {
    #[serde(skip)]
    pub id: i64,
    #[serde(skip)]
    pub test_id: i64,
    pub number: i64,
    pub max_tls_version: u16,
    pub is_ipv6: bool,
    pub has_failed: bool,
    pub is_mitm: bool,
}

/// One direction-labelled chunk of bytes observed on a recorded connection.
/// The payload is an owned copy of what went over the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Frame {
    pub time: DateTime<Utc>,
    pub is_read: bool,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// The recorded wire image of a single TLS session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capture {
    #[serde(skip)]
    pub id: i64,
    #[serde(skip)]
    pub subtest_id: i64,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    pub begin_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub actual_tls_version: u16,
    pub frames: Vec<Frame>,
    pub key_log: String,
    pub has_failed: bool,
}

/// A capture recorded on the server side of a connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerCapture {
    #[serde(flatten)]
    pub capture: Capture,
    pub client_ip: IpAddr,
    pub server_ip: IpAddr,
}

/// A capture submitted by the client-side test runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientCapture {
    #[serde(flatten)]
    pub capture: Capture,
}

/// Serde adapter encoding binary frame payloads as standard base64, matching
/// the JSON produced by the original wire format.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
