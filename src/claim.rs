//! Host claiming policy.
//!
//! Decides per SNI whether this process serves the connection itself: the
//! reporter hostname and the ephemeral test hostnames are claimed, anything
//! else is left to the proxy/refuse path. Test hostnames of the form
//! `<uuid>-<number><suffix>` resolve to a subtest through storage; any
//! resolution failure fails open to "serve without recording".

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::spawn_blocking;
use tracing::{info, warn};

use crate::config::Config;
use crate::listener::{ClaimDecision, RequestClaimer};
use crate::storage::Storage;

/// Structural UUID check: 36 characters in 8-4-4-4-12 hex groups. This is
/// deliberately stricter than a general UUID parser, which also accepts
/// braced and unhyphenated forms that never occur in test hostnames.
pub fn validate_uuid(value: &str) -> bool {
    if value.len() != 36 {
        return false;
    }
    value.bytes().enumerate().all(|(i, b)| match i {
        8 | 13 | 18 | 23 => b == b'-',
        _ => b.is_ascii_hexdigit(),
    })
}

/// Whether the hostname falls under one of the configured test suffixes.
pub fn is_test_host(host: &str, suffix_ipv4: &str, suffix_ipv6: &str) -> bool {
    host.ends_with(suffix_ipv4) || host.ends_with(suffix_ipv6)
}

/// Parses a test hostname of the form `<test_id>-<number><suffix>`,
/// returning the test UUID and subtest number.
pub fn parse_test_host(host: &str, suffix_ipv4: &str, suffix_ipv6: &str) -> Option<(String, i64)> {
    let prefix = host
        .strip_suffix(suffix_ipv4)
        .or_else(|| host.strip_suffix(suffix_ipv6))?;

    // The test UUID is always 36 chars followed by "-" and the number.
    if prefix.len() < 36 + 2 || prefix.as_bytes()[36] != b'-' {
        return None;
    }
    let (test_id, number) = (&prefix[..36], &prefix[37..]);
    if !validate_uuid(test_id) {
        return None;
    }
    let number: i64 = number.parse().ok()?;
    if number <= 0 {
        return None;
    }
    Some((test_id.to_string(), number))
}

/// Claims the reporter hostname and test hostnames, resolving the latter to
/// a subtest through storage.
pub struct HostClaimer {
    reporter_host: String,
    suffix_ipv4: String,
    suffix_ipv6: String,
    mutable_period_secs: i64,
    storage: Arc<Storage>,
}

impl HostClaimer {
    pub fn new(config: &Config, storage: Arc<Storage>) -> Self {
        Self {
            reporter_host: config.host_reporter.clone(),
            suffix_ipv4: config.host_suffix_ipv4.clone(),
            suffix_ipv6: config.host_suffix_ipv6.clone(),
            mutable_period_secs: config.mutable_test_period_secs as i64,
            storage,
        }
    }

    /// Resolves a claimed test hostname to its subtest row. Anything that
    /// goes wrong serves the host without recording.
    async fn prepare_server_capture(&self, host: &str) -> i64 {
        let Some((test_id, number)) = parse_test_host(host, &self.suffix_ipv4, &self.suffix_ipv6)
        else {
            info!("host {host:?} is not a valid test domain, ignoring");
            return 0;
        };

        let storage = self.storage.clone();
        let max_age = self.mutable_period_secs;
        let result =
            spawn_blocking(move || storage.query_subtest(&test_id, number, max_age)).await;
        match result {
            Ok(Ok(0)) => {
                info!("not accepting server capture for {host:?}");
                0
            }
            Ok(Ok(subtest_id)) => subtest_id,
            Ok(Err(e)) => {
                warn!("failed to query subtest for {host:?}: {e}");
                0
            }
            Err(e) => {
                warn!("subtest lookup for {host:?} did not complete: {e}");
                0
            }
        }
    }
}

#[async_trait]
impl RequestClaimer for HostClaimer {
    async fn claim(&self, host: &str) -> ClaimDecision {
        let host = host.to_lowercase();
        if host == self.reporter_host {
            // Pass to the HTTP handler, serving API requests.
            return ClaimDecision::claimed(0);
        }
        if is_test_host(&host, &self.suffix_ipv4, &self.suffix_ipv6) {
            // Serve the canned test response; recording is attached when
            // the hostname resolves to a live subtest.
            return ClaimDecision::claimed(self.prepare_server_capture(&host).await);
        }
        ClaimDecision::unclaimed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SubtestSpec, Test, VERSION_TLS13};
    use chrono::Utc;

    const V4: &str = ".l4.test.example";
    const V6: &str = ".l6.test.example";

    #[test]
    fn validates_uuids_structurally() {
        assert!(validate_uuid("6b5742d9-722b-4d12-848a-c42da771b806"));
        assert!(validate_uuid("00000000-0000-0000-0000-000000000000"));
        assert!(!validate_uuid(""));
        assert!(!validate_uuid("6b5742d9-722b-4d12-848a-c42da771b80")); // 35 chars
        assert!(!validate_uuid("6b5742d9-722b-4d12-848a-c42da771b8062")); // 37 chars
        assert!(!validate_uuid("6b5742d9x722b-4d12-848a-c42da771b806")); // bad separator
        assert!(!validate_uuid("6b5742d9-722b-4d12-848a-c42da771b80g")); // non-hex
        assert!(!validate_uuid("{6b5742d9-722b-4d12-848a-c42da771b8}")); // braced form
    }

    #[test]
    fn parses_well_formed_test_hosts() {
        let host = "6b5742d9-722b-4d12-848a-c42da771b806-3.l4.test.example";
        assert_eq!(
            parse_test_host(host, V4, V6),
            Some(("6b5742d9-722b-4d12-848a-c42da771b806".to_string(), 3))
        );

        let host6 = "6b5742d9-722b-4d12-848a-c42da771b806-12.l6.test.example";
        assert_eq!(
            parse_test_host(host6, V4, V6),
            Some(("6b5742d9-722b-4d12-848a-c42da771b806".to_string(), 12))
        );
    }

    #[test]
    fn rejects_malformed_test_hosts() {
        // Wrong suffix.
        assert_eq!(
            parse_test_host("6b5742d9-722b-4d12-848a-c42da771b806-3.example.org", V4, V6),
            None
        );
        // Missing number.
        assert_eq!(
            parse_test_host("6b5742d9-722b-4d12-848a-c42da771b806.l4.test.example", V4, V6),
            None
        );
        // Invalid UUID ("otr-..." surrogate identifiers land here too).
        assert_eq!(
            parse_test_host("otr-6b5742d9-722b-4d12-848a-c42da771b8-1.l4.test.example", V4, V6),
            None
        );
        // Zero and negative numbers.
        assert_eq!(
            parse_test_host("6b5742d9-722b-4d12-848a-c42da771b806-0.l4.test.example", V4, V6),
            None
        );
        assert_eq!(
            parse_test_host("6b5742d9-722b-4d12-848a-c42da771b806--1.l4.test.example", V4, V6),
            None
        );
        // Number is not a number.
        assert_eq!(
            parse_test_host("6b5742d9-722b-4d12-848a-c42da771b806-x.l4.test.example", V4, V6),
            None
        );
    }

    fn claimer_with_storage() -> (HostClaimer, Arc<Storage>, String) {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let mut test = Test {
            id: 0,
            test_id: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            client_ip: "192.0.2.5".parse().unwrap(),
            client_version: "TEST".into(),
            flash_version: String::new(),
            user_agent: String::new(),
            user_comment: String::new(),
            has_failed: false,
            is_mitm: false,
            is_pending: true,
        };
        storage
            .create_test(
                &mut test,
                &[SubtestSpec {
                    number: 3,
                    max_tls_version: VERSION_TLS13,
                    is_ipv6: false,
                }],
            )
            .unwrap();

        let config = Config {
            host_reporter: "reporter.test.example".into(),
            host_suffix_ipv4: V4.into(),
            host_suffix_ipv6: V6.into(),
            mutable_test_period_secs: 900,
            ..Config::default()
        };
        let claimer = HostClaimer::new(&config, storage.clone());
        (claimer, storage, test.test_id)
    }

    #[tokio::test]
    async fn claims_reporter_without_recording() {
        let (claimer, _, _) = claimer_with_storage();
        let decision = claimer.claim("reporter.test.example").await;
        assert_eq!(decision, ClaimDecision::claimed(0));

        // Hostnames are matched case-insensitively.
        let decision = claimer.claim("Reporter.TEST.example").await;
        assert_eq!(decision, ClaimDecision::claimed(0));
    }

    #[tokio::test]
    async fn claims_live_subtest_with_recording() {
        let (claimer, _, test_id) = claimer_with_storage();
        let decision = claimer.claim(&format!("{test_id}-3{V4}")).await;
        assert!(decision.claimed);
        assert!(decision.subtest_id > 0);
    }

    #[tokio::test]
    async fn unknown_subtest_serves_without_recording() {
        let (claimer, _, test_id) = claimer_with_storage();
        for host in [
            format!("{test_id}-7{V4}"),                                 // wrong number
            format!("00000000-0000-4000-8000-000000000000-3{V4}"),      // unknown test
            format!("not-a-uuid-3{V4}"),                                // invalid UUID
        ] {
            let decision = claimer.claim(&host).await;
            assert_eq!(decision, ClaimDecision::claimed(0), "host {host}");
        }
    }

    #[tokio::test]
    async fn finished_test_is_not_recorded() {
        let (claimer, storage, test_id) = claimer_with_storage();
        let crate::storage::EditCheck::Editable(key) =
            storage.check_test_edit_allowed(&test_id, 900).unwrap()
        else {
            panic!("expected editable test");
        };
        storage.update_test(key, None, Some(false)).unwrap();

        let decision = claimer.claim(&format!("{test_id}-3{V4}")).await;
        assert_eq!(decision, ClaimDecision::claimed(0));
    }

    #[tokio::test]
    async fn other_hosts_are_not_claimed() {
        let (claimer, _, _) = claimer_with_storage();
        assert_eq!(claimer.claim("example.com").await, ClaimDecision::unclaimed());
        assert_eq!(claimer.claim("").await, ClaimDecision::unclaimed());
    }
}
