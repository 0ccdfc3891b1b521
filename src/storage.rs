//! SQL persistence for tests, subtests and captures.
//!
//! SQLite in WAL mode behind a single connection. Callers on async hot paths
//! (the host claimer, the capture emitter) go through `spawn_blocking`; the
//! reporter handlers call in directly since every statement is indexed and
//! short.

use std::net::IpAddr;
use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::models::{ClientCapture, ServerCapture, Subtest, SubtestSpec, Test};

/// Result of the edit-window check shared by test mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditCheck {
    NotFound,
    /// The test exists but is finished or past its mutable period.
    Locked,
    /// The test may be modified; carries the internal row key.
    Editable(i64),
}

/// Result of storing a client capture submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientResultOutcome {
    SubtestNotFound,
    Duplicate,
    Created(i64),
}

pub struct Storage {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tests (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    test_id         TEXT NOT NULL UNIQUE,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    client_ip       TEXT NOT NULL,
    client_version  TEXT NOT NULL,
    flash_version   TEXT NOT NULL,
    user_agent      TEXT NOT NULL,
    user_comment    TEXT NOT NULL DEFAULT '',
    has_failed      INTEGER NOT NULL DEFAULT 0,
    is_mitm         INTEGER NOT NULL DEFAULT 0,
    is_pending      INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE IF NOT EXISTS subtests (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    test_id         INTEGER NOT NULL REFERENCES tests(id) ON DELETE CASCADE,
    number          INTEGER NOT NULL,
    max_tls_version INTEGER NOT NULL,
    is_ipv6         INTEGER NOT NULL,
    has_failed      INTEGER NOT NULL DEFAULT 0,
    is_mitm         INTEGER NOT NULL DEFAULT 0,
    UNIQUE (test_id, number)
);
CREATE TABLE IF NOT EXISTS client_captures (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    subtest_id          INTEGER NOT NULL REFERENCES subtests(id) ON DELETE CASCADE,
    created_at          TEXT NOT NULL,
    begin_time          TEXT NOT NULL,
    end_time            TEXT NOT NULL,
    actual_tls_version  INTEGER NOT NULL,
    frames              TEXT NOT NULL,
    key_log             TEXT NOT NULL,
    has_failed          INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS server_captures (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    subtest_id          INTEGER NOT NULL REFERENCES subtests(id) ON DELETE CASCADE,
    created_at          TEXT NOT NULL,
    begin_time          TEXT NOT NULL,
    end_time            TEXT NOT NULL,
    actual_tls_version  INTEGER NOT NULL,
    frames              TEXT NOT NULL,
    key_log             TEXT NOT NULL,
    has_failed          INTEGER NOT NULL,
    client_ip           TEXT NOT NULL,
    server_ip           TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_subtests_test ON subtests(test_id, number);
";

fn encode_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_time(value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn decode_ip(value: String) -> rusqlite::Result<IpAddr> {
    value.parse().map_err(|e: std::net::AddrParseError| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

impl Storage {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> anyhow::Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA).context("failed to apply schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Creates a test run and its subtests in one transaction. Fills in the
    /// generated test id, row key and timestamps.
    pub fn create_test(&self, test: &mut Test, specs: &[SubtestSpec]) -> anyhow::Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        test.test_id = Uuid::new_v4().to_string();
        test.created_at = Utc::now();
        test.updated_at = test.created_at;
        tx.execute(
            "INSERT INTO tests (
                test_id, created_at, updated_at, client_ip, client_version,
                flash_version, user_agent, user_comment, has_failed, is_mitm, is_pending
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                test.test_id,
                encode_time(test.created_at),
                encode_time(test.updated_at),
                test.client_ip.to_string(),
                test.client_version,
                test.flash_version,
                test.user_agent,
                test.user_comment,
                test.has_failed,
                test.is_mitm,
                test.is_pending,
            ],
        )?;
        test.id = tx.last_insert_rowid();

        for spec in specs {
            tx.execute(
                "INSERT INTO subtests (test_id, number, max_tls_version, is_ipv6)
                 VALUES (?1, ?2, ?3, ?4)",
                params![test.id, spec.number, spec.max_tls_version, spec.is_ipv6],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// The claimer contract: returns the subtest row key iff a test with
    /// this UUID exists, the subtest number matches, the test is still
    /// pending and younger than `max_age_secs`. Zero otherwise.
    pub fn query_subtest(&self, test_uuid: &str, number: i64, max_age_secs: i64) -> anyhow::Result<i64> {
        let conn = self.conn.lock();
        let id: Option<i64> = conn
            .query_row(
                "SELECT subtests.id
                 FROM subtests
                 JOIN tests ON tests.id = subtests.test_id
                 WHERE tests.test_id = ?1
                   AND subtests.number = ?2
                   AND tests.is_pending
                   AND strftime('%s', 'now') - strftime('%s', tests.created_at) < ?3",
                params![test_uuid, number, max_age_secs],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.unwrap_or(0))
    }

    /// Stores a finished server capture. The capture's `subtest_id` is the
    /// subtest row key handed out by [`Storage::query_subtest`].
    pub fn insert_server_capture(&self, capture: &ServerCapture) -> anyhow::Result<i64> {
        anyhow::ensure!(capture.capture.subtest_id != 0, "subtest id must be initialized");
        let frames = serde_json::to_string(&capture.capture.frames)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO server_captures (
                subtest_id, created_at, begin_time, end_time, actual_tls_version,
                frames, key_log, has_failed, client_ip, server_ip
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                capture.capture.subtest_id,
                encode_time(Utc::now()),
                encode_time(capture.capture.begin_time),
                encode_time(capture.capture.end_time),
                capture.capture.actual_tls_version,
                frames,
                capture.capture.key_log,
                capture.capture.has_failed,
                capture.client_ip.to_string(),
                capture.server_ip.to_string(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Checks whether a test exists and may still be modified.
    pub fn check_test_edit_allowed(&self, test_uuid: &str, max_age_secs: i64) -> anyhow::Result<EditCheck> {
        let conn = self.conn.lock();
        let row: Option<(i64, bool, bool)> = conn
            .query_row(
                "SELECT id, is_pending,
                        strftime('%s', 'now') - strftime('%s', created_at) < ?2
                 FROM tests WHERE test_id = ?1",
                params![test_uuid, max_age_secs],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        Ok(match row {
            None => EditCheck::NotFound,
            Some((_, false, _)) | Some((_, _, false)) => EditCheck::Locked,
            Some((key, true, true)) => EditCheck::Editable(key),
        })
    }

    /// Applies the requested changes to a still-pending test. Returns false
    /// when the test got locked in the meantime.
    pub fn update_test(
        &self,
        key: i64,
        user_comment: Option<&str>,
        is_pending: Option<bool>,
    ) -> anyhow::Result<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE tests SET
                user_comment = COALESCE(?2, user_comment),
                is_pending = COALESCE(?3, is_pending),
                updated_at = ?4
             WHERE id = ?1 AND is_pending",
            params![key, user_comment, is_pending, encode_time(Utc::now())],
        )?;
        Ok(n > 0)
    }

    /// Stores a client-side capture for a subtest, refusing duplicates.
    pub fn insert_client_capture(
        &self,
        test_key: i64,
        number: i64,
        capture: &ClientCapture,
    ) -> anyhow::Result<ClientResultOutcome> {
        let frames = serde_json::to_string(&capture.capture.frames)?;
        let conn = self.conn.lock();
        let row: Option<(i64, Option<i64>)> = conn
            .query_row(
                "SELECT subtests.id, client_captures.id
                 FROM subtests
                 LEFT JOIN client_captures ON subtests.id = client_captures.subtest_id
                 WHERE subtests.test_id = ?1 AND subtests.number = ?2",
                params![test_key, number],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let subtest_id = match row {
            None => return Ok(ClientResultOutcome::SubtestNotFound),
            Some((_, Some(_))) => return Ok(ClientResultOutcome::Duplicate),
            Some((subtest_id, None)) => subtest_id,
        };

        conn.execute(
            "INSERT INTO client_captures (
                subtest_id, created_at, begin_time, end_time, actual_tls_version,
                frames, key_log, has_failed
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                subtest_id,
                encode_time(Utc::now()),
                encode_time(capture.capture.begin_time),
                encode_time(capture.capture.end_time),
                capture.capture.actual_tls_version,
                frames,
                capture.capture.key_log,
                capture.capture.has_failed,
            ],
        )?;
        Ok(ClientResultOutcome::Created(conn.last_insert_rowid()))
    }

    /// Subtests of a test run, `None` when the test does not exist.
    pub fn list_subtests(&self, test_uuid: &str) -> anyhow::Result<Option<Vec<Subtest>>> {
        let conn = self.conn.lock();
        let test_key: Option<i64> = conn
            .query_row(
                "SELECT id FROM tests WHERE test_id = ?1",
                params![test_uuid],
                |row| row.get(0),
            )
            .optional()?;
        let Some(test_key) = test_key else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT id, test_id, number, max_tls_version, is_ipv6, has_failed, is_mitm
             FROM subtests WHERE test_id = ?1 ORDER BY number",
        )?;
        let subtests = stmt
            .query_map(params![test_key], |row| {
                Ok(Subtest {
                    id: row.get(0)?,
                    test_id: row.get(1)?,
                    number: row.get(2)?,
                    max_tls_version: row.get(3)?,
                    is_ipv6: row.get(4)?,
                    has_failed: row.get(5)?,
                    is_mitm: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(subtests))
    }

    pub fn list_tests(&self) -> anyhow::Result<Vec<Test>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, test_id, created_at, updated_at, client_ip, client_version,
                    flash_version, user_agent, user_comment, has_failed, is_mitm, is_pending
             FROM tests ORDER BY id",
        )?;
        let tests = stmt
            .query_map([], scan_test)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tests)
    }

    pub fn get_test(&self, test_uuid: &str) -> anyhow::Result<Option<Test>> {
        let conn = self.conn.lock();
        let test = conn
            .query_row(
                "SELECT id, test_id, created_at, updated_at, client_ip, client_version,
                        flash_version, user_agent, user_comment, has_failed, is_mitm, is_pending
                 FROM tests WHERE test_id = ?1",
                params![test_uuid],
                scan_test,
            )
            .optional()?;
        Ok(test)
    }

    pub fn delete_test(&self, test_uuid: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock();
        let n = conn.execute("DELETE FROM tests WHERE test_id = ?1", params![test_uuid])?;
        Ok(n > 0)
    }
}

fn scan_test(row: &Row<'_>) -> rusqlite::Result<Test> {
    Ok(Test {
        id: row.get(0)?,
        test_id: row.get(1)?,
        created_at: decode_time(row.get(2)?)?,
        updated_at: decode_time(row.get(3)?)?,
        client_ip: decode_ip(row.get(4)?)?,
        client_version: row.get(5)?,
        flash_version: row.get(6)?,
        user_agent: row.get(7)?,
        user_comment: row.get(8)?,
        has_failed: row.get(9)?,
        is_mitm: row.get(10)?,
        is_pending: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Capture, Frame, VERSION_TLS12, VERSION_TLS13};

    fn new_test() -> Test {
        Test {
            id: 0,
            test_id: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            client_ip: "198.51.100.2".parse().unwrap(),
            client_version: "TEST".into(),
            flash_version: String::new(),
            user_agent: "unit test".into(),
            user_comment: String::new(),
            has_failed: false,
            is_mitm: false,
            is_pending: true,
        }
    }

    fn specs() -> Vec<SubtestSpec> {
        vec![
            SubtestSpec {
                number: 1,
                max_tls_version: VERSION_TLS12,
                is_ipv6: false,
            },
            SubtestSpec {
                number: 2,
                max_tls_version: VERSION_TLS13,
                is_ipv6: true,
            },
        ]
    }

    fn capture(subtest_id: i64) -> Capture {
        Capture {
            id: 0,
            subtest_id,
            created_at: Utc::now(),
            begin_time: Utc::now(),
            end_time: Utc::now(),
            actual_tls_version: VERSION_TLS13,
            frames: vec![Frame {
                time: Utc::now(),
                is_read: true,
                data: vec![22, 3, 1],
            }],
            key_log: "CLIENT_HANDSHAKE_TRAFFIC_SECRET aa bb\n".into(),
            has_failed: false,
        }
    }

    #[test]
    fn create_test_assigns_uuid_and_subtests() {
        let storage = Storage::open_in_memory().unwrap();
        let mut test = new_test();
        storage.create_test(&mut test, &specs()).unwrap();

        assert_eq!(test.test_id.len(), 36);
        assert!(test.id > 0);
        assert!(storage.query_subtest(&test.test_id, 1, 900).unwrap() > 0);
        assert!(storage.query_subtest(&test.test_id, 2, 900).unwrap() > 0);
    }

    #[test]
    fn query_subtest_misses_yield_zero() {
        let storage = Storage::open_in_memory().unwrap();
        let mut test = new_test();
        storage.create_test(&mut test, &specs()).unwrap();

        // Unknown UUID, wrong number.
        assert_eq!(
            storage
                .query_subtest("00000000-0000-4000-8000-000000000000", 1, 900)
                .unwrap(),
            0
        );
        assert_eq!(storage.query_subtest(&test.test_id, 9, 900).unwrap(), 0);

        // Finished test.
        let EditCheck::Editable(key) = storage.check_test_edit_allowed(&test.test_id, 900).unwrap()
        else {
            panic!("expected editable test");
        };
        storage.update_test(key, None, Some(false)).unwrap();
        assert_eq!(storage.query_subtest(&test.test_id, 1, 900).unwrap(), 0);
    }

    #[test]
    fn query_subtest_respects_mutable_period() {
        let storage = Storage::open_in_memory().unwrap();
        let mut test = new_test();
        storage.create_test(&mut test, &specs()).unwrap();

        // An age limit of zero means every test is already stale.
        assert_eq!(storage.query_subtest(&test.test_id, 1, 0).unwrap(), 0);
        assert!(storage.query_subtest(&test.test_id, 1, 900).unwrap() > 0);
    }

    #[test]
    fn server_capture_round_trip() {
        let storage = Storage::open_in_memory().unwrap();
        let mut test = new_test();
        storage.create_test(&mut test, &specs()).unwrap();
        let subtest_id = storage.query_subtest(&test.test_id, 1, 900).unwrap();

        let id = storage
            .insert_server_capture(&ServerCapture {
                capture: capture(subtest_id),
                client_ip: "203.0.113.9".parse().unwrap(),
                server_ip: "192.0.2.1".parse().unwrap(),
            })
            .unwrap();
        assert!(id > 0);
    }

    #[test]
    fn server_capture_requires_subtest() {
        let storage = Storage::open_in_memory().unwrap();
        let result = storage.insert_server_capture(&ServerCapture {
            capture: capture(0),
            client_ip: "203.0.113.9".parse().unwrap(),
            server_ip: "192.0.2.1".parse().unwrap(),
        });
        assert!(result.is_err());
    }

    #[test]
    fn client_capture_rejects_duplicates_and_unknown_subtests() {
        let storage = Storage::open_in_memory().unwrap();
        let mut test = new_test();
        storage.create_test(&mut test, &specs()).unwrap();

        let submission = ClientCapture {
            capture: capture(0),
        };
        assert!(matches!(
            storage.insert_client_capture(test.id, 1, &submission).unwrap(),
            ClientResultOutcome::Created(_)
        ));
        assert_eq!(
            storage.insert_client_capture(test.id, 1, &submission).unwrap(),
            ClientResultOutcome::Duplicate
        );
        assert_eq!(
            storage.insert_client_capture(test.id, 5, &submission).unwrap(),
            ClientResultOutcome::SubtestNotFound
        );
    }

    #[test]
    fn update_and_lock_test() {
        let storage = Storage::open_in_memory().unwrap();
        let mut test = new_test();
        storage.create_test(&mut test, &specs()).unwrap();

        let EditCheck::Editable(key) = storage.check_test_edit_allowed(&test.test_id, 900).unwrap()
        else {
            panic!("expected editable test");
        };
        assert!(storage.update_test(key, Some("looks clean"), None).unwrap());

        // Mark done: further edits are refused.
        assert!(storage.update_test(key, None, Some(false)).unwrap());
        assert!(!storage.update_test(key, Some("too late"), None).unwrap());
        assert_eq!(
            storage.check_test_edit_allowed(&test.test_id, 900).unwrap(),
            EditCheck::Locked
        );

        let stored = storage.get_test(&test.test_id).unwrap().unwrap();
        assert_eq!(stored.user_comment, "looks clean");
        assert!(!stored.is_pending);
    }

    #[test]
    fn lists_subtests_in_order() {
        let storage = Storage::open_in_memory().unwrap();
        assert!(storage
            .list_subtests("6b5742d9-722b-4d12-848a-c42da771b806")
            .unwrap()
            .is_none());

        let mut test = new_test();
        storage.create_test(&mut test, &specs()).unwrap();
        let subtests = storage.list_subtests(&test.test_id).unwrap().unwrap();
        assert_eq!(subtests.len(), 2);
        assert_eq!(subtests[0].number, 1);
        assert_eq!(subtests[0].max_tls_version, VERSION_TLS12);
        assert!(subtests[1].is_ipv6);
    }

    #[test]
    fn list_get_delete_tests() {
        let storage = Storage::open_in_memory().unwrap();
        assert!(storage.list_tests().unwrap().is_empty());
        assert_eq!(
            storage.check_test_edit_allowed("6b5742d9-722b-4d12-848a-c42da771b806", 900).unwrap(),
            EditCheck::NotFound
        );

        let mut test = new_test();
        storage.create_test(&mut test, &specs()).unwrap();
        assert_eq!(storage.list_tests().unwrap().len(), 1);

        let fetched = storage.get_test(&test.test_id).unwrap().unwrap();
        assert_eq!(fetched.client_ip, test.client_ip);
        assert_eq!(fetched.user_agent, "unit test");

        assert!(storage.delete_test(&test.test_id).unwrap());
        assert!(!storage.delete_test(&test.test_id).unwrap());
        assert!(storage.get_test(&test.test_id).unwrap().is_none());
    }
}
