// gatecrash/src/store.rs
//
// Embedded relational store. Every pipeline step reads one stage table and
// writes the next; a stage is either fully present or absent, so re-running
// a step is always safe. The store owns the single connection — all writes
// go through it.

use std::path::Path;

use bytes::Bytes;
use chrono::Utc;
use rusqlite::{params, Connection};
use tracing::debug;

use crate::error::Result;
use crate::records::{
    DbLogLevel, HeaderMap, MatchingMode, PairRecord, ReplayResult, RequestRecord, RunMode,
    Vulnerability,
};
use crate::similarity::MatchOutcome;
use crate::strip::ContentsHashes;

/// Stage/table names. Each filter writes its own table so earlier stages
/// stay inspectable until the retention policy drops them.
pub mod stage {
    pub const CRAWLING: &str = "crawling_results";
    pub const AFTER_DEDUP: &str = "crawling_results_after_deduplication_filter";
    pub const AFTER_PUBLIC: &str = "crawling_results_after_public_content_filter";
    pub const AFTER_STATIC: &str = "crawling_results_after_static_content_filter";
    pub const AFTER_STANDARD: &str = "crawling_results_after_standard_pages_filter";
    pub const AFTER_OTHER_USER: &str = "crawling_results_after_other_user_content_filter";
    pub const REPLAY_RESULTS: &str = "replay_testing_results";
    pub const VULNS_REPLAY: &str = "vulnerabilities_after_replay_testing";
    pub const VULNS_VERIFIED: &str = "vulnerabilities_after_findings_verifier";
    pub const MATCHING: &str = "matching_results";
    pub const EXECUTION_TIME: &str = "execution_time";
}

/// Trace classes in the matching_results table.
pub const CLASS_REPLAY_VALIDATOR: &str = "replay_similarity_validator";
pub const CLASS_FINDINGS_VERIFIER: &str = "findings_verifier";

const REQUEST_COLUMNS: &str = "id, first_user, crawler, request_url, request_header, \
     request_method, request_body, response_status_code, response_header, response_body";

const REQUEST_SCHEMA: &str = "(id INTEGER PRIMARY KEY, first_user TEXT NOT NULL, \
     crawler TEXT NOT NULL, request_url TEXT NOT NULL, request_header TEXT NOT NULL, \
     request_method TEXT NOT NULL, request_body BLOB NOT NULL, \
     response_status_code INTEGER NOT NULL, response_header TEXT NOT NULL, \
     response_body BLOB NOT NULL)";

const PAIR_SCHEMA: &str = "(id INTEGER PRIMARY KEY, first_user TEXT NOT NULL, \
     second_user TEXT NOT NULL, crawler TEXT NOT NULL, request_url TEXT NOT NULL, \
     request_header TEXT NOT NULL, request_method TEXT NOT NULL, request_body BLOB NOT NULL, \
     response_status_code INTEGER NOT NULL, response_header TEXT NOT NULL, \
     response_body BLOB NOT NULL)";

pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            conn: Connection::open(path)?,
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
        })
    }

    // ── Run preparation ───────────────────────────────────────────────────────

    /// Drop whatever the selected run mode is about to recreate, so each
    /// phase starts from a clean slate and reruns are deterministic.
    pub fn prepare_run(&mut self, mode: RunMode) -> Result<()> {
        if mode.crawl() {
            self.conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {crawl} {schema};",
                crawl = stage::CRAWLING,
                schema = capture_schema(),
            ))?;
        } else if mode.filter() {
            for table in [
                stage::AFTER_DEDUP,
                stage::AFTER_PUBLIC,
                stage::AFTER_STATIC,
                stage::AFTER_STANDARD,
                stage::AFTER_OTHER_USER,
                stage::REPLAY_RESULTS,
                stage::VULNS_REPLAY,
                stage::VULNS_VERIFIED,
                stage::MATCHING,
            ] {
                self.drop_stage(table)?;
            }
        } else if mode.replay() {
            for table in [
                stage::REPLAY_RESULTS,
                stage::VULNS_REPLAY,
                stage::VULNS_VERIFIED,
            ] {
                self.drop_stage(table)?;
            }
            self.delete_matching_class(CLASS_REPLAY_VALIDATOR)?;
        } else {
            self.drop_stage(stage::VULNS_VERIFIED)?;
            self.delete_matching_class(CLASS_FINDINGS_VERIFIER)?;
        }
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {time} \
             (id INTEGER PRIMARY KEY, step TEXT NOT NULL, seconds REAL NOT NULL);",
            time = stage::EXECUTION_TIME,
        ))?;
        self.vacuum()
    }

    fn delete_matching_class(&self, class: &str) -> Result<()> {
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![stage::MATCHING],
            |row| row.get(0),
        )?;
        if exists {
            self.conn.execute(
                &format!("DELETE FROM {} WHERE class = ?1", stage::MATCHING),
                params![class],
            )?;
        }
        Ok(())
    }

    // ── Capture stage ─────────────────────────────────────────────────────────

    /// Insert a captured exchange. With `duplicate_check` on, an exchange
    /// whose fingerprint was already seen for the same user is skipped.
    /// Returns whether a row was written.
    pub fn insert_capture(
        &mut self,
        record: &RequestRecord,
        fingerprint: &str,
        duplicate_check: bool,
    ) -> Result<bool> {
        if duplicate_check {
            let seen: bool = self.conn.query_row(
                &format!(
                    "SELECT EXISTS(SELECT 1 FROM {} WHERE first_user = ?1 AND fingerprint = ?2)",
                    stage::CRAWLING
                ),
                params![record.first_user, fingerprint],
                |row| row.get(0),
            )?;
            if seen {
                return Ok(false);
            }
        }
        self.conn.execute(
            &format!(
                "INSERT INTO {} (first_user, crawler, request_url, request_header, \
                 request_method, request_body, response_status_code, response_header, \
                 response_body, fingerprint) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                stage::CRAWLING
            ),
            params![
                record.first_user,
                record.crawler,
                record.url,
                record.headers.to_json(),
                record.method,
                record.body.as_ref(),
                record.status,
                record.response_headers.to_json(),
                record.response_body.as_ref(),
                fingerprint,
            ],
        )?;
        Ok(true)
    }

    // ── Request stages ────────────────────────────────────────────────────────

    pub fn load_requests(&self, stage_name: &str) -> Result<Vec<RequestRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {REQUEST_COLUMNS} FROM {stage_name} ORDER BY id"
        ))?;
        let rows = stmt.query_map([], row_to_request)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn load_requests_for_user(&self, stage_name: &str, user: &str) -> Result<Vec<RequestRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {REQUEST_COLUMNS} FROM {stage_name} WHERE first_user = ?1 ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![user], row_to_request)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn distinct_users(&self, stage_name: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT DISTINCT first_user FROM {stage_name} ORDER BY first_user"
        ))?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Create `stage_name` afresh and fill it with `records`. Row ids are
    /// reassigned; nothing downstream may hold on to old ids across stages.
    pub fn write_requests(&mut self, stage_name: &str, records: &[RequestRecord]) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS {stage_name};
             CREATE TABLE {stage_name} {REQUEST_SCHEMA};"
        ))?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {stage_name} (first_user, crawler, request_url, request_header, \
                 request_method, request_body, response_status_code, response_header, \
                 response_body) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ))?;
            for record in records {
                stmt.execute(params![
                    record.first_user,
                    record.crawler,
                    record.url,
                    record.headers.to_json(),
                    record.method,
                    record.body.as_ref(),
                    record.status,
                    record.response_headers.to_json(),
                    record.response_body.as_ref(),
                ])?;
            }
        }
        tx.commit()?;
        debug!("wrote {} rows into {}", records.len(), stage_name);
        Ok(())
    }

    // ── Pair stage ────────────────────────────────────────────────────────────

    /// Append one pair's surviving rows. The table accumulates rows across
    /// all ordered user pairs, so it is created lazily and never dropped
    /// here — `prepare_run` clears it at the start of a filter run.
    pub fn append_pair_records(&mut self, stage_name: &str, records: &[PairRecord]) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {stage_name} {PAIR_SCHEMA};"
        ))?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {stage_name} (first_user, second_user, crawler, request_url, \
                 request_header, request_method, request_body, response_status_code, \
                 response_header, response_body) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ))?;
            for pair in records {
                let record = &pair.record;
                stmt.execute(params![
                    record.first_user,
                    pair.second_user,
                    record.crawler,
                    record.url,
                    record.headers.to_json(),
                    record.method,
                    record.body.as_ref(),
                    record.status,
                    record.response_headers.to_json(),
                    record.response_body.as_ref(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_pair_records(
        &self,
        stage_name: &str,
        first_user: &str,
        second_user: &str,
    ) -> Result<Vec<PairRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, first_user, second_user, crawler, request_url, request_header, \
             request_method, request_body, response_status_code, response_header, \
             response_body FROM {stage_name} WHERE first_user = ?1 AND second_user = ?2 \
             ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![first_user, second_user], |row| {
            Ok(PairRecord {
                second_user: row.get(2)?,
                record: RequestRecord {
                    id: row.get(0)?,
                    first_user: row.get(1)?,
                    crawler: row.get(3)?,
                    url: row.get(4)?,
                    headers: HeaderMap::from_json(&row.get::<_, String>(5)?),
                    method: row.get(6)?,
                    body: Bytes::from(row.get::<_, Vec<u8>>(7)?),
                    status: row.get::<_, i64>(8)? as u16,
                    response_headers: HeaderMap::from_json(&row.get::<_, String>(9)?),
                    response_body: Bytes::from(row.get::<_, Vec<u8>>(10)?),
                },
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ── Replay results and vulnerabilities ────────────────────────────────────

    pub fn create_replay_tables(&self) -> Result<()> {
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {replay} \
             (id INTEGER PRIMARY KEY, first_user TEXT NOT NULL, second_user TEXT NOT NULL, \
              request_url TEXT NOT NULL, request_method TEXT NOT NULL, \
              request_header TEXT NOT NULL, request_body BLOB NOT NULL, \
              response_status_code INTEGER NOT NULL, response_header TEXT NOT NULL, \
              response_body BLOB NOT NULL, created_at TEXT NOT NULL);
             CREATE TABLE IF NOT EXISTS {vulns} \
             (id INTEGER PRIMARY KEY, first_user TEXT NOT NULL, second_user TEXT NOT NULL, \
              request_url TEXT NOT NULL, request_method TEXT NOT NULL, \
              request_header TEXT NOT NULL, request_body BLOB NOT NULL, \
              created_at TEXT NOT NULL);",
            replay = stage::REPLAY_RESULTS,
            vulns = stage::VULNS_REPLAY,
        ))?;
        Ok(())
    }

    pub fn insert_replay_result(&mut self, result: &ReplayResult) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO {} (first_user, second_user, request_url, request_method, \
                 request_header, request_body, response_status_code, response_header, \
                 response_body, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                stage::REPLAY_RESULTS
            ),
            params![
                result.first_user,
                result.second_user,
                result.url,
                result.method,
                result.sent_headers.to_json(),
                result.sent_body.as_ref(),
                result.status,
                result.response_headers.to_json(),
                result.response_body.as_ref(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn load_replay_results(
        &self,
        first_user: &str,
        second_user: &str,
    ) -> Result<Vec<ReplayResult>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT first_user, second_user, request_url, request_method, request_header, \
             request_body, response_status_code, response_header, response_body \
             FROM {} WHERE first_user = ?1 AND second_user = ?2 ORDER BY id",
            stage::REPLAY_RESULTS
        ))?;
        let rows = stmt.query_map(params![first_user, second_user], |row| {
            Ok(ReplayResult {
                first_user: row.get(0)?,
                second_user: row.get(1)?,
                url: row.get(2)?,
                method: row.get(3)?,
                sent_headers: HeaderMap::from_json(&row.get::<_, String>(4)?),
                sent_body: Bytes::from(row.get::<_, Vec<u8>>(5)?),
                status: row.get::<_, i64>(6)? as u16,
                response_headers: HeaderMap::from_json(&row.get::<_, String>(7)?),
                response_body: Bytes::from(row.get::<_, Vec<u8>>(8)?),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn insert_candidate(
        &mut self,
        first_user: &str,
        second_user: &str,
        url: &str,
        method: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO {} (first_user, second_user, request_url, request_method, \
                 request_header, request_body, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                stage::VULNS_REPLAY
            ),
            params![
                first_user,
                second_user,
                url,
                method,
                headers.to_json(),
                body,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn load_candidates(&self, first_user: &str, second_user: &str) -> Result<Vec<Vulnerability>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, first_user, second_user, request_url, request_method, request_header, \
             request_body FROM {} WHERE first_user = ?1 AND second_user = ?2 ORDER BY id",
            stage::VULNS_REPLAY
        ))?;
        let rows = stmt.query_map(params![first_user, second_user], |row| {
            Ok(Vulnerability {
                id: row.get(0)?,
                first_user: row.get(1)?,
                second_user: row.get(2)?,
                url: row.get(3)?,
                method: row.get(4)?,
                headers: HeaderMap::from_json(&row.get::<_, String>(5)?),
                body: Bytes::from(row.get::<_, Vec<u8>>(6)?),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn create_verified_table(&self) -> Result<()> {
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} \
             (id INTEGER PRIMARY KEY, first_user TEXT NOT NULL, second_user TEXT NOT NULL, \
              request_url TEXT NOT NULL, request_method TEXT NOT NULL, \
              request_header TEXT NOT NULL, request_body BLOB NOT NULL, \
              created_at TEXT NOT NULL);",
            stage::VULNS_VERIFIED
        ))?;
        Ok(())
    }

    /// Verified findings keep the candidate's id so the two tables stay
    /// joinable.
    pub fn insert_verified(&mut self, finding: &Vulnerability) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO {} (id, first_user, second_user, request_url, request_method, \
                 request_header, request_body, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                stage::VULNS_VERIFIED
            ),
            params![
                finding.id,
                finding.first_user,
                finding.second_user,
                finding.url,
                finding.method,
                finding.headers.to_json(),
                finding.body.as_ref(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// `(first_user, second_user, method, url)` rows for the console report.
    pub fn list_findings(&self, verified: bool) -> Result<Vec<(String, String, String, String)>> {
        let table = if verified {
            stage::VULNS_VERIFIED
        } else {
            stage::VULNS_REPLAY
        };
        let mut stmt = self.conn.prepare(&format!(
            "SELECT first_user, second_user, request_method, request_url FROM {table} ORDER BY id"
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ── Matching trace ────────────────────────────────────────────────────────

    /// Record one similarity comparison, subject to the retention policy:
    /// `dev` keeps everything, `dev-reduced` keeps only the replay
    /// validator's traces, `prod` keeps none.
    pub fn record_matching(&mut self, trace: &MatchTrace<'_>, level: DbLogLevel) -> Result<()> {
        let keep = match level {
            DbLogLevel::Dev => true,
            DbLogLevel::DevReduced => trace.class == CLASS_REPLAY_VALIDATOR,
            DbLogLevel::Prod => false,
        };
        if !keep {
            return Ok(());
        }
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} \
             (id INTEGER PRIMARY KEY, class TEXT NOT NULL, first_user TEXT NOT NULL, \
              second_user TEXT NOT NULL, method TEXT NOT NULL, url1 TEXT NOT NULL, url2 TEXT, \
              inter_score_narrow INTEGER, inter_score_broad INTEGER, result_narrow INTEGER, \
              result_broad INTEGER, result INTEGER NOT NULL, mode TEXT NOT NULL, \
              stripped1_narrow TEXT NOT NULL, stripped2_narrow TEXT NOT NULL, \
              stripped1_broad TEXT NOT NULL, stripped2_broad TEXT NOT NULL, \
              created_at TEXT NOT NULL);",
            stage::MATCHING
        ))?;
        self.conn.execute(
            &format!(
                "INSERT INTO {} (class, first_user, second_user, method, url1, url2, \
                 inter_score_narrow, inter_score_broad, result_narrow, result_broad, result, \
                 mode, stripped1_narrow, stripped2_narrow, stripped1_broad, stripped2_broad, \
                 created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, \
                 ?14, ?15, ?16, ?17)",
                stage::MATCHING
            ),
            params![
                trace.class,
                trace.first_user,
                trace.second_user,
                trace.method,
                trace.url1,
                trace.url2,
                trace.outcome.score_narrow,
                trace.outcome.score_broad,
                trace.outcome.result_narrow,
                trace.outcome.result_broad,
                trace.outcome.similar,
                trace.mode.to_string(),
                trace.stripped1.narrow.join(" "),
                trace.stripped2.narrow.join(" "),
                trace.stripped1.broad.join(" "),
                trace.stripped2.broad.join(" "),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn matching_rows(&self, class: &str) -> Result<u64> {
        let count: u64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE class = ?1", stage::MATCHING),
            params![class],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ── Housekeeping ──────────────────────────────────────────────────────────

    pub fn record_execution_time(&mut self, step: &str, seconds: f64) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO {} (step, seconds) VALUES (?1, ?2)",
                stage::EXECUTION_TIME
            ),
            params![step, seconds],
        )?;
        Ok(())
    }

    pub fn drop_stage(&self, stage_name: &str) -> Result<()> {
        debug!("dropping stage {stage_name}");
        self.conn
            .execute_batch(&format!("DROP TABLE IF EXISTS {stage_name};"))?;
        Ok(())
    }

    pub fn vacuum(&self) -> Result<()> {
        self.conn.execute_batch("VACUUM;")?;
        Ok(())
    }
}

fn capture_schema() -> String {
    REQUEST_SCHEMA.replacen(
        "response_body BLOB NOT NULL)",
        "response_body BLOB NOT NULL, fingerprint TEXT NOT NULL)",
        1,
    )
}

fn row_to_request(row: &rusqlite::Row<'_>) -> rusqlite::Result<RequestRecord> {
    Ok(RequestRecord {
        id: row.get(0)?,
        first_user: row.get(1)?,
        crawler: row.get(2)?,
        url: row.get(3)?,
        headers: HeaderMap::from_json(&row.get::<_, String>(4)?),
        method: row.get(5)?,
        body: Bytes::from(row.get::<_, Vec<u8>>(6)?),
        status: row.get::<_, i64>(7)? as u16,
        response_headers: HeaderMap::from_json(&row.get::<_, String>(8)?),
        response_body: Bytes::from(row.get::<_, Vec<u8>>(9)?),
    })
}

/// One similarity comparison, ready for the trace table.
pub struct MatchTrace<'a> {
    pub class:       &'a str,
    pub first_user:  &'a str,
    pub second_user: &'a str,
    pub method:      &'a str,
    pub url1:        &'a str,
    pub url2:        Option<&'a str>,
    pub mode:        MatchingMode,
    pub outcome:     &'a MatchOutcome,
    pub stripped1:   &'a ContentsHashes,
    pub stripped2:   &'a ContentsHashes,
}
