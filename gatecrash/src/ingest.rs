// gatecrash/src/ingest.rs
//
// Capture-boundary ingest. The external crawler/proxy pair writes one JSON
// object per captured exchange into a JSONL log; this module loads that log
// into the crawling_results stage, enforcing the same admission rules the
// proxy applies on the wire: domain allow-listing, the do-not-call regex,
// non-GET blocking outside full mode, and trailing-`?` stripping.

use std::path::Path;

use base64::Engine;
use bytes::Bytes;
use regex::Regex;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::records::{HeaderMap, RequestRecord};
use crate::store::Store;

// ── Capture log format ────────────────────────────────────────────────────────

/// One line of the capture log. Bodies are UTF-8 text in `*_body`, or
/// base64 in `*_body_base64` when the capture was binary.
#[derive(Debug, Deserialize)]
pub struct CaptureLine {
    pub first_user: String,
    #[serde(default)]
    pub crawler: String,
    pub request_url: String,
    pub request_method: String,
    #[serde(default)]
    pub request_headers: HeaderMap,
    #[serde(default)]
    pub request_body: Option<String>,
    #[serde(default)]
    pub request_body_base64: Option<String>,
    pub response_status_code: u16,
    #[serde(default)]
    pub response_headers: HeaderMap,
    #[serde(default)]
    pub response_body: Option<String>,
    #[serde(default)]
    pub response_body_base64: Option<String>,
}

fn decode_body(text: Option<String>, b64: Option<String>) -> std::result::Result<Bytes, String> {
    if let Some(encoded) = b64 {
        return base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(|e| format!("invalid base64 body: {e}"));
    }
    Ok(text.map(Bytes::from).unwrap_or_default())
}

// ── Admission ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// URL matched the do-not-call regex.
    BlockedUrl,
    /// Non-GET method while full mode is off.
    NonGet,
    /// Host is neither an allowed domain nor one of its subdomains.
    OutOfScope,
    UnparsableUrl,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BlockedUrl => write!(f, "blocked by do-not-call list"),
            Self::NonGet => write!(f, "non-GET blocked outside full mode"),
            Self::OutOfScope => write!(f, "outside allowed domains"),
            Self::UnparsableUrl => write!(f, "unparsable URL"),
        }
    }
}

/// The proxy-side admission rules, re-checked at ingest so a stale or
/// hand-edited capture log cannot smuggle out-of-scope exchanges into the
/// pipeline.
#[derive(Debug, Clone)]
pub struct ScopePolicy {
    domains:       Vec<String>,
    do_not_call:   Option<Regex>,
    allow_non_get: bool,
}

impl ScopePolicy {
    pub fn new(domains: Vec<String>, do_not_call: Option<Regex>, allow_non_get: bool) -> Self {
        Self {
            domains,
            do_not_call,
            allow_non_get,
        }
    }

    pub fn evaluate(&self, url: &str, method: &str) -> Option<Rejection> {
        if let Some(re) = &self.do_not_call {
            if re.is_match(url) {
                return Some(Rejection::BlockedUrl);
            }
        }
        if !self.allow_non_get && method != "GET" {
            return Some(Rejection::NonGet);
        }
        let host = match Url::parse(url) {
            Ok(parsed) => match parsed.host_str() {
                Some(host) => host.to_string(),
                None => return Some(Rejection::UnparsableUrl),
            },
            Err(_) => return Some(Rejection::UnparsableUrl),
        };
        let in_scope = self
            .domains
            .iter()
            .any(|domain| host == *domain || host.ends_with(&format!(".{domain}")));
        if in_scope {
            None
        } else {
            Some(Rejection::OutOfScope)
        }
    }
}

// ── Ingest ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct IngestStats {
    pub inserted:     u64,
    pub duplicates:   u64,
    pub rejected:     u64,
    pub parse_errors: u64,
}

/// Load a capture log into the crawling stage. Malformed lines are logged
/// and skipped; rejected and duplicate exchanges are counted, not errors.
pub async fn ingest_capture_log(
    store: &mut Store,
    path: &Path,
    policy: &ScopePolicy,
    duplicate_check: bool,
) -> Result<IngestStats> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| Error::Capture(format!("cannot open {}: {e}", path.display())))?;
    let mut lines = BufReader::new(file).lines();
    let mut stats = IngestStats::default();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let capture: CaptureLine = match serde_json::from_str(line) {
            Ok(capture) => capture,
            Err(e) => {
                warn!("capture line parse error: {e}");
                stats.parse_errors += 1;
                continue;
            }
        };
        let body = match decode_body(capture.request_body, capture.request_body_base64) {
            Ok(body) => body,
            Err(e) => {
                warn!("{} {}: {e}", capture.request_method, capture.request_url);
                stats.parse_errors += 1;
                continue;
            }
        };
        let response_body = match decode_body(capture.response_body, capture.response_body_base64)
        {
            Ok(body) => body,
            Err(e) => {
                warn!("{} {}: {e}", capture.request_method, capture.request_url);
                stats.parse_errors += 1;
                continue;
            }
        };

        let url = normalize_url(capture.request_url);
        if let Some(rejection) = policy.evaluate(&url, &capture.request_method) {
            debug!("rejected {} {url}: {rejection}", capture.request_method);
            stats.rejected += 1;
            continue;
        }

        let record = RequestRecord {
            id: 0,
            first_user: capture.first_user,
            crawler: capture.crawler,
            url,
            headers: capture.request_headers,
            method: capture.request_method,
            body,
            status: capture.response_status_code,
            response_headers: capture.response_headers,
            response_body,
        };
        let fingerprint = exchange_fingerprint(&record);
        if store.insert_capture(&record, &fingerprint, duplicate_check)? {
            stats.inserted += 1;
        } else {
            stats.duplicates += 1;
        }
    }

    info!(
        "ingested {} exchanges ({} rejected, {} duplicates, {} parse errors)",
        stats.inserted, stats.rejected, stats.duplicates, stats.parse_errors
    );
    Ok(stats)
}

/// A URL ending in a lone `?` is stored without it.
fn normalize_url(mut url: String) -> String {
    if url.ends_with('?') {
        url.pop();
    }
    url
}

/// Stable digest of `(user, url, method, body)` for the optional duplicate
/// check during ingest.
pub fn exchange_fingerprint(record: &RequestRecord) -> String {
    let mut hasher = Sha256::new();
    for part in [
        record.first_user.as_bytes(),
        record.url.as_bytes(),
        record.method.as_bytes(),
    ] {
        hasher.update(part);
        hasher.update([0]);
    }
    hasher.update(&record.body);
    hex::encode(&hasher.finalize()[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn policy() -> ScopePolicy {
        ScopePolicy::new(
            vec!["app.test".into()],
            Some(Regex::new("logout|delete-account").unwrap()),
            false,
        )
    }

    #[test]
    fn domain_check_allows_exact_host_and_subdomains() {
        let policy = policy();
        assert_eq!(policy.evaluate("http://app.test/x", "GET"), None);
        assert_eq!(policy.evaluate("http://api.app.test/x", "GET"), None);
        assert_eq!(
            policy.evaluate("http://evilapp.test/x", "GET"),
            Some(Rejection::OutOfScope)
        );
        assert_eq!(
            policy.evaluate("http://other.example/x", "GET"),
            Some(Rejection::OutOfScope)
        );
    }

    #[test]
    fn do_not_call_regex_blocks_first() {
        let policy = policy();
        assert_eq!(
            policy.evaluate("http://app.test/logout", "GET"),
            Some(Rejection::BlockedUrl)
        );
    }

    #[test]
    fn non_get_blocked_outside_full_mode() {
        let policy = policy();
        assert_eq!(
            policy.evaluate("http://app.test/x", "POST"),
            Some(Rejection::NonGet)
        );
        let full = ScopePolicy::new(vec!["app.test".into()], None, true);
        assert_eq!(full.evaluate("http://app.test/x", "POST"), None);
    }

    #[test]
    fn trailing_question_mark_is_stripped() {
        assert_eq!(normalize_url("http://app.test/x?".into()), "http://app.test/x");
        assert_eq!(
            normalize_url("http://app.test/x?a=1".into()),
            "http://app.test/x?a=1"
        );
    }

    #[test]
    fn fingerprints_differ_per_user_and_body() {
        let mut record = RequestRecord {
            id: 0,
            first_user: "alice".into(),
            crawler: "chrome".into(),
            url: "http://app.test/x".into(),
            headers: HeaderMap::new(),
            method: "GET".into(),
            body: Bytes::new(),
            status: 200,
            response_headers: HeaderMap::new(),
            response_body: Bytes::new(),
        };
        let fp_alice = exchange_fingerprint(&record);
        record.first_user = "bob".into();
        let fp_bob = exchange_fingerprint(&record);
        assert_ne!(fp_alice, fp_bob);
        record.body = Bytes::from_static(b"a=1");
        assert_ne!(exchange_fingerprint(&record), fp_bob);
    }

    #[tokio::test]
    async fn capture_log_round_trip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"first_user":"alice","crawler":"chrome","request_url":"http://app.test/items?","request_method":"GET","request_headers":{{"Accept":"text/html"}},"response_status_code":200,"response_body":"<html>ok</html>"}}"#
        )
        .unwrap();
        writeln!(file, "not json").unwrap();
        writeln!(
            file,
            r#"{{"first_user":"alice","crawler":"chrome","request_url":"http://elsewhere.example/","request_method":"GET","response_status_code":200}}"#
        )
        .unwrap();
        writeln!(
            file,
            r#"{{"first_user":"bob","crawler":"chrome","request_url":"http://app.test/upload","request_method":"POST","request_body_base64":"/wE=","response_status_code":201}}"#
        )
        .unwrap();

        let mut store = Store::open_in_memory().unwrap();
        store.prepare_run(crate::records::RunMode::Cfr).unwrap();
        let policy = ScopePolicy::new(vec!["app.test".into()], None, true);
        let stats = ingest_capture_log(&mut store, file.path(), &policy, false)
            .await
            .unwrap();
        assert_eq!(stats.inserted, 2);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.parse_errors, 1);

        let rows = store
            .load_requests(crate::store::stage::CRAWLING)
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].url, "http://app.test/items");
        assert_eq!(rows[0].headers.get("accept"), Some("text/html"));
        assert_eq!(rows[1].body.as_ref(), &[0xff, 0x01]);
    }
}
