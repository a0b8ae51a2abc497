// gatecrash/src/replay.rs
//
// Replay engine. Takes one ordered user pair's surviving requests, rebuilds
// each request under the second user's credentials, sends it with redirects
// disabled and TLS verification off, and runs the validator chain on the
// answer. Requests that pass the whole chain become vulnerability
// candidates.

use std::time::Duration;

use base64::Engine;
use bytes::Bytes;
use regex::Regex;
use reqwest::redirect::Policy;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::records::{DbLogLevel, HeaderMap, PairRecord, ReplayResult};
use crate::similarity::MatchParams;
use crate::store::{MatchTrace, Store, CLASS_REPLAY_VALIDATOR};
use crate::strip::ContentsHashes;
use crate::validators::{
    ContentSimilarityValidator, RedirectValidator, RegexValidator, StatusValidator,
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

// ── Session material ──────────────────────────────────────────────────────────

/// Parsed per-user session material from the auth configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMaterial {
    /// `Cookie k=v; k2=v2` — the user's auth cookies.
    Cookie(Vec<(String, String)>),
    /// `JWT <token>` — replayed as `Authorization: Bearer <token>`.
    Bearer(String),
    /// `HTTP_Basic_Auth <user:pass>` — replayed as
    /// `Authorization: Basic <base64(user:pass)>`.
    Basic(String),
    /// The public user carries no session material.
    None,
}

impl AuthMaterial {
    pub fn parse(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return Self::None;
        };
        let mut parts = raw.trim().splitn(2, char::is_whitespace);
        match (parts.next(), parts.next()) {
            (Some("Cookie"), Some(rest)) => Self::Cookie(parse_cookie_pairs(rest)),
            (Some("JWT"), Some(token)) => Self::Bearer(token.trim().to_string()),
            (Some("HTTP_Basic_Auth"), Some(credentials)) => {
                Self::Basic(credentials.trim().to_string())
            }
            _ => {
                warn!("unrecognized auth material {raw:?}, treating as unauthenticated");
                Self::None
            }
        }
    }
}

/// Parse a Cookie header value into ordered pairs; entries repeating a name
/// keep the last value, as a cookie jar would.
fn parse_cookie_pairs(raw: &str) -> Vec<(String, String)> {
    let mut jar: Vec<(String, String)> = Vec::new();
    for entry in raw.split(';') {
        if let Some((key, value)) = entry.split_once('=') {
            jar_set(&mut jar, key.trim(), value.trim());
        }
    }
    jar
}

fn jar_set(jar: &mut Vec<(String, String)>, key: &str, value: &str) {
    if let Some(slot) = jar.iter_mut().find(|(k, _)| k == key) {
        slot.1 = value.to_string();
    } else {
        jar.push((key.to_string(), value.to_string()));
    }
}

fn jar_remove(jar: &mut Vec<(String, String)>, key: &str) {
    jar.retain(|(k, _)| k != key);
}

// ── Request rebuilding ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method:  String,
    pub url:     String,
    pub headers: HeaderMap,
    pub body:    Bytes,
}

/// Headers that never survive the rebuild: they either belong to the first
/// user's session or are managed by the HTTP client itself.
const DROPPED_HEADERS: &[&str] = &[
    "Authorization",
    "Cookie",
    "Host",
    "Accept-Encoding",
    "Connection",
];

/// Rebuild a captured first-user request so it carries the second user's
/// identity. Cookie handling is the delicate part: when the second user is
/// public, the first user's auth cookie names are scrubbed from the jar so
/// no session id leaks across identities.
pub fn build_outbound(
    record: &PairRecord,
    auth_first: &AuthMaterial,
    auth_second: &AuthMaterial,
    settings: &ReplaySettings,
) -> OutboundRequest {
    let source = &record.record;
    let mut jar = source
        .headers
        .get("Cookie")
        .map(parse_cookie_pairs)
        .unwrap_or_default();

    let mut headers = source.headers.clone();
    for name in DROPPED_HEADERS {
        headers.remove(name);
    }
    if let Some(name) = &settings.csrf_headername {
        headers.remove(name);
        if let Some(token) = &settings.csrf_tokenvalue {
            headers.set(name, token.clone());
        }
    }

    if let AuthMaterial::Cookie(first_cookies) = auth_first {
        match auth_second {
            AuthMaterial::Cookie(second_cookies) => {
                for (key, value) in second_cookies {
                    jar_set(&mut jar, key, value);
                }
            }
            _ => {
                for (key, _) in first_cookies {
                    jar_remove(&mut jar, key);
                }
            }
        }
    }
    match auth_second {
        AuthMaterial::Bearer(token) => headers.set("Authorization", format!("Bearer {token}")),
        AuthMaterial::Basic(credentials) => {
            let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
            headers.set("Authorization", format!("Basic {encoded}"));
        }
        AuthMaterial::Cookie(_) | AuthMaterial::None => {}
    }

    if !jar.is_empty() {
        let rendered = jar
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("; ");
        headers.set("Cookie", rendered);
    }

    let body = substitute_csrf_field(&source.body, settings);

    OutboundRequest {
        method: source.method.clone(),
        url: source.url.clone(),
        headers,
        body,
    }
}

/// Replace a stale synchronizer token in the raw body: `field=<old>`
/// becomes `field=<fresh>`. Bodies that are not UTF-8 are left untouched.
fn substitute_csrf_field(body: &Bytes, settings: &ReplaySettings) -> Bytes {
    let (Some(field), Some(token)) = (&settings.csrf_fieldname, &settings.csrf_tokenvalue) else {
        return body.clone();
    };
    let Ok(text) = std::str::from_utf8(body) else {
        debug!("cannot decode body as UTF-8, skipping CSRF substitution");
        return body.clone();
    };
    let pattern = Regex::new(&format!("{}=[^&]+", regex::escape(field)))
        .expect("escaped field name always compiles");
    let replacement = format!("{field}={token}");
    let replaced = pattern.replace_all(text, regex::NoExpand(&replacement));
    Bytes::from(replaced.into_owned())
}

// ── The tester ────────────────────────────────────────────────────────────────

/// Per-pair replay configuration, assembled by the dispatcher from the run
/// config and the pair's fresh session material.
#[derive(Debug, Clone)]
pub struct ReplaySettings {
    pub first_user:      String,
    pub second_user:     String,
    pub auth_first:      AuthMaterial,
    pub auth_second:     AuthMaterial,
    pub csrf_fieldname:  Option<String>,
    pub csrf_headername: Option<String>,
    /// The second user's fresh token; absent for the public user.
    pub csrf_tokenvalue: Option<String>,
    pub matching:        MatchParams,
    pub full_mode:       bool,
    pub db_log_level:    DbLogLevel,
    pub stripping_tags:  Vec<String>,
    pub regex_to_match:  Option<Regex>,
    pub timeout:         Duration,
}

#[derive(Debug, Default)]
pub struct ReplayOutcome {
    pub replayed:   usize,
    pub candidates: usize,
}

pub struct ReplayTester {
    client:   reqwest::Client,
    settings: ReplaySettings,
}

impl ReplayTester {
    pub fn new(settings: ReplaySettings) -> Result<Self> {
        // Test targets routinely run on self-signed certificates, and
        // redirects must surface as responses for the validators to judge.
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .redirect(Policy::none())
            .timeout(settings.timeout)
            .build()?;
        Ok(Self { client, settings })
    }

    /// Replay one pair's surviving requests and record candidates. A
    /// network failure (including timeout) counts as a failed status check
    /// for that request and moves on.
    pub async fn run(&self, store: &mut Store, source_stage: &str) -> Result<ReplayOutcome> {
        let settings = &self.settings;
        store.create_replay_tables()?;
        let records =
            store.load_pair_records(source_stage, &settings.first_user, &settings.second_user)?;
        let mut outcome = ReplayOutcome::default();

        for pair in &records {
            let source = &pair.record;
            if source.status >= 400 {
                continue;
            }
            let original_redirected = (300..400).contains(&source.status);
            if source.method == "GET" && original_redirected {
                continue;
            }

            debug!("replaying {} {}", source.method, source.url);
            let outbound = build_outbound(pair, &settings.auth_first, &settings.auth_second, settings);
            let response = match self.send(&outbound).await {
                Ok(response) => response,
                Err(err) => {
                    debug!(
                        "replay of {} {} failed ({err}), counting as status failure",
                        source.method, source.url
                    );
                    continue;
                }
            };
            outcome.replayed += 1;

            let result = ReplayResult {
                first_user: settings.first_user.clone(),
                second_user: settings.second_user.clone(),
                url: outbound.url.clone(),
                method: outbound.method.clone(),
                sent_headers: outbound.headers.clone(),
                sent_body: outbound.body.clone(),
                status: response.status,
                response_headers: response.headers.clone(),
                response_body: response.body.clone(),
            };
            store.insert_replay_result(&result)?;

            let status_ok = StatusValidator {
                replay_status: response.status,
                full_mode: settings.full_mode,
            }
            .validate();
            if !status_ok {
                continue;
            }

            if original_redirected {
                let agreed = RedirectValidator {
                    original_response_headers: &source.response_headers,
                    replay_location: response.headers.get("Location"),
                }
                .validate();
                if agreed {
                    debug!("redirect agreement for {} {}", source.method, source.url);
                    self.record_candidate(store, pair)?;
                    outcome.candidates += 1;
                }
                continue;
            }

            if let Some(pattern) = &settings.regex_to_match {
                let body_text = String::from_utf8_lossy(&response.body);
                let matched = RegexValidator {
                    pattern,
                    replay_body: &body_text,
                }
                .validate();
                if !matched {
                    continue;
                }
            }

            let original_hashes = ContentsHashes::compute(
                &source.response_body,
                settings.matching.mode,
                settings.matching.debug,
                &settings.stripping_tags,
            );
            let replay_hashes = ContentsHashes::compute(
                &response.body,
                settings.matching.mode,
                settings.matching.debug,
                &settings.stripping_tags,
            );
            let similarity = ContentSimilarityValidator {
                original: &original_hashes,
                replay: &replay_hashes,
                params: &settings.matching,
            }
            .validate();
            store.record_matching(
                &MatchTrace {
                    class: CLASS_REPLAY_VALIDATOR,
                    first_user: &settings.first_user,
                    second_user: &settings.second_user,
                    method: &source.method,
                    url1: &source.url,
                    url2: None,
                    mode: settings.matching.mode,
                    outcome: &similarity,
                    stripped1: &original_hashes,
                    stripped2: &replay_hashes,
                },
                settings.db_log_level,
            )?;
            if similarity.similar {
                self.record_candidate(store, pair)?;
                outcome.candidates += 1;
            }
        }

        info!(
            "replayed {} requests for ({}, {}), {} candidates",
            outcome.replayed, settings.first_user, settings.second_user, outcome.candidates
        );
        Ok(outcome)
    }

    fn record_candidate(&self, store: &mut Store, pair: &PairRecord) -> Result<()> {
        let source = &pair.record;
        store.insert_candidate(
            &self.settings.first_user,
            &self.settings.second_user,
            &source.url,
            &source.method,
            &source.headers,
            &source.body,
        )?;
        debug!(
            "candidate vulnerability {} {} ({} as {})",
            source.method,
            source.url,
            self.settings.first_user,
            self.settings.second_user
        );
        Ok(())
    }

    async fn send(&self, outbound: &OutboundRequest) -> Result<RawResponse> {
        let method = reqwest::Method::from_bytes(outbound.method.as_bytes())
            .unwrap_or(reqwest::Method::GET);
        let mut request = self.client.request(method, &outbound.url);
        let mut header_map = reqwest::header::HeaderMap::new();
        for (name, value) in outbound.headers.iter() {
            let Ok(name) = reqwest::header::HeaderName::from_bytes(name.as_bytes()) else {
                debug!("skipping invalid header name {name:?}");
                continue;
            };
            let Ok(value) = reqwest::header::HeaderValue::from_str(value) else {
                debug!("skipping invalid header value for {name:?}");
                continue;
            };
            header_map.append(name, value);
        }
        request = request.headers(header_map);
        if !outbound.body.is_empty() {
            request = request.body(outbound.body.clone());
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let mut headers = HeaderMap::new();
        for (name, value) in response.headers() {
            headers.push(
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            );
        }
        let body = response.bytes().await?;
        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }
}

struct RawResponse {
    status:  u16,
    headers: HeaderMap,
    body:    Bytes,
}
