// gatecrash/src/canon.rs
//
// Request canonicalization: reduce a captured request to comparable parts
// (literal path, query dict, body shape) and decide equivalence under the
// selected body-comparison strictness. Every filter pass funnels through
// here, so this module defines what "the same request" means.

use std::collections::BTreeMap;

use regex::Regex;
use tracing::debug;
use url::form_urlencoded;

use crate::flatten;
use crate::records::{BodyCompare, HeaderMap, RequestRecord};

// ── Parameter dicts ───────────────────────────────────────────────────────────

/// `name → values` mapping for query strings and structured bodies.
/// Blank values are kept (`a=&b=2` yields `a → [""]`), and equality treats
/// each value list as a multiset.
#[derive(Debug, Clone, Default)]
pub struct ParamDict(BTreeMap<String, Vec<String>>);

impl ParamDict {
    /// Parse a raw query string (the part after `?`).
    pub fn from_query(query: &str) -> Self {
        let mut dict = Self::default();
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            dict.push(key.into_owned(), value.into_owned());
        }
        dict
    }

    /// Query dict of a full URL; empty when the URL carries no `?`.
    pub fn from_url(url: &str) -> Self {
        match url.split_once('?') {
            Some((_, query)) => Self::from_query(query),
            None => Self::default(),
        }
    }

    pub fn push(&mut self, key: String, value: String) {
        self.0.entry(key).or_default().push(value);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn same_names(&self, other: &Self) -> bool {
        self.0.len() == other.0.len() && self.0.keys().eq(other.0.keys())
    }

    /// Blank out the value lists of parameter names matched (anchored at the
    /// start) by the ignore-tokens pattern, so per-session nonces do not
    /// defeat deduplication.
    pub fn apply_ignore_tokens(&mut self, pattern: Option<&Regex>) {
        let Some(re) = pattern else { return };
        for (key, values) in self.0.iter_mut() {
            if re.find(key).is_some_and(|m| m.start() == 0) {
                values.clear();
            }
        }
    }
}

impl PartialEq for ParamDict {
    fn eq(&self, other: &Self) -> bool {
        if !self.same_names(other) {
            return false;
        }
        self.0.values().zip(other.0.values()).all(|(a, b)| {
            if a.len() != b.len() {
                return false;
            }
            let mut a = a.clone();
            let mut b = b.clone();
            a.sort_unstable();
            b.sort_unstable();
            a == b
        })
    }
}

impl Eq for ParamDict {}

// ── Body shapes ───────────────────────────────────────────────────────────────

/// Structural reading of a request body. JSON is tried first (regardless of
/// content type), then URL-encoded forms; anything else stays opaque and is
/// only ever compared byte-for-byte.
#[derive(Debug, Clone, PartialEq)]
pub enum BodyShape {
    Empty,
    Form(ParamDict),
    Json(ParamDict),
    Opaque,
}

pub fn classify_body(body: &[u8], headers: &HeaderMap) -> BodyShape {
    if body.is_empty() {
        return BodyShape::Empty;
    }
    if let Some(node) = flatten::parse(body) {
        if let Some(tokens) = flatten::roll_out(&node) {
            return BodyShape::Json(fold_tokens(tokens));
        }
    }
    if headers.declares_form_body() {
        match std::str::from_utf8(body) {
            Ok(text) => return BodyShape::Form(ParamDict::from_query(text)),
            Err(err) => debug!("cannot decode form body as UTF-8: {err}"),
        }
    }
    BodyShape::Opaque
}

/// Fold flattened `key:value` tokens into a dict; the split happens at the
/// first colon so values containing colons stay intact. Repeated keys append
/// to the same value list.
fn fold_tokens(tokens: Vec<String>) -> ParamDict {
    let mut dict = ParamDict::default();
    for token in tokens {
        let (key, value) = token.split_once(':').unwrap_or((token.as_str(), ""));
        let (key, value) = (key.to_string(), value.to_string());
        dict.push(key, value);
    }
    dict
}

// ── Equivalence ───────────────────────────────────────────────────────────────

/// Precomputed comparison view of a record: query and body dicts with the
/// ignore-tokens policy already applied. Filters canonicalize each record
/// once and compare views, so N×M passes never reparse bodies.
#[derive(Debug, Clone)]
pub struct CanonicalRequest<'a> {
    pub record: &'a RequestRecord,
    query: ParamDict,
    body: BodyShape,
}

#[derive(Debug, Clone, Default)]
pub struct RequestMatcher {
    ignore_tokens: Option<Regex>,
}

impl RequestMatcher {
    pub fn new(ignore_tokens: Option<Regex>) -> Self {
        Self { ignore_tokens }
    }

    pub fn canonicalize<'a>(&self, record: &'a RequestRecord) -> CanonicalRequest<'a> {
        let mut query = ParamDict::from_url(&record.url);
        query.apply_ignore_tokens(self.ignore_tokens.as_ref());
        let mut body = classify_body(&record.body, &record.headers);
        if let BodyShape::Form(dict) | BodyShape::Json(dict) = &mut body {
            dict.apply_ignore_tokens(self.ignore_tokens.as_ref());
        }
        CanonicalRequest { record, query, body }
    }

    /// Symmetric equivalence under the given body comparison. Methods and
    /// paths compare literally, query strings as dicts of multisets, bodies
    /// per `cmp` — structured shapes must match, everything else falls back
    /// to exact bytes.
    pub fn equivalent(
        &self,
        a: &CanonicalRequest<'_>,
        b: &CanonicalRequest<'_>,
        cmp: BodyCompare,
    ) -> bool {
        if a.record.method != b.record.method {
            return false;
        }
        if a.record.base_url() != b.record.base_url() {
            return false;
        }
        if a.query != b.query {
            return false;
        }
        match cmp {
            BodyCompare::Ignore => true,
            BodyCompare::NamesOnly => match (&a.body, &b.body) {
                (BodyShape::Empty, BodyShape::Empty) => true,
                (BodyShape::Form(da), BodyShape::Form(db))
                | (BodyShape::Json(da), BodyShape::Json(db)) => da.same_names(db),
                _ => a.record.body == b.record.body,
            },
            BodyCompare::NamesAndValues => match (&a.body, &b.body) {
                (BodyShape::Empty, BodyShape::Empty) => true,
                (BodyShape::Form(da), BodyShape::Form(db))
                | (BodyShape::Json(da), BodyShape::Json(db)) => da == db,
                _ => a.record.body == b.record.body,
            },
        }
    }
}
