// gatecrash/src/records.rs
//
// Domain types flowing through gatecrash: captured HTTP exchanges, per-pair
// filter rows, replay results, vulnerability candidates, and the mode
// switches selected on the command line.

use bytes::Bytes;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// User name under which unauthenticated crawls are captured.
pub const PUBLIC_USER: &str = "public";

// ── Header map ────────────────────────────────────────────────────────────────

/// Ordered name→value header mapping.
///
/// Arrival order is preserved as captured (it matters for faithful replay);
/// lookups and removals fold ASCII case. Duplicate names are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap(Vec<(String, String)>);

impl HeaderMap {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        Self(pairs)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// First value for `name`, case-insensitive.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Remove every entry named `name`, case-insensitive.
    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    /// Append an entry at the end, keeping any existing ones.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Replace all entries named `name` with a single one, appended at the end.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.0.push((name.to_string(), value.into()));
    }

    /// Whether the content type declares a URL-encoded form body.
    /// Matches case-insensitively and tolerates `;charset=…` suffixes.
    pub fn declares_form_body(&self) -> bool {
        self.get("content-type")
            .map(|v| {
                v.trim()
                    .to_ascii_lowercase()
                    .contains("application/x-www-form-urlencoded")
            })
            .unwrap_or(false)
    }

    /// JSON object text for storage; duplicate names survive the round trip.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn from_json(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_default()
    }
}

impl<const N: usize> From<[(&str, &str); N]> for HeaderMap {
    fn from(pairs: [(&str, &str); N]) -> Self {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

// Headers serialize as a JSON object. A plain map type would collapse
// duplicate names and lose arrival order, so both impls are hand-rolled.
impl Serialize for HeaderMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for HeaderMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HeaderVisitor;

        impl<'de> Visitor<'de> for HeaderVisitor {
            type Value = HeaderMap;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a JSON object of header names to values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut pairs = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((k, v)) = access.next_entry::<String, String>()? {
                    pairs.push((k, v));
                }
                Ok(HeaderMap(pairs))
            }
        }

        deserializer.deserialize_map(HeaderVisitor)
    }
}

// ── Captured exchanges ────────────────────────────────────────────────────────

/// One captured request/response exchange — the atom of every pipeline stage.
/// Bodies are opaque bytes exactly as captured; no transcoding happens here.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub id:               i64,
    pub first_user:       String,
    pub crawler:          String,
    pub url:              String,
    pub headers:          HeaderMap,
    pub method:           String,
    pub body:             Bytes,
    pub status:           u16,
    pub response_headers: HeaderMap,
    pub response_body:    Bytes,
}

impl RequestRecord {
    /// URL up to (excluding) the first `?`.
    pub fn base_url(&self) -> &str {
        self.url.split('?').next().unwrap_or(&self.url)
    }

    pub fn has_query_string(&self) -> bool {
        self.url.contains('?')
    }
}

/// A first-user exchange annotated with the identity it is filtered against.
#[derive(Debug, Clone)]
pub struct PairRecord {
    pub second_user: String,
    pub record:      RequestRecord,
}

// ── Replay output ─────────────────────────────────────────────────────────────

/// Full exchange recorded when a first-user request is re-sent as the second
/// user: the rebuilt request plus whatever the target answered.
#[derive(Debug, Clone)]
pub struct ReplayResult {
    pub first_user:       String,
    pub second_user:      String,
    pub url:              String,
    pub method:           String,
    pub sent_headers:     HeaderMap,
    pub sent_body:        Bytes,
    pub status:           u16,
    pub response_headers: HeaderMap,
    pub response_body:    Bytes,
}

/// A replay that passed the whole validator chain. Verified findings reuse
/// the same shape in their own table.
#[derive(Debug, Clone)]
pub struct Vulnerability {
    pub id:          i64,
    pub first_user:  String,
    pub second_user: String,
    pub url:         String,
    pub method:      String,
    pub headers:     HeaderMap,
    pub body:        Bytes,
}

// ── Mode switches ─────────────────────────────────────────────────────────────

/// How strictly two requests are compared during deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum DedupMode {
    /// Ignore request bodies entirely; compare method, path and query.
    #[value(name = "1")]
    M1,
    /// Compare structured bodies by parameter names only.
    #[value(name = "2")]
    M2,
    /// Names only inside intra-user deduplication; names and values when
    /// comparing across users.
    #[value(name = "3")]
    M3,
    /// Compare structured bodies by parameter names and values.
    #[value(name = "4")]
    M4,
}

impl DedupMode {
    /// Body comparison used by the intra-user deduplication pass.
    pub fn intra_user_body_compare(self) -> BodyCompare {
        match self {
            Self::M1 => BodyCompare::Ignore,
            Self::M2 | Self::M3 => BodyCompare::NamesOnly,
            Self::M4 => BodyCompare::NamesAndValues,
        }
    }

    /// Body comparison used by the public-content and other-user passes.
    pub fn cross_user_body_compare(self) -> BodyCompare {
        match self {
            Self::M1 => BodyCompare::Ignore,
            Self::M2 => BodyCompare::NamesOnly,
            Self::M3 | Self::M4 => BodyCompare::NamesAndValues,
        }
    }
}

impl std::fmt::Display for DedupMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::M1 => write!(f, "1"),
            Self::M2 => write!(f, "2"),
            Self::M3 => write!(f, "3"),
            Self::M4 => write!(f, "4"),
        }
    }
}

/// How structured bodies participate in an equivalence decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyCompare {
    Ignore,
    NamesOnly,
    NamesAndValues,
}

/// Which stripper profile decides response similarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum MatchingMode {
    /// HTML text extraction with the narrow tag strip set.
    #[value(name = "m3i")]
    M3i,
    /// JSON rollout first, falling back to the broad tag strip set.
    #[value(name = "m4i")]
    M4i,
}

impl std::fmt::Display for MatchingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::M3i => write!(f, "m3i"),
            Self::M4i => write!(f, "m4i"),
        }
    }
}

/// Generic on/off toggle for full mode, matching debug and duplicate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Switch {
    On,
    Off,
}

impl Switch {
    pub fn is_on(self) -> bool {
        matches!(self, Self::On)
    }
}

impl std::fmt::Display for Switch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::On => write!(f, "on"),
            Self::Off => write!(f, "off"),
        }
    }
}

/// Retention policy for intermediate store stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum DbLogLevel {
    /// Keep everything, including full matching traces.
    Dev,
    /// Keep matching traces only for the replay similarity validator.
    DevReduced,
    /// Drop intermediate stages as soon as downstream consumers finish.
    Prod,
}

impl std::fmt::Display for DbLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dev => write!(f, "dev"),
            Self::DevReduced => write!(f, "dev-reduced"),
            Self::Prod => write!(f, "prod"),
        }
    }
}

/// Which pipeline phases a run executes. Later phases read whatever the
/// earlier ones left in the store, so the combinations are contiguous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RunMode {
    Cfr,
    Cfrv,
    Fr,
    Frv,
    R,
    Rv,
    V,
}

impl RunMode {
    pub fn crawl(self) -> bool {
        matches!(self, Self::Cfr | Self::Cfrv)
    }

    pub fn filter(self) -> bool {
        matches!(self, Self::Cfr | Self::Cfrv | Self::Fr | Self::Frv)
    }

    pub fn replay(self) -> bool {
        !matches!(self, Self::V)
    }

    pub fn verify(self) -> bool {
        matches!(self, Self::Cfrv | Self::Frv | Self::Rv | Self::V)
    }
}
