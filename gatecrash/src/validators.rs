// gatecrash/src/validators.rs
//
// Validator chain applied to each replayed response. Every validator can
// short-circuit the chain; a replay only becomes a vulnerability candidate
// after all applicable validators pass.

use regex::Regex;

use crate::records::HeaderMap;
use crate::similarity::{compare_contents, MatchOutcome, MatchParams};
use crate::strip::ContentsHashes;

// ── Status code ───────────────────────────────────────────────────────────────

/// Status gate. 401 and 403 always fail — the target denied the replay.
/// In full mode the accept window is `200..=302` plus `307`; the remaining
/// 3xx codes fail. In reduced mode only 2xx passes.
pub struct StatusValidator {
    pub replay_status: u16,
    pub full_mode:     bool,
}

impl StatusValidator {
    pub fn validate(&self) -> bool {
        if self.replay_status == 401 || self.replay_status == 403 {
            return false;
        }
        if !self.full_mode {
            return self.replay_status / 100 == 2;
        }
        match self.replay_status {
            200..=302 | 307 => true,
            _ => false,
        }
    }
}

// ── Redirect target ───────────────────────────────────────────────────────────

/// For originals that redirected: the replay must redirect to the same
/// place. An original without a Location header passes vacuously.
pub struct RedirectValidator<'a> {
    pub original_response_headers: &'a HeaderMap,
    pub replay_location:           Option<&'a str>,
}

impl RedirectValidator<'_> {
    pub fn validate(&self) -> bool {
        match self.original_response_headers.get("Location") {
            None => true,
            Some(original) => Some(original) == self.replay_location,
        }
    }
}

// ── Response regex ────────────────────────────────────────────────────────────

/// Optional marker check: the replay body must contain the configured
/// pattern (compiled with multi-line semantics by the config layer).
pub struct RegexValidator<'a> {
    pub pattern:     &'a Regex,
    pub replay_body: &'a str,
}

impl RegexValidator<'_> {
    pub fn validate(&self) -> bool {
        self.pattern.is_match(self.replay_body)
    }
}

// ── Content similarity ────────────────────────────────────────────────────────

/// The decisive check: the replayed response must look like the content the
/// first user originally saw.
pub struct ContentSimilarityValidator<'a> {
    pub original: &'a ContentsHashes,
    pub replay:   &'a ContentsHashes,
    pub params:   &'a MatchParams,
}

impl ContentSimilarityValidator<'_> {
    pub fn validate(&self) -> MatchOutcome {
        compare_contents(self.original, self.replay, self.params, false)
    }
}
