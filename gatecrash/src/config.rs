// gatecrash/src/config.rs
//
// YAML run configuration: target coordinates, user credentials and session
// material, CSRF handling and the tuning options. Validation failures are
// fatal — the process exits non-zero before any phase starts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use regex::{Regex, RegexBuilder};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::records::PUBLIC_USER;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub target: TargetConfig,
    pub auth:   AuthConfig,
    #[serde(default)]
    pub csrf_field: Option<CsrfFieldConfig>,
    #[serde(default)]
    pub csrf_header: Option<CsrfHeaderConfig>,
    #[serde(default)]
    pub options: OptionsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub target_url:    String,
    pub target_domain: String,
    pub path_to_db:    PathBuf,
    pub reset_script:  String,
    pub auth_script:   String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Ordered list of single-entry `{username: password}` maps.
    pub users: Vec<BTreeMap<String, String>>,
    pub combinations: Combinations,
    /// Per-user session material: `Cookie k=v; …`, `JWT <token>` or
    /// `HTTP_Basic_Auth <user:pass>`.
    #[serde(default)]
    pub tokens: Vec<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Combinations {
    #[serde(rename = "type")]
    pub kind: CombinationKind,
    /// Space-separated `"user1 user2"` pairs, used with `selected`.
    #[serde(default)]
    pub user_pairs: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CombinationKind {
    Selected,
    All,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CsrfFieldConfig {
    pub fieldname: String,
    #[serde(default)]
    pub csrf_values: Vec<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CsrfHeaderConfig {
    pub headername: String,
    #[serde(default)]
    pub csrf_values: Vec<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OptionsConfig {
    /// Comma-separated page names dropped by the standard-pages filter,
    /// on top of the built-in defaults.
    #[serde(default)]
    pub standard_pages: String,
    /// Regex over URLs the capture boundary must never admit.
    #[serde(default)]
    pub do_not_call_pages: String,
    /// Comma-separated extensions dropped by the static-content filter,
    /// on top of the built-in defaults.
    #[serde(default)]
    pub static_content_extensions: String,
    /// Regex over parameter names whose values are ignored when comparing
    /// requests (CSRF tokens and friends).
    #[serde(default)]
    pub ignore_tokens: String,
    /// Extra HTML tags stripped before content matching.
    #[serde(default)]
    pub html_stripping_tags: Vec<String>,
    /// Regex a replay response must match to count as successful.
    #[serde(default)]
    pub regex_to_match: String,
    #[serde(default = "default_inter_threshold")]
    pub inter_threshold_validating: u32,
}

fn default_inter_threshold() -> u32 {
    80
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Config = serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.target.target_url.is_empty() || self.target.target_domain.is_empty() {
            return Err(Error::Config(
                "target_url and target_domain must be set".into(),
            ));
        }
        if self.auth.users.is_empty() {
            return Err(Error::Config("auth.users cannot be empty".into()));
        }
        for entry in &self.auth.users {
            if entry.len() != 1 {
                return Err(Error::Config(
                    "each auth.users entry must be a single {username: password} map".into(),
                ));
            }
        }
        if self.auth.combinations.kind == CombinationKind::Selected
            && self.auth.combinations.user_pairs.is_empty()
        {
            return Err(Error::Config(
                "combinations.type = selected requires combinations.user_pairs".into(),
            ));
        }
        if self.csrf_field.is_some() && self.csrf_header.is_some() {
            return Err(Error::Config(
                "csrf_field and csrf_header are mutually exclusive".into(),
            ));
        }
        // Regexes are compiled eagerly so a bad pattern fails the run here.
        self.ignore_tokens_regex()?;
        self.do_not_call_regex()?;
        self.regex_to_match()?;
        Ok(())
    }

    // ── Users ─────────────────────────────────────────────────────────────────

    pub fn usernames(&self) -> Vec<String> {
        self.auth
            .users
            .iter()
            .flat_map(|entry| entry.keys().cloned())
            .collect()
    }

    /// Password for a configured user; the public user has none.
    pub fn credentials_for(&self, user: &str) -> Option<&str> {
        if user == PUBLIC_USER {
            return None;
        }
        self.auth
            .users
            .iter()
            .find_map(|entry| entry.get(user))
            .map(String::as_str)
    }

    /// Raw session material (`Cookie …` / `JWT …` / `HTTP_Basic_Auth …`).
    pub fn token_for(&self, user: &str) -> Option<&str> {
        if user == PUBLIC_USER {
            return None;
        }
        self.auth
            .tokens
            .iter()
            .find_map(|entry| entry.get(user))
            .map(String::as_str)
    }

    /// Fresh CSRF token for a user, from whichever CSRF section is present.
    pub fn csrf_value_for(&self, user: &str) -> Option<&str> {
        if user == PUBLIC_USER {
            return None;
        }
        let values = match (&self.csrf_field, &self.csrf_header) {
            (Some(field), _) => &field.csrf_values,
            (_, Some(header)) => &header.csrf_values,
            _ => return None,
        };
        values
            .iter()
            .find_map(|entry| entry.get(user))
            .map(String::as_str)
    }

    pub fn csrf_fieldname(&self) -> Option<&str> {
        self.csrf_field.as_ref().map(|f| f.fieldname.as_str())
    }

    pub fn csrf_headername(&self) -> Option<&str> {
        self.csrf_header.as_ref().map(|h| h.headername.as_str())
    }

    /// Ordered `(first_user, second_user)` pairs to test. With `all`, every
    /// permutation of configured users plus a `(user, public)` pair per user.
    pub fn user_combos(&self) -> Result<Vec<(String, String)>> {
        match self.auth.combinations.kind {
            CombinationKind::Selected => self
                .auth
                .combinations
                .user_pairs
                .iter()
                .map(|pair| {
                    let mut parts = pair.split_whitespace();
                    match (parts.next(), parts.next(), parts.next()) {
                        (Some(first), Some(second), None) => {
                            Ok((first.to_string(), second.to_string()))
                        }
                        _ => Err(Error::Config(format!(
                            "user pair {pair:?} must contain exactly two names"
                        ))),
                    }
                })
                .collect(),
            CombinationKind::All => {
                let users = self.usernames();
                let mut combos = Vec::new();
                for first in &users {
                    for second in &users {
                        if first != second {
                            combos.push((first.clone(), second.clone()));
                        }
                    }
                }
                for user in &users {
                    combos.push((user.clone(), PUBLIC_USER.to_string()));
                }
                Ok(combos)
            }
        }
    }

    // ── Options ───────────────────────────────────────────────────────────────

    pub fn standard_pages(&self) -> Vec<String> {
        split_list(&self.options.standard_pages)
    }

    pub fn static_content_extensions(&self) -> Vec<String> {
        split_list(&self.options.static_content_extensions)
    }

    pub fn html_stripping_tags(&self) -> &[String] {
        &self.options.html_stripping_tags
    }

    pub fn inter_threshold(&self) -> u32 {
        self.options.inter_threshold_validating
    }

    pub fn domains(&self) -> Vec<String> {
        split_list(&self.target.target_domain)
    }

    pub fn ignore_tokens_regex(&self) -> Result<Option<Regex>> {
        compile_optional(&self.options.ignore_tokens, false)
    }

    pub fn do_not_call_regex(&self) -> Result<Option<Regex>> {
        compile_optional(&self.options.do_not_call_pages, false)
    }

    pub fn regex_to_match(&self) -> Result<Option<Regex>> {
        compile_optional(&self.options.regex_to_match, true)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn compile_optional(pattern: &str, multi_line: bool) -> Result<Option<Regex>> {
    if pattern.is_empty() {
        return Ok(None);
    }
    RegexBuilder::new(pattern)
        .multi_line(multi_line)
        .build()
        .map(Some)
        .map_err(|e| Error::Config(format!("invalid regex {pattern:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
target:
  target_url: "http://app.test"
  target_domain: "app.test"
  path_to_db: "/tmp/gatecrash"
  reset_script: "./reset.sh"
  auth_script: "./auth.sh"
auth:
  users:
    - alice: "wonderland"
    - bob: "builder"
  combinations:
    type: all
  tokens:
    - alice: "Cookie session=aaa"
    - bob: "Cookie session=bbb"
options:
  standard_pages: "dashboard, profile"
  static_content_extensions: "png,ico"
  ignore_tokens: "tokenCSRF|csrfmiddlewaretoken"
  inter_threshold_validating: 85
"#;

    fn parse(raw: &str) -> Config {
        let config: Config = serde_yaml::from_str(raw).unwrap();
        config.validate().unwrap();
        config
    }

    #[test]
    fn minimal_config_parses() {
        let config = parse(MINIMAL);
        assert_eq!(config.usernames(), vec!["alice", "bob"]);
        assert_eq!(config.credentials_for("alice"), Some("wonderland"));
        assert_eq!(config.credentials_for("public"), None);
        assert_eq!(config.token_for("bob"), Some("Cookie session=bbb"));
        assert_eq!(config.inter_threshold(), 85);
        assert_eq!(config.standard_pages(), vec!["dashboard", "profile"]);
        assert_eq!(config.static_content_extensions(), vec!["png", "ico"]);
    }

    #[test]
    fn all_combinations_include_public_pairs() {
        let config = parse(MINIMAL);
        let combos = config.user_combos().unwrap();
        assert!(combos.contains(&("alice".into(), "bob".into())));
        assert!(combos.contains(&("bob".into(), "alice".into())));
        assert!(combos.contains(&("alice".into(), "public".into())));
        assert!(combos.contains(&("bob".into(), "public".into())));
        assert_eq!(combos.len(), 4);
    }

    #[test]
    fn selected_combinations_parse_space_separated_pairs() {
        let raw = MINIMAL.replace(
            "  combinations:\n    type: all",
            "  combinations:\n    type: selected\n    user_pairs:\n      - \"alice bob\"\n      - \"alice public\"",
        );
        let config = parse(&raw);
        assert_eq!(
            config.user_combos().unwrap(),
            vec![
                ("alice".to_string(), "bob".to_string()),
                ("alice".to_string(), "public".to_string())
            ]
        );
    }

    #[test]
    fn selected_without_pairs_is_rejected() {
        let raw = MINIMAL.replace(
            "  combinations:\n    type: all",
            "  combinations:\n    type: selected",
        );
        let config: Config = serde_yaml::from_str(&raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn csrf_field_and_header_are_mutually_exclusive() {
        let raw = format!(
            "{MINIMAL}csrf_field:\n  fieldname: form_key\ncsrf_header:\n  headername: X-CSRF\n"
        );
        let config: Config = serde_yaml::from_str(&raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn csrf_values_resolve_per_user() {
        let raw = format!(
            "{MINIMAL}csrf_field:\n  fieldname: form_key\n  csrf_values:\n    - alice: \"tok-a\"\n    - bob: \"tok-b\"\n"
        );
        let config = parse(&raw);
        assert_eq!(config.csrf_fieldname(), Some("form_key"));
        assert_eq!(config.csrf_value_for("alice"), Some("tok-a"));
        assert_eq!(config.csrf_value_for("public"), None);
    }

    #[test]
    fn bad_ignore_tokens_regex_is_fatal() {
        let raw = MINIMAL.replace("tokenCSRF|csrfmiddlewaretoken", "to(ken");
        let config: Config = serde_yaml::from_str(&raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn multiple_domains_split_on_commas() {
        let raw = MINIMAL.replace("\"app.test\"", "\"app.test, api.app.test\"");
        let config = parse(&raw);
        assert_eq!(config.domains(), vec!["app.test", "api.app.test"]);
    }
}
