// gatecrash/src/strip.rs
//
// Response-body stripping: reduce a captured body to a comparable token
// list. Two profiles exist — the narrow one keeps page chrome like nav bars
// (useful when layouts are identical anyway), the broad one removes it and
// prefers a JSON rollout when the body parses as JSON.

use std::collections::HashSet;

use ego_tree::NodeRef;
use scraper::{Html, Node};

use crate::flatten;
use crate::records::MatchingMode;

/// Tags stripped by the narrow (m3i) profile.
pub const NARROW_STRIP_TAGS: &[&str] = &["meta", "script", "link"];

/// Tags stripped by the broad (m4i) profile when falling back to HTML.
pub const BROAD_STRIP_TAGS: &[&str] = &[
    "meta", "script", "link", "aside", "nav", "header", "footer",
];

/// Narrow profile: strip `meta`/`script`/`link` (plus configured extras),
/// then return the visible text fragments in document order followed by the
/// `value` attributes of non-hidden inputs.
pub fn strip_narrow(content: &[u8], extra_tags: &[String]) -> Vec<String> {
    extract_text(content, &tag_set(NARROW_STRIP_TAGS, extra_tags))
}

/// Broad profile: roll the body out as JSON when possible, otherwise strip
/// with the broad tag set and extract text like the narrow profile.
pub fn strip_broad(content: &[u8], extra_tags: &[String]) -> Vec<String> {
    if let Some(node) = flatten::parse(content) {
        if let Some(tokens) = flatten::roll_out(&node) {
            return tokens;
        }
    }
    extract_text(content, &tag_set(BROAD_STRIP_TAGS, extra_tags))
}

fn tag_set(base: &[&str], extra: &[String]) -> HashSet<String> {
    base.iter()
        .map(|t| t.to_string())
        .chain(extra.iter().map(|t| t.trim().to_ascii_lowercase()))
        .collect()
}

fn extract_text(content: &[u8], strip: &HashSet<String>) -> Vec<String> {
    // Bodies that are not valid text degenerate to a single raw fragment, so
    // downstream comparison behaves like exact byte equality.
    let Ok(text) = std::str::from_utf8(content) else {
        return vec![String::from_utf8_lossy(content).into_owned()];
    };

    let html = Html::parse_document(text);
    let mut buffer = String::new();
    let mut input_values = Vec::new();
    collect(html.tree.root(), strip, &mut buffer, &mut input_values);

    let mut fragments: Vec<String> = buffer
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    fragments.extend(
        input_values
            .into_iter()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty()),
    );
    fragments
}

fn collect(
    node: NodeRef<'_, Node>,
    strip: &HashSet<String>,
    text: &mut String,
    input_values: &mut Vec<String>,
) {
    match node.value() {
        Node::Element(el) => {
            if strip.contains(el.name()) {
                return;
            }
            if el.name() == "input"
                && !el
                    .attr("type")
                    .is_some_and(|t| t.eq_ignore_ascii_case("hidden"))
            {
                if let Some(value) = el.attr("value") {
                    input_values.push(value.to_string());
                }
            }
            for child in node.children() {
                collect(child, strip, text, input_values);
            }
        }
        Node::Text(t) => text.push_str(&t.text),
        _ => {
            for child in node.children() {
                collect(child, strip, text, input_values);
            }
        }
    }
}

// ── Cached token lists ────────────────────────────────────────────────────────

/// Precomputed stripped token lists for one response body, so repeated
/// comparisons against the same response never reparse it. Only the lists
/// the matching mode (or debug) needs are filled.
#[derive(Debug, Clone, Default)]
pub struct ContentsHashes {
    pub narrow: Vec<String>,
    pub broad:  Vec<String>,
}

impl ContentsHashes {
    pub fn compute(
        content: &[u8],
        mode: MatchingMode,
        debug_both: bool,
        extra_tags: &[String],
    ) -> Self {
        let mut hashes = Self::default();
        if mode == MatchingMode::M3i || debug_both {
            hashes.narrow = strip_narrow(content, extra_tags);
        }
        if mode == MatchingMode::M4i || debug_both {
            hashes.broad = strip_broad(content, extra_tags);
        }
        hashes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><head><meta charset="utf-8"><script>var x = 1;</script></head>
<body><nav>Main menu</nav>
<h1>Invoices</h1>
<p>Open invoice 17</p>
<input type="text" value="Fritz">
<input type="hidden" value="secret-token">
<footer>contact us</footer></body></html>"#;

    #[test]
    fn narrow_profile_drops_scripts_but_keeps_nav() {
        let fragments = strip_narrow(PAGE.as_bytes(), &[]);
        assert!(fragments.contains(&"Main menu".to_string()));
        assert!(fragments.contains(&"Invoices".to_string()));
        assert!(fragments.contains(&"Fritz".to_string()));
        assert!(!fragments.iter().any(|f| f.contains("var x")));
        assert!(!fragments.contains(&"secret-token".to_string()));
    }

    #[test]
    fn broad_profile_drops_nav_and_footer_too() {
        let fragments = strip_broad(PAGE.as_bytes(), &[]);
        assert!(!fragments.contains(&"Main menu".to_string()));
        assert!(!fragments.contains(&"contact us".to_string()));
        assert!(fragments.contains(&"Invoices".to_string()));
    }

    #[test]
    fn extra_tags_extend_the_strip_set() {
        let fragments = strip_narrow(PAGE.as_bytes(), &["nav".to_string()]);
        assert!(!fragments.contains(&"Main menu".to_string()));
    }

    #[test]
    fn broad_profile_prefers_json_rollout() {
        let fragments = strip_broad(br#"{"id":7,"owner":"alice"}"#, &[]);
        assert_eq!(fragments, vec!["id:7", "owner:alice"]);
    }

    #[test]
    fn json_without_key_structure_falls_back_to_text() {
        let fragments = strip_broad(b"12345", &[]);
        assert_eq!(fragments, vec!["12345"]);
    }

    #[test]
    fn binary_bodies_become_a_single_raw_fragment() {
        let raw = [0xff, 0x00, 0x42];
        let fragments = strip_narrow(&raw, &[]);
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments, strip_narrow(&raw, &[]));
    }

    #[test]
    fn stripping_stripped_output_is_stable() {
        let once = strip_narrow(PAGE.as_bytes(), &[]);
        let joined = once.join("\n");
        let twice = strip_narrow(joined.as_bytes(), &[]);
        assert_eq!(once, twice);
    }

    #[test]
    fn compute_fills_only_what_the_mode_needs() {
        let hashes = ContentsHashes::compute(PAGE.as_bytes(), MatchingMode::M3i, false, &[]);
        assert!(!hashes.narrow.is_empty());
        assert!(hashes.broad.is_empty());
        let both = ContentsHashes::compute(PAGE.as_bytes(), MatchingMode::M3i, true, &[]);
        assert!(!both.narrow.is_empty());
        assert!(!both.broad.is_empty());
    }
}
