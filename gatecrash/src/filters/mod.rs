// gatecrash/src/filters/mod.rs
//
// The filter pipeline. Each pass reads the previous stage table, decides
// which rows survive, and writes a fresh stage — passes never mutate their
// input, so any stage can be re-run from the one before it. Ordering:
// intra-user dedup shrinks the search space first, public removal strips
// what the anonymous view shares, the two lexical passes are cheap, and the
// per-pair pass runs last because it depends on the comparison subject.

pub mod dedup;
pub mod other_user;
pub mod public_content;
pub mod standard_pages;
pub mod static_content;

use tracing::info;

use crate::canon::RequestMatcher;
use crate::error::Result;
use crate::records::{DbLogLevel, DedupMode};
use crate::store::{stage, Store};

/// Settings shared by every filter pass.
pub struct FilterSettings {
    pub mode:              DedupMode,
    pub matcher:           RequestMatcher,
    /// Extensions removed on top of the built-in defaults.
    pub static_extensions: Vec<String>,
    /// Page names removed on top of the built-in defaults.
    pub standard_pages:    Vec<String>,
    pub db_log_level:      DbLogLevel,
}

/// Run the four generic passes in order and return the stage the per-pair
/// filtering starts from. With `prod` retention, each pass's input is
/// dropped once its output exists — except crawling_results, which the
/// findings verifier still needs.
pub fn run_generic(store: &mut Store, settings: &FilterSettings) -> Result<&'static str> {
    info!("starting generic filtering");
    dedup::run(store, stage::CRAWLING, settings)?;
    public_content::run(store, stage::AFTER_DEDUP, settings)?;
    drop_if_prod(store, settings, stage::AFTER_DEDUP)?;
    static_content::run(store, stage::AFTER_PUBLIC, settings)?;
    drop_if_prod(store, settings, stage::AFTER_PUBLIC)?;
    standard_pages::run(store, stage::AFTER_STATIC, settings)?;
    drop_if_prod(store, settings, stage::AFTER_STATIC)?;
    info!("finished generic filtering");
    Ok(stage::AFTER_STANDARD)
}

fn drop_if_prod(store: &mut Store, settings: &FilterSettings, stage_name: &str) -> Result<()> {
    if settings.db_log_level == DbLogLevel::Prod {
        store.drop_stage(stage_name)?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testutil {
    use bytes::Bytes;

    use crate::records::{HeaderMap, RequestRecord};

    pub fn request(user: &str, method: &str, url: &str, body: &[u8]) -> RequestRecord {
        let headers = if body.is_empty() {
            HeaderMap::new()
        } else if body.starts_with(b"{") || body.starts_with(b"[") {
            HeaderMap::from([("Content-Type", "application/json")])
        } else {
            HeaderMap::from([("Content-Type", "application/x-www-form-urlencoded")])
        };
        RequestRecord {
            id: 0,
            first_user: user.into(),
            crawler: "chrome".into(),
            url: url.into(),
            headers,
            method: method.into(),
            body: Bytes::copy_from_slice(body),
            status: 200,
            response_headers: HeaderMap::new(),
            response_body: Bytes::from_static(b"<html>page</html>"),
        }
    }

    pub fn settings(mode: crate::records::DedupMode) -> super::FilterSettings {
        super::FilterSettings {
            mode,
            matcher: crate::canon::RequestMatcher::default(),
            static_extensions: Vec::new(),
            standard_pages: Vec::new(),
            db_log_level: crate::records::DbLogLevel::Dev,
        }
    }

    pub fn urls(records: &[RequestRecord]) -> Vec<String> {
        records.iter().map(|r| r.url.clone()).collect()
    }
}
