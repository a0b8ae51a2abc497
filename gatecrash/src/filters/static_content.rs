// gatecrash/src/filters/static_content.rs
//
// Static-content removal: stylesheets, scripts and other asset URLs carry
// no authorization decisions worth replaying.

use tracing::info;

use super::FilterSettings;
use crate::error::Result;
use crate::records::RequestRecord;
use crate::store::{stage, Store};

pub const DEFAULT_EXTENSIONS: &[&str] = &["css", "js"];

pub fn run(store: &mut Store, previous: &str, settings: &FilterSettings) -> Result<()> {
    let records = store.load_requests(previous)?;
    let extensions: Vec<String> = DEFAULT_EXTENSIONS
        .iter()
        .map(|e| e.to_string())
        .chain(settings.static_extensions.iter().cloned())
        .collect();
    let kept: Vec<RequestRecord> = records
        .iter()
        .filter(|r| !is_static(&r.url, &extensions))
        .cloned()
        .collect();
    info!(
        "static-content filter kept {}/{} requests",
        kept.len(),
        records.len()
    );
    store.write_requests(stage::AFTER_STATIC, &kept)?;
    Ok(())
}

/// A URL is static when it ends in `.ext`, or carries `.ext?` anywhere
/// (assets fetched with cache-busting query strings).
fn is_static(url: &str, extensions: &[String]) -> bool {
    extensions.iter().any(|ext| {
        url.ends_with(&format!(".{ext}")) || url.contains(&format!(".{ext}?"))
    })
}
