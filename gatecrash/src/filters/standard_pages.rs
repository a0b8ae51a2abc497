// gatecrash/src/filters/standard_pages.rs
//
// Standard-pages removal: login, logout, contact and similar pages exist
// for every identity and only produce false findings downstream.

use tracing::info;

use super::FilterSettings;
use crate::error::Result;
use crate::records::RequestRecord;
use crate::store::{stage, Store};

pub const DEFAULT_PAGES: &[&str] = &["index", "contact", "about", "login", "logout", "help"];

pub fn run(store: &mut Store, previous: &str, settings: &FilterSettings) -> Result<()> {
    let records = store.load_requests(previous)?;
    let pages: Vec<String> = DEFAULT_PAGES
        .iter()
        .map(|p| p.to_string())
        .chain(settings.standard_pages.iter().cloned())
        .collect();
    let kept: Vec<RequestRecord> = records
        .iter()
        .filter(|r| !is_standard_page(&r.url, &pages))
        .cloned()
        .collect();
    info!(
        "standard-pages filter kept {}/{} requests",
        kept.len(),
        records.len()
    );
    store.write_requests(stage::AFTER_STANDARD, &kept)?;
    Ok(())
}

fn is_standard_page(url: &str, pages: &[String]) -> bool {
    pages.iter().any(|page| {
        url.ends_with(&format!("/{page}")) || url.contains(&format!("/{page}?"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pages(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn default_pages_match_as_path_suffixes() {
        let pages = pages(DEFAULT_PAGES);
        assert!(is_standard_page("http://app.test/login", &pages));
        assert!(is_standard_page("http://app.test/login?next=/inbox", &pages));
        assert!(is_standard_page("http://app.test/docs/help", &pages));
        assert!(!is_standard_page("http://app.test/loginhistory", &pages));
        assert!(!is_standard_page("http://app.test/items", &pages));
    }

    #[test]
    fn configured_pages_extend_the_set() {
        let pages = pages(&["index", "imprint"]);
        assert!(is_standard_page("http://app.test/imprint", &pages));
        assert!(!is_standard_page("http://app.test/imprints", &pages));
    }
}
