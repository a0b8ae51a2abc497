// gatecrash/src/filters/dedup.rs
//
// Intra-user deduplication. For every user, the first occurrence of each
// equivalence class survives; later equivalents are dropped. Exact
// byte-level duplicates fall out of the same scan, since byte equality
// implies equivalence in every mode.

use tracing::{debug, info};

use super::FilterSettings;
use crate::error::Result;
use crate::records::RequestRecord;
use crate::store::{stage, Store};

pub fn run(store: &mut Store, previous: &str, settings: &FilterSettings) -> Result<()> {
    let records = store.load_requests(previous)?;
    let kept = deduplicate(&records, settings);
    info!(
        "deduplication kept {}/{} requests (mode {})",
        kept.len(),
        records.len(),
        settings.mode
    );
    store.write_requests(stage::AFTER_DEDUP, &kept)?;
    Ok(())
}

fn deduplicate(records: &[RequestRecord], settings: &FilterSettings) -> Vec<RequestRecord> {
    let cmp = settings.mode.intra_user_body_compare();
    let views: Vec<_> = records
        .iter()
        .map(|r| settings.matcher.canonicalize(r))
        .collect();

    let mut survivors: Vec<usize> = Vec::new();
    for (i, view) in views.iter().enumerate() {
        let duplicate = survivors.iter().any(|&j| {
            views[j].record.first_user == view.record.first_user
                && settings.matcher.equivalent(&views[j], view, cmp)
        });
        if duplicate {
            debug!(
                "dropping duplicate {} {} of user {}",
                view.record.method, view.record.url, view.record.first_user
            );
        } else {
            survivors.push(i);
        }
    }
    survivors.into_iter().map(|i| records[i].clone()).collect()
}
