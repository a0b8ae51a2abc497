// gatecrash/src/filters/public_content.rs
//
// Public-content removal. Anything an unauthenticated crawl could reach is
// noise for access-control testing: authenticated users' requests that are
// equivalent to a public capture are dropped, and the public rows
// themselves leave the pipeline here.

use tracing::info;

use super::FilterSettings;
use crate::error::Result;
use crate::records::{RequestRecord, PUBLIC_USER};
use crate::store::{stage, Store};

pub fn run(store: &mut Store, previous: &str, settings: &FilterSettings) -> Result<()> {
    let records = store.load_requests(previous)?;
    let kept = remove_public_content(&records, settings);
    info!(
        "public-content filter kept {}/{} requests",
        kept.len(),
        records.len()
    );
    store.write_requests(stage::AFTER_PUBLIC, &kept)?;
    Ok(())
}

fn remove_public_content(
    records: &[RequestRecord],
    settings: &FilterSettings,
) -> Vec<RequestRecord> {
    let cmp = settings.mode.cross_user_body_compare();
    let views: Vec<_> = records
        .iter()
        .map(|r| settings.matcher.canonicalize(r))
        .collect();
    let public: Vec<usize> = records
        .iter()
        .enumerate()
        .filter(|(_, r)| r.first_user == PUBLIC_USER)
        .map(|(i, _)| i)
        .collect();

    records
        .iter()
        .enumerate()
        .filter(|(i, record)| {
            record.first_user != PUBLIC_USER
                && !public
                    .iter()
                    .any(|&p| settings.matcher.equivalent(&views[p], &views[*i], cmp))
        })
        .map(|(_, record)| record.clone())
        .collect()
}
