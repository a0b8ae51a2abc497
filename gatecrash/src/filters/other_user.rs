// gatecrash/src/filters/other_user.rs
//
// Per-pair filtering. For an ordered pair (U1, U2), keep U1's surviving
// requests and drop every one that U2 also produced in their own crawl —
// whatever both users reach legitimately cannot witness a violation. The
// output rows carry the pair annotation and accumulate in one shared stage
// across all pairs.

use tracing::info;

use super::FilterSettings;
use crate::canon::CanonicalRequest;
use crate::error::Result;
use crate::records::{PairRecord, RequestRecord};
use crate::store::{stage, Store};

pub fn run(
    store: &mut Store,
    previous: &str,
    first_user: &str,
    second_user: &str,
    settings: &FilterSettings,
) -> Result<usize> {
    let first = store.load_requests_for_user(previous, first_user)?;
    let second = store.load_requests_for_user(previous, second_user)?;
    let survivors = filter_pair(&first, &second, second_user, settings);
    info!(
        "other-user filter ({first_user}, {second_user}) kept {}/{} requests",
        survivors.len(),
        first.len()
    );
    let count = survivors.len();
    store.append_pair_records(stage::AFTER_OTHER_USER, &survivors)?;
    Ok(count)
}

fn filter_pair(
    first: &[RequestRecord],
    second: &[RequestRecord],
    second_user: &str,
    settings: &FilterSettings,
) -> Vec<PairRecord> {
    let cmp = settings.mode.cross_user_body_compare();
    let first_views: Vec<CanonicalRequest<'_>> = first
        .iter()
        .map(|r| settings.matcher.canonicalize(r))
        .collect();
    let second_views: Vec<CanonicalRequest<'_>> = second
        .iter()
        .map(|r| settings.matcher.canonicalize(r))
        .collect();

    first_views
        .iter()
        .enumerate()
        .filter(|(_, view)| {
            !second_views
                .iter()
                .any(|other| settings.matcher.equivalent(other, view, cmp))
        })
        .map(|(i, _)| PairRecord {
            second_user: second_user.to_string(),
            record: first[i].clone(),
        })
        .collect()
}
