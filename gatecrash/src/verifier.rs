// gatecrash/src/verifier.rs
//
// Findings verification. A replay that passed the validator chain can still
// be a false positive: the page may simply be reachable by the second user
// through their own navigation. For GET candidates the stored replay
// response is compared in subset form against everything the second user
// saw in their own crawl; any hit suppresses the candidate. Non-GET
// candidates pass through — re-querying them would cause side effects.

use tracing::{debug, info};

use crate::error::Result;
use crate::records::DbLogLevel;
use crate::similarity::{compare_contents, MatchParams};
use crate::store::{stage, MatchTrace, Store, CLASS_FINDINGS_VERIFIER};
use crate::strip::ContentsHashes;

pub struct FindingsVerifier {
    pub matching:       MatchParams,
    pub db_log_level:   DbLogLevel,
    pub stripping_tags: Vec<String>,
}

#[derive(Debug, Default)]
pub struct VerifyOutcome {
    pub kept:       usize,
    pub suppressed: usize,
}

impl FindingsVerifier {
    pub fn verify_pair(
        &self,
        store: &mut Store,
        first_user: &str,
        second_user: &str,
    ) -> Result<VerifyOutcome> {
        store.create_verified_table()?;
        let second_crawl = store.load_requests_for_user(stage::CRAWLING, second_user)?;
        let replays = store.load_replay_results(first_user, second_user)?;
        let candidates = store.load_candidates(first_user, second_user)?;

        // Token lists of the second user's crawl are computed once per pair;
        // every candidate reuses them.
        let second_hashes: Vec<ContentsHashes> = second_crawl
            .iter()
            .map(|record| {
                ContentsHashes::compute(
                    &record.response_body,
                    self.matching.mode,
                    self.matching.debug,
                    &self.stripping_tags,
                )
            })
            .collect();

        let mut outcome = VerifyOutcome::default();
        for candidate in &candidates {
            let mut suppress = false;
            if candidate.method == "GET" {
                let replay = replays
                    .iter()
                    .rev()
                    .find(|r| r.url == candidate.url && r.method == candidate.method)
                    .filter(|r| !r.response_body.is_empty());
                if let Some(replay) = replay {
                    let replay_hashes = ContentsHashes::compute(
                        &replay.response_body,
                        self.matching.mode,
                        self.matching.debug,
                        &self.stripping_tags,
                    );
                    for (crawl, crawl_hashes) in second_crawl.iter().zip(&second_hashes) {
                        let result =
                            compare_contents(&replay_hashes, crawl_hashes, &self.matching, true);
                        store.record_matching(
                            &MatchTrace {
                                class: CLASS_FINDINGS_VERIFIER,
                                first_user,
                                second_user,
                                method: &candidate.method,
                                url1: &candidate.url,
                                url2: Some(&crawl.url),
                                mode: self.matching.mode,
                                outcome: &result,
                                stripped1: &replay_hashes,
                                stripped2: crawl_hashes,
                            },
                            self.db_log_level,
                        )?;
                        if result.similar {
                            debug!(
                                "suppressing {} {} — content also reachable by {second_user} at {}",
                                candidate.method, candidate.url, crawl.url
                            );
                            suppress = true;
                            break;
                        }
                    }
                }
            }

            if suppress {
                outcome.suppressed += 1;
            } else {
                store.insert_verified(candidate)?;
                outcome.kept += 1;
            }
        }

        info!(
            "verified findings for ({first_user}, {second_user}): {} kept, {} suppressed",
            outcome.kept, outcome.suppressed
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{HeaderMap, MatchingMode, ReplayResult, RequestRecord, RunMode};
    use bytes::Bytes;

    fn verifier() -> FindingsVerifier {
        FindingsVerifier {
            matching: MatchParams {
                mode: MatchingMode::M3i,
                threshold: 80,
                debug: false,
            },
            db_log_level: DbLogLevel::Dev,
            stripping_tags: Vec::new(),
        }
    }

    fn crawl_record(user: &str, url: &str, response_body: &str) -> RequestRecord {
        RequestRecord {
            id: 0,
            first_user: user.into(),
            crawler: "chrome".into(),
            url: url.into(),
            headers: HeaderMap::new(),
            method: "GET".into(),
            body: Bytes::new(),
            status: 200,
            response_headers: HeaderMap::new(),
            response_body: Bytes::copy_from_slice(response_body.as_bytes()),
        }
    }

    fn seed_candidate(
        store: &mut Store,
        url: &str,
        method: &str,
        replay_body: &str,
    ) {
        store.create_replay_tables().unwrap();
        store
            .insert_replay_result(&ReplayResult {
                first_user: "alice".into(),
                second_user: "bob".into(),
                url: url.into(),
                method: method.into(),
                sent_headers: HeaderMap::new(),
                sent_body: Bytes::new(),
                status: 200,
                response_headers: HeaderMap::new(),
                response_body: Bytes::copy_from_slice(replay_body.as_bytes()),
            })
            .unwrap();
        store
            .insert_candidate("alice", "bob", url, method, &HeaderMap::new(), b"")
            .unwrap();
    }

    fn seed_crawl(store: &mut Store, records: &[RequestRecord]) {
        store.prepare_run(RunMode::Cfr).unwrap();
        for record in records {
            let fp = crate::ingest::exchange_fingerprint(record);
            store.insert_capture(record, &fp, false).unwrap();
        }
    }

    #[test]
    fn candidate_contained_in_second_users_view_is_suppressed() {
        let mut store = Store::open_in_memory().unwrap();
        // Bob's own crawl contains a superset of what the replay returned.
        seed_crawl(
            &mut store,
            &[crawl_record(
                "bob",
                "http://app.test/welcome",
                "line one\nline two\nline three\nextra footer",
            )],
        );
        seed_candidate(
            &mut store,
            "http://app.test/peek",
            "GET",
            "line one\nline two\nline three",
        );
        let outcome = verifier().verify_pair(&mut store, "alice", "bob").unwrap();
        assert_eq!(outcome.suppressed, 1);
        assert_eq!(outcome.kept, 0);
        assert!(store.list_findings(true).unwrap().is_empty());
    }

    #[test]
    fn candidate_with_private_content_survives() {
        let mut store = Store::open_in_memory().unwrap();
        seed_crawl(
            &mut store,
            &[crawl_record(
                "bob",
                "http://app.test/welcome",
                "completely unrelated page text",
            )],
        );
        seed_candidate(
            &mut store,
            "http://app.test/invoice/17",
            "GET",
            "alice's private invoice\namount 250",
        );
        let outcome = verifier().verify_pair(&mut store, "alice", "bob").unwrap();
        assert_eq!(outcome.kept, 1);
        assert_eq!(outcome.suppressed, 0);
        let findings = store.list_findings(true).unwrap();
        assert_eq!(findings[0].3, "http://app.test/invoice/17");
    }

    #[test]
    fn non_get_candidates_pass_through() {
        let mut store = Store::open_in_memory().unwrap();
        seed_crawl(
            &mut store,
            &[crawl_record("bob", "http://app.test/welcome", "anything")],
        );
        seed_candidate(&mut store, "http://app.test/orders", "POST", "anything");
        let outcome = verifier().verify_pair(&mut store, "alice", "bob").unwrap();
        assert_eq!(outcome.kept, 1);
    }

    #[test]
    fn empty_replay_responses_keep_the_finding() {
        let mut store = Store::open_in_memory().unwrap();
        seed_crawl(
            &mut store,
            &[crawl_record("bob", "http://app.test/welcome", "anything")],
        );
        seed_candidate(&mut store, "http://app.test/blank", "GET", "");
        let outcome = verifier().verify_pair(&mut store, "alice", "bob").unwrap();
        assert_eq!(outcome.kept, 1);
    }
}
