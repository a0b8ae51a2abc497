// Integration tests: seed a store with multi-identity captures and drive
// the filter pipeline the way the binary does, checking the invariants the
// stages promise each other.

use bytes::Bytes;

use gatecrash::canon::RequestMatcher;
use gatecrash::filters::{self, FilterSettings};
use gatecrash::ingest::exchange_fingerprint;
use gatecrash::records::{
    DbLogLevel, DedupMode, HeaderMap, RequestRecord, RunMode, PUBLIC_USER,
};
use gatecrash::store::{stage, Store};

fn capture(user: &str, method: &str, url: &str, body: &[u8]) -> RequestRecord {
    let headers = if body.is_empty() {
        HeaderMap::new()
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
        response_body: Bytes::from_static(b"<html><body>page</body></html>"),
    }
}

fn seeded_store(records: &[RequestRecord]) -> Store {
    let mut store = Store::open_in_memory().unwrap();
    store.prepare_run(RunMode::Cfr).unwrap();
    for record in records {
        let fingerprint = exchange_fingerprint(record);
        store.insert_capture(record, &fingerprint, false).unwrap();
    }
    store
}

fn settings(mode: DedupMode) -> FilterSettings {
    FilterSettings {
        mode,
        matcher: RequestMatcher::default(),
        static_extensions: Vec::new(),
        standard_pages: Vec::new(),
        db_log_level: DbLogLevel::Dev,
    }
}

fn sample_captures() -> Vec<RequestRecord> {
    vec![
        // Duplicates within alice's crawl (query reorder).
        capture("alice", "GET", "http://app.test/inbox?folder=all&page=1", b""),
        capture("alice", "GET", "http://app.test/inbox?page=1&folder=all", b""),
        // Content both alice and the public crawl reached.
        capture("alice", "GET", "http://app.test/news", b""),
        capture(PUBLIC_USER, "GET", "http://app.test/news", b""),
        // Assets and standard pages.
        capture("alice", "GET", "http://app.test/theme.css", b""),
        capture("alice", "GET", "http://app.test/login?next=/inbox", b""),
        // Alice's private resource, and one shared with bob.
        capture("alice", "GET", "http://app.test/invoice/17", b""),
        capture("alice", "GET", "http://app.test/reports", b""),
        capture("bob", "GET", "http://app.test/reports", b""),
        // Form posts differing only in values.
        capture("alice", "POST", "http://app.test/orders", b"item=9&qty=1"),
        capture("alice", "POST", "http://app.test/orders", b"item=4&qty=1"),
    ]
}

#[test]
fn generic_pipeline_filters_noise_and_keeps_private_requests() {
    let mut store = seeded_store(&sample_captures());
    let cfg = settings(DedupMode::M4);
    let final_stage = filters::run_generic(&mut store, &cfg).unwrap();
    assert_eq!(final_stage, stage::AFTER_STANDARD);

    let survivors = store.load_requests(final_stage).unwrap();
    let urls: Vec<&str> = survivors.iter().map(|r| r.url.as_str()).collect();

    // One representative of the reordered-query pair survives.
    assert_eq!(
        urls.iter()
            .filter(|u| u.starts_with("http://app.test/inbox"))
            .count(),
        1
    );
    // Public-shared, static and standard pages are gone.
    assert!(!urls.contains(&"http://app.test/news"));
    assert!(!urls.contains(&"http://app.test/theme.css"));
    assert!(!urls.contains(&"http://app.test/login?next=/inbox"));
    // Private and per-user rows survive; both order variants in mode 4.
    assert!(urls.contains(&"http://app.test/invoice/17"));
    assert_eq!(urls.iter().filter(|u| **u == "http://app.test/orders").count(), 2);
    // Public rows never survive the public-content pass.
    assert!(survivors.iter().all(|r| r.first_user != PUBLIC_USER));
}

#[test]
fn rerunning_a_stage_on_its_own_output_changes_nothing() {
    let mut store = seeded_store(&sample_captures());
    let cfg = settings(DedupMode::M2);
    filters::run_generic(&mut store, &cfg).unwrap();
    let first = store.load_requests(stage::AFTER_STANDARD).unwrap();

    // Feed the final stage back through the whole chain.
    store
        .write_requests(stage::CRAWLING, &first)
        .unwrap();
    filters::run_generic(&mut store, &cfg).unwrap();
    let second = store.load_requests(stage::AFTER_STANDARD).unwrap();

    let urls = |records: &[RequestRecord]| -> Vec<String> {
        records.iter().map(|r| r.url.clone()).collect()
    };
    assert_eq!(urls(&first), urls(&second));
}

#[test]
fn stricter_modes_keep_at_least_as_many_rows() {
    let mut previous = 0;
    for mode in [DedupMode::M1, DedupMode::M2, DedupMode::M3, DedupMode::M4] {
        let mut store = seeded_store(&sample_captures());
        filters::run_generic(&mut store, &settings(mode)).unwrap();
        let kept = store.load_requests(stage::AFTER_STANDARD).unwrap().len();
        assert!(kept >= previous, "mode {mode}: kept {kept}, previous {previous}");
        previous = kept;
    }
}

#[test]
fn pair_stage_contains_only_first_user_rows_not_shared_with_second() {
    let mut store = seeded_store(&sample_captures());
    let cfg = settings(DedupMode::M4);
    let generic_stage = filters::run_generic(&mut store, &cfg).unwrap();

    for (first, second) in [
        ("alice", "bob"),
        ("bob", "alice"),
        ("alice", PUBLIC_USER),
        ("bob", PUBLIC_USER),
    ] {
        filters::other_user::run(&mut store, generic_stage, first, second, &cfg).unwrap();
    }

    let alice_bob = store
        .load_pair_records(stage::AFTER_OTHER_USER, "alice", "bob")
        .unwrap();
    let urls: Vec<&str> = alice_bob.iter().map(|p| p.record.url.as_str()).collect();
    // /reports is shared with bob and filtered; the invoice is not.
    assert!(urls.contains(&"http://app.test/invoice/17"));
    assert!(!urls.contains(&"http://app.test/reports"));
    assert!(alice_bob.iter().all(|p| p.record.first_user == "alice"));
    assert!(alice_bob.iter().all(|p| p.second_user == "bob"));

    // The public user is a comparison subject, never a first user.
    let public_rows = store
        .load_pair_records(stage::AFTER_OTHER_USER, PUBLIC_USER, "alice")
        .unwrap();
    assert!(public_rows.is_empty());

    // Bob kept /reports against the public user but lost it against alice.
    let bob_alice = store
        .load_pair_records(stage::AFTER_OTHER_USER, "bob", "alice")
        .unwrap();
    assert!(bob_alice.is_empty());
    let bob_public = store
        .load_pair_records(stage::AFTER_OTHER_USER, "bob", PUBLIC_USER)
        .unwrap();
    assert_eq!(bob_public.len(), 1);
    assert_eq!(bob_public[0].record.url, "http://app.test/reports");
}

#[test]
fn prod_retention_drops_intermediate_stages_but_not_the_crawl() {
    let mut store = seeded_store(&sample_captures());
    let cfg = FilterSettings {
        db_log_level: DbLogLevel::Prod,
        ..settings(DedupMode::M4)
    };
    filters::run_generic(&mut store, &cfg).unwrap();

    assert!(store.load_requests(stage::AFTER_STANDARD).is_ok());
    assert!(store.load_requests(stage::AFTER_DEDUP).is_err());
    assert!(store.load_requests(stage::AFTER_PUBLIC).is_err());
    assert!(store.load_requests(stage::AFTER_STATIC).is_err());
    // The verifier still needs the raw crawl.
    assert!(store.load_requests(stage::CRAWLING).is_ok());
}
