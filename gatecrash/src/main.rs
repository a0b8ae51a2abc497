// gatecrash/src/main.rs
//
// gatecrash — automated access-control vulnerability testing.
//
// Four phases, selected by --run-mode:
//   c — ingest the crawler/proxy capture log into the store
//   f — filter the captures (dedup, public, static, standard, per-pair)
//   r — replay each pair's surviving requests under swapped credentials
//   v — verify candidates against the second user's own crawl
//
// Usage:
//   gatecrash --config run.yaml --run-mode cfrv --full-mode on \
//             --deduplication-mode 4 --matching-mode m3i \
//             --matching-debug off --db-log-level dev --capture-log crawl.jsonl

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gatecrash::canon::RequestMatcher;
use gatecrash::config::Config;
use gatecrash::filters::{self, FilterSettings};
use gatecrash::ingest::{self, ScopePolicy};
use gatecrash::records::{DbLogLevel, DedupMode, MatchingMode, RunMode, Switch};
use gatecrash::replay::{AuthMaterial, ReplaySettings, ReplayTester, DEFAULT_TIMEOUT};
use gatecrash::scripts;
use gatecrash::similarity::MatchParams;
use gatecrash::store::{stage, Store};
use gatecrash::verifier::FindingsVerifier;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "gatecrash",
    about   = "Automated access-control vulnerability testing via request replay",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    #[arg(long, help = "Run configuration in YAML format")]
    config: PathBuf,

    #[arg(long, value_enum,
          help = "Phases to run: c = capture ingest, f = filtering, r = replay, v = verify")]
    run_mode: RunMode,

    #[arg(long, value_enum,
          help = "Full mode replays non-GET requests and accepts redirect statuses")]
    full_mode: Switch,

    #[arg(long, value_enum,
          help = "How strictly request bodies are compared during deduplication")]
    deduplication_mode: DedupMode,

    #[arg(long, value_enum, help = "Stripper profile deciding response similarity")]
    matching_mode: MatchingMode,

    #[arg(long, value_enum,
          help = "Record both stripper profiles for every comparison")]
    matching_debug: Switch,

    #[arg(long, value_enum, help = "Store retention policy")]
    db_log_level: DbLogLevel,

    #[arg(long, value_enum, default_value = "off",
          help = "Skip already-seen exchanges during capture ingest")]
    duplicate_check: Switch,

    #[arg(long, default_value = "1",
          help = "Crawler click depth (capture-side knob, logged for provenance)")]
    iteration_depth: u32,

    #[arg(long, help = "JSONL capture log to ingest (required with run modes containing c)")]
    capture_log: Option<PathBuf>,
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("gatecrash=info".parse()?),
        )
        .compact()
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    let full_mode = cli.full_mode.is_on();

    let db_path = config.target.path_to_db.join("responses.db");
    let mut store = Store::open(&db_path)?;
    store.prepare_run(cli.run_mode)?;

    if cli.run_mode.crawl() {
        let started = Instant::now();
        info!("starting capture ingest");
        let capture_log = cli
            .capture_log
            .as_deref()
            .context("--capture-log is required when the run mode includes c")?;
        info!(
            "capture log {} (crawler iteration depth {})",
            capture_log.display(),
            cli.iteration_depth
        );
        let policy = ScopePolicy::new(config.domains(), config.do_not_call_regex()?, full_mode);
        ingest::ingest_capture_log(
            &mut store,
            capture_log,
            &policy,
            cli.duplicate_check.is_on(),
        )
        .await?;
        info!("finished capture ingest");
        store.record_execution_time("crawling", started.elapsed().as_secs_f64())?;
    }

    if cli.run_mode.filter() {
        let started = Instant::now();
        let settings = FilterSettings {
            mode: cli.deduplication_mode,
            matcher: RequestMatcher::new(config.ignore_tokens_regex()?),
            static_extensions: config.static_content_extensions(),
            standard_pages: config.standard_pages(),
            db_log_level: cli.db_log_level,
        };
        let generic_stage = filters::run_generic(&mut store, &settings)?;

        info!("starting user-dependent filtering");
        for (first_user, second_user) in config.user_combos()? {
            info!("filtering for user combination {first_user} - {second_user}");
            filters::other_user::run(
                &mut store,
                generic_stage,
                &first_user,
                &second_user,
                &settings,
            )?;
        }
        store.vacuum()?;
        if cli.db_log_level == DbLogLevel::Prod {
            store.drop_stage(generic_stage)?;
        }
        info!("finished user-dependent filtering");
        store.record_execution_time("filtering", started.elapsed().as_secs_f64())?;
    }

    if cli.run_mode.replay() {
        let started = Instant::now();
        info!("starting replay testing");
        for (first_user, second_user) in config.user_combos()? {
            if full_mode {
                scripts::reset_application(&config.target.reset_script).await?;
                scripts::authenticate_users(
                    &config.target.auth_script,
                    &first_user,
                    config.credentials_for(&first_user),
                    &second_user,
                    config.credentials_for(&second_user),
                    &cli.config,
                )
                .await?;
            }
            // The auth script refreshes session material in the config
            // file, so each pair reloads it before replaying.
            let pair_config = if full_mode {
                Config::load(&cli.config)?
            } else {
                config.clone()
            };

            info!("replaying using user combination {first_user} - {second_user}");
            let settings = ReplaySettings {
                first_user: first_user.clone(),
                second_user: second_user.clone(),
                auth_first: AuthMaterial::parse(pair_config.token_for(&first_user)),
                auth_second: AuthMaterial::parse(pair_config.token_for(&second_user)),
                csrf_fieldname: pair_config.csrf_fieldname().map(str::to_string),
                csrf_headername: pair_config.csrf_headername().map(str::to_string),
                csrf_tokenvalue: pair_config.csrf_value_for(&second_user).map(str::to_string),
                matching: MatchParams {
                    mode: cli.matching_mode,
                    threshold: pair_config.inter_threshold(),
                    debug: cli.matching_debug.is_on(),
                },
                full_mode,
                db_log_level: cli.db_log_level,
                stripping_tags: pair_config.html_stripping_tags().to_vec(),
                regex_to_match: pair_config.regex_to_match()?,
                timeout: DEFAULT_TIMEOUT,
            };
            let tester = ReplayTester::new(settings)?;
            tester.run(&mut store, stage::AFTER_OTHER_USER).await?;
        }
        if cli.db_log_level == DbLogLevel::Prod {
            store.drop_stage(stage::AFTER_OTHER_USER)?;
        }
        info!("finished replay testing");
        store.record_execution_time("replay_testing", started.elapsed().as_secs_f64())?;
    }

    if cli.run_mode.verify() {
        let started = Instant::now();
        info!("starting findings verifier");
        let verifier = FindingsVerifier {
            matching: MatchParams {
                mode: cli.matching_mode,
                threshold: config.inter_threshold(),
                debug: cli.matching_debug.is_on(),
            },
            db_log_level: cli.db_log_level,
            stripping_tags: config.html_stripping_tags().to_vec(),
        };
        for (first_user, second_user) in config.user_combos()? {
            info!("verifying findings for user combination {first_user} - {second_user}");
            verifier.verify_pair(&mut store, &first_user, &second_user)?;
        }
        info!("finished findings verifier");
        store.record_execution_time("findings_verifier", started.elapsed().as_secs_f64())?;

        if cli.db_log_level == DbLogLevel::Prod {
            for table in [
                stage::CRAWLING,
                stage::EXECUTION_TIME,
                stage::REPLAY_RESULTS,
                stage::VULNS_REPLAY,
            ] {
                store.drop_stage(table)?;
            }
        }
    }

    print_results(&store, cli.run_mode.verify())?;
    Ok(())
}

fn print_results(store: &Store, verified: bool) -> Result<()> {
    let findings = store.list_findings(verified)?;
    if findings.is_empty() {
        info!("No vulnerabilities found");
        return Ok(());
    }
    info!("Vulnerable URLs identified:");
    for (first_user, second_user, method, url) in findings {
        info!("({first_user}, {second_user}): {method} {url}");
    }
    Ok(())
}
