//! # Top Comment
//!
//! Finds, for every calendar date in a range, the single most-upvoted
//! "Best rated" comment across all news articles published that day, and
//! records which article it came from.
//!
//! ## Features
//!
//! - Lists each day's articles from the news site's daily archive
//! - Reads comment sections through a WebDriver browser session
//! - Checkpoints after every date so an interrupted shard resumes where it stopped
//! - Spreads a long range across cloud instances, one shard each
//! - Merges shard tables into one table with exactly one row per date
//!
//! ## Usage
//!
//! ```sh
//! top_comment scan --start-date 2022-10-24 --end-date 2022-10-30
//! top_comment dispatch --start-date 2022-10-01 --end-date 2022-10-31 -w 5 -c fleet.yaml
//! top_comment merge data/shard_*.csv -o data/top_comments.csv
//! top_comment teardown -c fleet.yaml top-comment-0-k2x9qa
//! ```
//!
//! ## Architecture
//!
//! 1. **Dispatch**: partition the range and bring up one instance per shard
//! 2. **Scan**: each worker walks its dates, articles and comments
//! 3. **Checkpoint**: results are persisted after every completed date
//! 4. **Merge**: shard tables are combined into the final table

use clap::Parser;
use std::error::Error;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod browser;
mod checkpoint;
mod cli;
mod config;
mod error;
mod fleet;
mod models;
mod outputs;
mod retry;
mod scrapers;
mod utils;
mod worker;

use browser::webdriver::{BrowserOptions, WebDriverSession};
use browser::with_session;
use checkpoint::CheckpointStore;
use cli::{Cli, Command, DispatchArgs, MergeArgs, ScanArgs, TeardownArgs};
use config::{LaunchMode, load_config};
use fleet::compute::GceClient;
use fleet::ssh::OpenSshShell;
use fleet::{Dispatcher, ShardOutcome, collect_outputs};
use models::{DateRange, Shard};
use outputs::aggregate::merge_files;
use outputs::table::{OutputRow, render, run_output_path, shard_output_path, write_table};
use retry::RetryPolicy;
use scrapers::comments::Pacing;
use scrapers::listing::DailyMailArchive;
use utils::ensure_writable_dir;
use worker::{ScanSettings, Worker};

const SSH_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
#[instrument]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init (stderr; stdout is reserved for table output) ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    let args = Cli::parse();

    let result = match args.command {
        Command::Scan(scan) => run_scan(scan).await,
        Command::Dispatch(dispatch) => run_dispatch(dispatch).await,
        Command::Merge(merge) => run_merge(merge).await,
        Command::Teardown(teardown) => run_teardown(teardown).await,
    };

    let elapsed = start_time.elapsed();
    match &result {
        Ok(()) => info!(secs = elapsed.as_secs(), millis = elapsed.subsec_millis(), "Execution complete"),
        Err(e) => error!(secs = elapsed.as_secs(), error = %e, "Execution failed"),
    }
    result
}

fn date_range(start: chrono::NaiveDate, end: chrono::NaiveDate) -> Result<DateRange, Box<dyn Error>> {
    DateRange::new(start, end).ok_or_else(|| format!("start date {start} is after end date {end}").into())
}

/// Scan one shard with a fresh browser session and write its table.
#[instrument(level = "info", skip_all, fields(start = %args.start_date, end = %args.end_date, shard = args.shard_index))]
async fn run_scan(args: ScanArgs) -> Result<(), Box<dyn Error>> {
    let range = date_range(args.start_date, args.end_date)?;
    let shard = Shard {
        index: args.shard_index,
        range,
    };
    let options = &args.options;

    // Early check: both directories must be writable before any scanning
    for dir in [&options.output_dir, &options.checkpoint_dir] {
        if let Err(e) = ensure_writable_dir(&dir.to_string_lossy()).await {
            error!(path = %dir.display(), error = %e, "Directory is not writable");
            return Err(e);
        }
    }

    let pacing = Pacing {
        element_timeout: Duration::from_secs(options.element_timeout_secs),
        sleep: Duration::from_millis(options.sleep_ms),
    };
    let settings = ScanSettings {
        top_n: options.top_n.max(1),
        capture_worst: options.capture_worst,
        pacing,
        retry: RetryPolicy::new(options.retry_attempts, pacing.sleep),
        consent_url: options.consent_url.clone(),
        log_every: options.log_every,
    };
    let page_load_timeout = Duration::from_secs(options.page_load_timeout_secs);
    let lister = DailyMailArchive::new(&options.archive_base_url, page_load_timeout)?;
    let store = CheckpointStore::new(&options.checkpoint_dir, range);

    let session = WebDriverSession::open(&BrowserOptions {
        webdriver_url: options.webdriver_url.clone(),
        chrome_args: options.chrome_args.clone(),
        page_load_timeout,
    })
    .await?;
    info!(dates = range.len(), "Browser session open; starting shard");

    let results = with_session(session, async |driver: &WebDriverSession| {
        Worker::new(driver, &lister, &store, shard, &settings).run().await
    })
    .await?;

    let rows: Vec<OutputRow> = results.iter().map(OutputRow::from).collect();
    let path = shard_output_path(&options.output_dir, range);
    write_table(&path, &rows, options.capture_worst).await?;

    if args.emit_stdout {
        print!("{}", render(&rows, options.capture_worst)?);
    }
    Ok(())
}

/// Provision one worker instance per shard.
///
/// Instances are never deleted here; use `teardown` once their output has
/// been collected.
#[instrument(level = "info", skip_all, fields(start = %args.start_date, end = %args.end_date, workers = args.workers))]
async fn run_dispatch(args: DispatchArgs) -> Result<(), Box<dyn Error>> {
    let range = date_range(args.start_date, args.end_date)?;
    let config = load_config(&args.config).await?;
    let compute = GceClient::new(&config.project, &config.zone, &args.access_token)?;
    let shell = OpenSshShell {
        connect_timeout: SSH_CONNECT_TIMEOUT,
    };

    let public_key = match config.ssh.as_ref().and_then(|ssh| ssh.public_key_path.as_ref()) {
        Some(path) => Some(tokio::fs::read_to_string(path).await?),
        None => None,
    };

    let dispatcher = Dispatcher::new(&compute, &shell, &config, args.scan.to_worker_args())
        .with_ssh_public_key(public_key);
    let handles = dispatcher.dispatch(range, args.workers).await?;

    for handle in &handles {
        match &handle.outcome {
            Ok(ShardOutcome::Launched) => {
                info!(shard = %handle.shard, instance = %handle.instance, "Worker launched")
            }
            Ok(ShardOutcome::Completed { stderr, .. }) => info!(
                shard = %handle.shard,
                instance = %handle.instance,
                stderr_lines = stderr.lines().count(),
                "Worker completed"
            ),
            Err(e) => error!(
                shard = %e.shard,
                instance = %e.instance,
                error = %e.source,
                "Shard failed; retry it with `scan` or a narrower `dispatch`"
            ),
        }
    }

    let instances: Vec<&str> = handles.iter().map(|h| h.instance.as_str()).collect();
    info!(?instances, "Instances left running; remove them with `teardown`");

    match config.launch {
        LaunchMode::Ssh => {
            let paths = collect_outputs(&handles, &args.scan.output_dir).await?;
            if paths.is_empty() {
                warn!("No shard produced output; nothing to merge");
            } else {
                let output = run_output_path(&args.scan.output_dir, range);
                merge_files(&paths, &output, args.scan.capture_worst).await?;
            }
        }
        LaunchMode::SelfStart => {
            info!("Workers write their tables on their own instances; copy them back and run `merge`")
        }
    }

    let failed = handles.iter().filter(|h| h.outcome.is_err()).count();
    if failed > 0 {
        return Err(format!("{failed} of {} shards failed", handles.len()).into());
    }
    Ok(())
}

async fn run_merge(args: MergeArgs) -> Result<(), Box<dyn Error>> {
    merge_files(&args.inputs, &args.output, args.with_worst).await?;
    Ok(())
}

#[instrument(level = "info", skip_all, fields(instances = args.instances.len()))]
async fn run_teardown(args: TeardownArgs) -> Result<(), Box<dyn Error>> {
    let config = load_config(&args.config).await?;
    let compute = GceClient::new(&config.project, &config.zone, &args.access_token)?;
    let shell = OpenSshShell {
        connect_timeout: SSH_CONNECT_TIMEOUT,
    };
    let dispatcher = Dispatcher::new(&compute, &shell, &config, Vec::new());

    let failed: Vec<String> = dispatcher
        .teardown(&args.instances)
        .await
        .into_iter()
        .filter_map(|(name, result)| result.err().map(|_| name))
        .collect();
    if !failed.is_empty() {
        return Err(format!("failed to delete: {}", failed.join(", ")).into());
    }
    Ok(())
}
