//! Command-line interface definitions for the top comment finder.
//!
//! This module defines the subcommands and their options using the `clap`
//! crate. Connection settings can also come from environment variables.

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Command-line arguments for the top comment finder.
///
/// # Examples
///
/// ```sh
/// # Scan one shard locally against a running chromedriver
/// top_comment scan --start-date 2022-10-24 --end-date 2022-10-30
///
/// # Spread a month across five cloud workers
/// top_comment dispatch --start-date 2022-10-01 --end-date 2022-10-31 \
///     --workers 5 --config fleet.yaml
///
/// # Combine shard tables
/// top_comment merge data/shard_*.csv --output data/top_comments.csv
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Scan one shard of dates and write its output table
    Scan(ScanArgs),
    /// Partition a date range across cloud workers
    Dispatch(DispatchArgs),
    /// Merge shard output tables into one table
    Merge(MergeArgs),
    /// Delete worker instances by name
    Teardown(TeardownArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ScanArgs {
    /// First date of the shard (inclusive), YYYY-MM-DD
    #[arg(long)]
    pub start_date: NaiveDate,

    /// Last date of the shard (inclusive), YYYY-MM-DD
    #[arg(long)]
    pub end_date: NaiveDate,

    /// Position of this shard in a dispatched run
    #[arg(long, default_value_t = 0)]
    pub shard_index: usize,

    #[command(flatten)]
    pub options: ScanOptions,

    /// Also print the output table to stdout
    #[arg(long)]
    pub emit_stdout: bool,
}

/// Scan options shared by `scan` and forwarded by `dispatch` to its workers.
#[derive(Args, Debug, Clone)]
pub struct ScanOptions {
    /// Number of best-rated comments read per article
    #[arg(long, default_value_t = 1)]
    pub top_n: usize,

    /// Also record the worst-rated comment of each winning article
    #[arg(long)]
    pub capture_worst: bool,

    /// Seconds to wait for a page element
    #[arg(long, default_value_t = 5)]
    pub element_timeout_secs: u64,

    /// Seconds to wait for a page load
    #[arg(long, default_value_t = 30)]
    pub page_load_timeout_secs: u64,

    /// Pause before each page interaction, in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub sleep_ms: u64,

    /// Attempts per article on transient browser errors
    #[arg(long, default_value_t = 3)]
    pub retry_attempts: usize,

    /// Log progress every N articles
    #[arg(long, default_value_t = 25)]
    pub log_every: usize,

    /// WebDriver (chromedriver) endpoint
    #[arg(long, env = "WEBDRIVER_URL", default_value = "http://localhost:9515")]
    pub webdriver_url: String,

    /// Browser launch flags, comma separated
    #[arg(
        long,
        value_delimiter = ',',
        allow_hyphen_values = true,
        default_value = "--disable-dev-shm-usage,--no-sandbox,--disable-notifications,--headless"
    )]
    pub chrome_args: Vec<String>,

    /// Site root holding the daily article archive
    #[arg(long, default_value = "https://www.dailymail.co.uk")]
    pub archive_base_url: String,

    /// Page visited to dismiss the consent pop-up
    #[arg(long, default_value = "https://www.dailymail.co.uk/home/index.html")]
    pub consent_url: String,

    /// Directory for checkpoint files
    #[arg(long, default_value = "checkpoints")]
    pub checkpoint_dir: PathBuf,

    /// Directory for output tables
    #[arg(short, long, default_value = "data")]
    pub output_dir: PathBuf,
}

impl ScanOptions {
    /// Render these options back into `scan` flags for a remote worker.
    ///
    /// Directories stay at the worker's defaults.
    pub fn to_worker_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("--top-n={}", self.top_n),
            format!("--element-timeout-secs={}", self.element_timeout_secs),
            format!("--page-load-timeout-secs={}", self.page_load_timeout_secs),
            format!("--sleep-ms={}", self.sleep_ms),
            format!("--retry-attempts={}", self.retry_attempts),
            format!("--log-every={}", self.log_every),
            format!("--webdriver-url={}", self.webdriver_url),
            format!("--chrome-args={}", self.chrome_args.join(",")),
            format!("--archive-base-url={}", self.archive_base_url),
            format!("--consent-url={}", self.consent_url),
        ];
        if self.capture_worst {
            args.push("--capture-worst".to_string());
        }
        args
    }
}

#[derive(Args, Debug)]
pub struct DispatchArgs {
    /// First date of the run (inclusive), YYYY-MM-DD
    #[arg(long)]
    pub start_date: NaiveDate,

    /// Last date of the run (inclusive), YYYY-MM-DD
    #[arg(long)]
    pub end_date: NaiveDate,

    /// Number of worker instances
    #[arg(short, long)]
    pub workers: usize,

    /// Path to the fleet config YAML
    #[arg(short, long)]
    pub config: String,

    /// OAuth access token for the Compute Engine API
    #[arg(long, env = "GCE_ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: String,

    #[command(flatten)]
    pub scan: ScanOptions,
}

#[derive(Args, Debug)]
pub struct MergeArgs {
    /// Shard output tables, in shard order
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,

    /// Merged table path
    #[arg(short, long)]
    pub output: PathBuf,

    /// Keep the worst-rated comment columns
    #[arg(long)]
    pub with_worst: bool,
}

#[derive(Args, Debug)]
pub struct TeardownArgs {
    /// Path to the fleet config YAML
    #[arg(short, long)]
    pub config: String,

    #[arg(long, env = "GCE_ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: String,

    /// Instance names to delete
    #[arg(required = true)]
    pub instances: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_defaults() {
        let cli = Cli::parse_from([
            "top_comment",
            "scan",
            "--start-date",
            "2022-10-25",
            "--end-date",
            "2022-10-26",
        ]);
        let Command::Scan(args) = cli.command else {
            panic!("expected scan");
        };
        assert_eq!(args.start_date, NaiveDate::from_ymd_opt(2022, 10, 25).unwrap());
        assert_eq!(args.options.top_n, 1);
        assert_eq!(args.options.element_timeout_secs, 5);
        assert_eq!(args.options.sleep_ms, 1000);
        assert_eq!(args.options.retry_attempts, 3);
        assert_eq!(args.options.log_every, 25);
        assert_eq!(args.options.chrome_args.len(), 4);
        assert_eq!(args.options.chrome_args[3], "--headless");
        assert!(!args.emit_stdout);
    }

    #[test]
    fn test_scan_rejects_bad_date() {
        let parsed = Cli::try_parse_from([
            "top_comment",
            "scan",
            "--start-date",
            "25/10/2022",
            "--end-date",
            "2022-10-26",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_dispatch_parsing() {
        let cli = Cli::parse_from([
            "top_comment",
            "dispatch",
            "--start-date",
            "2022-10-01",
            "--end-date",
            "2022-10-31",
            "-w",
            "5",
            "-c",
            "fleet.yaml",
            "--access-token",
            "tok",
            "--top-n",
            "3",
            "--capture-worst",
        ]);
        let Command::Dispatch(args) = cli.command else {
            panic!("expected dispatch");
        };
        assert_eq!(args.workers, 5);
        assert_eq!(args.config, "fleet.yaml");
        assert_eq!(args.scan.top_n, 3);

        let forwarded = args.scan.to_worker_args();
        assert!(forwarded.contains(&"--top-n=3".to_string()));
        assert!(forwarded.contains(&"--capture-worst".to_string()));
        assert!(forwarded.iter().any(|a| a.starts_with("--chrome-args=--disable-dev-shm-usage,")));
    }

    #[test]
    fn test_forwarded_args_parse_back() {
        let options = ScanOptions {
            top_n: 2,
            capture_worst: false,
            element_timeout_secs: 7,
            page_load_timeout_secs: 30,
            sleep_ms: 0,
            retry_attempts: 4,
            log_every: 10,
            webdriver_url: "http://localhost:4444".into(),
            chrome_args: vec!["--headless".into()],
            archive_base_url: "https://www.dailymail.co.uk".into(),
            consent_url: "https://www.dailymail.co.uk/home/index.html".into(),
            checkpoint_dir: "checkpoints".into(),
            output_dir: "data".into(),
        };
        let mut argv = vec![
            "top_comment".to_string(),
            "scan".to_string(),
            "--start-date=2022-10-25".to_string(),
            "--end-date=2022-10-25".to_string(),
        ];
        argv.extend(options.to_worker_args());
        let Command::Scan(args) = Cli::parse_from(argv).command else {
            panic!("expected scan");
        };
        assert_eq!(args.options.top_n, 2);
        assert_eq!(args.options.element_timeout_secs, 7);
        assert_eq!(args.options.chrome_args, vec!["--headless".to_string()]);
        assert_eq!(args.options.webdriver_url, "http://localhost:4444");
    }

    #[test]
    fn test_merge_requires_inputs() {
        assert!(Cli::try_parse_from(["top_comment", "merge", "-o", "out.csv"]).is_err());
        let cli = Cli::parse_from(["top_comment", "merge", "a.csv", "b.csv", "-o", "out.csv"]);
        let Command::Merge(args) = cli.command else {
            panic!("expected merge");
        };
        assert_eq!(args.inputs.len(), 2);
    }
}
