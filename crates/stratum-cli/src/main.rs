mod report;
mod tracing_setup;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use tracing::error;

use stratum_core::config::{CrawlConfig, DEFAULT_API_BASE, DEFAULT_RAW_BASE, MAX_SEARCHABLE_SIZE};
use stratum_core::{CancellationToken, CrawlResult, Crawler, RevisionMode, RunSummary, Target};

use crate::report::TableReporter;
use crate::tracing_setup::{init_subscriber, Verbosity};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TargetArg {
    /// Files from code search
    Code,
    /// Repositories, with their files from a nested code search
    Repositories,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RevisionArg {
    /// Current file content only
    Snapshot,
    /// Every commit that touched the file
    History,
}

/// Exhaustively sample the GitHub search API by stratifying on size.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Search query
    query: String,

    #[arg(long, value_enum, default_value = "code")]
    target: TargetArg,

    #[arg(long, value_enum, default_value = "snapshot")]
    revisions: RevisionArg,

    /// Code search run inside each sampled repository (repositories target)
    #[arg(long, default_value = "")]
    child_query: String,

    /// Search results database file
    #[arg(long, value_name = "FILE", default_value = "results.db")]
    database: PathBuf,

    /// Sampling statistics file
    #[arg(long, value_name = "FILE", default_value = "sampling.csv")]
    statistics: PathBuf,

    /// Minimum size in bytes
    #[arg(long, value_name = "BYTES", default_value_t = 1)]
    min_size: u64,

    /// Maximum size in bytes
    #[arg(long, value_name = "BYTES", default_value_t = MAX_SEARCHABLE_SIZE)]
    max_size: u64,

    /// Length of the size ranges the population is partitioned into
    #[arg(long, value_name = "BYTES", default_value_t = 1)]
    stratum_size: u64,

    /// Disable request throttling
    #[arg(long)]
    no_throttle: bool,

    /// Personal access token
    #[arg(long, value_name = "TOKEN", env = "GITHUB_TOKEN", hide_env_values = true)]
    github_token: Option<String>,

    /// Include forked repositories
    #[arg(long)]
    include_forks: bool,

    /// Repeat every stratum once per common license
    #[arg(long)]
    license_filter: bool,

    #[arg(long, default_value = DEFAULT_API_BASE, hide = true)]
    api_base: String,

    #[arg(long, default_value = DEFAULT_RAW_BASE, hide = true)]
    raw_base: String,

    /// Debug logging on stderr
    #[arg(short, long)]
    verbose: bool,

    /// Errors only on stderr
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    fn into_config(self) -> CrawlConfig {
        CrawlConfig {
            query: self.query,
            target: match self.target {
                TargetArg::Code => Target::Code,
                TargetArg::Repositories => Target::Repositories,
            },
            revisions: match self.revisions {
                RevisionArg::Snapshot => RevisionMode::Snapshot,
                RevisionArg::History => RevisionMode::History,
            },
            child_query: self.child_query,
            min_size: self.min_size,
            max_size: self.max_size,
            stratum_width: self.stratum_size,
            throttle: !self.no_throttle,
            token: self.github_token,
            include_forks: self.include_forks,
            license_filter: self.license_filter,
            database: self.database,
            statistics: self.statistics,
            api_base: self.api_base,
            raw_base: self.raw_base,
        }
    }
}

/// Exit status after a second interrupt.
const FORCED_EXIT: i32 = 130;

/// The first SIGINT/SIGTERM asks the crawl to stop at the next item; a second
/// one exits immediately, even from inside a blocking request.
fn install_signal_handlers(cancel: &CancellationToken) -> std::io::Result<()> {
    for signal in [SIGINT, SIGTERM] {
        // Registered first, so it sees the flag as it was before this signal.
        signal_hook::flag::register_conditional_shutdown(signal, FORCED_EXIT, cancel.flag())?;
        signal_hook::flag::register(signal, cancel.flag())?;
    }
    Ok(())
}

fn run(config: CrawlConfig) -> CrawlResult<RunSummary> {
    let cancel = CancellationToken::new();
    install_signal_handlers(&cancel)?;

    let reporter = TableReporter::new(config.min_size, config.max_size);
    let mut crawler = Crawler::open(config, cancel)?.with_progress(Box::new(reporter));
    crawler.run()
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_subscriber(Verbosity::from_flags(cli.verbose, cli.quiet));

    match run(cli.into_config()) {
        Ok(summary) => {
            tracing::info!(
                run_id = %summary.run_id,
                strata = summary.strata,
                sample = summary.sample,
                containers = summary.stored.containers,
                children = summary.stored.children,
                revisions = summary.stored.revisions,
                skipped = summary.skips.total(),
                api_calls = summary.api_calls,
                rate_used = ?summary.rate_used,
                elapsed_secs = summary.elapsed.as_secs(),
                "run summary"
            );
            if summary.interrupted {
                ExitCode::from(130)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) if e.is_configuration() => {
            eprintln!("stratum: {e}");
            ExitCode::from(2)
        }
        Err(e) => {
            error!(error = %e, "crawl failed");
            ExitCode::FAILURE
        }
    }
}
