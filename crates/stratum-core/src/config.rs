//! Crawl configuration, provider limits, and the license filter table.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::errors::{CrawlError, CrawlResult};
use crate::models::{QueryDescriptor, Target};

// Provider limits
pub const MAX_SEARCHABLE_SIZE: u64 = 393_216;
pub const MAX_RESULTS_PER_QUERY: i64 = 1000;
pub const PAGE_SIZE: u32 = 100;

// Throttle intervals sized to the provider's hourly/minutely budgets
pub const AUTHENTICATED_THROTTLE: Duration = Duration::from_millis(720);
pub const ANONYMOUS_THROTTLE: Duration = Duration::from_secs(6);
pub const FALLBACK_QUOTA_WAIT: Duration = Duration::from_secs(60);

pub const DEFAULT_API_BASE: &str = "https://api.github.com";
pub const DEFAULT_RAW_BASE: &str = "https://raw.githubusercontent.com";

/// License keys iterated when the categorical filter set is enabled.
pub const LICENSE_KEYS: &[&str] = &[
    "agpl-3.0",
    "apache-2.0",
    "bsd-2-clause",
    "bsd-3-clause",
    "bsl-1.0",
    "cc0-1.0",
    "epl-2.0",
    "gpl-2.0",
    "gpl-3.0",
    "lgpl-2.1",
    "mit",
    "mpl-2.0",
    "unlicense",
];

/// How revisions of a sampled file are acquired.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RevisionMode {
    /// Current blob only, fetched from the hit's contents URL.
    #[default]
    Snapshot,
    /// Every commit touching the file, content from the raw endpoint.
    History,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    pub query: String,
    pub target: Target,
    pub revisions: RevisionMode,
    /// Query used for the nested code search inside each repository.
    pub child_query: String,
    pub min_size: u64,
    pub max_size: u64,
    pub stratum_width: u64,
    pub throttle: bool,
    pub token: Option<String>,
    pub include_forks: bool,
    pub license_filter: bool,
    pub database: PathBuf,
    pub statistics: PathBuf,
    pub api_base: String,
    pub raw_base: String,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            query: String::new(),
            target: Target::Code,
            revisions: RevisionMode::Snapshot,
            child_query: String::new(),
            min_size: 1,
            max_size: MAX_SEARCHABLE_SIZE,
            stratum_width: 1,
            throttle: true,
            token: None,
            include_forks: false,
            license_filter: false,
            database: PathBuf::from("results.db"),
            statistics: PathBuf::from("sampling.csv"),
            api_base: DEFAULT_API_BASE.to_string(),
            raw_base: DEFAULT_RAW_BASE.to_string(),
        }
    }
}

impl CrawlConfig {
    /// Reject settings the crawl cannot run with. Called before any network
    /// activity.
    pub fn validate(&self) -> CrawlResult<()> {
        if self.min_size < 1 {
            return Err(CrawlError::Config("min-size must be positive".into()));
        }
        if self.max_size < 1 {
            return Err(CrawlError::Config("max-size must be positive".into()));
        }
        if self.max_size > MAX_SEARCHABLE_SIZE {
            return Err(CrawlError::Config(format!(
                "max-size must be less than or equal to {MAX_SEARCHABLE_SIZE}"
            )));
        }
        if self.min_size >= self.max_size {
            return Err(CrawlError::Config(
                "min-size must be less than max-size".into(),
            ));
        }
        if self.stratum_width < 1 {
            return Err(CrawlError::Config("stratum-size must be positive".into()));
        }
        // Both targets end in code search, which rejects anonymous callers.
        if self.credential().is_none() {
            return Err(CrawlError::Config(
                "code search requires an access token (GITHUB_TOKEN)".into(),
            ));
        }
        if self.target == Target::Repositories && self.child_query.trim().is_empty() {
            return Err(CrawlError::Config(
                "repository sampling requires a child query".into(),
            ));
        }
        if self.target == Target::Code && self.license_filter {
            return Err(CrawlError::Config(
                "license filtering is only supported for repository search".into(),
            ));
        }
        Ok(())
    }

    pub fn credential(&self) -> Option<&str> {
        self.token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    /// Fixed pause before each rate-limited call, or `None` when disabled.
    pub fn throttle_interval(&self) -> Option<Duration> {
        if !self.throttle {
            return None;
        }
        Some(match self.credential() {
            Some(_) => AUTHENTICATED_THROTTLE,
            None => ANONYMOUS_THROTTLE,
        })
    }

    /// Filter values for the outer loop; a single `None` when filtering is off.
    pub fn filter_values(&self) -> Vec<Option<&'static str>> {
        if self.license_filter {
            LICENSE_KEYS.iter().map(|k| Some(*k)).collect()
        } else {
            vec![None]
        }
    }

    pub fn base_query(&self) -> QueryDescriptor {
        let mut q = QueryDescriptor::new(self.query.clone(), self.min_size, self.max_size);
        q.include_forks = self.include_forks;
        q
    }
}
