//! Stratum core library: stratified, resumable sampling of a search API that
//! caps every query at 1000 results.
//!
//! The size domain is split into strata, each stratum is searched in
//! ascending and (when needed) descending order, and every hit's repository,
//! file and revisions are stored once in SQLite. Completed strata are logged
//! so an interrupted run resumes where it stopped.

pub mod cancel;
pub mod checkpoint;
pub mod config;
pub mod crawl;
pub mod errors;
pub mod models;
pub mod source;
pub mod store;

pub use cancel::CancellationToken;
pub use config::{CrawlConfig, RevisionMode};
pub use crawl::{Crawler, Progress, RunSummary};
pub use errors::{CrawlError, CrawlResult};
pub use models::Target;
