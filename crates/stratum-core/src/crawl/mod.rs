//! Stratified crawl: planning, estimation, traversal, and deduplication.

pub mod engine;
pub mod estimator;
pub mod gateway;
pub mod paginate;
pub mod planner;

pub use engine::{
    Crawler, ItemOutcome, NoProgress, Progress, RunSummary, SkipCounts, SkipReason,
};
pub use estimator::PopulationEstimate;
pub use gateway::{Admission, DedupGateway};
pub use paginate::{crawl, CrawlOutcome, PageHandler, StopReason};
pub use planner::{RunTotals, StratumPlanner};
