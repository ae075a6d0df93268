//! Result sink: durable, deduplicated storage of sampled records.

pub mod database;
pub mod schema;

pub use database::Database;

use crate::errors::CrawlResult;
use crate::models::{NaturalKey, RecordKind, ResourceRecord};

/// Outcome of a conflict-ignoring insert.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Insertion {
    /// Local id of the row holding the record's natural key.
    pub id: i64,
    /// False when a row with the same natural key already existed.
    pub inserted: bool,
}

/// A skipped item, kept for later diagnosis.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
    pub run_id: String,
    pub stage: String,
    pub category: String,
    pub url: Option<String>,
    pub status: Option<u16>,
    pub message: String,
}

/// Storage contract the crawl engine writes to.
pub trait ResultSink {
    /// Local id of the row with this natural key, if present.
    fn lookup(&self, key: &NaturalKey) -> CrawlResult<Option<i64>>;

    /// Insert, ignoring a conflict on the natural key.
    fn insert(&mut self, record: &ResourceRecord) -> CrawlResult<Insertion>;

    fn count(&self, kind: RecordKind) -> CrawlResult<u64>;

    fn record_diagnostic(&mut self, diagnostic: &Diagnostic) -> CrawlResult<()>;

    /// Push pending writes to durable storage.
    fn flush(&mut self) -> CrawlResult<()>;

    /// Flush and release the connection. Safe to call more than once.
    fn close(&mut self) -> CrawlResult<()>;
}
