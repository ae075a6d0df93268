//! Error types for the stratum core library.

/// Top-level error enum for the crawl engine.
#[derive(Debug, thiserror::Error)]
pub enum CrawlError {
    /// Connectivity lost. Never retried.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Any non-success response that is not a quota rejection.
    #[error("Request error: HTTP {status} for {url}: {body}")]
    Request {
        status: u16,
        url: String,
        body: String,
    },

    /// Only raised when a max-attempts override is configured.
    #[error("Quota still exhausted after {attempts} attempts for {url}")]
    QuotaExhausted { attempts: u32, url: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Crawl cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CrawlError {
    /// Whether a per-item handler may skip the item and carry on with the
    /// stratum. Transport, storage and cancellation errors always propagate.
    pub fn is_item_recoverable(&self) -> bool {
        matches!(
            self,
            CrawlError::Request { .. } | CrawlError::Decode(_) | CrawlError::Json(_)
        )
    }

    /// Invalid settings and a corrupt checkpoint log both stop the run
    /// before any network activity.
    pub fn is_configuration(&self) -> bool {
        matches!(self, CrawlError::Config(_) | CrawlError::Checkpoint(_))
    }

    /// Short machine-readable label, stored with skip diagnostics.
    pub fn category(&self) -> &'static str {
        match self {
            CrawlError::Transport(_) => "transport",
            CrawlError::Request { .. } => "request",
            CrawlError::QuotaExhausted { .. } => "quota",
            CrawlError::Config(_) => "config",
            CrawlError::Checkpoint(_) => "checkpoint",
            CrawlError::Decode(_) => "decode",
            CrawlError::Cancelled => "cancelled",
            CrawlError::Io(_) => "io",
            CrawlError::Sqlite(_) => "sqlite",
            CrawlError::Json(_) => "json",
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            CrawlError::Request { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type CrawlResult<T> = Result<T, CrawlError>;
