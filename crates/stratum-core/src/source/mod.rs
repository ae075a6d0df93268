//! Source API access: transport, rate-limited execution, and the GitHub
//! endpoint codec.

pub mod executor;
pub mod github;
pub mod transport;

pub use executor::{Clock, Executor, RateState, SystemClock};
pub use github::GitHub;
pub use transport::{HttpTransport, Request, Response, Transport};

/// One decoded page of a linked result sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Page<T> {
    /// Provider-reported total, when the endpoint reports one.
    pub total_count: Option<u64>,
    pub items: Vec<T>,
    pub next: Option<String>,
}

impl<T> Page<T> {
    /// A flat listing: one page, no continuation.
    pub fn single(items: Vec<T>) -> Self {
        Self {
            total_count: None,
            items,
            next: None,
        }
    }
}

/// Turns a successful response into a page.
pub type PageDecoder<T> = fn(&Response) -> crate::errors::CrawlResult<Page<T>>;
