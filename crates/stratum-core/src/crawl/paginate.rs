//! Generic traversal of a linked sequence of result pages.
//!
//! The same loop walks top-level search results, a repository's nested code
//! search, and a file's commit history. Flat listings are a single page with
//! no continuation.

use tracing::debug;

use crate::errors::CrawlResult;
use crate::source::transport::Request;
use crate::source::{Executor, Page, PageDecoder};

/// Receives the items of a page sequence one at a time.
pub trait PageHandler<T> {
    fn handle(&mut self, exec: &mut Executor, item: T) -> CrawlResult<()>;

    /// Called with each page's reported total, when the endpoint reports one.
    fn observe_total(&mut self, _total: u64) {}

    /// False once the caller has what it wants; checked around every item.
    fn should_continue(&self) -> bool {
        true
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// No continuation link remained.
    Exhausted,
    /// The handler asked to stop.
    TargetReached,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CrawlOutcome {
    pub pages: u32,
    pub items: u64,
    /// Largest total reported by any page.
    pub total: Option<u64>,
    pub stop: StopReason,
}

/// Walk `first` and every page linked after it, handing items to `handler`
/// in page order. Cancellation and fatal errors surface through the handler
/// or the executor.
pub fn crawl<T, H>(
    exec: &mut Executor,
    first: Page<T>,
    decode: PageDecoder<T>,
    handler: &mut H,
) -> CrawlResult<CrawlOutcome>
where
    H: PageHandler<T> + ?Sized,
{
    let mut outcome = CrawlOutcome {
        pages: 0,
        items: 0,
        total: None,
        stop: StopReason::Exhausted,
    };
    let mut page = first;

    loop {
        outcome.pages += 1;
        if let Some(total) = page.total_count {
            outcome.total = Some(outcome.total.map_or(total, |t| t.max(total)));
            handler.observe_total(total);
        }

        for item in page.items {
            if !handler.should_continue() {
                outcome.stop = StopReason::TargetReached;
                return Ok(outcome);
            }
            handler.handle(exec, item)?;
            outcome.items += 1;
        }
        if !handler.should_continue() {
            outcome.stop = StopReason::TargetReached;
            return Ok(outcome);
        }

        let Some(next) = page.next else {
            return Ok(outcome);
        };
        debug!(url = %next, page = outcome.pages + 1, "following continuation link");
        let response = exec.execute(&Request::api(next))?;
        page = decode(&response)?;
    }
}
