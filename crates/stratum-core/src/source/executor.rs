//! Rate-limited request execution with quota backoff.
//!
//! Every outbound call goes through [`Executor::execute`]. Calls that count
//! against the provider quota are preceded by a fixed throttle pause; quota
//! rejections are waited out and the identical request is re-issued. The
//! retry is unbounded unless a max-attempts override is set.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, error, warn};

use crate::cancel::CancellationToken;
use crate::config::FALLBACK_QUOTA_WAIT;
use crate::errors::{CrawlError, CrawlResult};
use crate::source::transport::{Request, Response, Transport};

/// Slice length for backoff sleeps, so an interrupt is noticed promptly.
const BACKOFF_SLICE: Duration = Duration::from_secs(1);

/// Wall clock and sleep, injected so backoff timing is testable.
pub trait Clock {
    fn now(&self) -> SystemTime;
    fn sleep(&self, duration: Duration);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Process-wide quota bookkeeping.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RateState {
    pub rate_used: Option<u64>,
    pub calls: u64,
    pub last_call: Option<SystemTime>,
    pub quota_waits: u64,
}

pub struct Executor {
    transport: Box<dyn Transport>,
    clock: Arc<dyn Clock>,
    throttle: Option<Duration>,
    max_attempts: Option<u32>,
    cancel: CancellationToken,
    state: RateState,
}

impl Executor {
    pub fn new(transport: Box<dyn Transport>, throttle: Option<Duration>) -> Self {
        Self {
            transport,
            clock: Arc::new(SystemClock),
            throttle,
            max_attempts: None,
            cancel: CancellationToken::new(),
            state: RateState::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Cap quota retries. Intended for test harnesses.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts.max(1));
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> &RateState {
        &self.state
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Issue `request`, waiting out quota rejections.
    ///
    /// Returns the first successful response. A lost connection is
    /// `Transport`; any other non-success is `Request` with the body attached.
    pub fn execute(&mut self, request: &Request) -> CrawlResult<Response> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if request.rate_limited {
                if let Some(interval) = self.throttle {
                    self.clock.sleep(interval);
                }
            }

            let response = self.transport.send(request)?;
            self.record_call(request, &response);

            if is_quota_exceeded(&response) {
                if let Some(max) = self.max_attempts {
                    if attempts >= max {
                        return Err(CrawlError::QuotaExhausted {
                            attempts,
                            url: request.display_url(),
                        });
                    }
                }
                let wait = quota_wait(&response, self.clock.now());
                self.state.quota_waits += 1;
                warn!(
                    "Exceeded rate limit. Retrying after {} seconds...",
                    wait.as_secs()
                );
                self.backoff(wait)?;
                continue;
            }

            if response.is_success() {
                return Ok(response);
            }

            let body = response.text();
            error!(
                status = response.status,
                url = %request.display_url(),
                body = %body,
                "request failed"
            );
            return Err(CrawlError::Request {
                status: response.status,
                url: request.display_url(),
                body,
            });
        }
    }

    fn record_call(&mut self, request: &Request, response: &Response) {
        self.state.calls += 1;
        self.state.last_call = Some(self.clock.now());
        if let Some(used) = response.header_u64("x-ratelimit-used") {
            self.state.rate_used = Some(used);
        }
        debug!(
            status = response.status,
            url = %request.display_url(),
            calls = self.state.calls,
            rate_used = ?self.state.rate_used,
            "request completed"
        );
    }

    /// Sleep for `wait`, in slices, bailing out if cancellation is requested.
    fn backoff(&self, wait: Duration) -> CrawlResult<()> {
        let mut remaining = wait;
        while !remaining.is_zero() {
            self.cancel.check()?;
            let slice = remaining.min(BACKOFF_SLICE);
            self.clock.sleep(slice);
            remaining -= slice;
        }
        self.cancel.check()
    }
}

/// A 429, or a 403 that the provider attributes to the rate limit.
pub fn is_quota_exceeded(response: &Response) -> bool {
    match response.status {
        429 => true,
        403 => {
            response.header("x-ratelimit-remaining").map(str::trim) == Some("0")
                || response.header("retry-after").is_some()
                || response.text().to_ascii_lowercase().contains("rate limit")
        }
        _ => false,
    }
}

/// How long to wait before re-issuing a quota-rejected request: until the
/// reset timestamp if given, else the retry-after duration, else the fallback.
pub fn quota_wait(response: &Response, now: SystemTime) -> Duration {
    if let Some(reset) = response.header_u64("x-ratelimit-reset") {
        let now_secs = now
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        return Duration::from_secs(reset.saturating_sub(now_secs));
    }
    if let Some(retry_after) = response.header_u64("retry-after") {
        return Duration::from_secs(retry_after);
    }
    FALLBACK_QUOTA_WAIT
}
