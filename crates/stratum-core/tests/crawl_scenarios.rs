//! End-to-end crawls against an in-process fake of the search provider.
//!
//! The fake answers code searches by actually filtering a fixed file set on
//! the `size:a..b` qualifier, sorting by the requested order, capping at 1000
//! results and paginating with `Link` headers, so the crawl's queries,
//! pagination and dedup are exercised together.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::json;

use stratum_core::cancel::CancellationToken;
use stratum_core::checkpoint::read_log;
use stratum_core::config::CrawlConfig;
use stratum_core::crawl::{Crawler, Progress, RunTotals};
use stratum_core::models::{CheckpointEntry, SampleCounts};
use stratum_core::source::{Clock, Executor, Request, Response, Transport};
use stratum_core::store::Database;
use stratum_core::CrawlResult;

const API: &str = "https://api.fake";
const PAGE: usize = 100;
const CAP: usize = 1000;
const EPOCH: u64 = 1_700_000_000;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

struct FakeFile {
    repo: i64,
    path: String,
    size: u64,
}

/// One logged search: the size term, the order and the page number.
#[derive(Clone, Debug, PartialEq, Eq)]
struct SearchCall {
    size: String,
    order: String,
    page: usize,
}

#[derive(Default)]
struct Provider {
    files: Vec<FakeFile>,
    searches: Vec<SearchCall>,
    contents_calls: usize,
    /// When set, the next search is rejected with this reset timestamp.
    quota_reset: Option<u64>,
}

#[derive(Clone, Default)]
struct FakeGitHub {
    inner: Rc<RefCell<Provider>>,
}

impl FakeGitHub {
    fn with_files(count: usize, max_size: u64) -> Self {
        let files = (0..count)
            .map(|i| FakeFile {
                repo: (i % 5) as i64 + 1,
                path: format!("contracts/F{i}.sol"),
                size: (i as u64 * 7) % max_size + 1,
            })
            .collect();
        let fake = Self::default();
        fake.inner.borrow_mut().files = files;
        fake
    }

    fn searches(&self) -> Vec<SearchCall> {
        self.inner.borrow().searches.clone()
    }

    fn contents_calls(&self) -> usize {
        self.inner.borrow().contents_calls
    }

    fn reject_next_search_until(&self, reset: u64) {
        self.inner.borrow_mut().quota_reset = Some(reset);
    }
}

fn params(request: &Request) -> (String, Vec<(String, String)>) {
    let mut pairs = request.query.clone();
    let (base, query) = match request.url.split_once('?') {
        Some((base, query)) => (base.to_string(), query),
        None => (request.url.clone(), ""),
    };
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        if let Some((k, v)) = pair.split_once('=') {
            pairs.push((k.to_string(), v.replace('+', " ")));
        }
    }
    (base, pairs)
}

fn param<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

fn repo_json(id: i64) -> serde_json::Value {
    json!({
        "id": id,
        "name": format!("r{id}"),
        "full_name": format!("acme/r{id}"),
        "description": null,
        "url": format!("{API}/repos/acme/r{id}"),
        "fork": false,
        "owner": {"id": 100, "login": "acme"}
    })
}

impl Provider {
    fn search(&mut self, pairs: &[(String, String)]) -> Response {
        let q = param(pairs, "q").unwrap_or_default().to_string();
        let order = param(pairs, "order").unwrap_or("asc").to_string();
        let page: usize = param(pairs, "page").and_then(|p| p.parse().ok()).unwrap_or(1);
        let size_term = q
            .split_whitespace()
            .find(|t| t.starts_with("size:"))
            .unwrap_or("size:0..0")
            .to_string();
        let (lo, hi) = size_term["size:".len()..]
            .split_once("..")
            .map(|(a, b)| (a.parse::<u64>().unwrap(), b.parse::<u64>().unwrap()))
            .unwrap();
        self.searches.push(SearchCall {
            size: size_term,
            order: order.clone(),
            page,
        });

        let mut matches: Vec<&FakeFile> = self
            .files
            .iter()
            .filter(|f| lo <= f.size && f.size <= hi)
            .collect();
        matches.sort_by(|a, b| (a.size, &a.path).cmp(&(b.size, &b.path)));
        if order == "desc" {
            matches.reverse();
        }
        let total = matches.len();
        matches.truncate(CAP);

        let start = (page - 1) * PAGE;
        let end = (page * PAGE).min(matches.len());
        let items: Vec<serde_json::Value> = matches
            .get(start..end)
            .unwrap_or_default()
            .iter()
            .map(|f| {
                json!({
                    "name": f.path.rsplit('/').next().unwrap(),
                    "path": f.path,
                    "sha": format!("blob-{}", f.path),
                    "url": format!("{API}/repositories/{}/contents/{}", f.repo, f.path),
                    "repository": repo_json(f.repo)
                })
            })
            .collect();

        let body = json!({"total_count": total, "incomplete_results": false, "items": items});
        let mut response = Response::new(200, serde_json::to_vec(&body).unwrap());
        if end < matches.len() {
            response = response.with_header(
                "link",
                format!(
                    "<{API}/search/code?q={}&order={order}&page={}>; rel=\"next\"",
                    q.replace(' ', "+"),
                    page + 1
                ),
            );
        }
        response
    }

    fn contents(&mut self, path: &str) -> Response {
        self.contents_calls += 1;
        let body = json!({
            "type": "file",
            "sha": format!("blob-{path}"),
            "content": BASE64.encode(format!("// {path}\n").as_bytes()),
            "encoding": "base64"
        });
        Response::new(200, serde_json::to_vec(&body).unwrap())
    }
}

impl Transport for FakeGitHub {
    fn send(&mut self, request: &Request) -> CrawlResult<Response> {
        let (base, pairs) = params(request);
        let mut provider = self.inner.borrow_mut();
        if base == format!("{API}/search/code") {
            if let Some(reset) = provider.quota_reset.take() {
                return Ok(Response::new(403, "{\"message\":\"API rate limit exceeded\"}")
                    .with_header("x-ratelimit-remaining", "0")
                    .with_header("x-ratelimit-reset", reset.to_string()));
            }
            return Ok(provider.search(&pairs));
        }
        if let Some(rest) = base.strip_prefix(&format!("{API}/repositories/")) {
            if let Some((_, path)) = rest.split_once("/contents/") {
                return Ok(provider.contents(path));
            }
        }
        Ok(Response::new(404, "Not Found"))
    }
}

/// Clock that advances only when slept on.
struct TestClock {
    now: Mutex<SystemTime>,
    slept: Mutex<Duration>,
}

impl TestClock {
    fn at(epoch: u64) -> Self {
        Self {
            now: Mutex::new(UNIX_EPOCH + Duration::from_secs(epoch)),
            slept: Mutex::new(Duration::ZERO),
        }
    }

    fn slept(&self) -> Duration {
        *self.slept.lock().unwrap()
    }
}

impl Clock for TestClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap()
    }

    fn sleep(&self, duration: Duration) {
        *self.now.lock().unwrap() += duration;
        *self.slept.lock().unwrap() += duration;
    }
}

/// Requests cancellation once `after` strata are in the log.
struct CancelAfter {
    token: CancellationToken,
    after: u64,
}

impl Progress for CancelAfter {
    fn stratum_finished(&mut self, _entry: &CheckpointEntry, totals: &RunTotals) {
        if totals.strata >= self.after {
            self.token.cancel();
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn config(dir: &Path) -> CrawlConfig {
    CrawlConfig {
        query: "pragma solidity".into(),
        token: Some("t0k3n".into()),
        min_size: 1,
        max_size: 40,
        stratum_width: 10,
        throttle: false,
        database: dir.join("results.db"),
        statistics: dir.join("sampling.csv"),
        api_base: API.into(),
        raw_base: "https://raw.fake".into(),
        ..CrawlConfig::default()
    }
}

fn crawler(config: CrawlConfig, github: &FakeGitHub, clock: Arc<TestClock>, cancel: CancellationToken) -> Crawler {
    let exec = Executor::new(Box::new(github.clone()), None).with_clock(clock);
    let sink = Database::open(&config.database).unwrap();
    Crawler::with_parts(config, exec, Box::new(sink), cancel).unwrap()
}

fn stratum_searches(github: &FakeGitHub, overall: &str) -> Vec<String> {
    github
        .searches()
        .into_iter()
        .filter(|c| c.page == 1 && c.order == "asc" && c.size != overall)
        .map(|c| c.size)
        .collect()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn full_crawl_tiles_range_and_stores_every_file() {
    let dir = tempfile::tempdir().unwrap();
    let github = FakeGitHub::with_files(60, 40);
    let mut crawler = crawler(
        config(dir.path()),
        &github,
        Arc::new(TestClock::at(EPOCH)),
        CancellationToken::new(),
    );

    let summary = crawler.run().unwrap();

    assert_eq!(
        stratum_searches(&github, "size:1..40"),
        vec!["size:1..10", "size:11..20", "size:21..30", "size:31..40"]
    );
    assert_eq!(summary.overall_population, Some(60));
    assert_eq!(summary.sample, 60);
    assert_eq!(
        summary.stored,
        SampleCounts {
            containers: 5,
            children: 60,
            revisions: 60
        }
    );

    let log = read_log(&dir.path().join("sampling.csv")).unwrap();
    assert_eq!(log.len(), 4);
    for entry in &log {
        assert!(entry.sample <= entry.population);
    }
    assert_eq!(log.iter().map(|e| e.population).sum::<i64>(), 60);
}

#[test]
fn second_run_adds_nothing_and_skips_nested_fetches() {
    let dir = tempfile::tempdir().unwrap();
    let github = FakeGitHub::with_files(60, 40);
    let first = crawler(
        config(dir.path()),
        &github,
        Arc::new(TestClock::at(EPOCH)),
        CancellationToken::new(),
    )
    .run()
    .unwrap();
    let fetched = github.contents_calls();

    // Fresh statistics file, same database: every stratum is searched again.
    let mut cfg = config(dir.path());
    cfg.statistics = dir.path().join("rerun.csv");
    let second = crawler(cfg, &github, Arc::new(TestClock::at(EPOCH)), CancellationToken::new())
        .run()
        .unwrap();

    assert_eq!(second.stored, first.stored);
    assert_eq!(second.sample, 0);
    assert_eq!(second.skips.duplicate, 60);
    assert_eq!(github.contents_calls(), fetched);
}

#[test]
fn resumed_run_matches_uninterrupted_run() {
    let reference_dir = tempfile::tempdir().unwrap();
    let reference = FakeGitHub::with_files(60, 40);
    crawler(
        config(reference_dir.path()),
        &reference,
        Arc::new(TestClock::at(EPOCH)),
        CancellationToken::new(),
    )
    .run()
    .unwrap();
    let expected = read_log(&reference_dir.path().join("sampling.csv")).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let github = FakeGitHub::with_files(60, 40);
    let token = CancellationToken::new();
    let interrupted = crawler(config(dir.path()), &github, Arc::new(TestClock::at(EPOCH)), token.clone())
        .with_progress(Box::new(CancelAfter { token, after: 2 }))
        .run()
        .unwrap();
    assert!(interrupted.interrupted);
    assert_eq!(interrupted.strata_this_run, 2);

    let before_resume = github.searches().len();
    let resumed = crawler(
        config(dir.path()),
        &github,
        Arc::new(TestClock::at(EPOCH)),
        CancellationToken::new(),
    )
    .run()
    .unwrap();

    let resumed_strata: Vec<String> = github.searches()[before_resume..]
        .iter()
        .filter(|c| c.page == 1 && c.size != "size:1..40")
        .map(|c| c.size.clone())
        .collect();
    assert_eq!(resumed_strata, vec!["size:21..30", "size:31..40"]);
    assert_eq!(read_log(&dir.path().join("sampling.csv")).unwrap(), expected);
    assert_eq!(resumed.strata, 4);
    assert_eq!(resumed.strata_this_run, 2);
    assert_eq!(resumed.stored.children, 60);
}

#[test]
fn quota_rejection_waits_for_reset_then_continues() {
    let dir = tempfile::tempdir().unwrap();
    let github = FakeGitHub::with_files(10, 40);
    github.reject_next_search_until(EPOCH + 30);
    let clock = Arc::new(TestClock::at(EPOCH));

    let summary = crawler(config(dir.path()), &github, clock.clone(), CancellationToken::new())
        .run()
        .unwrap();

    assert!(clock.slept() >= Duration::from_secs(30));
    assert_eq!(summary.quota_waits, 1);
    assert_eq!(summary.stored.children, 10);
    // The rejected overall query was re-issued unchanged.
    let searches = github.searches();
    assert_eq!(searches[0].size, "size:1..40");
}

#[test]
fn populous_stratum_is_sampled_from_both_ends() {
    let dir = tempfile::tempdir().unwrap();
    // 1200 files all in one stratum: one direction reaches at most 1000.
    let github = FakeGitHub::with_files(1200, 1);
    let mut cfg = config(dir.path());
    cfg.max_size = 10;
    cfg.stratum_width = 10;

    let summary = crawler(cfg, &github, Arc::new(TestClock::at(EPOCH)), CancellationToken::new())
        .run()
        .unwrap();

    let desc_first_pages = github
        .searches()
        .iter()
        .filter(|c| c.order == "desc" && c.page == 1)
        .count();
    assert_eq!(desc_first_pages, 1);
    let entry = read_log(&dir.path().join("sampling.csv")).unwrap()[0];
    assert_eq!(entry.population, 1200);
    assert_eq!(entry.sample, 1200);
    assert_eq!(summary.stored.children, 1200);
}
