//! The stratified crawl loop.
//!
//! [`Crawler`] owns everything a run touches: the executor (and with it the
//! rate state), the dedup gateway over the result sink, the checkpoint log,
//! and the planner. A stratum is committed to the log only after every item
//! in it was either stored or skipped; cancellation unwinds the current
//! stratum uncommitted so a resume redoes it.

use std::time::{Duration, Instant, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::checkpoint::{self, CheckpointWriter};
use crate::config::{CrawlConfig, RevisionMode};
use crate::crawl::estimator::{self, DirectionalSampler, PopulationEstimate};
use crate::crawl::gateway::DedupGateway;
use crate::crawl::paginate::{self, PageHandler};
use crate::crawl::planner::{RunTotals, StratumPlanner};
use crate::errors::{CrawlError, CrawlResult};
use crate::models::{
    run_id, CheckpointEntry, ContainerRecord, NaturalKey, QueryDescriptor, RecordKind,
    ResourceRecord, RevisionRecord, SampleCounts, Stratum, Target,
};
use crate::source::github::{decode_list, decode_search, CodeHit, CommitPayload, RepositoryPayload};
use crate::source::{Executor, GitHub, HttpTransport, Page};
use crate::store::{Database, Diagnostic, ResultSink};

// ---------------------------------------------------------------------------
// Outcomes and state
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// Natural key already stored; no nested fetch was made.
    Duplicate,
    /// A nested fetch failed with a non-fatal error.
    FetchFailed,
    /// The payload could not be decoded.
    Undecodable,
    /// The contents endpoint returned a directory, symlink or submodule.
    NotAFile,
}

/// What happened to one search hit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ItemOutcome {
    Sampled,
    Skipped(SkipReason),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SkipCounts {
    pub duplicate: u64,
    pub fetch_failed: u64,
    pub undecodable: u64,
    pub not_a_file: u64,
}

impl SkipCounts {
    pub fn record(&mut self, reason: SkipReason) {
        match reason {
            SkipReason::Duplicate => self.duplicate += 1,
            SkipReason::FetchFailed => self.fetch_failed += 1,
            SkipReason::Undecodable => self.undecodable += 1,
            SkipReason::NotAFile => self.not_a_file += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.duplicate + self.fetch_failed + self.undecodable + self.not_a_file
    }
}

/// Mutable progress of one run.
#[derive(Clone, Debug)]
struct CrawlState {
    /// Stratum being sampled, with its running population and sample.
    stratum: Stratum,
    estimate: PopulationEstimate,
    /// Search hits handed to the item handler in this stratum, skipped or not.
    visited: u64,
    /// Gateway counters when the stratum began.
    baseline: SampleCounts,
    /// Completed strata, including those replayed from the checkpoint log.
    totals: RunTotals,
    overall_population: Option<u64>,
    strata_this_run: u64,
}

impl CrawlState {
    fn new(totals: RunTotals) -> Self {
        Self {
            stratum: Stratum::new(0, 0),
            estimate: PopulationEstimate::default(),
            visited: 0,
            baseline: SampleCounts::default(),
            totals,
            overall_population: None,
            strata_this_run: 0,
        }
    }

    fn begin(&mut self, stratum: Stratum, baseline: SampleCounts) {
        self.stratum = stratum;
        self.estimate = PopulationEstimate::default();
        self.visited = 0;
        self.baseline = baseline;
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunSummary {
    pub run_id: String,
    pub overall_population: Option<u64>,
    pub strata: u64,
    pub strata_this_run: u64,
    /// Cumulative sample, replayed strata included.
    pub sample: u64,
    pub counts: SampleCounts,
    /// Rows in the sink at shutdown.
    pub stored: SampleCounts,
    pub skips: SkipCounts,
    pub api_calls: u64,
    pub rate_used: Option<u64>,
    pub quota_waits: u64,
    pub elapsed: Duration,
    pub interrupted: bool,
}

/// Observer for terminal rendering. Every hook defaults to a no-op.
pub trait Progress {
    fn run_started(&mut self, _replayed: &[CheckpointEntry]) {}
    fn overall_estimate(&mut self, _population: u64) {}
    fn stratum_started(&mut self, _stratum: &Stratum) {}
    fn stratum_progress(&mut self, _stratum: &Stratum) {}
    fn stratum_finished(&mut self, _entry: &CheckpointEntry, _totals: &RunTotals) {}
    fn run_finished(&mut self, _summary: &RunSummary) {}
}

pub struct NoProgress;

impl Progress for NoProgress {}

// ---------------------------------------------------------------------------
// Crawler
// ---------------------------------------------------------------------------

pub struct Crawler {
    config: CrawlConfig,
    exec: Executor,
    ctx: Context,
    planner: StratumPlanner,
    checkpoint: CheckpointWriter,
    replayed: Vec<CheckpointEntry>,
    progress: Box<dyn Progress>,
    state: CrawlState,
    shut_down: bool,
}

impl Crawler {
    /// Validate `config`, replay the checkpoint log and open the result
    /// database. No network activity happens here.
    pub fn open(config: CrawlConfig, cancel: CancellationToken) -> CrawlResult<Self> {
        config.validate()?;
        // Replay before touching the database so a bad log fails fast.
        let entries = checkpoint::read_log(&config.statistics)?;
        StratumPlanner::resume(
            config.min_size,
            config.max_size,
            config.stratum_width,
            &entries,
        )?;

        let transport = HttpTransport::new(config.credential().map(str::to_string));
        let exec = Executor::new(Box::new(transport), config.throttle_interval());
        let sink = Database::open(&config.database)?;
        Self::with_parts(config, exec, Box::new(sink), cancel)
    }

    /// Assemble a crawler around an existing executor and sink.
    pub fn with_parts(
        config: CrawlConfig,
        exec: Executor,
        sink: Box<dyn ResultSink>,
        cancel: CancellationToken,
    ) -> CrawlResult<Self> {
        config.validate()?;
        let replayed = checkpoint::read_log(&config.statistics)?;
        let planner = StratumPlanner::resume(
            config.min_size,
            config.max_size,
            config.stratum_width,
            &replayed,
        )?;
        if !replayed.is_empty() {
            info!(
                strata = replayed.len(),
                next = ?planner.peek().map(|s| s.bounds()),
                "continuing previous search"
            );
        }
        let checkpoint = CheckpointWriter::open(&config.statistics)?;

        let exec = exec.with_cancellation(cancel.clone());
        let started = exec
            .clock()
            .now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let ctx = Context {
            github: GitHub::from_config(&config),
            gateway: DedupGateway::new(sink),
            cancel,
            run_id: run_id(&config.query, started),
            revisions: config.revisions,
            child_query: config.child_query.clone(),
            skips: SkipCounts::default(),
        };
        let state = CrawlState::new(planner.replayed());

        Ok(Self {
            config,
            exec,
            ctx,
            planner,
            checkpoint,
            replayed,
            progress: Box::new(NoProgress),
            state,
            shut_down: false,
        })
    }

    pub fn with_progress(mut self, progress: Box<dyn Progress>) -> Self {
        self.progress = progress;
        self
    }

    /// Sample every remaining stratum, then shut down.
    ///
    /// Cancellation is not an error: the summary comes back with
    /// `interrupted` set and the unfinished stratum left out of the log.
    pub fn run(&mut self) -> CrawlResult<RunSummary> {
        let started = Instant::now();
        let result = self.run_strata();
        let stored = self.stored_counts();

        let interrupted = matches!(result, Err(CrawlError::Cancelled));
        if interrupted {
            warn!(
                stratum = %self.state.stratum.size_term(),
                "interrupted; the current stratum will be redone on resume"
            );
        }
        let closed = self.shutdown();
        match result {
            Ok(()) | Err(CrawlError::Cancelled) => closed?,
            Err(e) => {
                if let Err(close_err) = closed {
                    warn!(error = %close_err, "shutdown after failure also failed");
                }
                return Err(e);
            }
        }

        let summary = self.summary(started.elapsed(), interrupted, stored?);
        self.progress.run_finished(&summary);
        info!(
            strata = summary.strata,
            sample = summary.sample,
            api_calls = summary.api_calls,
            interrupted,
            "crawl finished"
        );
        Ok(summary)
    }

    fn run_strata(&mut self) -> CrawlResult<()> {
        self.ctx.cancel.check()?;
        self.progress.run_started(&self.replayed);
        if self.planner.is_done() {
            info!("every stratum is already in the checkpoint log");
            return Ok(());
        }

        info!(
            planned = self.planner.total_strata(),
            replayed = self.replayed.len(),
            run_id = %self.ctx.run_id,
            "starting stratified search"
        );
        self.estimate_overall()?;

        while let Some(stratum) = self.planner.next() {
            self.ctx.cancel.check()?;
            let entry = self.sample_stratum(stratum)?;

            self.ctx.gateway.flush()?;
            self.checkpoint.commit(&entry)?;
            self.state.totals.record(&entry);
            self.state.strata_this_run += 1;
            self.progress.stratum_finished(&entry, &self.state.totals);
            info!(
                first = entry.first,
                last = entry.last,
                population = entry.population,
                sample = entry.sample,
                "stratum complete"
            );
        }
        Ok(())
    }

    /// One query over the whole range. The provider's count here is very
    /// unstable and is only reported.
    fn estimate_overall(&mut self) -> CrawlResult<()> {
        let query = self.config.base_query();
        let total = self
            .ctx
            .github
            .fetch_total(&mut self.exec, self.config.target, &query)?;
        info!(population = total, "overall population estimate");
        self.state.overall_population = Some(total);
        self.progress.overall_estimate(total);
        Ok(())
    }

    fn sample_stratum(&mut self, stratum: Stratum) -> CrawlResult<CheckpointEntry> {
        info!(first = stratum.first, last = stratum.last, "searching stratum");
        self.state.begin(stratum, self.ctx.gateway.admitted());
        self.progress.stratum_started(&stratum);

        let base = self.config.base_query();
        let filters = self.config.filter_values();
        let target = self.config.target;
        let mut sampler = StratumSampler {
            exec: &mut self.exec,
            ctx: &mut self.ctx,
            state: &mut self.state,
            progress: &mut *self.progress,
            target,
        };
        let report = estimator::sample_stratum(&base, &stratum, &filters, &mut sampler)?;

        let counts = self.ctx.gateway.admitted().since(&self.state.baseline);
        self.state.stratum.population = report.population;
        self.state.stratum.sample = counts.top_level(target) as i64;
        debug!(
            queries = report.queries,
            descending = report.descending,
            visited = self.state.visited,
            "stratum queries done"
        );
        Ok(CheckpointEntry::from_stratum(&self.state.stratum, counts))
    }

    fn stored_counts(&self) -> CrawlResult<SampleCounts> {
        Ok(SampleCounts {
            containers: self.ctx.gateway.stored(RecordKind::Container)?,
            children: self.ctx.gateway.stored(RecordKind::Child)?,
            revisions: self.ctx.gateway.stored(RecordKind::Revision)?,
        })
    }

    fn summary(&self, elapsed: Duration, interrupted: bool, stored: SampleCounts) -> RunSummary {
        let rate = self.exec.state();
        RunSummary {
            run_id: self.ctx.run_id.clone(),
            overall_population: self.state.overall_population,
            strata: self.state.totals.strata,
            strata_this_run: self.state.strata_this_run,
            sample: self.state.totals.sample,
            counts: self.state.totals.counts,
            stored,
            skips: self.ctx.skips,
            api_calls: rate.calls,
            rate_used: rate.rate_used,
            quota_waits: rate.quota_waits,
            elapsed,
            interrupted,
        }
    }

    /// Flush and close the sink and the checkpoint log. Runs once; later
    /// calls are no-ops.
    pub fn shutdown(&mut self) -> CrawlResult<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        let sink = self.ctx.gateway.close();
        let log = self.checkpoint.close();
        info!(path = %self.checkpoint.path().display(), "closed result sink and checkpoint log");
        sink.and(log)
    }
}

impl Drop for Crawler {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "shutdown on drop failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Item handling
// ---------------------------------------------------------------------------

/// Revision source resolved for a child before anything is stored.
enum Acquired {
    Blob { sha: String, content: Vec<u8> },
    History(Page<CommitPayload>),
}

/// Everything item handlers need besides the executor.
struct Context {
    github: GitHub,
    gateway: DedupGateway,
    cancel: CancellationToken,
    run_id: String,
    revisions: RevisionMode,
    child_query: String,
    skips: SkipCounts,
}

impl Context {
    /// Log a non-fatal failure, keep a diagnostic row, and turn it into
    /// `None`. Fatal errors pass through.
    fn recover<T>(&mut self, stage: &str, url: &str, result: CrawlResult<T>) -> CrawlResult<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_item_recoverable() => {
                warn!(stage, url, error = %e, "skipping item");
                self.gateway.record_diagnostic(&Diagnostic {
                    run_id: self.run_id.clone(),
                    stage: stage.to_string(),
                    category: e.category().to_string(),
                    url: Some(url.to_string()),
                    status: e.status(),
                    message: e.to_string(),
                })?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn skip(&mut self, reason: SkipReason) -> ItemOutcome {
        self.skips.record(reason);
        ItemOutcome::Skipped(reason)
    }

    /// Code target: the hit's file is the sampled unit.
    fn sample_code_hit(&mut self, exec: &mut Executor, hit: &CodeHit) -> CrawlResult<ItemOutcome> {
        let key = NaturalKey::Child {
            container_id: hit.repository.id,
            path: hit.path.clone(),
        };
        if self.gateway.is_known(&key)?.is_some() {
            debug!(repo = %hit.repository.full_name, path = %hit.path, "already sampled");
            return Ok(self.skip(SkipReason::Duplicate));
        }
        let acquired = match self.acquire(exec, hit)? {
            Ok(acquired) => acquired,
            Err(reason) => return Ok(self.skip(reason)),
        };
        self.gateway
            .admit(&ResourceRecord::Container(ContainerRecord::from(&hit.repository)))?;
        self.store_child(exec, hit, acquired)?;
        Ok(ItemOutcome::Sampled)
    }

    /// Repositories target: the repository is the sampled unit, and its
    /// files come from a nested code search.
    fn sample_repository(
        &mut self,
        exec: &mut Executor,
        repo: &RepositoryPayload,
    ) -> CrawlResult<ItemOutcome> {
        if self
            .gateway
            .is_known(&NaturalKey::Container { id: repo.id })?
            .is_some()
        {
            debug!(repo = %repo.full_name, "already sampled");
            return Ok(self.skip(SkipReason::Duplicate));
        }
        let url = self
            .github
            .repository_files_request(&self.child_query, &repo.full_name)
            .display_url();
        let fetched = self
            .github
            .fetch_repository_files(exec, &self.child_query, &repo.full_name);
        let Some(first) = self.recover("repository files", &url, fetched)? else {
            return Ok(self.skip(SkipReason::FetchFailed));
        };

        self.gateway
            .admit(&ResourceRecord::Container(ContainerRecord::from(repo)))?;
        let mut handler = ChildHandler { ctx: self };
        let crawled = paginate::crawl(exec, first, decode_search::<CodeHit>, &mut handler);
        self.recover("repository files", &url, crawled)?;
        Ok(ItemOutcome::Sampled)
    }

    /// Fetch what is needed to store a child's revisions. Nothing is written.
    fn acquire(
        &mut self,
        exec: &mut Executor,
        hit: &CodeHit,
    ) -> CrawlResult<Result<Acquired, SkipReason>> {
        match self.revisions {
            RevisionMode::Snapshot => {
                let fetched = self.github.fetch_contents(exec, hit);
                let Some(payload) = self.recover("contents", &hit.url, fetched)? else {
                    return Ok(Err(SkipReason::FetchFailed));
                };
                if !payload.is_file() {
                    debug!(path = %hit.path, kind = %payload.kind, "not a file");
                    return Ok(Err(SkipReason::NotAFile));
                }
                let decoded = payload.decode();
                let Some(content) = self.recover("decode", &hit.url, decoded)? else {
                    return Ok(Err(SkipReason::Undecodable));
                };
                Ok(Ok(Acquired::Blob {
                    sha: payload.sha,
                    content,
                }))
            }
            RevisionMode::History => {
                let url = self
                    .github
                    .commits_request(&hit.repository.full_name, &hit.path)
                    .display_url();
                let fetched = self
                    .github
                    .fetch_commits(exec, &hit.repository.full_name, &hit.path);
                Ok(match self.recover("commits", &url, fetched)? {
                    Some(page) => Ok(Acquired::History(page)),
                    None => Err(SkipReason::FetchFailed),
                })
            }
        }
    }

    /// Insert the child, then its revisions. The container must already be
    /// stored.
    fn store_child(
        &mut self,
        exec: &mut Executor,
        hit: &CodeHit,
        acquired: Acquired,
    ) -> CrawlResult<()> {
        let child = self.gateway.admit(&ResourceRecord::Child(hit.child_record()))?;
        match acquired {
            Acquired::Blob { sha, content } => {
                self.gateway.admit(&ResourceRecord::Revision(RevisionRecord {
                    sha,
                    message: String::new(),
                    created: None,
                    parents: Vec::new(),
                    content,
                    child_id: child.id(),
                }))?;
            }
            Acquired::History(first) => {
                let url = self
                    .github
                    .commits_request(&hit.repository.full_name, &hit.path)
                    .display_url();
                let mut handler = RevisionHandler {
                    ctx: self,
                    full_name: &hit.repository.full_name,
                    path: &hit.path,
                    child_id: child.id(),
                };
                let crawled = paginate::crawl(exec, first, decode_list::<CommitPayload>, &mut handler);
                self.recover("commits", &url, crawled)?;
            }
        }
        Ok(())
    }
}

/// Drives one directional search and hands hits to the item handlers.
struct StratumSampler<'a> {
    exec: &'a mut Executor,
    ctx: &'a mut Context,
    state: &'a mut CrawlState,
    progress: &'a mut dyn Progress,
    target: Target,
}

impl DirectionalSampler for StratumSampler<'_> {
    fn estimate(&mut self) -> &mut PopulationEstimate {
        &mut self.state.estimate
    }

    fn sample(&mut self, query: &QueryDescriptor) -> CrawlResult<()> {
        self.ctx.cancel.check()?;
        debug!(q = %query.q(), order = query.order.as_param(), "search");
        let mut handler = SearchHandler {
            ctx: &mut *self.ctx,
            state: &mut *self.state,
            progress: &mut *self.progress,
            target: self.target,
        };
        match self.target {
            Target::Code => {
                let first = handler.ctx.github.fetch_code_search(self.exec, query)?;
                paginate::crawl(self.exec, first, decode_search::<CodeHit>, &mut handler)?;
            }
            Target::Repositories => {
                let first = handler.ctx.github.fetch_repository_search(self.exec, query)?;
                paginate::crawl(
                    self.exec,
                    first,
                    decode_search::<RepositoryPayload>,
                    &mut handler,
                )?;
            }
        }
        Ok(())
    }
}

/// Top-level search hits of the current stratum.
struct SearchHandler<'a> {
    ctx: &'a mut Context,
    state: &'a mut CrawlState,
    progress: &'a mut dyn Progress,
    target: Target,
}

impl SearchHandler<'_> {
    fn finish(&mut self, outcome: ItemOutcome) {
        self.state.visited += 1;
        let counts = self.ctx.gateway.admitted().since(&self.state.baseline);
        self.state.stratum.sample = counts.top_level(self.target) as i64;
        self.state.stratum.population = self.state.estimate.value();
        debug!(?outcome, visited = self.state.visited, "item done");
        self.progress.stratum_progress(&self.state.stratum);
    }

    fn observe(&mut self, total: u64) {
        self.state.estimate.observe(total);
        self.state.stratum.population = self.state.estimate.value();
        self.progress.stratum_progress(&self.state.stratum);
    }

    /// Stop once as many hits were visited as the population holds.
    fn below_population(&self) -> bool {
        (self.state.visited as i64) < self.state.estimate.value()
    }
}

impl PageHandler<CodeHit> for SearchHandler<'_> {
    fn handle(&mut self, exec: &mut Executor, hit: CodeHit) -> CrawlResult<()> {
        self.ctx.cancel.check()?;
        let outcome = self.ctx.sample_code_hit(exec, &hit)?;
        self.finish(outcome);
        Ok(())
    }

    fn observe_total(&mut self, total: u64) {
        self.observe(total);
    }

    fn should_continue(&self) -> bool {
        self.below_population()
    }
}

impl PageHandler<RepositoryPayload> for SearchHandler<'_> {
    fn handle(&mut self, exec: &mut Executor, repo: RepositoryPayload) -> CrawlResult<()> {
        self.ctx.cancel.check()?;
        let outcome = self.ctx.sample_repository(exec, &repo)?;
        self.finish(outcome);
        Ok(())
    }

    fn observe_total(&mut self, total: u64) {
        self.observe(total);
    }

    fn should_continue(&self) -> bool {
        self.below_population()
    }
}

/// Files of one repository, from the nested code search.
struct ChildHandler<'a> {
    ctx: &'a mut Context,
}

impl PageHandler<CodeHit> for ChildHandler<'_> {
    fn handle(&mut self, exec: &mut Executor, hit: CodeHit) -> CrawlResult<()> {
        self.ctx.cancel.check()?;
        let key = NaturalKey::Child {
            container_id: hit.repository.id,
            path: hit.path.clone(),
        };
        if self.ctx.gateway.is_known(&key)?.is_some() {
            self.ctx.skip(SkipReason::Duplicate);
            return Ok(());
        }
        match self.ctx.acquire(exec, &hit)? {
            Ok(acquired) => self.ctx.store_child(exec, &hit, acquired),
            Err(reason) => {
                self.ctx.skip(reason);
                Ok(())
            }
        }
    }
}

/// Commit history of one file. Each commit not yet stored costs one raw
/// content download.
struct RevisionHandler<'a> {
    ctx: &'a mut Context,
    full_name: &'a str,
    path: &'a str,
    child_id: i64,
}

impl PageHandler<CommitPayload> for RevisionHandler<'_> {
    fn handle(&mut self, exec: &mut Executor, commit: CommitPayload) -> CrawlResult<()> {
        self.ctx.cancel.check()?;
        let key = NaturalKey::Revision {
            child_id: self.child_id,
            sha: commit.sha.clone(),
        };
        if self.ctx.gateway.is_known(&key)?.is_some() {
            self.ctx.skip(SkipReason::Duplicate);
            return Ok(());
        }
        let url = self
            .ctx
            .github
            .raw_request(self.full_name, &commit.sha, self.path)
            .url;
        let fetched = self
            .ctx
            .github
            .fetch_raw(exec, self.full_name, &commit.sha, self.path);
        let Some(content) = self.ctx.recover("raw content", &url, fetched)? else {
            self.ctx.skip(SkipReason::FetchFailed);
            return Ok(());
        };
        self.ctx.gateway.admit(&ResourceRecord::Revision(RevisionRecord {
            created: commit.date(),
            parents: commit.parent_shas(),
            message: commit.commit.message,
            sha: commit.sha,
            content,
            child_id: self.child_id,
        }))?;
        Ok(())
    }
}
