//! Stratum sequence over `[min_size, max_size]`.

use crate::errors::{CrawlError, CrawlResult};
use crate::models::{CheckpointEntry, SampleCounts, Stratum};

/// Totals carried across strata, including those replayed from a log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunTotals {
    pub strata: u64,
    pub sample: u64,
    pub counts: SampleCounts,
}

impl RunTotals {
    pub fn record(&mut self, entry: &CheckpointEntry) {
        self.strata += 1;
        self.sample += entry.sample.max(0) as u64;
        self.counts.add(&entry.counts);
    }
}

/// Hands out contiguous, non-overlapping strata in increasing order.
#[derive(Clone, Debug)]
pub struct StratumPlanner {
    min_size: u64,
    max_size: u64,
    width: u64,
    cursor: u64,
    replayed: RunTotals,
}

impl StratumPlanner {
    /// Cold start at `min_size`. A zero width is treated as one.
    pub fn new(min_size: u64, max_size: u64, width: u64) -> Self {
        Self {
            min_size,
            max_size,
            width: width.max(1),
            cursor: min_size,
            replayed: RunTotals::default(),
        }
    }

    /// Rebuild the cursor from completed strata. Every row must be exactly
    /// the stratum a cold start would have produced at that position;
    /// anything else means the log belongs to a different configuration.
    pub fn resume(
        min_size: u64,
        max_size: u64,
        width: u64,
        entries: &[CheckpointEntry],
    ) -> CrawlResult<Self> {
        let mut planner = Self::new(min_size, max_size, width);
        for (idx, entry) in entries.iter().enumerate() {
            let expected = planner.peek().ok_or_else(|| {
                CrawlError::Checkpoint(format!(
                    "row {}: stratum {}..{} lies beyond max-size {}",
                    idx + 1,
                    entry.first,
                    entry.last,
                    max_size
                ))
            })?;
            if expected.bounds() != (entry.first, entry.last) {
                return Err(CrawlError::Checkpoint(format!(
                    "row {}: found stratum {}..{}, expected {}..{} for min-size {} and stratum-size {}",
                    idx + 1,
                    entry.first,
                    entry.last,
                    expected.first,
                    expected.last,
                    min_size,
                    planner.width
                )));
            }
            planner.cursor = entry.last + 1;
            planner.replayed.record(entry);
        }
        Ok(planner)
    }

    /// The stratum `next` would return, without advancing.
    pub fn peek(&self) -> Option<Stratum> {
        if self.cursor > self.max_size {
            return None;
        }
        let last = self
            .cursor
            .saturating_add(self.width - 1)
            .min(self.max_size);
        Some(Stratum::new(self.cursor, last))
    }

    pub fn replayed(&self) -> RunTotals {
        self.replayed
    }

    pub fn is_done(&self) -> bool {
        self.cursor > self.max_size
    }

    /// Number of strata a cold start produces.
    pub fn total_strata(&self) -> u64 {
        if self.min_size > self.max_size {
            return 0;
        }
        (self.max_size - self.min_size) / self.width + 1
    }
}

impl Iterator for StratumPlanner {
    type Item = Stratum;

    fn next(&mut self) -> Option<Stratum> {
        let stratum = self.peek()?;
        self.cursor = stratum.last.saturating_add(1);
        Some(stratum)
    }
}
