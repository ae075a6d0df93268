//! Per-stratum population estimate and the two-direction query schedule.

use tracing::info;

use crate::config::MAX_RESULTS_PER_QUERY;
use crate::errors::CrawlResult;
use crate::models::{QueryDescriptor, SortOrder, Stratum, UNKNOWN};

/// Running population of one stratum.
///
/// Totals observed for the same filter value are folded as `max`, since the
/// ascending and descending queries see the same (unstable) result set.
/// Finished filter values are summed, since filters partition the stratum.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PopulationEstimate {
    settled: u64,
    current: u64,
    observed: bool,
}

impl PopulationEstimate {
    pub fn observe(&mut self, total: u64) {
        self.current = self.current.max(total);
        self.observed = true;
    }

    /// Estimate for the filter value being queried.
    pub fn current(&self) -> u64 {
        self.current
    }

    /// Close the current filter value and start the next one at zero.
    pub fn settle(&mut self) {
        self.settled += self.current;
        self.current = 0;
    }

    /// Stratum-wide estimate, or `UNKNOWN` before any total was seen.
    pub fn value(&self) -> i64 {
        if self.observed {
            (self.settled + self.current) as i64
        } else {
            UNKNOWN
        }
    }
}

/// Runs one directional query to completion, feeding every observed total
/// into the estimate it exposes.
pub trait DirectionalSampler {
    fn estimate(&mut self) -> &mut PopulationEstimate;

    fn sample(&mut self, query: &QueryDescriptor) -> CrawlResult<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EstimateReport {
    pub population: i64,
    pub queries: u32,
    pub descending: u32,
}

/// Sample `stratum` under each filter value: ascending first, then
/// descending when one direction cannot reach the whole population.
pub fn sample_stratum(
    base: &QueryDescriptor,
    stratum: &Stratum,
    filters: &[Option<&str>],
    sampler: &mut dyn DirectionalSampler,
) -> CrawlResult<EstimateReport> {
    let mut report = EstimateReport {
        population: UNKNOWN,
        queries: 0,
        descending: 0,
    };
    for filter in filters {
        let query = base.for_stratum(stratum).with_license(*filter);

        sampler.sample(&query.with_order(SortOrder::Ascending))?;
        report.queries += 1;

        let ascending = sampler.estimate().current();
        if ascending as i64 > MAX_RESULTS_PER_QUERY {
            info!(
                stratum = %stratum.size_term(),
                license = filter.unwrap_or("-"),
                population = ascending,
                "repeating search with reverse sort order"
            );
            sampler.sample(&query.with_order(SortOrder::Descending))?;
            report.queries += 1;
            report.descending += 1;
        }
        sampler.estimate().settle();
    }
    report.population = sampler.estimate().value();
    Ok(report)
}
