//! Sampling table on stdout.
//!
//! One row per stratum with its population and sample, then a footer with
//! the overall estimate and the cumulative sample. On a terminal the row of
//! the stratum in progress is redrawn in place.

use std::io::{IsTerminal, Write};

use stratum_core::crawl::{Progress, RunSummary, RunTotals};
use stratum_core::models::{CheckpointEntry, Stratum, UNKNOWN};

const RULE_TOP: &str = "                 ┌────────────┬────────────┐";
const RULE_MID: &str = "                 ├────────────┼────────────┤";
const RULE_END: &str = "                 └────────────┴────────────┘";
const HEADINGS: &str = "                 │ population │   sample   │";

fn size_label(first: u64, last: u64) -> String {
    if first == last {
        first.to_string()
    } else {
        format!("{first} .. {last}")
    }
}

fn count_label(value: i64) -> String {
    if value > -1 {
        value.to_string()
    } else {
        String::new()
    }
}

fn coverage_label(stratum: &Stratum) -> String {
    stratum
        .coverage()
        .map(|pct| format!("{pct:6.2}%"))
        .unwrap_or_default()
}

fn logged(entry: &CheckpointEntry) -> Stratum {
    Stratum {
        first: entry.first,
        last: entry.last,
        population: entry.population,
        sample: entry.sample,
    }
}

pub fn format_row(stratum: &Stratum) -> String {
    format!(
        "{:>16} │ {:>10} │ {:>10} │ {:>6}",
        size_label(stratum.first, stratum.last),
        count_label(stratum.population),
        count_label(stratum.sample),
        coverage_label(stratum)
    )
}

pub struct TableReporter {
    min_size: u64,
    max_size: u64,
    live: bool,
    overall: Option<u64>,
    drawing: bool,
}

impl TableReporter {
    pub fn new(min_size: u64, max_size: u64) -> Self {
        Self {
            min_size,
            max_size,
            live: std::io::stdout().is_terminal(),
            overall: None,
            drawing: false,
        }
    }

    fn emit(&mut self, line: &str) {
        let mut out = std::io::stdout().lock();
        if self.drawing {
            let _ = write!(out, "\r\x1b[K");
            self.drawing = false;
        }
        let _ = writeln!(out, "{line}");
    }

    fn redraw(&mut self, line: &str) {
        if !self.live {
            return;
        }
        let mut out = std::io::stdout().lock();
        let _ = write!(out, "\r\x1b[K{line}");
        let _ = out.flush();
        self.drawing = true;
    }
}

impl Progress for TableReporter {
    fn run_started(&mut self, replayed: &[CheckpointEntry]) {
        self.emit(RULE_TOP);
        self.emit(HEADINGS);
        self.emit(RULE_MID);
        for entry in replayed {
            self.emit(&format_row(&logged(entry)));
        }
    }

    fn overall_estimate(&mut self, population: u64) {
        self.overall = Some(population);
    }

    fn stratum_started(&mut self, stratum: &Stratum) {
        self.redraw(&format_row(&Stratum::new(stratum.first, stratum.last)));
    }

    fn stratum_progress(&mut self, stratum: &Stratum) {
        self.redraw(&format_row(stratum));
    }

    fn stratum_finished(&mut self, entry: &CheckpointEntry, _totals: &RunTotals) {
        self.emit(&format_row(&logged(entry)));
    }

    fn run_finished(&mut self, summary: &RunSummary) {
        let total = Stratum {
            first: self.min_size,
            last: self.max_size,
            population: self.overall.map_or(UNKNOWN, |p| p as i64),
            sample: summary.sample as i64,
        };
        self.emit(RULE_MID);
        self.emit(HEADINGS);
        self.emit(RULE_END);
        let footer = format!(
            "{:>16}   {:>10}   {:>10}   {:>6}",
            size_label(total.first, total.last),
            count_label(total.population),
            count_label(total.sample),
            coverage_label(&total)
        );
        self.emit(&footer);
        if total.population > UNKNOWN {
            self.emit("                   (estimated)");
        }
        self.emit("");
        let status = if summary.interrupted {
            "Interrupted. Run again with the same options to continue."
        } else {
            "Done."
        };
        self.emit(status);
    }
}
