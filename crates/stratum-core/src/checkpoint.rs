//! Append-only checkpoint log of completed strata.
//!
//! A CSV file with a header row and one row per completed stratum. Each
//! commit is written, flushed and synced before it returns, so a stratum is
//! either fully recorded or replayed from scratch on resume. Logs written by
//! older versions with only the four stratum columns are still readable, and
//! new rows are appended in whatever column layout the file already has.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::errors::{CrawlError, CrawlResult};
use crate::models::{CheckpointEntry, SampleCounts};

pub const COLUMNS: &[&str] = &[
    "stratum_first",
    "stratum_last",
    "population",
    "sample",
    "containers",
    "children",
    "revisions",
];

const REQUIRED: &[&str] = &["stratum_first", "stratum_last", "population", "sample"];

/// Column positions resolved from a log's header row.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Layout {
    columns: Vec<String>,
}

impl Layout {
    fn current() -> Self {
        Self {
            columns: COLUMNS.iter().map(|c| c.to_string()).collect(),
        }
    }

    fn parse(header: &str) -> CrawlResult<Self> {
        let columns: Vec<String> = header.split(',').map(|c| c.trim().to_string()).collect();
        for required in REQUIRED {
            if !columns.iter().any(|c| c == required) {
                return Err(CrawlError::Checkpoint(format!(
                    "header is missing column '{required}'"
                )));
            }
        }
        for column in &columns {
            if !COLUMNS.contains(&column.as_str()) {
                return Err(CrawlError::Checkpoint(format!(
                    "header has unknown column '{column}'"
                )));
            }
        }
        Ok(Self { columns })
    }

    fn header(&self) -> String {
        self.columns.join(",")
    }

    fn parse_row(&self, line_no: usize, line: &str) -> CrawlResult<CheckpointEntry> {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != self.columns.len() {
            return Err(CrawlError::Checkpoint(format!(
                "line {line_no}: expected {} fields, found {}",
                self.columns.len(),
                fields.len()
            )));
        }
        let mut entry = CheckpointEntry {
            first: 0,
            last: 0,
            population: 0,
            sample: 0,
            counts: SampleCounts::default(),
        };
        for (column, raw) in self.columns.iter().zip(fields) {
            let value: i64 = raw.parse().map_err(|_| {
                CrawlError::Checkpoint(format!(
                    "line {line_no}: column '{column}' is not an integer: '{raw}'"
                ))
            })?;
            let unsigned = || -> CrawlResult<u64> {
                u64::try_from(value).map_err(|_| {
                    CrawlError::Checkpoint(format!(
                        "line {line_no}: column '{column}' must not be negative"
                    ))
                })
            };
            match column.as_str() {
                "stratum_first" => entry.first = unsigned()?,
                "stratum_last" => entry.last = unsigned()?,
                "population" => entry.population = value,
                "sample" => entry.sample = value,
                "containers" => entry.counts.containers = unsigned()?,
                "children" => entry.counts.children = unsigned()?,
                "revisions" => entry.counts.revisions = unsigned()?,
                _ => {}
            }
        }
        if entry.first > entry.last {
            return Err(CrawlError::Checkpoint(format!(
                "line {line_no}: stratum {}..{} is inverted",
                entry.first, entry.last
            )));
        }
        Ok(entry)
    }

    fn format_row(&self, entry: &CheckpointEntry) -> String {
        let values: Vec<String> = self
            .columns
            .iter()
            .map(|column| match column.as_str() {
                "stratum_first" => entry.first.to_string(),
                "stratum_last" => entry.last.to_string(),
                "population" => entry.population.to_string(),
                "sample" => entry.sample.to_string(),
                "containers" => entry.counts.containers.to_string(),
                "children" => entry.counts.children.to_string(),
                "revisions" => entry.counts.revisions.to_string(),
                _ => String::new(),
            })
            .collect();
        values.join(",")
    }
}

fn parse_log(text: &str) -> CrawlResult<(Option<Layout>, Vec<CheckpointEntry>)> {
    if text.trim().is_empty() {
        return Ok((None, Vec::new()));
    }
    if !text.ends_with('\n') {
        return Err(CrawlError::Checkpoint(
            "log is truncated: last row has no line terminator".into(),
        ));
    }
    let mut lines = text.lines().enumerate();
    let layout = match lines.next() {
        Some((_, header)) => Layout::parse(header.trim_end_matches('\r'))?,
        None => return Ok((None, Vec::new())),
    };
    let mut entries = Vec::new();
    for (idx, line) in lines {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        entries.push(layout.parse_row(idx + 1, line)?);
    }
    Ok((Some(layout), entries))
}

/// Read every completed stratum from the log at `path`. A missing file is an
/// empty log; anything unparseable is a checkpoint error.
pub fn read_log(path: &Path) -> CrawlResult<Vec<CheckpointEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = std::fs::read_to_string(path)?;
    let (_, entries) = parse_log(&text)
        .map_err(|e| CrawlError::Checkpoint(format!("{}: {e}", path.display())))?;
    Ok(entries)
}

pub struct CheckpointWriter {
    path: PathBuf,
    layout: Layout,
    out: Option<BufWriter<File>>,
}

impl CheckpointWriter {
    /// Open the log for appending, writing the header if the file is new or
    /// empty.
    pub fn open(path: &Path) -> CrawlResult<Self> {
        let existing = if path.exists() {
            std::fs::read_to_string(path)?
        } else {
            String::new()
        };
        let (layout, _) = parse_log(&existing)
            .map_err(|e| CrawlError::Checkpoint(format!("{}: {e}", path.display())))?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut out = BufWriter::new(file);

        let layout = match layout {
            Some(layout) => layout,
            None => {
                let layout = Layout::current();
                writeln!(out, "{}", layout.header())?;
                Self::sync(&mut out)?;
                info!(path = %path.display(), "created checkpoint log");
                layout
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            layout,
            out: Some(out),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one completed stratum and sync it to disk before returning.
    pub fn commit(&mut self, entry: &CheckpointEntry) -> CrawlResult<()> {
        let out = self.out.as_mut().ok_or_else(|| {
            CrawlError::Checkpoint(format!("{} is already closed", self.path.display()))
        })?;
        writeln!(out, "{}", self.layout.format_row(entry))?;
        Self::sync(out)?;
        debug!(first = entry.first, last = entry.last, "checkpoint committed");
        Ok(())
    }

    /// Flush and release the file. Safe to call more than once.
    pub fn close(&mut self) -> CrawlResult<()> {
        if let Some(mut out) = self.out.take() {
            Self::sync(&mut out)?;
        }
        Ok(())
    }

    fn sync(out: &mut BufWriter<File>) -> CrawlResult<()> {
        out.flush()?;
        out.get_ref().sync_data()?;
        Ok(())
    }
}
