//! Shared typed models used across planning, crawling, and storage layers.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Marker for a population or sample count that has not been observed yet.
pub const UNKNOWN: i64 = -1;

/// Derive a short run identifier (first 16 hex chars of SHA-256) from the
/// query text and the run's start time.
pub fn run_id(query: &str, started_at_secs: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.as_bytes());
    hasher.update(started_at_secs.to_le_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

// ---------------------------------------------------------------------------
// Strata and queries
// ---------------------------------------------------------------------------

/// A contiguous, inclusive byte-size range queried independently.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stratum {
    pub first: u64,
    pub last: u64,
    pub population: i64,
    pub sample: i64,
}

impl Stratum {
    pub fn new(first: u64, last: u64) -> Self {
        Self {
            first,
            last,
            population: UNKNOWN,
            sample: UNKNOWN,
        }
    }

    /// Bounds only, for comparing planner output.
    pub fn bounds(&self) -> (u64, u64) {
        (self.first, self.last)
    }

    /// The provider's size qualifier for this range.
    pub fn size_term(&self) -> String {
        format!("size:{}..{}", self.first, self.last)
    }

    /// Sample as a percentage of the population, when both are known.
    pub fn coverage(&self) -> Option<f64> {
        if self.population > 0 && self.sample >= 0 {
            Some(self.sample as f64 / self.population as f64 * 100.0)
        } else {
            None
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Ascending,
    Descending,
}

impl SortOrder {
    pub fn as_param(self) -> &'static str {
        match self {
            SortOrder::Ascending => "asc",
            SortOrder::Descending => "desc",
        }
    }
}

/// Which search endpoint is stratified.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    /// Files found by code search; the repository is the container.
    #[default]
    Code,
    /// Repositories found by repository search; files inside are children.
    Repositories,
}

/// One search request against the source, before it is turned into a URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryDescriptor {
    pub text: String,
    pub first: u64,
    pub last: u64,
    pub order: SortOrder,
    pub include_forks: bool,
    pub license: Option<String>,
}

impl QueryDescriptor {
    pub fn new(text: impl Into<String>, first: u64, last: u64) -> Self {
        Self {
            text: text.into(),
            first,
            last,
            order: SortOrder::Ascending,
            include_forks: false,
            license: None,
        }
    }

    pub fn for_stratum(&self, stratum: &Stratum) -> Self {
        Self {
            first: stratum.first,
            last: stratum.last,
            ..self.clone()
        }
    }

    pub fn with_order(&self, order: SortOrder) -> Self {
        Self {
            order,
            ..self.clone()
        }
    }

    pub fn with_license(&self, license: Option<&str>) -> Self {
        Self {
            license: license.map(str::to_string),
            ..self.clone()
        }
    }

    /// Full `q` parameter: query text plus the embedded size range and any
    /// qualifiers.
    pub fn q(&self) -> String {
        let mut q = format!("{} size:{}..{}", self.text.trim(), self.first, self.last);
        if self.include_forks {
            q.push_str(" fork:true");
        }
        if let Some(license) = &self.license {
            q.push_str(" license:");
            q.push_str(license);
        }
        q.trim_start().to_string()
    }
}

// ---------------------------------------------------------------------------
// Resource records
// ---------------------------------------------------------------------------

/// Top-level searchable entity (a repository).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerRecord {
    pub id: i64,
    pub name: String,
    pub full_name: String,
    pub description: Option<String>,
    pub url: String,
    pub fork: bool,
    pub owner_id: i64,
    pub owner_login: String,
}

/// A file within a container. Its local id comes back from the sink on insert.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChildRecord {
    pub name: String,
    pub path: String,
    pub sha: String,
    pub container_id: i64,
}

/// A content snapshot of one child at one revision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RevisionRecord {
    pub sha: String,
    pub message: String,
    pub created: Option<String>,
    pub parents: Vec<String>,
    pub content: Vec<u8>,
    pub child_id: i64,
}

impl RevisionRecord {
    pub fn size(&self) -> i64 {
        self.content.len() as i64
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Container,
    Child,
    Revision,
}

impl RecordKind {
    pub fn table(self) -> &'static str {
        match self {
            RecordKind::Container => "containers",
            RecordKind::Child => "children",
            RecordKind::Revision => "revisions",
        }
    }
}

/// The field combination that identifies a resource for deduplication.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum NaturalKey {
    Container { id: i64 },
    Child { container_id: i64, path: String },
    Revision { child_id: i64, sha: String },
}

impl NaturalKey {
    pub fn kind(&self) -> RecordKind {
        match self {
            NaturalKey::Container { .. } => RecordKind::Container,
            NaturalKey::Child { .. } => RecordKind::Child,
            NaturalKey::Revision { .. } => RecordKind::Revision,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResourceRecord {
    Container(ContainerRecord),
    Child(ChildRecord),
    Revision(RevisionRecord),
}

impl ResourceRecord {
    pub fn natural_key(&self) -> NaturalKey {
        match self {
            ResourceRecord::Container(c) => NaturalKey::Container { id: c.id },
            ResourceRecord::Child(c) => NaturalKey::Child {
                container_id: c.container_id,
                path: c.path.clone(),
            },
            ResourceRecord::Revision(r) => NaturalKey::Revision {
                child_id: r.child_id,
                sha: r.sha.clone(),
            },
        }
    }

    pub fn kind(&self) -> RecordKind {
        self.natural_key().kind()
    }
}

// ---------------------------------------------------------------------------
// Counters and checkpoint rows
// ---------------------------------------------------------------------------

/// Newly admitted records, per kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SampleCounts {
    pub containers: u64,
    pub children: u64,
    pub revisions: u64,
}

impl SampleCounts {
    pub fn add(&mut self, other: &SampleCounts) {
        self.containers += other.containers;
        self.children += other.children;
        self.revisions += other.revisions;
    }

    pub fn bump(&mut self, kind: RecordKind) {
        match kind {
            RecordKind::Container => self.containers += 1,
            RecordKind::Child => self.children += 1,
            RecordKind::Revision => self.revisions += 1,
        }
    }

    /// Counts accumulated after `earlier` was taken.
    pub fn since(&self, earlier: &SampleCounts) -> SampleCounts {
        SampleCounts {
            containers: self.containers.saturating_sub(earlier.containers),
            children: self.children.saturating_sub(earlier.children),
            revisions: self.revisions.saturating_sub(earlier.revisions),
        }
    }

    /// The count of the unit a target samples: files for code search,
    /// repositories for repository search.
    pub fn top_level(&self, target: Target) -> u64 {
        match target {
            Target::Code => self.children,
            Target::Repositories => self.containers,
        }
    }
}

/// One row of the checkpoint log: a completed stratum.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CheckpointEntry {
    pub first: u64,
    pub last: u64,
    pub population: i64,
    pub sample: i64,
    pub counts: SampleCounts,
}

impl CheckpointEntry {
    pub fn from_stratum(stratum: &Stratum, counts: SampleCounts) -> Self {
        Self {
            first: stratum.first,
            last: stratum.last,
            population: stratum.population,
            sample: stratum.sample,
            counts,
        }
    }
}
