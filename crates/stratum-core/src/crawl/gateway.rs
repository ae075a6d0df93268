//! Existence check and idempotent insertion in front of the result sink.
//!
//! Callers ask [`DedupGateway::is_known`] before issuing the nested fetch
//! that would produce a record, and only call [`DedupGateway::admit`] once
//! the record is in hand. Counters move only on a genuinely new row.

use tracing::debug;

use crate::errors::CrawlResult;
use crate::models::{NaturalKey, RecordKind, ResourceRecord, SampleCounts};
use crate::store::{Diagnostic, ResultSink};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Accepted { id: i64 },
    Duplicate { id: i64 },
}

impl Admission {
    pub fn id(self) -> i64 {
        match self {
            Admission::Accepted { id } | Admission::Duplicate { id } => id,
        }
    }
}

pub struct DedupGateway {
    sink: Box<dyn ResultSink>,
    admitted: SampleCounts,
}

impl DedupGateway {
    pub fn new(sink: Box<dyn ResultSink>) -> Self {
        Self {
            sink,
            admitted: SampleCounts::default(),
        }
    }

    /// Local id of an already-stored record with this key.
    pub fn is_known(&self, key: &NaturalKey) -> CrawlResult<Option<i64>> {
        self.sink.lookup(key)
    }

    /// Insert `record` unless its natural key is already present. A race with
    /// another writer resolves through the sink's conflict-ignoring insert.
    pub fn admit(&mut self, record: &ResourceRecord) -> CrawlResult<Admission> {
        let key = record.natural_key();
        if let Some(id) = self.sink.lookup(&key)? {
            debug!(?key, id, "duplicate");
            return Ok(Admission::Duplicate { id });
        }
        let insertion = self.sink.insert(record)?;
        if insertion.inserted {
            self.admitted.bump(key.kind());
            Ok(Admission::Accepted { id: insertion.id })
        } else {
            Ok(Admission::Duplicate { id: insertion.id })
        }
    }

    /// Records newly inserted through this gateway.
    pub fn admitted(&self) -> SampleCounts {
        self.admitted
    }

    pub fn stored(&self, kind: RecordKind) -> CrawlResult<u64> {
        self.sink.count(kind)
    }

    pub fn record_diagnostic(&mut self, diagnostic: &Diagnostic) -> CrawlResult<()> {
        self.sink.record_diagnostic(diagnostic)
    }

    pub fn flush(&mut self) -> CrawlResult<()> {
        self.sink.flush()
    }

    pub fn close(&mut self) -> CrawlResult<()> {
        self.sink.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChildRecord, ContainerRecord};
    use crate::store::Database;

    fn repo(id: i64) -> ResourceRecord {
        ResourceRecord::Container(ContainerRecord {
            id,
            name: "token".into(),
            full_name: "acme/token".into(),
            description: None,
            url: "https://api.github.com/repos/acme/token".into(),
            fork: false,
            owner_id: 9,
            owner_login: "acme".into(),
        })
    }

    fn gateway() -> DedupGateway {
        DedupGateway::new(Box::new(Database::open_in_memory().unwrap()))
    }

    #[test]
    fn second_admission_is_duplicate_and_uncounted() {
        let mut gw = gateway();
        let first = gw.admit(&repo(42)).unwrap();
        let second = gw.admit(&repo(42)).unwrap();

        assert_eq!(first, Admission::Accepted { id: 42 });
        assert_eq!(second, Admission::Duplicate { id: 42 });
        assert_eq!(gw.admitted().containers, 1);
        assert_eq!(gw.stored(RecordKind::Container).unwrap(), 1);
    }

    #[test]
    fn is_known_reflects_prior_admission() {
        let mut gw = gateway();
        let key = NaturalKey::Child {
            container_id: 42,
            path: "a.sol".into(),
        };
        assert_eq!(gw.is_known(&key).unwrap(), None);

        gw.admit(&repo(42)).unwrap();
        let child = gw
            .admit(&ResourceRecord::Child(ChildRecord {
                name: "a.sol".into(),
                path: "a.sol".into(),
                sha: "b1".into(),
                container_id: 42,
            }))
            .unwrap();
        assert_eq!(gw.is_known(&key).unwrap(), Some(child.id()));
        assert_eq!(gw.admitted().children, 1);
    }
}
