//! SQLite storage layer for sampled containers, children, and revisions.
//!
//! One connection is held for the life of the crawl and used only from the
//! crawl thread. Inserts are `INSERT OR IGNORE`, so the UNIQUE constraints on
//! the natural keys are the final backstop against duplicates.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::errors::{CrawlError, CrawlResult};
use crate::models::{
    ChildRecord, ContainerRecord, NaturalKey, RecordKind, ResourceRecord, RevisionRecord,
};
use crate::store::schema;
use crate::store::{Diagnostic, Insertion, ResultSink};

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    if raw == "~" || raw.starts_with("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            let mut expanded = PathBuf::from(home);
            if raw.len() > 2 {
                expanded.push(&raw[2..]);
            }
            return expanded;
        }
    }
    path.to_path_buf()
}

pub struct Database {
    db_path: Option<PathBuf>,
    conn: Option<Connection>,
}

impl Database {
    /// Open (or create) the database file and initialise its schema. Parent
    /// directories are created as needed.
    pub fn open(path: &Path) -> CrawlResult<Self> {
        let resolved = expand_tilde(path);
        if let Some(parent) = resolved.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&resolved)?;
        conn.query_row("PRAGMA journal_mode = WAL;", [], |_| Ok(()))?;
        let db = Self {
            db_path: Some(resolved),
            conn: Some(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    pub fn open_in_memory() -> CrawlResult<Self> {
        let db = Self {
            db_path: None,
            conn: Some(Connection::open_in_memory()?),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn conn(&self) -> CrawlResult<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| CrawlError::Io(std::io::Error::other("result sink is closed")))
    }

    /// Create all tables and indexes, then run pending migrations.
    fn init_schema(&self) -> CrawlResult<()> {
        let conn = self.conn()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        for stmt in schema::SCHEMA_STATEMENTS {
            conn.execute_batch(stmt)?;
        }
        schema::migrate_schema(conn)?;
        Ok(())
    }

    fn insert_container(conn: &Connection, c: &ContainerRecord) -> CrawlResult<Insertion> {
        let changed = conn.execute(
            "INSERT OR IGNORE INTO containers \
                 (container_id, name, full_name, description, url, fork, owner_id, owner_login) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);",
            params![
                c.id,
                c.name,
                c.full_name,
                c.description,
                c.url,
                c.fork as i64,
                c.owner_id,
                c.owner_login,
            ],
        )?;
        Ok(Insertion {
            id: c.id,
            inserted: changed > 0,
        })
    }

    fn insert_child(conn: &Connection, c: &ChildRecord) -> CrawlResult<Insertion> {
        let changed = conn.execute(
            "INSERT OR IGNORE INTO children (name, path, sha, container_id) \
             VALUES (?1, ?2, ?3, ?4);",
            params![c.name, c.path, c.sha, c.container_id],
        )?;
        if changed > 0 {
            return Ok(Insertion {
                id: conn.last_insert_rowid(),
                inserted: true,
            });
        }
        let id: i64 = conn.query_row(
            "SELECT child_id FROM children WHERE path = ?1 AND container_id = ?2;",
            params![c.path, c.container_id],
            |row| row.get(0),
        )?;
        Ok(Insertion {
            id,
            inserted: false,
        })
    }

    fn insert_revision(conn: &Connection, r: &RevisionRecord) -> CrawlResult<Insertion> {
        let parents = serde_json::to_string(&r.parents)?;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO revisions \
                 (sha, message, size, created, parents, content, child_id) \
             VALUES (?1, ?2, ?3, COALESCE(?4, CURRENT_TIMESTAMP), ?5, ?6, ?7);",
            params![
                r.sha,
                r.message,
                r.size(),
                r.created,
                parents,
                r.content,
                r.child_id,
            ],
        )?;
        if changed > 0 {
            return Ok(Insertion {
                id: conn.last_insert_rowid(),
                inserted: true,
            });
        }
        let id: i64 = conn.query_row(
            "SELECT revision_id FROM revisions WHERE sha = ?1 AND child_id = ?2;",
            params![r.sha, r.child_id],
            |row| row.get(0),
        )?;
        Ok(Insertion {
            id,
            inserted: false,
        })
    }
}

impl ResultSink for Database {
    fn lookup(&self, key: &NaturalKey) -> CrawlResult<Option<i64>> {
        let conn = self.conn()?;
        let found = match key {
            NaturalKey::Container { id } => conn
                .query_row(
                    "SELECT container_id FROM containers WHERE container_id = ?1;",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?,
            NaturalKey::Child { container_id, path } => conn
                .query_row(
                    "SELECT child_id FROM children WHERE path = ?1 AND container_id = ?2;",
                    params![path, container_id],
                    |row| row.get(0),
                )
                .optional()?,
            NaturalKey::Revision { child_id, sha } => conn
                .query_row(
                    "SELECT revision_id FROM revisions WHERE sha = ?1 AND child_id = ?2;",
                    params![sha, child_id],
                    |row| row.get(0),
                )
                .optional()?,
        };
        Ok(found)
    }

    fn insert(&mut self, record: &ResourceRecord) -> CrawlResult<Insertion> {
        let conn = self.conn()?;
        let insertion = match record {
            ResourceRecord::Container(c) => Self::insert_container(conn, c)?,
            ResourceRecord::Child(c) => Self::insert_child(conn, c)?,
            ResourceRecord::Revision(r) => Self::insert_revision(conn, r)?,
        };
        debug!(
            kind = record.kind().table(),
            id = insertion.id,
            inserted = insertion.inserted,
            "sink insert"
        );
        Ok(insertion)
    }

    fn count(&self, kind: RecordKind) -> CrawlResult<u64> {
        let sql = format!("SELECT COUNT(*) FROM {};", kind.table());
        let n: i64 = self.conn()?.query_row(&sql, [], |row| row.get(0))?;
        Ok(n.max(0) as u64)
    }

    fn record_diagnostic(&mut self, d: &Diagnostic) -> CrawlResult<()> {
        self.conn()?.execute(
            "INSERT INTO crawl_diagnostics (run_id, stage, category, url, status, message) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
            params![d.run_id, d.stage, d.category, d.url, d.status, d.message],
        )?;
        Ok(())
    }

    fn flush(&mut self) -> CrawlResult<()> {
        // Autocommit mode: every statement is already committed. Checkpoint
        // the WAL so the main file is current.
        if self.db_path.is_some() {
            self.conn()?
                .query_row("PRAGMA wal_checkpoint(PASSIVE);", [], |_| Ok(()))?;
        }
        Ok(())
    }

    fn close(&mut self) -> CrawlResult<()> {
        if self.conn.is_none() {
            return Ok(());
        }
        self.flush()?;
        if let Some(conn) = self.conn.take() {
            conn.close().map_err(|(_, e)| CrawlError::Sqlite(e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(id: i64) -> ContainerRecord {
        ContainerRecord {
            id,
            name: "token".into(),
            full_name: "acme/token".into(),
            description: Some("ERC20".into()),
            url: "https://api.github.com/repos/acme/token".into(),
            fork: false,
            owner_id: 9,
            owner_login: "acme".into(),
        }
    }

    fn revision_parents(db: &Database, child_id: i64, sha: &str) -> Option<Vec<String>> {
        let raw: Option<String> = db
            .conn()
            .unwrap()
            .query_row(
                "SELECT parents FROM revisions WHERE sha = ?1 AND child_id = ?2;",
                params![sha, child_id],
                |row| row.get(0),
            )
            .optional()
            .unwrap();
        raw.map(|text| serde_json::from_str(&text).unwrap())
    }

    fn diagnostic_count(db: &Database) -> i64 {
        db.conn()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM crawl_diagnostics;", [], |row| row.get(0))
            .unwrap()
    }

    fn child(container_id: i64, path: &str) -> ChildRecord {
        ChildRecord {
            name: path.rsplit('/').next().unwrap_or(path).into(),
            path: path.into(),
            sha: "b1".into(),
            container_id,
        }
    }

    #[test]
    fn container_insert_ignores_conflicts() {
        let mut db = Database::open_in_memory().unwrap();
        let rec = ResourceRecord::Container(container(42));
        assert!(db.insert(&rec).unwrap().inserted);
        let again = db.insert(&rec).unwrap();
        assert!(!again.inserted);
        assert_eq!(again.id, 42);
        assert_eq!(db.count(RecordKind::Container).unwrap(), 1);
        assert_eq!(
            db.lookup(&NaturalKey::Container { id: 42 }).unwrap(),
            Some(42)
        );
    }

    #[test]
    fn child_conflict_returns_existing_id() {
        let mut db = Database::open_in_memory().unwrap();
        db.insert(&ResourceRecord::Container(container(1))).unwrap();
        let first = db
            .insert(&ResourceRecord::Child(child(1, "contracts/A.sol")))
            .unwrap();
        let second = db
            .insert(&ResourceRecord::Child(child(1, "contracts/A.sol")))
            .unwrap();
        assert!(first.inserted);
        assert!(!second.inserted);
        assert_eq!(first.id, second.id);

        let key = NaturalKey::Child {
            container_id: 1,
            path: "contracts/A.sol".into(),
        };
        assert_eq!(db.lookup(&key).unwrap(), Some(first.id));
        assert_eq!(
            db.lookup(&NaturalKey::Child {
                container_id: 2,
                path: "contracts/A.sol".into()
            })
            .unwrap(),
            None
        );
    }

    #[test]
    fn revision_round_trip_keeps_parents_and_bytes() {
        let mut db = Database::open_in_memory().unwrap();
        db.insert(&ResourceRecord::Container(container(1))).unwrap();
        let child_id = db
            .insert(&ResourceRecord::Child(child(1, "A.sol")))
            .unwrap()
            .id;
        let rev = RevisionRecord {
            sha: "c1".into(),
            message: "init".into(),
            created: Some("2021-03-01T10:00:00Z".into()),
            parents: vec!["p0".into(), "p1".into()],
            content: vec![0xff, b'a'],
            child_id,
        };
        assert!(db.insert(&ResourceRecord::Revision(rev.clone())).unwrap().inserted);
        assert!(!db.insert(&ResourceRecord::Revision(rev)).unwrap().inserted);
        assert_eq!(db.count(RecordKind::Revision).unwrap(), 1);
        assert_eq!(
            revision_parents(&db, child_id, "c1"),
            Some(vec!["p0".to_string(), "p1".to_string()])
        );
        let size: i64 = db
            .conn()
            .unwrap()
            .query_row("SELECT size FROM revisions;", [], |r| r.get(0))
            .unwrap();
        assert_eq!(size, 2);
    }

    #[test]
    fn child_requires_existing_container() {
        let mut db = Database::open_in_memory().unwrap();
        assert!(db
            .insert(&ResourceRecord::Child(child(99, "orphan.sol")))
            .is_err());
    }

    #[test]
    fn diagnostics_are_recorded() {
        let mut db = Database::open_in_memory().unwrap();
        db.record_diagnostic(&Diagnostic {
            run_id: "r1".into(),
            stage: "revisions".into(),
            category: "request".into(),
            url: Some("https://api.github.com/repos/a/b/commits".into()),
            status: Some(409),
            message: "Git Repository is empty.".into(),
        })
        .unwrap();
        assert_eq!(diagnostic_count(&db), 1);
    }

    #[test]
    fn file_database_persists_across_reopen_and_close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("results.db");
        {
            let mut db = Database::open(&path).unwrap();
            db.insert(&ResourceRecord::Container(container(5))).unwrap();
            db.close().unwrap();
            db.close().unwrap();
            assert!(db.count(RecordKind::Container).is_err());
        }
        let db = Database::open(&path).unwrap();
        assert_eq!(db.count(RecordKind::Container).unwrap(), 1);
        assert_eq!(schema::get_schema_version(db.conn().unwrap()), schema::SCHEMA_VERSION);
    }
}
