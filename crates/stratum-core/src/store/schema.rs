//! Result database layout and versioned upgrades.

use rusqlite::{params, Connection, OptionalExtension};

use crate::errors::CrawlResult;

pub const SCHEMA_VERSION: i32 = 2;

/// Base tables and indexes. Every statement is `IF NOT EXISTS`, so opening an
/// existing database replays them harmlessly.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS sink_meta (
        key TEXT PRIMARY KEY,
        value TEXT
    );",
    "CREATE TABLE IF NOT EXISTS containers (
        container_id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        full_name TEXT NOT NULL,
        description TEXT,
        url TEXT NOT NULL,
        fork INTEGER NOT NULL,
        owner_id INTEGER NOT NULL,
        owner_login TEXT NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS children (
        child_id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        path TEXT NOT NULL,
        sha TEXT NOT NULL,
        container_id INTEGER NOT NULL REFERENCES containers(container_id),
        UNIQUE(path, container_id)
    );",
    "CREATE TABLE IF NOT EXISTS revisions (
        revision_id INTEGER PRIMARY KEY,
        sha TEXT NOT NULL,
        message TEXT NOT NULL,
        size INTEGER NOT NULL,
        created TEXT DEFAULT CURRENT_TIMESTAMP,
        parents TEXT NOT NULL,
        content BLOB NOT NULL,
        child_id INTEGER NOT NULL REFERENCES children(child_id),
        UNIQUE(sha, child_id)
    );",
    "CREATE TABLE IF NOT EXISTS schema_upgrades (
        upgrade_id INTEGER PRIMARY KEY AUTOINCREMENT,
        version INTEGER NOT NULL,
        outcome TEXT NOT NULL,
        detail TEXT,
        applied_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    "CREATE INDEX IF NOT EXISTS idx_children_container ON children(container_id);",
    "CREATE INDEX IF NOT EXISTS idx_children_sha ON children(sha);",
    "CREATE INDEX IF NOT EXISTS idx_revisions_child ON revisions(child_id);",
    "CREATE INDEX IF NOT EXISTS idx_containers_full_name ON containers(full_name);",
];

type Upgrade = fn(&Connection) -> CrawlResult<()>;

/// Upgrade `i` takes a database from version `i` to `i + 1`.
const UPGRADES: &[Upgrade] = &[
    // 0 -> 1: the base tables above.
    |_| Ok(()),
    add_diagnostics,
];

/// Bring the database up to [`SCHEMA_VERSION`]. Each upgrade runs in its own
/// savepoint; a failing upgrade is rolled back, logged, and returned.
pub fn migrate_schema(conn: &Connection) -> CrawlResult<()> {
    let from = get_schema_version(conn).max(0);
    for version in from..SCHEMA_VERSION {
        let Some(upgrade) = UPGRADES.get(version as usize) else {
            break;
        };
        conn.execute_batch("SAVEPOINT schema_upgrade;")?;
        let applied = upgrade(conn).and_then(|()| store_version(conn, version + 1));
        match applied {
            Ok(()) => {
                conn.execute_batch("RELEASE SAVEPOINT schema_upgrade;")?;
                log_upgrade(conn, version + 1, "applied", None)?;
            }
            Err(e) => {
                let _ = conn.execute_batch(
                    "ROLLBACK TO SAVEPOINT schema_upgrade; RELEASE SAVEPOINT schema_upgrade;",
                );
                let _ = log_upgrade(conn, version + 1, "failed", Some(&e.to_string()));
                return Err(e);
            }
        }
    }
    Ok(())
}

/// Stored schema version; 0 for a database that predates versioning.
pub fn get_schema_version(conn: &Connection) -> i32 {
    conn.query_row(
        "SELECT value FROM sink_meta WHERE key = 'schema_version';",
        [],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .ok()
    .flatten()
    .and_then(|v| v.parse().ok())
    .unwrap_or(0)
}

fn store_version(conn: &Connection, version: i32) -> CrawlResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO sink_meta(key, value) VALUES('schema_version', ?1);",
        params![version.to_string()],
    )?;
    Ok(())
}

fn log_upgrade(conn: &Connection, version: i32, outcome: &str, detail: Option<&str>) -> CrawlResult<()> {
    conn.execute(
        "INSERT INTO schema_upgrades(version, outcome, detail) VALUES (?1, ?2, ?3);",
        params![version, outcome, detail],
    )?;
    Ok(())
}

/// 1 -> 2: skipped-item diagnostics.
fn add_diagnostics(conn: &Connection) -> CrawlResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS crawl_diagnostics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            stage TEXT NOT NULL,
            category TEXT NOT NULL,
            url TEXT,
            status INTEGER,
            message TEXT NOT NULL,
            created_at TEXT DEFAULT CURRENT_TIMESTAMP
        );
        CREATE INDEX IF NOT EXISTS idx_crawl_diag_run_created
            ON crawl_diagnostics(run_id, created_at);",
    )?;
    Ok(())
}
