//! Criterion benchmarks for stratum-core.
//!
//! Everything here runs offline: no transport is involved.
//!
//! ## Benchmark groups
//!
//! 1. **schema**: DDL init + migration overhead.
//! 2. **planner**: Cold-start tiling and resume over long checkpoint logs.
//! 3. **checkpoint**: Parsing a checkpoint log from disk.
//! 4. **wire**: Link header parsing and search payload decoding.
//! 5. **sink**: Conflict-ignoring inserts and natural-key lookups.
//!
//! ## Running
//!
//! ```sh
//! cargo bench --manifest-path crates/stratum-core/Cargo.toml
//! # Run only the planner group:
//! cargo bench --manifest-path crates/stratum-core/Cargo.toml -- planner
//! ```

use std::io::Write;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rusqlite::Connection;

use stratum_core::checkpoint::{read_log, COLUMNS};
use stratum_core::crawl::StratumPlanner;
use stratum_core::models::{
    CheckpointEntry, ChildRecord, ContainerRecord, NaturalKey, ResourceRecord, SampleCounts,
};
use stratum_core::source::github::{decode_search, CodeHit};
use stratum_core::source::{Page, Response};
use stratum_core::store::schema::{migrate_schema, SCHEMA_STATEMENTS};
use stratum_core::store::{Database, ResultSink};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// The rows a cold start over `[1, max]` would have logged.
fn completed_strata(max: u64, width: u64) -> Vec<CheckpointEntry> {
    StratumPlanner::new(1, max, width)
        .map(|s| CheckpointEntry {
            first: s.first,
            last: s.last,
            population: 42,
            sample: 42,
            counts: SampleCounts {
                containers: 30,
                children: 42,
                revisions: 42,
            },
        })
        .collect()
}

fn code_search_body(items: usize) -> Vec<u8> {
    let items: Vec<serde_json::Value> = (0..items)
        .map(|i| {
            serde_json::json!({
                "name": format!("C{i}.sol"),
                "path": format!("contracts/C{i}.sol"),
                "sha": format!("{i:040x}"),
                "url": format!("https://api.github.com/repositories/{i}/contents/contracts/C{i}.sol"),
                "repository": {
                    "id": i,
                    "name": "token",
                    "full_name": "acme/token",
                    "description": "ERC20",
                    "url": "https://api.github.com/repos/acme/token",
                    "fork": false,
                    "owner": {"id": 9, "login": "acme"}
                }
            })
        })
        .collect();
    serde_json::to_vec(&serde_json::json!({"total_count": 1500, "items": items})).unwrap()
}

// ---------------------------------------------------------------------------
// Benchmark: Schema
// ---------------------------------------------------------------------------

fn bench_schema_init(c: &mut Criterion) {
    c.bench_function("schema_init_and_migrate", |b| {
        b.iter(|| {
            let conn = Connection::open_in_memory().unwrap();
            conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
            for stmt in SCHEMA_STATEMENTS {
                conn.execute_batch(stmt).unwrap();
            }
            migrate_schema(&conn).unwrap();
            black_box(&conn);
        });
    });
}

// ---------------------------------------------------------------------------
// Benchmark: Planner
// ---------------------------------------------------------------------------

fn bench_planner(c: &mut Criterion) {
    let mut group = c.benchmark_group("planner");

    for width in [1u64, 64, 4096] {
        group.bench_with_input(BenchmarkId::new("cold_start", width), &width, |b, &w| {
            b.iter(|| StratumPlanner::new(1, black_box(393_216), w).count());
        });
    }

    let log = completed_strata(100_000, 1);
    group.bench_function("resume_100k_rows", |b| {
        b.iter(|| StratumPlanner::resume(1, 393_216, 1, black_box(&log)).unwrap());
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// Benchmark: Checkpoint log
// ---------------------------------------------------------------------------

fn bench_checkpoint_read(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sampling.csv");
    {
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "{}", COLUMNS.join(",")).unwrap();
        for e in completed_strata(20_000, 1) {
            writeln!(
                file,
                "{},{},{},{},{},{},{}",
                e.first,
                e.last,
                e.population,
                e.sample,
                e.counts.containers,
                e.counts.children,
                e.counts.revisions
            )
            .unwrap();
        }
    }

    c.bench_function("checkpoint_read_20k_rows", |b| {
        b.iter(|| read_log(black_box(&path)).unwrap().len());
    });
}

// ---------------------------------------------------------------------------
// Benchmark: Wire decoding
// ---------------------------------------------------------------------------

fn bench_wire(c: &mut Criterion) {
    let mut group = c.benchmark_group("wire");

    let linked = Response::new(200, Vec::new()).with_header(
        "link",
        "<https://api.github.com/search/code?q=x&page=2>; rel=\"next\", \
         <https://api.github.com/search/code?q=x&page=10>; rel=\"last\"",
    );
    group.bench_function("next_link", |b| {
        b.iter(|| black_box(&linked).next_link());
    });

    let page = Response::new(200, code_search_body(100));
    group.bench_function("decode_code_search_page", |b| {
        b.iter(|| {
            let decoded: Page<CodeHit> = decode_search(black_box(&page)).unwrap();
            decoded.items.len()
        });
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// Benchmark: Sink
// ---------------------------------------------------------------------------

fn bench_sink(c: &mut Criterion) {
    let mut group = c.benchmark_group("sink");

    let mut db = Database::open_in_memory().unwrap();
    db.insert(&ResourceRecord::Container(ContainerRecord {
        id: 1,
        name: "token".into(),
        full_name: "acme/token".into(),
        description: None,
        url: "https://api.github.com/repos/acme/token".into(),
        fork: false,
        owner_id: 9,
        owner_login: "acme".into(),
    }))
    .unwrap();
    for i in 0..1_000 {
        db.insert(&ResourceRecord::Child(ChildRecord {
            name: format!("C{i}.sol"),
            path: format!("contracts/C{i}.sol"),
            sha: format!("{i:040x}"),
            container_id: 1,
        }))
        .unwrap();
    }

    let hit = NaturalKey::Child {
        container_id: 1,
        path: "contracts/C500.sol".into(),
    };
    group.bench_function("lookup_child", |b| {
        b.iter(|| db.lookup(black_box(&hit)).unwrap());
    });

    let duplicate = ResourceRecord::Child(ChildRecord {
        name: "C500.sol".into(),
        path: "contracts/C500.sol".into(),
        sha: format!("{:040x}", 500),
        container_id: 1,
    });
    group.bench_function("insert_duplicate_child", |b| {
        b.iter(|| db.insert(black_box(&duplicate)).unwrap());
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_schema_init,
    bench_planner,
    bench_checkpoint_read,
    bench_wire,
    bench_sink,
);
criterion_main!(benches);
