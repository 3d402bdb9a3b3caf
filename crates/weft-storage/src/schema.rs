//! SQLite schema for the run store
//!
//! `runs` and `step_runs` are the only rows mutated during execution;
//! everything else is insert-only. Indexes follow the engine's query
//! paths: run listing by pipeline, attempt lookup per step, log replay
//! per step run.

use rusqlite::Connection;

pub(crate) fn create_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS pipelines (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            version TEXT NOT NULL,
            definition TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS runs (
            id TEXT PRIMARY KEY,
            pipeline_id TEXT NOT NULL,
            pipeline_snapshot TEXT NOT NULL,
            state TEXT NOT NULL,
            initial_variables TEXT NOT NULL,
            options TEXT NOT NULL,
            outputs TEXT NOT NULL DEFAULT '{}',
            error TEXT,
            created_by TEXT NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            lease_until TEXT
        );

        CREATE TABLE IF NOT EXISTS step_runs (
            id TEXT PRIMARY KEY,
            run_id TEXT NOT NULL REFERENCES runs(id),
            step_id TEXT NOT NULL,
            attempt INTEGER NOT NULL,
            state TEXT NOT NULL,
            inputs TEXT NOT NULL DEFAULT 'null',
            outputs TEXT,
            error TEXT,
            error_code TEXT,
            duration_ms INTEGER NOT NULL DEFAULT 0,
            tokens INTEGER NOT NULL DEFAULT 0,
            cost REAL NOT NULL DEFAULT 0,
            started_at TEXT,
            finished_at TEXT
        );

        CREATE TABLE IF NOT EXISTS step_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            step_run_id TEXT NOT NULL REFERENCES step_runs(id),
            seq INTEGER NOT NULL,
            level TEXT NOT NULL,
            message TEXT NOT NULL,
            ts TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS step_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            payload TEXT NOT NULL,
            ts TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_runs_pipeline_created
            ON runs(pipeline_id, started_at DESC);
        CREATE INDEX IF NOT EXISTS idx_runs_state_lease
            ON runs(state, lease_until);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_step_runs_attempt
            ON step_runs(run_id, step_id, attempt DESC);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_step_logs_seq
            ON step_logs(step_run_id, seq);
        CREATE INDEX IF NOT EXISTS idx_step_events_run
            ON step_events(run_id, id);
        "#,
    )
}
