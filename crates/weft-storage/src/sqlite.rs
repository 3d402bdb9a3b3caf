//! SQLite-backed run store
//!
//! Connection handling follows the async wrapper pattern: every access
//! goes through `Connection::call` so rusqlite work stays off the
//! executor's tasks. Each state transition is one transaction.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use rusqlite::params;
use serde_json::Value;
use tokio_rusqlite::Connection as AsyncConnection;

use weft_core::error::StoreError;
use weft_core::event::Event;
use weft_core::traits::RunStore;
use weft_core::types::{
    LogEntry, LogLevel, Pipeline, Run, RunState, StepMetrics, StepRun, StepRunState,
};

use crate::schema;

pub struct SqliteRunStore {
    connection: AsyncConnection,
}

impl SqliteRunStore {
    /// Opens (and migrates) a store at the given path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let connection = AsyncConnection::open(path.as_ref())
            .await
            .map_err(unavailable)?;
        Self::initialize(connection).await
    }

    /// In-memory database, used by tests and ephemeral deployments.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let connection = AsyncConnection::open_in_memory().await.map_err(unavailable)?;
        Self::initialize(connection).await
    }

    async fn initialize(connection: AsyncConnection) -> Result<Self, StoreError> {
        connection
            .call(|conn| {
                conn.pragma_update(None, "journal_mode", "WAL")?;
                conn.pragma_update(None, "foreign_keys", "ON")?;
                schema::create_tables(conn)?;
                Ok(())
            })
            .await
            .map_err(query)?;
        debug!("sqlite run store initialized");
        Ok(Self { connection })
    }
}

fn unavailable(err: impl std::fmt::Display) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

fn query(err: impl std::fmt::Display) -> StoreError {
    StoreError::Query(err.to_string())
}

fn serialization(err: impl std::fmt::Display) -> StoreError {
    StoreError::Serialization(err.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(serialization)
}

fn parse_ts(raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    let snapshot: String = row.get("pipeline_snapshot")?;
    let initial: String = row.get("initial_variables")?;
    let options: String = row.get("options")?;
    let outputs: String = row.get("outputs")?;
    let state: String = row.get("state")?;
    let started_at: String = row.get("started_at")?;
    let finished_at: Option<String> = row.get("finished_at")?;
    let lease_until: Option<String> = row.get("lease_until")?;

    let bad = |e: serde_json::Error| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    };

    Ok(Run {
        id: row.get("id")?,
        pipeline_id: row.get("pipeline_id")?,
        pipeline_snapshot: serde_json::from_str(&snapshot).map_err(bad)?,
        state: RunState::from_str(&state).unwrap_or(RunState::Failed),
        initial_variables: serde_json::from_str(&initial).map_err(bad)?,
        options: serde_json::from_str(&options).map_err(bad)?,
        outputs: serde_json::from_str(&outputs).map_err(bad)?,
        created_by: row.get("created_by")?,
        started_at: parse_ts(started_at)?,
        finished_at: finished_at.map(parse_ts).transpose()?,
        error: row.get("error")?,
        lease_until: lease_until.map(parse_ts).transpose()?,
    })
}

fn row_to_step_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<StepRun> {
    let state: String = row.get("state")?;
    let inputs: String = row.get("inputs")?;
    let outputs: Option<String> = row.get("outputs")?;
    let started_at: Option<String> = row.get("started_at")?;
    let finished_at: Option<String> = row.get("finished_at")?;

    let bad = |e: serde_json::Error| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    };

    Ok(StepRun {
        id: row.get("id")?,
        run_id: row.get("run_id")?,
        step_id: row.get("step_id")?,
        attempt: row.get("attempt")?,
        state: StepRunState::from_str(&state).unwrap_or(StepRunState::Failed),
        started_at: started_at.map(parse_ts).transpose()?,
        finished_at: finished_at.map(parse_ts).transpose()?,
        inputs: serde_json::from_str(&inputs).map_err(bad)?,
        outputs: outputs
            .map(|raw| serde_json::from_str::<Value>(&raw))
            .transpose()
            .map_err(bad)?,
        error: row.get("error")?,
        error_code: row.get("error_code")?,
        metrics: StepMetrics {
            duration_ms: row.get::<_, i64>("duration_ms")? as u64,
            tokens: row.get::<_, i64>("tokens")? as u64,
            cost: row.get("cost")?,
        },
    })
}

#[async_trait]
impl RunStore for SqliteRunStore {
    async fn save_pipeline(&self, pipeline: &Pipeline) -> Result<(), StoreError> {
        let definition = to_json(pipeline)?;
        let (id, name, version) =
            (pipeline.id.clone(), pipeline.name.clone(), pipeline.version.clone());
        let now = Utc::now().to_rfc3339();
        self.connection
            .call(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO pipelines (id, name, version, definition, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    ON CONFLICT(id) DO UPDATE SET
                        name = excluded.name,
                        version = excluded.version,
                        definition = excluded.definition,
                        updated_at = excluded.updated_at
                    "#,
                    params![id, name, version, definition, now],
                )?;
                Ok(())
            })
            .await
            .map_err(query)
    }

    async fn load_pipeline(&self, pipeline_id: &str) -> Result<Option<Pipeline>, StoreError> {
        let pipeline_id = pipeline_id.to_string();
        let raw: Option<String> = self
            .connection
            .call(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT definition FROM pipelines WHERE id = ?1")?;
                let mut rows = stmt.query_map(params![pipeline_id], |row| row.get(0))?;
                Ok(rows.next().transpose()?)
            })
            .await
            .map_err(query)?;
        raw.map(|text| serde_json::from_str(&text).map_err(serialization))
            .transpose()
    }

    async fn create_run(&self, run: &Run) -> Result<(), StoreError> {
        let snapshot = to_json(&run.pipeline_snapshot)?;
        let initial = to_json(&run.initial_variables)?;
        let options = to_json(&run.options)?;
        let outputs = to_json(&run.outputs)?;
        let run = run.clone();
        self.connection
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    r#"
                    INSERT INTO runs (
                        id, pipeline_id, pipeline_snapshot, state, initial_variables,
                        options, outputs, error, created_by, started_at, finished_at, lease_until
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                    "#,
                    params![
                        run.id,
                        run.pipeline_id,
                        snapshot,
                        run.state.to_string(),
                        initial,
                        options,
                        outputs,
                        run.error,
                        run.created_by,
                        run.started_at.to_rfc3339(),
                        run.finished_at.map(|t| t.to_rfc3339()),
                        run.lease_until.map(|t| t.to_rfc3339()),
                    ],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(query)
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>, StoreError> {
        let run_id = run_id.to_string();
        self.connection
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT * FROM runs WHERE id = ?1")?;
                let mut rows = stmt.query_map(params![run_id], row_to_run)?;
                Ok(rows.next().transpose()?)
            })
            .await
            .map_err(query)
    }

    async fn list_runs(&self, pipeline_id: &str) -> Result<Vec<Run>, StoreError> {
        let pipeline_id = pipeline_id.to_string();
        self.connection
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT * FROM runs WHERE pipeline_id = ?1 ORDER BY started_at DESC",
                )?;
                let rows = stmt.query_map(params![pipeline_id], row_to_run)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await
            .map_err(query)
    }

    async fn update_run(
        &self,
        run_id: &str,
        state: RunState,
        outputs: &BTreeMap<String, Value>,
        error: Option<&str>,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let run_id = run_id.to_string();
        let outputs = to_json(outputs)?;
        let error = error.map(str::to_string);
        let changed = self
            .connection
            .call(move |conn| {
                let tx = conn.transaction()?;
                let changed = tx.execute(
                    r#"
                    UPDATE runs
                    SET state = ?2, outputs = ?3, error = ?4, finished_at = ?5
                    WHERE id = ?1
                    "#,
                    params![
                        run_id,
                        state.to_string(),
                        outputs,
                        error,
                        finished_at.map(|t| t.to_rfc3339()),
                    ],
                )?;
                tx.commit()?;
                Ok(changed)
            })
            .await
            .map_err(query)?;
        if changed == 0 {
            return Err(StoreError::NotFound("run".to_string()));
        }
        Ok(())
    }

    async fn create_step_run(&self, step_run: &StepRun) -> Result<(), StoreError> {
        let inputs = to_json(&step_run.inputs)?;
        let step_run = step_run.clone();
        self.connection
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    r#"
                    INSERT INTO step_runs (
                        id, run_id, step_id, attempt, state, inputs,
                        started_at, duration_ms, tokens, cost
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, 0, 0)
                    "#,
                    params![
                        step_run.id,
                        step_run.run_id,
                        step_run.step_id,
                        step_run.attempt,
                        step_run.state.to_string(),
                        inputs,
                        step_run.started_at.map(|t| t.to_rfc3339()),
                    ],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(query)
    }

    async fn finish_step_run(&self, step_run: &StepRun) -> Result<(), StoreError> {
        let outputs = step_run
            .outputs
            .as_ref()
            .map(to_json)
            .transpose()?;
        let step_run = step_run.clone();
        self.connection
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    r#"
                    UPDATE step_runs
                    SET state = ?2, outputs = ?3, error = ?4, error_code = ?5,
                        duration_ms = ?6, tokens = ?7, cost = ?8, finished_at = ?9
                    WHERE id = ?1
                    "#,
                    params![
                        step_run.id,
                        step_run.state.to_string(),
                        outputs,
                        step_run.error,
                        step_run.error_code,
                        step_run.metrics.duration_ms as i64,
                        step_run.metrics.tokens as i64,
                        step_run.metrics.cost,
                        step_run.finished_at.map(|t| t.to_rfc3339()),
                    ],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(query)
    }

    async fn list_step_runs(&self, run_id: &str) -> Result<Vec<StepRun>, StoreError> {
        let run_id = run_id.to_string();
        self.connection
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT * FROM step_runs WHERE run_id = ?1 ORDER BY step_id, attempt DESC",
                )?;
                let rows = stmt.query_map(params![run_id], row_to_step_run)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await
            .map_err(query)
    }

    async fn append_log(&self, step_run_id: &str, entry: &LogEntry) -> Result<(), StoreError> {
        let step_run_id = step_run_id.to_string();
        let entry = entry.clone();
        self.connection
            .call(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO step_logs (step_run_id, seq, level, message, ts)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    "#,
                    params![
                        step_run_id,
                        entry.seq as i64,
                        entry.level.to_string(),
                        entry.message,
                        entry.ts.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(query)
    }

    async fn list_logs(&self, step_run_id: &str) -> Result<Vec<LogEntry>, StoreError> {
        let step_run_id = step_run_id.to_string();
        self.connection
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT seq, level, message, ts FROM step_logs
                     WHERE step_run_id = ?1 ORDER BY seq",
                )?;
                let rows = stmt.query_map(params![step_run_id], |row| {
                    let level: String = row.get("level")?;
                    let ts: String = row.get("ts")?;
                    Ok(LogEntry {
                        seq: row.get::<_, i64>("seq")? as u64,
                        level: LogLevel::from_str(&level).unwrap_or(LogLevel::Info),
                        message: row.get("message")?,
                        ts: parse_ts(ts)?,
                    })
                })?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await
            .map_err(query)
    }

    async fn append_event(&self, event: &Event) -> Result<(), StoreError> {
        let payload = to_json(event)?;
        let run_id = event.run_id.clone();
        let kind = event.payload.kind().to_string();
        let ts = event.ts.to_rfc3339();
        self.connection
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO step_events (run_id, kind, payload, ts) VALUES (?1, ?2, ?3, ?4)",
                    params![run_id, kind, payload, ts],
                )?;
                Ok(())
            })
            .await
            .map_err(query)
    }

    async fn heartbeat(&self, run_id: &str, lease_until: DateTime<Utc>) -> Result<(), StoreError> {
        let run_id = run_id.to_string();
        self.connection
            .call(move |conn| {
                conn.execute(
                    "UPDATE runs SET lease_until = ?2 WHERE id = ?1 AND state = 'running'",
                    params![run_id, lease_until.to_rfc3339()],
                )?;
                Ok(())
            })
            .await
            .map_err(query)
    }

    async fn expired_runs(&self, now: DateTime<Utc>) -> Result<Vec<Run>, StoreError> {
        let now = now.to_rfc3339();
        self.connection
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT * FROM runs
                     WHERE state = 'running' AND lease_until IS NOT NULL AND lease_until < ?1",
                )?;
                let rows = stmt.query_map(params![now], row_to_run)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await
            .map_err(query)
    }
}
