//! SQLite store of finished run summaries.

use std::path::Path;

use chrono::SecondsFormat;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::summary::RunSummary;

/// One row of `runman history`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRun {
    pub run_id: String,
    pub collection_name: String,
    pub status: String,
    pub started_at: String,
    pub duration_ms: u64,
    pub failures: u64,
}

pub struct RunStore {
    conn: Connection,
}

impl RunStore {
    pub fn open(path: &Path) -> Result<Self, String> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|err| format!("Failed to create store directory: {err}"))?;
        }
        let conn = Connection::open(path).map_err(|err| format!("Failed to open SQLite: {err}"))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| format!("Failed to set SQLite journal mode: {err}"))?;

        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, String> {
        let conn =
            Connection::open_in_memory().map_err(|err| format!("Failed to open SQLite: {err}"))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, String> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS runs (
             run_id TEXT PRIMARY KEY,
             collection_name TEXT NOT NULL,
             status TEXT NOT NULL,
             started_at TEXT NOT NULL,
             duration_ms INTEGER NOT NULL,
             failures INTEGER NOT NULL,
             summary_json TEXT NOT NULL,
             updated_at INTEGER NOT NULL DEFAULT (strftime('%s','now'))
           );
           CREATE INDEX IF NOT EXISTS runs_started_at ON runs (started_at);",
        )
        .map_err(|err| format!("Failed to initialize SQLite schema: {err}"))?;

        Ok(Self { conn })
    }

    /// Insert the summary, replacing any earlier record of the same run.
    pub fn record_run(&self, summary: &RunSummary) -> Result<(), String> {
        let summary_json = serde_json::to_string(summary)
            .map_err(|err| format!("Failed to serialize run summary: {err}"))?;

        self.conn
            .execute(
                "INSERT INTO runs (run_id, collection_name, status, started_at, duration_ms, failures, summary_json, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, strftime('%s','now'))
               ON CONFLICT(run_id)
               DO UPDATE SET
                 collection_name = excluded.collection_name,
                 status = excluded.status,
                 started_at = excluded.started_at,
                 duration_ms = excluded.duration_ms,
                 failures = excluded.failures,
                 summary_json = excluded.summary_json,
                 updated_at = excluded.updated_at;",
                params![
                    summary.run_id,
                    summary.collection_name,
                    summary.status.as_str(),
                    summary.started_at.to_rfc3339_opts(SecondsFormat::Millis, true),
                    summary.duration_ms as i64,
                    summary.failures.len() as i64,
                    summary_json,
                ],
            )
            .map_err(|err| format!("Failed to save run to SQLite: {err}"))?;

        Ok(())
    }

    pub fn load_run(&self, run_id: &str) -> Result<Option<RunSummary>, String> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT summary_json FROM runs WHERE run_id = ?1 LIMIT 1;",
                params![run_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| format!("Failed to load run from SQLite: {err}"))?;

        raw.map(|json| {
            serde_json::from_str(&json).map_err(|err| format!("Stored run `{run_id}` is corrupt: {err}"))
        })
        .transpose()
    }

    /// Most recent runs first.
    pub fn recent_runs(&self, limit: usize) -> Result<Vec<StoredRun>, String> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT run_id, collection_name, status, started_at, duration_ms, failures
                 FROM runs ORDER BY started_at DESC LIMIT ?1;",
            )
            .map_err(|err| format!("Failed to query runs: {err}"))?;

        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(StoredRun {
                    run_id: row.get(0)?,
                    collection_name: row.get(1)?,
                    status: row.get(2)?,
                    started_at: row.get(3)?,
                    duration_ms: row.get::<_, i64>(4)? as u64,
                    failures: row.get::<_, i64>(5)? as u64,
                })
            })
            .map_err(|err| format!("Failed to query runs: {err}"))?;

        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|err| format!("Failed to read run row: {err}"))
    }
}
