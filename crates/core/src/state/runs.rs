//! # Run Store
//!
//! Checkpoints of run records, their transition history, and per-branch
//! progress, all in SQLite.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use super::db::ResearchDb;
use crate::orchestration::run::{RunRecord, RunSummary};
use crate::orchestration::stage::RunStage;

/// One entry of a run's transition history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub seq: i64,
    pub stage: RunStage,
    pub timestamp: DateTime<Utc>,
}

/// Branch checkpoint keys
pub mod branch {
    pub const RESEARCH: &str = "research";
    pub const SIDE_ASSET: &str = "side_asset";
}

pub struct RunStore {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl RunStore {
    pub fn new(db: &ResearchDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    /// Upsert the run checkpoint and append a transition row.
    pub fn save(&self, record: &RunRecord) -> Result<()> {
        let data = serde_json::to_string(record).context("Failed to serialize run record")?;

        let mut conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let tx = conn.transaction()?;
        tx.execute(
            r#"
            INSERT OR REPLACE INTO runs (id, stage, query, record, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                record.id,
                record.stage.as_str(),
                record.request.query,
                data,
                record.created_at.to_rfc3339(),
                record.updated_at.to_rfc3339(),
            ],
        )?;
        tx.execute(
            r#"
            INSERT INTO run_transitions (run_id, stage, timestamp, snapshot)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                record.id,
                record.stage.as_str(),
                record.updated_at.to_rfc3339(),
                data
            ],
        )?;
        tx.commit().context("Failed to save run checkpoint")?;

        tracing::debug!(run_id = %record.id, stage = %record.stage, "Checkpoint saved");
        Ok(())
    }

    pub fn load(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let data: Option<String> = conn
            .query_row(
                "SELECT record FROM runs WHERE id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;

        data.map(|json| {
            serde_json::from_str(&json)
                .with_context(|| format!("Corrupt checkpoint for run {}", run_id))
        })
        .transpose()
    }

    /// Runs, newest first
    pub fn list(&self) -> Result<Vec<RunSummary>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let mut stmt = conn.prepare(
            r#"
            SELECT id, stage, query, created_at, updated_at
            FROM runs
            ORDER BY created_at DESC
            "#,
        )?;

        let runs = stmt
            .query_map([], Self::row_to_summary)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list runs")?;

        Ok(runs.into_iter().flatten().collect())
    }

    /// Ids of runs that have not reached a terminal stage
    pub fn list_resumable(&self) -> Result<Vec<String>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|run| !run.stage.is_terminal())
            .map(|run| run.id)
            .collect())
    }

    pub fn transitions(&self, run_id: &str) -> Result<Vec<Transition>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let mut stmt = conn.prepare(
            "SELECT seq, stage, timestamp FROM run_transitions WHERE run_id = ?1 ORDER BY seq",
        )?;

        let rows = stmt
            .query_map(params![run_id], |row| {
                let seq: i64 = row.get(0)?;
                let stage: String = row.get(1)?;
                let timestamp: String = row.get(2)?;
                Ok((seq, stage, timestamp))
            })?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read transitions")?;

        Ok(rows
            .into_iter()
            .filter_map(|(seq, stage, timestamp)| {
                Some(Transition {
                    seq,
                    stage: RunStage::parse(&stage)?,
                    timestamp: parse_timestamp(&timestamp),
                })
            })
            .collect())
    }

    /// Persist progress of one branch of a forked run
    pub fn save_branch<T: Serialize>(&self, run_id: &str, branch: &str, data: &T) -> Result<()> {
        let json = serde_json::to_string(data).context("Failed to serialize branch checkpoint")?;

        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        conn.execute(
            r#"
            INSERT OR REPLACE INTO branch_checkpoints (run_id, branch, data, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![run_id, branch, json, Utc::now().to_rfc3339()],
        )
        .context("Failed to save branch checkpoint")?;

        Ok(())
    }

    pub fn load_branch<T: DeserializeOwned>(&self, run_id: &str, branch: &str) -> Result<Option<T>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM branch_checkpoints WHERE run_id = ?1 AND branch = ?2",
                params![run_id, branch],
                |row| row.get(0),
            )
            .optional()?;

        data.map(|json| {
            serde_json::from_str(&json)
                .with_context(|| format!("Corrupt {} checkpoint for run {}", branch, run_id))
        })
        .transpose()
    }

    fn row_to_summary(row: &rusqlite::Row) -> rusqlite::Result<Option<RunSummary>> {
        let id: String = row.get(0)?;
        let stage: String = row.get(1)?;
        let query: String = row.get(2)?;
        let created_at: String = row.get(3)?;
        let updated_at: String = row.get(4)?;

        Ok(RunStage::parse(&stage).map(|stage| RunSummary {
            id,
            stage,
            query,
            created_at: parse_timestamp(&created_at),
            updated_at: parse_timestamp(&updated_at),
        }))
    }
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
