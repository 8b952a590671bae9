//! Append-only registry of pipeline runs.
//!
//! A run is created `running` and moves to `completed` or `failed` exactly
//! once. Rows are never deleted or reopened. A `running` run that is older
//! than a sanity window without a terminal transition indicates a crashed or
//! interrupted process; [`RunLedger::stale`] finds those and
//! [`RunLedger::reap`] closes them as failed.

use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use thiserror::Error;

use crate::models::{Run, RunStatus, StageKind};

#[derive(Debug, Error)]
pub enum LedgerError {
    /// A terminal transition was requested for a run that is not running.
    /// This is a caller bug, not an operational failure.
    #[error("run {run_id} is not running (status: {status})")]
    NotRunning { run_id: i64, status: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LedgerError>;

#[derive(Clone)]
pub struct RunLedger {
    pool: SqlitePool,
}

impl RunLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open a new `running` run for `stage`.
    pub async fn begin(&self, stage: StageKind, config: &serde_json::Value) -> Result<i64> {
        let started_at = Utc::now().timestamp();
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO runs (stage, status, started_at, config_json) VALUES (?, 'running', ?, ?) RETURNING id",
        )
        .bind(stage.as_str())
        .bind(started_at)
        .bind(serde_json::to_string(config)?)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(run_id = id, stage = %stage, "run started");
        Ok(id)
    }

    /// Close a running run successfully, recording aggregate statistics.
    pub async fn complete<S: Serialize>(&self, run_id: i64, stats: &S) -> Result<()> {
        let stats_json = serde_json::to_string(stats)?;
        self.terminate(run_id, RunStatus::Completed, Some(stats_json), None)
            .await?;
        tracing::info!(run_id, "run completed");
        Ok(())
    }

    /// Close a running run as failed.
    pub async fn fail(&self, run_id: i64, error: &str) -> Result<()> {
        self.terminate(run_id, RunStatus::Failed, None, Some(error))
            .await?;
        tracing::warn!(run_id, error, "run failed");
        Ok(())
    }

    async fn terminate(
        &self,
        run_id: i64,
        status: RunStatus,
        stats_json: Option<String>,
        error: Option<&str>,
    ) -> Result<()> {
        let done = sqlx::query(
            r#"
            UPDATE runs SET status = ?, completed_at = ?, stats_json = ?, error = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(status.as_str())
        .bind(Utc::now().timestamp())
        .bind(stats_json)
        .bind(error)
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 0 {
            let current: Option<String> =
                sqlx::query_scalar("SELECT status FROM runs WHERE id = ?")
                    .bind(run_id)
                    .fetch_optional(&self.pool)
                    .await?;
            return Err(LedgerError::NotRunning {
                run_id,
                status: current.unwrap_or_else(|| "missing".to_string()),
            });
        }
        Ok(())
    }

    pub async fn get(&self, run_id: i64) -> Result<Option<Run>> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| run_from_row(&r)).transpose()
    }

    /// Most recent runs first, optionally filtered by stage.
    pub async fn list(&self, stage: Option<StageKind>, limit: i64) -> Result<Vec<Run>> {
        let rows = match stage {
            Some(stage) => {
                sqlx::query("SELECT * FROM runs WHERE stage = ? ORDER BY id DESC LIMIT ?")
                    .bind(stage.as_str())
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM runs ORDER BY id DESC LIMIT ?")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(run_from_row).collect()
    }

    /// Latest completed run of a stage, for comparing reruns.
    pub async fn latest_completed(&self, stage: StageKind) -> Result<Option<Run>> {
        let row = sqlx::query(
            "SELECT * FROM runs WHERE stage = ? AND status = 'completed' ORDER BY id DESC LIMIT 1",
        )
        .bind(stage.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| run_from_row(&r)).transpose()
    }

    /// Runs still `running` after `window` has elapsed since they started.
    pub async fn stale(&self, window: Duration) -> Result<Vec<Run>> {
        let cutoff = Utc::now().timestamp() - window.as_secs() as i64;
        let rows = sqlx::query(
            "SELECT * FROM runs WHERE status = 'running' AND started_at <= ? ORDER BY id ASC",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }

    /// Mark every stale run failed. Returns the ids that were closed.
    pub async fn reap(&self, window: Duration) -> Result<Vec<i64>> {
        let mut reaped = Vec::new();
        for run in self.stale(window).await? {
            match self.fail(run.id, "abandoned: no completion signal").await {
                Ok(()) => reaped.push(run.id),
                // Finished concurrently between the scan and the update.
                Err(LedgerError::NotRunning { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(reaped)
    }

    /// Log a warning for stale runs of `stage`, typically before starting it again.
    pub async fn warn_if_stale(&self, stage: StageKind, window: Duration) -> Result<()> {
        for run in self.stale(window).await? {
            if run.stage == stage {
                tracing::warn!(
                    run_id = run.id,
                    stage = %stage,
                    started_at = run.started_at,
                    "previous run never finished; it was likely interrupted"
                );
            }
        }
        Ok(())
    }
}

fn run_from_row(row: &SqliteRow) -> Result<Run> {
    let stage: String = row.get("stage");
    let status: String = row.get("status");
    let config_json: String = row.get("config_json");
    let stats_json: Option<String> = row.get("stats_json");

    Ok(Run {
        id: row.get("id"),
        stage: stage.parse().unwrap_or(StageKind::Inventory),
        status: status.parse().unwrap_or(RunStatus::Failed),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        config: serde_json::from_str(&config_json).unwrap_or(serde_json::Value::Null),
        stats: stats_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
        error: row.get("error"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_pool;

    #[tokio::test]
    async fn begin_complete_lifecycle() {
        let (_dir, pool) = test_pool().await;
        let ledger = RunLedger::new(pool);

        let id = ledger
            .begin(StageKind::Extraction, &serde_json::json!({"force": false}))
            .await
            .unwrap();
        let run = ledger.get(id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.completed_at.is_none());
        assert_eq!(run.config["force"], false);

        ledger
            .complete(id, &serde_json::json!({"succeeded": 3}))
            .await
            .unwrap();
        let run = ledger.get(id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.completed_at.is_some());
        assert_eq!(run.stats.unwrap()["succeeded"], 3);
    }

    #[tokio::test]
    async fn terminal_transition_happens_once() {
        let (_dir, pool) = test_pool().await;
        let ledger = RunLedger::new(pool);

        let id = ledger
            .begin(StageKind::Labeling, &serde_json::json!({}))
            .await
            .unwrap();
        ledger.fail(id, "boom").await.unwrap();

        let err = ledger
            .complete(id, &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotRunning { ref status, .. } if status == "failed"));

        let err = ledger.fail(id, "again").await.unwrap_err();
        assert!(matches!(err, LedgerError::NotRunning { .. }));

        // The first terminal state is preserved.
        let run = ledger.get(id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn unknown_run_is_not_running() {
        let (_dir, pool) = test_pool().await;
        let ledger = RunLedger::new(pool);
        let err = ledger.fail(999, "x").await.unwrap_err();
        assert!(matches!(err, LedgerError::NotRunning { ref status, .. } if status == "missing"));
    }

    #[tokio::test]
    async fn stale_and_reap_respect_window() {
        let (_dir, pool) = test_pool().await;
        let ledger = RunLedger::new(pool.clone());

        let old = ledger
            .begin(StageKind::Extraction, &serde_json::json!({}))
            .await
            .unwrap();
        let fresh = ledger
            .begin(StageKind::Extraction, &serde_json::json!({}))
            .await
            .unwrap();
        sqlx::query("UPDATE runs SET started_at = started_at - 7200 WHERE id = ?")
            .bind(old)
            .execute(&pool)
            .await
            .unwrap();

        let stale = ledger.stale(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(stale.iter().map(|r| r.id).collect::<Vec<_>>(), vec![old]);

        let reaped = ledger.reap(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(reaped, vec![old]);
        assert_eq!(
            ledger.get(old).await.unwrap().unwrap().status,
            RunStatus::Failed
        );
        assert_eq!(
            ledger.get(fresh).await.unwrap().unwrap().status,
            RunStatus::Running
        );
    }

    #[tokio::test]
    async fn list_filters_by_stage_newest_first() {
        let (_dir, pool) = test_pool().await;
        let ledger = RunLedger::new(pool);
        let a = ledger.begin(StageKind::Inventory, &serde_json::json!({})).await.unwrap();
        let b = ledger.begin(StageKind::Extraction, &serde_json::json!({})).await.unwrap();
        let c = ledger.begin(StageKind::Inventory, &serde_json::json!({})).await.unwrap();

        let all = ledger.list(None, 10).await.unwrap();
        assert_eq!(all.iter().map(|r| r.id).collect::<Vec<_>>(), vec![c, b, a]);

        let inv = ledger.list(Some(StageKind::Inventory), 10).await.unwrap();
        assert_eq!(inv.iter().map(|r| r.id).collect::<Vec<_>>(), vec![c, a]);

        ledger.complete(a, &serde_json::json!({})).await.unwrap();
        let latest = ledger.latest_completed(StageKind::Inventory).await.unwrap().unwrap();
        assert_eq!(latest.id, a);
    }
}
