// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.
//!
//! One [`SqliteHistoryStore`] implements all three store traits over a
//! single pool, which lets the create/update bundles commit in one
//! transaction. Mutable-state rows hold the full snapshot as JSON, with the
//! CAS column `next_event_id` duplicated out of it for the conditional
//! update. `BEGIN IMMEDIATE` transactions serialize writers, so the
//! read-check-write of the compare-and-swap is race-free.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use chronik_types::event::HistoryEvent;
use chronik_types::task::{ReplicationTask, TimerTask, TransferTask};
use chronik_types::WorkflowRun;

use crate::error::{EngineError, Result};

use super::{
    already_started_error, apply_update_to_record, AppendHistoryEventsRequest,
    CreateWorkflowExecutionRequest, CurrentExecutionRecord, ExecutionStore, HistoryStore,
    UpdateWorkflowExecutionRequest, VisibilityCloseRecord, VisibilityStartRecord, VisibilityStore,
    WorkflowMutableStateRecord,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// SQLite-backed execution, history and visibility store.
#[derive(Clone)]
pub struct SqliteHistoryStore {
    pool: SqlitePool,
}

fn millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl SqliteHistoryStore {
    /// Store over an existing pool. The caller must have run
    /// [`Self::migrate`].
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a store from a file path: creates parent
    /// directories and the database file, connects, and runs migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|err| EngineError::Store {
                    operation: "create_dir".to_string(),
                    details: format!("failed to create directory {:?}: {}", parent, err),
                    transient: false,
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::migrate(&pool).await?;
        Ok(Self::new(pool))
    }

    /// Run all pending migrations. Safe to call repeatedly.
    pub async fn migrate(pool: &SqlitePool) -> Result<()> {
        MIGRATOR.run(pool).await.map_err(|err| EngineError::Store {
            operation: "migrate".to_string(),
            details: err.to_string(),
            transient: false,
        })
    }

    async fn create_in_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        request: &CreateWorkflowExecutionRequest,
    ) -> Result<()> {
        let info = &request.snapshot.execution_info;

        let current = sqlx::query(
            r#"
            SELECT run_id, create_request_id, state, close_status
            FROM current_executions
            WHERE domain_id = ? AND workflow_id = ?
            "#,
        )
        .bind(&info.domain_id)
        .bind(&info.workflow_id)
        .fetch_optional(&mut **tx)
        .await?;

        if let Some(row) = current {
            let record = CurrentExecutionRecord {
                run_id: row.get("run_id"),
                create_request_id: row.get("create_request_id"),
                state: parse_enum(row.get::<String, _>("state").as_str())?,
                close_status: parse_enum(row.get::<String, _>("close_status").as_str())?,
            };
            if !request.continue_as_new {
                return Err(already_started_error(&record));
            }
            if request.previous_run_id.as_deref() != Some(record.run_id.as_str()) {
                return Err(EngineError::Conflict);
            }
        }

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO current_executions
                (domain_id, workflow_id, run_id, create_request_id, state, close_status)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&info.domain_id)
        .bind(&info.workflow_id)
        .bind(&info.run_id)
        .bind(&request.request_id)
        .bind(info.state.to_string())
        .bind(info.close_status.to_string())
        .execute(&mut **tx)
        .await?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO executions
                (domain_id, workflow_id, run_id, next_event_id, state, close_status,
                 snapshot, last_updated_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&info.domain_id)
        .bind(&info.workflow_id)
        .bind(&info.run_id)
        .bind(info.next_event_id)
        .bind(info.state.to_string())
        .bind(info.close_status.to_string())
        .bind(serde_json::to_string(&request.snapshot)?)
        .bind(millis(info.last_updated))
        .execute(&mut **tx)
        .await?;

        Self::insert_tasks_in_tx(
            tx,
            &request.transfer_tasks,
            &request.timer_tasks,
            &request.replication_tasks,
        )
        .await
    }

    async fn insert_tasks_in_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        transfer: &[TransferTask],
        timer: &[TimerTask],
        replication: &[ReplicationTask],
    ) -> Result<()> {
        for task in transfer {
            sqlx::query("INSERT OR REPLACE INTO transfer_tasks (task_id, payload) VALUES (?, ?)")
                .bind(task.task_id)
                .bind(serde_json::to_string(task)?)
                .execute(&mut **tx)
                .await?;
        }
        for task in timer {
            sqlx::query(
                "INSERT OR REPLACE INTO timer_tasks (task_id, visibility_ms, payload) VALUES (?, ?, ?)",
            )
            .bind(task.task_id)
            .bind(millis(task.visibility_timestamp))
            .bind(serde_json::to_string(task)?)
            .execute(&mut **tx)
            .await?;
        }
        for task in replication {
            sqlx::query(
                "INSERT OR REPLACE INTO replication_tasks (task_id, payload) VALUES (?, ?)",
            )
            .bind(task.task_id)
            .bind(serde_json::to_string(task)?)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }
}

fn parse_enum<T: std::str::FromStr>(raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| EngineError::internal(format!("corrupt enum column value: {}", raw)))
}

fn parse_payload<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(EngineError::from)
}

#[async_trait]
impl ExecutionStore for SqliteHistoryStore {
    async fn create_workflow_execution(
        &self,
        request: &CreateWorkflowExecutionRequest,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::create_in_tx(&mut tx, request).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_workflow_execution(
        &self,
        domain_id: &str,
        workflow_id: &str,
        run_id: &str,
    ) -> Result<WorkflowMutableStateRecord> {
        let row = sqlx::query(
            r#"
            SELECT snapshot FROM executions
            WHERE domain_id = ? AND workflow_id = ? AND run_id = ?
            "#,
        )
        .bind(domain_id)
        .bind(workflow_id)
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            EngineError::not_exists(format!("Workflow execution '{}' not found", workflow_id))
        })?;
        parse_payload(row.get::<String, _>("snapshot").as_str())
    }

    async fn update_workflow_execution(
        &self,
        request: &UpdateWorkflowExecutionRequest,
    ) -> Result<()> {
        let info = &request.execution_info;
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT snapshot, next_event_id FROM executions
            WHERE domain_id = ? AND workflow_id = ? AND run_id = ?
            "#,
        )
        .bind(&info.domain_id)
        .bind(&info.workflow_id)
        .bind(&info.run_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| {
            EngineError::not_exists(format!(
                "Workflow execution '{}' not found",
                info.workflow_id
            ))
        })?;
        if row.get::<i64, _>("next_event_id") != request.condition {
            return Err(EngineError::Conflict);
        }

        let mut record: WorkflowMutableStateRecord =
            parse_payload(row.get::<String, _>("snapshot").as_str())?;
        apply_update_to_record(&mut record, request);

        let updated = sqlx::query(
            r#"
            UPDATE executions
            SET next_event_id = ?, state = ?, close_status = ?, snapshot = ?, last_updated_ms = ?
            WHERE domain_id = ? AND workflow_id = ? AND run_id = ? AND next_event_id = ?
            "#,
        )
        .bind(info.next_event_id)
        .bind(info.state.to_string())
        .bind(info.close_status.to_string())
        .bind(serde_json::to_string(&record)?)
        .bind(millis(info.last_updated))
        .bind(&info.domain_id)
        .bind(&info.workflow_id)
        .bind(&info.run_id)
        .bind(request.condition)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() != 1 {
            return Err(EngineError::Conflict);
        }

        // Keep the current-run index's lifecycle columns in sync.
        sqlx::query(
            r#"
            UPDATE current_executions SET state = ?, close_status = ?
            WHERE domain_id = ? AND workflow_id = ? AND run_id = ?
            "#,
        )
        .bind(info.state.to_string())
        .bind(info.close_status.to_string())
        .bind(&info.domain_id)
        .bind(&info.workflow_id)
        .bind(&info.run_id)
        .execute(&mut *tx)
        .await?;

        Self::insert_tasks_in_tx(
            &mut tx,
            &request.transfer_tasks,
            &request.timer_tasks,
            &request.replication_tasks,
        )
        .await?;

        if let Some(create) = &request.continue_as_new {
            Self::create_in_tx(&mut tx, create).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_workflow_execution(
        &self,
        domain_id: &str,
        workflow_id: &str,
        run_id: &str,
    ) -> Result<()> {
        sqlx::query(
            "DELETE FROM executions WHERE domain_id = ? AND workflow_id = ? AND run_id = ?",
        )
        .bind(domain_id)
        .bind(workflow_id)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_current_execution(
        &self,
        domain_id: &str,
        workflow_id: &str,
    ) -> Result<CurrentExecutionRecord> {
        let row = sqlx::query(
            r#"
            SELECT run_id, create_request_id, state, close_status
            FROM current_executions
            WHERE domain_id = ? AND workflow_id = ?
            "#,
        )
        .bind(domain_id)
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            EngineError::not_exists(format!("Workflow '{}' has no current run", workflow_id))
        })?;
        Ok(CurrentExecutionRecord {
            run_id: row.get("run_id"),
            create_request_id: row.get("create_request_id"),
            state: parse_enum(row.get::<String, _>("state").as_str())?,
            close_status: parse_enum(row.get::<String, _>("close_status").as_str())?,
        })
    }

    async fn get_transfer_tasks(
        &self,
        read_level: i64,
        max_read_level: i64,
        batch_size: usize,
    ) -> Result<Vec<TransferTask>> {
        let rows = sqlx::query(
            r#"
            SELECT payload FROM transfer_tasks
            WHERE task_id > ? AND task_id <= ?
            ORDER BY task_id
            LIMIT ?
            "#,
        )
        .bind(read_level)
        .bind(max_read_level)
        .bind(batch_size as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| parse_payload(row.get::<String, _>("payload").as_str()))
            .collect()
    }

    async fn complete_transfer_task(&self, task_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM transfer_tasks WHERE task_id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_timer_tasks(
        &self,
        due_before: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<Vec<TimerTask>> {
        let rows = sqlx::query(
            r#"
            SELECT payload FROM timer_tasks
            WHERE visibility_ms <= ?
            ORDER BY visibility_ms, task_id
            LIMIT ?
            "#,
        )
        .bind(millis(due_before))
        .bind(batch_size as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| parse_payload(row.get::<String, _>("payload").as_str()))
            .collect()
    }

    async fn next_timer_fire_time(&self) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT MIN(visibility_ms) AS next_ms FROM timer_tasks")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<Option<i64>, _>("next_ms").map(from_millis))
    }

    async fn complete_timer_task(&self, task_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM timer_tasks WHERE task_id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_replication_tasks(
        &self,
        read_level: i64,
        batch_size: usize,
    ) -> Result<Vec<ReplicationTask>> {
        let rows = sqlx::query(
            r#"
            SELECT payload FROM replication_tasks
            WHERE task_id > ?
            ORDER BY task_id
            LIMIT ?
            "#,
        )
        .bind(read_level)
        .bind(batch_size as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| parse_payload(row.get::<String, _>("payload").as_str()))
            .collect()
    }

    async fn complete_replication_task(&self, task_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM replication_tasks WHERE task_id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn append_history_events(&self, request: &AppendHistoryEventsRequest) -> Result<()> {
        let workflow = &request.workflow;
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            r#"
            SELECT transaction_id FROM history_events
            WHERE domain_id = ? AND workflow_id = ? AND run_id = ? AND first_event_id = ?
            "#,
        )
        .bind(&workflow.domain_id)
        .bind(&workflow.workflow_id)
        .bind(&workflow.run_id)
        .bind(request.first_event_id)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(row) = existing {
            // A batch key may only be replaced by a higher transaction ID.
            if request.transaction_id <= row.get::<i64, _>("transaction_id") {
                return Err(EngineError::Conflict);
            }
        }

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO history_events
                (domain_id, workflow_id, run_id, first_event_id, transaction_id, events)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&workflow.domain_id)
        .bind(&workflow.workflow_id)
        .bind(&workflow.run_id)
        .bind(request.first_event_id)
        .bind(request.transaction_id)
        .bind(serde_json::to_string(&request.events)?)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_workflow_execution_history(
        &self,
        workflow: &WorkflowRun,
        first_event_id: i64,
        next_event_id: i64,
    ) -> Result<Vec<HistoryEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT events FROM history_events
            WHERE domain_id = ? AND workflow_id = ? AND run_id = ?
            ORDER BY first_event_id
            "#,
        )
        .bind(&workflow.domain_id)
        .bind(&workflow.workflow_id)
        .bind(&workflow.run_id)
        .fetch_all(&self.pool)
        .await?;
        if rows.is_empty() {
            return Err(EngineError::not_exists(format!(
                "No history for run '{}'",
                workflow.run_id
            )));
        }

        let mut events = Vec::new();
        for row in rows {
            let batch: Vec<HistoryEvent> = parse_payload(row.get::<String, _>("events").as_str())?;
            events.extend(
                batch
                    .into_iter()
                    .filter(|event| {
                        event.event_id >= first_event_id && event.event_id < next_event_id
                    }),
            );
        }
        Ok(events)
    }

    async fn delete_workflow_execution_history(&self, workflow: &WorkflowRun) -> Result<()> {
        sqlx::query(
            "DELETE FROM history_events WHERE domain_id = ? AND workflow_id = ? AND run_id = ?",
        )
        .bind(&workflow.domain_id)
        .bind(&workflow.workflow_id)
        .bind(&workflow.run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl VisibilityStore for SqliteHistoryStore {
    async fn record_workflow_execution_started(
        &self,
        record: &VisibilityStartRecord,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO visibility_open
                (domain_id, workflow_id, run_id, workflow_type, start_time_ms)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.workflow.domain_id)
        .bind(&record.workflow.workflow_id)
        .bind(&record.workflow.run_id)
        .bind(&record.workflow_type)
        .bind(millis(record.start_time))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_workflow_execution_closed(
        &self,
        record: &VisibilityCloseRecord,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM visibility_open WHERE domain_id = ? AND workflow_id = ? AND run_id = ?",
        )
        .bind(&record.workflow.domain_id)
        .bind(&record.workflow.workflow_id)
        .bind(&record.workflow.run_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO visibility_closed
                (domain_id, workflow_id, run_id, workflow_type, start_time_ms,
                 close_time_ms, close_status, history_length, retention_secs)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.workflow.domain_id)
        .bind(&record.workflow.workflow_id)
        .bind(&record.workflow.run_id)
        .bind(&record.workflow_type)
        .bind(millis(record.start_time))
        .bind(millis(record.close_time))
        .bind(record.status.to_string())
        .bind(record.history_length)
        .bind(record.retention_secs)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }
}
