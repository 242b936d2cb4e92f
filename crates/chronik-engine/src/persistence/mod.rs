// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for chronik-engine.
//!
//! Three store traits cover the engine's durable state: the execution store
//! (mutable-state rows, current-run index, the three per-shard task logs),
//! the history store (append-only event batches) and the visibility store
//! (open/closed run records for listing).
//!
//! The execution store's update is the engine's linearization point: the
//! mutable-state row, the pending-info upserts/deletes and the task-queue
//! writes must commit atomically under the `condition` compare-and-swap on
//! `next_event_id`. A CAS miss is reported as [`EngineError::Conflict`];
//! duplicate creates as [`EngineError::WorkflowAlreadyStarted`] carrying the
//! prior run's identity.

pub mod memory;
pub mod sqlite;

pub use self::memory::MemoryStore;
pub use self::sqlite::SqliteHistoryStore;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use chronik_types::event::HistoryEvent;
use chronik_types::task::{ReplicationTask, TimerTask, TransferTask};
use chronik_types::{CloseStatus, WorkflowRun, WorkflowState, EMPTY_EVENT_ID};

use crate::config::Config;
use crate::error::{EngineError, Result};

/// Core execution row of one run: identity, lifecycle, decision bookkeeping.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ExecutionInfo {
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: String,
    pub parent_domain_id: Option<String>,
    pub parent_workflow_id: Option<String>,
    pub parent_run_id: Option<String>,
    /// Initiated-event ID in the parent's history, when started as a child.
    pub initiated_id: i64,
    pub task_list: String,
    pub workflow_type: String,
    pub workflow_timeout_secs: i32,
    pub decision_timeout_secs: i32,
    pub state: WorkflowState,
    pub close_status: CloseStatus,
    /// Next event ID to be assigned; the optimistic-concurrency condition.
    pub next_event_id: i64,
    /// First event ID of the most recently appended batch.
    pub last_first_event_id: i64,
    /// Started-event ID of the last completed decision.
    pub last_processed_event: i64,
    pub start_timestamp: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    /// Request ID the run was created with, for start deduplication.
    pub create_request_id: String,
    pub sticky_task_list: String,
    pub sticky_schedule_to_start_timeout_secs: i32,
    /// Scheduled-event ID of the pending decision, or EMPTY_EVENT_ID.
    pub decision_schedule_id: i64,
    /// Started-event ID of the pending decision, or EMPTY_EVENT_ID.
    pub decision_started_id: i64,
    /// Poll request ID the pending decision was started with.
    pub decision_request_id: String,
    /// Retry attempt of the pending decision; zero for first attempts.
    pub decision_attempt: i64,
    pub cancel_requested: bool,
    /// Request ID of the accepted cancellation request.
    pub cancel_request_id: Option<String>,
    /// Opaque workflow-owned blob set on decision completion.
    pub execution_context: Option<Vec<u8>>,
}

impl ExecutionInfo {
    /// Run identity triple of this row.
    pub fn workflow_run(&self) -> WorkflowRun {
        WorkflowRun::new(&self.domain_id, &self.workflow_id, &self.run_id)
    }

    /// Whether the run has not reached a terminal event.
    pub fn is_running(&self) -> bool {
        self.state == WorkflowState::Running
    }

    /// Whether a decision task is scheduled or started.
    pub fn has_pending_decision(&self) -> bool {
        self.decision_schedule_id != EMPTY_EVENT_ID
    }

    /// Whether this run was started as a child workflow.
    pub fn has_parent(&self) -> bool {
        self.parent_workflow_id.is_some()
    }
}

/// One pending activity keyed by its scheduled-event ID.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ActivityInfo {
    pub schedule_id: i64,
    /// The ActivityTaskScheduled event, kept for worker dispatch payloads.
    pub scheduled_event: HistoryEvent,
    /// Started-event ID, or EMPTY_EVENT_ID while scheduled only.
    pub started_id: i64,
    /// The ActivityTaskStarted event once started.
    pub started_event: Option<HistoryEvent>,
    pub activity_id: String,
    /// Poll request ID the activity was started with.
    pub request_id: String,
    pub schedule_to_close_timeout_secs: i32,
    pub schedule_to_start_timeout_secs: i32,
    pub start_to_close_timeout_secs: i32,
    pub heartbeat_timeout_secs: i32,
    pub cancel_requested: bool,
    /// Event ID of the ActivityTaskCancelRequested event.
    pub cancel_request_event_id: i64,
    /// Latest heartbeat progress payload.
    pub details: Option<Vec<u8>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// One pending user timer keyed by its workflow-scoped timer ID.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct TimerInfo {
    pub timer_id: String,
    pub started_event_id: i64,
    pub expiry: DateTime<Utc>,
}

/// One pending child execution keyed by its initiated-event ID.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ChildExecutionInfo {
    pub initiated_id: i64,
    /// The StartChildWorkflowExecutionInitiated event, kept for dispatch.
    pub initiated_event: HistoryEvent,
    /// Started-event ID, or EMPTY_EVENT_ID until the child run is created.
    pub started_id: i64,
    /// Run ID of the created child.
    pub started_run_id: Option<String>,
    /// Request ID the child create is deduplicated on.
    pub create_request_id: String,
}

/// One pending external-cancel request keyed by its initiated-event ID.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct RequestCancelInfo {
    pub initiated_id: i64,
    /// Request ID for target-side deduplication.
    pub cancel_request_id: String,
}

/// One pending external signal keyed by its initiated-event ID.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct SignalInfo {
    pub initiated_id: i64,
    /// Request ID for target-side deduplication.
    pub signal_request_id: String,
    pub signal_name: String,
    pub input: Option<Vec<u8>>,
}

/// Per-run multi-cluster replication bookkeeping.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ReplicationState {
    pub current_version: i64,
    pub start_version: i64,
    pub last_write_version: i64,
    pub last_write_event_id: i64,
}

/// Full mutable-state snapshot of one run as stored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct WorkflowMutableStateRecord {
    pub execution_info: ExecutionInfo,
    pub activity_infos: HashMap<i64, ActivityInfo>,
    pub timer_infos: HashMap<String, TimerInfo>,
    pub child_infos: HashMap<i64, ChildExecutionInfo>,
    pub cancel_infos: HashMap<i64, RequestCancelInfo>,
    pub signal_infos: HashMap<i64, SignalInfo>,
    pub signal_requested_ids: HashSet<String>,
    /// Events produced while a decision was in flight, not yet in history.
    pub buffered_events: Vec<HistoryEvent>,
    pub replication_state: Option<ReplicationState>,
}

/// Current-run index entry for one workflow ID.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct CurrentExecutionRecord {
    pub run_id: String,
    pub create_request_id: String,
    pub state: WorkflowState,
    pub close_status: CloseStatus,
}

/// Atomic bundle creating one run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreateWorkflowExecutionRequest {
    /// Client idempotency key; equals the snapshot's `create_request_id`.
    pub request_id: String,
    /// Initial mutable state of the run.
    pub snapshot: WorkflowMutableStateRecord,
    /// Transfer tasks committed with the create.
    pub transfer_tasks: Vec<TransferTask>,
    /// Timer tasks committed with the create.
    pub timer_tasks: Vec<TimerTask>,
    /// Replication tasks committed with the create.
    pub replication_tasks: Vec<ReplicationTask>,
    /// When true the create replaces the current run pointed at by
    /// `previous_run_id` instead of requiring no current run.
    pub continue_as_new: bool,
    /// Run the current-run index must point at for a continue-as-new create
    /// to succeed.
    pub previous_run_id: Option<String>,
}

/// Atomic bundle updating one run under the CAS condition.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct UpdateWorkflowExecutionRequest {
    pub execution_info: ExecutionInfo,
    pub replication_state: Option<ReplicationState>,
    /// Expected stored `next_event_id`; mismatch fails with `Conflict`.
    pub condition: i64,
    pub transfer_tasks: Vec<TransferTask>,
    pub timer_tasks: Vec<TimerTask>,
    pub replication_tasks: Vec<ReplicationTask>,
    pub upsert_activity_infos: Vec<ActivityInfo>,
    pub delete_activity_infos: Vec<i64>,
    pub upsert_timer_infos: Vec<TimerInfo>,
    pub delete_timer_infos: Vec<String>,
    pub upsert_child_infos: Vec<ChildExecutionInfo>,
    pub delete_child_info: Option<i64>,
    pub upsert_cancel_infos: Vec<RequestCancelInfo>,
    pub delete_cancel_info: Option<i64>,
    pub upsert_signal_infos: Vec<SignalInfo>,
    pub delete_signal_info: Option<i64>,
    pub upsert_signal_requested_ids: Vec<String>,
    pub delete_signal_requested_id: Option<String>,
    pub new_buffered_events: Vec<HistoryEvent>,
    pub clear_buffered_events: bool,
    /// Successor-run create committed atomically with this update.
    pub continue_as_new: Option<Box<CreateWorkflowExecutionRequest>>,
}

impl Default for ExecutionInfo {
    fn default() -> Self {
        Self {
            domain_id: String::new(),
            workflow_id: String::new(),
            run_id: String::new(),
            parent_domain_id: None,
            parent_workflow_id: None,
            parent_run_id: None,
            initiated_id: EMPTY_EVENT_ID,
            task_list: String::new(),
            workflow_type: String::new(),
            workflow_timeout_secs: 0,
            decision_timeout_secs: 0,
            state: WorkflowState::Running,
            close_status: CloseStatus::None,
            next_event_id: chronik_types::FIRST_EVENT_ID,
            last_first_event_id: EMPTY_EVENT_ID,
            last_processed_event: EMPTY_EVENT_ID,
            start_timestamp: DateTime::<Utc>::MIN_UTC,
            last_updated: DateTime::<Utc>::MIN_UTC,
            create_request_id: String::new(),
            sticky_task_list: String::new(),
            sticky_schedule_to_start_timeout_secs: 0,
            decision_schedule_id: EMPTY_EVENT_ID,
            decision_started_id: EMPTY_EVENT_ID,
            decision_request_id: String::new(),
            decision_attempt: 0,
            cancel_requested: false,
            cancel_request_id: None,
            execution_context: None,
        }
    }
}

/// Append request for one history-event batch.
///
/// Batches are keyed by `(run_id, first_event_id)`; re-appending the same key
/// with a higher `transaction_id` replaces the batch, a lower or equal one
/// fails with `Conflict`. A brand-new run may use transaction ID zero since
/// its fresh run ID cannot collide.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct AppendHistoryEventsRequest {
    pub workflow: WorkflowRun,
    pub first_event_id: i64,
    pub transaction_id: i64,
    pub events: Vec<HistoryEvent>,
}

/// Open-run visibility record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct VisibilityStartRecord {
    pub workflow: WorkflowRun,
    pub workflow_type: String,
    pub start_time: DateTime<Utc>,
}

/// Closed-run visibility record; `retention_secs` bounds how long the store
/// keeps it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct VisibilityCloseRecord {
    pub workflow: WorkflowRun,
    pub workflow_type: String,
    pub start_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub status: CloseStatus,
    pub history_length: i64,
    pub retention_secs: i64,
}

/// Execution store: mutable-state rows, current-run index, task logs.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Create a run with its initial task bundle. Fails with
    /// `WorkflowAlreadyStarted` when the workflow ID already has a current
    /// run (unless `continue_as_new` replaces exactly `previous_run_id`).
    async fn create_workflow_execution(
        &self,
        request: &CreateWorkflowExecutionRequest,
    ) -> Result<()>;

    /// Load one run's full mutable state. `EntityNotExists` when absent.
    async fn get_workflow_execution(
        &self,
        domain_id: &str,
        workflow_id: &str,
        run_id: &str,
    ) -> Result<WorkflowMutableStateRecord>;

    /// Apply an update bundle under the CAS condition. `Conflict` on miss.
    async fn update_workflow_execution(
        &self,
        request: &UpdateWorkflowExecutionRequest,
    ) -> Result<()>;

    /// Drop one run's mutable state (retention cleanup).
    async fn delete_workflow_execution(
        &self,
        domain_id: &str,
        workflow_id: &str,
        run_id: &str,
    ) -> Result<()>;

    /// Resolve the current run of a workflow ID. `EntityNotExists` when the
    /// workflow has never run.
    async fn get_current_execution(
        &self,
        domain_id: &str,
        workflow_id: &str,
    ) -> Result<CurrentExecutionRecord>;

    /// Read transfer tasks with IDs in `(read_level, max_read_level]`,
    /// ascending, up to `batch_size`.
    async fn get_transfer_tasks(
        &self,
        read_level: i64,
        max_read_level: i64,
        batch_size: usize,
    ) -> Result<Vec<TransferTask>>;

    /// Remove one acknowledged transfer task.
    async fn complete_transfer_task(&self, task_id: i64) -> Result<()>;

    /// Read timer tasks due at or before `due_before`, ordered by
    /// (fire time, task ID), up to `batch_size`.
    async fn get_timer_tasks(
        &self,
        due_before: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<Vec<TimerTask>>;

    /// Earliest pending timer fire time, for the processor's wake deadline.
    async fn next_timer_fire_time(&self) -> Result<Option<DateTime<Utc>>>;

    /// Remove one fired timer task.
    async fn complete_timer_task(&self, task_id: i64) -> Result<()>;

    /// Read replication tasks with IDs above `read_level`, ascending.
    async fn get_replication_tasks(
        &self,
        read_level: i64,
        batch_size: usize,
    ) -> Result<Vec<ReplicationTask>>;

    /// Remove one published replication task.
    async fn complete_replication_task(&self, task_id: i64) -> Result<()>;
}

/// History store: append-only per-run event batches.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append one batch. See [`AppendHistoryEventsRequest`] for the
    /// `(run_id, first_event_id, transaction_id)` keying contract.
    async fn append_history_events(&self, request: &AppendHistoryEventsRequest) -> Result<()>;

    /// Read events with IDs in `[first_event_id, next_event_id)`.
    async fn get_workflow_execution_history(
        &self,
        workflow: &WorkflowRun,
        first_event_id: i64,
        next_event_id: i64,
    ) -> Result<Vec<HistoryEvent>>;

    /// Drop a run's entire history.
    async fn delete_workflow_execution_history(&self, workflow: &WorkflowRun) -> Result<()>;
}

/// Visibility store: open/closed run records for listing surfaces.
#[async_trait]
pub trait VisibilityStore: Send + Sync {
    /// Record a run as open.
    async fn record_workflow_execution_started(
        &self,
        record: &VisibilityStartRecord,
    ) -> Result<()>;

    /// Record a run as closed, with its retention.
    async fn record_workflow_execution_closed(&self, record: &VisibilityCloseRecord)
        -> Result<()>;
}

/// Apply an update bundle's pending-info deltas to a stored record. Both
/// backends go through this so delta semantics cannot drift between them.
/// The caller has already verified the CAS condition.
pub(crate) fn apply_update_to_record(
    record: &mut WorkflowMutableStateRecord,
    request: &UpdateWorkflowExecutionRequest,
) {
    record.execution_info = request.execution_info.clone();
    record.replication_state = request.replication_state;

    for activity in &request.upsert_activity_infos {
        record
            .activity_infos
            .insert(activity.schedule_id, activity.clone());
    }
    for schedule_id in &request.delete_activity_infos {
        record.activity_infos.remove(schedule_id);
    }
    for timer in &request.upsert_timer_infos {
        record.timer_infos.insert(timer.timer_id.clone(), timer.clone());
    }
    for timer_id in &request.delete_timer_infos {
        record.timer_infos.remove(timer_id);
    }
    for child in &request.upsert_child_infos {
        record.child_infos.insert(child.initiated_id, child.clone());
    }
    if let Some(initiated_id) = request.delete_child_info {
        record.child_infos.remove(&initiated_id);
    }
    for cancel in &request.upsert_cancel_infos {
        record.cancel_infos.insert(cancel.initiated_id, cancel.clone());
    }
    if let Some(initiated_id) = request.delete_cancel_info {
        record.cancel_infos.remove(&initiated_id);
    }
    for signal in &request.upsert_signal_infos {
        record.signal_infos.insert(signal.initiated_id, signal.clone());
    }
    if let Some(initiated_id) = request.delete_signal_info {
        record.signal_infos.remove(&initiated_id);
    }
    for request_id in &request.upsert_signal_requested_ids {
        record.signal_requested_ids.insert(request_id.clone());
    }
    if let Some(request_id) = &request.delete_signal_requested_id {
        record.signal_requested_ids.remove(request_id);
    }
    if request.clear_buffered_events {
        record.buffered_events.clear();
    }
    record
        .buffered_events
        .extend(request.new_buffered_events.iter().cloned());
}

/// Retry policy of the `…_with_retry` wrappers around store calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: usize,
    /// Backoff before the first retry; doubles per attempt, with jitter.
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    /// Policy from the engine configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.store_retry_count,
            initial_backoff: config.store_retry_initial_backoff,
        }
    }
}

/// Run a store operation, retrying transient failures with exponential
/// backoff. Non-transient errors (including `Conflict`) return immediately.
pub async fn with_retry<T, Fut>(policy: RetryPolicy, mut op: impl FnMut() -> Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = policy.initial_backoff;
    let mut attempt = 0;
    loop {
        match op().await {
            Err(err) if err.is_transient() && attempt + 1 < policy.max_attempts => {
                attempt += 1;
                let jitter_ms = {
                    let half = (backoff.as_millis() as u64 / 2).max(1);
                    rand::thread_rng().gen_range(0..half)
                };
                tokio::time::sleep(backoff + Duration::from_millis(jitter_ms)).await;
                backoff = backoff.saturating_mul(2);
            }
            other => return other,
        }
    }
}

/// Convert a store-level already-started payload into the engine error.
pub fn already_started_error(current: &CurrentExecutionRecord) -> EngineError {
    EngineError::WorkflowAlreadyStarted {
        run_id: current.run_id.clone(),
        state: current.state,
        close_status: current.close_status,
        start_request_id: current.create_request_id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_with_retry_retries_transient_only() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
        };

        let calls = AtomicUsize::new(0);
        let result: Result<u32> = with_retry(policy, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(EngineError::transient_store("get", "io timeout"))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let calls = AtomicUsize::new(0);
        let result: Result<u32> = with_retry(policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::Conflict) }
        })
        .await;
        assert!(matches!(result, Err(EngineError::Conflict)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_gives_up_after_budget() {
        let policy = RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
        };
        let calls = AtomicUsize::new(0);
        let result: Result<u32> = with_retry(policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::transient_store("put", "io")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
