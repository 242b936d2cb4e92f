// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory persistence backend.
//!
//! One [`MemoryStore`] implements all three store traits over a single mutex,
//! which makes every create/update bundle trivially atomic. Used for
//! embedded single-process deployments and throughout the test suite.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use chronik_types::event::HistoryEvent;
use chronik_types::task::{ReplicationTask, TimerTask, TransferTask};
use chronik_types::{WorkflowRun, WorkflowState};

use crate::error::{EngineError, Result};

use super::{
    already_started_error, AppendHistoryEventsRequest, CreateWorkflowExecutionRequest,
    CurrentExecutionRecord, ExecutionStore, HistoryStore, UpdateWorkflowExecutionRequest,
    VisibilityCloseRecord, VisibilityStartRecord, VisibilityStore, WorkflowMutableStateRecord,
};

type RunKey = (String, String, String);
type WorkflowKey = (String, String);

fn run_key(workflow: &WorkflowRun) -> RunKey {
    (
        workflow.domain_id.clone(),
        workflow.workflow_id.clone(),
        workflow.run_id.clone(),
    )
}

#[derive(Default)]
struct MemoryState {
    executions: HashMap<RunKey, WorkflowMutableStateRecord>,
    current: HashMap<WorkflowKey, CurrentExecutionRecord>,
    transfer_tasks: BTreeMap<i64, TransferTask>,
    timer_tasks: BTreeMap<i64, TimerTask>,
    replication_tasks: BTreeMap<i64, ReplicationTask>,
    /// Per run: first_event_id -> (transaction_id, batch).
    history: HashMap<RunKey, BTreeMap<i64, (i64, Vec<HistoryEvent>)>>,
    visibility_open: HashMap<RunKey, VisibilityStartRecord>,
    visibility_closed: HashMap<RunKey, VisibilityCloseRecord>,
}

impl MemoryState {
    fn apply_create(&mut self, request: &CreateWorkflowExecutionRequest) -> Result<()> {
        let info = &request.snapshot.execution_info;
        let workflow_key = (info.domain_id.clone(), info.workflow_id.clone());

        if let Some(current) = self.current.get(&workflow_key) {
            if !request.continue_as_new {
                return Err(already_started_error(current));
            }
            if request.previous_run_id.as_deref() != Some(current.run_id.as_str()) {
                return Err(EngineError::Conflict);
            }
        }

        let key = (
            info.domain_id.clone(),
            info.workflow_id.clone(),
            info.run_id.clone(),
        );
        self.current.insert(
            workflow_key,
            CurrentExecutionRecord {
                run_id: info.run_id.clone(),
                create_request_id: request.request_id.clone(),
                state: info.state,
                close_status: info.close_status,
            },
        );
        self.executions.insert(key, request.snapshot.clone());
        self.enqueue_tasks(
            &request.transfer_tasks,
            &request.timer_tasks,
            &request.replication_tasks,
        );
        Ok(())
    }

    fn enqueue_tasks(
        &mut self,
        transfer: &[TransferTask],
        timer: &[TimerTask],
        replication: &[ReplicationTask],
    ) {
        for task in transfer {
            self.transfer_tasks.insert(task.task_id, task.clone());
        }
        for task in timer {
            self.timer_tasks.insert(task.task_id, task.clone());
        }
        for task in replication {
            self.replication_tasks.insert(task.task_id, task.clone());
        }
    }
}

/// In-memory implementation of the execution, history and visibility stores.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn create_workflow_execution(
        &self,
        request: &CreateWorkflowExecutionRequest,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.apply_create(request)
    }

    async fn get_workflow_execution(
        &self,
        domain_id: &str,
        workflow_id: &str,
        run_id: &str,
    ) -> Result<WorkflowMutableStateRecord> {
        let state = self.state.lock().unwrap();
        state
            .executions
            .get(&(
                domain_id.to_string(),
                workflow_id.to_string(),
                run_id.to_string(),
            ))
            .cloned()
            .ok_or_else(|| {
                EngineError::not_exists(format!("Workflow execution '{}' not found", workflow_id))
            })
    }

    async fn update_workflow_execution(
        &self,
        request: &UpdateWorkflowExecutionRequest,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let info = &request.execution_info;
        let key = (
            info.domain_id.clone(),
            info.workflow_id.clone(),
            info.run_id.clone(),
        );

        {
            let record = state.executions.get_mut(&key).ok_or_else(|| {
                EngineError::not_exists(format!(
                    "Workflow execution '{}' not found",
                    info.workflow_id
                ))
            })?;
            if record.execution_info.next_event_id != request.condition {
                return Err(EngineError::Conflict);
            }
            super::apply_update_to_record(record, request);
        }

        // Keep the current-run index's lifecycle columns in sync.
        let workflow_key = (info.domain_id.clone(), info.workflow_id.clone());
        if let Some(current) = state.current.get_mut(&workflow_key) {
            if current.run_id == info.run_id {
                current.state = info.state;
                current.close_status = info.close_status;
            }
        }

        state.enqueue_tasks(
            &request.transfer_tasks,
            &request.timer_tasks,
            &request.replication_tasks,
        );

        if let Some(create) = &request.continue_as_new {
            state.apply_create(create)?;
        }
        Ok(())
    }

    async fn delete_workflow_execution(
        &self,
        domain_id: &str,
        workflow_id: &str,
        run_id: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.executions.remove(&(
            domain_id.to_string(),
            workflow_id.to_string(),
            run_id.to_string(),
        ));
        Ok(())
    }

    async fn get_current_execution(
        &self,
        domain_id: &str,
        workflow_id: &str,
    ) -> Result<CurrentExecutionRecord> {
        let state = self.state.lock().unwrap();
        state
            .current
            .get(&(domain_id.to_string(), workflow_id.to_string()))
            .cloned()
            .ok_or_else(|| {
                EngineError::not_exists(format!("Workflow '{}' has no current run", workflow_id))
            })
    }

    async fn get_transfer_tasks(
        &self,
        read_level: i64,
        max_read_level: i64,
        batch_size: usize,
    ) -> Result<Vec<TransferTask>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .transfer_tasks
            .range(read_level + 1..=max_read_level)
            .take(batch_size)
            .map(|(_, task)| task.clone())
            .collect())
    }

    async fn complete_transfer_task(&self, task_id: i64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.transfer_tasks.remove(&task_id);
        Ok(())
    }

    async fn get_timer_tasks(
        &self,
        due_before: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<Vec<TimerTask>> {
        let state = self.state.lock().unwrap();
        let mut due: Vec<TimerTask> = state
            .timer_tasks
            .values()
            .filter(|task| task.visibility_timestamp <= due_before)
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            (a.visibility_timestamp, a.task_id).cmp(&(b.visibility_timestamp, b.task_id))
        });
        due.truncate(batch_size);
        Ok(due)
    }

    async fn next_timer_fire_time(&self) -> Result<Option<DateTime<Utc>>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .timer_tasks
            .values()
            .map(|task| task.visibility_timestamp)
            .min())
    }

    async fn complete_timer_task(&self, task_id: i64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.timer_tasks.remove(&task_id);
        Ok(())
    }

    async fn get_replication_tasks(
        &self,
        read_level: i64,
        batch_size: usize,
    ) -> Result<Vec<ReplicationTask>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .replication_tasks
            .range(read_level + 1..)
            .take(batch_size)
            .map(|(_, task)| task.clone())
            .collect())
    }

    async fn complete_replication_task(&self, task_id: i64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.replication_tasks.remove(&task_id);
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for MemoryStore {
    async fn append_history_events(&self, request: &AppendHistoryEventsRequest) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let batches = state.history.entry(run_key(&request.workflow)).or_default();
        if let Some((existing_txn, _)) = batches.get(&request.first_event_id) {
            if request.transaction_id <= *existing_txn {
                return Err(EngineError::Conflict);
            }
        }
        batches.insert(
            request.first_event_id,
            (request.transaction_id, request.events.clone()),
        );
        Ok(())
    }

    async fn get_workflow_execution_history(
        &self,
        workflow: &WorkflowRun,
        first_event_id: i64,
        next_event_id: i64,
    ) -> Result<Vec<HistoryEvent>> {
        let state = self.state.lock().unwrap();
        let batches = state.history.get(&run_key(workflow)).ok_or_else(|| {
            EngineError::not_exists(format!("No history for run '{}'", workflow.run_id))
        })?;
        Ok(batches
            .values()
            .flat_map(|(_, events)| events.iter())
            .filter(|event| event.event_id >= first_event_id && event.event_id < next_event_id)
            .cloned()
            .collect())
    }

    async fn delete_workflow_execution_history(&self, workflow: &WorkflowRun) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.history.remove(&run_key(workflow));
        Ok(())
    }
}

#[async_trait]
impl VisibilityStore for MemoryStore {
    async fn record_workflow_execution_started(
        &self,
        record: &VisibilityStartRecord,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .visibility_open
            .insert(run_key(&record.workflow), record.clone());
        Ok(())
    }

    async fn record_workflow_execution_closed(
        &self,
        record: &VisibilityCloseRecord,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let key = run_key(&record.workflow);
        state.visibility_open.remove(&key);
        state.visibility_closed.insert(key, record.clone());
        Ok(())
    }
}

impl MemoryStore {
    /// Closed-run visibility record for one run, for assertions in tests and
    /// embedded listing surfaces.
    pub fn closed_visibility_record(
        &self,
        workflow: &WorkflowRun,
    ) -> Option<VisibilityCloseRecord> {
        let state = self.state.lock().unwrap();
        state.visibility_closed.get(&run_key(workflow)).cloned()
    }

    /// Whether the current-run index still points at a running execution for
    /// the workflow ID.
    pub fn has_running_execution(&self, domain_id: &str, workflow_id: &str) -> bool {
        let state = self.state.lock().unwrap();
        state
            .current
            .get(&(domain_id.to_string(), workflow_id.to_string()))
            .map(|current| current.state == WorkflowState::Running)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronik_types::event::{EventAttributes, WorkflowExecutionStartedAttributes};
    use chronik_types::{CloseStatus, FIRST_EVENT_ID};

    use crate::persistence::ExecutionInfo;

    fn started_event(event_id: i64) -> HistoryEvent {
        HistoryEvent {
            event_id,
            timestamp: Utc::now(),
            attributes: EventAttributes::WorkflowExecutionStarted(
                WorkflowExecutionStartedAttributes {
                    workflow_type: "t".to_string(),
                    task_list: "tl".to_string(),
                    input: None,
                    execution_timeout_secs: 10,
                    decision_timeout_secs: 10,
                    identity: "i".to_string(),
                    parent_workflow_id: None,
                    parent_run_id: None,
                    continued_from_run_id: None,
                },
            ),
        }
    }

    fn snapshot(domain_id: &str, workflow_id: &str, run_id: &str) -> WorkflowMutableStateRecord {
        WorkflowMutableStateRecord {
            execution_info: ExecutionInfo {
                domain_id: domain_id.to_string(),
                workflow_id: workflow_id.to_string(),
                run_id: run_id.to_string(),
                next_event_id: 3,
                create_request_id: "req-1".to_string(),
                ..ExecutionInfo::default()
            },
            activity_infos: HashMap::new(),
            timer_infos: HashMap::new(),
            child_infos: HashMap::new(),
            cancel_infos: HashMap::new(),
            signal_infos: HashMap::new(),
            signal_requested_ids: Default::default(),
            buffered_events: Vec::new(),
            replication_state: None,
        }
    }

    fn create_request(run_id: &str) -> CreateWorkflowExecutionRequest {
        CreateWorkflowExecutionRequest {
            request_id: "req-1".to_string(),
            snapshot: snapshot("d1", "wf1", run_id),
            transfer_tasks: Vec::new(),
            timer_tasks: Vec::new(),
            replication_tasks: Vec::new(),
            continue_as_new: false,
            previous_run_id: None,
        }
    }

    #[tokio::test]
    async fn test_duplicate_create_reports_prior_run() {
        let store = MemoryStore::new();
        store
            .create_workflow_execution(&create_request("run-1"))
            .await
            .unwrap();

        let err = store
            .create_workflow_execution(&create_request("run-2"))
            .await
            .unwrap_err();
        match err {
            EngineError::WorkflowAlreadyStarted {
                run_id,
                start_request_id,
                ..
            } => {
                assert_eq!(run_id, "run-1");
                assert_eq!(start_request_id, "req-1");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_update_cas_conflict() {
        let store = MemoryStore::new();
        store
            .create_workflow_execution(&create_request("run-1"))
            .await
            .unwrap();

        let record = store
            .get_workflow_execution("d1", "wf1", "run-1")
            .await
            .unwrap();
        let mut info = record.execution_info.clone();
        info.next_event_id = 5;

        let ok = UpdateWorkflowExecutionRequest {
            execution_info: info.clone(),
            condition: 3,
            ..Default::default()
        };
        store.update_workflow_execution(&ok).await.unwrap();

        let stale = UpdateWorkflowExecutionRequest {
            execution_info: info,
            condition: 3,
            ..Default::default()
        };
        assert!(matches!(
            store.update_workflow_execution(&stale).await,
            Err(EngineError::Conflict)
        ));
    }

    #[tokio::test]
    async fn test_continue_as_new_swaps_current_run() {
        let store = MemoryStore::new();
        store
            .create_workflow_execution(&create_request("run-1"))
            .await
            .unwrap();

        let record = store
            .get_workflow_execution("d1", "wf1", "run-1")
            .await
            .unwrap();
        let mut info = record.execution_info.clone();
        info.state = WorkflowState::Completed;
        info.close_status = CloseStatus::Completed;
        info.next_event_id = 5;

        let mut new_run = create_request("run-2");
        new_run.continue_as_new = true;
        new_run.previous_run_id = Some("run-1".to_string());

        let update = UpdateWorkflowExecutionRequest {
            execution_info: info,
            condition: 3,
            continue_as_new: Some(Box::new(new_run)),
            ..Default::default()
        };
        store.update_workflow_execution(&update).await.unwrap();

        let current = store.get_current_execution("d1", "wf1").await.unwrap();
        assert_eq!(current.run_id, "run-2");
        assert_eq!(current.state, WorkflowState::Running);
    }

    #[tokio::test]
    async fn test_history_append_transaction_ordering() {
        let store = MemoryStore::new();
        let workflow = WorkflowRun::new("d1", "wf1", "run-1");

        store
            .append_history_events(&AppendHistoryEventsRequest {
                workflow: workflow.clone(),
                first_event_id: FIRST_EVENT_ID,
                transaction_id: 5,
                events: vec![started_event(1)],
            })
            .await
            .unwrap();

        // A stale re-append of the same batch key must lose.
        let err = store
            .append_history_events(&AppendHistoryEventsRequest {
                workflow: workflow.clone(),
                first_event_id: FIRST_EVENT_ID,
                transaction_id: 4,
                events: vec![started_event(1)],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict));

        let events = store
            .get_workflow_execution_history(&workflow, 1, 10)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_transfer_task_range_reads() {
        let store = MemoryStore::new();
        let mut request = create_request("run-1");
        for task_id in 1..=5 {
            request.transfer_tasks.push(TransferTask {
                task_id,
                workflow: WorkflowRun::new("d1", "wf1", "run-1"),
                version: 0,
                kind: chronik_types::task::TransferTaskKind::CloseExecution,
            });
        }
        store.create_workflow_execution(&request).await.unwrap();

        let tasks = store.get_transfer_tasks(1, 4, 10).await.unwrap();
        assert_eq!(
            tasks.iter().map(|t| t.task_id).collect::<Vec<_>>(),
            vec![2, 3, 4]
        );

        store.complete_transfer_task(2).await.unwrap();
        let tasks = store.get_transfer_tasks(0, 10, 10).await.unwrap();
        assert_eq!(
            tasks.iter().map(|t| t.task_id).collect::<Vec<_>>(),
            vec![1, 3, 4, 5]
        );
    }
}
