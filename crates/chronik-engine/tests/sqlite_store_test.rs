// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite backend tests against a temp-file database.

use std::collections::HashMap;

use tempfile::TempDir;

use chronik_engine::error::EngineError;
use chronik_engine::persistence::{
    AppendHistoryEventsRequest, CreateWorkflowExecutionRequest, ExecutionInfo, ExecutionStore,
    HistoryStore, SqliteHistoryStore, UpdateWorkflowExecutionRequest, WorkflowMutableStateRecord,
};
use chronik_types::event::{EventAttributes, HistoryEvent, WorkflowExecutionStartedAttributes};
use chronik_types::task::{TransferTask, TransferTaskKind};
use chronik_types::{CloseStatus, WorkflowRun, WorkflowState, FIRST_EVENT_ID};

async fn store() -> (TempDir, SqliteHistoryStore) {
    let dir = TempDir::new().expect("temp dir");
    let store = SqliteHistoryStore::from_path(dir.path().join("chronik.db"))
        .await
        .expect("open sqlite store");
    (dir, store)
}

fn snapshot(workflow_id: &str, run_id: &str) -> WorkflowMutableStateRecord {
    WorkflowMutableStateRecord {
        execution_info: ExecutionInfo {
            domain_id: "d1".to_string(),
            workflow_id: workflow_id.to_string(),
            run_id: run_id.to_string(),
            workflow_type: "t".to_string(),
            task_list: "tl".to_string(),
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

fn create_request(workflow_id: &str, run_id: &str) -> CreateWorkflowExecutionRequest {
    CreateWorkflowExecutionRequest {
        request_id: "req-1".to_string(),
        snapshot: snapshot(workflow_id, run_id),
        transfer_tasks: Vec::new(),
        timer_tasks: Vec::new(),
        replication_tasks: Vec::new(),
        continue_as_new: false,
        previous_run_id: None,
    }
}

fn started_event(event_id: i64) -> HistoryEvent {
    HistoryEvent {
        event_id,
        timestamp: chrono::Utc::now(),
        attributes: EventAttributes::WorkflowExecutionStarted(WorkflowExecutionStartedAttributes {
            workflow_type: "t".to_string(),
            task_list: "tl".to_string(),
            input: None,
            execution_timeout_secs: 10,
            decision_timeout_secs: 10,
            identity: "i".to_string(),
            parent_workflow_id: None,
            parent_run_id: None,
            continued_from_run_id: None,
        }),
    }
}

#[tokio::test]
async fn test_create_get_round_trip() {
    let (_dir, store) = store().await;
    store
        .create_workflow_execution(&create_request("wf1", "run-1"))
        .await
        .unwrap();

    let record = store.get_workflow_execution("d1", "wf1", "run-1").await.unwrap();
    assert_eq!(record.execution_info.next_event_id, 3);
    assert_eq!(record.execution_info.workflow_type, "t");

    let current = store.get_current_execution("d1", "wf1").await.unwrap();
    assert_eq!(current.run_id, "run-1");
    assert_eq!(current.create_request_id, "req-1");
}

#[tokio::test]
async fn test_duplicate_create_reports_prior_run() {
    let (_dir, store) = store().await;
    store
        .create_workflow_execution(&create_request("wf1", "run-1"))
        .await
        .unwrap();

    let err = store
        .create_workflow_execution(&create_request("wf1", "run-2"))
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
async fn test_update_cas_semantics() {
    let (_dir, store) = store().await;
    store
        .create_workflow_execution(&create_request("wf1", "run-1"))
        .await
        .unwrap();

    let record = store.get_workflow_execution("d1", "wf1", "run-1").await.unwrap();
    let mut info = record.execution_info.clone();
    info.next_event_id = 5;

    store
        .update_workflow_execution(&UpdateWorkflowExecutionRequest {
            execution_info: info.clone(),
            condition: 3,
            ..Default::default()
        })
        .await
        .unwrap();

    // Same condition again: the CAS must fail.
    let err = store
        .update_workflow_execution(&UpdateWorkflowExecutionRequest {
            execution_info: info,
            condition: 3,
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict));

    let record = store.get_workflow_execution("d1", "wf1", "run-1").await.unwrap();
    assert_eq!(record.execution_info.next_event_id, 5);
}

#[tokio::test]
async fn test_update_keeps_current_run_index_in_sync() {
    let (_dir, store) = store().await;
    store
        .create_workflow_execution(&create_request("wf1", "run-1"))
        .await
        .unwrap();

    let record = store.get_workflow_execution("d1", "wf1", "run-1").await.unwrap();
    let mut info = record.execution_info.clone();
    info.next_event_id = 4;
    info.state = WorkflowState::Completed;
    info.close_status = CloseStatus::Failed;

    store
        .update_workflow_execution(&UpdateWorkflowExecutionRequest {
            execution_info: info,
            condition: 3,
            ..Default::default()
        })
        .await
        .unwrap();

    let current = store.get_current_execution("d1", "wf1").await.unwrap();
    assert_eq!(current.state, WorkflowState::Completed);
    assert_eq!(current.close_status, CloseStatus::Failed);
}

#[tokio::test]
async fn test_continue_as_new_is_atomic() {
    let (_dir, store) = store().await;
    store
        .create_workflow_execution(&create_request("wf1", "run-1"))
        .await
        .unwrap();

    let record = store.get_workflow_execution("d1", "wf1", "run-1").await.unwrap();
    let mut info = record.execution_info.clone();
    info.next_event_id = 5;
    info.state = WorkflowState::Completed;
    info.close_status = CloseStatus::Completed;

    let mut successor = create_request("wf1", "run-2");
    successor.continue_as_new = true;
    successor.previous_run_id = Some("run-1".to_string());

    store
        .update_workflow_execution(&UpdateWorkflowExecutionRequest {
            execution_info: info,
            condition: 3,
            continue_as_new: Some(Box::new(successor)),
            ..Default::default()
        })
        .await
        .unwrap();

    let current = store.get_current_execution("d1", "wf1").await.unwrap();
    assert_eq!(current.run_id, "run-2");
    assert_eq!(current.state, WorkflowState::Running);
    assert!(store.get_workflow_execution("d1", "wf1", "run-2").await.is_ok());
}

#[tokio::test]
async fn test_transfer_task_pagination_and_completion() {
    let (_dir, store) = store().await;
    let mut request = create_request("wf1", "run-1");
    for task_id in 1..=5 {
        request.transfer_tasks.push(TransferTask {
            task_id,
            workflow: WorkflowRun::new("d1", "wf1", "run-1"),
            version: 0,
            kind: TransferTaskKind::CloseExecution,
        });
    }
    store.create_workflow_execution(&request).await.unwrap();

    let page = store.get_transfer_tasks(0, 10, 2).await.unwrap();
    assert_eq!(page.iter().map(|t| t.task_id).collect::<Vec<_>>(), vec![1, 2]);

    let page = store.get_transfer_tasks(2, 4, 10).await.unwrap();
    assert_eq!(page.iter().map(|t| t.task_id).collect::<Vec<_>>(), vec![3, 4]);

    store.complete_transfer_task(3).await.unwrap();
    let rest = store.get_transfer_tasks(0, 10, 10).await.unwrap();
    assert_eq!(
        rest.iter().map(|t| t.task_id).collect::<Vec<_>>(),
        vec![1, 2, 4, 5]
    );
}

#[tokio::test]
async fn test_history_append_transaction_ordering() {
    let (_dir, store) = store().await;
    let workflow = WorkflowRun::new("d1", "wf1", "run-1");

    store
        .append_history_events(&AppendHistoryEventsRequest {
            workflow: workflow.clone(),
            first_event_id: FIRST_EVENT_ID,
            transaction_id: 7,
            events: vec![started_event(1)],
        })
        .await
        .unwrap();

    // A lower transaction ID for the same batch key loses.
    let err = store
        .append_history_events(&AppendHistoryEventsRequest {
            workflow: workflow.clone(),
            first_event_id: FIRST_EVENT_ID,
            transaction_id: 6,
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

    store.delete_workflow_execution_history(&workflow).await.unwrap();
    assert!(store
        .get_workflow_execution_history(&workflow, 1, 10)
        .await
        .is_err());
}
