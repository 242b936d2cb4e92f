// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Standby-processor verification semantics.
//!
//! A standby executor must never perform an external side-effect: it only
//! acknowledges a task once the mutable-state footprint the active cluster
//! produces has been replayed locally, answering TaskRetry until then.

mod common;

use std::sync::Arc;

use common::{MatchingCall, RecordingMatchingClient, RecordingPeerClient, TestContext};

use chronik_engine::clients::StaticDomainRegistry;
use chronik_engine::config::Config;
use chronik_engine::engine::HistoryEngine;
use chronik_engine::error::EngineError;
use chronik_engine::persistence::MemoryStore;
use chronik_engine::queues::transfer_standby::StandbyTransferTaskExecutor;
use chronik_engine::queues::TransferTaskExecutor;
use chronik_engine::shard::ShardContext;
use chronik_types::request::RecordDecisionTaskStartedRequest;
use chronik_types::task::{TransferTask, TransferTaskKind};
use chronik_types::WorkflowRun;

/// Context standing in a standby cluster: domains are global and active in
/// "primary", while this engine runs in "backup".
struct StandbyContext {
    ctx: TestContext,
    engine: Arc<HistoryEngine>,
    executor: StandbyTransferTaskExecutor,
}

fn standby_context() -> StandbyContext {
    let ctx = TestContext::new();
    let store: Arc<MemoryStore> = ctx.store.clone();
    let clock = ctx.clock.clone();
    let shard = Arc::new(ShardContext::new(1, "backup", clock));
    let domains = Arc::new(StaticDomainRegistry {
        retention_days: 7,
        global: true,
        active_cluster: "primary".to_string(),
        failover_version: 1,
    });
    let engine = HistoryEngine::new(
        shard,
        Arc::new(Config::default()),
        store.clone(),
        store.clone(),
        store.clone(),
        domains.clone(),
        64,
    );
    let executor = StandbyTransferTaskExecutor::new(
        engine.clone(),
        store,
        domains,
        "primary",
    );
    StandbyContext {
        ctx,
        engine,
        executor,
    }
}

fn decision_transfer_task(workflow: &WorkflowRun, schedule_id: i64) -> TransferTask {
    TransferTask {
        task_id: 1,
        workflow: workflow.clone(),
        version: 1,
        kind: TransferTaskKind::DecisionTask {
            task_list: "default".to_string(),
            schedule_id,
        },
    }
}

#[tokio::test]
async fn test_standby_decision_task_waits_for_replayed_start() {
    let standby = standby_context();
    // The "replicated" state: a started run with a scheduled decision.
    let workflow = standby.ctx.start_workflow("wfA").await;

    let task = decision_transfer_task(&workflow, 2);
    // Decision scheduled but not started: replay has not caught up.
    let err = standby.executor.execute(&task).await.unwrap_err();
    assert!(matches!(err, EngineError::TaskRetry));

    // Replay the started event (driven through the local engine here).
    standby
        .ctx
        .engine
        .record_decision_task_started(RecordDecisionTaskStartedRequest {
            domain_id: workflow.domain_id.clone(),
            workflow_id: workflow.workflow_id.clone(),
            run_id: workflow.run_id.clone(),
            schedule_id: 2,
            task_id: 1,
            request_id: "poll-1".to_string(),
            identity: "worker".to_string(),
        })
        .await
        .unwrap();

    // Footprint present: the verifier acknowledges.
    standby.executor.execute(&task).await.unwrap();
}

#[tokio::test]
async fn test_standby_never_dispatches_externally() {
    let standby = standby_context();
    let workflow = standby.ctx.start_workflow("wfA").await;

    let task = decision_transfer_task(&workflow, 2);
    let _ = standby.executor.execute(&task).await;

    // The verifier consulted mutable state only; matching and the peer
    // client never saw a call. (The standby executor is not even
    // constructed with them.)
    let matching: &RecordingMatchingClient = &standby.ctx.matching;
    assert!(matching.calls.lock().unwrap().is_empty());
    let peer: &RecordingPeerClient = &standby.ctx.peer;
    assert!(peer.starts.lock().unwrap().is_empty());
    assert!(peer.signals.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_standby_rejects_tasks_of_other_domains() {
    let standby = standby_context();
    let workflow = WorkflowRun::new("test-domain", "wfA", "00000000-0000-0000-0000-000000000001");

    // A standby for "other" must not accept tasks active in "primary".
    let other_executor = StandbyTransferTaskExecutor::new(
        standby.engine.clone(),
        standby.ctx.store.clone(),
        Arc::new(StaticDomainRegistry {
            retention_days: 7,
            global: true,
            active_cluster: "primary".to_string(),
            failover_version: 1,
        }),
        "other",
    );
    let task = decision_transfer_task(&workflow, 2);
    assert!(!other_executor.accepts(&task));
    assert!(standby.executor.accepts(&task));
}

#[tokio::test]
async fn test_standby_acks_tombstone_runs() {
    let standby = standby_context();
    let workflow = WorkflowRun::new("test-domain", "gone", "00000000-0000-0000-0000-000000000002");

    let task = decision_transfer_task(&workflow, 2);
    // The run never replicated (or was deleted): EntityNotExists, which the
    // processor loop acks as a tombstone.
    let err = standby.executor.execute(&task).await.unwrap_err();
    assert!(matches!(err, EngineError::EntityNotExists { .. }));
}

#[tokio::test]
async fn test_standby_close_execution_records_visibility_only() {
    let standby = standby_context();
    let workflow = standby.ctx.start_workflow("wfA").await;

    let close_task = TransferTask {
        task_id: 9,
        workflow: workflow.clone(),
        version: 1,
        kind: TransferTaskKind::CloseExecution,
    };
    // Run still open: the terminal event has not replicated yet.
    let err = standby.executor.execute(&close_task).await.unwrap_err();
    assert!(matches!(err, EngineError::TaskRetry));

    standby
        .ctx
        .engine
        .terminate_workflow_execution(chronik_types::request::TerminateWorkflowRequest {
            domain_id: workflow.domain_id.clone(),
            workflow_id: workflow.workflow_id.clone(),
            run_id: Some(workflow.run_id.clone()),
            reason: "closing".to_string(),
            details: None,
            identity: "cli".to_string(),
        })
        .await
        .unwrap();

    standby.executor.execute(&close_task).await.unwrap();
    let record = standby
        .ctx
        .store
        .closed_visibility_record(&workflow)
        .expect("closed visibility record written");
    assert_eq!(record.workflow_type, "order-processing");
    // No parent notification went out.
    assert!(standby.ctx.peer.child_completions.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_active_executor_dispatches_decision_to_matching() {
    use chronik_engine::queues::transfer_active::ActiveTransferTaskExecutor;

    let ctx = TestContext::new();
    let workflow = ctx.start_workflow("wfA").await;
    let executor = ActiveTransferTaskExecutor::new(
        ctx.engine.clone(),
        ctx.matching.clone(),
        ctx.peer.clone(),
        ctx.store.clone(),
        ctx.domains.clone(),
        "active",
    );

    let task = decision_transfer_task(&workflow, 2);
    assert!(executor.accepts(&task));
    executor.execute(&task).await.unwrap();

    let calls = ctx.matching.calls.lock().unwrap();
    assert_eq!(
        calls.as_slice(),
        &[MatchingCall::DecisionTask {
            task_list: "default".to_string(),
            workflow_id: "wfA".to_string(),
            schedule_id: 2,
        }]
    );
}
