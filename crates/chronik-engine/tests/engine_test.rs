// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end engine tests over the in-memory store.

mod common;

use common::TestContext;

use chronik_engine::clock::Clock;
use chronik_engine::error::EngineError;
use chronik_types::decision::{
    CompleteWorkflowExecutionAttributes, ContinueAsNewWorkflowExecutionAttributes, Decision,
    ScheduleActivityTaskAttributes, StartTimerAttributes,
};
use chronik_types::event::DecisionTaskFailedCause;
use chronik_types::request::*;
use chronik_types::task::{TimerTaskKind, TransferTaskKind};
use chronik_types::token::TaskToken;
use chronik_types::{CloseStatus, WorkflowIdReusePolicy, WorkflowState};

fn schedule_activity(activity_id: &str) -> Decision {
    Decision::ScheduleActivityTask(ScheduleActivityTaskAttributes {
        activity_id: activity_id.to_string(),
        activity_type: "charge-card".to_string(),
        task_list: "payments".to_string(),
        domain_id: None,
        input: None,
        schedule_to_close_timeout_secs: 60,
        schedule_to_start_timeout_secs: 10,
        start_to_close_timeout_secs: 50,
        heartbeat_timeout_secs: 0,
    })
}

fn decision_token(workflow: &chronik_types::WorkflowRun, schedule_id: i64, attempt: i64) -> Vec<u8> {
    TaskToken::for_decision(&workflow.workflow_id, &workflow.run_id, schedule_id, attempt)
        .serialize()
        .unwrap()
}

fn complete_request(
    workflow: &chronik_types::WorkflowRun,
    schedule_id: i64,
    decisions: Vec<Decision>,
) -> RespondDecisionTaskCompletedRequest {
    RespondDecisionTaskCompletedRequest {
        domain_id: workflow.domain_id.clone(),
        task_token: decision_token(workflow, schedule_id, 0),
        decisions,
        execution_context: None,
        identity: "worker".to_string(),
        sticky: None,
    }
}

// Seed scenario 1: a fresh start produces started + scheduled-decision
// events, one decision transfer task and one workflow-timeout timer.
#[tokio::test]
async fn test_start_workflow_produces_initial_artifacts() {
    let ctx = TestContext::new();
    let start_time = ctx.clock.now();

    let response = ctx
        .engine
        .start_workflow_execution(ctx.start_request("wfA", "req-1"))
        .await
        .unwrap();
    assert!(!response.run_id.is_empty());
    let workflow = chronik_types::WorkflowRun::new("test-domain", "wfA", response.run_id);

    let history = ctx.history(&workflow).await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].event_id, 1);
    assert_eq!(history[0].event_type(), "workflow_execution_started");
    assert_eq!(history[1].event_id, 2);
    assert_eq!(history[1].event_type(), "decision_task_scheduled");

    let record = ctx.mutable_state(&workflow).await;
    assert_eq!(record.execution_info.next_event_id, 3);
    assert_eq!(record.execution_info.decision_schedule_id, 2);

    let transfer = ctx.transfer_tasks().await;
    assert_eq!(transfer.len(), 1);
    match &transfer[0].kind {
        TransferTaskKind::DecisionTask {
            task_list,
            schedule_id,
        } => {
            assert_eq!(task_list, "default");
            assert_eq!(*schedule_id, 2);
        }
        other => panic!("unexpected transfer task: {:?}", other),
    }

    let timers = ctx.timer_tasks().await;
    assert_eq!(timers.len(), 1);
    assert!(matches!(timers[0].kind, TimerTaskKind::WorkflowTimeout));
    assert_eq!(
        timers[0].visibility_timestamp,
        start_time + chrono::Duration::seconds(100)
    );
}

// Seed scenario 2: recording the same decision start twice with the same
// request ID is idempotent and leaves exactly one started event in history.
#[tokio::test]
async fn test_record_decision_started_idempotent_on_request_id() {
    let ctx = TestContext::new();
    let workflow = ctx.start_workflow("wfA").await;

    let request = RecordDecisionTaskStartedRequest {
        domain_id: workflow.domain_id.clone(),
        workflow_id: workflow.workflow_id.clone(),
        run_id: workflow.run_id.clone(),
        schedule_id: 2,
        task_id: 1,
        request_id: "R1".to_string(),
        identity: "worker".to_string(),
    };
    let first = ctx
        .engine
        .record_decision_task_started(request.clone())
        .await
        .unwrap();
    let second = ctx
        .engine
        .record_decision_task_started(request)
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(first.started_event_id, 3);

    let history = ctx.history(&workflow).await;
    let started_count = history
        .iter()
        .filter(|event| event.event_type() == "decision_task_started")
        .count();
    assert_eq!(started_count, 1);

    // A different request ID against the started decision is rejected.
    let err = ctx
        .engine
        .record_decision_task_started(RecordDecisionTaskStartedRequest {
            domain_id: workflow.domain_id.clone(),
            workflow_id: workflow.workflow_id.clone(),
            run_id: workflow.run_id.clone(),
            schedule_id: 2,
            task_id: 1,
            request_id: "R2".to_string(),
            identity: "worker".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::EventAlreadyStarted { .. }));
}

// Seed scenario 3: completing a decision with two activity commands
// advances next-event-id by three and emits two activity transfer tasks.
#[tokio::test]
async fn test_respond_decision_completed_schedules_activities() {
    let ctx = TestContext::new();
    let (workflow, _started_id) = ctx.start_workflow_with_decision("wfA").await;

    let before = ctx.mutable_state(&workflow).await.execution_info.next_event_id;
    ctx.engine
        .respond_decision_task_completed(complete_request(
            &workflow,
            2,
            vec![schedule_activity("a1"), schedule_activity("a2")],
        ))
        .await
        .unwrap();

    let record = ctx.mutable_state(&workflow).await;
    assert_eq!(record.execution_info.next_event_id, before + 3);
    assert_eq!(record.activity_infos.len(), 2);
    // No buffered events, so no follow-up decision.
    assert_eq!(record.execution_info.decision_schedule_id, 0);

    let activity_tasks: Vec<_> = ctx
        .transfer_tasks()
        .await
        .into_iter()
        .filter(|task| matches!(task.kind, TransferTaskKind::ActivityTask { .. }))
        .collect();
    assert_eq!(activity_tasks.len(), 2);
}

// Seed scenario 4: two racing completions of the same decision; exactly one
// wins, the loser observes the decision is gone.
#[tokio::test]
async fn test_concurrent_decision_completions_single_winner() {
    let ctx = TestContext::new();
    let (workflow, _) = ctx.start_workflow_with_decision("wfA").await;

    let first = {
        let engine = ctx.engine.clone();
        let request = complete_request(&workflow, 2, vec![schedule_activity("a1")]);
        tokio::spawn(async move { engine.respond_decision_task_completed(request).await })
    };
    let second = {
        let engine = ctx.engine.clone();
        let request = complete_request(&workflow, 2, vec![schedule_activity("a2")]);
        tokio::spawn(async move { engine.respond_decision_task_completed(request).await })
    };

    let results = [first.await.unwrap(), second.await.unwrap()];
    let ok_count = results.iter().filter(|result| result.is_ok()).count();
    assert_eq!(ok_count, 1, "exactly one completion must win: {:?}", results);
    let loser = results
        .iter()
        .find(|result| result.is_err())
        .unwrap()
        .as_ref()
        .unwrap_err();
    assert!(matches!(loser, EngineError::EntityNotExists { .. }));
}

// Seed scenario 5: RejectDuplicate refuses a second start while the first
// run exists, referencing its run ID.
#[tokio::test]
async fn test_reject_duplicate_start_references_prior_run() {
    let ctx = TestContext::new();
    let first = ctx
        .engine
        .start_workflow_execution(ctx.start_request("wfA", "req-1"))
        .await
        .unwrap();

    let mut second = ctx.start_request("wfA", "req-2");
    second.reuse_policy = WorkflowIdReusePolicy::RejectDuplicate;
    let err = ctx
        .engine
        .start_workflow_execution(second)
        .await
        .unwrap_err();
    match err {
        EngineError::WorkflowAlreadyStarted { run_id, state, .. } => {
            assert_eq!(run_id, first.run_id);
            assert_eq!(state, WorkflowState::Running);
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

// Seed scenario 6: a terminal command with unhandled buffered events fails
// the decision with UnhandledDecision and schedules a fresh decision.
#[tokio::test]
async fn test_complete_with_buffered_events_fails_decision() {
    let ctx = TestContext::new();
    let (workflow, _) = ctx.start_workflow_with_decision("wfA").await;

    // The signal arrives while the decision is in flight: buffered.
    ctx.engine
        .signal_workflow_execution(SignalWorkflowRequest {
            domain_id: workflow.domain_id.clone(),
            workflow_id: workflow.workflow_id.clone(),
            run_id: Some(workflow.run_id.clone()),
            signal_name: "order-updated".to_string(),
            input: None,
            request_id: "sig-1".to_string(),
            identity: "sender".to_string(),
            external_workflow_id: None,
            external_run_id: None,
            child_workflow_only: false,
        })
        .await
        .unwrap();
    let record = ctx.mutable_state(&workflow).await;
    assert_eq!(record.buffered_events.len(), 1);

    ctx.engine
        .respond_decision_task_completed(complete_request(
            &workflow,
            2,
            vec![Decision::CompleteWorkflowExecution(
                CompleteWorkflowExecutionAttributes { result: None },
            )],
        ))
        .await
        .unwrap();

    let record = ctx.mutable_state(&workflow).await;
    assert!(record.execution_info.is_running());
    assert!(record.execution_info.has_pending_decision());

    let history = ctx.history(&workflow).await;
    let failed = history
        .iter()
        .find(|event| event.event_type() == "decision_task_failed")
        .expect("decision failed event");
    match &failed.attributes {
        chronik_types::event::EventAttributes::DecisionTaskFailed(attrs) => {
            assert_eq!(attrs.cause, DecisionTaskFailedCause::UnhandledDecision);
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_complete_workflow_emits_close_follow_ups() {
    let ctx = TestContext::new();
    let (workflow, _) = ctx.start_workflow_with_decision("wfA").await;

    ctx.engine
        .respond_decision_task_completed(complete_request(
            &workflow,
            2,
            vec![Decision::CompleteWorkflowExecution(
                CompleteWorkflowExecutionAttributes {
                    result: Some(b"done".to_vec()),
                },
            )],
        ))
        .await
        .unwrap();

    let record = ctx.mutable_state(&workflow).await;
    assert_eq!(record.execution_info.state, WorkflowState::Completed);
    assert_eq!(record.execution_info.close_status, CloseStatus::Completed);

    let close_tasks: Vec<_> = ctx
        .transfer_tasks()
        .await
        .into_iter()
        .filter(|task| matches!(task.kind, TransferTaskKind::CloseExecution))
        .collect();
    assert_eq!(close_tasks.len(), 1);

    let cleanup_timers: Vec<_> = ctx
        .timer_tasks()
        .await
        .into_iter()
        .filter(|task| matches!(task.kind, TimerTaskKind::DeleteHistoryEvent))
        .collect();
    assert_eq!(cleanup_timers.len(), 1);

    // A signal against the closed run is rejected.
    let err = ctx
        .engine
        .signal_workflow_execution(SignalWorkflowRequest {
            domain_id: workflow.domain_id.clone(),
            workflow_id: workflow.workflow_id.clone(),
            run_id: Some(workflow.run_id.clone()),
            signal_name: "late".to_string(),
            input: None,
            request_id: "sig-late".to_string(),
            identity: "sender".to_string(),
            external_workflow_id: None,
            external_run_id: None,
            child_workflow_only: false,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::EntityNotExists { .. }));
}

#[tokio::test]
async fn test_terminate_closes_and_emits_close_follow_ups() {
    let ctx = TestContext::new();
    let workflow = ctx.start_workflow("wfA").await;

    ctx.engine
        .terminate_workflow_execution(TerminateWorkflowRequest {
            domain_id: workflow.domain_id.clone(),
            workflow_id: workflow.workflow_id.clone(),
            run_id: Some(workflow.run_id.clone()),
            reason: "operator".to_string(),
            details: None,
            identity: "cli".to_string(),
        })
        .await
        .unwrap();

    let record = ctx.mutable_state(&workflow).await;
    assert_eq!(record.execution_info.close_status, CloseStatus::Terminated);

    let transfer = ctx.transfer_tasks().await;
    assert_eq!(
        transfer
            .iter()
            .filter(|task| matches!(task.kind, TransferTaskKind::CloseExecution))
            .count(),
        1
    );

    // Terminating again reports the run as already completed.
    let err = ctx
        .engine
        .terminate_workflow_execution(TerminateWorkflowRequest {
            domain_id: workflow.domain_id.clone(),
            workflow_id: workflow.workflow_id.clone(),
            run_id: Some(workflow.run_id.clone()),
            reason: "again".to_string(),
            details: None,
            identity: "cli".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::EntityNotExists { .. }));
}

#[tokio::test]
async fn test_signal_deduplicates_on_request_id() {
    let ctx = TestContext::new();
    let workflow = ctx.start_workflow("wfA").await;

    let signal = SignalWorkflowRequest {
        domain_id: workflow.domain_id.clone(),
        workflow_id: workflow.workflow_id.clone(),
        run_id: Some(workflow.run_id.clone()),
        signal_name: "go".to_string(),
        input: None,
        request_id: "sig-1".to_string(),
        identity: "sender".to_string(),
        external_workflow_id: None,
        external_run_id: None,
        child_workflow_only: false,
    };
    ctx.engine
        .signal_workflow_execution(signal.clone())
        .await
        .unwrap();
    ctx.engine.signal_workflow_execution(signal).await.unwrap();

    let history = ctx.history(&workflow).await;
    let signaled = history
        .iter()
        .filter(|event| event.event_type() == "workflow_execution_signaled")
        .count();
    assert_eq!(signaled, 1);
}

#[tokio::test]
async fn test_cancel_request_idempotent_and_conflicting() {
    let ctx = TestContext::new();
    let workflow = ctx.start_workflow("wfA").await;

    let cancel = RequestCancelWorkflowRequest {
        domain_id: workflow.domain_id.clone(),
        workflow_id: workflow.workflow_id.clone(),
        run_id: Some(workflow.run_id.clone()),
        cancel_request_id: "cancel-1".to_string(),
        identity: "cli".to_string(),
        external_workflow_id: None,
        external_run_id: None,
        child_workflow_only: false,
    };
    ctx.engine
        .request_cancel_workflow_execution(cancel.clone())
        .await
        .unwrap();

    // Same request ID: no-op.
    ctx.engine
        .request_cancel_workflow_execution(cancel.clone())
        .await
        .unwrap();

    // Different request ID: already requested.
    let mut other = cancel;
    other.cancel_request_id = "cancel-2".to_string();
    let err = ctx
        .engine
        .request_cancel_workflow_execution(other)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::CancellationAlreadyRequested));

    let record = ctx.mutable_state(&workflow).await;
    assert!(record.execution_info.cancel_requested);
}

#[tokio::test]
async fn test_reuse_policy_allow_duplicate_failed_only() {
    let ctx = TestContext::new();
    let workflow = ctx.start_workflow("wfA").await;

    // Close the run as terminated (a failure for reuse purposes).
    ctx.engine
        .terminate_workflow_execution(TerminateWorkflowRequest {
            domain_id: workflow.domain_id.clone(),
            workflow_id: workflow.workflow_id.clone(),
            run_id: Some(workflow.run_id.clone()),
            reason: "make way".to_string(),
            details: None,
            identity: "cli".to_string(),
        })
        .await
        .unwrap();

    let mut retry = ctx.start_request("wfA", "req-2");
    retry.reuse_policy = WorkflowIdReusePolicy::AllowDuplicateFailedOnly;
    let second = ctx.engine.start_workflow_execution(retry).await.unwrap();
    assert_ne!(second.run_id, workflow.run_id);

    // Complete the second run successfully; FailedOnly now rejects.
    let second_run =
        chronik_types::WorkflowRun::new("test-domain", "wfA", second.run_id.clone());
    ctx.engine
        .record_decision_task_started(RecordDecisionTaskStartedRequest {
            domain_id: second_run.domain_id.clone(),
            workflow_id: second_run.workflow_id.clone(),
            run_id: second_run.run_id.clone(),
            schedule_id: 2,
            task_id: 9,
            request_id: "poll-2".to_string(),
            identity: "worker".to_string(),
        })
        .await
        .unwrap();
    ctx.engine
        .respond_decision_task_completed(complete_request(
            &second_run,
            2,
            vec![Decision::CompleteWorkflowExecution(
                CompleteWorkflowExecutionAttributes { result: None },
            )],
        ))
        .await
        .unwrap();

    let mut third = ctx.start_request("wfA", "req-3");
    third.reuse_policy = WorkflowIdReusePolicy::AllowDuplicateFailedOnly;
    let err = ctx.engine.start_workflow_execution(third).await.unwrap_err();
    assert!(matches!(err, EngineError::WorkflowAlreadyStarted { .. }));
}

#[tokio::test]
async fn test_start_deduplicates_on_request_id() {
    let ctx = TestContext::new();
    let first = ctx
        .engine
        .start_workflow_execution(ctx.start_request("wfA", "req-1"))
        .await
        .unwrap();

    // Same request ID: the original run wins, idempotently.
    let second = ctx
        .engine
        .start_workflow_execution(ctx.start_request("wfA", "req-1"))
        .await
        .unwrap();
    assert_eq!(second.run_id, first.run_id);
}

#[tokio::test]
async fn test_activity_lifecycle_round_trip() {
    let ctx = TestContext::new();
    let (workflow, _) = ctx.start_workflow_with_decision("wfA").await;

    ctx.engine
        .respond_decision_task_completed(complete_request(
            &workflow,
            2,
            vec![schedule_activity("a1")],
        ))
        .await
        .unwrap();
    let schedule_id = 5;

    let started = ctx
        .engine
        .record_activity_task_started(RecordActivityTaskStartedRequest {
            domain_id: workflow.domain_id.clone(),
            workflow_id: workflow.workflow_id.clone(),
            run_id: workflow.run_id.clone(),
            schedule_id,
            task_id: 11,
            request_id: "act-poll-1".to_string(),
            identity: "activity-worker".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(started.scheduled_event.event_id, schedule_id);

    // Heartbeat reports no cancellation and leaves no history event.
    let token = TaskToken::for_activity(&workflow.workflow_id, &workflow.run_id, schedule_id, "a1")
        .serialize()
        .unwrap();
    let history_len_before = ctx.history(&workflow).await.len();
    let heartbeat = ctx
        .engine
        .record_activity_task_heartbeat(RecordActivityTaskHeartbeatRequest {
            domain_id: workflow.domain_id.clone(),
            task_token: token.clone(),
            details: Some(b"50%".to_vec()),
            identity: "activity-worker".to_string(),
        })
        .await
        .unwrap();
    assert!(!heartbeat.cancel_requested);
    assert_eq!(ctx.history(&workflow).await.len(), history_len_before);

    ctx.engine
        .respond_activity_task_completed(RespondActivityTaskCompletedRequest {
            domain_id: workflow.domain_id.clone(),
            task_token: token.clone(),
            result: Some(b"ok".to_vec()),
            identity: "activity-worker".to_string(),
        })
        .await
        .unwrap();

    // Completion schedules the next decision.
    let record = ctx.mutable_state(&workflow).await;
    assert!(record.execution_info.has_pending_decision());
    assert!(record.activity_infos.is_empty());

    // A duplicate completion no longer finds the activity.
    let err = ctx
        .engine
        .respond_activity_task_completed(RespondActivityTaskCompletedRequest {
            domain_id: workflow.domain_id.clone(),
            task_token: token,
            result: None,
            identity: "activity-worker".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::EntityNotExists { .. }));
}

#[tokio::test]
async fn test_duplicate_timer_id_fails_decision() {
    let ctx = TestContext::new();
    let (workflow, _) = ctx.start_workflow_with_decision("wfA").await;

    ctx.engine
        .respond_decision_task_completed(complete_request(
            &workflow,
            2,
            vec![
                Decision::StartTimer(StartTimerAttributes {
                    timer_id: "t1".to_string(),
                    start_to_fire_timeout_secs: 60,
                }),
                Decision::StartTimer(StartTimerAttributes {
                    timer_id: "t1".to_string(),
                    start_to_fire_timeout_secs: 60,
                }),
            ],
        ))
        .await
        .unwrap();

    let history = ctx.history(&workflow).await;
    let failed = history
        .iter()
        .find(|event| event.event_type() == "decision_task_failed")
        .expect("decision failed event");
    match &failed.attributes {
        chronik_types::event::EventAttributes::DecisionTaskFailed(attrs) => {
            assert_eq!(attrs.cause, DecisionTaskFailedCause::StartTimerDuplicateId);
        }
        _ => unreachable!(),
    }
    // The rolled-back timer is not in mutable state.
    let record = ctx.mutable_state(&workflow).await;
    assert!(record.timer_infos.is_empty());
}

#[tokio::test]
async fn test_continue_as_new_chains_runs() {
    let ctx = TestContext::new();
    let (workflow, _) = ctx.start_workflow_with_decision("wfA").await;

    ctx.engine
        .respond_decision_task_completed(complete_request(
            &workflow,
            2,
            vec![Decision::ContinueAsNewWorkflowExecution(
                ContinueAsNewWorkflowExecutionAttributes {
                    workflow_type: None,
                    task_list: None,
                    input: None,
                    execution_timeout_secs: 0,
                    decision_timeout_secs: 0,
                },
            )],
        ))
        .await
        .unwrap();

    let old = ctx.mutable_state(&workflow).await;
    assert_eq!(old.execution_info.state, WorkflowState::Completed);

    use chronik_engine::persistence::ExecutionStore;
    let current = ctx
        .store
        .get_current_execution("test-domain", "wfA")
        .await
        .unwrap();
    assert_ne!(current.run_id, workflow.run_id);
    assert_eq!(current.state, WorkflowState::Running);

    let successor =
        chronik_types::WorkflowRun::new("test-domain", "wfA", current.run_id.clone());
    let record = ctx.mutable_state(&successor).await;
    // Inherited configuration and a scheduled first decision.
    assert_eq!(record.execution_info.workflow_type, "order-processing");
    assert_eq!(record.execution_info.workflow_timeout_secs, 100);
    assert!(record.execution_info.has_pending_decision());

    let history = ctx.history(&successor).await;
    assert_eq!(history[0].event_type(), "workflow_execution_started");
}

#[tokio::test]
async fn test_get_mutable_state_long_poll_wakes_on_commit() {
    let ctx = TestContext::new();
    let workflow = ctx.start_workflow("wfA").await;

    let poll = {
        let engine = ctx.engine.clone();
        let workflow = workflow.clone();
        tokio::spawn(async move {
            engine
                .get_mutable_state(
                    GetMutableStateRequest {
                        domain_id: workflow.domain_id.clone(),
                        workflow_id: workflow.workflow_id.clone(),
                        run_id: Some(workflow.run_id.clone()),
                        expected_next_event_id: Some(3),
                    },
                    None,
                )
                .await
        })
    };

    // Give the poller time to subscribe, then commit a signal.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    ctx.engine
        .signal_workflow_execution(SignalWorkflowRequest {
            domain_id: workflow.domain_id.clone(),
            workflow_id: workflow.workflow_id.clone(),
            run_id: Some(workflow.run_id.clone()),
            signal_name: "wake".to_string(),
            input: None,
            request_id: "sig-1".to_string(),
            identity: "sender".to_string(),
            external_workflow_id: None,
            external_run_id: None,
            child_workflow_only: false,
        })
        .await
        .unwrap();

    let response = tokio::time::timeout(std::time::Duration::from_secs(5), poll)
        .await
        .expect("long poll must wake on commit")
        .unwrap()
        .unwrap();
    assert!(response.next_event_id > 3);
    assert!(response.is_workflow_running);
}

#[tokio::test]
async fn test_get_mutable_state_cancellation_propagates() {
    let ctx = TestContext::new();
    let workflow = ctx.start_workflow("wfA").await;

    let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
    let poll = {
        let engine = ctx.engine.clone();
        let workflow = workflow.clone();
        tokio::spawn(async move {
            engine
                .get_mutable_state(
                    GetMutableStateRequest {
                        domain_id: workflow.domain_id.clone(),
                        workflow_id: workflow.workflow_id.clone(),
                        run_id: Some(workflow.run_id.clone()),
                        expected_next_event_id: Some(3),
                    },
                    Some(cancel_rx),
                )
                .await
        })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    cancel_tx.send(true).unwrap();

    let result = tokio::time::timeout(std::time::Duration::from_secs(5), poll)
        .await
        .expect("long poll must observe cancellation")
        .unwrap();
    assert!(matches!(result, Err(EngineError::Canceled)));
}

#[tokio::test]
async fn test_describe_reports_pending_activity_states() {
    let ctx = TestContext::new();
    let (workflow, _) = ctx.start_workflow_with_decision("wfA").await;
    ctx.engine
        .respond_decision_task_completed(complete_request(
            &workflow,
            2,
            vec![schedule_activity("a1")],
        ))
        .await
        .unwrap();

    let describe = ctx
        .engine
        .describe_workflow_execution(DescribeWorkflowRequest {
            domain_id: workflow.domain_id.clone(),
            workflow_id: workflow.workflow_id.clone(),
            run_id: Some(workflow.run_id.clone()),
        })
        .await
        .unwrap();
    assert_eq!(describe.workflow_type, "order-processing");
    assert!(describe.close_status.is_none());
    assert_eq!(describe.pending_activities.len(), 1);
    assert_eq!(
        describe.pending_activities[0].state,
        PendingActivityState::Scheduled
    );
    assert_eq!(describe.pending_activities[0].activity_type, "charge-card");
}

#[tokio::test]
async fn test_bad_task_token_is_bad_request() {
    let ctx = TestContext::new();
    let err = ctx
        .engine
        .respond_decision_task_completed(RespondDecisionTaskCompletedRequest {
            domain_id: "test-domain".to_string(),
            task_token: b"garbage".to_vec(),
            decisions: Vec::new(),
            execution_context: None,
            identity: "worker".to_string(),
            sticky: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::BadRequest { .. }));
}
