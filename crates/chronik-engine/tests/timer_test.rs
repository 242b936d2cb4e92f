// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Timer-queue processor tests with a manually driven clock.

mod common;

use std::time::Duration;

use common::TestContext;

use chronik_engine::config::Config;
use chronik_engine::queues::timer::{TimerProcessorMode, TimerQueueProcessor};
use chronik_types::decision::{Decision, StartTimerAttributes};
use chronik_types::request::RespondDecisionTaskCompletedRequest;
use chronik_types::token::TaskToken;
use chronik_types::{CloseStatus, WorkflowState};

/// Engine + timer processor over the in-memory store, with a fast poll
/// interval so tests only wait milliseconds of real time.
struct TimerContext {
    ctx: TestContext,
    shutdown: tokio::sync::watch::Sender<bool>,
}

fn timer_context() -> TimerContext {
    let ctx = TestContext::with_config(Config {
        timer_poll_interval: Duration::from_millis(20),
        ..Config::default()
    });
    let processor = TimerQueueProcessor::new(
        ctx.engine.clone(),
        ctx.store.clone(),
        TimerProcessorMode::Active,
    );
    let (shutdown, shutdown_rx) = tokio::sync::watch::channel(false);
    processor.start(shutdown_rx);
    TimerContext { ctx, shutdown }
}

const WAIT_ROUNDS: usize = 200;
const WAIT_STEP: Duration = Duration::from_millis(20);

#[tokio::test]
async fn test_workflow_timeout_fires_after_deadline() {
    let timer = timer_context();
    let workflow = timer.ctx.start_workflow("wfA").await;

    // Before the deadline nothing fires.
    tokio::time::sleep(Duration::from_millis(80)).await;
    let record = timer.ctx.mutable_state(&workflow).await;
    assert_eq!(record.execution_info.state, WorkflowState::Running);

    // Past the 100s execution timeout the run is closed as timed out.
    timer.ctx.clock.advance(chrono::Duration::seconds(101));
    let mut closed = false;
    for _ in 0..WAIT_ROUNDS {
        let record = timer.ctx.mutable_state(&workflow).await;
        if record.execution_info.state == WorkflowState::Completed {
            assert_eq!(record.execution_info.close_status, CloseStatus::TimedOut);
            closed = true;
            break;
        }
        tokio::time::sleep(WAIT_STEP).await;
    }
    assert!(closed, "workflow timeout did not fire");

    let history = timer.ctx.history(&workflow).await;
    assert!(history
        .iter()
        .any(|event| event.event_type() == "workflow_execution_timed_out"));

    let _ = timer.shutdown.send(true);
}

#[tokio::test]
async fn test_user_timer_fires_and_schedules_decision() {
    let timer = timer_context();
    let (workflow, _) = timer.ctx.start_workflow_with_decision("wfA").await;

    // Complete the decision with a 30s user timer.
    timer
        .ctx
        .engine
        .respond_decision_task_completed(RespondDecisionTaskCompletedRequest {
            domain_id: workflow.domain_id.clone(),
            task_token: TaskToken::for_decision(&workflow.workflow_id, &workflow.run_id, 2, 0)
                .serialize()
                .unwrap(),
            decisions: vec![Decision::StartTimer(StartTimerAttributes {
                timer_id: "wake-up".to_string(),
                start_to_fire_timeout_secs: 30,
            })],
            execution_context: None,
            identity: "worker".to_string(),
            sticky: None,
        })
        .await
        .unwrap();

    timer.ctx.clock.advance(chrono::Duration::seconds(31));
    let mut fired = false;
    for _ in 0..WAIT_ROUNDS {
        let record = timer.ctx.mutable_state(&workflow).await;
        if record.timer_infos.is_empty() && record.execution_info.has_pending_decision() {
            fired = true;
            break;
        }
        tokio::time::sleep(WAIT_STEP).await;
    }
    assert!(fired, "user timer did not fire");

    let history = timer.ctx.history(&workflow).await;
    assert!(history
        .iter()
        .any(|event| event.event_type() == "timer_fired"));
    // The workflow did not time out: only the user timer fired.
    let record = timer.ctx.mutable_state(&workflow).await;
    assert_eq!(record.execution_info.state, WorkflowState::Running);

    let _ = timer.shutdown.send(true);
}
