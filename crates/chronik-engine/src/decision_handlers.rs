// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Decision-task request handlers.
//!
//! RecordDecisionTaskStarted (invoked by matching when a worker polls),
//! RespondDecisionTaskCompleted (the state-machine driver applying the
//! worker's commands in order) and RespondDecisionTaskFailed.
//!
//! A command that fails validation fails the whole decision: the accumulated
//! session is rolled back by clearing the cached context, a
//! DecisionTaskFailed event is appended against a fresh load, and a new
//! decision is scheduled so the worker can retry with the offending command
//! fixed.

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use chronik_types::decision::Decision;
use chronik_types::event::DecisionTaskFailedCause;
use chronik_types::request::*;
use chronik_types::task::{TimerTask, TransferTask, TransferTaskKind};
use chronik_types::token::TaskToken;
use chronik_types::{WorkflowRun, EMPTY_EVENT_ID};

use crate::engine::HistoryEngine;
use crate::error::{EngineError, Result};
use crate::mutable_state::{DecisionInfo, MutableStateBuilder};

const ACTIVITY_ID_UNKNOWN: &str = "ACTIVITY_ID_UNKNOWN";
const ACTIVITY_NOT_STARTED: &str = "ACTIVITY_ID_NOT_STARTED";
const TIMER_ID_UNKNOWN: &str = "TIMER_ID_UNKNOWN";

impl HistoryEngine {
    /// Record a decision task as started by a polling worker.
    ///
    /// Idempotent on the poll request ID: a retry with the same ID returns
    /// the prior positive response; a different ID observes
    /// `EventAlreadyStarted`.
    #[instrument(skip(self, request), fields(workflow_id = %request.workflow_id, schedule_id = request.schedule_id))]
    pub async fn record_decision_task_started(
        &self,
        request: RecordDecisionTaskStartedRequest,
    ) -> Result<RecordDecisionTaskStartedResponse> {
        let workflow =
            WorkflowRun::new(&request.domain_id, &request.workflow_id, &request.run_id);
        let mut ctx = self.cache.acquire(&workflow).await;

        for _attempt in 0..self.config.conditional_retry_count {
            let ms = ctx.load().await?;
            let schedule_id = request.schedule_id;
            let decision = ms.get_pending_decision(schedule_id);

            // A schedule ID at or past next-event-id means the cache trails
            // storage; reload before concluding the task is gone.
            if decision.is_none() && schedule_id >= ms.next_event_id() {
                debug!("Decision schedule ID ahead of mutable state, reloading");
                ctx.clear();
                continue;
            }

            let Some(decision) = decision else {
                debug!(task_id = request.task_id, "Duplicate decision task dropped");
                return Err(EngineError::not_exists("Decision task not found."));
            };
            if !ms.is_running() {
                return Err(EngineError::not_exists("Decision task not found."));
            }

            if decision.started_id != EMPTY_EVENT_ID {
                if decision.request_id == request.request_id {
                    // Same poll retried: return the prior outcome.
                    let response = build_started_response(ms, &decision, &request.identity);
                    ctx.release();
                    return Ok(response);
                }
                debug!(task_id = request.task_id, "Decision task already started");
                return Err(EngineError::EventAlreadyStarted {
                    message: "Decision task already started.".to_string(),
                });
            }

            let decision = ms
                .add_decision_task_started_event(schedule_id, &request.request_id, &request.identity)
                .ok_or_else(|| {
                    EngineError::internal("unable to add decision task started event")
                })?;

            let timer_tasks = vec![self.decision_timeout_timer(
                &workflow,
                schedule_id,
                decision.attempt,
                decision.timeout_secs,
            )];

            let failover_version = self.replication_version(&workflow.domain_id);
            match ctx
                .update_workflow_execution(Vec::new(), timer_tasks, failover_version)
                .await
            {
                Err(EngineError::Conflict) => continue,
                Err(err) => return Err(err),
                Ok(()) => {
                    let ms = ctx
                        .mutable_state()
                        .ok_or_else(|| EngineError::internal("mutable state gone after update"))?;
                    let response = build_started_response(ms, &decision, &request.identity);
                    ctx.release();
                    return Ok(response);
                }
            }
        }
        Err(EngineError::MaxAttemptsExceeded)
    }

    /// Complete a decision task and apply its commands in order.
    #[instrument(skip(self, request))]
    pub async fn respond_decision_task_completed(
        &self,
        request: RespondDecisionTaskCompletedRequest,
    ) -> Result<()> {
        let token = TaskToken::deserialize(&request.task_token)
            .map_err(|_| EngineError::bad_request("Error deserializing task token."))?;
        let workflow =
            WorkflowRun::new(&request.domain_id, &token.workflow_id, &token.run_id);
        let mut ctx = self.cache.acquire(&workflow).await;

        for _attempt in 0..self.config.conditional_retry_count {
            let ms = ctx.load().await?;
            let schedule_id = token.schedule_id;
            let decision = ms.get_pending_decision(schedule_id);

            if decision.is_none() && schedule_id >= ms.next_event_id() {
                ctx.clear();
                continue;
            }
            let Some(decision) = decision else {
                return Err(EngineError::not_exists("Decision task not found."));
            };
            if !ms.is_running()
                || decision.attempt != token.schedule_attempt
                || decision.started_id == EMPTY_EVENT_ID
            {
                return Err(EngineError::not_exists("Decision task not found."));
            }
            let started_id = decision.started_id;

            // Buffered events captured before completion decide whether a
            // terminal command is allowed and whether a follow-up decision
            // is needed.
            let mut has_unhandled_events = ms.has_buffered_events();

            match &request.sticky {
                Some(sticky) => ms.set_sticky(
                    sticky.worker_task_list.clone(),
                    sticky.schedule_to_start_timeout_secs,
                ),
                None => ms.clear_sticky(),
            }
            ms.execution_info.execution_context = request.execution_context.clone();

            let completed_id = ms
                .add_decision_task_completed_event(schedule_id, started_id, &request.identity)
                .ok_or_else(|| {
                    EngineError::internal("unable to add decision task completed event")
                })?;

            let mut transfer_tasks: Vec<TransferTask> = Vec::new();
            let mut timer_tasks: Vec<TimerTask> = Vec::new();
            let mut is_complete = false;
            let mut fail_cause: Option<DecisionTaskFailedCause> = None;

            for decision_command in &request.decisions {
                let outcome = self.apply_decision_command(
                    &workflow,
                    ms,
                    decision_command,
                    completed_id,
                    has_unhandled_events,
                    &mut is_complete,
                    &mut transfer_tasks,
                    &mut timer_tasks,
                    &request.identity,
                )?;
                if let Some(cause) = outcome {
                    fail_cause = Some(cause);
                    break;
                }
            }

            if let Some(cause) = fail_cause {
                info!(?cause, "Failing decision task");
                // Roll the accumulated session back and record only the
                // failure against a fresh load.
                ctx.clear();
                let ms = ctx.load().await?;
                ms.add_decision_task_failed_event(
                    schedule_id,
                    started_id,
                    cause,
                    None,
                    &request.identity,
                )
                .ok_or_else(|| {
                    EngineError::internal("unable to add decision task failed event")
                })?;
                is_complete = false;
                has_unhandled_events = true;
                transfer_tasks.clear();
                timer_tasks.clear();
            }

            let ms = ctx
                .mutable_state()
                .ok_or_else(|| EngineError::internal("mutable state gone"))?;

            // New events during the decision (or a failed decision) get a
            // follow-up decision scheduled immediately.
            if has_unhandled_events && ms.is_running() && !ms.has_pending_decision() {
                let next_decision = ms
                    .add_decision_task_scheduled_event()
                    .ok_or_else(|| EngineError::internal("failed to schedule decision task"))?;
                transfer_tasks.push(TransferTask {
                    task_id: 0,
                    workflow: workflow.clone(),
                    version: 0,
                    kind: TransferTaskKind::DecisionTask {
                        task_list: ms.decision_task_list(),
                        schedule_id: next_decision.schedule_id,
                    },
                });
                if ms.is_sticky_enabled() {
                    timer_tasks.push(self.decision_schedule_to_start_timer(
                        &workflow,
                        next_decision.schedule_id,
                        next_decision.attempt,
                        ms.execution_info.sticky_schedule_to_start_timeout_secs,
                    ));
                }
            }

            if is_complete {
                let (close_task, cleanup_timer) = self.close_workflow_tasks(&workflow);
                transfer_tasks.push(close_task);
                timer_tasks.push(cleanup_timer);
            }

            let failover_version = self.replication_version(&workflow.domain_id);
            match ctx
                .update_workflow_execution(transfer_tasks, timer_tasks, failover_version)
                .await
            {
                Err(EngineError::Conflict) => continue,
                Err(err) => return Err(err),
                Ok(()) => {
                    ctx.release();
                    return Ok(());
                }
            }
        }
        Err(EngineError::MaxAttemptsExceeded)
    }

    /// Apply one decision command. Returns `Ok(Some(cause))` when the
    /// command fails validation and the decision must be failed.
    #[allow(clippy::too_many_arguments)]
    fn apply_decision_command(
        &self,
        workflow: &WorkflowRun,
        ms: &mut MutableStateBuilder,
        command: &Decision,
        completed_id: i64,
        has_unhandled_events: bool,
        is_complete: &mut bool,
        transfer_tasks: &mut Vec<TransferTask>,
        timer_tasks: &mut Vec<TimerTask>,
        identity: &str,
    ) -> Result<Option<DecisionTaskFailedCause>> {
        use DecisionTaskFailedCause as Cause;
        match command {
            Decision::ScheduleActivityTask(attrs) => {
                if attrs.activity_id.is_empty()
                    || attrs.activity_type.is_empty()
                    || attrs.task_list.is_empty()
                    || attrs.schedule_to_close_timeout_secs <= 0
                    || attrs.schedule_to_start_timeout_secs <= 0
                    || attrs.start_to_close_timeout_secs <= 0
                    || attrs.heartbeat_timeout_secs < 0
                {
                    return Ok(Some(Cause::BadScheduleActivityAttributes));
                }
                let target_domain_id = attrs
                    .domain_id
                    .clone()
                    .unwrap_or_else(|| workflow.domain_id.clone());
                let Some(activity) = ms.add_activity_task_scheduled_event(completed_id, attrs)
                else {
                    return Ok(Some(Cause::BadScheduleActivityAttributes));
                };
                transfer_tasks.push(TransferTask {
                    task_id: 0,
                    workflow: workflow.clone(),
                    version: 0,
                    kind: TransferTaskKind::ActivityTask {
                        target_domain_id,
                        task_list: attrs.task_list.clone(),
                        schedule_id: activity.schedule_id,
                    },
                });
                timer_tasks.extend(self.activity_scheduled_timers(
                    workflow,
                    activity.schedule_id,
                    activity.schedule_to_start_timeout_secs,
                    activity.schedule_to_close_timeout_secs,
                ));
            }

            Decision::RequestCancelActivityTask(attrs) => {
                if attrs.activity_id.is_empty() {
                    return Ok(Some(Cause::BadRequestCancelActivityAttributes));
                }
                match ms.add_activity_cancel_requested_event(completed_id, &attrs.activity_id) {
                    None => {
                        ms.add_request_cancel_activity_task_failed_event(
                            completed_id,
                            &attrs.activity_id,
                            ACTIVITY_ID_UNKNOWN,
                        );
                    }
                    Some((cancel_event_id, activity)) => {
                        if activity.started_id == EMPTY_EVENT_ID {
                            // Not started yet: cancel immediately.
                            let _ = ms.add_activity_task_canceled_event(
                                activity.schedule_id,
                                activity.started_id,
                                cancel_event_id,
                                Some(ACTIVITY_NOT_STARTED.as_bytes().to_vec()),
                                identity,
                            );
                        }
                    }
                }
            }

            Decision::StartTimer(attrs) => {
                if attrs.timer_id.is_empty() || attrs.start_to_fire_timeout_secs <= 0 {
                    return Ok(Some(Cause::BadStartTimerAttributes));
                }
                let Some(timer) = ms.add_timer_started_event(
                    completed_id,
                    &attrs.timer_id,
                    attrs.start_to_fire_timeout_secs,
                ) else {
                    return Ok(Some(Cause::StartTimerDuplicateId));
                };
                timer_tasks.push(self.user_timer_task(
                    workflow,
                    &timer.timer_id,
                    timer.started_event_id,
                    timer.expiry,
                ));
            }

            Decision::CancelTimer(attrs) => {
                if attrs.timer_id.is_empty() {
                    return Ok(Some(Cause::BadCancelTimerAttributes));
                }
                if ms
                    .add_timer_canceled_event(completed_id, &attrs.timer_id, identity)
                    .is_none()
                {
                    ms.add_cancel_timer_failed_event(
                        completed_id,
                        &attrs.timer_id,
                        TIMER_ID_UNKNOWN,
                        identity,
                    );
                }
            }

            Decision::RecordMarker(attrs) => {
                if attrs.marker_name.is_empty() {
                    return Ok(Some(Cause::BadRecordMarkerAttributes));
                }
                ms.add_marker_recorded_event(completed_id, &attrs.marker_name, attrs.details.clone());
            }

            Decision::CompleteWorkflowExecution(attrs) => {
                if has_unhandled_events {
                    return Ok(Some(Cause::UnhandledDecision));
                }
                if *is_complete {
                    warn!("Dropping extra workflow completion command");
                    return Ok(None);
                }
                ms.add_completed_workflow_event(completed_id, attrs.result.clone())
                    .ok_or_else(|| EngineError::internal("unable to add complete workflow event"))?;
                *is_complete = true;
            }

            Decision::FailWorkflowExecution(attrs) => {
                if has_unhandled_events {
                    return Ok(Some(Cause::UnhandledDecision));
                }
                if *is_complete {
                    warn!("Dropping extra workflow completion command");
                    return Ok(None);
                }
                ms.add_fail_workflow_event(completed_id, attrs.reason.clone(), attrs.details.clone())
                    .ok_or_else(|| EngineError::internal("unable to add fail workflow event"))?;
                *is_complete = true;
            }

            Decision::CancelWorkflowExecution(attrs) => {
                if has_unhandled_events {
                    return Ok(Some(Cause::UnhandledDecision));
                }
                if *is_complete {
                    warn!("Dropping extra workflow completion command");
                    return Ok(None);
                }
                ms.add_workflow_canceled_event(completed_id, attrs.details.clone())
                    .ok_or_else(|| EngineError::internal("unable to add cancel workflow event"))?;
                *is_complete = true;
            }

            Decision::ContinueAsNewWorkflowExecution(attrs) => {
                if has_unhandled_events {
                    return Ok(Some(Cause::UnhandledDecision));
                }
                if *is_complete {
                    warn!("Dropping extra workflow completion command");
                    return Ok(None);
                }
                let new_run_id = self.new_run_id();
                ms.add_continue_as_new_event(completed_id, &new_run_id, attrs)
                    .ok_or_else(|| EngineError::internal("unable to add continue-as-new event"))?;
                *is_complete = true;
            }

            Decision::StartChildWorkflowExecution(attrs) => {
                if attrs.workflow_id.is_empty() || attrs.workflow_type.is_empty() {
                    return Ok(Some(Cause::BadStartChildExecutionAttributes));
                }
                let target_domain_id = attrs
                    .domain_id
                    .clone()
                    .unwrap_or_else(|| workflow.domain_id.clone());
                let info = &ms.execution_info;
                let task_list = attrs
                    .task_list
                    .clone()
                    .filter(|t| !t.is_empty())
                    .unwrap_or_else(|| info.task_list.clone());
                let execution_timeout_secs = if attrs.execution_timeout_secs > 0 {
                    attrs.execution_timeout_secs
                } else {
                    info.workflow_timeout_secs
                };
                let decision_timeout_secs = if attrs.decision_timeout_secs > 0 {
                    attrs.decision_timeout_secs
                } else {
                    info.decision_timeout_secs
                };
                let create_request_id = Uuid::new_v4().to_string();
                let initiated_id = ms
                    .add_start_child_initiated_event(
                        completed_id,
                        &create_request_id,
                        &target_domain_id,
                        &attrs.workflow_id,
                        &attrs.workflow_type,
                        &task_list,
                        attrs.input.clone(),
                        execution_timeout_secs,
                        decision_timeout_secs,
                    )
                    .ok_or_else(|| {
                        EngineError::internal("unable to add child initiated event")
                    })?;
                transfer_tasks.push(TransferTask {
                    task_id: 0,
                    workflow: workflow.clone(),
                    version: 0,
                    kind: TransferTaskKind::StartChildExecution {
                        target_domain_id,
                        target_workflow_id: attrs.workflow_id.clone(),
                        initiated_id,
                    },
                });
            }

            Decision::RequestCancelExternalWorkflowExecution(attrs) => {
                if attrs.workflow_id.is_empty() || !valid_optional_run_id(&attrs.run_id) {
                    return Ok(Some(
                        Cause::BadRequestCancelExternalWorkflowExecutionAttributes,
                    ));
                }
                let target_domain_id = attrs
                    .domain_id
                    .clone()
                    .unwrap_or_else(|| workflow.domain_id.clone());
                // Fresh request ID for target-side deduplication.
                let cancel_request_id = Uuid::new_v4().to_string();
                let initiated_id = ms
                    .add_request_cancel_external_initiated_event(
                        completed_id,
                        &cancel_request_id,
                        &target_domain_id,
                        &attrs.workflow_id,
                        attrs.run_id.clone(),
                        attrs.child_workflow_only,
                    )
                    .ok_or_else(|| {
                        EngineError::internal("unable to add external cancel request")
                    })?;
                transfer_tasks.push(TransferTask {
                    task_id: 0,
                    workflow: workflow.clone(),
                    version: 0,
                    kind: TransferTaskKind::CancelExecution {
                        target_domain_id,
                        target_workflow_id: attrs.workflow_id.clone(),
                        target_run_id: attrs.run_id.clone(),
                        target_child_workflow_only: attrs.child_workflow_only,
                        initiated_id,
                    },
                });
            }

            Decision::SignalExternalWorkflowExecution(attrs) => {
                if attrs.workflow_id.is_empty()
                    || attrs.signal_name.is_empty()
                    || !valid_optional_run_id(&attrs.run_id)
                {
                    return Ok(Some(Cause::BadSignalWorkflowExecutionAttributes));
                }
                let target_domain_id = attrs
                    .domain_id
                    .clone()
                    .unwrap_or_else(|| workflow.domain_id.clone());
                let signal_request_id = Uuid::new_v4().to_string();
                let initiated_id = ms
                    .add_signal_external_initiated_event(
                        completed_id,
                        &signal_request_id,
                        &target_domain_id,
                        &attrs.workflow_id,
                        attrs.run_id.clone(),
                        &attrs.signal_name,
                        attrs.input.clone(),
                        attrs.child_workflow_only,
                    )
                    .ok_or_else(|| {
                        EngineError::internal("unable to add external signal request")
                    })?;
                transfer_tasks.push(TransferTask {
                    task_id: 0,
                    workflow: workflow.clone(),
                    version: 0,
                    kind: TransferTaskKind::SignalExecution {
                        target_domain_id,
                        target_workflow_id: attrs.workflow_id.clone(),
                        target_run_id: attrs.run_id.clone(),
                        target_child_workflow_only: attrs.child_workflow_only,
                        initiated_id,
                    },
                });
            }
        }
        Ok(None)
    }

    /// Fail a decision task on worker request; a retry is scheduled
    /// immediately.
    #[instrument(skip(self, request))]
    pub async fn respond_decision_task_failed(
        &self,
        request: RespondDecisionTaskFailedRequest,
    ) -> Result<()> {
        let token = TaskToken::deserialize(&request.task_token)
            .map_err(|_| EngineError::bad_request("Error deserializing task token."))?;
        let workflow =
            WorkflowRun::new(&request.domain_id, &token.workflow_id, &token.run_id);

        self.update_workflow_execution(&workflow, false, true, |ms| {
            if !ms.is_running() {
                return Err(EngineError::not_exists(
                    "Workflow execution already completed.",
                ));
            }
            let decision = ms
                .get_pending_decision(token.schedule_id)
                .filter(|decision| {
                    decision.attempt == token.schedule_attempt
                        && decision.started_id != EMPTY_EVENT_ID
                })
                .ok_or_else(|| EngineError::not_exists("Decision task not found."))?;
            ms.add_decision_task_failed_event(
                decision.schedule_id,
                decision.started_id,
                request.cause,
                request.details.clone(),
                &request.identity,
            )
            .ok_or_else(|| EngineError::internal("unable to add decision task failed event"))?;
            Ok(Vec::new())
        })
        .await
    }
}

fn valid_optional_run_id(run_id: &Option<String>) -> bool {
    match run_id {
        Some(run_id) if !run_id.is_empty() => Uuid::parse_str(run_id).is_ok(),
        _ => true,
    }
}

fn build_started_response(
    ms: &MutableStateBuilder,
    decision: &DecisionInfo,
    identity: &str,
) -> RecordDecisionTaskStartedResponse {
    let transient_decision = (decision.attempt > 0).then(|| {
        let (scheduled_event, started_event) =
            ms.create_transient_decision_events(decision, identity);
        TransientDecisionInfo {
            scheduled_event,
            started_event,
        }
    });
    let info = &ms.execution_info;
    RecordDecisionTaskStartedResponse {
        workflow_type: info.workflow_type.clone(),
        previous_started_event_id: (info.last_processed_event != EMPTY_EVENT_ID)
            .then_some(info.last_processed_event),
        scheduled_event_id: decision.schedule_id,
        started_event_id: decision.started_id,
        next_event_id: info.next_event_id,
        attempt: decision.attempt,
        sticky_execution_enabled: !info.sticky_task_list.is_empty(),
        transient_decision,
    }
}
