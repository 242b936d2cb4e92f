// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Activity-task request handlers.
//!
//! RecordActivityTaskStarted (invoked by matching when a worker polls),
//! the three respond calls, and heartbeats. Respond calls accept tokens
//! addressing the activity either by schedule ID or by activity ID.

use tracing::{debug, instrument};

use chronik_types::request::*;
use chronik_types::token::TaskToken;
use chronik_types::{WorkflowRun, EMPTY_EVENT_ID};

use crate::engine::HistoryEngine;
use crate::error::{EngineError, Result};
use crate::mutable_state::MutableStateBuilder;

fn activity_task_not_found() -> EngineError {
    EngineError::not_exists("Activity task not found.")
}

fn workflow_completed_error() -> EngineError {
    EngineError::not_exists("Workflow execution already completed.")
}

/// Resolve the schedule ID a token addresses, going through the
/// activity-ID index for respond-by-activity-ID tokens.
fn resolve_schedule_id(token: &TaskToken, ms: &MutableStateBuilder) -> Result<i64> {
    if token.schedule_id != EMPTY_EVENT_ID {
        return Ok(token.schedule_id);
    }
    let activity_id = token
        .activity_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| {
            EngineError::bad_request("Neither ScheduleID nor ActivityID is provided.")
        })?;
    ms.get_schedule_id_by_activity_id(activity_id)
        .ok_or_else(|| EngineError::bad_request(format!("No such activity ID: {}", activity_id)))
}

impl HistoryEngine {
    /// Record an activity task as started by a polling worker.
    ///
    /// Idempotent on the poll request ID, like decision starts.
    #[instrument(skip(self, request), fields(workflow_id = %request.workflow_id, schedule_id = request.schedule_id))]
    pub async fn record_activity_task_started(
        &self,
        request: RecordActivityTaskStartedRequest,
    ) -> Result<RecordActivityTaskStartedResponse> {
        let workflow =
            WorkflowRun::new(&request.domain_id, &request.workflow_id, &request.run_id);
        let mut response = None;

        self.update_workflow_execution(&workflow, false, false, |ms| {
            if !ms.is_running() {
                return Err(workflow_completed_error());
            }
            let schedule_id = request.schedule_id;
            let Some(activity) = ms.get_activity_info(schedule_id) else {
                if schedule_id >= ms.next_event_id() {
                    return Err(EngineError::StaleState);
                }
                debug!(task_id = request.task_id, "Duplicate activity task dropped");
                return Err(activity_task_not_found());
            };
            let scheduled_event = activity.scheduled_event.clone();

            if activity.started_id != EMPTY_EVENT_ID {
                if activity.request_id == request.request_id {
                    // Same poll retried: return the prior outcome.
                    let started_event = activity
                        .started_event
                        .clone()
                        .ok_or_else(|| EngineError::internal("started activity without event"))?;
                    response = Some(RecordActivityTaskStartedResponse {
                        scheduled_event,
                        started_event,
                    });
                    return Ok(Vec::new());
                }
                debug!(task_id = request.task_id, "Activity task already started");
                return Err(EngineError::EventAlreadyStarted {
                    message: "Activity task already started.".to_string(),
                });
            }

            let start_to_close = activity.start_to_close_timeout_secs;
            let heartbeat = activity.heartbeat_timeout_secs;
            let started_event = ms
                .add_activity_task_started_event(schedule_id, &request.request_id, &request.identity)
                .ok_or_else(|| {
                    EngineError::internal("unable to add activity task started event")
                })?;
            response = Some(RecordActivityTaskStartedResponse {
                scheduled_event,
                started_event,
            });

            Ok(self.activity_started_timers(&workflow, schedule_id, start_to_close, heartbeat))
        })
        .await?;

        response.ok_or_else(|| EngineError::internal("activity start produced no response"))
    }

    /// Record a started activity as completed.
    #[instrument(skip(self, request))]
    pub async fn respond_activity_task_completed(
        &self,
        request: RespondActivityTaskCompletedRequest,
    ) -> Result<()> {
        let token = TaskToken::deserialize(&request.task_token)
            .map_err(|_| EngineError::bad_request("Error deserializing task token."))?;
        let workflow =
            WorkflowRun::new(&request.domain_id, &token.workflow_id, &token.run_id);

        self.update_workflow_execution(&workflow, false, true, |ms| {
            if !ms.is_running() {
                return Err(workflow_completed_error());
            }
            let schedule_id = resolve_schedule_id(&token, ms)?;
            let Some(activity) = ms.get_activity_info(schedule_id) else {
                if schedule_id >= ms.next_event_id() {
                    return Err(EngineError::StaleState);
                }
                return Err(activity_task_not_found());
            };
            if activity.started_id == EMPTY_EVENT_ID {
                return Err(activity_task_not_found());
            }
            let started_id = activity.started_id;
            ms.add_activity_task_completed_event(
                schedule_id,
                started_id,
                request.result.clone(),
                &request.identity,
            )
            .ok_or_else(|| {
                EngineError::internal("unable to add activity task completed event")
            })?;
            Ok(Vec::new())
        })
        .await
    }

    /// Record a started activity as failed.
    #[instrument(skip(self, request))]
    pub async fn respond_activity_task_failed(
        &self,
        request: RespondActivityTaskFailedRequest,
    ) -> Result<()> {
        let token = TaskToken::deserialize(&request.task_token)
            .map_err(|_| EngineError::bad_request("Error deserializing task token."))?;
        let workflow =
            WorkflowRun::new(&request.domain_id, &token.workflow_id, &token.run_id);

        self.update_workflow_execution(&workflow, false, true, |ms| {
            if !ms.is_running() {
                return Err(workflow_completed_error());
            }
            let schedule_id = resolve_schedule_id(&token, ms)?;
            let Some(activity) = ms.get_activity_info(schedule_id) else {
                if schedule_id >= ms.next_event_id() {
                    return Err(EngineError::StaleState);
                }
                return Err(activity_task_not_found());
            };
            if activity.started_id == EMPTY_EVENT_ID {
                return Err(activity_task_not_found());
            }
            let started_id = activity.started_id;
            ms.add_activity_task_failed_event(
                schedule_id,
                started_id,
                request.reason.clone(),
                request.details.clone(),
                &request.identity,
            )
            .ok_or_else(|| EngineError::internal("unable to add activity task failed event"))?;
            Ok(Vec::new())
        })
        .await
    }

    /// Record an activity as canceled after a cancellation request.
    #[instrument(skip(self, request))]
    pub async fn respond_activity_task_canceled(
        &self,
        request: RespondActivityTaskCanceledRequest,
    ) -> Result<()> {
        let token = TaskToken::deserialize(&request.task_token)
            .map_err(|_| EngineError::bad_request("Error deserializing task token."))?;
        let workflow =
            WorkflowRun::new(&request.domain_id, &token.workflow_id, &token.run_id);

        self.update_workflow_execution(&workflow, false, true, |ms| {
            if !ms.is_running() {
                return Err(workflow_completed_error());
            }
            let schedule_id = resolve_schedule_id(&token, ms)?;
            let Some(activity) = ms.get_activity_info(schedule_id) else {
                if schedule_id >= ms.next_event_id() {
                    return Err(EngineError::StaleState);
                }
                return Err(activity_task_not_found());
            };
            if activity.started_id == EMPTY_EVENT_ID {
                return Err(activity_task_not_found());
            }
            let started_id = activity.started_id;
            let cancel_request_event_id = activity.cancel_request_event_id;
            ms.add_activity_task_canceled_event(
                schedule_id,
                started_id,
                cancel_request_event_id,
                request.details.clone(),
                &request.identity,
            )
            .ok_or_else(|| {
                EngineError::internal("unable to add activity task canceled event")
            })?;
            Ok(Vec::new())
        })
        .await
    }

    /// Record activity liveness/progress. Touches mutable state only; no
    /// history event. Reports whether cancellation has been requested so
    /// the worker can stop.
    #[instrument(skip(self, request))]
    pub async fn record_activity_task_heartbeat(
        &self,
        request: RecordActivityTaskHeartbeatRequest,
    ) -> Result<RecordActivityTaskHeartbeatResponse> {
        let token = TaskToken::deserialize(&request.task_token)
            .map_err(|_| EngineError::bad_request("Error deserializing task token."))?;
        let workflow =
            WorkflowRun::new(&request.domain_id, &token.workflow_id, &token.run_id);

        let mut cancel_requested = false;
        self.update_workflow_execution(&workflow, false, false, |ms| {
            if !ms.is_running() {
                return Err(workflow_completed_error());
            }
            let schedule_id = resolve_schedule_id(&token, ms)?;
            let Some(activity) = ms.get_activity_info(schedule_id) else {
                if schedule_id >= ms.next_event_id() {
                    return Err(EngineError::StaleState);
                }
                return Err(activity_task_not_found());
            };
            if activity.started_id == EMPTY_EVENT_ID {
                return Err(activity_task_not_found());
            }
            cancel_requested = activity.cancel_requested;
            ms.update_activity_progress(schedule_id, request.details.clone());
            Ok(Vec::new())
        })
        .await?;

        Ok(RecordActivityTaskHeartbeatResponse { cancel_requested })
    }
}
