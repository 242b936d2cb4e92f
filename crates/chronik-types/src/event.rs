// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! History events.
//!
//! A run's history is an append-only sequence of [`HistoryEvent`]s with
//! 1-based, strictly increasing event IDs. Events are the source of truth;
//! the engine's mutable state is a projection derived from them.
//!
//! The attribute payload is a tagged enum so batches serialize to
//! self-describing JSON and unknown variants fail deserialization loudly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::TimeoutType;

/// A single entry in a run's event history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    /// 1-based position within the run's history.
    pub event_id: i64,
    /// When the engine built the event.
    pub timestamp: DateTime<Utc>,
    /// Type-specific payload.
    pub attributes: EventAttributes,
}

impl HistoryEvent {
    /// Stable name of the event type, for logs and visibility records.
    pub fn event_type(&self) -> &'static str {
        self.attributes.event_type()
    }
}

/// Why a decision task was failed by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
pub enum DecisionTaskFailedCause {
    /// Events arrived while the decision was in flight; the worker must see
    /// them before a terminal command is accepted.
    UnhandledDecision,
    /// A StartTimer command reused a timer ID that is still pending.
    StartTimerDuplicateId,
    /// ScheduleActivityTask attributes failed validation.
    BadScheduleActivityAttributes,
    /// RequestCancelActivityTask attributes failed validation.
    BadRequestCancelActivityAttributes,
    /// StartTimer attributes failed validation.
    BadStartTimerAttributes,
    /// CancelTimer attributes failed validation.
    BadCancelTimerAttributes,
    /// RecordMarker attributes failed validation.
    BadRecordMarkerAttributes,
    /// CompleteWorkflowExecution attributes failed validation.
    BadCompleteWorkflowExecutionAttributes,
    /// FailWorkflowExecution attributes failed validation.
    BadFailWorkflowExecutionAttributes,
    /// CancelWorkflowExecution attributes failed validation.
    BadCancelWorkflowExecutionAttributes,
    /// ContinueAsNewWorkflowExecution attributes failed validation.
    BadContinueAsNewAttributes,
    /// StartChildWorkflowExecution attributes failed validation.
    BadStartChildExecutionAttributes,
    /// RequestCancelExternalWorkflowExecution attributes failed validation.
    BadRequestCancelExternalWorkflowExecutionAttributes,
    /// SignalExternalWorkflowExecution attributes failed validation.
    BadSignalWorkflowExecutionAttributes,
    /// The worker reported failure through RespondDecisionTaskFailed.
    WorkerRequestFailure,
}

/// Why dispatching a request-cancel to an external workflow failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
pub enum CancelExternalFailedCause {
    /// The target workflow does not exist or is already closed.
    UnknownExternalWorkflowExecution,
}

/// Why dispatching a signal to an external workflow failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
pub enum SignalExternalFailedCause {
    /// The target workflow does not exist or is already closed.
    UnknownExternalWorkflowExecution,
}

/// Why starting a child workflow failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ChildWorkflowFailedCause {
    /// A run with the child's workflow ID already exists.
    WorkflowAlreadyRunning,
}

/// Type-specific event payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum EventAttributes {
    WorkflowExecutionStarted(WorkflowExecutionStartedAttributes),
    WorkflowExecutionCompleted(WorkflowExecutionCompletedAttributes),
    WorkflowExecutionFailed(WorkflowExecutionFailedAttributes),
    WorkflowExecutionCanceled(WorkflowExecutionCanceledAttributes),
    WorkflowExecutionTerminated(WorkflowExecutionTerminatedAttributes),
    WorkflowExecutionTimedOut(WorkflowExecutionTimedOutAttributes),
    WorkflowExecutionContinuedAsNew(WorkflowExecutionContinuedAsNewAttributes),
    WorkflowExecutionSignaled(WorkflowExecutionSignaledAttributes),
    WorkflowExecutionCancelRequested(WorkflowExecutionCancelRequestedAttributes),
    DecisionTaskScheduled(DecisionTaskScheduledAttributes),
    DecisionTaskStarted(DecisionTaskStartedAttributes),
    DecisionTaskCompleted(DecisionTaskCompletedAttributes),
    DecisionTaskFailed(DecisionTaskFailedAttributes),
    DecisionTaskTimedOut(DecisionTaskTimedOutAttributes),
    ActivityTaskScheduled(ActivityTaskScheduledAttributes),
    ActivityTaskStarted(ActivityTaskStartedAttributes),
    ActivityTaskCompleted(ActivityTaskCompletedAttributes),
    ActivityTaskFailed(ActivityTaskFailedAttributes),
    ActivityTaskCanceled(ActivityTaskCanceledAttributes),
    ActivityTaskTimedOut(ActivityTaskTimedOutAttributes),
    ActivityTaskCancelRequested(ActivityTaskCancelRequestedAttributes),
    RequestCancelActivityTaskFailed(RequestCancelActivityTaskFailedAttributes),
    TimerStarted(TimerStartedAttributes),
    TimerFired(TimerFiredAttributes),
    TimerCanceled(TimerCanceledAttributes),
    CancelTimerFailed(CancelTimerFailedAttributes),
    MarkerRecorded(MarkerRecordedAttributes),
    RequestCancelExternalWorkflowExecutionInitiated(
        RequestCancelExternalWorkflowExecutionInitiatedAttributes,
    ),
    RequestCancelExternalWorkflowExecutionFailed(
        RequestCancelExternalWorkflowExecutionFailedAttributes,
    ),
    ExternalWorkflowExecutionCancelRequested(ExternalWorkflowExecutionCancelRequestedAttributes),
    SignalExternalWorkflowExecutionInitiated(SignalExternalWorkflowExecutionInitiatedAttributes),
    SignalExternalWorkflowExecutionFailed(SignalExternalWorkflowExecutionFailedAttributes),
    ExternalWorkflowExecutionSignaled(ExternalWorkflowExecutionSignaledAttributes),
    StartChildWorkflowExecutionInitiated(StartChildWorkflowExecutionInitiatedAttributes),
    StartChildWorkflowExecutionFailed(StartChildWorkflowExecutionFailedAttributes),
    ChildWorkflowExecutionStarted(ChildWorkflowExecutionStartedAttributes),
    ChildWorkflowExecutionCompleted(ChildWorkflowExecutionCompletedAttributes),
    ChildWorkflowExecutionFailed(ChildWorkflowExecutionFailedAttributes),
    ChildWorkflowExecutionCanceled(ChildWorkflowExecutionCanceledAttributes),
    ChildWorkflowExecutionTerminated(ChildWorkflowExecutionTerminatedAttributes),
    ChildWorkflowExecutionTimedOut(ChildWorkflowExecutionTimedOutAttributes),
}

impl EventAttributes {
    /// Stable name of the event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::WorkflowExecutionStarted(_) => "workflow_execution_started",
            Self::WorkflowExecutionCompleted(_) => "workflow_execution_completed",
            Self::WorkflowExecutionFailed(_) => "workflow_execution_failed",
            Self::WorkflowExecutionCanceled(_) => "workflow_execution_canceled",
            Self::WorkflowExecutionTerminated(_) => "workflow_execution_terminated",
            Self::WorkflowExecutionTimedOut(_) => "workflow_execution_timed_out",
            Self::WorkflowExecutionContinuedAsNew(_) => "workflow_execution_continued_as_new",
            Self::WorkflowExecutionSignaled(_) => "workflow_execution_signaled",
            Self::WorkflowExecutionCancelRequested(_) => "workflow_execution_cancel_requested",
            Self::DecisionTaskScheduled(_) => "decision_task_scheduled",
            Self::DecisionTaskStarted(_) => "decision_task_started",
            Self::DecisionTaskCompleted(_) => "decision_task_completed",
            Self::DecisionTaskFailed(_) => "decision_task_failed",
            Self::DecisionTaskTimedOut(_) => "decision_task_timed_out",
            Self::ActivityTaskScheduled(_) => "activity_task_scheduled",
            Self::ActivityTaskStarted(_) => "activity_task_started",
            Self::ActivityTaskCompleted(_) => "activity_task_completed",
            Self::ActivityTaskFailed(_) => "activity_task_failed",
            Self::ActivityTaskCanceled(_) => "activity_task_canceled",
            Self::ActivityTaskTimedOut(_) => "activity_task_timed_out",
            Self::ActivityTaskCancelRequested(_) => "activity_task_cancel_requested",
            Self::RequestCancelActivityTaskFailed(_) => "request_cancel_activity_task_failed",
            Self::TimerStarted(_) => "timer_started",
            Self::TimerFired(_) => "timer_fired",
            Self::TimerCanceled(_) => "timer_canceled",
            Self::CancelTimerFailed(_) => "cancel_timer_failed",
            Self::MarkerRecorded(_) => "marker_recorded",
            Self::RequestCancelExternalWorkflowExecutionInitiated(_) => {
                "request_cancel_external_workflow_execution_initiated"
            }
            Self::RequestCancelExternalWorkflowExecutionFailed(_) => {
                "request_cancel_external_workflow_execution_failed"
            }
            Self::ExternalWorkflowExecutionCancelRequested(_) => {
                "external_workflow_execution_cancel_requested"
            }
            Self::SignalExternalWorkflowExecutionInitiated(_) => {
                "signal_external_workflow_execution_initiated"
            }
            Self::SignalExternalWorkflowExecutionFailed(_) => {
                "signal_external_workflow_execution_failed"
            }
            Self::ExternalWorkflowExecutionSignaled(_) => "external_workflow_execution_signaled",
            Self::StartChildWorkflowExecutionInitiated(_) => {
                "start_child_workflow_execution_initiated"
            }
            Self::StartChildWorkflowExecutionFailed(_) => "start_child_workflow_execution_failed",
            Self::ChildWorkflowExecutionStarted(_) => "child_workflow_execution_started",
            Self::ChildWorkflowExecutionCompleted(_) => "child_workflow_execution_completed",
            Self::ChildWorkflowExecutionFailed(_) => "child_workflow_execution_failed",
            Self::ChildWorkflowExecutionCanceled(_) => "child_workflow_execution_canceled",
            Self::ChildWorkflowExecutionTerminated(_) => "child_workflow_execution_terminated",
            Self::ChildWorkflowExecutionTimedOut(_) => "child_workflow_execution_timed_out",
        }
    }

    /// Whether this event is a terminal event for the run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowExecutionCompleted(_)
                | Self::WorkflowExecutionFailed(_)
                | Self::WorkflowExecutionCanceled(_)
                | Self::WorkflowExecutionTerminated(_)
                | Self::WorkflowExecutionTimedOut(_)
                | Self::WorkflowExecutionContinuedAsNew(_)
        )
    }
}

/// Attributes of the first event of every run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct WorkflowExecutionStartedAttributes {
    pub workflow_type: String,
    pub task_list: String,
    pub input: Option<Vec<u8>>,
    pub execution_timeout_secs: i32,
    pub decision_timeout_secs: i32,
    pub identity: String,
    /// Set when this run was started as a child workflow.
    pub parent_workflow_id: Option<String>,
    /// Set when this run was started as a child workflow.
    pub parent_run_id: Option<String>,
    /// Set when this run continues a previous run of the same workflow ID.
    pub continued_from_run_id: Option<String>,
}

/// Terminal event: the workflow completed successfully.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct WorkflowExecutionCompletedAttributes {
    pub decision_task_completed_event_id: i64,
    pub result: Option<Vec<u8>>,
}

/// Terminal event: the workflow failed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct WorkflowExecutionFailedAttributes {
    pub decision_task_completed_event_id: i64,
    pub reason: String,
    pub details: Option<Vec<u8>>,
}

/// Terminal event: the workflow acknowledged a cancellation request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct WorkflowExecutionCanceledAttributes {
    pub decision_task_completed_event_id: i64,
    pub details: Option<Vec<u8>>,
}

/// Terminal event: the workflow was terminated without consulting a worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct WorkflowExecutionTerminatedAttributes {
    pub reason: String,
    pub details: Option<Vec<u8>>,
    pub identity: String,
}

/// Terminal event: the execution timeout fired.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct WorkflowExecutionTimedOutAttributes {
    pub timeout_type: TimeoutType,
}

/// Terminal event: the run closed and a successor run was created atomically.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct WorkflowExecutionContinuedAsNewAttributes {
    pub decision_task_completed_event_id: i64,
    pub new_run_id: String,
    pub workflow_type: String,
    pub task_list: String,
    pub input: Option<Vec<u8>>,
    pub execution_timeout_secs: i32,
    pub decision_timeout_secs: i32,
}

/// An external signal was delivered to the run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct WorkflowExecutionSignaledAttributes {
    pub signal_name: String,
    pub input: Option<Vec<u8>>,
    pub identity: String,
}

/// Cancellation of the run was requested; the workflow decides how to react.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct WorkflowExecutionCancelRequestedAttributes {
    pub cause: String,
    pub identity: String,
    /// Workflow that issued the request, when it came from another run.
    pub external_workflow_id: Option<String>,
    /// Run that issued the request, when it came from another run.
    pub external_run_id: Option<String>,
}

/// A decision task was scheduled for dispatch to a worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct DecisionTaskScheduledAttributes {
    pub task_list: String,
    pub start_to_close_timeout_secs: i32,
    pub attempt: i64,
}

/// A worker picked the decision task up.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct DecisionTaskStartedAttributes {
    pub scheduled_event_id: i64,
    pub identity: String,
    pub request_id: String,
}

/// The worker returned its decisions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct DecisionTaskCompletedAttributes {
    pub scheduled_event_id: i64,
    pub started_event_id: i64,
    pub identity: String,
}

/// The decision task failed and will be rescheduled.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct DecisionTaskFailedAttributes {
    pub scheduled_event_id: i64,
    pub started_event_id: i64,
    pub cause: DecisionTaskFailedCause,
    pub details: Option<Vec<u8>>,
    pub identity: String,
}

/// The decision task hit one of its deadlines.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct DecisionTaskTimedOutAttributes {
    pub scheduled_event_id: i64,
    pub started_event_id: i64,
    pub timeout_type: TimeoutType,
}

/// An activity task was scheduled for dispatch to a worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ActivityTaskScheduledAttributes {
    pub activity_id: String,
    pub activity_type: String,
    pub task_list: String,
    pub input: Option<Vec<u8>>,
    pub schedule_to_close_timeout_secs: i32,
    pub schedule_to_start_timeout_secs: i32,
    pub start_to_close_timeout_secs: i32,
    pub heartbeat_timeout_secs: i32,
    pub decision_task_completed_event_id: i64,
}

/// A worker picked the activity task up.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ActivityTaskStartedAttributes {
    pub scheduled_event_id: i64,
    pub identity: String,
    pub request_id: String,
}

/// The activity finished successfully.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ActivityTaskCompletedAttributes {
    pub scheduled_event_id: i64,
    pub started_event_id: i64,
    pub result: Option<Vec<u8>>,
    pub identity: String,
}

/// The activity reported failure.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ActivityTaskFailedAttributes {
    pub scheduled_event_id: i64,
    pub started_event_id: i64,
    pub reason: String,
    pub details: Option<Vec<u8>>,
    pub identity: String,
}

/// The activity acknowledged a cancellation request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ActivityTaskCanceledAttributes {
    pub scheduled_event_id: i64,
    pub started_event_id: i64,
    pub latest_cancel_requested_event_id: i64,
    pub details: Option<Vec<u8>>,
    pub identity: String,
}

/// The activity hit one of its deadlines.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ActivityTaskTimedOutAttributes {
    pub scheduled_event_id: i64,
    pub started_event_id: i64,
    pub timeout_type: TimeoutType,
}

/// Cancellation of a running activity was requested.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ActivityTaskCancelRequestedAttributes {
    pub decision_task_completed_event_id: i64,
    pub activity_id: String,
}

/// A RequestCancelActivityTask command referenced an unknown activity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct RequestCancelActivityTaskFailedAttributes {
    pub decision_task_completed_event_id: i64,
    pub activity_id: String,
    pub cause: String,
}

/// A user timer was started.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct TimerStartedAttributes {
    pub timer_id: String,
    pub start_to_fire_timeout_secs: i64,
    pub decision_task_completed_event_id: i64,
}

/// A user timer fired.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct TimerFiredAttributes {
    pub timer_id: String,
    pub started_event_id: i64,
}

/// A user timer was canceled before firing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct TimerCanceledAttributes {
    pub timer_id: String,
    pub started_event_id: i64,
    pub decision_task_completed_event_id: i64,
    pub identity: String,
}

/// A CancelTimer command referenced an unknown timer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct CancelTimerFailedAttributes {
    pub timer_id: String,
    pub cause: String,
    pub decision_task_completed_event_id: i64,
    pub identity: String,
}

/// A side-effect marker recorded by the workflow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct MarkerRecordedAttributes {
    pub marker_name: String,
    pub details: Option<Vec<u8>>,
    pub decision_task_completed_event_id: i64,
}

/// Cancellation of an external workflow was initiated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct RequestCancelExternalWorkflowExecutionInitiatedAttributes {
    pub decision_task_completed_event_id: i64,
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: Option<String>,
    /// Fresh request ID for target-side deduplication.
    pub cancel_request_id: String,
    pub child_workflow_only: bool,
}

/// Cancellation of an external workflow could not be delivered.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct RequestCancelExternalWorkflowExecutionFailedAttributes {
    pub initiated_event_id: i64,
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: Option<String>,
    pub cause: CancelExternalFailedCause,
}

/// Cancellation was accepted by the external workflow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ExternalWorkflowExecutionCancelRequestedAttributes {
    pub initiated_event_id: i64,
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: Option<String>,
}

/// A signal to an external workflow was initiated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct SignalExternalWorkflowExecutionInitiatedAttributes {
    pub decision_task_completed_event_id: i64,
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: Option<String>,
    pub signal_name: String,
    pub input: Option<Vec<u8>>,
    /// Fresh request ID for target-side deduplication.
    pub signal_request_id: String,
    pub child_workflow_only: bool,
}

/// A signal to an external workflow could not be delivered.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct SignalExternalWorkflowExecutionFailedAttributes {
    pub initiated_event_id: i64,
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: Option<String>,
    pub cause: SignalExternalFailedCause,
}

/// The signal was accepted by the external workflow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ExternalWorkflowExecutionSignaledAttributes {
    pub initiated_event_id: i64,
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: Option<String>,
}

/// Starting a child workflow was initiated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct StartChildWorkflowExecutionInitiatedAttributes {
    pub decision_task_completed_event_id: i64,
    pub domain_id: String,
    pub workflow_id: String,
    pub workflow_type: String,
    pub task_list: String,
    pub input: Option<Vec<u8>>,
    pub execution_timeout_secs: i32,
    pub decision_timeout_secs: i32,
    /// Fresh request ID used as the child's create request ID.
    pub create_request_id: String,
}

/// Starting a child workflow failed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct StartChildWorkflowExecutionFailedAttributes {
    pub initiated_event_id: i64,
    pub domain_id: String,
    pub workflow_id: String,
    pub workflow_type: String,
    pub cause: ChildWorkflowFailedCause,
}

/// The child workflow run was created.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ChildWorkflowExecutionStartedAttributes {
    pub initiated_event_id: i64,
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: String,
    pub workflow_type: String,
}

/// The child workflow run completed successfully.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ChildWorkflowExecutionCompletedAttributes {
    pub initiated_event_id: i64,
    pub started_event_id: i64,
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: String,
    pub result: Option<Vec<u8>>,
}

/// The child workflow run failed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ChildWorkflowExecutionFailedAttributes {
    pub initiated_event_id: i64,
    pub started_event_id: i64,
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: String,
    pub reason: String,
    pub details: Option<Vec<u8>>,
}

/// The child workflow run was canceled.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ChildWorkflowExecutionCanceledAttributes {
    pub initiated_event_id: i64,
    pub started_event_id: i64,
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: String,
    pub details: Option<Vec<u8>>,
}

/// The child workflow run was terminated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ChildWorkflowExecutionTerminatedAttributes {
    pub initiated_event_id: i64,
    pub started_event_id: i64,
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: String,
}

/// The child workflow run timed out.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ChildWorkflowExecutionTimedOutAttributes {
    pub initiated_event_id: i64,
    pub started_event_id: i64,
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: String,
    pub timeout_type: TimeoutType,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> HistoryEvent {
        HistoryEvent {
            event_id: 1,
            timestamp: Utc::now(),
            attributes: EventAttributes::WorkflowExecutionStarted(
                WorkflowExecutionStartedAttributes {
                    workflow_type: "order-processing".to_string(),
                    task_list: "default".to_string(),
                    input: Some(b"{}".to_vec()),
                    execution_timeout_secs: 100,
                    decision_timeout_secs: 10,
                    identity: "starter".to_string(),
                    parent_workflow_id: None,
                    parent_run_id: None,
                    continued_from_run_id: None,
                },
            ),
        }
    }

    #[test]
    fn test_event_serde_round_trip() {
        let event = sample_event();
        let bytes = serde_json::to_vec(&event).unwrap();
        let back: HistoryEvent = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.event_type(), "workflow_execution_started");
    }

    #[test]
    fn test_terminal_classification() {
        let event = sample_event();
        assert!(!event.attributes.is_terminal());

        let terminal = EventAttributes::WorkflowExecutionCompleted(
            WorkflowExecutionCompletedAttributes {
                decision_task_completed_event_id: 4,
                result: None,
            },
        );
        assert!(terminal.is_terminal());

        let continued = EventAttributes::WorkflowExecutionContinuedAsNew(
            WorkflowExecutionContinuedAsNewAttributes {
                decision_task_completed_event_id: 4,
                new_run_id: "run-2".to_string(),
                workflow_type: "order-processing".to_string(),
                task_list: "default".to_string(),
                input: None,
                execution_timeout_secs: 100,
                decision_timeout_secs: 10,
            },
        );
        assert!(continued.is_terminal());
    }

    #[test]
    fn test_unknown_event_type_rejected() {
        let raw = r#"{"event_id":1,"timestamp":"2025-01-01T00:00:00Z","attributes":{"event_type":"bogus_event"}}"#;
        assert!(serde_json::from_str::<HistoryEvent>(raw).is_err());
    }
}
