// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request and response payloads for the engine operations.
//!
//! These are the types a transport layer maps RPCs onto. Validation happens
//! inside the engine, before any lock is taken; these structs carry data
//! only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::decision::Decision;
use crate::event::{DecisionTaskFailedCause, HistoryEvent};
use crate::{CloseStatus, WorkflowIdReusePolicy};

/// Parent linkage passed when a start request comes from a parent run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ParentExecutionInfo {
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: String,
    /// Event ID of the StartChildWorkflowExecutionInitiated event in the
    /// parent's history.
    pub initiated_id: i64,
}

/// StartWorkflowExecution request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct StartWorkflowRequest {
    pub domain_id: String,
    pub workflow_id: String,
    pub workflow_type: String,
    pub task_list: String,
    pub input: Option<Vec<u8>>,
    pub execution_timeout_secs: i32,
    pub decision_timeout_secs: i32,
    pub identity: String,
    /// Client-chosen idempotency key; a racing duplicate create with the
    /// same request ID returns the winner's run ID.
    pub request_id: String,
    pub reuse_policy: WorkflowIdReusePolicy,
    /// Present when a parent run starts this workflow as a child.
    pub parent: Option<ParentExecutionInfo>,
}

/// StartWorkflowExecution response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StartWorkflowResponse {
    /// The created (or, on request-ID dedup, the previously created) run.
    pub run_id: String,
}

/// SignalWithStartWorkflowExecution request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct SignalWithStartWorkflowRequest {
    pub domain_id: String,
    pub workflow_id: String,
    pub workflow_type: String,
    pub task_list: String,
    pub input: Option<Vec<u8>>,
    pub execution_timeout_secs: i32,
    pub decision_timeout_secs: i32,
    pub identity: String,
    pub request_id: String,
    pub signal_name: String,
    pub signal_input: Option<Vec<u8>>,
}

/// RecordDecisionTaskStarted request, issued by the matching service when a
/// worker polls the decision task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct RecordDecisionTaskStartedRequest {
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: String,
    pub schedule_id: i64,
    /// Transfer-log task ID, for duplicate-dispatch logging.
    pub task_id: i64,
    /// Poll request ID; a retry with the same ID gets the prior response.
    pub request_id: String,
    pub identity: String,
}

/// Scheduled/started events of a retried decision that are not yet written
/// to history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct TransientDecisionInfo {
    pub scheduled_event: HistoryEvent,
    pub started_event: HistoryEvent,
}

/// RecordDecisionTaskStarted response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct RecordDecisionTaskStartedResponse {
    pub workflow_type: String,
    /// Started-event ID of the previous completed decision, when any.
    pub previous_started_event_id: Option<i64>,
    pub scheduled_event_id: i64,
    pub started_event_id: i64,
    pub next_event_id: i64,
    pub attempt: i64,
    pub sticky_execution_enabled: bool,
    /// Present when the decision is a retry held in mutable state only.
    pub transient_decision: Option<TransientDecisionInfo>,
}

/// RecordActivityTaskStarted request, issued by the matching service when a
/// worker polls the activity task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct RecordActivityTaskStartedRequest {
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: String,
    pub schedule_id: i64,
    /// Transfer-log task ID, for duplicate-dispatch logging.
    pub task_id: i64,
    pub request_id: String,
    pub identity: String,
}

/// RecordActivityTaskStarted response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct RecordActivityTaskStartedResponse {
    pub scheduled_event: HistoryEvent,
    pub started_event: HistoryEvent,
}

/// Sticky-execution attributes supplied on decision completion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct StickyAttributes {
    pub worker_task_list: String,
    pub schedule_to_start_timeout_secs: i32,
}

/// RespondDecisionTaskCompleted request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct RespondDecisionTaskCompletedRequest {
    pub domain_id: String,
    /// Opaque token from RecordDecisionTaskStarted.
    pub task_token: Vec<u8>,
    pub decisions: Vec<Decision>,
    /// Opaque workflow-owned context blob carried on the execution row.
    pub execution_context: Option<Vec<u8>>,
    pub identity: String,
    /// Present when the worker wants follow-up decisions routed to its
    /// sticky task list.
    pub sticky: Option<StickyAttributes>,
}

/// RespondDecisionTaskFailed request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct RespondDecisionTaskFailedRequest {
    pub domain_id: String,
    pub task_token: Vec<u8>,
    pub cause: DecisionTaskFailedCause,
    pub details: Option<Vec<u8>>,
    pub identity: String,
}

/// RespondActivityTaskCompleted request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct RespondActivityTaskCompletedRequest {
    pub domain_id: String,
    pub task_token: Vec<u8>,
    pub result: Option<Vec<u8>>,
    pub identity: String,
}

/// RespondActivityTaskFailed request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct RespondActivityTaskFailedRequest {
    pub domain_id: String,
    pub task_token: Vec<u8>,
    pub reason: String,
    pub details: Option<Vec<u8>>,
    pub identity: String,
}

/// RespondActivityTaskCanceled request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct RespondActivityTaskCanceledRequest {
    pub domain_id: String,
    pub task_token: Vec<u8>,
    pub details: Option<Vec<u8>>,
    pub identity: String,
}

/// RecordActivityTaskHeartbeat request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct RecordActivityTaskHeartbeatRequest {
    pub domain_id: String,
    pub task_token: Vec<u8>,
    pub details: Option<Vec<u8>>,
    pub identity: String,
}

/// RecordActivityTaskHeartbeat response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordActivityTaskHeartbeatResponse {
    /// Whether cancellation of the activity has been requested; the worker
    /// should stop and respond canceled.
    pub cancel_requested: bool,
}

/// RequestCancelWorkflowExecution request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct RequestCancelWorkflowRequest {
    pub domain_id: String,
    pub workflow_id: String,
    /// Specific run, or the current run when absent.
    pub run_id: Option<String>,
    /// Idempotency key: a duplicate cancel with the same ID is a no-op.
    pub cancel_request_id: String,
    pub identity: String,
    /// Requesting workflow, when the cancel comes from another run.
    pub external_workflow_id: Option<String>,
    /// Requesting run, when the cancel comes from another run.
    pub external_run_id: Option<String>,
    /// Reject unless the requesting run is this run's parent.
    pub child_workflow_only: bool,
}

/// SignalWorkflowExecution request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct SignalWorkflowRequest {
    pub domain_id: String,
    pub workflow_id: String,
    /// Specific run, or the current run when absent.
    pub run_id: Option<String>,
    pub signal_name: String,
    pub input: Option<Vec<u8>>,
    /// Idempotency key: a duplicate signal with the same ID is a no-op.
    pub request_id: String,
    pub identity: String,
    /// Requesting workflow, when the signal comes from another run.
    pub external_workflow_id: Option<String>,
    /// Requesting run, when the signal comes from another run.
    pub external_run_id: Option<String>,
    /// Reject unless the requesting run is this run's parent.
    pub child_workflow_only: bool,
}

/// TerminateWorkflowExecution request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct TerminateWorkflowRequest {
    pub domain_id: String,
    pub workflow_id: String,
    /// Specific run, or the current run when absent.
    pub run_id: Option<String>,
    pub reason: String,
    pub details: Option<Vec<u8>>,
    pub identity: String,
}

/// GetMutableState request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct GetMutableStateRequest {
    pub domain_id: String,
    pub workflow_id: String,
    /// Specific run, or the current run when absent.
    pub run_id: Option<String>,
    /// When set above the current next event ID and the run is open, the
    /// call long-polls until history passes it or the poll expires.
    pub expected_next_event_id: Option<i64>,
}

/// GetMutableState response: the projection snapshot a poller needs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct GetMutableStateResponse {
    pub workflow_id: String,
    pub run_id: String,
    pub workflow_type: String,
    pub task_list: String,
    pub sticky_task_list: String,
    pub sticky_schedule_to_start_timeout_secs: i32,
    pub last_first_event_id: i64,
    pub next_event_id: i64,
    pub is_workflow_running: bool,
}

/// DescribeWorkflowExecution request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct DescribeWorkflowRequest {
    pub domain_id: String,
    pub workflow_id: String,
    /// Specific run, or the current run when absent.
    pub run_id: Option<String>,
}

/// Dispatch state of a pending activity in a describe snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingActivityState {
    /// Scheduled but not yet picked up by a worker.
    Scheduled,
    /// Picked up by a worker.
    Started,
    /// Cancellation has been requested.
    CancelRequested,
}

/// One pending activity in a describe snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct PendingActivitySnapshot {
    pub activity_id: String,
    pub activity_type: String,
    pub state: PendingActivityState,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub heartbeat_details: Option<Vec<u8>>,
}

/// DescribeWorkflowExecution response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct DescribeWorkflowResponse {
    pub workflow_id: String,
    pub run_id: String,
    pub workflow_type: String,
    pub task_list: String,
    pub execution_timeout_secs: i32,
    pub decision_timeout_secs: i32,
    pub start_time: DateTime<Utc>,
    pub history_length: i64,
    /// Present when the run is closed.
    pub close_status: Option<CloseStatus>,
    /// Present when the run is closed.
    pub close_time: Option<DateTime<Utc>>,
    pub pending_activities: Vec<PendingActivitySnapshot>,
}

/// ResetStickyTaskList request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ResetStickyTaskListRequest {
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: String,
}

/// RemoveSignalMutableState request: drops a signal request ID from the
/// dedup set once the sender no longer needs the guarantee.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct RemoveSignalMutableStateRequest {
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: String,
    pub request_id: String,
}

/// ScheduleDecisionTask request: schedule a decision if none is pending.
/// Used by the transfer processor after parent-side child events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ScheduleDecisionTaskRequest {
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: String,
}

/// RecordChildExecutionCompleted request: a child run reached a terminal
/// event; record it in the parent's history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct RecordChildExecutionCompletedRequest {
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: String,
    /// Event ID of the initiated event in the parent's history.
    pub initiated_id: i64,
    pub child_workflow_id: String,
    pub child_run_id: String,
    /// The child's terminal event, copied verbatim.
    pub completion_event: HistoryEvent,
}

/// ReplicateEvents request: an event batch shipped from the active cluster.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ReplicateEventsRequest {
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: String,
    pub first_event_id: i64,
    pub next_event_id: i64,
    /// Failover version the batch was written at.
    pub version: i64,
    pub history: Vec<HistoryEvent>,
    /// First batch of the successor run, for continue-as-new batches.
    pub new_run_history: Option<Vec<HistoryEvent>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_request_serde_round_trip() {
        let request = StartWorkflowRequest {
            domain_id: "d1".to_string(),
            workflow_id: "wf1".to_string(),
            workflow_type: "order-processing".to_string(),
            task_list: "default".to_string(),
            input: None,
            execution_timeout_secs: 100,
            decision_timeout_secs: 10,
            identity: "cli".to_string(),
            request_id: "req-1".to_string(),
            reuse_policy: WorkflowIdReusePolicy::AllowDuplicate,
            parent: None,
        };
        let json = serde_json::to_string(&request).unwrap();
        let back: StartWorkflowRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, request);
    }
}
