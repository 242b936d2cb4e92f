// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Decision commands.
//!
//! When a worker completes a decision task it returns an ordered list of
//! [`Decision`] commands describing how the workflow should make progress.
//! The engine validates and applies them in order; a validation failure fails
//! the whole decision task with a typed cause.

use serde::{Deserialize, Serialize};

/// One command in a RespondDecisionTaskCompleted request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision_type", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum Decision {
    ScheduleActivityTask(ScheduleActivityTaskAttributes),
    RequestCancelActivityTask(RequestCancelActivityTaskAttributes),
    StartTimer(StartTimerAttributes),
    CancelTimer(CancelTimerAttributes),
    RecordMarker(RecordMarkerAttributes),
    CompleteWorkflowExecution(CompleteWorkflowExecutionAttributes),
    FailWorkflowExecution(FailWorkflowExecutionAttributes),
    CancelWorkflowExecution(CancelWorkflowExecutionAttributes),
    ContinueAsNewWorkflowExecution(ContinueAsNewWorkflowExecutionAttributes),
    StartChildWorkflowExecution(StartChildWorkflowExecutionAttributes),
    RequestCancelExternalWorkflowExecution(RequestCancelExternalWorkflowExecutionAttributes),
    SignalExternalWorkflowExecution(SignalExternalWorkflowExecutionAttributes),
}

/// Schedule an activity task for dispatch through the matching service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ScheduleActivityTaskAttributes {
    pub activity_id: String,
    pub activity_type: String,
    pub task_list: String,
    /// Target domain; the workflow's own domain when absent.
    pub domain_id: Option<String>,
    pub input: Option<Vec<u8>>,
    pub schedule_to_close_timeout_secs: i32,
    pub schedule_to_start_timeout_secs: i32,
    pub start_to_close_timeout_secs: i32,
    pub heartbeat_timeout_secs: i32,
}

/// Request cancellation of a pending activity by its activity ID.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct RequestCancelActivityTaskAttributes {
    pub activity_id: String,
}

/// Start a user timer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct StartTimerAttributes {
    pub timer_id: String,
    pub start_to_fire_timeout_secs: i64,
}

/// Cancel a pending user timer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct CancelTimerAttributes {
    pub timer_id: String,
}

/// Record a side-effect marker into history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct RecordMarkerAttributes {
    pub marker_name: String,
    pub details: Option<Vec<u8>>,
}

/// Close the workflow successfully.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct CompleteWorkflowExecutionAttributes {
    pub result: Option<Vec<u8>>,
}

/// Close the workflow as failed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct FailWorkflowExecutionAttributes {
    pub reason: String,
    pub details: Option<Vec<u8>>,
}

/// Close the workflow as canceled.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct CancelWorkflowExecutionAttributes {
    pub details: Option<Vec<u8>>,
}

/// Close this run and atomically start a successor run.
///
/// Workflow type, task list and timeouts are inherited from the current run
/// when left empty / non-positive.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ContinueAsNewWorkflowExecutionAttributes {
    pub workflow_type: Option<String>,
    pub task_list: Option<String>,
    pub input: Option<Vec<u8>>,
    pub execution_timeout_secs: i32,
    pub decision_timeout_secs: i32,
}

/// Start a child workflow execution.
///
/// Task list and timeouts are inherited from the parent when left empty /
/// non-positive.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct StartChildWorkflowExecutionAttributes {
    pub workflow_id: String,
    pub workflow_type: String,
    /// Target domain; the parent's domain when absent.
    pub domain_id: Option<String>,
    pub task_list: Option<String>,
    pub input: Option<Vec<u8>>,
    pub execution_timeout_secs: i32,
    pub decision_timeout_secs: i32,
}

/// Request cancellation of a workflow in another run (possibly another
/// domain).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct RequestCancelExternalWorkflowExecutionAttributes {
    /// Target domain; the workflow's own domain when absent.
    pub domain_id: Option<String>,
    pub workflow_id: String,
    pub run_id: Option<String>,
    pub child_workflow_only: bool,
}

/// Signal a workflow in another run (possibly another domain).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct SignalExternalWorkflowExecutionAttributes {
    /// Target domain; the workflow's own domain when absent.
    pub domain_id: Option<String>,
    pub workflow_id: String,
    pub run_id: Option<String>,
    pub signal_name: String,
    pub input: Option<Vec<u8>>,
    pub child_workflow_only: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_serde_round_trip() {
        let decision = Decision::ScheduleActivityTask(ScheduleActivityTaskAttributes {
            activity_id: "a1".to_string(),
            activity_type: "charge-card".to_string(),
            task_list: "payments".to_string(),
            domain_id: None,
            input: None,
            schedule_to_close_timeout_secs: 60,
            schedule_to_start_timeout_secs: 10,
            start_to_close_timeout_secs: 50,
            heartbeat_timeout_secs: 0,
        });
        let json = serde_json::to_string(&decision).unwrap();
        assert!(json.contains("schedule_activity_task"));
        let back: Decision = serde_json::from_str(&json).unwrap();
        assert_eq!(back, decision);
    }

    #[test]
    fn test_unknown_decision_type_rejected() {
        let raw = r#"{"decision_type":"launch_missiles"}"#;
        assert!(serde_json::from_str::<Decision>(raw).is_err());
    }
}
