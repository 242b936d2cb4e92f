// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Chronik Types - Shared Domain Types
//!
//! Wire-level types shared by the history engine and its clients: workflow
//! run identity, history events, decision commands, transfer/timer/replication
//! task descriptors, task tokens, and the request/response structs for every
//! engine operation.
//!
//! Everything in this crate is plain serializable data. No I/O, no async.
//!
//! # Event IDs
//!
//! Event IDs are 1-based monotone integers within one run. `FIRST_EVENT_ID`
//! is the ID of the first event in any run's history; `EMPTY_EVENT_ID` is the
//! sentinel used wherever an event reference has not been assigned yet (for
//! example the started-event ID of an activity that is scheduled but not yet
//! picked up by a worker).

#![deny(missing_docs)]

/// History events and their per-type attribute payloads.
pub mod event;

/// Decision commands issued by workers when completing a decision task.
pub mod decision;

/// Durable task descriptors produced by state transitions.
pub mod task;

/// Opaque task tokens handed to workers.
pub mod token;

/// Request/response structs for the engine operations.
pub mod request;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// The event ID assigned to the first event of every run.
pub const FIRST_EVENT_ID: i64 = 1;

/// Sentinel for "no event": references that have not been assigned yet.
pub const EMPTY_EVENT_ID: i64 = 0;

/// Sentinel ID carried by events sitting in the buffer; replaced with a real
/// ID when the buffer is flushed into history.
pub const BUFFERED_EVENT_ID: i64 = -123;

/// Identity of one workflow run.
///
/// `workflow_id` is chosen by the caller and may be reused across runs under
/// the domain's reuse policy; `run_id` is a fresh UUID per run.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Domain the run belongs to.
    pub domain_id: String,
    /// Caller-chosen workflow identifier.
    pub workflow_id: String,
    /// Unique identifier of this run.
    pub run_id: String,
}

impl WorkflowRun {
    /// Construct a run identity from its three parts.
    pub fn new(
        domain_id: impl Into<String>,
        workflow_id: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            domain_id: domain_id.into(),
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
        }
    }
}

/// Lifecycle state of a workflow run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum WorkflowState {
    /// The run is created or making progress.
    Running,
    /// The run has reached a terminal event.
    Completed,
}

/// How a completed run finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum CloseStatus {
    /// The run is still open.
    None,
    /// Finished with a CompleteWorkflowExecution decision.
    Completed,
    /// Finished with a FailWorkflowExecution decision.
    Failed,
    /// Canceled after a cancellation request.
    Canceled,
    /// Terminated by an operator or parent policy.
    Terminated,
    /// The execution-start-to-close timeout fired.
    TimedOut,
}

impl CloseStatus {
    /// Whether this close status counts as "failed" for the
    /// `AllowDuplicateFailedOnly` workflow-ID reuse policy.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            CloseStatus::Failed
                | CloseStatus::Canceled
                | CloseStatus::Terminated
                | CloseStatus::TimedOut
        )
    }
}

/// Policy applied when a StartWorkflowExecution collides with a prior run of
/// the same workflow ID.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum WorkflowIdReusePolicy {
    /// Allow a new run as long as the prior run is not still open.
    AllowDuplicate,
    /// Allow a new run only when the prior run failed, was canceled,
    /// terminated, or timed out.
    AllowDuplicateFailedOnly,
    /// Never allow a new run while any prior run exists.
    RejectDuplicate,
}

/// Which deadline a timeout event refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum TimeoutType {
    /// Worker picked the task up but did not close it in time.
    StartToClose,
    /// The task was never picked up by a worker in time.
    ScheduleToStart,
    /// Overall deadline from scheduling to close.
    ScheduleToClose,
    /// The activity stopped heartbeating.
    Heartbeat,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_close_status_failure_classification() {
        assert!(!CloseStatus::None.is_failure());
        assert!(!CloseStatus::Completed.is_failure());
        assert!(CloseStatus::Failed.is_failure());
        assert!(CloseStatus::Canceled.is_failure());
        assert!(CloseStatus::Terminated.is_failure());
        assert!(CloseStatus::TimedOut.is_failure());
    }

    #[test]
    fn test_close_status_string_round_trip() {
        for status in [
            CloseStatus::None,
            CloseStatus::Completed,
            CloseStatus::Failed,
            CloseStatus::Canceled,
            CloseStatus::Terminated,
            CloseStatus::TimedOut,
        ] {
            let text = status.to_string();
            assert_eq!(CloseStatus::from_str(&text).unwrap(), status);
        }
    }

    #[test]
    fn test_workflow_state_string_round_trip() {
        assert_eq!(WorkflowState::Running.to_string(), "running");
        assert_eq!(
            WorkflowState::from_str("completed").unwrap(),
            WorkflowState::Completed
        );
    }
}
