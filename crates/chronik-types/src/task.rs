// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable task descriptors.
//!
//! Every committed state transition may enqueue follow-on work: transfer
//! tasks (external dispatch through matching, peer shards or the visibility
//! store), timer tasks (wall-clock deadlines) and replication tasks (event
//! batches to publish to peer clusters). Tasks are persisted atomically with
//! the mutable-state update that produced them and consumed by the queue
//! processors.
//!
//! Task IDs are drawn from the shard's monotonic sequence before the persist,
//! so queue reads in `(read_level, max_read_level]` ranges observe them in
//! commit order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{TimeoutType, WorkflowRun};

/// A pending external dispatch recorded in the per-shard transfer log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransferTask {
    /// Position in the shard's transfer log; assigned from the shard
    /// sequence before the persist.
    pub task_id: i64,
    /// Run whose state transition produced the task.
    pub workflow: WorkflowRun,
    /// Failover version of the producing mutation, for multi-cluster
    /// deployments. Zero for local-only domains.
    pub version: i64,
    /// What to dispatch.
    pub kind: TransferTaskKind,
}

/// The dispatch a transfer task stands for.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task_type", rename_all = "snake_case")]
pub enum TransferTaskKind {
    /// Hand an activity task to the matching service.
    ActivityTask {
        /// Domain the activity runs in (may differ from the workflow's).
        target_domain_id: String,
        /// Task list the activity worker polls.
        task_list: String,
        /// Event ID of the ActivityTaskScheduled event.
        schedule_id: i64,
    },
    /// Hand a decision task to the matching service.
    DecisionTask {
        /// Task list the decision worker polls.
        task_list: String,
        /// Event ID of the DecisionTaskScheduled event.
        schedule_id: i64,
    },
    /// Record the closed run in the visibility store and notify the parent.
    CloseExecution,
    /// Deliver a cancellation request to another workflow.
    CancelExecution {
        /// Domain of the target workflow.
        target_domain_id: String,
        /// Workflow ID of the target.
        target_workflow_id: String,
        /// Specific target run, or the current run when empty.
        target_run_id: Option<String>,
        /// Only deliver when the target is a child of this run.
        target_child_workflow_only: bool,
        /// Event ID of the initiated event in the source run.
        initiated_id: i64,
    },
    /// Deliver a signal to another workflow.
    SignalExecution {
        /// Domain of the target workflow.
        target_domain_id: String,
        /// Workflow ID of the target.
        target_workflow_id: String,
        /// Specific target run, or the current run when empty.
        target_run_id: Option<String>,
        /// Only deliver when the target is a child of this run.
        target_child_workflow_only: bool,
        /// Event ID of the initiated event in the source run.
        initiated_id: i64,
    },
    /// Start a child workflow run.
    StartChildExecution {
        /// Domain the child runs in.
        target_domain_id: String,
        /// Workflow ID of the child.
        target_workflow_id: String,
        /// Event ID of the initiated event in the parent run.
        initiated_id: i64,
    },
}

impl TransferTaskKind {
    /// Stable name of the task type, for logs.
    pub fn task_type(&self) -> &'static str {
        match self {
            Self::ActivityTask { .. } => "activity_task",
            Self::DecisionTask { .. } => "decision_task",
            Self::CloseExecution => "close_execution",
            Self::CancelExecution { .. } => "cancel_execution",
            Self::SignalExecution { .. } => "signal_execution",
            Self::StartChildExecution { .. } => "start_child_execution",
        }
    }

    /// Event ID the task references in the producing run's mutable state,
    /// used for stale-cache detection while processing.
    pub fn schedule_id(&self) -> Option<i64> {
        match self {
            Self::ActivityTask { schedule_id, .. } | Self::DecisionTask { schedule_id, .. } => {
                Some(*schedule_id)
            }
            Self::CancelExecution { initiated_id, .. }
            | Self::SignalExecution { initiated_id, .. }
            | Self::StartChildExecution { initiated_id, .. } => Some(*initiated_id),
            Self::CloseExecution => None,
        }
    }
}

/// A pending wall-clock deadline recorded in the per-shard timer log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimerTask {
    /// Position in the shard's timer log; assigned from the shard sequence
    /// before the persist.
    pub task_id: i64,
    /// Run the deadline belongs to.
    pub workflow: WorkflowRun,
    /// When the timer fires. The processor dispatches the task once the
    /// shard clock passes this stamp.
    pub visibility_timestamp: DateTime<Utc>,
    /// Failover version of the producing mutation.
    pub version: i64,
    /// What the deadline means.
    pub kind: TimerTaskKind,
}

/// The deadline a timer task stands for.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task_type", rename_all = "snake_case")]
pub enum TimerTaskKind {
    /// The run's execution-start-to-close timeout.
    WorkflowTimeout,
    /// A decision task deadline.
    DecisionTimeout {
        /// Event ID of the DecisionTaskScheduled event.
        schedule_id: i64,
        /// Decision attempt the deadline belongs to.
        attempt: i64,
        /// Which decision deadline fired.
        timeout_type: TimeoutType,
    },
    /// An activity task deadline.
    ActivityTimeout {
        /// Event ID of the ActivityTaskScheduled event.
        schedule_id: i64,
        /// Which activity deadline fired.
        timeout_type: TimeoutType,
    },
    /// A user timer started by a StartTimer decision.
    UserTimer {
        /// Workflow-scoped timer identifier.
        timer_id: String,
        /// Event ID of the TimerStarted event.
        started_event_id: i64,
    },
    /// Retention expired for a closed run; delete its history.
    DeleteHistoryEvent,
}

impl TimerTaskKind {
    /// Stable name of the task type, for logs.
    pub fn task_type(&self) -> &'static str {
        match self {
            Self::WorkflowTimeout => "workflow_timeout",
            Self::DecisionTimeout { .. } => "decision_timeout",
            Self::ActivityTimeout { .. } => "activity_timeout",
            Self::UserTimer { .. } => "user_timer",
            Self::DeleteHistoryEvent => "delete_history_event",
        }
    }
}

/// A committed event batch awaiting publication to peer clusters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplicationTask {
    /// Position in the shard's replication log.
    pub task_id: i64,
    /// Run the batch belongs to.
    pub workflow: WorkflowRun,
    /// First event ID of the committed batch.
    pub first_event_id: i64,
    /// Next event ID after the committed batch.
    pub next_event_id: i64,
    /// Failover version the batch was written at.
    pub version: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_task_schedule_ids() {
        let kind = TransferTaskKind::DecisionTask {
            task_list: "default".to_string(),
            schedule_id: 2,
        };
        assert_eq!(kind.schedule_id(), Some(2));
        assert_eq!(kind.task_type(), "decision_task");
        assert_eq!(TransferTaskKind::CloseExecution.schedule_id(), None);
    }

    #[test]
    fn test_timer_task_serde_round_trip() {
        let task = TimerTask {
            task_id: 7,
            workflow: WorkflowRun::new("d1", "wf1", "r1"),
            visibility_timestamp: Utc::now(),
            version: 0,
            kind: TimerTaskKind::ActivityTimeout {
                schedule_id: 5,
                timeout_type: TimeoutType::Heartbeat,
            },
        };
        let json = serde_json::to_string(&task).unwrap();
        let back: TimerTask = serde_json::from_str(&json).unwrap();
        assert_eq!(back, task);
    }
}
