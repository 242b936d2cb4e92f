// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client seams to external collaborators.
//!
//! The engine dispatches work through these traits and never talks to a
//! transport directly: the matching service (task-list dispatch to pollers),
//! peer history shards (cross-workflow cancel/signal/start), the replication
//! producer (event batches to peer clusters) and the domain registry
//! (per-domain configuration). Implementations are injected at construction.

use async_trait::async_trait;

use chronik_types::event::HistoryEvent;
use chronik_types::request::{
    RecordChildExecutionCompletedRequest, RequestCancelWorkflowRequest,
    ScheduleDecisionTaskRequest, SignalWorkflowRequest, StartWorkflowRequest,
    StartWorkflowResponse,
};
use chronik_types::WorkflowRun;

use crate::error::Result;

/// Matching-service client: hands dispatched tasks to polling workers.
#[async_trait]
pub trait MatchingClient: Send + Sync {
    /// Offer a decision task on a task list.
    async fn add_decision_task(
        &self,
        domain_id: &str,
        task_list: &str,
        workflow: &WorkflowRun,
        schedule_id: i64,
    ) -> Result<()>;

    /// Offer an activity task on a task list, possibly in another domain.
    async fn add_activity_task(
        &self,
        source_domain_id: &str,
        target_domain_id: &str,
        task_list: &str,
        workflow: &WorkflowRun,
        schedule_id: i64,
        schedule_to_start_timeout_secs: i32,
    ) -> Result<()>;
}

/// Peer history client: operations against workflows owned by other shards
/// or clusters.
#[async_trait]
pub trait PeerHistoryClient: Send + Sync {
    /// Deliver a cancellation request.
    async fn request_cancel_workflow_execution(
        &self,
        request: RequestCancelWorkflowRequest,
    ) -> Result<()>;

    /// Deliver a signal.
    async fn signal_workflow_execution(&self, request: SignalWorkflowRequest) -> Result<()>;

    /// Start a (child) workflow execution.
    async fn start_workflow_execution(
        &self,
        request: StartWorkflowRequest,
    ) -> Result<StartWorkflowResponse>;

    /// Schedule a decision on a workflow if none is pending.
    async fn schedule_decision_task(&self, request: ScheduleDecisionTaskRequest) -> Result<()>;

    /// Record a child run's terminal event in its parent.
    async fn record_child_execution_completed(
        &self,
        request: RecordChildExecutionCompletedRequest,
    ) -> Result<()>;
}

/// One replication message: a committed event batch, plus the successor
/// run's first batch for continue-as-new commits.
#[derive(Clone, Debug, PartialEq)]
pub struct ReplicationMessage {
    /// Run the batch belongs to.
    pub workflow: WorkflowRun,
    /// First event ID of the batch.
    pub first_event_id: i64,
    /// Next event ID after the batch.
    pub next_event_id: i64,
    /// Failover version the batch was written at.
    pub version: i64,
    /// The batch events.
    pub events: Vec<HistoryEvent>,
    /// First batch of the successor run, when the commit continued-as-new.
    pub new_run_events: Option<Vec<HistoryEvent>>,
}

/// Producer publishing replication messages to peer clusters.
#[async_trait]
pub trait ReplicationProducer: Send + Sync {
    /// Publish one message. At-least-once; consumers deduplicate on
    /// (run, first_event_id, version).
    async fn publish(&self, message: ReplicationMessage) -> Result<()>;
}

/// Per-domain configuration the engine consults.
pub trait DomainRegistry: Send + Sync {
    /// Days a closed run's history is retained before cleanup.
    fn retention_days(&self, domain_id: &str) -> i32;

    /// Whether the domain replicates across clusters.
    fn is_global(&self, domain_id: &str) -> bool;

    /// Cluster currently active for the domain.
    fn active_cluster(&self, domain_id: &str) -> String;

    /// Failover version mutations of the domain are stamped with.
    fn failover_version(&self, domain_id: &str) -> i64;
}

/// Fixed-configuration domain registry for embedded deployments and tests.
#[derive(Clone, Debug)]
pub struct StaticDomainRegistry {
    /// Retention applied to every domain.
    pub retention_days: i32,
    /// Whether domains are treated as global.
    pub global: bool,
    /// Active cluster for every domain.
    pub active_cluster: String,
    /// Failover version for every domain.
    pub failover_version: i64,
}

impl StaticDomainRegistry {
    /// Local-only registry: nothing replicates.
    pub fn local(active_cluster: impl Into<String>) -> Self {
        Self {
            retention_days: 7,
            global: false,
            active_cluster: active_cluster.into(),
            failover_version: 0,
        }
    }
}

impl DomainRegistry for StaticDomainRegistry {
    fn retention_days(&self, _domain_id: &str) -> i32 {
        self.retention_days
    }

    fn is_global(&self, _domain_id: &str) -> bool {
        self.global
    }

    fn active_cluster(&self, _domain_id: &str) -> String {
        self.active_cluster.clone()
    }

    fn failover_version(&self, _domain_id: &str) -> i64 {
        self.failover_version
    }
}
