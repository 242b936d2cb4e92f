// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Standby transfer-task executor.
//!
//! The standby side never performs an external side-effect: it is a replay
//! verifier. For every task it polls mutable state and answers `TaskRetry`
//! until replication from the active cluster has produced the post-effect
//! footprint (decision started, activity started, initiated-info removed,
//! child started). Only then is the task acknowledged, so the shard's
//! transfer-ack checkpoint can never trim a task a standby has not verified.
//!
//! The one exception is CloseExecution: the closed-run visibility record is
//! written locally on every cluster (without notifying the parent, which is
//! the active cluster's job).

use std::sync::Arc;

use async_trait::async_trait;

use chronik_types::task::{TransferTask, TransferTaskKind};
use chronik_types::{WorkflowState, EMPTY_EVENT_ID};

use crate::clients::DomainRegistry;
use crate::engine::HistoryEngine;
use crate::error::{EngineError, Result};
use crate::persistence::{VisibilityCloseRecord, VisibilityStore};

use super::transfer_active::inspect_mutable_state;
use super::TransferTaskExecutor;

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// Executor verifying replay on behalf of one standby cluster.
pub struct StandbyTransferTaskExecutor {
    engine: Arc<HistoryEngine>,
    visibility: Arc<dyn VisibilityStore>,
    domains: Arc<dyn DomainRegistry>,
    /// Cluster this processor verifies for.
    cluster: String,
}

impl StandbyTransferTaskExecutor {
    /// Executor for one standby cluster.
    pub fn new(
        engine: Arc<HistoryEngine>,
        visibility: Arc<dyn VisibilityStore>,
        domains: Arc<dyn DomainRegistry>,
        cluster: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            visibility,
            domains,
            cluster: cluster.into(),
        }
    }

    async fn verify_activity_task(&self, task: &TransferTask, schedule_id: i64) -> Result<()> {
        inspect_mutable_state(&self.engine, &task.workflow, false, |ms| {
            match ms.get_activity_info(schedule_id) {
                Some(activity) if activity.started_id == EMPTY_EVENT_ID => {
                    Err(EngineError::TaskRetry)
                }
                Some(_) => Ok(()),
                // The scheduled event itself has not replicated yet.
                None if schedule_id >= ms.next_event_id() => Err(EngineError::TaskRetry),
                None => Ok(()),
            }
        })
        .await?;
        Ok(())
    }

    async fn verify_decision_task(&self, task: &TransferTask, schedule_id: i64) -> Result<()> {
        inspect_mutable_state(&self.engine, &task.workflow, false, |ms| {
            match ms.get_pending_decision(schedule_id) {
                Some(decision) if decision.started_id == EMPTY_EVENT_ID => {
                    Err(EngineError::TaskRetry)
                }
                Some(_) => Ok(()),
                None if schedule_id >= ms.next_event_id() => Err(EngineError::TaskRetry),
                None => Ok(()),
            }
        })
        .await?;
        Ok(())
    }

    async fn record_close_visibility(&self, task: &TransferTask) -> Result<()> {
        let snapshot = inspect_mutable_state(&self.engine, &task.workflow, true, |ms| {
            let info = &ms.execution_info;
            if info.state != WorkflowState::Completed {
                return Err(EngineError::TaskRetry);
            }
            Ok((
                info.workflow_type.clone(),
                info.start_timestamp,
                info.last_updated,
                info.close_status,
                info.next_event_id,
            ))
        })
        .await?;
        let Some((workflow_type, start_time, close_time, status, next_event_id)) = snapshot else {
            return Ok(());
        };

        // DO NOT notify the parent here: event replication is the active
        // cluster's responsibility.
        let retention_secs =
            self.domains.retention_days(&task.workflow.domain_id) as i64 * SECONDS_PER_DAY;
        self.visibility
            .record_workflow_execution_closed(&VisibilityCloseRecord {
                workflow: task.workflow.clone(),
                workflow_type,
                start_time,
                close_time,
                status,
                history_length: next_event_id - 1,
                retention_secs,
            })
            .await
    }

    async fn verify_cancel_execution(&self, task: &TransferTask, initiated_id: i64) -> Result<()> {
        inspect_mutable_state(&self.engine, &task.workflow, false, |ms| {
            if ms.get_request_cancel_info(initiated_id).is_some()
                || initiated_id >= ms.next_event_id()
            {
                Err(EngineError::TaskRetry)
            } else {
                Ok(())
            }
        })
        .await?;
        Ok(())
    }

    async fn verify_signal_execution(&self, task: &TransferTask, initiated_id: i64) -> Result<()> {
        inspect_mutable_state(&self.engine, &task.workflow, false, |ms| {
            if ms.get_signal_info(initiated_id).is_some() || initiated_id >= ms.next_event_id() {
                Err(EngineError::TaskRetry)
            } else {
                Ok(())
            }
        })
        .await?;
        Ok(())
    }

    async fn verify_start_child_execution(
        &self,
        task: &TransferTask,
        initiated_id: i64,
    ) -> Result<()> {
        inspect_mutable_state(&self.engine, &task.workflow, false, |ms| {
            match ms.get_child_execution_info(initiated_id) {
                Some(child) if child.started_id == EMPTY_EVENT_ID => Err(EngineError::TaskRetry),
                Some(_) => Ok(()),
                None if initiated_id >= ms.next_event_id() => Err(EngineError::TaskRetry),
                None => Ok(()),
            }
        })
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TransferTaskExecutor for StandbyTransferTaskExecutor {
    fn name(&self) -> &'static str {
        "transfer-standby"
    }

    fn accepts(&self, task: &TransferTask) -> bool {
        // Only global domains whose active side is the cluster this standby
        // processor stands in for.
        self.domains.is_global(&task.workflow.domain_id)
            && self.domains.active_cluster(&task.workflow.domain_id) == self.cluster
    }

    async fn execute(&self, task: &TransferTask) -> Result<()> {
        match &task.kind {
            TransferTaskKind::ActivityTask { schedule_id, .. } => {
                self.verify_activity_task(task, *schedule_id).await
            }
            TransferTaskKind::DecisionTask { schedule_id, .. } => {
                self.verify_decision_task(task, *schedule_id).await
            }
            TransferTaskKind::CloseExecution => self.record_close_visibility(task).await,
            TransferTaskKind::CancelExecution { initiated_id, .. } => {
                self.verify_cancel_execution(task, *initiated_id).await
            }
            TransferTaskKind::SignalExecution { initiated_id, .. } => {
                self.verify_signal_execution(task, *initiated_id).await
            }
            TransferTaskKind::StartChildExecution { initiated_id, .. } => {
                self.verify_start_child_execution(task, *initiated_id).await
            }
        }
    }
}
