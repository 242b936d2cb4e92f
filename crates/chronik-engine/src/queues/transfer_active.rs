// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Active transfer-task executor.
//!
//! Performs the external dispatch each transfer task stands for: task-list
//! offers to matching, visibility records and parent notification on close,
//! and cross-workflow cancel/signal/start through the peer history client.
//! Dispatch outcomes are recorded back into the source run via the update
//! loop, never inside it.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use chronik_types::event::{
    CancelExternalFailedCause, ChildWorkflowFailedCause, EventAttributes,
    SignalExternalFailedCause,
};
use chronik_types::request::{
    ParentExecutionInfo, RecordChildExecutionCompletedRequest, RequestCancelWorkflowRequest,
    ScheduleDecisionTaskRequest, SignalWorkflowRequest, StartWorkflowRequest,
};
use chronik_types::task::{TransferTask, TransferTaskKind};
use chronik_types::{WorkflowIdReusePolicy, WorkflowRun, WorkflowState, EMPTY_EVENT_ID};

use crate::clients::{DomainRegistry, MatchingClient, PeerHistoryClient};
use crate::engine::HistoryEngine;
use crate::error::{EngineError, Result};
use crate::mutable_state::MutableStateBuilder;
use crate::persistence::{VisibilityCloseRecord, VisibilityStore};

use super::TransferTaskExecutor;

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// Identity stamped on events the transfer processor records.
const PROCESSOR_IDENTITY: &str = "history-service";

/// Read one run's mutable state, apply `f` and release. `Ok(None)` means
/// the run is closed and `process_if_closed` was false.
///
/// `f` controls the retry semantics: `Err(StaleState)` clears the cache
/// entry and reloads (bounded by the conditional retry count), and
/// `Err(TaskRetry)` propagates while keeping the cached state warm (the
/// standby verifier's "replication not caught up yet").
pub(crate) async fn inspect_mutable_state<T>(
    engine: &HistoryEngine,
    workflow: &WorkflowRun,
    process_if_closed: bool,
    mut f: impl FnMut(&MutableStateBuilder) -> Result<T>,
) -> Result<Option<T>> {
    let mut ctx = engine.execution_cache().acquire(workflow).await;
    for _attempt in 0..engine.config().conditional_retry_count {
        let ms = ctx.load().await?;
        if !process_if_closed && !ms.is_running() {
            ctx.release();
            return Ok(None);
        }
        return match f(ms) {
            Ok(value) => {
                ctx.release();
                Ok(Some(value))
            }
            Err(EngineError::StaleState) => {
                debug!(
                    workflow_id = %workflow.workflow_id,
                    "Task references events past cached state, reloading"
                );
                ctx.clear();
                continue;
            }
            Err(EngineError::TaskRetry) => {
                // Verification pending, not an error: keep the cache warm.
                ctx.release();
                Err(EngineError::TaskRetry)
            }
            Err(err) => Err(err),
        };
    }
    Err(EngineError::MaxAttemptsExceeded)
}

/// Executor of the active cluster's transfer pipeline.
pub struct ActiveTransferTaskExecutor {
    engine: Arc<HistoryEngine>,
    matching: Arc<dyn MatchingClient>,
    peer: Arc<dyn PeerHistoryClient>,
    visibility: Arc<dyn VisibilityStore>,
    domains: Arc<dyn DomainRegistry>,
    current_cluster: String,
    /// Set on failover processors to drain one domain only.
    domain_filter: Option<String>,
}

impl ActiveTransferTaskExecutor {
    /// Executor for the regular active pipeline.
    pub fn new(
        engine: Arc<HistoryEngine>,
        matching: Arc<dyn MatchingClient>,
        peer: Arc<dyn PeerHistoryClient>,
        visibility: Arc<dyn VisibilityStore>,
        domains: Arc<dyn DomainRegistry>,
        current_cluster: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            matching,
            peer,
            visibility,
            domains,
            current_cluster: current_cluster.into(),
            domain_filter: None,
        }
    }

    /// Executor for a one-shot failover pipeline over one domain.
    pub fn for_failover_domain(mut self, domain_id: impl Into<String>) -> Self {
        self.domain_filter = Some(domain_id.into());
        self
    }

    #[instrument(skip(self, task), fields(task_id = task.task_id, schedule_id = ?task.kind.schedule_id()))]
    async fn process_activity_task(
        &self,
        task: &TransferTask,
        target_domain_id: &str,
        task_list: &str,
        schedule_id: i64,
    ) -> Result<()> {
        let dispatch = inspect_mutable_state(&self.engine, &task.workflow, false, |ms| {
            match ms.get_activity_info(schedule_id) {
                Some(activity) if activity.started_id == EMPTY_EVENT_ID => {
                    Ok(Some(activity.schedule_to_start_timeout_secs))
                }
                Some(_) => Ok(None),
                None if schedule_id >= ms.next_event_id() => Err(EngineError::StaleState),
                None => Ok(None),
            }
        })
        .await?;

        match dispatch.flatten() {
            Some(schedule_to_start_timeout_secs) => {
                self.matching
                    .add_activity_task(
                        &task.workflow.domain_id,
                        target_domain_id,
                        task_list,
                        &task.workflow,
                        schedule_id,
                        schedule_to_start_timeout_secs,
                    )
                    .await
            }
            // Already started or gone: the dispatch is moot.
            None => Ok(()),
        }
    }

    async fn process_decision_task(
        &self,
        task: &TransferTask,
        task_list: &str,
        schedule_id: i64,
    ) -> Result<()> {
        let pending = inspect_mutable_state(&self.engine, &task.workflow, false, |ms| {
            match ms.get_pending_decision(schedule_id) {
                Some(_) => Ok(true),
                None if schedule_id >= ms.next_event_id() => Err(EngineError::StaleState),
                None => Ok(false),
            }
        })
        .await?;

        if pending == Some(true) {
            self.matching
                .add_decision_task(&task.workflow.domain_id, task_list, &task.workflow, schedule_id)
                .await
        } else {
            Ok(())
        }
    }

    async fn process_close_execution(&self, task: &TransferTask) -> Result<()> {
        let snapshot = inspect_mutable_state(&self.engine, &task.workflow, true, |ms| {
            let info = &ms.execution_info;
            if info.state != WorkflowState::Completed {
                // The close task ran ahead of the terminal commit.
                return Err(EngineError::TaskRetry);
            }
            let parent = info.parent_workflow_id.clone().map(|workflow_id| {
                (
                    info.parent_domain_id.clone().unwrap_or_default(),
                    workflow_id,
                    info.parent_run_id.clone().unwrap_or_default(),
                    info.initiated_id,
                )
            });
            Ok((
                info.workflow_type.clone(),
                info.start_timestamp,
                info.last_updated,
                info.close_status,
                info.next_event_id,
                parent,
            ))
        })
        .await?;

        let Some((workflow_type, start_time, close_time, status, next_event_id, parent)) = snapshot
        else {
            return Ok(());
        };

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
            .await?;

        // Notify the parent with the terminal event.
        if let Some((parent_domain_id, parent_workflow_id, parent_run_id, initiated_id)) = parent {
            let completion_event = self
                .engine
                .history_store
                .get_workflow_execution_history(&task.workflow, next_event_id - 1, next_event_id)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| EngineError::internal("closed run without terminal event"))?;
            let result = self
                .peer
                .record_child_execution_completed(RecordChildExecutionCompletedRequest {
                    domain_id: parent_domain_id,
                    workflow_id: parent_workflow_id,
                    run_id: parent_run_id,
                    initiated_id,
                    child_workflow_id: task.workflow.workflow_id.clone(),
                    child_run_id: task.workflow.run_id.clone(),
                    completion_event,
                })
                .await;
            match result {
                Ok(()) | Err(EngineError::EntityNotExists { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn process_cancel_execution(
        &self,
        task: &TransferTask,
        target_domain_id: &str,
        target_workflow_id: &str,
        target_run_id: Option<&str>,
        target_child_workflow_only: bool,
        initiated_id: i64,
    ) -> Result<()> {
        let cancel_request_id = inspect_mutable_state(&self.engine, &task.workflow, false, |ms| {
            match ms.get_request_cancel_info(initiated_id) {
                Some(info) => Ok(Some(info.cancel_request_id.clone())),
                None if initiated_id >= ms.next_event_id() => Err(EngineError::StaleState),
                None => Ok(None),
            }
        })
        .await?;
        let Some(Some(cancel_request_id)) = cancel_request_id else {
            return Ok(());
        };

        let outcome = self
            .peer
            .request_cancel_workflow_execution(RequestCancelWorkflowRequest {
                domain_id: target_domain_id.to_string(),
                workflow_id: target_workflow_id.to_string(),
                run_id: target_run_id.map(str::to_string),
                cancel_request_id,
                identity: PROCESSOR_IDENTITY.to_string(),
                external_workflow_id: Some(task.workflow.workflow_id.clone()),
                external_run_id: Some(task.workflow.run_id.clone()),
                child_workflow_only: target_child_workflow_only,
            })
            .await;

        let target_run = target_run_id.map(str::to_string);
        match outcome {
            Ok(()) | Err(EngineError::CancellationAlreadyRequested) => {
                self.engine
                    .update_workflow_execution(&task.workflow, false, true, |ms| {
                        let _ = ms.add_external_cancel_requested_event(
                            initiated_id,
                            target_domain_id,
                            target_workflow_id,
                            target_run.clone(),
                        );
                        Ok(Vec::new())
                    })
                    .await
            }
            Err(EngineError::EntityNotExists { .. }) => {
                self.engine
                    .update_workflow_execution(&task.workflow, false, true, |ms| {
                        let _ = ms.add_request_cancel_external_failed_event(
                            initiated_id,
                            target_domain_id,
                            target_workflow_id,
                            target_run.clone(),
                            CancelExternalFailedCause::UnknownExternalWorkflowExecution,
                        );
                        Ok(Vec::new())
                    })
                    .await
            }
            Err(err) => Err(err),
        }
    }

    async fn process_signal_execution(
        &self,
        task: &TransferTask,
        target_domain_id: &str,
        target_workflow_id: &str,
        target_run_id: Option<&str>,
        target_child_workflow_only: bool,
        initiated_id: i64,
    ) -> Result<()> {
        let signal = inspect_mutable_state(&self.engine, &task.workflow, false, |ms| {
            match ms.get_signal_info(initiated_id) {
                Some(info) => Ok(Some((
                    info.signal_request_id.clone(),
                    info.signal_name.clone(),
                    info.input.clone(),
                ))),
                None if initiated_id >= ms.next_event_id() => Err(EngineError::StaleState),
                None => Ok(None),
            }
        })
        .await?;
        let Some(Some((signal_request_id, signal_name, input))) = signal else {
            return Ok(());
        };

        let outcome = self
            .peer
            .signal_workflow_execution(SignalWorkflowRequest {
                domain_id: target_domain_id.to_string(),
                workflow_id: target_workflow_id.to_string(),
                run_id: target_run_id.map(str::to_string),
                signal_name,
                input,
                request_id: signal_request_id,
                identity: PROCESSOR_IDENTITY.to_string(),
                external_workflow_id: Some(task.workflow.workflow_id.clone()),
                external_run_id: Some(task.workflow.run_id.clone()),
                child_workflow_only: target_child_workflow_only,
            })
            .await;

        let target_run = target_run_id.map(str::to_string);
        match outcome {
            Ok(()) => {
                self.engine
                    .update_workflow_execution(&task.workflow, false, true, |ms| {
                        let _ = ms.add_external_signaled_event(
                            initiated_id,
                            target_domain_id,
                            target_workflow_id,
                            target_run.clone(),
                        );
                        Ok(Vec::new())
                    })
                    .await
            }
            Err(EngineError::EntityNotExists { .. }) => {
                self.engine
                    .update_workflow_execution(&task.workflow, false, true, |ms| {
                        let _ = ms.add_signal_external_failed_event(
                            initiated_id,
                            target_domain_id,
                            target_workflow_id,
                            target_run.clone(),
                            SignalExternalFailedCause::UnknownExternalWorkflowExecution,
                        );
                        Ok(Vec::new())
                    })
                    .await
            }
            Err(err) => Err(err),
        }
    }

    async fn process_start_child_execution(
        &self,
        task: &TransferTask,
        target_domain_id: &str,
        target_workflow_id: &str,
        initiated_id: i64,
    ) -> Result<()> {
        let child = inspect_mutable_state(&self.engine, &task.workflow, false, |ms| {
            match ms.get_child_execution_info(initiated_id) {
                Some(info) => Ok(Some((
                    info.started_id,
                    info.started_run_id.clone(),
                    info.create_request_id.clone(),
                    info.initiated_event.clone(),
                ))),
                None if initiated_id >= ms.next_event_id() => Err(EngineError::StaleState),
                None => Ok(None),
            }
        })
        .await?;
        let Some(Some((started_id, started_run_id, create_request_id, initiated_event))) = child
        else {
            return Ok(());
        };

        if started_id != EMPTY_EVENT_ID {
            // Started already recorded; make sure the child got its first
            // decision before acking.
            if let Some(child_run_id) = started_run_id {
                self.schedule_child_first_decision(target_domain_id, target_workflow_id, &child_run_id)
                    .await?;
            }
            return Ok(());
        }

        let EventAttributes::StartChildWorkflowExecutionInitiated(attrs) =
            &initiated_event.attributes
        else {
            return Err(EngineError::internal("child info with non-initiated event"));
        };

        let start = self
            .peer
            .start_workflow_execution(StartWorkflowRequest {
                domain_id: target_domain_id.to_string(),
                workflow_id: target_workflow_id.to_string(),
                workflow_type: attrs.workflow_type.clone(),
                task_list: attrs.task_list.clone(),
                input: attrs.input.clone(),
                execution_timeout_secs: attrs.execution_timeout_secs,
                decision_timeout_secs: attrs.decision_timeout_secs,
                identity: PROCESSOR_IDENTITY.to_string(),
                request_id: create_request_id,
                reuse_policy: WorkflowIdReusePolicy::AllowDuplicate,
                parent: Some(ParentExecutionInfo {
                    domain_id: task.workflow.domain_id.clone(),
                    workflow_id: task.workflow.workflow_id.clone(),
                    run_id: task.workflow.run_id.clone(),
                    initiated_id,
                }),
            })
            .await;

        let workflow_type = attrs.workflow_type.clone();
        match start {
            Ok(response) => {
                let child_run_id = response.run_id.clone();
                self.engine
                    .update_workflow_execution(&task.workflow, false, true, |ms| {
                        let _ = ms.add_child_started_event(
                            initiated_id,
                            target_domain_id,
                            target_workflow_id,
                            &child_run_id,
                            &workflow_type,
                        );
                        Ok(Vec::new())
                    })
                    .await?;
                self.schedule_child_first_decision(
                    target_domain_id,
                    target_workflow_id,
                    &response.run_id,
                )
                .await
            }
            Err(EngineError::WorkflowAlreadyStarted { .. }) => {
                self.engine
                    .update_workflow_execution(&task.workflow, false, true, |ms| {
                        let _ = ms.add_start_child_failed_event(
                            initiated_id,
                            ChildWorkflowFailedCause::WorkflowAlreadyRunning,
                        );
                        Ok(Vec::new())
                    })
                    .await
            }
            Err(err) => Err(err),
        }
    }

    async fn schedule_child_first_decision(
        &self,
        domain_id: &str,
        workflow_id: &str,
        run_id: &str,
    ) -> Result<()> {
        let result = self
            .peer
            .schedule_decision_task(ScheduleDecisionTaskRequest {
                domain_id: domain_id.to_string(),
                workflow_id: workflow_id.to_string(),
                run_id: run_id.to_string(),
            })
            .await;
        match result {
            Ok(()) | Err(EngineError::EntityNotExists { .. }) => Ok(()),
            Err(err) => {
                warn!(workflow_id, %err, "Failed to schedule child's first decision");
                Err(err)
            }
        }
    }
}

#[async_trait]
impl TransferTaskExecutor for ActiveTransferTaskExecutor {
    fn name(&self) -> &'static str {
        "transfer-active"
    }

    fn accepts(&self, task: &TransferTask) -> bool {
        if let Some(domain_id) = &self.domain_filter {
            return &task.workflow.domain_id == domain_id;
        }
        // Global domains are dispatched by their active cluster only.
        !self.domains.is_global(&task.workflow.domain_id)
            || self.domains.active_cluster(&task.workflow.domain_id) == self.current_cluster
    }

    async fn execute(&self, task: &TransferTask) -> Result<()> {
        match &task.kind {
            TransferTaskKind::ActivityTask {
                target_domain_id,
                task_list,
                schedule_id,
            } => {
                self.process_activity_task(task, target_domain_id, task_list, *schedule_id)
                    .await
            }
            TransferTaskKind::DecisionTask {
                task_list,
                schedule_id,
            } => self.process_decision_task(task, task_list, *schedule_id).await,
            TransferTaskKind::CloseExecution => self.process_close_execution(task).await,
            TransferTaskKind::CancelExecution {
                target_domain_id,
                target_workflow_id,
                target_run_id,
                target_child_workflow_only,
                initiated_id,
            } => {
                self.process_cancel_execution(
                    task,
                    target_domain_id,
                    target_workflow_id,
                    target_run_id.as_deref(),
                    *target_child_workflow_only,
                    *initiated_id,
                )
                .await
            }
            TransferTaskKind::SignalExecution {
                target_domain_id,
                target_workflow_id,
                target_run_id,
                target_child_workflow_only,
                initiated_id,
            } => {
                self.process_signal_execution(
                    task,
                    target_domain_id,
                    target_workflow_id,
                    target_run_id.as_deref(),
                    *target_child_workflow_only,
                    *initiated_id,
                )
                .await
            }
            TransferTaskKind::StartChildExecution {
                target_domain_id,
                target_workflow_id,
                initiated_id,
            } => {
                self.process_start_child_execution(
                    task,
                    target_domain_id,
                    target_workflow_id,
                    *initiated_id,
                )
                .await
            }
        }
    }
}
