// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow-execution context.
//!
//! One context per cached run. It owns the loaded mutable-state builder and
//! the `update_condition` (the `next_event_id` observed at load), and
//! performs the atomic persist: history append first, then the conditional
//! mutable-state update with the task bundle. A CAS miss surfaces as
//! [`EngineError::Conflict`] for the update loop to retry; any persist error
//! clears the cached state so the next load starts from storage.

use std::sync::Arc;

use tracing::{debug, warn};

use chronik_types::task::ReplicationTask;
use chronik_types::task::{TimerTask, TransferTask};
use chronik_types::WorkflowRun;

use crate::error::{EngineError, Result};
use crate::mutable_state::MutableStateBuilder;
use crate::notifier::HistoryEventNotification;
use crate::persistence::{
    with_retry, AppendHistoryEventsRequest, CreateWorkflowExecutionRequest, ExecutionStore,
    HistoryStore, RetryPolicy, UpdateWorkflowExecutionRequest,
};
use crate::shard::{CommitRecord, ShardContext};

/// Cached state and persist logic for one workflow run.
pub struct ExecutionContext {
    workflow: WorkflowRun,
    shard: Arc<ShardContext>,
    execution_store: Arc<dyn ExecutionStore>,
    history_store: Arc<dyn HistoryStore>,
    retry_policy: RetryPolicy,
    ms: Option<MutableStateBuilder>,
    update_condition: i64,
}

impl ExecutionContext {
    /// Context for one run; state loads lazily.
    pub fn new(
        workflow: WorkflowRun,
        shard: Arc<ShardContext>,
        execution_store: Arc<dyn ExecutionStore>,
        history_store: Arc<dyn HistoryStore>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            workflow,
            shard,
            execution_store,
            history_store,
            retry_policy,
            ms: None,
            update_condition: 0,
        }
    }

    /// The run this context serves.
    pub fn workflow(&self) -> &WorkflowRun {
        &self.workflow
    }

    /// The `next_event_id` observed at load; the CAS condition.
    pub fn update_condition(&self) -> i64 {
        self.update_condition
    }

    /// Load mutable state, from cache when warm, from the execution store
    /// otherwise.
    pub async fn load(&mut self) -> Result<&mut MutableStateBuilder> {
        if self.ms.is_none() {
            let store = self.execution_store.clone();
            let workflow = self.workflow.clone();
            let record = with_retry(self.retry_policy, || {
                store.get_workflow_execution(
                    &workflow.domain_id,
                    &workflow.workflow_id,
                    &workflow.run_id,
                )
            })
            .await?;
            self.update_condition = record.execution_info.next_event_id;
            self.ms = Some(MutableStateBuilder::load(record, self.shard.clock()));
            debug!(
                workflow_id = %self.workflow.workflow_id,
                run_id = %self.workflow.run_id,
                update_condition = self.update_condition,
                "Loaded workflow execution"
            );
        }
        Ok(self.ms.as_mut().expect("loaded above"))
    }

    /// The loaded builder, when warm.
    pub fn mutable_state(&mut self) -> Option<&mut MutableStateBuilder> {
        self.ms.as_mut()
    }

    /// Drop cached state; the next load reads from storage.
    pub fn clear(&mut self) {
        self.ms = None;
        self.update_condition = 0;
    }

    /// Persist everything the current update session accumulated: history
    /// append, conditional mutable-state update, task bundle, and the
    /// optional continue-as-new successor. On success, publishes the commit
    /// to the shard hooks. On any error the cached state is cleared.
    pub async fn update_workflow_execution(
        &mut self,
        transfer_tasks: Vec<TransferTask>,
        timer_tasks: Vec<TimerTask>,
        failover_version: Option<i64>,
    ) -> Result<()> {
        let result = self
            .update_workflow_execution_impl(transfer_tasks, timer_tasks, failover_version)
            .await;
        if result.is_err() {
            self.clear();
        }
        result
    }

    async fn update_workflow_execution_impl(
        &mut self,
        mut transfer_tasks: Vec<TransferTask>,
        mut timer_tasks: Vec<TimerTask>,
        failover_version: Option<i64>,
    ) -> Result<()> {
        let transaction_id = self.shard.next_transfer_task_id();
        let now = self.shard.now();

        let ms = self
            .ms
            .as_mut()
            .ok_or_else(|| EngineError::internal("update without loaded mutable state"))?;

        if let Some(version) = failover_version {
            ms.apply_replication_version(version);
        }

        let mut updates = ms.close_update_session();

        // Append new history first. Some operations only touch mutable state
        // (heartbeats) and skip this.
        if !updates.new_events.is_empty() {
            let first_event_id = updates.new_events[0].event_id;
            let history_store = self.history_store.clone();
            let append = AppendHistoryEventsRequest {
                workflow: self.workflow.clone(),
                first_event_id,
                transaction_id,
                events: updates.new_events.clone(),
            };
            with_retry(self.retry_policy, || {
                history_store.append_history_events(&append)
            })
            .await
            .inspect_err(|err| {
                if !matches!(err, EngineError::Conflict) {
                    warn!(
                        workflow_id = %self.workflow.workflow_id,
                        run_id = %self.workflow.run_id,
                        update_condition = self.update_condition,
                        %err,
                        "History append failed"
                    );
                }
            })?;
            ms.execution_info.last_first_event_id = first_event_id;
        }

        // One replication task per committed batch for global domains.
        let mut replication_tasks: Vec<ReplicationTask> = Vec::new();
        if let (Some(version), false) = (failover_version, updates.new_events.is_empty()) {
            replication_tasks.push(ReplicationTask {
                task_id: self.shard.next_transfer_task_id(),
                workflow: self.workflow.clone(),
                first_event_id: updates.new_events[0].event_id,
                next_event_id: ms.next_event_id(),
                version,
            });
        }

        for task in &mut transfer_tasks {
            task.task_id = self.shard.next_transfer_task_id();
        }
        for task in &mut timer_tasks {
            task.task_id = self.shard.next_transfer_task_id();
        }

        // A staged successor run appends its own first batch before the
        // update that atomically closes this run and creates it.
        let continue_as_new = match updates.continue_as_new.take() {
            Some(mut bundle) => {
                let new_workflow = bundle.builder.execution_info.workflow_run();
                let new_events = bundle.builder.new_events().to_vec();
                let first_event_id = new_events
                    .first()
                    .map(|event| event.event_id)
                    .ok_or_else(|| EngineError::internal("continue-as-new without history"))?;
                let history_store = self.history_store.clone();
                let append = AppendHistoryEventsRequest {
                    workflow: new_workflow,
                    first_event_id,
                    transaction_id,
                    events: new_events,
                };
                with_retry(self.retry_policy, || {
                    history_store.append_history_events(&append)
                })
                .await?;
                bundle.builder.execution_info.last_first_event_id = first_event_id;

                for task in &mut bundle.transfer_tasks {
                    task.task_id = self.shard.next_transfer_task_id();
                }
                for task in &mut bundle.timer_tasks {
                    task.task_id = self.shard.next_transfer_task_id();
                }
                let mut successor = bundle.builder;
                successor.close_update_session();
                Some(Box::new(CreateWorkflowExecutionRequest {
                    request_id: successor.execution_info.create_request_id.clone(),
                    snapshot: successor.snapshot_record(),
                    transfer_tasks: bundle.transfer_tasks,
                    timer_tasks: bundle.timer_tasks,
                    replication_tasks: Vec::new(),
                    continue_as_new: true,
                    previous_run_id: Some(self.workflow.run_id.clone()),
                }))
            }
            None => None,
        };

        ms.execution_info.last_updated = now;

        let request = UpdateWorkflowExecutionRequest {
            execution_info: ms.execution_info.clone(),
            replication_state: ms.replication_state,
            condition: self.update_condition,
            transfer_tasks: transfer_tasks.clone(),
            timer_tasks: timer_tasks.clone(),
            replication_tasks: replication_tasks.clone(),
            upsert_activity_infos: updates.upsert_activity_infos,
            delete_activity_infos: updates.delete_activity_infos,
            upsert_timer_infos: updates.upsert_timer_infos,
            delete_timer_infos: updates.delete_timer_infos,
            upsert_child_infos: updates.upsert_child_infos,
            delete_child_info: updates.delete_child_info,
            upsert_cancel_infos: updates.upsert_cancel_infos,
            delete_cancel_info: updates.delete_cancel_info,
            upsert_signal_infos: updates.upsert_signal_infos,
            delete_signal_info: updates.delete_signal_info,
            upsert_signal_requested_ids: updates.upsert_signal_requested_ids,
            delete_signal_requested_id: updates.delete_signal_requested_id,
            new_buffered_events: updates.new_buffered_events,
            clear_buffered_events: updates.clear_buffered_events,
            continue_as_new,
        };

        let execution_store = self.execution_store.clone();
        with_retry(self.retry_policy, || {
            execution_store.update_workflow_execution(&request)
        })
        .await
        .inspect_err(|err| {
            if !matches!(err, EngineError::Conflict) {
                warn!(
                    workflow_id = %self.workflow.workflow_id,
                    run_id = %self.workflow.run_id,
                    update_condition = self.update_condition,
                    %err,
                    "Workflow execution update failed"
                );
            }
        })?;

        // Update went through: refresh the condition and fan the commit out.
        self.update_condition = ms.next_event_id();
        self.shard.publish_commit(&CommitRecord {
            transfer_tasks: !transfer_tasks.is_empty()
                || request
                    .continue_as_new
                    .as_ref()
                    .is_some_and(|create| !create.transfer_tasks.is_empty()),
            timer_tasks: {
                let mut committed = timer_tasks;
                if let Some(create) = &request.continue_as_new {
                    committed.extend(create.timer_tasks.iter().cloned());
                }
                committed
            },
            replication_tasks: !replication_tasks.is_empty(),
            notification: Some(HistoryEventNotification {
                workflow: self.workflow.clone(),
                last_first_event_id: ms.last_first_event_id(),
                next_event_id: ms.next_event_id(),
                is_running: ms.is_running(),
                timestamp: now,
            }),
        });
        Ok(())
    }
}
