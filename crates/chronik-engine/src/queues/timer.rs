// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Timer-queue processor.
//!
//! Fires timer tasks once the shard clock passes their visibility timestamp:
//! workflow timeouts, decision schedule-to-start/start-to-close timeouts,
//! activity timeouts (including heartbeat re-arming), user timers and
//! retention-driven history cleanup.
//!
//! Like the transfer queue, the active side mutates workflow state through
//! the update loop while the standby side only verifies that replication
//! has caught up, answering `TaskRetry` until it has. History cleanup runs
//! on every cluster.

use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use chronik_types::task::{TimerTask, TimerTaskKind};
use chronik_types::{TimeoutType, EMPTY_EVENT_ID};

use crate::engine::HistoryEngine;
use crate::error::{EngineError, Result};
use crate::persistence::ExecutionStore;
use crate::shard::CommitHooks;

use super::transfer_active::inspect_mutable_state;

/// Whether a timer pipeline fires effects or verifies replay.
#[derive(Clone, Debug)]
pub enum TimerProcessorMode {
    /// Fire timeouts through the update loop.
    Active,
    /// Verify replay on behalf of a peer cluster.
    Standby {
        /// Cluster this processor stands in for.
        cluster: String,
    },
}

/// Timer-queue processor of one shard.
pub struct TimerQueueProcessor {
    engine: Arc<HistoryEngine>,
    store: Arc<dyn ExecutionStore>,
    mode: TimerProcessorMode,
    notify: Arc<Notify>,
}

impl TimerQueueProcessor {
    /// Processor in the given mode.
    pub fn new(
        engine: Arc<HistoryEngine>,
        store: Arc<dyn ExecutionStore>,
        mode: TimerProcessorMode,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            store,
            mode,
            notify: Arc::new(Notify::new()),
        })
    }

    /// Spawn the fire loop.
    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            this.run(shutdown).await;
        })
    }

    async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let config = self.engine.config().clone();
        debug!(mode = ?self.mode, "Timer queue processor started");
        loop {
            let now = self.engine.shard().now();
            let mut saw_retry = false;
            match self
                .store
                .get_timer_tasks(now, config.timer_batch_size)
                .await
            {
                Ok(tasks) => {
                    for task in tasks {
                        if !self.accepts(&task) {
                            self.complete(task.task_id).await;
                            continue;
                        }
                        match self.process(&task).await {
                            Ok(()) | Err(EngineError::EntityNotExists { .. }) => {
                                self.complete(task.task_id).await;
                            }
                            Err(EngineError::TaskRetry) => {
                                // Replay not caught up; leave the task in
                                // the queue for the next pass.
                                saw_retry = true;
                            }
                            Err(err) => {
                                warn!(
                                    task_id = task.task_id,
                                    task_type = task.kind.task_type(),
                                    %err,
                                    "Timer task failed"
                                );
                                saw_retry = true;
                            }
                        }
                    }
                }
                Err(err) => warn!(%err, "Failed to read timer tasks"),
            }

            let sleep_duration = if saw_retry {
                config.standby_retry_backoff
            } else {
                let now = self.engine.shard().now();
                match self.store.next_timer_fire_time().await {
                    Ok(Some(fire_at)) if fire_at > now => (fire_at - now)
                        .to_std()
                        .unwrap_or(config.timer_poll_interval)
                        .min(config.timer_poll_interval),
                    Ok(Some(_)) => std::time::Duration::from_millis(10),
                    _ => config.timer_poll_interval,
                }
            };

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(sleep_duration) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(mode = ?self.mode, "Timer queue processor stopped");
    }

    async fn complete(&self, task_id: i64) {
        if let Err(err) = self.store.complete_timer_task(task_id).await {
            warn!(task_id, %err, "Unable to complete timer task");
        }
    }

    fn accepts(&self, task: &TimerTask) -> bool {
        let domains = &self.engine.domains;
        let domain_id = &task.workflow.domain_id;
        match &self.mode {
            TimerProcessorMode::Active => {
                !domains.is_global(domain_id)
                    || domains.active_cluster(domain_id) == self.engine.shard().current_cluster()
            }
            TimerProcessorMode::Standby { cluster } => {
                domains.is_global(domain_id) && &domains.active_cluster(domain_id) == cluster
            }
        }
    }

    async fn process(&self, task: &TimerTask) -> Result<()> {
        match &self.mode {
            TimerProcessorMode::Active => self.process_active(task).await,
            TimerProcessorMode::Standby { .. } => self.verify_standby(task).await,
        }
    }

    async fn process_active(&self, task: &TimerTask) -> Result<()> {
        let workflow = &task.workflow;
        match &task.kind {
            TimerTaskKind::WorkflowTimeout => {
                self.engine
                    .update_workflow_execution(workflow, true, false, |ms| {
                        if !ms.is_running() {
                            return Err(EngineError::not_exists(
                                "Workflow execution already completed.",
                            ));
                        }
                        ms.add_workflow_timed_out_event()
                            .ok_or_else(|| EngineError::internal("unable to time out workflow"))?;
                        Ok(Vec::new())
                    })
                    .await
            }

            TimerTaskKind::DecisionTimeout {
                schedule_id,
                attempt,
                timeout_type,
            } => {
                let schedule_id = *schedule_id;
                let attempt = *attempt;
                let timeout_type = *timeout_type;
                self.engine
                    .update_workflow_execution(workflow, false, true, |ms| {
                        if !ms.is_running() {
                            return Err(EngineError::not_exists(
                                "Workflow execution already completed.",
                            ));
                        }
                        let Some(decision) = ms
                            .get_pending_decision(schedule_id)
                            .filter(|decision| decision.attempt == attempt)
                        else {
                            // The decision moved on; the timer is stale.
                            return Err(EngineError::not_exists("Decision task not found."));
                        };
                        let fire = match timeout_type {
                            TimeoutType::StartToClose => {
                                decision.started_id != EMPTY_EVENT_ID
                            }
                            TimeoutType::ScheduleToStart => {
                                decision.started_id == EMPTY_EVENT_ID
                            }
                            _ => false,
                        };
                        if !fire {
                            return Err(EngineError::not_exists("Decision task not found."));
                        }
                        ms.add_decision_task_timed_out_event(schedule_id, timeout_type)
                            .ok_or_else(|| {
                                EngineError::internal("unable to time out decision task")
                            })?;
                        if timeout_type == TimeoutType::ScheduleToStart {
                            // Sticky dispatch went unanswered; fall back to
                            // the normal task list.
                            ms.clear_sticky();
                        }
                        Ok(Vec::new())
                    })
                    .await
            }

            TimerTaskKind::ActivityTimeout {
                schedule_id,
                timeout_type,
            } => {
                let schedule_id = *schedule_id;
                let timeout_type = *timeout_type;
                let shard = self.engine.shard().clone();
                let mut rearm_deadline = None;
                self.engine
                    .update_workflow_execution(workflow, false, true, |ms| {
                        if !ms.is_running() {
                            return Err(EngineError::not_exists(
                                "Workflow execution already completed.",
                            ));
                        }
                        let Some(activity) = ms.get_activity_info(schedule_id) else {
                            return Err(EngineError::not_exists("Activity task not found."));
                        };
                        let started = activity.started_id != EMPTY_EVENT_ID;
                        let relevant = match timeout_type {
                            TimeoutType::ScheduleToStart => !started,
                            TimeoutType::StartToClose | TimeoutType::Heartbeat => started,
                            TimeoutType::ScheduleToClose => true,
                        };
                        if !relevant {
                            return Err(EngineError::not_exists("Activity task not found."));
                        }
                        if timeout_type == TimeoutType::Heartbeat {
                            // Heartbeats extend the deadline; re-arm instead
                            // of firing when one arrived in time.
                            let heartbeat_timeout =
                                ChronoDuration::seconds(activity.heartbeat_timeout_secs as i64);
                            if let Some(last_heartbeat) = activity.last_heartbeat {
                                let deadline = last_heartbeat + heartbeat_timeout;
                                if deadline > shard.now() {
                                    rearm_deadline = Some(deadline);
                                    return Ok(Vec::new());
                                }
                            }
                        }
                        ms.add_activity_task_timed_out_event(schedule_id, timeout_type)
                            .ok_or_else(|| {
                                EngineError::internal("unable to time out activity task")
                            })?;
                        Ok(Vec::new())
                    })
                    .await?;

                if let Some(deadline) = rearm_deadline {
                    let rearmed = TimerTask {
                        task_id: 0,
                        workflow: workflow.clone(),
                        visibility_timestamp: deadline,
                        version: task.version,
                        kind: TimerTaskKind::ActivityTimeout {
                            schedule_id,
                            timeout_type: TimeoutType::Heartbeat,
                        },
                    };
                    self.engine
                        .update_workflow_execution(workflow, false, false, move |_ms| {
                            Ok(vec![rearmed.clone()])
                        })
                        .await?;
                }
                Ok(())
            }

            TimerTaskKind::UserTimer { timer_id, .. } => {
                let timer_id = timer_id.clone();
                self.engine
                    .update_workflow_execution(workflow, false, true, |ms| {
                        if !ms.is_running() {
                            return Err(EngineError::not_exists(
                                "Workflow execution already completed.",
                            ));
                        }
                        ms.add_timer_fired_event(&timer_id)
                            .ok_or_else(|| EngineError::not_exists("Timer not found."))?;
                        Ok(Vec::new())
                    })
                    .await
            }

            TimerTaskKind::DeleteHistoryEvent => self.delete_closed_run(task).await,
        }
    }

    async fn verify_standby(&self, task: &TimerTask) -> Result<()> {
        let workflow = &task.workflow;
        match &task.kind {
            TimerTaskKind::WorkflowTimeout => {
                let open = inspect_mutable_state(&self.engine, workflow, true, |ms| {
                    Ok(ms.is_running())
                })
                .await?;
                if open == Some(true) {
                    Err(EngineError::TaskRetry)
                } else {
                    Ok(())
                }
            }

            TimerTaskKind::DecisionTimeout { schedule_id, .. } => {
                let schedule_id = *schedule_id;
                inspect_mutable_state(&self.engine, workflow, false, |ms| {
                    if ms.get_pending_decision(schedule_id).is_some()
                        || schedule_id >= ms.next_event_id()
                    {
                        Err(EngineError::TaskRetry)
                    } else {
                        Ok(())
                    }
                })
                .await?;
                Ok(())
            }

            TimerTaskKind::ActivityTimeout { schedule_id, .. } => {
                let schedule_id = *schedule_id;
                inspect_mutable_state(&self.engine, workflow, false, |ms| {
                    if ms.get_activity_info(schedule_id).is_some()
                        || schedule_id >= ms.next_event_id()
                    {
                        Err(EngineError::TaskRetry)
                    } else {
                        Ok(())
                    }
                })
                .await?;
                Ok(())
            }

            TimerTaskKind::UserTimer { timer_id, .. } => {
                let timer_id = timer_id.clone();
                inspect_mutable_state(&self.engine, workflow, false, |ms| {
                    if ms.get_timer_info(&timer_id).is_some() {
                        Err(EngineError::TaskRetry)
                    } else {
                        Ok(())
                    }
                })
                .await?;
                Ok(())
            }

            // Retention cleanup happens on every cluster.
            TimerTaskKind::DeleteHistoryEvent => self.delete_closed_run(task).await,
        }
    }

    /// Retention expired: drop the run's mutable state and history.
    async fn delete_closed_run(&self, task: &TimerTask) -> Result<()> {
        let workflow = &task.workflow;
        let closed = inspect_mutable_state(&self.engine, workflow, true, |ms| {
            Ok(!ms.is_running())
        })
        .await;
        match closed {
            Ok(Some(true)) => {}
            Ok(_) => {
                // Still running: the cleanup timer outlived a reset run.
                return Ok(());
            }
            Err(EngineError::EntityNotExists { .. }) => return Ok(()),
            Err(err) => return Err(err),
        }

        debug!(
            workflow_id = %workflow.workflow_id,
            run_id = %workflow.run_id,
            "Retention expired, deleting run"
        );
        self.store
            .delete_workflow_execution(
                &workflow.domain_id,
                &workflow.workflow_id,
                &workflow.run_id,
            )
            .await?;
        self.engine
            .history_store
            .delete_workflow_execution_history(workflow)
            .await
    }
}

impl CommitHooks for TimerQueueProcessor {
    fn on_timer_tasks(&self, _tasks: &[TimerTask]) {
        self.notify.notify_one();
    }
}
