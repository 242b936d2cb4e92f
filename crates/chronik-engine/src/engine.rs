// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The history engine.
//!
//! Entry point for all per-shard workflow RPCs. The request handlers live in
//! three sibling modules sharing this struct: `workflow_handlers`
//! (start/signal/cancel/terminate/query), `decision_handlers` and
//! `activity_handlers`. This module owns the construction wiring and the
//! canonical optimistic-concurrency **update loop** every mutating operation
//! goes through:
//!
//! 1. acquire the run's context from the cache,
//! 2. load mutable state,
//! 3. run the caller's action (pure state manipulation),
//! 4. persist atomically under the CAS condition,
//! 5. on `Conflict` reload and retry (bounded), on `StaleState` clear the
//!    cache entry and retry,
//! 6. after a successful persist the commit hooks wake the queue processors
//!    and the history-event notifier.
//!
//! External dispatch never happens inside the loop; retries only repeat pure
//! computation plus the persist.

use std::sync::Arc;

use chrono::Duration;
use tracing::debug;
use uuid::Uuid;

use chronik_types::task::{TimerTask, TimerTaskKind, TransferTask, TransferTaskKind};
use chronik_types::{TimeoutType, WorkflowRun};

use crate::cache::ExecutionCache;
use crate::clients::DomainRegistry;
use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::mutable_state::MutableStateBuilder;
use crate::notifier::HistoryEventNotifier;
use crate::persistence::{with_retry, ExecutionStore, HistoryStore, RetryPolicy, VisibilityStore};
use crate::shard::ShardContext;

/// Per-shard history engine.
pub struct HistoryEngine {
    pub(crate) shard: Arc<ShardContext>,
    pub(crate) config: Arc<Config>,
    pub(crate) execution_store: Arc<dyn ExecutionStore>,
    pub(crate) history_store: Arc<dyn HistoryStore>,
    pub(crate) visibility_store: Arc<dyn VisibilityStore>,
    pub(crate) domains: Arc<dyn DomainRegistry>,
    pub(crate) cache: Arc<ExecutionCache>,
    pub(crate) notifier: Arc<HistoryEventNotifier>,
    pub(crate) retry_policy: RetryPolicy,
}

impl HistoryEngine {
    /// Wire an engine for one shard. Registers the history-event notifier as
    /// a commit hook; queue processors register theirs when the runtime
    /// starts them.
    pub fn new(
        shard: Arc<ShardContext>,
        config: Arc<Config>,
        execution_store: Arc<dyn ExecutionStore>,
        history_store: Arc<dyn HistoryStore>,
        visibility_store: Arc<dyn VisibilityStore>,
        domains: Arc<dyn DomainRegistry>,
        cache_capacity: usize,
    ) -> Arc<Self> {
        let retry_policy = RetryPolicy::from_config(&config);
        let cache = Arc::new(ExecutionCache::new(
            cache_capacity,
            shard.clone(),
            execution_store.clone(),
            history_store.clone(),
            retry_policy,
        ));
        let notifier = Arc::new(HistoryEventNotifier::new());
        shard.register_hooks(notifier.clone());

        Arc::new(Self {
            shard,
            config,
            execution_store,
            history_store,
            visibility_store,
            domains,
            cache,
            notifier,
            retry_policy,
        })
    }

    /// The shard this engine serves.
    pub fn shard(&self) -> &Arc<ShardContext> {
        &self.shard
    }

    /// Engine configuration.
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// The execution cache, shared with the standby processors.
    pub(crate) fn execution_cache(&self) -> &Arc<ExecutionCache> {
        &self.cache
    }

    /// Fresh run ID.
    pub(crate) fn new_run_id(&self) -> String {
        Uuid::new_v4().to_string()
    }

    /// Failover version to stamp mutations with, for global domains.
    pub(crate) fn replication_version(&self, domain_id: &str) -> Option<i64> {
        self.domains
            .is_global(domain_id)
            .then(|| self.domains.failover_version(domain_id))
    }

    /// Resolve the target run: the given run ID (validated) or the current
    /// run of the workflow ID.
    pub(crate) async fn resolve_workflow_run(
        &self,
        domain_id: &str,
        workflow_id: &str,
        run_id: Option<&str>,
    ) -> Result<WorkflowRun> {
        if domain_id.is_empty() {
            return Err(EngineError::bad_request("Missing domain ID."));
        }
        if workflow_id.is_empty() {
            return Err(EngineError::bad_request("Missing workflow ID."));
        }
        match run_id {
            Some(run_id) if !run_id.is_empty() => {
                Uuid::parse_str(run_id)
                    .map_err(|_| EngineError::bad_request("Invalid run ID."))?;
                Ok(WorkflowRun::new(domain_id, workflow_id, run_id))
            }
            _ => {
                let store = self.execution_store.clone();
                let current = with_retry(self.retry_policy, || {
                    store.get_current_execution(domain_id, workflow_id)
                })
                .await?;
                Ok(WorkflowRun::new(domain_id, workflow_id, current.run_id))
            }
        }
    }

    /// The canonical update loop. `action` mutates the builder and returns
    /// the timer tasks its transition needs; it may fail with `StaleState`
    /// to force a cache reload. With `create_decision_task`, a decision is
    /// scheduled after the action when none is pending; with
    /// `create_deletion_task`, close-execution follow-ups are appended.
    pub(crate) async fn update_workflow_execution<F>(
        &self,
        workflow: &WorkflowRun,
        create_deletion_task: bool,
        create_decision_task: bool,
        mut action: F,
    ) -> Result<()>
    where
        F: FnMut(&mut MutableStateBuilder) -> Result<Vec<TimerTask>>,
    {
        let mut ctx = self.cache.acquire(workflow).await;

        for attempt in 0..self.config.conditional_retry_count {
            let ms = ctx.load().await?;

            let mut timer_tasks = match action(ms) {
                Err(EngineError::StaleState) => {
                    debug!(
                        workflow_id = %workflow.workflow_id,
                        run_id = %workflow.run_id,
                        attempt,
                        "Cached mutable state is stale, reloading"
                    );
                    ctx.clear();
                    continue;
                }
                Err(err) => return Err(err),
                Ok(timer_tasks) => timer_tasks,
            };

            let mut transfer_tasks = Vec::new();

            if create_decision_task && ms.is_running() && !ms.has_pending_decision() {
                let decision = ms
                    .add_decision_task_scheduled_event()
                    .ok_or_else(|| EngineError::internal("failed to schedule decision task"))?;
                transfer_tasks.push(TransferTask {
                    task_id: 0,
                    workflow: workflow.clone(),
                    version: 0,
                    kind: TransferTaskKind::DecisionTask {
                        task_list: ms.decision_task_list(),
                        schedule_id: decision.schedule_id,
                    },
                });
                if ms.is_sticky_enabled() {
                    timer_tasks.push(self.decision_schedule_to_start_timer(
                        workflow,
                        decision.schedule_id,
                        decision.attempt,
                        ms.execution_info.sticky_schedule_to_start_timeout_secs,
                    ));
                }
            }

            if create_deletion_task {
                let (close_task, cleanup_timer) = self.close_workflow_tasks(workflow);
                transfer_tasks.push(close_task);
                timer_tasks.push(cleanup_timer);
            }

            let failover_version = self.replication_version(&workflow.domain_id);
            match ctx
                .update_workflow_execution(transfer_tasks, timer_tasks, failover_version)
                .await
            {
                Err(EngineError::Conflict) => {
                    debug!(
                        workflow_id = %workflow.workflow_id,
                        run_id = %workflow.run_id,
                        attempt,
                        "Conditional update failed, retrying"
                    );
                    continue;
                }
                Err(err) => return Err(err),
                Ok(()) => {
                    ctx.release();
                    return Ok(());
                }
            }
        }
        Err(EngineError::MaxAttemptsExceeded)
    }

    /// Follow-ups of closing a run: one CloseExecution transfer task and one
    /// retention-scheduled history-cleanup timer.
    pub(crate) fn close_workflow_tasks(&self, workflow: &WorkflowRun) -> (TransferTask, TimerTask) {
        let retention_days = self.domains.retention_days(&workflow.domain_id);
        let close_task = TransferTask {
            task_id: 0,
            workflow: workflow.clone(),
            version: 0,
            kind: TransferTaskKind::CloseExecution,
        };
        let cleanup_timer = TimerTask {
            task_id: 0,
            workflow: workflow.clone(),
            visibility_timestamp: self.shard.now() + Duration::days(retention_days as i64),
            version: 0,
            kind: TimerTaskKind::DeleteHistoryEvent,
        };
        (close_task, cleanup_timer)
    }

    /// Workflow-timeout timer of a fresh run.
    pub(crate) fn workflow_timeout_timer(
        &self,
        workflow: &WorkflowRun,
        timeout_secs: i32,
    ) -> TimerTask {
        TimerTask {
            task_id: 0,
            workflow: workflow.clone(),
            visibility_timestamp: self.shard.now() + Duration::seconds(timeout_secs as i64),
            version: 0,
            kind: TimerTaskKind::WorkflowTimeout,
        }
    }

    /// Start-to-close timer of a started decision.
    pub(crate) fn decision_timeout_timer(
        &self,
        workflow: &WorkflowRun,
        schedule_id: i64,
        attempt: i64,
        timeout_secs: i32,
    ) -> TimerTask {
        TimerTask {
            task_id: 0,
            workflow: workflow.clone(),
            visibility_timestamp: self.shard.now() + Duration::seconds(timeout_secs as i64),
            version: 0,
            kind: TimerTaskKind::DecisionTimeout {
                schedule_id,
                attempt,
                timeout_type: TimeoutType::StartToClose,
            },
        }
    }

    /// Schedule-to-start timer of a decision dispatched to a sticky task
    /// list.
    pub(crate) fn decision_schedule_to_start_timer(
        &self,
        workflow: &WorkflowRun,
        schedule_id: i64,
        attempt: i64,
        timeout_secs: i32,
    ) -> TimerTask {
        TimerTask {
            task_id: 0,
            workflow: workflow.clone(),
            visibility_timestamp: self.shard.now() + Duration::seconds(timeout_secs as i64),
            version: 0,
            kind: TimerTaskKind::DecisionTimeout {
                schedule_id,
                attempt,
                timeout_type: TimeoutType::ScheduleToStart,
            },
        }
    }

    /// Deadline timers armed when an activity is scheduled.
    pub(crate) fn activity_scheduled_timers(
        &self,
        workflow: &WorkflowRun,
        schedule_id: i64,
        schedule_to_start_timeout_secs: i32,
        schedule_to_close_timeout_secs: i32,
    ) -> Vec<TimerTask> {
        let now = self.shard.now();
        vec![
            TimerTask {
                task_id: 0,
                workflow: workflow.clone(),
                visibility_timestamp: now
                    + Duration::seconds(schedule_to_start_timeout_secs as i64),
                version: 0,
                kind: TimerTaskKind::ActivityTimeout {
                    schedule_id,
                    timeout_type: TimeoutType::ScheduleToStart,
                },
            },
            TimerTask {
                task_id: 0,
                workflow: workflow.clone(),
                visibility_timestamp: now
                    + Duration::seconds(schedule_to_close_timeout_secs as i64),
                version: 0,
                kind: TimerTaskKind::ActivityTimeout {
                    schedule_id,
                    timeout_type: TimeoutType::ScheduleToClose,
                },
            },
        ]
    }

    /// Deadline timers armed when an activity starts.
    pub(crate) fn activity_started_timers(
        &self,
        workflow: &WorkflowRun,
        schedule_id: i64,
        start_to_close_timeout_secs: i32,
        heartbeat_timeout_secs: i32,
    ) -> Vec<TimerTask> {
        let now = self.shard.now();
        let mut timers = vec![TimerTask {
            task_id: 0,
            workflow: workflow.clone(),
            visibility_timestamp: now + Duration::seconds(start_to_close_timeout_secs as i64),
            version: 0,
            kind: TimerTaskKind::ActivityTimeout {
                schedule_id,
                timeout_type: TimeoutType::StartToClose,
            },
        }];
        if heartbeat_timeout_secs > 0 {
            timers.push(TimerTask {
                task_id: 0,
                workflow: workflow.clone(),
                visibility_timestamp: now + Duration::seconds(heartbeat_timeout_secs as i64),
                version: 0,
                kind: TimerTaskKind::ActivityTimeout {
                    schedule_id,
                    timeout_type: TimeoutType::Heartbeat,
                },
            });
        }
        timers
    }

    /// Timer task of a user timer.
    pub(crate) fn user_timer_task(
        &self,
        workflow: &WorkflowRun,
        timer_id: &str,
        started_event_id: i64,
        expiry: chrono::DateTime<chrono::Utc>,
    ) -> TimerTask {
        TimerTask {
            task_id: 0,
            workflow: workflow.clone(),
            visibility_timestamp: expiry,
            version: 0,
            kind: TimerTaskKind::UserTimer {
                timer_id: timer_id.to_string(),
                started_event_id,
            },
        }
    }
}
