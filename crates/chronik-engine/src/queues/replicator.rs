// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Replication queue processor and standby event application.
//!
//! The processor drains the per-shard replication log: for every committed
//! batch it reads the events back from the history store and publishes them
//! through the replication producer (with the successor run's first batch
//! attached for continue-as-new commits).
//!
//! `apply_replicated_events` is the receiving side: a standby cluster folds
//! the shipped batch into local history and mutable state. Batches apply in
//! order per run; an out-of-order batch answers `TaskRetry` so the caller
//! re-enqueues it.

use std::sync::Arc;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use chronik_types::event::{EventAttributes, HistoryEvent};
use chronik_types::request::ReplicateEventsRequest;
use chronik_types::{CloseStatus, WorkflowRun, WorkflowState, EMPTY_EVENT_ID, FIRST_EVENT_ID};

use crate::clients::{ReplicationMessage, ReplicationProducer};
use crate::engine::HistoryEngine;
use crate::error::{EngineError, Result};
use crate::persistence::{
    ActivityInfo, AppendHistoryEventsRequest, ChildExecutionInfo, CreateWorkflowExecutionRequest,
    ExecutionStore, HistoryStore, ReplicationState, RequestCancelInfo, SignalInfo, TimerInfo,
    UpdateWorkflowExecutionRequest, WorkflowMutableStateRecord,
};
use crate::shard::{CommitHooks, ShardContext};

/// Publishes committed event batches to peer clusters.
pub struct ReplicatorQueueProcessor {
    shard: Arc<ShardContext>,
    execution_store: Arc<dyn ExecutionStore>,
    history_store: Arc<dyn HistoryStore>,
    producer: Arc<dyn ReplicationProducer>,
    batch_size: usize,
    poll_interval: std::time::Duration,
    notify: Arc<Notify>,
}

impl ReplicatorQueueProcessor {
    /// Processor publishing through `producer`.
    pub fn new(
        shard: Arc<ShardContext>,
        execution_store: Arc<dyn ExecutionStore>,
        history_store: Arc<dyn HistoryStore>,
        producer: Arc<dyn ReplicationProducer>,
        batch_size: usize,
        poll_interval: std::time::Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            shard,
            execution_store,
            history_store,
            producer,
            batch_size,
            poll_interval,
            notify: Arc::new(Notify::new()),
        })
    }

    /// Spawn the publish loop.
    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            this.run(shutdown).await;
        })
    }

    async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        debug!("Replicator queue processor started");
        loop {
            let drained = match self.publish_batch().await {
                Ok(drained) => drained,
                Err(err) => {
                    warn!(%err, "Replication publish batch failed");
                    true
                }
            };
            if !drained {
                continue;
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Replicator queue processor stopped");
    }

    /// Publish one batch of replication tasks. Returns true when the log is
    /// drained.
    async fn publish_batch(&self) -> Result<bool> {
        let tasks = self
            .execution_store
            .get_replication_tasks(self.shard.replication_ack_level(), self.batch_size)
            .await?;
        if tasks.is_empty() {
            return Ok(true);
        }
        let drained = tasks.len() < self.batch_size;

        for task in tasks {
            let events = self
                .history_store
                .get_workflow_execution_history(
                    &task.workflow,
                    task.first_event_id,
                    task.next_event_id,
                )
                .await?;

            // Attach the successor's first batch for continue-as-new
            // commits so the standby can create both runs atomically.
            let new_run_events = match events.last().map(|event| &event.attributes) {
                Some(EventAttributes::WorkflowExecutionContinuedAsNew(attrs)) => {
                    let successor = WorkflowRun::new(
                        &task.workflow.domain_id,
                        &task.workflow.workflow_id,
                        &attrs.new_run_id,
                    );
                    Some(
                        self.history_store
                            .get_workflow_execution_history(&successor, FIRST_EVENT_ID, i64::MAX)
                            .await?,
                    )
                }
                _ => None,
            };

            self.producer
                .publish(ReplicationMessage {
                    workflow: task.workflow.clone(),
                    first_event_id: task.first_event_id,
                    next_event_id: task.next_event_id,
                    version: task.version,
                    events,
                    new_run_events,
                })
                .await?;
            self.execution_store
                .complete_replication_task(task.task_id)
                .await?;
            self.shard.update_replication_ack_level(task.task_id);
        }
        Ok(drained)
    }
}

impl CommitHooks for ReplicatorQueueProcessor {
    fn on_replication_tasks(&self) {
        self.notify.notify_one();
    }
}

/// Apply a batch shipped from the active cluster to local state.
pub(crate) async fn apply_replicated_events(
    engine: &HistoryEngine,
    request: ReplicateEventsRequest,
) -> Result<()> {
    if request.history.is_empty() {
        return Err(EngineError::bad_request("Empty replication batch."));
    }
    let workflow = WorkflowRun::new(&request.domain_id, &request.workflow_id, &request.run_id);

    if request.first_event_id == FIRST_EVENT_ID {
        apply_first_batch(engine, &workflow, &request.history, request.version).await?;
    } else {
        apply_subsequent_batch(engine, &workflow, &request).await?;
    }

    // Continue-as-new batches carry the successor's first batch.
    if let Some(new_run_history) = &request.new_run_history {
        if let Some(EventAttributes::WorkflowExecutionContinuedAsNew(attrs)) =
            request.history.last().map(|event| &event.attributes)
        {
            let successor =
                WorkflowRun::new(&request.domain_id, &request.workflow_id, &attrs.new_run_id);
            apply_first_batch(engine, &successor, new_run_history, request.version).await?;
        }
    }
    Ok(())
}

async fn apply_first_batch(
    engine: &HistoryEngine,
    workflow: &WorkflowRun,
    history: &[HistoryEvent],
    version: i64,
) -> Result<()> {
    let mut record = empty_record(workflow);
    for event in history {
        fold_event(&mut record, event);
    }
    let next_event_id = history.last().map(|event| event.event_id + 1).unwrap_or(1);
    finish_record(&mut record, FIRST_EVENT_ID, next_event_id, version);

    engine
        .history_store
        .append_history_events(&AppendHistoryEventsRequest {
            workflow: workflow.clone(),
            first_event_id: FIRST_EVENT_ID,
            transaction_id: 0,
            events: history.to_vec(),
        })
        .await
        .or_else(ignore_conflict)?;

    let create = CreateWorkflowExecutionRequest {
        request_id: record.execution_info.create_request_id.clone(),
        snapshot: record,
        transfer_tasks: Vec::new(),
        timer_tasks: Vec::new(),
        replication_tasks: Vec::new(),
        continue_as_new: false,
        previous_run_id: None,
    };
    match engine.execution_store.create_workflow_execution(&create).await {
        Ok(()) => Ok(()),
        // The run exists already: the batch is a redelivery.
        Err(EngineError::WorkflowAlreadyStarted { .. }) => Ok(()),
        Err(err) => Err(err),
    }
}

async fn apply_subsequent_batch(
    engine: &HistoryEngine,
    workflow: &WorkflowRun,
    request: &ReplicateEventsRequest,
) -> Result<()> {
    let mut ctx = engine.execution_cache().acquire(workflow).await;
    let ms = match ctx.load().await {
        Ok(ms) => ms,
        // The first batch has not arrived yet.
        Err(EngineError::EntityNotExists { .. }) => return Err(EngineError::TaskRetry),
        Err(err) => return Err(err),
    };

    let local_next = ms.next_event_id();
    if local_next > request.first_event_id {
        // Already applied; redelivery.
        ctx.release();
        return Ok(());
    }
    if local_next < request.first_event_id {
        // A gap: an earlier batch is still in flight.
        ctx.release();
        return Err(EngineError::TaskRetry);
    }

    let mut record = ms.snapshot_record();
    let before = record.clone();
    for event in &request.history {
        fold_event(&mut record, event);
    }
    finish_record(
        &mut record,
        request.first_event_id,
        request.next_event_id,
        request.version,
    );

    engine
        .history_store
        .append_history_events(&AppendHistoryEventsRequest {
            workflow: workflow.clone(),
            first_event_id: request.first_event_id,
            transaction_id: engine.shard().next_transfer_task_id(),
            events: request.history.clone(),
        })
        .await
        .or_else(ignore_conflict)?;

    let update = replication_update_request(&before, &record, local_next);
    engine.execution_store.update_workflow_execution(&update).await?;

    // Local cached state is superseded by what was just written.
    ctx.clear();
    ctx.release();
    Ok(())
}

fn ignore_conflict(err: EngineError) -> Result<()> {
    match err {
        EngineError::Conflict => Ok(()),
        other => Err(other),
    }
}

fn empty_record(workflow: &WorkflowRun) -> WorkflowMutableStateRecord {
    let mut record = WorkflowMutableStateRecord {
        execution_info: Default::default(),
        activity_infos: Default::default(),
        timer_infos: Default::default(),
        child_infos: Default::default(),
        cancel_infos: Default::default(),
        signal_infos: Default::default(),
        signal_requested_ids: Default::default(),
        buffered_events: Vec::new(),
        replication_state: None,
    };
    record.execution_info.domain_id = workflow.domain_id.clone();
    record.execution_info.workflow_id = workflow.workflow_id.clone();
    record.execution_info.run_id = workflow.run_id.clone();
    record
}

fn finish_record(
    record: &mut WorkflowMutableStateRecord,
    first_event_id: i64,
    next_event_id: i64,
    version: i64,
) {
    record.execution_info.next_event_id = next_event_id;
    record.execution_info.last_first_event_id = first_event_id;
    let start_version = record
        .replication_state
        .map(|state| state.start_version)
        .unwrap_or(version);
    record.replication_state = Some(ReplicationState {
        current_version: version,
        start_version,
        last_write_version: version,
        last_write_event_id: next_event_id - 1,
    });
}

/// Fold one replicated event into the mutable-state projection. Mirrors the
/// footprint each event leaves when built locally.
fn fold_event(record: &mut WorkflowMutableStateRecord, event: &HistoryEvent) {
    let info = &mut record.execution_info;
    match &event.attributes {
        EventAttributes::WorkflowExecutionStarted(attrs) => {
            info.workflow_type = attrs.workflow_type.clone();
            info.task_list = attrs.task_list.clone();
            info.workflow_timeout_secs = attrs.execution_timeout_secs;
            info.decision_timeout_secs = attrs.decision_timeout_secs;
            info.parent_workflow_id = attrs.parent_workflow_id.clone();
            info.parent_run_id = attrs.parent_run_id.clone();
            info.start_timestamp = event.timestamp;
            info.last_updated = event.timestamp;
        }
        EventAttributes::DecisionTaskScheduled(attrs) => {
            info.decision_schedule_id = event.event_id;
            info.decision_started_id = EMPTY_EVENT_ID;
            info.decision_attempt = attrs.attempt;
            info.decision_request_id.clear();
        }
        EventAttributes::DecisionTaskStarted(attrs) => {
            info.decision_started_id = event.event_id;
            info.decision_request_id = attrs.request_id.clone();
        }
        EventAttributes::DecisionTaskCompleted(attrs) => {
            info.decision_schedule_id = EMPTY_EVENT_ID;
            info.decision_started_id = EMPTY_EVENT_ID;
            info.decision_request_id.clear();
            info.decision_attempt = 0;
            info.last_processed_event = attrs.started_event_id;
        }
        EventAttributes::DecisionTaskFailed(_) | EventAttributes::DecisionTaskTimedOut(_) => {
            info.decision_schedule_id = EMPTY_EVENT_ID;
            info.decision_started_id = EMPTY_EVENT_ID;
            info.decision_request_id.clear();
            info.decision_attempt += 1;
        }
        EventAttributes::ActivityTaskScheduled(attrs) => {
            record.activity_infos.insert(
                event.event_id,
                ActivityInfo {
                    schedule_id: event.event_id,
                    scheduled_event: event.clone(),
                    started_id: EMPTY_EVENT_ID,
                    started_event: None,
                    activity_id: attrs.activity_id.clone(),
                    request_id: String::new(),
                    schedule_to_close_timeout_secs: attrs.schedule_to_close_timeout_secs,
                    schedule_to_start_timeout_secs: attrs.schedule_to_start_timeout_secs,
                    start_to_close_timeout_secs: attrs.start_to_close_timeout_secs,
                    heartbeat_timeout_secs: attrs.heartbeat_timeout_secs,
                    cancel_requested: false,
                    cancel_request_event_id: EMPTY_EVENT_ID,
                    details: None,
                    last_heartbeat: None,
                },
            );
        }
        EventAttributes::ActivityTaskStarted(attrs) => {
            if let Some(activity) = record.activity_infos.get_mut(&attrs.scheduled_event_id) {
                activity.started_id = event.event_id;
                activity.started_event = Some(event.clone());
                activity.request_id = attrs.request_id.clone();
            }
        }
        EventAttributes::ActivityTaskCompleted(attrs) => {
            record.activity_infos.remove(&attrs.scheduled_event_id);
        }
        EventAttributes::ActivityTaskFailed(attrs) => {
            record.activity_infos.remove(&attrs.scheduled_event_id);
        }
        EventAttributes::ActivityTaskCanceled(attrs) => {
            record.activity_infos.remove(&attrs.scheduled_event_id);
        }
        EventAttributes::ActivityTaskTimedOut(attrs) => {
            record.activity_infos.remove(&attrs.scheduled_event_id);
        }
        EventAttributes::ActivityTaskCancelRequested(attrs) => {
            if let Some(activity) = record
                .activity_infos
                .values_mut()
                .find(|activity| activity.activity_id == attrs.activity_id)
            {
                activity.cancel_requested = true;
                activity.cancel_request_event_id = event.event_id;
            }
        }
        EventAttributes::TimerStarted(attrs) => {
            record.timer_infos.insert(
                attrs.timer_id.clone(),
                TimerInfo {
                    timer_id: attrs.timer_id.clone(),
                    started_event_id: event.event_id,
                    expiry: event.timestamp
                        + chrono::Duration::seconds(attrs.start_to_fire_timeout_secs),
                },
            );
        }
        EventAttributes::TimerFired(attrs) => {
            record.timer_infos.remove(&attrs.timer_id);
        }
        EventAttributes::TimerCanceled(attrs) => {
            record.timer_infos.remove(&attrs.timer_id);
        }
        EventAttributes::WorkflowExecutionCancelRequested(_) => {
            info.cancel_requested = true;
        }
        EventAttributes::RequestCancelExternalWorkflowExecutionInitiated(attrs) => {
            record.cancel_infos.insert(
                event.event_id,
                RequestCancelInfo {
                    initiated_id: event.event_id,
                    cancel_request_id: attrs.cancel_request_id.clone(),
                },
            );
        }
        EventAttributes::ExternalWorkflowExecutionCancelRequested(attrs) => {
            record.cancel_infos.remove(&attrs.initiated_event_id);
        }
        EventAttributes::RequestCancelExternalWorkflowExecutionFailed(attrs) => {
            record.cancel_infos.remove(&attrs.initiated_event_id);
        }
        EventAttributes::SignalExternalWorkflowExecutionInitiated(attrs) => {
            record.signal_infos.insert(
                event.event_id,
                SignalInfo {
                    initiated_id: event.event_id,
                    signal_request_id: attrs.signal_request_id.clone(),
                    signal_name: attrs.signal_name.clone(),
                    input: attrs.input.clone(),
                },
            );
        }
        EventAttributes::ExternalWorkflowExecutionSignaled(attrs) => {
            record.signal_infos.remove(&attrs.initiated_event_id);
        }
        EventAttributes::SignalExternalWorkflowExecutionFailed(attrs) => {
            record.signal_infos.remove(&attrs.initiated_event_id);
        }
        EventAttributes::StartChildWorkflowExecutionInitiated(attrs) => {
            record.child_infos.insert(
                event.event_id,
                ChildExecutionInfo {
                    initiated_id: event.event_id,
                    initiated_event: event.clone(),
                    started_id: EMPTY_EVENT_ID,
                    started_run_id: None,
                    create_request_id: attrs.create_request_id.clone(),
                },
            );
        }
        EventAttributes::ChildWorkflowExecutionStarted(attrs) => {
            if let Some(child) = record.child_infos.get_mut(&attrs.initiated_event_id) {
                child.started_id = event.event_id;
                child.started_run_id = Some(attrs.run_id.clone());
            }
        }
        EventAttributes::StartChildWorkflowExecutionFailed(attrs) => {
            record.child_infos.remove(&attrs.initiated_event_id);
        }
        EventAttributes::ChildWorkflowExecutionCompleted(attrs) => {
            record.child_infos.remove(&attrs.initiated_event_id);
        }
        EventAttributes::ChildWorkflowExecutionFailed(attrs) => {
            record.child_infos.remove(&attrs.initiated_event_id);
        }
        EventAttributes::ChildWorkflowExecutionCanceled(attrs) => {
            record.child_infos.remove(&attrs.initiated_event_id);
        }
        EventAttributes::ChildWorkflowExecutionTerminated(attrs) => {
            record.child_infos.remove(&attrs.initiated_event_id);
        }
        EventAttributes::ChildWorkflowExecutionTimedOut(attrs) => {
            record.child_infos.remove(&attrs.initiated_event_id);
        }
        EventAttributes::WorkflowExecutionCompleted(_)
        | EventAttributes::WorkflowExecutionContinuedAsNew(_) => {
            info.state = WorkflowState::Completed;
            info.close_status = CloseStatus::Completed;
            info.last_updated = event.timestamp;
        }
        EventAttributes::WorkflowExecutionFailed(_) => {
            info.state = WorkflowState::Completed;
            info.close_status = CloseStatus::Failed;
            info.last_updated = event.timestamp;
        }
        EventAttributes::WorkflowExecutionCanceled(_) => {
            info.state = WorkflowState::Completed;
            info.close_status = CloseStatus::Canceled;
            info.last_updated = event.timestamp;
        }
        EventAttributes::WorkflowExecutionTerminated(_) => {
            info.state = WorkflowState::Completed;
            info.close_status = CloseStatus::Terminated;
            info.last_updated = event.timestamp;
        }
        EventAttributes::WorkflowExecutionTimedOut(_) => {
            info.state = WorkflowState::Completed;
            info.close_status = CloseStatus::TimedOut;
            info.last_updated = event.timestamp;
        }
        // Signals, markers and decision-failure details leave no
        // mutable-state footprint beyond the history itself.
        EventAttributes::WorkflowExecutionSignaled(_)
        | EventAttributes::MarkerRecorded(_)
        | EventAttributes::RequestCancelActivityTaskFailed(_)
        | EventAttributes::CancelTimerFailed(_) => {}
    }
}

/// Build the store update that replaces local state with the folded record.
fn replication_update_request(
    before: &WorkflowMutableStateRecord,
    after: &WorkflowMutableStateRecord,
    condition: i64,
) -> UpdateWorkflowExecutionRequest {
    UpdateWorkflowExecutionRequest {
        execution_info: after.execution_info.clone(),
        replication_state: after.replication_state,
        condition,
        upsert_activity_infos: after.activity_infos.values().cloned().collect(),
        delete_activity_infos: before
            .activity_infos
            .keys()
            .filter(|key| !after.activity_infos.contains_key(key))
            .copied()
            .collect(),
        upsert_timer_infos: after.timer_infos.values().cloned().collect(),
        delete_timer_infos: before
            .timer_infos
            .keys()
            .filter(|key| !after.timer_infos.contains_key(*key))
            .cloned()
            .collect(),
        upsert_child_infos: after.child_infos.values().cloned().collect(),
        delete_child_info: before
            .child_infos
            .keys()
            .find(|key| !after.child_infos.contains_key(key))
            .copied(),
        upsert_cancel_infos: after.cancel_infos.values().cloned().collect(),
        delete_cancel_info: before
            .cancel_infos
            .keys()
            .find(|key| !after.cancel_infos.contains_key(key))
            .copied(),
        upsert_signal_infos: after.signal_infos.values().cloned().collect(),
        delete_signal_info: before
            .signal_infos
            .keys()
            .find(|key| !after.signal_infos.contains_key(key))
            .copied(),
        ..Default::default()
    }
}
