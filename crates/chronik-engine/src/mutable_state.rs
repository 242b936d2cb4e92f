// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mutable-state builder.
//!
//! The builder holds one run's mutable state loaded from the execution store
//! plus everything the current operation changed: newly built history events,
//! pending-info upserts/deletes, and optionally a staged successor run for
//! continue-as-new. [`MutableStateBuilder::close_update_session`] hands the
//! accumulated deltas to the workflow-execution context for the atomic
//! persist.
//!
//! Per-run invariants enforced here:
//! - event IDs auto-increment on every added event;
//! - at most one decision task is pending at any time;
//! - events produced while a decision is in flight are buffered and only
//!   enter history when that decision completes;
//! - retried decisions (attempt > 0) keep their scheduled/started events out
//!   of history until the decision finally completes.
//!
//! Event builders return `None` when their preconditions are not met; callers
//! surface that as an internal-service error.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Duration;

use chronik_types::decision::{
    ContinueAsNewWorkflowExecutionAttributes, ScheduleActivityTaskAttributes,
};
use chronik_types::event::*;
use chronik_types::request::StartWorkflowRequest;
use chronik_types::task::{TimerTask, TimerTaskKind, TransferTask, TransferTaskKind};
use chronik_types::{
    CloseStatus, TimeoutType, WorkflowRun, WorkflowState, BUFFERED_EVENT_ID, EMPTY_EVENT_ID,
    FIRST_EVENT_ID,
};

use crate::clock::Clock;
use crate::persistence::{
    ActivityInfo, ChildExecutionInfo, ExecutionInfo, ReplicationState, RequestCancelInfo,
    SignalInfo, TimerInfo, WorkflowMutableStateRecord,
};

/// The pending decision task, assembled from execution-info bookkeeping.
#[derive(Clone, Debug, PartialEq)]
pub struct DecisionInfo {
    /// Scheduled-event ID (virtual for retried decisions).
    pub schedule_id: i64,
    /// Started-event ID, or EMPTY_EVENT_ID while scheduled only.
    pub started_id: i64,
    /// Poll request ID the decision was started with.
    pub request_id: String,
    /// Retry attempt; zero for first attempts.
    pub attempt: i64,
    /// Start-to-close timeout of the decision.
    pub timeout_secs: i32,
}

/// Successor run staged by a ContinueAsNew command, persisted atomically with
/// the close of the current run.
pub struct ContinueAsNewBundle {
    /// Builder of the successor run, holding its initial history events.
    pub builder: Box<MutableStateBuilder>,
    /// Transfer tasks of the successor run (its first decision dispatch).
    /// Task IDs are assigned at persist time.
    pub transfer_tasks: Vec<TransferTask>,
    /// Timer tasks of the successor run (its workflow timeout).
    pub timer_tasks: Vec<TimerTask>,
}

/// Everything one update session accumulated, in store-request shape.
#[derive(Default)]
pub struct SessionUpdates {
    /// New history events since load, in order. Possibly empty.
    pub new_events: Vec<HistoryEvent>,
    /// Pending-info deltas.
    pub upsert_activity_infos: Vec<ActivityInfo>,
    /// Scheduled-event IDs of removed activities.
    pub delete_activity_infos: Vec<i64>,
    /// Pending-timer deltas.
    pub upsert_timer_infos: Vec<TimerInfo>,
    /// Timer IDs of removed timers.
    pub delete_timer_infos: Vec<String>,
    /// Pending-child deltas.
    pub upsert_child_infos: Vec<ChildExecutionInfo>,
    /// Initiated-event ID of the removed child.
    pub delete_child_info: Option<i64>,
    /// Pending external-cancel deltas.
    pub upsert_cancel_infos: Vec<RequestCancelInfo>,
    /// Initiated-event ID of the removed cancel.
    pub delete_cancel_info: Option<i64>,
    /// Pending external-signal deltas.
    pub upsert_signal_infos: Vec<SignalInfo>,
    /// Initiated-event ID of the removed signal.
    pub delete_signal_info: Option<i64>,
    /// Added signal-request dedup IDs.
    pub upsert_signal_requested_ids: Vec<String>,
    /// Removed signal-request dedup ID.
    pub delete_signal_requested_id: Option<String>,
    /// Events buffered by this session.
    pub new_buffered_events: Vec<HistoryEvent>,
    /// Whether stored buffered events were flushed into history.
    pub clear_buffered_events: bool,
    /// Staged successor run.
    pub continue_as_new: Option<ContinueAsNewBundle>,
}

/// Event-sourced in-memory state machine for one workflow run.
pub struct MutableStateBuilder {
    /// Core execution row. Handlers read it freely; mutation goes through
    /// the event builders.
    pub execution_info: ExecutionInfo,
    /// Multi-cluster replication bookkeeping, when the domain is global.
    pub replication_state: Option<ReplicationState>,

    activity_infos: HashMap<i64, ActivityInfo>,
    activity_ids: HashMap<String, i64>,
    timer_infos: HashMap<String, TimerInfo>,
    child_infos: HashMap<i64, ChildExecutionInfo>,
    cancel_infos: HashMap<i64, RequestCancelInfo>,
    signal_infos: HashMap<i64, SignalInfo>,
    signal_requested_ids: HashSet<String>,
    buffered_events: Vec<HistoryEvent>,

    clock: Arc<dyn Clock>,

    // Session deltas since load.
    new_events: Vec<HistoryEvent>,
    updated_activities: HashSet<i64>,
    deleted_activities: HashSet<i64>,
    updated_timers: HashSet<String>,
    deleted_timers: HashSet<String>,
    updated_children: HashSet<i64>,
    deleted_child: Option<i64>,
    updated_cancels: HashSet<i64>,
    deleted_cancel: Option<i64>,
    updated_signals: HashSet<i64>,
    deleted_signal: Option<i64>,
    updated_signal_requested: HashSet<String>,
    deleted_signal_requested: Option<String>,
    new_buffered: Vec<HistoryEvent>,
    clear_buffered: bool,
    continue_as_new: Option<ContinueAsNewBundle>,
}

impl MutableStateBuilder {
    /// Fresh builder for a run that does not exist yet.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            execution_info: ExecutionInfo::default(),
            replication_state: None,
            activity_infos: HashMap::new(),
            activity_ids: HashMap::new(),
            timer_infos: HashMap::new(),
            child_infos: HashMap::new(),
            cancel_infos: HashMap::new(),
            signal_infos: HashMap::new(),
            signal_requested_ids: HashSet::new(),
            buffered_events: Vec::new(),
            clock,
            new_events: Vec::new(),
            updated_activities: HashSet::new(),
            deleted_activities: HashSet::new(),
            updated_timers: HashSet::new(),
            deleted_timers: HashSet::new(),
            updated_children: HashSet::new(),
            deleted_child: None,
            updated_cancels: HashSet::new(),
            deleted_cancel: None,
            updated_signals: HashSet::new(),
            deleted_signal: None,
            updated_signal_requested: HashSet::new(),
            deleted_signal_requested: None,
            new_buffered: Vec::new(),
            clear_buffered: false,
            continue_as_new: None,
        }
    }

    /// Builder over a snapshot loaded from the execution store.
    pub fn load(record: WorkflowMutableStateRecord, clock: Arc<dyn Clock>) -> Self {
        let mut builder = Self::new(clock);
        builder.activity_ids = record
            .activity_infos
            .values()
            .map(|info| (info.activity_id.clone(), info.schedule_id))
            .collect();
        builder.execution_info = record.execution_info;
        builder.replication_state = record.replication_state;
        builder.activity_infos = record.activity_infos;
        builder.timer_infos = record.timer_infos;
        builder.child_infos = record.child_infos;
        builder.cancel_infos = record.cancel_infos;
        builder.signal_infos = record.signal_infos;
        builder.signal_requested_ids = record.signal_requested_ids;
        builder.buffered_events = record.buffered_events;
        builder
    }

    /// Full-state snapshot in store shape, for run creation.
    pub fn snapshot_record(&self) -> WorkflowMutableStateRecord {
        WorkflowMutableStateRecord {
            execution_info: self.execution_info.clone(),
            activity_infos: self.activity_infos.clone(),
            timer_infos: self.timer_infos.clone(),
            child_infos: self.child_infos.clone(),
            cancel_infos: self.cancel_infos.clone(),
            signal_infos: self.signal_infos.clone(),
            signal_requested_ids: self.signal_requested_ids.clone(),
            buffered_events: self.buffered_events.clone(),
            replication_state: self.replication_state,
        }
    }

    /// Whether the run has not reached a terminal event.
    pub fn is_running(&self) -> bool {
        self.execution_info.is_running()
    }

    /// Next event ID to be assigned.
    pub fn next_event_id(&self) -> i64 {
        self.execution_info.next_event_id
    }

    /// First event ID of the most recently appended batch.
    pub fn last_first_event_id(&self) -> i64 {
        self.execution_info.last_first_event_id
    }

    /// Events this session built so far.
    pub fn new_events(&self) -> &[HistoryEvent] {
        &self.new_events
    }

    /// Whether any buffered events exist (stored or from this session).
    pub fn has_buffered_events(&self) -> bool {
        !self.buffered_events.is_empty() || !self.new_buffered.is_empty()
    }

    fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    fn new_event(&mut self, attributes: EventAttributes) -> i64 {
        let event_id = self.execution_info.next_event_id;
        self.execution_info.next_event_id += 1;
        self.new_events.push(HistoryEvent {
            event_id,
            timestamp: self.now(),
            attributes,
        });
        event_id
    }

    /// Whether externally sourced events must be buffered instead of going
    /// straight to history: true while a decision task is in flight.
    fn should_buffer(&self) -> bool {
        self.execution_info.decision_started_id != EMPTY_EVENT_ID
    }

    /// Add an externally sourced event, buffering it while a decision is in
    /// flight. Returns the assigned event ID, or [`BUFFERED_EVENT_ID`] for
    /// events parked in the buffer.
    fn new_external_event(&mut self, attributes: EventAttributes) -> i64 {
        if self.should_buffer() {
            self.new_buffered.push(HistoryEvent {
                event_id: BUFFERED_EVENT_ID,
                timestamp: self.now(),
                attributes,
            });
            BUFFERED_EVENT_ID
        } else {
            self.new_event(attributes)
        }
    }

    /// Assign IDs to all buffered events and move them into history, in
    /// arrival order. Runs when a decision completes.
    fn flush_buffered_events(&mut self) {
        if self.buffered_events.is_empty() && self.new_buffered.is_empty() {
            return;
        }
        self.clear_buffered = true;
        let drained: Vec<HistoryEvent> = self
            .buffered_events
            .drain(..)
            .chain(self.new_buffered.drain(..))
            .collect();
        for mut event in drained {
            event.event_id = self.execution_info.next_event_id;
            self.execution_info.next_event_id += 1;
            self.new_events.push(event);
        }
    }

    fn mark_closed(&mut self, close_status: CloseStatus) {
        self.execution_info.state = WorkflowState::Completed;
        self.execution_info.close_status = close_status;
    }

    // ------------------------------------------------------------------
    // Workflow lifecycle events
    // ------------------------------------------------------------------

    /// First event of a run. Fails when the builder already holds state.
    pub fn add_workflow_execution_started_event(
        &mut self,
        workflow: &WorkflowRun,
        request: &StartWorkflowRequest,
        continued_from_run_id: Option<String>,
    ) -> Option<i64> {
        if self.execution_info.next_event_id != FIRST_EVENT_ID {
            return None;
        }
        let now = self.clock.now();
        let info = &mut self.execution_info;
        info.domain_id = workflow.domain_id.clone();
        info.workflow_id = workflow.workflow_id.clone();
        info.run_id = workflow.run_id.clone();
        info.task_list = request.task_list.clone();
        info.workflow_type = request.workflow_type.clone();
        info.workflow_timeout_secs = request.execution_timeout_secs;
        info.decision_timeout_secs = request.decision_timeout_secs;
        info.create_request_id = request.request_id.clone();
        info.start_timestamp = now;
        info.last_updated = now;
        if let Some(parent) = &request.parent {
            info.parent_domain_id = Some(parent.domain_id.clone());
            info.parent_workflow_id = Some(parent.workflow_id.clone());
            info.parent_run_id = Some(parent.run_id.clone());
            info.initiated_id = parent.initiated_id;
        }

        Some(self.new_event(EventAttributes::WorkflowExecutionStarted(
            WorkflowExecutionStartedAttributes {
                workflow_type: request.workflow_type.clone(),
                task_list: request.task_list.clone(),
                input: request.input.clone(),
                execution_timeout_secs: request.execution_timeout_secs,
                decision_timeout_secs: request.decision_timeout_secs,
                identity: request.identity.clone(),
                parent_workflow_id: request.parent.as_ref().map(|p| p.workflow_id.clone()),
                parent_run_id: request.parent.as_ref().map(|p| p.run_id.clone()),
                continued_from_run_id,
            },
        )))
    }

    /// Terminal event: completed by decision.
    pub fn add_completed_workflow_event(
        &mut self,
        decision_completed_id: i64,
        result: Option<Vec<u8>>,
    ) -> Option<i64> {
        if !self.is_running() {
            return None;
        }
        self.mark_closed(CloseStatus::Completed);
        Some(self.new_event(EventAttributes::WorkflowExecutionCompleted(
            WorkflowExecutionCompletedAttributes {
                decision_task_completed_event_id: decision_completed_id,
                result,
            },
        )))
    }

    /// Terminal event: failed by decision.
    pub fn add_fail_workflow_event(
        &mut self,
        decision_completed_id: i64,
        reason: String,
        details: Option<Vec<u8>>,
    ) -> Option<i64> {
        if !self.is_running() {
            return None;
        }
        self.mark_closed(CloseStatus::Failed);
        Some(self.new_event(EventAttributes::WorkflowExecutionFailed(
            WorkflowExecutionFailedAttributes {
                decision_task_completed_event_id: decision_completed_id,
                reason,
                details,
            },
        )))
    }

    /// Terminal event: canceled by decision after a cancellation request.
    pub fn add_workflow_canceled_event(
        &mut self,
        decision_completed_id: i64,
        details: Option<Vec<u8>>,
    ) -> Option<i64> {
        if !self.is_running() {
            return None;
        }
        self.mark_closed(CloseStatus::Canceled);
        Some(self.new_event(EventAttributes::WorkflowExecutionCanceled(
            WorkflowExecutionCanceledAttributes {
                decision_task_completed_event_id: decision_completed_id,
                details,
            },
        )))
    }

    /// Terminal event: terminated without consulting a worker. Bypasses
    /// buffering.
    pub fn add_workflow_terminated_event(
        &mut self,
        reason: String,
        details: Option<Vec<u8>>,
        identity: String,
    ) -> Option<i64> {
        if !self.is_running() {
            return None;
        }
        self.mark_closed(CloseStatus::Terminated);
        Some(self.new_event(EventAttributes::WorkflowExecutionTerminated(
            WorkflowExecutionTerminatedAttributes {
                reason,
                details,
                identity,
            },
        )))
    }

    /// Terminal event: the execution timeout fired.
    pub fn add_workflow_timed_out_event(&mut self) -> Option<i64> {
        if !self.is_running() {
            return None;
        }
        self.mark_closed(CloseStatus::TimedOut);
        Some(self.new_event(EventAttributes::WorkflowExecutionTimedOut(
            WorkflowExecutionTimedOutAttributes {
                timeout_type: TimeoutType::StartToClose,
            },
        )))
    }

    /// A signal was delivered.
    pub fn add_workflow_signaled_event(
        &mut self,
        signal_name: String,
        input: Option<Vec<u8>>,
        identity: String,
    ) -> Option<()> {
        if !self.is_running() {
            return None;
        }
        self.new_external_event(EventAttributes::WorkflowExecutionSignaled(
            WorkflowExecutionSignaledAttributes {
                signal_name,
                input,
                identity,
            },
        ));
        Some(())
    }

    /// Cancellation of the run was requested.
    pub fn add_workflow_cancel_requested_event(
        &mut self,
        cause: String,
        identity: String,
        request_id: Option<String>,
        external_workflow_id: Option<String>,
        external_run_id: Option<String>,
    ) -> Option<()> {
        if !self.is_running() {
            return None;
        }
        self.execution_info.cancel_requested = true;
        self.execution_info.cancel_request_id = request_id;
        self.new_external_event(EventAttributes::WorkflowExecutionCancelRequested(
            WorkflowExecutionCancelRequestedAttributes {
                cause,
                identity,
                external_workflow_id,
                external_run_id,
            },
        ));
        Some(())
    }

    /// Whether cancellation was already requested, and with which request ID.
    pub fn cancel_requested(&self) -> (bool, Option<&str>) {
        (
            self.execution_info.cancel_requested,
            self.execution_info.cancel_request_id.as_deref(),
        )
    }

    // ------------------------------------------------------------------
    // Decision task events
    // ------------------------------------------------------------------

    /// The pending decision, when `schedule_id` matches it.
    pub fn get_pending_decision(&self, schedule_id: i64) -> Option<DecisionInfo> {
        let info = &self.execution_info;
        if !info.has_pending_decision() || info.decision_schedule_id != schedule_id {
            return None;
        }
        Some(DecisionInfo {
            schedule_id: info.decision_schedule_id,
            started_id: info.decision_started_id,
            request_id: info.decision_request_id.clone(),
            attempt: info.decision_attempt,
            timeout_secs: info.decision_timeout_secs,
        })
    }

    /// Whether a decision task is scheduled or started.
    pub fn has_pending_decision(&self) -> bool {
        self.execution_info.has_pending_decision()
    }

    /// Whether sticky execution is enabled for the run.
    pub fn is_sticky_enabled(&self) -> bool {
        !self.execution_info.sticky_task_list.is_empty()
    }

    /// Task list the next decision should go to: sticky when enabled.
    pub fn decision_task_list(&self) -> String {
        if self.is_sticky_enabled() {
            self.execution_info.sticky_task_list.clone()
        } else {
            self.execution_info.task_list.clone()
        }
    }

    /// Schedule a decision task. `None` when one is already pending or the
    /// run is closed.
    ///
    /// For retried decisions (attempt > 0) the scheduled event is transient:
    /// it is not appended to history until the decision completes, and the
    /// schedule ID is the current next event ID.
    pub fn add_decision_task_scheduled_event(&mut self) -> Option<DecisionInfo> {
        if !self.is_running() || self.has_pending_decision() {
            return None;
        }
        let attempt = self.execution_info.decision_attempt;
        let task_list = self.decision_task_list();
        let timeout_secs = self.execution_info.decision_timeout_secs;
        let schedule_id = if attempt == 0 {
            self.new_event(EventAttributes::DecisionTaskScheduled(
                DecisionTaskScheduledAttributes {
                    task_list,
                    start_to_close_timeout_secs: timeout_secs,
                    attempt,
                },
            ))
        } else {
            self.execution_info.next_event_id
        };
        self.execution_info.decision_schedule_id = schedule_id;
        self.execution_info.decision_started_id = EMPTY_EVENT_ID;
        self.execution_info.decision_request_id.clear();
        Some(DecisionInfo {
            schedule_id,
            started_id: EMPTY_EVENT_ID,
            request_id: String::new(),
            attempt,
            timeout_secs,
        })
    }

    /// Start the pending decision. `None` when it is not pending or already
    /// started. Transient for retried decisions.
    pub fn add_decision_task_started_event(
        &mut self,
        schedule_id: i64,
        request_id: &str,
        identity: &str,
    ) -> Option<DecisionInfo> {
        let decision = self.get_pending_decision(schedule_id)?;
        if decision.started_id != EMPTY_EVENT_ID {
            return None;
        }
        let started_id = if decision.attempt == 0 {
            self.new_event(EventAttributes::DecisionTaskStarted(
                DecisionTaskStartedAttributes {
                    scheduled_event_id: schedule_id,
                    identity: identity.to_string(),
                    request_id: request_id.to_string(),
                },
            ))
        } else {
            // Transient decision: the started event exists only in mutable
            // state until the decision completes.
            schedule_id + 1
        };
        self.execution_info.decision_started_id = started_id;
        self.execution_info.decision_request_id = request_id.to_string();
        Some(DecisionInfo {
            started_id,
            request_id: request_id.to_string(),
            ..decision
        })
    }

    /// Scheduled/started events of a transient decision, for the
    /// RecordDecisionTaskStarted response. Not appended to history.
    pub fn create_transient_decision_events(
        &self,
        decision: &DecisionInfo,
        identity: &str,
    ) -> (HistoryEvent, HistoryEvent) {
        let now = self.now();
        let scheduled = HistoryEvent {
            event_id: decision.schedule_id,
            timestamp: now,
            attributes: EventAttributes::DecisionTaskScheduled(DecisionTaskScheduledAttributes {
                task_list: self.decision_task_list(),
                start_to_close_timeout_secs: decision.timeout_secs,
                attempt: decision.attempt,
            }),
        };
        let started = HistoryEvent {
            event_id: decision.schedule_id + 1,
            timestamp: now,
            attributes: EventAttributes::DecisionTaskStarted(DecisionTaskStartedAttributes {
                scheduled_event_id: decision.schedule_id,
                identity: identity.to_string(),
                request_id: decision.request_id.clone(),
            }),
        };
        (scheduled, started)
    }

    /// Complete the started decision. Materializes transient events for
    /// retried decisions, then flushes buffered events into history.
    /// Returns the completed-event ID.
    pub fn add_decision_task_completed_event(
        &mut self,
        schedule_id: i64,
        started_id: i64,
        identity: &str,
    ) -> Option<i64> {
        let decision = self.get_pending_decision(schedule_id)?;
        if decision.started_id != started_id {
            return None;
        }
        let (schedule_id, started_id) = if decision.attempt > 0 {
            // The retried decision finally made progress: its scheduled and
            // started events enter history now, with fresh IDs.
            let real_schedule_id = self.new_event(EventAttributes::DecisionTaskScheduled(
                DecisionTaskScheduledAttributes {
                    task_list: self.decision_task_list(),
                    start_to_close_timeout_secs: decision.timeout_secs,
                    attempt: decision.attempt,
                },
            ));
            let real_started_id = self.new_event(EventAttributes::DecisionTaskStarted(
                DecisionTaskStartedAttributes {
                    scheduled_event_id: real_schedule_id,
                    identity: identity.to_string(),
                    request_id: decision.request_id.clone(),
                },
            ));
            (real_schedule_id, real_started_id)
        } else {
            (schedule_id, started_id)
        };

        let completed_id = self.new_event(EventAttributes::DecisionTaskCompleted(
            DecisionTaskCompletedAttributes {
                scheduled_event_id: schedule_id,
                started_event_id: started_id,
                identity: identity.to_string(),
            },
        ));
        let info = &mut self.execution_info;
        info.decision_schedule_id = EMPTY_EVENT_ID;
        info.decision_started_id = EMPTY_EVENT_ID;
        info.decision_request_id.clear();
        info.decision_attempt = 0;
        info.last_processed_event = started_id;

        self.flush_buffered_events();
        Some(completed_id)
    }

    /// Fail the started decision and bump the retry attempt. Only first
    /// attempts leave a DecisionTaskFailed event in history.
    pub fn add_decision_task_failed_event(
        &mut self,
        schedule_id: i64,
        started_id: i64,
        cause: DecisionTaskFailedCause,
        details: Option<Vec<u8>>,
        identity: &str,
    ) -> Option<()> {
        let decision = self.get_pending_decision(schedule_id)?;
        if decision.started_id != started_id {
            return None;
        }
        if decision.attempt == 0 {
            self.new_event(EventAttributes::DecisionTaskFailed(
                DecisionTaskFailedAttributes {
                    scheduled_event_id: schedule_id,
                    started_event_id: started_id,
                    cause,
                    details,
                    identity: identity.to_string(),
                },
            ));
        }
        let info = &mut self.execution_info;
        info.decision_schedule_id = EMPTY_EVENT_ID;
        info.decision_started_id = EMPTY_EVENT_ID;
        info.decision_request_id.clear();
        info.decision_attempt += 1;
        Some(())
    }

    /// Time the pending decision out and bump the retry attempt.
    pub fn add_decision_task_timed_out_event(
        &mut self,
        schedule_id: i64,
        timeout_type: TimeoutType,
    ) -> Option<()> {
        let decision = self.get_pending_decision(schedule_id)?;
        if decision.attempt == 0 {
            self.new_event(EventAttributes::DecisionTaskTimedOut(
                DecisionTaskTimedOutAttributes {
                    scheduled_event_id: schedule_id,
                    started_event_id: decision.started_id,
                    timeout_type,
                },
            ));
        }
        let info = &mut self.execution_info;
        info.decision_schedule_id = EMPTY_EVENT_ID;
        info.decision_started_id = EMPTY_EVENT_ID;
        info.decision_request_id.clear();
        info.decision_attempt += 1;
        Some(())
    }

    /// Apply sticky attributes from a completing decision.
    pub fn set_sticky(&mut self, task_list: String, schedule_to_start_timeout_secs: i32) {
        self.execution_info.sticky_task_list = task_list;
        self.execution_info.sticky_schedule_to_start_timeout_secs = schedule_to_start_timeout_secs;
    }

    /// Clear client affinity (sticky task list and its timeout).
    pub fn clear_sticky(&mut self) {
        self.execution_info.sticky_task_list.clear();
        self.execution_info.sticky_schedule_to_start_timeout_secs = 0;
    }

    // ------------------------------------------------------------------
    // Activity task events
    // ------------------------------------------------------------------

    /// Pending activity by scheduled-event ID.
    pub fn get_activity_info(&self, schedule_id: i64) -> Option<&ActivityInfo> {
        self.activity_infos.get(&schedule_id)
    }

    /// Scheduled-event ID of a pending activity, by activity ID.
    pub fn get_schedule_id_by_activity_id(&self, activity_id: &str) -> Option<i64> {
        self.activity_ids.get(activity_id).copied()
    }

    /// Pending activities, for describe snapshots.
    pub fn pending_activities(&self) -> impl Iterator<Item = &ActivityInfo> {
        self.activity_infos.values()
    }

    /// Schedule an activity. `None` when the activity ID is already pending.
    pub fn add_activity_task_scheduled_event(
        &mut self,
        decision_completed_id: i64,
        attributes: &ScheduleActivityTaskAttributes,
    ) -> Option<ActivityInfo> {
        if !self.is_running() || self.activity_ids.contains_key(&attributes.activity_id) {
            return None;
        }
        let schedule_id = self.new_event(EventAttributes::ActivityTaskScheduled(
            ActivityTaskScheduledAttributes {
                activity_id: attributes.activity_id.clone(),
                activity_type: attributes.activity_type.clone(),
                task_list: attributes.task_list.clone(),
                input: attributes.input.clone(),
                schedule_to_close_timeout_secs: attributes.schedule_to_close_timeout_secs,
                schedule_to_start_timeout_secs: attributes.schedule_to_start_timeout_secs,
                start_to_close_timeout_secs: attributes.start_to_close_timeout_secs,
                heartbeat_timeout_secs: attributes.heartbeat_timeout_secs,
                decision_task_completed_event_id: decision_completed_id,
            },
        ));
        let scheduled_event = self
            .new_events
            .last()
            .expect("event was just appended")
            .clone();
        let info = ActivityInfo {
            schedule_id,
            scheduled_event,
            started_id: EMPTY_EVENT_ID,
            started_event: None,
            activity_id: attributes.activity_id.clone(),
            request_id: String::new(),
            schedule_to_close_timeout_secs: attributes.schedule_to_close_timeout_secs,
            schedule_to_start_timeout_secs: attributes.schedule_to_start_timeout_secs,
            start_to_close_timeout_secs: attributes.start_to_close_timeout_secs,
            heartbeat_timeout_secs: attributes.heartbeat_timeout_secs,
            cancel_requested: false,
            cancel_request_event_id: EMPTY_EVENT_ID,
            details: None,
            last_heartbeat: None,
        };
        self.activity_infos.insert(schedule_id, info.clone());
        self.activity_ids
            .insert(attributes.activity_id.clone(), schedule_id);
        self.updated_activities.insert(schedule_id);
        Some(info)
    }

    /// Start a scheduled activity. `None` when unknown or already started.
    pub fn add_activity_task_started_event(
        &mut self,
        schedule_id: i64,
        request_id: &str,
        identity: &str,
    ) -> Option<HistoryEvent> {
        let info = self.activity_infos.get(&schedule_id)?;
        if info.started_id != EMPTY_EVENT_ID {
            return None;
        }
        let started_id = self.new_event(EventAttributes::ActivityTaskStarted(
            ActivityTaskStartedAttributes {
                scheduled_event_id: schedule_id,
                identity: identity.to_string(),
                request_id: request_id.to_string(),
            },
        ));
        let started_event = self
            .new_events
            .last()
            .expect("event was just appended")
            .clone();
        let info = self
            .activity_infos
            .get_mut(&schedule_id)
            .expect("checked above");
        info.started_id = started_id;
        info.started_event = Some(started_event.clone());
        info.request_id = request_id.to_string();
        self.updated_activities.insert(schedule_id);
        Some(started_event)
    }

    fn remove_activity(&mut self, schedule_id: i64) {
        if let Some(info) = self.activity_infos.remove(&schedule_id) {
            self.activity_ids.remove(&info.activity_id);
        }
        self.updated_activities.remove(&schedule_id);
        self.deleted_activities.insert(schedule_id);
    }

    /// Record a started activity as completed.
    pub fn add_activity_task_completed_event(
        &mut self,
        schedule_id: i64,
        started_id: i64,
        result: Option<Vec<u8>>,
        identity: &str,
    ) -> Option<()> {
        let info = self.activity_infos.get(&schedule_id)?;
        if info.started_id != started_id {
            return None;
        }
        self.new_external_event(EventAttributes::ActivityTaskCompleted(
            ActivityTaskCompletedAttributes {
                scheduled_event_id: schedule_id,
                started_event_id: started_id,
                result,
                identity: identity.to_string(),
            },
        ));
        self.remove_activity(schedule_id);
        Some(())
    }

    /// Record a started activity as failed.
    pub fn add_activity_task_failed_event(
        &mut self,
        schedule_id: i64,
        started_id: i64,
        reason: String,
        details: Option<Vec<u8>>,
        identity: &str,
    ) -> Option<()> {
        let info = self.activity_infos.get(&schedule_id)?;
        if info.started_id != started_id {
            return None;
        }
        self.new_external_event(EventAttributes::ActivityTaskFailed(
            ActivityTaskFailedAttributes {
                scheduled_event_id: schedule_id,
                started_event_id: started_id,
                reason,
                details,
                identity: identity.to_string(),
            },
        ));
        self.remove_activity(schedule_id);
        Some(())
    }

    /// Record an activity as canceled.
    pub fn add_activity_task_canceled_event(
        &mut self,
        schedule_id: i64,
        started_id: i64,
        latest_cancel_requested_event_id: i64,
        details: Option<Vec<u8>>,
        identity: &str,
    ) -> Option<()> {
        if !self.activity_infos.contains_key(&schedule_id) {
            return None;
        }
        self.new_external_event(EventAttributes::ActivityTaskCanceled(
            ActivityTaskCanceledAttributes {
                scheduled_event_id: schedule_id,
                started_event_id: started_id,
                latest_cancel_requested_event_id,
                details,
                identity: identity.to_string(),
            },
        ));
        self.remove_activity(schedule_id);
        Some(())
    }

    /// Record an activity timeout.
    pub fn add_activity_task_timed_out_event(
        &mut self,
        schedule_id: i64,
        timeout_type: TimeoutType,
    ) -> Option<()> {
        let info = self.activity_infos.get(&schedule_id)?;
        let started_id = info.started_id;
        self.new_external_event(EventAttributes::ActivityTaskTimedOut(
            ActivityTaskTimedOutAttributes {
                scheduled_event_id: schedule_id,
                started_event_id: started_id,
                timeout_type,
            },
        ));
        self.remove_activity(schedule_id);
        Some(())
    }

    /// Request cancellation of a pending activity by activity ID. Returns
    /// the cancel-requested event ID and the activity; `None` when the
    /// activity ID is unknown.
    pub fn add_activity_cancel_requested_event(
        &mut self,
        decision_completed_id: i64,
        activity_id: &str,
    ) -> Option<(i64, ActivityInfo)> {
        let schedule_id = self.get_schedule_id_by_activity_id(activity_id)?;
        let event_id = self.new_event(EventAttributes::ActivityTaskCancelRequested(
            ActivityTaskCancelRequestedAttributes {
                decision_task_completed_event_id: decision_completed_id,
                activity_id: activity_id.to_string(),
            },
        ));
        let info = self
            .activity_infos
            .get_mut(&schedule_id)
            .expect("indexed above");
        info.cancel_requested = true;
        info.cancel_request_event_id = event_id;
        let info = info.clone();
        self.updated_activities.insert(schedule_id);
        Some((event_id, info))
    }

    /// Record that a RequestCancelActivityTask command named an unknown
    /// activity.
    pub fn add_request_cancel_activity_task_failed_event(
        &mut self,
        decision_completed_id: i64,
        activity_id: &str,
        cause: &str,
    ) -> i64 {
        self.new_event(EventAttributes::RequestCancelActivityTaskFailed(
            RequestCancelActivityTaskFailedAttributes {
                decision_task_completed_event_id: decision_completed_id,
                activity_id: activity_id.to_string(),
                cause: cause.to_string(),
            },
        ))
    }

    /// Record heartbeat progress. No history event.
    pub fn update_activity_progress(&mut self, schedule_id: i64, details: Option<Vec<u8>>) {
        let now = self.now();
        if let Some(info) = self.activity_infos.get_mut(&schedule_id) {
            info.details = details;
            info.last_heartbeat = Some(now);
            self.updated_activities.insert(schedule_id);
        }
    }

    // ------------------------------------------------------------------
    // User timer events
    // ------------------------------------------------------------------

    /// Pending timer by timer ID.
    pub fn get_timer_info(&self, timer_id: &str) -> Option<&TimerInfo> {
        self.timer_infos.get(timer_id)
    }

    /// Start a user timer. `None` when the timer ID is already pending.
    pub fn add_timer_started_event(
        &mut self,
        decision_completed_id: i64,
        timer_id: &str,
        start_to_fire_timeout_secs: i64,
    ) -> Option<TimerInfo> {
        if !self.is_running() || self.timer_infos.contains_key(timer_id) {
            return None;
        }
        let started_event_id = self.new_event(EventAttributes::TimerStarted(
            TimerStartedAttributes {
                timer_id: timer_id.to_string(),
                start_to_fire_timeout_secs,
                decision_task_completed_event_id: decision_completed_id,
            },
        ));
        let info = TimerInfo {
            timer_id: timer_id.to_string(),
            started_event_id,
            expiry: self.now() + Duration::seconds(start_to_fire_timeout_secs),
        };
        self.timer_infos.insert(timer_id.to_string(), info.clone());
        self.updated_timers.insert(timer_id.to_string());
        Some(info)
    }

    /// Fire a pending timer.
    pub fn add_timer_fired_event(&mut self, timer_id: &str) -> Option<()> {
        let info = self.timer_infos.get(timer_id)?;
        let started_event_id = info.started_event_id;
        self.new_external_event(EventAttributes::TimerFired(TimerFiredAttributes {
            timer_id: timer_id.to_string(),
            started_event_id,
        }));
        self.timer_infos.remove(timer_id);
        self.updated_timers.remove(timer_id);
        self.deleted_timers.insert(timer_id.to_string());
        Some(())
    }

    /// Cancel a pending timer. `None` when the timer ID is unknown.
    pub fn add_timer_canceled_event(
        &mut self,
        decision_completed_id: i64,
        timer_id: &str,
        identity: &str,
    ) -> Option<()> {
        let info = self.timer_infos.get(timer_id)?;
        let started_event_id = info.started_event_id;
        self.new_event(EventAttributes::TimerCanceled(TimerCanceledAttributes {
            timer_id: timer_id.to_string(),
            started_event_id,
            decision_task_completed_event_id: decision_completed_id,
            identity: identity.to_string(),
        }));
        self.timer_infos.remove(timer_id);
        self.updated_timers.remove(timer_id);
        self.deleted_timers.insert(timer_id.to_string());
        Some(())
    }

    /// Record that a CancelTimer command named an unknown timer.
    pub fn add_cancel_timer_failed_event(
        &mut self,
        decision_completed_id: i64,
        timer_id: &str,
        cause: &str,
        identity: &str,
    ) -> i64 {
        self.new_event(EventAttributes::CancelTimerFailed(
            CancelTimerFailedAttributes {
                timer_id: timer_id.to_string(),
                cause: cause.to_string(),
                decision_task_completed_event_id: decision_completed_id,
                identity: identity.to_string(),
            },
        ))
    }

    /// Record a marker.
    pub fn add_marker_recorded_event(
        &mut self,
        decision_completed_id: i64,
        marker_name: &str,
        details: Option<Vec<u8>>,
    ) -> i64 {
        self.new_event(EventAttributes::MarkerRecorded(MarkerRecordedAttributes {
            marker_name: marker_name.to_string(),
            details,
            decision_task_completed_event_id: decision_completed_id,
        }))
    }

    // ------------------------------------------------------------------
    // Signal-request deduplication
    // ------------------------------------------------------------------

    /// Whether a signal request ID was already accepted.
    pub fn is_signal_requested(&self, request_id: &str) -> bool {
        self.signal_requested_ids.contains(request_id)
    }

    /// Remember an accepted signal request ID.
    pub fn add_signal_requested(&mut self, request_id: &str) {
        self.signal_requested_ids.insert(request_id.to_string());
        self.updated_signal_requested.insert(request_id.to_string());
    }

    /// Drop a signal request ID from the dedup set.
    pub fn delete_signal_requested(&mut self, request_id: &str) {
        self.signal_requested_ids.remove(request_id);
        self.updated_signal_requested.remove(request_id);
        self.deleted_signal_requested = Some(request_id.to_string());
    }

    // ------------------------------------------------------------------
    // External workflow operations
    // ------------------------------------------------------------------

    /// Pending external-cancel by initiated-event ID.
    pub fn get_request_cancel_info(&self, initiated_id: i64) -> Option<&RequestCancelInfo> {
        self.cancel_infos.get(&initiated_id)
    }

    /// Initiate cancellation of an external workflow.
    pub fn add_request_cancel_external_initiated_event(
        &mut self,
        decision_completed_id: i64,
        cancel_request_id: &str,
        target_domain_id: &str,
        workflow_id: &str,
        run_id: Option<String>,
        child_workflow_only: bool,
    ) -> Option<i64> {
        if !self.is_running() {
            return None;
        }
        let initiated_id = self.new_event(
            EventAttributes::RequestCancelExternalWorkflowExecutionInitiated(
                RequestCancelExternalWorkflowExecutionInitiatedAttributes {
                    decision_task_completed_event_id: decision_completed_id,
                    domain_id: target_domain_id.to_string(),
                    workflow_id: workflow_id.to_string(),
                    run_id,
                    cancel_request_id: cancel_request_id.to_string(),
                    child_workflow_only,
                },
            ),
        );
        self.cancel_infos.insert(
            initiated_id,
            RequestCancelInfo {
                initiated_id,
                cancel_request_id: cancel_request_id.to_string(),
            },
        );
        self.updated_cancels.insert(initiated_id);
        Some(initiated_id)
    }

    /// The external workflow accepted the cancellation request.
    pub fn add_external_cancel_requested_event(
        &mut self,
        initiated_id: i64,
        target_domain_id: &str,
        workflow_id: &str,
        run_id: Option<String>,
    ) -> Option<()> {
        if !self.cancel_infos.contains_key(&initiated_id) {
            return None;
        }
        self.new_external_event(EventAttributes::ExternalWorkflowExecutionCancelRequested(
            ExternalWorkflowExecutionCancelRequestedAttributes {
                initiated_event_id: initiated_id,
                domain_id: target_domain_id.to_string(),
                workflow_id: workflow_id.to_string(),
                run_id,
            },
        ));
        self.cancel_infos.remove(&initiated_id);
        self.updated_cancels.remove(&initiated_id);
        self.deleted_cancel = Some(initiated_id);
        Some(())
    }

    /// The cancellation request could not be delivered.
    pub fn add_request_cancel_external_failed_event(
        &mut self,
        initiated_id: i64,
        target_domain_id: &str,
        workflow_id: &str,
        run_id: Option<String>,
        cause: CancelExternalFailedCause,
    ) -> Option<()> {
        if !self.cancel_infos.contains_key(&initiated_id) {
            return None;
        }
        self.new_external_event(
            EventAttributes::RequestCancelExternalWorkflowExecutionFailed(
                RequestCancelExternalWorkflowExecutionFailedAttributes {
                    initiated_event_id: initiated_id,
                    domain_id: target_domain_id.to_string(),
                    workflow_id: workflow_id.to_string(),
                    run_id,
                    cause,
                },
            ),
        );
        self.cancel_infos.remove(&initiated_id);
        self.updated_cancels.remove(&initiated_id);
        self.deleted_cancel = Some(initiated_id);
        Some(())
    }

    /// Pending external-signal by initiated-event ID.
    pub fn get_signal_info(&self, initiated_id: i64) -> Option<&SignalInfo> {
        self.signal_infos.get(&initiated_id)
    }

    /// Initiate a signal to an external workflow.
    #[allow(clippy::too_many_arguments)]
    pub fn add_signal_external_initiated_event(
        &mut self,
        decision_completed_id: i64,
        signal_request_id: &str,
        target_domain_id: &str,
        workflow_id: &str,
        run_id: Option<String>,
        signal_name: &str,
        input: Option<Vec<u8>>,
        child_workflow_only: bool,
    ) -> Option<i64> {
        if !self.is_running() {
            return None;
        }
        let initiated_id = self.new_event(
            EventAttributes::SignalExternalWorkflowExecutionInitiated(
                SignalExternalWorkflowExecutionInitiatedAttributes {
                    decision_task_completed_event_id: decision_completed_id,
                    domain_id: target_domain_id.to_string(),
                    workflow_id: workflow_id.to_string(),
                    run_id,
                    signal_name: signal_name.to_string(),
                    input: input.clone(),
                    signal_request_id: signal_request_id.to_string(),
                    child_workflow_only,
                },
            ),
        );
        self.signal_infos.insert(
            initiated_id,
            SignalInfo {
                initiated_id,
                signal_request_id: signal_request_id.to_string(),
                signal_name: signal_name.to_string(),
                input,
            },
        );
        self.updated_signals.insert(initiated_id);
        Some(initiated_id)
    }

    /// The external workflow accepted the signal.
    pub fn add_external_signaled_event(
        &mut self,
        initiated_id: i64,
        target_domain_id: &str,
        workflow_id: &str,
        run_id: Option<String>,
    ) -> Option<()> {
        if !self.signal_infos.contains_key(&initiated_id) {
            return None;
        }
        self.new_external_event(EventAttributes::ExternalWorkflowExecutionSignaled(
            ExternalWorkflowExecutionSignaledAttributes {
                initiated_event_id: initiated_id,
                domain_id: target_domain_id.to_string(),
                workflow_id: workflow_id.to_string(),
                run_id,
            },
        ));
        self.signal_infos.remove(&initiated_id);
        self.updated_signals.remove(&initiated_id);
        self.deleted_signal = Some(initiated_id);
        Some(())
    }

    /// The signal could not be delivered.
    pub fn add_signal_external_failed_event(
        &mut self,
        initiated_id: i64,
        target_domain_id: &str,
        workflow_id: &str,
        run_id: Option<String>,
        cause: SignalExternalFailedCause,
    ) -> Option<()> {
        if !self.signal_infos.contains_key(&initiated_id) {
            return None;
        }
        self.new_external_event(EventAttributes::SignalExternalWorkflowExecutionFailed(
            SignalExternalWorkflowExecutionFailedAttributes {
                initiated_event_id: initiated_id,
                domain_id: target_domain_id.to_string(),
                workflow_id: workflow_id.to_string(),
                run_id,
                cause,
            },
        ));
        self.signal_infos.remove(&initiated_id);
        self.updated_signals.remove(&initiated_id);
        self.deleted_signal = Some(initiated_id);
        Some(())
    }

    // ------------------------------------------------------------------
    // Child workflow events
    // ------------------------------------------------------------------

    /// Pending child execution by initiated-event ID.
    pub fn get_child_execution_info(&self, initiated_id: i64) -> Option<&ChildExecutionInfo> {
        self.child_infos.get(&initiated_id)
    }

    /// Initiate a child workflow start.
    #[allow(clippy::too_many_arguments)]
    pub fn add_start_child_initiated_event(
        &mut self,
        decision_completed_id: i64,
        create_request_id: &str,
        target_domain_id: &str,
        workflow_id: &str,
        workflow_type: &str,
        task_list: &str,
        input: Option<Vec<u8>>,
        execution_timeout_secs: i32,
        decision_timeout_secs: i32,
    ) -> Option<i64> {
        if !self.is_running() {
            return None;
        }
        let initiated_id = self.new_event(EventAttributes::StartChildWorkflowExecutionInitiated(
            StartChildWorkflowExecutionInitiatedAttributes {
                decision_task_completed_event_id: decision_completed_id,
                domain_id: target_domain_id.to_string(),
                workflow_id: workflow_id.to_string(),
                workflow_type: workflow_type.to_string(),
                task_list: task_list.to_string(),
                input,
                execution_timeout_secs,
                decision_timeout_secs,
                create_request_id: create_request_id.to_string(),
            },
        ));
        let initiated_event = self
            .new_events
            .last()
            .expect("event was just appended")
            .clone();
        self.child_infos.insert(
            initiated_id,
            ChildExecutionInfo {
                initiated_id,
                initiated_event,
                started_id: EMPTY_EVENT_ID,
                started_run_id: None,
                create_request_id: create_request_id.to_string(),
            },
        );
        self.updated_children.insert(initiated_id);
        Some(initiated_id)
    }

    /// The child run was created.
    pub fn add_child_started_event(
        &mut self,
        initiated_id: i64,
        target_domain_id: &str,
        workflow_id: &str,
        run_id: &str,
        workflow_type: &str,
    ) -> Option<()> {
        let info = self.child_infos.get(&initiated_id)?;
        if info.started_id != EMPTY_EVENT_ID {
            return None;
        }
        // Buffered started events still mark the child started: mutable
        // state moves immediately, only the event placement is deferred.
        let started_id = self.new_external_event(EventAttributes::ChildWorkflowExecutionStarted(
            ChildWorkflowExecutionStartedAttributes {
                initiated_event_id: initiated_id,
                domain_id: target_domain_id.to_string(),
                workflow_id: workflow_id.to_string(),
                run_id: run_id.to_string(),
                workflow_type: workflow_type.to_string(),
            },
        ));
        let info = self
            .child_infos
            .get_mut(&initiated_id)
            .expect("checked above");
        info.started_id = started_id;
        info.started_run_id = Some(run_id.to_string());
        self.updated_children.insert(initiated_id);
        Some(())
    }

    /// The child could not be started.
    pub fn add_start_child_failed_event(
        &mut self,
        initiated_id: i64,
        cause: ChildWorkflowFailedCause,
    ) -> Option<()> {
        let info = self.child_infos.get(&initiated_id)?;
        let (domain_id, workflow_id, workflow_type) = match &info.initiated_event.attributes {
            EventAttributes::StartChildWorkflowExecutionInitiated(attrs) => (
                attrs.domain_id.clone(),
                attrs.workflow_id.clone(),
                attrs.workflow_type.clone(),
            ),
            _ => return None,
        };
        self.new_external_event(EventAttributes::StartChildWorkflowExecutionFailed(
            StartChildWorkflowExecutionFailedAttributes {
                initiated_event_id: initiated_id,
                domain_id,
                workflow_id,
                workflow_type,
                cause,
            },
        ));
        self.child_infos.remove(&initiated_id);
        self.updated_children.remove(&initiated_id);
        self.deleted_child = Some(initiated_id);
        Some(())
    }

    /// Record a child run's terminal event in this (parent) run's history.
    /// `completion` must be one of the ChildWorkflowExecution… variants.
    pub fn add_child_completion_event(
        &mut self,
        initiated_id: i64,
        completion: EventAttributes,
    ) -> Option<()> {
        let info = self.child_infos.get(&initiated_id)?;
        if info.started_id == EMPTY_EVENT_ID {
            return None;
        }
        match completion {
            EventAttributes::ChildWorkflowExecutionCompleted(_)
            | EventAttributes::ChildWorkflowExecutionFailed(_)
            | EventAttributes::ChildWorkflowExecutionCanceled(_)
            | EventAttributes::ChildWorkflowExecutionTerminated(_)
            | EventAttributes::ChildWorkflowExecutionTimedOut(_) => {}
            _ => return None,
        }
        self.new_external_event(completion);
        self.child_infos.remove(&initiated_id);
        self.updated_children.remove(&initiated_id);
        self.deleted_child = Some(initiated_id);
        Some(())
    }

    // ------------------------------------------------------------------
    // Continue-as-new
    // ------------------------------------------------------------------

    /// Close this run with a ContinuedAsNew event and stage the successor
    /// run: started event, scheduled decision, decision transfer task and
    /// workflow-timeout timer. Task IDs are assigned at persist time.
    pub fn add_continue_as_new_event(
        &mut self,
        decision_completed_id: i64,
        new_run_id: &str,
        attributes: &ContinueAsNewWorkflowExecutionAttributes,
    ) -> Option<i64> {
        if !self.is_running() {
            return None;
        }
        let info = &self.execution_info;
        let workflow_type = attributes
            .workflow_type
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| info.workflow_type.clone());
        let task_list = attributes
            .task_list
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| info.task_list.clone());
        let execution_timeout_secs = if attributes.execution_timeout_secs > 0 {
            attributes.execution_timeout_secs
        } else {
            info.workflow_timeout_secs
        };
        let decision_timeout_secs = if attributes.decision_timeout_secs > 0 {
            attributes.decision_timeout_secs
        } else {
            info.decision_timeout_secs
        };
        let domain_id = info.domain_id.clone();
        let workflow_id = info.workflow_id.clone();
        let current_run_id = info.run_id.clone();

        let event_id = self.new_event(EventAttributes::WorkflowExecutionContinuedAsNew(
            WorkflowExecutionContinuedAsNewAttributes {
                decision_task_completed_event_id: decision_completed_id,
                new_run_id: new_run_id.to_string(),
                workflow_type: workflow_type.clone(),
                task_list: task_list.clone(),
                input: attributes.input.clone(),
                execution_timeout_secs,
                decision_timeout_secs,
            },
        ));
        self.mark_closed(CloseStatus::Completed);

        let new_workflow = WorkflowRun::new(&domain_id, &workflow_id, new_run_id);
        let start_request = StartWorkflowRequest {
            domain_id: domain_id.clone(),
            workflow_id: workflow_id.clone(),
            workflow_type,
            task_list: task_list.clone(),
            input: attributes.input.clone(),
            execution_timeout_secs,
            decision_timeout_secs,
            identity: String::new(),
            request_id: uuid::Uuid::new_v4().to_string(),
            reuse_policy: chronik_types::WorkflowIdReusePolicy::AllowDuplicate,
            parent: None,
        };

        let mut new_builder = Box::new(MutableStateBuilder::new(self.clock.clone()));
        new_builder.replication_state = self.replication_state;
        new_builder.add_workflow_execution_started_event(
            &new_workflow,
            &start_request,
            Some(current_run_id),
        )?;
        let decision = new_builder.add_decision_task_scheduled_event()?;

        let transfer_tasks = vec![TransferTask {
            task_id: 0,
            workflow: new_workflow.clone(),
            version: 0,
            kind: TransferTaskKind::DecisionTask {
                task_list,
                schedule_id: decision.schedule_id,
            },
        }];
        let timer_tasks = vec![TimerTask {
            task_id: 0,
            workflow: new_workflow,
            visibility_timestamp: self.now() + Duration::seconds(execution_timeout_secs as i64),
            version: 0,
            kind: TimerTaskKind::WorkflowTimeout,
        }];

        self.continue_as_new = Some(ContinueAsNewBundle {
            builder: new_builder,
            transfer_tasks,
            timer_tasks,
        });
        Some(event_id)
    }

    // ------------------------------------------------------------------
    // Replication
    // ------------------------------------------------------------------

    /// Initialize replication state at run creation for global domains.
    pub fn init_replication_state(&mut self, failover_version: i64, last_write_event_id: i64) {
        self.replication_state = Some(ReplicationState {
            current_version: failover_version,
            start_version: failover_version,
            last_write_version: failover_version,
            last_write_event_id,
        });
    }

    /// Stamp the current failover version and last written event before a
    /// persist of a global-domain run.
    pub fn apply_replication_version(&mut self, failover_version: i64) {
        let last_event_id = self.execution_info.next_event_id - 1;
        match &mut self.replication_state {
            Some(state) => {
                state.current_version = failover_version;
                state.last_write_version = failover_version;
                state.last_write_event_id = last_event_id;
            }
            None => self.init_replication_state(failover_version, last_event_id),
        }
    }

    // ------------------------------------------------------------------
    // Session close
    // ------------------------------------------------------------------

    /// Take a snapshot of all updates accumulated since load and reset the
    /// session trackers.
    pub fn close_update_session(&mut self) -> SessionUpdates {
        let updates = SessionUpdates {
            new_events: std::mem::take(&mut self.new_events),
            upsert_activity_infos: self
                .updated_activities
                .iter()
                .filter_map(|id| self.activity_infos.get(id).cloned())
                .collect(),
            delete_activity_infos: self.deleted_activities.iter().copied().collect(),
            upsert_timer_infos: self
                .updated_timers
                .iter()
                .filter_map(|id| self.timer_infos.get(id).cloned())
                .collect(),
            delete_timer_infos: self.deleted_timers.iter().cloned().collect(),
            upsert_child_infos: self
                .updated_children
                .iter()
                .filter_map(|id| self.child_infos.get(id).cloned())
                .collect(),
            delete_child_info: self.deleted_child,
            upsert_cancel_infos: self
                .updated_cancels
                .iter()
                .filter_map(|id| self.cancel_infos.get(id).cloned())
                .collect(),
            delete_cancel_info: self.deleted_cancel,
            upsert_signal_infos: self
                .updated_signals
                .iter()
                .filter_map(|id| self.signal_infos.get(id).cloned())
                .collect(),
            delete_signal_info: self.deleted_signal,
            upsert_signal_requested_ids: self.updated_signal_requested.iter().cloned().collect(),
            delete_signal_requested_id: self.deleted_signal_requested.clone(),
            new_buffered_events: std::mem::take(&mut self.new_buffered),
            clear_buffered_events: self.clear_buffered,
            continue_as_new: self.continue_as_new.take(),
        };
        self.updated_activities.clear();
        self.deleted_activities.clear();
        self.updated_timers.clear();
        self.deleted_timers.clear();
        self.updated_children.clear();
        self.deleted_child = None;
        self.updated_cancels.clear();
        self.deleted_cancel = None;
        self.updated_signals.clear();
        self.deleted_signal = None;
        self.updated_signal_requested.clear();
        self.deleted_signal_requested = None;
        self.clear_buffered = false;
        updates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use chronik_types::WorkflowIdReusePolicy;

    fn start_request() -> StartWorkflowRequest {
        StartWorkflowRequest {
            domain_id: "d1".to_string(),
            workflow_id: "wf1".to_string(),
            workflow_type: "order-processing".to_string(),
            task_list: "default".to_string(),
            input: None,
            execution_timeout_secs: 100,
            decision_timeout_secs: 10,
            identity: "test".to_string(),
            request_id: "req-1".to_string(),
            reuse_policy: WorkflowIdReusePolicy::AllowDuplicate,
            parent: None,
        }
    }

    fn started_builder() -> MutableStateBuilder {
        let mut builder = MutableStateBuilder::new(Arc::new(SystemClock));
        let workflow = WorkflowRun::new("d1", "wf1", "run-1");
        builder
            .add_workflow_execution_started_event(&workflow, &start_request(), None)
            .unwrap();
        builder
    }

    #[test]
    fn test_event_ids_increment() {
        let mut builder = started_builder();
        assert_eq!(builder.next_event_id(), 2);
        let decision = builder.add_decision_task_scheduled_event().unwrap();
        assert_eq!(decision.schedule_id, 2);
        assert_eq!(builder.next_event_id(), 3);
        assert_eq!(builder.new_events().len(), 2);
    }

    #[test]
    fn test_at_most_one_pending_decision() {
        let mut builder = started_builder();
        builder.add_decision_task_scheduled_event().unwrap();
        assert!(builder.add_decision_task_scheduled_event().is_none());
    }

    #[test]
    fn test_decision_start_complete_cycle() {
        let mut builder = started_builder();
        let decision = builder.add_decision_task_scheduled_event().unwrap();
        let decision = builder
            .add_decision_task_started_event(decision.schedule_id, "poll-1", "worker")
            .unwrap();
        assert_eq!(decision.started_id, 3);
        // Starting twice is rejected.
        assert!(builder
            .add_decision_task_started_event(decision.schedule_id, "poll-2", "worker")
            .is_none());

        let completed_id = builder
            .add_decision_task_completed_event(decision.schedule_id, decision.started_id, "worker")
            .unwrap();
        assert_eq!(completed_id, 4);
        assert!(!builder.has_pending_decision());
        assert_eq!(builder.execution_info.last_processed_event, 3);
    }

    #[test]
    fn test_events_buffer_while_decision_in_flight() {
        let mut builder = started_builder();
        let decision = builder.add_decision_task_scheduled_event().unwrap();
        builder
            .add_decision_task_started_event(decision.schedule_id, "poll-1", "worker")
            .unwrap();
        let before = builder.next_event_id();

        builder
            .add_workflow_signaled_event("go".to_string(), None, "sender".to_string())
            .unwrap();
        assert!(builder.has_buffered_events());
        // Buffered events take no event ID yet.
        assert_eq!(builder.next_event_id(), before);

        // Completing the decision flushes the signal into history.
        builder
            .add_decision_task_completed_event(decision.schedule_id, 3, "worker")
            .unwrap();
        assert!(!builder.has_buffered_events());
        let flushed = builder
            .new_events()
            .iter()
            .find(|e| e.event_type() == "workflow_execution_signaled")
            .unwrap();
        assert!(flushed.event_id > 4);
    }

    #[test]
    fn test_transient_decision_not_in_history_until_success() {
        let mut builder = started_builder();
        let decision = builder.add_decision_task_scheduled_event().unwrap();
        let decision = builder
            .add_decision_task_started_event(decision.schedule_id, "poll-1", "worker")
            .unwrap();
        builder
            .add_decision_task_failed_event(
                decision.schedule_id,
                decision.started_id,
                DecisionTaskFailedCause::UnhandledDecision,
                None,
                "worker",
            )
            .unwrap();
        assert_eq!(builder.execution_info.decision_attempt, 1);

        let events_before = builder.new_events().len();
        let retry = builder.add_decision_task_scheduled_event().unwrap();
        assert_eq!(retry.attempt, 1);
        // Transient scheduled event: nothing appended.
        assert_eq!(builder.new_events().len(), events_before);
        // Schedule ID is preserved across the retry (nothing else appended).
        assert_eq!(retry.schedule_id, builder.next_event_id());

        let retry = builder
            .add_decision_task_started_event(retry.schedule_id, "poll-2", "worker")
            .unwrap();
        assert_eq!(builder.new_events().len(), events_before);

        // Completion materializes scheduled + started + completed.
        builder
            .add_decision_task_completed_event(retry.schedule_id, retry.started_id, "worker")
            .unwrap();
        assert_eq!(builder.new_events().len(), events_before + 3);
        assert_eq!(builder.execution_info.decision_attempt, 0);
    }

    #[test]
    fn test_activity_schedule_id_reuse_rejected() {
        let mut builder = started_builder();
        let decision = builder.add_decision_task_scheduled_event().unwrap();
        let decision = builder
            .add_decision_task_started_event(decision.schedule_id, "p", "w")
            .unwrap();
        let completed_id = builder
            .add_decision_task_completed_event(decision.schedule_id, decision.started_id, "w")
            .unwrap();

        let attrs = ScheduleActivityTaskAttributes {
            activity_id: "a1".to_string(),
            activity_type: "t".to_string(),
            task_list: "tl".to_string(),
            domain_id: None,
            input: None,
            schedule_to_close_timeout_secs: 60,
            schedule_to_start_timeout_secs: 10,
            start_to_close_timeout_secs: 50,
            heartbeat_timeout_secs: 0,
        };
        assert!(builder
            .add_activity_task_scheduled_event(completed_id, &attrs)
            .is_some());
        assert!(builder
            .add_activity_task_scheduled_event(completed_id, &attrs)
            .is_none());
    }

    #[test]
    fn test_duplicate_timer_id_rejected() {
        let mut builder = started_builder();
        assert!(builder.add_timer_started_event(4, "t1", 30).is_some());
        assert!(builder.add_timer_started_event(4, "t1", 30).is_none());
        assert!(builder.add_timer_started_event(4, "t2", 30).is_some());
    }

    #[test]
    fn test_terminal_event_closes_run_and_blocks_mutation() {
        let mut builder = started_builder();
        builder
            .add_workflow_terminated_event("op".to_string(), None, "cli".to_string())
            .unwrap();
        assert!(!builder.is_running());
        assert_eq!(builder.execution_info.close_status, CloseStatus::Terminated);
        assert!(builder
            .add_workflow_signaled_event("s".to_string(), None, "x".to_string())
            .is_none());
        assert!(builder.add_decision_task_scheduled_event().is_none());
    }

    #[test]
    fn test_continue_as_new_stages_successor() {
        let mut builder = started_builder();
        let attrs = ContinueAsNewWorkflowExecutionAttributes {
            workflow_type: None,
            task_list: None,
            input: None,
            execution_timeout_secs: 0,
            decision_timeout_secs: 0,
        };
        builder.add_continue_as_new_event(4, "run-2", &attrs).unwrap();
        assert!(!builder.is_running());

        let updates = builder.close_update_session();
        let bundle = updates.continue_as_new.expect("successor staged");
        let new_info = &bundle.builder.execution_info;
        // Inherited from the current run.
        assert_eq!(new_info.workflow_type, "order-processing");
        assert_eq!(new_info.task_list, "default");
        assert_eq!(new_info.workflow_timeout_secs, 100);
        assert_eq!(new_info.run_id, "run-2");
        assert!(new_info.has_pending_decision());
        assert_eq!(bundle.transfer_tasks.len(), 1);
        assert_eq!(bundle.timer_tasks.len(), 1);
    }

    #[test]
    fn test_session_updates_capture_deltas() {
        let mut builder = started_builder();
        builder.add_timer_started_event(4, "t1", 30).unwrap();
        builder.add_signal_requested("sig-req-1");
        let updates = builder.close_update_session();
        assert_eq!(updates.upsert_timer_infos.len(), 1);
        assert_eq!(updates.upsert_signal_requested_ids, vec!["sig-req-1"]);
        assert_eq!(updates.new_events.len(), 2);

        // Session trackers reset: a second close is empty.
        let updates = builder.close_update_session();
        assert!(updates.new_events.is_empty());
        assert!(updates.upsert_timer_infos.is_empty());
    }
}
