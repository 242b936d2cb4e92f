// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow-level request handlers.
//!
//! Start, signal-with-start, signal, request-cancel, terminate, the
//! long-polling mutable-state query, describe, and the small projection
//! edits (sticky reset, signal-dedup removal), plus the internal
//! schedule-decision and child-completion RPCs used by the transfer
//! processors.

use tokio::sync::watch;
use tracing::{info, instrument, warn};

use chronik_types::event::EventAttributes;
use chronik_types::request::*;
use chronik_types::task::{ReplicationTask, TransferTask, TransferTaskKind};
use chronik_types::{
    WorkflowIdReusePolicy, WorkflowRun, WorkflowState, EMPTY_EVENT_ID, FIRST_EVENT_ID,
};

use crate::engine::HistoryEngine;
use crate::error::{EngineError, Result};
use crate::mutable_state::MutableStateBuilder;
use crate::notifier::HistoryEventNotification;
use crate::persistence::{
    with_retry, CreateWorkflowExecutionRequest, VisibilityStartRecord,
};
use crate::shard::CommitRecord;

impl HistoryEngine {
    /// Start a new workflow run.
    ///
    /// Applies the workflow-ID reuse policy against a prior run of the same
    /// workflow ID and deduplicates racing creates on the client request ID.
    #[instrument(skip(self, request), fields(workflow_id = %request.workflow_id))]
    pub async fn start_workflow_execution(
        &self,
        request: StartWorkflowRequest,
    ) -> Result<StartWorkflowResponse> {
        validate_start_request(&request)?;
        info!(workflow_type = %request.workflow_type, "Starting workflow execution");
        self.create_workflow_run(&request, None, true, None, true)
            .await
    }

    /// Signal a running workflow, starting it first when absent or closed.
    #[instrument(skip(self, request), fields(workflow_id = %request.workflow_id))]
    pub async fn signal_with_start_workflow_execution(
        &self,
        request: SignalWithStartWorkflowRequest,
    ) -> Result<StartWorkflowResponse> {
        if request.signal_name.is_empty() {
            return Err(EngineError::bad_request("Missing signal name."));
        }
        let start_request = StartWorkflowRequest {
            domain_id: request.domain_id.clone(),
            workflow_id: request.workflow_id.clone(),
            workflow_type: request.workflow_type.clone(),
            task_list: request.task_list.clone(),
            input: request.input.clone(),
            execution_timeout_secs: request.execution_timeout_secs,
            decision_timeout_secs: request.decision_timeout_secs,
            identity: request.identity.clone(),
            request_id: request.request_id.clone(),
            reuse_policy: WorkflowIdReusePolicy::AllowDuplicate,
            parent: None,
        };
        validate_start_request(&start_request)?;

        let mut is_brand_new = true;
        let mut previous_run_id = None;

        let current = self
            .execution_store
            .get_current_execution(&request.domain_id, &request.workflow_id)
            .await;
        match current {
            Ok(current) => {
                let workflow = WorkflowRun::new(
                    &request.domain_id,
                    &request.workflow_id,
                    &current.run_id,
                );
                match self.just_signal(&workflow, &request).await {
                    Ok(Some(response)) => return Ok(response),
                    // The current run is closed or gone; fall through to a
                    // fresh start chained onto it.
                    Ok(None) => {
                        is_brand_new = false;
                        previous_run_id = Some(current.run_id);
                    }
                    Err(err) => return Err(err),
                }
            }
            Err(EngineError::EntityNotExists { .. }) => {}
            Err(err) => return Err(err),
        }

        let signal = Some((request.signal_name.clone(), request.signal_input.clone()));
        self.create_workflow_run(&start_request, signal, is_brand_new, previous_run_id, false)
            .await
    }

    /// Signal the current run if it is still running. `Ok(None)` means the
    /// caller should start a fresh run instead.
    async fn just_signal(
        &self,
        workflow: &WorkflowRun,
        request: &SignalWithStartWorkflowRequest,
    ) -> Result<Option<StartWorkflowResponse>> {
        let mut ctx = self.cache.acquire(workflow).await;

        for _attempt in 0..self.config.conditional_retry_count {
            let ms = match ctx.load().await {
                Ok(ms) => ms,
                Err(EngineError::EntityNotExists { .. }) => return Ok(None),
                Err(err) => return Err(err),
            };
            if !ms.is_running() {
                ctx.release();
                return Ok(None);
            }

            ms.add_workflow_signaled_event(
                request.signal_name.clone(),
                request.signal_input.clone(),
                request.identity.clone(),
            )
            .ok_or_else(|| EngineError::internal("unable to signal workflow execution"))?;

            let mut transfer_tasks = Vec::new();
            let mut timer_tasks = Vec::new();
            if !ms.has_pending_decision() {
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

            let failover_version = self.replication_version(&workflow.domain_id);
            match ctx
                .update_workflow_execution(transfer_tasks, timer_tasks, failover_version)
                .await
            {
                Err(EngineError::Conflict) => continue,
                Err(err) => return Err(err),
                Ok(()) => {
                    ctx.release();
                    return Ok(Some(StartWorkflowResponse {
                        run_id: workflow.run_id.clone(),
                    }));
                }
            }
        }
        Err(EngineError::MaxAttemptsExceeded)
    }

    /// Build and persist a brand-new (or chained) run: started event,
    /// optional signal, first decision unless started as a child, workflow
    /// timeout timer and optional replication bundle.
    async fn create_workflow_run(
        &self,
        request: &StartWorkflowRequest,
        signal: Option<(String, Option<Vec<u8>>)>,
        is_brand_new: bool,
        previous_run_id: Option<String>,
        apply_reuse_policy: bool,
    ) -> Result<StartWorkflowResponse> {
        let workflow = WorkflowRun::new(
            &request.domain_id,
            &request.workflow_id,
            self.new_run_id(),
        );

        let mut builder = MutableStateBuilder::new(self.shard.clock());
        builder
            .add_workflow_execution_started_event(&workflow, request, None)
            .ok_or_else(|| {
                EngineError::internal("failed to add workflow execution started event")
            })?;

        if let Some((signal_name, signal_input)) = signal {
            builder
                .add_workflow_signaled_event(signal_name, signal_input, request.identity.clone())
                .ok_or_else(|| {
                    EngineError::internal("failed to add workflow execution signaled event")
                })?;
        }

        let mut transfer_tasks = Vec::new();
        let mut decision_schedule_id = EMPTY_EVENT_ID;
        if request.parent.is_none() {
            // Child runs get their first decision scheduled by the parent
            // once the started event is recorded.
            let decision = builder
                .add_decision_task_scheduled_event()
                .ok_or_else(|| EngineError::internal("failed to add decision scheduled event"))?;
            decision_schedule_id = decision.schedule_id;
            transfer_tasks.push(TransferTask {
                task_id: self.shard.next_transfer_task_id(),
                workflow: workflow.clone(),
                version: 0,
                kind: TransferTaskKind::DecisionTask {
                    task_list: request.task_list.clone(),
                    schedule_id: decision.schedule_id,
                },
            });
        }

        let mut timer_tasks = vec![self.workflow_timeout_timer(
            &workflow,
            request.execution_timeout_secs,
        )];
        for task in &mut timer_tasks {
            task.task_id = self.shard.next_transfer_task_id();
        }

        let mut replication_tasks = Vec::new();
        if let Some(version) = self.replication_version(&request.domain_id) {
            builder.init_replication_state(version, decision_schedule_id);
            replication_tasks.push(ReplicationTask {
                task_id: self.shard.next_transfer_task_id(),
                workflow: workflow.clone(),
                first_event_id: FIRST_EVENT_ID,
                next_event_id: builder.next_event_id(),
                version,
            });
        }

        // Transaction ID zero is safe for a brand-new run: the fresh run ID
        // cannot collide with any prior append.
        let new_events = builder.new_events().to_vec();
        let history_store = self.history_store.clone();
        let append = crate::persistence::AppendHistoryEventsRequest {
            workflow: workflow.clone(),
            first_event_id: FIRST_EVENT_ID,
            transaction_id: 0,
            events: new_events,
        };
        with_retry(self.retry_policy, || {
            history_store.append_history_events(&append)
        })
        .await?;
        builder.execution_info.last_first_event_id = FIRST_EVENT_ID;
        builder.close_update_session();

        let mut create = CreateWorkflowExecutionRequest {
            request_id: request.request_id.clone(),
            snapshot: builder.snapshot_record(),
            transfer_tasks,
            timer_tasks,
            replication_tasks,
            continue_as_new: !is_brand_new,
            previous_run_id,
        };

        let run_id = match self.try_create(&workflow, &create, request).await? {
            CreateOutcome::Created => workflow.run_id.clone(),
            CreateOutcome::DedupedOnRequestId(run_id) => run_id,
            CreateOutcome::AlreadyStarted(prior) => {
                if !apply_reuse_policy {
                    self.delete_orphan_history(&workflow).await;
                    return Err(prior);
                }
                let retry_run_id = self.apply_reuse_policy(&workflow, prior, request).await?;
                create.continue_as_new = true;
                create.previous_run_id = Some(retry_run_id);
                match self.try_create(&workflow, &create, request).await? {
                    CreateOutcome::Created => workflow.run_id.clone(),
                    CreateOutcome::DedupedOnRequestId(run_id) => run_id,
                    CreateOutcome::AlreadyStarted(err) => {
                        self.delete_orphan_history(&workflow).await;
                        return Err(err);
                    }
                }
            }
        };

        if run_id == workflow.run_id {
            // Best-effort visibility record; the close path writes the
            // authoritative closed record.
            let started = VisibilityStartRecord {
                workflow: workflow.clone(),
                workflow_type: request.workflow_type.clone(),
                start_time: self.shard.now(),
            };
            if let Err(err) = self
                .visibility_store
                .record_workflow_execution_started(&started)
                .await
            {
                warn!(%err, "Failed to record started visibility record");
            }

            self.shard.publish_commit(&CommitRecord {
                transfer_tasks: !create.transfer_tasks.is_empty(),
                timer_tasks: create.timer_tasks.clone(),
                replication_tasks: !create.replication_tasks.is_empty(),
                notification: Some(HistoryEventNotification {
                    workflow: workflow.clone(),
                    last_first_event_id: FIRST_EVENT_ID,
                    next_event_id: create.snapshot.execution_info.next_event_id,
                    is_running: true,
                    timestamp: self.shard.now(),
                }),
            });
        }

        Ok(StartWorkflowResponse { run_id })
    }

    async fn try_create(
        &self,
        workflow: &WorkflowRun,
        create: &CreateWorkflowExecutionRequest,
        request: &StartWorkflowRequest,
    ) -> Result<CreateOutcome> {
        let execution_store = self.execution_store.clone();
        match with_retry(self.retry_policy, || {
            execution_store.create_workflow_execution(create)
        })
        .await
        {
            Ok(()) => Ok(CreateOutcome::Created),
            Err(err) => {
                let same_request = match &err {
                    EngineError::WorkflowAlreadyStarted {
                        run_id,
                        start_request_id,
                        ..
                    } => (start_request_id == &request.request_id).then(|| run_id.clone()),
                    _ => {
                        self.delete_orphan_history(workflow).await;
                        return Err(err);
                    }
                };
                match same_request {
                    // A concurrent create with the same request ID won the
                    // race: the start is idempotent.
                    Some(winner) => {
                        self.delete_orphan_history(workflow).await;
                        Ok(CreateOutcome::DedupedOnRequestId(winner))
                    }
                    None => Ok(CreateOutcome::AlreadyStarted(err)),
                }
            }
        }
    }

    /// Decide whether the reuse policy admits a new run after a collision.
    /// Returns the prior run ID to chain the create onto.
    async fn apply_reuse_policy(
        &self,
        workflow: &WorkflowRun,
        prior: EngineError,
        request: &StartWorkflowRequest,
    ) -> Result<String> {
        let (prior_run_id, prior_state, prior_close_status) = match &prior {
            EngineError::WorkflowAlreadyStarted {
                run_id,
                state,
                close_status,
                ..
            } => (run_id.clone(), *state, *close_status),
            _ => return Err(EngineError::internal("reuse policy on unexpected error")),
        };

        if prior_state != WorkflowState::Completed {
            self.delete_orphan_history(workflow).await;
            return Err(prior);
        }
        match request.reuse_policy {
            WorkflowIdReusePolicy::AllowDuplicate => {}
            WorkflowIdReusePolicy::AllowDuplicateFailedOnly => {
                if !prior_close_status.is_failure() {
                    self.delete_orphan_history(workflow).await;
                    return Err(prior);
                }
            }
            WorkflowIdReusePolicy::RejectDuplicate => {
                self.delete_orphan_history(workflow).await;
                return Err(prior);
            }
        }
        Ok(prior_run_id)
    }

    /// The new run's history was appended before the create; when the create
    /// loses, that history leaks unless deleted. Safe because the fresh run
    /// ID is not visible anywhere yet.
    async fn delete_orphan_history(&self, workflow: &WorkflowRun) {
        if let Err(err) = self
            .history_store
            .delete_workflow_execution_history(workflow)
            .await
        {
            warn!(
                workflow_id = %workflow.workflow_id,
                run_id = %workflow.run_id,
                %err,
                "Failed to delete orphan history"
            );
        }
    }

    /// Mutable-state projection, optionally long-polling until history
    /// passes `expected_next_event_id` or the run closes.
    ///
    /// `cancel` is the caller's cancellation handle; a `true` published on
    /// it aborts the poll with [`EngineError::Canceled`].
    #[instrument(skip(self, request, cancel), fields(workflow_id = %request.workflow_id))]
    pub async fn get_mutable_state(
        &self,
        request: GetMutableStateRequest,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<GetMutableStateResponse> {
        let workflow = self
            .resolve_workflow_run(
                &request.domain_id,
                &request.workflow_id,
                request.run_id.as_deref(),
            )
            .await?;

        let response = self.mutable_state_snapshot(&workflow).await?;
        let expected_next_event_id = request.expected_next_event_id.unwrap_or(FIRST_EVENT_ID);
        if expected_next_event_id < response.next_event_id || !response.is_workflow_running {
            return Ok(response);
        }

        // Long poll: subscribe, then re-read once to close the race with a
        // commit published between the first read and the subscription.
        let mut notifications = self.notifier.watch(&workflow);
        notifications.mark_unchanged();

        let mut response = self.mutable_state_snapshot(&workflow).await?;
        if expected_next_event_id < response.next_event_id || !response.is_workflow_running {
            return Ok(response);
        }

        let expiration = tokio::time::sleep(self.config.long_poll_expiration);
        tokio::pin!(expiration);
        let mut cancel = cancel;
        loop {
            let canceled = async {
                match &mut cancel {
                    Some(cancel) => {
                        while !*cancel.borrow_and_update() {
                            if cancel.changed().await.is_err() {
                                // Handle dropped: treat as canceled.
                                break;
                            }
                        }
                    }
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                changed = notifications.changed() => {
                    if changed.is_err() {
                        return Ok(response);
                    }
                    let latest = notifications.borrow_and_update().clone();
                    if let Some(notification) = latest {
                        response.last_first_event_id = notification.last_first_event_id;
                        response.next_event_id = notification.next_event_id;
                        response.is_workflow_running = notification.is_running;
                        if expected_next_event_id < notification.next_event_id
                            || !notification.is_running
                        {
                            return Ok(response);
                        }
                    }
                }
                _ = &mut expiration => return Ok(response),
                _ = canceled => return Err(EngineError::Canceled),
            }
        }
    }

    async fn mutable_state_snapshot(
        &self,
        workflow: &WorkflowRun,
    ) -> Result<GetMutableStateResponse> {
        let mut ctx = self.cache.acquire(workflow).await;
        let ms = ctx.load().await?;
        let info = &ms.execution_info;
        let response = GetMutableStateResponse {
            workflow_id: info.workflow_id.clone(),
            run_id: info.run_id.clone(),
            workflow_type: info.workflow_type.clone(),
            task_list: info.task_list.clone(),
            sticky_task_list: info.sticky_task_list.clone(),
            sticky_schedule_to_start_timeout_secs: info.sticky_schedule_to_start_timeout_secs,
            last_first_event_id: info.last_first_event_id,
            next_event_id: info.next_event_id,
            is_workflow_running: info.is_running(),
        };
        ctx.release();
        Ok(response)
    }

    /// Execution snapshot with pending activities.
    #[instrument(skip(self, request), fields(workflow_id = %request.workflow_id))]
    pub async fn describe_workflow_execution(
        &self,
        request: DescribeWorkflowRequest,
    ) -> Result<DescribeWorkflowResponse> {
        let workflow = self
            .resolve_workflow_run(
                &request.domain_id,
                &request.workflow_id,
                request.run_id.as_deref(),
            )
            .await?;

        let mut ctx = self.cache.acquire(&workflow).await;
        let ms = ctx.load().await?;
        let info = &ms.execution_info;

        let mut pending_activities = Vec::new();
        for activity in ms.pending_activities() {
            let state = if activity.cancel_requested {
                PendingActivityState::CancelRequested
            } else if activity.started_id != EMPTY_EVENT_ID {
                PendingActivityState::Started
            } else {
                PendingActivityState::Scheduled
            };
            let activity_type = match &activity.scheduled_event.attributes {
                EventAttributes::ActivityTaskScheduled(attrs) => attrs.activity_type.clone(),
                _ => String::new(),
            };
            pending_activities.push(PendingActivitySnapshot {
                activity_id: activity.activity_id.clone(),
                activity_type,
                state,
                last_heartbeat: activity.last_heartbeat,
                heartbeat_details: activity.details.clone(),
            });
        }

        let closed = info.state == WorkflowState::Completed;
        let response = DescribeWorkflowResponse {
            workflow_id: info.workflow_id.clone(),
            run_id: info.run_id.clone(),
            workflow_type: info.workflow_type.clone(),
            task_list: info.task_list.clone(),
            execution_timeout_secs: info.workflow_timeout_secs,
            decision_timeout_secs: info.decision_timeout_secs,
            start_time: info.start_timestamp,
            history_length: info.next_event_id - FIRST_EVENT_ID,
            close_status: closed.then_some(info.close_status),
            close_time: closed.then_some(info.last_updated),
            pending_activities,
        };
        ctx.release();
        Ok(response)
    }

    /// Request cancellation of a run. Idempotent on the cancel request ID.
    #[instrument(skip(self, request), fields(workflow_id = %request.workflow_id))]
    pub async fn request_cancel_workflow_execution(
        &self,
        request: RequestCancelWorkflowRequest,
    ) -> Result<()> {
        let workflow = self
            .resolve_workflow_run(
                &request.domain_id,
                &request.workflow_id,
                request.run_id.as_deref(),
            )
            .await?;

        self.update_workflow_execution(&workflow, false, true, |ms| {
            if !ms.is_running() {
                return Err(workflow_completed_error());
            }
            check_parent_guard(
                ms,
                request.child_workflow_only,
                request.external_workflow_id.as_deref(),
                request.external_run_id.as_deref(),
            )?;

            let (already_requested, prior_request_id) = ms.cancel_requested();
            if already_requested {
                if !request.cancel_request_id.is_empty()
                    && prior_request_id == Some(request.cancel_request_id.as_str())
                {
                    return Ok(Vec::new());
                }
                return Err(EngineError::CancellationAlreadyRequested);
            }

            ms.add_workflow_cancel_requested_event(
                "workflow cancellation requested".to_string(),
                request.identity.clone(),
                Some(request.cancel_request_id.clone()),
                request.external_workflow_id.clone(),
                request.external_run_id.clone(),
            )
            .ok_or_else(|| EngineError::internal("unable to request workflow cancellation"))?;
            Ok(Vec::new())
        })
        .await
    }

    /// Signal a run. Idempotent on the signal request ID.
    #[instrument(skip(self, request), fields(workflow_id = %request.workflow_id))]
    pub async fn signal_workflow_execution(&self, request: SignalWorkflowRequest) -> Result<()> {
        if request.signal_name.is_empty() {
            return Err(EngineError::bad_request("Missing signal name."));
        }
        let workflow = self
            .resolve_workflow_run(
                &request.domain_id,
                &request.workflow_id,
                request.run_id.as_deref(),
            )
            .await?;

        self.update_workflow_execution(&workflow, false, true, |ms| {
            if !ms.is_running() {
                return Err(workflow_completed_error());
            }
            check_parent_guard(
                ms,
                request.child_workflow_only,
                request.external_workflow_id.as_deref(),
                request.external_run_id.as_deref(),
            )?;

            if !request.request_id.is_empty() {
                if ms.is_signal_requested(&request.request_id) {
                    return Ok(Vec::new());
                }
                ms.add_signal_requested(&request.request_id);
            }

            ms.add_workflow_signaled_event(
                request.signal_name.clone(),
                request.input.clone(),
                request.identity.clone(),
            )
            .ok_or_else(|| EngineError::internal("unable to signal workflow execution"))?;
            Ok(Vec::new())
        })
        .await
    }

    /// Terminate a run unconditionally.
    #[instrument(skip(self, request), fields(workflow_id = %request.workflow_id))]
    pub async fn terminate_workflow_execution(
        &self,
        request: TerminateWorkflowRequest,
    ) -> Result<()> {
        let workflow = self
            .resolve_workflow_run(
                &request.domain_id,
                &request.workflow_id,
                request.run_id.as_deref(),
            )
            .await?;
        info!(run_id = %workflow.run_id, reason = %request.reason, "Terminating workflow execution");

        self.update_workflow_execution(&workflow, true, false, |ms| {
            if !ms.is_running() {
                return Err(workflow_completed_error());
            }
            ms.add_workflow_terminated_event(
                request.reason.clone(),
                request.details.clone(),
                request.identity.clone(),
            )
            .ok_or_else(|| EngineError::internal("unable to terminate workflow execution"))?;
            Ok(Vec::new())
        })
        .await
    }

    /// Drop a signal request ID from the dedup set.
    pub async fn remove_signal_mutable_state(
        &self,
        request: RemoveSignalMutableStateRequest,
    ) -> Result<()> {
        let workflow = WorkflowRun::new(&request.domain_id, &request.workflow_id, &request.run_id);
        self.update_workflow_execution(&workflow, false, false, |ms| {
            if !ms.is_running() {
                return Err(workflow_completed_error());
            }
            ms.delete_signal_requested(&request.request_id);
            Ok(Vec::new())
        })
        .await
    }

    /// Clear client affinity for a run.
    pub async fn reset_sticky_task_list(&self, request: ResetStickyTaskListRequest) -> Result<()> {
        let workflow = WorkflowRun::new(&request.domain_id, &request.workflow_id, &request.run_id);
        self.update_workflow_execution(&workflow, false, false, |ms| {
            if ms.is_running() {
                ms.clear_sticky();
            }
            Ok(Vec::new())
        })
        .await
    }

    /// Schedule a decision task when none is pending. Used by the transfer
    /// processor after parent-side child events.
    pub async fn schedule_decision_task(&self, request: ScheduleDecisionTaskRequest) -> Result<()> {
        let workflow = WorkflowRun::new(&request.domain_id, &request.workflow_id, &request.run_id);
        self.update_workflow_execution(&workflow, false, true, |ms| {
            if !ms.is_running() {
                return Err(workflow_completed_error());
            }
            Ok(Vec::new())
        })
        .await
    }

    /// Record a child run's terminal event into the parent's history and
    /// wake the parent with a decision.
    #[instrument(skip(self, request), fields(workflow_id = %request.workflow_id, initiated_id = request.initiated_id))]
    pub async fn record_child_execution_completed(
        &self,
        request: RecordChildExecutionCompletedRequest,
    ) -> Result<()> {
        let workflow = WorkflowRun::new(&request.domain_id, &request.workflow_id, &request.run_id);
        self.update_workflow_execution(&workflow, false, true, |ms| {
            if !ms.is_running() {
                return Err(workflow_completed_error());
            }
            let child = ms
                .get_child_execution_info(request.initiated_id)
                .filter(|info| info.started_id != EMPTY_EVENT_ID)
                .ok_or_else(|| {
                    EngineError::not_exists("Pending child execution not found.")
                })?;
            let child_domain_id = match &child.initiated_event.attributes {
                EventAttributes::StartChildWorkflowExecutionInitiated(attrs) => {
                    attrs.domain_id.clone()
                }
                _ => request.domain_id.clone(),
            };
            let started_id = child.started_id;

            let completion = child_completion_attributes(
                request.initiated_id,
                started_id,
                &child_domain_id,
                &request.child_workflow_id,
                &request.child_run_id,
                &request.completion_event.attributes,
            )
            .ok_or_else(|| {
                EngineError::bad_request("Completion event is not a terminal workflow event.")
            })?;
            ms.add_child_completion_event(request.initiated_id, completion)
                .ok_or_else(|| EngineError::internal("unable to record child completion"))?;
            Ok(Vec::new())
        })
        .await
    }

    /// Apply an event batch replicated from the active cluster.
    pub async fn replicate_events(
        &self,
        request: chronik_types::request::ReplicateEventsRequest,
    ) -> Result<()> {
        crate::queues::replicator::apply_replicated_events(self, request).await
    }
}

enum CreateOutcome {
    Created,
    DedupedOnRequestId(String),
    AlreadyStarted(EngineError),
}

fn workflow_completed_error() -> EngineError {
    EngineError::not_exists("Workflow execution already completed.")
}

fn check_parent_guard(
    ms: &MutableStateBuilder,
    child_workflow_only: bool,
    external_workflow_id: Option<&str>,
    external_run_id: Option<&str>,
) -> Result<()> {
    if !child_workflow_only {
        return Ok(());
    }
    let info = &ms.execution_info;
    let parent_matches = info.parent_workflow_id.as_deref() == external_workflow_id
        && info.parent_run_id.as_deref() == external_run_id;
    if parent_matches {
        Ok(())
    } else {
        Err(EngineError::not_exists("Workflow parent does not match."))
    }
}

/// Map a child run's terminal event onto the parent-side child event.
fn child_completion_attributes(
    initiated_id: i64,
    started_id: i64,
    domain_id: &str,
    workflow_id: &str,
    run_id: &str,
    completion: &EventAttributes,
) -> Option<EventAttributes> {
    use chronik_types::event;
    let base = (
        initiated_id,
        started_id,
        domain_id.to_string(),
        workflow_id.to_string(),
        run_id.to_string(),
    );
    match completion {
        EventAttributes::WorkflowExecutionCompleted(attrs) => Some(
            EventAttributes::ChildWorkflowExecutionCompleted(
                event::ChildWorkflowExecutionCompletedAttributes {
                    initiated_event_id: base.0,
                    started_event_id: base.1,
                    domain_id: base.2,
                    workflow_id: base.3,
                    run_id: base.4,
                    result: attrs.result.clone(),
                },
            ),
        ),
        EventAttributes::WorkflowExecutionFailed(attrs) => Some(
            EventAttributes::ChildWorkflowExecutionFailed(
                event::ChildWorkflowExecutionFailedAttributes {
                    initiated_event_id: base.0,
                    started_event_id: base.1,
                    domain_id: base.2,
                    workflow_id: base.3,
                    run_id: base.4,
                    reason: attrs.reason.clone(),
                    details: attrs.details.clone(),
                },
            ),
        ),
        EventAttributes::WorkflowExecutionCanceled(attrs) => Some(
            EventAttributes::ChildWorkflowExecutionCanceled(
                event::ChildWorkflowExecutionCanceledAttributes {
                    initiated_event_id: base.0,
                    started_event_id: base.1,
                    domain_id: base.2,
                    workflow_id: base.3,
                    run_id: base.4,
                    details: attrs.details.clone(),
                },
            ),
        ),
        EventAttributes::WorkflowExecutionTerminated(_) => Some(
            EventAttributes::ChildWorkflowExecutionTerminated(
                event::ChildWorkflowExecutionTerminatedAttributes {
                    initiated_event_id: base.0,
                    started_event_id: base.1,
                    domain_id: base.2,
                    workflow_id: base.3,
                    run_id: base.4,
                },
            ),
        ),
        EventAttributes::WorkflowExecutionTimedOut(attrs) => Some(
            EventAttributes::ChildWorkflowExecutionTimedOut(
                event::ChildWorkflowExecutionTimedOutAttributes {
                    initiated_event_id: base.0,
                    started_event_id: base.1,
                    domain_id: base.2,
                    workflow_id: base.3,
                    run_id: base.4,
                    timeout_type: attrs.timeout_type,
                },
            ),
        ),
        _ => None,
    }
}

fn validate_start_request(request: &StartWorkflowRequest) -> Result<()> {
    if request.domain_id.is_empty() {
        return Err(EngineError::bad_request("Missing domain ID."));
    }
    if request.workflow_id.is_empty() {
        return Err(EngineError::bad_request("Missing workflow ID."));
    }
    if request.workflow_type.is_empty() {
        return Err(EngineError::bad_request("Missing workflow type."));
    }
    if request.task_list.is_empty() {
        return Err(EngineError::bad_request("Missing task list."));
    }
    if request.execution_timeout_secs <= 0 {
        return Err(EngineError::bad_request(
            "Missing or invalid ExecutionStartToCloseTimeoutSeconds.",
        ));
    }
    if request.decision_timeout_secs <= 0 {
        return Err(EngineError::bad_request(
            "Missing or invalid TaskStartToCloseTimeoutSeconds.",
        ));
    }
    if request.request_id.is_empty() {
        return Err(EngineError::bad_request("Missing request ID."));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> StartWorkflowRequest {
        StartWorkflowRequest {
            domain_id: "d1".to_string(),
            workflow_id: "wf1".to_string(),
            workflow_type: "t".to_string(),
            task_list: "tl".to_string(),
            input: None,
            execution_timeout_secs: 100,
            decision_timeout_secs: 10,
            identity: "i".to_string(),
            request_id: "req-1".to_string(),
            reuse_policy: WorkflowIdReusePolicy::AllowDuplicate,
            parent: None,
        }
    }

    #[test]
    fn test_start_validation() {
        assert!(validate_start_request(&request()).is_ok());

        let mut bad = request();
        bad.task_list.clear();
        assert!(matches!(
            validate_start_request(&bad),
            Err(EngineError::BadRequest { .. })
        ));

        let mut bad = request();
        bad.execution_timeout_secs = 0;
        assert!(validate_start_request(&bad).is_err());

        let mut bad = request();
        bad.decision_timeout_secs = -5;
        assert!(validate_start_request(&bad).is_err());
    }
}
