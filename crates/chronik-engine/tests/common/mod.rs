// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for chronik-engine integration tests.
//!
//! Provides a TestContext wiring an engine over the in-memory store with
//! recording client fakes and a manually driven clock.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use chronik_engine::clients::{MatchingClient, PeerHistoryClient, StaticDomainRegistry};
use chronik_engine::clock::ManualClock;
use chronik_engine::config::Config;
use chronik_engine::engine::HistoryEngine;
use chronik_engine::error::Result;
use chronik_engine::persistence::MemoryStore;
use chronik_engine::shard::ShardContext;
use chronik_types::request::*;
use chronik_types::{WorkflowIdReusePolicy, WorkflowRun};

/// One recorded matching dispatch.
#[derive(Clone, Debug, PartialEq)]
pub enum MatchingCall {
    DecisionTask {
        task_list: String,
        workflow_id: String,
        schedule_id: i64,
    },
    ActivityTask {
        target_domain_id: String,
        task_list: String,
        workflow_id: String,
        schedule_id: i64,
    },
}

/// Matching client recording every dispatch.
#[derive(Default)]
pub struct RecordingMatchingClient {
    pub calls: Mutex<Vec<MatchingCall>>,
}

#[async_trait]
impl MatchingClient for RecordingMatchingClient {
    async fn add_decision_task(
        &self,
        _domain_id: &str,
        task_list: &str,
        workflow: &WorkflowRun,
        schedule_id: i64,
    ) -> Result<()> {
        self.calls.lock().unwrap().push(MatchingCall::DecisionTask {
            task_list: task_list.to_string(),
            workflow_id: workflow.workflow_id.clone(),
            schedule_id,
        });
        Ok(())
    }

    async fn add_activity_task(
        &self,
        _source_domain_id: &str,
        target_domain_id: &str,
        task_list: &str,
        workflow: &WorkflowRun,
        schedule_id: i64,
        _schedule_to_start_timeout_secs: i32,
    ) -> Result<()> {
        self.calls.lock().unwrap().push(MatchingCall::ActivityTask {
            target_domain_id: target_domain_id.to_string(),
            task_list: task_list.to_string(),
            workflow_id: workflow.workflow_id.clone(),
            schedule_id,
        });
        Ok(())
    }
}

/// Peer history client recording every cross-workflow call.
#[derive(Default)]
pub struct RecordingPeerClient {
    pub cancels: Mutex<Vec<RequestCancelWorkflowRequest>>,
    pub signals: Mutex<Vec<SignalWorkflowRequest>>,
    pub starts: Mutex<Vec<StartWorkflowRequest>>,
    pub scheduled_decisions: Mutex<Vec<ScheduleDecisionTaskRequest>>,
    pub child_completions: Mutex<Vec<RecordChildExecutionCompletedRequest>>,
}

#[async_trait]
impl PeerHistoryClient for RecordingPeerClient {
    async fn request_cancel_workflow_execution(
        &self,
        request: RequestCancelWorkflowRequest,
    ) -> Result<()> {
        self.cancels.lock().unwrap().push(request);
        Ok(())
    }

    async fn signal_workflow_execution(&self, request: SignalWorkflowRequest) -> Result<()> {
        self.signals.lock().unwrap().push(request);
        Ok(())
    }

    async fn start_workflow_execution(
        &self,
        request: StartWorkflowRequest,
    ) -> Result<StartWorkflowResponse> {
        let run_id = uuid::Uuid::new_v4().to_string();
        self.starts.lock().unwrap().push(request);
        Ok(StartWorkflowResponse { run_id })
    }

    async fn schedule_decision_task(&self, request: ScheduleDecisionTaskRequest) -> Result<()> {
        self.scheduled_decisions.lock().unwrap().push(request);
        Ok(())
    }

    async fn record_child_execution_completed(
        &self,
        request: RecordChildExecutionCompletedRequest,
    ) -> Result<()> {
        self.child_completions.lock().unwrap().push(request);
        Ok(())
    }
}

/// Engine over the in-memory store, without background processors, so tests
/// drive every transition explicitly.
pub struct TestContext {
    pub store: Arc<MemoryStore>,
    pub shard: Arc<ShardContext>,
    pub engine: Arc<HistoryEngine>,
    pub clock: Arc<ManualClock>,
    pub matching: Arc<RecordingMatchingClient>,
    pub peer: Arc<RecordingPeerClient>,
    pub domains: Arc<StaticDomainRegistry>,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        ));
        let store = Arc::new(MemoryStore::new());
        let shard = Arc::new(ShardContext::new(1, "active", clock.clone()));
        let domains = Arc::new(StaticDomainRegistry::local("active"));
        let engine = HistoryEngine::new(
            shard.clone(),
            Arc::new(config),
            store.clone(),
            store.clone(),
            store.clone(),
            domains.clone(),
            64,
        );
        Self {
            store,
            shard,
            engine,
            clock,
            matching: Arc::new(RecordingMatchingClient::default()),
            peer: Arc::new(RecordingPeerClient::default()),
            domains,
        }
    }

    /// Default start request for "wfA": timeout 100s, decision timeout 200s.
    pub fn start_request(&self, workflow_id: &str, request_id: &str) -> StartWorkflowRequest {
        StartWorkflowRequest {
            domain_id: "test-domain".to_string(),
            workflow_id: workflow_id.to_string(),
            workflow_type: "order-processing".to_string(),
            task_list: "default".to_string(),
            input: Some(b"{}".to_vec()),
            execution_timeout_secs: 100,
            decision_timeout_secs: 200,
            identity: "tester".to_string(),
            request_id: request_id.to_string(),
            reuse_policy: WorkflowIdReusePolicy::AllowDuplicate,
            parent: None,
        }
    }

    /// Start a workflow and return its run.
    pub async fn start_workflow(&self, workflow_id: &str) -> WorkflowRun {
        let response = self
            .engine
            .start_workflow_execution(self.start_request(workflow_id, "start-req-1"))
            .await
            .expect("start workflow");
        WorkflowRun::new("test-domain", workflow_id, response.run_id)
    }

    /// Start a workflow and record its first decision as started.
    pub async fn start_workflow_with_decision(&self, workflow_id: &str) -> (WorkflowRun, i64) {
        let workflow = self.start_workflow(workflow_id).await;
        let response = self
            .engine
            .record_decision_task_started(RecordDecisionTaskStartedRequest {
                domain_id: workflow.domain_id.clone(),
                workflow_id: workflow.workflow_id.clone(),
                run_id: workflow.run_id.clone(),
                schedule_id: 2,
                task_id: 1,
                request_id: "poll-1".to_string(),
                identity: "worker".to_string(),
            })
            .await
            .expect("record decision started");
        (workflow, response.started_event_id)
    }

    /// All transfer tasks currently in the log.
    pub async fn transfer_tasks(&self) -> Vec<chronik_types::task::TransferTask> {
        use chronik_engine::persistence::ExecutionStore;
        self.store
            .get_transfer_tasks(0, i64::MAX, 1000)
            .await
            .expect("read transfer tasks")
    }

    /// All timer tasks currently in the log.
    pub async fn timer_tasks(&self) -> Vec<chronik_types::task::TimerTask> {
        use chronik_engine::persistence::ExecutionStore;
        self.store
            .get_timer_tasks(chrono::DateTime::<Utc>::MAX_UTC, 1000)
            .await
            .expect("read timer tasks")
    }

    /// Full history of a run.
    pub async fn history(&self, workflow: &WorkflowRun) -> Vec<chronik_types::event::HistoryEvent> {
        use chronik_engine::persistence::HistoryStore;
        self.store
            .get_workflow_execution_history(workflow, 1, i64::MAX)
            .await
            .expect("read history")
    }

    /// Stored mutable-state record of a run.
    pub async fn mutable_state(
        &self,
        workflow: &WorkflowRun,
    ) -> chronik_engine::persistence::WorkflowMutableStateRecord {
        use chronik_engine::persistence::ExecutionStore;
        self.store
            .get_workflow_execution(
                &workflow.domain_id,
                &workflow.workflow_id,
                &workflow.run_id,
            )
            .await
            .expect("read mutable state")
    }
}
