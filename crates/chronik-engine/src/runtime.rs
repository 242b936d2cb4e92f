// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for chronik-engine.
//!
//! This module provides [`HistoryRuntime`] which wires one shard's engine
//! and queue processors into an existing tokio application. There is no
//! transport here: callers embed the engine and map their RPC layer onto
//! its methods.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use chronik_engine::persistence::MemoryStore;
//! use chronik_engine::runtime::HistoryRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(MemoryStore::new());
//!     let runtime = HistoryRuntime::builder()
//!         .shard_id(1)
//!         .current_cluster("active")
//!         .execution_store(store.clone())
//!         .history_store(store.clone())
//!         .visibility_store(store)
//!         .matching(matching_client)
//!         .peer(peer_client)
//!         .domains(domain_registry)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... serve requests through runtime.engine() ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::clients::{DomainRegistry, MatchingClient, PeerHistoryClient, ReplicationProducer};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::engine::HistoryEngine;
use crate::persistence::{ExecutionStore, HistoryStore, VisibilityStore};
use crate::queues::replicator::ReplicatorQueueProcessor;
use crate::queues::timer::{TimerProcessorMode, TimerQueueProcessor};
use crate::queues::transfer::TransferQueueProcessor;
use crate::shard::ShardContext;

const DEFAULT_CACHE_CAPACITY: usize = 512;

/// Builder for creating a [`HistoryRuntime`].
pub struct HistoryRuntimeBuilder {
    shard_id: u32,
    current_cluster: String,
    standby_clusters: Vec<String>,
    cache_capacity: usize,
    config: Config,
    clock: Arc<dyn Clock>,
    execution_store: Option<Arc<dyn ExecutionStore>>,
    history_store: Option<Arc<dyn HistoryStore>>,
    visibility_store: Option<Arc<dyn VisibilityStore>>,
    matching: Option<Arc<dyn MatchingClient>>,
    peer: Option<Arc<dyn PeerHistoryClient>>,
    producer: Option<Arc<dyn ReplicationProducer>>,
    domains: Option<Arc<dyn DomainRegistry>>,
}

impl std::fmt::Debug for HistoryRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryRuntimeBuilder")
            .field("shard_id", &self.shard_id)
            .field("current_cluster", &self.current_cluster)
            .field("standby_clusters", &self.standby_clusters)
            .field("cache_capacity", &self.cache_capacity)
            .finish()
    }
}

impl Default for HistoryRuntimeBuilder {
    fn default() -> Self {
        Self {
            shard_id: 0,
            current_cluster: "active".to_string(),
            standby_clusters: Vec::new(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            config: Config::default(),
            clock: Arc::new(SystemClock),
            execution_store: None,
            history_store: None,
            visibility_store: None,
            matching: None,
            peer: None,
            producer: None,
            domains: None,
        }
    }
}

impl HistoryRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Shard this runtime serves.
    pub fn shard_id(mut self, shard_id: u32) -> Self {
        self.shard_id = shard_id;
        self
    }

    /// Name of the cluster this process runs in.
    pub fn current_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.current_cluster = cluster.into();
        self
    }

    /// Peer clusters to run standby pipelines for.
    pub fn standby_clusters(mut self, clusters: Vec<String>) -> Self {
        self.standby_clusters = clusters;
        self
    }

    /// Execution-cache capacity (idle contexts).
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Engine configuration; defaults are production values.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Time source; defaults to the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Execution store (required).
    pub fn execution_store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.execution_store = Some(store);
        self
    }

    /// History store (required).
    pub fn history_store(mut self, store: Arc<dyn HistoryStore>) -> Self {
        self.history_store = Some(store);
        self
    }

    /// Visibility store (required).
    pub fn visibility_store(mut self, store: Arc<dyn VisibilityStore>) -> Self {
        self.visibility_store = Some(store);
        self
    }

    /// Matching client (required).
    pub fn matching(mut self, matching: Arc<dyn MatchingClient>) -> Self {
        self.matching = Some(matching);
        self
    }

    /// Peer history client (required).
    pub fn peer(mut self, peer: Arc<dyn PeerHistoryClient>) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Replication producer; the replicator pipeline only runs when set.
    pub fn producer(mut self, producer: Arc<dyn ReplicationProducer>) -> Self {
        self.producer = Some(producer);
        self
    }

    /// Domain registry (required).
    pub fn domains(mut self, domains: Arc<dyn DomainRegistry>) -> Self {
        self.domains = Some(domains);
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required dependencies are missing.
    pub fn build(self) -> Result<HistoryRuntimeConfig> {
        let execution_store = self
            .execution_store
            .ok_or_else(|| anyhow::anyhow!("execution store is required"))?;
        let history_store = self
            .history_store
            .ok_or_else(|| anyhow::anyhow!("history store is required"))?;
        let visibility_store = self
            .visibility_store
            .ok_or_else(|| anyhow::anyhow!("visibility store is required"))?;
        let matching = self
            .matching
            .ok_or_else(|| anyhow::anyhow!("matching client is required"))?;
        let peer = self
            .peer
            .ok_or_else(|| anyhow::anyhow!("peer history client is required"))?;
        let domains = self
            .domains
            .ok_or_else(|| anyhow::anyhow!("domain registry is required"))?;

        Ok(HistoryRuntimeConfig {
            shard_id: self.shard_id,
            current_cluster: self.current_cluster,
            standby_clusters: self.standby_clusters,
            cache_capacity: self.cache_capacity,
            config: self.config,
            clock: self.clock,
            execution_store,
            history_store,
            visibility_store,
            matching,
            peer,
            producer: self.producer,
            domains,
        })
    }
}

impl std::fmt::Debug for HistoryRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryRuntimeConfig")
            .field("shard_id", &self.shard_id)
            .field("current_cluster", &self.current_cluster)
            .field("standby_clusters", &self.standby_clusters)
            .field("cache_capacity", &self.cache_capacity)
            .finish()
    }
}

/// Configuration for a [`HistoryRuntime`].
pub struct HistoryRuntimeConfig {
    shard_id: u32,
    current_cluster: String,
    standby_clusters: Vec<String>,
    cache_capacity: usize,
    config: Config,
    clock: Arc<dyn Clock>,
    execution_store: Arc<dyn ExecutionStore>,
    history_store: Arc<dyn HistoryStore>,
    visibility_store: Arc<dyn VisibilityStore>,
    matching: Arc<dyn MatchingClient>,
    peer: Arc<dyn PeerHistoryClient>,
    producer: Option<Arc<dyn ReplicationProducer>>,
    domains: Arc<dyn DomainRegistry>,
}

impl HistoryRuntimeConfig {
    /// Start the runtime: wire the engine, register the processors as
    /// commit hooks and spawn their loops.
    pub async fn start(self) -> Result<HistoryRuntime> {
        let shard = Arc::new(ShardContext::new(
            self.shard_id,
            self.current_cluster.clone(),
            self.clock,
        ));
        let config = Arc::new(self.config);
        let engine = HistoryEngine::new(
            shard.clone(),
            config.clone(),
            self.execution_store.clone(),
            self.history_store.clone(),
            self.visibility_store.clone(),
            self.domains.clone(),
            self.cache_capacity,
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();

        let transfer = TransferQueueProcessor::new(
            engine.clone(),
            self.execution_store.clone(),
            self.matching,
            self.peer,
            self.visibility_store,
            self.domains.clone(),
            &self.standby_clusters,
        );
        shard.register_hooks(transfer.clone());
        handles.extend(transfer.start(shutdown_rx.clone()));

        let timer = TimerQueueProcessor::new(
            engine.clone(),
            self.execution_store.clone(),
            TimerProcessorMode::Active,
        );
        shard.register_hooks(timer.clone());
        handles.push(timer.start(shutdown_rx.clone()));

        for cluster in &self.standby_clusters {
            let standby_timer = TimerQueueProcessor::new(
                engine.clone(),
                self.execution_store.clone(),
                TimerProcessorMode::Standby {
                    cluster: cluster.clone(),
                },
            );
            shard.register_hooks(standby_timer.clone());
            handles.push(standby_timer.start(shutdown_rx.clone()));
        }

        if let Some(producer) = self.producer {
            let replicator = ReplicatorQueueProcessor::new(
                shard.clone(),
                self.execution_store,
                self.history_store,
                producer,
                config.replicator_batch_size,
                config.replicator_poll_interval,
            );
            shard.register_hooks(replicator.clone());
            handles.push(replicator.start(shutdown_rx));
        }

        info!(shard_id = shard.shard_id(), "HistoryRuntime started");
        Ok(HistoryRuntime {
            engine,
            transfer,
            shutdown_tx,
            handles,
        })
    }
}

/// A running history shard that can be embedded in an application.
///
/// The runtime manages the queue-processor tasks; requests go through
/// [`engine`](Self::engine). Call [`shutdown`](Self::shutdown) for graceful
/// termination.
pub struct HistoryRuntime {
    engine: Arc<HistoryEngine>,
    transfer: Arc<TransferQueueProcessor>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl HistoryRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> HistoryRuntimeBuilder {
        HistoryRuntimeBuilder::new()
    }

    /// The engine serving this shard's requests.
    pub fn engine(&self) -> &Arc<HistoryEngine> {
        &self.engine
    }

    /// Run the active transfer pipeline for one domain after it failed over
    /// to this cluster.
    pub fn failover_domain(&self, domain_id: impl Into<String>) -> JoinHandle<()> {
        self.transfer.failover_domain(domain_id.into())
    }

    /// Gracefully shut down the processors and wait for them to stop.
    pub async fn shutdown(self) -> Result<()> {
        info!("HistoryRuntime shutting down...");
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            if let Err(err) = handle.await {
                error!(%err, "Queue processor task panicked");
            }
        }
        info!("HistoryRuntime shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::StaticDomainRegistry;
    use crate::error::Result as EngineResult;
    use crate::persistence::MemoryStore;
    use async_trait::async_trait;
    use chronik_types::request::*;
    use chronik_types::WorkflowRun;

    struct NoopMatching;

    #[async_trait]
    impl MatchingClient for NoopMatching {
        async fn add_decision_task(
            &self,
            _domain_id: &str,
            _task_list: &str,
            _workflow: &WorkflowRun,
            _schedule_id: i64,
        ) -> EngineResult<()> {
            Ok(())
        }

        async fn add_activity_task(
            &self,
            _source_domain_id: &str,
            _target_domain_id: &str,
            _task_list: &str,
            _workflow: &WorkflowRun,
            _schedule_id: i64,
            _schedule_to_start_timeout_secs: i32,
        ) -> EngineResult<()> {
            Ok(())
        }
    }

    struct NoopPeer;

    #[async_trait]
    impl PeerHistoryClient for NoopPeer {
        async fn request_cancel_workflow_execution(
            &self,
            _request: RequestCancelWorkflowRequest,
        ) -> EngineResult<()> {
            Ok(())
        }

        async fn signal_workflow_execution(
            &self,
            _request: SignalWorkflowRequest,
        ) -> EngineResult<()> {
            Ok(())
        }

        async fn start_workflow_execution(
            &self,
            request: StartWorkflowRequest,
        ) -> EngineResult<StartWorkflowResponse> {
            Ok(StartWorkflowResponse {
                run_id: format!("peer-run-for-{}", request.workflow_id),
            })
        }

        async fn schedule_decision_task(
            &self,
            _request: ScheduleDecisionTaskRequest,
        ) -> EngineResult<()> {
            Ok(())
        }

        async fn record_child_execution_completed(
            &self,
            _request: RecordChildExecutionCompletedRequest,
        ) -> EngineResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_builder_requires_stores() {
        let result = HistoryRuntimeBuilder::new().build();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("execution store is required"));
    }

    #[tokio::test]
    async fn test_runtime_start_and_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let runtime = HistoryRuntime::builder()
            .shard_id(7)
            .current_cluster("active")
            .execution_store(store.clone())
            .history_store(store.clone())
            .visibility_store(store)
            .matching(Arc::new(NoopMatching))
            .peer(Arc::new(NoopPeer))
            .domains(Arc::new(StaticDomainRegistry::local("active")))
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        assert_eq!(runtime.engine().shard().shard_id(), 7);
        runtime.shutdown().await.unwrap();
    }
}
