// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transfer-queue processor.
//!
//! Umbrella over one active pipeline, one standby pipeline per peer cluster,
//! the completion loop that trims the acknowledged prefix of the transfer
//! log, and one-shot failover pipelines.
//!
//! The completion loop advances the shard's transfer-ack checkpoint to the
//! minimum of the active and all standby ack levels, so no standby ever
//! loses a task it has not yet verified.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::clients::{DomainRegistry, MatchingClient, PeerHistoryClient};
use crate::engine::HistoryEngine;
use crate::error::Result;
use crate::persistence::{ExecutionStore, VisibilityStore};
use crate::shard::CommitHooks;

use super::transfer_active::ActiveTransferTaskExecutor;
use super::transfer_standby::StandbyTransferTaskExecutor;
use super::{QueueProcessorOptions, TransferQueueProcessorBase};

/// Active + standby transfer pipelines and the completion loop of one shard.
pub struct TransferQueueProcessor {
    engine: Arc<HistoryEngine>,
    store: Arc<dyn ExecutionStore>,
    matching: Arc<dyn MatchingClient>,
    peer: Arc<dyn PeerHistoryClient>,
    visibility: Arc<dyn VisibilityStore>,
    domains: Arc<dyn DomainRegistry>,
    options: QueueProcessorOptions,
    active: Arc<TransferQueueProcessorBase>,
    standby: HashMap<String, Arc<TransferQueueProcessorBase>>,
}

impl TransferQueueProcessor {
    /// Build the pipelines: one active for the current cluster, one standby
    /// per name in `standby_clusters`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<HistoryEngine>,
        store: Arc<dyn ExecutionStore>,
        matching: Arc<dyn MatchingClient>,
        peer: Arc<dyn PeerHistoryClient>,
        visibility: Arc<dyn VisibilityStore>,
        domains: Arc<dyn DomainRegistry>,
        standby_clusters: &[String],
    ) -> Arc<Self> {
        let shard = engine.shard().clone();
        let config = engine.config().clone();
        let options = QueueProcessorOptions {
            batch_size: config.transfer_batch_size,
            worker_count: config.transfer_worker_count,
            poll_interval: config.transfer_poll_interval,
            max_retry_count: config.transfer_max_retry_count,
            retry_backoff: config.transfer_retry_backoff,
        };

        let active_executor = Arc::new(ActiveTransferTaskExecutor::new(
            engine.clone(),
            matching.clone(),
            peer.clone(),
            visibility.clone(),
            domains.clone(),
            shard.current_cluster().to_string(),
        ));
        let active = Arc::new(TransferQueueProcessorBase::new(
            shard.clone(),
            store.clone(),
            active_executor,
            options.clone(),
            shard.transfer_ack_level(),
        ));

        let mut standby = HashMap::new();
        for cluster in standby_clusters {
            let executor = Arc::new(StandbyTransferTaskExecutor::new(
                engine.clone(),
                visibility.clone(),
                domains.clone(),
                cluster.clone(),
            ));
            let options = QueueProcessorOptions {
                retry_backoff: config.standby_retry_backoff,
                ..options.clone()
            };
            standby.insert(
                cluster.clone(),
                Arc::new(TransferQueueProcessorBase::new(
                    shard.clone(),
                    store.clone(),
                    executor,
                    options,
                    shard.transfer_cluster_ack_level(cluster),
                )),
            );
        }

        Arc::new(Self {
            engine,
            store,
            matching,
            peer,
            visibility,
            domains,
            options,
            active,
            standby,
        })
    }

    /// Spawn the pipelines and the completion loop.
    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let active = self.active.clone();
        let active_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            active.run(active_shutdown).await;
        }));

        for processor in self.standby.values() {
            let processor = processor.clone();
            let standby_shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                processor.run(standby_shutdown).await;
            }));
        }

        let this = self.clone();
        handles.push(tokio::spawn(async move {
            this.complete_transfer_loop(shutdown).await;
        }));
        handles
    }

    /// Run the active pipeline for one domain only, catching it up after a
    /// failover to this cluster, before the regular active processor
    /// resumes responsibility for it.
    pub fn failover_domain(self: &Arc<Self>, domain_id: String) -> JoinHandle<()> {
        let shard = self.engine.shard().clone();
        let executor = Arc::new(
            ActiveTransferTaskExecutor::new(
                self.engine.clone(),
                self.matching.clone(),
                self.peer.clone(),
                self.visibility.clone(),
                self.domains.clone(),
                shard.current_cluster().to_string(),
            )
            .for_failover_domain(domain_id.clone()),
        );
        let processor = TransferQueueProcessorBase::new(
            shard.clone(),
            self.store.clone(),
            executor,
            self.options.clone(),
            shard.transfer_ack_level(),
        );
        let target_level = shard.transfer_max_read_level();
        info!(%domain_id, target_level, "Starting transfer failover processor");
        tokio::spawn(async move {
            if let Err(err) = processor.run_until_caught_up(target_level).await {
                warn!(%domain_id, %err, "Transfer failover processor failed");
            } else {
                info!(%domain_id, "Transfer failover processor caught up");
            }
        })
    }

    async fn complete_transfer_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let config = self.engine.config();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(config.transfer_complete_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        // Bring the checkpoint up to date before stopping.
                        let _ = self.complete_transfer().await;
                        return;
                    }
                }
            }
            for attempt in 0..config.transfer_complete_retry_count {
                match self.complete_transfer().await {
                    Ok(()) => break,
                    Err(err) => {
                        info!(attempt, %err, "Failed to complete transfer tasks");
                        tokio::time::sleep(std::time::Duration::from_millis(100 * (attempt as u64 + 1)))
                            .await;
                    }
                }
            }
        }
    }

    /// Trim the acknowledged prefix of the transfer log and advance the
    /// shard checkpoint.
    async fn complete_transfer(&self) -> Result<()> {
        let shard = self.engine.shard();
        let lower_ack_level = shard.transfer_ack_level();
        let mut upper_ack_level = self.active.ack_manager().ack_level();
        for (cluster, processor) in &self.standby {
            let level = processor.ack_manager().ack_level();
            shard.update_transfer_cluster_ack_level(cluster, level);
            if level < upper_ack_level {
                upper_ack_level = level;
            }
        }
        if lower_ack_level >= upper_ack_level {
            return Ok(());
        }

        let mut read_level = lower_ack_level;
        loop {
            let tasks = self
                .store
                .get_transfer_tasks(read_level, upper_ack_level, self.options.batch_size)
                .await?;
            if tasks.is_empty() {
                break;
            }
            let more = tasks.len() >= self.options.batch_size;
            for task in tasks {
                read_level = task.task_id;
                if let Err(err) = self.store.complete_transfer_task(task.task_id).await {
                    warn!(task_id = task.task_id, %err, "Unable to complete transfer task");
                }
            }
            if !more {
                break;
            }
        }
        shard.update_transfer_ack_level(upper_ack_level);
        Ok(())
    }
}

impl CommitHooks for TransferQueueProcessor {
    fn on_transfer_tasks(&self) {
        self.active.notify_new_task();
        for processor in self.standby.values() {
            processor.notify_new_task();
        }
    }
}
