// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queue processors.
//!
//! The transfer, timer and replication logs are drained by background
//! processors sharing one skeleton: a poll loop woken by commit hooks or a
//! poll interval, a bounded batch read, a worker pool dispatching tasks, and
//! an ack manager tracking the contiguous processed prefix.
//!
//! Processing order is ascending task ID at start-of-processing; completion
//! order is not guaranteed, which is why acks go through the prefix
//! computation instead of a high-water mark.

pub mod replicator;
pub mod timer;
pub mod transfer;
pub mod transfer_active;
pub mod transfer_standby;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use chronik_types::task::TransferTask;

use crate::error::{EngineError, Result};
use crate::persistence::ExecutionStore;
use crate::shard::ShardContext;

/// Tuning of one queue-processor instance.
#[derive(Debug, Clone)]
pub struct QueueProcessorOptions {
    /// Max tasks read per poll.
    pub batch_size: usize,
    /// Concurrent dispatch workers.
    pub worker_count: usize,
    /// Poll interval when no commit wakes the loop earlier.
    pub poll_interval: Duration,
    /// Per-task retry budget.
    pub max_retry_count: usize,
    /// Base backoff between per-task retries; grows linearly per attempt.
    pub retry_backoff: Duration,
}

/// Tracks outstanding task IDs and exposes the contiguous acknowledged
/// prefix as the ack level.
pub struct QueueAckManager {
    state: Mutex<AckState>,
}

struct AckState {
    read_level: i64,
    ack_level: i64,
    outstanding: BTreeMap<i64, bool>,
}

impl QueueAckManager {
    /// Manager resuming from a persisted ack level.
    pub fn new(ack_level: i64) -> Self {
        Self {
            state: Mutex::new(AckState {
                read_level: ack_level,
                ack_level,
                outstanding: BTreeMap::new(),
            }),
        }
    }

    /// Highest task ID handed out for processing; queue reads resume here.
    pub fn read_level(&self) -> i64 {
        self.state.lock().unwrap().read_level
    }

    /// Register a task as outstanding before dispatch.
    pub fn track(&self, task_id: i64) {
        let mut state = self.state.lock().unwrap();
        state.outstanding.insert(task_id, false);
        if task_id > state.read_level {
            state.read_level = task_id;
        }
    }

    /// Mark a task processed.
    pub fn complete(&self, task_id: i64) {
        let mut state = self.state.lock().unwrap();
        if let Some(done) = state.outstanding.get_mut(&task_id) {
            *done = true;
        }
    }

    /// Advance over the acknowledged prefix and return the ack level: every
    /// task at or below it has been processed.
    pub fn ack_level(&self) -> i64 {
        let mut state = self.state.lock().unwrap();
        while let Some((&task_id, &done)) = state.outstanding.iter().next() {
            if !done {
                break;
            }
            state.outstanding.remove(&task_id);
            state.ack_level = task_id;
        }
        state.ack_level
    }
}

/// What one transfer processor does with a task.
#[async_trait]
pub trait TransferTaskExecutor: Send + Sync {
    /// Processor name for logs.
    fn name(&self) -> &'static str;

    /// Whether the task belongs to this processor. Rejected tasks are acked
    /// without executing.
    fn accepts(&self, task: &TransferTask) -> bool;

    /// Perform (active) or verify (standby) the task's dispatch.
    ///
    /// `EntityNotExists` acks the task (tombstone), `TaskRetry` re-runs it
    /// after a delay, anything else retries with backoff.
    async fn execute(&self, task: &TransferTask) -> Result<()>;
}

/// Shared skeleton of the active/standby/failover transfer processors:
/// batch reads from the transfer log, worker-pool dispatch, prefix acks.
pub struct TransferQueueProcessorBase {
    shard: Arc<ShardContext>,
    store: Arc<dyn ExecutionStore>,
    executor: Arc<dyn TransferTaskExecutor>,
    ack: Arc<QueueAckManager>,
    options: QueueProcessorOptions,
    notify: Arc<Notify>,
}

impl TransferQueueProcessorBase {
    /// Processor resuming from `ack_level`.
    pub fn new(
        shard: Arc<ShardContext>,
        store: Arc<dyn ExecutionStore>,
        executor: Arc<dyn TransferTaskExecutor>,
        options: QueueProcessorOptions,
        ack_level: i64,
    ) -> Self {
        Self {
            shard,
            store,
            executor,
            ack: Arc::new(QueueAckManager::new(ack_level)),
            options,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Wake the poll loop; called from commit hooks.
    pub fn notify_new_task(&self) {
        self.notify.notify_one();
    }

    /// This processor's ack manager (the completion loop reads it).
    pub fn ack_manager(&self) -> Arc<QueueAckManager> {
        self.ack.clone()
    }

    /// Run until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        debug!(processor = self.executor.name(), "Transfer queue processor started");
        loop {
            let more = match self.process_batch().await {
                Ok(more) => more,
                Err(err) => {
                    warn!(processor = self.executor.name(), %err, "Transfer batch failed");
                    false
                }
            };
            if more {
                continue;
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.options.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(processor = self.executor.name(), "Transfer queue processor stopped");
    }

    /// Drain the failover backlog captured at failover time: process until
    /// nothing below `target_level` remains unread.
    pub async fn run_until_caught_up(&self, target_level: i64) -> Result<()> {
        loop {
            let more = self.process_batch().await?;
            if !more || self.ack.read_level() >= target_level {
                return Ok(());
            }
        }
    }

    /// Read and dispatch one batch. Returns whether a full batch was read
    /// (more work is likely waiting).
    async fn process_batch(&self) -> Result<bool> {
        let read_level = self.ack.read_level();
        let max_read_level = self.shard.transfer_max_read_level();
        let tasks = self
            .store
            .get_transfer_tasks(read_level, max_read_level, self.options.batch_size)
            .await?;
        if tasks.is_empty() {
            return Ok(false);
        }
        let full_batch = tasks.len() >= self.options.batch_size;

        let workers = Arc::new(Semaphore::new(self.options.worker_count));
        let mut join_set = JoinSet::new();
        for task in tasks {
            self.ack.track(task.task_id);
            if !self.executor.accepts(&task) {
                self.ack.complete(task.task_id);
                continue;
            }
            let executor = self.executor.clone();
            let ack = self.ack.clone();
            let workers = workers.clone();
            let options = self.options.clone();
            join_set.spawn(async move {
                let _permit = workers.acquire_owned().await.expect("semaphore open");
                process_one(executor.as_ref(), &ack, &task, &options).await;
            });
        }
        while join_set.join_next().await.is_some() {}
        Ok(full_batch)
    }
}

/// Dispatch one task with the retry policy of the processor.
async fn process_one(
    executor: &dyn TransferTaskExecutor,
    ack: &QueueAckManager,
    task: &TransferTask,
    options: &QueueProcessorOptions,
) {
    for attempt in 0..=options.max_retry_count {
        match executor.execute(task).await {
            Ok(()) => {
                ack.complete(task.task_id);
                return;
            }
            Err(EngineError::EntityNotExists { .. }) => {
                // The run is gone; the task is a tombstone.
                ack.complete(task.task_id);
                return;
            }
            Err(EngineError::TaskRetry) => {
                debug!(
                    processor = executor.name(),
                    task_id = task.task_id,
                    task_type = task.kind.task_type(),
                    attempt,
                    "Task condition not met yet, retrying"
                );
                tokio::time::sleep(options.retry_backoff).await;
            }
            Err(err) => {
                warn!(
                    processor = executor.name(),
                    task_id = task.task_id,
                    task_type = task.kind.task_type(),
                    attempt,
                    %err,
                    "Task dispatch failed"
                );
                tokio::time::sleep(options.retry_backoff * (attempt as u32 + 1)).await;
            }
        }
    }
    warn!(
        processor = executor.name(),
        task_id = task.task_id,
        "Task retry budget exhausted; leaving unacknowledged"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_level_advances_over_contiguous_prefix() {
        let ack = QueueAckManager::new(0);
        ack.track(1);
        ack.track(2);
        ack.track(3);

        // Completing out of order does not advance past the gap.
        ack.complete(2);
        ack.complete(3);
        assert_eq!(ack.ack_level(), 0);

        ack.complete(1);
        assert_eq!(ack.ack_level(), 3);
        assert_eq!(ack.read_level(), 3);
    }

    #[test]
    fn test_ack_manager_resumes_from_checkpoint() {
        let ack = QueueAckManager::new(42);
        assert_eq!(ack.read_level(), 42);
        assert_eq!(ack.ack_level(), 42);
        ack.track(43);
        ack.complete(43);
        assert_eq!(ack.ack_level(), 43);
    }
}
