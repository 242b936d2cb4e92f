// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shard context.
//!
//! Per-shard runtime state shared by the engine and the queue processors:
//! the monotonic transfer-task-ID sequence (also used as the history
//! transaction ID), queue ack checkpoints, per-cluster clocks, and the
//! commit-hook fanout that wakes the processors and the event notifier after
//! a successful persist.
//!
//! Commit hooks replace back-references from the persistence path to the
//! processors: the context publishes one [`CommitRecord`] per committed
//! mutation and every registered hook picks out what it cares about.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};

use chronik_types::task::TimerTask;

use crate::clock::Clock;
use crate::notifier::HistoryEventNotification;

/// What one committed mutation produced, for hook fanout.
#[derive(Debug, Default)]
pub struct CommitRecord {
    /// Whether transfer tasks were committed.
    pub transfer_tasks: bool,
    /// Timer tasks committed, so the timer processor can tighten its wake
    /// deadline.
    pub timer_tasks: Vec<TimerTask>,
    /// Whether replication tasks were committed.
    pub replication_tasks: bool,
    /// History-progress notification of the mutation.
    pub notification: Option<HistoryEventNotification>,
}

/// Subscriber to commit publications. Implementations override the callbacks
/// they care about.
pub trait CommitHooks: Send + Sync {
    /// Transfer tasks were committed.
    fn on_transfer_tasks(&self) {}

    /// Timer tasks were committed.
    fn on_timer_tasks(&self, _tasks: &[TimerTask]) {}

    /// Replication tasks were committed.
    fn on_replication_tasks(&self) {}

    /// History progressed for one run.
    fn on_history_event(&self, _notification: &HistoryEventNotification) {}
}

/// Per-shard runtime state.
pub struct ShardContext {
    shard_id: u32,
    current_cluster: String,
    clock: Arc<dyn Clock>,
    transfer_sequence: AtomicI64,
    transfer_ack_level: AtomicI64,
    cluster_transfer_ack: Mutex<HashMap<String, i64>>,
    replication_ack_level: AtomicI64,
    cluster_times: Mutex<HashMap<String, DateTime<Utc>>>,
    hooks: RwLock<Vec<Arc<dyn CommitHooks>>>,
}

impl ShardContext {
    /// New shard context with an empty sequence and zero ack levels.
    pub fn new(shard_id: u32, current_cluster: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            shard_id,
            current_cluster: current_cluster.into(),
            clock,
            transfer_sequence: AtomicI64::new(0),
            transfer_ack_level: AtomicI64::new(0),
            cluster_transfer_ack: Mutex::new(HashMap::new()),
            replication_ack_level: AtomicI64::new(0),
            cluster_times: Mutex::new(HashMap::new()),
            hooks: RwLock::new(Vec::new()),
        }
    }

    /// The shard this context serves.
    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    /// Name of the cluster this process runs in.
    pub fn current_cluster(&self) -> &str {
        &self.current_cluster
    }

    /// The shard's time source.
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Current time of the shard clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Draw the next transfer-task ID. The same sequence orders history
    /// transaction IDs; it is process-wide monotonic per shard.
    pub fn next_transfer_task_id(&self) -> i64 {
        self.transfer_sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Highest task ID issued so far; the exclusive upper bound of queue
    /// reads.
    pub fn transfer_max_read_level(&self) -> i64 {
        self.transfer_sequence.load(Ordering::SeqCst)
    }

    /// The shard's transfer-ack checkpoint (prefix of the log known
    /// processed by active and all standby processors).
    pub fn transfer_ack_level(&self) -> i64 {
        self.transfer_ack_level.load(Ordering::SeqCst)
    }

    /// Advance the transfer-ack checkpoint.
    pub fn update_transfer_ack_level(&self, ack_level: i64) {
        self.transfer_ack_level.fetch_max(ack_level, Ordering::SeqCst);
    }

    /// Per-cluster transfer ack level (standby processors).
    pub fn transfer_cluster_ack_level(&self, cluster: &str) -> i64 {
        let levels = self.cluster_transfer_ack.lock().unwrap();
        levels.get(cluster).copied().unwrap_or(0)
    }

    /// Advance a cluster's transfer ack level.
    pub fn update_transfer_cluster_ack_level(&self, cluster: &str, ack_level: i64) {
        let mut levels = self.cluster_transfer_ack.lock().unwrap();
        let entry = levels.entry(cluster.to_string()).or_insert(0);
        if ack_level > *entry {
            *entry = ack_level;
        }
    }

    /// Replication-queue ack level.
    pub fn replication_ack_level(&self) -> i64 {
        self.replication_ack_level.load(Ordering::SeqCst)
    }

    /// Advance the replication-queue ack level.
    pub fn update_replication_ack_level(&self, ack_level: i64) {
        self.replication_ack_level
            .fetch_max(ack_level, Ordering::SeqCst);
    }

    /// Current time of a cluster: the local clock for this cluster, the
    /// last reported remote time otherwise.
    pub fn cluster_current_time(&self, cluster: &str) -> DateTime<Utc> {
        if cluster == self.current_cluster {
            return self.now();
        }
        let times = self.cluster_times.lock().unwrap();
        times.get(cluster).copied().unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Record a remote cluster's reported time.
    pub fn set_cluster_current_time(&self, cluster: &str, time: DateTime<Utc>) {
        let mut times = self.cluster_times.lock().unwrap();
        let entry = times.entry(cluster.to_string()).or_insert(time);
        if time > *entry {
            *entry = time;
        }
    }

    /// Register a commit-hook subscriber (queue processor, notifier).
    pub fn register_hooks(&self, hooks: Arc<dyn CommitHooks>) {
        self.hooks.write().unwrap().push(hooks);
    }

    /// Fan a committed mutation out to all registered hooks.
    pub fn publish_commit(&self, record: &CommitRecord) {
        let hooks = self.hooks.read().unwrap();
        for hook in hooks.iter() {
            if record.transfer_tasks {
                hook.on_transfer_tasks();
            }
            if !record.timer_tasks.is_empty() {
                hook.on_timer_tasks(&record.timer_tasks);
            }
            if record.replication_tasks {
                hook.on_replication_tasks();
            }
            if let Some(notification) = &record.notification {
                hook.on_history_event(notification);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_transfer_sequence_is_monotonic() {
        let shard = ShardContext::new(1, "active", Arc::new(SystemClock));
        let a = shard.next_transfer_task_id();
        let b = shard.next_transfer_task_id();
        assert!(b > a);
        assert_eq!(shard.transfer_max_read_level(), b);
    }

    #[test]
    fn test_ack_levels_only_advance() {
        let shard = ShardContext::new(1, "active", Arc::new(SystemClock));
        shard.update_transfer_ack_level(10);
        shard.update_transfer_ack_level(5);
        assert_eq!(shard.transfer_ack_level(), 10);

        shard.update_transfer_cluster_ack_level("standby", 7);
        shard.update_transfer_cluster_ack_level("standby", 3);
        assert_eq!(shard.transfer_cluster_ack_level("standby"), 7);
    }

    #[test]
    fn test_commit_hooks_fanout() {
        struct CountingHooks {
            transfer: AtomicUsize,
            history: AtomicUsize,
        }
        impl CommitHooks for CountingHooks {
            fn on_transfer_tasks(&self) {
                self.transfer.fetch_add(1, Ordering::SeqCst);
            }
            fn on_history_event(&self, _notification: &HistoryEventNotification) {
                self.history.fetch_add(1, Ordering::SeqCst);
            }
        }

        let shard = ShardContext::new(1, "active", Arc::new(SystemClock));
        let hooks = Arc::new(CountingHooks {
            transfer: AtomicUsize::new(0),
            history: AtomicUsize::new(0),
        });
        shard.register_hooks(hooks.clone());

        shard.publish_commit(&CommitRecord {
            transfer_tasks: true,
            ..Default::default()
        });
        assert_eq!(hooks.transfer.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.history.load(Ordering::SeqCst), 0);
    }
}
