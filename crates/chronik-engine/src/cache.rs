// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution cache.
//!
//! Bounded map of run identity to [`ExecutionContext`] with per-key
//! exclusive acquisition: one holder per run at a time, so all operations
//! against a run serialize on its context. Waiting acquirers are cancel-safe
//! (dropping the future abandons the wait).
//!
//! Releasing is RAII: [`AcquiredContext::release`] keeps the cached state
//! for the next acquirer; dropping the guard without releasing (the error
//! path) clears it so the next acquirer reloads from storage. Eviction is
//! LRU and never touches a slot whose context is currently held.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

use chronik_types::WorkflowRun;

use crate::context::ExecutionContext;
use crate::persistence::{ExecutionStore, HistoryStore, RetryPolicy};
use crate::shard::ShardContext;

struct CacheSlot {
    context: Arc<tokio::sync::Mutex<ExecutionContext>>,
    last_access: u64,
}

struct CacheState {
    slots: HashMap<WorkflowRun, CacheSlot>,
    access_counter: u64,
}

/// Bounded keyed cache of workflow-execution contexts.
pub struct ExecutionCache {
    capacity: usize,
    shard: Arc<ShardContext>,
    execution_store: Arc<dyn ExecutionStore>,
    history_store: Arc<dyn HistoryStore>,
    retry_policy: RetryPolicy,
    state: Mutex<CacheState>,
}

impl ExecutionCache {
    /// Cache holding at most `capacity` idle contexts; held contexts are
    /// pinned and never evicted.
    pub fn new(
        capacity: usize,
        shard: Arc<ShardContext>,
        execution_store: Arc<dyn ExecutionStore>,
        history_store: Arc<dyn HistoryStore>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            capacity,
            shard,
            execution_store,
            history_store,
            retry_policy,
            state: Mutex::new(CacheState {
                slots: HashMap::new(),
                access_counter: 0,
            }),
        }
    }

    /// Acquire the context for one run, waiting while another holder has it.
    pub async fn acquire(&self, workflow: &WorkflowRun) -> AcquiredContext {
        let context = {
            let mut state = self.state.lock().unwrap();
            state.access_counter += 1;
            let access = state.access_counter;
            let slot = state.slots.entry(workflow.clone()).or_insert_with(|| {
                CacheSlot {
                    context: Arc::new(tokio::sync::Mutex::new(ExecutionContext::new(
                        workflow.clone(),
                        self.shard.clone(),
                        self.execution_store.clone(),
                        self.history_store.clone(),
                        self.retry_policy,
                    ))),
                    last_access: access,
                }
            });
            slot.last_access = access;
            let context = slot.context.clone();
            self.evict_locked(&mut state);
            context
        };

        let guard = context.lock_owned().await;
        AcquiredContext {
            guard,
            released: false,
        }
    }

    /// Number of cached contexts, for tests and introspection.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().slots.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_locked(&self, state: &mut CacheState) {
        while state.slots.len() > self.capacity {
            // Only the map holds an unpinned slot's context.
            let victim = state
                .slots
                .iter()
                .filter(|(_, slot)| Arc::strong_count(&slot.context) == 1)
                .min_by_key(|(_, slot)| slot.last_access)
                .map(|(workflow, _)| workflow.clone());
            match victim {
                Some(workflow) => {
                    state.slots.remove(&workflow);
                }
                None => break,
            }
        }
    }
}

/// Exclusive hold on one run's context.
///
/// Call [`release`](Self::release) after a clean pass to keep the cached
/// state warm. Dropping without releasing clears it, which is exactly what
/// error paths propagating with `?` want.
pub struct AcquiredContext {
    guard: OwnedMutexGuard<ExecutionContext>,
    released: bool,
}

impl AcquiredContext {
    /// Release cleanly, keeping the cached mutable state for the next
    /// acquirer.
    pub fn release(mut self) {
        self.released = true;
    }
}

impl Deref for AcquiredContext {
    type Target = ExecutionContext;

    fn deref(&self) -> &ExecutionContext {
        &self.guard
    }
}

impl DerefMut for AcquiredContext {
    fn deref_mut(&mut self) -> &mut ExecutionContext {
        &mut self.guard
    }
}

impl Drop for AcquiredContext {
    fn drop(&mut self) {
        if !self.released {
            self.guard.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::persistence::MemoryStore;
    use std::time::Duration;

    fn test_cache(capacity: usize) -> ExecutionCache {
        let shard = Arc::new(ShardContext::new(1, "active", Arc::new(SystemClock)));
        let store = Arc::new(MemoryStore::new());
        ExecutionCache::new(
            capacity,
            shard,
            store.clone(),
            store,
            RetryPolicy {
                max_attempts: 1,
                initial_backoff: Duration::from_millis(1),
            },
        )
    }

    #[tokio::test]
    async fn test_per_key_exclusion() {
        let cache = Arc::new(test_cache(10));
        let workflow = WorkflowRun::new("d1", "wf1", "run-1");

        let held = cache.acquire(&workflow).await;

        // A second acquirer must wait until the first releases.
        let contender = {
            let cache = cache.clone();
            let workflow = workflow.clone();
            tokio::spawn(async move {
                let ctx = cache.acquire(&workflow).await;
                ctx.release();
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        held.release();
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .expect("contender acquires after release")
            .unwrap();
    }

    #[tokio::test]
    async fn test_distinct_runs_do_not_block_each_other() {
        let cache = test_cache(10);
        let first = cache.acquire(&WorkflowRun::new("d1", "wf1", "run-1")).await;
        let second = cache.acquire(&WorkflowRun::new("d1", "wf1", "run-2")).await;
        first.release();
        second.release();
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_lru_eviction_skips_held_entries() {
        let cache = test_cache(1);
        let pinned = cache.acquire(&WorkflowRun::new("d1", "wf1", "run-1")).await;

        // The held entry is pinned, so the cache grows past capacity.
        let other = cache.acquire(&WorkflowRun::new("d1", "wf1", "run-2")).await;
        other.release();
        assert_eq!(cache.len(), 2);

        pinned.release();
        // With both idle, the next acquisition evicts down to capacity.
        let third = cache.acquire(&WorkflowRun::new("d1", "wf1", "run-3")).await;
        third.release();
        assert!(cache.len() <= 2);
    }
}
