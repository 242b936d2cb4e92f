// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Chronik Engine - Per-Shard Workflow History Engine
//!
//! This crate is the history core of a durable workflow-orchestration
//! service: it serves the RPCs driving each workflow run's lifecycle,
//! appends event history and updates the derived mutable state under
//! optimistic concurrency, and transactionally enqueues the follow-on
//! transfer/timer/replication tasks that the queue processors dispatch.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        RPC layer (caller-owned)                     │
//! └─────────────────────────────────────────────────────────────────────┘
//!                                   │
//!                                   ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │  HistoryEngine                                                      │
//! │    workflow / decision / activity handlers                          │
//! │         │                                                           │
//! │         ▼                                                           │
//! │  ExecutionCache ──▶ ExecutionContext ──▶ MutableStateBuilder        │
//! │    (per-run lock)     (CAS persist)        (event-sourced state)    │
//! └──────────┬──────────────────┬───────────────────────────────────────┘
//!            │ commit hooks     │ atomic bundle
//!            ▼                  ▼
//! ┌──────────────────┐   ┌──────────────────────────────────────────────┐
//! │ Queue processors │   │ ExecutionStore / HistoryStore / Visibility   │
//! │ transfer / timer │   │ (in-memory or SQLite)                        │
//! │ / replicator     │   └──────────────────────────────────────────────┘
//! │ + event notifier │
//! └──────────────────┘
//! ```
//!
//! # The update loop
//!
//! Every mutating RPC follows one pattern: acquire the run's context from
//! the cache, load mutable state, apply the operation as pure state
//! manipulation, persist the history append plus the conditional
//! mutable-state update plus the new tasks atomically, and notify the
//! processors. On a compare-and-swap conflict the context is cleared and the
//! loop retries up to `Config::conditional_retry_count` times. External
//! dispatch (matching, peer shards) always happens after a successful
//! persist, never inside the loop.
//!
//! # Active / standby
//!
//! In multi-cluster deployments only the domain's active cluster performs
//! side-effects. Standby clusters run the same queues as replay verifiers:
//! a standby task is acknowledged only once replication has produced the
//! expected mutable-state footprint, and answers `TaskRetry` until then.
//!
//! # Modules
//!
//! - [`cache`]: bounded per-run context cache with exclusive acquisition
//! - [`clients`]: seams to matching, peer shards, replication, domains
//! - [`clock`]: time source (system and manual)
//! - [`config`]: engine tunables
//! - [`context`]: per-run persist logic and update condition
//! - [`engine`]: the request surface and the update loop
//! - [`error`]: error kinds the engine distinguishes
//! - [`mutable_state`]: the event-sourced state machine of one run
//! - [`notifier`]: history-progress pub/sub for long-pollers
//! - [`persistence`]: store traits, in-memory and SQLite backends
//! - [`queues`]: transfer/timer/replication processors
//! - [`runtime`]: embeddable wiring of one shard
//! - [`shard`]: shard context, task-ID sequence, commit hooks

#![deny(missing_docs)]

/// Bounded per-run context cache with exclusive acquisition.
pub mod cache;

/// Client seams to external collaborators.
pub mod clients;

/// Time source abstraction.
pub mod clock;

/// Engine configuration.
pub mod config;

/// Workflow-execution context: cached state plus atomic persist.
pub mod context;

/// The engine struct and the canonical update loop.
pub mod engine;

/// Error types for engine operations.
pub mod error;

/// Event-sourced mutable-state builder.
pub mod mutable_state;

/// History-event notifier for long-pollers.
pub mod notifier;

/// Persistence traits and backends.
pub mod persistence;

/// Transfer, timer and replication queue processors.
pub mod queues;

/// Embeddable per-shard runtime.
pub mod runtime;

/// Shard context and commit-hook fanout.
pub mod shard;

mod activity_handlers;
mod decision_handlers;
mod workflow_handlers;

pub use engine::HistoryEngine;
pub use error::{EngineError, Result};
pub use runtime::HistoryRuntime;
