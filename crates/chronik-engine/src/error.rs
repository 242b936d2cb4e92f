// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for chronik-engine.
//!
//! One variant per error kind the engine must distinguish. `Conflict` and
//! `StaleState` are recovered inside the update loop and must never escape
//! it; everything else is surfaced to callers unchanged.

use chronik_types::{CloseStatus, WorkflowState};
use std::fmt;

/// Result type using EngineError.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine errors surfaced by request handlers, stores and queue processors.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum EngineError {
    /// Input validation failed, a token or UUID could not be parsed.
    BadRequest {
        /// What was wrong with the request.
        message: String,
    },

    /// Workflow, decision or activity not found, or already terminal.
    EntityNotExists {
        /// What was missing.
        message: String,
    },

    /// A start collided with an existing run of the same workflow ID.
    WorkflowAlreadyStarted {
        /// Run ID of the existing run.
        run_id: String,
        /// Lifecycle state of the existing run.
        state: WorkflowState,
        /// Close status of the existing run.
        close_status: CloseStatus,
        /// Request ID the existing run was created with.
        start_request_id: String,
    },

    /// A decision/activity start arrived for a task already started under a
    /// different request ID.
    EventAlreadyStarted {
        /// Which start was redundant.
        message: String,
    },

    /// A cancel arrived while cancellation is already requested under a
    /// different request ID.
    CancellationAlreadyRequested,

    /// Optimistic-concurrency condition failed. Recovered by reloading and
    /// retrying inside the update loop.
    Conflict,

    /// Cached mutable state trails storage. Recovered by clearing the cache
    /// entry and retrying inside the update loop.
    StaleState,

    /// The update loop exhausted its retry budget.
    MaxAttemptsExceeded,

    /// A standby task's expected mutable-state footprint has not been
    /// replayed yet; the caller re-enqueues the task.
    TaskRetry,

    /// Invariant violation or unreachable code.
    Internal {
        /// What went wrong.
        message: String,
    },

    /// A storage operation failed.
    Store {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
        /// Whether retrying the operation may succeed.
        transient: bool,
    },

    /// The caller canceled the request before it completed. Cancellation
    /// during a persist is an unknown outcome.
    Canceled,

    /// The engine or a processor is shutting down.
    ShuttingDown,
}

impl EngineError {
    /// Bad-request error from anything printable.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    /// Entity-not-exists error from anything printable.
    pub fn not_exists(message: impl Into<String>) -> Self {
        Self::EntityNotExists {
            message: message.into(),
        }
    }

    /// Internal-service error from anything printable.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Transient storage error; the `…_with_retry` wrappers retry these.
    pub fn transient_store(operation: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            details: details.into(),
            transient: true,
        }
    }

    /// Get the error code string for this error kind.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => "BAD_REQUEST",
            Self::EntityNotExists { .. } => "ENTITY_NOT_EXISTS",
            Self::WorkflowAlreadyStarted { .. } => "WORKFLOW_ALREADY_STARTED",
            Self::EventAlreadyStarted { .. } => "EVENT_ALREADY_STARTED",
            Self::CancellationAlreadyRequested => "CANCELLATION_ALREADY_REQUESTED",
            Self::Conflict => "CONFLICT",
            Self::StaleState => "STALE_STATE",
            Self::MaxAttemptsExceeded => "MAX_ATTEMPTS_EXCEEDED",
            Self::TaskRetry => "TASK_RETRY",
            Self::Internal { .. } => "INTERNAL_SERVICE_ERROR",
            Self::Store { .. } => "STORE_ERROR",
            Self::Canceled => "REQUEST_CANCELED",
            Self::ShuttingDown => "SHUTTING_DOWN",
        }
    }

    /// Whether a storage retry wrapper may retry the operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store { transient: true, .. })
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadRequest { message } => write!(f, "Bad request: {}", message),
            Self::EntityNotExists { message } => write!(f, "{}", message),
            Self::WorkflowAlreadyStarted { run_id, .. } => {
                write!(f, "Workflow execution already started. RunId: {}", run_id)
            }
            Self::EventAlreadyStarted { message } => write!(f, "{}", message),
            Self::CancellationAlreadyRequested => {
                write!(f, "Cancellation already requested for this workflow execution")
            }
            Self::Conflict => write!(f, "Conditional update failed"),
            Self::StaleState => {
                write!(f, "Cached mutable state could potentially be stale")
            }
            Self::MaxAttemptsExceeded => {
                write!(f, "Maximum attempts exceeded to update history")
            }
            Self::TaskRetry => {
                write!(f, "Standby task should retry: mutable state condition not met")
            }
            Self::Internal { message } => write!(f, "Internal service error: {}", message),
            Self::Store {
                operation, details, ..
            } => write!(f, "Store error during '{}': {}", operation, details),
            Self::Canceled => write!(f, "Request canceled by caller"),
            Self::ShuttingDown => write!(f, "Shutting down"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        let transient = matches!(
            err,
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
        );
        EngineError::Store {
            operation: "query".to_string(),
            details: err.to_string(),
            transient,
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Store {
            operation: "serialize".to_string(),
            details: err.to_string(),
            transient: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let cases: Vec<(EngineError, &str)> = vec![
            (EngineError::bad_request("x"), "BAD_REQUEST"),
            (EngineError::not_exists("x"), "ENTITY_NOT_EXISTS"),
            (
                EngineError::WorkflowAlreadyStarted {
                    run_id: "r".to_string(),
                    state: WorkflowState::Running,
                    close_status: CloseStatus::None,
                    start_request_id: "q".to_string(),
                },
                "WORKFLOW_ALREADY_STARTED",
            ),
            (EngineError::Conflict, "CONFLICT"),
            (EngineError::StaleState, "STALE_STATE"),
            (EngineError::MaxAttemptsExceeded, "MAX_ATTEMPTS_EXCEEDED"),
            (EngineError::TaskRetry, "TASK_RETRY"),
            (EngineError::internal("x"), "INTERNAL_SERVICE_ERROR"),
        ];
        for (error, code) in cases {
            assert_eq!(error.error_code(), code, "{:?}", error);
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(EngineError::transient_store("put", "io").is_transient());
        assert!(!EngineError::Store {
            operation: "put".to_string(),
            details: "corrupt".to_string(),
            transient: false,
        }
        .is_transient());
        assert!(!EngineError::Conflict.is_transient());
    }
}
