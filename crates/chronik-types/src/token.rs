// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Opaque task tokens.
//!
//! Workers receive a token with every dispatched decision/activity task and
//! echo it back on the respond calls. The engine treats the bytes as opaque
//! at the API edge; internally it is a JSON-encoded [`TaskToken`].

use serde::{Deserialize, Serialize};

use crate::EMPTY_EVENT_ID;

/// Contents of a task token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskToken {
    /// Workflow the task belongs to.
    pub workflow_id: String,
    /// Run the task belongs to.
    pub run_id: String,
    /// Event ID of the scheduled event, or [`EMPTY_EVENT_ID`] when the
    /// caller addresses an activity by ID instead.
    pub schedule_id: i64,
    /// Decision attempt the token was minted for; stale-attempt responds are
    /// rejected.
    pub schedule_attempt: i64,
    /// Activity ID, for the respond-by-activity-ID calls.
    pub activity_id: Option<String>,
}

impl TaskToken {
    /// Token for a decision task.
    pub fn for_decision(workflow_id: &str, run_id: &str, schedule_id: i64, attempt: i64) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            run_id: run_id.to_string(),
            schedule_id,
            schedule_attempt: attempt,
            activity_id: None,
        }
    }

    /// Token for an activity task.
    pub fn for_activity(
        workflow_id: &str,
        run_id: &str,
        schedule_id: i64,
        activity_id: &str,
    ) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            run_id: run_id.to_string(),
            schedule_id,
            schedule_attempt: 0,
            activity_id: Some(activity_id.to_string()),
        }
    }

    /// Whether the token addresses its task by activity ID rather than
    /// schedule ID.
    pub fn is_by_activity_id(&self) -> bool {
        self.schedule_id == EMPTY_EVENT_ID && self.activity_id.is_some()
    }

    /// Serialize to the opaque byte form handed to workers.
    pub fn serialize(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse the opaque byte form. Failure means the caller sent garbage and
    /// must be surfaced as a bad-request error.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_round_trip_is_identity() {
        let token = TaskToken::for_decision("wf1", "run-1", 2, 3);
        let bytes = token.serialize().unwrap();
        assert_eq!(TaskToken::deserialize(&bytes).unwrap(), token);

        let token = TaskToken::for_activity("wf1", "run-1", 5, "a1");
        let bytes = token.serialize().unwrap();
        assert_eq!(TaskToken::deserialize(&bytes).unwrap(), token);
    }

    #[test]
    fn test_garbage_token_rejected() {
        assert!(TaskToken::deserialize(b"not json").is_err());
        assert!(TaskToken::deserialize(b"{}").is_err());
    }

    #[test]
    fn test_by_activity_id_detection() {
        let mut token = TaskToken::for_activity("wf1", "run-1", EMPTY_EVENT_ID, "a1");
        assert!(token.is_by_activity_id());
        token.schedule_id = 5;
        assert!(!token.is_by_activity_id());
    }
}
