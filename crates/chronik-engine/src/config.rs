// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine configuration.
//!
//! All tunables carry production defaults; `Config::from_env` overrides the
//! ones most often adjusted per deployment.

use std::time::Duration;

/// History engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Retry budget of the optimistic-concurrency update loop.
    pub conditional_retry_count: usize,
    /// How long a GetMutableState long-poll waits before returning the
    /// current snapshot.
    pub long_poll_expiration: Duration,
    /// Max transfer tasks read per queue poll.
    pub transfer_batch_size: usize,
    /// Concurrent workers dispatching transfer tasks.
    pub transfer_worker_count: usize,
    /// Transfer queue poll interval when no commit wakes it earlier.
    pub transfer_poll_interval: Duration,
    /// How often the transfer processors persist their ack levels.
    pub transfer_update_ack_interval: Duration,
    /// Per-task retry budget of the active transfer processor.
    pub transfer_max_retry_count: usize,
    /// Backoff between transfer task retries.
    pub transfer_retry_backoff: Duration,
    /// Interval of the completion loop that trims the acknowledged prefix of
    /// the transfer log.
    pub transfer_complete_interval: Duration,
    /// Retry budget of one completion-loop round.
    pub transfer_complete_retry_count: usize,
    /// How far the active cluster's clock must be ahead of a task before a
    /// standby processor looks at it.
    pub standby_task_delay: Duration,
    /// Backoff between standby verification retries of one task.
    pub standby_retry_backoff: Duration,
    /// Max timer tasks read per queue poll.
    pub timer_batch_size: usize,
    /// Timer queue poll interval when no commit wakes it earlier.
    pub timer_poll_interval: Duration,
    /// Max replication tasks read per poll.
    pub replicator_batch_size: usize,
    /// Replication queue poll interval when no commit wakes it earlier.
    pub replicator_poll_interval: Duration,
    /// Retry budget of the transient-store-error retry wrapper.
    pub store_retry_count: usize,
    /// Initial backoff of the transient-store-error retry wrapper; doubles
    /// per attempt with jitter.
    pub store_retry_initial_backoff: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            conditional_retry_count: 5,
            long_poll_expiration: Duration::from_secs(20),
            transfer_batch_size: 10,
            transfer_worker_count: 10,
            transfer_poll_interval: Duration::from_secs(60),
            transfer_update_ack_interval: Duration::from_secs(5),
            transfer_max_retry_count: 10,
            transfer_retry_backoff: Duration::from_millis(100),
            transfer_complete_interval: Duration::from_secs(60),
            transfer_complete_retry_count: 3,
            standby_task_delay: Duration::from_secs(300),
            standby_retry_backoff: Duration::from_millis(200),
            timer_batch_size: 10,
            timer_poll_interval: Duration::from_secs(5),
            replicator_batch_size: 25,
            replicator_poll_interval: Duration::from_secs(30),
            store_retry_count: 5,
            store_retry_initial_backoff: Duration::from_millis(50),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to the
    /// defaults above.
    ///
    /// Recognized variables:
    /// - `CHRONIK_CONDITIONAL_RETRY_COUNT`
    /// - `CHRONIK_LONG_POLL_EXPIRATION_SECS`
    /// - `CHRONIK_TRANSFER_BATCH_SIZE`
    /// - `CHRONIK_TRANSFER_WORKER_COUNT`
    /// - `CHRONIK_TIMER_BATCH_SIZE`
    /// - `CHRONIK_STANDBY_TASK_DELAY_SECS`
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = parse_env::<usize>("CHRONIK_CONDITIONAL_RETRY_COUNT")? {
            config.conditional_retry_count = v;
        }
        if let Some(v) = parse_env::<u64>("CHRONIK_LONG_POLL_EXPIRATION_SECS")? {
            config.long_poll_expiration = Duration::from_secs(v);
        }
        if let Some(v) = parse_env::<usize>("CHRONIK_TRANSFER_BATCH_SIZE")? {
            config.transfer_batch_size = v;
        }
        if let Some(v) = parse_env::<usize>("CHRONIK_TRANSFER_WORKER_COUNT")? {
            config.transfer_worker_count = v;
        }
        if let Some(v) = parse_env::<usize>("CHRONIK_TIMER_BATCH_SIZE")? {
            config.timer_batch_size = v;
        }
        if let Some(v) = parse_env::<u64>("CHRONIK_STANDBY_TASK_DELAY_SECS")? {
            config.standby_task_delay = Duration::from_secs(v);
        }

        Ok(config)
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(name, "must be a positive integer")),
        Err(_) => Ok(None),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.conditional_retry_count, 5);
        assert_eq!(config.transfer_batch_size, 10);
        assert_eq!(config.long_poll_expiration, Duration::from_secs(20));
    }

    #[test]
    fn test_from_env_overrides() {
        // Env vars are process-global; use a name no other test touches.
        std::env::set_var("CHRONIK_TRANSFER_BATCH_SIZE", "25");
        let config = Config::from_env().unwrap();
        assert_eq!(config.transfer_batch_size, 25);
        std::env::remove_var("CHRONIK_TRANSFER_BATCH_SIZE");
    }

    #[test]
    fn test_from_env_rejects_garbage() {
        std::env::set_var("CHRONIK_TIMER_BATCH_SIZE", "lots");
        assert!(Config::from_env().is_err());
        std::env::remove_var("CHRONIK_TIMER_BATCH_SIZE");
    }
}
