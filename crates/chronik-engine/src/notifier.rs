// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! History-event notifier.
//!
//! Pub/sub fanout of history-progress notifications keyed by run. Every
//! committed mutation publishes {last_first_event_id, next_event_id,
//! is_running}; long-pollers subscribe per run.
//!
//! Channels are `tokio::sync::watch`: a slow subscriber only ever sees the
//! latest value, so publishers never block and notifications coalesce. That
//! is sufficient because consumers re-read mutable state on every wakeup.
//! Delivery is at-least-once.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use chronik_types::WorkflowRun;

use crate::shard::CommitHooks;

/// One history-progress notification.
#[derive(Clone, Debug, PartialEq)]
pub struct HistoryEventNotification {
    /// Run the notification is about.
    pub workflow: WorkflowRun,
    /// First event ID of the most recently appended batch.
    pub last_first_event_id: i64,
    /// Next event ID after the commit.
    pub next_event_id: i64,
    /// Whether the run is still open.
    pub is_running: bool,
    /// Commit time.
    pub timestamp: DateTime<Utc>,
}

/// Per-run fanout of [`HistoryEventNotification`]s.
#[derive(Default)]
pub struct HistoryEventNotifier {
    channels: Mutex<HashMap<WorkflowRun, watch::Sender<Option<HistoryEventNotification>>>>,
}

impl HistoryEventNotifier {
    /// Create an empty notifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a notification to the run's subscribers. A run without
    /// subscribers has no channel and the notification is dropped;
    /// long-pollers re-read mutable state after subscribing, which closes
    /// the race with a commit published before the subscription.
    pub fn notify(&self, notification: HistoryEventNotification) {
        let mut channels = self.channels.lock().unwrap();
        let workflow = notification.workflow.clone();
        if let Some(sender) = channels.get(&workflow) {
            let _ = sender.send(Some(notification));
            if sender.receiver_count() == 0 {
                channels.remove(&workflow);
            }
        }
    }

    /// Subscribe to a run's notifications. The receiver's current value is
    /// the latest published notification, if any; callers must re-read
    /// mutable state after subscribing to close the missed-wakeup race.
    pub fn watch(&self, workflow: &WorkflowRun) -> watch::Receiver<Option<HistoryEventNotification>> {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(workflow.clone())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    /// Number of runs with a live channel, for tests and introspection.
    pub fn channel_count(&self) -> usize {
        self.channels.lock().unwrap().len()
    }
}

impl CommitHooks for HistoryEventNotifier {
    fn on_history_event(&self, notification: &HistoryEventNotification) {
        self.notify(notification.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(next_event_id: i64, is_running: bool) -> HistoryEventNotification {
        HistoryEventNotification {
            workflow: WorkflowRun::new("d1", "wf1", "run-1"),
            last_first_event_id: 1,
            next_event_id,
            is_running,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_subscriber_sees_latest_value() {
        let notifier = HistoryEventNotifier::new();
        let workflow = WorkflowRun::new("d1", "wf1", "run-1");

        let mut rx = notifier.watch(&workflow);
        notifier.notify(notification(3, true));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().as_ref().unwrap().next_event_id, 3);
    }

    #[tokio::test]
    async fn test_notifications_coalesce() {
        let notifier = HistoryEventNotifier::new();
        let workflow = WorkflowRun::new("d1", "wf1", "run-1");

        let mut rx = notifier.watch(&workflow);
        notifier.notify(notification(3, true));
        notifier.notify(notification(5, true));
        notifier.notify(notification(9, true));

        // A slow subscriber wakes once and observes only the newest state.
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().as_ref().unwrap().next_event_id, 9);
    }

    #[tokio::test]
    async fn test_channel_dropped_once_all_subscribers_leave() {
        let notifier = HistoryEventNotifier::new();
        let workflow = WorkflowRun::new("d1", "wf1", "run-1");

        let rx = notifier.watch(&workflow);
        assert_eq!(notifier.channel_count(), 1);
        drop(rx);
        notifier.notify(notification(4, true));
        assert_eq!(notifier.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_notify_without_subscribers_is_a_noop() {
        let notifier = HistoryEventNotifier::new();
        notifier.notify(notification(3, true));
        assert_eq!(notifier.channel_count(), 0);
    }
}
