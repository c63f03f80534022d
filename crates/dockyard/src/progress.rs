//! Rollout event and progress streams
//!
//! The orchestrator pushes two streams to its observer: human-readable event
//! lines and structured [`RolloutProgress`] records. Both are plain
//! `tokio::sync::mpsc` channels; the orchestrator never holds a reference to
//! whatever consumes them.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Progress of a rollout at a point in time.
///
/// `total_size` is the number of old instances plus two (the pre- and
/// post-rollout steps). `steps_done` is the number of steps completed since
/// the previous record; consumers accumulate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutProgress {
    /// Nodes processed per batch
    pub steps_size: u32,
    /// Steps completed since the last record
    pub steps_done: u32,
    /// Old instances + pre and post steps
    pub total_size: u32,
}

/// Sender half for human-readable rollout events
pub type EventSender = mpsc::Sender<String>;

/// Receiver half for human-readable rollout events
pub type EventReceiver = mpsc::Receiver<String>;

/// Sender half for structured progress records
pub type ProgressSender = mpsc::Sender<RolloutProgress>;

/// Receiver half for structured progress records
pub type ProgressReceiver = mpsc::Receiver<RolloutProgress>;

/// Create the event stream. Capacity 1: senders rendezvous with the consumer.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::channel(1)
}

/// Create the progress stream
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::channel(1)
}

/// Push an event line, ignoring a departed consumer
pub async fn emit(events: &EventSender, message: impl Into<String>) {
    let _ = events.send(message.into()).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_serialization() {
        let progress = RolloutProgress {
            steps_size: 2,
            steps_done: 1,
            total_size: 6,
        };
        let json = serde_json::to_string(&progress).unwrap();
        assert!(json.contains("\"total_size\":6"));
        let parsed: RolloutProgress = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, progress);
    }

    #[tokio::test]
    async fn test_emit_survives_dropped_receiver() {
        let (tx, rx) = event_channel();
        drop(rx);
        emit(&tx, "nobody listening").await;
    }

    #[tokio::test]
    async fn test_event_channel_delivers_in_order() {
        let (tx, mut rx) = event_channel();
        let producer = tokio::spawn(async move {
            emit(&tx, "first").await;
            emit(&tx, "second").await;
        });
        assert_eq!(rx.recv().await.as_deref(), Some("first"));
        assert_eq!(rx.recv().await.as_deref(), Some("second"));
        producer.await.unwrap();
    }
}
