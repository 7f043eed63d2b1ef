//! Tracker event bus — typed events from the scheduler and session engine.
//!
//! A `tokio::sync::broadcast` channel carries [`TrackerEvent`] values so any
//! consumer (notification formatter, dashboard feed, audit log) can subscribe
//! independently. When no subscribers exist, events are silently dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pricewatch::{RunOutcome, ThrottleLevel};

/// Every event the core emits. Serialized to JSON for downstream consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TrackerEvent {
    /// A job run was dispatched.
    JobStarted {
        job_id: String,
        run_id: u64,
        target: String,
    },
    /// A job run finalized with an outcome.
    JobFinished {
        job_id: String,
        run_id: u64,
        outcome: RunOutcome,
        items_processed: usize,
        duration_ms: u64,
    },
    /// A job run failed; `reason` is the definitive failure string.
    JobFailed {
        job_id: String,
        run_id: u64,
        reason: String,
    },
    /// Dispatch was suppressed by throttle or shutdown.
    JobSkipped {
        job_id: String,
        run_id: u64,
        reason: String,
    },
    /// A target's throttle level changed.
    ThrottleChanged {
        target: String,
        from: ThrottleLevel,
        to: ThrottleLevel,
        until: Option<DateTime<Utc>>,
    },
    /// An identity was burned or aged out.
    IdentityRetired { target: String, identity: String },
    /// Graceful shutdown has begun; in-flight runs are draining.
    ShutdownStarted { in_flight: u32 },
}

/// Sender handle for emitting tracker events.
pub type EventSender = tokio::sync::broadcast::Sender<TrackerEvent>;

/// Receiver handle for consuming tracker events.
pub type EventReceiver = tokio::sync::broadcast::Receiver<TrackerEvent>;

/// Create the event channel with a bounded buffer. 256 events absorbs a
/// full tick's worth of dispatches plus throttle transitions.
pub fn channel() -> (EventSender, EventReceiver) {
    tokio::sync::broadcast::channel(256)
}

/// Emit an event, ignoring the error returned when nobody is listening.
pub fn emit(tx: &EventSender, event: TrackerEvent) {
    let _ = tx.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let (tx, rx) = channel();
        drop(rx);
        emit(
            &tx,
            TrackerEvent::ShutdownStarted { in_flight: 0 },
        );
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let (tx, mut rx) = channel();
        emit(
            &tx,
            TrackerEvent::JobStarted {
                job_id: "main".to_string(),
                run_id: 1,
                target: "shop.example".to_string(),
            },
        );
        match rx.recv().await.unwrap() {
            TrackerEvent::JobStarted { job_id, .. } => assert_eq!(job_id, "main"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_events_serialize_tagged() {
        let event = TrackerEvent::ThrottleChanged {
            target: "shop.example".to_string(),
            from: ThrottleLevel::Normal,
            to: ThrottleLevel::Soft,
            until: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "ThrottleChanged");
        assert_eq!(json["to"], "soft");
    }
}
