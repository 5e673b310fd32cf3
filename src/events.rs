//! Typed outbound events and the broadcast sink that carries them.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::db::FailureReport;
use crate::probe::{ProbeResult, SpeedSample};
use crate::registry::Target;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Everything the engine tells the outside world about.
///
/// Serializes as `{"type": "<kind>", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    PingResult(ProbeResult),
    NetworkSpeed(SpeedSample),
    TargetAdded(Target),
    TargetUpdated { old_id: String, target: Target },
    TargetRemoved(Target),
    ReportGenerated(FailureReport),
    ReportPersistFailed { report_id: String, error: String },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::PingResult(_) => "ping_result",
            Event::NetworkSpeed(_) => "network_speed",
            Event::TargetAdded(_) => "target_added",
            Event::TargetUpdated { .. } => "target_updated",
            Event::TargetRemoved(_) => "target_removed",
            Event::ReportGenerated(_) => "report_generated",
            Event::ReportPersistFailed { .. } => "report_persist_failed",
        }
    }
}

/// Fan-out point for [`Event`]s. Cloning shares the same channel.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<Event>,
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: Event) {
        tracing::debug!("Publishing {} to {} subscribers", event.kind(), self.tx.receiver_count());
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TargetKind;
    use chrono::Utc;

    fn persist_failed(id: &str) -> Event {
        Event::ReportPersistFailed {
            report_id: id.to_string(),
            error: "disk full".to_string(),
        }
    }

    #[test]
    fn test_serializes_as_tagged_payload() {
        let event = Event::TargetRemoved(Target {
            id: "10.0.0.5".to_string(),
            name: "Printer".to_string(),
            enabled: false,
            kind: TargetKind::Custom,
            updated_at: Utc::now(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "target_removed");
        assert_eq!(json["data"]["id"], "10.0.0.5");
        assert_eq!(json["data"]["kind"], "custom");
        assert_eq!(event.kind(), "target_removed");
    }

    #[test]
    fn test_publish_without_subscribers() {
        let sink = EventSink::new();
        sink.publish(persist_failed("x"));
    }

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let sink = EventSink::new();
        let mut rx = sink.subscribe();
        sink.publish(persist_failed("a"));
        sink.publish(persist_failed("b"));

        assert_eq!(rx.recv().await.unwrap(), persist_failed("a"));
        assert_eq!(rx.recv().await.unwrap(), persist_failed("b"));
    }
}
