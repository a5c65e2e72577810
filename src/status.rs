//! Operator-facing status types. The transport is out of scope; these are
//! the stable payloads behind `get_status` and `stream_events`.

use crate::types::{BatteryState, Pose};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Snapshot returned by `get_status`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusReport {
    pub mission_state: String,
    pub pose: Pose,
    pub battery: BatteryState,
    pub localization_quality: f64,
    /// Stable operator-visible string; internal identifiers stay opaque.
    pub last_fault: Option<String>,
}

/// One entry of the operator event stream: state transitions and faults.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusEvent {
    pub timestamp: f64,
    pub kind: StatusEventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusEventKind {
    StateTransition,
    Fault,
    Safety,
    Docking,
    Localization,
}

/// Bounded fan-out stream for `stream_events`. Slow consumers lose the
/// oldest entries rather than stalling the control plane.
pub struct EventStream {
    tx: broadcast::Sender<StatusEvent>,
}

impl EventStream {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        EventStream { tx }
    }

    pub fn publish(&self, event: StatusEvent) {
        // No receivers is fine; events are best-effort toward the boundary.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_fan_out() {
        let stream = EventStream::new(8);
        let mut rx = stream.subscribe();
        stream.publish(StatusEvent {
            timestamp: 1.0,
            kind: StatusEventKind::StateTransition,
            detail: "idle -> mowing".into(),
        });
        let got = rx.recv().await.unwrap();
        assert_eq!(got.kind, StatusEventKind::StateTransition);
        assert_eq!(got.detail, "idle -> mowing");
    }

    #[test]
    fn test_report_serializes() {
        let report = StatusReport {
            mission_state: "idle".into(),
            pose: Pose::origin(),
            battery: BatteryState::default(),
            localization_quality: 0.8,
            last_fault: None,
        };
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"mission_state\":\"idle\""));
    }
}
