//! Detection event stream
//!
//! Events are emitted as a side effect of running jobs. Delivery is best
//! effort: a sink without listeners never affects the job.

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::Serialize;
use tracing::trace;
use uuid::Uuid;

use crate::pipeline::Stage;
use crate::types::DetectedSymbol;

/// Events emitted while a job runs
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum DetectionEvent {
    /// Job entered processing
    #[serde(rename = "detection-started")]
    Started {
        job_id: Uuid,
        document_id: String,
        page_number: u32,
    },
    /// A pipeline stage started or finished
    #[serde(rename = "detection-progress")]
    Progress {
        job_id: Uuid,
        stage: Stage,
        percent: u8,
        elapsed_ms: u64,
    },
    #[serde(rename = "symbol-detected")]
    SymbolDetected { job_id: Uuid, symbol: Box<DetectedSymbol> },
    #[serde(rename = "detection-completed")]
    Completed {
        job_id: Uuid,
        result_id: Uuid,
        symbol_count: usize,
        processing_time_ms: u64,
        cache_hit: bool,
    },
    #[serde(rename = "detection-error")]
    Error { job_id: Uuid, kind: String, message: String },
}

impl DetectionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DetectionEvent::Started { .. } => "detection-started",
            DetectionEvent::Progress { .. } => "detection-progress",
            DetectionEvent::SymbolDetected { .. } => "symbol-detected",
            DetectionEvent::Completed { .. } => "detection-completed",
            DetectionEvent::Error { .. } => "detection-error",
        }
    }

    pub fn job_id(&self) -> Uuid {
        match self {
            DetectionEvent::Started { job_id, .. }
            | DetectionEvent::Progress { job_id, .. }
            | DetectionEvent::SymbolDetected { job_id, .. }
            | DetectionEvent::Completed { job_id, .. }
            | DetectionEvent::Error { job_id, .. } => *job_id,
        }
    }
}

/// Consumer of detection events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: DetectionEvent);
}

/// Forwards events over a crossbeam channel
#[derive(Clone)]
pub struct ChannelEventSink {
    sender: Sender<DetectionEvent>,
}

impl ChannelEventSink {
    pub fn new(sender: Sender<DetectionEvent>) -> Self {
        Self { sender }
    }

    /// Sink plus the receiving end of a fresh unbounded channel
    pub fn unbounded() -> (Self, Receiver<DetectionEvent>) {
        let (sender, receiver) = unbounded();
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: DetectionEvent) {
        if let Err(e) = self.sender.send(event) {
            trace!("Dropped {} event, no listener", e.0.name());
        }
    }
}

/// Discards every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: DetectionEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_sink_delivers_in_order() {
        let (sink, rx) = ChannelEventSink::unbounded();
        let job_id = Uuid::new_v4();
        sink.emit(DetectionEvent::Started {
            job_id,
            document_id: "doc".to_string(),
            page_number: 3,
        });
        sink.emit(DetectionEvent::Progress {
            job_id,
            stage: Stage::PatternMatching,
            percent: 10,
            elapsed_ms: 5,
        });

        let events: Vec<DetectionEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name(), "detection-started");
        assert_eq!(events[1].job_id(), job_id);
    }

    #[test]
    fn test_sink_without_listener_does_not_fail() {
        let (sink, rx) = ChannelEventSink::unbounded();
        drop(rx);
        sink.emit(DetectionEvent::Error {
            job_id: Uuid::new_v4(),
            kind: "timeout".to_string(),
            message: "late".to_string(),
        });
    }

    #[test]
    fn test_event_serializes_with_wire_name() {
        let event = DetectionEvent::Progress {
            job_id: Uuid::nil(),
            stage: Stage::MlClassification,
            percent: 50,
            elapsed_ms: 12,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "detection-progress");
        assert_eq!(json["stage"], "ml_classification");
    }
}
