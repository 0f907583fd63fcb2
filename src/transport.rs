//! The UI transport boundary. The actual WebSocket/HTTP hop is out of scope
//! (SPEC_FULL.md §6); this module owns only the broadcast channel and the
//! message shapes the supervisor publishes onto it. Generalized from the
//! teacher's `audio::progress::{ProgressEvent, ProgressEmitter}`, which built
//! the same shape of message but emitted it through a `tauri::Window`.

use serde::{Deserialize, Serialize};

use crate::model::Chapter;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub stage: String,
    pub percentage: f32,
    pub message: String,
    pub current_file: Option<String>,
    pub eta_seconds: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum Event {
    ProgressUpdate(ProgressUpdate),
    StepChange { step: String },
    ChapterUpdate { chapters: Vec<Chapter> },
    HistoryUpdate { can_undo: bool, can_redo: bool },
    Status { message: String },
    Error { message: String, step: String },
}

/// Thin wrapper around a `tokio::sync::broadcast::Sender<Event>`. Send errors
/// (no receivers currently subscribed) are not propagated: a dropped
/// receiver must never fail the stage that produced the event, matching the
/// "runner callbacks never throw" rule (SPEC_FULL.md §7).
#[derive(Clone)]
pub struct EventBus {
    sender: tokio::sync::broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = tokio::sync::broadcast::channel(capacity);
        EventBus { sender }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: Event) {
        // A send error here only means there are no current subscribers;
        // that is a normal, recoverable condition for a broadcast channel.
        let _ = self.sender.send(event);
    }

    pub fn progress(&self, stage: &str, percentage: f32, message: impl Into<String>) {
        self.publish(Event::ProgressUpdate(ProgressUpdate {
            stage: stage.to_string(),
            percentage,
            message: message.into(),
            current_file: None,
            eta_seconds: None,
        }));
    }

    pub fn step_change(&self, step: &str) {
        self.publish(Event::StepChange { step: step.to_string() });
    }

    pub fn error(&self, message: impl Into<String>, step: &str) {
        self.publish(Event::Error { message: message.into(), step: step.to_string() });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.step_change("idle");
    }

    #[test]
    fn subscriber_receives_published_event() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.progress("audio_analysis", 50.0, "halfway");
        let event = rx.try_recv().expect("event should be queued");
        match event {
            Event::ProgressUpdate(update) => {
                assert_eq!(update.stage, "audio_analysis");
                assert_eq!(update.percentage, 50.0);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn dropped_receiver_does_not_fail_publish() {
        let bus = EventBus::default();
        {
            let _rx = bus.subscribe();
        }
        bus.error("boom", "idle");
    }
}
