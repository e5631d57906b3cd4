// ABOUTME: Completion events handed to an external sink after every execution
// ABOUTME: TracingSink logs them, ChannelSink forwards them to a subscriber

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::hooks::HookOutcome;

/// Summary of one finished execution.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionEvent {
    pub session_id: String,
    pub request_id: String,
    pub command: String,
    /// Completion status, or the error kind when the request never ran.
    pub status: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
    pub hooks: Vec<HookOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_parsed: Option<bool>,
    pub finished_at: DateTime<Utc>,
}

/// Receives completion events. Callers do not wait on the outcome.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn record(&self, event: CompletionEvent);
}

/// Default sink: one structured log line per execution.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl EventSink for TracingSink {
    async fn record(&self, event: CompletionEvent) {
        tracing::info!(
            session_id = %event.session_id,
            request_id = %event.request_id,
            status = %event.status,
            exit_code = ?event.exit_code,
            duration_ms = event.duration_ms,
            stdout_bytes = event.stdout_bytes,
            stderr_bytes = event.stderr_bytes,
            hooks = event.hooks.len(),
            "Execution recorded"
        );
    }
}

/// Forwards events over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<CompletionEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CompletionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn record(&self, event: CompletionEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("Completion event subscriber gone, dropping event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(status: &str) -> CompletionEvent {
        CompletionEvent {
            session_id: "s".into(),
            request_id: "1".into(),
            command: "true".into(),
            status: status.into(),
            exit_code: Some(0),
            duration_ms: 3,
            stdout_bytes: 0,
            stderr_bytes: 0,
            hooks: Vec::new(),
            json_parsed: None,
            finished_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn channel_sink_delivers_and_survives_dropped_receiver() {
        let (sink, mut rx) = ChannelSink::new();
        sink.record(event("completed")).await;
        assert_eq!(rx.recv().await.expect("event").status, "completed");

        drop(rx);
        sink.record(event("timed_out")).await;
    }

    #[test]
    fn event_serializes_without_empty_json_flag() {
        let value = serde_json::to_value(event("completed")).expect("serialize");
        assert!(value.get("json_parsed").is_none());
        assert_eq!(value["exit_code"], 0);
    }
}
