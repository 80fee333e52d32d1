//! Change notifications.
//!
//! Inside the engine events fan out on a broadcast channel; for external
//! integrations they are emitted as JSON lines to stdout or a file.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::{Error, Result};

pub const EVENT_SCHEMA_VERSION: &str = "taskflow.event.v1";

/// Events buffered per subscriber before the slowest one starts lagging.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum EventDestination {
    Stdout,
    File(PathBuf),
}

impl EventDestination {
    pub fn parse(raw: Option<&str>) -> Option<Self> {
        raw.and_then(|value| {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return None;
            }
            if trimmed == "-" {
                return Some(EventDestination::Stdout);
            }
            Some(EventDestination::File(PathBuf::from(trimmed)))
        })
    }

    pub fn open(&self) -> Result<EventSink> {
        match self {
            EventDestination::Stdout => Ok(EventSink::stdout()),
            EventDestination::File(path) => EventSink::file(path),
        }
    }
}

/// Event kinds emitted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TasksChanged,
    FileRemoved,
    RebuildStarted,
    RebuildProgress,
    RebuildCompleted,
    RebuildFailed,
    IcsUpdated,
    IcsFailed,
    Diagnostic,
    WriteCompleted,
}

/// A structured event with a payload.
#[derive(Debug, Clone, Serialize)]
pub struct IndexEvent {
    pub schema_version: &'static str,
    pub event: EventKind,
    pub timestamp: DateTime<Utc>,
    /// Repository generation after the change.
    pub generation: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl IndexEvent {
    pub fn new(event: EventKind, generation: u64) -> Self {
        Self {
            schema_version: EVENT_SCHEMA_VERSION,
            event,
            timestamp: Utc::now(),
            generation,
            data: None,
        }
    }

    /// Attach a serializable payload to the event.
    pub fn with_data<T: Serialize>(mut self, data: T) -> Result<Self> {
        self.data = Some(serde_json::to_value(data)?);
        Ok(self)
    }
}

/// In-process fan-out of [`IndexEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<IndexEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.sender.subscribe()
    }

    /// Publish to current subscribers. Having none is not an error.
    pub fn publish(&self, event: IndexEvent) {
        let _ = self.sender.send(event);
    }

    /// Build and publish an event; payloads that fail to serialize are
    /// published without data.
    pub fn emit<T: Serialize>(&self, kind: EventKind, generation: u64, data: T) {
        let event = IndexEvent::new(kind, generation);
        let event = match event.clone().with_data(data) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(error = %err, event = ?kind, "event payload not serializable");
                event
            }
        };
        self.publish(event);
    }
}

/// Event sink that writes JSONL output to a destination.
pub struct EventSink {
    writer: Box<dyn Write + Send>,
}

impl EventSink {
    /// Emit events to stdout.
    pub fn stdout() -> Self {
        Self {
            writer: Box::new(std::io::stdout()),
        }
    }

    /// Emit events to a file, creating it if necessary.
    pub fn file(path: &Path) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            writer: Box::new(file),
        })
    }

    /// Write a single event as JSONL.
    pub fn emit(&mut self, event: &IndexEvent) -> Result<()> {
        let serialized = serde_json::to_vec(event)?;
        self.writer.write_all(&serialized)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush().map_err(Error::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_schema_and_kind() {
        let event = IndexEvent::new(EventKind::TasksChanged, 3)
            .with_data(serde_json::json!({ "file": "a.md" }))
            .expect("data");
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["schema_version"], EVENT_SCHEMA_VERSION);
        assert_eq!(value["event"], "tasks_changed");
        assert_eq!(value["generation"], 3);
        assert_eq!(value["data"]["file"], "a.md");
    }

    #[test]
    fn bus_delivers_to_subscribers() {
        let bus = EventBus::new();
        bus.emit(EventKind::Diagnostic, 0, "dropped");
        let mut receiver = bus.subscribe();
        bus.emit(EventKind::IcsUpdated, 1, serde_json::json!({ "source": "work" }));
        let event = receiver.try_recv().expect("event");
        assert_eq!(event.event, EventKind::IcsUpdated);
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn file_sink_appends_jsonl() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("events.jsonl");
        let destination = EventDestination::parse(path.to_str()).expect("destination");
        let mut sink = destination.open().expect("sink");
        sink.emit(&IndexEvent::new(EventKind::RebuildStarted, 0)).expect("emit");
        sink.emit(&IndexEvent::new(EventKind::RebuildCompleted, 1)).expect("emit");
        let content = std::fs::read_to_string(&path).expect("read");
        assert_eq!(content.lines().count(), 2);
        assert!(matches!(EventDestination::parse(Some("-")), Some(EventDestination::Stdout)));
        assert!(EventDestination::parse(Some("  ")).is_none());
    }
}
