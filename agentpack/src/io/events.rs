//! Structured stage events.
//!
//! # Separation of Concerns
//!
//! - **Tracing (`logging`)**: Dev diagnostics via `RUST_LOG`, output to stderr.
//! - **Events (this module)**: Product records `{timestamp, stage, level, event,
//!   fields}` emitted by every stage through an [`EventSink`]. Stages never
//!   pick a concrete sink.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

/// One structured event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: String,
    pub stage: String,
    pub level: Level,
    pub event: String,
    pub fields: Map<String, Value>,
}

impl EventRecord {
    pub fn new(stage: &str, level: Level, event: &str) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            stage: stage.to_string(),
            level,
            event: event.to_string(),
            fields: Map::new(),
        }
    }

    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }
}

/// Destination for stage events.
pub trait EventSink {
    fn emit(&self, record: EventRecord);
}

/// Convenience wrapper bound to one stage name.
pub struct StageEvents<'a> {
    sink: &'a dyn EventSink,
    stage: &'static str,
}

impl<'a> StageEvents<'a> {
    pub fn new(sink: &'a dyn EventSink, stage: &'static str) -> Self {
        Self { sink, stage }
    }

    pub fn record(&self, level: Level, event: &str) -> EventRecord {
        EventRecord::new(self.stage, level, event)
    }

    pub fn emit(&self, record: EventRecord) {
        self.sink.emit(record);
    }

    pub fn info(&self, event: &str) {
        self.emit(self.record(Level::Info, event));
    }
}

/// Forwards events to `tracing`.
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, record: EventRecord) {
        let fields = Value::Object(record.fields);
        match record.level {
            Level::Debug => debug!(stage = %record.stage, %fields, "{}", record.event),
            Level::Info => info!(stage = %record.stage, %fields, "{}", record.event),
            Level::Warn => warn!(stage = %record.stage, %fields, "{}", record.event),
            Level::Error => error!(stage = %record.stage, %fields, "{}", record.event),
        }
    }
}

/// Appends events as JSON lines to a file.
///
/// Write failures are reported through `tracing` and otherwise swallowed:
/// losing an event must not fail the stage that emitted it.
pub struct JsonlEventSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlEventSink {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create event log dir {}", parent.display()))?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, record: &EventRecord) -> Result<()> {
        let mut line = serde_json::to_string(record).context("serialize event")?;
        line.push('\n');
        let _guard = self.lock.lock().map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open event log {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append event log {}", self.path.display()))
    }
}

impl EventSink for JsonlEventSink {
    fn emit(&self, record: EventRecord) {
        if let Err(err) = self.append(&record) {
            warn!(err = %err, event = %record.event, "dropping event");
        }
    }
}

/// Sends each event to every wrapped sink.
pub struct FanoutEventSink<'a> {
    sinks: Vec<&'a dyn EventSink>,
}

impl<'a> FanoutEventSink<'a> {
    pub fn new(sinks: Vec<&'a dyn EventSink>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutEventSink<'_> {
    fn emit(&self, record: EventRecord) {
        for sink in &self.sinks {
            sink.emit(record.clone());
        }
    }
}

/// Read a JSONL event log back (used by tests and `agentpack` diagnostics).
pub fn read_events(path: &Path) -> Result<Vec<EventRecord>> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).with_context(|| format!("parse event '{line}'")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jsonl_sink_appends_one_line_per_event() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("logs/events.jsonl");
        let sink = JsonlEventSink::create(&path).expect("sink");

        sink.emit(EventRecord::new("resolve", Level::Info, "closure_resolved").field("count", 3));
        sink.emit(
            EventRecord::new("resolve", Level::Warn, "catalog_gap").field("package", "ghost"),
        );

        let events = read_events(&path).expect("read");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, "closure_resolved");
        assert_eq!(events[0].fields["count"], 3);
        assert_eq!(events[1].level, Level::Warn);
        assert_eq!(events[1].fields["package"], "ghost");
    }

    #[test]
    fn record_shape_is_stable() {
        let record = EventRecord::new("verify", Level::Error, "hash_mismatch").field("archive", "code");
        let value = serde_json::to_value(&record).expect("serialize");
        let mut keys: Vec<&str> = value
            .as_object()
            .expect("object")
            .keys()
            .map(String::as_str)
            .collect();
        keys.sort_unstable();
        assert_eq!(keys, vec!["event", "fields", "level", "stage", "timestamp"]);
        assert_eq!(value["level"], "error");
    }
}
