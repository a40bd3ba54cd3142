use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Append-only session log.
///
/// Every event carries `type`, `session_id` and `ts`; the caller payload is
/// merged last and may override them. With a path the log writes one compact
/// JSON object per line, without one it only keeps events in memory.
#[derive(Debug, Clone)]
pub struct EventLog {
    inner: Arc<EventLogInner>,
}

#[derive(Debug)]
struct EventLogInner {
    path: Option<PathBuf>,
    session_id: String,
    recorded: Mutex<Vec<Value>>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self::build(Some(path.into()), session_id.into())
    }

    pub fn in_memory(session_id: impl Into<String>) -> Self {
        Self::build(None, session_id.into())
    }

    fn build(path: Option<PathBuf>, session_id: String) -> Self {
        Self {
            inner: Arc::new(EventLogInner {
                path,
                session_id,
                recorded: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "session_id".to_string(),
            Value::String(self.inner.session_id.clone()),
        );
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, value);
        }
        let event = Value::Object(event);

        let mut recorded = self
            .inner
            .recorded
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        if let Some(path) = self.inner.path.as_ref() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let line = serde_json::to_string(&event)?;
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
        }
        recorded.push(event.clone());
        Ok(event)
    }

    /// Events emitted through this handle (and its clones) so far.
    pub fn recorded(&self) -> Vec<Value> {
        self.inner
            .recorded
            .lock()
            .map(|rows| rows.clone())
            .unwrap_or_default()
    }

    pub fn recorded_types(&self) -> Vec<String> {
        self.recorded()
            .iter()
            .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
            .collect()
    }
}

pub fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;
    use serde_json::json;

    use super::*;

    #[test]
    fn emit_writes_compact_jsonl_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let log = EventLog::new(&path, "session-1");

        let mut payload = EventPayload::new();
        payload.insert("product_id".to_string(), json!("p-42"));
        let emitted = log.emit("session_started", payload)?;

        let content = fs::read_to_string(&path)?;
        let line = content.lines().next().unwrap_or("");
        let parsed: Value = serde_json::from_str(line)?;

        assert_eq!(parsed, emitted);
        assert_eq!(parsed["type"], json!("session_started"));
        assert_eq!(parsed["session_id"], json!("session-1"));
        assert_eq!(parsed["product_id"], json!("p-42"));
        DateTime::parse_from_rfc3339(parsed["ts"].as_str().unwrap_or(""))?;
        Ok(())
    }

    #[test]
    fn in_memory_log_is_shared_between_clones() -> anyhow::Result<()> {
        let log = EventLog::in_memory("session-2");
        let clone = log.clone();
        log.emit("one", EventPayload::new())?;
        clone.emit("two", EventPayload::new())?;

        assert_eq!(log.recorded_types(), vec!["one", "two"]);
        assert!(log.path().is_none());
        Ok(())
    }

    #[test]
    fn payload_can_override_default_keys() -> anyhow::Result<()> {
        let log = EventLog::in_memory("session-3");
        let mut payload = EventPayload::new();
        payload.insert("session_id".to_string(), json!("other"));
        let emitted = log.emit("upload_progress", payload)?;
        assert_eq!(emitted["session_id"], json!("other"));
        assert_eq!(emitted["type"], json!("upload_progress"));
        Ok(())
    }
}
