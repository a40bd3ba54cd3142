use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::events::now_utc_iso;

/// Outcome of one product submission, written next to the session log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitSummary {
    pub session_id: String,
    pub product_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub images: Vec<String>,
    pub uploaded: u64,
    pub failed: Vec<Map<String, Value>>,
}

pub fn write_summary(
    path: &Path,
    summary: &SubmitSummary,
    extra: Option<&Map<String, Value>>,
) -> anyhow::Result<()> {
    let mut payload = match serde_json::to_value(summary)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    payload.insert("ts".to_string(), Value::String(now_utc_iso()));
    if let Some(extra) = extra {
        for (key, value) in extra {
            payload.insert(key.clone(), value.clone());
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&Value::Object(payload))?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::{write_summary, SubmitSummary};

    #[test]
    fn write_summary_generates_expected_payload() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("summary.json");

        let mut failure = Map::new();
        failure.insert("pending_id".to_string(), json!("img-2"));
        failure.insert("reason".to_string(), json!("network error"));
        let summary = SubmitSummary {
            session_id: "session-1".to_string(),
            product_id: "p-1".to_string(),
            started_at: "2026-02-19T00:00:00+00:00".to_string(),
            finished_at: "2026-02-19T00:00:04+00:00".to_string(),
            images: vec!["https://cdn/a.jpg".to_string()],
            uploaded: 1,
            failed: vec![failure],
        };
        let mut extra = Map::new();
        extra.insert("aggregate_progress".to_string(), json!(100));
        write_summary(&path, &summary, Some(&extra))?;

        let parsed: Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        assert_eq!(parsed["product_id"], json!("p-1"));
        assert_eq!(parsed["uploaded"], json!(1));
        assert_eq!(parsed["failed"][0]["reason"], json!("network error"));
        assert_eq!(parsed["aggregate_progress"], json!(100));
        assert!(parsed.get("ts").and_then(Value::as_str).is_some());
        Ok(())
    }
}
