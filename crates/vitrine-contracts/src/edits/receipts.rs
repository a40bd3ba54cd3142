use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::options::{EditOptions, EditTuning};

pub const RECEIPT_SCHEMA_VERSION: u64 = 1;

/// What was asked of the edit service, minus the pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditReceiptRequest {
    pub operation: String,
    pub prompt: String,
    pub transport: String,
    pub slot: Option<String>,
    pub image_bytes: usize,
    pub reference_count: usize,
    #[serde(default)]
    pub options: EditOptions,
    #[serde(default)]
    pub tuning: EditTuning,
}

pub fn build_receipt(
    request: &EditReceiptRequest,
    provider_request: &Map<String, Value>,
    provider_response: &Map<String, Value>,
    outcome: &str,
    warnings: &[String],
    artifact_path: Option<&Path>,
) -> Value {
    let mut root = Map::new();
    root.insert(
        "schema_version".to_string(),
        Value::Number(RECEIPT_SCHEMA_VERSION.into()),
    );
    root.insert(
        "request".to_string(),
        sanitize_payload(&serde_json::to_value(request).unwrap_or(Value::Null)),
    );
    root.insert(
        "provider_request".to_string(),
        sanitize_payload(&Value::Object(provider_request.clone())),
    );
    root.insert(
        "provider_response".to_string(),
        sanitize_payload(&Value::Object(provider_response.clone())),
    );
    root.insert("outcome".to_string(), Value::String(outcome.to_string()));
    root.insert(
        "warnings".to_string(),
        Value::Array(warnings.iter().cloned().map(Value::String).collect()),
    );
    root.insert(
        "artifact_path".to_string(),
        artifact_path
            .map(|path| Value::String(path.to_string_lossy().to_string()))
            .unwrap_or(Value::Null),
    );
    Value::Object(root)
}

pub fn write_receipt(path: &Path, payload: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(payload)?)?;
    Ok(())
}

fn sanitize_payload(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::Bool(_) | Value::Number(_) | Value::String(_) => value.clone(),
        Value::Array(rows) => Value::Array(rows.iter().map(sanitize_payload).collect()),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, row) in map {
                let lowered = key.to_ascii_lowercase();
                if matches!(
                    lowered.as_str(),
                    "image" | "referenceimage" | "referenceimages" | "reference_image" | "data"
                ) {
                    out.insert(key.clone(), Value::String("<omitted>".to_string()));
                    continue;
                }
                out.insert(key.clone(), sanitize_payload(row));
            }
            Value::Object(out)
        }
    }
}
