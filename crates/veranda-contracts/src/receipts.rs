use std::path::Path;

use serde::Serialize;
use serde_json::{Map, Value};

pub const RECEIPT_SCHEMA_VERSION: u64 = 1;

/// Request parameters as they were resolved for the run.
#[derive(Debug, Clone, Serialize)]
pub struct RequestSummary {
    pub job_id: String,
    pub opacity: String,
    pub color: Option<String>,
    pub mesh_type: String,
    pub width: u32,
    pub height: u32,
    /// Fingerprint of the input bytes, when the caller had them on disk.
    pub input_sha256: Option<String>,
}

/// One quality-check attempt as scored by the gate.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptScore {
    pub attempt: u64,
    pub score: i64,
    pub passed: bool,
}

/// Assemble the JSON receipt for one finished run. Inline image payloads
/// never belong in a receipt; [`sanitize_payload`] strips them from any
/// caller-supplied maps.
pub fn build_receipt(
    request: &RequestSummary,
    attempts: &[AttemptScore],
    warnings: &[String],
    outputs: &Map<String, Value>,
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
        "quality_attempts".to_string(),
        sanitize_payload(&serde_json::to_value(attempts).unwrap_or(Value::Null)),
    );
    root.insert(
        "warnings".to_string(),
        Value::Array(warnings.iter().cloned().map(Value::String).collect()),
    );
    root.insert(
        "outputs".to_string(),
        sanitize_payload(&Value::Object(outputs.clone())),
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
                    "b64_json" | "image" | "image_bytes" | "data"
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
