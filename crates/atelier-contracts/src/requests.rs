use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ledger::QuotaSnapshot;

pub const RECEIPT_SCHEMA_VERSION: u64 = 1;

pub const PROMPT_MAX_CHARS: usize = 150;
pub const DIM_MIN: u32 = 128;
pub const DIM_MAX: u32 = 1024;
pub const DIM_STEP: u32 = 64;
pub const STEPS_MIN: u32 = 10;
pub const STEPS_MAX: u32 = 50;
pub const COUNT_MAX: u64 = 4;

/// Caller-facing generation request. Out-of-range fields are normalized
/// with warnings rather than rejected; only an empty prompt is an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default = "default_dim")]
    pub width: u32,
    #[serde(default = "default_dim")]
    pub height: u32,
    #[serde(default = "default_steps")]
    pub steps: u32,
    #[serde(default = "default_count")]
    pub count: u64,
    #[serde(default)]
    pub reference_urls: Vec<String>,
    #[serde(default)]
    pub provider_options: Map<String, Value>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            width: default_dim(),
            height: default_dim(),
            steps: default_steps(),
            count: default_count(),
            reference_urls: Vec::new(),
            provider_options: Map::new(),
        }
    }

    /// Normalizes the request into the form actually sent to a provider.
    /// `count` starts equal to `requested`; the orchestrator lowers it
    /// when the day's remaining quota is smaller.
    pub fn resolve(&self) -> anyhow::Result<ResolvedRequest> {
        let mut warnings = Vec::new();

        let trimmed = self.prompt.trim();
        if trimmed.is_empty() {
            anyhow::bail!("prompt must not be empty");
        }
        let prompt = if trimmed.chars().count() > PROMPT_MAX_CHARS {
            warnings.push(format!(
                "prompt truncated to {PROMPT_MAX_CHARS} characters"
            ));
            trimmed.chars().take(PROMPT_MAX_CHARS).collect()
        } else {
            trimmed.to_string()
        };

        let width = normalize_dim("width", self.width, &mut warnings);
        let height = normalize_dim("height", self.height, &mut warnings);

        let steps = self.steps.clamp(STEPS_MIN, STEPS_MAX);
        if steps != self.steps {
            warnings.push(format!(
                "steps adjusted from {} to {} (allowed {STEPS_MIN}-{STEPS_MAX})",
                self.steps, steps
            ));
        }

        let requested = self.count.clamp(1, COUNT_MAX);
        if requested != self.count {
            warnings.push(format!(
                "output count adjusted from {} to {} (allowed 1-{COUNT_MAX})",
                self.count, requested
            ));
        }

        Ok(ResolvedRequest {
            prompt,
            width,
            height,
            steps,
            requested,
            count: requested,
            warnings,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRequest {
    pub prompt: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub requested: u64,
    pub count: u64,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityWarning {
    pub reference: String,
    pub distance: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceFault {
    pub reference: String,
    pub error: String,
}

/// One produced image. An empty `similarity` list means the image is
/// clear against the supplied reference set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub image_path: PathBuf,
    #[serde(default)]
    pub similarity: Vec<SimilarityWarning>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationBatch {
    pub batch_id: String,
    pub provider: String,
    pub model: String,
    pub resolved: ResolvedRequest,
    pub images: Vec<GeneratedImage>,
    #[serde(default)]
    pub reference_faults: Vec<ReferenceFault>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub cost_usd: f64,
    pub latency_per_image_s: f64,
    pub usage: QuotaSnapshot,
    pub receipt_path: Option<PathBuf>,
}

pub fn build_receipt(
    batch: &GenerationBatch,
    provider_request: &Map<String, Value>,
    provider_response: &Map<String, Value>,
) -> Value {
    let mut root = Map::new();
    root.insert(
        "schema_version".to_string(),
        Value::Number(RECEIPT_SCHEMA_VERSION.into()),
    );
    root.insert(
        "batch".to_string(),
        sanitize_payload(&serde_json::to_value(batch).unwrap_or(Value::Null)),
    );
    root.insert(
        "provider_request".to_string(),
        sanitize_payload(&Value::Object(provider_request.clone())),
    );
    root.insert(
        "provider_response".to_string(),
        sanitize_payload(&Value::Object(provider_response.clone())),
    );
    root.insert(
        "ts".to_string(),
        Value::String(
            chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, false),
        ),
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

// Image payloads never belong in a receipt.
fn sanitize_payload(value: &Value) -> Value {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => value.clone(),
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

fn normalize_dim(label: &str, raw: u32, warnings: &mut Vec<String>) -> u32 {
    let snapped = snap_multiple(raw, DIM_STEP).clamp(DIM_MIN, DIM_MAX);
    if snapped != raw {
        warnings.push(format!(
            "{label} adjusted from {raw} to {snapped} (allowed {DIM_MIN}-{DIM_MAX}, multiples of {DIM_STEP})"
        ));
    }
    snapped
}

fn snap_multiple(value: u32, multiple: u32) -> u32 {
    if multiple <= 1 {
        return value.max(1);
    }
    let rounded = ((value as f64 / multiple as f64).round() as u32) * multiple;
    rounded.max(multiple)
}

fn default_dim() -> u32 {
    512
}

fn default_steps() -> u32 {
    20
}

fn default_count() -> u64 {
    1
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use crate::ledger::QuotaSnapshot;

    use super::{
        build_receipt, write_receipt, GeneratedImage, GenerationBatch, GenerationRequest,
        RECEIPT_SCHEMA_VERSION,
    };

    #[test]
    fn resolve_keeps_in_range_values_untouched() -> anyhow::Result<()> {
        let mut request = GenerationRequest::new("a quiet harbor at dawn");
        request.width = 768;
        request.height = 512;
        request.steps = 30;
        request.count = 2;

        let resolved = request.resolve()?;
        assert_eq!(resolved.width, 768);
        assert_eq!(resolved.height, 512);
        assert_eq!(resolved.steps, 30);
        assert_eq!(resolved.requested, 2);
        assert_eq!(resolved.count, 2);
        assert!(resolved.warnings.is_empty());
        Ok(())
    }

    #[test]
    fn resolve_normalizes_out_of_range_values_with_warnings() -> anyhow::Result<()> {
        let mut request = GenerationRequest::new("harbor");
        request.width = 100;
        request.height = 2000;
        request.steps = 99;
        request.count = 9;

        let resolved = request.resolve()?;
        assert_eq!(resolved.width, 128);
        assert_eq!(resolved.height, 1024);
        assert_eq!(resolved.steps, 50);
        assert_eq!(resolved.count, 4);
        assert_eq!(resolved.warnings.len(), 4);
        Ok(())
    }

    #[test]
    fn resolve_truncates_long_prompts() -> anyhow::Result<()> {
        let request = GenerationRequest::new("x".repeat(400));
        let resolved = request.resolve()?;
        assert_eq!(resolved.prompt.chars().count(), 150);
        assert_eq!(resolved.warnings.len(), 1);
        Ok(())
    }

    #[test]
    fn resolve_rejects_empty_prompt() {
        assert!(GenerationRequest::new("   ").resolve().is_err());
    }

    #[test]
    fn request_deserializes_with_defaults() -> anyhow::Result<()> {
        let request: GenerationRequest = serde_json::from_value(json!({
            "prompt": "harbor",
        }))?;
        assert_eq!(request.width, 512);
        assert_eq!(request.height, 512);
        assert_eq!(request.steps, 20);
        assert_eq!(request.count, 1);
        assert!(request.reference_urls.is_empty());
        Ok(())
    }

    #[test]
    fn receipt_has_expected_shape_and_sanitizes_payloads() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let receipt_path = temp.path().join("receipt-1.json");

        let resolved = GenerationRequest::new("harbor").resolve()?;
        let batch = GenerationBatch {
            batch_id: "batch-1".to_string(),
            provider: "dryrun".to_string(),
            model: "dryrun-image".to_string(),
            resolved,
            images: vec![GeneratedImage {
                image_path: temp.path().join("artifact-0.png"),
                similarity: Vec::new(),
            }],
            reference_faults: Vec::new(),
            warnings: Vec::new(),
            cost_usd: 0.02,
            latency_per_image_s: 0.01,
            usage: QuotaSnapshot {
                date: "2026-08-06".to_string(),
                count: 1,
                cost_usd: 0.02,
                daily_limit: 10,
                remaining: 9,
            },
            receipt_path: Some(receipt_path.clone()),
        };

        let mut provider_response = Map::new();
        provider_response.insert("status".to_string(), json!("succeeded"));
        provider_response.insert("b64_json".to_string(), json!("QUJD"));

        let payload = build_receipt(&batch, &Map::new(), &provider_response);
        write_receipt(&receipt_path, &payload)?;

        let raw = std::fs::read_to_string(&receipt_path)?;
        let parsed: Value = serde_json::from_str(&raw)?;
        assert_eq!(parsed["schema_version"], json!(RECEIPT_SCHEMA_VERSION));
        assert_eq!(parsed["batch"]["provider"], json!("dryrun"));
        assert_eq!(parsed["batch"]["usage"]["remaining"], json!(9));
        assert_eq!(parsed["provider_response"]["b64_json"], json!("<omitted>"));
        Ok(())
    }
}
