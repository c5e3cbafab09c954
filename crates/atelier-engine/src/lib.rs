use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use atelier_contracts::events::EventWriter;
use atelier_contracts::ledger::{FileLedgerStore, QuotaLedger, QuotaSnapshot};
use atelier_contracts::requests::{
    build_receipt, write_receipt, GeneratedImage, GenerationBatch, GenerationRequest,
    ReferenceFault, SimilarityWarning,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{Local, NaiveDate};
use image::imageops::FilterType;
use image::{DynamicImage, Rgb, RgbImage};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const DEFAULT_DAILY_LIMIT: u64 = 10;
pub const DEFAULT_UNIT_COST_USD: f64 = 0.02;
pub const DEFAULT_SIMILARITY_THRESHOLD: u32 = 5;
pub const DEFAULT_REPLICATE_MODEL: &str =
    "stability-ai/stable-diffusion:b3d14e1cd1f9470bbb0bb68cac48e5f483e5be309551992cc33dc30654a82bb7";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub provider: String,
    pub model: String,
    pub daily_limit: u64,
    pub unit_cost_usd: f64,
    pub similarity_threshold: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider: "replicate".to_string(),
            model: DEFAULT_REPLICATE_MODEL.to_string(),
            daily_limit: DEFAULT_DAILY_LIMIT,
            unit_cost_usd: DEFAULT_UNIT_COST_USD,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(provider) = non_empty_env("ATELIER_PROVIDER") {
            config.provider = provider;
        }
        if let Some(model) = non_empty_env("ATELIER_IMAGE_MODEL") {
            config.model = model;
        }
        if let Some(limit) = non_empty_env("ATELIER_DAILY_LIMIT")
            .and_then(|value| value.parse::<u64>().ok())
        {
            config.daily_limit = limit;
        }
        if let Some(cost) = non_empty_env("ATELIER_UNIT_COST_USD")
            .and_then(|value| value.parse::<f64>().ok())
        {
            config.unit_cost_usd = cost.max(0.0);
        }
        if let Some(threshold) = non_empty_env("ATELIER_SIMILARITY_THRESHOLD")
            .and_then(|value| value.parse::<u32>().ok())
        {
            config.similarity_threshold = threshold.min(64);
        }
        config
    }
}

#[derive(Debug, Clone)]
pub struct ProviderImage {
    pub image_path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub source_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub out_dir: PathBuf,
    pub prompt: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub count: u64,
    pub model: String,
    pub provider_options: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub provider_request: Map<String, Value>,
    pub provider_response: Map<String, Value>,
    pub warnings: Vec<String>,
    pub images: Vec<ProviderImage>,
}

pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, request: &ProviderRequest) -> Result<ProviderResponse>;
}

#[derive(Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Box<dyn ImageProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: ImageProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.name().to_string(), Box::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<&dyn ImageProvider> {
        self.providers.get(name).map(|provider| provider.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

pub fn default_provider_registry() -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    registry.register(DryrunProvider);
    registry.register(ReplicateProvider::new());
    registry.register(OpenAiProvider::new());
    registry
}

struct DryrunProvider;

impl ImageProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(&self, request: &ProviderRequest) -> Result<ProviderResponse> {
        let stamp = timestamp_millis();
        let mut images = Vec::new();
        for idx in 0..request.count.max(1) {
            let image_path = request
                .out_dir
                .join(format!("artifact-{}-{:02}.png", stamp, idx));
            let (r, g, b) = color_from_prompt(&request.prompt, idx);
            write_flat_image(&image_path, request.width, request.height, (r, g, b))?;
            images.push(ProviderImage {
                image_path,
                width: request.width,
                height: request.height,
                source_url: None,
            });
        }

        Ok(ProviderResponse {
            provider_request: map_object(json!({
                "endpoint": "dryrun-native",
                "payload": {
                    "prompt": request.prompt,
                    "width": request.width,
                    "height": request.height,
                    "num_inference_steps": request.steps,
                    "num_outputs": request.count,
                },
            })),
            provider_response: map_object(json!({ "status": "succeeded" })),
            warnings: Vec::new(),
            images,
        })
    }
}

struct ReplicateProvider {
    api_base: String,
    http: HttpClient,
}

impl ReplicateProvider {
    fn new() -> Self {
        Self {
            api_base: env::var("REPLICATE_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "https://api.replicate.com/v1".to_string()),
            http: HttpClient::new(),
        }
    }

    fn api_key() -> Option<String> {
        non_empty_env("REPLICATE_API_TOKEN").or_else(|| non_empty_env("REPLICATE_API_KEY"))
    }

    fn resolve_model(request: &ProviderRequest) -> String {
        request
            .provider_options
            .get("replicate_model")
            .or_else(|| request.provider_options.get("model"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(request.model.trim())
            .to_string()
    }

    fn poll_interval_seconds(request: &ProviderRequest) -> f64 {
        request
            .provider_options
            .get("poll_interval")
            .and_then(Value::as_f64)
            .unwrap_or(1.0)
            .clamp(0.2, 5.0)
    }

    fn poll_timeout_seconds(request: &ProviderRequest) -> f64 {
        request
            .provider_options
            .get("poll_timeout")
            .and_then(Value::as_f64)
            .unwrap_or(120.0)
            .clamp(10.0, 600.0)
    }

    fn predictions_endpoint(&self) -> String {
        format!("{}/predictions", self.api_base)
    }

    fn poll_prediction(
        &self,
        poll_url: &str,
        api_key: &str,
        poll_interval_s: f64,
        poll_timeout_s: f64,
    ) -> Result<Value> {
        let started = Instant::now();
        loop {
            let response = self
                .http
                .get(poll_url)
                .bearer_auth(api_key)
                .send()
                .with_context(|| format!("Replicate poll request failed ({poll_url})"))?;
            let payload = response_json_or_error("Replicate poll", response)?;
            let status = payload
                .get("status")
                .and_then(Value::as_str)
                .map(|value| value.to_ascii_lowercase())
                .unwrap_or_default();
            if status == "succeeded" {
                return Ok(payload);
            }
            if matches!(status.as_str(), "failed" | "canceled") {
                bail!("Replicate prediction failed: {}", payload);
            }
            if started.elapsed().as_secs_f64() >= poll_timeout_s {
                bail!("Replicate polling timed out after {:.1}s", poll_timeout_s);
            }
            thread::sleep(Duration::from_secs_f64(poll_interval_s));
        }
    }

    fn extract_output_urls(value: &Value, out: &mut Vec<String>) {
        match value {
            Value::String(url) => {
                let trimmed = url.trim();
                if !trimmed.is_empty()
                    && trimmed.starts_with("http")
                    && !out.iter().any(|existing| existing == trimmed)
                {
                    out.push(trimmed.to_string());
                }
            }
            Value::Array(rows) => {
                for row in rows {
                    Self::extract_output_urls(row, out);
                }
            }
            Value::Object(obj) => {
                for key in ["url", "urls", "output"] {
                    if let Some(inner) = obj.get(key) {
                        Self::extract_output_urls(inner, out);
                    }
                }
            }
            _ => {}
        }
    }
}

impl ImageProvider for ReplicateProvider {
    fn name(&self) -> &str {
        "replicate"
    }

    fn generate(&self, request: &ProviderRequest) -> Result<ProviderResponse> {
        let Some(api_key) = Self::api_key() else {
            bail!("REPLICATE_API_TOKEN not set");
        };

        let endpoint = self.predictions_endpoint();
        let model = Self::resolve_model(request);
        let poll_interval_s = Self::poll_interval_seconds(request);
        let poll_timeout_s = Self::poll_timeout_seconds(request);
        let mut warnings = Vec::new();

        let mut input = map_object(json!({
            "prompt": request.prompt,
            "width": request.width,
            "height": request.height,
            "num_inference_steps": request.steps,
            "num_outputs": request.count,
        }));
        for (key, value) in &request.provider_options {
            let normalized = key.trim().to_ascii_lowercase();
            if matches!(
                normalized.as_str(),
                "replicate_model" | "model" | "poll_interval" | "poll_timeout"
            ) {
                continue;
            }
            if input.contains_key(key) {
                continue;
            }
            input.insert(key.clone(), value.clone());
        }

        // `owner/name:version` ids post a pinned version, bare names post
        // the model reference.
        let payload = if let Some((_, version)) = model.rsplit_once(':') {
            map_object(json!({ "version": version, "input": input }))
        } else {
            map_object(json!({ "model": model, "input": input }))
        };

        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&api_key)
            .header("Prefer", "wait")
            .json(&Value::Object(payload.clone()))
            .send()
            .with_context(|| format!("Replicate request failed ({endpoint})"))?;
        let mut prediction = response_json_or_error("Replicate", response)?;
        let status = prediction
            .get("status")
            .and_then(Value::as_str)
            .map(|value| value.to_ascii_lowercase())
            .unwrap_or_default();
        if status != "succeeded" {
            if matches!(status.as_str(), "starting" | "processing") {
                let poll_url = prediction
                    .get("urls")
                    .and_then(Value::as_object)
                    .and_then(|obj| obj.get("get"))
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .ok_or_else(|| anyhow::anyhow!("Replicate prediction missing poll URL"))?;
                prediction =
                    self.poll_prediction(poll_url, &api_key, poll_interval_s, poll_timeout_s)?;
            } else {
                bail!("Replicate prediction failed: {}", prediction);
            }
        }

        let mut urls = Vec::new();
        if let Some(output) = prediction.get("output") {
            Self::extract_output_urls(output, &mut urls);
        }
        if urls.is_empty() {
            bail!("Replicate response returned no image URLs");
        }
        if (urls.len() as u64) < request.count {
            push_unique_warning(
                &mut warnings,
                format!(
                    "Replicate returned {} of {} requested images",
                    urls.len(),
                    request.count
                ),
            );
        }

        let stamp = timestamp_millis();
        let mut images = Vec::new();
        for (idx, url) in urls.iter().enumerate() {
            let fetched = download_image(&self.http, url, "Replicate")?;
            let ext = extension_from_mime(fetched.mime_type.as_deref(), "png");
            let image_path = request
                .out_dir
                .join(format!("artifact-{}-{:02}.{}", stamp, idx, ext));
            fs::write(&image_path, fetched.bytes)
                .with_context(|| format!("failed to write {}", image_path.display()))?;
            images.push(ProviderImage {
                image_path,
                width: request.width,
                height: request.height,
                source_url: Some(url.clone()),
            });
        }

        Ok(ProviderResponse {
            provider_request: map_object(json!({
                "endpoint": endpoint,
                "payload": payload,
            })),
            provider_response: map_object(json!({
                "prediction_id": prediction.get("id").cloned().unwrap_or(Value::Null),
                "status": prediction.get("status").cloned().unwrap_or(Value::Null),
            })),
            warnings,
            images,
        })
    }
}

struct OpenAiProvider {
    api_base: String,
    http: HttpClient,
}

impl OpenAiProvider {
    fn new() -> Self {
        Self {
            api_base: env::var("OPENAI_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            http: HttpClient::new(),
        }
    }

    fn api_key() -> Option<String> {
        non_empty_env("OPENAI_API_KEY")
    }

    fn resolve_model(request: &ProviderRequest) -> String {
        if let Some(model) = request
            .provider_options
            .get("model")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            return model.to_string();
        }
        let model = request.model.trim();
        // A Replicate-style id means the session default was left in
        // place; fall back to the OpenAI image model.
        if model.is_empty() || model.contains('/') || model.contains(':') {
            return "gpt-image-1".to_string();
        }
        model.to_string()
    }

    fn normalize_size(width: u32, height: u32, warnings: &mut Vec<String>) -> (&'static str, u32) {
        let longest = width.max(height);
        let (size, dim) = if longest <= 256 {
            ("256x256", 256)
        } else if longest <= 512 {
            ("512x512", 512)
        } else {
            ("1024x1024", 1024)
        };
        if width != dim || height != dim {
            push_unique_warning(
                warnings,
                format!("OpenAI size adjusted from {width}x{height} to {size}"),
            );
        }
        (size, dim)
    }
}

impl ImageProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn generate(&self, request: &ProviderRequest) -> Result<ProviderResponse> {
        let Some(api_key) = Self::api_key() else {
            bail!("OPENAI_API_KEY not set");
        };

        let endpoint = format!("{}/images/generations", self.api_base);
        let model = Self::resolve_model(request);
        let mut warnings = Vec::new();
        let (size, dim) = Self::normalize_size(request.width, request.height, &mut warnings);

        let payload = map_object(json!({
            "model": model,
            "prompt": request.prompt,
            "n": request.count,
            "size": size,
        }));
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&api_key)
            .json(&Value::Object(payload.clone()))
            .send()
            .with_context(|| format!("OpenAI request failed ({endpoint})"))?;
        let parsed = response_json_or_error("OpenAI", response)?;

        let Some(rows) = parsed.get("data").and_then(Value::as_array) else {
            bail!("OpenAI response missing data array");
        };

        let stamp = timestamp_millis();
        let mut images = Vec::new();
        for (idx, row) in rows.iter().enumerate() {
            let fetched = if let Some(encoded) = row.get("b64_json").and_then(Value::as_str) {
                ImageBytes {
                    bytes: BASE64
                        .decode(encoded.trim())
                        .context("OpenAI returned invalid base64 image data")?,
                    mime_type: Some("image/png".to_string()),
                }
            } else if let Some(url) = row.get("url").and_then(Value::as_str) {
                download_image(&self.http, url, "OpenAI")?
            } else {
                push_unique_warning(
                    &mut warnings,
                    "OpenAI item carried neither b64_json nor url".to_string(),
                );
                continue;
            };

            let ext = extension_from_mime(fetched.mime_type.as_deref(), "png");
            let image_path = request
                .out_dir
                .join(format!("artifact-{}-{:02}.{}", stamp, idx, ext));
            fs::write(&image_path, fetched.bytes)
                .with_context(|| format!("failed to write {}", image_path.display()))?;
            images.push(ProviderImage {
                image_path,
                width: dim,
                height: dim,
                source_url: row
                    .get("url")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            });
        }

        if images.is_empty() {
            bail!("OpenAI returned no images");
        }
        if (images.len() as u64) < request.count {
            push_unique_warning(
                &mut warnings,
                format!(
                    "OpenAI returned {} of {} requested images",
                    images.len(),
                    request.count
                ),
            );
        }

        Ok(ProviderResponse {
            provider_request: map_object(json!({
                "endpoint": endpoint,
                "payload": payload,
            })),
            provider_response: map_object(json!({
                "created": parsed.get("created").cloned().unwrap_or(Value::Null),
                "images": images.len(),
            })),
            warnings,
            images,
        })
    }
}

/// Fetches reference images for similarity checks. `http(s)` locators go
/// over the wire, anything else is read as a local path.
pub trait ReferenceFetcher: Send + Sync {
    fn fetch(&self, locator: &str) -> Result<Vec<u8>>;
}

pub struct HttpReferenceFetcher {
    http: HttpClient,
}

impl HttpReferenceFetcher {
    pub fn new() -> Self {
        Self {
            http: HttpClient::new(),
        }
    }
}

impl Default for HttpReferenceFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceFetcher for HttpReferenceFetcher {
    fn fetch(&self, locator: &str) -> Result<Vec<u8>> {
        let trimmed = locator.trim();
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            let fetched = download_image(&self.http, trimmed, "reference")?;
            return Ok(fetched.bytes);
        }
        fs::read(trimmed).with_context(|| format!("failed reading reference {trimmed}"))
    }
}

/// 64-bit DCT-based perceptual hash. Visually similar images map to
/// fingerprints within a small Hamming distance of each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(u64);

impl Fingerprint {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let image =
            image::load_from_memory(bytes).context("failed decoding image for fingerprint")?;
        Ok(Self(phash64(&image)))
    }

    pub fn distance(self, other: Self) -> u32 {
        (self.0 ^ other.0).count_ones()
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0.to_be_bytes())
    }
}

impl From<u64> for Fingerprint {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// All references within `threshold` of `generated`, ascending by
/// distance.
pub fn find_matches(
    generated: Fingerprint,
    references: &[(String, Fingerprint)],
    threshold: u32,
) -> Vec<SimilarityWarning> {
    let mut matches: Vec<SimilarityWarning> = references
        .iter()
        .map(|(reference, fingerprint)| SimilarityWarning {
            reference: reference.clone(),
            distance: generated.distance(*fingerprint),
        })
        .filter(|warning| warning.distance <= threshold)
        .collect();
    matches.sort_by(|a, b| {
        a.distance
            .cmp(&b.distance)
            .then_with(|| a.reference.cmp(&b.reference))
    });
    matches
}

fn phash64(image: &DynamicImage) -> u64 {
    let luma = image.resize_exact(32, 32, FilterType::Triangle).to_luma8();
    let mut pixels = [[0f64; 32]; 32];
    for (y, row) in pixels.iter_mut().enumerate() {
        for (x, value) in row.iter_mut().enumerate() {
            *value = luma.get_pixel(x as u32, y as u32)[0] as f64;
        }
    }

    let mut rows = [[0f64; 32]; 32];
    for (y, row) in pixels.iter().enumerate() {
        rows[y] = dct_32(row);
    }
    let mut freq = [[0f64; 32]; 32];
    for x in 0..32 {
        let mut column = [0f64; 32];
        for y in 0..32 {
            column[y] = rows[y][x];
        }
        let transformed = dct_32(&column);
        for y in 0..32 {
            freq[y][x] = transformed[y];
        }
    }

    let mut block = [0f64; 64];
    for y in 0..8 {
        for x in 0..8 {
            block[y * 8 + x] = freq[y][x];
        }
    }
    let mut sorted = block;
    sorted.sort_by(f64::total_cmp);
    let median = (sorted[31] + sorted[32]) / 2.0;

    let mut value = 0u64;
    for coefficient in block {
        value = (value << 1) | u64::from(coefficient > median);
    }
    value
}

fn dct_32(values: &[f64; 32]) -> [f64; 32] {
    let mut out = [0f64; 32];
    for (k, slot) in out.iter_mut().enumerate() {
        let mut sum = 0.0;
        for (i, value) in values.iter().enumerate() {
            sum += value
                * (std::f64::consts::PI / 32.0 * (i as f64 + 0.5) * k as f64).cos();
        }
        *slot = sum;
    }
    out
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid request: {message}")]
    InvalidRequest {
        message: String,
        quota: QuotaSnapshot,
    },
    #[error("daily quota exhausted on {}: {} of {} used", .quota.date, .quota.count, .quota.daily_limit)]
    QuotaExceeded { quota: QuotaSnapshot },
    #[error("no provider named '{name}' is registered (available: [{available}])")]
    UnknownProvider {
        name: String,
        available: String,
        quota: QuotaSnapshot,
    },
    #[error("image generation failed via {provider}: {message}")]
    GenerationFailed {
        provider: String,
        message: String,
        quota: QuotaSnapshot,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// The quota view at failure time, so callers can keep their
    /// displayed state fresh even on errors.
    pub fn quota(&self) -> Option<&QuotaSnapshot> {
        match self {
            EngineError::InvalidRequest { quota, .. }
            | EngineError::QuotaExceeded { quota }
            | EngineError::UnknownProvider { quota, .. }
            | EngineError::GenerationFailed { quota, .. } => Some(quota),
            EngineError::Internal(_) => None,
        }
    }
}

/// Orchestrates one generation request: quota check, clamp, provider
/// call, similarity pass, ledger update, receipt.
pub struct StudioEngine {
    out_dir: PathBuf,
    events: EventWriter,
    ledger: QuotaLedger,
    config: EngineConfig,
    providers: ProviderRegistry,
    fetcher: Box<dyn ReferenceFetcher>,
}

impl StudioEngine {
    pub fn new(
        out_dir: impl Into<PathBuf>,
        events_path: impl Into<PathBuf>,
        ledger_path: impl Into<PathBuf>,
        config: EngineConfig,
    ) -> Result<Self> {
        let ledger = QuotaLedger::new(
            Box::new(FileLedgerStore::new(ledger_path.into())),
            config.daily_limit,
        );
        Self::with_ledger(out_dir, events_path, ledger, config)
    }

    /// Construction seam for embedders and tests that supply their own
    /// ledger store.
    pub fn with_ledger(
        out_dir: impl Into<PathBuf>,
        events_path: impl Into<PathBuf>,
        ledger: QuotaLedger,
        config: EngineConfig,
    ) -> Result<Self> {
        let out_dir = out_dir.into();
        fs::create_dir_all(&out_dir)?;
        let session_id = out_dir
            .file_name()
            .and_then(|value| value.to_str())
            .filter(|value| !value.is_empty())
            .unwrap_or("session")
            .to_string();
        let events = EventWriter::new(events_path.into(), session_id);

        events.emit(
            "session_started",
            map_object(json!({
                "out_dir": out_dir.to_string_lossy().to_string(),
                "provider": config.provider,
                "daily_limit": ledger.daily_limit(),
            })),
        )?;

        Ok(Self {
            out_dir,
            events,
            ledger,
            config,
            providers: default_provider_registry(),
            fetcher: Box::new(HttpReferenceFetcher::new()),
        })
    }

    pub fn register_provider<P: ImageProvider + 'static>(&mut self, provider: P) {
        self.providers.register(provider);
    }

    pub fn set_reference_fetcher(&mut self, fetcher: Box<dyn ReferenceFetcher>) {
        self.fetcher = fetcher;
    }

    pub fn events(&self) -> &EventWriter {
        &self.events
    }

    pub fn generate(
        &mut self,
        request: &GenerationRequest,
    ) -> Result<GenerationBatch, EngineError> {
        let today = Local::now().date_naive();
        let quota_before = self.ledger.snapshot(today);
        if self.ledger.recovered() {
            self.events.emit(
                "ledger_recovered",
                map_object(json!({
                    "date": quota_before.date,
                    "note": "unreadable ledger treated as empty",
                })),
            )?;
        }

        let mut resolved = match request.resolve() {
            Ok(resolved) => resolved,
            Err(err) => {
                return Err(EngineError::InvalidRequest {
                    message: error_chain_text(&err, 512),
                    quota: quota_before,
                })
            }
        };

        self.events.emit(
            "quota_checked",
            map_object(json!({
                "date": quota_before.date,
                "used": quota_before.count,
                "remaining": quota_before.remaining,
            })),
        )?;

        if quota_before.remaining == 0 {
            self.events.emit(
                "quota_exhausted",
                map_object(json!({ "date": quota_before.date })),
            )?;
            return Err(EngineError::QuotaExceeded {
                quota: quota_before,
            });
        }

        if resolved.count > quota_before.remaining {
            resolved.count = quota_before.remaining;
            resolved.warnings.push(format!(
                "requested {} images but only {} remain today",
                resolved.requested, resolved.count
            ));
            self.events.emit(
                "request_clamped",
                map_object(json!({
                    "requested": resolved.requested,
                    "granted": resolved.count,
                })),
            )?;
        }

        let Some(provider) = self.providers.get(&self.config.provider) else {
            let available = self.providers.names().join(", ");
            self.events.emit(
                "generation_failed",
                map_object(json!({
                    "provider": self.config.provider,
                    "error": format!("provider not registered (available: [{available}])"),
                })),
            )?;
            let quota = self.finish_ledger(today, 0)?;
            return Err(EngineError::UnknownProvider {
                name: self.config.provider.clone(),
                available,
                quota,
            });
        };

        let provider_name = provider.name().to_string();
        let provider_request = ProviderRequest {
            out_dir: self.out_dir.clone(),
            prompt: resolved.prompt.clone(),
            width: resolved.width,
            height: resolved.height,
            steps: resolved.steps,
            count: resolved.count,
            model: self.config.model.clone(),
            provider_options: request.provider_options.clone(),
        };
        self.events.emit(
            "generation_started",
            map_object(json!({
                "provider": provider_name,
                "model": provider_request.model,
                "count": provider_request.count,
            })),
        )?;

        let started = Instant::now();
        let response = match provider.generate(&provider_request) {
            Ok(response) if !response.images.is_empty() => response,
            Ok(_) => {
                return self.fail_generation(
                    today,
                    anyhow::anyhow!("provider returned no images"),
                )
            }
            Err(err) => return self.fail_generation(today, err),
        };
        let produced = response.images.len() as u64;
        let latency_per_image_s = (started.elapsed().as_secs_f64() / produced as f64).max(0.0);

        let mut warnings = resolved.warnings.clone();
        for warning in &response.warnings {
            push_unique_warning(&mut warnings, warning.clone());
        }
        if produced != resolved.count {
            push_unique_warning(
                &mut warnings,
                format!(
                    "provider returned {} of {} requested images",
                    produced, resolved.count
                ),
            );
        }

        let (references, reference_faults) =
            self.fetch_reference_fingerprints(&request.reference_urls)?;

        let mut images = Vec::new();
        for provider_image in &response.images {
            let mut similarity = Vec::new();
            if !references.is_empty() {
                match fs::read(&provider_image.image_path)
                    .map_err(anyhow::Error::from)
                    .and_then(|bytes| Fingerprint::from_bytes(&bytes))
                {
                    Ok(fingerprint) => {
                        similarity = find_matches(
                            fingerprint,
                            &references,
                            self.config.similarity_threshold,
                        );
                        for warning in &similarity {
                            self.events.emit(
                                "similarity_warning",
                                map_object(json!({
                                    "image_path": provider_image
                                        .image_path
                                        .to_string_lossy()
                                        .to_string(),
                                    "reference": warning.reference,
                                    "distance": warning.distance,
                                })),
                            )?;
                        }
                    }
                    Err(err) => {
                        push_unique_warning(
                            &mut warnings,
                            format!(
                                "could not fingerprint {}: {}",
                                provider_image.image_path.display(),
                                error_chain_text(&err, 256)
                            ),
                        );
                    }
                }
            }
            self.events.emit(
                "image_generated",
                map_object(json!({
                    "image_path": provider_image.image_path.to_string_lossy().to_string(),
                    "similarity_warnings": similarity.len(),
                })),
            )?;
            images.push(GeneratedImage {
                image_path: provider_image.image_path.clone(),
                similarity,
            });
        }

        // Usage reflects what the provider actually produced; this is the
        // last state-bearing step of the request.
        let quota_after = self.finish_ledger(today, produced)?;
        let cost_usd = produced as f64 * self.config.unit_cost_usd;

        let batch_id = Uuid::new_v4().to_string();
        let receipt_path = self.out_dir.join(format!("receipt-{batch_id}.json"));
        let batch = GenerationBatch {
            batch_id: batch_id.clone(),
            provider: provider_name,
            model: provider_request.model.clone(),
            resolved,
            images,
            reference_faults,
            warnings,
            cost_usd,
            latency_per_image_s,
            usage: quota_after,
            receipt_path: Some(receipt_path.clone()),
        };
        let receipt = build_receipt(
            &batch,
            &response.provider_request,
            &response.provider_response,
        );
        write_receipt(&receipt_path, &receipt)?;

        self.events.emit(
            "batch_finished",
            map_object(json!({
                "batch_id": batch_id,
                "images": batch.images.len(),
                "cost_usd": batch.cost_usd,
                "remaining": batch.usage.remaining,
            })),
        )?;

        Ok(batch)
    }

    fn fail_generation(
        &mut self,
        today: NaiveDate,
        err: anyhow::Error,
    ) -> Result<GenerationBatch, EngineError> {
        let message = error_chain_text(&err, 2048);
        self.events.emit(
            "generation_failed",
            map_object(json!({
                "provider": self.config.provider,
                "error": message,
            })),
        )?;
        let quota = self.finish_ledger(today, 0)?;
        Err(EngineError::GenerationFailed {
            provider: self.config.provider.clone(),
            message,
            quota,
            source: err,
        })
    }

    // A zero increment still runs the update so every request leaves a
    // consistent post-state for the day it touched.
    fn finish_ledger(&mut self, today: NaiveDate, produced: u64) -> Result<QuotaSnapshot, EngineError> {
        let usage = self
            .ledger
            .record_usage(today, produced, self.config.unit_cost_usd)?;
        let snapshot = QuotaSnapshot::new(today, usage, self.ledger.daily_limit());
        self.events.emit(
            "usage_recorded",
            map_object(json!({
                "date": snapshot.date,
                "images": produced,
                "count": snapshot.count,
                "cost_usd": snapshot.cost_usd,
                "remaining": snapshot.remaining,
            })),
        )?;
        Ok(snapshot)
    }

    fn fetch_reference_fingerprints(
        &self,
        locators: &[String],
    ) -> Result<(Vec<(String, Fingerprint)>, Vec<ReferenceFault>), EngineError> {
        let mut references = Vec::new();
        let mut faults = Vec::new();
        for locator in locators {
            match self
                .fetcher
                .fetch(locator)
                .and_then(|bytes| Fingerprint::from_bytes(&bytes))
            {
                Ok(fingerprint) => references.push((locator.clone(), fingerprint)),
                Err(err) => {
                    let error = error_chain_text(&err, 512);
                    self.events.emit(
                        "reference_fetch_failed",
                        map_object(json!({
                            "reference": locator,
                            "error": error,
                        })),
                    )?;
                    faults.push(ReferenceFault {
                        reference: locator.clone(),
                        error,
                    });
                }
            }
        }
        Ok((references, faults))
    }
}

struct ImageBytes {
    bytes: Vec<u8>,
    mime_type: Option<String>,
}

fn download_image(http: &HttpClient, url: &str, label: &str) -> Result<ImageBytes> {
    let response = http
        .get(url)
        .send()
        .with_context(|| format!("failed downloading {label} image ({url})"))?;
    if !response.status().is_success() {
        let code = response.status().as_u16();
        let body = response.text().unwrap_or_default();
        bail!(
            "{label} image download failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let mime_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let bytes = response
        .bytes()
        .with_context(|| format!("failed reading {label} image bytes"))?
        .to_vec();
    Ok(ImageBytes { bytes, mime_type })
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn extension_from_mime(mime: Option<&str>, fallback: &'static str) -> &'static str {
    if let Some(mime) = mime {
        let lowered = mime.to_ascii_lowercase();
        if lowered.contains("jpeg") || lowered.contains("jpg") {
            return "jpg";
        }
        if lowered.contains("webp") {
            return "webp";
        }
        if lowered.contains("png") {
            return "png";
        }
    }
    fallback
}

fn write_flat_image(path: &Path, width: u32, height: u32, rgb: (u8, u8, u8)) -> Result<()> {
    let mut image = RgbImage::new(width.max(1), height.max(1));
    for pixel in image.pixels_mut() {
        *pixel = Rgb([rgb.0, rgb.1, rgb.2]);
    }
    image
        .save(path)
        .with_context(|| format!("failed to save {}", path.display()))?;
    Ok(())
}

fn color_from_prompt(prompt: &str, index: u64) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(index.to_be_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn push_unique_warning(warnings: &mut Vec<String>, message: String) {
    if message.trim().is_empty() {
        return;
    }
    if warnings.iter().any(|existing| existing == &message) {
        return;
    }
    warnings.push(message);
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0)
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
