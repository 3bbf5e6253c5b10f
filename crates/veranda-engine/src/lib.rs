use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::RgbImage;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};
use veranda_contracts::events::{payload, EventWriter};
use veranda_contracts::job::JobSink;
use veranda_contracts::request::{GenerationRequest, PipelineOutcome, QualityVerdict};

pub const DEFAULT_MODEL: &str = "gemini-3-pro-image-preview";

/// Sleeps between rate-limited attempts. The fourth entry is headroom;
/// the attempt cap raises before it is ever consulted.
pub const RATE_LIMIT_BACKOFF_SECS: [u64; 4] = [10, 30, 60, 60];

const MAX_EDIT_ATTEMPTS: usize = 4;
const DEFAULT_TIMEOUT_SECS: f64 = 90.0;
const DEFAULT_GUIDANCE_SCALE: u32 = 70;

/// Score assumed when the quality-check call itself cannot be completed.
pub const QUALITY_CHECK_DEFAULT_SCORE: i64 = 85;

const IDENTICAL_RMS_THRESHOLD: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Cleanse,
    BuildOut,
    Install,
    QualityCheck,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::Cleanse => "cleanse",
            Stage::BuildOut => "build_out",
            Stage::Install => "install",
            Stage::QualityCheck => "quality_check",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("generative model is not configured: {0}")]
    NotConfigured(String),
    #[error("rate limit persisted after {attempts} attempts")]
    RateLimitExhausted { attempts: usize },
    #[error("{stage} edit failed: {message}")]
    Generation { stage: Stage, message: String },
    #[error("pipeline canceled before {stage}")]
    Canceled { stage: Stage },
}

// ---------------------------------------------------------------------------
// Model boundary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum ContentPart {
    Image(RgbImage),
    Text(String),
}

/// One "edit this image given this instruction" request. Parts are ordered:
/// source image first, an optional reference image next, the instruction
/// last. `include_thoughts` asks the model for interleaved reasoning text
/// alongside the image.
#[derive(Debug, Clone)]
pub struct EditRequest {
    pub parts: Vec<ContentPart>,
    pub include_thoughts: bool,
}

impl EditRequest {
    pub fn source_image(&self) -> Option<&RgbImage> {
        self.parts.iter().find_map(|part| match part {
            ContentPart::Image(image) => Some(image),
            ContentPart::Text(_) => None,
        })
    }

    pub fn instruction(&self) -> Option<&str> {
        self.parts.iter().rev().find_map(|part| match part {
            ContentPart::Text(text) => Some(text.as_str()),
            ContentPart::Image(_) => None,
        })
    }
}

#[derive(Debug, Clone)]
pub enum ReplyPart {
    Image {
        bytes: Vec<u8>,
        mime_type: Option<String>,
    },
    Text(String),
}

#[derive(Debug, Clone)]
pub struct EditResponse {
    pub parts: Vec<ReplyPart>,
}

/// Every edit call resolves to exactly one of these; a rate limit is not
/// an error with a magic status string, it is its own variant.
#[derive(Debug, Clone)]
pub enum EditReply {
    Completed(EditResponse),
    RateLimited,
    Failed(String),
}

pub trait EditModel: Send + Sync {
    fn name(&self) -> &str;
    fn edit(&self, request: &EditRequest) -> EditReply;
    /// Plain-text side call: show the model an image, get prose back.
    fn ask(&self, image: &RgbImage, question: &str) -> Result<String>;
}

// ---------------------------------------------------------------------------
// Gemini backend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub model: String,
    pub api_base: String,
    pub timeout_secs: f64,
    pub guidance_scale: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            api_base: default_api_base(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
        }
    }
}

impl ClientConfig {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_timeout_secs(mut self, secs: f64) -> Self {
        self.timeout_secs = secs.clamp(15.0, 300.0);
        self
    }
}

fn default_api_base() -> String {
    env::var("GEMINI_API_BASE")
        .ok()
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string())
}

pub struct GeminiModel {
    config: ClientConfig,
    api_key: String,
    http: HttpClient,
}

impl GeminiModel {
    pub fn from_env(config: ClientConfig) -> Result<Self, PipelineError> {
        let Some(api_key) = non_empty_env("GEMINI_API_KEY")
            .or_else(|| non_empty_env("GOOGLE_API_KEY"))
        else {
            return Err(PipelineError::NotConfigured(
                "GEMINI_API_KEY or GOOGLE_API_KEY not set".to_string(),
            ));
        };
        Ok(Self::with_api_key(config, api_key))
    }

    pub fn with_api_key(config: ClientConfig, api_key: impl Into<String>) -> Self {
        Self {
            config,
            api_key: api_key.into(),
            http: HttpClient::new(),
        }
    }

    fn endpoint(&self) -> String {
        let trimmed = self.config.model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.config.api_base, model_path)
    }

    fn post(&self, payload: &Value) -> Result<HttpResponse> {
        let endpoint = self.endpoint();
        self.http
            .post(&endpoint)
            .query(&[("key", self.api_key.as_str())])
            .timeout(Duration::from_secs_f64(self.config.timeout_secs))
            .json(payload)
            .send()
            .with_context(|| format!("model request failed ({endpoint})"))
    }

    fn wire_parts(parts: &[ContentPart]) -> Result<Vec<Value>> {
        parts
            .iter()
            .map(|part| match part {
                ContentPart::Image(image) => image_wire_part(image),
                ContentPart::Text(text) => Ok(json!({ "text": text })),
            })
            .collect()
    }

    fn generation_config(include_thoughts: bool, guidance_scale: u32) -> Value {
        let mut config = Map::new();
        let modalities = if include_thoughts {
            json!(["TEXT", "IMAGE"])
        } else {
            json!(["IMAGE"])
        };
        config.insert("responseModalities".to_string(), modalities);
        if include_thoughts {
            config.insert(
                "thinkingConfig".to_string(),
                json!({ "includeThoughts": true }),
            );
        }
        config.insert(
            "imageGenerationConfig".to_string(),
            json!({
                "guidanceScale": guidance_scale,
                "personGeneration": "dont_generate_people",
            }),
        );
        Value::Object(config)
    }

    fn reply_parts(response_payload: &Value) -> Result<Vec<ReplyPart>> {
        let candidates = response_payload
            .get("candidates")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut out = Vec::new();

        for candidate in candidates {
            let parts = candidate
                .get("content")
                .and_then(Value::as_object)
                .and_then(|content| content.get("parts"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for part in parts {
                let inline = part
                    .get("inlineData")
                    .or_else(|| part.get("inline_data"))
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                let data = inline
                    .get("data")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if !data.is_empty() {
                    let bytes = BASE64
                        .decode(data.as_bytes())
                        .context("reply image base64 decode failed")?;
                    let mime_type = inline
                        .get("mimeType")
                        .or_else(|| inline.get("mime_type"))
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    out.push(ReplyPart::Image { bytes, mime_type });
                    continue;
                }
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    out.push(ReplyPart::Text(text.to_string()));
                }
            }
        }

        Ok(out)
    }
}

impl EditModel for GeminiModel {
    fn name(&self) -> &str {
        "gemini"
    }

    fn edit(&self, request: &EditRequest) -> EditReply {
        let parts = match Self::wire_parts(&request.parts) {
            Ok(parts) => parts,
            Err(err) => return EditReply::Failed(format!("{err:#}")),
        };
        let payload = json!({
            "contents": [{ "role": "user", "parts": parts }],
            "generationConfig": Self::generation_config(
                request.include_thoughts,
                self.config.guidance_scale,
            ),
        });

        let response = match self.post(&payload) {
            Ok(response) => response,
            Err(err) => return EditReply::Failed(format!("{err:#}")),
        };
        let status = response.status();
        if status.as_u16() == 429 {
            return EditReply::RateLimited;
        }
        let body = match response.text() {
            Ok(body) => body,
            Err(err) => return EditReply::Failed(format!("response body read failed: {err}")),
        };
        if !status.is_success() {
            return EditReply::Failed(format!(
                "model request failed ({}): {}",
                status.as_u16(),
                truncate_text(&body, 512)
            ));
        }
        let parsed: Value = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(err) => return EditReply::Failed(format!("invalid JSON payload: {err}")),
        };
        match Self::reply_parts(&parsed) {
            Ok(parts) => EditReply::Completed(EditResponse { parts }),
            Err(err) => EditReply::Failed(format!("{err:#}")),
        }
    }

    fn ask(&self, image: &RgbImage, question: &str) -> Result<String> {
        let payload = json!({
            "contents": [{
                "role": "user",
                "parts": [image_wire_part(image)?, json!({ "text": question })],
            }],
        });
        let response = self.post(&payload)?;
        let parsed = response_json_or_error(response)?;
        let text = Self::reply_parts(&parsed)?
            .into_iter()
            .filter_map(|part| match part {
                ReplyPart::Text(text) => Some(text),
                ReplyPart::Image { .. } => None,
            })
            .collect::<Vec<String>>()
            .join("\n");
        if text.trim().is_empty() {
            bail!("model returned no text");
        }
        Ok(text)
    }
}

// ---------------------------------------------------------------------------
// Retry-aware edit client
// ---------------------------------------------------------------------------

pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Wraps an [`EditModel`] with the retry policy: rate limits back off on a
/// fixed schedule, anything else fails fast, and an image-less success
/// degrades to the source image instead of aborting the run.
pub struct EditClient {
    model: Arc<dyn EditModel>,
    sleeper: Arc<dyn Sleeper>,
}

impl EditClient {
    pub fn new(model: Arc<dyn EditModel>) -> Self {
        Self::with_sleeper(model, Arc::new(ThreadSleeper))
    }

    pub fn with_sleeper(model: Arc<dyn EditModel>, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { model, sleeper }
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    pub fn ask(&self, image: &RgbImage, question: &str) -> Result<String> {
        self.model.ask(image, question)
    }

    pub fn edit(
        &self,
        stage: Stage,
        request: &EditRequest,
        warnings: &mut Vec<String>,
    ) -> Result<RgbImage, PipelineError> {
        for attempt in 1..=MAX_EDIT_ATTEMPTS {
            match self.model.edit(request) {
                EditReply::Completed(response) => {
                    return Self::image_from_reply(stage, request, response, warnings);
                }
                EditReply::RateLimited => {
                    if attempt == MAX_EDIT_ATTEMPTS {
                        return Err(PipelineError::RateLimitExhausted { attempts: attempt });
                    }
                    let wait = RATE_LIMIT_BACKOFF_SECS[attempt - 1];
                    warnings.push(format!(
                        "rate limit hit during {stage} (attempt {attempt}/{MAX_EDIT_ATTEMPTS}); retrying in {wait}s"
                    ));
                    self.sleeper.sleep(Duration::from_secs(wait));
                }
                EditReply::Failed(message) => {
                    return Err(PipelineError::Generation { stage, message });
                }
            }
        }

        unreachable!("edit retry loop always returns a result")
    }

    fn image_from_reply(
        stage: Stage,
        request: &EditRequest,
        response: EditResponse,
        warnings: &mut Vec<String>,
    ) -> Result<RgbImage, PipelineError> {
        for part in &response.parts {
            if let ReplyPart::Image { bytes, .. } = part {
                return decode_image(bytes).map_err(|err| PipelineError::Generation {
                    stage,
                    message: format!("{err:#}"),
                });
            }
        }

        // No image came back. Treat it as a no-op edit and keep the run
        // alive with the source image, which is distinct from a hard error.
        warnings.push(format!(
            "model returned no image payload during {stage}; keeping the source image"
        ));
        match request.source_image() {
            Some(image) => Ok(image.clone()),
            None => Err(PipelineError::Generation {
                stage,
                message: "reply carried no image and neither did the request".to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Prompt library
// ---------------------------------------------------------------------------

pub mod prompts {
    pub const DEFAULT_SCREEN_COLOR: &str = "black";

    pub const CLEANSE: &str = "Edit this image. Remove all visual clutter (hoses, trash, \
        debris), people, and loose furniture from the outdoor area. Fix the lighting. Do not \
        change the house structure or camera angle. Keep the canvas exact.";

    pub const BUILD_OUT: &str = "Edit this image. Add structural build-outs (columns/headers) \
        where indicated. Ensure the new structure matches the house texture. Clean the image \
        again so the new structure blends perfectly with the environment.";

    pub const STRUCTURE_QUESTION: &str = "Analyze this image of a house. Does the patio or \
        outdoor area require structural build-out (like pillars, beams, or headers) to support \
        a motorized screen? Answer with YES or NO only.";

    /// Install instruction. With a reference on hand the screen color and
    /// texture are matched to it; without one an explicit color is named.
    pub fn install(opacity: &str, color: Option<&str>, has_reference: bool) -> String {
        let texture_clause = if has_reference {
            "Using the Reference Image for texture: "
        } else {
            ""
        };
        let color_instruction = if has_reference {
            "Match the screen color and texture to the Reference Image.".to_string()
        } else {
            format!("Screen Color: {}.", color.unwrap_or(DEFAULT_SCREEN_COLOR))
        };
        format!(
            "Edit this image. {texture_clause}Install motorized screens into the openings. \
             {color_instruction} Opacity: {opacity}%. The screens must be fully down. Do not \
             add visible bars or beams inside the opening beyond its outer edge. The image \
             must remain clean overall (no clutter re-appearing). Maintain high-fidelity \
             architectural details. Do not change the perspective."
        )
    }

    pub fn quality_check(mesh_type: &str) -> String {
        format!(
            "Check this image against these constraints:\n\
             1. Is the fabric color plausible for a screen?\n\
             2. Is the opacity consistent with {mesh_type} screens?\n\
             3. Are ALL openings screened?\n\
             4. Is the image clean (no re-introduced clutter)?\n\
             5. Are there hallucinated structural elements?\n\
             Respond with a line 'SCORE: <0-100>' and a line 'VERDICT: PASS' or 'VERDICT: FAIL'."
        )
    }
}

// ---------------------------------------------------------------------------
// Reference image store
// ---------------------------------------------------------------------------

/// Exemplar screens keyed by opacity bucket, loaded once at construction.
/// A missing bucket is a warning, never an error; callers branch on
/// [`ReferenceImageStore::get`] returning `None`.
pub struct ReferenceImageStore {
    references: BTreeMap<String, RgbImage>,
    warnings: Vec<String>,
}

impl ReferenceImageStore {
    pub fn load(base_dir: impl AsRef<Path>) -> Self {
        let base_dir = base_dir.as_ref();
        let mut references = BTreeMap::new();
        let mut warnings = Vec::new();

        for opacity in veranda_contracts::request::SUPPORTED_OPACITIES {
            let master_dir = base_dir.join(opacity).join("master");
            match first_reference_image(&master_dir) {
                Ok(Some(image)) => {
                    references.insert(opacity.to_string(), image);
                }
                Ok(None) => warnings.push(format!(
                    "no reference image found under {}",
                    master_dir.display()
                )),
                Err(err) => warnings.push(format!(
                    "failed scanning references for opacity {opacity}: {err:#}"
                )),
            }
        }

        Self {
            references,
            warnings,
        }
    }

    pub fn empty() -> Self {
        Self {
            references: BTreeMap::new(),
            warnings: Vec::new(),
        }
    }

    pub fn get(&self, opacity: &str) -> Option<&RgbImage> {
        self.references.get(opacity)
    }

    pub fn loaded_opacities(&self) -> Vec<String> {
        self.references.keys().cloned().collect()
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

fn first_reference_image(dir: &Path) -> Result<Option<RgbImage>> {
    if !dir.is_dir() {
        return Ok(None);
    }
    let mut candidates: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("failed reading {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| {
                    matches!(ext.to_ascii_lowercase().as_str(), "jpg" | "jpeg" | "png")
                })
                .unwrap_or(false)
        })
        .collect();
    candidates.sort();

    for path in candidates {
        match image::open(&path) {
            Ok(image) => return Ok(Some(image.to_rgb8())),
            Err(_) => continue,
        }
    }
    Ok(None)
}

// ---------------------------------------------------------------------------
// Quality gate
// ---------------------------------------------------------------------------

/// Parse a free-text verdict into a [`QualityVerdict`]. Liberal by design:
/// an unparsed score is 0, a bare affirmative token without a FAIL token
/// still passes, and nothing here ever panics on odd input.
pub fn parse_verdict(text: &str) -> QualityVerdict {
    let upper = text.to_uppercase();
    let score = extract_score(&upper).unwrap_or(0);
    let passed = if upper.contains("VERDICT: PASS") || upper.contains("VERDICT:PASS") {
        true
    } else if upper.contains("VERDICT: FAIL") || upper.contains("VERDICT:FAIL") {
        false
    } else {
        upper.contains("PASS") && !upper.contains("FAIL")
    };
    QualityVerdict { score, passed }
}

fn extract_score(upper: &str) -> Option<i64> {
    let marker = upper.find("SCORE:")?;
    let digits: String = upper[marker + "SCORE:".len()..]
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse::<i64>().ok().map(|score| score.clamp(0, 100))
}

// ---------------------------------------------------------------------------
// Similarity guard
// ---------------------------------------------------------------------------

/// Whether two renders are effectively the same picture: exact equality, or
/// a difference small enough to be compression noise (RMS of the channel
/// difference histogram under the tuned threshold).
pub fn effectively_identical(left: &RgbImage, right: &RgbImage) -> bool {
    if left.dimensions() != right.dimensions() {
        return false;
    }

    let mut histogram = [0u64; 256];
    let mut any_diff = false;
    for (a, b) in left.as_raw().iter().zip(right.as_raw().iter()) {
        let diff = a.abs_diff(*b);
        if diff != 0 {
            any_diff = true;
        }
        histogram[diff as usize] += 1;
    }
    if !any_diff {
        return true;
    }

    let samples = f64::from(left.width()) * f64::from(left.height()) * 3.0;
    let sum: f64 = histogram
        .iter()
        .enumerate()
        .map(|(value, count)| *count as f64 * (value * value) as f64)
        .sum();
    (sum / samples).sqrt() < IDENTICAL_RMS_THRESHOLD
}

// ---------------------------------------------------------------------------
// Stage artifacts
// ---------------------------------------------------------------------------

/// Where intermediate stage images go. Purely observability; the null sink
/// is the default.
pub trait ArtifactSink: Send + Sync {
    fn save(&self, label: &str, image: &RgbImage) -> Option<PathBuf>;
}

pub struct NullArtifactSink;

impl ArtifactSink for NullArtifactSink {
    fn save(&self, _label: &str, _image: &RgbImage) -> Option<PathBuf> {
        None
    }
}

/// Writes `pipeline_<stamp>_<label>.png` into a directory, best effort.
pub struct DirArtifactSink {
    dir: PathBuf,
}

impl DirArtifactSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ArtifactSink for DirArtifactSink {
    fn save(&self, label: &str, image: &RgbImage) -> Option<PathBuf> {
        if fs::create_dir_all(&self.dir).is_err() {
            return None;
        }
        let path = self
            .dir
            .join(format!("pipeline_{}_{}.png", timestamp_millis(), label));
        match image.save(&path) {
            Ok(()) => Some(path),
            Err(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative cancellation checked between stages; an in-flight model call
/// is never interrupted.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// The four-stage visualization pipeline: restore the scene, optionally
/// frame the opening, render the screens, then score the result with a
/// single bounded retry of the render.
pub struct ScreenPipeline {
    client: EditClient,
    references: ReferenceImageStore,
    artifacts: Box<dyn ArtifactSink>,
    events: EventWriter,
    cancel: CancelToken,
}

impl ScreenPipeline {
    pub fn new(
        client: EditClient,
        references: ReferenceImageStore,
        events: EventWriter,
    ) -> Self {
        Self {
            client,
            references,
            artifacts: Box::new(NullArtifactSink),
            events,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_artifact_sink(mut self, sink: Box<dyn ArtifactSink>) -> Self {
        self.artifacts = sink;
        self
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn reference_warnings(&self) -> &[String] {
        self.references.warnings()
    }

    pub fn process(
        &self,
        request: &GenerationRequest,
        job: &dyn JobSink,
    ) -> Result<PipelineOutcome, PipelineError> {
        let result = self.run_stages(request, job);
        match &result {
            Ok(outcome) => self.emit(
                "pipeline_finished",
                json!({
                    "quality_score": outcome.quality_score,
                    "attempts": outcome.attempts.len(),
                    "warnings": outcome.warnings,
                }),
            ),
            Err(err) => self.emit("pipeline_failed", json!({ "error": err.to_string() })),
        }
        result
    }

    fn run_stages(
        &self,
        request: &GenerationRequest,
        job: &dyn JobSink,
    ) -> Result<PipelineOutcome, PipelineError> {
        let mut warnings = Vec::new();
        let (width, height) = request.image.dimensions();
        self.emit(
            "pipeline_started",
            json!({
                "model": self.client.model_name(),
                "opacity": request.resolved_opacity(),
                "color": request.color,
                "mesh_type": request.mesh_type,
                "width": width,
                "height": height,
            }),
        );

        // Stage 1: the cleanse. Always runs; client errors propagate.
        self.ensure_active(Stage::Cleanse)?;
        job.update_progress(35, "Restoring the scene");
        self.emit("stage_started", json!({ "stage": Stage::Cleanse.name() }));
        let clean = self.client.edit(
            Stage::Cleanse,
            &EditRequest {
                parts: vec![
                    ContentPart::Image(request.image.clone()),
                    ContentPart::Text(prompts::CLEANSE.to_string()),
                ],
                include_thoughts: true,
            },
            &mut warnings,
        )?;
        self.save_artifact("1_cleanse", &clean);
        self.emit_stage_completed(Stage::Cleanse, &clean);

        // Stage 2: conditional build-out. The analysis is advisory; a failed
        // call means "no build-out", never a failed run.
        self.ensure_active(Stage::BuildOut)?;
        job.update_progress(50, "Assessing structure");
        let needs_build = match self.client.ask(&clean, prompts::STRUCTURE_QUESTION) {
            Ok(answer) => {
                let affirmative = answer.to_uppercase().contains("YES");
                self.emit(
                    "structure_analyzed",
                    json!({ "needs_build_out": affirmative }),
                );
                affirmative
            }
            Err(err) => {
                warnings.push(format!("structure analysis defaulted to NO: {err:#}"));
                false
            }
        };
        let staged = if needs_build {
            self.emit("stage_started", json!({ "stage": Stage::BuildOut.name() }));
            let built = self.client.edit(
                Stage::BuildOut,
                &EditRequest {
                    parts: vec![
                        ContentPart::Image(clean.clone()),
                        ContentPart::Text(prompts::BUILD_OUT.to_string()),
                    ],
                    include_thoughts: true,
                },
                &mut warnings,
            )?;
            self.save_artifact("2_build_out", &built);
            self.emit_stage_completed(Stage::BuildOut, &built);
            built
        } else {
            self.save_artifact("2_build_skipped", &clean);
            clean.clone()
        };

        // Stage 3: the install.
        self.ensure_active(Stage::Install)?;
        job.update_progress(65, "Installing screens");
        let opacity = request.resolved_opacity();
        let reference = self.references.get(opacity);
        if reference.is_none() {
            warnings.push(format!(
                "no reference image for opacity {opacity}; proceeding without reference"
            ));
        }
        let installed = self.install(&staged, reference, request, false, &mut warnings)?;
        self.save_artifact("3_install", &installed);
        self.emit_stage_completed(Stage::Install, &installed);

        // Stage 4: the check, then at most one retry of the install.
        job.update_progress(80, "Scoring the result");
        let verdict = self.quality_check(&installed, &request.mesh_type, 1, &mut warnings);
        let mut attempts = vec![verdict];

        let (final_image, quality_score) = if verdict.passed {
            self.save_artifact("4_final_passed", &installed);
            (installed, verdict.score)
        } else {
            self.ensure_active(Stage::Install)?;
            self.emit("install_retry", json!({ "first_score": verdict.score }));
            let retried = self.install(&staged, reference, request, true, &mut warnings)?;
            self.save_artifact("4_final_retry", &retried);
            let retried_verdict =
                self.quality_check(&retried, &request.mesh_type, 2, &mut warnings);
            attempts.push(retried_verdict);
            (retried, retried_verdict.score)
        };

        if effectively_identical(&request.image, &final_image) {
            self.emit(
                "identical_output",
                json!({
                    "severity": "critical",
                    "message": "final image is identical to the input; the edit was a no-op",
                }),
            );
            warnings
                .push("final image is identical to the input; the edit was a no-op".to_string());
        }

        Ok(PipelineOutcome {
            clean_image: clean,
            final_image,
            quality_score,
            attempts,
            warnings,
        })
    }

    fn install(
        &self,
        image: &RgbImage,
        reference: Option<&RgbImage>,
        request: &GenerationRequest,
        retry: bool,
        warnings: &mut Vec<String>,
    ) -> Result<RgbImage, PipelineError> {
        let instruction = prompts::install(
            request.resolved_opacity(),
            request.color.as_deref(),
            reference.is_some(),
        );
        self.emit(
            "stage_started",
            json!({ "stage": Stage::Install.name(), "retry": retry }),
        );

        let mut parts = vec![ContentPart::Image(image.clone())];
        if let Some(reference) = reference {
            parts.push(ContentPart::Image(reference.clone()));
        }
        parts.push(ContentPart::Text(instruction));

        self.client.edit(
            Stage::Install,
            &EditRequest {
                parts,
                include_thoughts: false,
            },
            warnings,
        )
    }

    fn quality_check(
        &self,
        image: &RgbImage,
        mesh_type: &str,
        attempt: u64,
        warnings: &mut Vec<String>,
    ) -> QualityVerdict {
        let verdict = match self.client.ask(image, &prompts::quality_check(mesh_type)) {
            Ok(reply) => parse_verdict(&reply),
            Err(err) => {
                // The check is advisory; a broken checker must not block an
                // otherwise finished render.
                warnings.push(format!(
                    "quality check defaulted to PASS (attempt {attempt}): {err:#}"
                ));
                QualityVerdict {
                    score: QUALITY_CHECK_DEFAULT_SCORE,
                    passed: true,
                }
            }
        };
        self.emit(
            "quality_checked",
            json!({
                "attempt": attempt,
                "score": verdict.score,
                "passed": verdict.passed,
            }),
        );
        verdict
    }

    fn ensure_active(&self, stage: Stage) -> Result<(), PipelineError> {
        if self.cancel.is_canceled() {
            return Err(PipelineError::Canceled { stage });
        }
        Ok(())
    }

    fn save_artifact(&self, label: &str, image: &RgbImage) {
        if let Some(path) = self.artifacts.save(label, image) {
            self.emit(
                "artifact_saved",
                json!({ "label": label, "path": path.to_string_lossy() }),
            );
        }
    }

    fn emit_stage_completed(&self, stage: Stage, image: &RgbImage) {
        let (width, height) = image.dimensions();
        self.emit(
            "stage_completed",
            json!({ "stage": stage.name(), "width": width, "height": height }),
        );
    }

    fn emit(&self, event_type: &str, fields: Value) {
        let _ = self.events.emit(event_type, payload(fields));
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, image::ImageFormat::Png)
        .context("png encode failed")?;
    Ok(buffer.into_inner())
}

pub fn decode_image(bytes: &[u8]) -> Result<RgbImage> {
    Ok(image::load_from_memory(bytes)
        .context("could not decode reply image")?
        .to_rgb8())
}

fn image_wire_part(image: &RgbImage) -> Result<Value> {
    let bytes = encode_png(image)?;
    Ok(json!({
        "inlineData": {
            "mimeType": "image/png",
            "data": BASE64.encode(bytes),
        }
    }))
}

fn response_json_or_error(response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response.text().context("response body read failed")?;
    if !status.is_success() {
        bail!(
            "model request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value =
        serde_json::from_str(&body).context("model returned invalid JSON payload")?;
    Ok(parsed)
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0)
}
