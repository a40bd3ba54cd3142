//! AI edit adapter: request validation, transports and receipts.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat, Rgba};
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use uuid::Uuid;
use vitrine_contracts::edits::receipts::{build_receipt, write_receipt, EditReceiptRequest};
use vitrine_contracts::edits::{
    EditOptions, EditRegistry, EditTuning, GENERIC_PROMPT, MAX_REFERENCE_IMAGES,
};

use crate::config::VitrineConfig;
use crate::media::{extension_for_mime, sniff_mime};
use crate::{error_chain_text, map_object, truncate_text};

const MAX_UPSCALE_DIMENSION: u32 = 4096;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditWire {
    #[default]
    Json,
    Multipart,
}

impl EditWire {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Multipart => "multipart",
        }
    }
}

impl FromStr for EditWire {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "multipart" | "form" => Ok(Self::Multipart),
            other => Err(format!(
                "Unknown edit wire format '{other}' (expected json or multipart)."
            )),
        }
    }
}

impl fmt::Display for EditWire {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EditError {
    #[error("edit service rejected its API key")]
    InvalidApiKey,

    #[error("edit service unreachable: {0}")]
    NetworkError(String),

    #[error("edit service returned no image: {text}")]
    NoImageReturned { text: String },

    #[error("edit service failed ({status}): {message}")]
    ServiceError { status: u16, message: String },

    #[error("{count} reference images given, at most {max} allowed")]
    TooManyReferences { count: usize, max: usize },

    #[error("no source image to edit")]
    MissingImage,

    #[error("edit request could not be built: {0}")]
    InvalidRequest(String),
}

impl EditError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidApiKey => "invalid_api_key",
            Self::NetworkError(_) => "network_error",
            Self::NoImageReturned { .. } => "no_image_returned",
            Self::ServiceError { .. } => "service_error",
            Self::TooManyReferences { .. } => "too_many_references",
            Self::MissingImage => "missing_image",
            Self::InvalidRequest(_) => "invalid_request",
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            Self::InvalidApiKey => {
                "The AI service rejected its API key. Ask an administrator to check the server configuration."
                    .to_string()
            }
            Self::NetworkError(_) => {
                "Could not reach the AI service. Check your connection and try again.".to_string()
            }
            Self::NoImageReturned { .. } => {
                "The AI service answered without an image. Try another operation or prompt."
                    .to_string()
            }
            Self::ServiceError { status, .. } => {
                format!("The AI service failed (HTTP {status}). Try again in a moment.")
            }
            Self::TooManyReferences { max, .. } => {
                format!("Select at most {max} reference images.")
            }
            Self::MissingImage => "Select an image to edit first.".to_string(),
            Self::InvalidRequest(_) => {
                "The image could not be prepared for editing. Try re-adding it.".to_string()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl EditImage {
    pub fn new(bytes: Vec<u8>) -> Self {
        let mime_type = sniff_mime(&bytes).unwrap_or("image/png").to_string();
        Self { bytes, mime_type }
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, BASE64.encode(&self.bytes))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EditRequest {
    pub image: EditImage,
    pub operation: String,
    pub references: Vec<EditImage>,
    pub options: EditOptions,
    /// Replaces the operation's default instruction when set.
    pub prompt: Option<String>,
    pub tuning: EditTuning,
}

impl EditRequest {
    pub fn new(image: EditImage, operation: impl Into<String>) -> Self {
        Self {
            image,
            operation: operation.into(),
            references: Vec::new(),
            options: EditOptions::default(),
            prompt: None,
            tuning: EditTuning::default(),
        }
    }

    pub fn validate(&self) -> Result<(), EditError> {
        if self.image.bytes.is_empty() {
            return Err(EditError::MissingImage);
        }
        if self.references.len() > MAX_REFERENCE_IMAGES {
            return Err(EditError::TooManyReferences {
                count: self.references.len(),
                max: MAX_REFERENCE_IMAGES,
            });
        }
        Ok(())
    }

    /// Instruction sent to the service plus any fallback warnings.
    pub fn resolve_prompt(&self, registry: &EditRegistry) -> (String, Vec<String>) {
        let mut warnings = Vec::new();
        let base = match registry.resolve(&self.operation) {
            Ok(selection) => {
                warnings.extend(selection.fallback_reason);
                selection.prompt
            }
            Err(reason) => {
                warnings.push(reason);
                GENERIC_PROMPT.to_string()
            }
        };
        let prompt = self
            .prompt
            .as_deref()
            .map(str::trim)
            .filter(|prompt| !prompt.is_empty())
            .map(str::to_string)
            .unwrap_or(base);
        (prompt, warnings)
    }
}

/// Edit persisted by the service itself; adopted without re-uploading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEdit {
    pub public_url: String,
    pub thumbnail_url: Option<String>,
    pub run_id: Option<String>,
    pub storage_path: Option<String>,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOutcome {
    Image { bytes: Vec<u8>, mime_type: String },
    Stored(StoredEdit),
}

impl EditOutcome {
    fn summary(&self) -> Map<String, Value> {
        match self {
            Self::Image { bytes, mime_type } => map_object(json!({
                "kind": "image",
                "mime_type": mime_type,
                "bytes": bytes.len(),
            })),
            Self::Stored(stored) => map_object(json!({
                "kind": "stored",
                "url": stored.public_url,
                "thumbnail_url": stored.thumbnail_url,
                "run_id": stored.run_id,
                "storage_path": stored.storage_path,
            })),
        }
    }
}

pub trait EditTransport: Send + Sync {
    fn name(&self) -> &str;

    /// One attempt, no retry.
    fn submit(&self, request: &EditRequest, prompt: &str) -> Result<EditOutcome, EditError>;
}

#[derive(Default)]
pub struct EditorRegistry {
    editors: BTreeMap<String, Box<dyn EditTransport>>,
}

impl EditorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Local editor always; the proxy when one is configured.
    pub fn from_config(config: Option<&VitrineConfig>) -> anyhow::Result<Self> {
        let mut registry = Self::new();
        registry.register(LocalEditor::new());
        if let Some(proxy) = config.map(ProxyEditor::from_config).transpose()?.flatten() {
            registry.register(proxy);
        }
        Ok(registry)
    }

    pub fn register<T: EditTransport + 'static>(&mut self, editor: T) {
        self.editors
            .insert(editor.name().to_string(), Box::new(editor));
    }

    pub fn get(&self, name: &str) -> Option<&dyn EditTransport> {
        self.editors.get(name).map(|editor| editor.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.editors.keys().cloned().collect()
    }
}

/// Result of one edit attempt plus where its receipt landed.
#[derive(Debug)]
pub struct EditRun {
    pub result: Result<EditOutcome, EditError>,
    pub prompt: String,
    pub warnings: Vec<String>,
    pub receipt_path: Option<PathBuf>,
}

/// Validates, submits once and records a receipt under `receipts_dir`.
/// Receipt I/O failures are the only `Err`; edit failures land in `result`.
pub fn run_edit(
    transport: &dyn EditTransport,
    registry: &EditRegistry,
    request: &EditRequest,
    receipts_dir: Option<&Path>,
    slot: Option<&str>,
) -> anyhow::Result<EditRun> {
    let (prompt, warnings) = request.resolve_prompt(registry);
    if let Err(err) = request.validate() {
        return Ok(EditRun {
            result: Err(err),
            prompt,
            warnings,
            receipt_path: None,
        });
    }

    let result = transport.submit(request, &prompt);

    let receipt_path = match receipts_dir {
        Some(dir) => {
            let path = dir.join(format!(
                "edit-{}-{}.json",
                chrono::Utc::now().timestamp_millis(),
                &Uuid::new_v4().simple().to_string()[..8]
            ));
            let receipt_request = EditReceiptRequest {
                operation: request.operation.clone(),
                prompt: prompt.clone(),
                transport: transport.name().to_string(),
                slot: slot.map(str::to_string),
                image_bytes: request.image.bytes.len(),
                reference_count: request.references.len(),
                options: request.options.clone(),
                tuning: request.tuning.clone(),
            };
            let provider_request = map_object(json!({
                "transport": transport.name(),
                "editType": request.operation,
                "prompt": prompt,
                "image": request.image.mime_type,
                "referenceImages": request.references.len(),
                "options": request.options.to_map(),
            }));
            let (outcome, provider_response) = match &result {
                Ok(outcome) => ("ok", outcome.summary()),
                Err(err) => (
                    err.kind(),
                    map_object(json!({ "error": err.to_string() })),
                ),
            };
            let receipt = build_receipt(
                &receipt_request,
                &provider_request,
                &provider_response,
                outcome,
                &warnings,
                None,
            );
            write_receipt(&path, &receipt)
                .with_context(|| format!("failed writing receipt {}", path.display()))?;
            Some(path)
        }
        None => None,
    };

    Ok(EditRun {
        result,
        prompt,
        warnings,
        receipt_path,
    })
}

/// HTTP client for the server-side edit proxy. The provider key lives behind
/// the proxy; only the anon key is sent from here.
pub struct ProxyEditor {
    endpoint: String,
    wire: EditWire,
    anon_key: Option<String>,
    http: HttpClient,
}

impl ProxyEditor {
    pub fn new(endpoint: impl Into<String>, wire: EditWire, timeout_secs: f64) -> anyhow::Result<Self> {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs_f64(timeout_secs))
            .build()?;
        Ok(Self {
            endpoint: endpoint.into(),
            wire,
            anon_key: None,
            http,
        })
    }

    pub fn from_config(config: &VitrineConfig) -> anyhow::Result<Option<Self>> {
        let Some(endpoint) = config.edit_proxy_url.as_deref() else {
            return Ok(None);
        };
        let mut editor = Self::new(endpoint, config.edit_wire, config.request_timeout_secs)?;
        editor.anon_key = Some(config.anon_key.clone());
        Ok(Some(editor))
    }

    pub fn wire(&self) -> EditWire {
        self.wire
    }

    fn json_body(request: &EditRequest, prompt: &str) -> Value {
        let mut body = map_object(json!({
            "image": request.image.data_url(),
            "editType": request.operation,
            "prompt": prompt,
        }));
        if let Some(first) = request.references.first() {
            body.insert(
                "referenceImage".to_string(),
                Value::String(first.data_url()),
            );
        }
        if request.references.len() > 1 {
            body.insert(
                "referenceImages".to_string(),
                Value::Array(
                    request
                        .references
                        .iter()
                        .map(|reference| Value::String(reference.data_url()))
                        .collect(),
                ),
            );
        }
        if !request.options.is_empty() {
            body.insert(
                "options".to_string(),
                Value::Object(request.options.to_map()),
            );
        }
        let mut tuning = map_object(json!({
            "numInferenceSteps": request.tuning.num_inference_steps,
            "trueCfgScale": request.tuning.true_cfg_scale,
        }));
        if !request.tuning.negative_prompt.trim().is_empty() {
            tuning.insert(
                "negativePrompt".to_string(),
                Value::String(request.tuning.negative_prompt.clone()),
            );
        }
        body.insert("tuning".to_string(), Value::Object(tuning));
        Value::Object(body)
    }

    fn multipart_form(request: &EditRequest, prompt: &str) -> Result<Form, EditError> {
        let mut form = Form::new()
            .text("edit_type", request.operation.clone())
            .text("prompt", prompt.to_string())
            .text(
                "num_inference_steps",
                request.tuning.num_inference_steps.to_string(),
            )
            .text("true_cfg_scale", request.tuning.true_cfg_scale.to_string());
        if !request.tuning.negative_prompt.trim().is_empty() {
            form = form.text("negative_prompt", request.tuning.negative_prompt.clone());
        }
        for (key, value) in request.options.to_map() {
            if let Value::String(text) = value {
                form = form.text(key, text);
            }
        }
        form = form.part("image", file_part(&request.image, "image")?);
        for (idx, reference) in request.references.iter().enumerate() {
            form = form.part(
                "reference_image",
                file_part(reference, &format!("reference-{idx}"))?,
            );
        }
        Ok(form)
    }
}

fn file_part(image: &EditImage, stem: &str) -> Result<Part, EditError> {
    Part::bytes(image.bytes.clone())
        .file_name(format!("{stem}.{}", extension_for_mime(&image.mime_type)))
        .mime_str(&image.mime_type)
        .map_err(|err| {
            EditError::InvalidRequest(format!("invalid mime '{}': {err}", image.mime_type))
        })
}

impl EditTransport for ProxyEditor {
    fn name(&self) -> &str {
        "proxy"
    }

    fn submit(&self, request: &EditRequest, prompt: &str) -> Result<EditOutcome, EditError> {
        let mut builder = self.http.post(&self.endpoint);
        if let Some(key) = self.anon_key.as_ref() {
            builder = builder
                .header("apikey", key)
                .header("Authorization", format!("Bearer {key}"));
        }
        builder = match self.wire {
            EditWire::Json => builder.json(&Self::json_body(request, prompt)),
            EditWire::Multipart => builder.multipart(Self::multipart_form(request, prompt)?),
        };

        let response = builder
            .send()
            .map_err(|err| EditError::NetworkError(error_chain_text(&anyhow::Error::new(err), 300)))?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .map_err(|err| EditError::NetworkError(err.to_string()))?;
        classify_response(status, content_type.as_deref(), &body)
    }
}

/// Maps a proxy response onto the edit outcome taxonomy.
pub(crate) fn classify_response(
    status: u16,
    content_type: Option<&str>,
    body: &[u8],
) -> Result<EditOutcome, EditError> {
    let mime = content_type
        .and_then(|value| value.split(';').next())
        .map(|value| value.trim().to_ascii_lowercase())
        .unwrap_or_default();
    let text = String::from_utf8_lossy(body).to_string();

    if !(200..300).contains(&status) {
        if status == 401 || status == 403 || mentions_api_key(&text) {
            return Err(EditError::InvalidApiKey);
        }
        let message = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|value| error_message(&value))
            .unwrap_or(text);
        return Err(EditError::ServiceError {
            status,
            message: truncate_text(message.trim(), 300),
        });
    }

    if mime.starts_with("image/") {
        if body.is_empty() {
            return Err(EditError::NoImageReturned {
                text: String::new(),
            });
        }
        return Ok(EditOutcome::Image {
            bytes: body.to_vec(),
            mime_type: mime,
        });
    }

    let Ok(payload) = serde_json::from_str::<Value>(&text) else {
        return Err(EditError::NoImageReturned {
            text: truncate_text(text.trim(), 300),
        });
    };
    if let Some(message) = error_message(&payload) {
        if mentions_api_key(&message) {
            return Err(EditError::InvalidApiKey);
        }
        return Err(EditError::ServiceError { status, message });
    }

    let result = payload
        .get("result")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();
    if let Some(encoded) = result.strip_prefix("data:") {
        return decode_data_url(encoded);
    }
    if result.starts_with("http://") || result.starts_with("https://") {
        let field = |key: &str| {
            payload
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        return Ok(EditOutcome::Stored(StoredEdit {
            public_url: result,
            thumbnail_url: field("thumbnailUrl"),
            run_id: field("runId"),
            storage_path: field("storagePath"),
            mime_type: field("mimeType"),
        }));
    }
    Err(EditError::NoImageReturned {
        text: truncate_text(&result, 300),
    })
}

fn decode_data_url(encoded: &str) -> Result<EditOutcome, EditError> {
    let Some((header, data)) = encoded.split_once(',') else {
        return Err(EditError::NoImageReturned {
            text: "malformed data URL".to_string(),
        });
    };
    let mime_type = header.trim_end_matches(";base64").to_string();
    let bytes = BASE64
        .decode(data.trim())
        .map_err(|err| EditError::NoImageReturned {
            text: format!("undecodable data URL: {err}"),
        })?;
    if !mime_type.starts_with("image/") || bytes.is_empty() {
        return Err(EditError::NoImageReturned {
            text: format!("data URL carried {mime_type}"),
        });
    }
    Ok(EditOutcome::Image { bytes, mime_type })
}

fn error_message(payload: &Value) -> Option<String> {
    let error = payload.get("error")?;
    match error {
        Value::String(text) => Some(text.clone()),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

fn mentions_api_key(text: &str) -> bool {
    let lowered = text.to_ascii_lowercase();
    ["api key", "api_key", "apikey", "invalid key"]
        .iter()
        .any(|needle| lowered.contains(needle))
}

/// Offline editor applying deterministic pixel transforms; used for dry runs.
#[derive(Debug, Clone, Default)]
pub struct LocalEditor {
    registry: EditRegistry,
}

impl LocalEditor {
    pub fn new() -> Self {
        Self::default()
    }

    fn apply(&self, operation: &str, image: DynamicImage) -> DynamicImage {
        match operation {
            "remove_bg" => knock_out_white(&image),
            "replace_bg_auto" | "replace_bg_custom" | "replace_bg_studio" => {
                DynamicImage::ImageRgba8(knock_out_white(&image).to_rgba8()).brighten(10)
            }
            "enhance" => image.adjust_contrast(12.0),
            "enhance_lighting" => image.brighten(24),
            "upscale" => {
                let width = (image.width() * 2).min(MAX_UPSCALE_DIMENSION);
                let height = (image.height() * 2).min(MAX_UPSCALE_DIMENSION);
                image.resize_exact(width, height, FilterType::Triangle)
            }
            "colorize" => image.huerotate(35),
            "vintage" => image.grayscale().adjust_contrast(-18.0),
            "sketch" => {
                let mut sketch = image.grayscale();
                sketch.invert();
                sketch
            }
            "rotate_left" => image.rotate270(),
            "rotate_right" => image.rotate90(),
            "flip_horizontal" => image.fliph(),
            _ => image,
        }
    }
}

fn knock_out_white(image: &DynamicImage) -> DynamicImage {
    let mut rgba = image.to_rgba8();
    for pixel in rgba.pixels_mut() {
        let Rgba([r, g, b, _]) = *pixel;
        if r > 235 && g > 235 && b > 235 {
            *pixel = Rgba([r, g, b, 0]);
        }
    }
    DynamicImage::ImageRgba8(rgba)
}

impl EditTransport for LocalEditor {
    fn name(&self) -> &str {
        "local"
    }

    fn submit(&self, request: &EditRequest, _prompt: &str) -> Result<EditOutcome, EditError> {
        request.validate()?;
        let source = image::load_from_memory(&request.image.bytes)
            .map_err(|err| EditError::InvalidRequest(format!("decode failed: {err}")))?;
        let operation = self
            .registry
            .resolve(&request.operation)
            .map(|selection| selection.operation.id)
            .map_err(EditError::InvalidRequest)?;
        let edited = self.apply(&operation, source);
        if edited.dimensions().0 == 0 {
            return Err(EditError::NoImageReturned {
                text: "empty result".to_string(),
            });
        }
        let mut bytes = Vec::new();
        edited
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .map_err(|err| EditError::InvalidRequest(format!("encode failed: {err}")))?;
        Ok(EditOutcome::Image {
            bytes,
            mime_type: "image/png".to_string(),
        })
    }
}
