use std::collections::BTreeMap;
use std::sync::Arc;

use analyzer_contracts::error::truncate_text;
use analyzer_contracts::prompt::{AnalysisRequest, ContentPart};
use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};

use crate::config::AnalyzerConfig;

#[derive(Debug, Clone)]
pub struct ProviderAnalysisRequest {
    pub model: String,
    pub content: AnalysisRequest,
}

#[derive(Debug, Clone, Default)]
pub struct ProviderAnalysisResponse {
    /// Concatenated text parts; `None` when the reply carried no text part at all.
    pub text: Option<String>,
    /// Block or finish reason reported alongside a reply without text.
    pub diagnostic: Option<String>,
    pub provider_request: Map<String, Value>,
    pub provider_response: Map<String, Value>,
}

pub trait AnalysisProvider: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, request: &ProviderAnalysisRequest) -> Result<ProviderAnalysisResponse>;
}

#[derive(Default, Clone)]
pub struct AnalysisProviderRegistry {
    providers: BTreeMap<String, Arc<dyn AnalysisProvider>>,
}

impl AnalysisProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: AnalysisProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.name().to_string(), Arc::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AnalysisProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    pub fn for_model(&self, model: &str) -> Option<Arc<dyn AnalysisProvider>> {
        self.get(provider_name_for_model(model))
    }
}

pub fn default_provider_registry(config: &AnalyzerConfig) -> AnalysisProviderRegistry {
    let mut providers = AnalysisProviderRegistry::new();
    providers.register(DryrunProvider);
    providers.register(GeminiProvider::new(config));
    providers
}

pub fn provider_name_for_model(model: &str) -> &'static str {
    if model.trim().to_ascii_lowercase().starts_with("dryrun") {
        "dryrun"
    } else {
        "gemini"
    }
}

/// Offline provider that answers in the `imageK:` format from decoded image sizes.
pub struct DryrunProvider;

impl AnalysisProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(&self, request: &ProviderAnalysisRequest) -> Result<ProviderAnalysisResponse> {
        let query = request
            .content
            .text()
            .and_then(|text| text.lines().map(str::trim).find(|line| !line.is_empty()))
            .unwrap_or_default();
        let mut lines = Vec::new();
        for part in &request.content.parts {
            let ContentPart::InlineData { data, .. } = part else {
                continue;
            };
            let index = lines.len() + 1;
            let line = match image::load_from_memory(data) {
                Ok(decoded) => format!(
                    "image{index}: Dry-run analysis of a {}x{} image for \"{query}\".",
                    decoded.width(),
                    decoded.height()
                ),
                Err(_) => format!("image{index}: Dry-run analysis of unreadable image data."),
            };
            lines.push(line);
        }
        let text = if lines.is_empty() {
            "Dry-run analysis: no images supplied.".to_string()
        } else {
            lines.join("\n")
        };

        Ok(ProviderAnalysisResponse {
            provider_request: map_object(json!({
                "endpoint": "dryrun-native",
                "model": request.model,
                "image_count": request.content.image_count(),
            })),
            provider_response: map_object(json!({
                "status": "ok",
                "chars": text.chars().count(),
            })),
            text: Some(text),
            diagnostic: None,
        })
    }
}

pub struct GeminiProvider {
    api_base: String,
    api_key: Option<String>,
    http: HttpClient,
}

impl GeminiProvider {
    pub fn new(config: &AnalyzerConfig) -> Self {
        Self {
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            http: HttpClient::new(),
        }
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn build_payload(request: &AnalysisRequest) -> Value {
        let parts = request
            .parts
            .iter()
            .map(|part| match part {
                ContentPart::InlineData { mime_type, data } => json!({
                    "inlineData": {
                        "mimeType": mime_type,
                        "data": BASE64.encode(data),
                    }
                }),
                ContentPart::Text(text) => json!({ "text": text }),
            })
            .collect::<Vec<Value>>();
        json!({
            "contents": [{
                "role": "user",
                "parts": parts,
            }]
        })
    }

    fn extract_reply_text(response_payload: &Value) -> Option<String> {
        let parts = response_payload
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|candidates| candidates.first())
            .and_then(|candidate| candidate.get("content"))
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)?;
        let texts = parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<&str>>();
        if texts.is_empty() {
            return None;
        }
        Some(texts.concat())
    }

    fn extract_diagnostic(response_payload: &Value) -> Option<String> {
        if let Some(reason) = response_payload
            .get("promptFeedback")
            .and_then(|feedback| feedback.get("blockReason"))
            .and_then(Value::as_str)
        {
            return Some(format!("prompt blocked ({reason})"));
        }
        response_payload
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|candidates| candidates.first())
            .and_then(|candidate| candidate.get("finishReason"))
            .and_then(Value::as_str)
            .filter(|reason| *reason != "STOP")
            .map(|reason| format!("finish reason {reason}"))
    }
}

impl AnalysisProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate(&self, request: &ProviderAnalysisRequest) -> Result<ProviderAnalysisResponse> {
        let Some(api_key) = self.api_key.as_deref() else {
            bail!("GEMINI_API_KEY or GOOGLE_API_KEY not set");
        };
        let endpoint = self.endpoint_for_model(&request.model);
        let payload = Self::build_payload(&request.content);

        let response = self
            .http
            .post(&endpoint)
            .header("x-goog-api-key", api_key)
            .json(&payload)
            .send()
            .with_context(|| format!("Gemini request failed ({endpoint})"))?;
        let response_payload = gemini_json_or_error(response)?;

        Ok(ProviderAnalysisResponse {
            text: Self::extract_reply_text(&response_payload),
            diagnostic: Self::extract_diagnostic(&response_payload),
            provider_request: map_object(json!({
                "endpoint": endpoint,
                "model": request.model,
                "image_count": request.content.image_count(),
            })),
            provider_response: map_object(json!({
                "candidates": response_payload
                    .get("candidates")
                    .and_then(Value::as_array)
                    .map(|rows| rows.len())
                    .unwrap_or(0),
                "model_version": response_payload.get("modelVersion").cloned().unwrap_or(Value::Null),
                "usage_metadata": response_payload.get("usageMetadata").cloned().unwrap_or(Value::Null),
            })),
        })
    }
}

/// Reads the body and turns non-success statuses into the provider's own error text.
fn gemini_json_or_error(response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .context("Gemini response body read failed")?;
    if !status.is_success() {
        bail!("{}", describe_gemini_failure(code, &body));
    }
    let parsed: Value =
        serde_json::from_str(&body).context("Gemini returned invalid JSON payload")?;
    Ok(parsed)
}

fn describe_gemini_failure(code: u16, body: &str) -> String {
    let error = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|parsed| parsed.get("error").cloned());
    let message = error
        .as_ref()
        .and_then(|error| error.get("message"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|message| !message.is_empty());
    let Some(message) = message else {
        return format!("Gemini request failed ({code}): {}", truncate_text(body, 512));
    };
    match error
        .as_ref()
        .and_then(|error| error.get("status"))
        .and_then(Value::as_str)
    {
        Some(status) => format!("Gemini request failed ({code} {status}): {message}"),
        None => format!("Gemini request failed ({code}): {message}"),
    }
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
