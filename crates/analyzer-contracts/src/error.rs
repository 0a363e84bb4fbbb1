use serde::Serialize;
use thiserror::Error;

/// Terminal failure of one submission. None of these are retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalysisError {
    #[error("Image Loading Error: {0}")]
    ImageLoading(String),

    #[error("API Error: {0}")]
    Api(String),

    #[error("Error: {0}")]
    General(String),
}

impl AnalysisError {
    pub fn image_loading(message: impl Into<String>) -> Self {
        Self::ImageLoading(message.into())
    }

    pub fn api(message: impl Into<String>) -> Self {
        Self::Api(message.into())
    }

    pub fn general(message: impl Into<String>) -> Self {
        Self::General(message.into())
    }

    /// Stable tag used in event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ImageLoading(_) => "image_loading",
            Self::Api(_) => "api",
            Self::General(_) => "general",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::ImageLoading(message) | Self::Api(message) | Self::General(message) => message,
        }
    }
}

impl Serialize for AnalysisError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type AnalysisResult<T> = Result<T, AnalysisError>;

/// Flattens an `anyhow` chain into one line, dropping repeated causes.
pub fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
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

pub fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
