//! # Image API
//!
//! Image generation collaborator and its failure taxonomy. Quota,
//! eligibility and serialization failures are final; transport failures
//! are retried.

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::ImageStyle;
use crate::orchestration::retry::Retryable;

/// Raw generated image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImageError {
    #[error("image quota exhausted: {0}")]
    QuotaExhausted(String),
    /// Account or organization not allowed to use the model
    #[error("not eligible for image generation: {0}")]
    Ineligible(String),
    #[error("image payload serialization failed: {0}")]
    Serialization(String),
    #[error("transient image API failure: {0}")]
    Transient(String),
    /// Prompt refused or request invalid
    #[error("image request rejected: {0}")]
    Rejected(String),
}

impl Retryable for ImageError {
    fn is_retryable(&self) -> bool {
        matches!(self, ImageError::Transient(_))
    }

    fn timed_out(after: Duration) -> Self {
        ImageError::Transient(format!("image generation exceeded {:?}", after))
    }
}

#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(&self, prompt: &str, style: &ImageStyle) -> Result<GeneratedImage, ImageError>;
}

#[derive(Debug, Serialize)]
struct GenerationRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    size: &'a str,
    quality: &'a str,
    n: u32,
}

#[derive(Debug, Deserialize)]
struct GenerationResponse {
    #[serde(default)]
    data: Vec<GenerationData>,
}

#[derive(Debug, Deserialize)]
struct GenerationData {
    #[serde(default)]
    b64_json: Option<String>,
}

/// OpenAI images endpoint (`/images/generations`)
pub struct OpenAiImageGenerator {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OpenAiImageGenerator {
    pub fn new(base_url: Option<&str>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            base_url: base_url
                .unwrap_or("https://api.openai.com/v1")
                .trim_end_matches('/')
                .to_string(),
            model: "gpt-image-1".to_string(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

#[async_trait]
impl ImageGenerator for OpenAiImageGenerator {
    async fn generate(&self, prompt: &str, style: &ImageStyle) -> Result<GeneratedImage, ImageError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ImageError::Ineligible("OPENAI_API_KEY is not set".to_string()))?;

        let body = serde_json::to_vec(&GenerationRequest {
            model: &self.model,
            prompt,
            size: &style.size,
            quality: &style.quality,
            n: 1,
        })
        .map_err(|e| ImageError::Serialization(e.to_string()))?;

        let response = self
            .client
            .post(format!("{}/images/generations", self.base_url))
            .bearer_auth(api_key)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| ImageError::Transient(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ImageError::Transient(e.to_string()))?;

        if !status.is_success() {
            return Err(classify_status(status.as_u16(), &text));
        }

        decode_response(&text)
    }
}

/// Map a failed HTTP response onto the taxonomy
pub fn classify_status(status: u16, body: &str) -> ImageError {
    let lower = body.to_lowercase();
    let quota = lower.contains("insufficient_quota")
        || lower.contains("billing_hard_limit")
        || lower.contains("billing");
    let ineligible = lower.contains("must be verified")
        || lower.contains("verify organization")
        || lower.contains("organization verification");
    let detail = format!("HTTP {}: {}", status, body.chars().take(300).collect::<String>());

    match status {
        429 if quota => ImageError::QuotaExhausted(detail),
        429 => ImageError::Transient(detail),
        400 if quota => ImageError::QuotaExhausted(detail),
        403 if quota => ImageError::QuotaExhausted(detail),
        401 | 403 => ImageError::Ineligible(detail),
        400 if ineligible => ImageError::Ineligible(detail),
        408 => ImageError::Transient(detail),
        s if s >= 500 => ImageError::Transient(detail),
        _ => ImageError::Rejected(detail),
    }
}

fn decode_response(text: &str) -> Result<GeneratedImage, ImageError> {
    let parsed: GenerationResponse =
        serde_json::from_str(text).map_err(|e| ImageError::Serialization(e.to_string()))?;

    let encoded = parsed
        .data
        .into_iter()
        .find_map(|d| d.b64_json)
        .ok_or_else(|| ImageError::Serialization("response carried no image data".to_string()))?;

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.as_bytes())
        .map_err(|e| ImageError::Serialization(e.to_string()))?;

    Ok(GeneratedImage {
        mime_type: sniff_mime(&bytes).to_string(),
        bytes,
    })
}

fn sniff_mime(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        "image/png"
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else if bytes.len() > 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        "image/webp"
    } else {
        "image/png"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_is_final() {
        let err = classify_status(
            429,
            r#"{"error":{"code":"insufficient_quota","message":"You exceeded your current quota"}}"#,
        );
        assert!(matches!(err, ImageError::QuotaExhausted(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_rate_limit_is_transient() {
        let err = classify_status(429, r#"{"error":{"message":"Rate limit reached"}}"#);
        assert!(err.is_retryable());
        assert!(classify_status(503, "upstream unavailable").is_retryable());
    }

    #[test]
    fn test_unverified_organization_is_ineligible() {
        let err = classify_status(
            403,
            "Your organization must be verified to use the model `gpt-image-1`",
        );
        assert!(matches!(err, ImageError::Ineligible(_)));
    }

    #[test]
    fn test_bad_request_is_rejected() {
        let err = classify_status(400, r#"{"error":{"message":"Invalid size"}}"#);
        assert!(matches!(err, ImageError::Rejected(_)));
    }

    #[test]
    fn test_decode_response() {
        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A];
        let encoded = base64::engine::general_purpose::STANDARD.encode(png);
        let body = format!(r#"{{"data":[{{"b64_json":"{}"}}]}}"#, encoded);

        let image = decode_response(&body).unwrap();
        assert_eq!(image.mime_type, "image/png");
        assert_eq!(image.bytes, png.to_vec());
    }

    #[test]
    fn test_decode_failures_are_serialization_errors() {
        assert!(matches!(
            decode_response(r#"{"data":[]}"#),
            Err(ImageError::Serialization(_))
        ));
        assert!(matches!(
            decode_response(r#"{"data":[{"b64_json":"***"}]}"#),
            Err(ImageError::Serialization(_))
        ));
    }
}
