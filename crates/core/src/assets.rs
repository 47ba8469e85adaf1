//! # Side-Asset Branch
//!
//! Best-effort hero image for the report: caption the topic, generate an
//! image from the caption, store it by content hash. Every failure ends as a
//! `SideAsset` with `success == false`; nothing here can fail a run.

use std::sync::Arc;
use std::time::Duration;

use crate::artifacts::{AssetFailureKind, SideAsset};
use crate::config::{EngineConfig, ImageStyle};
use crate::orchestration::retry::RetryPolicy;
use crate::skills::{invoke_as, AgentInvoker, ImageCaptionOutput};
use crate::state::ArtifactStore;
use crate::tools::{ImageError, ImageGenerator};

/// Image generation routinely takes longer than a text call
const MIN_IMAGE_CALL_TIMEOUT: Duration = Duration::from_secs(90);

pub struct SideAssetBranch {
    invoker: Arc<dyn AgentInvoker>,
    images: Arc<dyn ImageGenerator>,
    artifacts: Arc<ArtifactStore>,
    caption_retry: RetryPolicy,
    image_retry: RetryPolicy,
    style: ImageStyle,
}

impl SideAssetBranch {
    pub fn new(
        invoker: Arc<dyn AgentInvoker>,
        images: Arc<dyn ImageGenerator>,
        artifacts: Arc<ArtifactStore>,
        config: &EngineConfig,
    ) -> Self {
        let mut image_retry = config.retry.clone();
        image_retry.call_timeout = image_retry.call_timeout.max(MIN_IMAGE_CALL_TIMEOUT);

        Self {
            invoker,
            images,
            artifacts,
            caption_retry: config.retry.clone(),
            image_retry,
            style: config.image.clone(),
        }
    }

    /// Produce the asset for `topic`. Never returns an error.
    pub async fn run(&self, topic: &str) -> SideAsset {
        let asset = self.generate(topic).await;
        match &asset {
            SideAsset {
                success: true,
                reference: Some(reference),
                ..
            } => {
                tracing::info!(hash = %reference.hash, size = reference.size, "Side asset generated");
            }
            failed => {
                tracing::warn!(
                    kind = ?failed.failure_kind,
                    error = failed.error.as_deref().unwrap_or(""),
                    "Side asset unavailable"
                );
            }
        }
        asset
    }

    async fn generate(&self, topic: &str) -> SideAsset {
        let prompt = format!("Research topic:\n{}", topic);
        let caption = self
            .caption_retry
            .run("caption", || {
                invoke_as::<ImageCaptionOutput>(self.invoker.as_ref(), prompt.clone())
            })
            .await;

        let description = match caption {
            Ok(c) if c.success && !c.image_description.trim().is_empty() => c.image_description,
            Ok(c) => {
                let reason = c
                    .error_message
                    .unwrap_or_else(|| "captioner declined the topic".to_string());
                return SideAsset::failed(AssetFailureKind::Caption, reason);
            }
            Err(e) => return SideAsset::failed(AssetFailureKind::Caption, e.to_string()),
        };

        let image = self
            .image_retry
            .run("image", || self.images.generate(&description, &self.style))
            .await;

        let image = match image {
            Ok(image) => image,
            Err(e) => {
                return SideAsset::failed(failure_kind(&e), e.to_string())
                    .with_description(description)
            }
        };

        match self.artifacts.put(&image.bytes, &image.mime_type).await {
            Ok(reference) => SideAsset::generated(description, reference),
            Err(e) => SideAsset::failed(AssetFailureKind::Storage, format!("{:#}", e))
                .with_description(description),
        }
    }
}

fn failure_kind(error: &ImageError) -> AssetFailureKind {
    match error {
        ImageError::QuotaExhausted(_) => AssetFailureKind::QuotaExhausted,
        ImageError::Ineligible(_) => AssetFailureKind::Ineligible,
        ImageError::Serialization(_) => AssetFailureKind::Serialization,
        ImageError::Rejected(_) => AssetFailureKind::Rejected,
        ImageError::Transient(_) => AssetFailureKind::RetriesExhausted,
    }
}
