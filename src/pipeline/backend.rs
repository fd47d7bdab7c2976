use async_trait::async_trait;

use crate::llm::media::{ImagePayload, ReferenceImage};
use crate::pipeline::errors::BackendError;
use crate::pipeline::types::ModelId;

/// Text generation used by the planner (structured) and prompt composer (free text).
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Returns text expected to parse as a JSON document.
    async fn generate_structured(
        &self,
        instructions: &str,
        images: &[&ReferenceImage],
    ) -> Result<String, BackendError>;

    async fn generate_text(&self, prompt: &str) -> Result<String, BackendError>;
}

#[derive(Debug, Clone, Copy)]
pub struct ImageRequest<'a> {
    pub prompt: &'a str,
    pub model: &'a ModelId,
    pub aspect_ratio: &'a str,
    pub subject: Option<&'a ReferenceImage>,
    pub scene: Option<&'a ReferenceImage>,
}

/// One call, one image. Implementations must not retry failed statuses.
#[async_trait]
pub trait ImageModel: Send + Sync {
    async fn generate_image(&self, request: ImageRequest<'_>) -> Result<ImagePayload, BackendError>;
}
