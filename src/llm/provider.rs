use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;

use crate::errors::DeskPilotResult;
use crate::llm::types::{Content, GenerationConfig, ResponseChunk};

pub type ChunkStream = Pin<Box<dyn Stream<Item = DeskPilotResult<ResponseChunk>> + Send>>;

/// Seam to the external LLM provider. The planning and grounding invocations
/// both go through this trait; the transport behind it is opaque to the core.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate_content_stream(
        &self,
        model: &str,
        contents: Vec<Content>,
        config: GenerationConfig,
    ) -> DeskPilotResult<ChunkStream>;
}
