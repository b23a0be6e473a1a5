pub mod provider;
pub mod types;

pub use provider::{ChunkStream, ContentGenerator};
pub use types::{
    Content, FunctionDecl, GenPart, GenRole, GenerationConfig, ResponseChunk, ThinkingConfig,
};
