use crate::errors::DeskPilotResult;
use crate::store::message::FunctionCall;

/// Name of the remote OS-automation endpoint every grounded call targets.
pub const COMPUTER_TOOL: &str = ".computer";

/// One element of the human-readable description persisted with a review
/// request: a text fragment or the filename of a stored annotated image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptionPart {
    Text(String),
    Image(String),
}

/// Raw material for the description: annotated PNGs are kept as bytes until
/// the agent stores them and learns their filenames.
#[derive(Debug, Clone)]
pub(crate) enum DescriptionSource {
    Text(String),
    Png(Vec<u8>),
}

/// A low-level action ready for the OS-automation tool, derived from a
/// high-level `computer_*` call. Keeps the original call's id so the logged
/// tool response maps back to it.
#[derive(Debug, Clone)]
pub struct GroundedToolCall {
    pub id: String,
    pub args: serde_json::Value,
    pub original: FunctionCall,
    pub(crate) sources: Vec<DescriptionSource>,
}

impl GroundedToolCall {
    pub(crate) fn new(
        original: &FunctionCall,
        args: serde_json::Value,
        sources: Vec<DescriptionSource>,
    ) -> Self {
        Self {
            id: original.id.clone(),
            args,
            original: original.clone(),
            sources,
        }
    }

    /// The wire-level call sent to the OS-automation tool.
    pub fn call(&self) -> FunctionCall {
        FunctionCall {
            id: self.id.clone(),
            name: COMPUTER_TOOL.to_string(),
            args: self.args.clone(),
        }
    }

    /// Produces the ordered description parts, handing each annotated image
    /// to `save_image` (which stores it and returns the filename).
    pub fn describe(
        &self,
        save_image: &mut dyn FnMut(&[u8]) -> DeskPilotResult<String>,
    ) -> DeskPilotResult<Vec<DescriptionPart>> {
        let mut parts = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            match source {
                DescriptionSource::Text(text) => parts.push(DescriptionPart::Text(text.clone())),
                DescriptionSource::Png(bytes) => {
                    parts.push(DescriptionPart::Image(save_image(bytes)?))
                }
            }
        }
        Ok(parts)
    }
}
