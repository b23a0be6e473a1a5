use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::agent::events::EventBus;
use crate::errors::DeskPilotError;
use crate::llm::provider::ContentGenerator;
use crate::llm::types::{Content, GenPart, GenerationConfig, ThinkingConfig};
use crate::perception::geometry::{NormalizedBox, BOX_SCALE};
use crate::perception::tiler::ScreenTiler;
use crate::store::message::Role;

/// How a tool-call attempt failed.
///
/// `Invalid` and `Detection` are reported back to the planner as forged
/// `{error}` responses so it can self-correct; `Fatal` aborts the turn.
#[derive(Debug)]
pub enum GroundError {
    Invalid(String),
    Detection(String),
    Fatal(DeskPilotError),
}

impl From<DeskPilotError> for GroundError {
    fn from(e: DeskPilotError) -> Self {
        GroundError::Fatal(e)
    }
}

/// A successful detection: the tile it was found in, the normalized box, and
/// the de-normalized screen coordinate of the box center.
#[derive(Debug, Clone)]
pub struct Detection {
    pub image_id: usize,
    pub box_2d: NormalizedBox,
    pub point: (i32, i32),
}

/// Converts an element description plus a tile id into a screen coordinate by
/// asking the grounding model for a bounding box in bounded-JSON mode.
pub struct Grounder<'a> {
    generator: &'a dyn ContentGenerator,
    model: &'a str,
    thinking_budget: u32,
    tiler: &'a ScreenTiler,
    tiles: &'a [Vec<u8>],
    events: &'a EventBus,
    session_id: &'a str,
    cancel: &'a CancellationToken,
}

impl<'a> Grounder<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        generator: &'a dyn ContentGenerator,
        model: &'a str,
        thinking_budget: u32,
        tiler: &'a ScreenTiler,
        tiles: &'a [Vec<u8>],
        events: &'a EventBus,
        session_id: &'a str,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            generator,
            model,
            thinking_budget,
            tiler,
            tiles,
            events,
            session_id,
            cancel,
        }
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    pub async fn detect(&self, image_id: usize, description: &str) -> Result<Detection, GroundError> {
        if image_id >= self.tiles.len() {
            return Err(GroundError::Detection(format!(
                "Image ID exceeds the number of cropped screenshots: {image_id} (have {})",
                self.tiles.len()
            )));
        }

        let prompt = format!(
            "Detect the UI element for \"{description}\". \
             The box_2d should be [ymin, xmin, ymax, xmax] normalized to 0-{BOX_SCALE}."
        );
        let contents = vec![Content::user(vec![
            GenPart::png(&self.tiles[image_id]),
            GenPart::text(prompt),
        ])];
        let config = GenerationConfig {
            temperature: Some(0.0),
            thinking: Some(ThinkingConfig {
                include_thoughts: true,
                thinking_budget: Some(self.thinking_budget),
            }),
            response_mime_type: Some("application/json".to_string()),
            response_schema: Some(box_response_schema()),
            ..GenerationConfig::default()
        };

        let raw = self.collect_response(contents, config).await?;
        let value: serde_json::Value = serde_json::from_str(raw.trim()).map_err(|e| {
            GroundError::Fatal(DeskPilotError::Generator(format!(
                "grounding model returned malformed JSON: {e}"
            )))
        })?;
        let box_2d = parse_box(&value).map_err(GroundError::Detection)?;

        let point = self
            .tiler
            .box_to_screen(image_id, &box_2d)
            .map_err(|e| GroundError::Detection(e.to_string()))?;

        tracing::debug!(
            session = %self.session_id,
            image_id,
            ?box_2d,
            x = point.0,
            y = point.1,
            "detection complete"
        );

        Ok(Detection {
            image_id,
            box_2d,
            point,
        })
    }

    /// Streams the detection call, surfacing deltas tagged `grounding_model`,
    /// and returns the accumulated plain text.
    async fn collect_response(
        &self,
        contents: Vec<Content>,
        config: GenerationConfig,
    ) -> Result<String, GroundError> {
        let stream = tokio::select! {
            _ = self.cancel.cancelled() => return Err(DeskPilotError::Cancelled.into()),
            res = self.generator.generate_content_stream(self.model, contents, config) => {
                res.map_err(|e| GroundError::Detection(format!("detection call failed: {e}")))?
            }
        };
        let mut stream = stream;
        let mut text = String::new();

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Err(DeskPilotError::Cancelled.into()),
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|e| GroundError::Detection(format!("detection stream failed: {e}")))?;
            for part in chunk.parts {
                match part {
                    GenPart::Text { text: t, thought: true } => {
                        self.events.stream_thought(self.session_id, Role::GroundingModel, &t);
                    }
                    GenPart::Text { text: t, thought: false } => {
                        self.events.stream_text(self.session_id, Role::GroundingModel, &t);
                        text.push_str(&t);
                    }
                    _ => {}
                }
            }
        }
        Ok(text)
    }
}

fn box_response_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "box_2d": {
                "type": "array",
                "items": { "type": "integer" },
                "minItems": 4,
                "maxItems": 4
            },
            "label": { "type": "string" }
        },
        "required": ["box_2d"]
    })
}

/// Validates a `{box_2d, label?}` response value. Arrays are accepted by
/// taking their first element.
fn parse_box(value: &serde_json::Value) -> Result<NormalizedBox, String> {
    let object = if let Some(items) = value.as_array() {
        items
            .first()
            .ok_or_else(|| "detection returned an empty array".to_string())?
    } else {
        value
    };

    let raw = object
        .get("box_2d")
        .and_then(|b| b.as_array())
        .ok_or_else(|| "detection response is missing box_2d".to_string())?;
    if raw.len() != 4 {
        return Err(format!("box_2d must have exactly 4 elements, got {}", raw.len()));
    }

    let mut coords = [0u32; 4];
    for (i, item) in raw.iter().enumerate() {
        let v = item
            .as_i64()
            .ok_or_else(|| format!("box_2d element {i} is not an integer: {item}"))?;
        if v < 0 || v > BOX_SCALE as i64 {
            return Err(format!("box_2d element {i} out of range [0, {BOX_SCALE}]: {v}"));
        }
        coords[i] = v as u32;
    }

    let [ymin, xmin, ymax, xmax] = coords;
    if ymin >= ymax || xmin >= xmax {
        return Err(format!(
            "box_2d has an empty extent: [{ymin}, {xmin}, {ymax}, {xmax}]"
        ));
    }
    Ok(NormalizedBox::new(ymin, xmin, ymax, xmax))
}
