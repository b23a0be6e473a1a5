use image::DynamicImage;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::grounding::{Detection, GroundError, Grounder};
use crate::llm::types::FunctionDecl;
use crate::perception::tiler::{HighlightStyle, ScreenTiler};
use crate::store::message::FunctionCall;
use crate::tools::grounded::{DescriptionSource, GroundedToolCall};

pub const CLICK: &str = "computer_click";
pub const TYPE: &str = "computer_type";
pub const DRAG_AND_DROP: &str = "computer_drag_and_drop";
pub const KEY: &str = "computer_key";
pub const WAIT: &str = "computer_wait";
/// Fully implemented but deliberately not declared to the planner.
pub const SCROLL: &str = "computer_scroll";

/// Everything a tool needs to turn its arguments into screen coordinates.
/// Lives for one turn; the geometry inside the tiler belongs to the current
/// screenshot only.
pub struct GroundingContext<'a> {
    pub screenshot: &'a DynamicImage,
    pub tiler: &'a ScreenTiler,
    pub grounder: &'a Grounder<'a>,
}

/// The closed set of abstract computer-control tools exposed to the planner.
pub struct ToolCatalog;

impl ToolCatalog {
    /// Declarations handed to the planning model.
    pub fn declarations() -> Vec<FunctionDecl> {
        vec![
            FunctionDecl {
                name: CLICK.to_string(),
                description: "Click on a UI element identified by a description within one \
                              of the cropped screenshots."
                    .to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "image_id": {
                            "type": "integer",
                            "minimum": 0,
                            "description": "Index of the cropped screenshot containing the element."
                        },
                        "element_description": {
                            "type": "string",
                            "description": "Visual description of the element to click."
                        },
                        "num_clicks": { "type": "integer", "minimum": 1 },
                        "button_type": { "type": "string", "enum": ["left", "middle", "right"] },
                        "hold_keys": { "type": "array", "items": { "type": "string" } }
                    },
                    "required": ["image_id", "element_description"]
                }),
            },
            FunctionDecl {
                name: TYPE.to_string(),
                description: "Type text, optionally clicking a target field first. Set \
                              overwrite to replace existing content, enter to press Return after."
                    .to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "text": { "type": "string" },
                        "image_id": { "type": "integer", "minimum": 0 },
                        "element_description": { "type": "string" },
                        "overwrite": { "type": "boolean" },
                        "enter": { "type": "boolean" }
                    },
                    "required": ["text"]
                }),
            },
            FunctionDecl {
                name: DRAG_AND_DROP.to_string(),
                description: "Drag from one described element to another.".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "starting_image_id": { "type": "integer", "minimum": 0 },
                        "starting_description": { "type": "string" },
                        "ending_image_id": { "type": "integer", "minimum": 0 },
                        "ending_description": { "type": "string" },
                        "hold_keys": { "type": "array", "items": { "type": "string" } }
                    },
                    "required": [
                        "starting_image_id",
                        "starting_description",
                        "ending_image_id",
                        "ending_description"
                    ]
                }),
            },
            FunctionDecl {
                name: KEY.to_string(),
                description: "Press one or more keys, optionally holding them.".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "keys": { "type": "array", "items": { "type": "string" }, "minItems": 1 },
                        "hold_duration": { "type": "number", "minimum": 0 }
                    },
                    "required": ["keys"]
                }),
            },
            FunctionDecl {
                name: WAIT.to_string(),
                description: "Wait for the given number of seconds.".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "time": { "type": "number", "minimum": 0 }
                    },
                    "required": ["time"]
                }),
            },
        ]
    }

    /// Whether `name` belongs to the closed computer-tool set. Includes the
    /// undeclared scroll tool so a stray call is validated here instead of
    /// being forwarded to the runtime.
    pub fn is_computer_tool(name: &str) -> bool {
        matches!(name, CLICK | TYPE | DRAG_AND_DROP | KEY | WAIT | SCROLL)
    }

    pub async fn ground(
        call: &FunctionCall,
        ctx: &GroundingContext<'_>,
    ) -> Result<GroundedToolCall, GroundError> {
        match call.name.as_str() {
            CLICK => ground_click(call, ctx).await,
            TYPE => ground_type(call, ctx).await,
            DRAG_AND_DROP => ground_drag_and_drop(call, ctx).await,
            KEY => ground_key(call),
            WAIT => ground_wait(call),
            SCROLL => ground_scroll(call, ctx).await,
            other => Err(GroundError::Invalid(format!("Unknown computer tool: {other}"))),
        }
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(call: &FunctionCall) -> Result<T, GroundError> {
    serde_json::from_value(call.args.clone()).map_err(|e| {
        GroundError::Invalid(format!("Invalid arguments for {}: {e}", call.name))
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ButtonType {
    #[default]
    Left,
    Middle,
    Right,
}

fn one_click() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
struct ClickArgs {
    image_id: usize,
    element_description: String,
    #[serde(default = "one_click")]
    num_clicks: u32,
    #[serde(default)]
    button_type: ButtonType,
    #[serde(default)]
    hold_keys: Vec<String>,
}

async fn ground_click(
    call: &FunctionCall,
    ctx: &GroundingContext<'_>,
) -> Result<GroundedToolCall, GroundError> {
    let args: ClickArgs = parse_args(call)?;
    let detection = ctx
        .grounder
        .detect(args.image_id, &format!("Click on: {}", args.element_description))
        .await?;
    let (x, y) = detection.point;

    let mut label = format!(
        "Click on \"{}\" at ({x}, {y})",
        args.element_description
    );
    if args.num_clicks > 1 {
        label.push_str(&format!(", {} clicks", args.num_clicks));
    }
    if args.button_type != ButtonType::Left {
        label.push_str(&format!(", {:?} button", args.button_type));
    }
    if !args.hold_keys.is_empty() {
        label.push_str(&format!(", holding {}", args.hold_keys.join(" + ")));
    }

    let grounded_args = json!({
        "action": "click",
        "coordinate": [x, y],
        "num_clicks": args.num_clicks,
        "button_type": args.button_type,
        "hold_keys": args.hold_keys,
    });

    let sources = vec![
        DescriptionSource::Text(label),
        DescriptionSource::Png(annotate_target(ctx, &detection)?),
    ];
    Ok(GroundedToolCall::new(call, grounded_args, sources))
}

#[derive(Debug, Deserialize)]
struct TypeArgs {
    text: String,
    image_id: Option<usize>,
    element_description: Option<String>,
    #[serde(default)]
    overwrite: bool,
    #[serde(default)]
    enter: bool,
}

async fn ground_type(
    call: &FunctionCall,
    ctx: &GroundingContext<'_>,
) -> Result<GroundedToolCall, GroundError> {
    let args: TypeArgs = parse_args(call)?;
    let target = match (args.image_id, &args.element_description) {
        (Some(id), Some(desc)) => Some((id, desc.clone())),
        (None, None) => None,
        _ => {
            return Err(GroundError::Invalid(
                "image_id and element_description must be provided together".to_string(),
            ))
        }
    };

    let mut label = format!("Type \"{}\"", args.text);
    if args.overwrite {
        label.push_str(", overwriting existing content");
    }
    if args.enter {
        label.push_str(", then press Return");
    }
    let mut grounded_args = json!({
        "action": "type",
        "text": args.text,
        "overwrite": args.overwrite,
        "enter": args.enter,
    });
    let mut sources = Vec::new();

    if let Some((image_id, desc)) = target {
        let detection = ctx
            .grounder
            .detect(image_id, &format!("Click on: {desc}"))
            .await?;
        let (x, y) = detection.point;
        grounded_args["coordinate"] = json!([x, y]);
        sources.push(DescriptionSource::Text(format!(
            "{label} into \"{desc}\" at ({x}, {y})"
        )));
        sources.push(DescriptionSource::Png(annotate_target(ctx, &detection)?));
    } else {
        sources.push(DescriptionSource::Text(label));
    }

    Ok(GroundedToolCall::new(call, grounded_args, sources))
}

#[derive(Debug, Deserialize)]
struct DragAndDropArgs {
    starting_image_id: usize,
    starting_description: String,
    ending_image_id: usize,
    ending_description: String,
    #[serde(default)]
    hold_keys: Vec<String>,
}

async fn ground_drag_and_drop(
    call: &FunctionCall,
    ctx: &GroundingContext<'_>,
) -> Result<GroundedToolCall, GroundError> {
    let args: DragAndDropArgs = parse_args(call)?;
    let start = ctx
        .grounder
        .detect(
            args.starting_image_id,
            &format!("Drag from: {}", args.starting_description),
        )
        .await?;
    let end = ctx
        .grounder
        .detect(
            args.ending_image_id,
            &format!("Drop on: {}", args.ending_description),
        )
        .await?;

    let grounded_args = json!({
        "action": "drag_and_drop",
        "coordinate": [start.point.0, start.point.1],
        "target_coordinate": [end.point.0, end.point.1],
        "hold_keys": args.hold_keys,
    });

    let annotated = ctx
        .tiler
        .highlight_arrow(
            ctx.screenshot,
            (start.image_id, &start.box_2d),
            (end.image_id, &end.box_2d),
            HighlightStyle::default(),
            HighlightStyle {
                color: [0, 200, 0],
                width: 3,
            },
        )
        .map_err(|e| GroundError::Detection(e.to_string()))?;

    let sources = vec![
        DescriptionSource::Text(format!(
            "Drag \"{}\" at ({}, {}) onto \"{}\" at ({}, {})",
            args.starting_description,
            start.point.0,
            start.point.1,
            args.ending_description,
            end.point.0,
            end.point.1,
        )),
        DescriptionSource::Png(annotated),
    ];
    Ok(GroundedToolCall::new(call, grounded_args, sources))
}

#[derive(Debug, Deserialize)]
struct KeyArgs {
    keys: Vec<String>,
    hold_duration: Option<f64>,
}

fn ground_key(call: &FunctionCall) -> Result<GroundedToolCall, GroundError> {
    let args: KeyArgs = parse_args(call)?;
    if args.keys.is_empty() {
        return Err(GroundError::Invalid("keys must not be empty".to_string()));
    }
    if let Some(duration) = args.hold_duration {
        if !duration.is_finite() || duration < 0.0 {
            return Err(GroundError::Invalid(format!(
                "hold_duration must be a non-negative number of seconds, got {duration}"
            )));
        }
    }

    let mut label = format!("Press {}", args.keys.join(" + "));
    if let Some(duration) = args.hold_duration {
        label.push_str(&format!(", held for {duration} s"));
    }
    let grounded_args = json!({
        "action": "key",
        "keys": args.keys,
        "hold_duration": args.hold_duration,
    });
    Ok(GroundedToolCall::new(
        call,
        grounded_args,
        vec![DescriptionSource::Text(label)],
    ))
}

#[derive(Debug, Deserialize)]
struct WaitArgs {
    time: f64,
}

fn ground_wait(call: &FunctionCall) -> Result<GroundedToolCall, GroundError> {
    let args: WaitArgs = parse_args(call)?;
    if !args.time.is_finite() || args.time < 0.0 {
        return Err(GroundError::Invalid(format!(
            "time must be a non-negative number of seconds, got {}",
            args.time
        )));
    }
    let grounded_args = json!({ "action": "wait", "time": args.time });
    Ok(GroundedToolCall::new(
        call,
        grounded_args,
        vec![DescriptionSource::Text(format!("Wait for {} s", args.time))],
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

fn three_notches() -> u32 {
    3
}

#[derive(Debug, Deserialize)]
struct ScrollArgs {
    direction: ScrollDirection,
    image_id: Option<usize>,
    element_description: Option<String>,
    #[serde(default = "three_notches")]
    amount: u32,
}

async fn ground_scroll(
    call: &FunctionCall,
    ctx: &GroundingContext<'_>,
) -> Result<GroundedToolCall, GroundError> {
    let args: ScrollArgs = parse_args(call)?;
    let target = match (args.image_id, &args.element_description) {
        (Some(id), Some(desc)) => Some((id, desc.clone())),
        (None, None) => None,
        _ => {
            return Err(GroundError::Invalid(
                "image_id and element_description must be provided together".to_string(),
            ))
        }
    };

    let mut grounded_args = json!({
        "action": "scroll",
        "direction": args.direction,
        "amount": args.amount,
    });
    let mut sources = Vec::new();

    if let Some((image_id, desc)) = target {
        let detection = ctx
            .grounder
            .detect(image_id, &format!("Scroll at: {desc}"))
            .await?;
        let (x, y) = detection.point;
        grounded_args["coordinate"] = json!([x, y]);
        sources.push(DescriptionSource::Text(format!(
            "Scroll {:?} over \"{desc}\" at ({x}, {y})",
            args.direction
        )));
        sources.push(DescriptionSource::Png(annotate_target(ctx, &detection)?));
    } else {
        sources.push(DescriptionSource::Text(format!("Scroll {:?}", args.direction)));
    }

    Ok(GroundedToolCall::new(call, grounded_args, sources))
}

fn annotate_target(
    ctx: &GroundingContext<'_>,
    detection: &Detection,
) -> Result<Vec<u8>, GroundError> {
    ctx.tiler
        .highlight_box(
            ctx.screenshot,
            detection.image_id,
            &detection.box_2d,
            HighlightStyle::default(),
        )
        .map_err(|e| GroundError::Detection(e.to_string()))
}
