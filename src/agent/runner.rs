use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use futures_util::StreamExt;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::agent::events::{AgentEvent, EventBus};
use crate::config::LlmConfig;
use crate::context::{assemble_history, push_merged};
use crate::errors::{DeskPilotError, DeskPilotResult};
use crate::grounding::{GroundError, Grounder};
use crate::llm::provider::ContentGenerator;
use crate::llm::types::{Content, GenPart, GenerationConfig, ThinkingConfig};
use crate::perception::geometry::ScreenGeometry;
use crate::perception::tiler::ScreenTiler;
use crate::store::message::{FunctionCall, Message, Part, ReviewChoice, Role, ToolReview};
use crate::store::session::{sanitize_file_name, SessionPatch, SessionStatus};
use crate::store::SessionStore;
use crate::tools::catalog::{GroundingContext, ToolCatalog};
use crate::tools::grounded::DescriptionPart;
use crate::tools::runtime::{ToolOutput, ToolRuntime};
use crate::tools::COMPUTER_TOOL;

/// Everything one agent task needs. Built per spawned turn; the cancellation
/// token is shared by every LLM call and tool RPC within the turn.
pub struct AgentContext {
    pub store: Arc<SessionStore>,
    pub generator: Arc<dyn ContentGenerator>,
    pub runtime: Arc<dyn ToolRuntime>,
    pub events: EventBus,
    pub llm: LlmConfig,
    pub session_id: String,
    pub model: String,
    pub cancel: CancellationToken,
}

/// A resolved tool review, delivered when a suspended turn resumes.
#[derive(Debug, Clone)]
pub struct ResolvedReview {
    pub grounded: FunctionCall,
    pub original: FunctionCall,
    pub choice: ReviewChoice,
}

#[derive(Debug)]
pub enum TurnInput {
    UserText(String),
    ReviewDecisions(Vec<ResolvedReview>),
}

/// Drives the session through plan-ground-review-act turns until the model
/// stops, a review gate suspends the turn, or an error ends it. Uncaught
/// failures become status `error` with the failure as the status message.
pub async fn run_agent(ctx: &AgentContext, input: TurnInput) -> DeskPilotResult<()> {
    match run_turns(ctx, input).await {
        Ok(()) => Ok(()),
        Err(e) => {
            let message = e.to_string();
            tracing::error!(session = %ctx.session_id, error = %message, "turn failed");
            set_status(ctx, SessionStatus::Error, Some(message));
            Err(e)
        }
    }
}

async fn run_turns(ctx: &AgentContext, input: TurnInput) -> DeskPilotResult<()> {
    let mut history = assemble_history(&ctx.store, &ctx.session_id)?;
    let mut buffer: Vec<GenPart> = Vec::new();

    // ── Seed ────────────────────────────────────────────────────────────
    match input {
        TurnInput::UserText(text) => {
            persist(ctx, &Message::new(Role::User, vec![Part::text(text.clone())]))?;
            buffer.push(GenPart::text(text));
        }
        TurnInput::ReviewDecisions(decisions) => {
            if decisions.is_empty() {
                return Err(DeskPilotError::Agent("no resolved reviews to apply".into()));
            }
            let mut parts = Vec::with_capacity(decisions.len());
            let mut all_rejected = true;
            for decision in &decisions {
                let part = if decision.choice == ReviewChoice::RejectOnce {
                    Part::FunctionResponse {
                        id: decision.original.id.clone(),
                        name: decision.original.name.clone(),
                        response: serde_json::json!({ "error": "Rejected by user" }),
                    }
                } else {
                    all_rejected = false;
                    execute_grounded(ctx, &decision.grounded, &decision.original).await?
                };
                parts.push(part);
            }
            persist(ctx, &Message::new(Role::Tool, parts.clone()))?;
            if all_rejected {
                set_status(
                    ctx,
                    SessionStatus::Stagnant,
                    Some("User rejected all tool calls.".into()),
                );
                return Ok(());
            }
            buffer.extend(parts.iter().map(part_to_gen));
        }
    }

    let mut turn: u32 = 0;
    loop {
        turn += 1;
        set_status(ctx, SessionStatus::Running, Some(format!("Turn {turn}")));

        // ── Observe ─────────────────────────────────────────────────────
        let output = with_cancel(&ctx.cancel, async {
            ctx.runtime
                .execute(COMPUTER_TOOL, &serde_json::json!({ "action": "screenshot" }))
                .await
        })
        .await?;
        let ToolOutput::InlinePng(png) = output else {
            return Err(DeskPilotError::ToolRuntime(
                "screenshot did not return an inline PNG".into(),
            ));
        };
        let screenshot = image::load_from_memory(&png)
            .map_err(|e| DeskPilotError::Image(format!("screenshot decode: {e}")))?;
        let geometry = ScreenGeometry::new(screenshot.width(), screenshot.height())?;
        let tiler = ScreenTiler::new(geometry);
        let tiles = tiler.tile(&screenshot)?;
        tracing::debug!(
            session = %ctx.session_id,
            turn,
            width = screenshot.width(),
            height = screenshot.height(),
            tiles = tiles.len(),
            "screenshot tiled"
        );

        let now = Utc::now();
        let stamp = now.timestamp_millis();
        let label = format!(
            "Screenshot taken at {}",
            now.to_rfc3339_opts(SecondsFormat::Secs, true)
        );

        let shot_name = sanitize_file_name(&format!("{stamp}-screenshot.png"));
        ctx.store.put_image(&ctx.session_id, &shot_name, &png)?;
        persist(
            ctx,
            &Message::new(
                Role::Workflow,
                vec![
                    Part::image_ref(&ctx.session_id, &shot_name),
                    Part::text(label.clone()),
                ],
            )
            .display_only(),
        )?;

        let mut tile_parts = vec![Part::text(label.clone())];
        for (index, tile) in tiles.iter().enumerate() {
            let tile_name = sanitize_file_name(&format!("{stamp}-tile-{index}.png"));
            ctx.store.put_image(&ctx.session_id, &tile_name, tile)?;
            tile_parts.push(Part::image_ref(&ctx.session_id, &tile_name));
        }
        persist(ctx, &Message::new(Role::Workflow, tile_parts).hidden())?;

        buffer.push(GenPart::text(label));
        for tile in &tiles {
            buffer.push(GenPart::png(tile));
        }

        // ── Plan ────────────────────────────────────────────────────────
        push_merged(&mut history, Content::user(std::mem::take(&mut buffer)));
        let mut plan = stream_plan(ctx, &history).await?;
        if plan.is_empty() {
            tracing::warn!(session = %ctx.session_id, turn, "empty plan response, retrying once");
            push_merged(&mut history, Content::user(vec![GenPart::text("continue")]));
            plan = stream_plan(ctx, &history).await?;
            if plan.is_empty() {
                set_status(
                    ctx,
                    SessionStatus::Error,
                    Some("Model returned empty response even after retry.".into()),
                );
                return Ok(());
            }
        }

        let mut model_parts = Vec::new();
        if !plan.thought.is_empty() {
            model_parts.push(Part::Thought {
                text: plan.thought.clone(),
            });
        }
        if !plan.text.is_empty() {
            model_parts.push(Part::text(plan.text.clone()));
        }
        for call in &plan.calls {
            model_parts.push(Part::FunctionCall {
                id: call.id.clone(),
                name: call.name.clone(),
                args: call.args.clone(),
            });
        }
        persist(ctx, &Message::new(Role::Model, model_parts))?;

        let mut model_gen_parts = Vec::new();
        if !plan.text.is_empty() {
            model_gen_parts.push(GenPart::text(plan.text.clone()));
        }
        for call in &plan.calls {
            model_gen_parts.push(GenPart::FunctionCall {
                id: Some(call.id.clone()),
                name: call.name.clone(),
                args: call.args.clone(),
            });
        }
        push_merged(&mut history, Content::model(model_gen_parts));

        // ── Ground and dispatch ─────────────────────────────────────────
        if plan.calls.is_empty() {
            set_status(
                ctx,
                SessionStatus::Stagnant,
                Some("No more tool calls from model.".into()),
            );
            return Ok(());
        }

        let accept_set = ctx.store.get(&ctx.session_id)?.auto_accept;
        let grounder = Grounder::new(
            ctx.generator.as_ref(),
            &ctx.llm.grounding_model,
            ctx.llm.grounding_thinking_budget,
            &tiler,
            &tiles,
            &ctx.events,
            &ctx.session_id,
            &ctx.cancel,
        );
        let ground_ctx = GroundingContext {
            screenshot: &screenshot,
            tiler: &tiler,
            grounder: &grounder,
        };

        let mut response_parts: Vec<Part> = Vec::new();
        let mut review_messages: Vec<Message> = Vec::new();
        let mut delayed: Vec<(FunctionCall, FunctionCall)> = Vec::new();
        let mut pending = false;
        let mut seen_ids: HashSet<String> = HashSet::new();
        let mut image_seq = 0usize;

        for original in &plan.calls {
            if !seen_ids.insert(original.id.clone()) {
                response_parts.push(forged_error(
                    original,
                    format!("Duplicate function call id: {}", original.id),
                ));
                continue;
            }
            if !ToolCatalog::is_computer_tool(&original.name) {
                response_parts.push(execute_direct(ctx, original).await?);
                continue;
            }

            match ToolCatalog::ground(original, &ground_ctx).await {
                Err(GroundError::Fatal(e)) => return Err(e),
                Err(GroundError::Invalid(msg)) => {
                    tracing::debug!(session = %ctx.session_id, tool = %original.name, %msg, "tool arguments rejected");
                    response_parts.push(forged_error(original, msg));
                }
                Err(GroundError::Detection(msg)) => {
                    tracing::debug!(session = %ctx.session_id, tool = %original.name, %msg, "grounding failed");
                    response_parts.push(forged_error(
                        original,
                        format!("Error during grounding: {msg}"),
                    ));
                }
                Ok(grounded) => {
                    let review_id = uuid::Uuid::new_v4().to_string();
                    let mut save = |bytes: &[u8]| -> DeskPilotResult<String> {
                        let name =
                            sanitize_file_name(&format!("{stamp}-review-{image_seq}.png"));
                        image_seq += 1;
                        ctx.store.put_image(&ctx.session_id, &name, bytes)?;
                        Ok(name)
                    };
                    let description = grounded.describe(&mut save)?;
                    let parts = description
                        .into_iter()
                        .map(|part| match part {
                            DescriptionPart::Text(text) => Part::text(text),
                            DescriptionPart::Image(file) => {
                                Part::image_ref(&ctx.session_id, &file)
                            }
                        })
                        .collect();
                    let request = Message::new(Role::Workflow, parts)
                        .with_review(ToolReview::Request {
                            review_id: review_id.clone(),
                            grounded_call: grounded.call(),
                            original_call: original.clone(),
                        })
                        .display_only();
                    review_messages.push(request);

                    if accept_set.contains(&original.name) {
                        review_messages.push(Message::new(Role::User, vec![]).with_review(
                            ToolReview::Response {
                                review_id,
                                choice: ReviewChoice::AcceptSession,
                            },
                        ));
                        delayed.push((grounded.call(), original.clone()));
                    } else {
                        pending = true;
                    }
                }
            }
        }

        // ── Finalize ────────────────────────────────────────────────────
        if !response_parts.is_empty() {
            persist(ctx, &Message::new(Role::Tool, response_parts.clone()))?;
        }
        for message in &review_messages {
            persist(ctx, message)?;
        }

        if pending {
            set_status(ctx, SessionStatus::Pending, Some("Tool call pending.".into()));
            return Ok(());
        }

        let mut delayed_parts = Vec::with_capacity(delayed.len());
        for (grounded, original) in &delayed {
            delayed_parts.push(execute_grounded(ctx, grounded, original).await?);
        }
        if !delayed_parts.is_empty() {
            persist(ctx, &Message::new(Role::Tool, delayed_parts.clone()))?;
        }

        buffer.extend(response_parts.iter().map(part_to_gen));
        buffer.extend(delayed_parts.iter().map(part_to_gen));
    }
}

struct PlanResult {
    thought: String,
    text: String,
    calls: Vec<FunctionCall>,
}

impl PlanResult {
    fn is_empty(&self) -> bool {
        self.text.is_empty() && self.calls.is_empty()
    }
}

/// Streams one planning completion, forwarding deltas tagged `model`, and
/// returns the accumulated thought, text and normalized function calls.
async fn stream_plan(ctx: &AgentContext, history: &[Content]) -> DeskPilotResult<PlanResult> {
    let config = GenerationConfig {
        temperature: Some(ctx.llm.planner_temperature),
        thinking: Some(ThinkingConfig {
            include_thoughts: true,
            thinking_budget: None,
        }),
        tools: ToolCatalog::declarations(),
        ..GenerationConfig::default()
    };

    let mut stream = with_cancel(&ctx.cancel, async {
        ctx.generator
            .generate_content_stream(&ctx.model, history.to_vec(), config)
            .await
    })
    .await?;

    let mut result = PlanResult {
        thought: String::new(),
        text: String::new(),
        calls: Vec::new(),
    };

    loop {
        let next = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(DeskPilotError::Cancelled),
            next = stream.next() => next,
        };
        let Some(chunk) = next else { break };
        for part in chunk?.parts {
            match part {
                GenPart::Text { text, thought: true } => {
                    ctx.events.stream_thought(&ctx.session_id, Role::Model, &text);
                    result.thought.push_str(&text);
                }
                GenPart::Text { text, thought: false } => {
                    ctx.events.stream_text(&ctx.session_id, Role::Model, &text);
                    result.text.push_str(&text);
                }
                GenPart::FunctionCall { id, name, args } => {
                    let id = match id {
                        Some(id) if !id.is_empty() => id,
                        _ => generate_call_id(&name),
                    };
                    result.calls.push(FunctionCall { id, name, args });
                }
                GenPart::InlineData { .. } | GenPart::FunctionResponse { .. } => {}
            }
        }
    }

    tracing::info!(
        session = %ctx.session_id,
        text_len = result.text.len(),
        thought_len = result.thought.len(),
        calls = result.calls.len(),
        tools = ?result.calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
        "plan complete"
    );
    Ok(result)
}

/// Fallback id when the model omits one. Colliding ids from a broken model
/// are caught by the duplicate check in the dispatch loop.
fn generate_call_id(name: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!("{name}-{}-{suffix}", Utc::now().timestamp_millis())
}

fn forged_error(original: &FunctionCall, message: String) -> Part {
    Part::FunctionResponse {
        id: original.id.clone(),
        name: original.name.clone(),
        response: serde_json::json!({ "error": message }),
    }
}

/// Executes a grounded call through the OS-automation tool. Runtime failures
/// become `{error}` responses so the turn continues; cancellation aborts.
async fn execute_grounded(
    ctx: &AgentContext,
    grounded: &FunctionCall,
    original: &FunctionCall,
) -> DeskPilotResult<Part> {
    let outcome = with_cancel(&ctx.cancel, async {
        Ok(ctx.runtime.execute(COMPUTER_TOOL, &grounded.args).await)
    })
    .await?;
    let response = match outcome {
        Ok(ToolOutput::Text(output)) => serde_json::json!({ "output": output }),
        Ok(ToolOutput::InlinePng(_)) => {
            serde_json::json!({ "error": "unexpected inline image output" })
        }
        Err(DeskPilotError::Cancelled) => return Err(DeskPilotError::Cancelled),
        Err(e) => serde_json::json!({ "error": e.to_string() }),
    };
    Ok(Part::FunctionResponse {
        id: original.id.clone(),
        name: original.name.clone(),
        response,
    })
}

/// Calls outside the computer-tool catalog go straight to the runtime.
async fn execute_direct(ctx: &AgentContext, call: &FunctionCall) -> DeskPilotResult<Part> {
    let outcome = with_cancel(&ctx.cancel, async {
        Ok(ctx.runtime.execute(&call.name, &call.args).await)
    })
    .await?;
    let response = match outcome {
        Ok(ToolOutput::Text(output)) => serde_json::json!({ "output": output }),
        Ok(ToolOutput::InlinePng(_)) => {
            serde_json::json!({ "error": "unexpected inline image output" })
        }
        Err(DeskPilotError::Cancelled) => return Err(DeskPilotError::Cancelled),
        Err(e) => serde_json::json!({ "error": e.to_string() }),
    };
    Ok(Part::FunctionResponse {
        id: call.id.clone(),
        name: call.name.clone(),
        response,
    })
}

fn part_to_gen(part: &Part) -> GenPart {
    match part {
        Part::Text { text } => GenPart::text(text.clone()),
        Part::Thought { text } => GenPart::thought(text.clone()),
        Part::FunctionCall { id, name, args } => GenPart::FunctionCall {
            id: Some(id.clone()),
            name: name.clone(),
            args: args.clone(),
        },
        Part::FunctionResponse { id, name, response } => GenPart::FunctionResponse {
            id: id.clone(),
            name: name.clone(),
            response: response.clone(),
        },
        Part::Image { reference } => GenPart::text(reference.clone()),
    }
}

pub(crate) fn persist(ctx: &AgentContext, message: &Message) -> DeskPilotResult<()> {
    ctx.store
        .append_messages(&ctx.session_id, std::slice::from_ref(message))?;
    if !message.is_hidden() {
        ctx.events.emit(AgentEvent::PersistentMessage {
            session_id: ctx.session_id.clone(),
            message: message.clone(),
        });
    }
    Ok(())
}

pub(crate) fn set_status(ctx: &AgentContext, status: SessionStatus, message: Option<String>) {
    if let Err(e) = ctx
        .store
        .update(&ctx.session_id, SessionPatch::status(status, message.clone()))
    {
        tracing::warn!(session = %ctx.session_id, error = %e, "failed to persist status");
    }
    ctx.events.emit(AgentEvent::SessionStatus {
        session_id: ctx.session_id.clone(),
        status,
        message,
    });
}

async fn with_cancel<T, F>(cancel: &CancellationToken, fut: F) -> DeskPilotResult<T>
where
    F: Future<Output = DeskPilotResult<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(DeskPilotError::Cancelled),
        res = fut => res,
    }
}
