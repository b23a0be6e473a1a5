//! End-to-end turns against scripted generator and runtime doubles.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::stream;

use deskpilot::agent::SessionManager;
use deskpilot::config::LlmConfig;
use deskpilot::errors::DeskPilotResult;
use deskpilot::llm::{ChunkStream, Content, ContentGenerator, GenPart, GenerationConfig, ResponseChunk};
use deskpilot::store::{
    Message, Part, ReviewChoice, Role, SessionMeta, SessionPatch, SessionStatus, SessionStore,
    ToolReview,
};
use deskpilot::tools::{ToolOutput, ToolRuntime};

const PLANNER: &str = "planner";
const DETECTOR: &str = "det";

/// Pops one scripted part list per plan call and one JSON payload per
/// detection call, keyed by the requested model.
struct ScriptedGenerator {
    plans: Mutex<VecDeque<Vec<GenPart>>>,
    detections: Mutex<VecDeque<String>>,
}

impl ScriptedGenerator {
    fn new(plans: Vec<Vec<GenPart>>, detections: Vec<&str>) -> Arc<Self> {
        Arc::new(Self {
            plans: Mutex::new(plans.into_iter().collect()),
            detections: Mutex::new(detections.into_iter().map(String::from).collect()),
        })
    }
}

#[async_trait]
impl ContentGenerator for ScriptedGenerator {
    async fn generate_content_stream(
        &self,
        model: &str,
        _contents: Vec<Content>,
        _config: GenerationConfig,
    ) -> DeskPilotResult<ChunkStream> {
        let parts = if model == DETECTOR {
            let payload = self
                .detections
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_default();
            if payload.is_empty() {
                Vec::new()
            } else {
                vec![GenPart::text(payload)]
            }
        } else {
            self.plans.lock().unwrap().pop_front().unwrap_or_default()
        };
        Ok(Box::pin(stream::iter(vec![Ok(ResponseChunk { parts })])))
    }
}

/// Serves a fixed screenshot and records every non-screenshot invocation.
struct ScriptedRuntime {
    png: Vec<u8>,
    executed: Mutex<Vec<(String, serde_json::Value)>>,
}

impl ScriptedRuntime {
    fn new(png: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            png,
            executed: Mutex::new(Vec::new()),
        })
    }

    fn executed(&self) -> Vec<(String, serde_json::Value)> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolRuntime for ScriptedRuntime {
    async fn execute(
        &self,
        name: &str,
        args: &serde_json::Value,
    ) -> DeskPilotResult<ToolOutput> {
        if args.get("action").and_then(|a| a.as_str()) == Some("screenshot") {
            return Ok(ToolOutput::InlinePng(self.png.clone()));
        }
        self.executed
            .lock()
            .unwrap()
            .push((name.to_string(), args.clone()));
        Ok(ToolOutput::Text("ok".to_string()))
    }
}

fn screenshot_png() -> Vec<u8> {
    let img = image::DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(
        768,
        768,
        image::Rgba([120, 120, 120, 255]),
    ));
    let mut out = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
        .expect("encode");
    out
}

fn llm_config() -> LlmConfig {
    LlmConfig {
        default_model: PLANNER.to_string(),
        grounding_model: DETECTOR.to_string(),
        planner_temperature: 0.2,
        grounding_thinking_budget: 64,
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    store: Arc<SessionStore>,
    manager: SessionManager,
    runtime: Arc<ScriptedRuntime>,
}

fn harness(plans: Vec<Vec<GenPart>>, detections: Vec<&str>) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(SessionStore::new(dir.path()));
    let runtime = ScriptedRuntime::new(screenshot_png());
    let manager = SessionManager::with_store(
        store.clone(),
        ScriptedGenerator::new(plans, detections),
        runtime.clone(),
        llm_config(),
    );
    Harness {
        _dir: dir,
        store,
        manager,
        runtime,
    }
}

fn click_call(image_id: u64, description: &str) -> GenPart {
    GenPart::FunctionCall {
        id: None,
        name: "computer_click".to_string(),
        args: serde_json::json!({ "image_id": image_id, "element_description": description }),
    }
}

fn stop_plan(text: &str) -> Vec<GenPart> {
    vec![GenPart::text(text)]
}

fn review_requests(log: &[Message]) -> Vec<(usize, String, serde_json::Value, String)> {
    log.iter()
        .enumerate()
        .filter_map(|(index, message)| match &message.review {
            Some(ToolReview::Request {
                review_id,
                grounded_call,
                original_call,
            }) => Some((
                index,
                review_id.clone(),
                grounded_call.args.clone(),
                original_call.id.clone(),
            )),
            _ => None,
        })
        .collect()
}

fn tool_responses(log: &[Message]) -> Vec<(usize, String, String, serde_json::Value)> {
    log.iter()
        .enumerate()
        .filter(|(_, m)| m.role == Role::Tool)
        .flat_map(|(index, m)| {
            m.parts.iter().filter_map(move |part| match part {
                Part::FunctionResponse { id, name, response } => {
                    Some((index, id.clone(), name.clone(), response.clone()))
                }
                _ => None,
            })
        })
        .collect()
}

// S1: a single click whose review the user rejects.
#[tokio::test]
async fn rejected_click_ends_stagnant_with_forged_error() {
    let h = harness(
        vec![vec![
            GenPart::thought("The user wants the File menu."),
            GenPart::text("Clicking the File menu."),
            click_call(0, "File menu"),
        ]],
        vec![r#"{"box_2d": [100, 100, 200, 200], "label": "File menu"}"#],
    );

    let sid = h
        .manager
        .user_input(None, "Open the file menu".to_string(), None)
        .await
        .expect("input accepted");
    h.manager.join(&sid).await;

    let meta = h.store.get(&sid).expect("meta");
    assert_eq!(meta.status, SessionStatus::Pending);
    assert_eq!(meta.status_message.as_deref(), Some("Tool call pending."));

    let log = h.store.get_messages(&sid, true).expect("log");
    let requests = review_requests(&log);
    assert_eq!(requests.len(), 1);
    let (request_index, review_id, grounded_args, original_id) = requests[0].clone();
    // 768x768 screenshot, box center (150, 150): round(150 * 768 / 1000) = 115.
    assert_eq!(grounded_args["coordinate"], serde_json::json!([115, 115]));
    assert_eq!(grounded_args["action"], "click");

    h.manager
        .tool_review(&sid, &review_id, ReviewChoice::RejectOnce)
        .await
        .expect("review accepted");
    h.manager.join(&sid).await;

    let log = h.store.get_messages(&sid, true).expect("log");
    let responses = tool_responses(&log);
    let (response_index, id, _, response) = responses.last().expect("response").clone();
    assert_eq!(id, original_id);
    assert_eq!(response["error"], "Rejected by user");
    assert!(response_index > request_index, "response appended after request");

    // Nothing was executed on the machine.
    assert!(h.runtime.executed().is_empty());

    let meta = h.store.get(&sid).expect("meta");
    assert_eq!(meta.status, SessionStatus::Stagnant);
    assert_eq!(
        meta.status_message.as_deref(),
        Some("User rejected all tool calls.")
    );
}

// S2: one out-of-range click plus one wait that is already accepted for the
// session.
#[tokio::test]
async fn validation_error_and_auto_accepted_wait_share_a_turn() {
    let h = harness(
        vec![
            vec![
                click_call(99, "File menu"),
                GenPart::FunctionCall {
                    id: Some("wait-1".to_string()),
                    name: "computer_wait".to_string(),
                    args: serde_json::json!({ "time": 2.0 }),
                },
            ],
            stop_plan("Done."),
        ],
        vec![],
    );

    let sid = "2026-08-02T10-00-00-000Z";
    h.store
        .create(&SessionMeta::new(sid.into(), "S2".into(), PLANNER.into()))
        .expect("create");
    h.store
        .update(
            sid,
            SessionPatch::auto_accept(["computer_wait".to_string()].into()),
        )
        .expect("accept wait");

    h.manager
        .user_input(Some(sid.to_string()), "wait a moment".to_string(), None)
        .await
        .expect("input accepted");
    h.manager.join(sid).await;

    let log = h.store.get_messages(sid, true).expect("log");
    let responses = tool_responses(&log);

    let forged = responses
        .iter()
        .find(|(_, _, name, _)| name == "computer_click")
        .expect("forged click response");
    let error = forged.3["error"].as_str().expect("error string");
    assert!(
        error.contains("Image ID exceeds the number of cropped screenshots"),
        "{error}"
    );

    let requests = review_requests(&log);
    assert_eq!(requests.len(), 1, "only the wait call needs a review entry");

    let executed = h.runtime.executed();
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].1["action"], "wait");

    let wait_response = responses
        .iter()
        .find(|(_, id, _, _)| id == "wait-1")
        .expect("wait response");
    assert_eq!(wait_response.3["output"], "ok");

    // Forged errors precede the review narration, which precedes the delayed
    // execution's response.
    assert!(forged.0 < requests[0].0);
    assert!(requests[0].0 < wait_response.0);

    let meta = h.store.get(sid).expect("meta");
    assert_eq!(meta.status, SessionStatus::Stagnant);
    assert_eq!(
        meta.status_message.as_deref(),
        Some("No more tool calls from model.")
    );
}

// S3: accept_session on turn A suppresses the review gate on turn B.
#[tokio::test]
async fn accept_session_carries_across_turns() {
    let h = harness(
        vec![
            vec![click_call(0, "File menu")],
            vec![click_call(0, "Edit menu")],
            stop_plan("Done."),
        ],
        vec![
            r#"{"box_2d": [100, 100, 200, 200]}"#,
            r#"{"box_2d": [300, 300, 400, 400]}"#,
        ],
    );

    let sid = h
        .manager
        .user_input(None, "Open menus".to_string(), None)
        .await
        .expect("input accepted");
    h.manager.join(&sid).await;

    let log = h.store.get_messages(&sid, true).expect("log");
    let requests = review_requests(&log);
    assert_eq!(requests.len(), 1);
    h.manager
        .tool_review(&sid, &requests[0].1, ReviewChoice::AcceptSession)
        .await
        .expect("review accepted");
    h.manager.join(&sid).await;

    let meta = h.store.get(&sid).expect("meta");
    assert!(meta.auto_accept.contains("computer_click"));
    assert_eq!(meta.status, SessionStatus::Stagnant);

    // Turn B produced a second review request answered synthetically, and
    // both clicks were executed: (115, 115) then round(350 * 0.768) = 269.
    let executed = h.runtime.executed();
    assert_eq!(executed.len(), 2);
    assert_eq!(executed[0].1["coordinate"], serde_json::json!([115, 115]));
    assert_eq!(executed[1].1["coordinate"], serde_json::json!([269, 269]));

    let log = h.store.get_messages(&sid, true).expect("log");
    assert_eq!(review_requests(&log).len(), 2);
    let auto_responses: Vec<_> = log
        .iter()
        .filter(|m| {
            matches!(
                &m.review,
                Some(ToolReview::Response { choice, .. }) if *choice == ReviewChoice::AcceptSession
            )
        })
        .collect();
    assert_eq!(auto_responses.len(), 2, "user response plus synthetic response");
}

// S4: empty plan twice ends the turn with an error status.
#[tokio::test]
async fn empty_model_output_errors_after_one_retry() {
    let h = harness(vec![vec![], vec![]], vec![]);

    let sid = h
        .manager
        .user_input(None, "hello".to_string(), None)
        .await
        .expect("input accepted");
    h.manager.join(&sid).await;

    let meta = h.store.get(&sid).expect("meta");
    assert_eq!(meta.status, SessionStatus::Error);
    assert_eq!(
        meta.status_message.as_deref(),
        Some("Model returned empty response even after retry.")
    );
    assert!(h.runtime.executed().is_empty());
}

// S5: a degenerate detection box becomes a forged grounding error and the
// turn keeps going.
#[tokio::test]
async fn invalid_detection_box_is_forged_and_turn_continues() {
    let h = harness(
        vec![vec![click_call(0, "File menu")], stop_plan("Giving up.")],
        vec![r#"{"box_2d": [10, 10, 5, 20]}"#],
    );

    let sid = h
        .manager
        .user_input(None, "Open the file menu".to_string(), None)
        .await
        .expect("input accepted");
    h.manager.join(&sid).await;

    let log = h.store.get_messages(&sid, true).expect("log");
    let responses = tool_responses(&log);
    assert_eq!(responses.len(), 1);
    let error = responses[0].3["error"].as_str().expect("error string");
    assert!(error.starts_with("Error during grounding:"), "{error}");

    assert!(h.runtime.executed().is_empty());
    let meta = h.store.get(&sid).expect("meta");
    assert_eq!(meta.status, SessionStatus::Stagnant);
}

// S6: two pending reviews resolve one at a time; execution happens only after
// the second resolution, in request order, as one tool message.
#[tokio::test]
async fn resumption_waits_for_every_pending_review() {
    let h = harness(
        vec![
            vec![click_call(0, "Save button"), click_call(0, "Close button")],
            stop_plan("Done."),
        ],
        vec![
            r#"{"box_2d": [100, 100, 200, 200]}"#,
            r#"{"box_2d": [600, 600, 700, 700]}"#,
        ],
    );

    let sid = h
        .manager
        .user_input(None, "Save and close".to_string(), None)
        .await
        .expect("input accepted");
    h.manager.join(&sid).await;

    let log = h.store.get_messages(&sid, true).expect("log");
    let requests = review_requests(&log);
    assert_eq!(requests.len(), 2);

    h.manager
        .tool_review(&sid, &requests[0].1, ReviewChoice::AcceptOnce)
        .await
        .expect("first review");
    // One review outstanding: nothing resumed, nothing executed.
    assert!(h.runtime.executed().is_empty());

    h.manager
        .tool_review(&sid, &requests[1].1, ReviewChoice::AcceptOnce)
        .await
        .expect("second review");
    h.manager.join(&sid).await;

    // Both calls ran in request order: centers (115, 115) and (499, 499).
    let executed = h.runtime.executed();
    assert_eq!(executed.len(), 2);
    assert_eq!(executed[0].1["coordinate"], serde_json::json!([115, 115]));
    assert_eq!(executed[1].1["coordinate"], serde_json::json!([499, 499]));

    // Accept-once leaves the accept-set empty.
    let meta = h.store.get(&sid).expect("meta");
    assert!(meta.auto_accept.is_empty());
    assert_eq!(meta.status, SessionStatus::Stagnant);

    // Both responses landed in a single tool message, ids matching originals.
    let log = h.store.get_messages(&sid, true).expect("log");
    let responses = tool_responses(&log);
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0].0, responses[1].0, "one message holds both");
    assert_eq!(responses[0].1, requests[0].3);
    assert_eq!(responses[1].1, requests[1].3);
}

// Resumption guardrails: unknown and double-answered reviews are rejected
// without touching the log.
#[tokio::test]
async fn stale_reviews_are_rejected_synchronously() {
    let h = harness(
        vec![vec![click_call(0, "Save button")]],
        vec![r#"{"box_2d": [100, 100, 200, 200]}"#],
    );

    let sid = h
        .manager
        .user_input(None, "Save".to_string(), None)
        .await
        .expect("input accepted");
    h.manager.join(&sid).await;

    assert!(h
        .manager
        .tool_review(&sid, "no-such-review", ReviewChoice::AcceptOnce)
        .await
        .is_err());

    let log_before = h.store.get_messages(&sid, true).expect("log");
    let requests = review_requests(&log_before);
    h.manager
        .tool_review(&sid, &requests[0].1, ReviewChoice::RejectOnce)
        .await
        .expect("first resolution");
    h.manager.join(&sid).await;

    let log_len = h.store.get_messages(&sid, true).expect("log").len();
    assert!(h
        .manager
        .tool_review(&sid, &requests[0].1, ReviewChoice::AcceptOnce)
        .await
        .is_err());
    assert_eq!(
        h.store.get_messages(&sid, true).expect("log").len(),
        log_len,
        "rejected review left the log untouched"
    );
}
