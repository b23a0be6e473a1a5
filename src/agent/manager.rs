use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::agent::events::{AgentEvent, EventBus};
use crate::agent::runner::{run_agent, AgentContext, ResolvedReview, TurnInput};
use crate::config::{AppConfig, LlmConfig};
use crate::errors::{DeskPilotError, DeskPilotResult};
use crate::llm::provider::ContentGenerator;
use crate::store::message::{FunctionCall, Message, ReviewChoice, Role, ToolReview};
use crate::store::session::{new_session_id, SessionMeta, SessionPatch};
use crate::store::SessionStore;
use crate::tools::runtime::ToolRuntime;

struct SessionTask {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

/// Owns the store, the external seams and the event bus, and maps client
/// requests onto per-session agent tasks. One logical task per session;
/// overlapping input for a busy session is refused rather than queued.
pub struct SessionManager {
    store: Arc<SessionStore>,
    generator: Arc<dyn ContentGenerator>,
    runtime: Arc<dyn ToolRuntime>,
    events: EventBus,
    llm: LlmConfig,
    tasks: Mutex<HashMap<String, SessionTask>>,
}

impl SessionManager {
    pub fn new(
        config: &AppConfig,
        generator: Arc<dyn ContentGenerator>,
        runtime: Arc<dyn ToolRuntime>,
    ) -> Self {
        Self::with_store(
            Arc::new(SessionStore::new(config.storage_root.clone())),
            generator,
            runtime,
            config.llm.clone(),
        )
    }

    pub fn with_store(
        store: Arc<SessionStore>,
        generator: Arc<dyn ContentGenerator>,
        runtime: Arc<dyn ToolRuntime>,
        llm: LlmConfig,
    ) -> Self {
        Self {
            store,
            generator,
            runtime,
            events: EventBus::default(),
            llm,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    /// Starts a new turn from user text. With no session id a session is
    /// created, named after the input. Returns the session id.
    pub async fn user_input(
        &self,
        session_id: Option<String>,
        input: String,
        model: Option<String>,
    ) -> DeskPilotResult<String> {
        let session_id = match session_id {
            Some(id) => {
                let meta = self.store.get(&id)?;
                if let Some(model) = model.filter(|m| *m != meta.model) {
                    self.store.update(
                        &id,
                        SessionPatch {
                            model: Some(model),
                            ..SessionPatch::default()
                        },
                    )?;
                }
                id
            }
            None => {
                let id = new_session_id(Utc::now());
                let name: String = input.chars().take(64).collect();
                let model = model.unwrap_or_else(|| self.llm.default_model.clone());
                self.store.create(&SessionMeta::new(id.clone(), name, model))?;
                id
            }
        };
        self.spawn(&session_id, TurnInput::UserText(input)).await?;
        Ok(session_id)
    }

    /// Resolves one pending review. Rejected synchronously when the review id
    /// is unknown or already answered. Once the suspended turn's request set
    /// is fully answered the agent resumes with the complete decision list.
    pub async fn tool_review(
        &self,
        session_id: &str,
        review_id: &str,
        choice: ReviewChoice,
    ) -> DeskPilotResult<()> {
        let meta = self.store.get(session_id)?;
        let log = self.store.get_messages(session_id, true)?;

        // Requests persisted after the most recent model message belong to
        // the suspended turn; older requests are already resolved.
        let last_model = log.iter().rposition(|m| m.role == Role::Model);
        let mut current: Vec<(String, FunctionCall, FunctionCall)> = Vec::new();
        let mut all_requests: HashSet<&str> = HashSet::new();
        let mut responses: HashMap<String, ReviewChoice> = HashMap::new();
        for (index, message) in log.iter().enumerate() {
            match &message.review {
                Some(ToolReview::Request {
                    review_id,
                    grounded_call,
                    original_call,
                }) => {
                    all_requests.insert(review_id.as_str());
                    if last_model.map_or(true, |m| index > m) {
                        current.push((
                            review_id.clone(),
                            grounded_call.clone(),
                            original_call.clone(),
                        ));
                    }
                }
                Some(ToolReview::Response { review_id, choice }) => {
                    responses.insert(review_id.clone(), *choice);
                }
                None => {}
            }
        }

        if !all_requests.contains(review_id) {
            return Err(DeskPilotError::Review(format!(
                "unknown review id '{review_id}'"
            )));
        }
        if responses.contains_key(review_id) {
            return Err(DeskPilotError::Review(format!(
                "review '{review_id}' already answered"
            )));
        }

        let response = Message::new(Role::User, vec![]).with_review(ToolReview::Response {
            review_id: review_id.to_string(),
            choice,
        });
        self.store.append_messages(session_id, std::slice::from_ref(&response))?;
        self.events.emit(AgentEvent::PersistentMessage {
            session_id: session_id.to_string(),
            message: response,
        });
        responses.insert(review_id.to_string(), choice);

        if current.iter().any(|(id, ..)| !responses.contains_key(id)) {
            tracing::debug!(session = %session_id, "reviews still outstanding, not resuming");
            return Ok(());
        }

        // Accepted-for-session names extend the accept-set before resuming.
        let mut accept = meta.auto_accept.clone();
        let mut changed = false;
        for (id, _, original) in &current {
            if responses[id] == ReviewChoice::AcceptSession && accept.insert(original.name.clone())
            {
                changed = true;
            }
        }
        if changed {
            self.store
                .update(session_id, SessionPatch::auto_accept(accept))?;
        }

        let decisions: Vec<ResolvedReview> = current
            .into_iter()
            .map(|(id, grounded, original)| ResolvedReview {
                choice: responses[&id],
                grounded,
                original,
            })
            .collect();
        self.spawn(session_id, TurnInput::ReviewDecisions(decisions))
            .await
    }

    /// Cancels the session's in-flight turn, if any.
    pub async fn close_session(&self, session_id: &str) {
        let mut tasks = self.tasks.lock().await;
        if let Some(task) = tasks.remove(session_id) {
            task.cancel.cancel();
        }
    }

    /// Awaits completion of the session's current task. Test hook.
    pub async fn join(&self, session_id: &str) {
        let task = self.tasks.lock().await.remove(session_id);
        if let Some(task) = task {
            let _ = task.handle.await;
        }
    }

    async fn spawn(&self, session_id: &str, input: TurnInput) -> DeskPilotResult<()> {
        let meta = self.store.get(session_id)?;
        let mut tasks = self.tasks.lock().await;
        if let Some(task) = tasks.get(session_id) {
            if !task.handle.is_finished() {
                return Err(DeskPilotError::Agent(format!(
                    "session '{session_id}' already has an active turn"
                )));
            }
        }

        let cancel = CancellationToken::new();
        let ctx = AgentContext {
            store: self.store.clone(),
            generator: self.generator.clone(),
            runtime: self.runtime.clone(),
            events: self.events.clone(),
            llm: self.llm.clone(),
            session_id: session_id.to_string(),
            model: meta.model,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(async move {
            let _ = run_agent(&ctx, input).await;
        });
        tasks.insert(session_id.to_string(), SessionTask { cancel, handle });
        Ok(())
    }
}
