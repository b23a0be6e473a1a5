use crate::errors::{DeskPilotError, DeskPilotResult};
use crate::llm::types::{Content, GenPart, GenRole};
use crate::store::message::{Part, Role};
use crate::store::SessionStore;

/// Appends `content` to the history, merging it into the previous entry when
/// both sides have the same role. Used both when seeding history from storage
/// and when appending freshly produced turns mid-run.
pub fn push_merged(history: &mut Vec<Content>, content: Content) {
    if content.parts.is_empty() {
        return;
    }
    match history.last_mut() {
        Some(last) if last.role == content.role => {
            last.parts.extend(content.parts);
        }
        _ => history.push(content),
    }
}

/// Reconstructs the LLM-visible history from a session's persisted log.
///
/// User-visible-only notes are skipped, the `model` role maps to the model
/// side and every other role to the user side, thought parts are never
/// forwarded, and image references are inlined as base64 PNG after checking
/// they belong to this session.
pub fn assemble_history(store: &SessionStore, session_id: &str) -> DeskPilotResult<Vec<Content>> {
    let messages = store.get_messages(session_id, true)?;
    let mut history: Vec<Content> = Vec::new();

    for message in &messages {
        if message.for_display == Some(true) {
            continue;
        }
        let role = match message.role {
            Role::Model => GenRole::Model,
            _ => GenRole::User,
        };

        let mut parts = Vec::with_capacity(message.parts.len());
        for part in &message.parts {
            match part {
                Part::Text { text } => parts.push(GenPart::text(text.clone())),
                Part::Thought { .. } => {}
                Part::FunctionCall { id, name, args } => parts.push(GenPart::FunctionCall {
                    id: Some(id.clone()),
                    name: name.clone(),
                    args: args.clone(),
                }),
                Part::FunctionResponse { id, name, response } => {
                    parts.push(GenPart::FunctionResponse {
                        id: id.clone(),
                        name: name.clone(),
                        response: response.clone(),
                    })
                }
                Part::Image { reference } => {
                    let (ref_session, file) =
                        Part::parse_internal_ref(reference).ok_or_else(|| {
                            DeskPilotError::Storage(format!("malformed image reference '{reference}'"))
                        })?;
                    if ref_session != session_id {
                        return Err(DeskPilotError::Storage(format!(
                            "image reference '{reference}' belongs to a different session"
                        )));
                    }
                    let bytes = store.get_image(session_id, file)?;
                    parts.push(GenPart::png(&bytes));
                }
            }
        }

        push_merged(&mut history, Content { role, parts });
    }

    Ok(history)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::message::Message;
    use crate::store::{SessionMeta, SessionStore};

    fn seeded_store(session: &str) -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(dir.path());
        store
            .create(&SessionMeta::new(session.into(), "t".into(), "m".into()))
            .expect("create");
        (dir, store)
    }

    #[test]
    fn adjacent_same_role_messages_merge() {
        let (_dir, store) = seeded_store("s-1");
        store
            .append_messages(
                "s-1",
                &[
                    Message::new(Role::User, vec![Part::text("open the menu")]),
                    Message::new(Role::Workflow, vec![Part::text("Screenshot at 10:00")]),
                    Message::new(Role::Model, vec![Part::text("Looking.")]),
                    Message::new(Role::Tool, vec![Part::FunctionResponse {
                        id: "c-1".into(),
                        name: ".computer".into(),
                        response: serde_json::json!({"output": "ok"}),
                    }]),
                ],
            )
            .expect("append");

        let history = assemble_history(&store, "s-1").expect("history");
        // user + workflow merge; model stands alone; tool maps to user side.
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].role, GenRole::User);
        assert_eq!(history[0].parts.len(), 2);
        assert_eq!(history[1].role, GenRole::Model);
        assert_eq!(history[2].role, GenRole::User);
    }

    #[test]
    fn thoughts_and_display_only_are_excluded() {
        let (_dir, store) = seeded_store("s-1");
        store
            .append_messages(
                "s-1",
                &[
                    Message::new(Role::Workflow, vec![Part::text("user-facing note")])
                        .display_only(),
                    Message::new(
                        Role::Model,
                        vec![Part::Thought { text: "hmm".into() }, Part::text("done")],
                    ),
                ],
            )
            .expect("append");

        let history = assemble_history(&store, "s-1").expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, GenRole::Model);
        assert_eq!(history[0].parts.len(), 1);
        assert!(matches!(&history[0].parts[0], GenPart::Text { text, thought: false } if text == "done"));
    }

    #[test]
    fn image_parts_are_inlined_as_png() {
        let (_dir, store) = seeded_store("s-1");
        store.put_image("s-1", "shot.png", b"png-bytes").expect("put");
        store
            .append_messages(
                "s-1",
                &[Message::new(
                    Role::Workflow,
                    vec![Part::image_ref("s-1", "shot.png")],
                )
                .hidden()],
            )
            .expect("append");

        let history = assemble_history(&store, "s-1").expect("history");
        assert_eq!(history.len(), 1);
        let GenPart::InlineData { mime_type, data } = &history[0].parts[0] else {
            panic!("expected inline data");
        };
        assert_eq!(mime_type, "image/png");
        assert!(!data.is_empty());
    }

    #[test]
    fn foreign_session_image_reference_is_rejected() {
        let (_dir, store) = seeded_store("s-1");
        store
            .append_messages(
                "s-1",
                &[Message::new(
                    Role::Workflow,
                    vec![Part::image_ref("s-other", "shot.png")],
                )],
            )
            .expect("append");
        assert!(assemble_history(&store, "s-1").is_err());
    }
}
