use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::errors::{DeskPilotError, DeskPilotResult};
use crate::store::message::Message;
use crate::store::session::{SessionMeta, SessionPatch};

const METADATA_FILE: &str = "metadata.json";
const LOG_FILE: &str = "messages.jsonl";
const IMAGES_DIR: &str = "images";

/// Append-only filesystem persistence for sessions.
///
/// Layout: `<root>/<sessionId>/metadata.json`, `messages.jsonl` (one message
/// per line), `images/<fileName>`. Concurrent appends to the same session are
/// serialized by the caller: each session has exactly one agent task.
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    pub fn create(&self, meta: &SessionMeta) -> DeskPilotResult<()> {
        let dir = self.session_dir(&meta.id);
        if dir.exists() {
            return Err(DeskPilotError::Storage(format!(
                "session '{}' already exists",
                meta.id
            )));
        }
        fs::create_dir_all(dir.join(IMAGES_DIR))?;
        self.write_metadata(&meta.id, meta)?;
        // Touch the log so recovery can distinguish "new" from "missing".
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(LOG_FILE))?;
        tracing::info!(session = %meta.id, "session created");
        Ok(())
    }

    pub fn get(&self, id: &str) -> DeskPilotResult<SessionMeta> {
        let path = self.session_dir(id).join(METADATA_FILE);
        let content = fs::read_to_string(&path).map_err(|e| {
            DeskPilotError::Storage(format!("unknown session '{id}': {e}"))
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// All session metadata, ordered by id (chronological). Entries whose
    /// metadata cannot be read or parsed are skipped.
    pub fn list(&self) -> DeskPilotResult<Vec<SessionMeta>> {
        let mut sessions = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(sessions),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().to_string();
            match self.get(&id) {
                Ok(meta) => sessions.push(meta),
                Err(e) => {
                    tracing::warn!(session = %id, error = %e, "skipping unreadable session metadata");
                }
            }
        }
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(sessions)
    }

    pub fn update(&self, id: &str, patch: SessionPatch) -> DeskPilotResult<SessionMeta> {
        let mut meta = self.get(id)?;
        patch.apply(&mut meta);
        self.write_metadata(id, &meta)?;
        Ok(meta)
    }

    /// Atomically extends the log: all messages are serialized into one
    /// buffer and appended with a single write.
    pub fn append_messages(&self, id: &str, messages: &[Message]) -> DeskPilotResult<()> {
        if messages.is_empty() {
            return Ok(());
        }
        if !self.session_dir(id).exists() {
            return Err(DeskPilotError::Storage(format!("unknown session '{id}'")));
        }
        let mut buf = Vec::new();
        for message in messages {
            serde_json::to_writer(&mut buf, message)?;
            buf.push(b'\n');
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.session_dir(id).join(LOG_FILE))?;
        file.write_all(&buf)?;
        file.flush()?;
        Ok(())
    }

    /// The full log in append order. When `include_hidden` is false, LLM-only
    /// messages (`forDisplay == false`) are filtered out. A partial record at
    /// end-of-file (torn write) is treated as absent.
    pub fn get_messages(&self, id: &str, include_hidden: bool) -> DeskPilotResult<Vec<Message>> {
        if !self.session_dir(id).exists() {
            return Err(DeskPilotError::Storage(format!("unknown session '{id}'")));
        }
        let path = self.session_dir(id).join(LOG_FILE);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let lines: Vec<&str> = content.lines().collect();
        let mut messages = Vec::with_capacity(lines.len());
        for (index, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(line) {
                Ok(message) => messages.push(message),
                Err(e) if index == lines.len() - 1 => {
                    tracing::debug!(session = %id, error = %e, "ignoring partial trailing record");
                }
                Err(e) => {
                    tracing::warn!(session = %id, line = index, error = %e, "skipping corrupt log record");
                }
            }
        }

        if !include_hidden {
            messages.retain(|m| !m.is_hidden());
        }
        Ok(messages)
    }

    /// Writes a PNG blob under the session. `name` must already be sanitized
    /// via [`crate::store::sanitize_file_name`].
    pub fn put_image(&self, id: &str, name: &str, bytes: &[u8]) -> DeskPilotResult<()> {
        let dir = self.session_dir(id).join(IMAGES_DIR);
        if !dir.exists() {
            return Err(DeskPilotError::Storage(format!("unknown session '{id}'")));
        }
        fs::write(dir.join(name), bytes)?;
        Ok(())
    }

    pub fn get_image(&self, id: &str, name: &str) -> DeskPilotResult<Vec<u8>> {
        let path = self.session_dir(id).join(IMAGES_DIR).join(name);
        fs::read(&path).map_err(|e| {
            DeskPilotError::Storage(format!("image '{name}' in session '{id}': {e}"))
        })
    }

    fn write_metadata(&self, id: &str, meta: &SessionMeta) -> DeskPilotResult<()> {
        let content = serde_json::to_string_pretty(meta)?;
        fs::write(self.session_dir(id).join(METADATA_FILE), content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::message::{Part, Role};
    use crate::store::session::SessionStatus;

    fn store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(dir.path());
        (dir, store)
    }

    fn meta(id: &str) -> SessionMeta {
        SessionMeta::new(id.into(), "Test".into(), "model-x".into())
    }

    #[test]
    fn create_rejects_duplicates() {
        let (_dir, store) = store();
        store.create(&meta("s-1")).expect("first create");
        assert!(store.create(&meta("s-1")).is_err());
    }

    #[test]
    fn append_preserves_order_and_hidden_filtering() {
        let (_dir, store) = store();
        store.create(&meta("s-1")).expect("create");

        let visible = Message::new(Role::User, vec![Part::text("hello")]);
        let hidden = Message::new(Role::Workflow, vec![Part::text("tiles")]).hidden();
        let display = Message::new(Role::Workflow, vec![Part::text("shot")]).display_only();
        store
            .append_messages("s-1", &[visible.clone(), hidden.clone(), display.clone()])
            .expect("append");

        let all = store.get_messages("s-1", true).expect("all");
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, visible.id);
        assert_eq!(all[1].id, hidden.id);

        let shown = store.get_messages("s-1", false).expect("shown");
        assert_eq!(shown.len(), 2);
        assert!(shown.iter().all(|m| !m.is_hidden()));
    }

    #[test]
    fn partial_trailing_line_is_ignored() {
        let (dir, store) = store();
        store.create(&meta("s-1")).expect("create");
        store
            .append_messages("s-1", &[Message::new(Role::User, vec![Part::text("ok")])])
            .expect("append");

        let log = dir.path().join("s-1").join("messages.jsonl");
        let mut file = OpenOptions::new().append(true).open(&log).expect("open");
        file.write_all(b"{\"id\":\"torn").expect("write torn record");

        let messages = store.get_messages("s-1", true).expect("read");
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn update_merges_partial_metadata() {
        let (_dir, store) = store();
        store.create(&meta("s-1")).expect("create");
        let updated = store
            .update(
                "s-1",
                SessionPatch::status(SessionStatus::Stagnant, Some("done".into())),
            )
            .expect("update");
        assert_eq!(updated.status, SessionStatus::Stagnant);
        assert_eq!(updated.name, "Test");
        assert_eq!(store.get("s-1").expect("get").status, SessionStatus::Stagnant);
    }

    #[test]
    fn list_skips_unreadable_metadata() {
        let (dir, store) = store();
        store.create(&meta("s-1")).expect("create");
        store.create(&meta("s-2")).expect("create");
        fs::write(dir.path().join("s-2").join("metadata.json"), "not json").expect("corrupt");

        let sessions = store.list().expect("list");
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, "s-1");
    }

    #[test]
    fn image_round_trip() {
        let (_dir, store) = store();
        store.create(&meta("s-1")).expect("create");
        store.put_image("s-1", "shot.png", b"\x89PNG-ish").expect("put");
        assert_eq!(store.get_image("s-1", "shot.png").expect("get"), b"\x89PNG-ish");
        assert!(store.get_image("s-1", "missing.png").is_err());
    }
}
