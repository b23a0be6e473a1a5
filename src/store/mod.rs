pub mod message;
pub mod session;
pub mod store;

pub use message::{FunctionCall, Message, Part, ReviewChoice, Role, ToolReview};
pub use session::{new_session_id, sanitize_file_name, SessionMeta, SessionPatch, SessionStatus};
pub use store::SessionStore;
