pub mod events;
pub mod manager;
pub mod runner;

pub use events::{AgentEvent, EventBus};
pub use manager::SessionManager;
pub use runner::{run_agent, AgentContext, ResolvedReview, TurnInput};
