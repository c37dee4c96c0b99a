//! Alert investigation sessions.
//!
//! A session drives a conversation between a language model and the tools in
//! a [`crate::mcp::ToolRegistry`] until the investigation is concluded.

pub mod message;
pub mod model;
pub mod prompt;
pub mod provider;
pub mod session;
pub mod transcript;

pub use message::{Message, Role, ToolCall, ToolResult};
pub use model::{Model, ModelResponse};
pub use provider::create_model;
pub use session::{Session, SessionOutcome, SessionSettings};
