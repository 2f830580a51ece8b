//! Ports to the agent's external collaborators.
//!
//! The core never talks to a transport directly: every side effect goes
//! through one of these traits. Real implementations (HTTP forge clients,
//! an Anthropic-backed LLM client, an SMTP notifier) live outside this
//! crate's core; test doubles live with the tests.

pub mod forge;
pub mod llm;
pub mod types;

pub use forge::Forge;
pub use llm::{ChatMessage, ChatRole, LlmClient};
pub use types::*;
