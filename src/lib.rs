//! Argus: an adversary-aware autonomous forge agent.
//!
//! The library is the whole agent; the binary is a thin shell. Embedders
//! supply the transport-facing ports (`ports::Forge`, `ports::LlmClient`,
//! `notify::Notifier`) and hand them to `pipeline::Orchestrator`.

pub mod config;
pub mod crypto;
pub mod errors;
pub mod logging;
pub mod notify;
pub mod pipeline;
pub mod ports;
pub mod security;
pub mod store;
pub mod util;
