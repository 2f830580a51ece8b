//! Typed error hierarchy for the Argus agent.
//!
//! Three top-level enums cover the three subsystems:
//! - `PipelineError`: orchestrator and per-issue state machine failures
//! - `SecurityError`: sanitizer, classifier, and validator outcomes
//! - `CryptoError`: identity, stamp, and audit-chain failures

use thiserror::Error;

/// Errors from the pipeline subsystem (orchestrator, evaluator, coder).
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Transient forge error: {0}")]
    TransientForge(String),

    #[error("No LLM client configured")]
    LlmUnavailable,

    #[error("LLM response missing canary token")]
    LlmCanaryFailure,

    #[error("Output validation rejected iteration {iteration}: {summary}")]
    ValidationRejected { iteration: u32, summary: String },

    #[error("Refusing to write forbidden path {path}")]
    ForbiddenWrite { path: String },

    #[error("Issue body edited after evaluation (state {state})")]
    EditDetected { state: String },

    #[error("Acknowledgment loop detected in PR chain rooted at #{root}")]
    LoopDetected { root: u64 },

    #[error("Iteration budget exhausted after {iterations} iterations")]
    BudgetExhausted { iterations: u32 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the security layer.
#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("Input truncated from {original} to {limit} characters")]
    SanitizerOverflow { original: usize, limit: usize },

    #[error("Threat classification failed: {0}")]
    ClassificationFailed(String),

    #[error("Trust lookup failed for {username}: {message}")]
    TrustLookupFailed { username: String, message: String },
}

/// Errors from the cryptographic identity layer.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("No signing key present; refusing to run without an identity")]
    MissingKey,

    #[error("Stamp nonce {nonce} replayed against a different comment")]
    ReplayDetected { nonce: String },

    #[error("Stamp signature does not verify; content may be tampered")]
    TamperDetected,

    #[error("Stamp timestamp is {seconds}s in the future")]
    FutureTimestamp { seconds: i64 },

    #[error("Audit chain broken at entry {id}: {reason}")]
    AuditChainBroken { id: String, reason: String },

    #[error("Store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
