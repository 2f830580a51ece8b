//! Adversary-aware boundary between the forge and the LLM.
//!
//! Everything a user can type (issue bodies, comments, review comments,
//! PR descriptions) passes through the sanitizer before an LLM sees it,
//! and everything an LLM proposes passes through the output validator
//! before a byte reaches the forge.

pub mod boundary;
pub mod classifier;
pub mod sanitizer;
pub mod trust;
pub mod validator;

pub use boundary::PromptGuard;
pub use classifier::{ThreatAssessment, ThreatClass, ThreatClassifier};
pub use sanitizer::{SanitizeResult, sanitize};
pub use trust::{Thresholds, TrustProfile, TrustResolver, TrustTier, compute_thresholds};
pub use validator::{
    FileChange, ValidationIssue, ValidationReport, ValidationSeverity, validate_output,
};
