//! Post-evaluation edit detection.
//!
//! The evaluator's verdict applies to the body it saw. If the body
//! changes afterwards (a favorite move of injection attempts, which
//! swap a benign issue for a hostile one after approval), the pipeline
//! must not keep coding against the stale verdict.

use serde::{Deserialize, Serialize};

use crate::pipeline::state::IssueState;
use crate::util::sha256_hex;

/// What to do about a detected edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditAction {
    /// Stop the pipeline for this issue; a human looks at it.
    Halt,
    /// Send the issue back through evaluation.
    Reevaluate,
}

/// Result of one edit check, with both hashes for the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditCheck {
    pub detected: bool,
    pub action: Option<EditAction>,
    pub recorded_hash: String,
    pub current_hash: String,
}

/// Compare the recorded body hash against the current body.
///
/// Mid-write (`Coding`/`Iterating`) the only safe answer is to halt;
/// everywhere else the issue goes back through evaluation.
pub fn check_edit(recorded_hash: &str, current_body: &str, state: IssueState) -> EditCheck {
    let current_hash = sha256_hex(current_body.as_bytes());
    if current_hash == recorded_hash {
        return EditCheck {
            detected: false,
            action: None,
            recorded_hash: recorded_hash.to_string(),
            current_hash,
        };
    }

    let action = match state {
        IssueState::Coding | IssueState::Iterating => EditAction::Halt,
        _ => EditAction::Reevaluate,
    };
    EditCheck {
        detected: true,
        action: Some(action),
        recorded_hash: recorded_hash.to_string(),
        current_hash,
    }
}
