//! Issue state machine types.
//!
//! An issue is in exactly one state; transitions follow the fixed graph
//! below, with two escape hatches (`Stuck` for unrecoverable errors,
//! `Flagged` for edit-detector halts) reachable from anywhere
//! non-terminal, and one sanctioned re-entry (`PrOpen → ReEvaluate`)
//! when the body changes under an open PR.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::PipelineError;
use crate::pipeline::pr_analysis::CompetitorScore;
use crate::ports::IssueData;
use crate::util::sha256_hex;

/// Pipeline state of a tracked issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueState {
    Pending,
    Evaluating,
    Rejected,
    Approved,
    Branching,
    Coding,
    WaitingCi,
    Iterating,
    PrOpen,
    AnalyzingCompeting,
    Synthesizing,
    Done,
    Stuck,
    Flagged,
    Skipped,
    ReEvaluate,
}

impl IssueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Evaluating => "evaluating",
            Self::Rejected => "rejected",
            Self::Approved => "approved",
            Self::Branching => "branching",
            Self::Coding => "coding",
            Self::WaitingCi => "waiting_ci",
            Self::Iterating => "iterating",
            Self::PrOpen => "pr_open",
            Self::AnalyzingCompeting => "analyzing_competing",
            Self::Synthesizing => "synthesizing",
            Self::Done => "done",
            Self::Stuck => "stuck",
            Self::Flagged => "flagged",
            Self::Skipped => "skipped",
            Self::ReEvaluate => "re_evaluate",
        }
    }

    /// Terminal states never transition again (except operator resume,
    /// which resets rather than transitions).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Rejected | Self::Done | Self::Stuck | Self::Flagged | Self::Skipped
        )
    }

    /// Counts against `max_concurrent_issues`.
    pub fn is_active(&self) -> bool {
        !self.is_terminal() && *self != Self::Pending
    }
}

impl fmt::Display for IssueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IssueState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "evaluating" => Ok(Self::Evaluating),
            "rejected" => Ok(Self::Rejected),
            "approved" => Ok(Self::Approved),
            "branching" => Ok(Self::Branching),
            "coding" => Ok(Self::Coding),
            "waiting_ci" => Ok(Self::WaitingCi),
            "iterating" => Ok(Self::Iterating),
            "pr_open" => Ok(Self::PrOpen),
            "analyzing_competing" => Ok(Self::AnalyzingCompeting),
            "synthesizing" => Ok(Self::Synthesizing),
            "done" => Ok(Self::Done),
            "stuck" => Ok(Self::Stuck),
            "flagged" => Ok(Self::Flagged),
            "skipped" => Ok(Self::Skipped),
            "re_evaluate" => Ok(Self::ReEvaluate),
            _ => Err(format!("Invalid issue state: {}", s)),
        }
    }
}

/// Validate a state transition against the pipeline graph.
pub fn is_valid_transition(from: IssueState, to: IssueState) -> bool {
    use IssueState::*;

    // Unrecoverable error / edit halt are reachable from any live state.
    if !from.is_terminal() && matches!(to, Stuck | Flagged) {
        return true;
    }

    matches!(
        (from, to),
        (Pending, Evaluating)
            | (Pending, Skipped)
            | (Evaluating, Rejected)
            | (Evaluating, Approved)
            | (Approved, Branching)
            | (Branching, Coding)
            | (Coding, WaitingCi)
            | (WaitingCi, Iterating)
            | (WaitingCi, PrOpen)
            | (Iterating, Coding)
            | (PrOpen, AnalyzingCompeting)
            | (PrOpen, ReEvaluate)
            | (AnalyzingCompeting, Synthesizing)
            | (AnalyzingCompeting, Done)
            | (Synthesizing, Done)
            | (ReEvaluate, Evaluating)
    )
}

/// Issue severity as judged by the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    #[default]
    Medium,
    Low,
    Trivial,
}

/// Issue category as judged by the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    #[default]
    Bug,
    Feature,
    Improvement,
    Docs,
    Question,
    Duplicate,
    Invalid,
}

/// The evaluator's verdict. Immutable once stored on the issue.
///
/// Every field defaults, so a partially valid LLM reply still decodes
/// into something safe instead of raising into the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueEvaluation {
    #[serde(default = "default_merit")]
    pub merit: bool,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub proposed_approach: String,
    #[serde(default)]
    pub affected_files: Vec<String>,
    #[serde(default)]
    pub suggested_labels: Vec<String>,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub category: Category,
    #[serde(default)]
    pub duplicate_of: Option<u64>,
}

fn default_merit() -> bool {
    true
}

fn default_confidence() -> f64 {
    0.5
}

impl IssueEvaluation {
    /// The fail-open verdict used when parsing or the canary fails.
    pub fn fail_open(confidence: f64, reason: &str) -> Self {
        Self {
            merit: true,
            confidence,
            reasoning: format!("Deferred to human triage: {}", reason),
            proposed_approach: String::new(),
            affected_files: Vec::new(),
            suggested_labels: Vec::new(),
            severity: Severity::default(),
            category: Category::default(),
            duplicate_of: None,
        }
    }
}

/// CI outcome for one coding iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CiResult {
    #[default]
    Pending,
    Passing,
    Failing,
}

/// One pass through the coder. Append-only within an issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodingIteration {
    pub index: u32,
    pub files_changed: Vec<String>,
    pub commit_message: String,
    pub reasoning: String,
    pub self_review: String,
    pub ci_result: CiResult,
    pub ci_log: Option<String>,
}

/// An issue the orchestrator is (or was) responsible for. Retained
/// indefinitely so polling stays idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedIssue {
    pub repo_key: String,
    pub number: u64,
    pub title: String,
    pub url: String,
    pub state: IssueState,
    /// SHA-256 of the body at evaluation time, for the edit detector.
    pub body_hash: String,
    pub branch: Option<String>,
    pub pr_number: Option<u64>,
    pub pr_url: Option<String>,
    pub iteration: u32,
    pub max_iterations: u32,
    pub evaluation: Option<IssueEvaluation>,
    pub iterations: Vec<CodingIteration>,
    pub competing: Vec<CompetitorScore>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TrackedIssue {
    pub fn new(repo_key: &str, issue: &IssueData, max_iterations: u32) -> Self {
        Self {
            repo_key: repo_key.to_string(),
            number: issue.number,
            title: issue.title.clone(),
            url: issue.url.clone(),
            state: IssueState::Pending,
            body_hash: sha256_hex(issue.body.as_bytes()),
            branch: None,
            pr_number: None,
            pr_url: None,
            iteration: 0,
            max_iterations,
            evaluation: None,
            iterations: Vec::new(),
            competing: Vec::new(),
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    /// Identity key within the orchestrator's session map.
    pub fn key(&self) -> String {
        format!("{}#{}", self.repo_key, self.number)
    }

    /// Transition to `to`, enforcing the graph.
    pub fn transition(&mut self, to: IssueState) -> Result<(), PipelineError> {
        if !is_valid_transition(self.state, to) {
            return Err(PipelineError::Other(anyhow::anyhow!(
                "invalid transition {} -> {} for {}",
                self.state,
                to,
                self.key()
            )));
        }
        self.state = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Force a terminal error state with context. Valid from any live
    /// state, so it bypasses graph validation deliberately.
    pub fn mark_stuck(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
        self.state = IssueState::Stuck;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(number: u64, body: &str) -> IssueData {
        IssueData {
            number,
            title: format!("Issue {}", number),
            body: body.to_string(),
            url: format!("https://example.com/issues/{}", number),
            author: "alice".to_string(),
            labels: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_state_roundtrip() {
        for s in &[
            "pending",
            "evaluating",
            "rejected",
            "approved",
            "branching",
            "coding",
            "waiting_ci",
            "iterating",
            "pr_open",
            "analyzing_competing",
            "synthesizing",
            "done",
            "stuck",
            "flagged",
            "skipped",
            "re_evaluate",
        ] {
            let parsed: IssueState = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("merging".parse::<IssueState>().is_err());
    }

    #[test]
    fn test_happy_path_transitions() {
        use IssueState::*;
        let path = [
            Pending,
            Evaluating,
            Approved,
            Branching,
            Coding,
            WaitingCi,
            PrOpen,
            AnalyzingCompeting,
            Done,
        ];
        for pair in path.windows(2) {
            assert!(
                is_valid_transition(pair[0], pair[1]),
                "{} -> {} should be valid",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_ci_iteration_loop() {
        use IssueState::*;
        assert!(is_valid_transition(WaitingCi, Iterating));
        assert!(is_valid_transition(Iterating, Coding));
        assert!(is_valid_transition(Coding, WaitingCi));
    }

    #[test]
    fn test_reevaluate_reentry() {
        use IssueState::*;
        assert!(is_valid_transition(PrOpen, ReEvaluate));
        assert!(is_valid_transition(ReEvaluate, Evaluating));
    }

    #[test]
    fn test_stuck_and_flagged_from_any_live_state() {
        use IssueState::*;
        for from in [Pending, Evaluating, Coding, WaitingCi, PrOpen, Synthesizing] {
            assert!(is_valid_transition(from, Stuck));
            assert!(is_valid_transition(from, Flagged));
        }
    }

    #[test]
    fn test_terminal_states_transition_nowhere() {
        use IssueState::*;
        for from in [Rejected, Done, Stuck, Flagged, Skipped] {
            for to in [Pending, Evaluating, Coding, Done, Stuck] {
                assert!(
                    !is_valid_transition(from, to),
                    "{} -> {} should be invalid",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_no_backwards_jumps() {
        use IssueState::*;
        assert!(!is_valid_transition(PrOpen, Coding));
        assert!(!is_valid_transition(AnalyzingCompeting, Evaluating));
        assert!(!is_valid_transition(Coding, Evaluating));
    }

    #[test]
    fn test_active_states() {
        assert!(!IssueState::Pending.is_active());
        assert!(!IssueState::Done.is_active());
        assert!(IssueState::Coding.is_active());
        assert!(IssueState::AnalyzingCompeting.is_active());
    }

    #[test]
    fn test_tracked_issue_transition_updates_state() {
        let mut tracked = TrackedIssue::new("github:demo/app", &issue(42, "body"), 5);
        assert_eq!(tracked.state, IssueState::Pending);
        tracked.transition(IssueState::Evaluating).unwrap();
        assert_eq!(tracked.state, IssueState::Evaluating);
        assert!(tracked.transition(IssueState::Done).is_err());
    }

    #[test]
    fn test_tracked_issue_key() {
        let tracked = TrackedIssue::new("github:demo/app", &issue(42, "body"), 5);
        assert_eq!(tracked.key(), "github:demo/app#42");
    }

    #[test]
    fn test_body_hash_captured_at_creation() {
        let tracked = TrackedIssue::new("github:demo/app", &issue(1, "original"), 5);
        assert_eq!(tracked.body_hash, sha256_hex(b"original"));
    }

    #[test]
    fn test_mark_stuck_records_error() {
        let mut tracked = TrackedIssue::new("github:demo/app", &issue(1, "b"), 5);
        tracked.transition(IssueState::Evaluating).unwrap();
        tracked.mark_stuck("network down");
        assert_eq!(tracked.state, IssueState::Stuck);
        assert_eq!(tracked.last_error.as_deref(), Some("network down"));
    }

    #[test]
    fn test_evaluation_decodes_with_defaults() {
        let eval: IssueEvaluation = serde_json::from_str("{}").unwrap();
        assert!(eval.merit);
        assert!((eval.confidence - 0.5).abs() < 1e-9);
        assert_eq!(eval.severity, Severity::Medium);
        assert_eq!(eval.category, Category::Bug);
    }

    #[test]
    fn test_evaluation_decodes_full_payload() {
        let json = r#"{
            "merit": true,
            "confidence": 0.92,
            "reasoning": "clear repro steps",
            "proposed_approach": "guard the empty-input path in Parser::parse",
            "affected_files": ["src/parser.rs"],
            "suggested_labels": ["bug"],
            "severity": "high",
            "category": "bug"
        }"#;
        let eval: IssueEvaluation = serde_json::from_str(json).unwrap();
        assert_eq!(eval.severity, Severity::High);
        assert_eq!(eval.affected_files, vec!["src/parser.rs"]);
        assert!(eval.duplicate_of.is_none());
    }
}
