//! The issue pipeline: everything between "an issue was updated" and
//! "a signed pull request is open and monitored".
//!
//! The orchestrator composes the per-stage components; each stage talks
//! to the outside world only through the ports.

pub mod activity;
pub mod chain;
pub mod coder;
pub mod comments;
pub mod edit_detector;
pub mod evaluator;
pub mod investigator;
pub mod orchestrator;
pub mod pr_analysis;
pub mod state;

pub use activity::ActivityLog;
pub use chain::{AckLimiter, ChainDecision, ChainDetector, ChainGraph, MAX_CHAIN_DEPTH};
pub use coder::{Coder, CodingOutcome};
pub use comments::{CommentContext, CommentHandler, ModerationAction, ModerationOutcome};
pub use edit_detector::{EditAction, EditCheck, check_edit};
pub use evaluator::{EvaluationOutcome, Evaluator};
pub use investigator::{Investigation, Investigator, SuggestedChange};
pub use orchestrator::{Orchestrator, Timing};
pub use pr_analysis::{AnalysisOutcome, CompetitorScore, PrAnalyzer, SynthesisPlan};
pub use state::{
    Category, CiResult, CodingIteration, IssueEvaluation, IssueState, Severity, TrackedIssue,
};
