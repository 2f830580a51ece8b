//! Agentic issue evaluator.
//!
//! The evaluator hands the LLM a repository snapshot plus the sanitized
//! issue (framed between boundary markers) and lets it explore with a
//! `READ_FILES:` directive for a bounded number of turns before it must
//! render a verdict. Parsing fails open: a broken or hijacked response
//! becomes `merit=true` at low confidence with triage labels, never a
//! silent rejection.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RepoDescriptor;
use crate::errors::PipelineError;
use crate::pipeline::state::IssueEvaluation;
use crate::ports::{ChatMessage, Forge, IssueData, LlmClient};
use crate::security::boundary::PromptGuard;
use crate::security::sanitizer::sanitize;
use crate::util::{extract_json_object, truncate_chars};

/// Exploration turns before the LLM must decide.
pub const MAX_EXPLORATION_TURNS: usize = 5;

/// Paths honored per `READ_FILES:` directive.
pub const MAX_FILES_PER_REQUEST: usize = 10;

/// Per-file character budget for fetched content.
const FILE_TRUNCATE_CHARS: usize = 8000;

/// Character budget for the tree listing in the snapshot.
const TREE_TRUNCATE_CHARS: usize = 6000;

/// Labels applied when the evaluator fails open.
pub const LABEL_CANARY_FAILURE: &str = "argus:canary-failure";
pub const LABEL_PARSE_FAILURE: &str = "argus:parse-failure";
pub const LABEL_NEEDS_REVIEW: &str = "argus:needs-review";

/// Label the orchestrator adds when it flips a low-confidence rejection.
pub const LABEL_LOW_CONFIDENCE_OVERRIDE: &str = "argus:low-confidence-override";

/// Manifest files included in the initial snapshot when present.
const MANIFEST_FILES: &[&str] = &[
    "Cargo.toml",
    "package.json",
    "pyproject.toml",
    "go.mod",
    "pom.xml",
    "Makefile",
];

/// The evaluator's result plus bookkeeping for the orchestrator.
#[derive(Debug, Clone)]
pub struct EvaluationOutcome {
    pub evaluation: IssueEvaluation,
    /// Labels the orchestrator should apply (fail-open markers plus the
    /// evaluator's suggestions).
    pub labels: Vec<String>,
    pub llm_calls: u32,
}

/// Multi-turn evaluator over the forge and LLM ports.
pub struct Evaluator {
    forge: Arc<dyn Forge>,
    llm: Option<Arc<dyn LlmClient>>,
}

impl Evaluator {
    pub fn new(forge: Arc<dyn Forge>, llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self { forge, llm }
    }

    /// Evaluate one issue. `Err(LlmUnavailable)` when no LLM is wired in;
    /// every other trouble fails open into a verdict.
    pub async fn evaluate(
        &self,
        repo: &RepoDescriptor,
        issue: &IssueData,
        cancel: CancellationToken,
    ) -> Result<EvaluationOutcome, PipelineError> {
        let llm = self.llm.as_ref().ok_or(PipelineError::LlmUnavailable)?;

        let guard = PromptGuard::new();
        let snapshot = self.build_snapshot(repo).await;
        let title = sanitize(&issue.title);
        let body = sanitize(&issue.body);

        let system = format!(
            "You are the issue evaluator for an autonomous code agent. {preamble} \
             Default to merit=true: only a clearly invalid, spam, or nonsensical \
             issue gets merit=false. You may explore the repository first: reply \
             with a single line `READ_FILES: path1, path2` (at most {max_files} \
             paths) and you will receive their contents. After at most \
             {max_turns} exploration turns, reply with your verdict as one JSON \
             object: {{\"merit\": bool, \"confidence\": 0.0-1.0, \"reasoning\": \
             string, \"proposed_approach\": string, \"affected_files\": [paths], \
             \"suggested_labels\": [strings], \"severity\": \
             \"critical\"|\"high\"|\"medium\"|\"low\"|\"trivial\", \"category\": \
             \"bug\"|\"feature\"|\"improvement\"|\"docs\"|\"question\"|\
             \"duplicate\"|\"invalid\", \"duplicate_of\": number or null}}.",
            preamble = guard.preamble(),
            max_files = MAX_FILES_PER_REQUEST,
            max_turns = MAX_EXPLORATION_TURNS,
        );

        let initial = format!(
            "{snapshot}\n\nIssue #{number} to evaluate:\n\nTitle:\n{title}\n\nBody:\n{body}",
            snapshot = snapshot,
            number = issue.number,
            title = guard.frame(&title.sanitized),
            body = guard.frame(&body.sanitized),
        );

        let mut messages = vec![ChatMessage::system(system), ChatMessage::user(initial)];
        let mut llm_calls = 0u32;

        for turn in 0..=MAX_EXPLORATION_TURNS {
            let response = match llm.send_text(messages.clone(), cancel.clone()).await {
                Ok(text) => text,
                Err(PipelineError::LlmUnavailable) => return Err(PipelineError::LlmUnavailable),
                Err(err) => {
                    warn!(error = %err, "evaluator LLM call failed, failing open");
                    return Ok(fail_open_outcome(0.25, LABEL_PARSE_FAILURE, llm_calls));
                }
            };
            llm_calls += 1;

            if turn < MAX_EXPLORATION_TURNS {
                if let Some(paths) = parse_read_files(&response) {
                    debug!(requested = paths.len(), turn, "evaluator file request");
                    let files = self.fetch_files(repo, &paths).await;
                    messages.push(ChatMessage::assistant(response));
                    messages.push(ChatMessage::user(files));
                    continue;
                }
            }

            if !guard.response_ok(&response) {
                return Ok(fail_open_outcome(0.3, LABEL_CANARY_FAILURE, llm_calls));
            }

            let Some(json) = extract_json_object(&response) else {
                return Ok(fail_open_outcome(0.25, LABEL_PARSE_FAILURE, llm_calls));
            };
            return Ok(match serde_json::from_str::<IssueEvaluation>(&json) {
                Ok(evaluation) => {
                    let labels = evaluation.suggested_labels.clone();
                    EvaluationOutcome {
                        evaluation,
                        labels,
                        llm_calls,
                    }
                }
                Err(err) => {
                    warn!(error = %err, "evaluator verdict unparseable, failing open");
                    fail_open_outcome(0.25, LABEL_PARSE_FAILURE, llm_calls)
                }
            });
        }

        // Exploration budget exhausted without a verdict.
        Ok(fail_open_outcome(0.3, LABEL_NEEDS_REVIEW, llm_calls))
    }

    /// README, well-known manifests, and a compact whole-tree listing.
    async fn build_snapshot(&self, repo: &RepoDescriptor) -> String {
        let mut snapshot = String::from("Repository snapshot:\n");
        let branch = match self.forge.get_default_branch(repo).await {
            Ok(branch) => branch,
            Err(err) => {
                warn!(error = %err, "snapshot: default branch unavailable");
                return snapshot;
            }
        };

        if let Ok(Some(readme)) = self.forge.get_file_content(repo, &branch, "README.md").await {
            snapshot.push_str("\n## README.md\n");
            snapshot.push_str(&truncate_chars(&readme, FILE_TRUNCATE_CHARS, "\n[truncated]"));
        }

        for manifest in MANIFEST_FILES {
            if let Ok(Some(content)) = self.forge.get_file_content(repo, &branch, manifest).await {
                snapshot.push_str(&format!("\n## {}\n", manifest));
                snapshot.push_str(&truncate_chars(&content, 2000, "\n[truncated]"));
            }
        }

        if let Ok(entries) = self.forge.list_tree(repo, &branch, "", true).await {
            let listing: Vec<String> = entries
                .iter()
                .filter(|e| !e.is_dir)
                .map(|e| e.path.clone())
                .collect();
            snapshot.push_str("\n## File tree\n");
            snapshot.push_str(&truncate_chars(
                &listing.join("\n"),
                TREE_TRUNCATE_CHARS,
                "\n[truncated]",
            ));
        }

        snapshot
    }

    async fn fetch_files(&self, repo: &RepoDescriptor, paths: &[String]) -> String {
        let branch = match self.forge.get_default_branch(repo).await {
            Ok(branch) => branch,
            Err(_) => return "Requested files are unavailable.".to_string(),
        };

        let mut out = String::from("Requested files:\n");
        for path in paths.iter().take(MAX_FILES_PER_REQUEST) {
            match self.forge.get_file_content(repo, &branch, path).await {
                Ok(Some(content)) => {
                    out.push_str(&format!("\n## {}\n", path));
                    out.push_str(&truncate_chars(&content, FILE_TRUNCATE_CHARS, "\n[truncated]"));
                }
                Ok(None) => out.push_str(&format!("\n## {} (not found)\n", path)),
                Err(err) => out.push_str(&format!("\n## {} (error: {})\n", path, err)),
            }
        }
        out
    }
}

/// Extract a `READ_FILES:` directive. Only the first such line counts.
fn parse_read_files(response: &str) -> Option<Vec<String>> {
    let line = response
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("READ_FILES:"))?;
    let paths: Vec<String> = line["READ_FILES:".len()..]
        .split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();
    if paths.is_empty() { None } else { Some(paths) }
}

fn fail_open_outcome(confidence: f64, label: &str, llm_calls: u32) -> EvaluationOutcome {
    EvaluationOutcome {
        evaluation: IssueEvaluation::fail_open(confidence, label),
        labels: vec![label.to_string(), LABEL_NEEDS_REVIEW.to_string()],
        llm_calls,
    }
}
