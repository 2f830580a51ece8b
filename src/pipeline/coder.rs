//! Iterative, CI-driven coder.
//!
//! Each iteration asks the LLM for a change set, validates it, pushes it,
//! and waits on CI. Failing checks feed their logs into the next
//! iteration; a blocked validation feeds the validator's findings back
//! the same way. The validator is the only gate between an LLM proposal
//! and a branch write.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::RepoDescriptor;
use crate::crypto::{AuditAction, AuditDraft, AuditLog};
use crate::errors::PipelineError;
use crate::pipeline::investigator::Investigation;
use crate::pipeline::state::{CiResult, CodingIteration, IssueEvaluation};
use crate::ports::{ChatMessage, CheckRunData, CommitStatusData, Forge, LlmClient};
use crate::security::boundary::PromptGuard;
use crate::security::validator::{FileChange, validate_output};
use crate::util::{extract_json_object, sha256_hex, truncate_chars};

/// CI wait pacing; tests shrink these to milliseconds.
#[derive(Debug, Clone)]
pub struct CoderTiming {
    pub ci_poll_interval: Duration,
    pub ci_deadline: Duration,
    /// If no checks or statuses appear within this window, the repo has
    /// no CI and the push counts as passing.
    pub no_ci_window: Duration,
}

impl Default for CoderTiming {
    fn default() -> Self {
        Self {
            ci_poll_interval: Duration::from_secs(30),
            ci_deadline: Duration::from_secs(600),
            no_ci_window: Duration::from_secs(120),
        }
    }
}

/// What one LLM coding reply must decode into.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
struct CoderProposal {
    #[serde(default)]
    files: Vec<FileChange>,
    #[serde(default)]
    commit_message: String,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    self_review: String,
}

/// The coder's overall result for one issue.
#[derive(Debug, Clone)]
pub struct CodingOutcome {
    pub iterations: Vec<CodingIteration>,
    pub result: CiResult,
    pub pushed_any: bool,
}

/// Iterative coder over the forge and LLM ports.
pub struct Coder {
    forge: Arc<dyn Forge>,
    llm: Option<Arc<dyn LlmClient>>,
    audit: Arc<AuditLog>,
    dry_run: bool,
    timing: CoderTiming,
}

impl Coder {
    pub fn new(
        forge: Arc<dyn Forge>,
        llm: Option<Arc<dyn LlmClient>>,
        audit: Arc<AuditLog>,
        dry_run: bool,
    ) -> Self {
        Self {
            forge,
            llm,
            audit,
            dry_run,
            timing: CoderTiming::default(),
        }
    }

    pub fn with_timing(mut self, timing: CoderTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Run the coding loop on `branch` until CI passes, the budget runs
    /// out, or a fatal error occurs.
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        repo: &RepoDescriptor,
        issue_number: u64,
        branch: &str,
        evaluation: &IssueEvaluation,
        investigation: &Investigation,
        max_iterations: u32,
        cancel: CancellationToken,
    ) -> Result<CodingOutcome, PipelineError> {
        let llm = self.llm.as_ref().ok_or(PipelineError::LlmUnavailable)?;
        let repo_key = repo.key();
        let target = format!("issue-{}", issue_number);

        let mut iterations: Vec<CodingIteration> = Vec::new();
        let mut pushed_any = false;
        let mut previous_feedback: Option<String> = None;

        for index in 1..=max_iterations {
            if cancel.is_cancelled() {
                break;
            }

            let guard = PromptGuard::new();
            let prompt = self
                .build_prompt(repo, branch, evaluation, investigation, &guard, &iterations, previous_feedback.as_deref())
                .await;
            let input_hash = sha256_hex(prompt.as_bytes());

            let response = match llm
                .send_text(
                    vec![
                        ChatMessage::system(self.system_prompt(&guard)),
                        ChatMessage::user(prompt),
                    ],
                    cancel.clone(),
                )
                .await
            {
                Ok(text) => text,
                Err(PipelineError::LlmUnavailable) => return Err(PipelineError::LlmUnavailable),
                Err(err) => {
                    warn!(error = %err, iteration = index, "coder LLM call failed");
                    previous_feedback = Some(format!("LLM call failed: {}", err));
                    iterations.push(blocked_iteration(index, previous_feedback.clone()));
                    continue;
                }
            };

            let proposal = if !guard.response_ok(&response) {
                None
            } else {
                extract_json_object(&response)
                    .and_then(|json| serde_json::from_str::<CoderProposal>(&json).ok())
            };
            let Some(proposal) = proposal else {
                let log = "Response missing canary or parseable change set".to_string();
                self.audit
                    .append(
                        AuditDraft::new(AuditAction::PushCode, &repo_key, &target)
                            .with_hashes(input_hash.clone(), "")
                            .with_decision("BLOCKED")
                            .with_llm_calls(1)
                            .with_details(log.clone()),
                    )
                    .map_err(PipelineError::Other)?;
                previous_feedback = Some(log.clone());
                iterations.push(blocked_iteration(index, Some(log)));
                continue;
            };

            let output_hash = sha256_hex(
                proposal
                    .files
                    .iter()
                    .map(|f| format!("{}\n{}", f.path, f.content))
                    .collect::<Vec<_>>()
                    .join("\n")
                    .as_bytes(),
            );

            // The sole gate on outbound writes.
            let report = validate_output(&proposal.files);
            if !report.valid {
                let feedback = report.as_feedback();
                self.audit
                    .append(
                        AuditDraft::new(AuditAction::PushCode, &repo_key, &target)
                            .with_hashes(input_hash.clone(), output_hash.clone())
                            .with_decision("BLOCKED")
                            .with_llm_calls(1)
                            .with_details(feedback.clone()),
                    )
                    .map_err(PipelineError::Other)?;
                iterations.push(CodingIteration {
                    index,
                    files_changed: proposal.files.iter().map(|f| f.path.clone()).collect(),
                    commit_message: proposal.commit_message,
                    reasoning: proposal.reasoning,
                    self_review: proposal.self_review,
                    ci_result: CiResult::Failing,
                    ci_log: Some(feedback.clone()),
                });
                previous_feedback = Some(feedback);
                continue;
            }

            if !self.dry_run {
                for file in &proposal.files {
                    let message = format!("{} ({})", proposal.commit_message, file.path);
                    self.forge
                        .create_or_update_file(repo, branch, &file.path, &file.content, &message)
                        .await
                        .map_err(|e| PipelineError::TransientForge(e.to_string()))?;
                }
            }
            pushed_any |= !proposal.files.is_empty() && !self.dry_run;

            self.audit
                .append(
                    AuditDraft::new(AuditAction::PushCode, &repo_key, &target)
                        .with_hashes(input_hash, output_hash)
                        .with_decision(if self.dry_run { "dry_run" } else { "ok" })
                        .with_llm_calls(1)
                        .with_details(format!(
                            "iteration {}: {} file(s): {}",
                            index,
                            proposal.files.len(),
                            proposal
                                .files
                                .iter()
                                .map(|f| f.path.as_str())
                                .collect::<Vec<_>>()
                                .join(", ")
                        )),
                )
                .map_err(PipelineError::Other)?;

            let (ci_result, ci_log) = if self.dry_run {
                (CiResult::Passing, "dry run: CI wait skipped".to_string())
            } else {
                self.wait_for_ci(repo, branch, cancel.clone()).await
            };

            self.audit
                .append(
                    AuditDraft::new(AuditAction::CiCheck, &repo_key, &target)
                        .with_decision(match ci_result {
                            CiResult::Passing => "passing",
                            CiResult::Failing => "failing",
                            CiResult::Pending => "pending",
                        })
                        .with_details(truncate_chars(&ci_log, 1000, "[truncated]")),
                )
                .map_err(PipelineError::Other)?;

            iterations.push(CodingIteration {
                index,
                files_changed: proposal.files.iter().map(|f| f.path.clone()).collect(),
                commit_message: proposal.commit_message,
                reasoning: proposal.reasoning,
                self_review: proposal.self_review,
                ci_result,
                ci_log: Some(ci_log.clone()),
            });

            match ci_result {
                CiResult::Passing => {
                    info!(issue = issue_number, iteration = index, "CI passing");
                    return Ok(CodingOutcome {
                        iterations,
                        result: CiResult::Passing,
                        pushed_any,
                    });
                }
                CiResult::Failing => {
                    previous_feedback = Some(ci_log);
                }
                CiResult::Pending => break,
            }
        }

        Ok(CodingOutcome {
            iterations,
            result: CiResult::Failing,
            pushed_any,
        })
    }

    fn system_prompt(&self, guard: &PromptGuard) -> String {
        format!(
            "You write minimal, correct code changes for an autonomous agent. {} \
             Reply with one JSON object: {{\"files\": [{{\"path\": string, \
             \"content\": string}}], \"commit_message\": string, \"reasoning\": \
             string, \"self_review\": string}}. Never touch CI configuration, \
             lockfiles, or credential files.",
            guard.preamble()
        )
    }

    async fn build_prompt(
        &self,
        repo: &RepoDescriptor,
        branch: &str,
        evaluation: &IssueEvaluation,
        investigation: &Investigation,
        guard: &PromptGuard,
        iterations: &[CodingIteration],
        previous_feedback: Option<&str>,
    ) -> String {
        let mut prompt = format!(
            "Evaluation summary:\n{}\n\nSuggested changes:\n{}\n",
            guard.frame(&evaluation.reasoning),
            serde_json::to_string_pretty(&investigation.suggested_changes).unwrap_or_default()
        );

        let mut snippet_paths: Vec<&str> = investigation
            .suggested_changes
            .iter()
            .map(|c| c.path.as_str())
            .collect();
        snippet_paths.truncate(5);
        for path in snippet_paths {
            if let Ok(Some(content)) = self.forge.get_file_content(repo, branch, path).await {
                prompt.push_str(&format!(
                    "\nCurrent content of {}:\n{}\n",
                    path,
                    guard.frame(&truncate_chars(&content, 4000, "\n[truncated]"))
                ));
            }
        }

        if let Some(feedback) = previous_feedback {
            let changed: Vec<&str> = iterations
                .last()
                .map(|it| it.files_changed.iter().map(String::as_str).collect())
                .unwrap_or_default();
            prompt.push_str(&format!(
                "\nThe previous iteration changed [{}] and CI reported:\n{}\n\
                 Fix what the CI reported.\n",
                changed.join(", "),
                guard.frame(&truncate_chars(feedback, 4000, "\n[truncated]"))
            ));
        }

        prompt
    }

    /// Poll CI on `git_ref` until a verdict or the deadline.
    async fn wait_for_ci(
        &self,
        repo: &RepoDescriptor,
        git_ref: &str,
        cancel: CancellationToken,
    ) -> (CiResult, String) {
        let start = Instant::now();
        let mut seen_any = false;

        loop {
            if cancel.is_cancelled() {
                return (CiResult::Pending, "cancelled while waiting on CI".to_string());
            }

            let checks = self
                .forge
                .get_check_runs(repo, git_ref)
                .await
                .unwrap_or_default();
            let statuses = self
                .forge
                .get_combined_statuses(repo, git_ref)
                .await
                .unwrap_or_default();

            if !checks.is_empty() || !statuses.is_empty() {
                seen_any = true;
            }

            if !seen_any && start.elapsed() >= self.timing.no_ci_window {
                return (CiResult::Passing, "no CI configured".to_string());
            }

            if seen_any {
                match evaluate_ci(&checks, &statuses) {
                    Some(CiResult::Passing) => {
                        return (CiResult::Passing, "all checks completed green".to_string());
                    }
                    Some(CiResult::Failing) => {
                        let log = self.collect_failure_logs(repo, &checks, &statuses).await;
                        return (CiResult::Failing, log);
                    }
                    _ => {}
                }
            }

            if start.elapsed() >= self.timing.ci_deadline {
                return (
                    CiResult::Failing,
                    "CI did not complete within the deadline".to_string(),
                );
            }

            tokio::select! {
                _ = tokio::time::sleep(self.timing.ci_poll_interval) => {}
                _ = cancel.cancelled() => {}
            }
        }
    }

    /// Annotations from up to three failing checks, plus failing statuses.
    async fn collect_failure_logs(
        &self,
        repo: &RepoDescriptor,
        checks: &[CheckRunData],
        statuses: &[CommitStatusData],
    ) -> String {
        let mut log = String::new();
        let failing = checks.iter().filter(|c| is_failing_check(c)).take(3);
        for check in failing {
            log.push_str(&format!("Check '{}' failed:\n", check.name));
            match self.forge.get_check_run_annotations(repo, check.id).await {
                Ok(annotations) => {
                    for annotation in annotations {
                        log.push_str(&format!(
                            "  {} [{}]: {}\n",
                            annotation.path, annotation.level, annotation.message
                        ));
                    }
                }
                Err(err) => log.push_str(&format!("  (annotations unavailable: {})\n", err)),
            }
        }
        for status in statuses
            .iter()
            .filter(|s| s.state == "failure" || s.state == "error")
        {
            log.push_str(&format!("Status '{}': {}\n", status.context, status.state));
        }
        if log.is_empty() {
            log.push_str("CI failed without retrievable logs\n");
        }
        log
    }
}

fn blocked_iteration(index: u32, ci_log: Option<String>) -> CodingIteration {
    CodingIteration {
        index,
        files_changed: Vec::new(),
        commit_message: String::new(),
        reasoning: String::new(),
        self_review: String::new(),
        ci_result: CiResult::Failing,
        ci_log,
    }
}

fn is_failing_check(check: &CheckRunData) -> bool {
    check.status == "completed"
        && matches!(
            check.conclusion.as_deref(),
            Some("failure") | Some("error") | Some("timed_out") | Some("cancelled")
        )
}

/// Combined CI verdict; `None` while anything is still running.
pub(crate) fn evaluate_ci(checks: &[CheckRunData], statuses: &[CommitStatusData]) -> Option<CiResult> {
    if checks.iter().any(|c| c.status != "completed") {
        return None;
    }
    if statuses.iter().any(|s| s.state == "pending") {
        return None;
    }
    let check_failed = checks.iter().any(is_failing_check);
    let status_failed = statuses
        .iter()
        .any(|s| s.state == "failure" || s.state == "error");
    if check_failed || status_failed {
        Some(CiResult::Failing)
    } else {
        Some(CiResult::Passing)
    }
}
