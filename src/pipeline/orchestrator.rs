//! The pipeline orchestrator.
//!
//! One orchestrator owns the whole session: the tracked-issue map, the
//! per-repo poll schedule, the PR-comment sweep, and the watchdog. Each
//! repo runs on its own tokio task; per-issue state transitions are
//! serialized through the session map's mutex, and nothing holds that
//! lock across an await.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{AgentConfig, RepoDescriptor};
use crate::crypto::{AuditAction, AuditDraft, AuditLog, KeyManager, NonceRegistry, StampManager};
use crate::errors::PipelineError;
use crate::notify::{Notifier, NotifierEvent};
use crate::pipeline::activity::ActivityLog;
use crate::pipeline::chain::{ChainDecision, ChainDetector, ChainGraph, comment_phrase};
use crate::pipeline::coder::{Coder, CoderTiming};
use crate::pipeline::comments::{CommentContext, CommentHandler};
use crate::pipeline::edit_detector::{EditAction, check_edit};
use crate::pipeline::evaluator::{Evaluator, LABEL_LOW_CONFIDENCE_OVERRIDE};
use crate::pipeline::investigator::Investigator;
use crate::pipeline::pr_analysis::{PrAnalyzer, render_plan};
use crate::pipeline::state::{CiResult, IssueState, TrackedIssue};
use crate::ports::{Forge, IssueData, LlmClient};
use crate::security::classifier::ThreatClassifier;
use crate::security::trust::TrustResolver;
use crate::store::Store;
use crate::util::sha256_hex;

/// First poll of a repo looks back this far.
const BOOTSTRAP_WINDOW_HOURS: i64 = 24;

/// Scheduling knobs; tests shrink these to milliseconds.
#[derive(Debug, Clone)]
pub struct Timing {
    pub coder: CoderTiming,
    /// Issues stuck in a non-terminal state longer than this get aborted.
    pub watchdog_deadline: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            coder: CoderTiming::default(),
            watchdog_deadline: Duration::from_secs(45 * 60),
        }
    }
}

/// Composition root for one agent session.
pub struct Orchestrator {
    config: AgentConfig,
    store: Arc<dyn Store>,
    forge: Arc<dyn Forge>,
    notifier: Arc<dyn Notifier>,
    stamps: Arc<StampManager>,
    nonces: Arc<NonceRegistry>,
    audit: Arc<AuditLog>,
    activity: Arc<ActivityLog>,
    evaluator: Evaluator,
    investigator: Investigator,
    coder: Coder,
    analyzer: PrAnalyzer,
    comment_handler: CommentHandler,
    chain: ChainDetector,
    issues: tokio::sync::Mutex<HashMap<String, TrackedIssue>>,
    last_poll: tokio::sync::Mutex<HashMap<String, DateTime<Utc>>>,
    last_sweep: tokio::sync::Mutex<HashMap<String, DateTime<Utc>>>,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Wire up a session from the ports. Fails when no identity key can
    /// be established; the agent never runs unsigned.
    pub fn new(
        config: AgentConfig,
        store: Arc<dyn Store>,
        forge: Arc<dyn Forge>,
        llm: Option<Arc<dyn LlmClient>>,
        notifier: Arc<dyn Notifier>,
        timing: Timing,
    ) -> Result<Self> {
        let keys = Arc::new(KeyManager::init(store.clone())?);
        let nonces = Arc::new(NonceRegistry::load(store.as_ref())?);
        let stamps = Arc::new(StampManager::new(keys.clone(), nonces.clone()));
        let audit = Arc::new(AuditLog::open(store.clone(), keys)?);
        let activity = Arc::new(ActivityLog::new());
        let trust = Arc::new(TrustResolver::new(forge.clone()));
        let classifier = Arc::new(ThreatClassifier::new(llm.clone()));

        let evaluator = Evaluator::new(forge.clone(), llm.clone());
        let investigator = Investigator::new(forge.clone(), llm.clone());
        let coder = Coder::new(forge.clone(), llm.clone(), audit.clone(), config.dry_run)
            .with_timing(timing.coder.clone());
        let analyzer = PrAnalyzer::new(forge.clone(), llm.clone(), trust.clone());
        let comment_handler = CommentHandler::new(
            forge.clone(),
            classifier,
            trust,
            stamps.clone(),
            audit.clone(),
            config.dry_run,
        );

        Ok(Self {
            config,
            store,
            forge,
            notifier,
            stamps,
            nonces,
            audit,
            activity,
            evaluator,
            investigator,
            coder,
            analyzer,
            comment_handler,
            chain: ChainDetector::new(),
            issues: tokio::sync::Mutex::new(HashMap::new()),
            last_poll: tokio::sync::Mutex::new(HashMap::new()),
            last_sweep: tokio::sync::Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn activity(&self) -> Arc<ActivityLog> {
        self.activity.clone()
    }

    pub fn audit(&self) -> Arc<AuditLog> {
        self.audit.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Snapshot of every tracked issue.
    pub async fn issues(&self) -> Vec<TrackedIssue> {
        let issues = self.issues.lock().await;
        let mut all: Vec<TrackedIssue> = issues.values().cloned().collect();
        all.sort_by(|a, b| a.key().cmp(&b.key()));
        all
    }

    /// Poll one repo for updated issues. Returns how many were enqueued.
    pub async fn poll(&self, repo: &RepoDescriptor) -> Result<usize, PipelineError> {
        let repo_key = repo.key();
        let since = {
            let mut last_poll = self.last_poll.lock().await;
            let since = last_poll
                .get(&repo_key)
                .copied()
                .unwrap_or_else(|| Utc::now() - chrono::Duration::hours(BOOTSTRAP_WINDOW_HOURS));
            last_poll.insert(repo_key.clone(), Utc::now());
            since
        };

        let updated = self
            .forge
            .list_issues_updated_since(repo, since)
            .await
            .map_err(|e| PipelineError::TransientForge(e.to_string()))?;

        let mut enqueued = 0usize;
        for issue in &updated {
            if self.enqueue_issue(repo, issue).await? {
                enqueued += 1;
            }
        }

        self.audit
            .append(
                AuditDraft::new(AuditAction::PollRepos, &repo_key, "poll")
                    .with_details(format!("{} updated, {} enqueued", updated.len(), enqueued)),
            )
            .map_err(PipelineError::Other)?;
        if enqueued > 0 {
            self.activity
                .record("📥", format!("{}: enqueued {} issue(s)", repo_key, enqueued));
        }
        Ok(enqueued)
    }

    /// Track one polled issue unless it is already tracked or we had the
    /// last word on it. Returns true when a new pending issue appeared.
    async fn enqueue_issue(
        &self,
        repo: &RepoDescriptor,
        issue: &IssueData,
    ) -> Result<bool, PipelineError> {
        let repo_key = repo.key();
        let key = format!("{}#{}", repo_key, issue.number);

        let already_tracked = {
            let issues = self.issues.lock().await;
            match issues.get(&key) {
                Some(tracked) if tracked.state != IssueState::Skipped => return Ok(false),
                Some(_) => true,
                None => false,
            }
        };

        // Last-word rule: if the newest comment carries our valid stamp,
        // we already answered this issue.
        let comments = self
            .forge
            .list_issue_comments(repo, issue.number)
            .await
            .map_err(|e| PipelineError::TransientForge(e.to_string()))?;
        let last_is_ours = match comments.last() {
            Some(last) => self
                .stamps
                .is_ours(&last.body, &repo_key, last.id)
                .map_err(PipelineError::Other)?,
            None => false,
        };

        let mut issues = self.issues.lock().await;
        if last_is_ours {
            if !already_tracked {
                let mut tracked =
                    TrackedIssue::new(&repo_key, issue, self.config.max_coding_iterations);
                tracked.state = IssueState::Skipped;
                issues.insert(key, tracked);
            }
            return Ok(false);
        }

        // A previously skipped issue with fresh external activity re-enters.
        let tracked = TrackedIssue::new(&repo_key, issue, self.config.max_coding_iterations);
        issues.insert(key, tracked);
        Ok(true)
    }

    /// Drain one pending issue if the concurrency budget allows.
    pub async fn process_next(&self, repo: &RepoDescriptor) -> Result<Option<u64>, PipelineError> {
        let repo_key = repo.key();
        let next = {
            let issues = self.issues.lock().await;
            let active = issues.values().filter(|i| i.state.is_active()).count();
            if active >= self.config.max_concurrent_issues {
                None
            } else {
                issues
                    .values()
                    .filter(|i| i.repo_key == repo_key && i.state == IssueState::Pending)
                    .map(|i| i.number)
                    .min()
            }
        };

        let Some(number) = next else {
            return Ok(None);
        };
        self.process_issue(repo, number).await?;
        Ok(Some(number))
    }

    /// Execute the full state machine for one issue. Errors mark the
    /// issue stuck; they never corrupt the session map.
    pub async fn process_issue(
        &self,
        repo: &RepoDescriptor,
        number: u64,
    ) -> Result<(), PipelineError> {
        match self.drive_issue(repo, number).await {
            Ok(()) => Ok(()),
            Err(err) => {
                error!(repo = %repo.key(), issue = number, error = %err, "pipeline failed");
                let key = format!("{}#{}", repo.key(), number);
                {
                    let mut issues = self.issues.lock().await;
                    if let Some(tracked) = issues.get_mut(&key) {
                        if !tracked.state.is_terminal() {
                            tracked.mark_stuck(err.to_string());
                        }
                    }
                }
                self.activity
                    .record("💥", format!("{}#{}: {}", repo.key(), number, err));
                let _ = self
                    .notifier
                    .notify(NotifierEvent::PipelineError {
                        repo: repo.key(),
                        issue: number,
                        error: err.to_string(),
                    })
                    .await;
                Ok(())
            }
        }
    }

    async fn drive_issue(&self, repo: &RepoDescriptor, number: u64) -> Result<(), PipelineError> {
        let repo_key = repo.key();
        let key = format!("{}#{}", repo_key, number);
        let target = format!("issue-{}", number);

        // ── Evaluate ────────────────────────────────────────────────────
        self.set_state(&key, IssueState::Evaluating).await?;
        self.activity.record("🔍", format!("{}: evaluating", key));

        let issue = self
            .forge
            .get_issue(repo, number)
            .await
            .map_err(|e| PipelineError::TransientForge(e.to_string()))?;
        let body_hash = sha256_hex(issue.body.as_bytes());

        let outcome = self
            .evaluator
            .evaluate(repo, &issue, self.cancel.clone())
            .await?;
        let mut evaluation = outcome.evaluation;
        let mut labels = outcome.labels;

        // Low-confidence rejection override: missing a valid issue is
        // worse than investigating a marginal one.
        if !evaluation.merit && evaluation.confidence < 0.7 {
            evaluation.merit = true;
            evaluation.reasoning = format!(
                "[override: low-confidence rejection flipped to merit] {}",
                evaluation.reasoning
            );
            labels.push(LABEL_LOW_CONFIDENCE_OVERRIDE.to_string());
        }

        self.audit
            .append(
                AuditDraft::new(AuditAction::EvaluateIssue, &repo_key, &target)
                    .with_hashes(body_hash.clone(), sha256_hex(evaluation.reasoning.as_bytes()))
                    .with_decision(if evaluation.merit { "merit" } else { "no_merit" })
                    .with_llm_calls(outcome.llm_calls)
                    .with_details(format!(
                        "confidence={:.2} severity={:?} category={:?}",
                        evaluation.confidence, evaluation.severity, evaluation.category
                    )),
            )
            .map_err(PipelineError::Other)?;
        let _ = self
            .notifier
            .notify(NotifierEvent::IssueEvaluated {
                repo: repo_key.clone(),
                issue: number,
                merit: evaluation.merit,
                confidence: evaluation.confidence,
            })
            .await;

        if !self.config.dry_run {
            for label in &labels {
                if let Err(err) = self.forge.add_label(repo, number, label).await {
                    warn!(label = %label, error = %err, "label application failed");
                }
            }
        }

        let merit = evaluation.merit;
        {
            let mut issues = self.issues.lock().await;
            if let Some(tracked) = issues.get_mut(&key) {
                tracked.body_hash = body_hash.clone();
                tracked.evaluation = Some(evaluation.clone());
            }
        }

        if !merit {
            self.set_state(&key, IssueState::Rejected).await?;
            self.activity.record("🚫", format!("{}: rejected", key));
            return Ok(());
        }
        self.set_state(&key, IssueState::Approved).await?;

        // ── Branch ──────────────────────────────────────────────────────
        self.set_state(&key, IssueState::Branching).await?;
        let branch = format!("{}issue-{}", self.config.branch_prefix, number);
        if !self.config.dry_run {
            let default_branch = self
                .forge
                .get_default_branch(repo)
                .await
                .map_err(|e| PipelineError::TransientForge(e.to_string()))?;
            self.forge
                .create_branch_from(repo, &default_branch, &branch)
                .await
                .map_err(|e| PipelineError::TransientForge(e.to_string()))?;
        }
        self.audit
            .append(
                AuditDraft::new(AuditAction::CreateBranch, &repo_key, &target)
                    .with_decision(if self.config.dry_run { "dry_run" } else { "ok" })
                    .with_details(branch.clone()),
            )
            .map_err(PipelineError::Other)?;
        {
            let mut issues = self.issues.lock().await;
            if let Some(tracked) = issues.get_mut(&key) {
                tracked.branch = Some(branch.clone());
            }
        }
        self.activity.record("🌿", format!("{}: branch {}", key, branch));

        // ── Edit check before any write ─────────────────────────────────
        self.set_state(&key, IssueState::Coding).await?;
        if self.edit_check(repo, &key, number, &body_hash).await? {
            return Ok(());
        }

        // ── Investigate and code ────────────────────────────────────────
        let investigation = self
            .investigator
            .investigate(repo, &evaluation, self.cancel.clone())
            .await;

        let coding = self
            .coder
            .run(
                repo,
                number,
                &branch,
                &evaluation,
                &investigation,
                self.config.max_coding_iterations,
                self.cancel.clone(),
            )
            .await?;
        {
            let mut issues = self.issues.lock().await;
            if let Some(tracked) = issues.get_mut(&key) {
                tracked.iteration = coding.iterations.len() as u32;
                tracked.iterations = coding.iterations.clone();
            }
        }

        if coding.result != CiResult::Passing {
            return Err(PipelineError::BudgetExhausted {
                iterations: coding.iterations.len() as u32,
            });
        }
        self.set_state(&key, IssueState::WaitingCi).await?;
        self.set_state(&key, IssueState::PrOpen).await?;
        self.activity.record("✅", format!("{}: CI passing", key));

        // ── Open the PR and acknowledge on the issue ────────────────────
        let pr_body_core = format!(
            "Closes #{number}.\n\n## What happened\n\n{reasoning}\n\n\
             ## Iterations\n\n{iterations}\n\nEvery artifact in this PR was \
             produced automatically; a human decides whether it merges.",
            number = number,
            reasoning = evaluation.reasoning,
            iterations = coding
                .iterations
                .iter()
                .map(|it| {
                    format!(
                        "{}. `{}`: {} ({} file(s), CI {:?})",
                        it.index,
                        it.commit_message,
                        it.self_review,
                        it.files_changed.len(),
                        it.ci_result
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        );
        let (pr_body, _) = self.stamps.stamp(&pr_body_core).map_err(PipelineError::Other)?;

        let (pr_number, pr_url) = if self.config.dry_run {
            (0, String::from("dry-run://pr"))
        } else {
            let default_branch = self
                .forge
                .get_default_branch(repo)
                .await
                .map_err(|e| PipelineError::TransientForge(e.to_string()))?;
            let pr = self
                .forge
                .create_pr(repo, &issue.title, &pr_body, &branch, &default_branch)
                .await
                .map_err(|e| PipelineError::TransientForge(e.to_string()))?;
            (pr.number, pr.url)
        };

        self.audit
            .append(
                AuditDraft::new(AuditAction::CreatePr, &repo_key, &target)
                    .with_hashes(body_hash.clone(), sha256_hex(pr_body.as_bytes()))
                    .with_decision(if self.config.dry_run { "dry_run" } else { "ok" })
                    .with_details(format!("pr #{} from {}", pr_number, branch)),
            )
            .map_err(PipelineError::Other)?;
        {
            let mut issues = self.issues.lock().await;
            if let Some(tracked) = issues.get_mut(&key) {
                tracked.pr_number = Some(pr_number);
                tracked.pr_url = Some(pr_url.clone());
            }
        }
        self.activity
            .record("🎉", format!("{}: opened PR #{}", key, pr_number));
        let _ = self
            .notifier
            .notify(NotifierEvent::PrCreated {
                repo: repo_key.clone(),
                issue: number,
                pr: pr_number,
                url: pr_url,
            })
            .await;

        if !self.config.dry_run {
            let (ack, _) = self
                .stamps
                .stamp(&format!(
                    "Opened PR #{} for this issue. CI is passing; review when ready.",
                    pr_number
                ))
                .map_err(PipelineError::Other)?;
            self.forge
                .add_issue_comment(repo, number, &ack)
                .await
                .map_err(|e| PipelineError::TransientForge(e.to_string()))?;
        }

        // ── Late edit check ─────────────────────────────────────────────
        if self.edit_check(repo, &key, number, &body_hash).await? {
            return Ok(());
        }

        // ── Competing PRs ───────────────────────────────────────────────
        self.set_state(&key, IssueState::AnalyzingCompeting).await?;
        let analysis = self
            .analyzer
            .analyze(repo, number, pr_number, self.cancel.clone())
            .await?;

        let best = analysis
            .competitors
            .iter()
            .map(|c| c.composite)
            .fold(0.0f64, f64::max);
        self.audit
            .append(
                AuditDraft::new(AuditAction::AnalyzeCompeting, &repo_key, &target)
                    .with_decision(if analysis.should_synthesize {
                        "synthesize"
                    } else {
                        "keep"
                    })
                    .with_llm_calls(analysis.llm_calls)
                    .with_details(format!(
                        "ours={:.2} best_competitor={:.2} competitors={}",
                        analysis.our_score,
                        best,
                        analysis.competitors.len()
                    )),
            )
            .map_err(PipelineError::Other)?;
        let _ = self
            .notifier
            .notify(NotifierEvent::CompetingAnalyzed {
                repo: repo_key.clone(),
                issue: number,
                our_score: analysis.our_score,
                best_competitor: best,
            })
            .await;
        {
            let mut issues = self.issues.lock().await;
            if let Some(tracked) = issues.get_mut(&key) {
                tracked.competing = analysis.competitors.clone();
            }
        }

        if let Some(plan) = &analysis.plan {
            self.set_state(&key, IssueState::Synthesizing).await?;
            let (comment, _) = self
                .stamps
                .stamp(&render_plan(plan, number))
                .map_err(PipelineError::Other)?;
            if !self.config.dry_run && pr_number != 0 {
                self.forge
                    .add_pr_comment(repo, pr_number, &comment)
                    .await
                    .map_err(|e| PipelineError::TransientForge(e.to_string()))?;
            }
            self.audit
                .append(
                    AuditDraft::new(AuditAction::PlanSynthesis, &repo_key, &target)
                        .with_details(format!("sources={:?}", plan.sources)),
                )
                .map_err(PipelineError::Other)?;
            self.activity
                .record("🧩", format!("{}: posted synthesis plan", key));
        }

        self.set_state(&key, IssueState::Done).await?;
        self.activity.record("🏁", format!("{}: done", key));
        Ok(())
    }

    /// Recompute the body hash; halt or flag per the edit detector.
    /// Returns true when processing must stop here.
    async fn edit_check(
        &self,
        repo: &RepoDescriptor,
        key: &str,
        number: u64,
        recorded_hash: &str,
    ) -> Result<bool, PipelineError> {
        let current = self
            .forge
            .get_issue(repo, number)
            .await
            .map_err(|e| PipelineError::TransientForge(e.to_string()))?;
        let state = {
            let issues = self.issues.lock().await;
            issues
                .get(key)
                .map(|t| t.state)
                .unwrap_or(IssueState::Pending)
        };
        let check = check_edit(recorded_hash, &current.body, state);
        if !check.detected {
            return Ok(false);
        }

        self.audit
            .append(
                AuditDraft::new(AuditAction::DetectEdit, repo.key(), format!("issue-{}", number))
                    .with_hashes(check.recorded_hash.clone(), check.current_hash.clone())
                    .with_decision(match check.action {
                        Some(EditAction::Halt) => "halt",
                        _ => "reevaluate",
                    })
                    .with_details("issue body changed after evaluation"),
            )
            .map_err(PipelineError::Other)?;

        match check.action {
            Some(EditAction::Halt) => {
                let mut issues = self.issues.lock().await;
                if let Some(tracked) = issues.get_mut(key) {
                    tracked.last_error = Some("body edited during coding".to_string());
                    tracked.state = IssueState::Flagged;
                }
                self.activity
                    .record("🚩", format!("{}: body edited mid-write, flagged", key));
                Ok(true)
            }
            _ => {
                // Post-PR edit: back through evaluation on the next cycle.
                let mut issues = self.issues.lock().await;
                if let Some(tracked) = issues.get_mut(key) {
                    if tracked.state == IssueState::PrOpen {
                        let _ = tracked.transition(IssueState::ReEvaluate);
                    }
                }
                self.activity
                    .record("🔁", format!("{}: body edited, re-evaluating", key));
                Ok(true)
            }
        }
    }

    /// Sweep open PRs and acknowledge new external conversation under the
    /// chain detector's veto. Returns the number of acks posted.
    pub async fn poll_pr_comments(&self, repo: &RepoDescriptor) -> Result<usize, PipelineError> {
        let repo_key = repo.key();
        let since = {
            let mut sweeps = self.last_sweep.lock().await;
            let since = sweeps
                .get(&repo_key)
                .copied()
                .unwrap_or_else(|| Utc::now() - chrono::Duration::hours(BOOTSTRAP_WINDOW_HOURS));
            sweeps.insert(repo_key.clone(), Utc::now());
            since
        };

        let open_prs = self
            .forge
            .list_open_prs(repo)
            .await
            .map_err(|e| PipelineError::TransientForge(e.to_string()))?;
        let graph = ChainGraph::build(&open_prs);
        let mut acks = 0usize;

        for pr in &open_prs {
            // Only our own PRs get acknowledgments; foreign PRs are the
            // analyzer's business, not the sweep's.
            if !self.stamps.is_our_instance_text(&pr.body) {
                continue;
            }
            let comments = self
                .forge
                .list_pr_conversation_comments(repo, pr.number)
                .await
                .map_err(|e| PipelineError::TransientForge(e.to_string()))?;

            let mut fresh_external = Vec::new();
            for comment in &comments {
                if comment.created_at <= since {
                    continue;
                }
                if self
                    .stamps
                    .is_ours(&comment.body, &repo_key, comment.id)
                    .map_err(PipelineError::Other)?
                {
                    continue;
                }
                fresh_external.push(comment.clone());
            }
            if fresh_external.is_empty() {
                continue;
            }

            // Moderation first; hostile comments may disappear before an
            // acknowledgment would reference them.
            for comment in &fresh_external {
                let outcome = self
                    .comment_handler
                    .handle_comment(
                        repo,
                        CommentContext::PrConversation(pr.number),
                        comment,
                        self.cancel.clone(),
                    )
                    .await?;
                if !outcome.assessment.is_clean() {
                    let _ = self
                        .notifier
                        .notify(NotifierEvent::ThreatDetected {
                            repo: repo_key.clone(),
                            target: format!("pr-{}", pr.number),
                            classification: outcome.assessment.classification.as_str().to_string(),
                            confidence: outcome.assessment.confidence,
                        })
                        .await;
                }
            }

            let chain_phrases = self.chain_phrases(repo, &graph, pr.number).await;
            match self.chain.assess(&graph, pr, &chain_phrases) {
                ChainDecision::Engage | ChainDecision::EngageWithWarning => {
                    if !self.config.dry_run {
                        let (ack, _) = self
                            .stamps
                            .stamp(&format!(
                                "Acknowledged {} new comment(s); reviewing the feedback.",
                                fresh_external.len()
                            ))
                            .map_err(PipelineError::Other)?;
                        self.forge
                            .add_pr_comment(repo, pr.number, &ack)
                            .await
                            .map_err(|e| PipelineError::TransientForge(e.to_string()))?;
                    }
                    self.audit
                        .append(
                            AuditDraft::new(
                                AuditAction::AcknowledgeReview,
                                &repo_key,
                                format!("pr-{}", pr.number),
                            )
                            .with_details(format!("{} comment(s)", fresh_external.len())),
                        )
                        .map_err(PipelineError::Other)?;
                    acks += 1;
                }
                ChainDecision::Disengage { trace } => {
                    let trace_text = trace
                        .iter()
                        .map(|n| format!("#{}", n))
                        .collect::<Vec<_>>()
                        .join(" → ");
                    if !self.config.dry_run {
                        let (comment, _) = self
                            .stamps
                            .stamp(&format!(
                                "Loop detected along the PR chain {}. Disengaging from \
                                 this chain; a human should take over.",
                                trace_text
                            ))
                            .map_err(PipelineError::Other)?;
                        self.forge
                            .add_pr_comment(repo, pr.number, &comment)
                            .await
                            .map_err(|e| PipelineError::TransientForge(e.to_string()))?;
                    }
                    self.audit
                        .append(
                            AuditDraft::new(
                                AuditAction::DisengageChain,
                                &repo_key,
                                format!("pr-{}", pr.number),
                            )
                            .with_decision("disengaged")
                            .with_details(trace_text.clone()),
                        )
                        .map_err(PipelineError::Other)?;
                    self.activity
                        .record("🔄", format!("{}: loop detected ({})", repo_key, trace_text));
                }
                ChainDecision::AlreadyDisengaged
                | ChainDecision::RateLimited
                | ChainDecision::SkipWip => {}
            }
        }

        Ok(acks)
    }

    /// Phrase sets for a PR's chain, root to leaf, for the repetition
    /// heuristic.
    async fn chain_phrases(
        &self,
        repo: &RepoDescriptor,
        graph: &ChainGraph,
        pr_number: u64,
    ) -> Vec<std::collections::HashSet<String>> {
        let mut out = Vec::new();
        for number in graph.chain_trace(pr_number) {
            let mut phrases = std::collections::HashSet::new();
            if let Ok(comments) = self.forge.list_pr_review_comments(repo, number).await {
                for comment in comments {
                    phrases.insert(comment_phrase(&comment.body));
                }
            }
            out.push(phrases);
        }
        out
    }

    /// Abort issues stuck in a non-terminal state past the deadline.
    pub async fn run_watchdog_once(&self, deadline: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(deadline).unwrap_or(chrono::Duration::minutes(45));
        let mut aborted = 0usize;
        let mut issues = self.issues.lock().await;
        for tracked in issues.values_mut() {
            if tracked.state.is_active() && tracked.updated_at < cutoff {
                tracked.mark_stuck("watchdog: exceeded processing deadline");
                aborted += 1;
            }
        }
        aborted
    }

    /// Run the agent: one poll loop per configured repo plus the
    /// watchdog, until the cancellation token fires.
    pub async fn run(self: Arc<Self>, timing: Timing) -> Result<()> {
        let mut handles = Vec::new();
        for repo in self.config.repos.clone() {
            let orchestrator = self.clone();
            let interval =
                Duration::from_secs(self.config.poll_interval_for(&repo) * 60);
            handles.push(tokio::spawn(async move {
                loop {
                    if orchestrator.cancel.is_cancelled() {
                        break;
                    }
                    if let Err(err) = orchestrator.tick(&repo).await {
                        warn!(repo = %repo.key(), error = %err, "poll tick failed");
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = orchestrator.cancel.cancelled() => break,
                    }
                }
            }));
        }

        let watchdog = self.clone();
        let deadline = timing.watchdog_deadline;
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(deadline / 4) => {}
                    _ = watchdog.cancel.cancelled() => break,
                }
                let aborted = watchdog.run_watchdog_once(deadline).await;
                if aborted > 0 {
                    warn!(aborted, "watchdog aborted stalled issues");
                }
            }
        }));

        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }

    /// One scheduler tick for a repo: poll, drain one issue, sweep PRs,
    /// then persist and prune the nonce registry.
    pub async fn tick(&self, repo: &RepoDescriptor) -> Result<(), PipelineError> {
        self.poll(repo).await?;
        self.process_next(repo).await?;
        self.poll_pr_comments(repo).await?;
        if let Err(err) = self.nonces.prune().and_then(|_| self.nonces.save(self.store.as_ref())) {
            warn!(error = %err, "nonce registry persistence failed");
        }
        Ok(())
    }

    /// Emergency stop: halt polling, cancel in-flight LLM calls, audit.
    /// Side effects already on the forge stay there.
    pub async fn emergency_stop(&self) -> Result<()> {
        self.cancel.cancel();
        self.nonces.save(self.store.as_ref())?;
        self.audit.append(
            AuditDraft::new(AuditAction::EmergencyStop, "all", "session")
                .with_details("operator emergency stop"),
        )?;
        self.activity.record("🛑", "Emergency stop");
        info!("emergency stop requested");
        Ok(())
    }

    async fn set_state(&self, key: &str, to: IssueState) -> Result<(), PipelineError> {
        let mut issues = self.issues.lock().await;
        match issues.get_mut(key) {
            Some(tracked) => tracked.transition(to),
            None => Err(PipelineError::Other(anyhow::anyhow!(
                "issue {} vanished from the session map",
                key
            ))),
        }
    }
}
