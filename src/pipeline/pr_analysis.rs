//! Competing-PR analysis and synthesis planning.
//!
//! When someone else also fixed the issue, the agent scores every open
//! candidate on five axes, tags other Argus instances by their stamp id,
//! and, when a competitor clearly wins or brings enough unique work,
//! posts a synthesis plan instead of pretending the competition does not
//! exist. The plan is a comment; merging stays with humans.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::RepoDescriptor;
use crate::crypto::StampManager;
use crate::errors::PipelineError;
use crate::pipeline::coder;
use crate::ports::{ChatMessage, Forge, LlmClient, PullRequestData};
use crate::security::boundary::PromptGuard;
use crate::security::trust::TrustResolver;
use crate::util::{extract_json_object, truncate_chars};

/// Synthesis triggers when the best competitor leads by this much.
const SYNTHESIS_SCORE_GAP: f64 = 0.15;

/// ... or brings at least this many unique contributions.
const SYNTHESIS_UNIQUE_CONTRIBUTIONS: usize = 3;

/// Composite score weights: correctness, completeness, code quality,
/// test coverage, minimal invasiveness.
const WEIGHTS: [f64; 5] = [0.30, 0.20, 0.20, 0.15, 0.15];

/// Penalty applied while a candidate's CI is failing.
const CI_FAILING_PENALTY: f64 = 0.2;

/// Trust contribution to the composite.
const TRUST_WEIGHT: f64 = 0.05;

/// Per-axis scores straight from the scoring call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AxisScores {
    #[serde(default)]
    pub correctness: f64,
    #[serde(default)]
    pub completeness: f64,
    #[serde(default)]
    pub code_quality: f64,
    #[serde(default)]
    pub test_coverage: f64,
    #[serde(default)]
    pub minimal_invasiveness: f64,
    #[serde(default)]
    pub unique_contributions: Vec<String>,
}

impl AxisScores {
    fn neutral() -> Self {
        Self {
            correctness: 0.5,
            completeness: 0.5,
            code_quality: 0.5,
            test_coverage: 0.5,
            minimal_invasiveness: 0.5,
            unique_contributions: Vec::new(),
        }
    }

    fn clamped(mut self) -> Self {
        self.correctness = self.correctness.clamp(0.0, 1.0);
        self.completeness = self.completeness.clamp(0.0, 1.0);
        self.code_quality = self.code_quality.clamp(0.0, 1.0);
        self.test_coverage = self.test_coverage.clamp(0.0, 1.0);
        self.minimal_invasiveness = self.minimal_invasiveness.clamp(0.0, 1.0);
        self
    }
}

/// One scored candidate PR.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompetitorScore {
    pub pr_number: u64,
    pub author: String,
    pub scores: AxisScores,
    pub ci_failing: bool,
    pub trust: f64,
    pub composite: f64,
    /// True when the PR carries another Argus instance's stamp.
    pub other_argus: bool,
    pub instance_short_id: Option<String>,
    pub files: Vec<String>,
}

/// The strengths taken from one source PR in a synthesis plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceStrengths {
    pub pr_number: u64,
    pub strengths: Vec<String>,
}

/// An ordered plan for combining the best of the candidate PRs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisPlan {
    /// Source PRs, strongest first.
    pub sources: Vec<u64>,
    pub strengths: Vec<SourceStrengths>,
    pub projected_score: f64,
    /// Files touched by more than one source.
    pub conflicts: Vec<String>,
}

/// Everything the orchestrator needs after an analysis pass.
#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub our_score: f64,
    pub competitors: Vec<CompetitorScore>,
    pub should_synthesize: bool,
    pub plan: Option<SynthesisPlan>,
    pub llm_calls: u32,
}

/// Weighted composite with CI penalty and trust contribution.
pub fn composite_score(scores: &AxisScores, ci_failing: bool, trust: f64) -> f64 {
    let weighted = WEIGHTS[0] * scores.correctness
        + WEIGHTS[1] * scores.completeness
        + WEIGHTS[2] * scores.code_quality
        + WEIGHTS[3] * scores.test_coverage
        + WEIGHTS[4] * scores.minimal_invasiveness;
    let penalty = if ci_failing { CI_FAILING_PENALTY } else { 0.0 };
    weighted - penalty + TRUST_WEIGHT * trust
}

/// Competing-PR analyzer over the forge, LLM, and trust ports.
pub struct PrAnalyzer {
    forge: Arc<dyn Forge>,
    llm: Option<Arc<dyn LlmClient>>,
    trust: Arc<TrustResolver>,
}

impl PrAnalyzer {
    pub fn new(
        forge: Arc<dyn Forge>,
        llm: Option<Arc<dyn LlmClient>>,
        trust: Arc<TrustResolver>,
    ) -> Self {
        Self { forge, llm, trust }
    }

    /// Score our PR against every competing PR for the issue and decide
    /// whether a synthesis plan is warranted.
    pub async fn analyze(
        &self,
        repo: &RepoDescriptor,
        issue_number: u64,
        our_pr_number: u64,
        cancel: CancellationToken,
    ) -> Result<AnalysisOutcome, PipelineError> {
        let candidates = self
            .forge
            .list_prs_for_issue(repo, issue_number)
            .await
            .map_err(|e| PipelineError::TransientForge(e.to_string()))?;

        let mut llm_calls = 0u32;
        let mut ours: Option<CompetitorScore> = None;
        let mut competitors: Vec<CompetitorScore> = Vec::new();

        for pr in &candidates {
            let scored = self.score_pr(repo, pr, cancel.clone(), &mut llm_calls).await;
            if pr.number == our_pr_number {
                ours = Some(scored);
            } else {
                competitors.push(scored);
            }
        }

        let our_score = ours.as_ref().map(|s| s.composite).unwrap_or(0.0);
        let best = competitors
            .iter()
            .max_by(|a, b| a.composite.total_cmp(&b.composite));

        let should_synthesize = match best {
            Some(best) => {
                best.composite - our_score >= SYNTHESIS_SCORE_GAP
                    || competitors
                        .iter()
                        .map(|c| c.scores.unique_contributions.len())
                        .sum::<usize>()
                        >= SYNTHESIS_UNIQUE_CONTRIBUTIONS
            }
            None => false,
        };

        let plan = if should_synthesize {
            Some(build_plan(ours.as_ref(), &competitors))
        } else {
            None
        };

        Ok(AnalysisOutcome {
            our_score,
            competitors,
            should_synthesize,
            plan,
            llm_calls,
        })
    }

    async fn score_pr(
        &self,
        repo: &RepoDescriptor,
        pr: &PullRequestData,
        cancel: CancellationToken,
        llm_calls: &mut u32,
    ) -> CompetitorScore {
        let files = self
            .forge
            .list_pr_files(repo, pr.number)
            .await
            .unwrap_or_default();
        let checks = self
            .forge
            .get_check_runs(repo, &pr.head_branch)
            .await
            .unwrap_or_default();
        let statuses = self
            .forge
            .get_combined_statuses(repo, &pr.head_branch)
            .await
            .unwrap_or_default();
        let ci_failing = matches!(
            coder::evaluate_ci(&checks, &statuses),
            Some(crate::pipeline::state::CiResult::Failing)
        );

        let trust = match self.trust.resolve(repo, &pr.author).await {
            Ok(profile) => profile.effective_score,
            Err(_) => 0.0,
        };

        let instance_short_id = StampManager::peek_instance_short_id(&pr.body);
        let scores = self.llm_score(repo, pr, &files, cancel, llm_calls).await;
        let composite = composite_score(&scores, ci_failing, trust);

        CompetitorScore {
            pr_number: pr.number,
            author: pr.author.clone(),
            scores,
            ci_failing,
            trust,
            composite,
            other_argus: instance_short_id.is_some(),
            instance_short_id,
            files: files.iter().map(|f| f.path.clone()).collect(),
        }
    }

    async fn llm_score(
        &self,
        _repo: &RepoDescriptor,
        pr: &PullRequestData,
        files: &[crate::ports::PrFileData],
        cancel: CancellationToken,
        llm_calls: &mut u32,
    ) -> AxisScores {
        let Some(llm) = &self.llm else {
            return AxisScores::neutral();
        };

        let guard = PromptGuard::new();
        let system = format!(
            "You score pull requests for an autonomous agent. {} Reply with one \
             JSON object: {{\"correctness\": 0-1, \"completeness\": 0-1, \
             \"code_quality\": 0-1, \"test_coverage\": 0-1, \
             \"minimal_invasiveness\": 0-1, \"unique_contributions\": [strings]}}.",
            guard.preamble()
        );
        let diff_summary: String = files
            .iter()
            .map(|f| {
                format!(
                    "{} (+{} -{})\n{}",
                    f.path,
                    f.additions,
                    f.deletions,
                    f.patch.as_deref().unwrap_or("")
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let user = format!(
            "PR #{} by {}:\n\nDescription:\n{}\n\nChanged files:\n{}",
            pr.number,
            pr.author,
            guard.frame(&truncate_chars(&pr.body, 2000, "\n[truncated]")),
            guard.frame(&truncate_chars(&diff_summary, 6000, "\n[truncated]")),
        );

        let response = match llm
            .send_text(
                vec![ChatMessage::system(system), ChatMessage::user(user)],
                cancel,
            )
            .await
        {
            Ok(text) => {
                *llm_calls += 1;
                text
            }
            Err(err) => {
                warn!(pr = pr.number, error = %err, "PR scoring call failed, using neutral scores");
                return AxisScores::neutral();
            }
        };

        if !guard.response_ok(&response) {
            warn!(pr = pr.number, "PR scoring canary missing, using neutral scores");
            return AxisScores::neutral();
        }

        extract_json_object(&response)
            .and_then(|json| serde_json::from_str::<AxisScores>(&json).ok())
            .map(AxisScores::clamped)
            .unwrap_or_else(AxisScores::neutral)
    }
}

/// Order the sources by composite score, pick each one's top strengths,
/// and flag files touched by more than one source as conflicts.
fn build_plan(ours: Option<&CompetitorScore>, competitors: &[CompetitorScore]) -> SynthesisPlan {
    let mut all: Vec<&CompetitorScore> = competitors.iter().collect();
    if let Some(ours) = ours {
        all.push(ours);
    }
    all.sort_by(|a, b| b.composite.total_cmp(&a.composite));

    let sources: Vec<u64> = all.iter().map(|s| s.pr_number).collect();
    let strengths: Vec<SourceStrengths> = all
        .iter()
        .map(|s| SourceStrengths {
            pr_number: s.pr_number,
            strengths: s
                .scores
                .unique_contributions
                .iter()
                .take(3)
                .cloned()
                .collect(),
        })
        .collect();

    // The synthesis should be at least as good as the best source.
    let projected_score = all
        .first()
        .map(|s| (s.composite + 0.05).min(1.0))
        .unwrap_or(0.0);

    let mut touched: HashMap<&str, usize> = HashMap::new();
    for source in &all {
        for file in &source.files {
            *touched.entry(file.as_str()).or_default() += 1;
        }
    }
    let mut conflicts: Vec<String> = touched
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(path, _)| path.to_string())
        .collect();
    conflicts.sort();

    SynthesisPlan {
        sources,
        strengths,
        projected_score,
        conflicts,
    }
}

/// Render a synthesis plan as the markdown comment body.
pub fn render_plan(plan: &SynthesisPlan, issue_number: u64) -> String {
    let mut out = format!(
        "## Synthesis plan for issue #{}\n\nOrdered sources: {}\n\n",
        issue_number,
        plan.sources
            .iter()
            .map(|n| format!("#{}", n))
            .collect::<Vec<_>>()
            .join(", ")
    );
    for source in &plan.strengths {
        if !source.strengths.is_empty() {
            out.push_str(&format!(
                "- #{}: {}\n",
                source.pr_number,
                source.strengths.join("; ")
            ));
        }
    }
    out.push_str(&format!(
        "\nProjected score: {:.2}\n",
        plan.projected_score
    ));
    if plan.conflicts.is_empty() {
        out.push_str("\nNo overlapping files detected.\n");
    } else {
        out.push_str(&format!(
            "\nConflicts to resolve by hand: {}\n",
            plan.conflicts.join(", ")
        ));
    }
    out.push_str("\nNo merge will happen automatically; this plan is advisory.\n");
    out
}
