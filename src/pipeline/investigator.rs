//! Deep-dive investigation after a positive evaluation.
//!
//! Pulls the evaluator's affected files plus targeted code searches, then
//! asks the LLM for a concrete change plan in one canary-guarded call.
//! With no LLM the fallback is honest and cheap: the affected files come
//! back as low-confidence `modify` suggestions.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::RepoDescriptor;
use crate::pipeline::state::IssueEvaluation;
use crate::ports::{ChatMessage, Forge, LlmClient};
use crate::security::boundary::PromptGuard;
use crate::util::{extract_json_object, truncate_chars};

/// Files fetched per investigation.
const MAX_FILES: usize = 10;

/// Code searches run per investigation.
const MAX_SEARCHES: usize = 5;

/// Per-file character budget.
const FILE_TRUNCATE_CHARS: usize = 5000;

/// Confidence reported by the heuristic (no-LLM) fallback.
const FALLBACK_CONFIDENCE: f64 = 0.3;

static IDENTIFIER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Z][A-Za-z0-9_]{2,}\b").expect("valid regex"));

/// What kind of change a suggestion proposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    #[default]
    Modify,
    Create,
    Delete,
}

/// One suggested change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestedChange {
    pub path: String,
    #[serde(default)]
    pub kind: ChangeKind,
    #[serde(default)]
    pub description: String,
}

/// Structured investigation result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Investigation {
    #[serde(default)]
    pub suggested_changes: Vec<SuggestedChange>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub notes: String,
    #[serde(skip)]
    pub llm_calls: u32,
}

/// Investigator over the forge and LLM ports.
pub struct Investigator {
    forge: Arc<dyn Forge>,
    llm: Option<Arc<dyn LlmClient>>,
}

impl Investigator {
    pub fn new(forge: Arc<dyn Forge>, llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self { forge, llm }
    }

    /// Investigate an approved issue. Never fails; degraded inputs
    /// degrade the result instead.
    pub async fn investigate(
        &self,
        repo: &RepoDescriptor,
        evaluation: &IssueEvaluation,
        cancel: CancellationToken,
    ) -> Investigation {
        let context = self.gather_context(repo, evaluation).await;

        let Some(llm) = &self.llm else {
            return heuristic_fallback(evaluation);
        };

        let guard = PromptGuard::new();
        let system = format!(
            "You plan code changes for an autonomous agent. {} Reply with one \
             JSON object: {{\"suggested_changes\": [{{\"path\": string, \
             \"kind\": \"modify\"|\"create\"|\"delete\", \"description\": \
             string}}], \"dependencies\": [strings], \"confidence\": 0.0-1.0, \
             \"notes\": string}}.",
            guard.preamble()
        );
        let user = format!(
            "Proposed approach:\n{}\n\nEvaluator reasoning:\n{}\n\nGathered context:\n{}",
            guard.frame(&evaluation.proposed_approach),
            guard.frame(&evaluation.reasoning),
            context
        );

        let response = match llm
            .send_text(
                vec![ChatMessage::system(system), ChatMessage::user(user)],
                cancel,
            )
            .await
        {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "investigator LLM call failed, using heuristic fallback");
                return heuristic_fallback(evaluation);
            }
        };

        if !guard.response_ok(&response) {
            warn!("investigator canary missing, using heuristic fallback");
            let mut fallback = heuristic_fallback(evaluation);
            fallback.llm_calls = 1;
            return fallback;
        }

        match extract_json_object(&response)
            .and_then(|json| serde_json::from_str::<Investigation>(&json).ok())
        {
            Some(mut investigation) => {
                investigation.confidence = investigation.confidence.clamp(0.0, 1.0);
                investigation.llm_calls = 1;
                investigation
            }
            None => {
                let mut fallback = heuristic_fallback(evaluation);
                fallback.llm_calls = 1;
                fallback
            }
        }
    }

    /// Affected-file contents plus code-search hits.
    async fn gather_context(&self, repo: &RepoDescriptor, evaluation: &IssueEvaluation) -> String {
        let mut out = String::new();

        if let Ok(branch) = self.forge.get_default_branch(repo).await {
            for path in evaluation.affected_files.iter().take(MAX_FILES) {
                match self.forge.get_file_content(repo, &branch, path).await {
                    Ok(Some(content)) => {
                        out.push_str(&format!("\n## {}\n", path));
                        out.push_str(&truncate_chars(
                            &content,
                            FILE_TRUNCATE_CHARS,
                            "\n[truncated]",
                        ));
                    }
                    Ok(None) => out.push_str(&format!("\n## {} (not found)\n", path)),
                    Err(err) => {
                        warn!(path = %path, error = %err, "investigator file fetch failed");
                    }
                }
            }
        }

        for query in derive_searches(evaluation) {
            match self.forge.search_code(repo, &query).await {
                Ok(hits) => {
                    out.push_str(&format!("\n## search: {}\n", query));
                    for hit in hits.iter().take(5) {
                        out.push_str(&format!("{}: {}\n", hit.path, hit.snippet));
                    }
                }
                Err(err) => {
                    warn!(query = %query, error = %err, "investigator code search failed");
                }
            }
        }

        out
    }
}

/// Up to five queries: capitalized identifiers from the approach, then
/// salient keywords from the reasoning.
fn derive_searches(evaluation: &IssueEvaluation) -> Vec<String> {
    let mut queries: Vec<String> = Vec::new();
    let mut seen = BTreeSet::new();

    for m in IDENTIFIER_REGEX.find_iter(&evaluation.proposed_approach) {
        if queries.len() >= MAX_SEARCHES {
            return queries;
        }
        if seen.insert(m.as_str().to_string()) {
            queries.push(m.as_str().to_string());
        }
    }

    for word in evaluation.reasoning.split_whitespace() {
        if queries.len() >= MAX_SEARCHES {
            break;
        }
        let word: String = word
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect();
        if word.len() > 5 && seen.insert(word.to_lowercase()) {
            queries.push(word);
        }
    }

    queries
}

fn heuristic_fallback(evaluation: &IssueEvaluation) -> Investigation {
    Investigation {
        suggested_changes: evaluation
            .affected_files
            .iter()
            .map(|path| SuggestedChange {
                path: path.clone(),
                kind: ChangeKind::Modify,
                description: "Surfaced by the evaluator as likely relevant".to_string(),
            })
            .collect(),
        dependencies: Vec::new(),
        confidence: FALLBACK_CONFIDENCE,
        notes: "Heuristic fallback; no structured investigation ran".to_string(),
        llm_calls: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evaluation(approach: &str, reasoning: &str, files: &[&str]) -> IssueEvaluation {
        IssueEvaluation {
            merit: true,
            confidence: 0.9,
            reasoning: reasoning.to_string(),
            proposed_approach: approach.to_string(),
            affected_files: files.iter().map(|s| s.to_string()).collect(),
            suggested_labels: Vec::new(),
            severity: Default::default(),
            category: Default::default(),
            duplicate_of: None,
        }
    }

    #[test]
    fn test_derive_searches_prefers_identifiers() {
        let eval = evaluation(
            "Guard the empty path in Parser::parse and TokenStream handling",
            "the tokenizer mishandles boundaries",
            &[],
        );
        let queries = derive_searches(&eval);
        assert!(queries.contains(&"Parser".to_string()));
        assert!(queries.contains(&"TokenStream".to_string()));
        assert!(queries.len() <= MAX_SEARCHES);
    }

    #[test]
    fn test_derive_searches_caps_at_five() {
        let eval = evaluation(
            "Alpha Beta Gamma Delta Epsilon Zeta Theta",
            "several longwinded reasoning keywords follow here",
            &[],
        );
        assert_eq!(derive_searches(&eval).len(), MAX_SEARCHES);
    }

    #[test]
    fn test_derive_searches_falls_back_to_keywords() {
        let eval = evaluation("fix the bug", "parser crashes handling unicode boundaries", &[]);
        let queries = derive_searches(&eval);
        assert!(!queries.is_empty());
        assert!(queries.iter().all(|q| q.len() > 5));
    }

    #[test]
    fn test_heuristic_fallback_surfaces_affected_files() {
        let eval = evaluation("fix", "because", &["src/parser.rs", "src/lexer.rs"]);
        let investigation = heuristic_fallback(&eval);
        assert_eq!(investigation.suggested_changes.len(), 2);
        assert_eq!(investigation.suggested_changes[0].kind, ChangeKind::Modify);
        assert!((investigation.confidence - FALLBACK_CONFIDENCE).abs() < 1e-9);
    }

    #[test]
    fn test_investigation_decodes_with_defaults() {
        let investigation: Investigation = serde_json::from_str("{}").unwrap();
        assert!(investigation.suggested_changes.is_empty());
        assert_eq!(investigation.confidence, 0.0);
    }
}
