//! Comment moderation: sanitize, classify, resolve trust, act.
//!
//! The handler turns a threat assessment plus the author's trust
//! thresholds into a set of moderation actions and executes each against
//! the forge, auditing both the decision and the side effects. Owners
//! bypass moderation entirely.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::RepoDescriptor;
use crate::crypto::{AuditAction, AuditDraft, AuditLog, StampManager};
use crate::errors::PipelineError;
use crate::ports::{CommentData, Forge};
use crate::security::classifier::{ThreatAssessment, ThreatClassifier};
use crate::security::sanitizer::sanitize;
use crate::security::trust::{TrustProfile, TrustResolver, compute_thresholds};
use crate::util::sha256_hex;

/// Label applied to an issue/PR whose thread drew a flag.
pub const LABEL_FLAGGED_COMMENT: &str = "argus:flagged-comment";

/// Where a piece of user text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommentContext {
    Issue(u64),
    PrConversation(u64),
    /// The PR description itself; hostile content here gets rewritten.
    PrBody(u64),
}

impl CommentContext {
    fn target(&self) -> String {
        match self {
            Self::Issue(n) => format!("issue-{}", n),
            Self::PrConversation(n) | Self::PrBody(n) => format!("pr-{}", n),
        }
    }
}

/// A moderation action chosen by the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationAction {
    Flag,
    Delete,
    Block,
    Report,
    UpdatePr,
    None,
}

/// What the handler decided and did for one comment.
#[derive(Debug, Clone)]
pub struct ModerationOutcome {
    pub actions: Vec<ModerationAction>,
    pub assessment: ThreatAssessment,
    pub profile: Option<TrustProfile>,
}

impl ModerationOutcome {
    pub fn acted(&self) -> bool {
        self.actions.iter().any(|a| *a != ModerationAction::None)
    }
}

/// Moderation pipeline over the security layer and the forge.
pub struct CommentHandler {
    forge: Arc<dyn Forge>,
    classifier: Arc<ThreatClassifier>,
    trust: Arc<TrustResolver>,
    stamps: Arc<StampManager>,
    audit: Arc<AuditLog>,
    dry_run: bool,
}

impl CommentHandler {
    pub fn new(
        forge: Arc<dyn Forge>,
        classifier: Arc<ThreatClassifier>,
        trust: Arc<TrustResolver>,
        stamps: Arc<StampManager>,
        audit: Arc<AuditLog>,
        dry_run: bool,
    ) -> Self {
        Self {
            forge,
            classifier,
            trust,
            stamps,
            audit,
            dry_run,
        }
    }

    /// Moderate one comment. Our own stamped comments are ignored.
    pub async fn handle_comment(
        &self,
        repo: &RepoDescriptor,
        context: CommentContext,
        comment: &CommentData,
        cancel: CancellationToken,
    ) -> Result<ModerationOutcome, PipelineError> {
        let repo_key = repo.key();

        // Never moderate ourselves.
        if self
            .stamps
            .verify(&comment.body, &repo_key, comment.id)
            .map_err(PipelineError::Other)?
            .valid
        {
            return Ok(ModerationOutcome {
                actions: vec![ModerationAction::None],
                assessment: ThreatAssessment {
                    classification: crate::security::classifier::ThreatClass::Clean,
                    confidence: 1.0,
                    threat_type: None,
                    evidence: Vec::new(),
                    raw_input: String::new(),
                },
                profile: None,
            });
        }

        let sanitized = sanitize(&comment.body);
        let assessment = self.classifier.classify(&sanitized, cancel).await;

        let profile = match self.trust.resolve(repo, &comment.author).await {
            Ok(profile) => profile,
            Err(err) => {
                warn!(author = %comment.author, error = %err, "trust lookup failed, assuming unknown");
                return Ok(ModerationOutcome {
                    actions: vec![ModerationAction::None],
                    assessment,
                    profile: None,
                });
            }
        };

        // Owners are immune: the owner account exercises the system.
        if profile.is_owner() {
            return Ok(ModerationOutcome {
                actions: vec![ModerationAction::None],
                assessment,
                profile: Some(profile),
            });
        }

        let actions = choose_actions(&assessment, &profile, context);
        self.audit
            .append(
                AuditDraft::new(AuditAction::ModerateComment, &repo_key, context.target())
                    .with_hashes(sha256_hex(comment.body.as_bytes()), "")
                    .with_decision(render_actions(&actions))
                    .with_details(format!(
                        "author={} trust={:.2} classification={} confidence={:.2}",
                        comment.author,
                        profile.effective_score,
                        assessment.classification.as_str(),
                        assessment.confidence
                    )),
            )
            .map_err(PipelineError::Other)?;

        if !self.dry_run {
            self.execute(repo, context, comment, &assessment, &actions)
                .await?;
        }

        Ok(ModerationOutcome {
            actions,
            assessment,
            profile: Some(profile),
        })
    }

    async fn execute(
        &self,
        repo: &RepoDescriptor,
        context: CommentContext,
        comment: &CommentData,
        assessment: &ThreatAssessment,
        actions: &[ModerationAction],
    ) -> Result<(), PipelineError> {
        for action in actions {
            let result = match action {
                ModerationAction::Flag => {
                    let number = match context {
                        CommentContext::Issue(n)
                        | CommentContext::PrConversation(n)
                        | CommentContext::PrBody(n) => n,
                    };
                    self.forge.add_label(repo, number, LABEL_FLAGGED_COMMENT).await
                }
                ModerationAction::Delete => self.forge.delete_comment(repo, comment.id).await,
                ModerationAction::Block => {
                    let result = self.forge.block_user(repo, &comment.author).await;
                    self.trust.invalidate(repo, &comment.author);
                    result
                }
                ModerationAction::Report => {
                    // Advisory on platforms without a report primitive.
                    if self.forge.supports_report() {
                        self.forge
                            .report_user(
                                repo,
                                &comment.author,
                                assessment.threat_type.as_deref().unwrap_or("abuse"),
                            )
                            .await
                    } else {
                        info!(author = %comment.author, "report requested; platform has no report API");
                        Ok(())
                    }
                }
                ModerationAction::UpdatePr => {
                    if let CommentContext::PrBody(number) = context {
                        let replacement = format!(
                            "{}\n\n> Description rewritten: the original contained \
                             content flagged as {}.",
                            assessment.raw_input,
                            assessment.threat_type.as_deref().unwrap_or("hostile")
                        );
                        self.forge.update_pr_body(repo, number, &replacement).await
                    } else {
                        Ok(())
                    }
                }
                ModerationAction::None => Ok(()),
            };
            if let Err(err) = result {
                warn!(action = ?action, error = %err, "moderation side effect failed");
            }
        }
        Ok(())
    }
}

/// Map assessment confidence onto the author's thresholds.
fn choose_actions(
    assessment: &ThreatAssessment,
    profile: &TrustProfile,
    context: CommentContext,
) -> Vec<ModerationAction> {
    if assessment.is_clean() {
        return vec![ModerationAction::None];
    }

    let thresholds = compute_thresholds(profile.effective_score);
    let confidence = assessment.confidence;
    let mut actions = Vec::new();

    // The block bound is inclusive; 0.99 exactly still blocks.
    if confidence >= thresholds.block {
        actions.push(ModerationAction::Delete);
        actions.push(ModerationAction::Block);
    } else if confidence >= thresholds.flag {
        actions.push(ModerationAction::Flag);
    }
    if confidence >= thresholds.report {
        actions.push(ModerationAction::Report);
    }
    if matches!(context, CommentContext::PrBody(_)) && confidence >= thresholds.flag {
        actions.push(ModerationAction::UpdatePr);
    }

    if actions.is_empty() {
        actions.push(ModerationAction::None);
    }
    actions
}

fn render_actions(actions: &[ModerationAction]) -> String {
    actions
        .iter()
        .map(|a| match a {
            ModerationAction::Flag => "flag",
            ModerationAction::Delete => "delete",
            ModerationAction::Block => "block",
            ModerationAction::Report => "report",
            ModerationAction::UpdatePr => "update_pr",
            ModerationAction::None => "none",
        })
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::UserHistoryData;
    use crate::security::classifier::ThreatClass;
    use crate::security::trust::TrustTier;
    use chrono::Utc;

    fn assessment(class: ThreatClass, confidence: f64) -> ThreatAssessment {
        ThreatAssessment {
            classification: class,
            confidence,
            threat_type: Some("prompt_injection".to_string()),
            evidence: vec!["instruction_override".to_string()],
            raw_input: "input".to_string(),
        }
    }

    fn profile(tier: TrustTier) -> TrustProfile {
        let base = tier.base_score();
        TrustProfile {
            username: "mallory".to_string(),
            tier,
            base_score: base,
            history_modifier: 0.0,
            effective_score: base,
            history: UserHistoryData::default(),
            last_updated: Utc::now(),
        }
    }

    #[test]
    fn test_clean_comment_no_action() {
        let actions = choose_actions(
            &assessment(ThreatClass::Clean, 0.9),
            &profile(TrustTier::Unknown),
            CommentContext::Issue(1),
        );
        assert_eq!(actions, vec![ModerationAction::None]);
    }

    #[test]
    fn test_hostile_low_trust_deletes_and_blocks() {
        // Unknown user: block threshold 0.8; static hostile 0.9 crosses it.
        let actions = choose_actions(
            &assessment(ThreatClass::Hostile, 0.9),
            &profile(TrustTier::Unknown),
            CommentContext::Issue(1),
        );
        assert!(actions.contains(&ModerationAction::Delete));
        assert!(actions.contains(&ModerationAction::Block));
    }

    #[test]
    fn test_same_confidence_only_flags_trusted_user() {
        // Reviewer (0.75): flag at 0.725, block at 0.9425.
        let actions = choose_actions(
            &assessment(ThreatClass::Hostile, 0.9),
            &profile(TrustTier::Reviewer),
            CommentContext::Issue(1),
        );
        assert_eq!(actions, vec![ModerationAction::Flag]);
    }

    #[test]
    fn test_block_threshold_inclusive_at_full_trust() {
        // t would be 1.0 for an owner, but owners never reach here; use a
        // synthetic profile at effective 1.0 to pin the inclusive bound.
        let mut p = profile(TrustTier::Maintainer);
        p.effective_score = 1.0;
        let actions = choose_actions(
            &assessment(ThreatClass::Hostile, 0.99),
            &p,
            CommentContext::Issue(1),
        );
        assert!(actions.contains(&ModerationAction::Block));
    }

    #[test]
    fn test_report_only_for_low_trust_extreme_confidence() {
        let actions = choose_actions(
            &assessment(ThreatClass::Hostile, 0.96),
            &profile(TrustTier::Unknown),
            CommentContext::Issue(1),
        );
        assert!(actions.contains(&ModerationAction::Report));

        // Maintainer trust (0.85 >= 0.75): report disabled.
        let actions = choose_actions(
            &assessment(ThreatClass::Hostile, 0.96),
            &profile(TrustTier::Maintainer),
            CommentContext::Issue(1),
        );
        assert!(!actions.contains(&ModerationAction::Report));
    }

    #[test]
    fn test_hostile_pr_body_rewrites_description() {
        let actions = choose_actions(
            &assessment(ThreatClass::Hostile, 0.9),
            &profile(TrustTier::Unknown),
            CommentContext::PrBody(7),
        );
        assert!(actions.contains(&ModerationAction::UpdatePr));
    }

    #[test]
    fn test_suspicious_below_flag_threshold_no_action() {
        // Contributor trust 0.5: flag threshold 0.65.
        let actions = choose_actions(
            &assessment(ThreatClass::Suspicious, 0.6),
            &profile(TrustTier::Contributor),
            CommentContext::Issue(1),
        );
        assert_eq!(actions, vec![ModerationAction::None]);
    }

    #[test]
    fn test_owner_never_moderated_by_choose_actions_callers() {
        // The owner short-circuit happens in handle_comment; this pins
        // the invariant that the action chooser is never reached with an
        // owner profile in practice, by checking the profile helper.
        assert!(profile(TrustTier::Owner).is_owner());
    }
}
