//! Graduated trust: who is this user, and how much rope do they get.
//!
//! The forge-reported role sets a base score; repo history nudges it
//! inside [-0.3, +0.2]; moderation thresholds scale with the result.
//! Owners are immune to moderation because the owner account is the one
//! used to exercise the system.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RepoDescriptor;
use crate::errors::SecurityError;
use crate::ports::{Forge, RepoRole, UserHistoryData};

/// Cache entries expire after this.
const CACHE_TTL: Duration = Duration::from_secs(600);

/// Trust tier derived from the forge role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustTier {
    Owner,
    Maintainer,
    Reviewer,
    Contributor,
    Participant,
    Unknown,
}

impl TrustTier {
    pub fn from_role(role: RepoRole) -> Self {
        match role {
            RepoRole::Owner | RepoRole::Admin => Self::Owner,
            RepoRole::Maintainer => Self::Maintainer,
            RepoRole::Write => Self::Reviewer,
            RepoRole::Triage => Self::Contributor,
            RepoRole::Read => Self::Participant,
            RepoRole::None => Self::Unknown,
        }
    }

    pub fn base_score(&self) -> f64 {
        match self {
            Self::Owner => 1.0,
            Self::Maintainer => 0.85,
            Self::Reviewer => 0.75,
            Self::Contributor => 0.50,
            Self::Participant => 0.30,
            Self::Unknown => 0.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Maintainer => "maintainer",
            Self::Reviewer => "reviewer",
            Self::Contributor => "contributor",
            Self::Participant => "participant",
            Self::Unknown => "unknown",
        }
    }
}

/// A resolved user with history-adjusted trust.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustProfile {
    pub username: String,
    pub tier: TrustTier,
    pub base_score: f64,
    pub history_modifier: f64,
    pub effective_score: f64,
    pub history: UserHistoryData,
    pub last_updated: DateTime<Utc>,
}

impl TrustProfile {
    pub fn is_owner(&self) -> bool {
        self.tier == TrustTier::Owner
    }
}

/// Moderation thresholds derived from an effective trust score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub flag: f64,
    pub block: f64,
    /// `f64::INFINITY` means reporting is off for this user.
    pub report: f64,
}

/// Thresholds scale with trust: trusted users need near-certain evidence
/// before the agent acts against them. The block bound is inclusive: a
/// confidence exactly at the threshold still blocks.
pub fn compute_thresholds(effective_score: f64) -> Thresholds {
    let t = effective_score.clamp(0.0, 1.0);
    Thresholds {
        flag: 0.5 + 0.3 * t,
        block: 0.8 + 0.19 * t,
        report: if t >= 0.75 { f64::INFINITY } else { 0.95 },
    }
}

/// Additive history modifier, clamped to [-0.3, +0.2].
fn history_modifier(history: &UserHistoryData) -> f64 {
    let merged = (0.02 * history.merged_prs as f64).min(0.1);
    let issues = (0.01 * history.closed_valid_issues as f64).min(0.05);
    let engagement = match history.total_comments {
        0..=19 => 0.0,
        20..=99 => 0.01,
        _ => 0.02,
    };
    let flags = (0.05 * history.prior_flags as f64).min(0.15);
    let blocks = (0.15 * history.prior_blocks as f64).min(0.3);
    (merged + issues + engagement - flags - blocks).clamp(-0.3, 0.2)
}

/// Resolves trust profiles through the forge, with a short TTL cache.
pub struct TrustResolver {
    forge: Arc<dyn Forge>,
    cache: Mutex<HashMap<String, (TrustProfile, Instant)>>,
}

impl TrustResolver {
    pub fn new(forge: Arc<dyn Forge>) -> Self {
        Self {
            forge,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cache_key(repo: &RepoDescriptor, username: &str) -> String {
        format!("{}:{}/{}:{}", repo.platform, repo.owner, repo.name, username)
    }

    /// Resolve a user's trust profile, serving from cache when fresh.
    pub async fn resolve(
        &self,
        repo: &RepoDescriptor,
        username: &str,
    ) -> Result<TrustProfile, SecurityError> {
        let key = Self::cache_key(repo, username);
        if let Ok(cache) = self.cache.lock() {
            if let Some((profile, at)) = cache.get(&key) {
                if at.elapsed() < CACHE_TTL {
                    return Ok(profile.clone());
                }
            }
        }

        let role = self
            .forge
            .get_repo_role(repo, username)
            .await
            .map_err(|e| SecurityError::TrustLookupFailed {
                username: username.to_string(),
                message: e.to_string(),
            })?;
        let history = self
            .forge
            .get_user_history(repo, username)
            .await
            .map_err(|e| SecurityError::TrustLookupFailed {
                username: username.to_string(),
                message: e.to_string(),
            })?;

        let tier = TrustTier::from_role(role);
        let base_score = tier.base_score();
        let modifier = history_modifier(&history);
        let profile = TrustProfile {
            username: username.to_string(),
            tier,
            base_score,
            history_modifier: modifier,
            effective_score: (base_score + modifier).clamp(0.0, 1.0),
            history,
            last_updated: Utc::now(),
        };

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key, (profile.clone(), Instant::now()));
        }
        Ok(profile)
    }

    /// Drop a user's cached profile (after moderation acts on them).
    pub fn invalidate(&self, repo: &RepoDescriptor, username: &str) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(&Self::cache_key(repo, username));
        }
    }
}
