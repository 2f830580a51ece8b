//! Wire types shared by the forge port and the pipeline.
//!
//! These are the subsets of platform payloads the core cares about,
//! already normalized: role strings are canonical, timestamps are UTC.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// An issue as reported by the forge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueData {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub url: String,
    pub author: String,
    pub labels: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

/// A conversation comment on an issue or PR.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentData {
    pub id: u64,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// A review comment attached to a diff position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewCommentData {
    pub id: u64,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub path: Option<String>,
    pub line: Option<u32>,
    pub side: Option<String>,
    pub diff_hunk: Option<String>,
    pub in_reply_to_id: Option<u64>,
}

/// A pull request (subset of fields we care about).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestData {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub url: String,
    pub author: String,
    pub head_branch: String,
    pub base_branch: String,
    pub draft: bool,
    pub created_at: DateTime<Utc>,
}

/// One file touched by a pull request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrFileData {
    pub path: String,
    pub additions: u64,
    pub deletions: u64,
    pub patch: Option<String>,
}

/// A CI check run on a ref.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRunData {
    pub id: u64,
    pub name: String,
    /// "queued", "in_progress", or "completed".
    pub status: String,
    /// "success", "failure", "neutral", ...; present once completed.
    pub conclusion: Option<String>,
}

/// An annotation produced by a failing check run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckAnnotationData {
    pub path: String,
    pub message: String,
    pub level: String,
}

/// A legacy commit status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitStatusData {
    pub context: String,
    /// "pending", "success", "failure", or "error".
    pub state: String,
}

/// One entry from a tree listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeEntryData {
    pub path: String,
    pub is_dir: bool,
}

/// One code-search hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHitData {
    pub path: String,
    pub snippet: String,
}

/// Aggregate counters a forge can report about a user's history in a repo.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserHistoryData {
    pub merged_prs: u32,
    pub closed_valid_issues: u32,
    pub total_comments: u32,
    pub prior_flags: u32,
    pub prior_blocks: u32,
}

/// Canonical repository role. Forge adapters must map their platform's
/// native role strings onto this set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoRole {
    Owner,
    Admin,
    Maintainer,
    Write,
    Triage,
    Read,
    None,
}

impl RepoRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Admin => "admin",
            Self::Maintainer => "maintainer",
            Self::Write => "write",
            Self::Triage => "triage",
            Self::Read => "read",
            Self::None => "none",
        }
    }
}

impl FromStr for RepoRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(Self::Owner),
            "admin" => Ok(Self::Admin),
            "maintainer" => Ok(Self::Maintainer),
            "write" => Ok(Self::Write),
            "triage" => Ok(Self::Triage),
            "read" => Ok(Self::Read),
            "none" => Ok(Self::None),
            _ => Err(format!("Invalid repo role: {}", s)),
        }
    }
}
