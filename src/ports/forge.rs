//! The forge port: everything the agent asks of a hosting platform.
//!
//! Concrete adapters (GitHub, GitLab) implement this trait outside the
//! core. Test double: `MockForge` in the integration tests.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::RepoDescriptor;
use crate::ports::types::*;

/// Abstraction over a source-code forge for testability and multi-platform
/// support. All methods are read-or-write against the platform API; none
/// hold state between calls.
#[async_trait]
pub trait Forge: Send + Sync {
    // ── Issues ──────────────────────────────────────────────────────────

    async fn list_issues_updated_since(
        &self,
        repo: &RepoDescriptor,
        since: DateTime<Utc>,
    ) -> Result<Vec<IssueData>>;

    async fn get_issue(&self, repo: &RepoDescriptor, number: u64) -> Result<IssueData>;

    async fn list_issue_comments(
        &self,
        repo: &RepoDescriptor,
        number: u64,
    ) -> Result<Vec<CommentData>>;

    async fn list_issue_comments_since(
        &self,
        repo: &RepoDescriptor,
        number: u64,
        since: DateTime<Utc>,
    ) -> Result<Vec<CommentData>>;

    async fn add_label(&self, repo: &RepoDescriptor, number: u64, label: &str) -> Result<()>;

    async fn remove_label(&self, repo: &RepoDescriptor, number: u64, label: &str) -> Result<()>;

    /// Returns the id of the created comment.
    async fn add_issue_comment(
        &self,
        repo: &RepoDescriptor,
        number: u64,
        body: &str,
    ) -> Result<u64>;

    async fn update_issue_body(
        &self,
        repo: &RepoDescriptor,
        number: u64,
        body: &str,
    ) -> Result<()>;

    async fn list_repo_labels(&self, repo: &RepoDescriptor) -> Result<Vec<String>>;

    // ── Pull requests ───────────────────────────────────────────────────

    async fn list_open_prs(&self, repo: &RepoDescriptor) -> Result<Vec<PullRequestData>>;

    /// PRs whose title or body references the issue.
    async fn list_prs_for_issue(
        &self,
        repo: &RepoDescriptor,
        issue_number: u64,
    ) -> Result<Vec<PullRequestData>>;

    async fn get_pr(&self, repo: &RepoDescriptor, number: u64) -> Result<PullRequestData>;

    async fn list_pr_conversation_comments(
        &self,
        repo: &RepoDescriptor,
        number: u64,
    ) -> Result<Vec<CommentData>>;

    async fn list_pr_review_comments(
        &self,
        repo: &RepoDescriptor,
        number: u64,
    ) -> Result<Vec<ReviewCommentData>>;

    async fn list_pr_files(&self, repo: &RepoDescriptor, number: u64) -> Result<Vec<PrFileData>>;

    async fn create_pr(
        &self,
        repo: &RepoDescriptor,
        title: &str,
        body: &str,
        head_branch: &str,
        base_branch: &str,
    ) -> Result<PullRequestData>;

    /// Returns the id of the created comment.
    async fn add_pr_comment(&self, repo: &RepoDescriptor, number: u64, body: &str) -> Result<u64>;

    async fn update_pr_body(&self, repo: &RepoDescriptor, number: u64, body: &str) -> Result<()>;

    // ── Branches and files ──────────────────────────────────────────────

    async fn get_default_branch(&self, repo: &RepoDescriptor) -> Result<String>;

    async fn create_branch_from(
        &self,
        repo: &RepoDescriptor,
        base: &str,
        new_branch: &str,
    ) -> Result<()>;

    /// `Ok(None)` when the path does not exist on the branch.
    async fn get_file_content(
        &self,
        repo: &RepoDescriptor,
        branch: &str,
        path: &str,
    ) -> Result<Option<String>>;

    async fn create_or_update_file(
        &self,
        repo: &RepoDescriptor,
        branch: &str,
        path: &str,
        content: &str,
        message: &str,
    ) -> Result<()>;

    async fn list_tree(
        &self,
        repo: &RepoDescriptor,
        branch: &str,
        path: &str,
        recursive: bool,
    ) -> Result<Vec<TreeEntryData>>;

    // ── CI ──────────────────────────────────────────────────────────────

    async fn get_combined_statuses(
        &self,
        repo: &RepoDescriptor,
        git_ref: &str,
    ) -> Result<Vec<CommitStatusData>>;

    async fn get_check_runs(
        &self,
        repo: &RepoDescriptor,
        git_ref: &str,
    ) -> Result<Vec<CheckRunData>>;

    async fn get_check_run_annotations(
        &self,
        repo: &RepoDescriptor,
        check_run_id: u64,
    ) -> Result<Vec<CheckAnnotationData>>;

    // ── Search ──────────────────────────────────────────────────────────

    async fn search_code(&self, repo: &RepoDescriptor, query: &str) -> Result<Vec<SearchHitData>>;

    // ── Users ───────────────────────────────────────────────────────────

    async fn get_repo_role(&self, repo: &RepoDescriptor, username: &str) -> Result<RepoRole>;

    async fn get_user_history(
        &self,
        repo: &RepoDescriptor,
        username: &str,
    ) -> Result<UserHistoryData>;

    // ── Moderation ──────────────────────────────────────────────────────

    async fn delete_comment(&self, repo: &RepoDescriptor, comment_id: u64) -> Result<()>;

    async fn block_user(&self, repo: &RepoDescriptor, username: &str) -> Result<()>;

    async fn unblock_user(&self, repo: &RepoDescriptor, username: &str) -> Result<()>;

    /// Platforms without an abuse-report API keep the default and the
    /// handler records the decision without calling `report_user`.
    fn supports_report(&self) -> bool {
        false
    }

    async fn report_user(&self, repo: &RepoDescriptor, username: &str, reason: &str) -> Result<()>;

    // ── Token introspection ─────────────────────────────────────────────

    async fn validate_token_scopes(&self) -> Result<Vec<String>>;
}
