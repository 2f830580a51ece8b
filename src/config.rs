//! Unified configuration system for Argus.
//!
//! Reads `argus.toml` from the working directory (or an explicit path).
//! Layering is file → environment → CLI flags, in that order.
//!
//! # Configuration File Format
//!
//! ```toml
//! default_poll_interval_minutes = 5
//! max_concurrent_issues = 3
//! max_coding_iterations = 5
//! branch_prefix = "argus/"
//! dry_run = false
//! log_level = "info"
//!
//! [[repos]]
//! platform = "github"
//! owner = "demo"
//! name = "app"
//! poll_interval_minutes = 5
//!
//! [notifier]
//! enabled = false
//! host = "smtp.example.com"
//! port = 587
//! security = "starttls"
//! username = "argus"
//! from = "argus@example.com"
//! to = ["oncall@example.com"]
//! ```

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// A repository the agent watches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoDescriptor {
    pub platform: String,
    pub owner: String,
    pub name: String,
    /// Minutes between polls; falls back to `default_poll_interval_minutes`.
    #[serde(default)]
    pub poll_interval_minutes: Option<u64>,
}

impl RepoDescriptor {
    pub fn new(platform: &str, owner: &str, name: &str) -> Self {
        Self {
            platform: platform.to_string(),
            owner: owner.to_string(),
            name: name.to_string(),
            poll_interval_minutes: None,
        }
    }

    /// Stable key: `"platform:owner/name"`.
    pub fn key(&self) -> String {
        format!("{}:{}/{}", self.platform, self.owner, self.name)
    }

    /// `"owner/name"` as the forge APIs expect it.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

impl fmt::Display for RepoDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Minimum level emitted to the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(anyhow!(
                "Invalid log level '{}'. Valid values: debug, info, warn, error",
                s
            )),
        }
    }
}

/// SMTP notifier settings. The transport itself lives behind the
/// `Notifier` port; these fields configure whichever implementation is
/// wired in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifierConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    /// "none", "starttls", or "tls".
    #[serde(default)]
    pub security: String,
    #[serde(default)]
    pub username: String,
    /// Password comes from `ARGUS_SMTP_PASSWORD`, never the config file.
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: Vec<String>,
}

fn default_smtp_port() -> u16 {
    587
}

fn default_poll_interval() -> u64 {
    5
}

fn default_max_concurrent() -> usize {
    3
}

fn default_max_iterations() -> u32 {
    5
}

fn default_branch_prefix() -> String {
    "argus/".to_string()
}

/// Runtime configuration for the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub repos: Vec<RepoDescriptor>,
    #[serde(default = "default_poll_interval")]
    pub default_poll_interval_minutes: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_issues: usize,
    #[serde(default = "default_max_iterations")]
    pub max_coding_iterations: u32,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default)]
    pub notifier: NotifierConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            repos: Vec::new(),
            default_poll_interval_minutes: default_poll_interval(),
            max_concurrent_issues: default_max_concurrent(),
            max_coding_iterations: default_max_iterations(),
            branch_prefix: default_branch_prefix(),
            dry_run: false,
            log_level: LogLevel::default(),
            notifier: NotifierConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: AgentConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate ranges and required fields.
    pub fn validate(&self) -> Result<()> {
        if self.default_poll_interval_minutes < 1 {
            anyhow::bail!("default_poll_interval_minutes must be at least 1");
        }
        if self.max_concurrent_issues == 0 {
            anyhow::bail!("max_concurrent_issues must be at least 1");
        }
        if self.max_coding_iterations == 0 {
            anyhow::bail!("max_coding_iterations must be at least 1");
        }
        if self.branch_prefix.is_empty() {
            anyhow::bail!("branch_prefix must not be empty");
        }
        for repo in &self.repos {
            if repo.platform.is_empty() || repo.owner.is_empty() || repo.name.is_empty() {
                anyhow::bail!("repo entries require platform, owner, and name");
            }
            if let Some(interval) = repo.poll_interval_minutes {
                if interval < 1 {
                    anyhow::bail!("poll_interval_minutes for {} must be at least 1", repo.key());
                }
            }
        }
        if self.notifier.enabled && self.notifier.host.is_empty() {
            anyhow::bail!("notifier.host is required when the notifier is enabled");
        }
        Ok(())
    }

    /// Effective poll interval for a repo, in minutes.
    pub fn poll_interval_for(&self, repo: &RepoDescriptor) -> u64 {
        repo.poll_interval_minutes
            .unwrap_or(self.default_poll_interval_minutes)
    }
}
