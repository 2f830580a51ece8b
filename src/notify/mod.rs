//! Notifier port and the default log-backed implementation.
//!
//! The SMTP transport lives outside the core; in-process the agent only
//! knows the event vocabulary below. `LogNotifier` is what runs when the
//! notifier is disabled: events still surface in the tracing output.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Events worth telling a human about.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotifierEvent {
    IssueEvaluated {
        repo: String,
        issue: u64,
        merit: bool,
        confidence: f64,
    },
    PrCreated {
        repo: String,
        issue: u64,
        pr: u64,
        url: String,
    },
    ThreatDetected {
        repo: String,
        target: String,
        classification: String,
        confidence: f64,
    },
    CompetingAnalyzed {
        repo: String,
        issue: u64,
        our_score: f64,
        best_competitor: f64,
    },
    PipelineError {
        repo: String,
        issue: u64,
        error: String,
    },
}

/// Abstraction over outbound notifications for testability.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: NotifierEvent) -> Result<()>;
}

/// Writes every event to the tracing log and nothing else.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: NotifierEvent) -> Result<()> {
        match serde_json::to_string(&event) {
            Ok(json) => info!(event = %json, "notifier event"),
            Err(_) => info!(?event, "notifier event"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_notifier_accepts_all_events() {
        let notifier = LogNotifier;
        notifier
            .notify(NotifierEvent::PrCreated {
                repo: "github:demo/app".to_string(),
                issue: 42,
                pr: 5,
                url: "https://example.com/pull/5".to_string(),
            })
            .await
            .unwrap();
    }

    #[test]
    fn test_event_serialization_tagged() {
        let event = NotifierEvent::ThreatDetected {
            repo: "github:demo/app".to_string(),
            target: "issue-7".to_string(),
            classification: "hostile".to_string(),
            confidence: 0.9,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"threat_detected\""));
    }
}
