//! Hash-chained, HMAC-signed audit log.
//!
//! Every entry links to its predecessor by SHA-256 of the predecessor's
//! stored serialization, and carries an HMAC over its own identifying
//! fields. Verification walks the chain from genesis and names the first
//! entry that breaks it.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::keys::KeyManager;
use crate::errors::CryptoError;
use crate::store::Store;
use crate::util::sha256_hex;

const COUNTER_KEY: &str = "audit/counter";
const ENTRY_PREFIX: &str = "audit/entries/";

/// The chain link of the genesis entry.
pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// What kind of action an audit entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    PollRepos,
    EvaluateIssue,
    CreateBranch,
    PushCode,
    CiCheck,
    CreatePr,
    AcknowledgeReview,
    ModerateComment,
    DetectEdit,
    AnalyzeCompeting,
    PlanSynthesis,
    DisengageChain,
    RotateKey,
    EmergencyStop,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PollRepos => "poll_repos",
            Self::EvaluateIssue => "evaluate_issue",
            Self::CreateBranch => "create_branch",
            Self::PushCode => "push_code",
            Self::CiCheck => "ci_check",
            Self::CreatePr => "create_pr",
            Self::AcknowledgeReview => "acknowledge_review",
            Self::ModerateComment => "moderate_comment",
            Self::DetectEdit => "detect_edit",
            Self::AnalyzeCompeting => "analyze_competing",
            Self::PlanSynthesis => "plan_synthesis",
            Self::DisengageChain => "disengage_chain",
            Self::RotateKey => "rotate_key",
            Self::EmergencyStop => "emergency_stop",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "poll_repos" => Ok(Self::PollRepos),
            "evaluate_issue" => Ok(Self::EvaluateIssue),
            "create_branch" => Ok(Self::CreateBranch),
            "push_code" => Ok(Self::PushCode),
            "ci_check" => Ok(Self::CiCheck),
            "create_pr" => Ok(Self::CreatePr),
            "acknowledge_review" => Ok(Self::AcknowledgeReview),
            "moderate_comment" => Ok(Self::ModerateComment),
            "detect_edit" => Ok(Self::DetectEdit),
            "analyze_competing" => Ok(Self::AnalyzeCompeting),
            "plan_synthesis" => Ok(Self::PlanSynthesis),
            "disengage_chain" => Ok(Self::DisengageChain),
            "rotate_key" => Ok(Self::RotateKey),
            "emergency_stop" => Ok(Self::EmergencyStop),
            _ => Err(format!("Invalid audit action: {}", s)),
        }
    }
}

/// One signed, chained audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// 8-digit zero-padded sequence number.
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub repo: String,
    pub target: String,
    pub input_hash: String,
    pub output_hash: String,
    pub decision: String,
    pub llm_calls: u32,
    pub details: String,
    pub previous_entry_hash: String,
    pub signature: String,
}

impl AuditEntry {
    fn signature_payload(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}",
            self.id,
            self.timestamp.to_rfc3339(),
            self.action.as_str(),
            self.repo,
            self.target,
            self.input_hash,
            self.output_hash,
            self.decision,
            self.previous_entry_hash
        )
    }
}

/// The caller-supplied part of an entry; the log fills in id, timestamp,
/// chain link, and signature.
#[derive(Debug, Clone)]
pub struct AuditDraft {
    pub action: AuditAction,
    pub repo: String,
    pub target: String,
    pub input_hash: String,
    pub output_hash: String,
    pub decision: String,
    pub llm_calls: u32,
    pub details: String,
}

impl AuditDraft {
    pub fn new(action: AuditAction, repo: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            action,
            repo: repo.into(),
            target: target.into(),
            input_hash: String::new(),
            output_hash: String::new(),
            decision: "ok".to_string(),
            llm_calls: 0,
            details: String::new(),
        }
    }

    pub fn with_hashes(mut self, input: impl Into<String>, output: impl Into<String>) -> Self {
        self.input_hash = input.into();
        self.output_hash = output.into();
        self
    }

    pub fn with_decision(mut self, decision: impl Into<String>) -> Self {
        self.decision = decision.into();
        self
    }

    pub fn with_llm_calls(mut self, count: u32) -> Self {
        self.llm_calls = count;
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }
}

struct ChainState {
    counter: u64,
    last_hash: String,
}

/// Append-only audit log over the store.
pub struct AuditLog {
    store: Arc<dyn Store>,
    keys: Arc<KeyManager>,
    state: Mutex<ChainState>,
}

impl AuditLog {
    /// Open the log, recovering the counter and last-entry hash.
    pub fn open(store: Arc<dyn Store>, keys: Arc<KeyManager>) -> Result<Self> {
        let counter = store
            .get(COUNTER_KEY)?
            .map(|s| s.parse::<u64>().context("Corrupt audit counter"))
            .transpose()?
            .unwrap_or(0);

        let last_hash = if counter == 0 {
            GENESIS_HASH.to_string()
        } else {
            let key = format!("{}{:08}", ENTRY_PREFIX, counter);
            let raw = store
                .get(&key)?
                .ok_or_else(|| anyhow!("Audit counter points at missing entry {}", key))?;
            sha256_hex(raw.as_bytes())
        };

        Ok(Self {
            store,
            keys,
            state: Mutex::new(ChainState { counter, last_hash }),
        })
    }

    /// Append one entry. Appends are serialized; the chain link and the
    /// counter are updated together under the lock.
    pub fn append(&self, draft: AuditDraft) -> Result<AuditEntry> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| anyhow!("audit log lock poisoned: {}", e))?;

        let id = format!("{:08}", state.counter + 1);
        let mut entry = AuditEntry {
            id: id.clone(),
            timestamp: Utc::now(),
            action: draft.action,
            repo: draft.repo,
            target: draft.target,
            input_hash: draft.input_hash,
            output_hash: draft.output_hash,
            decision: draft.decision,
            llm_calls: draft.llm_calls,
            details: draft.details,
            previous_entry_hash: state.last_hash.clone(),
            signature: String::new(),
        };
        entry.signature = self.keys.sign(entry.signature_payload().as_bytes())?;

        let serialized =
            serde_json::to_string(&entry).context("Failed to serialize audit entry")?;
        self.store
            .put(&format!("{}{}", ENTRY_PREFIX, id), &serialized)?;
        self.store.put(COUNTER_KEY, &(state.counter + 1).to_string())?;

        state.counter += 1;
        state.last_hash = sha256_hex(serialized.as_bytes());
        Ok(entry)
    }

    /// All entries, oldest first.
    pub fn entries(&self) -> Result<Vec<AuditEntry>> {
        let mut out = Vec::new();
        for (_, raw) in self.store.list_prefix(ENTRY_PREFIX)? {
            out.push(serde_json::from_str(&raw).context("Corrupt audit entry")?);
        }
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.counter as usize).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Walk the chain from genesis, re-deriving every link and checking
    /// every signature against current and previous keys. Returns the
    /// number of entries verified, or the first broken entry.
    pub fn verify_chain(&self) -> Result<usize, CryptoError> {
        let rows = self
            .store
            .list_prefix(ENTRY_PREFIX)
            .map_err(CryptoError::Store)?;

        let mut expected_prev = GENESIS_HASH.to_string();
        let mut expected_id: u64 = 1;
        for (key, raw) in &rows {
            let entry: AuditEntry =
                serde_json::from_str(raw).map_err(|e| CryptoError::AuditChainBroken {
                    id: key.clone(),
                    reason: format!("unparseable entry: {}", e),
                })?;

            if entry.id != format!("{:08}", expected_id) {
                return Err(CryptoError::AuditChainBroken {
                    id: entry.id,
                    reason: format!("expected sequence id {:08}", expected_id),
                });
            }
            if entry.previous_entry_hash != expected_prev {
                return Err(CryptoError::AuditChainBroken {
                    id: entry.id,
                    reason: "previous hash mismatch".to_string(),
                });
            }
            let verified = self
                .keys
                .verify(entry.signature_payload().as_bytes(), &entry.signature)
                .map_err(CryptoError::Store)?;
            if !verified {
                return Err(CryptoError::AuditChainBroken {
                    id: entry.id,
                    reason: "signature does not verify".to_string(),
                });
            }

            expected_prev = sha256_hex(raw.as_bytes());
            expected_id += 1;
        }
        Ok(rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    fn log() -> (Arc<dyn Store>, AuditLog) {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new_in_memory().unwrap());
        let keys = Arc::new(KeyManager::init(store.clone()).unwrap());
        let log = AuditLog::open(store.clone(), keys).unwrap();
        (store, log)
    }

    fn draft(action: AuditAction) -> AuditDraft {
        AuditDraft::new(action, "github:demo/app", "issue-42")
            .with_hashes("aa", "bb")
            .with_details("test entry")
    }

    #[test]
    fn test_ids_are_sequential_zero_padded() {
        let (_, log) = log();
        let first = log.append(draft(AuditAction::PollRepos)).unwrap();
        let second = log.append(draft(AuditAction::EvaluateIssue)).unwrap();
        assert_eq!(first.id, "00000001");
        assert_eq!(second.id, "00000002");
    }

    #[test]
    fn test_genesis_previous_hash_is_zeros() {
        let (_, log) = log();
        let first = log.append(draft(AuditAction::PollRepos)).unwrap();
        assert_eq!(first.previous_entry_hash, GENESIS_HASH);
    }

    #[test]
    fn test_chain_links_by_serialized_hash() {
        let (store, log) = log();
        let first = log.append(draft(AuditAction::PollRepos)).unwrap();
        let second = log.append(draft(AuditAction::EvaluateIssue)).unwrap();

        let raw_first = store
            .get(&format!("{}{}", ENTRY_PREFIX, first.id))
            .unwrap()
            .unwrap();
        assert_eq!(second.previous_entry_hash, sha256_hex(raw_first.as_bytes()));
    }

    #[test]
    fn test_verify_chain_accepts_intact_log() {
        let (_, log) = log();
        for action in [
            AuditAction::PollRepos,
            AuditAction::EvaluateIssue,
            AuditAction::CreateBranch,
            AuditAction::PushCode,
            AuditAction::CiCheck,
            AuditAction::CreatePr,
        ] {
            log.append(draft(action)).unwrap();
        }
        assert_eq!(log.verify_chain().unwrap(), 6);
    }

    #[test]
    fn test_verify_chain_survives_key_rotation() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new_in_memory().unwrap());
        let keys = Arc::new(KeyManager::init(store.clone()).unwrap());
        let log = AuditLog::open(store, keys.clone()).unwrap();
        log.append(draft(AuditAction::PollRepos)).unwrap();
        keys.rotate().unwrap();
        log.append(draft(AuditAction::EvaluateIssue)).unwrap();
        // First entry verifies via the previous key, second via the current.
        assert_eq!(log.verify_chain().unwrap(), 2);
    }

    #[test]
    fn test_verify_chain_detects_tampered_entry() {
        let (store, log) = log();
        log.append(draft(AuditAction::PollRepos)).unwrap();
        log.append(draft(AuditAction::EvaluateIssue)).unwrap();
        log.append(draft(AuditAction::CreatePr)).unwrap();

        // Doctor the second entry's decision in place.
        let key = format!("{}00000002", ENTRY_PREFIX);
        let raw = store.get(&key).unwrap().unwrap();
        let doctored = raw.replace("\"ok\"", "\"BLOCKED\"");
        assert_ne!(raw, doctored);
        store.put(&key, &doctored).unwrap();

        let err = log.verify_chain().unwrap_err();
        match err {
            CryptoError::AuditChainBroken { id, .. } => assert_eq!(id, "00000002"),
            other => panic!("Expected AuditChainBroken, got {:?}", other),
        }
    }

    #[test]
    fn test_verify_chain_detects_deleted_entry() {
        let (store, log) = log();
        log.append(draft(AuditAction::PollRepos)).unwrap();
        log.append(draft(AuditAction::EvaluateIssue)).unwrap();
        store.delete(&format!("{}00000001", ENTRY_PREFIX)).unwrap();

        assert!(log.verify_chain().is_err());
    }

    #[test]
    fn test_counter_survives_reopen() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new_in_memory().unwrap());
        let keys = Arc::new(KeyManager::init(store.clone()).unwrap());
        {
            let log = AuditLog::open(store.clone(), keys.clone()).unwrap();
            log.append(draft(AuditAction::PollRepos)).unwrap();
        }
        let log = AuditLog::open(store, keys).unwrap();
        let entry = log.append(draft(AuditAction::EvaluateIssue)).unwrap();
        assert_eq!(entry.id, "00000002");
        assert_eq!(log.verify_chain().unwrap(), 2);
    }

    #[test]
    fn test_entries_ordered_oldest_first() {
        let (_, log) = log();
        log.append(draft(AuditAction::PollRepos)).unwrap();
        log.append(draft(AuditAction::CreatePr)).unwrap();
        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, AuditAction::PollRepos);
        assert_eq!(entries[1].action, AuditAction::CreatePr);
    }

    #[test]
    fn test_audit_action_roundtrip() {
        for s in &[
            "poll_repos",
            "evaluate_issue",
            "create_branch",
            "push_code",
            "ci_check",
            "create_pr",
            "acknowledge_review",
            "moderate_comment",
            "detect_edit",
            "analyze_competing",
            "plan_synthesis",
            "disengage_chain",
            "rotate_key",
            "emergency_stop",
        ] {
            let parsed: AuditAction = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("merge_pr".parse::<AuditAction>().is_err());
    }
}
