//! Input sanitizer: the first thing that happens to any untrusted string.
//!
//! Order matters: HTML comments go first (they hide payloads from human
//! reviewers), then invisible characters (they hide payloads from regex),
//! then the injection catalog, then base64 detection, then truncation.
//! The output is idempotent: sanitizing sanitized text changes nothing.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Maximum characters forwarded to any LLM prompt.
pub const MAX_INPUT_CHARS: usize = 4000;

const TRUNCATION_MARKER: &str = "\n[truncated]";
const HTML_COMMENT_TOKEN: &str = "[html-comment-removed]";

static HTML_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").expect("valid regex"));

static INVISIBLE_CHARS: LazyLock<Regex> = LazyLock::new(|| {
    // Zero-width and joiner characters, bidi controls, BOM, the
    // replacement character, soft hyphen, and line/paragraph separators.
    Regex::new(
        "[\u{200B}\u{200C}\u{200D}\u{2060}\u{FEFF}\u{202A}-\u{202E}\u{2066}-\u{2069}\u{FFFD}\u{00AD}\u{2028}\u{2029}]",
    )
    .expect("valid regex")
});

static BASE64_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9+/=]{101,}").expect("valid regex"));

/// The injection catalog. Each pattern is replaced by
/// `[REDACTED:<name>]` and the name recorded as evidence.
static INJECTION_CATALOG: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    let patterns: &[(&str, &str)] = &[
        // Direct instruction overrides
        ("instruction_override", r"(?i)ignore\s+(?:all\s+)?(?:previous|prior|above)\s+instructions"),
        ("instruction_override", r"(?i)disregard\s+(?:all\s+)?previous"),
        ("instruction_override", r"(?i)forget\s+(?:your\s+|all\s+)?instructions"),
        ("instruction_override", r"(?i)override\s+(?:the\s+)?system\s+prompt"),
        ("instruction_override", r"(?i)new\s+instructions:"),
        // Role switches
        ("role_switch", r"(?i)you\s+are\s+now\s+an?\s"),
        ("role_switch", r"(?i)\bact\s+as\s+(?:if|an?)\b"),
        ("role_switch", r"(?i)pretend\s+to\s+be\b"),
        // Jailbreak markers
        ("jailbreak", r"\bDAN\b"),
        ("jailbreak", r"(?i)developer\s+mode"),
        ("jailbreak", r"(?i)do\s+anything\s+now"),
        ("jailbreak", r"(?i)\bjailbreak\b"),
        // Delimiter and special-token injections
        ("token_injection", r"<\|im_start\|>"),
        ("token_injection", r"<\|im_end\|>"),
        ("token_injection", r"<\|endoftext\|>"),
        ("token_injection", r"\[INST\]"),
        ("token_injection", r"<<SYS>>"),
        ("token_injection", r"(?im)^\s*(?:system|assistant|user):"),
        // Exfiltration
        ("exfiltration", r"(?i)reveal\s+your\s+system\s+prompt"),
        ("exfiltration", r"(?i)what\s+are\s+your\s+instructions"),
        // Privilege escalation
        ("privilege_escalation", r"(?i)merge\s+this\s+(?:pr|pull\s+request)"),
        ("privilege_escalation", r"(?i)delete\s+the\s+repo(?:sitory)?"),
        ("privilege_escalation", r"(?i)grant\s+me\s+access"),
        // Social engineering
        ("social_engineering", r"(?i)\bemergency\b"),
        ("social_engineering", r"(?i)urgent:"),
        ("social_engineering", r"(?i)i\s+am\s+the\s+owner"),
        ("social_engineering", r"(?i)trust\s+me\b"),
        ("social_engineering", r"(?i)i\s+authorized\s+this"),
    ];
    patterns
        .iter()
        .map(|(name, pattern)| (*name, Regex::new(pattern).expect("valid catalog regex")))
        .collect()
});

/// What the sanitizer did to one input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanitizeResult {
    pub sanitized: String,
    /// Catalog names, one per hit, in catalog order.
    pub stripped_patterns: Vec<String>,
    pub truncated: bool,
    pub original_length: usize,
}

impl SanitizeResult {
    /// True when any hit belongs to one of the named categories.
    pub fn has_any(&self, categories: &[&str]) -> bool {
        self.stripped_patterns
            .iter()
            .any(|name| categories.contains(&name.as_str()))
    }
}

/// Sanitize one untrusted string. The caller's original is untouched;
/// downstream code uses `sanitized` for LLM input and
/// `stripped_patterns` as threat evidence.
pub fn sanitize(input: &str) -> SanitizeResult {
    let original_length = input.chars().count();
    let mut stripped_patterns = Vec::new();

    let mut text = HTML_COMMENT.replace_all(input, HTML_COMMENT_TOKEN).into_owned();
    text = INVISIBLE_CHARS.replace_all(&text, "").into_owned();

    for (name, regex) in INJECTION_CATALOG.iter() {
        let replacement = format!("[REDACTED:{}]", name);
        let hits = regex.find_iter(&text).count();
        if hits > 0 {
            for _ in 0..hits {
                stripped_patterns.push(name.to_string());
            }
            text = regex.replace_all(&text, replacement.as_str()).into_owned();
        }
    }

    // Base64 blobs are evidence, not something to destroy: the payload may
    // be a legitimate attachment and is inert unless decoded.
    for _ in BASE64_RUN.find_iter(&text) {
        stripped_patterns.push("base64_blob".to_string());
    }

    let mut truncated = false;
    if text.chars().count() > MAX_INPUT_CHARS {
        let keep = MAX_INPUT_CHARS - TRUNCATION_MARKER.chars().count();
        let cut: String = text.chars().take(keep).collect();
        text = format!("{}{}", cut, TRUNCATION_MARKER);
        truncated = true;
    }

    SanitizeResult {
        sanitized: text,
        stripped_patterns,
        truncated,
        original_length,
    }
}
