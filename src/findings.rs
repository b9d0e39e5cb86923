use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{platform::Platform, rules::Confidence};

/// Longest matched text carried on a finding; anything beyond is truncated.
pub const MAX_MATCH_LEN: usize = 1024;

/// Bytes of surrounding context captured on each side of a match.
pub const CONTEXT_WINDOW: usize = 50;

/// Outcome of the verification stage for a single finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verified {
    /// No verifier for the rule, verification disabled, or the probe failed.
    Unknown,
    /// The credential authenticated against the live service.
    Valid,
    /// The live service rejected the credential.
    Invalid,
}

/// Where a finding came from on the remote instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub platform: Platform,
    pub project_path: String,
    pub job_id: String,
    pub job_name: String,
    pub job_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    /// Outermost-first chain of archive names leading to the scanned entry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_chain: Option<Vec<String>>,
}

/// A single candidate or confirmed secret emitted by the detector.
///
/// Findings are immutable once constructed; the reporter consumes them as-is.
#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    pub rule_name: Arc<str>,
    pub confidence: Confidence,
    pub matched_text: String,
    pub redacted_text: String,
    pub context_before: String,
    pub context_after: String,
    pub location: Location,
    pub verified: Verified,
}

static ANSI_ESCAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b(?:\[[0-9;?]*[ -/]*[@-~]|\][^\x07\x1b]*(?:\x07|\x1b\\)|[@-Z\\-_])").expect("ANSI escape pattern is valid"));

/// Normalize raw context bytes for reporting: decode lossily, strip ANSI
/// escape sequences, and fold every remaining control character (newlines
/// included) into a single space.
pub fn clean_context(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let stripped = ANSI_ESCAPE.replace_all(&text, "");
    stripped
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect()
}

/// Truncate matched bytes to `MAX_MATCH_LEN` at a char boundary and decode.
pub fn truncate_match(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    if text.len() <= MAX_MATCH_LEN {
        return text.into_owned();
    }
    let mut cut = MAX_MATCH_LEN;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text[..cut].to_owned()
}

/// Mask a matched secret for display: keep a short recognizable prefix and
/// the length, hide the rest.
pub fn redact(matched: &str) -> String {
    const VISIBLE: usize = 6;
    let visible: String = matched.chars().take(VISIBLE).collect();
    let hidden = matched.chars().count().saturating_sub(VISIBLE);
    if hidden == 0 {
        return "*".repeat(visible.chars().count());
    }
    format!("{visible}{}", "*".repeat(hidden.min(32)))
}
