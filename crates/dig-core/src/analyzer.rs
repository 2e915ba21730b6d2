//! Best-effort signal extraction from free-text agent narration.
//!
//! The producer's wording is not under this crate's control, so every
//! extractor is a pattern search rather than a parser. A message that
//! matches nothing yields an empty [`Signals`]; that is a normal outcome.

use crate::{AgentName, LogEntry, MAX_CONFIDENCE};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

pub const HYPOTHESIS_PREFIX: &str = "Analysis complete: ";
const ROUND_TOKEN: &str = "activated";
const SOURCE_TOKENS: [&str; 2] = ["Scraping", "sources"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signals {
    pub confidence: Option<u8>,
    pub commit_count: Option<u32>,
    pub source_discovered: bool,
    pub round_completed: bool,
    pub hypothesis: Option<String>,
}

fn confidence_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)confidence[:\s]+(\d+)%?").expect("valid regex"))
}

fn commits_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"([0-9]+)\s*commits").expect("valid regex"))
}

pub fn analyze_entry(entry: &LogEntry) -> Signals {
    analyze(&entry.agent, &entry.message, entry.data.as_ref())
}

/// A confidence stated in the message text takes precedence over one carried
/// in `data` for the same entry.
pub fn analyze(agent: &AgentName, message: &str, data: Option<&Value>) -> Signals {
    Signals {
        confidence: confidence_from_text(message).or_else(|| data.and_then(confidence_from_data)),
        commit_count: commit_count(message),
        source_discovered: is_source_marker(message),
        round_completed: is_round_marker(agent, message),
        hypothesis: hypothesis(agent, message).map(str::to_string),
    }
}

/// First `confidence: NN` capture in the message. Captures that do not fit
/// in 0..=100 are ignored rather than clamped.
pub fn confidence_from_text(message: &str) -> Option<u8> {
    let captures = confidence_pattern().captures(message)?;
    let value = captures.get(1)?.as_str().parse::<u32>().ok()?;
    u8::try_from(value)
        .ok()
        .filter(|value| *value <= MAX_CONFIDENCE)
}

pub fn confidence_from_data(data: &Value) -> Option<u8> {
    let value = data.get("confidence")?.as_f64()?;
    if !value.is_finite() || value < 0.0 || value > f64::from(MAX_CONFIDENCE) {
        return None;
    }
    Some(value.round() as u8)
}

pub fn commit_count(message: &str) -> Option<u32> {
    if !message.contains("commits") {
        return None;
    }
    let digits = commits_pattern().captures(message)?.get(1)?.as_str();
    // The capture is ASCII digits, so parsing fails only on overflow.
    Some(digits.parse::<u32>().unwrap_or(u32::MAX))
}

pub fn is_source_marker(message: &str) -> bool {
    SOURCE_TOKENS.iter().any(|token| message.contains(token))
}

pub fn is_round_marker(agent: &AgentName, message: &str) -> bool {
    *agent == AgentName::Scout && message.contains(ROUND_TOKEN)
}

pub fn hypothesis<'a>(agent: &AgentName, message: &'a str) -> Option<&'a str> {
    if *agent != AgentName::Analyst {
        return None;
    }
    message.strip_prefix(HYPOTHESIS_PREFIX)
}
