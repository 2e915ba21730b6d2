pub mod activity;
pub mod analyzer;
pub mod metrics;
pub mod wire;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

pub const MAX_CONFIDENCE: u8 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum InvestigationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    /// Anything the backend reports that this client does not know about.
    /// Carried through to the display layer untouched and never terminal.
    Other(String),
}

impl Default for InvestigationStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl InvestigationStatus {
    pub fn as_str(&self) -> &str {
        match self {
            InvestigationStatus::Pending => "pending",
            InvestigationStatus::Processing => "processing",
            InvestigationStatus::Completed => "completed",
            InvestigationStatus::Failed => "failed",
            InvestigationStatus::Other(raw) => raw.as_str(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InvestigationStatus::Completed | InvestigationStatus::Failed
        )
    }
}

impl fmt::Display for InvestigationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl From<&str> for InvestigationStatus {
    fn from(input: &str) -> Self {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "pending" => InvestigationStatus::Pending,
            "processing" => InvestigationStatus::Processing,
            "completed" => InvestigationStatus::Completed,
            "failed" => InvestigationStatus::Failed,
            _ => InvestigationStatus::Other(input.to_string()),
        }
    }
}

impl From<String> for InvestigationStatus {
    fn from(input: String) -> Self {
        InvestigationStatus::from(input.as_str())
    }
}

impl From<InvestigationStatus> for String {
    fn from(status: InvestigationStatus) -> Self {
        match status {
            InvestigationStatus::Other(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

/// The workers of the investigation pipeline. Names outside the fixed set are
/// kept verbatim and grouped under the generic bucket by the activity deriver.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AgentName {
    Coordinator,
    Scout,
    Analyst,
    Narrator,
    Other(String),
}

impl AgentName {
    pub fn as_str(&self) -> &str {
        match self {
            AgentName::Coordinator => "coordinator",
            AgentName::Scout => "scout",
            AgentName::Analyst => "analyst",
            AgentName::Narrator => "narrator",
            AgentName::Other(raw) => raw.as_str(),
        }
    }
}

impl fmt::Display for AgentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl From<&str> for AgentName {
    fn from(input: &str) -> Self {
        match input {
            "coordinator" => AgentName::Coordinator,
            "scout" => AgentName::Scout,
            "analyst" => AgentName::Analyst,
            "narrator" => AgentName::Narrator,
            other => AgentName::Other(other.to_string()),
        }
    }
}

impl From<String> for AgentName {
    fn from(input: String) -> Self {
        AgentName::from(input.as_str())
    }
}

impl From<AgentName> for String {
    fn from(agent: AgentName) -> Self {
        match agent {
            AgentName::Other(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(rename = "agent_name", alias = "agent")]
    pub agent: AgentName,
    pub message: String,
    #[serde(default, deserialize_with = "deserialize_data")]
    pub data: Option<Value>,
    /// `None` when the row carries no usable timestamp.
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl LogEntry {
    pub fn new(agent: impl Into<AgentName>, message: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            message: message.into(),
            data: None,
            timestamp: Some(Utc::now()),
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Job record as served by the investigations API. Both the detail and the
/// list endpoints deserialize into this; the list omits `findings`/`report`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvestigationRecord {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub repo_url: String,
    #[serde(default)]
    pub status: InvestigationStatus,
    #[serde(default, deserialize_with = "deserialize_confidence")]
    pub confidence: Option<u8>,
    #[serde(default)]
    pub findings: Value,
    #[serde(default)]
    pub report: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceBand {
    Weak,
    Low,
    Moderate,
    High,
}

impl ConfidenceBand {
    pub fn of(confidence: u8) -> Self {
        match confidence {
            80..=u8::MAX => ConfidenceBand::High,
            60..=79 => ConfidenceBand::Moderate,
            40..=59 => ConfidenceBand::Low,
            _ => ConfidenceBand::Weak,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceBand::Weak => "weak",
            ConfidenceBand::Low => "low",
            ConfidenceBand::Moderate => "moderate",
            ConfidenceBand::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub completed: usize,
    pub in_flight: usize,
    pub failed: usize,
}

impl StatusSummary {
    pub fn tally<'a>(statuses: impl IntoIterator<Item = &'a InvestigationStatus>) -> Self {
        let mut summary = StatusSummary::default();
        for status in statuses {
            match status {
                InvestigationStatus::Completed => summary.completed += 1,
                InvestigationStatus::Failed => summary.failed += 1,
                InvestigationStatus::Pending | InvestigationStatus::Processing => {
                    summary.in_flight += 1
                }
                InvestigationStatus::Other(_) => {}
            }
        }
        summary
    }
}

/// Rounds and clamps a reported confidence into 0..=100. Non-finite values
/// carry no information and yield `None`.
pub fn clamp_confidence(value: f64) -> Option<u8> {
    if !value.is_finite() {
        return None;
    }
    Some(value.round().clamp(0.0, f64::from(MAX_CONFIDENCE)) as u8)
}

pub(crate) fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    match val {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom("expected string or number for id")),
    }
}

fn deserialize_confidence<'de, D>(deserializer: D) -> Result<Option<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(None),
        Value::Number(n) => Ok(n.as_f64().and_then(clamp_confidence)),
        Value::String(s) => Ok(s.trim().parse::<f64>().ok().and_then(clamp_confidence)),
        _ => Err(serde::de::Error::custom(
            "expected number, numeric string or null for confidence",
        )),
    }
}

// The backend stores `{}` for entries without side-channel data.
pub(crate) fn deserialize_data<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Option<Value> = Option::deserialize(deserializer)?;
    Ok(val.filter(|value| match value {
        Value::Null => false,
        Value::Object(map) => !map.is_empty(),
        _ => true,
    }))
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw
        .as_ref()
        .and_then(Value::as_str)
        .and_then(parse_timestamp))
}

/// Accepts RFC 3339 as well as the naive ISO form the backend emits for
/// UTC timestamps (no offset, optional fractional seconds).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(trimmed, format).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn status_round_trips_known_and_unknown_values() {
        let known: InvestigationStatus = serde_json::from_str("\"completed\"").expect("parse");
        assert_eq!(known, InvestigationStatus::Completed);
        assert!(known.is_terminal());

        let unknown: InvestigationStatus = serde_json::from_str("\"queued\"").expect("parse");
        assert_eq!(unknown, InvestigationStatus::Other("queued".to_string()));
        assert!(!unknown.is_terminal());
        assert_eq!(
            serde_json::to_string(&unknown).expect("serialize"),
            "\"queued\""
        );
    }

    #[test]
    fn log_entry_parses_backend_shape() {
        let entry: LogEntry = serde_json::from_str(
            r#"{
                "id": 41,
                "agent_name": "scout",
                "message": "Found 12 commits",
                "data": {},
                "timestamp": "2026-02-07T21:00:00.250000"
            }"#,
        )
        .expect("parse log entry");
        assert_eq!(entry.agent, AgentName::Scout);
        assert_eq!(entry.data, None);
        let timestamp = entry.timestamp.expect("timestamp");
        assert_eq!(timestamp.year(), 2026);
        assert_eq!(timestamp.second(), 0);
        assert_eq!(timestamp.nanosecond(), 250_000_000);
    }

    #[test]
    fn unusable_timestamps_do_not_reject_the_log_list() {
        let logs: Vec<LogEntry> = serde_json::from_str(
            r#"[
                {"agent_name":"scout","message":"Scout activated","timestamp":"2026-02-07T21:00:00"},
                {"agent_name":"scout","message":"Scraping github.com","timestamp":null},
                {"agent_name":"analyst","message":"Scoring","timestamp":"yesterday"},
                {"agent_name":"narrator","message":"Drafting"}
            ]"#,
        )
        .expect("parse log list");
        assert_eq!(logs.len(), 4);
        assert!(logs[0].timestamp.is_some());
        assert!(logs[1..].iter().all(|entry| entry.timestamp.is_none()));
    }

    #[test]
    fn log_entry_keeps_unknown_agent_verbatim() {
        let entry: LogEntry = serde_json::from_str(
            r#"{"agent_name":"auditor","message":"hi","timestamp":"2026-02-07T21:00:00Z"}"#,
        )
        .expect("parse log entry");
        assert_eq!(entry.agent, AgentName::Other("auditor".to_string()));
    }

    #[test]
    fn record_confidence_accepts_float_null_and_missing() {
        let float: InvestigationRecord =
            serde_json::from_str(r#"{"id":"a","status":"processing","confidence":71.6}"#)
                .expect("parse float");
        assert_eq!(float.confidence, Some(72));

        let null: InvestigationRecord =
            serde_json::from_str(r#"{"id":"a","status":"processing","confidence":null}"#)
                .expect("parse null");
        assert_eq!(null.confidence, None);

        let missing: InvestigationRecord =
            serde_json::from_str(r#"{"id":7,"status":"pending"}"#).expect("parse missing");
        assert_eq!(missing.id, "7");
        assert_eq!(missing.confidence, None);
    }

    #[test]
    fn clamp_confidence_bounds_values() {
        assert_eq!(clamp_confidence(140.0), Some(100));
        assert_eq!(clamp_confidence(-3.0), Some(0));
        assert_eq!(clamp_confidence(f64::NAN), None);
    }

    #[test]
    fn confidence_band_thresholds() {
        assert_eq!(ConfidenceBand::of(80), ConfidenceBand::High);
        assert_eq!(ConfidenceBand::of(79), ConfidenceBand::Moderate);
        assert_eq!(ConfidenceBand::of(40), ConfidenceBand::Low);
        assert_eq!(ConfidenceBand::of(39), ConfidenceBand::Weak);
    }

    #[test]
    fn status_summary_groups_in_flight() {
        let statuses = [
            InvestigationStatus::Pending,
            InvestigationStatus::Processing,
            InvestigationStatus::Completed,
            InvestigationStatus::Failed,
            InvestigationStatus::Other("archived".to_string()),
        ];
        let summary = StatusSummary::tally(statuses.iter());
        assert_eq!(
            summary,
            StatusSummary {
                completed: 1,
                in_flight: 2,
                failed: 1
            }
        );
    }
}
