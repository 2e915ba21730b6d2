use crate::analyzer::analyze_entry;
use crate::LogEntry;
use serde::{Deserialize, Serialize};

pub const MAX_COMMITS: u32 = 200;
pub const MAX_SOURCES: u32 = 10;
pub const MAX_ROUNDS: u32 = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressMetrics {
    pub commits_analyzed: u32,
    pub sources_found: u32,
    pub rounds_completed: u32,
}

/// Everything a full pass over the log set yields. Recomputed from scratch
/// on every call, so the same input always produces the same digest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogDigest {
    pub metrics: ProgressMetrics,
    /// Last confidence signal in sequence order.
    pub confidence: Option<u8>,
    /// Last hypothesis in sequence order.
    pub hypothesis: Option<String>,
}

pub fn accumulate(logs: &[LogEntry]) -> ProgressMetrics {
    digest(logs).metrics
}

pub fn digest(logs: &[LogEntry]) -> LogDigest {
    let mut commits = 0u32;
    let mut sources = 0u32;
    let mut rounds = 0u32;
    let mut confidence = None;
    let mut hypothesis = None;

    for entry in logs {
        let signals = analyze_entry(entry);
        if let Some(count) = signals.commit_count {
            commits = count;
        }
        if signals.source_discovered {
            sources = sources.saturating_add(1);
        }
        if signals.round_completed {
            rounds = rounds.saturating_add(1);
        }
        if signals.confidence.is_some() {
            confidence = signals.confidence;
        }
        if signals.hypothesis.is_some() {
            hypothesis = signals.hypothesis;
        }
    }

    LogDigest {
        metrics: ProgressMetrics {
            commits_analyzed: commits.min(MAX_COMMITS),
            sources_found: sources.min(MAX_SOURCES),
            rounds_completed: rounds.min(MAX_ROUNDS),
        },
        confidence,
        hypothesis,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AgentName;

    fn entry(agent: &str, message: &str) -> LogEntry {
        LogEntry::new(AgentName::from(agent), message)
    }

    #[test]
    fn empty_sequence_is_all_zero() {
        let digest = digest(&[]);
        assert_eq!(digest.metrics, ProgressMetrics::default());
        assert_eq!(digest.confidence, None);
        assert_eq!(digest.hypothesis, None);
    }

    #[test]
    fn counters_clamp_at_display_ceilings() {
        let mut logs = vec![entry("scout", "Analyzed 950 commits")];
        for round in 0..5 {
            logs.push(entry("scout", &format!("Scout activated (round {round})")));
        }
        for page in 0..14 {
            logs.push(entry("scout", &format!("Scraping page {page}")));
        }
        let metrics = accumulate(&logs);
        assert_eq!(metrics.commits_analyzed, MAX_COMMITS);
        assert_eq!(metrics.sources_found, MAX_SOURCES);
        assert_eq!(metrics.rounds_completed, MAX_ROUNDS);
    }

    #[test]
    fn overflowing_commit_count_still_clamps() {
        let logs = vec![
            entry("scout", "Found 10 commits"),
            entry("scout", "Found 5000000000 commits"),
        ];
        assert_eq!(accumulate(&logs).commits_analyzed, MAX_COMMITS);
    }

    #[test]
    fn last_commit_count_and_hypothesis_win() {
        let logs = vec![
            entry("scout", "Found 30 commits"),
            entry("analyst", "Analysis complete: first guess"),
            entry("scout", "Found 25 commits after dedup"),
            entry("analyst", "Analysis complete: second guess"),
        ];
        let digest = digest(&logs);
        assert_eq!(digest.metrics.commits_analyzed, 25);
        assert_eq!(digest.hypothesis.as_deref(), Some("second guess"));
    }

    #[test]
    fn last_confidence_signal_wins_across_entries() {
        let logs = vec![
            entry("analyst", "Confidence: 40%"),
            entry("narrator", "writing"),
            entry("analyst", "confidence 66"),
        ];
        assert_eq!(digest(&logs).confidence, Some(66));

        let mut with_data = logs.clone();
        with_data.push(entry("analyst", "scored").with_data(serde_json::json!({"confidence": 71.2})));
        assert_eq!(digest(&with_data).confidence, Some(71));
    }

    #[test]
    fn repeated_calls_are_identical() {
        let logs = vec![
            entry("coordinator", "Coordinator activated"),
            entry("scout", "Scout activated"),
            entry("scout", "Scraping github.com"),
            entry("scout", "Found 12 commits"),
        ];
        assert_eq!(digest(&logs), digest(&logs));
    }

    #[test]
    fn appending_entries_never_lowers_event_counters() {
        let base = vec![
            entry("scout", "Scout activated"),
            entry("scout", "Scraping github.com"),
            entry("scout", "Found 10 commits"),
        ];
        let before = accumulate(&base);

        let mut grown = base.clone();
        grown.push(entry("scout", "Scout activated"));
        grown.push(entry("narrator", "Cross-checking sources"));
        grown.push(entry("scout", "Found 18 commits"));
        let after = accumulate(&grown);

        assert!(after.sources_found >= before.sources_found);
        assert!(after.rounds_completed >= before.rounds_completed);
        assert!(after.commits_analyzed >= before.commits_analyzed);
    }
}
