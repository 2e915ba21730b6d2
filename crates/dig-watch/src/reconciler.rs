//! Single writer of the canonical investigation state.
//!
//! Two unreliable channels feed this module: push events arrive fast and are
//! applied optimistically; pull snapshots arrive on a timer and are
//! authoritative for logs and derived state. Every applied update publishes
//! a fresh [`DashboardSnapshot`] on a watch channel.

use crate::pull::{FetchError, PullSnapshot};
use crate::push::LinkState;
use chrono::Utc;
use dig_core::activity::{self, AgentActivity, AgentBoard};
use dig_core::metrics::{self, ProgressMetrics};
use dig_core::wire::PushEvent;
use dig_core::{ConfidenceBand, InvestigationRecord, InvestigationStatus, LogEntry};
use serde::Serialize;
use std::fmt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardSnapshot {
    pub investigation_id: String,
    pub revision: u64,
    pub status: InvestigationStatus,
    pub confidence: u8,
    pub confidence_band: ConfidenceBand,
    pub logs: Vec<LogEntry>,
    pub metrics: ProgressMetrics,
    pub agent_status: AgentBoard,
    pub hypothesis: String,
    pub push_link: LinkState,
    pub error: Option<String>,
    pub record: Option<InvestigationRecord>,
}

impl fmt::Display for DashboardSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} confidence {}% ({}) | commits {}/{} sources {}/{} rounds {}/{} |",
            self.investigation_id,
            self.status,
            self.confidence,
            self.confidence_band.as_str(),
            self.metrics.commits_analyzed,
            metrics::MAX_COMMITS,
            self.metrics.sources_found,
            metrics::MAX_SOURCES,
            self.metrics.rounds_completed,
            metrics::MAX_ROUNDS,
        )?;
        for (agent, state) in self.agent_status.entries() {
            if agent == "other" && state == AgentActivity::Idle {
                continue;
            }
            write!(f, " {agent}:{}", state.as_str())?;
        }
        write!(f, " | push {}", self.push_link.as_str())?;
        if !self.hypothesis.is_empty() {
            write!(f, " | hypothesis: {}", self.hypothesis)?;
        }
        if let Some(error) = &self.error {
            write!(f, " | error: {error}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullKind {
    /// Regular timer-driven cycle.
    Poll,
    /// The one fetch made after a terminal status arrives over push.
    Settle,
}

/// Identifies which subscription asked for a pull. Results are only applied
/// while that subscription is still live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullTicket {
    pub investigation_id: String,
    pub epoch: u64,
    pub kind: PullKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    Applied,
    Failed,
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub investigation_id: String,
    pub epoch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settle {
    Idle,
    Requested,
    InFlight,
}

#[derive(Debug)]
struct LiveState {
    investigation_id: String,
    status: InvestigationStatus,
    confidence: u8,
    logs: Vec<LogEntry>,
    metrics: ProgressMetrics,
    agent_status: AgentBoard,
    hypothesis: Option<String>,
    push_link: LinkState,
    error: Option<String>,
    record: Option<InvestigationRecord>,
    settle: Settle,
}

impl LiveState {
    fn new(investigation_id: String, push_link: LinkState) -> Self {
        Self {
            investigation_id,
            status: InvestigationStatus::Pending,
            confidence: 0,
            logs: Vec::new(),
            metrics: ProgressMetrics::default(),
            agent_status: AgentBoard::default(),
            hypothesis: None,
            push_link,
            error: None,
            record: None,
            settle: Settle::Idle,
        }
    }

    fn is_converged(&self) -> bool {
        self.status.is_terminal() && self.settle == Settle::Idle
    }

    /// First terminal status wins; later ones are ignored.
    fn enter_terminal(&mut self, status: InvestigationStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.agent_status = activity::derive(&self.logs, &self.status);
        true
    }

    fn apply_snapshot(&mut self, snapshot: PullSnapshot) {
        let PullSnapshot { record, logs } = snapshot;
        let digest = metrics::digest(&logs);

        if !self.status.is_terminal() {
            self.status = record.status.clone();
        }
        if let Some(value) = digest.confidence.filter(|value| *value > 0) {
            self.confidence = value;
        }
        match record.confidence {
            Some(value) if value > 0 => self.confidence = value,
            Some(_) if record.status == InvestigationStatus::Completed => self.confidence = 0,
            _ => {}
        }

        self.logs = logs;
        self.metrics = digest.metrics;
        self.hypothesis = digest.hypothesis;
        self.agent_status = activity::derive(&self.logs, &self.status);
        self.record = Some(record);
    }
}

pub struct Reconciler {
    epoch: u64,
    revision: u64,
    push_link: LinkState,
    live: Option<LiveState>,
    publisher: watch::Sender<Option<DashboardSnapshot>>,
}

impl Reconciler {
    pub fn new() -> (Self, watch::Receiver<Option<DashboardSnapshot>>) {
        let (publisher, receiver) = watch::channel(None);
        let reconciler = Self {
            epoch: 0,
            revision: 0,
            push_link: LinkState::default(),
            live: None,
            publisher,
        };
        (reconciler, receiver)
    }

    /// Starts tracking `investigation_id` from a blank state, replacing any
    /// previous subscription.
    pub fn subscribe(&mut self, investigation_id: &str) -> Subscription {
        self.epoch += 1;
        self.live = Some(LiveState::new(investigation_id.to_string(), self.push_link));
        info!(event = "subscribed", investigation_id, epoch = self.epoch);
        self.publish();
        Subscription {
            investigation_id: investigation_id.to_string(),
            epoch: self.epoch,
        }
    }

    /// Drops canonical state. Observers keep the last published snapshot.
    pub fn unsubscribe(&mut self) {
        if let Some(live) = self.live.take() {
            self.epoch += 1;
            info!(event = "unsubscribed", investigation_id = %live.investigation_id);
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.live.is_some()
    }

    pub fn should_poll(&self) -> bool {
        self.live
            .as_ref()
            .is_some_and(|live| !live.status.is_terminal())
    }

    /// Terminal with no settle fetch outstanding.
    pub fn is_settled(&self) -> bool {
        self.live.as_ref().is_some_and(LiveState::is_converged)
    }

    pub fn poll_ticket(&self) -> Option<PullTicket> {
        if !self.should_poll() {
            return None;
        }
        self.ticket(PullKind::Poll)
    }

    /// Hands out the settle fetch at most once per terminal transition.
    pub fn take_settle_ticket(&mut self) -> Option<PullTicket> {
        let live = self.live.as_mut()?;
        if live.settle != Settle::Requested {
            return None;
        }
        live.settle = Settle::InFlight;
        self.ticket(PullKind::Settle)
    }

    fn ticket(&self, kind: PullKind) -> Option<PullTicket> {
        self.live.as_ref().map(|live| PullTicket {
            investigation_id: live.investigation_id.clone(),
            epoch: self.epoch,
            kind,
        })
    }

    pub fn apply_pull(
        &mut self,
        ticket: &PullTicket,
        result: Result<PullSnapshot, FetchError>,
    ) -> PullOutcome {
        let epoch = self.epoch;
        let Some(live) = self.live.as_mut() else {
            debug!(event = "pull_discarded", reason = "unsubscribed");
            return PullOutcome::Stale;
        };
        if ticket.epoch != epoch || ticket.investigation_id != live.investigation_id {
            debug!(
                event = "pull_discarded",
                reason = "stale_epoch",
                ticket_epoch = ticket.epoch,
                epoch
            );
            return PullOutcome::Stale;
        }
        match ticket.kind {
            PullKind::Settle => live.settle = Settle::Idle,
            // Poll tickets are only issued before the terminal status.
            PullKind::Poll if live.is_converged() => {
                debug!(event = "pull_discarded", reason = "converged", epoch);
                return PullOutcome::Stale;
            }
            PullKind::Poll => {}
        }

        match result {
            Ok(snapshot) => {
                live.apply_snapshot(snapshot);
                self.publish();
                PullOutcome::Applied
            }
            Err(err) => {
                warn!(
                    event = "pull_fetch_error",
                    investigation_id = %live.investigation_id,
                    transient = err.is_transient(),
                    error = %err
                );
                PullOutcome::Failed
            }
        }
    }

    /// Returns whether the event changed canonical state.
    pub fn apply_push(&mut self, event: PushEvent) -> bool {
        let Some(live) = self.live.as_mut() else {
            return false;
        };
        if event.investigation_id() != live.investigation_id {
            debug!(
                event = "push_ignored",
                reason = "other_investigation",
                investigation_id = %event.investigation_id()
            );
            return false;
        }

        let applied = match event {
            PushEvent::AgentMessage(payload) => {
                if !live.status.is_terminal() {
                    live.agent_status
                        .set(&payload.agent_name, AgentActivity::Active);
                }
                live.logs.push(LogEntry {
                    agent: payload.agent_name,
                    message: payload.message,
                    data: payload.data,
                    timestamp: Some(Utc::now()),
                });
                true
            }
            PushEvent::ConfidenceUpdate(payload) => match payload.value() {
                Some(value) => {
                    live.confidence = value;
                    true
                }
                None => false,
            },
            PushEvent::InvestigationComplete(_) => {
                let entered = live.enter_terminal(InvestigationStatus::Completed);
                if entered {
                    live.settle = Settle::Requested;
                }
                entered
            }
            PushEvent::InvestigationError(payload) => {
                let entered = live.enter_terminal(InvestigationStatus::Failed);
                if entered {
                    live.error = payload.error;
                    live.settle = Settle::Requested;
                }
                entered
            }
        };
        if applied {
            self.publish();
        }
        applied
    }

    /// Display-only; never touches canonical state.
    pub fn set_push_link(&mut self, state: LinkState) {
        if self.push_link == state {
            return;
        }
        self.push_link = state;
        if let Some(live) = self.live.as_mut() {
            live.push_link = state;
            self.publish();
        }
    }

    pub fn snapshot(&self) -> Option<DashboardSnapshot> {
        let live = self.live.as_ref()?;
        Some(DashboardSnapshot {
            investigation_id: live.investigation_id.clone(),
            revision: self.revision,
            status: live.status.clone(),
            confidence: live.confidence,
            confidence_band: ConfidenceBand::of(live.confidence),
            logs: live.logs.clone(),
            metrics: live.metrics,
            agent_status: live.agent_status,
            hypothesis: live.hypothesis.clone().unwrap_or_default(),
            push_link: live.push_link,
            error: live.error.clone(),
            record: live.record.clone(),
        })
    }

    fn publish(&mut self) {
        self.revision += 1;
        let snapshot = self.snapshot();
        self.publisher.send_replace(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dig_core::wire::EVENT_INVESTIGATION_COMPLETE;
    use serde_json::json;

    fn record(status: &str, confidence: Option<u8>) -> InvestigationRecord {
        InvestigationRecord {
            id: "inv-1".to_string(),
            repo_url: "https://github.com/acme/app".to_string(),
            status: InvestigationStatus::from(status),
            confidence,
            findings: serde_json::Value::Null,
            report: None,
            created_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn subscribe_publishes_blank_state() {
        let (mut reconciler, rx) = Reconciler::new();
        reconciler.subscribe("inv-1");
        let snapshot = rx.borrow().clone().expect("published");
        assert_eq!(snapshot.status, InvestigationStatus::Pending);
        assert_eq!(snapshot.confidence, 0);
        assert!(snapshot.logs.is_empty());
        assert_eq!(snapshot.hypothesis, "");
    }

    #[test]
    fn display_line_lists_agents_and_hypothesis() {
        let (mut reconciler, _rx) = Reconciler::new();
        let subscription = reconciler.subscribe("inv-1");
        let ticket = PullTicket {
            investigation_id: subscription.investigation_id,
            epoch: subscription.epoch,
            kind: PullKind::Poll,
        };
        reconciler.apply_pull(
            &ticket,
            Ok(PullSnapshot {
                record: record("processing", Some(64)),
                logs: vec![LogEntry::new("analyst", "Analysis complete: stale cache")],
            }),
        );
        let line = reconciler.snapshot().expect("snapshot").to_string();
        assert!(line.starts_with("[inv-1] processing confidence 64% (moderate)"));
        assert!(line.contains("analyst:active"));
        assert!(!line.contains("other:"));
        assert!(line.ends_with("| push connecting | hypothesis: stale cache"));
    }

    #[test]
    fn settle_ticket_is_handed_out_once() {
        let (mut reconciler, _rx) = Reconciler::new();
        reconciler.subscribe("inv-1");
        let complete = PushEvent::from_event(
            EVENT_INVESTIGATION_COMPLETE,
            json!({"investigation_id": "inv-1"}),
        )
        .expect("typed")
        .expect("known");
        assert!(reconciler.apply_push(complete.clone()));
        assert!(!reconciler.is_settled());

        let ticket = reconciler.take_settle_ticket().expect("settle ticket");
        assert_eq!(ticket.kind, PullKind::Settle);
        assert_eq!(reconciler.take_settle_ticket(), None);

        assert!(!reconciler.apply_push(complete));
        assert_eq!(reconciler.take_settle_ticket(), None);

        let outcome = reconciler.apply_pull(&ticket, Err(FetchError::Transport("reset".into())));
        assert_eq!(outcome, PullOutcome::Failed);
        assert!(reconciler.is_settled());
    }

    #[test]
    fn link_state_survives_resubscribe() {
        let (mut reconciler, _rx) = Reconciler::new();
        reconciler.set_push_link(LinkState::Online);
        reconciler.subscribe("inv-1");
        assert_eq!(
            reconciler.snapshot().expect("snapshot").push_link,
            LinkState::Online
        );
    }
}
