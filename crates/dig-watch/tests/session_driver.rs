use async_trait::async_trait;
use dig_core::wire::{PushEvent, PushEventKind};
use dig_core::{InvestigationRecord, InvestigationStatus, LogEntry};
use dig_watch::pull::{FetchError, PullSource};
use dig_watch::push::{LinkState, PushCommand, PushHandle, PushSignal};
use dig_watch::reconciler::Reconciler;
use dig_watch::session::{run_session, SessionConfig, SessionOutcome};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const ID: &str = "inv-9";

/// Replays scripted responses; the last one repeats once the script runs out.
struct ScriptedPull {
    records: Mutex<VecDeque<Result<InvestigationRecord, FetchError>>>,
    logs: Mutex<VecDeque<Vec<LogEntry>>>,
    investigation_calls: AtomicUsize,
}

impl ScriptedPull {
    fn new(records: Vec<Result<InvestigationRecord, FetchError>>, logs: Vec<Vec<LogEntry>>) -> Self {
        Self {
            records: Mutex::new(records.into()),
            logs: Mutex::new(logs.into()),
            investigation_calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.investigation_calls.load(Ordering::SeqCst)
    }
}

fn next<T: Clone>(queue: &Mutex<VecDeque<T>>) -> T {
    let mut queue = queue.lock().expect("script lock");
    if queue.len() > 1 {
        queue.pop_front().expect("non-empty script")
    } else {
        queue.front().cloned().expect("non-empty script")
    }
}

#[async_trait]
impl PullSource for ScriptedPull {
    async fn fetch_investigation(&self, id: &str) -> Result<InvestigationRecord, FetchError> {
        assert_eq!(id, ID);
        self.investigation_calls.fetch_add(1, Ordering::SeqCst);
        next(&self.records)
    }

    async fn fetch_logs(&self, _id: &str) -> Result<Vec<LogEntry>, FetchError> {
        Ok(next(&self.logs))
    }
}

fn record(status: &str, confidence: Option<u8>) -> Result<InvestigationRecord, FetchError> {
    Ok(InvestigationRecord {
        id: ID.to_string(),
        repo_url: "https://github.com/acme/search".to_string(),
        status: InvestigationStatus::from(status),
        confidence,
        findings: Value::Null,
        report: None,
        created_at: None,
        completed_at: None,
    })
}

fn session_config() -> SessionConfig {
    SessionConfig {
        investigation_id: ID.to_string(),
        poll_interval: Duration::from_millis(2000),
        exit_when_settled: true,
    }
}

fn event(name: &str, payload: Value) -> PushSignal {
    PushSignal::Event(
        PushEvent::from_event(name, payload)
            .expect("valid payload")
            .expect("known event"),
    )
}

fn drain(commands: &mut mpsc::Receiver<PushCommand>) -> Vec<PushCommand> {
    let mut seen = Vec::new();
    while let Ok(command) = commands.try_recv() {
        seen.push(command);
    }
    seen
}

#[tokio::test(start_paused = true)]
async fn polls_until_the_job_completes() {
    let pull = Arc::new(ScriptedPull::new(
        vec![
            record("pending", None),
            record("processing", Some(35)),
            record("completed", Some(81)),
        ],
        vec![
            Vec::new(),
            vec![LogEntry::new("scout", "Scout activated")],
            vec![
                LogEntry::new("scout", "Scout activated"),
                LogEntry::new("analyst", "Analysis complete: leaked connection pool"),
            ],
        ],
    ));
    let (mut reconciler, rx) = Reconciler::new();

    let outcome = run_session(
        &mut reconciler,
        pull.clone(),
        None,
        session_config(),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(outcome, SessionOutcome::Settled);
    assert_eq!(pull.calls(), 3);
    assert!(!reconciler.is_subscribed());

    let last = rx.borrow().clone().expect("final snapshot");
    assert_eq!(last.status, InvestigationStatus::Completed);
    assert_eq!(last.confidence, 81);
    assert_eq!(last.hypothesis, "leaked connection pool");
    assert_eq!(last.push_link, LinkState::Offline);
}

#[tokio::test(start_paused = true)]
async fn failed_fetch_is_retried_on_next_tick() {
    let pull = Arc::new(ScriptedPull::new(
        vec![
            Err(FetchError::Transport("connection refused".to_string())),
            record("completed", Some(60)),
        ],
        vec![Vec::new()],
    ));
    let (mut reconciler, rx) = Reconciler::new();

    let outcome = run_session(
        &mut reconciler,
        pull.clone(),
        None,
        session_config(),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(outcome, SessionOutcome::Settled);
    assert_eq!(pull.calls(), 2);
    assert_eq!(
        rx.borrow().as_ref().map(|snapshot| snapshot.confidence),
        Some(60)
    );
}

#[tokio::test(start_paused = true)]
async fn push_completion_settles_the_session() {
    let pull = Arc::new(ScriptedPull::new(
        vec![record("completed", Some(77))],
        vec![vec![LogEntry::new("narrator", "Report ready")]],
    ));
    let (command_tx, mut command_rx) = mpsc::channel(16);
    let (signal_tx, signal_rx) = mpsc::channel(16);
    signal_tx
        .send(PushSignal::Link(LinkState::Online))
        .await
        .expect("queue link");
    signal_tx
        .send(event(
            "agent_message",
            json!({"investigation_id": ID, "agent_name": "narrator", "message": "Writing"}),
        ))
        .await
        .expect("queue message");
    signal_tx
        .send(event("investigation_complete", json!({"investigation_id": ID})))
        .await
        .expect("queue completion");

    let (mut reconciler, rx) = Reconciler::new();
    let outcome = run_session(
        &mut reconciler,
        pull.clone(),
        Some((PushHandle::new(command_tx), signal_rx)),
        session_config(),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(outcome, SessionOutcome::Settled);
    assert!((1..=2).contains(&pull.calls()));

    let last = rx.borrow().clone().expect("final snapshot");
    assert_eq!(last.status, InvestigationStatus::Completed);
    assert_eq!(last.confidence, 77);
    assert_eq!(last.push_link, LinkState::Online);

    let commands = drain(&mut command_rx);
    let mut expected: Vec<PushCommand> = PushEventKind::ALL
        .into_iter()
        .map(PushCommand::On)
        .collect();
    expected.push(PushCommand::Subscribe(ID.to_string()));
    expected.push(PushCommand::Unsubscribe(ID.to_string()));
    assert_eq!(commands, expected);
    drop(signal_tx);
}

#[tokio::test(start_paused = true)]
async fn closed_push_channel_falls_back_to_polling() {
    let pull = Arc::new(ScriptedPull::new(
        vec![record("processing", Some(20)), record("failed", Some(0))],
        vec![Vec::new()],
    ));
    let (command_tx, _command_rx) = mpsc::channel(16);
    let (signal_tx, signal_rx) = mpsc::channel::<PushSignal>(16);
    drop(signal_tx);

    let (mut reconciler, rx) = Reconciler::new();
    let outcome = run_session(
        &mut reconciler,
        pull.clone(),
        Some((PushHandle::new(command_tx), signal_rx)),
        session_config(),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(outcome, SessionOutcome::Settled);
    let last = rx.borrow().clone().expect("final snapshot");
    assert_eq!(last.status, InvestigationStatus::Failed);
    assert_eq!(last.confidence, 20);
    assert_eq!(last.push_link, LinkState::Offline);
}

#[tokio::test(start_paused = true)]
async fn cancellation_ends_an_unfinished_session() {
    let pull = Arc::new(ScriptedPull::new(
        vec![record("processing", Some(10))],
        vec![Vec::new()],
    ));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(7_000)).await;
        trigger.cancel();
    });

    let (mut reconciler, _rx) = Reconciler::new();
    let outcome = run_session(&mut reconciler, pull.clone(), None, session_config(), cancel).await;

    assert_eq!(outcome, SessionOutcome::Cancelled);
    // Ticks at 0s, 2s, 4s and 6s.
    assert_eq!(pull.calls(), 4);
    assert!(!reconciler.is_subscribed());
}
