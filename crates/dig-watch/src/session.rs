use crate::pull::{fetch_snapshot, FetchError, PullSnapshot, PullSource};
use crate::push::{LinkState, PushHandle, PushSignal};
use crate::reconciler::{PullKind, PullTicket, Reconciler};
use dig_core::wire::PushEventKind;
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const PULL_QUEUE_CAPACITY: usize = 8;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub investigation_id: String,
    pub poll_interval: Duration,
    /// Return as soon as the job is terminal and settled.
    pub exit_when_settled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Settled,
    Cancelled,
}

/// Push half as handed over by [`crate::push::connect`].
pub type PushLink = (PushHandle, mpsc::Receiver<PushSignal>);

type PullResult = (PullTicket, Result<PullSnapshot, FetchError>);

/// Drives one subscription: merges push signals and timed pulls into the
/// reconciler until the job settles or `cancel` fires. All state mutation
/// happens on this task.
pub async fn run_session(
    reconciler: &mut Reconciler,
    pull: Arc<dyn PullSource>,
    push: Option<PushLink>,
    config: SessionConfig,
    cancel: CancellationToken,
) -> SessionOutcome {
    let subscription = reconciler.subscribe(&config.investigation_id);
    let (push_handle, mut push_rx) = match push {
        Some((handle, rx)) => (Some(handle), Some(rx)),
        None => {
            reconciler.set_push_link(LinkState::Offline);
            (None, None)
        }
    };
    if let Some(handle) = &push_handle {
        for kind in PushEventKind::ALL {
            handle.on(kind);
        }
        handle.subscribe(&subscription.investigation_id);
    }

    let (pull_tx, mut pull_rx) = mpsc::channel::<PullResult>(PULL_QUEUE_CAPACITY);
    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut poll_in_flight = false;

    let outcome = loop {
        if let Some(ticket) = reconciler.take_settle_ticket() {
            spawn_pull(pull.clone(), ticket, pull_tx.clone());
        }
        if config.exit_when_settled && reconciler.is_settled() {
            break SessionOutcome::Settled;
        }

        tokio::select! {
            _ = cancel.cancelled() => break SessionOutcome::Cancelled,
            _ = ticker.tick(), if reconciler.should_poll() => {
                if poll_in_flight {
                    debug!(event = "poll_skipped", reason = "in_flight");
                } else if let Some(ticket) = reconciler.poll_ticket() {
                    poll_in_flight = true;
                    spawn_pull(pull.clone(), ticket, pull_tx.clone());
                }
            }
            Some((ticket, result)) = pull_rx.recv() => {
                if ticket.kind == PullKind::Poll {
                    poll_in_flight = false;
                }
                reconciler.apply_pull(&ticket, result);
            }
            signal = next_signal(&mut push_rx), if push_rx.is_some() => match signal {
                Some(PushSignal::Event(event)) => {
                    reconciler.apply_push(event);
                }
                Some(PushSignal::Link(state)) => reconciler.set_push_link(state),
                None => {
                    push_rx = None;
                    reconciler.set_push_link(LinkState::Offline);
                }
            },
        }
    };

    if let Some(handle) = &push_handle {
        handle.unsubscribe(&subscription.investigation_id);
    }
    reconciler.unsubscribe();
    info!(event = "session_finished", investigation_id = %subscription.investigation_id, outcome = ?outcome);
    outcome
}

async fn next_signal(rx: &mut Option<mpsc::Receiver<PushSignal>>) -> Option<PushSignal> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn spawn_pull(pull: Arc<dyn PullSource>, ticket: PullTicket, tx: mpsc::Sender<PullResult>) {
    debug!(event = "pull_started", epoch = ticket.epoch, kind = ?ticket.kind);
    tokio::spawn(async move {
        let result = fetch_snapshot(pull.as_ref(), &ticket.investigation_id).await;
        let _ = tx.send((ticket, result)).await;
    });
}
