use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dig_core::{ConfidenceBand, InvestigationRecord, StatusSummary};
use dig_watch::config::{load_config, resolve_log_level, resolve_log_stdout, Overrides, WatchConfig};
use dig_watch::logging::init_logging;
use dig_watch::pull::ApiClient;
use dig_watch::push::{self, PushConfig};
use dig_watch::reconciler::{DashboardSnapshot, Reconciler};
use dig_watch::session::{run_session, SessionConfig, SessionOutcome};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "dig-watch", about = "Follow repository investigations as they run")]
struct Cli {
    #[arg(long, default_value = "")]
    api_url: String,
    #[arg(long, default_value = "")]
    socket_url: String,
    #[arg(long, default_value = "")]
    token: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream live progress for one investigation until it finishes.
    Watch {
        id: String,
        #[command(flatten)]
        follow: FollowArgs,
    },
    /// Start an investigation of a repository.
    Start {
        repo_url: String,
        /// Keep following the new investigation.
        #[arg(long)]
        watch: bool,
        #[command(flatten)]
        follow: FollowArgs,
    },
    /// List recent investigations.
    List {
        #[arg(long, default_value_t = 0)]
        skip: u32,
        #[arg(long, default_value_t = 20)]
        limit: u32,
        #[arg(long)]
        json: bool,
    },
    /// Delete an investigation and its logs.
    Delete { id: String },
}

#[derive(clap::Args, Debug, Clone, Default)]
struct FollowArgs {
    /// Print each snapshot as a JSON line.
    #[arg(long)]
    json: bool,
    #[arg(long)]
    poll_interval_ms: Option<u64>,
    /// Rely on polling only.
    #[arg(long)]
    no_push: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(resolve_log_stdout(), &resolve_log_level());

    let follow = match &cli.command {
        Command::Watch { follow, .. } | Command::Start { follow, .. } => follow.clone(),
        _ => FollowArgs::default(),
    };
    let config = load_config(&Overrides {
        api_url: cli.api_url.clone(),
        socket_url: cli.socket_url.clone(),
        token: cli.token.clone(),
        poll_interval_ms: follow.poll_interval_ms,
        push_disabled: follow.no_push,
    })?;
    let client = ApiClient::new(config.api_url.clone(), config.token.clone())
        .context("failed to build http client")?;

    match cli.command {
        Command::Watch { id, follow } => watch_investigation(&config, client, id, follow.json).await,
        Command::Start {
            repo_url,
            watch,
            follow,
        } => {
            let record = client
                .create_investigation(&repo_url)
                .await
                .with_context(|| format!("failed to start investigation of {repo_url}"))?;
            info!(event = "investigation_started", id = %record.id, repo_url = %record.repo_url);
            if !watch {
                println!("{}", record_line(&record));
                return Ok(());
            }
            watch_investigation(&config, client, record.id, follow.json).await
        }
        Command::List { skip, limit, json } => {
            let records = client
                .list_investigations(skip, limit)
                .await
                .context("failed to list investigations")?;
            if json {
                println!("{}", serde_json::to_string(&records)?);
                return Ok(());
            }
            for record in &records {
                println!("{}", record_line(record));
            }
            let summary = StatusSummary::tally(records.iter().map(|record| &record.status));
            println!(
                "{} total, {} completed, {} in progress, {} failed",
                records.len(),
                summary.completed,
                summary.in_flight,
                summary.failed
            );
            Ok(())
        }
        Command::Delete { id } => {
            client
                .delete_investigation(&id)
                .await
                .with_context(|| format!("failed to delete investigation {id}"))?;
            println!("deleted {id}");
            Ok(())
        }
    }
}

async fn watch_investigation(
    config: &WatchConfig,
    client: ApiClient,
    id: String,
    json: bool,
) -> Result<()> {
    let cancel = CancellationToken::new();
    let push = if config.push_enabled {
        let endpoint = push::socket_endpoint(&config.socket_url)
            .context("invalid socket url")?;
        Some(push::connect(PushConfig::new(endpoint), cancel.child_token()))
    } else {
        None
    };

    let (mut reconciler, snapshots) = Reconciler::new();
    let printer = tokio::spawn(print_snapshots(snapshots, json));

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let outcome = run_session(
        &mut reconciler,
        Arc::new(client),
        push,
        SessionConfig {
            investigation_id: id,
            poll_interval: config.poll_interval,
            exit_when_settled: true,
        },
        cancel.child_token(),
    )
    .await;
    cancel.cancel();
    drop(reconciler);
    if let Err(err) = printer.await {
        warn!(event = "printer_join_error", error = %err);
    }
    if outcome == SessionOutcome::Cancelled {
        info!(event = "watch_interrupted");
    }
    Ok(())
}

async fn print_snapshots(mut snapshots: watch::Receiver<Option<DashboardSnapshot>>, json: bool) {
    while snapshots.changed().await.is_ok() {
        let Some(snapshot) = snapshots.borrow_and_update().clone() else {
            continue;
        };
        if json {
            match serde_json::to_string(&snapshot) {
                Ok(line) => println!("{line}"),
                Err(err) => warn!(event = "snapshot_encode_error", error = %err),
            }
        } else {
            println!("{snapshot}");
        }
    }
}

fn record_line(record: &InvestigationRecord) -> String {
    let confidence = record
        .confidence
        .map(|value| format!("{value}% ({})", ConfidenceBand::of(value).as_str()))
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{}  {:<10}  {:>14}  {}",
        record.id, record.status, confidence, record.repo_url
    )
}
