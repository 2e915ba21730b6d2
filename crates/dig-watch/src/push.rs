//! Real-time channel: a Socket.IO client over a websocket that forwards the
//! investigation events it is subscribed to.

use dig_core::wire::{
    decode_packet, encode_packet, subscribe_packet, unsubscribe_packet, EnginePacket, FrameError,
    OpenPayload, PushEvent, PushEventKind, SocketPacket, DEFAULT_MAX_FRAME_BYTES,
    DEFAULT_NAMESPACE, ENGINE_IO_VERSION,
};
use futures_util::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, time::Duration};
use thiserror::Error;
use tokio::{net::TcpStream, sync::mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const COMMAND_QUEUE_CAPACITY: usize = 32;
const SIGNAL_QUEUE_CAPACITY: usize = 256;
// Used when the server advertises no ping interval.
const FALLBACK_LIVENESS: Duration = Duration::from_secs(45);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum PushError {
    #[error("invalid socket url '{0}'")]
    InvalidUrl(String),
    #[error("websocket connect failed: {0}")]
    Connect(String),
    #[error("socket.io handshake failed: {0}")]
    Handshake(String),
    #[error("websocket transport error: {0}")]
    Transport(String),
    #[error("connection closed by server")]
    Closed,
    #[error("no traffic within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    #[default]
    Connecting,
    Online,
    Reconnecting,
    Offline,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Connecting => "connecting",
            LinkState::Online => "online",
            LinkState::Reconnecting => "reconnecting",
            LinkState::Offline => "offline",
        }
    }
}

/// What the push task reports back to the subscription driver.
#[derive(Debug, Clone, PartialEq)]
pub enum PushSignal {
    Link(LinkState),
    Event(PushEvent),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushCommand {
    Subscribe(String),
    Unsubscribe(String),
    On(PushEventKind),
    Off(PushEventKind),
}

#[derive(Debug, Clone)]
pub struct PushConfig {
    pub endpoint: Url,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub max_frame_bytes: usize,
}

impl PushConfig {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Websocket endpoint for a Socket.IO server rooted at `base`.
pub fn socket_endpoint(base: &Url) -> Result<Url, PushError> {
    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        _ => return Err(PushError::InvalidUrl(base.to_string())),
    };
    let mut url = base.clone();
    url.set_scheme(scheme)
        .map_err(|_| PushError::InvalidUrl(base.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| PushError::InvalidUrl(base.to_string()))?
        .pop_if_empty()
        .extend(["socket.io", ""]);
    url.set_query(Some(&format!(
        "EIO={ENGINE_IO_VERSION}&transport=websocket"
    )));
    Ok(url)
}

/// Control side of a running push task. Commands are queued without waiting;
/// once the task has gone offline they are dropped.
#[derive(Debug, Clone)]
pub struct PushHandle {
    commands: mpsc::Sender<PushCommand>,
}

impl PushHandle {
    pub fn new(commands: mpsc::Sender<PushCommand>) -> Self {
        Self { commands }
    }

    pub fn subscribe(&self, investigation_id: &str) -> bool {
        self.queue(PushCommand::Subscribe(investigation_id.to_string()))
    }

    pub fn unsubscribe(&self, investigation_id: &str) -> bool {
        self.queue(PushCommand::Unsubscribe(investigation_id.to_string()))
    }

    pub fn on(&self, kind: PushEventKind) -> bool {
        self.queue(PushCommand::On(kind))
    }

    pub fn off(&self, kind: PushEventKind) -> bool {
        self.queue(PushCommand::Off(kind))
    }

    /// Returns whether the command reached the push task's queue.
    fn queue(&self, command: PushCommand) -> bool {
        match self.commands.try_send(command) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(command)) => {
                warn!(event = "push_command_dropped", reason = "queue_full", command = ?command);
                false
            }
            Err(mpsc::error::TrySendError::Closed(command)) => {
                debug!(event = "push_command_dropped", reason = "offline", command = ?command);
                false
            }
        }
    }
}

/// Spawns the push task. It stops when `cancel` fires or after the retry
/// budget is spent, reporting [`LinkState::Offline`] in the latter case.
pub fn connect(
    config: PushConfig,
    cancel: CancellationToken,
) -> (PushHandle, mpsc::Receiver<PushSignal>) {
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
    let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_QUEUE_CAPACITY);
    tokio::spawn(async move {
        push_loop(config, command_rx, signal_tx, cancel).await;
    });
    (PushHandle::new(command_tx), signal_rx)
}

#[derive(Debug, Default)]
struct Interest {
    subscriptions: BTreeSet<String>,
    listening: BTreeSet<PushEventKind>,
    commands_open: bool,
}

impl Interest {
    /// Returns the packet to put on the wire, if the command changes what the
    /// server needs to know.
    fn apply(&mut self, command: PushCommand) -> Option<EnginePacket> {
        match command {
            PushCommand::Subscribe(id) => {
                let packet = subscribe_packet(&id);
                self.subscriptions.insert(id).then_some(packet)
            }
            PushCommand::Unsubscribe(id) => {
                let packet = unsubscribe_packet(&id);
                self.subscriptions.remove(&id).then_some(packet)
            }
            PushCommand::On(kind) => {
                self.listening.insert(kind);
                None
            }
            PushCommand::Off(kind) => {
                self.listening.remove(&kind);
                None
            }
        }
    }

    fn wants(&self, event: &PushEvent) -> bool {
        self.listening.contains(&event.kind())
            && self.subscriptions.contains(event.investigation_id())
    }
}

enum ConnectionEnd {
    Cancelled,
    Lost(PushError),
}

async fn push_loop(
    config: PushConfig,
    mut commands: mpsc::Receiver<PushCommand>,
    tx: mpsc::Sender<PushSignal>,
    cancel: CancellationToken,
) {
    let mut interest = Interest {
        commands_open: true,
        ..Interest::default()
    };
    let mut failures = 0u32;
    let _ = tx.send(PushSignal::Link(LinkState::Connecting)).await;

    loop {
        let connected = tokio::select! {
            _ = cancel.cancelled() => return,
            result = open_connection(&config) => result,
        };
        match connected {
            Ok((ws, open)) => {
                failures = 0;
                info!(event = "push_connected", sid = %open.sid);
                if tx.send(PushSignal::Link(LinkState::Online)).await.is_err() {
                    return;
                }
                match drive_connection(ws, &open, &config, &mut interest, &mut commands, &tx, &cancel)
                    .await
                {
                    ConnectionEnd::Cancelled => return,
                    ConnectionEnd::Lost(err) => {
                        warn!(event = "push_connection_lost", error = %err);
                    }
                }
            }
            Err(err) => {
                failures += 1;
                warn!(event = "push_connect_error", attempt = failures, error = %err);
            }
        }

        if failures > config.max_retries {
            warn!(event = "push_offline", retries = config.max_retries);
            let _ = tx.send(PushSignal::Link(LinkState::Offline)).await;
            return;
        }
        if tx.send(PushSignal::Link(LinkState::Reconnecting)).await.is_err() {
            return;
        }
        if !wait_retry(config.retry_delay, &mut interest, &mut commands, &cancel).await {
            return;
        }
    }
}

/// Sleeps out the retry delay while still tracking interest changes.
/// Returns false when cancelled.
async fn wait_retry(
    delay: Duration,
    interest: &mut Interest,
    commands: &mut mpsc::Receiver<PushCommand>,
    cancel: &CancellationToken,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = &mut sleep => return true,
            command = commands.recv(), if interest.commands_open => match command {
                Some(command) => {
                    let _ = interest.apply(command);
                }
                None => interest.commands_open = false,
            },
        }
    }
}

async fn open_connection(config: &PushConfig) -> Result<(WsStream, OpenPayload), PushError> {
    let (mut ws, _) = connect_async(config.endpoint.as_str())
        .await
        .map_err(|err| PushError::Connect(err.to_string()))?;

    let open = match next_packet(&mut ws, HANDSHAKE_TIMEOUT, config.max_frame_bytes).await? {
        EnginePacket::Open(open) => open,
        other => {
            return Err(PushError::Handshake(format!(
                "expected open packet, got {other:?}"
            )))
        }
    };
    send_packet(&mut ws, &EnginePacket::Message(SocketPacket::connect())).await?;

    loop {
        match next_packet(&mut ws, HANDSHAKE_TIMEOUT, config.max_frame_bytes).await? {
            EnginePacket::Message(SocketPacket::Connect { .. }) => break,
            EnginePacket::Message(SocketPacket::ConnectError { data, .. }) => {
                let reason = data.map(|value| value.to_string()).unwrap_or_default();
                return Err(PushError::Handshake(format!("namespace refused: {reason}")));
            }
            EnginePacket::Ping(payload) => {
                send_packet(&mut ws, &EnginePacket::Pong(payload)).await?;
            }
            EnginePacket::Close => return Err(PushError::Closed),
            _ => {}
        }
    }
    Ok((ws, open))
}

async fn next_packet(
    ws: &mut WsStream,
    wait: Duration,
    max_frame_bytes: usize,
) -> Result<EnginePacket, PushError> {
    loop {
        let message = tokio::time::timeout(wait, ws.next())
            .await
            .map_err(|_| PushError::Timeout(wait))?;
        match message {
            Some(Ok(Message::Text(text))) => return Ok(decode_packet(&text, max_frame_bytes)?),
            Some(Ok(Message::Close(_))) | None => return Err(PushError::Closed),
            Some(Ok(_)) => {}
            Some(Err(err)) => return Err(PushError::Transport(err.to_string())),
        }
    }
}

async fn send_packet<S>(sink: &mut S, packet: &EnginePacket) -> Result<(), PushError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = encode_packet(packet)?;
    sink.send(Message::Text(text))
        .await
        .map_err(|err| PushError::Transport(err.to_string()))
}

async fn drive_connection(
    ws: WsStream,
    open: &OpenPayload,
    config: &PushConfig,
    interest: &mut Interest,
    commands: &mut mpsc::Receiver<PushCommand>,
    tx: &mpsc::Sender<PushSignal>,
    cancel: &CancellationToken,
) -> ConnectionEnd {
    let liveness = if open.ping_interval > 0 {
        Duration::from_millis(open.ping_interval + open.ping_timeout)
    } else {
        FALLBACK_LIVENESS
    };
    let (mut sink, mut stream) = ws.split();

    for id in &interest.subscriptions {
        if let Err(err) = send_packet(&mut sink, &subscribe_packet(id)).await {
            return ConnectionEnd::Lost(err);
        }
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                for id in &interest.subscriptions {
                    let _ = send_packet(&mut sink, &unsubscribe_packet(id)).await;
                }
                let disconnect = SocketPacket::Disconnect {
                    namespace: DEFAULT_NAMESPACE.to_string(),
                };
                let _ = send_packet(&mut sink, &EnginePacket::Message(disconnect)).await;
                let _ = sink.close().await;
                return ConnectionEnd::Cancelled;
            }
            incoming = tokio::time::timeout(liveness, stream.next()) => {
                let text = match incoming {
                    Err(_) => return ConnectionEnd::Lost(PushError::Timeout(liveness)),
                    Ok(None) | Ok(Some(Ok(Message::Close(_)))) => {
                        return ConnectionEnd::Lost(PushError::Closed)
                    }
                    Ok(Some(Err(err))) => {
                        return ConnectionEnd::Lost(PushError::Transport(err.to_string()))
                    }
                    Ok(Some(Ok(Message::Text(text)))) => text,
                    Ok(Some(Ok(_))) => continue,
                };
                let packet = match decode_packet(&text, config.max_frame_bytes) {
                    Ok(packet) => packet,
                    Err(err) => {
                        warn!(event = "push_decode_error", error = %err);
                        continue;
                    }
                };
                match packet {
                    EnginePacket::Ping(payload) => {
                        if let Err(err) = send_packet(&mut sink, &EnginePacket::Pong(payload)).await {
                            return ConnectionEnd::Lost(err);
                        }
                    }
                    EnginePacket::Close | EnginePacket::Message(SocketPacket::Disconnect { .. }) => {
                        return ConnectionEnd::Lost(PushError::Closed);
                    }
                    EnginePacket::Message(SocketPacket::Event { name, payload, .. }) => {
                        let event = match PushEvent::from_event(&name, payload) {
                            Ok(Some(event)) => event,
                            Ok(None) => {
                                debug!(event = "push_event_ignored", name = %name);
                                continue;
                            }
                            Err(err) => {
                                warn!(event = "push_decode_error", error = %err);
                                continue;
                            }
                        };
                        if !interest.wants(&event) {
                            continue;
                        }
                        if tx.send(PushSignal::Event(event)).await.is_err() {
                            return ConnectionEnd::Cancelled;
                        }
                    }
                    _ => {}
                }
            }
            command = commands.recv(), if interest.commands_open => {
                match command {
                    Some(command) => {
                        if let Some(packet) = interest.apply(command) {
                            if let Err(err) = send_packet(&mut sink, &packet).await {
                                return ConnectionEnd::Lost(err);
                            }
                        }
                    }
                    None => interest.commands_open = false,
                }
            }
        }
    }
}
