use crate::errors::{Error, Result};
use crate::metrics::{PUSH_CONNECTED, PUSH_MESSAGES_TOTAL, PUSH_PARSE_FAILURES_TOTAL, RECONNECTS_TOTAL};
use crate::model::{PushMessage, SubscribeRequest};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(3000);
const MESSAGE_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

/// One open push connection.
#[async_trait]
pub trait PushTransport: Send + 'static {
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Next inbound payload. `None` once the peer has closed.
    async fn recv(&mut self) -> Option<Result<Vec<u8>>>;

    async fn close(&mut self);
}

/// Opens push connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Transport: PushTransport;

    async fn connect(&self, url: &str) -> Result<Self::Transport>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Connector for WsConnector {
    type Transport = WsTransport;

    async fn connect(&self, url: &str) -> Result<WsTransport> {
        let (stream, _) = connect_async(url).await?;
        Ok(WsTransport { stream })
    }
}

#[async_trait]
impl PushTransport for WsTransport {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.stream.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<Vec<u8>>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.into_bytes())),
                Ok(Message::Binary(data)) => return Some(Ok(data)),
                Ok(Message::Close(_)) => return None,
                // Ping, Pong and raw frames
                Ok(_) => continue,
                Err(e) => return Some(Err(Error::WebSocket(e))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!("Error while closing push channel: {}", e);
        }
    }
}

#[derive(Debug, Clone)]
pub struct PushConfig {
    pub url: String,
    pub reconnect_interval: Duration,
}

impl PushConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
        }
    }

    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }
}

#[derive(Debug)]
enum Command {
    Send(String),
    Disconnect,
}

enum Exit {
    Closed,
    Disconnect,
}

#[derive(Clone)]
struct Shared {
    state: Arc<watch::Sender<ConnectionState>>,
    messages: broadcast::Sender<PushMessage>,
    reconnects: Arc<AtomicU64>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Push channel {:?} -> {:?}", previous, state);
        }
        PUSH_CONNECTED.set(if state == ConnectionState::Open { 1.0 } else { 0.0 });
    }

    fn dispatch(&self, payload: &[u8]) {
        PUSH_MESSAGES_TOTAL.inc();
        match serde_json::from_slice::<PushMessage>(payload) {
            Ok(message) => {
                debug!("Push message: {}", message.kind);
                // No receivers is fine
                let _ = self.messages.send(message);
            }
            Err(e) => {
                PUSH_PARSE_FAILURES_TOTAL.inc();
                warn!("Failed to parse push message: {}", e);
            }
        }
    }
}

/// Owns a single push-channel connection and keeps it alive.
///
/// After any close, including a failed open, a reconnect is scheduled after
/// the fixed `reconnect_interval`; the retry count is unbounded. The only
/// way out of the loop is [`PushClient::disconnect`] (or dropping the client).
pub struct PushClient<C: Connector = WsConnector> {
    config: PushConfig,
    connector: Arc<C>,
    shared: Shared,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PushClient<WsConnector> {
    pub fn new(config: PushConfig) -> Self {
        Self::with_connector(config, WsConnector)
    }
}

impl<C: Connector> PushClient<C> {
    pub fn with_connector(config: PushConfig, connector: C) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (messages, _) = broadcast::channel(MESSAGE_BUFFER);
        Self {
            config,
            connector: Arc::new(connector),
            shared: Shared {
                state: Arc::new(state),
                messages,
                reconnects: Arc::new(AtomicU64::new(0)),
            },
            commands: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Starts the connection task. Calling it while a task is alive is a no-op.
    pub fn connect(&self) {
        let mut task = self.task.lock();
        if let Some(handle) = task.as_ref() {
            if !handle.is_finished() {
                debug!("Push client already running");
                return;
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.commands.lock() = Some(tx);
        *task = Some(tokio::spawn(run_connection(
            self.connector.clone(),
            self.config.clone(),
            self.shared.clone(),
            rx,
        )));
    }

    /// Closes the connection and cancels any pending reconnect.
    pub async fn disconnect(&self) {
        let commands = self.commands.lock().take();
        let task = self.task.lock().take();

        if let Some(tx) = commands {
            let _ = tx.send(Command::Disconnect);
        }
        if let Some(handle) = task {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!("Push task ended abnormally: {}", e);
                }
            }
        }
        self.shared.set_state(ConnectionState::Disconnected);
    }

    /// Sends a JSON frame if the channel is open; otherwise logs and drops it.
    pub fn send<T: Serialize>(&self, message: &T) {
        if !self.is_connected() {
            warn!("WebSocket is not connected");
            return;
        }
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to serialize outbound message: {}", e);
                return;
            }
        };
        match self.commands.lock().as_ref() {
            Some(tx) if tx.send(Command::Send(text)).is_ok() => {}
            _ => warn!("WebSocket is not connected"),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Inbound messages in arrival order.
    pub fn subscribe(&self) -> broadcast::Receiver<PushMessage> {
        self.shared.messages.subscribe()
    }

    /// Reconnects scheduled since the client was created.
    pub fn reconnect_attempts(&self) -> u64 {
        self.shared.reconnects.load(Ordering::SeqCst)
    }
}

impl<C: Connector> Drop for PushClient<C> {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

async fn run_connection<C: Connector>(
    connector: Arc<C>,
    config: PushConfig,
    shared: Shared,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    loop {
        shared.set_state(ConnectionState::Connecting);
        info!("Connecting to push channel at {}", config.url);

        let connect = connector.connect(&config.url);
        tokio::pin!(connect);
        let outcome = loop {
            tokio::select! {
                result = &mut connect => break Some(result),
                cmd = commands.recv() => match cmd {
                    Some(Command::Send(_)) => warn!("WebSocket is not connected"),
                    Some(Command::Disconnect) | None => break None,
                },
            }
        };
        let Some(result) = outcome else {
            shared.set_state(ConnectionState::Disconnected);
            return;
        };

        match result {
            Ok(mut transport) => {
                shared.set_state(ConnectionState::Open);
                info!("Push channel connected");

                match serde_json::to_string(&SubscribeRequest::default()) {
                    Ok(frame) => {
                        if let Err(e) = transport.send_text(frame).await {
                            warn!("Failed to send subscription request: {}", e);
                        }
                    }
                    Err(e) => warn!("Failed to serialize subscription request: {}", e),
                }

                if let Exit::Disconnect = pump(&mut transport, &mut commands, &shared).await {
                    shared.set_state(ConnectionState::Closing);
                    transport.close().await;
                    shared.set_state(ConnectionState::Disconnected);
                    info!("Push channel disconnected");
                    return;
                }
                info!("Push channel closed");
            }
            Err(e) => {
                warn!("Failed to connect push channel: {}", e);
            }
        }

        shared.set_state(ConnectionState::Disconnected);
        shared.reconnects.fetch_add(1, Ordering::SeqCst);
        RECONNECTS_TOTAL.inc();
        info!("Reconnecting in {:?}", config.reconnect_interval);

        let delay = tokio::time::sleep(config.reconnect_interval);
        tokio::pin!(delay);
        loop {
            tokio::select! {
                _ = &mut delay => break,
                cmd = commands.recv() => match cmd {
                    Some(Command::Send(_)) => warn!("WebSocket is not connected"),
                    Some(Command::Disconnect) | None => return,
                },
            }
        }
        info!("Attempting to reconnect...");
    }
}

async fn pump<T: PushTransport>(
    transport: &mut T,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    shared: &Shared,
) -> Exit {
    loop {
        tokio::select! {
            frame = transport.recv() => match frame {
                Some(Ok(payload)) => shared.dispatch(&payload),
                Some(Err(e)) => {
                    warn!("Push channel error: {}", e);
                    return Exit::Closed;
                }
                None => return Exit::Closed,
            },
            cmd = commands.recv() => match cmd {
                Some(Command::Send(text)) => {
                    if let Err(e) = transport.send_text(text).await {
                        warn!("Push channel send failed: {}", e);
                        return Exit::Closed;
                    }
                }
                Some(Command::Disconnect) | None => return Exit::Disconnect,
            },
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tokio::time::Instant;

    /// Server side of one fake connection.
    pub struct FakePeer {
        pub to_client: mpsc::UnboundedSender<Vec<u8>>,
        pub from_client: mpsc::UnboundedReceiver<String>,
    }

    pub struct FakeTransport {
        inbound: mpsc::UnboundedReceiver<Vec<u8>>,
        outbound: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl PushTransport for FakeTransport {
        async fn send_text(&mut self, text: String) -> Result<()> {
            self.outbound.send(text).map_err(|_| Error::NotConnected)
        }

        async fn recv(&mut self) -> Option<Result<Vec<u8>>> {
            self.inbound.recv().await.map(Ok)
        }

        async fn close(&mut self) {
            self.inbound.close();
        }
    }

    /// Hands every accepted connection to the test; refuses while `refuse` is set.
    #[derive(Clone)]
    pub struct FakeConnector {
        peers: mpsc::UnboundedSender<FakePeer>,
        pub attempts: Arc<Mutex<Vec<Instant>>>,
        pub refuse: Arc<std::sync::atomic::AtomicBool>,
    }

    impl FakeConnector {
        pub fn new() -> (Self, mpsc::UnboundedReceiver<FakePeer>) {
            let (peers, rx) = mpsc::unbounded_channel();
            (
                Self {
                    peers,
                    attempts: Arc::new(Mutex::new(Vec::new())),
                    refuse: Arc::new(std::sync::atomic::AtomicBool::new(false)),
                },
                rx,
            )
        }

        pub fn attempt_count(&self) -> usize {
            self.attempts.lock().len()
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        type Transport = FakeTransport;

        async fn connect(&self, _url: &str) -> Result<FakeTransport> {
            self.attempts.lock().push(Instant::now());
            if self.refuse.load(Ordering::SeqCst) {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "refused",
                )));
            }
            let (to_client, inbound) = mpsc::unbounded_channel();
            let (outbound, from_client) = mpsc::unbounded_channel();
            let _ = self.peers.send(FakePeer {
                to_client,
                from_client,
            });
            Ok(FakeTransport { inbound, outbound })
        }
    }
}
