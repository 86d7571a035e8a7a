//! Event channel to the backend
//!
//! Once the supervisor publishes the backend's endpoint, [`TransportClient`]
//! keeps one WebSocket open to it: authenticates, sends heartbeat pings,
//! dispatches inbound frames through the [`EventBus`] and reconnects with
//! exponential backoff after any close it did not ask for.
//!
//! ```text
//! Disconnected ──connect──► Connecting ──open──► Open
//!      ▲                         ▲                 │
//!      │                         └──timer fires────┤ abnormal close
//!      └──────────── disconnect() ◄────────────────┘ (no reconnect)
//! ```
//!
//! The socket and its timers are owned by a single actor task; the client
//! handle only sends requests and reads a `watch` of the connection state.

pub mod backoff;
pub mod bus;
pub mod protocol;

pub use backoff::ReconnectBackoff;
pub use bus::{ConnectionEvent, EventBus, HandlerId};
pub use protocol::{Command, Envelope, MessageKind};

use crate::config::TransportConfig;
use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound on the close handshake during `disconnect()`
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Where the backend is listening
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// Sent as the first frame when present
    pub token: Option<String>,
}

impl Endpoint {
    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Open,
}

/// Reconnect and heartbeat timing
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    /// Zero disables the heartbeat
    pub heartbeat_interval: Duration,
}

impl TransportOptions {
    pub fn from_config(config: &TransportConfig) -> Self {
        Self {
            reconnect_base: config.reconnect_base(),
            reconnect_max: config.reconnect_max(),
            heartbeat_interval: config.heartbeat_interval(),
        }
    }
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            reconnect_base: Duration::from_millis(500),
            reconnect_max: Duration::from_millis(10_000),
            heartbeat_interval: Duration::from_secs(15),
        }
    }
}

enum Request {
    Connect(Endpoint),
    Disconnect,
    Send(String),
}

struct Connected {
    attempt: u64,
    result: Result<Socket, tungstenite::Error>,
}

/// Handle to the event channel
///
/// Cheap to clone. The channel is closed once every clone is dropped.
#[derive(Clone)]
pub struct TransportClient {
    requests: mpsc::UnboundedSender<Request>,
    state: watch::Receiver<ConnectionState>,
    bus: Arc<EventBus>,
}

impl TransportClient {
    /// Spawn the connection actor on the current runtime
    pub fn new(options: TransportOptions) -> Self {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let bus = Arc::new(EventBus::new());

        let actor = Actor {
            options: options.clone(),
            bus: bus.clone(),
            state: state_tx,
            endpoint: None,
            socket: None,
            heartbeat: None,
            reconnect: None,
            connect_task: None,
            attempt: 0,
            intentional: false,
            backoff: ReconnectBackoff::new(options.reconnect_base, options.reconnect_max),
        };
        tokio::spawn(actor.run(request_rx));

        Self {
            requests: request_tx,
            state: state_rx,
            bus,
        }
    }

    /// Open the channel to `endpoint`, replacing any current connection
    pub fn connect(&self, endpoint: Endpoint) {
        if self.requests.send(Request::Connect(endpoint)).is_err() {
            tracing::debug!("Transport actor gone, connect ignored");
        }
    }

    /// Close with a normal-closure code and stop reconnecting
    pub fn disconnect(&self) {
        let _ = self.requests.send(Request::Disconnect);
    }

    /// Send `{type:"command", action, ...payload}`
    ///
    /// Returns false without queueing anything when the channel is not open.
    pub fn send(&self, action: &str, payload: &Map<String, Value>) -> bool {
        if self.state() != ConnectionState::Open {
            tracing::trace!("Channel not open, dropping '{}'", action);
            return false;
        }
        let frame = protocol::encode_outbound(action, payload);
        self.requests.send(Request::Send(frame)).is_ok()
    }

    pub fn send_command(&self, command: &Command) -> bool {
        let (action, payload) = command.to_parts();
        self.send(&action, &payload)
    }

    pub fn on<F>(&self, kind: MessageKind, handler: F) -> HandlerId
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.bus.on(kind, handler)
    }

    pub fn on_connection<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.bus.on_connection(handler)
    }

    pub fn off(&self, id: HandlerId) -> bool {
        self.bus.off(id)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }
}

struct Actor {
    options: TransportOptions,
    bus: Arc<EventBus>,
    state: watch::Sender<ConnectionState>,
    endpoint: Option<Endpoint>,

    socket: Option<Socket>,
    heartbeat: Option<Interval>,
    reconnect: Option<Pin<Box<Sleep>>>,
    connect_task: Option<JoinHandle<()>>,

    /// Bumped per connection attempt so a late result is discarded
    attempt: u64,
    intentional: bool,
    backoff: ReconnectBackoff,
}

impl Actor {
    async fn run(mut self, mut requests: mpsc::UnboundedReceiver<Request>) {
        let (connected_tx, mut connected_rx) = mpsc::unbounded_channel::<Connected>();

        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(Request::Connect(endpoint)) => self.connect(endpoint, &connected_tx).await,
                    Some(Request::Disconnect) => self.disconnect().await,
                    Some(Request::Send(frame)) => {
                        if self.current_state() == ConnectionState::Open {
                            self.send_frame(frame).await;
                        }
                    }
                    None => {
                        self.disconnect().await;
                        break;
                    }
                },
                Some(connected) = connected_rx.recv() => self.on_connected(connected).await,
                frame = next_frame(&mut self.socket) => self.on_frame(frame).await,
                _ = tick(&mut self.heartbeat) => {
                    tracing::trace!("Heartbeat ping");
                    self.send_frame(protocol::ping_frame()).await;
                }
                _ = expire(&mut self.reconnect) => {
                    self.reconnect = None;
                    self.backoff.advance();
                    self.begin_connect(&connected_tx);
                }
            }
        }

        tracing::debug!("Transport stopped");
    }

    async fn connect(
        &mut self,
        endpoint: Endpoint,
        connected_tx: &mpsc::UnboundedSender<Connected>,
    ) {
        if self.socket.is_some() {
            tracing::debug!("Replacing existing connection");
            self.close_socket().await;
        }
        self.reconnect = None;
        self.heartbeat = None;
        self.intentional = false;
        self.endpoint = Some(endpoint);
        self.begin_connect(connected_tx);
    }

    fn begin_connect(&mut self, connected_tx: &mpsc::UnboundedSender<Connected>) {
        let Some(ref endpoint) = self.endpoint else {
            return;
        };

        self.attempt += 1;
        let attempt = self.attempt;
        let url = endpoint.url();
        let connected_tx = connected_tx.clone();

        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        self.set_state(ConnectionState::Connecting);
        tracing::debug!("Connecting to {}", url);

        self.connect_task = Some(tokio::spawn(async move {
            let result = tokio_tungstenite::connect_async(url)
                .await
                .map(|(socket, _response)| socket);
            let _ = connected_tx.send(Connected { attempt, result });
        }));
    }

    async fn on_connected(&mut self, connected: Connected) {
        if connected.attempt != self.attempt || self.intentional {
            // Superseded attempt; an orphaned socket closes on drop
            return;
        }
        self.connect_task = None;

        let socket = match connected.result {
            Ok(socket) => socket,
            Err(e) => {
                tracing::debug!("Connection failed: {}", e);
                self.schedule_reconnect();
                return;
            }
        };
        self.socket = Some(socket);

        let token = self.endpoint.as_ref().and_then(|e| e.token.clone());
        if let Some(token) = token {
            if !self.send_frame(protocol::auth_frame(&token)).await {
                return;
            }
        }

        self.heartbeat = self.start_heartbeat();
        self.backoff.reset();
        self.set_state(ConnectionState::Open);
        tracing::info!("Connected to backend");
        self.bus.notify(&ConnectionEvent::Open);
    }

    fn start_heartbeat(&self) -> Option<Interval> {
        let period = self.options.heartbeat_interval;
        if period.is_zero() {
            return None;
        }
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Some(interval)
    }

    async fn on_frame(&mut self, frame: Option<Result<Message, tungstenite::Error>>) {
        match frame {
            Some(Ok(Message::Text(text))) => match protocol::parse_frame(&text) {
                Some(envelope) => {
                    tracing::trace!("Received '{}' frame", envelope.kind);
                    self.bus.dispatch(&envelope);
                }
                None => tracing::trace!("Dropping unrecognized frame"),
            },
            Some(Ok(Message::Close(frame))) => {
                let code = frame.map(|f| u16::from(f.code));
                self.on_closed(code);
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::debug!("Connection error: {}", e);
                self.on_closed(None);
            }
            None => self.on_closed(None),
        }
    }

    /// Socket is gone; reconnect unless the close was requested
    fn on_closed(&mut self, code: Option<u16>) {
        self.socket = None;
        self.heartbeat = None;
        self.bus.notify(&ConnectionEvent::Closed {
            code,
            intentional: self.intentional,
        });

        if self.intentional {
            self.set_state(ConnectionState::Disconnected);
        } else {
            tracing::debug!("Connection closed (code {:?})", code);
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&mut self) {
        self.socket = None;
        self.heartbeat = None;
        self.set_state(ConnectionState::Disconnected);

        let delay = self.backoff.current();
        tracing::debug!("Reconnecting in {}ms", delay.as_millis());
        self.reconnect = Some(Box::pin(tokio::time::sleep(delay)));
    }

    async fn disconnect(&mut self) {
        self.intentional = true;
        self.reconnect = None;
        self.heartbeat = None;
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        self.attempt += 1;

        if self.socket.is_some() {
            self.close_socket().await;
            self.bus.notify(&ConnectionEvent::Closed {
                code: Some(u16::from(CloseCode::Normal)),
                intentional: true,
            });
            tracing::info!("Disconnected from backend");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    async fn close_socket(&mut self) {
        let Some(mut socket) = self.socket.take() else {
            return;
        };
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        match tokio::time::timeout(CLOSE_TIMEOUT, socket.close(Some(frame))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("Close handshake failed: {}", e),
            Err(_) => tracing::debug!("Close handshake timed out"),
        }
    }

    /// Write one text frame; a failed write counts as an abnormal close
    async fn send_frame(&mut self, frame: String) -> bool {
        let Some(ref mut socket) = self.socket else {
            return false;
        };
        match socket.send(Message::Text(frame)).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Send failed: {}", e);
                self.on_closed(None);
                false
            }
        }
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::trace!("Transport: {:?} -> {:?}", previous, state);
        }
    }
}

async fn next_frame(socket: &mut Option<Socket>) -> Option<Result<Message, tungstenite::Error>> {
    match socket {
        Some(socket) => socket.next().await,
        None => std::future::pending().await,
    }
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn expire(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}
