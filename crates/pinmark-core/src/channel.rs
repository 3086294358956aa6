//! Live update channel.
//!
//! The engine talks to the server's live channel through the [`LiveChannel`]
//! trait: text frames in, binary mask frames out. [`WsChannel`] is the
//! WebSocket implementation; [`MemoryChannel`] is an in-process stand-in.

use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Events from a live channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Connection established
    Opened,
    /// Text frame received
    Text(String),
    /// Connection closed by the peer or the network
    Closed,
    /// Connection failed
    Error(String),
}

/// Channel errors.
#[derive(Debug, Error, PartialEq)]
pub enum ChannelError {
    #[error("Invalid channel URL: {0}")]
    InvalidUrl(String),
    #[error("Channel already open")]
    AlreadyOpen,
    #[error("Channel not open")]
    NotOpen,
    #[error("Send failed: {0}")]
    Send(String),
}

/// A bidirectional live update channel.
pub trait LiveChannel: Send {
    /// Start connecting to `url`. Completion is reported by [`ChannelEvent::Opened`].
    fn open(&mut self, url: &str) -> Result<(), ChannelError>;

    /// Queue one binary frame.
    fn send_binary(&mut self, bytes: Vec<u8>) -> Result<(), ChannelError>;

    /// Drain pending events (non-blocking).
    fn poll_events(&mut self) -> Vec<ChannelEvent>;

    /// Close the connection. Events not yet polled are discarded.
    fn close(&mut self);

    fn state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}

fn apply_event(state: &mut ConnectionState, event: &ChannelEvent) {
    match event {
        ChannelEvent::Opened => *state = ConnectionState::Connected,
        ChannelEvent::Closed => *state = ConnectionState::Disconnected,
        ChannelEvent::Error(_) => *state = ConnectionState::Error,
        ChannelEvent::Text(_) => {}
    }
}

// ============================================================================
// WebSocket Channel
// ============================================================================

mod ws {
    use super::*;
    use std::sync::mpsc::{Receiver, Sender, TryRecvError, channel};
    use std::thread::{self, JoinHandle};
    use std::time::Duration;
    use tungstenite::{Message, connect};
    use url::Url;

    /// Commands sent to the WebSocket thread.
    enum WsCommand {
        Send(Vec<u8>),
        Close,
    }

    /// WebSocket channel.
    ///
    /// Uses a background thread for non-blocking operation.
    pub struct WsChannel {
        state: ConnectionState,
        /// Channel to send commands to the WebSocket thread.
        cmd_tx: Option<Sender<WsCommand>>,
        /// Channel to receive events from the WebSocket thread.
        event_rx: Option<Receiver<ChannelEvent>>,
        /// Handle to the WebSocket thread.
        _thread: Option<JoinHandle<()>>,
    }

    impl WsChannel {
        /// Create a new disconnected channel.
        pub fn new() -> Self {
            Self {
                state: ConnectionState::Disconnected,
                cmd_tx: None,
                event_rx: None,
                _thread: None,
            }
        }
    }

    impl Default for WsChannel {
        fn default() -> Self {
            Self::new()
        }
    }

    impl LiveChannel for WsChannel {
        fn open(&mut self, url: &str) -> Result<(), ChannelError> {
            if self.cmd_tx.is_some() {
                return Err(ChannelError::AlreadyOpen);
            }

            let parsed = Url::parse(url).map_err(|e| ChannelError::InvalidUrl(e.to_string()))?;
            if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
                return Err(ChannelError::InvalidUrl(format!(
                    "unsupported scheme: {}",
                    parsed.scheme()
                )));
            }

            self.state = ConnectionState::Connecting;

            let (cmd_tx, cmd_rx) = channel::<WsCommand>();
            let (event_tx, event_rx) = channel::<ChannelEvent>();
            let url = url.to_string();

            let handle = thread::spawn(move || {
                log::info!("Live channel thread: connecting to {}", url);

                let (mut socket, response) = match connect(&url) {
                    Ok(pair) => pair,
                    Err(e) => {
                        log::error!("Live channel connection failed: {}", e);
                        let _ = event_tx.send(ChannelEvent::Error(format!("Connection failed: {}", e)));
                        return;
                    }
                };
                log::info!("Live channel connected, status: {}", response.status());
                let _ = event_tx.send(ChannelEvent::Opened);

                // Short read timeout so the loop keeps servicing commands
                match socket.get_mut() {
                    tungstenite::stream::MaybeTlsStream::Plain(tcp) => {
                        let _ = tcp.set_read_timeout(Some(Duration::from_millis(50)));
                        let _ = tcp.set_write_timeout(Some(Duration::from_secs(5)));
                    }
                    #[allow(unreachable_patterns)]
                    _ => {
                        log::debug!("TLS or other stream - using default timeout handling");
                    }
                }

                loop {
                    match cmd_rx.try_recv() {
                        Ok(WsCommand::Send(bytes)) => {
                            log::debug!("Live channel sending {} bytes", bytes.len());
                            if let Err(e) = socket.send(Message::Binary(bytes)) {
                                log::error!("Live channel send error: {}", e);
                                break;
                            }
                        }
                        Ok(WsCommand::Close) => {
                            log::info!("Live channel close requested");
                            let _ = socket.close(None);
                            // Owner is gone; nobody listens for Closed
                            return;
                        }
                        Err(TryRecvError::Disconnected) => {
                            log::info!("Live channel command channel disconnected");
                            return;
                        }
                        Err(TryRecvError::Empty) => {}
                    }

                    match socket.read() {
                        Ok(Message::Text(txt)) => {
                            log::debug!("Live channel received {} bytes", txt.len());
                            if event_tx.send(ChannelEvent::Text(txt)).is_err() {
                                return;
                            }
                        }
                        Ok(Message::Ping(data)) => {
                            let _ = socket.send(Message::Pong(data));
                        }
                        Ok(Message::Close(_)) => {
                            log::info!("Live channel received close frame");
                            break;
                        }
                        Ok(_) => {} // Inbound binary and pong are not part of the protocol
                        Err(tungstenite::Error::Io(ref e))
                            if e.kind() == std::io::ErrorKind::WouldBlock
                                || e.kind() == std::io::ErrorKind::TimedOut =>
                        {
                            continue;
                        }
                        Err(e) => {
                            log::error!("Live channel read error: {}", e);
                            break;
                        }
                    }
                }

                log::info!("Live channel thread exiting");
                let _ = event_tx.send(ChannelEvent::Closed);
            });

            self.cmd_tx = Some(cmd_tx);
            self.event_rx = Some(event_rx);
            self._thread = Some(handle);

            Ok(())
        }

        fn send_binary(&mut self, bytes: Vec<u8>) -> Result<(), ChannelError> {
            let tx = self.cmd_tx.as_ref().ok_or(ChannelError::NotOpen)?;
            tx.send(WsCommand::Send(bytes))
                .map_err(|e| ChannelError::Send(e.to_string()))
        }

        fn poll_events(&mut self) -> Vec<ChannelEvent> {
            let mut events = Vec::new();
            let Some(rx) = self.event_rx.as_ref() else {
                return events;
            };
            while let Ok(event) = rx.try_recv() {
                apply_event(&mut self.state, &event);
                events.push(event);
            }

            // The worker is done once it reported a terminal event
            if matches!(
                self.state,
                ConnectionState::Disconnected | ConnectionState::Error
            ) {
                self.cmd_tx = None;
                self.event_rx = None;
                self._thread = None;
            }
            events
        }

        fn close(&mut self) {
            if let Some(tx) = self.cmd_tx.take() {
                let _ = tx.send(WsCommand::Close);
            }
            self.event_rx = None;
            self._thread = None;
            self.state = ConnectionState::Disconnected;
        }

        fn state(&self) -> ConnectionState {
            self.state
        }
    }

    impl Drop for WsChannel {
        fn drop(&mut self) {
            self.close();
        }
    }

}

pub use ws::WsChannel;

// ============================================================================
// In-memory Channel
// ============================================================================

#[derive(Debug)]
struct MemoryChannelInner {
    state: ConnectionState,
    pending: Vec<ChannelEvent>,
    sent: Vec<Vec<u8>>,
    opened: Vec<String>,
    /// Report `Opened` as soon as `open` is called.
    auto_open: bool,
}

fn lock(inner: &Mutex<MemoryChannelInner>) -> MutexGuard<'_, MemoryChannelInner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-process channel; the paired [`MemoryChannelHandle`] plays the server.
#[derive(Debug)]
pub struct MemoryChannel {
    inner: Arc<Mutex<MemoryChannelInner>>,
}

/// Server side of a [`MemoryChannel`].
#[derive(Debug, Clone)]
pub struct MemoryChannelHandle {
    inner: Arc<Mutex<MemoryChannelInner>>,
}

impl MemoryChannel {
    /// Create a channel and the handle that drives it.
    pub fn new() -> (Self, MemoryChannelHandle) {
        let inner = Arc::new(Mutex::new(MemoryChannelInner {
            state: ConnectionState::Disconnected,
            pending: Vec::new(),
            sent: Vec::new(),
            opened: Vec::new(),
            auto_open: true,
        }));
        (
            Self {
                inner: inner.clone(),
            },
            MemoryChannelHandle { inner },
        )
    }
}

impl LiveChannel for MemoryChannel {
    fn open(&mut self, url: &str) -> Result<(), ChannelError> {
        let mut inner = lock(&self.inner);
        if matches!(
            inner.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            return Err(ChannelError::AlreadyOpen);
        }
        inner.opened.push(url.to_string());
        inner.state = ConnectionState::Connecting;
        if inner.auto_open {
            inner.pending.push(ChannelEvent::Opened);
        }
        Ok(())
    }

    fn send_binary(&mut self, bytes: Vec<u8>) -> Result<(), ChannelError> {
        let mut inner = lock(&self.inner);
        if inner.state != ConnectionState::Connected {
            return Err(ChannelError::NotOpen);
        }
        inner.sent.push(bytes);
        Ok(())
    }

    fn poll_events(&mut self) -> Vec<ChannelEvent> {
        let mut inner = lock(&self.inner);
        if matches!(inner.state, ConnectionState::Disconnected | ConnectionState::Error) {
            return Vec::new();
        }
        let events = std::mem::take(&mut inner.pending);
        for event in &events {
            apply_event(&mut inner.state, event);
        }
        events
    }

    fn close(&mut self) {
        let mut inner = lock(&self.inner);
        inner.pending.clear();
        inner.state = ConnectionState::Disconnected;
    }

    fn state(&self) -> ConnectionState {
        lock(&self.inner).state
    }
}

impl MemoryChannelHandle {
    /// Queue an event for the next poll.
    pub fn push(&self, event: ChannelEvent) {
        lock(&self.inner).pending.push(event);
    }

    /// Queue an inbound text frame.
    pub fn push_text(&self, text: impl Into<String>) {
        self.push(ChannelEvent::Text(text.into()));
    }

    /// Simulate the server dropping the connection.
    pub fn drop_connection(&self) {
        self.push(ChannelEvent::Closed);
    }

    /// Hold back `Opened` until [`MemoryChannelHandle::accept`] is called.
    pub fn set_auto_open(&self, auto_open: bool) {
        lock(&self.inner).auto_open = auto_open;
    }

    /// Complete a pending connection attempt.
    pub fn accept(&self) {
        self.push(ChannelEvent::Opened);
    }

    /// Binary frames sent by the client, oldest first.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        lock(&self.inner).sent.clone()
    }

    /// URLs passed to `open`, oldest first.
    pub fn opened(&self) -> Vec<String> {
        lock(&self.inner).opened.clone()
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner).state
    }
}
