//! WebSocket transport talking to `classboard-relay`.
//!
//! The socket lives on a background thread; commands go in over a channel and
//! inbound operations are handed straight to the subscribed sinks from that
//! thread. When the thread exits the next call through [`Transport`] starts a
//! fresh one.

use super::{
    ConnectionStatus, OperationSink, SubscriptionId, Transport, TransportError, TransportResult,
};
use crate::operation::Operation;
use crate::protocol::{ClientMessage, ServerMessage};
use std::collections::{HashMap, HashSet};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender, TryRecvError, channel};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket, connect};
use url::Url;

const READ_TIMEOUT: Duration = Duration::from_millis(50);
/// Minimum spacing between connection attempts.
const RECONNECT_INTERVAL: Duration = Duration::from_millis(500);

/// Connection state of the relay socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Commands sent to the WebSocket thread.
enum RelayCommand {
    Send(String),
    Close,
}

struct Shared {
    state: Mutex<ConnectionState>,
    sinks: Mutex<HashMap<String, Vec<(SubscriptionId, OperationSink)>>>,
    /// Topics the relay has acknowledged.
    confirmed: Mutex<HashSet<String>>,
    next_subscription: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }

    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn topics(&self) -> Vec<String> {
        lock(&self.sinks).keys().cloned().collect()
    }

    fn deliver(&self, topic: &str, value: serde_json::Value) {
        let operation = match Operation::from_value(value) {
            Ok(op) => op,
            Err(e) => {
                log::warn!("Dropping undecodable operation on {}: {}", topic, e);
                return;
            }
        };

        let sinks: Vec<OperationSink> = lock(&self.sinks)
            .get(topic)
            .map(|subs| subs.iter().map(|(_, sink)| sink.clone()).collect())
            .unwrap_or_default();

        for sink in sinks {
            sink(operation.clone());
        }
    }

    fn handle_text(&self, txt: &str) {
        let msg = match serde_json::from_str::<ServerMessage>(txt) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Failed to parse relay message: {}", e);
                return;
            }
        };

        match msg {
            ServerMessage::Subscribed { topic, subscriber_count } => {
                log::info!("Subscribed to {} ({} subscribers)", topic, subscriber_count);
                lock(&self.confirmed).insert(topic);
            }
            ServerMessage::Unsubscribed { topic } => {
                lock(&self.confirmed).remove(&topic);
            }
            ServerMessage::Operation { topic, from, operation } => {
                log::debug!("Operation on {} from {}", topic, from);
                self.deliver(&topic, operation);
            }
            ServerMessage::Error { message } => {
                log::warn!("Relay error: {}", message);
            }
        }
    }
}

/// Transport backed by a WebSocket connection to a relay server.
///
/// A dropped or failed connection is re-established lazily from
/// [`Transport::subscribe`], [`Transport::publish`] and
/// [`Transport::connection_status`]. Topics with live sinks are subscribed
/// again once the new socket is up.
pub struct RelayTransport {
    url: String,
    shared: Arc<Shared>,
    link: Mutex<Option<Link>>,
    /// Set by [`Self::disconnect`]; stops any further reconnects.
    closed: AtomicBool,
}

/// One socket thread and its command channel.
struct Link {
    cmd_tx: Sender<RelayCommand>,
    started: Instant,
    _thread: JoinHandle<()>,
}

type Socket = WebSocket<MaybeTlsStream<TcpStream>>;

fn encode(msg: &ClientMessage) -> TransportResult<String> {
    serde_json::to_string(msg).map_err(|e| TransportError::Encode(e.to_string()))
}

fn run_socket(url: &str, shared: &Shared, cmd_rx: Receiver<RelayCommand>) {
    log::info!("Relay thread: connecting to {}", url);

    let (mut socket, response) = match connect(url) {
        Ok(pair) => pair,
        Err(e) => {
            log::warn!("Relay connection failed: {}", e);
            shared.set_state(ConnectionState::Error);
            return;
        }
    };
    log::info!("Relay connected, status: {}", response.status());

    // Short read timeout so the loop can service outgoing commands.
    match socket.get_mut() {
        MaybeTlsStream::Plain(tcp) => {
            let _ = tcp.set_read_timeout(Some(READ_TIMEOUT));
            let _ = tcp.set_write_timeout(Some(Duration::from_secs(5)));
        }
        #[allow(unreachable_patterns)]
        _ => {
            log::debug!("TLS or other stream - using default timeout handling");
        }
    }

    // State first, then the topic snapshot: a sink added after this point
    // sends its own Subscribe.
    shared.set_state(ConnectionState::Connected);
    if let Err(e) = resubscribe(&mut socket, shared) {
        log::error!("Relay resubscribe failed: {}", e);
    } else {
        pump(&mut socket, shared, &cmd_rx);
    }

    log::info!("Relay thread exiting");
    lock(&shared.confirmed).clear();
    shared.set_state(ConnectionState::Disconnected);
}

fn resubscribe(socket: &mut Socket, shared: &Shared) -> Result<(), tungstenite::Error> {
    for topic in shared.topics() {
        log::debug!("Subscribing to {}", topic);
        match encode(&ClientMessage::Subscribe { topic }) {
            Ok(json) => socket.send(Message::Text(json))?,
            Err(e) => log::warn!("{}", e),
        }
    }
    Ok(())
}

fn pump(socket: &mut Socket, shared: &Shared, cmd_rx: &Receiver<RelayCommand>) {
    loop {
        // Drain every queued command before blocking on the read.
        loop {
            match cmd_rx.try_recv() {
                Ok(RelayCommand::Send(msg)) => {
                    if let Err(e) = socket.send(Message::Text(msg)) {
                        log::error!("Relay send error: {}", e);
                        return;
                    }
                }
                Ok(RelayCommand::Close) => {
                    log::info!("Relay close requested");
                    let _ = socket.close(None);
                    return;
                }
                Err(TryRecvError::Disconnected) => return,
                Err(TryRecvError::Empty) => break,
            }
        }

        match socket.read() {
            Ok(Message::Text(txt)) => shared.handle_text(&txt),
            Ok(Message::Ping(data)) => {
                let _ = socket.send(Message::Pong(data));
            }
            Ok(Message::Close(_)) => {
                log::info!("Relay sent close frame");
                return;
            }
            Ok(_) => {}
            Err(tungstenite::Error::Io(ref e))
                if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                log::error!("Relay read error: {}", e);
                return;
            }
        }
    }
}

impl RelayTransport {
    /// Connect to a relay at a `ws://` or `wss://` URL.
    ///
    /// Returns once the background thread is started; the connection itself
    /// completes asynchronously and is reflected in [`Self::state`].
    pub fn connect(url: &str) -> TransportResult<Self> {
        let parsed_url = Url::parse(url).map_err(|e| TransportError::Send(format!("Invalid URL: {}", e)))?;
        if parsed_url.scheme() != "ws" && parsed_url.scheme() != "wss" {
            return Err(TransportError::Send(format!(
                "Invalid WebSocket URL scheme: {}",
                parsed_url.scheme()
            )));
        }

        let transport = Self {
            url: url.to_string(),
            shared: Arc::new(Shared {
                state: Mutex::new(ConnectionState::Connecting),
                sinks: Mutex::new(HashMap::new()),
                confirmed: Mutex::new(HashSet::new()),
                next_subscription: AtomicU64::new(1),
            }),
            link: Mutex::new(None),
            closed: AtomicBool::new(false),
        };
        *lock(&transport.link) = Some(transport.start_link());
        Ok(transport)
    }

    fn start_link(&self) -> Link {
        let (cmd_tx, cmd_rx) = channel::<RelayCommand>();
        self.shared.set_state(ConnectionState::Connecting);
        let shared = self.shared.clone();
        let url = self.url.clone();
        let handle = thread::spawn(move || run_socket(&url, &shared, cmd_rx));
        Link {
            cmd_tx,
            started: Instant::now(),
            _thread: handle,
        }
    }

    /// Start a new socket thread if the previous one has exited.
    fn ensure_connected(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut link = lock(&self.link);
        if !matches!(self.state(), ConnectionState::Error | ConnectionState::Disconnected) {
            return;
        }
        if link.as_ref().is_some_and(|l| l.started.elapsed() < RECONNECT_INTERVAL) {
            return;
        }
        log::info!("Reconnecting to relay {}", self.url);
        *link = Some(self.start_link());
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    fn send_message(&self, msg: &ClientMessage) -> TransportResult<()> {
        let json = encode(msg)?;
        let guard = lock(&self.link);
        let link = guard.as_ref().ok_or(TransportError::Closed)?;
        link.cmd_tx.send(RelayCommand::Send(json)).map_err(|_| TransportError::Closed)
    }

    /// Close the socket. Further calls fail with [`TransportError::Closed`].
    pub fn disconnect(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(link) = lock(&self.link).take() {
            let _ = link.cmd_tx.send(RelayCommand::Close);
        }
    }
}

impl Transport for RelayTransport {
    fn subscribe(&self, topic: &str, sink: OperationSink) -> TransportResult<SubscriptionId> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let id = SubscriptionId(self.shared.next_subscription.fetch_add(1, Ordering::Relaxed));
        let first = {
            let mut sinks = lock(&self.shared.sinks);
            let entry = sinks.entry(topic.to_string()).or_default();
            entry.push((id, sink));
            entry.len() == 1
        };

        // Otherwise the socket thread subscribes every known topic on connect.
        if first && self.state() == ConnectionState::Connected {
            if let Err(e) = self.send_message(&ClientMessage::Subscribe { topic: topic.to_string() }) {
                log::debug!("Subscribe to {} deferred: {}", topic, e);
            }
        }
        self.ensure_connected();
        Ok(id)
    }

    fn unsubscribe(&self, topic: &str, subscription: SubscriptionId) {
        let now_empty = {
            let mut sinks = lock(&self.shared.sinks);
            match sinks.get_mut(topic) {
                Some(subs) => {
                    subs.retain(|(id, _)| *id != subscription);
                    if subs.is_empty() {
                        sinks.remove(topic);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };

        if now_empty {
            lock(&self.shared.confirmed).remove(topic);
            if self.state() == ConnectionState::Connected {
                let _ = self.send_message(&ClientMessage::Unsubscribe { topic: topic.to_string() });
            }
        }
    }

    fn publish(&self, topic: &str, operation: &Operation) -> TransportResult<()> {
        if self.state() != ConnectionState::Connected {
            self.ensure_connected();
            return Err(TransportError::Disconnected(topic.to_string()));
        }
        let operation = operation.to_value().map_err(|e| TransportError::Encode(e.to_string()))?;
        self.send_message(&ClientMessage::Publish {
            topic: topic.to_string(),
            operation,
        })
    }

    fn connection_status(&self, topic: &str) -> ConnectionStatus {
        self.ensure_connected();
        ConnectionStatus {
            is_connected: self.state() == ConnectionState::Connected
                && lock(&self.shared.confirmed).contains(topic),
        }
    }
}

impl Drop for RelayTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationKind;

    #[test]
    fn test_rejects_non_websocket_url() {
        assert!(RelayTransport::connect("http://localhost:3030/ws").is_err());
        assert!(RelayTransport::connect("not a url").is_err());
    }

    #[test]
    fn test_shared_delivers_decoded_operations() {
        let shared = Shared {
            state: Mutex::new(ConnectionState::Connected),
            sinks: Mutex::new(HashMap::new()),
            confirmed: Mutex::new(HashSet::new()),
            next_subscription: AtomicU64::new(1),
        };
        let (tx, rx) = channel();
        let tx = Mutex::new(tx);
        let sink: OperationSink = Arc::new(move |op| {
            let _ = tx.lock().unwrap().send(op);
        });
        lock(&shared.sinks).insert("t".to_string(), vec![(SubscriptionId(1), sink)]);

        let op = Operation::stamp(OperationKind::Redo, "peer");
        let msg = ServerMessage::Operation {
            topic: "t".to_string(),
            from: "relay-peer".to_string(),
            operation: op.to_value().unwrap(),
        };
        shared.handle_text(&serde_json::to_string(&msg).unwrap());
        assert_eq!(rx.try_recv().unwrap(), op);

        // Unknown kinds are dropped, not delivered.
        let unknown = r#"{"type":"operation","topic":"t","from":"p","operation":{"id":"x","timestamp":1,"sender_id":"s","operation_type":"laser"}}"#;
        shared.handle_text(unknown);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_subscribed_marks_topic_confirmed() {
        let shared = Shared {
            state: Mutex::new(ConnectionState::Connected),
            sinks: Mutex::new(HashMap::new()),
            confirmed: Mutex::new(HashSet::new()),
            next_subscription: AtomicU64::new(1),
        };
        shared.handle_text(r#"{"type":"subscribed","topic":"t","subscriber_count":1}"#);
        assert!(lock(&shared.confirmed).contains("t"));
        shared.handle_text(r#"{"type":"unsubscribed","topic":"t"}"#);
        assert!(!lock(&shared.confirmed).contains("t"));
    }

    fn unused_port_url() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        format!("ws://127.0.0.1:{}/ws", port)
    }

    fn wait_for_state(transport: &RelayTransport, state: ConnectionState) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while transport.state() != state {
            assert!(Instant::now() < deadline, "transport never reached {:?}", state);
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn link_started(transport: &RelayTransport) -> Option<Instant> {
        lock(&transport.link).as_ref().map(|link| link.started)
    }

    #[test]
    fn test_failed_connect_is_retried() {
        let transport = RelayTransport::connect(&unused_port_url()).unwrap();
        wait_for_state(&transport, ConnectionState::Error);

        // Subscriptions made while offline are kept for the next socket.
        let sink: OperationSink = Arc::new(|_| {});
        assert!(transport.subscribe("t", sink).is_ok());
        assert!(lock(&transport.shared.sinks).contains_key("t"));
        assert!(!transport.connection_status("t").is_connected);

        let first_attempt = link_started(&transport).unwrap();
        thread::sleep(RECONNECT_INTERVAL + Duration::from_millis(50));
        transport.connection_status("t");
        assert!(link_started(&transport).unwrap() > first_attempt);
    }

    #[test]
    fn test_disconnect_stops_reconnects() {
        let transport = RelayTransport::connect(&unused_port_url()).unwrap();
        wait_for_state(&transport, ConnectionState::Error);
        transport.disconnect();

        thread::sleep(RECONNECT_INTERVAL + Duration::from_millis(50));
        assert!(!transport.connection_status("t").is_connected);
        assert!(link_started(&transport).is_none());

        let sink: OperationSink = Arc::new(|_| {});
        assert!(matches!(transport.subscribe("t", sink), Err(TransportError::Closed)));
    }
}
