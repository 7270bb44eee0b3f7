//! Classboard WebSocket Relay Server
//!
//! Forwards board operations between clients subscribed to the same topic.
//! A connection may subscribe to any number of topics; a publish reaches every
//! other connection subscribed to the topic, never the publisher itself.
//!
//! ## Protocol
//!
//! Messages are JSON tagged by `type`:
//! ```json
//! { "type": "subscribe", "topic": "session-s1-main" }
//! { "type": "publish", "topic": "session-s1-main", "operation": { ... } }
//! ```
//! See [`classboard_core::protocol`] for the full message set.

pub mod config;

pub use config::{ConfigError, RelayConfig};

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use classboard_core::protocol::{ClientMessage, ServerMessage};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// An operation on its way to a topic's subscribers.
#[derive(Debug, Clone)]
struct Envelope {
    from: String,
    message: ServerMessage,
}

struct Topic {
    tx: broadcast::Sender<Envelope>,
    subscribers: HashSet<String>,
}

impl Topic {
    fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            subscribers: HashSet::new(),
        }
    }
}

/// Shared relay state
pub struct AppState {
    topics: DashMap<String, Topic>,
    channel_capacity: usize,
}

impl AppState {
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            channel_capacity: channel_capacity.max(1),
        }
    }

    /// Add a peer to a topic, creating it if needed.
    fn subscribe(&self, topic: &str, peer_id: &str) -> (broadcast::Receiver<Envelope>, usize) {
        let mut entry = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic::new(self.channel_capacity));
        entry.subscribers.insert(peer_id.to_string());
        (entry.tx.subscribe(), entry.subscribers.len())
    }

    /// Remove a peer from a topic, dropping the topic once empty.
    fn unsubscribe(&self, topic: &str, peer_id: &str) {
        if let Some(mut entry) = self.topics.get_mut(topic) {
            entry.subscribers.remove(peer_id);
        }
        self.topics.remove_if(topic, |_, t| t.subscribers.is_empty());
    }

    /// Forward an operation to the topic. Returns the number of other
    /// subscribers it was offered to.
    fn publish(&self, topic: &str, from: &str, operation: serde_json::Value) -> usize {
        let Some(entry) = self.topics.get(topic) else {
            return 0;
        };
        let recipients = entry.subscribers.iter().filter(|p| p.as_str() != from).count();
        let envelope = Envelope {
            from: from.to_string(),
            message: ServerMessage::Operation {
                topic: topic.to_string(),
                from: from.to_string(),
                operation,
            },
        };
        // Err only means nobody is listening.
        let _ = entry.tx.send(envelope);
        recipients
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, |t| t.subscribers.len())
    }
}

/// Build the relay router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn serve(config: RelayConfig) -> std::io::Result<()> {
    let state = Arc::new(AppState::new(config.channel_capacity));
    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    info!("Classboard relay listening on {}", listener.local_addr()?);
    info!("WebSocket endpoint: ws://{}/ws", listener.local_addr()?);
    axum::serve(listener, app(state)).await
}

/// Index page
async fn index() -> &'static str {
    "Classboard Relay Server - Connect via WebSocket at /ws"
}

/// Health check
async fn health() -> &'static str {
    "ok"
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

type Outbound = SplitSink<WebSocket, Message>;

/// Serialize and send one message. Returns `false` once the socket is gone.
async fn send_message(sender: &mut Outbound, msg: &ServerMessage) -> bool {
    let json = match serde_json::to_string(msg) {
        Ok(json) => json,
        Err(e) => {
            warn!("Failed to encode server message: {}", e);
            return true;
        }
    };
    sender.send(Message::Text(json.into())).await.is_ok()
}

/// Pump one topic's broadcasts into the connection's outbound queue,
/// skipping the connection's own publishes. A lagging peer is told how many
/// operations it missed.
fn spawn_forwarder(
    mut rx: broadcast::Receiver<Envelope>,
    topic: String,
    peer_id: String,
    out_tx: mpsc::UnboundedSender<ServerMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(envelope) => {
                    if envelope.from == peer_id {
                        continue;
                    }
                    if out_tx.send(envelope.message).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Peer {} lagging on {}, skipped {} operation(s)", peer_id, topic, skipped);
                    let notice = ServerMessage::Error {
                        message: format!("Missed {} operation(s) on {}; board may be out of sync", skipped, topic),
                    };
                    if out_tx.send(notice).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Connection-local subscription bookkeeping.
struct Connection {
    peer_id: String,
    out_tx: mpsc::UnboundedSender<ServerMessage>,
    subscriptions: HashMap<String, JoinHandle<()>>,
}

impl Connection {
    fn handle(&mut self, state: &AppState, msg: ClientMessage) -> Option<ServerMessage> {
        match msg {
            ClientMessage::Subscribe { topic } => {
                if self.subscriptions.contains_key(&topic) {
                    let subscriber_count = state.subscriber_count(&topic);
                    return Some(ServerMessage::Subscribed { topic, subscriber_count });
                }
                let (rx, subscriber_count) = state.subscribe(&topic, &self.peer_id);
                let task = spawn_forwarder(rx, topic.clone(), self.peer_id.clone(), self.out_tx.clone());
                self.subscriptions.insert(topic.clone(), task);
                info!("Peer {} subscribed to {} ({} subscribers)", self.peer_id, topic, subscriber_count);
                Some(ServerMessage::Subscribed { topic, subscriber_count })
            }
            ClientMessage::Unsubscribe { topic } => {
                if let Some(task) = self.subscriptions.remove(&topic) {
                    task.abort();
                    state.unsubscribe(&topic, &self.peer_id);
                    info!("Peer {} unsubscribed from {}", self.peer_id, topic);
                }
                Some(ServerMessage::Unsubscribed { topic })
            }
            ClientMessage::Publish { topic, operation } => {
                let recipients = state.publish(&topic, &self.peer_id, operation);
                debug!("Peer {} published to {} ({} recipients)", self.peer_id, topic, recipients);
                None
            }
        }
    }

    fn close(&mut self, state: &AppState) {
        for (topic, task) in self.subscriptions.drain() {
            task.abort();
            state.unsubscribe(&topic, &self.peer_id);
        }
    }
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let peer_id = Uuid::new_v4().to_string();
    info!("New connection: {}", peer_id);

    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let mut connection = Connection {
        peer_id,
        out_tx,
        subscriptions: HashMap::new(),
    };

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = match ClientMessage::decode(text.as_str()) {
                            Ok(client_msg) => connection.handle(&state, client_msg),
                            Err(e) => {
                                warn!("Invalid message from {}: {}", connection.peer_id, e);
                                Some(ServerMessage::Error {
                                    message: format!("Invalid message: {}", e),
                                })
                            }
                        };
                        if let Some(reply) = reply {
                            if !send_message(&mut sender, &reply).await {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // Ignore binary and ping/pong
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {}", connection.peer_id, e);
                        break;
                    }
                }
            }

            Some(outbound) = out_rx.recv() => {
                if !send_message(&mut sender, &outbound).await {
                    break;
                }
            }
        }
    }

    connection.close(&state);
    info!("Connection closed: {}", connection.peer_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_subscribe_counts_peers() {
        let state = AppState::new(8);
        let (_rx1, count) = state.subscribe("t", "a");
        assert_eq!(count, 1);
        let (_rx2, count) = state.subscribe("t", "b");
        assert_eq!(count, 2);
        assert_eq!(state.topic_count(), 1);
    }

    #[test]
    fn test_empty_topic_is_removed() {
        let state = AppState::new(8);
        let _rx_a = state.subscribe("t", "a");
        let _rx_b = state.subscribe("t", "b");

        state.unsubscribe("t", "a");
        assert_eq!(state.subscriber_count("t"), 1);
        state.unsubscribe("t", "b");
        assert_eq!(state.topic_count(), 0);

        // Unknown topics are ignored.
        state.unsubscribe("missing", "a");
    }

    #[test]
    fn test_publish_reaches_topic_receivers() {
        let state = AppState::new(8);
        let (mut rx, _) = state.subscribe("t", "a");
        let _other = state.subscribe("t", "b");

        let recipients = state.publish("t", "b", json!({"operation_type": "undo"}));
        assert_eq!(recipients, 1);

        let envelope = rx.try_recv().unwrap();
        assert_eq!(envelope.from, "b");
        match envelope.message {
            ServerMessage::Operation { topic, operation, .. } => {
                assert_eq!(topic, "t");
                assert_eq!(operation["operation_type"], "undo");
            }
            other => panic!("Unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_publish_to_unknown_topic() {
        let state = AppState::new(8);
        assert_eq!(state.publish("nobody", "a", json!({})), 0);
        assert_eq!(state.topic_count(), 0);
    }

    #[tokio::test]
    async fn test_forwarder_skips_own_publishes() {
        let state = AppState::new(8);
        let (rx, _) = state.subscribe("t", "a");
        let _b = state.subscribe("t", "b");
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let task = spawn_forwarder(rx, "t".to_string(), "a".to_string(), out_tx);

        state.publish("t", "a", json!({"n": 1}));
        state.publish("t", "b", json!({"n": 2}));

        match out_rx.recv().await.unwrap() {
            ServerMessage::Operation { from, operation, .. } => {
                assert_eq!(from, "b");
                assert_eq!(operation["n"], 2);
            }
            other => panic!("Unexpected message: {:?}", other),
        }
        task.abort();
    }

    #[tokio::test]
    async fn test_forwarder_reports_lag() {
        let state = AppState::new(1);
        let (rx, _) = state.subscribe("t", "a");
        let _b = state.subscribe("t", "b");
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let task = spawn_forwarder(rx, "t".to_string(), "a".to_string(), out_tx);

        // The forwarder has not run yet, so only the last one is buffered.
        for n in 1..=3 {
            state.publish("t", "b", json!({"n": n}));
        }

        match out_rx.recv().await.unwrap() {
            ServerMessage::Error { message } => {
                assert!(message.contains("Missed 2 operation(s) on t"), "{}", message);
            }
            other => panic!("Unexpected message: {:?}", other),
        }
        match out_rx.recv().await.unwrap() {
            ServerMessage::Operation { operation, .. } => assert_eq!(operation["n"], 3),
            other => panic!("Unexpected message: {:?}", other),
        }
        task.abort();
    }

    #[tokio::test]
    async fn test_connection_lifecycle() {
        let state = AppState::new(8);
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let mut connection = Connection {
            peer_id: "a".to_string(),
            out_tx,
            subscriptions: HashMap::new(),
        };

        let reply = connection.handle(&state, ClientMessage::Subscribe { topic: "t1".to_string() });
        assert_eq!(
            reply,
            Some(ServerMessage::Subscribed {
                topic: "t1".to_string(),
                subscriber_count: 1
            })
        );
        connection.handle(&state, ClientMessage::Subscribe { topic: "t2".to_string() });
        // Re-subscribing is idempotent.
        connection.handle(&state, ClientMessage::Subscribe { topic: "t1".to_string() });
        assert_eq!(state.subscriber_count("t1"), 1);
        assert_eq!(state.topic_count(), 2);

        let reply = connection.handle(&state, ClientMessage::Unsubscribe { topic: "t2".to_string() });
        assert_eq!(reply, Some(ServerMessage::Unsubscribed { topic: "t2".to_string() }));
        assert_eq!(state.topic_count(), 1);

        connection.close(&state);
        assert_eq!(state.topic_count(), 0);
    }
}
