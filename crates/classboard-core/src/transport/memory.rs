//! In-process transport.

use super::{
    ConnectionStatus, OperationSink, SubscriptionId, Transport, TransportError, TransportResult,
};
use crate::operation::Operation;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

struct HubSubscription {
    id: SubscriptionId,
    connection: u64,
    sink: OperationSink,
}

#[derive(Default)]
struct HubInner {
    next_connection: u64,
    next_subscription: u64,
    topics: HashMap<String, Vec<HubSubscription>>,
    offline: HashSet<u64>,
}

/// Shared in-memory pub/sub hub, standing in for a relay server.
///
/// Every [`MemoryTransport`] obtained from [`MemoryHub::connect`] behaves like
/// a separate client connection: a publish reaches the subscriptions of all
/// other connections on the topic, never the publisher's own.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubInner>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new connection to the hub.
    pub fn connect(&self) -> MemoryTransport {
        let connection = {
            let mut inner = self.lock();
            inner.next_connection += 1;
            inner.next_connection
        };
        MemoryTransport {
            hub: self.clone(),
            connection,
        }
    }

    /// Number of live subscriptions on a topic, across all connections.
    pub fn subscription_count(&self, topic: &str) -> usize {
        self.lock().topics.get(topic).map_or(0, Vec::len)
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        // A panicking sink must not wedge every other connection.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One connection to a [`MemoryHub`].
pub struct MemoryTransport {
    hub: MemoryHub,
    connection: u64,
}

impl MemoryTransport {
    /// Simulate the connection dropping or coming back.
    pub fn set_online(&self, online: bool) {
        let mut inner = self.hub.lock();
        if online {
            inner.offline.remove(&self.connection);
        } else {
            inner.offline.insert(self.connection);
        }
    }

    pub fn is_online(&self) -> bool {
        !self.hub.lock().offline.contains(&self.connection)
    }
}

impl Transport for MemoryTransport {
    fn subscribe(&self, topic: &str, sink: OperationSink) -> TransportResult<SubscriptionId> {
        let mut inner = self.hub.lock();
        if inner.offline.contains(&self.connection) {
            return Err(TransportError::Disconnected(topic.to_string()));
        }

        inner.next_subscription += 1;
        let id = SubscriptionId(inner.next_subscription);
        inner
            .topics
            .entry(topic.to_string())
            .or_default()
            .push(HubSubscription {
                id,
                connection: self.connection,
                sink,
            });
        Ok(id)
    }

    fn unsubscribe(&self, topic: &str, subscription: SubscriptionId) {
        let mut inner = self.hub.lock();
        if let Some(subs) = inner.topics.get_mut(topic) {
            subs.retain(|s| s.id != subscription);
            if subs.is_empty() {
                inner.topics.remove(topic);
            }
        }
    }

    fn publish(&self, topic: &str, operation: &Operation) -> TransportResult<()> {
        let sinks: Vec<OperationSink> = {
            let inner = self.hub.lock();
            if inner.offline.contains(&self.connection) {
                return Err(TransportError::Disconnected(topic.to_string()));
            }
            inner
                .topics
                .get(topic)
                .map(|subs| {
                    subs.iter()
                        .filter(|s| s.connection != self.connection)
                        .filter(|s| !inner.offline.contains(&s.connection))
                        .map(|s| s.sink.clone())
                        .collect()
                })
                .unwrap_or_default()
        };

        // Sinks run without the hub lock held so they may call back in.
        for sink in sinks {
            sink(operation.clone());
        }
        Ok(())
    }

    fn connection_status(&self, topic: &str) -> ConnectionStatus {
        let inner = self.hub.lock();
        let subscribed = inner
            .topics
            .get(topic)
            .is_some_and(|subs| subs.iter().any(|s| s.connection == self.connection));
        ConnectionStatus {
            is_connected: subscribed && !inner.offline.contains(&self.connection),
        }
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        let mut inner = self.hub.lock();
        let connection = self.connection;
        inner.topics.retain(|_, subs| {
            subs.retain(|s| s.connection != connection);
            !subs.is_empty()
        });
        inner.offline.remove(&connection);
    }
}
