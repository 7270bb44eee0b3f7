//! Process-wide channel registry.
//!
//! Board instances that resolve to the same topic share one transport
//! subscription. The registry keeps, per topic, the set of local handlers and
//! the subscription, and fans operations out between them:
//!
//! - an operation sent by a local board reaches every *other* local handler on
//!   the topic and is published to the transport for remote peers;
//! - an operation delivered by the transport reaches every local handler.
//!
//! In both cases a handler never receives an operation carrying its own
//! sender id.
//!
//! Create one registry per process, wrap it in an [`Arc`] and hand it to every
//! board.

use crate::direction::SyncConfig;
use crate::operation::{Operation, OperationKind};
use crate::transport::{ConnectionStatus, OperationSink, SubscriptionId, Transport};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Identifies one registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Result of registering a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub handler_id: HandlerId,
    pub is_connected: bool,
}

struct Handler {
    id: HandlerId,
    sender_id: String,
    sink: Sender<Operation>,
}

#[derive(Default)]
struct Channel {
    handlers: Vec<Handler>,
    subscription: Option<SubscriptionId>,
}

impl Channel {
    /// Deliver to every handler not owned by the operation's sender.
    fn fan_out(&self, operation: &Operation) -> usize {
        let mut delivered = 0;
        for handler in &self.handlers {
            if handler.sender_id == operation.sender_id {
                continue;
            }
            if handler.sink.send(operation.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

type Channels = Mutex<HashMap<String, Channel>>;

fn lock(channels: &Channels) -> MutexGuard<'_, HashMap<String, Channel>> {
    channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Topic → handlers map with lazily created transport subscriptions.
pub struct ChannelRegistry {
    transport: Arc<dyn Transport>,
    channels: Arc<Channels>,
    next_handler: AtomicU64,
}

impl ChannelRegistry {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            channels: Arc::new(Mutex::new(HashMap::new())),
            next_handler: AtomicU64::new(1),
        }
    }

    /// Add a handler for `config.topic`, subscribing on the transport if this
    /// is the first one.
    pub fn register_handler(&self, config: &SyncConfig, sink: Sender<Operation>) -> Registration {
        let handler_id = HandlerId(self.next_handler.fetch_add(1, Ordering::Relaxed));
        {
            let mut channels = lock(&self.channels);
            channels
                .entry(config.topic.clone())
                .or_default()
                .handlers
                .push(Handler {
                    id: handler_id,
                    sender_id: config.sender_id.clone(),
                    sink,
                });
        }
        log::debug!("Registered handler {:?} on {}", handler_id, config.topic);

        self.ensure_subscription(&config.topic);
        Registration {
            handler_id,
            is_connected: self.transport.connection_status(&config.topic).is_connected,
        }
    }

    /// Remove a handler. Releases the transport subscription once the topic
    /// has no handlers left. Unknown handlers are ignored.
    pub fn unregister_handler(&self, config: &SyncConfig, handler_id: HandlerId) {
        let released = {
            let mut channels = lock(&self.channels);
            let Some(channel) = channels.get_mut(&config.topic) else {
                return;
            };
            channel.handlers.retain(|h| h.id != handler_id);
            if channel.handlers.is_empty() {
                channels.remove(&config.topic).and_then(|c| c.subscription)
            } else {
                None
            }
        };

        log::debug!("Unregistered handler {:?} from {}", handler_id, config.topic);
        if let Some(subscription) = released {
            log::info!("Releasing subscription for {}", config.topic);
            self.transport.unsubscribe(&config.topic, subscription);
        }
    }

    /// Move a handler from `old` to `new`.
    ///
    /// On an unchanged topic the handler is updated in place and the transport
    /// subscription is untouched. Otherwise the new topic is registered before
    /// the old one is released.
    pub fn rebind_handler(
        &self,
        old: &SyncConfig,
        handler_id: HandlerId,
        new: &SyncConfig,
        sink: Sender<Operation>,
    ) -> Registration {
        if old.topic == new.topic {
            let rebound = {
                let mut channels = lock(&self.channels);
                let handler = channels
                    .get_mut(&new.topic)
                    .and_then(|c| c.handlers.iter_mut().find(|h| h.id == handler_id));
                match handler {
                    Some(handler) => {
                        handler.sender_id = new.sender_id.clone();
                        true
                    }
                    None => false,
                }
            };
            if rebound {
                log::debug!("Rebound handler {:?} on {}", handler_id, new.topic);
                return Registration {
                    handler_id,
                    is_connected: self.connection_status(new).is_connected,
                };
            }
        }

        let registration = self.register_handler(new, sink);
        self.unregister_handler(old, handler_id);
        registration
    }

    /// Stamp and publish an operation.
    ///
    /// Returns `None` when the config is receive-only or the transport
    /// rejects the publish; failed sends are not retried.
    pub fn send_operation(&self, config: &SyncConfig, kind: OperationKind) -> Option<Operation> {
        if config.is_receive_only {
            log::debug!("Refusing to send {} on receive-only {}", kind.name(), config.topic);
            return None;
        }

        let operation = Operation::stamp(kind, &config.sender_id);
        if let Err(e) = self.transport.publish(&config.topic, &operation) {
            log::warn!("Failed to publish {} to {}: {}", operation.kind.name(), config.topic, e);
            return None;
        }

        let delivered = lock(&self.channels)
            .get(&config.topic)
            .map_or(0, |channel| channel.fan_out(&operation));
        log::debug!(
            "Sent {} on {} ({} local handler(s))",
            operation.kind.name(),
            config.topic,
            delivered
        );

        Some(operation)
    }

    /// Current connectivity for a topic.
    ///
    /// Retries the transport subscription if an earlier attempt failed.
    pub fn connection_status(&self, config: &SyncConfig) -> ConnectionStatus {
        self.ensure_subscription(&config.topic);
        self.transport.connection_status(&config.topic)
    }

    /// Number of handlers registered on a topic.
    pub fn handler_count(&self, topic: &str) -> usize {
        lock(&self.channels).get(topic).map_or(0, |c| c.handlers.len())
    }

    /// Topics with at least one registered handler.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = lock(&self.channels).keys().cloned().collect();
        topics.sort();
        topics
    }

    fn ensure_subscription(&self, topic: &str) {
        let needed = lock(&self.channels)
            .get(topic)
            .is_some_and(|c| c.subscription.is_none() && !c.handlers.is_empty());
        if !needed {
            return;
        }

        // The transport is called without the channel lock held: a synchronous
        // transport may deliver straight back into our sink.
        let sink = Self::sink_for(Arc::downgrade(&self.channels), topic.to_string());
        match self.transport.subscribe(topic, sink) {
            Ok(subscription) => {
                let mut channels = lock(&self.channels);
                match channels.get_mut(topic) {
                    Some(channel) if channel.subscription.is_none() => {
                        channel.subscription = Some(subscription);
                        log::info!("Subscribed to {}", topic);
                    }
                    _ => {
                        // Lost a race with another registration or the topic
                        // emptied meanwhile.
                        drop(channels);
                        self.transport.unsubscribe(topic, subscription);
                    }
                }
            }
            Err(e) => {
                log::warn!("Subscribe to {} failed, will retry: {}", topic, e);
            }
        }
    }

    fn sink_for(channels: Weak<Channels>, topic: String) -> OperationSink {
        Arc::new(move |operation: Operation| {
            let Some(channels) = channels.upgrade() else {
                return;
            };
            if let Some(channel) = lock(&channels).get(&topic) {
                channel.fan_out(&operation);
            }
        })
    }
}

impl Drop for ChannelRegistry {
    fn drop(&mut self) {
        let subscriptions: Vec<(String, SubscriptionId)> = lock(&self.channels)
            .drain()
            .filter_map(|(topic, channel)| channel.subscription.map(|s| (topic, s)))
            .collect();
        for (topic, subscription) in subscriptions {
            self.transport.unsubscribe(&topic, subscription);
        }
    }
}
