//! Publish/subscribe transport abstraction.
//!
//! The channel registry talks to the network only through [`Transport`].
//! A transport delivers a published operation to every subscription on the
//! topic held by *other* connections; fan-out between handlers sharing one
//! connection is the registry's job.

mod memory;

#[cfg(not(target_arch = "wasm32"))]
mod relay;

pub use memory::{MemoryHub, MemoryTransport};

#[cfg(not(target_arch = "wasm32"))]
pub use relay::RelayTransport;

use crate::operation::Operation;
use std::sync::Arc;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Not connected to topic: {0}")]
    Disconnected(String),
    #[error("Send failed: {0}")]
    Send(String),
    #[error("Encoding error: {0}")]
    Encode(String),
    #[error("Transport closed")]
    Closed,
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Callback invoked by a transport for each inbound operation.
///
/// May be called from a background thread.
pub type OperationSink = Arc<dyn Fn(Operation) + Send + Sync>;

/// Identifies one subscription within a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

/// Connectivity snapshot for a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionStatus {
    pub is_connected: bool,
}

/// A topic-keyed publish/subscribe channel.
pub trait Transport: Send + Sync {
    /// Subscribe to a topic, connecting lazily if needed.
    fn subscribe(&self, topic: &str, sink: OperationSink) -> TransportResult<SubscriptionId>;

    /// Drop a subscription. Unknown ids are ignored.
    fn unsubscribe(&self, topic: &str, subscription: SubscriptionId);

    /// Publish an operation to everyone else subscribed to `topic`.
    fn publish(&self, topic: &str, operation: &Operation) -> TransportResult<()>;

    /// Non-blocking connectivity query.
    fn connection_status(&self, topic: &str) -> ConnectionStatus;
}
