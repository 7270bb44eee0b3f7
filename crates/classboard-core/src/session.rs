//! Per-board sync session.
//!
//! A session binds one board instance to one [`SyncConfig`]: it owns the
//! board's registration with the [`ChannelRegistry`], the inbox the registry
//! delivers into, and the observable [`SyncState`].

use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, TryRecvError, channel};
use std::time::Duration;

use web_time::Instant;

use crate::direction::SyncConfig;
use crate::operation::{Operation, OperationKind, now_millis};
use crate::registry::{ChannelRegistry, HandlerId};
use crate::settings::SyncSettings;

/// Observable synchronization state of one board.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncState {
    pub is_connected: bool,
    pub is_receive_only: bool,
    /// Milliseconds since the Unix epoch of the last send or receive.
    pub last_sync_timestamp: u64,
    /// Operations sent while the session believed it was disconnected.
    /// Cleared when connectivity returns; they are not re-sent.
    pub pending_operations: Vec<Operation>,
}

pub struct SyncSession {
    registry: Arc<ChannelRegistry>,
    config: SyncConfig,
    handler_id: HandlerId,
    inbox_tx: Sender<Operation>,
    inbox: Receiver<Operation>,
    state: SyncState,
    status_poll_interval: Duration,
    last_status_check: Instant,
}

impl SyncSession {
    /// Register with the registry under `config`.
    pub fn new(registry: Arc<ChannelRegistry>, config: SyncConfig, settings: &SyncSettings) -> Self {
        let (inbox_tx, inbox) = channel();
        let registration = registry.register_handler(&config, inbox_tx.clone());
        log::info!(
            "Sync session on {} as {} ({})",
            config.topic,
            config.sender_id,
            if config.is_receive_only { "receive-only" } else { "writable" }
        );

        let state = SyncState {
            is_connected: registration.is_connected,
            is_receive_only: config.is_receive_only,
            last_sync_timestamp: now_millis(),
            pending_operations: Vec::new(),
        };

        Self {
            registry,
            config,
            handler_id: registration.handler_id,
            inbox_tx,
            inbox,
            state,
            status_poll_interval: settings.status_poll_interval,
            last_status_check: Instant::now(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    /// Send an operation to the topic.
    pub fn send(&mut self, kind: OperationKind) -> Option<Operation> {
        if self.config.is_receive_only {
            log::debug!("Not sending {}: {} is receive-only", kind.name(), self.config.topic);
            return None;
        }

        let operation = self.registry.send_operation(&self.config, kind)?;
        self.state.last_sync_timestamp = now_millis();
        if !self.state.is_connected {
            self.state.pending_operations.push(operation.clone());
        }
        Some(operation)
    }

    /// Drain received operations into `on_receive`, oldest first, then
    /// re-check connectivity if the poll interval has elapsed.
    ///
    /// Returns the number of operations forwarded.
    pub fn poll(&mut self, now: Instant, mut on_receive: impl FnMut(Operation)) -> usize {
        let mut received = 0;
        loop {
            match self.inbox.try_recv() {
                Ok(operation) => {
                    self.state.last_sync_timestamp = now_millis();
                    on_receive(operation);
                    received += 1;
                }
                Err(TryRecvError::Empty) => break,
                // Unreachable while we hold `inbox_tx`.
                Err(TryRecvError::Disconnected) => break,
            }
        }

        if now.saturating_duration_since(self.last_status_check) >= self.status_poll_interval {
            self.refresh_connection(now);
        }
        received
    }

    /// Query connectivity now. Returns `true` if it changed.
    pub fn refresh_connection(&mut self, now: Instant) -> bool {
        self.last_status_check = now;
        let status = self.registry.connection_status(&self.config);
        if status.is_connected == self.state.is_connected {
            return false;
        }

        self.state.is_connected = status.is_connected;
        if status.is_connected {
            log::info!("Reconnected to {}", self.config.topic);
            if !self.state.pending_operations.is_empty() {
                log::debug!(
                    "Discarding {} operation(s) sent while offline",
                    self.state.pending_operations.len()
                );
                self.state.pending_operations.clear();
            }
        } else {
            log::warn!("Lost connection to {}", self.config.topic);
        }
        true
    }

    /// Switch to a new config. Rebinds only if it differs from the current
    /// one; returns whether it did.
    pub fn update_config(&mut self, config: SyncConfig) -> bool {
        if config == self.config {
            return false;
        }

        let registration = self.registry.rebind_handler(
            &self.config,
            self.handler_id,
            &config,
            self.inbox_tx.clone(),
        );
        log::info!("Sync session moved from {} to {}", self.config.topic, config.topic);

        self.handler_id = registration.handler_id;
        // Same topic keeps its subscription, so connectivity is unchanged.
        if config.topic != self.config.topic {
            self.state.is_connected = registration.is_connected;
        }
        self.state.is_receive_only = config.is_receive_only;
        self.config = config;
        true
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        self.registry.unregister_handler(&self.config, self.handler_id);
    }
}
