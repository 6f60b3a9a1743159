// src/connection/watchdog.rs

//! The connection watchdog: tracks the live connections of a group and
//! replaces the ones that close unexpectedly.
//!
//! It is resilient in the same way a replica's link to its primary is: after
//! an unexpected close it waits according to the configured
//! [`ReconnectPolicy`] and opens a fresh connection to the same address, with
//! the same initializer and the same kind.

use super::handle::{Connection, Subscriptions};
use super::initializer::ConnectionInitializer;
use crate::config::ReconnectPolicy;
use crate::core::ClientError;
use crate::core::protocol::ConnectionKind;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{Notify, broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Reported by a connection's I/O task when it ends.
#[derive(Debug, Clone)]
pub struct ClosedEvent {
    pub id: u64,
    pub kind: ConnectionKind,
    pub cause: ClientError,
    /// The close was requested locally through `Connection::close`.
    pub explicit: bool,
    /// The connection had become ready before it closed.
    pub was_active: bool,
    /// What the connection was subscribed to when it closed.
    pub subscriptions: Subscriptions,
}

/// The set of live connections of one group.
///
/// Connections add themselves once ready and remove themselves on close.
/// Backed by a `DashMap` so pools can read it while connections come and go.
/// Once closed, the registry turns every new connection away.
#[derive(Debug, Clone, Default)]
pub struct WatchdogRegistry {
    connections: Arc<DashMap<u64, Connection>>,
    changed: Arc<Notify>,
    closed: Arc<Mutex<bool>>,
}

impl WatchdogRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a ready connection. Returns `false`, leaving the registry
    /// untouched, if the registry was closed.
    pub(crate) fn insert(&self, connection: Connection) -> bool {
        let closed = self.closed.lock();
        if *closed {
            return false;
        }
        self.connections.insert(connection.id(), connection);
        drop(closed);
        self.changed.notify_waiters();
        true
    }

    /// Refuses every later registration and returns the connections
    /// registered so far.
    pub fn close(&self) -> Vec<Connection> {
        *self.closed.lock() = true;
        self.connections()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }

    pub(crate) fn remove(&self, id: u64) -> Option<Connection> {
        let removed = self.connections.remove(&id).map(|(_, c)| c);
        if removed.is_some() {
            self.changed.notify_waiters();
        }
        removed
    }

    pub fn get(&self, id: u64) -> Option<Connection> {
        self.connections.get(&id).map(|c| c.value().clone())
    }

    pub fn contains(&self, id: u64) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// A snapshot of the live connections, ordered by id.
    pub fn connections(&self) -> Vec<Connection> {
        let mut all: Vec<Connection> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by_key(Connection::id);
        all
    }

    /// Resolves the next time a connection joins or leaves the group.
    pub async fn changed(&self) {
        self.changed.notified().await;
    }
}

/// What an initializer holds to register its connections with a watchdog.
#[derive(Debug, Clone)]
pub struct WatchdogHandle {
    registry: WatchdogRegistry,
    events: mpsc::UnboundedSender<ClosedEvent>,
}

impl WatchdogHandle {
    pub fn registry(&self) -> &WatchdogRegistry {
        &self.registry
    }

    pub(crate) fn notify_closed(&self, event: ClosedEvent) {
        if self.events.send(event).is_err() {
            debug!("Watchdog is gone, close event dropped.");
        }
    }
}

/// Watches close events and reconnects.
pub struct ConnectionWatchdog {
    initializer: Arc<ConnectionInitializer>,
    events: mpsc::UnboundedReceiver<ClosedEvent>,
    policy: ReconnectPolicy,
}

impl ConnectionWatchdog {
    /// Creates the registry-side handle and the event stream a watchdog
    /// consumes. The handle goes into the initializer.
    pub fn channel(registry: WatchdogRegistry) -> (WatchdogHandle, mpsc::UnboundedReceiver<ClosedEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (WatchdogHandle { registry, events }, rx)
    }

    pub fn new(
        initializer: Arc<ConnectionInitializer>,
        events: mpsc::UnboundedReceiver<ClosedEvent>,
    ) -> Self {
        let policy = initializer.config().reconnect;
        Self {
            initializer,
            events,
            policy,
        }
    }

    /// Runs until `shutdown_rx` fires. Pending reconnect attempts are
    /// cancelled on shutdown.
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        let address = self.initializer.config().address.clone();
        info!("Connection watchdog for {} started.", address);
        let mut reconnects = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    info!("Connection watchdog for {} shutting down.", address);
                    break;
                }
                event = self.events.recv() => {
                    let Some(event) = event else { break };
                    if event.explicit {
                        debug!("Connection {} was closed locally, not reconnecting.", event.id);
                        continue;
                    }
                    if !event.was_active {
                        debug!(
                            "Connection {} never became ready ({}), not reconnecting.",
                            event.id, event.cause
                        );
                        continue;
                    }
                    warn!(
                        "Connection {} to {} lost: {}. Scheduling reconnect.",
                        event.id, address, event.cause
                    );
                    reconnects.spawn(reconnect(
                        self.initializer.clone(),
                        event.kind,
                        event.subscriptions,
                        self.policy,
                        shutdown_rx.resubscribe(),
                    ));
                }
                Some(res) = reconnects.join_next(), if !reconnects.is_empty() => {
                    if let Err(e) = res {
                        error!("Reconnect task failed: {}", e);
                    }
                }
            }
        }

        reconnects.shutdown().await;
    }
}

/// Reconnects one lost connection, retrying as the policy allows.
async fn reconnect(
    initializer: Arc<ConnectionInitializer>,
    kind: ConnectionKind,
    subscriptions: Subscriptions,
    policy: ReconnectPolicy,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let address = initializer.config().address.clone();
    let mut attempt = 0u32;
    loop {
        let wait = policy.delay_for(attempt);
        info!("Will try to reconnect to {} in {:?}", address, wait);
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown_rx.recv() => {
                debug!("Reconnect to {} cancelled by shutdown.", address);
                return;
            }
        }

        match initializer.connect(kind).await {
            Ok(connection) => {
                info!(
                    "Reconnected to {} as connection {} after {} failed attempt(s).",
                    address,
                    connection.id(),
                    attempt
                );
                if kind == ConnectionKind::PubSub && !subscriptions.is_empty() {
                    resubscribe(&connection, &subscriptions).await;
                }
                return;
            }
            Err(e) => {
                attempt = attempt.saturating_add(1);
                warn!("Reconnect attempt {} to {} failed: {}", attempt, address, e);
                if !policy.allows(attempt) {
                    error!(
                        "Giving up on reconnecting to {} after {} attempt(s).",
                        address, attempt
                    );
                    return;
                }
            }
        }
    }
}

/// Restores the channels and patterns the lost connection was subscribed to.
async fn resubscribe(connection: &Connection, subscriptions: &Subscriptions) {
    if !subscriptions.channels.is_empty()
        && let Err(e) = connection.subscribe(&subscriptions.channels).await
    {
        warn!("Connection {}: resubscribing channels failed: {}", connection.id(), e);
    }
    if !subscriptions.patterns.is_empty()
        && let Err(e) = connection.psubscribe(&subscriptions.patterns).await
    {
        warn!("Connection {}: resubscribing patterns failed: {}", connection.id(), e);
    }
}
