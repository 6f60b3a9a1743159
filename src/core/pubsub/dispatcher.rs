// src/core/pubsub/dispatcher.rs

//! Routes push messages decoded on PubSub connections to registered listeners.

use super::{PushExecutor, PushKind, PushMessage};
use bytes::Bytes;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A subscriber callback. It runs on the configured [`PushExecutor`], never on
/// the connection's I/O task.
pub type Listener = Arc<dyn Fn(PushMessage) + Send + Sync>;

/// Identifies a registered listener so it can be removed later.
pub type ListenerId = u64;

/// The listeners of one channel or pattern and the pushes waiting for them.
///
/// At most one drain task per route is scheduled at a time, so pushes reach
/// the route's listeners in the order they were decoded.
#[derive(Default)]
struct Route {
    listeners: RwLock<Vec<(ListenerId, Listener)>>,
    backlog: Mutex<VecDeque<PushMessage>>,
    draining: AtomicBool,
}

impl Route {
    fn drain(&self) {
        loop {
            let next = self.backlog.lock().pop_front();
            match next {
                Some(msg) => self.deliver(msg),
                None => {
                    self.draining.store(false, Ordering::Release);
                    // A push may have been queued after the pop above.
                    if self.backlog.lock().is_empty() || self.draining.swap(true, Ordering::AcqRel) {
                        return;
                    }
                }
            }
        }
    }

    fn deliver(&self, msg: PushMessage) {
        let listeners: Vec<Listener> = self.listeners.read().iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            let msg = msg.clone();
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| listener(msg))).is_err() {
                warn!("A Pub/Sub listener panicked while handling a push.");
            }
        }
    }
}

/// `PubSubDispatcher` is the hub between PubSub decoders and subscriber
/// callbacks. It uses `DashMap` so listeners can be added and removed while
/// connections are dispatching.
pub struct PubSubDispatcher {
    executor: Arc<dyn PushExecutor>,
    /// Routes keyed by exact channel name (`message` pushes).
    channels: DashMap<Bytes, Arc<Route>>,
    /// Routes keyed by glob pattern (`pmessage` pushes).
    patterns: DashMap<Bytes, Arc<Route>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for PubSubDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubDispatcher")
            .field("executor", &self.executor)
            .field("channels", &self.channels.len())
            .field("patterns", &self.patterns.len())
            .finish()
    }
}

impl PubSubDispatcher {
    pub fn new(executor: Arc<dyn PushExecutor>) -> Self {
        Self {
            executor,
            channels: DashMap::new(),
            patterns: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn map_for(&self, kind: PushKind) -> &DashMap<Bytes, Arc<Route>> {
        match kind {
            PushKind::Message => &self.channels,
            PushKind::PMessage => &self.patterns,
        }
    }

    /// Registers a callback for a channel (`PushKind::Message`) or a pattern
    /// (`PushKind::PMessage`).
    pub fn add_listener(
        &self,
        kind: PushKind,
        key: impl Into<Bytes>,
        listener: Listener,
    ) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.map_for(kind)
            .entry(key.into())
            .or_default()
            .listeners
            .write()
            .push((id, listener));
        id
    }

    /// Registers a listener that forwards every matching push into a channel.
    pub fn listen(
        &self,
        kind: PushKind,
        key: impl Into<Bytes>,
    ) -> (ListenerId, mpsc::UnboundedReceiver<PushMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.add_listener(
            kind,
            key,
            Arc::new(move |msg| {
                let _ = tx.send(msg);
            }),
        );
        (id, rx)
    }

    /// Removes one listener. Returns `true` if it was registered.
    pub fn remove_listener(&self, kind: PushKind, key: &[u8], id: ListenerId) -> bool {
        let map = self.map_for(kind);
        let mut removed = false;
        if let Some(route) = map.get(key) {
            let mut listeners = route.listeners.write();
            let before = listeners.len();
            listeners.retain(|(listener_id, _)| *listener_id != id);
            removed = listeners.len() != before;
        }
        map.remove_if(key, |_, route| route.listeners.read().is_empty());
        removed
    }

    /// Removes every listener of a channel or pattern.
    pub fn remove_listeners(&self, kind: PushKind, key: &[u8]) -> usize {
        self.map_for(kind)
            .remove(key)
            .map_or(0, |(_, route)| route.listeners.read().len())
    }

    /// Returns `true` if anything listens on the channel or pattern.
    pub fn has_listeners(&self, kind: PushKind, key: &[u8]) -> bool {
        self.map_for(kind).contains_key(key)
    }

    /// Every channel (or pattern) that currently has a listener.
    pub fn listener_keys(&self, kind: PushKind) -> Vec<Bytes> {
        self.map_for(kind).iter().map(|e| e.key().clone()).collect()
    }

    /// Queues a push for its route and makes sure a drain task is scheduled
    /// on the executor. Returns the number of listeners it was queued for.
    /// Never blocks on a listener.
    pub fn dispatch(&self, msg: PushMessage) -> usize {
        let Some(route) = self
            .map_for(msg.kind)
            .get(msg.subscription())
            .map(|entry| entry.value().clone())
        else {
            debug!(
                "No listener for push on '{}', dropping it.",
                String::from_utf8_lossy(msg.subscription())
            );
            return 0;
        };

        let count = route.listeners.read().len();
        route.backlog.lock().push_back(msg);
        if !route.draining.swap(true, Ordering::AcqRel) {
            self.executor.execute(async move { route.drain() }.boxed());
        }
        count
    }
}
