// src/pool.rs

//! A fixed-size group of connections to one server, kept alive by a watchdog.
//!
//! Pipelined connections are shared rather than checked out: `acquire`
//! hands back a clone of a live connection, round robin. When a connection
//! is lost the watchdog opens a replacement in the background; callers that
//! held the dead one simply acquire again.

use crate::config::ConnectionConfig;
use crate::connection::{
    Connection, ConnectionInitializer, ConnectionWatchdog, WatchdogRegistry,
};
use crate::core::protocol::ConnectionKind;
use crate::core::pubsub::PubSubDispatcher;
use crate::core::{ClientError, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

struct PoolInner {
    initializer: Arc<ConnectionInitializer>,
    registry: WatchdogRegistry,
    kind: ConnectionKind,
    size: usize,
    next: AtomicUsize,
    shut_down: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    watchdog_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Drop for PoolInner {
    /// A pool dropped without `shutdown` still stops its watchdog and closes
    /// its connections, which would otherwise keep each other alive.
    fn drop(&mut self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown_tx.send(());
        if let Some(task) = self.watchdog_task.get_mut().take() {
            task.abort();
        }
        for connection in self.registry.close() {
            connection.close();
        }
        debug!(
            "Connection pool to {} dropped without shutdown, closing it.",
            self.initializer.config().address
        );
    }
}

/// Connection pool handle. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("address", &self.inner.initializer.config().address.to_string())
            .field("kind", &self.inner.kind)
            .field("size", &self.inner.size)
            .field("live", &self.inner.registry.len())
            .finish()
    }
}

impl ConnectionPool {
    /// Opens `size` connections of `kind` and starts their watchdog. Fails if
    /// any of the initial connections cannot be established.
    pub async fn connect(config: ConnectionConfig, size: usize, kind: ConnectionKind) -> Result<Self> {
        if size == 0 {
            return Err(ClientError::Config("pool size cannot be 0".into()));
        }
        let registry = WatchdogRegistry::new();
        let (handle, events) = ConnectionWatchdog::channel(registry.clone());
        let initializer = Arc::new(ConnectionInitializer::new(config)?.with_watchdog(handle));

        let (shutdown_tx, _) = broadcast::channel(1);
        let watchdog = ConnectionWatchdog::new(initializer.clone(), events);
        let watchdog_task = tokio::spawn(watchdog.run(shutdown_tx.subscribe()));

        let pool = Self {
            inner: Arc::new(PoolInner {
                initializer,
                registry,
                kind,
                size,
                next: AtomicUsize::new(0),
                shut_down: AtomicBool::new(false),
                shutdown_tx,
                watchdog_task: parking_lot::Mutex::new(Some(watchdog_task)),
            }),
        };

        let attempts = (0..size).map(|_| pool.inner.initializer.connect(kind));
        if let Err(e) = futures::future::try_join_all(attempts).await {
            pool.shutdown().await;
            return Err(e);
        }
        info!(
            "Connection pool to {} ready with {} {} connection(s).",
            pool.inner.initializer.config().address,
            size,
            kind
        );
        Ok(pool)
    }

    /// Returns a live connection, rotating through the pool.
    pub fn acquire(&self) -> Result<Connection> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(ClientError::PoolShutdown);
        }
        let live: Vec<Connection> = self
            .inner
            .registry
            .connections()
            .into_iter()
            .filter(|c| !c.is_closed())
            .collect();
        if live.is_empty() {
            return Err(ClientError::NoConnectionAvailable);
        }
        let index = self.inner.next.fetch_add(1, Ordering::Relaxed) % live.len();
        Ok(live[index].clone())
    }

    /// Like [`acquire`](Self::acquire), but waits up to `timeout` for the
    /// watchdog to bring a connection back.
    pub async fn acquire_within(&self, timeout: Duration) -> Result<Connection> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.acquire() {
                Err(ClientError::NoConnectionAvailable) => {}
                other => return other,
            }
            tokio::select! {
                _ = self.inner.registry.changed() => {}
                // The registry notification can race the check above.
                _ = tokio::time::sleep(Duration::from_millis(20)) => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return self.acquire();
            }
        }
    }

    /// The dispatcher push messages of this pool's connections go to.
    pub fn dispatcher(&self) -> &Arc<PubSubDispatcher> {
        self.inner.initializer.dispatcher()
    }

    pub fn kind(&self) -> ConnectionKind {
        self.inner.kind
    }

    /// The configured number of connections.
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// The number of live connections right now.
    pub fn len(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.registry.is_empty()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Stops the watchdog, then closes every connection. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.shutdown_tx.send(());
        let task = self.inner.watchdog_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let connections = self.inner.registry.close();
        for connection in &connections {
            connection.close();
        }
        for connection in &connections {
            connection.closed().await;
        }
        info!(
            "Connection pool to {} shut down.",
            self.inner.initializer.config().address
        );
    }
}
