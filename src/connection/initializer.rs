// src/connection/initializer.rs

//! Assembles connections: TLS context, codec mode, correlation queue and
//! I/O task, wired the same way for every socket of a configuration.

use super::driver::ConnectionDriver;
use super::handle::{Connection, ReadyState, Shared};
use super::queue::CommandsQueue;
use super::tls::{TlsContext, TlsGate};
use super::watchdog::WatchdogHandle;
use crate::config::ConnectionConfig;
use crate::core::protocol::ConnectionKind;
use crate::core::pubsub::PubSubDispatcher;
use crate::core::{ClientError, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::debug;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Builds connections for one `ConnectionConfig`.
#[derive(Debug)]
pub struct ConnectionInitializer {
    config: Arc<ConnectionConfig>,
    /// Built once and shared by every secured connection.
    tls: Option<TlsContext>,
    dispatcher: Arc<PubSubDispatcher>,
    watchdog: Option<WatchdogHandle>,
}

impl ConnectionInitializer {
    /// Prepares an initializer. Fails if the TLS context cannot be built.
    pub fn new(config: ConnectionConfig) -> Result<Self> {
        let tls = if config.address.is_secure() {
            Some(TlsContext::build(&config.address, &config.tls)?)
        } else {
            None
        };
        let dispatcher = Arc::new(PubSubDispatcher::new(config.executor.clone()));
        Ok(Self {
            config: Arc::new(config),
            tls,
            dispatcher,
            watchdog: None,
        })
    }

    /// Registers every connection built from now on with a watchdog group.
    pub fn with_watchdog(mut self, watchdog: WatchdogHandle) -> Self {
        self.watchdog = Some(watchdog);
        self
    }

    /// Shares a dispatcher with other initializers.
    pub fn with_dispatcher(mut self, dispatcher: Arc<PubSubDispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<PubSubDispatcher> {
        &self.dispatcher
    }

    pub fn tls(&self) -> Option<&TlsContext> {
        self.tls.as_ref()
    }

    /// Wires a connection around an already-connected socket and spawns its
    /// I/O task. The returned connection is not ready yet; await
    /// [`Connection::ready`].
    pub fn initialize(&self, socket: TcpStream, kind: ConnectionKind) -> Connection {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, requests) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let shared = Arc::new(Shared {
            id,
            kind,
            address: self.config.address.clone(),
            peer_addr: socket.peer_addr().ok(),
            response_timeout: self.config.response_timeout,
            ready: watch::channel(ReadyState::Pending).0,
            closed: watch::channel(None).0,
            explicit_close: AtomicBool::new(false),
            shutdown_tx,
            subscriptions: Default::default(),
        });

        let gate = if self.tls.is_some() {
            TlsGate::new()
        } else {
            TlsGate::passthrough()
        };

        let driver = ConnectionDriver {
            shared: shared.clone(),
            handle: tx.downgrade(),
            requests,
            shutdown_rx,
            queue: CommandsQueue::new(),
            gate,
            tls: self.tls.clone(),
            connect_timeout: self.config.connect_timeout,
            dispatcher: self.dispatcher.clone(),
            watchdog: self.watchdog.clone(),
        };
        debug!(
            "Initializing {} connection {} to {}.",
            kind, id, self.config.address
        );
        tokio::spawn(driver.run(socket));

        Connection { shared, tx }
    }

    /// Opens a TCP socket to the configured address, initializes it and
    /// waits until the connection is ready.
    pub async fn connect(&self, kind: ConnectionKind) -> Result<Connection> {
        let target = self.config.address.socket_target();
        let limit = self.config.connect_timeout;
        let socket = tokio::time::timeout(limit, TcpStream::connect(&target))
            .await
            .map_err(|_| ClientError::Timeout(limit))??;
        let connection = self.initialize(socket, kind);
        connection.ready().await?;
        Ok(connection)
    }
}
