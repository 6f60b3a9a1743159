// src/connection/driver.rs

//! Defines the `ConnectionDriver`, the task that owns one connection's socket,
//! codec and correlation queue for its whole life.

use super::handle::{Connection, Request, Shared};
use super::queue::CommandsQueue;
use super::stream::ClientStream;
use super::tls::{GateEvent, TlsContext, TlsGate};
use super::watchdog::{ClosedEvent, WatchdogHandle};
use crate::core::protocol::{ClientCodec, Command, CommandBatch, Inbound};
use crate::core::pubsub::PubSubDispatcher;
use crate::core::ClientError;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// How many queued requests are encoded before the write buffer is flushed.
const MAX_REQUESTS_PER_FLUSH: usize = 256;

type ClientFramed = Framed<ClientStream, ClientCodec>;

/// The wire half of a request, once its queue entry is submitted.
enum Outgoing {
    Command(Command),
    Batch(CommandBatch),
}

/// Drives one connection: TLS gating, writes, reads and close handling.
pub(crate) struct ConnectionDriver {
    pub(crate) shared: Arc<Shared>,
    /// Weak so that dropping every `Connection` handle ends the task.
    pub(crate) handle: mpsc::WeakUnboundedSender<Request>,
    pub(crate) requests: mpsc::UnboundedReceiver<Request>,
    pub(crate) shutdown_rx: broadcast::Receiver<()>,
    pub(crate) queue: CommandsQueue,
    pub(crate) gate: TlsGate,
    pub(crate) tls: Option<TlsContext>,
    pub(crate) connect_timeout: Duration,
    pub(crate) dispatcher: Arc<PubSubDispatcher>,
    pub(crate) watchdog: Option<WatchdogHandle>,
}

impl ConnectionDriver {
    /// Runs the connection until it closes, then fails whatever is left.
    pub(crate) async fn run(mut self, socket: TcpStream) {
        let (cause, was_active) = match self.establish(socket).await {
            Ok(stream) => {
                if self.activate(stream.is_tls()) {
                    (self.serve(stream).await, true)
                } else {
                    debug!(
                        "Connection {}: its group has shut down, closing it.",
                        self.shared.id
                    );
                    self.shared.explicit_close.store(true, Ordering::SeqCst);
                    (ClientError::closed("connection group has shut down"), false)
                }
            }
            Err(cause) => {
                warn!(
                    "Connection {} to {} failed before becoming ready: {}",
                    self.shared.id, self.shared.address, cause
                );
                (cause, false)
            }
        };
        self.finish(cause, was_active);
    }

    /// Passes the socket through the TLS gate. Resolves once "active" has
    /// been forwarded, or with the cause that stopped it.
    async fn establish(&mut self, socket: TcpStream) -> Result<ClientStream, ClientError> {
        if let Err(e) = socket.set_nodelay(true) {
            debug!("Connection {}: could not set TCP_NODELAY: {}", self.shared.id, e);
        }

        let Some(tls) = self.tls.take() else {
            return match self.gate.on_active() {
                GateEvent::Active => Ok(ClientStream::Tcp(socket)),
                GateEvent::Failed(cause) => Err(cause),
                GateEvent::Suppressed => Err(ClientError::InvalidState(
                    "plain connection held back by the TLS gate".into(),
                )),
            };
        };

        self.gate.start_handshake();
        // The TCP socket is already up. The gate buffers this signal until
        // the handshake resolves.
        let _ = self.gate.on_active();

        let limit = self.connect_timeout;
        let outcome = tokio::select! {
            biased;
            _ = self.shutdown_rx.recv() => {
                return Err(ClientError::closed("closed during TLS handshake"));
            }
            res = tokio::time::timeout(limit, tls.handshake(socket)) => res.unwrap_or_else(|_| {
                Err(ClientError::Handshake(format!("timed out after {limit:?}")))
            }),
        };

        let (stream, result) = match outcome {
            Ok(stream) => (Some(stream), Ok(())),
            Err(cause) => (None, Err(cause)),
        };
        match (self.gate.on_handshake_complete(result), stream) {
            (GateEvent::Active, Some(stream)) => {
                debug!(
                    "Connection {}: TLS handshake with {} complete.",
                    self.shared.id, self.shared.address
                );
                Ok(stream)
            }
            (GateEvent::Failed(cause), _) => Err(cause),
            _ => Err(ClientError::InvalidState(
                "TLS gate did not forward the active signal".into(),
            )),
        }
    }

    /// The connection is usable: join the watchdog group, then resolve the
    /// lifecycle promise. Returns `false` if the group no longer accepts
    /// connections.
    fn activate(&self, tls: bool) -> bool {
        if let (Some(watchdog), Some(tx)) = (&self.watchdog, self.handle.upgrade())
            && !watchdog.registry().insert(Connection {
                shared: self.shared.clone(),
                tx,
            })
        {
            return false;
        }
        self.shared.resolve_ready(Ok(()));
        info!(
            "Connection {} to {} is ready ({}, {}).",
            self.shared.id,
            self.shared.address,
            self.shared.kind,
            if tls { "tls" } else { "plain" }
        );
        true
    }

    /// The main loop. Returns the cause the connection closed with.
    async fn serve(&mut self, stream: ClientStream) -> ClientError {
        let mut framed = Framed::new(stream, ClientCodec::new(self.shared.kind));
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown_rx.recv() => {
                    debug!("Connection {} received close signal.", self.shared.id);
                    return ClientError::closed("connection closed locally");
                }
                inbound = framed.next() => match inbound {
                    Some(Ok(Inbound::Reply(frame))) => {
                        if let Err(e) = self.queue.on_reply(frame) {
                            warn!("Connection {}: {}", self.shared.id, e);
                            return e;
                        }
                    }
                    Some(Ok(Inbound::Push(msg))) => {
                        self.dispatcher.dispatch(msg);
                    }
                    Some(Err(e)) => return self.read_failure(e),
                    None => {
                        debug!("Connection {} closed by peer.", self.shared.id);
                        return ClientError::closed("connection closed by peer");
                    }
                },
                request = self.requests.recv() => match request {
                    Some(request) => {
                        if let Err(e) = self.write(&mut framed, request).await {
                            warn!("Connection {}: write failed: {}", self.shared.id, e);
                            return ClientError::closed(format!("write failed: {e}"));
                        }
                    }
                    None => {
                        debug!("Connection {}: every handle was dropped.", self.shared.id);
                        return ClientError::closed("every connection handle was dropped");
                    }
                },
            }
        }
    }

    /// Submits `first` and whatever else is already waiting, then flushes
    /// once. Every entry joins the queue before any of their bytes are written.
    async fn write(&mut self, framed: &mut ClientFramed, first: Request) -> Result<(), ClientError> {
        let mut outgoing = Vec::new();
        let mut pendings = Vec::new();
        let mut next = Some(first);
        while let Some(request) = next.take() {
            match request {
                Request::Single(command, pending) => {
                    outgoing.push(Outgoing::Command(command));
                    pendings.push(pending);
                }
                Request::Batch(batch, pending) => {
                    outgoing.push(Outgoing::Batch(batch));
                    pendings.push(pending);
                }
            }
            if pendings.len() < MAX_REQUESTS_PER_FLUSH {
                next = self.requests.try_recv().ok();
            }
        }

        let submitted = pendings.len();
        if self.queue.submit_batch(pendings) != submitted {
            return Err(ClientError::closed("correlation queue is terminated"));
        }
        for item in outgoing {
            match item {
                Outgoing::Command(command) => SinkExt::<Command>::feed(&mut *framed, command).await?,
                Outgoing::Batch(batch) => SinkExt::<CommandBatch>::feed(&mut *framed, batch).await?,
            }
        }
        SinkExt::<Command>::flush(&mut *framed).await
    }

    fn read_failure(&self, error: ClientError) -> ClientError {
        match error {
            ClientError::Protocol(_) => {
                warn!(
                    "Connection {}: malformed data from {}: {}",
                    self.shared.id, self.shared.address, error
                );
                error
            }
            other => {
                debug!("Connection {}: read failed: {}", self.shared.id, other);
                ClientError::closed(other.to_string())
            }
        }
    }

    /// Fails everything still pending, leaves the watchdog group, and tells
    /// the watchdog how the connection ended.
    fn finish(mut self, cause: ClientError, was_active: bool) {
        let id = self.shared.id;
        self.shared.mark_closed(cause.clone());
        let mut failed = self.queue.on_closed(cause.clone());

        self.requests.close();
        while let Ok(request) = self.requests.try_recv() {
            request.fail(cause.clone());
            failed += 1;
        }

        if let Some(watchdog) = &self.watchdog {
            watchdog.registry().remove(id);
        }
        self.shared.resolve_ready(Err(cause.clone()));

        let explicit = self.shared.explicit_close.load(Ordering::SeqCst);
        if explicit {
            debug!("Connection {} closed locally, failed {} pending command(s).", id, failed);
        } else {
            info!(
                "Connection {} to {} closed ({}), failed {} pending command(s).",
                id, self.shared.address, cause, failed
            );
        }

        if let Some(watchdog) = &self.watchdog {
            watchdog.notify_closed(ClosedEvent {
                id,
                kind: self.shared.kind,
                cause,
                explicit,
                was_active,
                subscriptions: self.shared.subscriptions.lock().clone(),
            });
        }
    }
}
