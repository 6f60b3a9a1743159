// src/connection/handle.rs

//! Defines `Connection`, the cheap-to-clone handle callers submit commands through.

use super::queue::PendingCommand;
use crate::config::Address;
use crate::core::protocol::{Command, CommandBatch, ConnectionKind, RespFrame};
use crate::core::{ClientError, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

/// The lifecycle promise of a connection. Leaves `Pending` exactly once.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadyState {
    Pending,
    Ready,
    Failed(ClientError),
}

/// The channels and patterns a PubSub connection holds, as acknowledged by
/// the server. The watchdog restores exactly this set on the replacement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subscriptions {
    pub channels: BTreeSet<Bytes>,
    pub patterns: BTreeSet<Bytes>,
}

impl Subscriptions {
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty() && self.patterns.is_empty()
    }

    /// Applies one `subscribe`/`unsubscribe`/`psubscribe`/`punsubscribe`
    /// acknowledgement. Other frames are ignored.
    pub fn apply(&mut self, ack: &RespFrame) {
        let RespFrame::Array(items) = ack else {
            return;
        };
        let (Some(kind), Some(key)) = (
            items.first().and_then(RespFrame::as_bytes),
            items.get(1).and_then(RespFrame::as_bytes),
        ) else {
            return;
        };
        let key = Bytes::copy_from_slice(key);
        match kind.to_ascii_lowercase().as_slice() {
            b"subscribe" => {
                self.channels.insert(key);
            }
            b"unsubscribe" => {
                self.channels.remove(&key);
            }
            b"psubscribe" => {
                self.patterns.insert(key);
            }
            b"punsubscribe" => {
                self.patterns.remove(&key);
            }
            _ => {}
        }
    }
}

/// A request handed from a `Connection` handle to its I/O task.
#[derive(Debug)]
pub(crate) enum Request {
    Single(Command, PendingCommand),
    Batch(CommandBatch, PendingCommand),
}

impl Request {
    /// Fails the request without sending it.
    pub(crate) fn fail(self, cause: ClientError) {
        match self {
            Request::Single(_, pending) | Request::Batch(_, pending) => pending.fail(cause),
        }
    }
}

/// State shared between every handle of a connection and its I/O task.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) id: u64,
    pub(crate) kind: ConnectionKind,
    pub(crate) address: Address,
    pub(crate) peer_addr: Option<SocketAddr>,
    pub(crate) response_timeout: Option<Duration>,
    pub(crate) ready: watch::Sender<ReadyState>,
    /// `Some(cause)` once the connection is closed.
    pub(crate) closed: watch::Sender<Option<ClientError>>,
    /// Set when the close was requested locally, so the watchdog leaves it alone.
    pub(crate) explicit_close: AtomicBool,
    pub(crate) shutdown_tx: broadcast::Sender<()>,
    pub(crate) subscriptions: Mutex<Subscriptions>,
}

impl Shared {
    /// Resolves the lifecycle promise. Later calls are no-ops.
    pub(crate) fn resolve_ready(&self, outcome: Result<()>) -> bool {
        self.ready.send_if_modified(|state| {
            if *state != ReadyState::Pending {
                return false;
            }
            *state = match &outcome {
                Ok(()) => ReadyState::Ready,
                Err(cause) => ReadyState::Failed(cause.clone()),
            };
            true
        })
    }

    /// Publishes the close cause. Later calls are no-ops.
    pub(crate) fn mark_closed(&self, cause: ClientError) -> bool {
        self.closed.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some(cause.clone());
            true
        })
    }
}

/// A handle to one logical link to the server.
///
/// Cloning is cheap; every clone talks to the same I/O task. Commands sent
/// through any clone are answered strictly in submission order.
#[derive(Clone)]
pub struct Connection {
    pub(crate) shared: Arc<Shared>,
    pub(crate) tx: mpsc::UnboundedSender<Request>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("kind", &self.shared.kind)
            .field("address", &self.shared.address.to_string())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn kind(&self) -> ConnectionKind {
        self.shared.kind
    }

    pub fn address(&self) -> &Address {
        &self.shared.address
    }

    /// The socket address the connection is attached to.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer_addr
    }

    /// The channels and patterns this connection is subscribed to.
    pub fn subscriptions(&self) -> Subscriptions {
        self.shared.subscriptions.lock().clone()
    }

    pub fn is_ready(&self) -> bool {
        *self.shared.ready.borrow() == ReadyState::Ready
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.borrow().is_some()
    }

    /// The reason the connection closed, if it has.
    pub fn close_reason(&self) -> Option<ClientError> {
        self.shared.closed.borrow().clone()
    }

    /// Waits for the lifecycle promise: success once the TLS handshake (if
    /// any) is done and the protocol pipeline is installed.
    pub async fn ready(&self) -> Result<()> {
        let mut rx = self.shared.ready.subscribe();
        let state = rx
            .wait_for(|state| *state != ReadyState::Pending)
            .await
            .map_err(|_| ClientError::closed("connection task is gone"))?
            .clone();
        match state {
            ReadyState::Ready => Ok(()),
            ReadyState::Failed(cause) => Err(cause),
            ReadyState::Pending => Err(ClientError::closed("connection task is gone")),
        }
    }

    /// Resolves with the close cause once the connection has closed.
    pub async fn closed(&self) -> ClientError {
        let mut rx = self.shared.closed.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(state) => state
                .clone()
                .unwrap_or_else(|| ClientError::closed("closed")),
            Err(_) => ClientError::closed("connection task is gone"),
        }
    }

    /// Closes the connection locally. Pending commands fail with a
    /// connection-closed error and the watchdog does not replace it.
    pub fn close(&self) {
        self.shared.explicit_close.store(true, Ordering::SeqCst);
        let _ = self.shared.shutdown_tx.send(());
    }

    /// Hands a request to the I/O task. If the task is gone the request is
    /// failed right here.
    fn enqueue(&self, request: Request) {
        if let Err(mpsc::error::SendError(request)) = self.tx.send(request) {
            let cause = self
                .close_reason()
                .unwrap_or_else(|| ClientError::closed("connection task is gone"));
            request.fail(cause);
        }
    }

    /// Waits on a result slot, applying the response timeout. A timeout only
    /// abandons the wait: the queue entry stays until its reply arrives.
    async fn await_slot<T>(
        &self,
        rx: oneshot::Receiver<Result<T>>,
        timeout: Option<Duration>,
    ) -> Result<T> {
        let wait = async {
            rx.await
                .map_err(|_| ClientError::closed("connection dropped the command"))?
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| ClientError::Timeout(limit))?,
            None => wait.await,
        }
    }

    /// Sends one command and returns its raw reply. Error replies are
    /// returned as `RespFrame::Error`.
    pub fn request(&self, command: Command) -> impl Future<Output = Result<RespFrame>> + '_ {
        self.request_with_timeout(command, self.shared.response_timeout)
    }

    /// Like [`request`](Self::request) with an explicit timeout.
    pub fn request_with_timeout(
        &self,
        command: Command,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<RespFrame>> + '_ {
        let (tx, rx) = oneshot::channel();
        let pending = PendingCommand::single(&command, tx);
        // Submission happens now, before the future is first polled, so the
        // order of calls is the order on the wire.
        self.enqueue(Request::Single(command, pending));
        self.await_slot(rx, timeout)
    }

    /// Sends one command. An error reply becomes `ClientError::Server`.
    pub async fn send(&self, command: Command) -> Result<RespFrame> {
        into_result(self.request(command).await?)
    }

    /// Sends one command with an explicit response timeout.
    pub async fn send_with_timeout(&self, command: Command, timeout: Duration) -> Result<RespFrame> {
        into_result(self.request_with_timeout(command, Some(timeout)).await?)
    }

    /// Sends a command and discards its reply. The command still occupies
    /// its place in the reply order.
    pub fn send_no_reply(&self, command: Command) {
        let pending = PendingCommand::discard(&command);
        self.enqueue(Request::Single(command, pending));
    }

    /// Sends every command in one write and returns their replies in order.
    ///
    /// The batch is enqueued atomically: no command from another caller can
    /// land between two of its commands. Error replies stay in the returned
    /// list as `RespFrame::Error`.
    pub fn send_batch(
        &self,
        commands: Vec<Command>,
    ) -> impl Future<Output = Result<Vec<RespFrame>>> + '_ {
        let batch = CommandBatch::new(commands);
        let (tx, rx) = oneshot::channel();
        if batch.is_empty() {
            let _ = tx.send(Ok(Vec::new()));
        } else {
            let pending = PendingCommand::batch(&batch, tx);
            self.enqueue(Request::Batch(batch, pending));
        }
        self.await_slot(rx, self.shared.response_timeout)
    }

    /// Sends `PING` and returns the server's answer.
    pub async fn ping(&self) -> Result<String> {
        let reply = self.send(Command::new("PING")).await?;
        reply
            .as_text()
            .ok_or_else(|| ClientError::Protocol(format!("unexpected PING reply: {reply:?}")))
    }

    fn require_pubsub(&self, what: &str) -> Result<()> {
        if self.kind() != ConnectionKind::PubSub {
            return Err(ClientError::InvalidState(format!(
                "{what} requires a PubSub connection"
            )));
        }
        Ok(())
    }

    /// Issues a (un)subscribe command the server acknowledges once per argument.
    async fn subscription_command(&self, name: &'static str, keys: Vec<Vec<u8>>) -> Result<Vec<RespFrame>> {
        self.require_pubsub(name)?;
        if keys.is_empty() {
            return Err(ClientError::InvalidState(format!(
                "{name} needs at least one channel or pattern"
            )));
        }
        let expected = keys.len();
        let command = Command::new(name).args(keys);
        let (tx, rx) = oneshot::channel();
        let pending = PendingCommand::multi_reply(&command, expected, tx);
        self.enqueue(Request::Single(command, pending));
        let acks = self.await_slot(rx, self.shared.response_timeout).await?;
        {
            let mut subscriptions = self.shared.subscriptions.lock();
            for ack in &acks {
                subscriptions.apply(ack);
            }
        }
        if let Some(RespFrame::Error(message)) = acks.iter().find(|ack| ack.is_error()) {
            return Err(ClientError::Server(message.clone()));
        }
        Ok(acks)
    }

    /// `SUBSCRIBE` to channels. Returns one acknowledgement per channel.
    pub async fn subscribe<I, C>(&self, channels: I) -> Result<Vec<RespFrame>>
    where
        I: IntoIterator<Item = C>,
        C: AsRef<[u8]>,
    {
        self.subscription_command("SUBSCRIBE", to_keys(channels)).await
    }

    /// `PSUBSCRIBE` to patterns.
    pub async fn psubscribe<I, C>(&self, patterns: I) -> Result<Vec<RespFrame>>
    where
        I: IntoIterator<Item = C>,
        C: AsRef<[u8]>,
    {
        self.subscription_command("PSUBSCRIBE", to_keys(patterns)).await
    }

    /// `UNSUBSCRIBE` from the given channels.
    pub async fn unsubscribe<I, C>(&self, channels: I) -> Result<Vec<RespFrame>>
    where
        I: IntoIterator<Item = C>,
        C: AsRef<[u8]>,
    {
        self.subscription_command("UNSUBSCRIBE", to_keys(channels)).await
    }

    /// `PUNSUBSCRIBE` from the given patterns.
    pub async fn punsubscribe<I, C>(&self, patterns: I) -> Result<Vec<RespFrame>>
    where
        I: IntoIterator<Item = C>,
        C: AsRef<[u8]>,
    {
        self.subscription_command("PUNSUBSCRIBE", to_keys(patterns)).await
    }
}

fn to_keys<I, C>(keys: I) -> Vec<Vec<u8>>
where
    I: IntoIterator<Item = C>,
    C: AsRef<[u8]>,
{
    keys.into_iter().map(|k| k.as_ref().to_vec()).collect()
}

fn into_result(frame: RespFrame) -> Result<RespFrame> {
    match frame {
        RespFrame::Error(message) => Err(ClientError::Server(message)),
        other => Ok(other),
    }
}
