// src/connection/queue.rs

//! The per-connection correlation queue matching replies to commands.
//!
//! RESP guarantees that a server answers the requests of one connection in
//! the order they were sent. The queue therefore never searches: every reply
//! resolves the oldest outstanding entry.

use crate::core::protocol::{Command, CommandBatch, RespFrame};
use crate::core::{ClientError, Result};
use std::collections::VecDeque;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Where the replies of a pending entry go once it is complete.
#[derive(Debug)]
pub enum ResultSlot {
    /// One command, one reply.
    Reply(oneshot::Sender<Result<RespFrame>>),
    /// Several replies delivered together: a batch, or a command the server
    /// answers once per argument (e.g. `SUBSCRIBE a b`).
    Replies(oneshot::Sender<Result<Vec<RespFrame>>>),
    /// Fire-and-forget. The entry keeps its place in the FIFO and its reply
    /// is dropped.
    Discard,
}

/// A submitted command (or batch) awaiting its replies.
#[derive(Debug)]
pub struct PendingCommand {
    label: String,
    expected: usize,
    received: Vec<RespFrame>,
    slot: ResultSlot,
    submitted_at: Instant,
}

impl PendingCommand {
    /// A single command resolved by the next reply.
    pub fn single(command: &Command, tx: oneshot::Sender<Result<RespFrame>>) -> Self {
        Self::new(command.name_upper(), 1, ResultSlot::Reply(tx))
    }

    /// A single command whose reply is discarded.
    pub fn discard(command: &Command) -> Self {
        Self::new(command.name_upper(), 1, ResultSlot::Discard)
    }

    /// A whole batch, resolved once every command of it has been answered.
    pub fn batch(batch: &CommandBatch, tx: oneshot::Sender<Result<Vec<RespFrame>>>) -> Self {
        Self::new(
            format!("BATCH[{}]", batch.len()),
            batch.len(),
            ResultSlot::Replies(tx),
        )
    }

    /// A command answered by `expected` consecutive replies.
    pub fn multi_reply(
        command: &Command,
        expected: usize,
        tx: oneshot::Sender<Result<Vec<RespFrame>>>,
    ) -> Self {
        Self::new(command.name_upper(), expected, ResultSlot::Replies(tx))
    }

    fn new(label: String, expected: usize, slot: ResultSlot) -> Self {
        Self {
            label,
            expected: expected.max(1),
            received: Vec::new(),
            slot,
            submitted_at: Instant::now(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Replies still owed to this entry.
    pub fn outstanding(&self) -> usize {
        self.expected - self.received.len()
    }

    /// Records one reply. Returns `true` once the entry is complete.
    fn accept(&mut self, frame: RespFrame) -> bool {
        self.received.push(frame);
        self.received.len() == self.expected
    }

    /// Resolves the entry with its collected replies. Consumes it, so an entry
    /// can only ever be resolved once.
    fn complete(self) {
        let label = self.label;
        let delivered = match self.slot {
            ResultSlot::Reply(tx) => {
                let frame = self.received.into_iter().next().unwrap_or(RespFrame::Null);
                tx.send(Ok(frame)).is_ok()
            }
            ResultSlot::Replies(tx) => tx.send(Ok(self.received)).is_ok(),
            ResultSlot::Discard => true,
        };
        if !delivered {
            debug!(
                "Reply for {} arrived after its caller gave up ({:?} after submission).",
                label,
                self.submitted_at.elapsed()
            );
        }
    }

    /// Fails the entry with `cause`.
    pub fn fail(self, cause: ClientError) {
        match self.slot {
            ResultSlot::Reply(tx) => {
                let _ = tx.send(Err(cause));
            }
            ResultSlot::Replies(tx) => {
                let _ = tx.send(Err(cause));
            }
            ResultSlot::Discard => {}
        }
    }
}

/// An ordered queue of pending commands for one connection.
///
/// Only the connection's I/O task touches it, so it needs no locking.
#[derive(Debug, Default)]
pub struct CommandsQueue {
    pending: VecDeque<PendingCommand>,
    /// Set by `on_closed`. Submissions after that fail with this cause.
    terminated: Option<ClientError>,
}

impl CommandsQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry. A terminated queue fails it immediately and returns
    /// `false`.
    pub fn submit(&mut self, pending: PendingCommand) -> bool {
        if let Some(cause) = &self.terminated {
            pending.fail(cause.clone());
            return false;
        }
        trace!("Queued {} ({} in flight).", pending.label(), self.pending.len() + 1);
        self.pending.push_back(pending);
        true
    }

    /// Appends several entries back to back. Nothing can be interleaved
    /// between them since only the I/O task submits.
    pub fn submit_batch(&mut self, pendings: impl IntoIterator<Item = PendingCommand>) -> usize {
        pendings
            .into_iter()
            .filter_map(|pending| self.submit(pending).then_some(()))
            .count()
    }

    /// Resolves the head of the queue with `frame`.
    ///
    /// A reply with nothing pending means the stream is out of sync, which
    /// is unrecoverable for this connection.
    pub fn on_reply(&mut self, frame: RespFrame) -> Result<()> {
        let Some(head) = self.pending.front_mut() else {
            return Err(ClientError::Protocol(format!(
                "unexpected reply with no pending command: {frame:?}"
            )));
        };
        if head.accept(frame)
            && let Some(done) = self.pending.pop_front()
        {
            done.complete();
        }
        Ok(())
    }

    /// Fails every pending entry with `cause` and rejects later submissions.
    /// Returns the number of entries failed.
    pub fn on_closed(&mut self, cause: ClientError) -> usize {
        let failed = self.pending.len();
        for pending in self.pending.drain(..) {
            pending.fail(cause.clone());
        }
        if self.terminated.is_none() {
            self.terminated = Some(cause);
        }
        failed
    }

    /// Number of pending entries (a batch counts once).
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Number of replies still owed by the server.
    pub fn outstanding_replies(&self) -> usize {
        self.pending.iter().map(PendingCommand::outstanding).sum()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.is_some()
    }
}
