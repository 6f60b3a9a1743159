// src/core/pubsub/mod.rs

//! Client-side publish-subscribe support: the push message type recognized
//! by the PubSub decoder, the executor capability that runs subscriber
//! callbacks off the I/O path, and the dispatcher routing pushes to listeners.

use crate::core::protocol::RespFrame;
use bytes::Bytes;

pub mod dispatcher;
pub mod executor;

pub use dispatcher::{Listener, ListenerId, PubSubDispatcher};
pub use executor::{PushExecutor, TokioExecutor};

/// The literal marker of a channel push frame.
const MESSAGE_MARKER: &[u8] = b"message";
/// The literal marker of a pattern push frame.
const PMESSAGE_MARKER: &[u8] = b"pmessage";

/// Distinguishes direct channel deliveries from pattern matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushKind {
    Message,
    PMessage,
}

/// An out-of-band message delivered on a PubSub connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushMessage {
    pub kind: PushKind,
    /// The subscribed pattern, present only for `pmessage` pushes.
    pub pattern: Option<Bytes>,
    pub channel: Bytes,
    pub payload: Bytes,
}

impl PushMessage {
    /// Recognizes `message` (3 elements) and `pmessage` (4 elements) push
    /// arrays. Any other frame is handed back unchanged so it can resolve
    /// the correlation queue.
    pub fn try_from_frame(frame: RespFrame) -> Result<Self, RespFrame> {
        let RespFrame::Array(items) = frame else {
            return Err(frame);
        };
        let kind = match (items.first().and_then(marker), items.len()) {
            (Some(PushKind::Message), 3) => PushKind::Message,
            (Some(PushKind::PMessage), 4) => PushKind::PMessage,
            _ => return Err(RespFrame::Array(items)),
        };
        if !items[1..].iter().all(|item| item.as_bytes().is_some()) {
            return Err(RespFrame::Array(items));
        }

        let mut parts = items.into_iter().skip(1).map(into_bytes);
        let pattern = match kind {
            PushKind::PMessage => parts.next(),
            PushKind::Message => None,
        };
        Ok(Self {
            kind,
            pattern,
            channel: parts.next().unwrap_or_default(),
            payload: parts.next().unwrap_or_default(),
        })
    }

    /// The key a listener registered for: the pattern for `pmessage`, the
    /// channel otherwise.
    pub fn subscription(&self) -> &Bytes {
        self.pattern.as_ref().unwrap_or(&self.channel)
    }
}

fn marker(frame: &RespFrame) -> Option<PushKind> {
    let bytes = frame.as_bytes()?;
    if bytes.eq_ignore_ascii_case(MESSAGE_MARKER) {
        Some(PushKind::Message)
    } else if bytes.eq_ignore_ascii_case(PMESSAGE_MARKER) {
        Some(PushKind::PMessage)
    } else {
        None
    }
}

fn into_bytes(frame: RespFrame) -> Bytes {
    match frame {
        RespFrame::BulkString(b) => b,
        RespFrame::SimpleString(s) => Bytes::from(s),
        _ => Bytes::new(),
    }
}
