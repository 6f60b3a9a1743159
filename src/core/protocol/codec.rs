// src/core/protocol/codec.rs

//! The client-side wire codec: command and batch encoders plus the reply
//! decoder in its two interpretations (plain replies, or replies mixed with
//! subscription pushes).

use super::command::{Command, CommandBatch};
use super::resp_frame::{RespFrame, RespFrameCodec};
use crate::core::ClientError;
use crate::core::pubsub::PushMessage;
use bytes::BytesMut;
use strum_macros::{Display, EnumString};
use tokio_util::codec::{Decoder, Encoder};

/// Selects how decoded frames are interpreted. Fixed for the lifetime of a
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ConnectionKind {
    /// Every frame is a reply to the oldest outstanding command.
    Plain,
    /// `message`/`pmessage` arrays are push notifications; everything else
    /// is a reply.
    PubSub,
}

/// A decoded inbound item.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A reply that resolves the head of the correlation queue.
    Reply(RespFrame),
    /// An out-of-band push that must not touch the correlation queue.
    Push(PushMessage),
}

/// The codec installed on every client connection.
#[derive(Debug, Clone, Copy)]
pub struct ClientCodec {
    kind: ConnectionKind,
    frames: RespFrameCodec,
}

impl ClientCodec {
    pub fn new(kind: ConnectionKind) -> Self {
        Self {
            kind,
            frames: RespFrameCodec,
        }
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }
}

impl Encoder<Command> for ClientCodec {
    type Error = ClientError;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode_into(dst);
        Ok(())
    }
}

impl Encoder<CommandBatch> for ClientCodec {
    type Error = ClientError;

    /// Writes every command of the batch back-to-back, in order, so the whole
    /// batch leaves in a single flush.
    fn encode(&mut self, item: CommandBatch, dst: &mut BytesMut) -> Result<(), Self::Error> {
        for command in item.iter() {
            command.encode_into(dst);
        }
        Ok(())
    }
}

impl Decoder for ClientCodec {
    type Item = Inbound;
    type Error = ClientError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(frame) = self.frames.decode(src)? else {
            return Ok(None);
        };
        let inbound = match self.kind {
            ConnectionKind::Plain => Inbound::Reply(frame),
            ConnectionKind::PubSub => match PushMessage::try_from_frame(frame) {
                Ok(push) => Inbound::Push(push),
                Err(frame) => Inbound::Reply(frame),
            },
        };
        Ok(Some(inbound))
    }
}
