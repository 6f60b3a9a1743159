// src/core/protocol/mod.rs

pub mod codec;
pub mod command;
pub mod resp_frame;
pub use codec::{ClientCodec, ConnectionKind, Inbound};
pub use command::{Command, CommandBatch};
pub use resp_frame::{RespFrame, RespFrameCodec};
