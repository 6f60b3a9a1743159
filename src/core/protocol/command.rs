// src/core/protocol/command.rs

//! Outgoing command representation and its bulk-array wire encoding.

use super::resp_frame::{RespFrame, put_bulk, put_header};
use bytes::{Bytes, BytesMut};
use std::fmt;

/// A single outgoing command: a name followed by binary-safe arguments.
///
/// On the wire it is written as a RESP array of bulk strings, e.g.
/// `SET k v` becomes `*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n`.
#[derive(Clone, PartialEq, Eq)]
pub struct Command {
    name: Bytes,
    args: Vec<Bytes>,
}

impl Command {
    /// Creates a command with no arguments.
    pub fn new(name: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl Into<Bytes>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends every argument of an iterator.
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Bytes>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Builds a command from a whitespace separated line, as typed on a CLI.
    /// Returns `None` for an empty line.
    pub fn from_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let name = parts.next()?;
        Some(Self::new(name.to_string()).args(parts.map(str::to_string)))
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    /// The command name, uppercased, for logging.
    pub fn name_upper(&self) -> String {
        String::from_utf8_lossy(&self.name).to_ascii_uppercase()
    }

    pub fn arguments(&self) -> &[Bytes] {
        &self.args
    }

    /// Number of elements in the encoded array (name included).
    pub fn arity(&self) -> usize {
        self.args.len() + 1
    }

    /// Serializes the command into `dst` as a count-prefixed array of
    /// length-prefixed bulk strings.
    pub fn encode_into(&self, dst: &mut BytesMut) {
        put_header(dst, b'*', self.arity() as i64);
        put_bulk(dst, &self.name);
        for arg in &self.args {
            put_bulk(dst, arg);
        }
    }

    /// Returns the equivalent frame. Used by servers and test fixtures that
    /// need to inspect a received command.
    pub fn to_frame(&self) -> RespFrame {
        let mut items = Vec::with_capacity(self.arity());
        items.push(RespFrame::BulkString(self.name.clone()));
        items.extend(self.args.iter().cloned().map(RespFrame::BulkString));
        RespFrame::Array(items)
    }

    /// Rebuilds a command from a received array of bulk strings.
    pub fn from_frame(frame: RespFrame) -> Option<Self> {
        let RespFrame::Array(items) = frame else {
            return None;
        };
        let mut parts = items.into_iter().map(|item| match item {
            RespFrame::BulkString(b) => Some(b),
            RespFrame::SimpleString(s) => Some(Bytes::from(s)),
            _ => None,
        });
        let name = parts.next()??;
        let args = parts.collect::<Option<Vec<_>>>()?;
        Some(Self { name, args })
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.name))?;
        for arg in &self.args {
            write!(f, " {}", String::from_utf8_lossy(arg))?;
        }
        Ok(())
    }
}

/// An ordered group of commands flushed in a single write.
///
/// A batch is only a client-side grouping: the server executes the commands
/// one by one and may interleave them with other connections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandBatch(pub Vec<Command>);

impl CommandBatch {
    pub fn new(commands: Vec<Command>) -> Self {
        Self(commands)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Command> {
        self.0.iter()
    }
}

impl From<Vec<Command>> for CommandBatch {
    fn from(commands: Vec<Command>) -> Self {
        Self(commands)
    }
}
