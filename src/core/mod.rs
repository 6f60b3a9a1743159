// src/core/mod.rs

//! The central module containing the wire protocol, the error type and the
//! push-message plumbing shared by every connection.

pub mod codec;
pub mod errors;
pub mod protocol;
pub mod pubsub;

pub use errors::{ClientError, ErrorKind, Result};
