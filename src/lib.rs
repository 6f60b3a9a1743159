// src/lib.rs

pub mod config;
pub mod connection;
pub mod core;
pub mod pool;

// Re-export
pub use crate::config::{Address, ConnectionConfig};
pub use crate::connection::{Connection, ConnectionInitializer};
pub use crate::core::protocol::{Command, ConnectionKind, RespFrame};
pub use crate::core::{ClientError, ErrorKind, Result};
pub use crate::pool::ConnectionPool;
