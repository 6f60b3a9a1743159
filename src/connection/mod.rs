// src/connection/mod.rs

//! Manages the lifecycle of client connections: TLS gating, the I/O task,
//! reply correlation and reconnection.

mod driver;
mod handle;
mod initializer;
mod queue;
mod stream;
mod tls;
mod watchdog;

pub use handle::{Connection, ReadyState, Subscriptions};
pub use initializer::ConnectionInitializer;
pub use queue::{CommandsQueue, PendingCommand, ResultSlot};
pub use stream::ClientStream;
pub use tls::{GateEvent, GateState, TlsContext, TlsGate, TrustMode};
pub use watchdog::{ClosedEvent, ConnectionWatchdog, WatchdogHandle, WatchdogRegistry};
