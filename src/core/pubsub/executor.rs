// src/core/pubsub/executor.rs

//! The executor capability used to run subscriber callbacks without stalling
//! the connection's I/O task.

use futures::future::BoxFuture;
use std::fmt;
use tokio::runtime::Handle;

/// Runs push-dispatch work off the I/O path.
///
/// Implementations must return promptly: `execute` is called from the
/// connection task between two decoded frames.
pub trait PushExecutor: Send + Sync + fmt::Debug {
    fn execute(&self, task: BoxFuture<'static, ()>);
}

/// The default executor: spawns every task onto a Tokio runtime.
#[derive(Clone, Default)]
pub struct TokioExecutor {
    handle: Option<Handle>,
}

impl TokioExecutor {
    /// Spawns onto the runtime the calling task runs on.
    pub fn current() -> Self {
        Self { handle: None }
    }

    /// Spawns onto a specific runtime, e.g. a dedicated one for subscribers.
    pub fn with_handle(handle: Handle) -> Self {
        Self {
            handle: Some(handle),
        }
    }
}

impl fmt::Debug for TokioExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioExecutor")
            .field("dedicated", &self.handle.is_some())
            .finish()
    }
}

impl PushExecutor for TokioExecutor {
    fn execute(&self, task: BoxFuture<'static, ()>) {
        match &self.handle {
            Some(handle) => {
                handle.spawn(task);
            }
            None => {
                tokio::spawn(task);
            }
        }
    }
}
