//! A reference [`WorkerConnection`] for local smoke-testing and demos.
//!
//! `foreman-core` deliberately never implements the worker side of the
//! transport (see its crate docs) -- a real deployment supplies its own
//! `WorkerConnection` wired to whatever wire protocol its worker fleet
//! speaks. This loopback connection exists only so `foreman serve` has
//! something to register against out of the box: every command
//! succeeds immediately with no worker process on the other end,
//! useful for exercising the distributor/scheduler/lock-arbiter
//! behavior without standing up real infrastructure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use foreman_core::transport::{BoxFuture, CommandResult, WorkerConnection};
use foreman_types::Results;
use serde_json::Value;
use tokio::sync::Notify;

pub struct LoopbackConnection {
    version: String,
    disconnect: Arc<Notify>,
    disconnected: AtomicBool,
}

impl LoopbackConnection {
    pub fn new() -> Self {
        Self {
            version: "loopback-1".to_string(),
            disconnect: Arc::new(Notify::new()),
            disconnected: AtomicBool::new(false),
        }
    }

    /// Simulates the worker going away, e.g. for an operator testing
    /// reconnection handling without real hardware.
    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
        self.disconnect.notify_waiters();
    }
}

impl Default for LoopbackConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerConnection for LoopbackConnection {
    fn remote_start_build<'a>(&'a self, _builder_name: &'a str) -> BoxFuture<'a, Result<(), foreman_core::error::WorkerError>> {
        Box::pin(async { Ok(()) })
    }

    fn remote_start_command<'a>(&'a self, _command_id: u64, _command: &'a str, _args: Value) -> BoxFuture<'a, CommandResult> {
        Box::pin(async {
            CommandResult {
                results: Results::Success,
                urls: Vec::new(),
            }
        })
    }

    fn remote_interrupt_command<'a>(&'a self, _command_id: u64, _reason: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }

    fn ping<'a>(&'a self) -> BoxFuture<'a, bool> {
        let alive = !self.disconnected.load(Ordering::SeqCst);
        Box::pin(async move { alive })
    }

    fn disconnected(&self) -> Arc<Notify> {
        self.disconnect.clone()
    }

    fn command_version(&self) -> &str {
        &self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_success_and_stays_connected_by_default() {
        let conn = LoopbackConnection::new();
        assert!(conn.ping().await);
        let result = conn.remote_start_command(1, "shell", Value::Null).await;
        assert!(matches!(result.results, Results::Success));
    }

    #[tokio::test]
    async fn disconnect_flips_ping_and_notifies_waiters() {
        let conn = LoopbackConnection::new();
        let notify = conn.disconnected();
        let notified = notify.notified();
        conn.disconnect();
        notified.await;
        assert!(!conn.ping().await);
    }
}
