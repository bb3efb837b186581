//! The `IConnection` abstraction: the wire transport between
//! master and worker is an external collaborator, referenced only
//! through this trait. Workers are external processes; this crate
//! never implements the worker side of the protocol.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use foreman_types::{Results, StepUrl};
use serde_json::Value;
use tokio::sync::Notify;

use crate::error::WorkerError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The outcome of one `remoteStartCommand` round-trip.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub results: Results,
    pub urls: Vec<StepUrl>,
}

impl CommandResult {
    pub fn success() -> Self {
        Self {
            results: Results::Success,
            urls: Vec::new(),
        }
    }

    pub fn failure() -> Self {
        Self {
            results: Results::Failure,
            urls: Vec::new(),
        }
    }
}

/// One attached worker's live connection. A build holds exactly one of
/// these for its lifetime; steps issue commands against it.
///
/// Command types (`shell`, `upload`, `download`, `mkdir`,
/// `rmdir`, `stat`, `listdir`) are not separate trait methods here --
/// they are the `command` string passed to `remote_start_command`,
/// matching the worker protocol's single opaque-args RPC shape rather
/// than inventing a method per command kind.
pub trait WorkerConnection: Send + Sync {
    fn remote_start_build<'a>(&'a self, builder_name: &'a str) -> BoxFuture<'a, Result<(), WorkerError>>;

    fn remote_start_command<'a>(
        &'a self,
        command_id: u64,
        command: &'a str,
        args: Value,
    ) -> BoxFuture<'a, CommandResult>;

    fn remote_interrupt_command<'a>(&'a self, command_id: u64, reason: &'a str) -> BoxFuture<'a, ()>;

    fn ping<'a>(&'a self) -> BoxFuture<'a, bool>;

    /// Fires (once) when the transport notices the worker has gone
    /// away. Polled via `tokio::select!` alongside step execution so a
    /// drop mid-step is observed as `ConnectionLost` rather than hung.
    fn disconnected(&self) -> Arc<Notify>;

    /// The negotiated worker command-protocol version string (e.g.
    /// `"3.3"`), available once `remote_start_build` has completed.
    fn command_version(&self) -> &str;
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// A connection double for build-runner tests: scripted command
    /// results, an optional disconnect trigger, and call recording.
    pub struct FakeConnection {
        pub version: String,
        pub command_results: Mutex<Vec<CommandResult>>,
        pub disconnect: Arc<Notify>,
        pub interrupted: Mutex<Vec<u64>>,
        pub ping_ok: bool,
        pub last_command: Mutex<Option<(String, Value)>>,
    }

    impl FakeConnection {
        pub fn new(results: Vec<CommandResult>) -> Self {
            Self {
                version: "3.3".to_string(),
                command_results: Mutex::new(results),
                disconnect: Arc::new(Notify::new()),
                interrupted: Mutex::new(Vec::new()),
                ping_ok: true,
                last_command: Mutex::new(None),
            }
        }

        pub fn trigger_disconnect(&self) {
            self.disconnect.notify_waiters();
        }
    }

    impl WorkerConnection for FakeConnection {
        fn remote_start_build<'a>(&'a self, _builder_name: &'a str) -> BoxFuture<'a, Result<(), WorkerError>> {
            Box::pin(async { Ok(()) })
        }

        fn remote_start_command<'a>(
            &'a self,
            _command_id: u64,
            command: &'a str,
            args: Value,
        ) -> BoxFuture<'a, CommandResult> {
            *self.last_command.lock().unwrap() = Some((command.to_string(), args));
            Box::pin(async move {
                let mut results = self.command_results.lock().unwrap();
                if results.is_empty() {
                    CommandResult::success()
                } else {
                    results.remove(0)
                }
            })
        }

        fn remote_interrupt_command<'a>(&'a self, command_id: u64, _reason: &'a str) -> BoxFuture<'a, ()> {
            self.interrupted.lock().unwrap().push(command_id);
            Box::pin(async {})
        }

        fn ping<'a>(&'a self) -> BoxFuture<'a, bool> {
            let ok = self.ping_ok;
            Box::pin(async move { ok })
        }

        fn disconnected(&self) -> Arc<Notify> {
            self.disconnect.clone()
        }

        fn command_version(&self) -> &str {
            &self.version
        }
    }
}
