//! The `Step` abstraction: a value with `{name, flags,
//! run(ctx) -> results}`. There is no class hierarchy here -- a step
//! is a [`StepTemplate`] (static flags, already in `foreman-types`)
//! paired with a [`StepAction`] closure that the build runner invokes
//! once, the same way `clock.rs`'s `Clock::sleep` hands back a boxed
//! future rather than pulling in an async-trait crate.

use std::collections::BTreeMap;
use std::sync::Arc;

use foreman_types::{LogType, PropertyBag, Renderable, Results, StepId, StepTemplate, StepUrl};

use crate::datastore::DataStore;
use crate::error::LogError;
use crate::logpipeline::LogPipeline;
use crate::render::render_args;
use crate::transport::{BoxFuture, WorkerConnection};

/// Handle for a step to create and append to its own logs. Slug
/// collisions within the step are resolved the same way DataStore
/// resolves them for any other caller (`add_log_unique`).
pub struct StepLogs<'a> {
    data: &'a DataStore,
    logs: &'a LogPipeline,
    stepid: StepId,
}

impl<'a> StepLogs<'a> {
    pub fn new(data: &'a DataStore, logs: &'a LogPipeline, stepid: StepId) -> Self {
        Self { data, logs, stepid }
    }

    pub async fn create(&self, name: &str, log_type: LogType) -> StepLogHandle<'a> {
        let log = self
            .data
            .add_log_unique(self.stepid, name.to_string(), name.to_string(), log_type)
            .await;
        self.logs.create_log(log.id, log_type, chrono::Utc::now()).await;
        StepLogHandle {
            data: self.data,
            logs: self.logs,
            logid: log.id,
        }
    }
}

pub struct StepLogHandle<'a> {
    data: &'a DataStore,
    logs: &'a LogPipeline,
    logid: foreman_types::LogId,
}

impl StepLogHandle<'_> {
    pub async fn append(&self, text: &str) -> Result<(u64, u64), LogError> {
        let (_, last) = self.logs.append(self.logid, text).await?;
        self.data.append_log_metadata(self.logid, last).await;
        Ok((0, last))
    }

    pub async fn finish(&self) {
        self.data.finish_log(self.logid).await;
        self.logs.finish_log(self.logid).await;
    }
}

/// Everything a running step is allowed to touch. Borrowed for the
/// duration of one `StepAction::run` call.
pub struct StepExecCtx<'a> {
    pub build_id: foreman_types::BuildId,
    pub properties: &'a PropertyBag,
    pub connection: &'a dyn WorkerConnection,
    pub logs: StepLogs<'a>,
}

/// What a step hands back once it completes.
pub struct StepOutcome {
    pub results: Results,
    pub urls: Vec<StepUrl>,
    /// New steps to run immediately after this one, before the
    /// statically-configured remainder of the build (step insertion).
    pub add_steps_after_current: Vec<StepSpec>,
    /// New steps to run after every other step in the build.
    pub add_steps_after_last: Vec<StepSpec>,
    /// Properties this step contributed, merged into the build's bag
    /// before the next step sees it: properties updated by step k
    /// are visible to step k+1.
    pub properties: PropertyBag,
}

impl std::fmt::Debug for StepOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepOutcome")
            .field("results", &self.results)
            .field("urls", &self.urls)
            .field("add_steps_after_current_len", &self.add_steps_after_current.len())
            .field("add_steps_after_last_len", &self.add_steps_after_last.len())
            .finish()
    }
}

impl Default for StepOutcome {
    fn default() -> Self {
        Self {
            results: Results::Success,
            urls: Vec::new(),
            add_steps_after_current: Vec::new(),
            add_steps_after_last: Vec::new(),
            properties: PropertyBag::new(),
        }
    }
}

/// A step's executable behavior. Boxed by hand rather than via
/// `async_trait`, mirroring `clock.rs`'s `Clock::sleep`: this codebase
/// has no precedent for the `async_trait` crate, and a hand-rolled
/// `Pin<Box<dyn Future>>`-returning closure is the established idiom.
pub type StepAction = Arc<dyn for<'a> Fn(&'a StepExecCtx<'a>) -> BoxFuture<'a, StepOutcome> + Send + Sync>;

/// One entry in a build's run queue: the static template (flags,
/// name) plus the closure that executes it.
#[derive(Clone)]
pub struct StepSpec {
    pub template: StepTemplate,
    pub action: StepAction,
}

impl StepSpec {
    pub fn new(template: StepTemplate, action: StepAction) -> Self {
        Self { template, action }
    }
}

static NEXT_COMMAND_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

/// A convenience action for steps whose only job is issuing one
/// worker command (the common case). `command` and `args` are fixed
/// at construction; more elaborate steps implement [`StepAction`]
/// directly as a closure.
pub fn remote_command_step(command: impl Into<String>, args: serde_json::Value) -> StepAction {
    let command = command.into();
    Arc::new(move |ctx: &StepExecCtx<'_>| {
        let command = command.clone();
        let args = args.clone();
        Box::pin(async move {
            let command_id = NEXT_COMMAND_ID.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let result = ctx.connection.remote_start_command(command_id, &command, args).await;
            StepOutcome {
                results: result.results,
                urls: result.urls,
                add_steps_after_current: Vec::new(),
                add_steps_after_last: Vec::new(),
                properties: PropertyBag::new(),
            }
        })
    })
}

/// Builds a [`StepAction`] from a template's `command`/`args`: `args`
/// is rendered against the build's live properties once, right before
/// the command is issued, then handed to the worker unchanged.
pub fn templated_command_step(command: impl Into<String>, args: BTreeMap<String, Renderable<serde_json::Value>>) -> StepAction {
    let command = command.into();
    Arc::new(move |ctx: &StepExecCtx<'_>| {
        let command = command.clone();
        let rendered = render_args(&args, ctx.properties);
        Box::pin(async move {
            let command_id = NEXT_COMMAND_ID.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let result = ctx.connection.remote_start_command(command_id, &command, rendered).await;
            StepOutcome {
                results: result.results,
                urls: result.urls,
                add_steps_after_current: Vec::new(),
                add_steps_after_last: Vec::new(),
                properties: PropertyBag::new(),
            }
        })
    })
}
