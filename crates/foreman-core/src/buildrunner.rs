//! BuildRunner: the state machine that drives one Build from
//! `CREATED` through worker/lock acquisition, step execution, and
//! teardown. This is the largest component; everything else in this
//! crate exists to be consumed from here.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use foreman_types::{
    AccessMode, Build, BuildId, Builder, BuildRequest, LockAccess, PropertyBag, PropertySource, Results, WorkerId,
};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::clock::SharedClock;
use crate::datastore::DataStore;
use crate::error::{BuildError, WorkerError};
use crate::lock::LockArbiter;
use crate::step::{StepExecCtx, StepLogs, StepOutcome, StepSpec};
use crate::transport::WorkerConnection;
use crate::worker::{SubstantiateOutcome, WorkerRegistry};
use crate::logpipeline::LogPipeline;

/// A pending request to stop the build. `BuildControl::stop` only ever
/// installs the first one -- later calls are no-ops, matching the
/// idempotent, re-entrant contract stop requests are expected to have.
#[derive(Debug, Clone)]
pub struct StopRequest {
    pub reason: String,
    pub results: Results,
}

/// The cancellation side-channel for one build. Cloned freely; every
/// clone observes the same (at most one) stop request.
#[derive(Clone)]
pub struct BuildControl {
    tx: watch::Sender<Option<StopRequest>>,
}

impl BuildControl {
    pub fn new() -> (Self, watch::Receiver<Option<StopRequest>>) {
        let (tx, rx) = watch::channel(None);
        (Self { tx }, rx)
    }

    /// `stopBuild(reason, results=CANCELLED)`. Idempotent: if a stop is
    /// already pending, this call is ignored.
    pub fn stop(&self, reason: impl Into<String>, results: Results) {
        let reason = reason.into();
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(StopRequest { reason, results });
                true
            } else {
                false
            }
        });
    }
}

impl Default for BuildControl {
    fn default() -> Self {
        Self::new().0
    }
}

/// Everything the runner needs to drive one build, gathered up front so
/// `run` itself reads as the state machine.
pub struct BuildRunnerContext<C: WorkerConnection> {
    pub data: Arc<DataStore>,
    pub logs: Arc<LogPipeline>,
    pub locks: Arc<LockArbiter>,
    pub workers: Arc<WorkerRegistry>,
    pub clock: SharedClock,
    pub builder: Builder,
    pub worker_id: WorkerId,
    pub connection: Arc<C>,
    pub ping_timeout: std::time::Duration,
    pub substantiation_timeout: std::time::Duration,
}

async fn substantiate_future<C: WorkerConnection>(
    connection: &C,
    builder_name: &str,
    timeout: std::time::Duration,
) -> SubstantiateOutcome {
    match tokio::time::timeout(timeout, connection.remote_start_build(builder_name)).await {
        Ok(Ok(())) => SubstantiateOutcome::Success,
        Ok(Err(WorkerError::LatentWorkerCannotSubstantiate(_))) => {
            SubstantiateOutcome::Permanent("worker refused to substantiate".to_string())
        }
        Ok(Err(e)) => SubstantiateOutcome::Transient(e.to_string()),
        Err(_) => SubstantiateOutcome::Transient("substantiation timed out".to_string()),
    }
}

/// Join a worker-relative build directory onto its basedir, respecting
/// the worker's path convention. No configured per-builder subdir
/// exists in this model, so the builder name is the subdir, mirroring
/// `examples/original_source/master/buildbot/process/build.py`'s
/// `workerbuilddir`-joined-onto-`worker_basedir` shape.
fn join_worker_path(convention: foreman_types::PathConvention, basedir: &str, subdir: &str) -> String {
    if basedir.is_empty() {
        return subdir.to_string();
    }
    match convention {
        foreman_types::PathConvention::Posix => format!("{}/{}", basedir.trim_end_matches('/'), subdir),
        foreman_types::PathConvention::Windows => format!("{}\\{}", basedir.trim_end_matches('\\'), subdir),
    }
}

/// Property setup merge order: master, then each change
/// (already folded into `requests[*].properties` by the scheduler that
/// created the buildrequest), then buildrequest, builder, worker.
/// Later sources win on key collision.
fn merge_build_properties(
    master_properties: &PropertyBag,
    requests: &[BuildRequest],
    builder: &Builder,
    build_id: BuildId,
    worker_basedir: &str,
    worker_builddir: &str,
) -> PropertyBag {
    let mut bag = master_properties.clone();
    for request in requests {
        bag.merge_from(&request.properties);
    }

    let mut builder_props = PropertyBag::new();
    for (k, v) in &builder.env {
        builder_props.set(k.clone(), serde_json::json!(v), PropertySource::Builder);
    }
    bag.merge_from(&builder_props);

    let mut worker_props = PropertyBag::new();
    worker_props.set("basedir", serde_json::json!(worker_basedir), PropertySource::Worker);
    worker_props.set("builddir", serde_json::json!(worker_builddir), PropertySource::Worker);
    bag.merge_from(&worker_props);

    bag.set("buildnumber", serde_json::json!(build_id.0), PropertySource::BuildRequest);

    // Single-source-stamp conveniences: branch/revision/repository
    // /codebase/project are only unambiguous with exactly one stamp.
    let all_stamps: Vec<_> = requests.iter().flat_map(|r| r.sources.values()).collect();
    if all_stamps.len() == 1 {
        let stamp = all_stamps[0];
        bag.set("branch", serde_json::json!(stamp.branch), PropertySource::BuildRequest);
        bag.set("revision", serde_json::json!(stamp.revision), PropertySource::BuildRequest);
        bag.set("repository", serde_json::json!(stamp.repository), PropertySource::BuildRequest);
        bag.set("codebase", serde_json::json!(stamp.codebase), PropertySource::BuildRequest);
        bag.set("project", serde_json::json!(stamp.project), PropertySource::BuildRequest);
    }

    // owners: sorted union of change authors, patch authors (both
    // folded by the scheduler into an `owners` array property on the
    // buildrequest -- see `scheduler::properties_for_change` and
    // `TryScheduler::on_tryjob`), and any explicit `owner` property a
    // buildrequest carries directly (e.g. a forced build).
    let mut owners = BTreeSet::new();
    for request in requests {
        if let Some(values) = request.properties.get("owners").and_then(|v| v.as_array()) {
            owners.extend(values.iter().filter_map(|v| v.as_str()).map(str::to_string));
        }
        if let Some(owner) = request.properties.get("owner").and_then(|v| v.as_str()) {
            owners.insert(owner.to_string());
        }
    }
    if !owners.is_empty() {
        bag.set("owners", serde_json::json!(owners.into_iter().collect::<Vec<_>>()), PropertySource::BuildRequest);
    }

    bag
}

/// Combine one step's result into the running build aggregate,
/// applying the `flunk*`/`warn*` escalation rules, and report whether
/// the build should now skip remaining non-`alwaysRun` steps.
fn combine_step_result(
    aggregate: Results,
    step_result: Results,
    template: &foreman_types::StepTemplate,
) -> (Results, bool) {
    let contributed = match step_result {
        Results::Failure => {
            if template.flunk_on_failure {
                Results::Failure
            } else if template.warn_on_failure {
                Results::Warnings
            } else {
                Results::Success
            }
        }
        Results::Warnings => {
            if template.flunk_on_warnings {
                Results::Failure
            } else if template.warn_on_warnings {
                Results::Warnings
            } else {
                Results::Success
            }
        }
        other => other,
    };
    let terminate = template.halt_on_failure && step_result.is_terminal_failure();
    (Results::worst(aggregate, contributed), terminate)
}

enum LockAcquireOutcome {
    Acquired(Vec<LockAccess>),
    Cancelled(Vec<LockAccess>),
}

/// ACQUIRING_LOCKS: claim each of `locks` in order, racing the whole
/// sequence against `cancel`. On cancellation, releases anything
/// already held and reports what was released so the caller can log
/// it; does not attempt to roll back partially -- there is nothing
/// left to roll back once every held lock is released.
async fn acquire_locks(
    arbiter: &LockArbiter,
    owner: u64,
    locks: &[LockAccess],
    cancel: &mut watch::Receiver<Option<StopRequest>>,
) -> LockAcquireOutcome {
    let mut held = Vec::new();
    for access in locks {
        loop {
            if cancel.borrow().is_some() {
                for h in held.iter().rev() {
                    let _ = arbiter.release(owner, &h.lock, h.mode).await;
                }
                return LockAcquireOutcome::Cancelled(held);
            }
            if arbiter.claim(owner, &access.lock, access.mode).await.is_ok() {
                held.push(access.clone());
                break;
            }
            let notify = arbiter.wait_until_maybe_available(owner, &access.lock, access.mode).await;
            tokio::select! {
                _ = notify.notified() => continue,
                _ = cancel.changed() => {
                    arbiter.stop_waiting(owner, &access.lock, access.mode).await;
                    for h in held.iter().rev() {
                        let _ = arbiter.release(owner, &h.lock, h.mode).await;
                    }
                    return LockAcquireOutcome::Cancelled(held);
                }
            }
        }
    }
    LockAcquireOutcome::Acquired(held)
}

/// Drives a single build to completion. Returns the final result;
/// `finishBuild` has already been called on `data` by the time this
/// returns (`buildFinished` itself must never throw -- every
/// path below ends in `finish_build`, including the panic-free error
/// paths). The caller retains its own [`BuildControl`] clone (the
/// other half of `cancel`) to expose `stopBuild` externally, e.g. from
/// an RPC handler or the botmaster's reconfiguration path.
#[instrument(skip(ctx, initial_steps, cancel), fields(builder = %ctx.builder.name))]
pub async fn run_build<C: WorkerConnection>(
    ctx: BuildRunnerContext<C>,
    build: Build,
    master_properties: PropertyBag,
    requests: Vec<BuildRequest>,
    initial_steps: Vec<StepSpec>,
    mut cancel: watch::Receiver<Option<StopRequest>>,
) -> Results {
    let build_id = build.id;
    let owner = build_id.0;

    ctx.data.set_build_state_string(build_id, "preparing worker").await;
    info!(build_id = build_id.0, "build preparing");

    // PREPARING_WORKER
    let substantiate = substantiate_future(&*ctx.connection, &ctx.builder.name, ctx.substantiation_timeout);
    let cancel_wait = {
        let mut cancel = cancel.clone();
        async move {
            while cancel.changed().await.is_ok() {
                if cancel.borrow().is_some() {
                    return;
                }
            }
        }
    };
    if let Err(err) = ctx.workers.substantiate_if_needed(ctx.worker_id, substantiate, cancel_wait).await {
        if matches!(err, WorkerError::LatentWorkerFailedToSubstantiate(_)) {
            ctx.workers.put_in_quarantine(ctx.worker_id).await;
        }
        return finish(&ctx, &requests, build_id, results_for_substantiate_failure(&err)).await;
    }

    // PINGING
    ctx.data.set_build_state_string(build_id, "pinging worker").await;
    let ping_result = ctx
        .workers
        .ping(ctx.worker_id, ctx.connection.ping(), ctx.ping_timeout)
        .await;
    if ping_result.is_err() {
        return finish(&ctx, &requests, build_id, Results::Retry).await;
    }
    ctx.workers.build_attached(ctx.worker_id).await;

    // ACQUIRING_LOCKS
    ctx.data.set_build_state_string(build_id, "acquiring locks").await;
    let locks_started_at = Utc::now();
    match acquire_locks(&ctx.locks, owner, &ctx.builder.locks, &mut cancel).await {
        LockAcquireOutcome::Cancelled(_) => {
            ctx.workers.build_finished(ctx.worker_id).await;
            let results = cancel.borrow().clone().map(|s| s.results).unwrap_or(Results::Cancelled);
            return finish(&ctx, &requests, build_id, results).await;
        }
        LockAcquireOutcome::Acquired(held) => {
            let elapsed = (Utc::now() - locks_started_at).to_std().unwrap_or_default();
            ctx.data.add_build_locks_duration(build_id, elapsed).await;
            debug!(build_id = build_id.0, lock_count = held.len(), "locks acquired");
        }
    }

    // BUILDING
    ctx.data.set_build_state_string(build_id, "building").await;
    let worker = ctx.workers.find_by_name(&ctx.builder.name).await;
    let basedir = worker.as_ref().map(|w| w.basedir.clone()).unwrap_or_default();
    let path_convention = worker.as_ref().map(|w| w.path_convention).unwrap_or(foreman_types::PathConvention::Posix);
    let builddir = join_worker_path(path_convention, &basedir, &ctx.builder.name);
    let mut properties =
        merge_build_properties(&master_properties, &requests, &ctx.builder, build_id, &basedir, &builddir);
    ctx.data.set_build_properties(build_id, properties.clone()).await;

    let aggregate = run_steps(&ctx, build_id, initial_steps, &mut properties, &mut cancel).await;

    // FINISHING
    for access in &ctx.builder.locks {
        let _ = ctx.locks.release(owner, &access.lock, access.mode).await;
    }
    match aggregate {
        Results::Exception => ctx.workers.put_in_quarantine(ctx.worker_id).await,
        Results::Retry => {}
        _ => ctx.workers.reset_quarantine(ctx.worker_id).await,
    }
    ctx.workers.build_finished(ctx.worker_id).await;

    finish(&ctx, &requests, build_id, aggregate).await
}

fn results_for_substantiate_failure(err: &WorkerError) -> Results {
    match err {
        WorkerError::LatentWorkerCannotSubstantiate(_) => Results::Exception,
        WorkerError::LatentWorkerSubstantiationCancelled(_) => Results::Cancelled,
        _ => Results::Retry,
    }
}

enum StepStop {
    Ran(StepOutcome),
    Interrupted(Results),
    ConnectionLost,
}

/// BUILDING: runs the queue to completion, applying step insertion,
/// result aggregation, cancellation, and lost-connection handling
/// exactly as the rest of the state machine does.
async fn run_steps<C: WorkerConnection>(
    ctx: &BuildRunnerContext<C>,
    build_id: BuildId,
    initial_steps: Vec<StepSpec>,
    properties: &mut PropertyBag,
    cancel: &mut watch::Receiver<Option<StopRequest>>,
) -> Results {
    let mut queue: VecDeque<StepSpec> = initial_steps.into();
    let mut aggregate = Results::Success;
    let mut terminate = false;
    let disconnect = ctx.connection.disconnected();

    while let Some(spec) = queue.pop_front() {
        if terminate && !spec.template.always_run {
            let step = ctx.data.add_step(build_id, spec.template.clone()).await;
            ctx.data.finish_step(step.id, Results::Skipped).await;
            continue;
        }

        let step = ctx.data.add_step(build_id, spec.template.clone()).await;
        ctx.data.start_step(step.id).await;

        let exec_ctx = StepExecCtx {
            build_id,
            properties,
            connection: &*ctx.connection,
            logs: StepLogs::new(&ctx.data, &ctx.logs, step.id),
        };

        let outcome = tokio::select! {
            outcome = (spec.action)(&exec_ctx) => StepStop::Ran(outcome),
            _ = cancel.changed() => {
                let results = cancel.borrow().clone().map(|s| s.results).unwrap_or(Results::Cancelled);
                StepStop::Interrupted(results)
            }
            _ = disconnect.notified() => StepStop::ConnectionLost,
        };
        drop(exec_ctx);

        match outcome {
            StepStop::Ran(out) => {
                for url in out.urls {
                    ctx.data.add_step_url(step.id, url).await;
                }
                properties.merge_from(&out.properties);
                ctx.data.finish_step(step.id, out.results).await;

                let (new_aggregate, should_terminate) = combine_step_result(aggregate, out.results, &spec.template);
                aggregate = new_aggregate;
                if should_terminate {
                    terminate = true;
                }
                for inserted in out.add_steps_after_current.into_iter().rev() {
                    queue.push_front(inserted);
                }
                for inserted in out.add_steps_after_last {
                    queue.push_back(inserted);
                }
            }
            StepStop::Interrupted(results) => {
                ctx.data.finish_step(step.id, results).await;
                aggregate = Results::worst(aggregate, results);
                terminate = true;
            }
            StepStop::ConnectionLost => {
                warn!(build_id = build_id.0, step = %step.name, "connection lost mid-step");
                ctx.data.finish_step(step.id, Results::Retry).await;
                aggregate = Results::Retry;
                terminate = true;
            }
        }
    }

    aggregate
}

async fn finish<C: WorkerConnection>(
    ctx: &BuildRunnerContext<C>,
    requests: &[BuildRequest],
    build_id: BuildId,
    results: Results,
) -> Results {
    ctx.data.set_build_state_string(build_id, format!("finished ({results:?})")).await;
    ctx.data.finish_build(build_id, results).await;
    let ids: Vec<_> = requests.iter().map(|r| r.id).collect();
    ctx.data.complete_build_requests(&ids, results).await;
    info!(build_id = build_id.0, ?results, "build finished");
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::system_clock;
    use crate::eventbus::EventBus;
    use crate::step::StepSpec;
    use crate::transport::test_support::FakeConnection;
    use crate::transport::CommandResult;
    use foreman_retry::BackoffPolicy;
    use foreman_types::{BuilderId, BuildRequestId, BuildsetId, Claim, LockId, LockScope, MasterId, PathConvention,
        SourceStampId, StepTemplate, Worker};
    use std::sync::Arc;
    use std::time::Duration;

    fn builder(locks: Vec<LockAccess>) -> Builder {
        Builder {
            id: BuilderId(1),
            name: "b".to_string(),
            workernames: vec!["w".to_string()],
            locks,
            project: "proj".to_string(),
            tags: vec![],
            env: Default::default(),
            factory: vec![],
            do_build_if: None,
        }
    }

    fn request() -> BuildRequest {
        BuildRequest {
            id: BuildRequestId(1),
            buildsetid: BuildsetId(1),
            builderid: BuilderId(1),
            priority: 0,
            submitted_at: Utc::now(),
            waited_for: None,
            properties: PropertyBag::new(),
            sources: Default::default(),
            claimed_by: Some(Claim { masterid: MasterId(1), claimed_at: Utc::now() }),
            complete: false,
            results: None,
        }
    }

    async fn context(connection: Arc<FakeConnection>) -> (BuildRunnerContext<FakeConnection>, Arc<DataStore>) {
        let bus = EventBus::new();
        let data = Arc::new(DataStore::new(bus));
        let logs = Arc::new(LogPipeline::new(crate::logpipeline::CodecRegistry::raw_only()));
        let locks = Arc::new(LockArbiter::new());
        let workers = Arc::new(WorkerRegistry::new(system_clock()));
        workers
            .register(
                Worker {
                    id: WorkerId(1),
                    name: "w".to_string(),
                    capabilities: vec![],
                    basedir: "/tmp".to_string(),
                    path_convention: PathConvention::Posix,
                    latent: None,
                },
                BackoffPolicy::default(),
            )
            .await;
        let ctx = BuildRunnerContext {
            data: data.clone(),
            logs,
            locks,
            workers,
            clock: system_clock(),
            builder: builder(vec![]),
            worker_id: WorkerId(1),
            connection,
            ping_timeout: Duration::from_millis(200),
            substantiation_timeout: Duration::from_millis(200),
        };
        (ctx, data)
    }

    fn success_step() -> StepSpec {
        StepSpec::new(
            StepTemplate { name: "step".to_string(), ..Default::default() },
            Arc::new(|_ctx| Box::pin(async { StepOutcome { results: Results::Success, ..Default::default() } })),
        )
    }

    #[tokio::test]
    async fn happy_path_reaches_success() {
        let connection = Arc::new(FakeConnection::new(vec![CommandResult::success()]));
        let (ctx, data) = context(connection).await;
        let build = data.add_build(BuilderId(1), WorkerId(1), vec![], PropertyBag::new()).await;
        let (_control, cancel) = BuildControl::new();

        let result = run_build(ctx, build.clone(), PropertyBag::new(), vec![request()], vec![success_step()], cancel).await;
        assert_eq!(result, Results::Success);
        let finished = data.get_build(build.id).await.unwrap();
        assert!(finished.complete);
    }

    #[tokio::test]
    async fn flunk_on_failure_escalates_build_to_failure_all_steps_run() {
        // Scenario 2 from the design's testable scenarios.
        let connection = Arc::new(FakeConnection::new(vec![]));
        let (ctx, data) = context(connection).await;
        let build = data.add_build(BuilderId(1), WorkerId(1), vec![], PropertyBag::new()).await;
        let (_control, cancel) = BuildControl::new();

        let warn_step = StepSpec::new(
            StepTemplate { name: "warn".to_string(), warn_on_failure: true, halt_on_failure: false, ..Default::default() },
            Arc::new(|_ctx| Box::pin(async { StepOutcome { results: Results::Warnings, ..Default::default() } })),
        );
        let fail_step = StepSpec::new(
            StepTemplate { name: "fail".to_string(), flunk_on_failure: true, halt_on_failure: false, ..Default::default() },
            Arc::new(|_ctx| Box::pin(async { StepOutcome { results: Results::Failure, ..Default::default() } })),
        );
        let ok_step = success_step();

        let result = run_build(
            ctx,
            build.clone(),
            PropertyBag::new(),
            vec![request()],
            vec![warn_step, fail_step, ok_step],
            cancel,
        )
        .await;
        assert_eq!(result, Results::Failure);

        let finished = data.get_build(build.id).await.unwrap();
        assert_eq!(finished.results, Some(Results::Failure));
    }

    #[tokio::test]
    async fn stop_build_skips_non_always_run_but_runs_always_run() {
        // Scenario 3: stop during step A, B (not alwaysRun) skipped, C
        // (alwaysRun) executes, final result CANCELLED.
        let connection = Arc::new(FakeConnection::new(vec![]));
        let (ctx, data) = context(connection).await;
        let build = data.add_build(BuilderId(1), WorkerId(1), vec![], PropertyBag::new()).await;
        let (control, cancel) = BuildControl::new();
        let control2 = control.clone();

        let step_a = StepSpec::new(
            StepTemplate { name: "a".to_string(), halt_on_failure: false, ..Default::default() },
            Arc::new(move |_ctx| {
                let control2 = control2.clone();
                Box::pin(async move {
                    control2.stop("stop it", Results::Cancelled);
                    StepOutcome { results: Results::Success, ..Default::default() }
                })
            }),
        );
        let step_b = StepSpec::new(
            StepTemplate { name: "b".to_string(), always_run: false, ..Default::default() },
            Arc::new(|_ctx| Box::pin(async { panic!("B must not run") })),
        );
        let step_c = StepSpec::new(
            StepTemplate { name: "c".to_string(), always_run: true, ..Default::default() },
            Arc::new(|_ctx| Box::pin(async { StepOutcome { results: Results::Success, ..Default::default() } })),
        );

        let result = run_build(
            ctx,
            build.clone(),
            PropertyBag::new(),
            vec![request()],
            vec![step_a, step_b, step_c],
            cancel,
        )
        .await;
        assert_eq!(result, Results::Cancelled);
    }

    #[tokio::test]
    async fn connection_loss_mid_step_forces_retry() {
        // Scenario 4.
        let connection = Arc::new(FakeConnection::new(vec![]));
        let (ctx, data) = context(connection.clone()).await;
        let build = data.add_build(BuilderId(1), WorkerId(1), vec![], PropertyBag::new()).await;
        let (_control, cancel) = BuildControl::new();

        let hanging_step = StepSpec::new(
            StepTemplate { name: "hang".to_string(), ..Default::default() },
            Arc::new(|_ctx| Box::pin(std::future::pending())),
        );

        let conn_for_trigger = connection.clone();
        let handle = tokio::spawn(async move {
            run_build(ctx, build, PropertyBag::new(), vec![request()], vec![hanging_step], cancel).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        conn_for_trigger.trigger_disconnect();
        let result = handle.await.unwrap();
        assert_eq!(result, Results::Retry);
    }

    #[tokio::test]
    async fn locks_are_held_during_steps_and_released_on_finish() {
        let lock_id = LockId { scope: LockScope::Master, name: "l".to_string(), max_count: 1 };
        let connection = Arc::new(FakeConnection::new(vec![]));
        let (mut ctx, data) = context(connection).await;
        ctx.builder = builder(vec![LockAccess { lock: lock_id.clone(), mode: AccessMode::Exclusive }]);
        let build = data.add_build(BuilderId(1), WorkerId(1), vec![], PropertyBag::new()).await;
        let (_control, cancel) = BuildControl::new();
        let locks = ctx.locks.clone();

        let result = run_build(ctx, build, PropertyBag::new(), vec![request()], vec![success_step()], cancel).await;
        assert_eq!(result, Results::Success);
        // Lock must be free again: a fresh claim succeeds.
        locks.claim(999, &lock_id, AccessMode::Exclusive).await.unwrap();
    }

    #[test]
    fn combine_step_result_retry_is_sticky() {
        let template = StepTemplate::default();
        let (agg, _) = combine_step_result(Results::Retry, Results::Success, &template);
        assert_eq!(agg, Results::Retry);
    }

    #[test]
    fn combine_step_result_failure_without_flunk_does_not_fail_build() {
        let template = StepTemplate { flunk_on_failure: false, warn_on_failure: false, halt_on_failure: false, ..Default::default() };
        let (agg, terminate) = combine_step_result(Results::Success, Results::Failure, &template);
        assert_eq!(agg, Results::Success);
        // halt_on_failure is false, but the step itself still failed --
        // terminate tracks the step's own terminal-ness, not escalation.
        assert!(terminate == false);
    }
}
