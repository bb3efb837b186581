//! BotMaster: the top-level coordinator. Owns every subsystem
//! below it, accepts reconfiguration (builders and workers come and go
//! without a restart), and is the one place allowed to turn a
//! [`crate::distributor::DistributedBuild`] into a spawned
//! [`crate::buildrunner::run_build`] task -- every other module only
//! prepares the inputs that path needs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use foreman_retry::BackoffPolicy;
use foreman_types::{Builder, BuilderId, MasterId, PropertyBag, Worker, WorkerId};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::buildrunner::{run_build, BuildControl, BuildRunnerContext};
use crate::clock::SharedClock;
use crate::datastore::DataStore;
use crate::distributor::{BuildRequestDistributor, CollapseStrategy, DistributedBuild};
use crate::eventbus::EventBus;
use crate::lock::LockArbiter;
use crate::logpipeline::{CodecRegistry, LogPipeline};
use crate::step::{templated_command_step, StepSpec};
use crate::transport::WorkerConnection;
use crate::worker::WorkerRegistry;

/// Timeouts applied uniformly to every build this master runs; these
/// are populated from a loaded `foreman-config` configuration.
#[derive(Debug, Clone)]
pub struct MasterTimeouts {
    pub ping: Duration,
    pub substantiation: Duration,
}

impl Default for MasterTimeouts {
    fn default() -> Self {
        Self {
            ping: Duration::from_secs(30),
            substantiation: Duration::from_secs(300),
        }
    }
}

struct RegisteredWorker<C: WorkerConnection> {
    worker: Worker,
    connection: Arc<C>,
}

/// Owns every subsystem below it except try-job intake, which is a
/// thin caller of [`crate::tryjob::parse_tryjob`] plus
/// `upsert_buildset` and lives at the RPC-channel layer above this
/// crate, and wires the distributor's output into running builds.
///
/// Generic over the worker transport: a deployment picks one
/// `WorkerConnection` implementation and every worker this master
/// talks to uses it, the same way the build runner itself is generic
/// over `C`.
pub struct BotMaster<C: WorkerConnection> {
    masterid: MasterId,
    pub data: Arc<DataStore>,
    pub logs: Arc<LogPipeline>,
    pub locks: Arc<LockArbiter>,
    pub workers: Arc<WorkerRegistry>,
    bus: EventBus,
    clock: SharedClock,
    distributor: BuildRequestDistributor,
    builders: Mutex<HashMap<BuilderId, Builder>>,
    connections: Mutex<HashMap<WorkerId, RegisteredWorker<C>>>,
    controls: Mutex<HashMap<foreman_types::BuildId, BuildControl>>,
    master_properties: PropertyBag,
    timeouts: MasterTimeouts,
}

impl<C: WorkerConnection + 'static> BotMaster<C> {
    pub fn new(masterid: MasterId, clock: SharedClock, master_properties: PropertyBag, timeouts: MasterTimeouts) -> Self {
        let bus = EventBus::new();
        let data = Arc::new(DataStore::new(bus.clone()));
        let logs = Arc::new(LogPipeline::new(CodecRegistry::raw_only()));
        let locks = Arc::new(LockArbiter::new());
        let workers = Arc::new(WorkerRegistry::new(clock.clone()));
        let distributor = BuildRequestDistributor::new(data.clone(), workers.clone(), masterid);
        Self {
            masterid,
            data,
            logs,
            locks,
            workers,
            bus,
            clock,
            distributor,
            builders: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            controls: Mutex::new(HashMap::new()),
            master_properties,
            timeouts,
        }
    }

    pub fn with_collapse_strategy(mut self, strategy: Arc<dyn CollapseStrategy>) -> Self {
        self.distributor = self.distributor.with_collapse_strategy(strategy);
        self
    }

    pub fn masterid(&self) -> MasterId {
        self.masterid
    }

    /// The bus every subsystem publishes to; a caller (e.g. the CLI's
    /// `serve` loop) subscribes here to know when to call
    /// `maybe_start_builds_for_all_builders` again rather than polling.
    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    /// Reconfiguration: add or replace a builder definition. A builder
    /// already mid-build is unaffected -- `run_build` was handed its
    /// own snapshot of the `Builder` at spawn time.
    #[instrument(skip(self, builder), fields(builder = %builder.name))]
    pub async fn upsert_builder(&self, builder: Builder) {
        info!("builder registered");
        self.builders.lock().await.insert(builder.id, builder);
    }

    pub async fn remove_builder(&self, id: BuilderId) {
        self.builders.lock().await.remove(&id);
    }

    pub async fn builders(&self) -> Vec<Builder> {
        self.builders.lock().await.values().cloned().collect()
    }

    #[instrument(skip(self, worker, connection, policy), fields(worker = %worker.name))]
    pub async fn register_worker(&self, worker: Worker, connection: Arc<C>, policy: BackoffPolicy) {
        info!("worker registered");
        let id = worker.id;
        self.workers.register(worker.clone(), policy).await;
        self.data.upsert_worker(worker.clone()).await;
        self.connections.lock().await.insert(id, RegisteredWorker { worker, connection });
    }

    /// Drops the worker's connection so the distributor stops offering
    /// it new work. Any build already running against it keeps running
    /// -- the runner holds its own `Arc<C>` clone; disconnection is
    /// observed through `WorkerConnection::disconnected`, not through
    /// this removal.
    pub async fn remove_worker(&self, id: WorkerId) {
        self.connections.lock().await.remove(&id);
    }

    /// Call after every `buildrequests/*/new` event, lock release, and
    /// build finish -- any moment that might have turned an unavailable
    /// builder into an available one. Returns how many builds were
    /// started.
    #[instrument(skip(self))]
    pub async fn maybe_start_builds_for_all_builders(self: &Arc<Self>) -> Result<usize> {
        let builders: Vec<Builder> = self.builders.lock().await.values().cloned().collect();
        let started = self.distributor.maybe_start_builds_for_all_builders(&builders).await;
        let count = started.len();
        for distributed in started {
            self.spawn_build(distributed).await?;
        }
        Ok(count)
    }

    async fn spawn_build(self: &Arc<Self>, distributed: DistributedBuild) -> Result<()> {
        let DistributedBuild { builder, worker, requests } = distributed;
        let connection = {
            let conns = self.connections.lock().await;
            conns
                .get(&worker.id)
                .map(|registered| registered.connection.clone())
                .with_context(|| format!("worker {:?} has no registered connection", worker.id))?
        };

        let build = self
            .data
            .add_build(builder.id, worker.id, requests.iter().map(|r| r.id).collect(), PropertyBag::new())
            .await;

        // A builder's factory is a declarative template; turn each
        // entry into a runnable step the same way every step in this
        // codebase that issues exactly one worker command does
        // (`step::templated_command_step`). `args` is rendered against
        // this build's properties once the step is actually reached,
        // not here, so later steps' property writes are visible to
        // earlier-queued steps. A factory entry that needs bespoke
        // behavior is configured with its own `StepAction` upstream of
        // this point, not here.
        let steps: Vec<StepSpec> = builder
            .factory
            .iter()
            .cloned()
            .map(|template| {
                let action = templated_command_step(template.command.clone(), template.args.clone());
                StepSpec::new(template, action)
            })
            .collect();

        let ctx = BuildRunnerContext {
            data: self.data.clone(),
            logs: self.logs.clone(),
            locks: self.locks.clone(),
            workers: self.workers.clone(),
            clock: self.clock.clone(),
            builder,
            worker_id: worker.id,
            connection,
            ping_timeout: self.timeouts.ping,
            substantiation_timeout: self.timeouts.substantiation,
        };

        let (control, cancel) = BuildControl::new();
        let build_id = build.id;
        self.controls.lock().await.insert(build_id, control);

        let master_properties = self.master_properties.clone();
        let this = self.clone();
        tokio::spawn(async move {
            let results = run_build(ctx, build, master_properties, requests, steps, cancel).await;
            this.controls.lock().await.remove(&build_id);
            info!(build_id = build_id.0, ?results, "build task complete, rewaking distributor");
            if let Err(err) = this.maybe_start_builds_for_all_builders().await {
                warn!(%err, "failed to restart distributor after build finish");
            }
        });

        Ok(())
    }

    /// Externally initiated `stopBuild`, e.g. relayed from the try-job
    /// RPC channel or an admin command over `foreman-cli reconfig`.
    /// Returns `false` if no build with that id is currently running.
    pub async fn stop_build(&self, id: foreman_types::BuildId, reason: impl Into<String>, results: foreman_types::Results) -> bool {
        match self.controls.lock().await.get(&id) {
            Some(control) => {
                control.stop(reason, results);
                true
            }
            None => false,
        }
    }
}
