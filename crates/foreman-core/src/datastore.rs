//! Typed CRUD over builders, builds, steps, buildsets, buildrequests,
//! logs, and workers. Every successful mutation publishes a
//! corresponding event; this is the *only* path through which other
//! components observe each other's state (mutations go through
//! DataStore, which then publishes an event; other components
//! subscribe rather than mutating each other directly").

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use foreman_types::{
    Build, BuildId, BuildRequest, BuildRequestId, Builder, BuilderId, Buildset, BuildsetId, Claim,
    Log, LogId, LogType, MasterId, PropertyBag, Results, SourceStamp, SourceStampId, Step, StepId,
    StepUrl, Worker, WorkerId,
};
use serde_json::json;
use tokio::sync::Mutex;

use crate::error::DataStoreError;
use crate::eventbus::EventBus;

#[derive(Default)]
struct Tables {
    builders: BTreeMap<BuilderId, Builder>,
    builds: BTreeMap<BuildId, Build>,
    steps: BTreeMap<StepId, Step>,
    logs: BTreeMap<LogId, Log>,
    buildsets: BTreeMap<BuildsetId, Buildset>,
    buildrequests: BTreeMap<BuildRequestId, BuildRequest>,
    workers: BTreeMap<WorkerId, Worker>,
    /// Dense per-builder build numbering (invariant 6).
    next_build_number: BTreeMap<BuilderId, u64>,
    /// Per-build step name counters, for the `_<n>` uniquification rule.
    step_name_seq: BTreeMap<(BuildId, String), u32>,
    projects: BTreeMap<String, u64>,
}

pub struct DataStore {
    bus: EventBus,
    tables: Mutex<Tables>,
    next_id: AtomicU64,
}

fn next(counter: &AtomicU64) -> u64 {
    counter.fetch_add(1, Ordering::SeqCst) + 1
}

impl DataStore {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            tables: Mutex::new(Tables::default()),
            next_id: AtomicU64::new(0),
        }
    }

    async fn publish(&self, key: &[&str], payload: serde_json::Value) {
        self.bus
            .publish(key.iter().map(|s| s.to_string()).collect(), payload)
            .await;
    }

    // -- builders --------------------------------------------------

    pub async fn update_builder_info(&self, builder: Builder) {
        let id = builder.id;
        self.tables.lock().await.builders.insert(id, builder);
        self.publish(&["builders", &id.to_string(), "update"], json!({})).await;
    }

    pub async fn find_project_id(&self, project: &str) -> u64 {
        let mut tables = self.tables.lock().await;
        if let Some(id) = tables.projects.get(project) {
            return *id;
        }
        let id = next(&self.next_id);
        tables.projects.insert(project.to_string(), id);
        id
    }

    pub async fn get_builder(&self, id: BuilderId) -> Option<Builder> {
        self.tables.lock().await.builders.get(&id).cloned()
    }

    /// Looks up a builder's id by name. Builder names are unique within
    /// a master by configuration convention, not an enforced invariant
    /// here; the first match wins.
    pub async fn find_builder_by_name(&self, name: &str) -> Option<BuilderId> {
        self.tables.lock().await.builders.values().find(|b| b.name == name).map(|b| b.id)
    }

    /// Allocates a fresh id for a source stamp a caller is about to
    /// build (e.g. [`crate::tryjob_intake::TryJobIntake`] minting one for
    /// an incoming try job) -- source stamps share the same id space as
    /// every other entity here.
    pub fn next_source_stamp_id(&self) -> SourceStampId {
        SourceStampId(next(&self.next_id))
    }

    // -- buildsets / buildrequests -----------------------------------

    pub async fn add_buildset(
        &self,
        reason: String,
        sourcestamps: Vec<SourceStamp>,
        properties: PropertyBag,
        parent_buildid: Option<BuildId>,
        requests: Vec<(BuilderId, i32)>,
    ) -> (BuildsetId, Vec<BuildRequestId>) {
        let id = BuildsetId(next(&self.next_id));
        let submitted_at = Utc::now();
        let buildset = Buildset {
            id,
            reason,
            sourcestamps: sourcestamps.clone(),
            properties: properties.clone(),
            parent_buildid,
            submitted_at,
        };

        let mut request_ids = Vec::new();
        {
            let mut tables = self.tables.lock().await;
            tables.buildsets.insert(id, buildset);
            for (builderid, priority) in requests {
                let reqid = BuildRequestId(next(&self.next_id));
                let sources = sourcestamps
                    .iter()
                    .map(|ss| (ss.codebase.clone(), ss.clone()))
                    .collect();
                tables.buildrequests.insert(
                    reqid,
                    BuildRequest {
                        id: reqid,
                        buildsetid: id,
                        builderid,
                        priority,
                        submitted_at,
                        waited_for: None,
                        properties: properties.clone(),
                        sources,
                        claimed_by: None,
                        complete: false,
                        results: None,
                    },
                );
                request_ids.push(reqid);
            }
        }

        // Persist before publishing the `new` event -- readers that react to
        // the event must already be able to see the row.
        self.publish(&["buildsets", &id.to_string(), "new"], json!({})).await;
        (id, request_ids)
    }

    /// All-or-nothing claim. Returns `Err(ClaimConflict)` and claims
    /// nothing if any requested id is already claimed or complete.
    pub async fn claim_build_requests(
        &self,
        ids: &[BuildRequestId],
        masterid: MasterId,
    ) -> Result<(), DataStoreError> {
        let mut tables = self.tables.lock().await;
        for id in ids {
            let Some(req) = tables.buildrequests.get(id) else {
                return Err(DataStoreError::NotFound(format!("buildrequest {id:?}")));
            };
            if req.claimed_by.is_some() || req.complete {
                return Err(DataStoreError::ClaimConflict);
            }
        }
        let claimed_at = Utc::now();
        for id in ids {
            if let Some(req) = tables.buildrequests.get_mut(id) {
                req.claimed_by = Some(Claim { masterid, claimed_at });
            }
        }
        drop(tables);
        for id in ids {
            self.publish(&["buildrequests", &id.to_string(), "claimed"], json!({})).await;
        }
        Ok(())
    }

    pub async fn complete_build_requests(&self, ids: &[BuildRequestId], results: Results) {
        {
            let mut tables = self.tables.lock().await;
            for id in ids {
                if let Some(req) = tables.buildrequests.get_mut(id) {
                    req.complete = true;
                    req.results = Some(results);
                }
            }
        }
        for id in ids {
            self.publish(&["buildrequests", &id.to_string(), "complete"], json!({"results": format!("{results:?}")}))
                .await;
        }
    }

    pub async fn pending_build_requests(&self) -> Vec<BuildRequest> {
        self.tables
            .lock()
            .await
            .buildrequests
            .values()
            .filter(|r| r.claimed_by.is_none() && !r.complete)
            .cloned()
            .collect()
    }

    pub async fn get_build_request(&self, id: BuildRequestId) -> Option<BuildRequest> {
        self.tables.lock().await.buildrequests.get(&id).cloned()
    }

    // -- builds --------------------------------------------------

    pub async fn add_build(
        &self,
        builderid: BuilderId,
        workerid: WorkerId,
        buildrequestids: Vec<BuildRequestId>,
        properties: PropertyBag,
    ) -> Build {
        let mut tables = self.tables.lock().await;
        let id = BuildId(next(&self.next_id));
        let number_slot = tables.next_build_number.entry(builderid).or_insert(0);
        *number_slot += 1;
        let number = *number_slot;
        let build = Build {
            id,
            number,
            builderid,
            workerid,
            buildrequestids,
            started_at: Utc::now(),
            complete: false,
            results: None,
            state_string: "starting".to_string(),
            properties,
            locks_duration: std::time::Duration::ZERO,
        };
        tables.builds.insert(id, build.clone());
        drop(tables);
        self.publish(&["builds", &id.to_string(), "new"], json!({"number": number})).await;
        build
    }

    pub async fn set_build_state_string(&self, id: BuildId, state: impl Into<String>) {
        let state = state.into();
        if let Some(b) = self.tables.lock().await.builds.get_mut(&id) {
            b.state_string = state.clone();
        }
        self.publish(&["builds", &id.to_string(), "update"], json!({"state_string": state})).await;
    }

    pub async fn set_build_properties(&self, id: BuildId, properties: PropertyBag) {
        if let Some(b) = self.tables.lock().await.builds.get_mut(&id) {
            b.properties = properties;
        }
        self.publish(&["builds", &id.to_string(), "properties", "update"], json!({})).await;
    }

    pub async fn add_build_locks_duration(&self, id: BuildId, extra: std::time::Duration) {
        if let Some(b) = self.tables.lock().await.builds.get_mut(&id) {
            b.locks_duration += extra;
        }
    }

    pub async fn finish_build(&self, id: BuildId, results: Results) {
        {
            let mut tables = self.tables.lock().await;
            if let Some(b) = tables.builds.get_mut(&id) {
                b.complete = true;
                b.results = Some(results);
            }
        }
        self.publish(&["builds", &id.to_string(), "finished"], json!({"results": format!("{results:?}")}))
            .await;
    }

    pub async fn get_build(&self, id: BuildId) -> Option<Build> {
        self.tables.lock().await.builds.get(&id).cloned()
    }

    // -- steps --------------------------------------------------

    /// Add a step, uniquifying its name within the build by appending
    /// `_<n>` on collision.
    pub async fn add_step(&self, buildid: BuildId, template: foreman_types::StepTemplate) -> Step {
        let mut tables = self.tables.lock().await;
        let base_name = template.name.clone();
        let seq = tables
            .step_name_seq
            .entry((buildid, base_name.clone()))
            .or_insert(0);
        let name = if *seq == 0 {
            base_name.clone()
        } else {
            format!("{base_name}_{}", *seq + 1)
        };
        *seq += 1;

        let number = tables.steps.values().filter(|s| s.buildid == buildid).count() as u64 + 1;
        let id = StepId(next(&self.next_id));
        let step = Step {
            id,
            buildid,
            number,
            name,
            template,
            started_at: None,
            locks_acquired_at: None,
            complete: false,
            results: None,
            urls: Vec::new(),
        };
        tables.steps.insert(id, step.clone());
        drop(tables);
        self.publish(&["steps", &id.to_string(), "new"], json!({})).await;
        step
    }

    pub async fn start_step(&self, id: StepId) {
        if let Some(s) = self.tables.lock().await.steps.get_mut(&id) {
            s.started_at = Some(Utc::now());
        }
        self.publish(&["steps", &id.to_string(), "started"], json!({})).await;
    }

    pub async fn set_step_locks_acquired_at(&self, id: StepId) {
        if let Some(s) = self.tables.lock().await.steps.get_mut(&id) {
            s.locks_acquired_at = Some(Utc::now());
        }
        self.publish(&["steps", &id.to_string(), "locks_acquired"], json!({})).await;
    }

    pub async fn add_step_url(&self, id: StepId, url: StepUrl) {
        if let Some(s) = self.tables.lock().await.steps.get_mut(&id) {
            s.urls.push(url);
        }
    }

    pub async fn finish_step(&self, id: StepId, results: Results) {
        {
            let mut tables = self.tables.lock().await;
            if let Some(s) = tables.steps.get_mut(&id) {
                s.complete = true;
                s.results = Some(results);
            }
        }
        self.publish(&["steps", &id.to_string(), "finished"], json!({"results": format!("{results:?}")}))
            .await;
    }

    pub async fn get_step(&self, id: StepId) -> Option<Step> {
        self.tables.lock().await.steps.get(&id).cloned()
    }

    // -- logs --------------------------------------------------

    /// Create a log entity. Fails with `LogSlugExists` on a
    /// `(stepid, slug)` collision; the caller retries with a numeric
    /// suffix via [`add_log_unique`].
    pub async fn add_log(
        &self,
        stepid: StepId,
        name: String,
        slug: String,
        log_type: LogType,
    ) -> Result<Log, DataStoreError> {
        let mut tables = self.tables.lock().await;
        let collides = tables
            .logs
            .values()
            .any(|l| l.stepid == stepid && l.slug == slug);
        if collides {
            return Err(DataStoreError::LogSlugExists { stepid, slug });
        }
        let id = LogId(next(&self.next_id));
        let log = Log {
            id,
            stepid,
            name,
            slug,
            log_type,
            num_lines: 0,
            complete: false,
        };
        tables.logs.insert(id, log.clone());
        drop(tables);
        self.publish(&["logs", &id.to_string(), "new"], json!({})).await;
        Ok(log)
    }

    /// Retry `add_log` with `slug`, `slug_2`, `slug_3`, ... until a
    /// free slug is found. This is the LogPipeline-level retry policy
    /// described here.
    pub async fn add_log_unique(
        &self,
        stepid: StepId,
        name: String,
        base_slug: String,
        log_type: LogType,
    ) -> Log {
        let mut attempt = 1u32;
        loop {
            let slug = if attempt == 1 {
                base_slug.clone()
            } else {
                format!("{base_slug}_{attempt}")
            };
            match self.add_log(stepid, name.clone(), slug, log_type).await {
                Ok(log) => return log,
                Err(DataStoreError::LogSlugExists { .. }) => attempt += 1,
                Err(e) => unreachable!("add_log returned unexpected error: {e}"),
            }
        }
    }

    pub async fn append_log_metadata(&self, id: LogId, last_line_added: u64) {
        if let Some(l) = self.tables.lock().await.logs.get_mut(&id) {
            l.num_lines = last_line_added + 1;
        }
        self.publish(&["logs", &id.to_string(), "appended"], json!({"last_line": last_line_added}))
            .await;
    }

    pub async fn finish_log(&self, id: LogId) {
        if let Some(l) = self.tables.lock().await.logs.get_mut(&id) {
            l.complete = true;
        }
        self.publish(&["logs", &id.to_string(), "finished"], json!({})).await;
    }

    pub async fn mark_log_deleted(&self, id: LogId) {
        if let Some(l) = self.tables.lock().await.logs.get_mut(&id) {
            l.log_type = LogType::D;
        }
    }

    pub async fn get_log(&self, id: LogId) -> Option<Log> {
        self.tables.lock().await.logs.get(&id).cloned()
    }

    // -- workers --------------------------------------------------

    pub async fn upsert_worker(&self, worker: Worker) {
        self.tables.lock().await.workers.insert(worker.id, worker);
    }

    pub async fn get_worker(&self, id: WorkerId) -> Option<Worker> {
        self.tables.lock().await.workers.get(&id).cloned()
    }
}
