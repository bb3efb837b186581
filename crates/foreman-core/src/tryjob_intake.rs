//! TryJobIntake: turns a parsed [`crate::tryjob::TryJob`] into a
//! buildset. This is the component named in the system overview table
//! as accepting user-submitted patch jobs "over a credentialed
//! channel" -- the credential check itself belongs to whichever
//! channel terminates the connection (the jobdir path trusts the
//! filesystem; a networked RPC channel would check its own secret
//! before ever constructing a [`crate::tryjob::TryJob`] to hand here).
//! This module only does the part every channel shares: matching the
//! job's requested builders against the configured try schedulers and
//! minting a buildset.

use std::collections::HashMap;
use std::sync::Arc;

use foreman_types::{BuildRequestId, BuildsetId};
use tokio::sync::Mutex;
use tracing::{info, instrument};

use crate::datastore::DataStore;
use crate::error::TryJobError;
use crate::scheduler::TryScheduler;
use crate::tryjob::TryJob;

/// Owns the set of configured [`TryScheduler`]s and the data store
/// they submit buildsets through. A master with no try schedulers
/// configured still accepts and parses jobs; it simply finds no
/// scheduler willing to claim them.
pub struct TryJobIntake {
    data: Arc<DataStore>,
    schedulers: Mutex<HashMap<String, TryScheduler>>,
}

impl TryJobIntake {
    pub fn new(data: Arc<DataStore>) -> Self {
        Self {
            data,
            schedulers: Mutex::new(HashMap::new()),
        }
    }

    pub async fn register_scheduler(&self, scheduler: TryScheduler) {
        self.schedulers.lock().await.insert(scheduler.name.clone(), scheduler);
    }

    /// Runs `job` against every configured try scheduler, minting one
    /// buildset per scheduler willing to claim it (an empty
    /// builder-name intersection means that scheduler declines, not an
    /// error -- see [`TryScheduler::on_tryjob`]). Returns one entry per
    /// buildset actually created, in scheduler-registration order.
    #[instrument(skip(self, job), fields(job_id = %job.job_id, who = ?job.who))]
    pub async fn submit(&self, job: TryJob) -> Result<Vec<(BuildsetId, Vec<BuildRequestId>)>, TryJobError> {
        let stamp_id = self.data.next_source_stamp_id();
        let schedulers = self.schedulers.lock().await;
        let mut created = Vec::new();
        for scheduler in schedulers.values() {
            let Some(proposal) = scheduler.on_tryjob(&job, stamp_id) else {
                continue;
            };
            let builders = {
                let mut ids = Vec::new();
                for name in &proposal.builder_names {
                    if let Some(id) = self.resolve_builder(name).await {
                        ids.push((id, 0));
                    }
                }
                ids
            };
            if builders.is_empty() {
                continue;
            }
            let result = self
                .data
                .add_buildset(proposal.reason, proposal.sourcestamps, proposal.properties, None, builders)
                .await;
            info!(buildset_id = result.0.0, scheduler = %scheduler.name, "try job accepted");
            created.push(result);
        }
        Ok(created)
    }

    // A try scheduler's `builder_names` are names, not ids; the
    // distributor (and everything downstream of `add_buildset`) works
    // in ids, so `DataStore::find_builder_by_name` is the one place
    // that translates. The data store only knows about a builder once
    // it's been `update_builder_info`'d by the master at
    // startup/reconfigure.
    async fn resolve_builder(&self, name: &str) -> Option<foreman_types::BuilderId> {
        self.data.find_builder_by_name(name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventbus::EventBus;
    use crate::scheduler::TryScheduler;
    use foreman_types::{Builder, BuilderId, StepTemplate};
    use std::collections::BTreeMap;

    fn job(builder_names: Vec<&str>) -> TryJob {
        TryJob {
            job_id: "x".to_string(),
            branch: Some("trunk".to_string()),
            baserev: Some("1".to_string()),
            patch_level: 1,
            patch_body: "diff".to_string(),
            repository: Some("r".to_string()),
            project: Some("p".to_string()),
            who: Some("u".to_string()),
            comment: Some("c".to_string()),
            builder_names: builder_names.into_iter().map(String::from).collect(),
            properties: BTreeMap::new(),
        }
    }

    fn builder(id: u64, name: &str) -> Builder {
        Builder {
            id: BuilderId(id),
            name: name.to_string(),
            workernames: vec![],
            locks: vec![],
            project: "proj".to_string(),
            tags: vec![],
            env: BTreeMap::new(),
            factory: vec![StepTemplate::default()],
            do_build_if: None,
        }
    }

    #[tokio::test]
    async fn matching_scheduler_creates_one_buildset_per_intersecting_builder_set() {
        let data = Arc::new(DataStore::new(EventBus::new()));
        data.update_builder_info(builder(1, "a")).await;
        data.update_builder_info(builder(2, "b")).await;

        let intake = TryJobIntake::new(data.clone());
        intake
            .register_scheduler(TryScheduler {
                name: "try".to_string(),
                builder_names: vec!["a".to_string(), "b".to_string()],
            })
            .await;

        let created = intake.submit(job(vec!["a"])).await.unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].1.len(), 1);

        let pending = data.pending_build_requests().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].builderid, BuilderId(1));
    }

    #[tokio::test]
    async fn unconfigured_builder_name_is_silently_dropped_from_the_buildset() {
        let data = Arc::new(DataStore::new(EventBus::new()));
        data.update_builder_info(builder(1, "a")).await;

        let intake = TryJobIntake::new(data.clone());
        intake
            .register_scheduler(TryScheduler {
                name: "try".to_string(),
                builder_names: vec!["a".to_string(), "ghost".to_string()],
            })
            .await;

        let created = intake.submit(job(vec!["a", "ghost"])).await.unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].1.len(), 1, "only the known builder should get a request");
    }

    #[tokio::test]
    async fn no_registered_scheduler_creates_nothing() {
        let data = Arc::new(DataStore::new(EventBus::new()));
        let intake = TryJobIntake::new(data);
        let created = intake.submit(job(vec!["a"])).await.unwrap();
        assert!(created.is_empty());
    }
}
