//! BuildRequestDistributor: matches pending buildrequests to
//! compatible, available workers, collapsing mergeable requests and
//! claiming transactionally. Does not itself run a build -- it hands
//! back a [`DistributedBuild`] for the caller (BotMaster) to turn into
//! a `DataStore::add_build` plus a spawned build runner. Keeping that
//! seam here means this module is testable without a worker transport.

use std::collections::BTreeSet;
use std::sync::Arc;

use foreman_types::{Builder, BuildRequest, BuildRequestId, MasterId, Worker};
use tracing::{debug, instrument};

use crate::datastore::DataStore;
use crate::error::DataStoreError;
use crate::worker::WorkerRegistry;

/// Whether two buildrequests on the same builder may be folded into a
/// single Build. The default strategy is the same-codebase-set rule;
/// callers may supply their own collapse strategy as a pluggable
/// predicate, matching the original's per-builder
/// `collapseRequests` hook").
pub trait CollapseStrategy: Send + Sync {
    fn can_collapse(&self, a: &BuildRequest, b: &BuildRequest) -> bool;
}

/// Two requests collapse if they target the same builder and carry
/// exactly the same source stamps per codebase.
pub struct SameCodebaseSet;

impl CollapseStrategy for SameCodebaseSet {
    fn can_collapse(&self, a: &BuildRequest, b: &BuildRequest) -> bool {
        a.builderid == b.builderid && a.sources == b.sources
    }
}

/// Never collapse; every eligible request becomes its own Build.
pub struct NoCollapse;

impl CollapseStrategy for NoCollapse {
    fn can_collapse(&self, _a: &BuildRequest, _b: &BuildRequest) -> bool {
        false
    }
}

/// A claimed, worker-assigned group of requests ready to become a
/// Build. `requests` is the merged set (one element unless collapsed).
#[derive(Debug, Clone)]
pub struct DistributedBuild {
    pub builder: Builder,
    pub worker: Worker,
    pub requests: Vec<BuildRequest>,
}

pub struct BuildRequestDistributor {
    data: Arc<DataStore>,
    workers: Arc<WorkerRegistry>,
    masterid: MasterId,
    collapse: Arc<dyn CollapseStrategy>,
}

impl BuildRequestDistributor {
    pub fn new(data: Arc<DataStore>, workers: Arc<WorkerRegistry>, masterid: MasterId) -> Self {
        Self {
            data,
            workers,
            masterid,
            collapse: Arc::new(SameCodebaseSet),
        }
    }

    pub fn with_collapse_strategy(mut self, strategy: Arc<dyn CollapseStrategy>) -> Self {
        self.collapse = strategy;
        self
    }

    /// Runs one selection pass over every configured builder. Returns
    /// the builds it successfully claimed and assigned; builders with
    /// no eligible work, or whose candidate lost a claim race, are
    /// silently skipped (the next pass -- triggered by the caller on
    /// the next relevant event -- will retry).
    #[instrument(skip(self, builders))]
    pub async fn maybe_start_builds_for_all_builders(&self, builders: &[Builder]) -> Vec<DistributedBuild> {
        let pending = self.data.pending_build_requests().await;
        if pending.is_empty() {
            return Vec::new();
        }

        let resolved_parents = self.resolve_parents(&pending).await;
        let mut started = Vec::new();

        for builder in builders {
            let mut candidates: Vec<&BuildRequest> = pending
                .iter()
                .filter(|r| r.builderid == builder.id)
                .filter(|r| r.is_eligible(&resolved_parents))
                .filter(|r| builder.accepts(r))
                .collect();
            if candidates.is_empty() {
                continue;
            }
            // Priority desc, submitted_at asc, id asc.
            candidates.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.submitted_at.cmp(&b.submitted_at))
                    .then(a.id.cmp(&b.id))
            });

            let Some(worker) = self.pick_worker(builder).await else {
                continue;
            };

            let group = self.collapse_group(&candidates);
            let ids: Vec<BuildRequestId> = group.iter().map(|r| r.id).collect();

            match self.data.claim_build_requests(&ids, self.masterid).await {
                Ok(()) => {
                    debug!(builder = %builder.name, worker = %worker.name, count = ids.len(), "claimed buildrequests");
                    started.push(DistributedBuild {
                        builder: builder.clone(),
                        worker,
                        requests: group.into_iter().cloned().collect(),
                    });
                }
                Err(DataStoreError::ClaimConflict) => {
                    // Another master (or a concurrent pass) won the
                    // race; leave it for the next pass rather than
                    // retrying with a narrower selection here.
                    continue;
                }
                Err(_) => continue,
            }
        }

        started
    }

    async fn resolve_parents(&self, pending: &[BuildRequest]) -> std::collections::BTreeMap<BuildRequestId, bool> {
        let mut resolved = std::collections::BTreeMap::new();
        let parent_ids: BTreeSet<BuildRequestId> = pending.iter().filter_map(|r| r.waited_for).collect();
        for parent_id in parent_ids {
            let done = match self.data.get_build_request(parent_id).await {
                Some(parent) => parent.complete && parent.results.map(|r| !r.is_terminal_failure()).unwrap_or(false),
                None => false,
            };
            resolved.insert(parent_id, done);
        }
        resolved
    }

    /// Groups the front of `sorted` (already priority/age/id ordered)
    /// with everything collapsible against it (merging preserves the
    /// union of change sets -- callers read
    /// that union off `requests[*].sources`).
    fn collapse_group<'a>(&self, sorted: &[&'a BuildRequest]) -> Vec<&'a BuildRequest> {
        let mut iter = sorted.iter();
        let Some(head) = iter.next() else {
            return Vec::new();
        };
        let mut group = vec![*head];
        for candidate in iter {
            if self.collapse.can_collapse(head, candidate) {
                group.push(*candidate);
            }
        }
        group
    }

    /// First worker in the builder's `workernames` that is assigned to
    /// this registry, connected/substantiable, and not quarantined
    /// Locks are deliberately not consulted here: a build that cannot
    /// immediately acquire its locks is still
    /// started and will simply block in `ACQUIRING_LOCKS`.
    async fn pick_worker(&self, builder: &Builder) -> Option<Worker> {
        for name in &builder.workernames {
            if let Some(worker) = self.workers.find_by_name(name).await {
                if self.workers.is_available_for_build(worker.id).await {
                    return Some(worker);
                }
            }
        }
        None
    }
}
