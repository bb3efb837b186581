//! Tracks connected workers and, for latent workers, their
//! provisioning state machine and quarantine cooldown.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use foreman_retry::{BackoffPolicy, QuarantineTracker};
use foreman_types::{LatentState, Worker, WorkerId};
use tokio::sync::Mutex;

use crate::clock::SharedClock;
use crate::error::WorkerError;

/// Outcome of an attempt to substantiate a latent worker, distinguishing
/// the three terminal cases the build runner must react to differently:
/// transient failure quarantines and retries the build,
/// permanent failure ends the build in EXCEPTION.
pub enum SubstantiateOutcome {
    Success,
    Transient(String),
    Permanent(String),
}

struct Entry {
    worker: Worker,
    state: LatentState,
    quarantine: QuarantineTracker,
    quarantine_until: Option<DateTime<Utc>>,
}

pub struct WorkerRegistry {
    clock: SharedClock,
    workers: Mutex<HashMap<WorkerId, Entry>>,
}

impl WorkerRegistry {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub async fn register(&self, worker: Worker, policy: BackoffPolicy) {
        let id = worker.id;
        self.workers.lock().await.insert(
            id,
            Entry {
                worker,
                state: LatentState::Absent,
                quarantine: QuarantineTracker::new(policy),
                quarantine_until: None,
            },
        );
    }

    pub async fn is_quarantined(&self, id: WorkerId) -> bool {
        let workers = self.workers.lock().await;
        match workers.get(&id).and_then(|e| e.quarantine_until) {
            Some(until) => self.clock.now() < until,
            None => false,
        }
    }

    pub async fn put_in_quarantine(&self, id: WorkerId) {
        let mut workers = self.workers.lock().await;
        if let Some(entry) = workers.get_mut(&id) {
            let delay = entry.quarantine.record_failure();
            entry.quarantine_until = Some(self.clock.now() + chrono::Duration::from_std(delay).unwrap_or_default());
        }
    }

    /// Cleared on a successful non-EXCEPTION, non-RETRY build.
    pub async fn reset_quarantine(&self, id: WorkerId) {
        let mut workers = self.workers.lock().await;
        if let Some(entry) = workers.get_mut(&id) {
            entry.quarantine.reset();
            entry.quarantine_until = None;
        }
    }

    async fn set_state(&self, id: WorkerId, state: LatentState) {
        if let Some(entry) = self.workers.lock().await.get_mut(&id) {
            entry.state = state;
        }
    }

    pub async fn state(&self, id: WorkerId) -> Option<LatentState> {
        self.workers.lock().await.get(&id).map(|e| e.state)
    }

    pub async fn find_by_name(&self, name: &str) -> Option<Worker> {
        self.workers
            .lock()
            .await
            .values()
            .find(|e| e.worker.name == name)
            .map(|e| e.worker.clone())
    }

    /// Whether this worker can be handed a new build right now: not
    /// quarantined and not already mid-build. A latent worker in
    /// `Absent` is still available -- it will be substantiated as part
    /// of taking the build.
    pub async fn is_available_for_build(&self, id: WorkerId) -> bool {
        if self.is_quarantined(id).await {
            return false;
        }
        !matches!(self.state(id).await, Some(LatentState::Building))
    }

    /// Idempotent: if the worker is already substantiated (or further
    /// along), returns immediately. Otherwise drives `substantiate` to
    /// completion, racing it against `cancel`.
    pub async fn substantiate_if_needed<F, C>(
        &self,
        id: WorkerId,
        substantiate: F,
        cancel: C,
    ) -> Result<(), WorkerError>
    where
        F: Future<Output = SubstantiateOutcome>,
        C: Future<Output = ()>,
    {
        if matches!(
            self.state(id).await,
            Some(LatentState::Substantiated)
                | Some(LatentState::Attached)
                | Some(LatentState::Building)
                | Some(LatentState::Idle)
        ) {
            return Ok(());
        }

        self.set_state(id, LatentState::Substantiating).await;
        tokio::select! {
            outcome = substantiate => match outcome {
                SubstantiateOutcome::Success => {
                    self.set_state(id, LatentState::Substantiated).await;
                    Ok(())
                }
                SubstantiateOutcome::Transient(_reason) => {
                    self.set_state(id, LatentState::Absent).await;
                    Err(WorkerError::LatentWorkerFailedToSubstantiate(id))
                }
                SubstantiateOutcome::Permanent(_reason) => {
                    self.set_state(id, LatentState::Absent).await;
                    Err(WorkerError::LatentWorkerCannotSubstantiate(id))
                }
            },
            _ = cancel => {
                self.set_state(id, LatentState::Absent).await;
                Err(WorkerError::LatentWorkerSubstantiationCancelled(id))
            }
        }
    }

    /// Round-trips a no-op to detect dead connections, bounded by
    /// `timeout`.
    pub async fn ping<F>(&self, id: WorkerId, rpc: F, timeout: Duration) -> Result<(), WorkerError>
    where
        F: Future<Output = bool>,
    {
        match tokio::time::timeout(timeout, rpc).await {
            Ok(true) => Ok(()),
            Ok(false) | Err(_) => Err(WorkerError::PingTimeout(id)),
        }
    }

    /// A build exclusively holds a substantiated latent worker until
    /// `buildFinished`; afterwards it returns to the idle pool.
    pub async fn build_attached(&self, id: WorkerId) {
        self.set_state(id, LatentState::Building).await;
    }

    pub async fn build_finished(&self, id: WorkerId) {
        self.set_state(id, LatentState::Idle).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::system_clock;
    use foreman_types::PathConvention;
    use std::time::Duration as StdDuration;

    fn worker(id: u64) -> Worker {
        Worker {
            id: WorkerId(id),
            name: format!("w{id}"),
            capabilities: vec![],
            basedir: "/tmp".to_string(),
            path_convention: PathConvention::Posix,
            latent: None,
        }
    }

    #[tokio::test]
    async fn substantiate_if_needed_is_idempotent() {
        let registry = WorkerRegistry::new(system_clock());
        registry.register(worker(1), BackoffPolicy::default()).await;

        registry
            .substantiate_if_needed(
                WorkerId(1),
                async { SubstantiateOutcome::Success },
                std::future::pending(),
            )
            .await
            .unwrap();
        assert_eq!(registry.state(WorkerId(1)).await, Some(LatentState::Substantiated));

        // Second call should short-circuit without re-running substantiate.
        registry
            .substantiate_if_needed(
                WorkerId(1),
                async {
                    panic!("should not be called when already substantiated")
                },
                std::future::pending(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn transient_failure_maps_to_failed_to_substantiate() {
        let registry = WorkerRegistry::new(system_clock());
        registry.register(worker(1), BackoffPolicy::default()).await;
        let result = registry
            .substantiate_if_needed(
                WorkerId(1),
                async { SubstantiateOutcome::Transient("rate limited".into()) },
                std::future::pending(),
            )
            .await;
        assert!(matches!(result, Err(WorkerError::LatentWorkerFailedToSubstantiate(_))));
    }

    #[tokio::test]
    async fn permanent_failure_maps_to_cannot_substantiate() {
        let registry = WorkerRegistry::new(system_clock());
        registry.register(worker(1), BackoffPolicy::default()).await;
        let result = registry
            .substantiate_if_needed(
                WorkerId(1),
                async { SubstantiateOutcome::Permanent("quota exhausted".into()) },
                std::future::pending(),
            )
            .await;
        assert!(matches!(result, Err(WorkerError::LatentWorkerCannotSubstantiate(_))));
    }

    #[tokio::test]
    async fn cancellation_during_substantiation_is_reported() {
        let registry = WorkerRegistry::new(system_clock());
        registry.register(worker(1), BackoffPolicy::default()).await;
        let result = registry
            .substantiate_if_needed(WorkerId(1), std::future::pending(), async {})
            .await;
        assert!(matches!(
            result,
            Err(WorkerError::LatentWorkerSubstantiationCancelled(_))
        ));
    }

    #[tokio::test]
    async fn ping_times_out() {
        let registry = WorkerRegistry::new(system_clock());
        registry.register(worker(1), BackoffPolicy::default()).await;
        let result = registry
            .ping(WorkerId(1), std::future::pending::<bool>(), StdDuration::from_millis(5))
            .await;
        assert!(matches!(result, Err(WorkerError::PingTimeout(_))));
    }

    #[tokio::test]
    async fn quarantine_round_trip() {
        let registry = WorkerRegistry::new(system_clock());
        registry.register(worker(1), BackoffPolicy::default()).await;
        assert!(!registry.is_quarantined(WorkerId(1)).await);
        registry.put_in_quarantine(WorkerId(1)).await;
        assert!(registry.is_quarantined(WorkerId(1)).await);
        registry.reset_quarantine(WorkerId(1)).await;
        assert!(!registry.is_quarantined(WorkerId(1)).await);
    }
}
