//! Error kinds the core must distinguish, one `thiserror` enum per
//! concern so callers can match on kind where policy depends on it
//! (e.g. a failed substantiation is transient or permanent).

use foreman_types::{BuildId, LockId, LogId, WorkerId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock {0:?} is not held by the given owner")]
    NotHeld(LockId),
    #[error("lock {0:?} access would violate the exclusive/counting invariant")]
    WouldViolateInvariant(LockId),
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("log {0:?} has no slug available after {1} suffix attempts")]
    SlugExhausted(LogId, u32),
    #[error("compression codec {0} is not available in this process")]
    CompressionFormatUnavailable(u8),
    #[error("log {0:?} not found")]
    NotFound(LogId),
}

#[derive(Debug, Error)]
pub enum DataStoreError {
    #[error("slug {slug:?} already exists for step {stepid:?}")]
    LogSlugExists {
        stepid: foreman_types::StepId,
        slug: String,
    },
    #[error("entity not found: {0}")]
    NotFound(String),
    #[error("conflicting claim: buildrequests already claimed by another master")]
    ClaimConflict,
}

#[derive(Debug, Error)]
pub enum TryJobError {
    #[error("malformed try-job input: {0}")]
    BadJobfile(String),
    #[error("netstring frame exceeds maximum size ({0} > {1})")]
    FrameTooLarge(usize, usize),
    #[error("unknown try-job protocol version: {0}")]
    UnknownVersion(String),
}

/// Failure kinds arising from latent-worker substantiation, worker
/// transport, and RPC timeouts -- the set that drives BuildRunner's
/// FINISHING-result decision.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker {0:?} failed to substantiate (transient)")]
    LatentWorkerFailedToSubstantiate(WorkerId),
    #[error("worker {0:?} cannot substantiate (permanent)")]
    LatentWorkerCannotSubstantiate(WorkerId),
    #[error("worker {0:?} substantiation was cancelled")]
    LatentWorkerSubstantiationCancelled(WorkerId),
    #[error("connection to worker {0:?} was lost")]
    ConnectionLost(WorkerId),
    #[error("ping to worker {0:?} timed out")]
    PingTimeout(WorkerId),
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("builder is already in use for build {0:?}")]
    BuilderInUse(BuildId),
    #[error("worker setup failed for build {0:?}: {1}")]
    WorkerSetup(BuildId, String),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    Lock(#[from] LockError),
}
