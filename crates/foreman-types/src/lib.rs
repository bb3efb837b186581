//! Core data model shared by every component of the orchestration core:
//! source stamps, changes, buildsets, build requests, builders, builds,
//! steps, logs, workers, and locks.
//!
//! These types are deliberately plain data — the state machines that
//! mutate them live in `foreman-core`. Keeping them here lets the
//! scheduler, distributor, and build runner agree on one vocabulary
//! without depending on each other.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};

/// Opaque identifiers. All entity ids are monotonically assigned integers;
/// we newtype them so a `BuildId` can never be passed where a `StepId` is
/// expected.
macro_rules! id_type {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(SourceStampId);
id_type!(ChangeId);
id_type!(BuildsetId);
id_type!(BuildRequestId);
id_type!(BuilderId);
id_type!(BuildId);
id_type!(StepId);
id_type!(LogId);
id_type!(WorkerId);
id_type!(MasterId);

/// A pinned snapshot specification for one codebase. Immutable once
/// created; a build references one per codebase it builds from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStamp {
    pub id: SourceStampId,
    pub codebase: String,
    pub repository: String,
    pub branch: Option<String>,
    pub revision: Option<String>,
    pub project: String,
    pub patch: Option<Patch>,
}

/// An unmerged diff carried by a source stamp (typically from a try job).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub level: i32,
    pub body: String,
    pub subdir: Option<String>,
}

/// A single commit/change notification bound to a source stamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub id: ChangeId,
    pub sourcestamp_id: SourceStampId,
    pub who: String,
    pub when: DateTime<Utc>,
    pub files: Vec<String>,
    pub comments: String,
    pub properties: PropertyBag,
    pub parent_changeids: Vec<ChangeId>,
}

/// A logical work submission. Spawns one or more [`BuildRequest`]s, one
/// per builder it targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Buildset {
    pub id: BuildsetId,
    pub reason: String,
    pub sourcestamps: Vec<SourceStamp>,
    pub properties: PropertyBag,
    pub parent_buildid: Option<BuildId>,
    pub submitted_at: DateTime<Utc>,
}

/// A claim on a buildrequest: which master owns it and since when.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub masterid: MasterId,
    pub claimed_at: DateTime<Utc>,
}

/// A pending unit of work produced by a scheduler. Lifecycle: unclaimed
/// -> claimed(masterid) -> complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub id: BuildRequestId,
    pub buildsetid: BuildsetId,
    pub builderid: BuilderId,
    pub priority: i32,
    pub submitted_at: DateTime<Utc>,
    /// If this request must wait on the completion of another buildset
    /// (dependent schedulers), the id of the parent buildrequest.
    pub waited_for: Option<BuildRequestId>,
    pub properties: PropertyBag,
    pub sources: BTreeMap<String, SourceStamp>,
    pub claimed_by: Option<Claim>,
    pub complete: bool,
    pub results: Option<Results>,
}

impl BuildRequest {
    pub fn is_eligible(&self, resolved_parents: &BTreeMap<BuildRequestId, bool>) -> bool {
        if self.claimed_by.is_some() || self.complete {
            return false;
        }
        match self.waited_for {
            None => true,
            Some(parent) => resolved_parents.get(&parent).copied().unwrap_or(false),
        }
    }
}

/// Configuration node describing how to build for a given target.
/// Stateless across restarts apart from its id.
#[derive(Clone, Serialize, Deserialize)]
pub struct Builder {
    pub id: BuilderId,
    pub name: String,
    pub workernames: Vec<String>,
    pub locks: Vec<LockAccess>,
    pub project: String,
    pub tags: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Step factory: the ordered, statically-known template the build
    /// runner instantiates for every build on this builder.
    pub factory: Vec<StepTemplate>,
    /// Optional gate consulted by the distributor before claiming a
    /// request for this builder (e.g. a paused builder refuses work).
    #[serde(skip, default)]
    pub do_build_if: Option<std::sync::Arc<dyn Fn(&BuildRequest) -> bool + Send + Sync>>,
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("workernames", &self.workernames)
            .field("locks", &self.locks)
            .field("project", &self.project)
            .field("tags", &self.tags)
            .field("factory_len", &self.factory.len())
            .field("do_build_if", &self.do_build_if.is_some())
            .finish()
    }
}

impl Builder {
    /// Whether the distributor is allowed to consider this builder for
    /// a given request at all.
    pub fn accepts(&self, request: &BuildRequest) -> bool {
        match &self.do_build_if {
            Some(f) => f(request),
            None => true,
        }
    }
}

/// The static description of one step, as configured on a [`Builder`].
/// The build runner instantiates a live [`Step`] from each template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTemplate {
    pub name: String,
    /// The remote command kind, e.g. `"shell"`. Opaque to `foreman-core`;
    /// interpreted by the worker-side command runner.
    pub command: String,
    /// Command arguments. Values may be literal or `%(prop:name)s`
    /// templates resolved against the live property bag immediately
    /// before the step starts.
    pub args: BTreeMap<String, Renderable<serde_json::Value>>,
    pub halt_on_failure: bool,
    pub flunk_on_failure: bool,
    pub flunk_on_warnings: bool,
    pub warn_on_failure: bool,
    pub warn_on_warnings: bool,
    pub always_run: bool,
}

impl Default for StepTemplate {
    fn default() -> Self {
        Self {
            name: "step".to_string(),
            command: "shell".to_string(),
            args: BTreeMap::new(),
            halt_on_failure: true,
            flunk_on_failure: true,
            flunk_on_warnings: false,
            warn_on_failure: false,
            warn_on_warnings: false,
            always_run: false,
        }
    }
}

/// Live execution of a [`BuildRequest`] (or merged set) on a [`Worker`].
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub number: u64,
    pub builderid: BuilderId,
    pub workerid: WorkerId,
    pub buildrequestids: Vec<BuildRequestId>,
    pub started_at: DateTime<Utc>,
    pub complete: bool,
    pub results: Option<Results>,
    pub state_string: String,
    pub properties: PropertyBag,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub locks_duration: std::time::Duration,
}

/// One element of a build; maps 1:1 to one logical remote command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub buildid: BuildId,
    pub number: u64,
    pub name: String,
    pub template: StepTemplate,
    pub started_at: Option<DateTime<Utc>>,
    pub locks_acquired_at: Option<DateTime<Utc>>,
    pub complete: bool,
    pub results: Option<Results>,
    pub urls: Vec<StepUrl>,
}

/// A link surfaced alongside a step's result (e.g. an uploaded artifact).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepUrl {
    pub name: String,
    pub url: String,
}

/// The kind of a [`Log`]: (s)tdio-interleaved, (t)ext, (h)tml, or
/// (d)eleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    S,
    T,
    H,
    D,
}

/// An append-only text stream produced by a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Log {
    pub id: LogId,
    pub stepid: StepId,
    pub name: String,
    pub slug: String,
    #[serde(rename = "type")]
    pub log_type: LogType,
    pub num_lines: u64,
    pub complete: bool,
}

/// One stored, contiguous slice of a log's lines.
///
/// Invariant: chunks within a log are non-overlapping, sorted by
/// `first_line`, and cover `[0, num_lines)` with no gaps until the log
/// is deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogChunk {
    pub logid: LogId,
    pub first_line: u64,
    pub last_line: u64,
    pub content: Vec<u8>,
    /// Codec id this chunk's `content` is encoded with. `0` is raw.
    pub compressed_id: u8,
}

/// Identity of a tracked worker, either physical or latent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub name: String,
    pub capabilities: Vec<String>,
    pub basedir: String,
    pub path_convention: PathConvention,
    pub latent: Option<LatentWorkerState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathConvention {
    Posix,
    Windows,
}

/// State carried only by latent (on-demand) workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatentWorkerState {
    pub state: LatentState,
    pub quarantine_until: Option<DateTime<Utc>>,
}

/// The latent-worker provisioning state machine (see
/// `foreman_core::worker`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatentState {
    Absent,
    Substantiating,
    Substantiated,
    Attached,
    Building,
    Idle,
}

/// Scope of a [`LockId`]: master-global, or bound to one worker (in
/// which case one lock instance exists per worker).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockScope {
    Master,
    Worker,
}

/// A named semaphore-like resource with FIFO-fair waiting.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LockId {
    pub scope: LockScope,
    pub name: String,
    pub max_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    Exclusive,
    Counting,
}

/// A lock paired with the access mode requested against it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockAccess {
    pub lock: LockId,
    pub mode: AccessMode,
}

/// Build/step/buildrequest result codes.
///
/// Ordering for `worst_status` purposes is `SUCCESS < WARNINGS <
/// FAILURE < EXCEPTION < CANCELLED < RETRY`; `SKIPPED` is equivalent to
/// `SUCCESS` for aggregation but preserved distinctly because a skipped
/// step never ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Results {
    Success,
    Warnings,
    Failure,
    Skipped,
    Exception,
    Retry,
    Cancelled,
}

impl Results {
    /// Rank used by `worst_status`. Higher is "worse" in the sense that
    /// it wins when combining two results. `Skipped` ranks with
    /// `Success` since it never contributes a negative outcome on its
    /// own.
    fn rank(self) -> u8 {
        match self {
            Results::Success | Results::Skipped => 0,
            Results::Warnings => 1,
            Results::Failure => 2,
            Results::Exception => 3,
            Results::Cancelled => 4,
            Results::Retry => 5,
        }
    }

    /// Combine two results, keeping whichever is worse. `Retry` always
    /// dominates, `Cancelled` next, and so on down to `Success`.
    pub fn worst(a: Results, b: Results) -> Results {
        if a.rank() >= b.rank() { a } else { b }
    }

    pub fn is_terminal_failure(self) -> bool {
        !matches!(self, Results::Success | Results::Warnings | Results::Skipped)
    }
}

/// Where a property value came from, used only for diagnostics and the
/// `owners` computation; never affects precedence (insertion order
/// into the bag already encodes precedence).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertySource {
    Master,
    Change,
    BuildRequest,
    Builder,
    Worker,
    Step,
    TryJob,
}

/// A single property value together with its source, matching the
/// source system's `(value, source)` property tuples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyValue {
    pub value: serde_json::Value,
    pub source: PropertySource,
}

/// The live property bag threaded through a build. Later writers with
/// the same key overwrite earlier ones; see
/// `foreman_core::build::merge_properties` for the merge order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertyBag(pub BTreeMap<String, PropertyValue>);

impl PropertyBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value, source: PropertySource) {
        self.0.insert(key.into(), PropertyValue { value, source });
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key).map(|p| &p.value)
    }

    /// Overlay `other` on top of `self`: keys in `other` win.
    pub fn merge_from(&mut self, other: &PropertyBag) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }
}

/// A value that may need to be resolved lazily against the live
/// property bag before use (e.g. a secret reference). Rendering is
/// asynchronous in `foreman-core` because it may consult the data
/// store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Renderable<T> {
    Value(T),
    /// An interpolation template over `%(prop:name)s`-style references,
    /// resolved against the property bag at render time.
    Template(String),
}
