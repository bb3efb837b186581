//! Typed master configuration: builders, schedulers, workers, locks,
//! and global properties loaded from a TOML file. IDs are assigned at
//! load time by position, so reordering entries in the file changes
//! their ids -- callers that need stable ids across reloads should key
//! off `name` instead.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use foreman_types::{
    AccessMode, Builder, BuilderId, LockAccess, LockId, LockScope, MasterId, PathConvention, StepTemplate, Worker, WorkerId,
};
use serde::{Deserialize, Serialize};

/// Environment variable consulted for the try-job RPC shared secret.
/// Takes precedence over `[try_job] shared_secret` in the file so the
/// secret itself doesn't need to live on disk in the common case.
pub const TRY_JOB_SECRET_ENV: &str = "FOREMAN_TRY_JOB_SECRET";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    pub masterid: u64,
    pub builders: Vec<BuilderConfig>,
    pub schedulers: Vec<SchedulerConfig>,
    pub workers: Vec<WorkerConfig>,
    pub global_properties: BTreeMap<String, serde_json::Value>,
    pub timeouts: TimeoutsConfig,
    pub try_job: TryJobConfig,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            masterid: 1,
            builders: Vec::new(),
            schedulers: Vec::new(),
            workers: Vec::new(),
            global_properties: BTreeMap::new(),
            timeouts: TimeoutsConfig::default(),
            try_job: TryJobConfig::default(),
        }
    }
}

impl MasterConfig {
    pub fn masterid(&self) -> MasterId {
        MasterId(self.masterid)
    }

    /// Builders in file order, each assigned an id equal to its
    /// position (1-based, matching `masterid`'s own convention of never
    /// using 0).
    pub fn builders(&self) -> Vec<Builder> {
        self.builders
            .iter()
            .enumerate()
            .map(|(i, b)| b.to_builder(BuilderId(i as u64 + 1)))
            .collect()
    }

    pub fn workers(&self) -> Vec<Worker> {
        self.workers
            .iter()
            .enumerate()
            .map(|(i, w)| w.to_worker(WorkerId(i as u64 + 1)))
            .collect()
    }

    /// The try-job shared secret, preferring `FOREMAN_TRY_JOB_SECRET`
    /// over the file so deployments don't have to commit it.
    pub fn try_job_secret(&self) -> Option<String> {
        std::env::var(TRY_JOB_SECRET_ENV).ok().or_else(|| self.try_job.shared_secret.clone())
    }

    /// `other` wins on every field it sets; used to layer a
    /// site-specific override file on top of a shared base config.
    pub fn merge(&self, other: &MasterConfig) -> MasterConfig {
        MasterConfig {
            masterid: other.masterid,
            builders: if other.builders.is_empty() { self.builders.clone() } else { other.builders.clone() },
            schedulers: if other.schedulers.is_empty() { self.schedulers.clone() } else { other.schedulers.clone() },
            workers: if other.workers.is_empty() { self.workers.clone() } else { other.workers.clone() },
            global_properties: {
                let mut merged = self.global_properties.clone();
                merged.extend(other.global_properties.clone());
                merged
            },
            timeouts: other.timeouts.clone(),
            try_job: other.try_job.clone(),
        }
    }
}

/// A builder definition as written in TOML. Lacks `Builder::do_build_if`
/// (a closure can't be expressed in config); a builder that needs one
/// must be wired up in code after loading.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    pub name: String,
    pub workernames: Vec<String>,
    pub locks: Vec<LockAccessConfig>,
    pub project: String,
    pub tags: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub factory: Vec<StepTemplate>,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            workernames: Vec::new(),
            locks: Vec::new(),
            project: String::new(),
            tags: Vec::new(),
            env: BTreeMap::new(),
            factory: Vec::new(),
        }
    }
}

impl BuilderConfig {
    pub fn to_builder(&self, id: BuilderId) -> Builder {
        Builder {
            id,
            name: self.name.clone(),
            workernames: self.workernames.clone(),
            locks: self.locks.iter().map(LockAccessConfig::to_lock_access).collect(),
            project: self.project.clone(),
            tags: self.tags.clone(),
            env: self.env.clone(),
            factory: self.factory.clone(),
            do_build_if: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockAccessConfig {
    pub scope: LockScopeConfig,
    pub name: String,
    #[serde(default = "default_max_count")]
    pub max_count: u32,
    #[serde(default)]
    pub mode: AccessModeConfig,
}

fn default_max_count() -> u32 {
    1
}

impl LockAccessConfig {
    fn to_lock_access(&self) -> LockAccess {
        LockAccess {
            lock: LockId {
                scope: match self.scope {
                    LockScopeConfig::Master => LockScope::Master,
                    LockScopeConfig::Worker => LockScope::Worker,
                },
                name: self.name.clone(),
                max_count: self.max_count,
            },
            mode: match self.mode {
                AccessModeConfig::Exclusive => AccessMode::Exclusive,
                AccessModeConfig::Counting => AccessMode::Counting,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockScopeConfig {
    Master,
    Worker,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessModeConfig {
    Exclusive,
    #[default]
    Counting,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub name: String,
    pub capabilities: Vec<String>,
    pub basedir: String,
    pub path_convention: PathConventionConfig,
    pub latent: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            capabilities: Vec::new(),
            basedir: "/var/lib/foreman/worker".to_string(),
            path_convention: PathConventionConfig::Posix,
            latent: false,
        }
    }
}

impl WorkerConfig {
    fn to_worker(&self, id: WorkerId) -> Worker {
        Worker {
            id,
            name: self.name.clone(),
            capabilities: self.capabilities.clone(),
            basedir: self.basedir.clone(),
            path_convention: match self.path_convention {
                PathConventionConfig::Posix => PathConvention::Posix,
                PathConventionConfig::Windows => PathConvention::Windows,
            },
            // Starts `Absent`; the worker registry moves it through the
            // latent-worker state machine once a build actually needs it.
            latent: if self.latent {
                Some(foreman_types::LatentWorkerState {
                    state: foreman_types::LatentState::Absent,
                    quarantine_until: None,
                })
            } else {
                None
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathConventionConfig {
    Posix,
    Windows,
}

/// One entry in `[[schedulers]]`, tagged by `kind`. Mirrors the
/// scheduler variants the core crate implements; a config file
/// declares what to build, the loaded `foreman_core::scheduler` types
/// decide when.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchedulerConfig {
    SingleBranch { name: String, branch: Option<String>, builder_names: Vec<String> },
    AnyBranch { name: String, builder_names: Vec<String> },
    Periodic {
        name: String,
        branch: Option<String>,
        builder_names: Vec<String>,
        #[serde(with = "humantime_serde")]
        interval: Duration,
    },
    Dependent { name: String, upstream_scheduler_names: Vec<String>, builder_names: Vec<String> },
    Triggerable { name: String, builder_names: Vec<String> },
    Try { name: String, builder_names: Vec<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    #[serde(with = "humantime_serde")]
    pub ping: Duration,
    #[serde(with = "humantime_serde")]
    pub substantiation: Duration,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            ping: Duration::from_secs(30),
            substantiation: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TryJobConfig {
    /// Only read from the file as a fallback; prefer setting
    /// `FOREMAN_TRY_JOB_SECRET` so the secret doesn't land in version
    /// control alongside the rest of the config.
    pub shared_secret: Option<String>,
    pub netstring_port: u16,
    /// Directory polled for the maildir-style jobdir try-job path, in
    /// addition to (not instead of) the RPC channel on `netstring_port`.
    /// Relative paths are resolved against the master's base directory.
    pub jobdir: Option<PathBuf>,
}

impl Default for TryJobConfig {
    fn default() -> Self {
        Self {
            shared_secret: None,
            netstring_port: 8031,
            jobdir: None,
        }
    }
}

/// The conventional config file name within a master's base directory.
pub fn config_path(base_dir: &Path) -> PathBuf {
    base_dir.join("master.toml")
}

/// Loads `master.toml` from `base_dir`, or returns the default config
/// if no such file exists -- a fresh master directory is a valid,
/// empty deployment rather than an error.
pub fn load_config(base_dir: &Path) -> Result<MasterConfig> {
    let path = config_path(base_dir);
    if !path.exists() {
        return Ok(MasterConfig::default());
    }
    load_config_from_file(&path)
}

pub fn load_config_from_file(path: &Path) -> Result<MasterConfig> {
    let contents = fs::read_to_string(path).with_context(|| format!("reading config file {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parsing config file {}", path.display()))
}

pub fn save_config(base_dir: &Path, config: &MasterConfig) -> Result<()> {
    let path = config_path(base_dir);
    let contents = toml::to_string_pretty(config).context("serializing config")?;
    fs::write(&path, contents).with_context(|| format!("writing config file {}", path.display()))
}

/// Walks up from `start_dir` looking for `master.toml`, the same way a
/// VCS client locates its repository root.
pub fn find_config(start_dir: &Path) -> Option<PathBuf> {
    let mut dir = start_dir.to_path_buf();
    loop {
        let candidate = config_path(&dir);
        if candidate.exists() {
            return Some(candidate);
        }
        if !dir.pop() {
            return None;
        }
    }
}
