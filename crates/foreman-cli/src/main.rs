//! `foreman`: a thin front door onto `foreman-core`. Three subcommands:
//! `serve` runs a master (registering every configured worker against a
//! [`connection::LoopbackConnection`] so the distributor/build-runner
//! machinery can be exercised without a real worker fleet), `try`
//! drops a netstring-framed job into the master's jobdir, and
//! `reconfig` reloads and re-validates `master.toml` in place. None of
//! these own orchestration logic -- that is `foreman-core`'s job.

mod connection;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use foreman_config::{find_config, load_config_from_file, save_config, MasterConfig, SchedulerConfig};
use foreman_core::botmaster::{BotMaster, MasterTimeouts};
use foreman_core::clock::system_clock;
use foreman_core::jobdir::JobDir;
use foreman_core::scheduler::TryScheduler;
use foreman_core::tryjob::{serialize_tryjob_v5, TryJob};
use foreman_core::tryjob_intake::TryJobIntake;
use foreman_retry::BackoffPolicy;
use foreman_types::{PropertyBag, PropertySource};
use serde_json::Value;
use tracing::{info, warn};

use connection::LoopbackConnection;

#[derive(Parser, Debug)]
#[command(name = "foreman", version)]
#[command(about = "Orchestration master for distributed CI builds")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a master against the configuration in `--base-dir`/master.toml.
    Serve {
        #[arg(long, default_value = ".")]
        base_dir: PathBuf,

        /// How often to poll the jobdir for new try jobs and re-check
        /// the distributor for newly eligible work.
        #[arg(long, default_value = "2s")]
        poll_interval: String,
    },

    /// Submit a try job into a master's jobdir.
    Try {
        #[arg(long, default_value = ".")]
        base_dir: PathBuf,

        #[arg(long)]
        branch: Option<String>,

        #[arg(long)]
        baserev: Option<String>,

        #[arg(long, default_value_t = 1)]
        patch_level: i32,

        /// Path to a diff file; reads stdin if omitted.
        #[arg(long)]
        patch: Option<PathBuf>,

        #[arg(long)]
        repository: Option<String>,

        #[arg(long)]
        project: Option<String>,

        #[arg(long)]
        who: Option<String>,

        #[arg(long)]
        comment: Option<String>,

        /// Builder to target (repeatable). Omit to let every try
        /// scheduler's own configured builders decide.
        #[arg(long = "builder")]
        builders: Vec<String>,

        /// A `key=value` property (repeatable).
        #[arg(long = "property")]
        properties: Vec<String>,
    },

    /// Reload and re-save `master.toml`, validating it round-trips.
    Reconfig {
        #[arg(long, default_value = ".")]
        base_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Command::Serve { base_dir, poll_interval } => {
            let poll_interval = humantime::parse_duration(&poll_interval)
                .with_context(|| format!("invalid poll interval: {poll_interval}"))?;
            serve(&base_dir, poll_interval).await
        }
        Command::Try {
            base_dir,
            branch,
            baserev,
            patch_level,
            patch,
            repository,
            project,
            who,
            comment,
            builders,
            properties,
        } => {
            submit_try_job(
                &base_dir,
                TryJob {
                    job_id: format!("cli-{}", uuid_like()),
                    branch,
                    baserev,
                    patch_level,
                    patch_body: read_patch(patch.as_deref())?,
                    repository,
                    project,
                    who,
                    comment,
                    builder_names: builders,
                    properties: parse_properties(&properties)?,
                },
            )
            .await
        }
        Command::Reconfig { base_dir } => reconfig(&base_dir),
    }
}

/// A process-unique-enough suffix for a job id. Not a real UUID (no
/// extra dependency for it); callers that need collision-proof ids
/// across a cluster should set `--who`/`--comment` to disambiguate, the
/// same way a human-submitted try job already does.
fn uuid_like() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(0)
}

fn read_patch(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("reading patch file {}", path.display())),
        None => {
            use std::io::Read;
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf).context("reading patch from stdin")?;
            Ok(buf)
        }
    }
}

fn parse_properties(entries: &[String]) -> Result<BTreeMap<String, Value>> {
    let mut out = BTreeMap::new();
    for entry in entries {
        let (key, value) = entry.split_once('=').with_context(|| format!("malformed --property '{entry}', expected key=value"))?;
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        out.insert(key.to_string(), value);
    }
    Ok(out)
}

fn jobdir_path(base_dir: &Path, config: &MasterConfig) -> PathBuf {
    match &config.try_job.jobdir {
        Some(path) if path.is_absolute() => path.clone(),
        Some(path) => base_dir.join(path),
        None => base_dir.join("jobdir"),
    }
}

fn master_properties(config: &MasterConfig) -> PropertyBag {
    let mut bag = PropertyBag::new();
    for (k, v) in &config.global_properties {
        bag.set(k.clone(), v.clone(), PropertySource::Master);
    }
    bag
}

async fn serve(base_dir: &Path, poll_interval: Duration) -> Result<()> {
    let config = foreman_config::load_config(base_dir).with_context(|| format!("loading config from {}", base_dir.display()))?;
    info!(builders = config.builders.len(), workers = config.workers.len(), "loaded master config");

    let timeouts = MasterTimeouts {
        ping: config.timeouts.ping,
        substantiation: config.timeouts.substantiation,
    };
    let master = Arc::new(BotMaster::<LoopbackConnection>::new(
        config.masterid(),
        system_clock(),
        master_properties(&config),
        timeouts,
    ));

    for builder in config.builders() {
        master.upsert_builder(builder).await;
    }
    for worker in config.workers() {
        master.register_worker(worker, Arc::new(LoopbackConnection::new()), BackoffPolicy::default()).await;
    }

    let intake = Arc::new(TryJobIntake::new(master.data.clone()));
    for scheduler in &config.schedulers {
        if let SchedulerConfig::Try { name, builder_names } = scheduler {
            intake
                .register_scheduler(TryScheduler {
                    name: name.clone(),
                    builder_names: builder_names.clone(),
                })
                .await;
        }
    }

    let jobdir = match &config.try_job.jobdir {
        Some(_) => Some(JobDir::open(jobdir_path(base_dir, &config)).await.context("opening jobdir")?),
        None => None,
    };

    master.maybe_start_builds_for_all_builders().await?;
    info!(poll_interval = ?poll_interval, "master running, press ctrl-c to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                return Ok(());
            }
            _ = tokio::time::sleep(poll_interval) => {
                if let Some(jobdir) = &jobdir {
                    for (path, parsed) in jobdir.poll().await.context("polling jobdir")? {
                        match parsed {
                            Ok(job) => match intake.submit(job).await {
                                Ok(created) => info!(?path, buildsets = created.len(), "try job accepted"),
                                Err(err) => warn!(?path, %err, "try job rejected"),
                            },
                            Err(err) => warn!(?path, %err, "malformed try job file"),
                        }
                    }
                }
                if let Err(err) = master.maybe_start_builds_for_all_builders().await {
                    warn!(%err, "failed to drain pending build requests");
                }
            }
        }
    }
}

async fn submit_try_job(base_dir: &Path, job: TryJob) -> Result<()> {
    let config = foreman_config::load_config(base_dir).with_context(|| format!("loading config from {}", base_dir.display()))?;
    let jobdir = JobDir::open(jobdir_path(base_dir, &config)).await.context("opening jobdir")?;
    let framed = serialize_tryjob_v5(&job);
    let path = jobdir.submit(&format!("{}.job", job.job_id), &framed).await.context("writing job file")?;
    println!("submitted {} -> {}", job.job_id, path.display());
    Ok(())
}

fn reconfig(base_dir: &Path) -> Result<()> {
    let Some(path) = find_config(base_dir) else {
        bail!("no master.toml found at or above {}", base_dir.display());
    };
    let config = load_config_from_file(&path).with_context(|| format!("parsing {}", path.display()))?;
    save_config(base_dir, &config).context("re-saving normalized config")?;
    println!(
        "reconfigured from {}: {} builder(s), {} scheduler(s), {} worker(s)",
        path.display(),
        config.builders.len(),
        config.schedulers.len(),
        config.workers.len()
    );
    Ok(())
}
