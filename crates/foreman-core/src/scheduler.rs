//! Scheduler variants: decide which changes warrant a build and when.
//!
//! Schedulers never talk to the data layer directly on construction;
//! they are driven by `on_change` / `on_tick` and hand back the
//! sourcestamps/builder set a caller should turn into a buildset via
//! [`crate::datastore::DataStore::add_buildset`]. A change only carries
//! its commit metadata (`who`, `files`, ...); the repository/branch it
//! landed on lives on the [`SourceStamp`] it is bound to, so schedulers
//! are handed the pair.

use chrono::{DateTime, Utc};
use foreman_types::{Change, PropertyBag, PropertySource, SourceStamp};

/// A decision to cut a buildset, independent of how it gets persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildsetProposal {
    pub reason: String,
    pub sourcestamps: Vec<SourceStamp>,
    pub builder_names: Vec<String>,
    /// Properties to seed onto the buildset (and, through
    /// `add_buildset`, onto every buildrequest it spawns) -- in
    /// particular `owners`, the JSON array of change/patch authors
    /// [`crate::buildrunner`]'s property merge reads back out.
    pub properties: PropertyBag,
}

/// Folds one change's `who` and properties into a proposal's property
/// bag: `owners` becomes a one-element array (later merges with other
/// changes' `owners` arrays are the caller's job -- see
/// `PeriodicScheduler::on_tick`), and the change's own properties are
/// merged in underneath so a later source can still override them.
fn properties_for_change(change: &Change) -> PropertyBag {
    let mut bag = PropertyBag::new();
    bag.merge_from(&change.properties);
    bag.set("owners", serde_json::json!([change.who.clone()]), PropertySource::Change);
    bag
}

/// Matches changes against a branch filter. `None` means "any branch".
fn branch_matches(filter: Option<&str>, change_branch: Option<&str>) -> bool {
    match filter {
        None => true,
        Some(wanted) => change_branch == Some(wanted),
    }
}

/// Fires a buildset as soon as a matching change lands, independent of
/// any other change.
pub struct SingleBranchScheduler {
    pub name: String,
    pub branch: Option<String>,
    pub builder_names: Vec<String>,
}

impl SingleBranchScheduler {
    pub fn classify(&self, stamp: &SourceStamp) -> bool {
        branch_matches(self.branch.as_deref(), stamp.branch.as_deref())
    }

    pub fn on_change(&self, change: &Change, stamp: &SourceStamp) -> Option<BuildsetProposal> {
        if !self.classify(stamp) {
            return None;
        }
        Some(BuildsetProposal {
            reason: format!("scheduler '{}' triggered by change {}", self.name, change.id),
            sourcestamps: vec![stamp.clone()],
            builder_names: self.builder_names.clone(),
            properties: properties_for_change(change),
        })
    }
}

/// Like [`SingleBranchScheduler`] but accepts changes from any branch.
pub struct AnyBranchScheduler {
    pub name: String,
    pub builder_names: Vec<String>,
}

impl AnyBranchScheduler {
    pub fn on_change(&self, change: &Change, stamp: &SourceStamp) -> BuildsetProposal {
        BuildsetProposal {
            reason: format!("scheduler '{}' triggered by change {}", self.name, change.id),
            sourcestamps: vec![stamp.clone()],
            builder_names: self.builder_names.clone(),
            properties: properties_for_change(change),
        }
    }
}

/// Accumulates changes and fires on a fixed wall-clock interval rather
/// than per change.
pub struct PeriodicScheduler {
    pub name: String,
    pub branch: Option<String>,
    pub builder_names: Vec<String>,
    pub interval: chrono::Duration,
    pending: std::sync::Mutex<Vec<(DateTime<Utc>, SourceStamp, Change)>>,
    last_fired: std::sync::Mutex<Option<DateTime<Utc>>>,
}

impl PeriodicScheduler {
    pub fn new(name: String, branch: Option<String>, builder_names: Vec<String>, interval: chrono::Duration) -> Self {
        Self {
            name,
            branch,
            builder_names,
            interval,
            pending: std::sync::Mutex::new(Vec::new()),
            last_fired: std::sync::Mutex::new(None),
        }
    }

    pub fn on_change(&self, change: &Change, stamp: &SourceStamp) {
        if branch_matches(self.branch.as_deref(), stamp.branch.as_deref()) {
            self.pending.lock().unwrap().push((change.when, stamp.clone(), change.clone()));
        }
    }

    /// Called regularly by the botmaster's tick loop. Fires a buildset
    /// collapsing every accumulated change since the last tick into a
    /// single sourcestamp per repository/branch pair, keeping only the
    /// most recent revision -- buildbot calls this "important changes
    /// only" collapsing at the scheduler layer.
    pub fn on_tick(&self, now: DateTime<Utc>) -> Option<BuildsetProposal> {
        let due = match *self.last_fired.lock().unwrap() {
            None => true,
            Some(last) => now - last >= self.interval,
        };
        if !due {
            return None;
        }
        *self.last_fired.lock().unwrap() = Some(now);

        let mut pending = self.pending.lock().unwrap();
        if pending.is_empty() {
            return None;
        }
        let mut latest_by_branch: std::collections::BTreeMap<(String, Option<String>), (DateTime<Utc>, SourceStamp)> =
            std::collections::BTreeMap::new();
        let mut owners = std::collections::BTreeSet::new();
        let mut properties = PropertyBag::new();
        for (when, stamp, change) in pending.drain(..) {
            owners.insert(change.who.clone());
            properties.merge_from(&change.properties);
            let key = (stamp.repository.clone(), stamp.branch.clone());
            latest_by_branch
                .entry(key)
                .and_modify(|existing| {
                    if when >= existing.0 {
                        *existing = (when, stamp.clone());
                    }
                })
                .or_insert((when, stamp));
        }
        properties.set("owners", serde_json::json!(owners.into_iter().collect::<Vec<_>>()), PropertySource::Change);
        let sourcestamps = latest_by_branch.into_values().map(|(_, stamp)| stamp).collect();
        Some(BuildsetProposal {
            reason: format!("periodic scheduler '{}' tick", self.name),
            sourcestamps,
            builder_names: self.builder_names.clone(),
            properties,
        })
    }
}

/// Fires only once all of its upstream buildset names have completed
/// successfully for the same top-level buildset, mirroring Buildbot's
/// `Dependent` scheduler.
pub struct DependentScheduler {
    pub name: String,
    pub upstream_scheduler_names: Vec<String>,
    pub builder_names: Vec<String>,
}

impl DependentScheduler {
    /// `completed` maps upstream scheduler name -> whether that
    /// upstream's most recent buildset for this parent succeeded.
    pub fn ready(&self, completed: &std::collections::BTreeMap<String, bool>) -> bool {
        self.upstream_scheduler_names
            .iter()
            .all(|name| completed.get(name).copied().unwrap_or(false))
    }

    /// `parent_properties` carries forward whatever `owners` and other
    /// properties the upstream buildset already resolved -- a dependent
    /// build has no change of its own, so its owners are its parent's.
    pub fn on_ready(&self, parent_sourcestamps: Vec<SourceStamp>, parent_properties: PropertyBag) -> BuildsetProposal {
        BuildsetProposal {
            reason: format!("dependent scheduler '{}' unblocked", self.name),
            sourcestamps: parent_sourcestamps,
            builder_names: self.builder_names.clone(),
            properties: parent_properties,
        }
    }
}

/// Fires only via an explicit external trigger (the `trigger` build
/// step, or an administrative API call), never from change sources.
pub struct TriggerableScheduler {
    pub name: String,
    pub builder_names: Vec<String>,
}

impl TriggerableScheduler {
    /// `triggering_properties` is the property bag of the build whose
    /// `trigger` step fired this scheduler -- its `owners` carry
    /// forward the same way a dependent build's do.
    pub fn on_trigger(
        &self,
        sourcestamps: Vec<SourceStamp>,
        reason: Option<String>,
        triggering_properties: PropertyBag,
    ) -> BuildsetProposal {
        BuildsetProposal {
            reason: reason.unwrap_or_else(|| format!("triggered by scheduler '{}'", self.name)),
            sourcestamps,
            builder_names: self.builder_names.clone(),
            properties: triggering_properties,
        }
    }
}

/// Accepts try-job submissions (see [`crate::tryjob`]) and filters the
/// requested builder names down to the ones this scheduler actually
/// serves; an empty intersection means no buildset should be created.
pub struct TryScheduler {
    pub name: String,
    pub builder_names: Vec<String>,
}

impl TryScheduler {
    pub fn on_tryjob(&self, job: &crate::tryjob::TryJob, stamp_id: foreman_types::SourceStampId) -> Option<BuildsetProposal> {
        let allowed: Vec<String> = if job.builder_names.is_empty() {
            self.builder_names.clone()
        } else {
            self.builder_names
                .iter()
                .filter(|b| job.builder_names.contains(b))
                .cloned()
                .collect()
        };
        if allowed.is_empty() {
            return None;
        }
        let mut properties = PropertyBag::new();
        for (k, v) in &job.properties {
            properties.set(k.clone(), v.clone(), PropertySource::TryJob);
        }
        if let Some(who) = &job.who {
            properties.set("owners", serde_json::json!([who]), PropertySource::TryJob);
        }
        Some(BuildsetProposal {
            reason: crate::tryjob::try_job_reason(job),
            sourcestamps: vec![SourceStamp {
                id: stamp_id,
                codebase: String::new(),
                repository: job.repository.clone().unwrap_or_default(),
                branch: job.branch.clone(),
                revision: job.baserev.clone(),
                project: job.project.clone().unwrap_or_default(),
                patch: Some(foreman_types::Patch {
                    level: job.patch_level,
                    body: job.patch_body.clone(),
                    subdir: None,
                }),
            }],
            builder_names: allowed,
            properties,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_types::{ChangeId, SourceStampId};

    fn stamp(id: u64, branch: Option<&str>, revision: &str) -> SourceStamp {
        SourceStamp {
            id: SourceStampId(id),
            codebase: String::new(),
            repository: "repo".to_string(),
            branch: branch.map(str::to_string),
            revision: Some(revision.to_string()),
            project: String::new(),
            patch: None,
        }
    }

    fn change(id: u64, when: DateTime<Utc>) -> Change {
        Change {
            id: ChangeId(id),
            sourcestamp_id: SourceStampId(id),
            who: "alice".to_string(),
            when,
            files: vec![],
            comments: String::new(),
            properties: PropertyBag::default(),
            parent_changeids: vec![],
        }
    }

    #[test]
    fn single_branch_scheduler_ignores_other_branches() {
        let s = SingleBranchScheduler {
            name: "s".into(),
            branch: Some("main".into()),
            builder_names: vec!["b".into()],
        };
        let now = Utc::now();
        assert!(s.on_change(&change(1, now), &stamp(1, Some("main"), "rev1")).is_some());
        assert!(s.on_change(&change(2, now), &stamp(2, Some("feature"), "rev2")).is_none());
    }

    #[test]
    fn periodic_scheduler_collapses_to_latest_per_branch_and_waits_for_interval() {
        let sched = PeriodicScheduler::new(
            "p".into(),
            None,
            vec!["b".into()],
            chrono::Duration::seconds(60),
        );
        let base = Utc::now();
        sched.on_change(&change(1, base), &stamp(1, Some("main"), "rev1"));
        sched.on_change(&change(2, base + chrono::Duration::seconds(1)), &stamp(2, Some("main"), "rev2"));

        let proposal = sched.on_tick(base).expect("first tick always fires");
        assert_eq!(proposal.sourcestamps.len(), 1);
        assert_eq!(proposal.sourcestamps[0].revision.as_deref(), Some("rev2"));

        sched.on_change(&change(3, base), &stamp(3, Some("main"), "rev3"));
        assert!(sched.on_tick(base + chrono::Duration::seconds(10)).is_none());
        assert!(sched.on_tick(base + chrono::Duration::seconds(61)).is_some());
    }

    #[test]
    fn dependent_scheduler_requires_all_upstreams() {
        let sched = DependentScheduler {
            name: "d".into(),
            upstream_scheduler_names: vec!["a".into(), "b".into()],
            builder_names: vec!["b".into()],
        };
        let mut completed = std::collections::BTreeMap::new();
        completed.insert("a".to_string(), true);
        assert!(!sched.ready(&completed));
        completed.insert("b".to_string(), true);
        assert!(sched.ready(&completed));
    }

    #[test]
    fn try_scheduler_intersects_requested_builders() {
        let sched = TryScheduler {
            name: "try".into(),
            builder_names: vec!["a".into(), "b".into()],
        };
        let job = crate::tryjob::TryJob {
            job_id: "j".into(),
            branch: None,
            baserev: None,
            patch_level: 0,
            patch_body: String::new(),
            repository: None,
            project: None,
            who: None,
            comment: None,
            builder_names: vec!["b".into(), "c".into()],
            properties: Default::default(),
        };
        let proposal = sched.on_tryjob(&job, SourceStampId(1)).expect("intersection is non-empty");
        assert_eq!(proposal.builder_names, vec!["b".to_string()]);
    }

    #[test]
    fn try_scheduler_empty_intersection_yields_no_buildset() {
        let sched = TryScheduler {
            name: "try".into(),
            builder_names: vec!["a".into()],
        };
        let job = crate::tryjob::TryJob {
            job_id: "j".into(),
            branch: None,
            baserev: None,
            patch_level: 0,
            patch_body: String::new(),
            repository: None,
            project: None,
            who: None,
            comment: None,
            builder_names: vec!["z".into()],
            properties: Default::default(),
        };
        assert!(sched.on_tryjob(&job, SourceStampId(1)).is_none());
    }
}
