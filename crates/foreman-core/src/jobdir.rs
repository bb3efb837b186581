//! The `jobdir` try-job intake path: a watched maildir-style directory
//! (`new/`, `cur/`, `tmp/`) that a submission tool drops netstring-framed
//! job files into. Consuming a job is a POSIX rename from `new/` into
//! `cur/`, the same atomicity maildir itself relies on -- a reader never
//! observes a partially-written file because writers are expected to
//! write into `tmp/` and rename into `new/` themselves.
//!
//! This is one of the two try-job wire paths named alongside the
//! credentialed RPC channel; `foreman-cli` polls it for the `serve`
//! command, but the read/parse/move behavior itself belongs here since
//! it's intake logic, not CLI plumbing.

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::error::TryJobError;
use crate::tryjob::{parse_tryjob, TryJob};

/// A maildir-style try-job intake directory.
pub struct JobDir {
    root: PathBuf,
}

impl JobDir {
    /// Opens `root`, creating `new/`, `cur/`, and `tmp/` under it if
    /// they don't already exist.
    pub async fn open(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        for sub in ["new", "cur", "tmp"] {
            fs::create_dir_all(root.join(sub)).await?;
        }
        Ok(Self { root })
    }

    fn new_dir(&self) -> PathBuf {
        self.root.join("new")
    }

    fn cur_dir(&self) -> PathBuf {
        self.root.join("cur")
    }

    /// Reads every file currently in `new/`, parses it as a
    /// netstring-framed try job, and renames it into `cur/` regardless
    /// of whether parsing succeeded -- a malformed job file is moved
    /// aside rather than re-read on every poll.
    pub async fn poll(&self) -> std::io::Result<Vec<(PathBuf, Result<TryJob, TryJobError>)>> {
        let mut out = Vec::new();
        let mut entries = fs::read_dir(self.new_dir()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let bytes = fs::read(&path).await?;
            let parsed = parse_tryjob(&bytes);
            let dest = self.cur_dir().join(entry.file_name());
            fs::rename(&path, &dest).await?;
            out.push((dest, parsed));
        }
        Ok(out)
    }

    /// Writes a pre-framed netstring job submission into `tmp/` then
    /// atomically renames it into `new/`, the write side of the same
    /// maildir convention. Exposed for test fixtures and for a local
    /// submission tool that wants to drop a job directly onto disk
    /// instead of going over the RPC channel.
    pub async fn submit(&self, file_name: &str, framed: &[u8]) -> std::io::Result<PathBuf> {
        let tmp_path = self.root.join("tmp").join(file_name);
        fs::write(&tmp_path, framed).await?;
        let new_path = self.new_dir().join(file_name);
        fs::rename(&tmp_path, &new_path).await?;
        Ok(new_path)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tryjob::serialize_tryjob_v5;
    use std::collections::BTreeMap;

    fn sample_job() -> TryJob {
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
            builder_names: vec!["a".to_string(), "c".to_string()],
            properties: BTreeMap::from([("k".to_string(), serde_json::json!("v"))]),
        }
    }

    #[tokio::test]
    async fn submitted_job_is_polled_and_moved_to_cur() {
        let tmp = tempfile::tempdir().unwrap();
        let jobdir = JobDir::open(tmp.path()).await.unwrap();

        let framed = serialize_tryjob_v5(&sample_job());
        jobdir.submit("job1", &framed).await.unwrap();

        assert!(jobdir.new_dir().join("job1").exists());
        assert!(!jobdir.cur_dir().join("job1").exists());

        let polled = jobdir.poll().await.unwrap();
        assert_eq!(polled.len(), 1);
        let (path, result) = &polled[0];
        assert_eq!(*path, jobdir.cur_dir().join("job1"));
        let job = result.as_ref().unwrap();
        assert_eq!(job.job_id, "x");
        assert_eq!(job.builder_names, vec!["a".to_string(), "c".to_string()]);

        assert!(!jobdir.new_dir().join("job1").exists());
        assert!(jobdir.cur_dir().join("job1").exists());
    }

    #[tokio::test]
    async fn malformed_job_file_is_still_moved_aside() {
        let tmp = tempfile::tempdir().unwrap();
        let jobdir = JobDir::open(tmp.path()).await.unwrap();

        jobdir.submit("garbage", b"not a netstring").await.unwrap();

        let polled = jobdir.poll().await.unwrap();
        assert_eq!(polled.len(), 1);
        assert!(polled[0].1.is_err());
        assert!(jobdir.cur_dir().join("garbage").exists());
    }

    #[tokio::test]
    async fn poll_with_no_new_jobs_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let jobdir = JobDir::open(tmp.path()).await.unwrap();
        assert!(jobdir.poll().await.unwrap().is_empty());
    }
}
