//! Netstring-framed try-job wire format, versions 1-5, plus the JSON
//! RPC variant used by the credentialed channel.
//!
//! A netstring is `<byte-length>:<payload>,` -- a decimal ASCII length,
//! a colon, exactly that many payload bytes, and a trailing comma.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TryJobError;

/// Frames larger than this are rejected outright as malformed/hostile
/// input rather than parsed.
pub const NETSTRING_MAX: usize = 10 * 1024 * 1024;

/// A fully decoded try job, independent of which wire version produced
/// it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TryJob {
    pub job_id: String,
    pub branch: Option<String>,
    pub baserev: Option<String>,
    pub patch_level: i32,
    pub patch_body: String,
    pub repository: Option<String>,
    pub project: Option<String>,
    pub who: Option<String>,
    pub comment: Option<String>,
    pub builder_names: Vec<String>,
    pub properties: std::collections::BTreeMap<String, Value>,
}

/// Read one netstring frame from `input`, returning the payload bytes
/// and the remaining unread input.
fn read_netstring(input: &[u8]) -> Result<(&[u8], &[u8]), TryJobError> {
    let colon = input
        .iter()
        .position(|&b| b == b':')
        .ok_or_else(|| TryJobError::BadJobfile("missing ':' in netstring length prefix".into()))?;
    let len_str = std::str::from_utf8(&input[..colon])
        .map_err(|_| TryJobError::BadJobfile("non-UTF8 netstring length".into()))?;
    let len: usize = len_str
        .parse()
        .map_err(|_| TryJobError::BadJobfile(format!("invalid netstring length: {len_str}")))?;
    if len > NETSTRING_MAX {
        return Err(TryJobError::FrameTooLarge(len, NETSTRING_MAX));
    }
    let body_start = colon + 1;
    let body_end = body_start
        .checked_add(len)
        .ok_or_else(|| TryJobError::BadJobfile("netstring length overflow".into()))?;
    if body_end >= input.len() || input[body_end] != b',' {
        return Err(TryJobError::BadJobfile("netstring missing trailing ','".into()));
    }
    Ok((&input[body_start..body_end], &input[body_end + 1..]))
}

fn write_netstring(out: &mut Vec<u8>, payload: &[u8]) {
    out.extend_from_slice(payload.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(payload);
    out.push(b',');
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() { None } else { Some(s.to_string()) }
}

/// Parse a complete netstring-framed try-job submission, dispatching on
/// the first frame (the version string).
pub fn parse_tryjob(mut input: &[u8]) -> Result<TryJob, TryJobError> {
    let (version_bytes, rest) = read_netstring(input)?;
    let version = std::str::from_utf8(version_bytes)
        .map_err(|_| TryJobError::BadJobfile("non-UTF8 version frame".into()))?;
    input = rest;

    match version {
        "1" => parse_v1(input, 1),
        "2" => parse_v2(input, 2),
        "3" => parse_v3(input, 3),
        "4" => parse_v4(input, 4),
        "5" => parse_v5(input),
        other => Err(TryJobError::UnknownVersion(other.to_string())),
    }
}

fn read_field<'a>(input: &mut &'a [u8]) -> Result<&'a [u8], TryJobError> {
    let (field, rest) = read_netstring(input)?;
    *input = rest;
    Ok(field)
}

fn read_string_field(input: &mut &[u8]) -> Result<String, TryJobError> {
    let field = read_field(input)?;
    Ok(String::from_utf8_lossy(field).into_owned())
}

fn read_remaining_builders(input: &mut &[u8]) -> Result<Vec<String>, TryJobError> {
    let mut builders = Vec::new();
    while !input.is_empty() {
        builders.push(read_string_field(input)?);
    }
    Ok(builders)
}

fn parse_v1(mut input: &[u8], _version: u8) -> Result<TryJob, TryJobError> {
    let job_id = read_string_field(&mut input)?;
    let branch = non_empty(&read_string_field(&mut input)?);
    let baserev = non_empty(&read_string_field(&mut input)?);
    let patch_level: i32 = read_string_field(&mut input)?
        .parse()
        .map_err(|_| TryJobError::BadJobfile("invalid patchlevel".into()))?;
    let patch_body = read_string_field(&mut input)?;
    let builder_names = read_remaining_builders(&mut input)?;
    Ok(TryJob {
        job_id,
        branch,
        baserev,
        patch_level,
        patch_body,
        repository: None,
        project: None,
        who: None,
        comment: None,
        builder_names,
        properties: Default::default(),
    })
}

fn parse_v2(mut input: &[u8], _version: u8) -> Result<TryJob, TryJobError> {
    let job_id = read_string_field(&mut input)?;
    let branch = non_empty(&read_string_field(&mut input)?);
    let baserev = non_empty(&read_string_field(&mut input)?);
    let patch_level: i32 = read_string_field(&mut input)?
        .parse()
        .map_err(|_| TryJobError::BadJobfile("invalid patchlevel".into()))?;
    let patch_body = read_string_field(&mut input)?;
    let repository = non_empty(&read_string_field(&mut input)?);
    let project = non_empty(&read_string_field(&mut input)?);
    let builder_names = read_remaining_builders(&mut input)?;
    Ok(TryJob {
        job_id,
        branch,
        baserev,
        patch_level,
        patch_body,
        repository,
        project,
        who: None,
        comment: None,
        builder_names,
        properties: Default::default(),
    })
}

fn parse_v3(mut input: &[u8], _version: u8) -> Result<TryJob, TryJobError> {
    let job_id = read_string_field(&mut input)?;
    let branch = non_empty(&read_string_field(&mut input)?);
    let baserev = non_empty(&read_string_field(&mut input)?);
    let patch_level: i32 = read_string_field(&mut input)?
        .parse()
        .map_err(|_| TryJobError::BadJobfile("invalid patchlevel".into()))?;
    let patch_body = read_string_field(&mut input)?;
    let repository = non_empty(&read_string_field(&mut input)?);
    let project = non_empty(&read_string_field(&mut input)?);
    let who = non_empty(&read_string_field(&mut input)?);
    let builder_names = read_remaining_builders(&mut input)?;
    Ok(TryJob {
        job_id,
        branch,
        baserev,
        patch_level,
        patch_body,
        repository,
        project,
        who,
        comment: None,
        builder_names,
        properties: Default::default(),
    })
}

fn parse_v4(mut input: &[u8], _version: u8) -> Result<TryJob, TryJobError> {
    let job_id = read_string_field(&mut input)?;
    let branch = non_empty(&read_string_field(&mut input)?);
    let baserev = non_empty(&read_string_field(&mut input)?);
    let patch_level: i32 = read_string_field(&mut input)?
        .parse()
        .map_err(|_| TryJobError::BadJobfile("invalid patchlevel".into()))?;
    let patch_body = read_string_field(&mut input)?;
    let repository = non_empty(&read_string_field(&mut input)?);
    let project = non_empty(&read_string_field(&mut input)?);
    let who = non_empty(&read_string_field(&mut input)?);
    let comment = non_empty(&read_string_field(&mut input)?);
    let builder_names = read_remaining_builders(&mut input)?;
    Ok(TryJob {
        job_id,
        branch,
        baserev,
        patch_level,
        patch_body,
        repository,
        project,
        who,
        comment,
        builder_names,
        properties: Default::default(),
    })
}

#[derive(Deserialize, Serialize)]
struct TryJobV5 {
    jobid: String,
    branch: String,
    baserev: String,
    patch_level: i32,
    patch_body: String,
    repository: String,
    project: String,
    who: Option<String>,
    comment: Option<String>,
    #[serde(rename = "builderNames")]
    builder_names: Vec<String>,
    #[serde(default)]
    properties: std::collections::BTreeMap<String, Value>,
}

fn parse_v5(mut input: &[u8]) -> Result<TryJob, TryJobError> {
    let json_bytes = read_field(&mut input)?;
    let parsed: TryJobV5 = serde_json::from_slice(json_bytes)
        .map_err(|e| TryJobError::BadJobfile(format!("invalid v5 JSON body: {e}")))?;
    Ok(TryJob {
        job_id: parsed.jobid,
        branch: non_empty(&parsed.branch),
        baserev: non_empty(&parsed.baserev),
        patch_level: parsed.patch_level,
        patch_body: parsed.patch_body,
        repository: non_empty(&parsed.repository),
        project: non_empty(&parsed.project),
        who: parsed.who,
        comment: parsed.comment,
        builder_names: parsed.builder_names,
        properties: parsed.properties,
    })
}

/// Serialize as v5 (the only version round-tripped in practice -- v1-4
/// are read-compatibility formats for older submission tools).
pub fn serialize_tryjob_v5(job: &TryJob) -> Vec<u8> {
    let payload = TryJobV5 {
        jobid: job.job_id.clone(),
        branch: job.branch.clone().unwrap_or_default(),
        baserev: job.baserev.clone().unwrap_or_default(),
        patch_level: job.patch_level,
        patch_body: job.patch_body.clone(),
        repository: job.repository.clone().unwrap_or_default(),
        project: job.project.clone().unwrap_or_default(),
        who: job.who.clone(),
        comment: job.comment.clone(),
        builder_names: job.builder_names.clone(),
        properties: job.properties.clone(),
    };
    let json = serde_json::to_vec(&payload).expect("TryJobV5 always serializes");
    let mut out = Vec::new();
    write_netstring(&mut out, b"5");
    write_netstring(&mut out, &json);
    out
}

/// The reason string used for a try buildset.
pub fn try_job_reason(job: &TryJob) -> String {
    match (&job.who, &job.comment) {
        (Some(who), Some(comment)) => format!("'try' job by user {who} ({comment})"),
        (Some(who), None) => format!("'try' job by user {who}"),
        (None, _) => "'try' job".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn netstring(s: &str) -> Vec<u8> {
        let mut out = Vec::new();
        write_netstring(&mut out, s.as_bytes());
        out
    }

    fn concat(parts: &[Vec<u8>]) -> Vec<u8> {
        parts.iter().flat_map(|p| p.iter().copied()).collect()
    }

    #[test]
    fn parses_v1() {
        let input = concat(&[
            netstring("1"),
            netstring("job-1"),
            netstring("trunk"),
            netstring("abc123"),
            netstring("0"),
            netstring("diff --git a b"),
            netstring("builder-a"),
            netstring("builder-b"),
        ]);
        let job = parse_tryjob(&input).unwrap();
        assert_eq!(job.job_id, "job-1");
        assert_eq!(job.branch.as_deref(), Some("trunk"));
        assert_eq!(job.builder_names, vec!["builder-a", "builder-b"]);
        assert_eq!(job.repository, None);
    }

    #[test]
    fn empty_branch_and_baserev_become_absent() {
        let input = concat(&[
            netstring("1"),
            netstring("job-1"),
            netstring(""),
            netstring(""),
            netstring("0"),
            netstring("diff"),
        ]);
        let job = parse_tryjob(&input).unwrap();
        assert_eq!(job.branch, None);
        assert_eq!(job.baserev, None);
        assert!(job.builder_names.is_empty());
    }

    #[test]
    fn unknown_version_is_bad_jobfile() {
        let input = concat(&[netstring("99"), netstring("whatever")]);
        assert!(matches!(parse_tryjob(&input), Err(TryJobError::UnknownVersion(_))));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut input = Vec::new();
        input.extend_from_slice(format!("{}:", NETSTRING_MAX + 1).as_bytes());
        assert!(matches!(parse_tryjob(&input), Err(TryJobError::FrameTooLarge(_, _))));
    }

    /// Matches the documented try-job JSON reason format.
    #[test]
    fn parses_v5_json() {
        let json = serde_json::json!({
            "jobid": "x",
            "branch": "trunk",
            "baserev": "1",
            "patch_level": 1,
            "patch_body": "diff",
            "repository": "r",
            "project": "p",
            "who": "u",
            "comment": "c",
            "builderNames": ["a", "c"],
            "properties": {"k": "v"}
        });
        let body = serde_json::to_vec(&json).unwrap();
        let input = concat(&[netstring("5"), {
            let mut out = Vec::new();
            write_netstring(&mut out, &body);
            out
        }]);
        let job = parse_tryjob(&input).unwrap();
        assert_eq!(job.job_id, "x");
        assert_eq!(job.builder_names, vec!["a", "c"]);
        assert_eq!(try_job_reason(&job), "'try' job by user u (c)");
        assert_eq!(job.properties.get("k"), Some(&serde_json::json!("v")));
    }

    #[test]
    fn v5_roundtrips() {
        let job = TryJob {
            job_id: "job-1".to_string(),
            branch: Some("main".to_string()),
            baserev: Some("deadbeef".to_string()),
            patch_level: 1,
            patch_body: "diff".to_string(),
            repository: Some("repo".to_string()),
            project: Some("proj".to_string()),
            who: Some("alice".to_string()),
            comment: Some("fix it".to_string()),
            builder_names: vec!["a".to_string()],
            properties: Default::default(),
        };
        let wire = serialize_tryjob_v5(&job);
        let parsed = parse_tryjob(&wire).unwrap();
        assert_eq!(parsed, job);
    }
}
