//! Append-only log chunk storage: bounded chunking, truncation of
//! over-long lines, pluggable compression, and deletion.

use std::collections::BTreeMap;
use std::sync::Arc;

use foreman_types::{LogId, LogType};
use tokio::sync::Mutex;

use crate::error::LogError;

/// Bytes. A submitted fragment that would make a chunk exceed this is
/// split at line boundaries; a single line longer than this is
/// truncated.
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;
/// Lines per chunk, the other bound `compress` re-packs under.
pub const MAX_CHUNK_LINES: u64 = 1_000;
/// Chunks smaller than this are always stored raw; compressing them
/// would cost more than it saves.
const COMPRESS_THRESHOLD: usize = 256;

/// Codec ids as stored per chunk. `0` (raw) is always available;
/// others are registered at construction time, keeping compression
/// pluggable without requiring every codec to be linked into every
/// build of this crate.
pub trait Codec: Send + Sync {
    fn id(&self) -> u8;
    fn encode(&self, data: &[u8]) -> Vec<u8>;
    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, LogError>;
}

pub struct RawCodec;
impl Codec for RawCodec {
    fn id(&self) -> u8 {
        0
    }
    fn encode(&self, data: &[u8]) -> Vec<u8> {
        data.to_vec()
    }
    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, LogError> {
        Ok(data.to_vec())
    }
}

/// Codec id `1` in the registry named in the spec's lock/log
/// identifiers section.
pub struct GzipCodec;
impl Codec for GzipCodec {
    fn id(&self) -> u8 {
        1
    }
    fn encode(&self, data: &[u8]) -> Vec<u8> {
        use std::io::Write;
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).expect("writing to an in-memory encoder cannot fail");
        encoder.finish().expect("finishing an in-memory encoder cannot fail")
    }
    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, LogError> {
        use std::io::Read;
        let mut out = Vec::new();
        flate2::read::GzDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|_| LogError::CompressionFormatUnavailable(self.id()))?;
        Ok(out)
    }
}

/// Maps codec id -> implementation. Writing with an id that isn't
/// registered transparently falls back to raw; reading a chunk whose
/// id isn't registered is an error (`LogCompressionFormatUnavailable`).
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: Arc<BTreeMap<u8, Arc<dyn Codec>>>,
    default_write_codec: u8,
}

impl CodecRegistry {
    pub fn raw_only() -> Self {
        let mut map: BTreeMap<u8, Arc<dyn Codec>> = BTreeMap::new();
        map.insert(0, Arc::new(RawCodec));
        Self {
            codecs: Arc::new(map),
            default_write_codec: 0,
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        let mut map = (*self.codecs).clone();
        map.insert(codec.id(), codec);
        self.codecs = Arc::new(map);
        self
    }

    pub fn set_default_write_codec(mut self, id: u8) -> Self {
        self.default_write_codec = id;
        self
    }

    fn resolve(&self, id: u8) -> Option<Arc<dyn Codec>> {
        self.codecs.get(&id).cloned()
    }

    /// The codec to use for writing; falls back to raw if the
    /// configured default isn't registered in this process.
    fn write_codec(&self) -> (u8, Arc<dyn Codec>) {
        match self.resolve(self.default_write_codec) {
            Some(codec) => (self.default_write_codec, codec),
            None => (0, self.resolve(0).expect("raw codec always registered")),
        }
    }
}

struct StoredChunk {
    first_line: u64,
    last_line: u64,
    compressed_id: u8,
    content: Vec<u8>,
}

struct LogState {
    log_type: LogType,
    num_lines: u64,
    chunks: Vec<StoredChunk>,
    /// Timestamp (as an opaque ordering key) of the owning step's
    /// start, used by `delete_old`.
    step_started_at: chrono::DateTime<chrono::Utc>,
}

/// The pipeline itself: one in-memory store of chunks per log, guarded
/// by a per-log-id mutex equivalent (a single global mutex here, which
/// is sufficient for the in-process, single-master target and matches
/// concurrent appends to the same log are serialized at the
/// LogPipeline level).
pub struct LogPipeline {
    codecs: CodecRegistry,
    logs: Mutex<BTreeMap<LogId, LogState>>,
}

impl LogPipeline {
    pub fn new(codecs: CodecRegistry) -> Self {
        Self {
            codecs,
            logs: Mutex::new(BTreeMap::new()),
        }
    }

    pub async fn create_log(&self, id: LogId, log_type: LogType, started_at: chrono::DateTime<chrono::Utc>) {
        self.logs.lock().await.insert(
            id,
            LogState {
                log_type,
                num_lines: 0,
                chunks: Vec::new(),
                step_started_at: started_at,
            },
        );
    }

    /// Append `text`, splitting on `\n`. Returns `(first_line_added,
    /// last_line_added)`.
    pub async fn append(&self, id: LogId, text: &str) -> Result<(u64, u64), LogError> {
        let mut logs = self.logs.lock().await;
        let state = logs.get_mut(&id).ok_or(LogError::NotFound(id))?;

        let first_line_added = state.num_lines;
        let lines: Vec<&str> = text.split('\n').collect();
        // `split` on a trailing `\n` yields a trailing empty segment;
        // callers append already-newline-terminated fragments, so drop
        // it rather than counting a phantom empty line.
        let lines: &[&str] = if lines.last() == Some(&"") {
            &lines[..lines.len() - 1]
        } else {
            &lines
        };

        let mut pending = String::new();
        let mut pending_lines: u64 = 0;
        let (codec_id, codec) = self.codecs.write_codec();

        let flush = |pending: &mut String, pending_lines: &mut u64, state: &mut LogState| {
            if *pending_lines == 0 {
                return;
            }
            let first = state.num_lines;
            let last = first + *pending_lines - 1;
            let raw = std::mem::take(pending).into_bytes();
            let (stored_id, stored_content) = if raw.len() < COMPRESS_THRESHOLD {
                (0u8, raw)
            } else {
                (codec_id, codec.encode(&raw))
            };
            state.chunks.push(StoredChunk {
                first_line: first,
                last_line: last,
                compressed_id: stored_id,
                content: stored_content,
            });
            state.num_lines = last + 1;
            *pending_lines = 0;
        };

        for line in lines {
            let mut line = line.to_string();
            if line.len() > MAX_CHUNK_SIZE {
                line.truncate(MAX_CHUNK_SIZE);
            }
            let would_be = pending.len() + line.len() + 1;
            if would_be > MAX_CHUNK_SIZE && pending_lines > 0 {
                flush(&mut pending, &mut pending_lines, state);
            }
            pending.push_str(&line);
            pending.push('\n');
            pending_lines += 1;
            if pending_lines >= MAX_CHUNK_LINES {
                flush(&mut pending, &mut pending_lines, state);
            }
        }
        flush(&mut pending, &mut pending_lines, state);

        let last_line_added = state.num_lines.saturating_sub(1);
        Ok((first_line_added, last_line_added))
    }

    pub async fn finish_log(&self, id: LogId) {
        if let Some(state) = self.logs.lock().await.get_mut(&id) {
            let _ = state; // finishing doesn't change stored data, only DataStore's `complete` flag
        }
    }

    /// Inclusive `[first, last]`, clamped to `num_lines`, joined with
    /// `\n`. Missing log or `first > last` return empty.
    pub async fn get_lines(&self, id: LogId, first: u64, last: u64) -> Result<String, LogError> {
        let logs = self.logs.lock().await;
        let Some(state) = logs.get(&id) else {
            return Ok(String::new());
        };
        if state.log_type == LogType::D || first > last || state.num_lines == 0 {
            return Ok(String::new());
        }
        let last = last.min(state.num_lines - 1);

        let mut out = String::new();
        for chunk in &state.chunks {
            if chunk.last_line < first || chunk.first_line > last {
                continue;
            }
            let codec = self
                .codecs
                .resolve(chunk.compressed_id)
                .ok_or(LogError::CompressionFormatUnavailable(chunk.compressed_id))?;
            let decoded = codec.decode(&chunk.content)?;
            let text = String::from_utf8_lossy(&decoded);
            for (offset, line) in text.lines().enumerate() {
                let line_no = chunk.first_line + offset as u64;
                if line_no >= first && line_no <= last {
                    out.push_str(line);
                    out.push('\n');
                }
            }
        }
        Ok(out)
    }

    /// Re-pack existing chunks into larger compressed chunks bounded
    /// by `MAX_CHUNK_LINES`. Idempotent.
    pub async fn compress(&self, id: LogId) -> Result<(), LogError> {
        let mut logs = self.logs.lock().await;
        let Some(state) = logs.get_mut(&id) else {
            return Ok(());
        };
        if state.chunks.len() <= 1 {
            return Ok(());
        }

        let (codec_id, codec) = self.codecs.write_codec();
        let mut repacked = Vec::new();
        let mut batch = String::new();
        let mut batch_first: Option<u64> = None;
        let mut batch_lines: u64 = 0;

        for chunk in &state.chunks {
            let decoder = self
                .codecs
                .resolve(chunk.compressed_id)
                .ok_or(LogError::CompressionFormatUnavailable(chunk.compressed_id))?;
            let decoded = decoder.decode(&chunk.content)?;
            let text = String::from_utf8_lossy(&decoded).into_owned();
            if batch_first.is_none() {
                batch_first = Some(chunk.first_line);
            }
            batch.push_str(&text);
            batch_lines += chunk.last_line - chunk.first_line + 1;

            if batch_lines >= MAX_CHUNK_LINES {
                let raw = std::mem::take(&mut batch).into_bytes();
                let first = batch_first.take().unwrap();
                let last = first + batch_lines - 1;
                let (stored_id, content) = if raw.len() < COMPRESS_THRESHOLD {
                    (0u8, raw)
                } else {
                    (codec_id, codec.encode(&raw))
                };
                repacked.push(StoredChunk {
                    first_line: first,
                    last_line: last,
                    compressed_id: stored_id,
                    content,
                });
                batch_lines = 0;
            }
        }
        if batch_lines > 0 {
            let raw = batch.into_bytes();
            let first = batch_first.unwrap();
            let last = first + batch_lines - 1;
            let (stored_id, content) = if raw.len() < COMPRESS_THRESHOLD {
                (0u8, raw)
            } else {
                (codec_id, codec.encode(&raw))
            };
            repacked.push(StoredChunk {
                first_line: first,
                last_line: last,
                compressed_id: stored_id,
                content,
            });
        }

        state.chunks = repacked;
        Ok(())
    }

    /// Drop all chunks of logs whose parent step started before
    /// `older_than`, flipping their type to deleted. Metadata
    /// (`num_lines`) is preserved.
    pub async fn delete_old(&self, older_than: chrono::DateTime<chrono::Utc>) {
        let mut logs = self.logs.lock().await;
        for state in logs.values_mut() {
            if state.step_started_at < older_than {
                state.chunks.clear();
                state.log_type = LogType::D;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn id(n: u64) -> LogId {
        LogId(n)
    }

    #[tokio::test]
    async fn append_and_get_lines_roundtrip() {
        let pipeline = LogPipeline::new(CodecRegistry::raw_only());
        pipeline.create_log(id(1), LogType::T, Utc::now()).await;
        let (first, last) = pipeline.append(id(1), "a\nb\nc\n").await.unwrap();
        assert_eq!((first, last), (0, 2));
        let text = pipeline.get_lines(id(1), 0, 2).await.unwrap();
        assert_eq!(text, "a\nb\nc\n");
    }

    #[tokio::test]
    async fn get_lines_clamps_to_num_lines() {
        let pipeline = LogPipeline::new(CodecRegistry::raw_only());
        pipeline.create_log(id(1), LogType::T, Utc::now()).await;
        pipeline.append(id(1), "a\nb\n").await.unwrap();
        let text = pipeline.get_lines(id(1), 0, 100).await.unwrap();
        assert_eq!(text, "a\nb\n");
    }

    #[tokio::test]
    async fn get_lines_first_after_last_is_empty() {
        let pipeline = LogPipeline::new(CodecRegistry::raw_only());
        pipeline.create_log(id(1), LogType::T, Utc::now()).await;
        pipeline.append(id(1), "a\nb\n").await.unwrap();
        let text = pipeline.get_lines(id(1), 1, 0).await.unwrap();
        assert_eq!(text, "");
    }

    #[tokio::test]
    async fn oversized_single_line_is_truncated() {
        let pipeline = LogPipeline::new(CodecRegistry::raw_only());
        pipeline.create_log(id(1), LogType::T, Utc::now()).await;
        let long_line = "x".repeat(MAX_CHUNK_SIZE * 2);
        pipeline.append(id(1), &format!("{long_line}\n")).await.unwrap();
        let text = pipeline.get_lines(id(1), 0, 0).await.unwrap();
        assert!(text.len() <= MAX_CHUNK_SIZE + 1);
        assert_eq!(text.trim_end_matches('\n').len(), MAX_CHUNK_SIZE);
    }

    #[tokio::test]
    async fn compress_is_idempotent() {
        let pipeline = LogPipeline::new(CodecRegistry::raw_only());
        pipeline.create_log(id(1), LogType::T, Utc::now()).await;
        for i in 0..10 {
            pipeline.append(id(1), &format!("line{i}\n")).await.unwrap();
        }
        let before = pipeline.get_lines(id(1), 0, 9).await.unwrap();
        pipeline.compress(id(1)).await.unwrap();
        let after_first = pipeline.get_lines(id(1), 0, 9).await.unwrap();
        pipeline.compress(id(1)).await.unwrap();
        let after_second = pipeline.get_lines(id(1), 0, 9).await.unwrap();
        assert_eq!(before, after_first);
        assert_eq!(after_first, after_second);
    }

    #[tokio::test]
    async fn gzip_codec_roundtrips_through_get_lines() {
        let registry = CodecRegistry::raw_only().with_codec(Arc::new(GzipCodec)).set_default_write_codec(1);
        let pipeline = LogPipeline::new(registry);
        pipeline.create_log(id(1), LogType::T, Utc::now()).await;
        let big_line = "y".repeat(COMPRESS_THRESHOLD * 2);
        pipeline.append(id(1), &format!("{big_line}\n")).await.unwrap();
        let text = pipeline.get_lines(id(1), 0, 0).await.unwrap();
        assert_eq!(text, format!("{big_line}\n"));
    }

    #[tokio::test]
    async fn missing_codec_on_read_is_surfaced_as_unavailable() {
        let writer = CodecRegistry::raw_only().with_codec(Arc::new(GzipCodec)).set_default_write_codec(1);
        let pipeline = LogPipeline::new(writer);
        pipeline.create_log(id(1), LogType::T, Utc::now()).await;
        let big_line = "z".repeat(COMPRESS_THRESHOLD * 2);
        pipeline.append(id(1), &format!("{big_line}\n")).await.unwrap();

        // Simulate a process that only has the raw codec linked in by
        // swapping the pipeline's registry for one missing gzip.
        let stripped = CodecRegistry::raw_only();
        let reader = LogPipeline { codecs: stripped, logs: pipeline.logs };
        let result = reader.get_lines(id(1), 0, 0).await;
        assert!(matches!(result, Err(LogError::CompressionFormatUnavailable(1))));
    }

    #[tokio::test]
    async fn delete_old_preserves_metadata_but_empties_lines() {
        let pipeline = LogPipeline::new(CodecRegistry::raw_only());
        let old = Utc::now() - chrono::Duration::days(1);
        pipeline.create_log(id(1), LogType::T, old).await;
        pipeline.append(id(1), "a\nb\n").await.unwrap();

        pipeline.delete_old(Utc::now()).await;

        let text = pipeline.get_lines(id(1), 0, 1).await.unwrap();
        assert_eq!(text, "");
        let logs = pipeline.logs.lock().await;
        let state = logs.get(&id(1)).unwrap();
        assert_eq!(state.log_type, LogType::D);
        assert_eq!(state.num_lines, 2);
    }
}
