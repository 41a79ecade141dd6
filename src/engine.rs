//! 断点续传上传引擎：分片写入、完整性判断、合并与幂等确认。

use axum::body::Bytes;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::pin::pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::artifacts::{ArtifactStore, download_path};
use crate::assembly::{Assembler, MergeError};
use crate::chunks::ChunkStore;
use crate::config::MissingChunkPolicy;
use crate::locking::{LockManager, LockTimeout};
use crate::scan::ContentScanner;
use crate::validate::{UploadId, parse_chunk_index, parse_filename, parse_total_chunks};

#[derive(Clone, Debug)]
pub struct UploadConfig {
    pub upload_dir: PathBuf,
    pub chunk_dir: PathBuf,
    pub retention: Duration,
    pub lock_wait: Duration,
    pub missing_chunks: MissingChunkPolicy,
}

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("{0}")]
    Validation(String),
    #[error("no file or chunks found")]
    NotFound,
    #[error("incomplete upload: {received}/{expected} chunks uploaded")]
    Incomplete { received: u64, expected: u64 },
    #[error("failed to merge chunks: {0}")]
    Merge(#[source] MergeError),
    #[error("content rejected: {0}")]
    ContentRejected(String),
    #[error("upload is busy")]
    Busy,
    #[error("failed to read chunk body: {0}")]
    Body(#[source] BoxError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<LockTimeout> for UploadError {
    fn from(_: LockTimeout) -> Self {
        UploadError::Busy
    }
}

/// 一个经过校验的分片写入请求；分片内容随后以流的形式传入。
#[derive(Debug)]
pub struct ChunkUpload {
    pub upload_id: UploadId,
    pub index: u64,
    pub total_chunks: u64,
    pub filename: String,
}

impl ChunkUpload {
    /// 在触碰文件系统之前校验全部字段。
    pub fn parse(
        upload_id: Option<&str>,
        chunk_index: Option<&str>,
        total_chunks: Option<&str>,
        filename: Option<&str>,
    ) -> Result<Self, UploadError> {
        let upload_id = UploadId::parse(upload_id)?;
        let total_chunks = parse_total_chunks(total_chunks)?;
        let index = parse_chunk_index(chunk_index, total_chunks)?;
        let filename = parse_filename(filename)?;
        Ok(Self {
            upload_id,
            index,
            total_chunks,
            filename,
        })
    }
}

/// 一个经过校验的确认请求。
#[derive(Debug)]
pub struct FinalizeRequest {
    pub upload_id: UploadId,
    pub filename: String,
    pub total_chunks: u64,
}

impl FinalizeRequest {
    pub fn parse(
        upload_id: Option<&str>,
        filename: Option<&str>,
        total_chunks: Option<&str>,
    ) -> Result<Self, UploadError> {
        Ok(Self {
            upload_id: UploadId::parse(upload_id)?,
            filename: parse_filename(filename)?,
            total_chunks: parse_total_chunks(total_chunks)?,
        })
    }
}

#[derive(Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ChunkOutcome {
    Partial { received_chunk: u64 },
    Completed { filename: String },
}

#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct Finalized {
    pub filename: String,
    pub file_path: String,
    pub file_size: u64,
}

/// 最近完成合并的会话，用于回答迟到的重复分片。
#[derive(Debug)]
pub(crate) struct Completion {
    pub filename: String,
    pub at: SystemTime,
}

pub struct UploadEngine {
    pub(crate) config: UploadConfig,
    pub(crate) chunks: ChunkStore,
    pub(crate) artifacts: ArtifactStore,
    pub(crate) locks: LockManager,
    pub(crate) completed: Mutex<HashMap<String, Completion>>,
    scanner: Arc<dyn ContentScanner>,
}

impl UploadEngine {
    pub fn new(config: UploadConfig, scanner: Arc<dyn ContentScanner>) -> Self {
        Self {
            chunks: ChunkStore::new(config.chunk_dir.clone()),
            artifacts: ArtifactStore::new(config.upload_dir.clone()),
            locks: LockManager::new(),
            completed: Mutex::new(HashMap::new()),
            scanner,
            config,
        }
    }

    pub async fn ensure_dirs(&self) -> io::Result<()> {
        self.chunks.ensure_root().await?;
        self.artifacts.ensure_root().await
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    fn assembler(&self) -> Assembler<'_> {
        Assembler {
            chunks: &self.chunks,
            artifacts: &self.artifacts,
            scanner: self.scanner.as_ref(),
            missing_chunks: self.config.missing_chunks,
        }
    }

    /// 该会话是否已合并为 `filename` 且文件仍然存在。
    async fn already_assembled(
        &self,
        upload_id: &UploadId,
        filename: &str,
    ) -> Result<bool, UploadError> {
        let recorded = {
            let completed = self.completed.lock().await;
            completed
                .get(upload_id.as_str())
                .is_some_and(|entry| entry.filename == filename)
        };
        if !recorded {
            return Ok(false);
        }
        if self.artifacts.metadata(filename).await?.is_some() {
            return Ok(true);
        }
        self.completed.lock().await.remove(upload_id.as_str());
        Ok(false)
    }

    async fn record_completion(&self, upload_id: &UploadId, filename: &str) {
        self.completed.lock().await.insert(
            upload_id.as_str().to_string(),
            Completion {
                filename: filename.to_string(),
                at: SystemTime::now(),
            },
        );
    }

    /// 已收到的分片序号，未知会话返回空列表。
    pub async fn check_chunks(&self, upload_id: &UploadId) -> Result<Vec<u64>, UploadError> {
        let indices = self.chunks.list_indices(upload_id).await?;
        debug!(upload_id = %upload_id, count = indices.len(), "check chunks");
        Ok(indices)
    }

    /// 把分片内容流式写入磁盘；若分片已齐则在独占锁内完成合并。
    pub async fn upload_chunk<S, E>(
        &self,
        chunk: ChunkUpload,
        body: S,
    ) -> Result<ChunkOutcome, UploadError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Into<BoxError>,
    {
        let ChunkUpload {
            upload_id,
            index,
            total_chunks,
            filename,
        } = chunk;
        let wait = self.config.lock_wait;

        {
            let _shared = self.locks.shared(upload_id.as_str(), wait).await?;
            if self.already_assembled(&upload_id, &filename).await? {
                debug!(upload_id = %upload_id, index, "late chunk for assembled upload");
                return Ok(ChunkOutcome::Completed { filename });
            }
            let written = self.receive_chunk(&upload_id, index, body).await?;
            debug!(upload_id = %upload_id, index, bytes = written, "chunk saved");
        }
        info!(upload_id = %upload_id, index, total_chunks, filename, "chunk received");

        let _exclusive = self.locks.exclusive(upload_id.as_str(), wait).await?;
        // 另一个请求可能已经消费了分片目录
        if self.already_assembled(&upload_id, &filename).await? {
            return Ok(ChunkOutcome::Completed { filename });
        }

        let received = self.chunks.chunk_count(&upload_id).await? as u64;
        if received != total_chunks {
            return Ok(ChunkOutcome::Partial {
                received_chunk: index,
            });
        }

        self.assembler()
            .assemble(&upload_id, &filename, total_chunks)
            .await?;
        self.record_completion(&upload_id, &filename).await;
        Ok(ChunkOutcome::Completed { filename })
    }

    async fn receive_chunk<S, E>(
        &self,
        upload_id: &UploadId,
        index: u64,
        body: S,
    ) -> Result<u64, UploadError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Into<BoxError>,
    {
        let mut body = pin!(body);
        let mut atomic = self.chunks.create_chunk(upload_id, index).await?;
        let mut written = 0u64;
        while let Some(piece) = body.next().await {
            let result = match piece {
                Ok(bytes) => atomic
                    .file_mut()
                    .write_all(&bytes)
                    .await
                    .map(|()| bytes.len() as u64)
                    .map_err(UploadError::from),
                Err(err) => Err(UploadError::Body(err.into())),
            };
            match result {
                Ok(len) => written += len,
                Err(err) => {
                    atomic.cleanup().await;
                    return Err(err);
                }
            }
        }
        atomic.finalize().await?;
        Ok(written)
    }

    /// 幂等确认：已合并则直接成功，分片齐全则补做合并，否则报告未完成或不存在。
    pub async fn finalize(&self, request: FinalizeRequest) -> Result<Finalized, UploadError> {
        let FinalizeRequest {
            upload_id,
            filename,
            total_chunks,
        } = request;
        let _exclusive = self
            .locks
            .exclusive(upload_id.as_str(), self.config.lock_wait)
            .await?;

        if let Some(metadata) = self.artifacts.metadata(&filename).await? {
            info!(filename, size = metadata.len(), "finalization confirmed");
            return Ok(finalized(filename, metadata.len()));
        }

        if !self.chunks.session_exists(&upload_id).await? {
            info!(upload_id = %upload_id, filename, "finalize found no file or chunks");
            return Err(UploadError::NotFound);
        }

        let received = self.chunks.chunk_count(&upload_id).await? as u64;
        if received != total_chunks {
            return Err(UploadError::Incomplete {
                received,
                expected: total_chunks,
            });
        }

        info!(upload_id = %upload_id, filename, "merging chunks on finalize");
        let assembled = self
            .assembler()
            .assemble(&upload_id, &filename, total_chunks)
            .await?;
        self.record_completion(&upload_id, &filename).await;
        Ok(finalized(filename, assembled.size))
    }
}

fn finalized(filename: String, file_size: u64) -> Finalized {
    Finalized {
        file_path: download_path(&filename),
        filename,
        file_size,
    }
}
