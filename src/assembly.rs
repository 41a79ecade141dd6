//! 分片合并：按序号拼接到临时文件，扫描通过后原子落位，再删除分片目录。

use std::io::{self, ErrorKind};
use tokio::fs::File;
use tracing::{info, warn};

use crate::artifacts::ArtifactStore;
use crate::atomic::AtomicFile;
use crate::chunks::ChunkStore;
use crate::config::MissingChunkPolicy;
use crate::engine::UploadError;
use crate::scan::{ContentScanner, Verdict};
use crate::validate::UploadId;

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("chunk {index} is missing")]
    MissingChunk { index: u64 },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// 一次成功合并的结果。
#[derive(Debug)]
pub struct Assembled {
    pub size: u64,
}

pub struct Assembler<'a> {
    pub chunks: &'a ChunkStore,
    pub artifacts: &'a ArtifactStore,
    pub scanner: &'a dyn ContentScanner,
    pub missing_chunks: MissingChunkPolicy,
}

impl Assembler<'_> {
    /// 合并 `0..total_chunks` 到 `filename`。调用方必须持有该会话的独占锁。
    pub async fn assemble(
        &self,
        upload_id: &UploadId,
        filename: &str,
        total_chunks: u64,
    ) -> Result<Assembled, UploadError> {
        self.artifacts.ensure_root().await.map_err(merge_failed)?;
        let target = self.artifacts.path_for(filename);
        let mut atomic = AtomicFile::new(&target).await.map_err(merge_failed)?;

        let concat = self.concat(upload_id, total_chunks, &mut atomic).await;
        let (size, skipped) = match concat {
            Ok(value) => value,
            Err(err) => {
                atomic.cleanup().await;
                warn!(upload_id = %upload_id, filename, error = %err, "merge failed");
                return Err(UploadError::Merge(err));
            }
        };
        if let Err(err) = atomic.sync().await {
            atomic.cleanup().await;
            return Err(merge_failed(err));
        }

        let verdict = match self.scanner.scan(atomic.temp_path()).await {
            Ok(verdict) => verdict,
            Err(err) => {
                warn!(
                    upload_id = %upload_id,
                    scanner = self.scanner.name(),
                    error = %err,
                    "content scan failed, rejecting"
                );
                Verdict::Reject(format!("content scan failed: {err}"))
            }
        };
        if let Verdict::Reject(reason) = verdict {
            atomic.cleanup().await;
            self.discard_chunks(upload_id).await;
            warn!(upload_id = %upload_id, filename, reason, "assembled file rejected");
            return Err(UploadError::ContentRejected(reason));
        }

        atomic.finalize().await.map_err(merge_failed)?;
        self.discard_chunks(upload_id).await;

        if !skipped.is_empty() {
            warn!(upload_id = %upload_id, filename, ?skipped, "assembled with missing chunks");
        }
        info!(upload_id = %upload_id, filename, size, total_chunks, "file assembled");
        Ok(Assembled { size })
    }

    async fn concat(
        &self,
        upload_id: &UploadId,
        total_chunks: u64,
        atomic: &mut AtomicFile,
    ) -> Result<(u64, Vec<u64>), MergeError> {
        let mut size = 0;
        let mut skipped = Vec::new();
        for index in 0..total_chunks {
            let path = self.chunks.chunk_path(upload_id, index);
            let mut part = match File::open(&path).await {
                Ok(file) => file,
                Err(err) if err.kind() == ErrorKind::NotFound => match self.missing_chunks {
                    MissingChunkPolicy::Fail => return Err(MergeError::MissingChunk { index }),
                    MissingChunkPolicy::Skip => {
                        skipped.push(index);
                        continue;
                    }
                },
                Err(err) => return Err(err.into()),
            };
            size += tokio::io::copy(&mut part, atomic.file_mut()).await?;
        }
        Ok((size, skipped))
    }

    async fn discard_chunks(&self, upload_id: &UploadId) {
        if let Err(err) = self.chunks.remove_session(upload_id).await {
            warn!(upload_id = %upload_id, error = %err, "failed to remove chunk directory");
        }
    }
}

fn merge_failed(err: io::Error) -> UploadError {
    UploadError::Merge(MergeError::Io(err))
}
