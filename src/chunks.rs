//! 分片存储：每个上传会话一个目录，每个分片一个按序号补零命名的文件。

use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tracing::warn;

use crate::atomic::AtomicFile;
use crate::config::CHUNK_INDEX_WIDTH;
use crate::validate::UploadId;

/// 分片目录快照，供过期清理使用。
#[derive(Debug)]
pub struct SessionDir {
    pub name: String,
    pub path: PathBuf,
    pub modified: Option<SystemTime>,
}

/// 一次目录枚举的结果；无法读取的条目单独计数，不影响其余条目。
#[derive(Debug, Default)]
pub struct SessionListing {
    pub sessions: Vec<SessionDir>,
    pub unreadable: usize,
}

#[derive(Clone, Debug)]
pub struct ChunkStore {
    root: PathBuf,
}

impl ChunkStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, upload_id: &UploadId) -> PathBuf {
        self.root.join(upload_id.as_str())
    }

    pub fn chunk_path(&self, upload_id: &UploadId, index: u64) -> PathBuf {
        self.session_dir(upload_id).join(chunk_file_name(index))
    }

    /// 幂等创建会话目录。
    pub async fn ensure_session_dir(&self, upload_id: &UploadId) -> io::Result<PathBuf> {
        let dir = self.session_dir(upload_id);
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    pub async fn session_exists(&self, upload_id: &UploadId) -> io::Result<bool> {
        match fs::metadata(self.session_dir(upload_id)).await {
            Ok(metadata) => Ok(metadata.is_dir()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// 为分片打开一个临时文件；`finalize` 之后才以序号文件名出现（覆盖旧内容）。
    pub async fn create_chunk(&self, upload_id: &UploadId, index: u64) -> io::Result<AtomicFile> {
        self.ensure_session_dir(upload_id).await?;
        AtomicFile::new(&self.chunk_path(upload_id, index)).await
    }

    #[cfg(test)]
    pub async fn write_chunk(&self, upload_id: &UploadId, index: u64, bytes: &[u8]) -> io::Result<()> {
        use tokio::io::AsyncWriteExt;

        let mut atomic = self.create_chunk(upload_id, index).await?;
        atomic.file_mut().write_all(bytes).await?;
        atomic.finalize().await
    }

    /// 已落盘的分片序号（升序）；会话不存在时为空。
    pub async fn list_indices(&self, upload_id: &UploadId) -> io::Result<Vec<u64>> {
        let mut dir = match fs::read_dir(self.session_dir(upload_id)).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let mut indices = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            if let Some(index) = parse_chunk_file_name(&entry.file_name().to_string_lossy()) {
                indices.push(index);
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }

    /// 分片文件数量，即完整性判断的依据。
    pub async fn chunk_count(&self, upload_id: &UploadId) -> io::Result<usize> {
        Ok(self.list_indices(upload_id).await?.len())
    }

    pub async fn remove_session(&self, upload_id: &UploadId) -> io::Result<()> {
        match fs::remove_dir_all(self.session_dir(upload_id)).await {
            Err(err) if err.kind() != ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }

    /// 枚举所有会话目录；根目录不存在时为空。
    pub async fn sessions(&self) -> io::Result<SessionListing> {
        let mut listing = SessionListing::default();
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(listing),
            Err(err) => return Err(err),
        };
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            match session_entry(name, entry.path()).await {
                Ok(Some(session)) => listing.sessions.push(session),
                Ok(None) => {}
                Err(err) => {
                    warn!(path = ?entry.path(), error = %err, "failed to stat chunk directory");
                    listing.unreadable += 1;
                }
            }
        }
        Ok(listing)
    }
}

/// 读取单个目录项；合并过程中被删除的目录视为不存在。
async fn session_entry(name: String, path: PathBuf) -> io::Result<Option<SessionDir>> {
    let metadata = match fs::symlink_metadata(&path).await {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    if !metadata.is_dir() {
        return Ok(None);
    }
    Ok(Some(SessionDir {
        name,
        path,
        modified: metadata.modified().ok(),
    }))
}

pub fn chunk_file_name(index: u64) -> String {
    format!("{index:0width$}", width = CHUNK_INDEX_WIDTH)
}

fn parse_chunk_file_name(name: &str) -> Option<u64> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}
