//! 合并完成文件的扁平目录：查找、列表与路径解析。

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::Metadata;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;

use crate::config::{DOWNLOAD_ROUTE_PREFIX, FILENAME_MAX_LEN};

#[derive(Clone, Debug)]
pub struct ArtifactStore {
    root: PathBuf,
}

/// 已完成文件的列表条目。
#[derive(Debug, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    pub modified: Option<String>,
}

impl ArtifactStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// 清洗后的文件名在目录中的路径，调用方保证名称不含路径成分。
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// 目标为普通文件时返回元数据，不存在时为 None。
    pub async fn metadata(&self, name: &str) -> io::Result<Option<Metadata>> {
        match fs::symlink_metadata(self.path_for(name)).await {
            Ok(metadata) if metadata.is_file() => Ok(Some(metadata)),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// 列出已完成文件（按名称排序），跳过临时文件与非文件条目。
    pub async fn list(&self) -> io::Result<Vec<FileEntry>> {
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || name.chars().count() > FILENAME_MAX_LEN {
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            entries.push(FileEntry {
                name,
                size: metadata.len(),
                modified: metadata.modified().ok().map(format_timestamp),
            });
        }
        entries.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        Ok(entries)
    }
}

/// 下载地址（相对路径）。
pub fn download_path(name: &str) -> String {
    format!("{DOWNLOAD_ROUTE_PREFIX}/{name}")
}

fn format_timestamp(timestamp: SystemTime) -> String {
    let datetime: DateTime<Utc> = timestamp.into();
    datetime.format("%Y-%m-%d %H:%M:%S").to_string()
}
