//! 临时写入与原子替换的辅助方法。

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use uuid::Uuid;

/// 与目标同目录的临时文件，写完后通过 rename 原子落位。
///
/// 临时文件名以 `.` 开头，分片计数与文件列表都会忽略它。
/// 名字长度固定，与目标文件名无关，目标名达到 255 字节时也不会超出 NAME_MAX。
pub struct AtomicFile {
    target: PathBuf,
    temp_path: PathBuf,
    file: File,
}

impl AtomicFile {
    /// 在目标路径同目录创建临时文件。
    pub async fn new(target: &Path) -> io::Result<Self> {
        let parent = target.parent().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "target has no parent directory")
        })?;
        let temp_path = parent.join(format!(".tmp.{}", Uuid::new_v4().simple()));
        let file = File::create(&temp_path).await?;
        Ok(Self {
            target: target.to_path_buf(),
            temp_path,
            file,
        })
    }

    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// 临时文件路径，rename 之前可供外部读取（例如内容扫描）。
    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// 刷盘但不落位。
    pub async fn sync(&mut self) -> io::Result<()> {
        self.file.sync_all().await
    }

    /// 放弃并清理临时文件。
    pub async fn cleanup(self) {
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path).await;
    }

    /// 同步并原子替换目标文件。
    pub async fn finalize(self) -> io::Result<()> {
        self.file.sync_all().await?;
        drop(self.file);

        if let Err(err) = fs::rename(&self.temp_path, &self.target).await {
            #[cfg(windows)]
            {
                if fs::remove_file(&self.target).await.is_ok() {
                    return fs::rename(&self.temp_path, &self.target).await;
                }
            }
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(err);
        }

        if let Some(parent) = self.target.parent() {
            let _ = sync_dir(parent).await;
        }

        Ok(())
    }
}

#[cfg(unix)]
async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}

#[cfg(not(unix))]
async fn sync_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::AtomicFile;
    use tempfile::tempdir;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn finalize_replaces_target() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("out.bin");
        std::fs::write(&target, b"old").expect("seed target");

        let mut atomic = AtomicFile::new(&target).await.expect("atomic");
        atomic.file_mut().write_all(b"new").await.expect("write");
        atomic.finalize().await.expect("finalize");

        assert_eq!(std::fs::read(&target).expect("read"), b"new");
        assert_eq!(std::fs::read_dir(temp.path()).expect("list").count(), 1);
    }

    #[tokio::test]
    async fn finalize_accepts_longest_allowed_name() {
        let temp = tempdir().expect("tempdir");
        let name = format!("{}.bin", "a".repeat(251));
        let target = temp.path().join(&name);

        let mut atomic = AtomicFile::new(&target).await.expect("atomic");
        atomic.file_mut().write_all(b"long").await.expect("write");
        atomic.finalize().await.expect("finalize");

        assert_eq!(name.len(), 255);
        assert_eq!(std::fs::read(&target).expect("read"), b"long");
    }

    #[tokio::test]
    async fn cleanup_leaves_no_target() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("out.bin");

        let mut atomic = AtomicFile::new(&target).await.expect("atomic");
        atomic.file_mut().write_all(b"partial").await.expect("write");
        atomic.cleanup().await;

        assert!(!target.exists());
        assert_eq!(std::fs::read_dir(temp.path()).expect("list").count(), 0);
    }
}
