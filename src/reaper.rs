//! 过期上传会话清理。

use serde::Serialize;
use std::io::{self, ErrorKind};
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::chunks::SessionDir;
use crate::config::DEFAULT_RETENTION_SECS;
use crate::engine::UploadEngine;

/// 一次清理的结果；单个目录失败只计数，不中断整轮清理。
#[derive(Debug, Default, Serialize)]
pub struct ReapReport {
    pub removed: Vec<String>,
    pub failed: usize,
    pub skipped: usize,
    pub kept: usize,
}

impl UploadEngine {
    pub async fn reap(&self) -> ReapReport {
        self.reap_at(SystemTime::now()).await
    }

    /// 删除修改时间早于 `now - retention` 的分片目录。正在写入或合并的会话跳过。
    pub async fn reap_at(&self, now: SystemTime) -> ReapReport {
        let mut report = ReapReport::default();
        let retention = self.config.retention;
        if !retention.is_zero() {
            self.sweep_sessions(now, retention, &mut report).await;
        }

        let forgotten = self.forget_completions(now, retention).await;
        let pruned = self.locks.prune_idle().await;
        debug!(
            removed = report.removed.len(),
            failed = report.failed,
            skipped = report.skipped,
            forgotten,
            pruned,
            "stale upload sweep finished"
        );
        report
    }

    async fn sweep_sessions(&self, now: SystemTime, retention: Duration, report: &mut ReapReport) {
        self.sweep_sessions_with(now, retention, report, remove_dir).await;
    }

    async fn sweep_sessions_with<F, Fut>(
        &self,
        now: SystemTime,
        retention: Duration,
        report: &mut ReapReport,
        remove: F,
    ) where
        F: Fn(PathBuf) -> Fut,
        Fut: Future<Output = io::Result<()>>,
    {
        let listing = match self.chunks.sessions().await {
            Ok(listing) => listing,
            Err(err) => {
                warn!(
                    root = ?self.chunks.root_path(),
                    error = %err,
                    "failed to list chunk directories"
                );
                report.failed += 1;
                return;
            }
        };
        report.failed += listing.unreadable;
        for session in listing.sessions {
            self.reap_session(session, now, retention, report, &remove).await;
        }
    }

    async fn reap_session<F, Fut>(
        &self,
        session: SessionDir,
        now: SystemTime,
        retention: Duration,
        report: &mut ReapReport,
        remove: &F,
    ) where
        F: Fn(PathBuf) -> Fut,
        Fut: Future<Output = io::Result<()>>,
    {
        if stale_age(session.modified, now, retention).is_none() {
            report.kept += 1;
            return;
        }
        let Some(_guard) = self.locks.try_exclusive(&session.name).await else {
            debug!(upload_id = session.name, "stale upload is busy, skipping");
            report.skipped += 1;
            return;
        };

        // 列目录之后可能又写入了分片，持锁后重新读取修改时间
        let modified = match fs::metadata(&session.path).await {
            Ok(metadata) => metadata.modified().ok(),
            Err(err) if err.kind() == ErrorKind::NotFound => return,
            Err(err) => {
                warn!(path = ?session.path, error = %err, "failed to stat stale upload");
                report.failed += 1;
                return;
            }
        };
        let Some(age) = stale_age(modified, now, retention) else {
            debug!(upload_id = session.name, "upload touched since listing, keeping");
            report.kept += 1;
            return;
        };

        match remove(session.path.clone()).await {
            Ok(()) => {
                info!(
                    upload_id = session.name,
                    age_hours = format!("{:.1}", age.as_secs_f64() / 3600.0),
                    "removed stale upload"
                );
                report.removed.push(session.name);
            }
            Err(err) => {
                warn!(path = ?session.path, error = %err, "failed to remove stale upload");
                report.failed += 1;
            }
        }
    }

    /// 遗忘早于保留期的合并记录；关闭清理时使用默认保留期。
    async fn forget_completions(&self, now: SystemTime, retention: Duration) -> usize {
        let keep_for = if retention.is_zero() {
            Duration::from_secs(DEFAULT_RETENTION_SECS)
        } else {
            retention
        };
        let mut completed = self.completed.lock().await;
        let before = completed.len();
        completed.retain(|_, entry| {
            now.duration_since(entry.at)
                .map(|age| age <= keep_for)
                .unwrap_or(true)
        });
        before - completed.len()
    }
}

/// 超过保留期（严格大于）时返回年龄。
fn stale_age(modified: Option<SystemTime>, now: SystemTime, retention: Duration) -> Option<Duration> {
    modified
        .and_then(|modified| now.duration_since(modified).ok())
        .filter(|age| *age > retention)
}

async fn remove_dir(path: PathBuf) -> io::Result<()> {
    fs::remove_dir_all(path).await
}
