//! 过期上传清理的后台任务。

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::engine::UploadEngine;

/// 启动时清理一次，随后按固定周期清理；周期为 0 时只做启动清理。
pub async fn spawn_background_tasks(engine: Arc<UploadEngine>, reap_interval: Duration) {
    let report = engine.reap().await;
    info!(
        removed = report.removed.len(),
        failed = report.failed,
        "initial cleanup of stale chunks completed"
    );

    if reap_interval.is_zero() {
        warn!("periodic stale upload cleanup disabled");
        return;
    }

    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + reap_interval, reap_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let report = engine.reap().await;
            if report.failed > 0 {
                warn!(failed = report.failed, "stale upload cleanup had failures");
            }
        }
    });
}
