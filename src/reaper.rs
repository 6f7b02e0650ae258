//! 后台清理：回收长时间无活动的上传会话。

use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::manager::UploadManager;

impl UploadManager {
    /// 回收在 `now` 时刻空闲超过配置时长的会话并删除 spool，返回回收数量。
    pub async fn sweep_idle(&self, now: Instant) -> usize {
        let evicted = self.store.take_idle(self.config.idle_timeout, now).await;
        for session in &evicted {
            self.discard(session).await;
            info!(
                upload_id = session.id,
                owner = session.owner,
                started_at = %session.created_at,
                "evicted idle upload session"
            );
        }
        evicted.len()
    }
}

/// 启动空闲会话清理任务，`shutdown` 取消后退出。
pub fn spawn_reaper(manager: Arc<UploadManager>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(manager.config().sweep_interval);
        // first tick fires immediately
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("upload reaper stopped");
                    break;
                }
                _ = interval.tick() => {
                    let evicted = manager.sweep_idle(Instant::now()).await;
                    if evicted > 0 {
                        info!(evicted, "idle upload sweep finished");
                    }
                }
            }
        }
    })
}
