//! 上传会话管理器：初始化、状态查询与中止。

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::UploadError;
use crate::records::{FileRepository, Notifier};
use crate::session::{SessionStore, UploadSession};
use crate::storage::Storage;

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub max_total_size: u64,
    pub max_concurrent: u64,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub default_max_downloads: u32,
    pub default_expiry_days: u32,
    pub large_upload_threshold: u64,
}

/// 分片与状态查询返回的进度快照。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub bytes_received: u64,
    pub total_size: u64,
    pub next_chunk_index: u64,
    pub complete: bool,
}

impl UploadProgress {
    pub fn new(bytes_received: u64, total_size: u64, next_chunk_index: u64) -> Self {
        Self {
            bytes_received,
            total_size,
            next_chunk_index,
            complete: bytes_received >= total_size,
        }
    }
}

/// 持有会话表与各上传操作依赖的协作者。
/// 启动时构建一次，由处理器与清理任务共享。
pub struct UploadManager {
    pub(crate) store: SessionStore,
    pub(crate) storage: Arc<Storage>,
    pub(crate) repository: Arc<dyn FileRepository>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) config: UploadConfig,
}

impl UploadManager {
    pub fn new(
        storage: Arc<Storage>,
        repository: Arc<dyn FileRepository>,
        notifier: Arc<dyn Notifier>,
        config: UploadConfig,
    ) -> Self {
        Self {
            store: SessionStore::new(),
            storage,
            repository,
            notifier,
            config,
        }
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// 创建上传会话并打开 spool 文件，返回 upload id。
    pub async fn init(
        &self,
        owner: &str,
        name: &str,
        total_size: u64,
        metadata: HashMap<String, String>,
    ) -> Result<String, UploadError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(UploadError::Validation("name is required".into()));
        }
        if self.config.max_total_size > 0 && total_size > self.config.max_total_size {
            return Err(UploadError::Validation("upload size exceeds limit".into()));
        }
        if self.config.max_concurrent > 0
            && self.store.len().await as u64 >= self.config.max_concurrent
        {
            return Err(UploadError::TooManySessions);
        }

        let upload_id = Uuid::new_v4().to_string();
        let file = self.storage.create_spool(&upload_id).await?;
        let session = UploadSession::new(
            upload_id.clone(),
            owner.to_string(),
            name.to_string(),
            total_size,
            metadata,
            file,
        );
        if let Err(err) = self.store.create(session, self.config.max_concurrent).await {
            if let Err(cleanup) = self.storage.remove_spool(&upload_id).await {
                warn!(upload_id, error = %cleanup, "failed to remove rejected spool");
            }
            return Err(err);
        }

        info!(upload_id, owner, name, total_size, "init upload");
        Ok(upload_id)
    }

    /// 查询会话进度，仅限会话所有者。
    pub async fn status(&self, upload_id: &str, owner: &str) -> Result<UploadProgress, UploadError> {
        let session = self.owned_session(upload_id, owner).await?;
        let state = session.lock().await;
        if state.is_closed() {
            return Err(UploadError::NotFound);
        }
        Ok(UploadProgress::new(
            state.bytes_received,
            session.total_size,
            state.next_index,
        ))
    }

    /// 中止上传：移除会话并删除 spool 文件。
    pub async fn abort(&self, upload_id: &str, owner: &str) -> Result<(), UploadError> {
        self.owned_session(upload_id, owner).await?;
        let session = self
            .store
            .take_and_remove(upload_id)
            .await
            .ok_or(UploadError::NotFound)?;
        self.discard(&session).await;
        info!(upload_id, owner, "upload aborted");
        Ok(())
    }

    /// 查找会话并校验所有者；不修改任何状态。
    pub(crate) async fn owned_session(
        &self,
        upload_id: &str,
        owner: &str,
    ) -> Result<Arc<UploadSession>, UploadError> {
        let session = self
            .store
            .get(upload_id)
            .await
            .ok_or(UploadError::NotFound)?;
        if !session.is_owned_by(owner) {
            warn!(upload_id, owner, "upload owner mismatch");
            return Err(UploadError::Forbidden);
        }
        Ok(session)
    }

    /// 关闭已移出会话表的会话句柄并删除其 spool 文件。
    pub(crate) async fn discard(&self, session: &UploadSession) {
        let mut state = session.lock().await;
        drop(state.file.take());
        if let Err(err) = self.storage.remove_spool(&session.id).await {
            warn!(upload_id = session.id, error = %err, "failed to remove spool file");
        }
    }
}
