//! 文件记录持久化、审计日志与通知的外部协作接口。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::info;

/// 已完成上传的持久化元数据。
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: String,
    pub owner: String,
    pub name: String,
    pub content_type: String,
    pub size: u64,
    pub sha256: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_downloads: Option<u32>,
    pub download_count: u32,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub actor: String,
    pub action: String,
    pub target: String,
    pub details: String,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct LargeUploadNotice {
    pub owner: String,
    pub name: String,
    pub size: u64,
    pub file_id: String,
    pub sha256: String,
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct RepositoryError(pub String);

#[async_trait]
pub trait FileRepository: Send + Sync {
    async fn save_file_record(&self, record: &FileRecord) -> Result<(), RepositoryError>;

    /// `owner` 当前已用存储，单位 MiB。
    async fn owner_storage_used_mb(&self, owner: &str) -> Result<f64, RepositoryError>;

    async fn update_owner_storage_usage(
        &self,
        owner: &str,
        new_total_mb: f64,
    ) -> Result<(), RepositoryError>;

    async fn log_audit_entry(&self, entry: AuditEntry);
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_large_upload(&self, notice: LargeUploadNotice) -> Result<(), RepositoryError>;
}

/// 进程内的文件记录仓库。
#[derive(Debug, Default)]
pub struct MemoryRepository {
    files: Mutex<HashMap<String, FileRecord>>,
    usage_mb: Mutex<HashMap<String, f64>>,
    audit: Mutex<Vec<AuditEntry>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl MemoryRepository {
    pub async fn file(&self, id: &str) -> Option<FileRecord> {
        self.files.lock().await.get(id).cloned()
    }

    pub async fn file_count(&self) -> usize {
        self.files.lock().await.len()
    }

    pub async fn audit_entries(&self) -> Vec<AuditEntry> {
        self.audit.lock().await.clone()
    }
}

#[async_trait]
impl FileRepository for MemoryRepository {
    async fn save_file_record(&self, record: &FileRecord) -> Result<(), RepositoryError> {
        let mut files = self.files.lock().await;
        if files.contains_key(&record.id) {
            return Err(RepositoryError(format!("file {} already exists", record.id)));
        }
        files.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn owner_storage_used_mb(&self, owner: &str) -> Result<f64, RepositoryError> {
        Ok(self.usage_mb.lock().await.get(owner).copied().unwrap_or(0.0))
    }

    async fn update_owner_storage_usage(
        &self,
        owner: &str,
        new_total_mb: f64,
    ) -> Result<(), RepositoryError> {
        self.usage_mb
            .lock()
            .await
            .insert(owner.to_string(), new_total_mb);
        Ok(())
    }

    async fn log_audit_entry(&self, entry: AuditEntry) {
        info!(
            actor = entry.actor,
            action = entry.action,
            target = entry.target,
            details = entry.details,
            "audit"
        );
        self.audit.lock().await.push(entry);
    }
}

/// 仅写日志的通知实现。
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_large_upload(&self, notice: LargeUploadNotice) -> Result<(), RepositoryError> {
        info!(
            owner = notice.owner,
            name = notice.name,
            size = notice.size,
            file_id = notice.file_id,
            sha256 = notice.sha256,
            "large upload finished"
        );
        Ok(())
    }
}
