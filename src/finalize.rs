//! 上传完成：提升 spool 文件、计算摘要、持久化文件记录。

use argon2::Argon2;
use argon2::password_hash::{PasswordHasher, SaltString};
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use rand_core::OsRng;
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::UploadError;
use crate::manager::{UploadConfig, UploadManager};
use crate::records::{AuditEntry, FileRecord, LargeUploadNotice};
use crate::session::UploadSession;
use crate::storage::sha256_file;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// 初始化时携带的元数据解析后的完成参数。
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizeParams {
    pub expires_at: Option<DateTime<Utc>>,
    pub max_downloads: Option<u32>,
    pub password: Option<String>,
    pub comment: Option<String>,
    pub content_type: Option<String>,
}

impl FinalizeParams {
    pub fn from_metadata(
        metadata: &HashMap<String, String>,
        config: &UploadConfig,
        now: DateTime<Utc>,
    ) -> Self {
        let expires_at = if flag(metadata, "unlimited_time") {
            None
        } else {
            let date = text(metadata, "expire_date")
                .and_then(|value| NaiveDate::parse_from_str(value, "%Y-%m-%d").ok())
                .unwrap_or_else(|| {
                    (now + TimeDelta::days(i64::from(config.default_expiry_days))).date_naive()
                });
            end_of_day(date)
        };

        let max_downloads = if flag(metadata, "unlimited_downloads") {
            None
        } else {
            Some(
                text(metadata, "max_downloads")
                    .and_then(|value| value.parse::<u32>().ok())
                    .filter(|value| *value > 0)
                    .unwrap_or(config.default_max_downloads),
            )
        };

        let password = if flag(metadata, "require_password") {
            let password = text(metadata, "password").map(str::to_string);
            if password.is_none() {
                warn!("password required but none supplied, storing without password");
            }
            password
        } else {
            None
        };

        Self {
            expires_at,
            max_downloads,
            password,
            comment: text(metadata, "comment").map(str::to_string),
            content_type: text(metadata, "content_type").map(str::to_string),
        }
    }
}

fn text<'a>(metadata: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    metadata
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn flag(metadata: &HashMap<String, String>, key: &str) -> bool {
    text(metadata, key).is_some_and(|value| {
        matches!(
            value.to_ascii_lowercase().as_str(),
            "true" | "1" | "on" | "yes"
        )
    })
}

fn end_of_day(date: NaiveDate) -> Option<DateTime<Utc>> {
    date.and_hms_opt(23, 59, 59).map(|value| value.and_utc())
}

async fn hash_password(password: String) -> Result<String, UploadError> {
    tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|err| io::Error::other(format!("password hashing failed: {err}")))
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
    .map_err(UploadError::Io)
}

/// 读取文件摘要；失败时记录警告并返回空串，不阻断完成流程。
async fn content_digest(path: &Path, file_id: &str) -> String {
    match sha256_file(path).await {
        Ok(digest) => digest,
        Err(err) => {
            warn!(file_id, error = %err, "content hash failed, storing empty hash");
            String::new()
        }
    }
}

impl UploadManager {
    /// 完成上传，返回新文件 id。
    ///
    /// 会话经 `take_and_remove` 离开会话表，并发的多次完成（或与清理任务竞争）
    /// 只有一个能越过这一步，其余得到 `NotFound`。越过之后的步骤在独立任务中
    /// 执行，请求被取消时文件仍会落盘并登记，或被清理掉。
    pub async fn complete(
        self: &Arc<Self>,
        upload_id: &str,
        owner: &str,
    ) -> Result<String, UploadError> {
        let session = self.owned_session(upload_id, owner).await?;
        let received = session.lock().await.bytes_received;
        if received < session.total_size {
            return Err(UploadError::Validation(format!(
                "upload incomplete: {received} of {} bytes received",
                session.total_size
            )));
        }

        let params = FinalizeParams::from_metadata(&session.metadata, &self.config, Utc::now());
        let password_hash = match params.password.clone() {
            Some(password) => Some(hash_password(password).await?),
            None => None,
        };
        drop(session);

        let session = self
            .store
            .take_and_remove(upload_id)
            .await
            .ok_or(UploadError::NotFound)?;

        // no await between the take and the spawn
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.finalize(session, params, password_hash).await })
            .await
            .map_err(|err| UploadError::Io(io::Error::other(err.to_string())))?
    }

    async fn finalize(
        &self,
        session: Arc<UploadSession>,
        params: FinalizeParams,
        password_hash: Option<String>,
    ) -> Result<String, UploadError> {
        let upload_id = session.id.as_str();
        let size = {
            let mut state = session.lock().await;
            let Some(file) = state.file.take() else {
                return Err(UploadError::NotFound);
            };
            if let Err(err) = file.sync_all().await {
                warn!(upload_id, error = %err, "failed to sync spool before finalize");
            }
            drop(file);
            state.bytes_received
        };
        if size != session.total_size {
            warn!(
                upload_id,
                expected = session.total_size,
                actual = size,
                "received more bytes than declared"
            );
        }

        let file_id = session.id.clone();
        let path = match self.storage.promote(&session.id, &file_id).await {
            Ok(path) => path,
            Err(err) => {
                warn!(upload_id, error = %err, "failed to move spool into storage");
                if let Err(cleanup) = self.storage.remove_spool(&session.id).await {
                    warn!(upload_id, error = %cleanup, "failed to remove spool after move failure");
                }
                return Err(err.into());
            }
        };

        let sha256 = content_digest(&path, &file_id).await;

        let content_type = params.content_type.clone().unwrap_or_else(|| {
            mime_guess::from_path(&session.name)
                .first_or_octet_stream()
                .essence_str()
                .to_string()
        });
        let record = FileRecord {
            id: file_id.clone(),
            owner: session.owner.clone(),
            name: session.name.clone(),
            content_type,
            size,
            sha256,
            expires_at: params.expires_at,
            max_downloads: params.max_downloads,
            download_count: 0,
            password_hash,
            comment: params.comment,
            created_at: Utc::now(),
        };

        if let Err(err) = self.repository.save_file_record(&record).await {
            warn!(file_id, error = %err, "failed to save file record");
            if let Err(cleanup) = self.storage.remove_file(&file_id).await {
                warn!(file_id, error = %cleanup, "failed to remove file after record save failure");
            }
            return Err(UploadError::Persistence(err.to_string()));
        }

        self.record_storage_usage(&record.owner, size).await;
        self.emit_side_effects(&record);

        info!(
            upload_id,
            file_id,
            owner = record.owner,
            name = record.name,
            size,
            "upload complete"
        );
        Ok(file_id)
    }

    async fn record_storage_usage(&self, owner: &str, size: u64) {
        let used = match self.repository.owner_storage_used_mb(owner).await {
            Ok(used) => used,
            Err(err) => {
                warn!(owner, error = %err, "failed to read storage usage");
                return;
            }
        };
        let total = used + size as f64 / BYTES_PER_MB;
        if let Err(err) = self
            .repository
            .update_owner_storage_usage(owner, total)
            .await
        {
            warn!(owner, error = %err, "failed to update storage usage");
        }
    }

    /// 审计日志与大文件通知在后台执行，不影响完成结果。
    fn emit_side_effects(&self, record: &FileRecord) {
        let repository = self.repository.clone();
        let entry = AuditEntry {
            actor: record.owner.clone(),
            action: "file_upload".to_string(),
            target: record.id.clone(),
            details: format!("{} ({} bytes)", record.name, record.size),
            at: Utc::now(),
        };
        tokio::spawn(async move {
            repository.log_audit_entry(entry).await;
        });

        if record.size >= self.config.large_upload_threshold {
            let notifier = self.notifier.clone();
            let notice = LargeUploadNotice {
                owner: record.owner.clone(),
                name: record.name.clone(),
                size: record.size,
                file_id: record.id.clone(),
                sha256: record.sha256.clone(),
            };
            tokio::spawn(async move {
                let file_id = notice.file_id.clone();
                if let Err(err) = notifier.notify_large_upload(notice).await {
                    warn!(file_id, error = %err, "large upload notification failed");
                }
            });
        }
    }
}
