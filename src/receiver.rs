//! 分片接收：把请求体追加到会话的 spool 文件。

use std::io::{self, SeekFrom};
use std::sync::Arc;
use std::time::Instant;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::UploadError;
use crate::manager::{UploadManager, UploadProgress};
use crate::session::UploadSession;

impl UploadManager {
    /// 把 `data` 追加到 `upload_id` 的 spool 文件。
    ///
    /// `chunk_index` 必须等于下一个期望序号，`None` 表示顺延。写入与计数更新在
    /// 独立任务里持锁完成，请求被取消也不会只写文件不记账。
    pub async fn append_chunk(
        &self,
        upload_id: &str,
        owner: &str,
        chunk_index: Option<u64>,
        data: Vec<u8>,
    ) -> Result<UploadProgress, UploadError> {
        if data.is_empty() {
            return Err(UploadError::Validation("chunk is empty".into()));
        }
        let session = self.owned_session(upload_id, owner).await?;
        let max_total_size = self.config.max_total_size;
        tokio::spawn(commit_chunk(session, chunk_index, data, max_total_size))
            .await
            .map_err(|err| UploadError::Io(io::Error::other(err.to_string())))?
    }
}

async fn commit_chunk(
    session: Arc<UploadSession>,
    chunk_index: Option<u64>,
    data: Vec<u8>,
    max_total_size: u64,
) -> Result<UploadProgress, UploadError> {
    let upload_id = session.id.as_str();
    let mut guard = session.lock().await;
    let state = &mut *guard;

    // finalized, aborted or evicted while this call waited for the lock
    let Some(file) = state.file.as_mut() else {
        return Err(UploadError::NotFound);
    };

    let index = chunk_index.unwrap_or(state.next_index);
    if index != state.next_index {
        return Err(UploadError::OutOfOrder {
            expected: state.next_index,
            got: index,
        });
    }

    let committed = state.bytes_received;
    let new_total = committed + data.len() as u64;
    if max_total_size > 0 && new_total > max_total_size {
        return Err(UploadError::Validation("upload size exceeds limit".into()));
    }

    if let Err(err) = write_chunk(file, &data).await {
        warn!(upload_id, chunk_index = index, error = %err, "chunk write failed");
        if let Err(rollback) = truncate_to(file, committed).await {
            warn!(upload_id, error = %rollback, "failed to roll back partial chunk");
        }
        return Err(err.into());
    }

    state.bytes_received = new_total;
    state.next_index = index + 1;
    state.last_activity = Instant::now();
    debug!(
        upload_id,
        chunk_index = index,
        bytes = data.len(),
        received = new_total,
        "upload chunk saved"
    );

    Ok(UploadProgress::new(
        state.bytes_received,
        session.total_size,
        state.next_index,
    ))
}

async fn write_chunk(file: &mut File, data: &[u8]) -> io::Result<()> {
    file.write_all(data).await?;
    file.flush().await
}

/// 把 spool 截断回已提交的长度，丢弃写了一半的分片。
async fn truncate_to(file: &mut File, len: u64) -> io::Result<()> {
    file.set_len(len).await?;
    file.seek(SeekFrom::Start(len)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::tests::make_manager;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::fs;

    #[tokio::test]
    async fn single_chunk_completes_upload() {
        let (_temp, manager, _repo) = make_manager().await;
        let id = manager
            .init("alice", "a.bin", 1000, HashMap::new())
            .await
            .expect("init failed");

        let progress = manager
            .append_chunk(&id, "alice", Some(0), vec![7u8; 1000])
            .await
            .expect("chunk failed");
        assert_eq!(progress.bytes_received, 1000);
        assert_eq!(progress.total_size, 1000);
        assert!(progress.complete);
    }

    #[tokio::test]
    async fn progress_accumulates_across_chunks() {
        let (_temp, manager, _repo) = make_manager().await;
        let id = manager
            .init("alice", "a.bin", 1000, HashMap::new())
            .await
            .expect("init failed");

        let mut seen = Vec::new();
        for (index, size) in [400usize, 300, 300].into_iter().enumerate() {
            let progress = manager
                .append_chunk(&id, "alice", Some(index as u64), vec![1u8; size])
                .await
                .expect("chunk failed");
            seen.push((progress.bytes_received, progress.complete));
        }
        assert_eq!(seen, vec![(400, false), (700, false), (1000, true)]);

        let spool = manager.storage.spool_path(&id);
        assert_eq!(fs::metadata(&spool).await.expect("spool").len(), 1000);
    }

    #[tokio::test]
    async fn foreign_owner_cannot_append() {
        let (_temp, manager, _repo) = make_manager().await;
        let id = manager
            .init("alice", "a.bin", 10, HashMap::new())
            .await
            .expect("init failed");

        let result = manager.append_chunk(&id, "mallory", Some(0), b"evil".to_vec()).await;
        assert!(matches!(result, Err(UploadError::Forbidden)));
        let progress = manager.status(&id, "alice").await.expect("status");
        assert_eq!(progress.bytes_received, 0);
        assert_eq!(progress.next_chunk_index, 0);
    }

    #[tokio::test]
    async fn unknown_upload_is_not_found() {
        let (_temp, manager, _repo) = make_manager().await;
        let result = manager.append_chunk("missing", "alice", None, b"x".to_vec()).await;
        assert!(matches!(result, Err(UploadError::NotFound)));
    }

    #[tokio::test]
    async fn out_of_order_and_duplicate_chunks_are_rejected() {
        let (_temp, manager, _repo) = make_manager().await;
        let id = manager
            .init("alice", "a.bin", 10, HashMap::new())
            .await
            .expect("init failed");

        let gap = manager.append_chunk(&id, "alice", Some(1), b"abc".to_vec()).await;
        assert!(matches!(
            gap,
            Err(UploadError::OutOfOrder {
                expected: 0,
                got: 1
            })
        ));
        manager
            .append_chunk(&id, "alice", Some(0), b"abc".to_vec())
            .await
            .expect("chunk failed");
        let duplicate = manager.append_chunk(&id, "alice", Some(0), b"abc".to_vec()).await;
        assert!(matches!(duplicate, Err(UploadError::OutOfOrder { .. })));

        let progress = manager.status(&id, "alice").await.expect("status");
        assert_eq!(progress.bytes_received, 3);
    }

    #[tokio::test]
    async fn received_total_is_capped_by_config() {
        let (_temp, manager, _repo) = make_manager().await;
        let limit = manager.config().max_total_size as usize;
        let id = manager
            .init("alice", "a.bin", 1, HashMap::new())
            .await
            .expect("init failed");
        let result = manager
            .append_chunk(&id, "alice", None, vec![0u8; limit + 1])
            .await;
        assert!(matches!(result, Err(UploadError::Validation(_))));
        let spool = manager.storage.spool_path(&id);
        assert_eq!(fs::metadata(&spool).await.expect("spool").len(), 0);
    }

    #[tokio::test]
    async fn concurrent_chunks_sum_per_session() {
        let (_temp, manager, _repo) = make_manager().await;
        let first = manager
            .init("alice", "a.bin", 64, HashMap::new())
            .await
            .expect("init failed");
        let second = manager
            .init("bob", "b.bin", 64, HashMap::new())
            .await
            .expect("init failed");

        let mut handles = Vec::new();
        for i in 0..16usize {
            let manager = manager.clone();
            let (id, owner) = if i % 2 == 0 {
                (first.clone(), "alice")
            } else {
                (second.clone(), "bob")
            };
            handles.push(tokio::spawn(async move {
                manager
                    .append_chunk(&id, owner, None, vec![b'x'; i + 1])
                    .await
                    .is_ok()
            }));
        }
        for handle in handles {
            assert!(handle.await.expect("join"));
        }

        let even: u64 = (0..16u64).filter(|i| i % 2 == 0).map(|i| i + 1).sum();
        let odd: u64 = (0..16u64).filter(|i| i % 2 == 1).map(|i| i + 1).sum();
        let a = manager.status(&first, "alice").await.expect("status");
        let b = manager.status(&second, "bob").await.expect("status");
        assert_eq!((a.bytes_received, a.next_chunk_index), (even, 8));
        assert_eq!((b.bytes_received, b.next_chunk_index), (odd, 8));
        let spool = manager.storage.spool_path(&first);
        assert_eq!(fs::metadata(&spool).await.expect("spool").len(), even);
    }

    #[tokio::test]
    async fn cancelled_chunk_is_committed_at_most_once() {
        let (_temp, manager, repo) = make_manager().await;
        let size = 512 * 1024;
        let id = manager
            .init("alice", "big.bin", size as u64, HashMap::new())
            .await
            .expect("init failed");

        let data = vec![5u8; size];
        let _ = tokio::time::timeout(
            Duration::ZERO,
            manager.append_chunk(&id, "alice", Some(0), data.clone()),
        )
        .await;

        // the client retries the same index after its request was dropped
        match manager.append_chunk(&id, "alice", Some(0), data).await {
            Ok(_) | Err(UploadError::OutOfOrder { expected: 1, got: 0 }) => {}
            Err(err) => panic!("unexpected retry error: {err}"),
        }

        let progress = manager.status(&id, "alice").await.expect("status");
        assert_eq!(progress.bytes_received, size as u64);
        assert_eq!(progress.next_chunk_index, 1);
        let spool = manager.storage.spool_path(&id);
        assert_eq!(fs::metadata(&spool).await.expect("spool").len(), size as u64);

        let file_id = manager.complete(&id, "alice").await.expect("complete failed");
        let record = repo.file(&file_id).await.expect("record");
        let stored = fs::metadata(manager.storage.file_path(&file_id))
            .await
            .expect("stored");
        assert_eq!(record.size, size as u64);
        assert_eq!(stored.len(), size as u64);
    }
}
