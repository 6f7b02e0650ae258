//! 进行中的上传会话与并发安全的会话表。

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::sync::{Mutex, MutexGuard, RwLock};

use crate::error::UploadError;

/// 一次进行中的分片上传。身份字段初始化后不再变化，
/// 分片写入会修改的状态都在 `spool` 锁之后。
#[derive(Debug)]
pub struct UploadSession {
    pub id: String,
    pub owner: String,
    pub name: String,
    pub total_size: u64,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    spool: Mutex<SpoolState>,
}

#[derive(Debug)]
pub struct SpoolState {
    /// 会话完成、中止或被回收后为 `None`。
    pub file: Option<File>,
    pub bytes_received: u64,
    pub next_index: u64,
    pub last_activity: Instant,
}

impl SpoolState {
    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }
}

impl UploadSession {
    pub fn new(
        id: String,
        owner: String,
        name: String,
        total_size: u64,
        metadata: HashMap<String, String>,
        file: File,
    ) -> Self {
        Self {
            id,
            owner,
            name,
            total_size,
            metadata,
            created_at: Utc::now(),
            spool: Mutex::new(SpoolState {
                file: Some(file),
                bytes_received: 0,
                next_index: 0,
                last_activity: Instant::now(),
            }),
        }
    }

    pub fn is_owned_by(&self, owner: &str) -> bool {
        self.owner == owner
    }

    /// 获取会话写锁，串行化同一会话的分片写入。
    pub async fn lock(&self) -> MutexGuard<'_, SpoolState> {
        self.spool.lock().await
    }

    /// 会话空闲超过 `timeout` 时返回 true；正在写入的会话视为活跃。
    fn is_idle(&self, timeout: Duration, now: Instant) -> bool {
        match self.spool.try_lock() {
            Ok(state) => now.saturating_duration_since(state.last_activity) > timeout,
            Err(_) => false,
        }
    }
}

/// 以 upload id 为键的活跃会话表。
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<UploadSession>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入新会话；`limit` 为 0 时不限制会话数量。
    pub async fn create(
        &self,
        session: UploadSession,
        limit: u64,
    ) -> Result<Arc<UploadSession>, UploadError> {
        let mut sessions = self.sessions.write().await;
        if limit > 0 && sessions.len() as u64 >= limit {
            return Err(UploadError::TooManySessions);
        }
        if sessions.contains_key(&session.id) {
            return Err(UploadError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "upload id collision",
            )));
        }
        let session = Arc::new(session);
        sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<UploadSession>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// 原子地取出并删除会话，保证同一会话只会被一个调用方消费。
    pub async fn take_and_remove(&self, id: &str) -> Option<Arc<UploadSession>> {
        self.sessions.write().await.remove(id)
    }

    /// 在一次写锁内移除所有空闲超时的会话并返回它们。
    pub async fn take_idle(&self, timeout: Duration, now: Instant) -> Vec<Arc<UploadSession>> {
        let mut sessions = self.sessions.write().await;
        let idle: Vec<String> = sessions
            .iter()
            .filter(|(_, session)| session.is_idle(timeout, now))
            .map(|(id, _)| id.clone())
            .collect();
        idle.iter().filter_map(|id| sessions.remove(id)).collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn make_session(dir: &std::path::Path, id: &str, owner: &str) -> UploadSession {
        let file = File::create(dir.join(id)).await.expect("create spool");
        UploadSession::new(
            id.to_string(),
            owner.to_string(),
            "report.pdf".to_string(),
            10,
            HashMap::new(),
            file,
        )
    }

    #[tokio::test]
    async fn create_rejects_duplicate_id() {
        let temp = tempdir().expect("tempdir");
        let store = SessionStore::new();
        store
            .create(make_session(temp.path(), "a", "alice").await, 0)
            .await
            .expect("first insert");
        let result = store
            .create(make_session(temp.path(), "a", "alice").await, 0)
            .await;
        assert!(matches!(result, Err(UploadError::Io(_))));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn create_enforces_limit() {
        let temp = tempdir().expect("tempdir");
        let store = SessionStore::new();
        store
            .create(make_session(temp.path(), "a", "alice").await, 1)
            .await
            .expect("first insert");
        let result = store
            .create(make_session(temp.path(), "b", "alice").await, 1)
            .await;
        assert!(matches!(result, Err(UploadError::TooManySessions)));
    }

    #[tokio::test]
    async fn take_and_remove_yields_once() {
        let temp = tempdir().expect("tempdir");
        let store = Arc::new(SessionStore::new());
        store
            .create(make_session(temp.path(), "a", "alice").await, 0)
            .await
            .expect("insert");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(
                async move { store.take_and_remove("a").await.is_some() },
            ));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.expect("join") {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(store.get("a").await.is_none());
    }

    #[tokio::test]
    async fn take_idle_skips_recent_and_busy_sessions() {
        let temp = tempdir().expect("tempdir");
        let store = SessionStore::new();
        let idle = store
            .create(make_session(temp.path(), "idle", "alice").await, 0)
            .await
            .expect("insert idle");
        let busy = store
            .create(make_session(temp.path(), "busy", "alice").await, 0)
            .await
            .expect("insert busy");
        let fresh = store
            .create(make_session(temp.path(), "fresh", "alice").await, 0)
            .await
            .expect("insert fresh");

        let timeout = Duration::from_secs(60);
        let now = Instant::now() + Duration::from_secs(120);
        fresh.lock().await.last_activity = now;

        let _guard = busy.lock().await;
        let evicted = store.take_idle(timeout, now).await;
        let ids: Vec<&str> = evicted.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec![idle.id.as_str()]);
        assert!(store.get("busy").await.is_some());
        assert!(store.get("fresh").await.is_some());
    }
}
