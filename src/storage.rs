//! 临时分片目录与永久存储目录的文件操作。

use sha2::{Digest, Sha256};
use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tracing::warn;

use crate::config::SPOOL_DIR_NAME;

#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
    spool: PathBuf,
}

impl Storage {
    pub fn new(root: PathBuf, spool: PathBuf) -> Self {
        Self { root, spool }
    }

    /// 未显式配置 spool 目录时，放在存储目录的同级。
    pub fn with_default_spool(root: PathBuf) -> Self {
        let spool = default_spool_dir(&root);
        Self::new(root, spool)
    }

    pub async fn ensure_dirs(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await?;
        fs::create_dir_all(&self.spool).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;

            let root_dev = fs::metadata(&self.root).await?.dev();
            let spool_dev = fs::metadata(&self.spool).await?.dev();
            if root_dev != spool_dev {
                warn!(
                    root = ?self.root,
                    spool = ?self.spool,
                    "spool and storage are on different devices, finalize rename will fail"
                );
            }
        }
        Ok(())
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    pub fn spool_path(&self, upload_id: &str) -> PathBuf {
        self.spool.join(format!("{upload_id}.part"))
    }

    pub fn file_path(&self, file_id: &str) -> PathBuf {
        self.root.join(file_id)
    }

    /// 独占创建空的 spool 文件，已存在则失败。
    pub async fn create_spool(&self, upload_id: &str) -> io::Result<File> {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.spool_path(upload_id))
            .await
    }

    /// 将 spool 文件原子移动到永久存储，返回目标路径。
    pub async fn promote(&self, upload_id: &str, file_id: &str) -> io::Result<PathBuf> {
        let source = self.spool_path(upload_id);
        let target = self.file_path(file_id);
        fs::rename(&source, &target).await?;
        if let Err(err) = sync_dir(&self.root).await {
            warn!(path = ?self.root, error = %err, "failed to sync storage dir");
        }
        Ok(target)
    }

    /// 删除 spool 文件；文件已不存在时视为成功。
    pub async fn remove_spool(&self, upload_id: &str) -> io::Result<()> {
        remove_if_exists(&self.spool_path(upload_id)).await
    }

    pub async fn remove_file(&self, file_id: &str) -> io::Result<()> {
        remove_if_exists(&self.file_path(file_id)).await
    }
}

async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

fn default_spool_dir(root: &Path) -> PathBuf {
    match root.parent() {
        Some(parent) if parent.as_os_str() != OsStr::new("") => parent.join(SPOOL_DIR_NAME),
        _ => PathBuf::from(SPOOL_DIR_NAME),
    }
}

/// 计算文件的 SHA-256 十六进制摘要。
pub async fn sha256_file(path: &Path) -> io::Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(path)?;
        let mut hasher = Sha256::new();
        io::copy(&mut file, &mut hasher)?;
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}

async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}
