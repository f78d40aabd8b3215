//! 临时目录存储
//!
//! 所有操作目录都位于同一个根目录下，以 UUID 命名：
//! `<cache_root>/archive-explorer/<uuid>/…`。关闭归档时删除它的操作目录，
//! 进程退出时 [`TempStorage::sweep`] 删除整个根目录。

use crate::error::Result;
use crate::utils::retry::retry_file_operation;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct TempStorage {
    root: PathBuf,
}

impl TempStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 创建一个新的 UUID 操作目录
    pub async fn create_operation_dir(&self) -> Result<PathBuf> {
        let dir = self.root.join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&dir).await?;
        debug!(dir = %dir.display(), "Created operation directory");
        Ok(dir)
    }

    /// 是否位于本存储的根目录下
    pub fn owns(&self, path: &Path) -> bool {
        path.starts_with(&self.root) && path != self.root
    }

    /// 删除单个操作目录，失败只记录日志
    pub async fn remove(&self, dir: &Path) {
        if !self.owns(dir) {
            warn!(dir = %dir.display(), "Refusing to remove directory outside temp root");
            return;
        }
        let dir = dir.to_path_buf();
        let result = tokio::task::spawn_blocking(move || remove_dir_with_retry(&dir)).await;
        if let Err(e) = result {
            warn!(error = %e, "Temp directory removal task failed");
        }
    }

    /// 删除整个临时根目录
    pub fn sweep(&self) {
        if !self.root.exists() {
            return;
        }
        remove_dir_with_retry(&self.root);
        info!(root = %self.root.display(), "Temp storage swept");
    }
}

fn remove_dir_with_retry(dir: &Path) {
    if !dir.exists() {
        return;
    }
    let result = retry_file_operation(
        || std::fs::remove_dir_all(dir),
        3,
        100,
        1000,
        &format!("remove_temp_dir({})", dir.display()),
    );
    match result {
        Ok(()) => debug!(dir = %dir.display(), "Removed temp directory"),
        Err(e) => warn!(dir = %dir.display(), error = %e, "Failed to remove temp directory"),
    }
}
