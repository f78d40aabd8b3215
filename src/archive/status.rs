//! 操作状态与上下文
//!
//! 每个长操作（打开、展开、提取）携带一个 [`OperationContext`]：取消令牌、
//! 状态上报通道和临时目录存储。状态逐条推送到该操作的 mpsc 通道（如果有人
//! 订阅），同时镜像到 `watch` 通道，观察者随时可以读取最新值。

use crate::error::{AppError, Result};
use crate::utils::temp_storage::TempStorage;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Status {
    Idle,
    Processing {
        /// 0.0 ..= 1.0，无法估计时为 `None`
        progress: Option<f32>,
        message: String,
    },
    Done,
    Error {
        message: String,
    },
    Cancelled,
}

impl Status {
    pub fn processing(message: impl Into<String>) -> Self {
        Status::Processing {
            progress: None,
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Done | Status::Error { .. } | Status::Cancelled)
    }
}

/// 单个操作的状态发送端
#[derive(Debug, Clone)]
pub struct StatusReporter {
    events: Option<mpsc::UnboundedSender<Status>>,
    current: Arc<watch::Sender<Status>>,
}

impl StatusReporter {
    pub fn new(
        current: Arc<watch::Sender<Status>>,
        events: Option<mpsc::UnboundedSender<Status>>,
    ) -> Self {
        Self { events, current }
    }

    /// 不连接任何观察者，测试和一次性调用使用
    pub fn detached() -> Self {
        let (current, _) = watch::channel(Status::Idle);
        Self {
            events: None,
            current: Arc::new(current),
        }
    }

    pub fn send(&self, status: Status) {
        trace!(status = ?status, "Status update");
        if let Some(events) = &self.events {
            // 接收端被丢弃说明订阅者不再关心
            let _ = events.send(status.clone());
        }
        self.current.send_replace(status);
    }

    pub fn processing(&self, message: impl Into<String>) {
        self.send(Status::processing(message));
    }

    pub fn progress(&self, progress: f32, message: impl Into<String>) {
        self.send(Status::Processing {
            progress: Some(progress.clamp(0.0, 1.0)),
            message: message.into(),
        });
    }
}

/// 一次操作的取消令牌、状态通道和临时目录
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub token: CancellationToken,
    pub status: StatusReporter,
    pub temp: Arc<TempStorage>,
    scratch: Arc<Mutex<Vec<PathBuf>>>,
}

impl OperationContext {
    pub fn new(token: CancellationToken, status: StatusReporter, temp: Arc<TempStorage>) -> Self {
        Self {
            token,
            status,
            temp,
            scratch: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// 已取消时返回 `AppError::Cancelled`
    pub fn check_cancelled(&self) -> Result<()> {
        if self.token.is_cancelled() {
            Err(AppError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// 创建新的操作目录并记录在本次操作的草稿目录列表中
    pub async fn scratch_dir(&self) -> Result<PathBuf> {
        let dir = self.temp.create_operation_dir().await?;
        self.scratch.lock().push(dir.clone());
        Ok(dir)
    }

    /// 取走本次操作创建的所有草稿目录
    pub fn take_scratch_dirs(&self) -> Vec<PathBuf> {
        std::mem::take(&mut *self.scratch.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_status_is_mirrored_to_watch_and_events() {
        let (current, watch_rx) = watch::channel(Status::Idle);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let reporter = StatusReporter::new(Arc::new(current), Some(events_tx));

        reporter.processing("Listing");
        reporter.progress(2.0, "Building tree");
        reporter.send(Status::Done);
        drop(reporter);

        assert_eq!(*watch_rx.borrow(), Status::Done);
        assert_eq!(events_rx.recv().await, Some(Status::processing("Listing")));
        assert_eq!(
            events_rx.recv().await,
            Some(Status::Processing {
                progress: Some(1.0),
                message: "Building tree".to_string()
            })
        );
        assert_eq!(events_rx.recv().await, Some(Status::Done));
        assert_eq!(events_rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_context_tracks_scratch_dirs() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let storage = Arc::new(TempStorage::new(temp_dir.path().join("root")));
        let ctx = OperationContext::new(
            CancellationToken::new(),
            StatusReporter::detached(),
            storage,
        );

        let first = ctx.scratch_dir().await.unwrap();
        let second = ctx.scratch_dir().await.unwrap();
        assert_ne!(first, second);
        assert!(first.is_dir());
        assert_eq!(ctx.take_scratch_dirs(), vec![first, second]);
        assert!(ctx.take_scratch_dirs().is_empty());
    }

    #[test]
    fn test_check_cancelled() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let ctx = OperationContext::new(
            CancellationToken::new(),
            StatusReporter::detached(),
            Arc::new(TempStorage::new(temp_dir.path())),
        );
        assert!(ctx.check_cancelled().is_ok());
        ctx.token.cancel();
        assert!(ctx.check_cancelled().unwrap_err().is_cancelled());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_value(Status::processing("Listing")).unwrap();
        assert_eq!(json["state"], "processing");
        assert_eq!(json["message"], "Listing");
    }
}
