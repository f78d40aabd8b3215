//! 平台协作接口
//!
//! 用系统默认程序打开文件、以及沙盒环境下的目录访问授权，都属于宿主环境的
//! 能力。核心逻辑只依赖这里的 trait，默认实现适用于普通桌面进程。

use crate::error::{AppError, Result};
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info};

/// 用系统默认程序打开一个不是归档的文件
#[async_trait]
pub trait ExternalOpener: Send + Sync {
    async fn open(&self, path: &Path) -> Result<()>;
}

/// 调用 `xdg-open` / `open` / `cmd /C start`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemOpener;

#[async_trait]
impl ExternalOpener for SystemOpener {
    async fn open(&self, path: &Path) -> Result<()> {
        let mut command = if cfg!(target_os = "windows") {
            let mut command = Command::new("cmd");
            command.args(["/C", "start", ""]);
            command
        } else if cfg!(target_os = "macos") {
            Command::new("open")
        } else {
            Command::new("xdg-open")
        };

        info!(path = %path.display(), "Opening with system default handler");
        command.arg(path).spawn().map_err(|e| {
            AppError::load_failed(format!(
                "Failed to launch default handler for {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(())
    }
}

/// 只记录日志、不做任何事情的打开器，命令行和测试使用
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingOpener;

#[async_trait]
impl ExternalOpener for LoggingOpener {
    async fn open(&self, path: &Path) -> Result<()> {
        info!(path = %path.display(), "Not an archive, leaving it to an external application");
        Ok(())
    }
}

/// 目标目录访问授权（如 macOS 安全作用域书签）
///
/// `acquire` 与 `release` 必须成对调用。
pub trait ScopedAccess: Send + Sync {
    fn acquire(&self, path: &Path) -> bool;
    fn release(&self, path: &Path);
}

/// 无沙盒限制的默认实现
#[derive(Debug, Default, Clone, Copy)]
pub struct UnrestrictedAccess;

impl ScopedAccess for UnrestrictedAccess {
    fn acquire(&self, path: &Path) -> bool {
        debug!(path = %path.display(), "Scoped access acquired");
        true
    }

    fn release(&self, path: &Path) {
        debug!(path = %path.display(), "Scoped access released");
    }
}
