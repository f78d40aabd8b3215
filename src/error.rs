use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/**
 * 应用错误类型 - 使用 miette 提供用户友好的错误诊断
 *
 * `Cancelled` 不是失败：调用方应将其视为干净的关闭，而不是向用户展示错误
 */
#[derive(Error, Debug, Diagnostic)]
pub enum AppError {
    #[error("IO error: {0}")]
    #[diagnostic(code(app::io_error))]
    Io(#[from] std::io::Error),

    #[error("Invalid archive: {message}")]
    #[diagnostic(
        code(app::invalid_archive),
        help("Ensure the archive file is not corrupted and is a supported format")
    )]
    InvalidArchive {
        message: String,
        path: Option<PathBuf>,
    },

    #[error("Password required: {}", path.display())]
    #[diagnostic(
        code(app::password_required),
        help("The archive is encrypted; password entry is not supported")
    )]
    PasswordRequired { path: PathBuf },

    #[error("Extraction failed: {message}")]
    #[diagnostic(code(app::extraction_failed))]
    ExtractionFailed {
        message: String,
        path: Option<PathBuf>,
    },

    #[error("Load failed: {0}")]
    #[diagnostic(
        code(app::load_failed),
        help("Check that the backend engine (library or external tool) is available")
    )]
    LoadFailed(String),

    #[error("Operation cancelled")]
    #[diagnostic(code(app::cancelled))]
    Cancelled,

    #[error("Invalid path: {0}")]
    #[diagnostic(
        code(app::invalid_path),
        help("The archive entry path escapes the destination or is malformed")
    )]
    InvalidPath(String),

    #[error("Catalog error: {0}")]
    #[diagnostic(code(app::catalog_error))]
    Catalog(String),

    #[error("Configuration error: {0}")]
    #[diagnostic(code(app::config_error))]
    Config(String),

    #[error("Navigation error: {0}")]
    #[diagnostic(code(app::navigation_error))]
    Navigation(String),
}

impl AppError {
    /**
     * 为错误添加上下文信息
     */
    pub fn with_context(self, context: impl Into<String>) -> Self {
        let context = context.into();
        match self {
            AppError::InvalidArchive { message, path } => AppError::InvalidArchive {
                message: format!("{}: {}", context, message),
                path,
            },
            AppError::ExtractionFailed { message, path } => AppError::ExtractionFailed {
                message: format!("{}: {}", context, message),
                path,
            },
            AppError::LoadFailed(message) => AppError::LoadFailed(format!("{}: {}", context, message)),
            other => other,
        }
    }

    /**
     * 创建无效归档错误
     */
    pub fn invalid_archive(message: impl Into<String>, path: Option<PathBuf>) -> Self {
        AppError::InvalidArchive {
            message: message.into(),
            path,
        }
    }

    /**
     * 创建提取失败错误
     */
    pub fn extraction_failed(message: impl Into<String>, path: Option<PathBuf>) -> Self {
        AppError::ExtractionFailed {
            message: message.into(),
            path,
        }
    }

    /**
     * 创建引擎加载失败错误
     */
    pub fn load_failed(message: impl Into<String>) -> Self {
        AppError::LoadFailed(message.into())
    }

    pub fn password_required(path: impl Into<PathBuf>) -> Self {
        AppError::PasswordRequired { path: path.into() }
    }

    pub fn navigation(message: impl Into<String>) -> Self {
        AppError::Navigation(message.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, AppError::Cancelled)
    }
}

/// 后台任务 join 失败统一视为引擎无法调用
impl From<tokio::task::JoinError> for AppError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            AppError::Cancelled
        } else {
            AppError::LoadFailed(format!("Background task failed: {}", e))
        }
    }
}

/**
 * 统一结果类型
 */
pub type Result<T> = std::result::Result<T, AppError>;
