//! Path Validator Module - Archive Security
//!
//! 所有引擎在写入磁盘前都通过这里验证条目路径，防止路径遍历（zip-slip）。
//!
//! **安全原则**:
//! 1. Fail Secure - 验证失败时拒绝写入该条目
//! 2. 只接受相对、无 `..`、无控制字符的路径

use crate::error::{AppError, Result};
use std::path::{Component, Path, PathBuf};
use tracing::warn;

/// 路径验证器配置
#[derive(Debug, Clone)]
pub struct PathValidatorConfig {
    /// 最大路径深度
    pub max_path_depth: usize,
    /// 单个组件最大长度
    pub max_component_length: usize,
}

impl Default for PathValidatorConfig {
    fn default() -> Self {
        Self {
            max_path_depth: 100,
            max_component_length: 255,
        }
    }
}

/// 路径安全验证器
#[derive(Debug, Clone, Default)]
pub struct PathValidator {
    config: PathValidatorConfig,
}

impl PathValidator {
    pub fn new(config: PathValidatorConfig) -> Self {
        Self { config }
    }

    /// 验证归档条目路径，返回位于 `base_dir` 内的完整目标路径
    ///
    /// 条目路径中的 `./` 会被忽略，反斜杠视为分隔符。
    pub fn validate_extraction_path(&self, entry_path: &str, base_dir: &Path) -> Result<PathBuf> {
        if entry_path.is_empty() {
            return Err(AppError::InvalidPath("Empty path in archive entry".to_string()));
        }

        if entry_path.contains("://") {
            warn!(entry = %entry_path, "URL protocol detected in archive entry path");
            return Err(AppError::InvalidPath(format!(
                "Invalid path with protocol: {}",
                entry_path
            )));
        }

        if entry_path.chars().any(|c| c.is_control()) {
            warn!(entry = ?entry_path, "Control characters detected in archive entry path");
            return Err(AppError::InvalidPath(
                "Path contains control characters".to_string(),
            ));
        }

        let unified = entry_path.replace('\\', "/");
        let mut relative = PathBuf::new();
        let mut depth = 0;

        for component in Path::new(&unified).components() {
            match component {
                Component::Normal(name) => {
                    depth += 1;
                    if depth > self.config.max_path_depth {
                        return Err(AppError::InvalidPath(format!(
                            "Path depth exceeds maximum {}: {}",
                            self.config.max_path_depth, entry_path
                        )));
                    }
                    if let Some(name_str) = name.to_str() {
                        self.validate_filename(name_str)?;
                    }
                    relative.push(name);
                }
                Component::ParentDir => {
                    warn!(entry = %entry_path, "Path traversal detected");
                    return Err(AppError::InvalidPath(format!(
                        "Path traversal detected: {}",
                        entry_path
                    )));
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(AppError::InvalidPath(format!(
                        "Absolute paths not allowed in archives: {}",
                        entry_path
                    )));
                }
                Component::CurDir => {}
            }
        }

        if relative.as_os_str().is_empty() {
            return Err(AppError::InvalidPath(format!(
                "Entry path has no usable components: {}",
                entry_path
            )));
        }

        Ok(base_dir.join(relative))
    }

    fn validate_filename(&self, filename: &str) -> Result<()> {
        if filename.len() > self.config.max_component_length {
            return Err(AppError::InvalidPath(format!(
                "Filename too long ({} > {}): {}",
                filename.len(),
                self.config.max_component_length,
                filename
            )));
        }

        // Windows 保留设备名，如 "CON.txt"
        #[cfg(target_os = "windows")]
        {
            const RESERVED: &[&str] = &[
                "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6",
                "COM7", "COM8", "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7",
                "LPT8", "LPT9",
            ];
            let upper = filename.to_uppercase();
            let base_name = upper.split('.').next().unwrap_or("");
            if RESERVED.contains(&base_name) {
                return Err(AppError::InvalidPath(format!(
                    "Reserved device name not allowed: {}",
                    filename
                )));
            }
        }

        Ok(())
    }
}
