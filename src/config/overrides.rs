//! 引擎覆盖存储
//!
//! 以 JSON 列表 `[{ "format_id": "zip", "engine_id": "7z-cli" }]` 持久化用户为
//! 每种格式选择的引擎。这里不做目录校验，校验由选择器负责。

use crate::error::{AppError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineOverride {
    pub format_id: String,
    pub engine_id: String,
}

/// 内存中的覆盖列表，可选地镜像到文件
#[derive(Debug, Default)]
pub struct OverrideStore {
    entries: RwLock<Vec<EngineOverride>>,
    path: Option<PathBuf>,
}

impl OverrideStore {
    /// 不落盘的存储
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// 从文件加载；文件不存在时为空，格式错误时记录警告并为空
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Vec<EngineOverride>>(&content) {
                Ok(entries) => {
                    info!(path = %path.display(), count = entries.len(), "Loaded engine overrides");
                    entries
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring malformed engine override file");
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read engine override file");
                Vec::new()
            }
        };

        Self {
            entries: RwLock::new(entries),
            path: Some(path),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self, format_id: &str) -> Option<String> {
        self.entries
            .read()
            .iter()
            .find(|o| o.format_id == format_id)
            .map(|o| o.engine_id.clone())
    }

    pub fn all(&self) -> Vec<EngineOverride> {
        self.entries.read().clone()
    }

    /// 设置覆盖并持久化
    pub fn set(&self, format_id: &str, engine_id: &str) -> Result<()> {
        let snapshot = {
            let mut entries = self.entries.write();
            match entries.iter_mut().find(|o| o.format_id == format_id) {
                Some(existing) => existing.engine_id = engine_id.to_string(),
                None => entries.push(EngineOverride {
                    format_id: format_id.to_string(),
                    engine_id: engine_id.to_string(),
                }),
            }
            entries.clone()
        };
        debug!(format = %format_id, engine = %engine_id, "Engine override set");
        self.persist(&snapshot)
    }

    /// 删除覆盖；返回是否存在过
    pub fn remove(&self, format_id: &str) -> Result<bool> {
        let (removed, snapshot) = {
            let mut entries = self.entries.write();
            let before = entries.len();
            entries.retain(|o| o.format_id != format_id);
            (entries.len() != before, entries.clone())
        };
        if removed {
            self.persist(&snapshot)?;
        }
        Ok(removed)
    }

    /// 先写临时文件再重命名，避免留下半个文件
    fn persist(&self, entries: &[EngineOverride]) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(entries)
            .map_err(|e| AppError::Config(format!("Failed to serialize engine overrides: {}", e)))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_set_get_remove_in_memory() {
        let store = OverrideStore::in_memory();
        assert_eq!(store.get("zip"), None);

        store.set("zip", "7z-cli").unwrap();
        store.set("tar", "7z-cli").unwrap();
        store.set("zip", "zip").unwrap();
        assert_eq!(store.get("zip").as_deref(), Some("zip"));
        assert_eq!(store.all().len(), 2);

        assert!(store.remove("zip").unwrap());
        assert!(!store.remove("zip").unwrap());
        assert_eq!(store.get("tar").as_deref(), Some("7z-cli"));
    }

    #[test]
    fn test_persist_and_reload() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("prefs").join("engines.json");

        let store = OverrideStore::load(&path);
        store.set("rar", "7z-cli").unwrap();
        assert!(path.exists());

        let reloaded = OverrideStore::load(&path);
        assert_eq!(reloaded.get("rar").as_deref(), Some("7z-cli"));

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw[0]["format_id"], "rar");
        assert_eq!(raw[0]["engine_id"], "7z-cli");
    }

    #[test]
    fn test_malformed_file_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("engines.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = OverrideStore::load(&path);
        assert!(store.all().is_empty());
    }
}
