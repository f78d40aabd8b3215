//! 引擎选择
//!
//! 格式 id -> 引擎：有效的用户覆盖优先，其次是目录默认引擎。覆盖只有在
//! 目录列出该引擎且引擎已注册时才生效，否则回落到默认值。

use crate::archive::catalog::FormatCatalog;
use crate::archive::engine::{Engine, EngineRegistry};
use crate::config::OverrideStore;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct EngineSelector {
    catalog: Arc<FormatCatalog>,
    registry: Arc<EngineRegistry>,
    overrides: Arc<OverrideStore>,
}

impl EngineSelector {
    pub fn new(
        catalog: Arc<FormatCatalog>,
        registry: Arc<EngineRegistry>,
        overrides: Arc<OverrideStore>,
    ) -> Self {
        Self {
            catalog,
            registry,
            overrides,
        }
    }

    pub fn catalog(&self) -> &Arc<FormatCatalog> {
        &self.catalog
    }

    pub fn registry(&self) -> &Arc<EngineRegistry> {
        &self.registry
    }

    fn is_selectable(&self, format_id: &str, engine_id: &str) -> bool {
        self.catalog
            .engine_options(format_id)
            .iter()
            .any(|option| option.id == engine_id)
            && self.registry.contains(engine_id)
    }

    /// 当前对 `format_id` 生效的引擎 id
    pub fn active_engine_id(&self, format_id: &str) -> Option<String> {
        if let Some(engine_id) = self.overrides.get(format_id) {
            if self.is_selectable(format_id, &engine_id) {
                return Some(engine_id);
            }
            debug!(format = %format_id, engine = %engine_id, "Ignoring stale engine override");
        }

        self.catalog
            .default_engine(format_id)
            .filter(|id| self.registry.contains(id))
            .map(str::to_string)
    }

    pub fn engine(&self, format_id: &str) -> Option<Arc<dyn Engine>> {
        let engine_id = self.active_engine_id(format_id)?;
        self.registry.get(&engine_id)
    }

    /// 为格式设置引擎；引擎未列在该格式的选项中或未注册时不做任何改变并返回 `false`
    pub fn set_override(&self, engine_id: &str, format_id: &str) -> bool {
        if !self.is_selectable(format_id, engine_id) {
            warn!(format = %format_id, engine = %engine_id, "Rejected engine override");
            return false;
        }

        if let Err(e) = self.overrides.set(format_id, engine_id) {
            // 内存中已生效，只是没能写盘
            error!(format = %format_id, engine = %engine_id, error = %e, "Failed to persist engine override");
        }
        info!(format = %format_id, engine = %engine_id, "Engine override applied");
        true
    }

    /// 恢复默认引擎；返回之前是否存在覆盖
    pub fn clear_override(&self, format_id: &str) -> bool {
        match self.overrides.remove(format_id) {
            Ok(removed) => removed,
            Err(e) => {
                error!(format = %format_id, error = %e, "Failed to persist engine override removal");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::engine::{ArchiveEntry, EngineRegistry};
    use crate::error::Result;
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};

    struct NamedEngine(&'static str);

    #[async_trait]
    impl Engine for NamedEngine {
        fn id(&self) -> &str {
            self.0
        }
        async fn load_entries(&self, _archive: &Path) -> Result<Vec<ArchiveEntry>> {
            Ok(Vec::new())
        }
        async fn extract_entry(
            &self,
            _entry: &ArchiveEntry,
            _archive: &Path,
            _dest_dir: &Path,
        ) -> Result<Option<PathBuf>> {
            Ok(None)
        }
        async fn extract_all(&self, _archive: &Path, _dest_dir: &Path) -> Result<()> {
            Ok(())
        }
    }

    fn selector_with(engines: &[&'static str]) -> EngineSelector {
        let registry = EngineRegistry::new();
        for id in engines {
            registry.register(Arc::new(NamedEngine(id)));
        }
        EngineSelector::new(
            Arc::new(FormatCatalog::builtin()),
            Arc::new(registry),
            Arc::new(OverrideStore::in_memory()),
        )
    }

    #[test]
    fn test_catalog_default_is_used() {
        let selector = selector_with(&["zip", "7z-cli"]);
        assert_eq!(selector.active_engine_id("zip").as_deref(), Some("zip"));
        assert_eq!(selector.engine("zip").unwrap().id(), "zip");
    }

    #[test]
    fn test_unregistered_default_yields_none() {
        let selector = selector_with(&["7z-cli"]);
        assert!(selector.engine("zip").is_none());
        assert!(selector.engine("unknown-format").is_none());
    }

    #[test]
    fn test_valid_override_wins() {
        let selector = selector_with(&["zip", "7z-cli"]);
        assert!(selector.set_override("7z-cli", "zip"));
        assert_eq!(selector.engine("zip").unwrap().id(), "7z-cli");

        // 其他格式不受影响
        let tar_before = selector.active_engine_id("tar");
        assert_eq!(tar_before, None);
    }

    #[test]
    fn test_unlisted_engine_is_rejected() {
        let selector = selector_with(&["zip", "stream"]);
        assert!(!selector.set_override("stream", "zip"));
        assert_eq!(selector.active_engine_id("zip").as_deref(), Some("zip"));
    }

    #[test]
    fn test_unregistered_engine_is_rejected() {
        let selector = selector_with(&["zip"]);
        assert!(!selector.set_override("7z-cli", "zip"));
        assert_eq!(selector.active_engine_id("zip").as_deref(), Some("zip"));
    }

    #[test]
    fn test_clear_override_restores_default() {
        let selector = selector_with(&["zip", "7z-cli"]);
        selector.set_override("7z-cli", "zip");
        assert!(selector.clear_override("zip"));
        assert_eq!(selector.active_engine_id("zip").as_deref(), Some("zip"));
        assert!(!selector.clear_override("zip"));
    }
}
