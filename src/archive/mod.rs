/**
 * 归档模块
 *
 * 格式目录、类型检测、引擎与引擎选择、加载器、虚拟目录树和打开状态。
 */
pub mod catalog;
pub mod cli_engine;
pub mod detector;
pub mod engine;
pub mod loader;
pub mod nested_archive_config;
pub mod path_validator;
pub mod progress_reporter;
#[cfg(feature = "rar")]
pub mod rar_engine;
pub mod selector;
pub mod sevenz_engine;
pub mod state;
pub mod status;
pub mod stream_engine;
pub mod tar_engine;
pub mod tree;
pub mod zip_engine;

pub use catalog::{ArchiveKind, ArchiveTypeDescriptor, CompositionDescriptor, FormatCatalog};
pub use detector::{DetectionResult, DetectionSource, TypeDetector};
pub use engine::{ArchiveEntry, Engine, EngineRegistry, EntryKind};
pub use loader::{ArchiveLoader, LoadPhase, LoadedArchive};
pub use nested_archive_config::NestedArchiveConfig;
pub use selector::EngineSelector;
pub use state::{ArchiveState, ItemOutcome, OpenOutcome};
pub use status::{OperationContext, Status, StatusReporter};
pub use tree::{ArchiveItem, ArchiveTree, BoundArchive, ItemId, ItemKind};

use crate::config::{OverrideStore, Settings};
use crate::utils::temp_storage::TempStorage;
use std::sync::Arc;
use tracing::info;

/**
 * 按配置装配好的组件
 *
 * 目录、引擎注册表和覆盖设置在进程内只加载一次，所有打开的归档共享。
 */
#[derive(Clone)]
pub struct ArchiveServices {
    pub catalog: Arc<FormatCatalog>,
    pub registry: Arc<EngineRegistry>,
    pub overrides: Arc<OverrideStore>,
    pub selector: Arc<EngineSelector>,
    pub loader: Arc<ArchiveLoader>,
    pub temp: Arc<TempStorage>,
    pub nested: NestedArchiveConfig,
}

impl ArchiveServices {
    pub fn from_settings(settings: &Settings) -> Self {
        let catalog = Arc::new(FormatCatalog::load(settings.catalog.file.as_deref()));
        let registry = Arc::new(EngineRegistry::with_defaults(
            settings.engines.seven_zip_path.clone(),
        ));
        let overrides = Arc::new(match settings.engines.overrides_path() {
            Some(path) => OverrideStore::load(path),
            None => OverrideStore::in_memory(),
        });
        let selector = Arc::new(EngineSelector::new(
            Arc::clone(&catalog),
            Arc::clone(&registry),
            Arc::clone(&overrides),
        ));
        let detector = Arc::new(TypeDetector::new(Arc::clone(&catalog)));
        let loader = Arc::new(ArchiveLoader::new(detector, Arc::clone(&selector)));
        let temp = Arc::new(TempStorage::new(settings.temp.storage_root()));

        info!(
            types = catalog.all_types().len(),
            compositions = catalog.all_compositions().len(),
            engines = ?registry.ids(),
            "Archive services ready"
        );

        Self {
            catalog,
            registry,
            overrides,
            selector,
            loader,
            temp,
            nested: settings.nested.clone(),
        }
    }

    /// 新的打开状态，共享本组件集
    pub fn new_state(&self) -> ArchiveState {
        ArchiveState::new(Arc::clone(&self.loader), Arc::clone(&self.temp))
            .with_nested_config(self.nested.clone())
    }
}
