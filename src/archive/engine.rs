//! 引擎抽象
//!
//! 每个引擎包装一个第三方解压能力（库或外部命令），对外提供统一的
//! 列出条目 / 提取单个条目 / 提取全部三个操作。引擎无状态，可以并发调用。

use crate::error::{AppError, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// 条目类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    /// 链接等无法作为普通文件提取的条目
    Unknown,
}

/// 引擎报告的一个归档条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveEntry {
    /// 归一化后的相对路径，`/` 分隔，无首尾斜杠
    pub path: String,
    pub kind: EntryKind,
    /// 未知时为 -1
    pub compressed_size: i64,
    /// 未知时为 -1
    pub uncompressed_size: i64,
    pub modified: Option<NaiveDateTime>,
    pub permissions: Option<u32>,
}

impl ArchiveEntry {
    pub fn new(path: impl AsRef<str>, kind: EntryKind) -> Self {
        Self {
            path: normalize_entry_path(path.as_ref()),
            kind,
            compressed_size: -1,
            uncompressed_size: -1,
            modified: None,
            permissions: None,
        }
    }

    pub fn file(path: impl AsRef<str>) -> Self {
        Self::new(path, EntryKind::File)
    }

    pub fn directory(path: impl AsRef<str>) -> Self {
        Self::new(path, EntryKind::Directory)
    }

    pub fn with_sizes(mut self, compressed: i64, uncompressed: i64) -> Self {
        self.compressed_size = compressed;
        self.uncompressed_size = uncompressed;
        self
    }

    pub fn with_modified(mut self, modified: Option<NaiveDateTime>) -> Self {
        self.modified = modified;
        self
    }

    pub fn with_permissions(mut self, permissions: Option<u32>) -> Self {
        self.permissions = permissions;
        self
    }

    /// 最后一段路径
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// 将引擎给出的原始路径转换为 `a/b/c` 形式
///
/// 反斜杠视为分隔符，去掉 `.` 段、空段以及首尾斜杠。`..` 保留原样，
/// 由 `PathValidator` 在写盘前拒绝。
pub fn normalize_entry_path(raw: &str) -> String {
    raw.replace('\\', "/")
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/**
 * 解压引擎trait
 *
 * 实现必须是无状态的：同一个实例会被多个打开的归档同时使用
 */
#[async_trait]
pub trait Engine: Send + Sync {
    /// 注册表和目录中使用的引擎标识
    fn id(&self) -> &str;

    /**
     * 列出归档中的全部条目
     *
     * # 错误
     * * `InvalidArchive` - 文件损坏或格式不符
     * * `PasswordRequired` - 条目或头部被加密
     */
    async fn load_entries(&self, archive: &Path) -> Result<Vec<ArchiveEntry>>;

    /**
     * 提取单个条目到 `dest_dir`
     *
     * 输出相对于条目的父目录：`a/b/c.txt` 写到 `dest_dir/c.txt`，
     * 目录条目连同其所有后代一起写出。归档中找不到该条目时返回 `None`。
     */
    async fn extract_entry(
        &self,
        entry: &ArchiveEntry,
        archive: &Path,
        dest_dir: &Path,
    ) -> Result<Option<PathBuf>>;

    /// 按原有相对结构提取整个归档
    async fn extract_all(&self, archive: &Path, dest_dir: &Path) -> Result<()>;
}

/// 把归档内路径映射到单条目提取的输出路径
#[derive(Debug, Clone)]
pub(crate) struct EntrySelection {
    path: String,
    name: String,
    directory: bool,
}

impl EntrySelection {
    pub(crate) fn new(entry: &ArchiveEntry) -> Self {
        Self {
            path: entry.path.clone(),
            name: entry.name().to_string(),
            directory: entry.is_dir(),
        }
    }

    /// 命中时返回相对于 `dest_dir` 的输出路径
    pub(crate) fn map(&self, archived_path: &str) -> Option<String> {
        let normalized = normalize_entry_path(archived_path);
        if normalized == self.path {
            return Some(self.name.clone());
        }
        if self.directory {
            let rest = normalized.strip_prefix(&self.path)?.strip_prefix('/')?;
            return Some(format!("{}/{}", self.name, rest));
        }
        None
    }

    /// 选中条目自身在 `dest_dir` 中的位置
    pub(crate) fn output(&self, dest_dir: &Path) -> PathBuf {
        dest_dir.join(&self.name)
    }
}

/// 将 `reader` 的内容写到 `out_path`，必要时创建父目录
pub(crate) fn write_entry_file(reader: &mut dyn Read, out_path: &Path) -> Result<u64> {
    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut out_file = fs::File::create(out_path)?;
    let written = std::io::copy(reader, &mut out_file).map_err(|e| {
        AppError::extraction_failed(
            format!("Failed to write entry content: {}", e),
            Some(out_path.to_path_buf()),
        )
    })?;
    Ok(written)
}

/// 错误消息是否表示需要密码
pub(crate) fn mentions_password(message: &str) -> bool {
    message.to_lowercase().contains("password")
}

/**
 * 引擎注册表
 *
 * 按 id 保存所有可用引擎，选择器只会返回已注册的引擎
 */
#[derive(Default)]
pub struct EngineRegistry {
    engines: RwLock<HashMap<String, Arc<dyn Engine>>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册全部内置引擎
    ///
    /// `seven_zip_binary` 为 `None` 时子进程引擎在首次调用时从 `PATH` 查找
    pub fn with_defaults(seven_zip_binary: Option<PathBuf>) -> Self {
        use crate::archive::{
            cli_engine::SevenZipCliEngine, sevenz_engine::SevenZEngine,
            stream_engine::StreamEngine, tar_engine::TarEngine, zip_engine::ZipEngine,
        };

        let registry = Self::new();
        registry.register(Arc::new(ZipEngine::new()));
        registry.register(Arc::new(TarEngine::new()));
        registry.register(Arc::new(SevenZEngine::new()));
        registry.register(Arc::new(StreamEngine::new()));
        #[cfg(feature = "rar")]
        registry.register(Arc::new(crate::archive::rar_engine::UnrarEngine::new()));
        registry.register(Arc::new(SevenZipCliEngine::new(seven_zip_binary)));

        info!(engines = ?registry.ids(), "Engine registry initialized");
        registry
    }

    /// 注册引擎，同 id 的旧引擎被替换
    pub fn register(&self, engine: Arc<dyn Engine>) {
        let id = engine.id().to_string();
        debug!(engine = %id, "Registering engine");
        self.engines.write().insert(id, engine);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Engine>> {
        self.engines.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.engines.read().contains_key(id)
    }

    /// 已注册 id，按字母排序
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.engines.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_entry_path() {
        assert_eq!(normalize_entry_path("./folder/"), "folder");
        assert_eq!(normalize_entry_path("/abs//path/file.txt"), "abs/path/file.txt");
        assert_eq!(normalize_entry_path("win\\style\\file.txt"), "win/style/file.txt");
        assert_eq!(normalize_entry_path("../escape"), "../escape");
        assert_eq!(normalize_entry_path("./"), "");
    }

    #[test]
    fn test_entry_name() {
        assert_eq!(ArchiveEntry::file("folder/hello.txt").name(), "hello.txt");
        assert_eq!(ArchiveEntry::directory("folder/").name(), "folder");
        assert_eq!(ArchiveEntry::file("top").name(), "top");
    }

    #[test]
    fn test_selection_for_file() {
        let selection = EntrySelection::new(&ArchiveEntry::file("a/b/c.txt"));
        assert_eq!(selection.map("a/b/c.txt"), Some("c.txt".to_string()));
        assert_eq!(selection.map("./a/b/c.txt"), Some("c.txt".to_string()));
        assert_eq!(selection.map("a/b/c.txt.bak"), None);
        assert_eq!(selection.map("a/b/c.txt/inner"), None);
    }

    #[test]
    fn test_selection_for_directory() {
        let selection = EntrySelection::new(&ArchiveEntry::directory("a/b/"));
        assert_eq!(selection.map("a/b/"), Some("b".to_string()));
        assert_eq!(selection.map("a/b/c.txt"), Some("b/c.txt".to_string()));
        assert_eq!(selection.map("a/b/d/e.txt"), Some("b/d/e.txt".to_string()));
        assert_eq!(selection.map("a/bc/e.txt"), None);
        assert_eq!(selection.map("a/c.txt"), None);
    }

    #[test]
    fn test_mentions_password() {
        assert!(mentions_password("Password required to decrypt file"));
        assert!(mentions_password("Wrong password?"));
        assert!(!mentions_password("invalid header"));
    }

    #[test]
    fn test_registry_register_and_replace() {
        use crate::archive::zip_engine::ZipEngine;

        let registry = EngineRegistry::new();
        assert!(!registry.contains("zip"));

        registry.register(Arc::new(ZipEngine::new()));
        registry.register(Arc::new(ZipEngine::new()));
        assert!(registry.contains("zip"));
        assert_eq!(registry.ids(), vec!["zip".to_string()]);
        assert!(registry.get("tar").is_none());
    }

    #[test]
    fn test_default_registry_has_builtin_engines() {
        let registry = EngineRegistry::with_defaults(None);
        for id in ["zip", "tar", "sevenz", "stream", "7z-cli"] {
            assert!(registry.contains(id), "missing engine {}", id);
        }
    }
}
