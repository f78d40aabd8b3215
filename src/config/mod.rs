//! 应用配置
//!
//! 通过 `config` crate 分层加载：内置默认值 < TOML 配置文件 <
//! `ARCHIVE_EXPLORER__*` 环境变量（双下划线分隔层级，例如
//! `ARCHIVE_EXPLORER__LOGGING__LEVEL=debug`）。

pub mod overrides;

use crate::archive::nested_archive_config::NestedArchiveConfig;
use eyre::{eyre, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub use overrides::{EngineOverride, OverrideStore};

const ENV_PREFIX: &str = "ARCHIVE_EXPLORER";
const APP_DIR_NAME: &str = "archive-explorer";

/// 应用配置
#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub temp: TempConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub engines: EnginesConfig,
    #[serde(default)]
    pub nested: NestedArchiveConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
}

/// 临时目录配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TempConfig {
    /// 缓存根目录，操作目录位于 `<cache_root>/archive-explorer/<uuid>`
    #[serde(default = "default_cache_root")]
    pub cache_root: PathBuf,
    /// 退出时是否清空整个临时根目录
    #[serde(default = "default_true")]
    pub sweep_on_exit: bool,
}

fn default_cache_root() -> PathBuf {
    std::env::temp_dir()
}

fn default_true() -> bool {
    true
}

impl Default for TempConfig {
    fn default() -> Self {
        Self {
            cache_root: default_cache_root(),
            sweep_on_exit: default_true(),
        }
    }
}

impl TempConfig {
    pub fn storage_root(&self) -> PathBuf {
        self.cache_root.join(APP_DIR_NAME)
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 默认过滤级别，`RUST_LOG` 存在时以其为准
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 输出 JSON 格式
    #[serde(default)]
    pub json: bool,
    /// 按天滚动的日志文件目录，未设置时只输出到 stderr
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            directory: None,
        }
    }
}

/// 引擎配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnginesConfig {
    /// 7-Zip 可执行文件；未设置时从 PATH 查找
    #[serde(default)]
    pub seven_zip_path: Option<PathBuf>,
    /// 覆盖文件；未设置时使用 `<config_dir>/engines.json`
    #[serde(default)]
    pub overrides_file: Option<PathBuf>,
}

impl EnginesConfig {
    pub fn overrides_path(&self) -> Option<PathBuf> {
        self.overrides_file
            .clone()
            .or_else(|| default_config_dir().map(|dir| dir.join("engines.json")))
    }
}

/// 格式目录配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// 用户提供的目录 TOML，替换内置目录
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// `~/.config/archive-explorer`
pub fn default_config_dir() -> Option<PathBuf> {
    home::home_dir().map(|home| home.join(".config").join(APP_DIR_NAME))
}

impl Settings {
    /// 加载配置
    ///
    /// `path` 为 `None` 时尝试默认位置 `<config_dir>/config.toml`，不存在则忽略
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        match path {
            Some(path) => {
                builder = builder.add_source(::config::File::from(path).required(true));
            }
            None => {
                if let Some(dir) = default_config_dir() {
                    builder = builder
                        .add_source(::config::File::from(dir.join("config.toml")).required(false));
                }
            }
        }

        let settings: Self = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .wrap_err("Failed to build configuration")?
            .try_deserialize()
            .wrap_err("Failed to deserialize configuration")?;

        settings.validate()?;
        tracing::debug!(settings = ?settings, "Configuration loaded");
        Ok(settings)
    }

    /// 从 TOML 字符串解析，测试和嵌入场景使用
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let settings: Self = toml::from_str(content).context("Failed to parse TOML config")?;
        settings.validate()?;
        Ok(settings)
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<()> {
        if self.temp.cache_root.as_os_str().is_empty() {
            return Err(eyre!("temp.cache_root must not be empty"));
        }

        self.logging
            .level
            .parse::<tracing_subscriber::filter::EnvFilter>()
            .map_err(|e| eyre!("Invalid logging.level '{}': {}", self.logging.level, e))?;

        if let Some(binary) = &self.engines.seven_zip_path {
            if binary.as_os_str().is_empty() {
                return Err(eyre!("engines.seven_zip_path must not be empty when set"));
            }
        }

        self.nested
            .validate()
            .map_err(|e| eyre!("Invalid nested configuration: {}", e))?;

        Ok(())
    }
}
