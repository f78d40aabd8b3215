//! 归档浏览器
//!
//! 识别归档格式（含 `tar.gz` 这类复合格式），在可互换的后端引擎中选择负责
//! 该格式的引擎，把扁平的条目列表构建为可浏览的虚拟目录树（嵌套归档惰性
//! 展开），并把条目或整个归档安全地提取到目标目录。

pub mod archive;
pub mod config;
pub mod error;
pub mod logging;
pub mod platform;
pub mod utils;

pub use archive::{ArchiveServices, ArchiveState};
pub use error::{AppError, Result};
