//! 通用工具函数模块
//!
//! 文件操作重试、临时目录存储和提取结果移动。

pub mod fs_move;
pub mod retry;
pub mod temp_storage;

pub use fs_move::{move_into, remove_existing};
pub use retry::retry_file_operation;
pub use temp_storage::TempStorage;
