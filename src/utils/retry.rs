//! 文件操作重试
//!
//! 删除临时目录时，其他进程（杀毒软件、索引器、刚退出的 7z 子进程）可能仍持有
//! 文件句柄。这里对这类暂时性错误做指数退避重试。

use std::time::Duration;
use tracing::{error, info, warn};

/// 可重试的错误类型
const RETRYABLE_ERRORS: &[&str] = &[
    "permission denied",
    "access is denied",
    "file is being used",
    "directory not empty",
    "resource busy",
    "resource temporarily unavailable",
];

/// 检查错误是否可重试
fn is_retryable_error(error: &str) -> bool {
    let error = error.to_lowercase();
    RETRYABLE_ERRORS.iter().any(|e| error.contains(e))
}

/// 文件操作重试辅助函数
///
/// # 参数
///
/// - `operation` - 要执行的操作闭包
/// - `max_retries` - 最大重试次数
/// - `base_delay_ms` - 基础延迟时间（毫秒），每次翻倍
/// - `max_delay_ms` - 最大延迟时间（毫秒）
/// - `operation_name` - 操作名称（用于日志输出）
///
/// 不可重试的错误立即返回。
pub fn retry_file_operation<T, E>(
    operation: impl Fn() -> Result<T, E>,
    max_retries: usize,
    base_delay_ms: u64,
    max_delay_ms: u64,
    operation_name: &str,
) -> Result<T, E>
where
    E: std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        match operation() {
            Ok(result) => {
                if attempt > 0 {
                    info!(
                        operation = %operation_name,
                        retries = attempt,
                        "Operation succeeded after retries"
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                if !is_retryable_error(&e.to_string()) || attempt >= max_retries {
                    error!(
                        operation = %operation_name,
                        attempts = attempt + 1,
                        error = %e,
                        "Operation failed"
                    );
                    return Err(e);
                }

                let delay = base_delay_ms
                    .saturating_mul(2_u64.saturating_pow(attempt as u32))
                    .min(max_delay_ms);

                warn!(
                    operation = %operation_name,
                    attempt = attempt + 1,
                    delay_ms = delay,
                    error = %e,
                    "Operation failed, retrying"
                );

                std::thread::sleep(Duration::from_millis(delay));
                attempt += 1;
            }
        }
    }
}
