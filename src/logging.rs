//! 日志初始化
//!
//! `RUST_LOG` 优先于配置中的级别。配置了日志目录时额外按天滚动写入文件，
//! 返回的 guard 必须在进程结束前保持存活，否则缓冲中的日志会丢失。

use crate::config::LoggingConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

const LOG_FILE_PREFIX: &str = "archive-explorer.log";

pub fn init(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_writer, guard) = match &config.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    // 终端输出走 stderr，stdout 留给命令结果
    let result = match (config.json, file_writer) {
        (true, Some(file)) => builder
            .json()
            .with_writer(std::io::stderr.and(file))
            .try_init(),
        (true, None) => builder.json().with_writer(std::io::stderr).try_init(),
        (false, Some(file)) => builder
            .with_writer(std::io::stderr.and(file))
            .try_init(),
        (false, None) => builder.with_writer(std::io::stderr).try_init(),
    };

    if let Err(e) = result {
        eprintln!("Logging already initialized: {}", e);
    }
    guard
}
