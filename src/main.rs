//! 归档浏览器 - 命令行入口
//!
//! - 初始化日志系统
//! - 加载配置并装配格式目录、引擎和覆盖设置
//! - 执行子命令，退出时清理临时目录

use archive_explorer::archive::{ArchiveServices, ArchiveState, ItemId, ItemKind, OpenOutcome};
use archive_explorer::config::Settings;
use archive_explorer::platform::LoggingOpener;
use archive_explorer::{logging, AppError};
use clap::{Parser, Subcommand};
use eyre::{eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "archive-explorer", version, about = "Browse and extract archives")]
struct Cli {
    /// 配置文件路径（TOML）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 识别文件的归档格式
    Detect { file: PathBuf },
    /// 列出归档（或其中某个目录、嵌套归档）的内容
    Ls {
        archive: PathBuf,
        /// 归档内的路径，穿过嵌套归档时以归档文件名作为一级
        #[arg(long)]
        path: Option<String>,
    },
    /// 提取条目，未指定条目时提取整个归档
    Extract {
        archive: PathBuf,
        destination: PathBuf,
        #[arg(long = "entry")]
        entries: Vec<String>,
    },
    /// 查看或修改格式对应的引擎
    Engines {
        #[command(subcommand)]
        action: EnginesAction,
    },
}

#[derive(Subcommand, Debug)]
enum EnginesAction {
    Show { format: Option<String> },
    Set { format: String, engine: String },
    Clear { format: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;
    let _log_guard = logging::init(&settings.logging);

    info!("Archive Explorer v{} starting", env!("CARGO_PKG_VERSION"));

    let services = ArchiveServices::from_settings(&settings);
    let result = run(cli.command, &services).await;

    if settings.temp.sweep_on_exit {
        services.temp.sweep();
    }
    result
}

async fn run(command: Command, services: &ArchiveServices) -> Result<()> {
    match command {
        Command::Detect { file } => {
            let detection = services.loader.detect(&file, true).await?;
            match detection {
                Some(detection) => {
                    let layers = detection
                        .composition
                        .as_ref()
                        .map(|c| c.components.join(" -> "))
                        .unwrap_or_else(|| detection.type_id().to_string());
                    println!(
                        "{}\t{}\t{:?}\t{}",
                        detection.type_id(),
                        detection.archive_type.name,
                        detection.source,
                        layers
                    );
                }
                None => println!("not an archive"),
            }
        }
        Command::Ls { archive, path } => {
            let state = open_state(services, &archive).await?;
            let target = match path.as_deref() {
                Some(path) => resolve(&state, path).await?,
                None => state.root().ok_or_else(|| eyre!("Archive has no root"))?,
            };
            if let Some(item) = state.item(target) {
                if item.kind == ItemKind::File && !item.is_unfolded() {
                    state.open_item(target).await?;
                }
            }
            for child in state.children_sorted(target) {
                if let Some(item) = state.item(child) {
                    let marker = match item.kind {
                        ItemKind::Directory | ItemKind::Root => 'd',
                        ItemKind::File => '-',
                        ItemKind::Unknown => '?',
                    };
                    let modified = item
                        .modified
                        .map(|m| m.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{} {:>12} {:>12} {:19} {}",
                        marker, item.uncompressed_size, item.compressed_size, modified, item.name
                    );
                }
            }
            state.close().await;
        }
        Command::Extract {
            archive,
            destination,
            entries,
        } => {
            let state = open_state(services, &archive).await?;
            let written = if entries.is_empty() {
                state.extract_all(&destination).await?
            } else {
                let mut ids = Vec::with_capacity(entries.len());
                for entry in &entries {
                    ids.push(resolve(&state, entry).await?);
                }
                state.extract_items(&ids, &destination).await?
            };
            for path in written {
                println!("{}", path.display());
            }
            state.close().await;
        }
        Command::Engines { action } => engines(action, services)?,
    }
    Ok(())
}

fn engines(action: EnginesAction, services: &ArchiveServices) -> Result<()> {
    let selector = &services.selector;
    match action {
        EnginesAction::Show { format } => {
            let types: Vec<_> = match format {
                Some(id) => vec![services
                    .catalog
                    .type_by_id(&id)
                    .ok_or_else(|| eyre!("Unknown format '{}'", id))?],
                None => services.catalog.all_types().to_vec(),
            };
            for descriptor in types {
                let options: Vec<String> = descriptor
                    .engines
                    .iter()
                    .map(|option| {
                        let registered = if services.registry.contains(&option.id) {
                            ""
                        } else {
                            " (unavailable)"
                        };
                        format!("{}{}", option.id, registered)
                    })
                    .collect();
                println!(
                    "{:8} active={:10} options=[{}]",
                    descriptor.id,
                    selector
                        .active_engine_id(&descriptor.id)
                        .unwrap_or_else(|| "-".to_string()),
                    options.join(", ")
                );
            }
        }
        EnginesAction::Set { format, engine } => {
            if !selector.set_override(&engine, &format) {
                return Err(eyre!(
                    "Engine '{}' is not available for format '{}'",
                    engine,
                    format
                ));
            }
            println!("{} -> {}", format, engine);
        }
        EnginesAction::Clear { format } => {
            if selector.clear_override(&format) {
                println!("{} -> default", format);
            } else {
                println!("{} has no override", format);
            }
        }
    }
    Ok(())
}

async fn open_state(services: &ArchiveServices, archive: &Path) -> Result<ArchiveState> {
    let state = services.new_state().with_opener(Arc::new(LoggingOpener));
    match state.open(archive).await? {
        OpenOutcome::Opened => Ok(state),
        OpenOutcome::OpenedExternally => Err(eyre!("{} is not an archive", archive.display())),
        OpenOutcome::Cancelled => Err(AppError::Cancelled.into()),
    }
}

/// 按名称逐级查找，途经未展开的嵌套归档时先展开
async fn resolve(state: &ArchiveState, path: &str) -> Result<ItemId> {
    let mut cursor = state.root().ok_or_else(|| eyre!("No archive is open"))?;
    for segment in path.split('/').filter(|s| !s.is_empty() && *s != ".") {
        if let Some(item) = state.item(cursor) {
            if item.kind == ItemKind::File && !item.is_unfolded() {
                state.open_item(cursor).await?;
            }
        }
        cursor = state
            .children_sorted(cursor)
            .into_iter()
            .find(|child| state.item(*child).is_some_and(|item| item.name == segment))
            .ok_or_else(|| eyre!("'{}' not found in archive", path))?;
    }
    Ok(cursor)
}
