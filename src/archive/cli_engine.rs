//! 7-Zip 命令行引擎
//!
//! 每次调用启动一个 `7z` 子进程。列出条目解析 `7z l` 的定宽输出：
//!
//! ```text
//!    Date      Time    Attr         Size   Compressed  Name
//! ------------------- ----- ------------ ------------  ------------------------
//! 2024-01-01 12:00:00 D....            0            0  folder
//! 2024-01-01 12:00:00 ....A           12           20  folder/hello.txt
//! ------------------- ----- ------------ ------------  ------------------------
//! ```
//!
//! 名称从第 53 列开始。

use crate::archive::engine::{mentions_password, ArchiveEntry, Engine, EntryKind};
use crate::archive::path_validator::PathValidator;
use crate::error::{AppError, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::{debug, warn};

const BINARY_CANDIDATES: &[&str] = &["7zz", "7z", "7za"];
const NAME_COLUMN: usize = 53;
const SEPARATOR_PREFIX: &str = "-------------------";

#[derive(Debug, Default)]
pub struct SevenZipCliEngine {
    configured_binary: Option<PathBuf>,
    validator: PathValidator,
}

impl SevenZipCliEngine {
    pub fn new(configured_binary: Option<PathBuf>) -> Self {
        Self {
            configured_binary,
            validator: PathValidator::default(),
        }
    }

    /// 配置的路径优先，其次在 `PATH` 中查找
    pub fn locate_binary(&self) -> Result<PathBuf> {
        if let Some(configured) = &self.configured_binary {
            if configured.is_file() {
                return Ok(configured.clone());
            }
            warn!(path = %configured.display(), "Configured 7z binary not found, searching PATH");
        }

        BINARY_CANDIDATES
            .iter()
            .find_map(|name| which::which(name).ok())
            .ok_or_else(|| {
                AppError::load_failed(format!(
                    "No 7-Zip executable found (tried {})",
                    BINARY_CANDIDATES.join(", ")
                ))
            })
    }

    async fn run(&self, args: Vec<OsString>, archive: &Path) -> Result<Output> {
        let binary = self.locate_binary()?;
        debug!(binary = %binary.display(), args = ?args, "Running 7z");

        // stdin 为空：加密归档的密码提示立即读到 EOF 而不是挂起
        let output = Command::new(&binary)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                AppError::load_failed(format!("Failed to start {}: {}", binary.display(), e))
            })?;

        check_status(&output, archive)?;
        Ok(output)
    }

    async fn extract_to(&self, archive: &Path, dest: &Path, filter: Option<&str>) -> Result<()> {
        self.run(extract_args(archive, dest, filter), archive)
            .await
            .map(|_| ())
    }
}

fn extract_args(archive: &Path, dest: &Path, filter: Option<&str>) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "x".into(),
        archive.as_os_str().to_owned(),
        prefixed("-o", dest.as_os_str()),
        "-y".into(),
        "-sccUTF-8".into(),
    ];
    if let Some(filter) = filter {
        // -spd: 条目名按字面匹配，不展开 * ? [ 通配符
        args.push("-r-".into());
        args.push("-spd".into());
        args.push("--".into());
        args.push(filter.into());
    }
    args
}

#[async_trait]
impl Engine for SevenZipCliEngine {
    fn id(&self) -> &str {
        "7z-cli"
    }

    async fn load_entries(&self, archive: &Path) -> Result<Vec<ArchiveEntry>> {
        let args: Vec<OsString> = vec![
            "l".into(),
            "-sccUTF-8".into(),
            archive.as_os_str().to_owned(),
        ];
        let output = self.run(args, archive).await?;
        let entries = parse_listing(&String::from_utf8_lossy(&output.stdout));
        debug!(archive = %archive.display(), count = entries.len(), "Listed entries via 7z");
        Ok(entries)
    }

    async fn extract_entry(
        &self,
        entry: &ArchiveEntry,
        archive: &Path,
        dest_dir: &Path,
    ) -> Result<Option<PathBuf>> {
        let target = self
            .validator
            .validate_extraction_path(entry.name(), dest_dir)?;

        tokio::fs::create_dir_all(dest_dir).await?;
        // 7z 按完整路径输出，先写到暂存目录再移到条目父目录的位置
        let staging = tempfile::tempdir_in(dest_dir)?;
        self.extract_to(archive, staging.path(), Some(&entry.path))
            .await?;

        let extracted = self
            .validator
            .validate_extraction_path(&entry.path, staging.path())?;
        if !tokio::fs::try_exists(&extracted).await? {
            return Ok(None);
        }
        if tokio::fs::try_exists(&target).await? {
            crate::utils::fs_move::remove_existing(&target)?;
        }
        tokio::fs::rename(&extracted, &target).await?;

        Ok(Some(target))
    }

    async fn extract_all(&self, archive: &Path, dest_dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dest_dir).await?;
        self.extract_to(archive, dest_dir, None).await
    }
}

fn prefixed(prefix: &str, value: &std::ffi::OsStr) -> OsString {
    let mut arg = OsString::from(prefix);
    arg.push(value);
    arg
}

/// 把退出码和错误输出映射为错误类型
fn check_status(output: &Output, archive: &Path) -> Result<()> {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let combined = format!("{}\n{}", stdout, stderr);

    // 0 = 成功，1 = 警告（部分文件被跳过等），仍视为成功
    match output.status.code() {
        Some(0) | Some(1) => Ok(()),
        _ if combined.contains("Wrong password") || mentions_password(&stderr) => {
            Err(AppError::password_required(archive))
        }
        _ if combined.contains("Can not open") || combined.contains("Cannot open") => {
            Err(AppError::invalid_archive(
                "7-Zip can not open the file as an archive",
                Some(archive.to_path_buf()),
            ))
        }
        Some(code) => Err(AppError::extraction_failed(
            format!("7-Zip exited with code {}: {}", code, stderr.trim()),
            Some(archive.to_path_buf()),
        )),
        None => Err(AppError::Cancelled),
    }
}

/// 解析 `7z l` 输出的条目表
pub fn parse_listing(stdout: &str) -> Vec<ArchiveEntry> {
    let mut entries = Vec::new();
    let mut in_table = false;

    for line in stdout.lines() {
        if line.starts_with(SEPARATOR_PREFIX) {
            if in_table {
                break;
            }
            in_table = true;
            continue;
        }
        if !in_table {
            continue;
        }
        if let Some(entry) = parse_listing_line(line) {
            entries.push(entry);
        }
    }

    entries
}

fn parse_listing_line(line: &str) -> Option<ArchiveEntry> {
    let name = line.get(NAME_COLUMN..)?.trim_end();
    if name.is_empty() {
        return None;
    }

    let column = |start: usize, end: usize| line.get(start..end).map(str::trim).unwrap_or("");
    let modified = NaiveDateTime::parse_from_str(column(0, 19), "%Y-%m-%d %H:%M:%S").ok();
    let attributes = column(20, 25);
    let size = column(26, 38).parse::<i64>().unwrap_or(-1);
    let compressed = column(39, 51).parse::<i64>().unwrap_or(-1);

    let kind = if attributes.starts_with('D') {
        EntryKind::Directory
    } else {
        EntryKind::File
    };

    let entry = ArchiveEntry::new(name, kind)
        .with_sizes(compressed, size)
        .with_modified(modified);
    (!entry.path.is_empty()).then_some(entry)
}
