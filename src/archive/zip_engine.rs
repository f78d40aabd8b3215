use crate::archive::engine::{
    mentions_password, write_entry_file, ArchiveEntry, Engine, EntryKind, EntrySelection,
};
use crate::archive::path_validator::PathValidator;
use crate::error::{AppError, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use zip::result::ZipError;
use zip::ZipArchive;

/**
 * ZIP 引擎
 *
 * 基于 zip crate，所有同步 IO 都在 `spawn_blocking` 中执行
 */
#[derive(Debug, Default)]
pub struct ZipEngine {
    validator: PathValidator,
}

impl ZipEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn open(path: &Path) -> Result<ZipArchive<BufReader<File>>> {
        let file = File::open(path)?;
        ZipArchive::new(BufReader::new(file)).map_err(|e| map_zip_error(e, path))
    }

    /// 逐个条目写出；`select` 为 `None` 时写出全部
    fn extract_sync(
        validator: &PathValidator,
        archive_path: &Path,
        dest_dir: &Path,
        select: Option<&EntrySelection>,
    ) -> Result<usize> {
        let mut archive = Self::open(archive_path)?;
        let mut written = 0;

        for i in 0..archive.len() {
            let mut file = archive
                .by_index(i)
                .map_err(|e| map_zip_error(e, archive_path))?;

            let relative = match select {
                Some(selection) => match selection.map(file.name()) {
                    Some(relative) => relative,
                    None => continue,
                },
                None => crate::archive::engine::normalize_entry_path(file.name()),
            };
            if relative.is_empty() {
                continue;
            }

            let out_path = validator.validate_extraction_path(&relative, dest_dir)?;
            if file.is_dir() {
                std::fs::create_dir_all(&out_path)?;
            } else {
                write_entry_file(&mut file, &out_path)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    if let Some(mode) = file.unix_mode() {
                        if let Err(e) = std::fs::set_permissions(
                            &out_path,
                            std::fs::Permissions::from_mode(mode & 0o777),
                        ) {
                            warn!(
                                path = %out_path.display(),
                                error = %e,
                                "Failed to apply entry permissions"
                            );
                        }
                    }
                }
            }
            written += 1;
        }

        Ok(written)
    }
}

#[async_trait]
impl Engine for ZipEngine {
    fn id(&self) -> &str {
        "zip"
    }

    async fn load_entries(&self, archive: &Path) -> Result<Vec<ArchiveEntry>> {
        let archive_path = archive.to_path_buf();

        tokio::task::spawn_blocking(move || {
            let mut zip = Self::open(&archive_path)?;
            let mut entries = Vec::with_capacity(zip.len());

            for i in 0..zip.len() {
                let file = zip
                    .by_index_raw(i)
                    .map_err(|e| map_zip_error(e, &archive_path))?;

                if file.encrypted() {
                    return Err(AppError::password_required(&archive_path));
                }

                let kind = if file.is_dir() {
                    EntryKind::Directory
                } else {
                    EntryKind::File
                };
                let entry = ArchiveEntry::new(file.name(), kind)
                    .with_sizes(file.compressed_size() as i64, file.size() as i64)
                    .with_modified(file.last_modified().and_then(to_naive))
                    .with_permissions(file.unix_mode());

                if entry.path.is_empty() {
                    warn!(raw = %file.name(), "Skipping ZIP entry with empty path");
                    continue;
                }
                entries.push(entry);
            }

            debug!(archive = %archive_path.display(), count = entries.len(), "Listed ZIP entries");
            Ok(entries)
        })
        .await?
    }

    async fn extract_entry(
        &self,
        entry: &ArchiveEntry,
        archive: &Path,
        dest_dir: &Path,
    ) -> Result<Option<PathBuf>> {
        let validator = self.validator.clone();
        let selection = EntrySelection::new(entry);
        let archive_path = archive.to_path_buf();
        let dest = dest_dir.to_path_buf();

        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&dest)?;
            let written = Self::extract_sync(&validator, &archive_path, &dest, Some(&selection))?;
            Ok((written > 0).then(|| selection.output(&dest)))
        })
        .await?
    }

    async fn extract_all(&self, archive: &Path, dest_dir: &Path) -> Result<()> {
        let validator = self.validator.clone();
        let archive_path = archive.to_path_buf();
        let dest = dest_dir.to_path_buf();

        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&dest)?;
            let written = Self::extract_sync(&validator, &archive_path, &dest, None)?;
            debug!(archive = %archive_path.display(), written, "Extracted ZIP archive");
            Ok(())
        })
        .await?
    }
}

fn map_zip_error(error: ZipError, path: &Path) -> AppError {
    match error {
        ZipError::Io(e) => AppError::Io(e),
        other if mentions_password(&other.to_string()) => AppError::password_required(path),
        other => AppError::invalid_archive(
            format!("Failed to read ZIP archive: {}", other),
            Some(path.to_path_buf()),
        ),
    }
}

fn to_naive(dt: zip::DateTime) -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(dt.year() as i32, dt.month() as u32, dt.day() as u32)?.and_hms_opt(
        dt.hour() as u32,
        dt.minute() as u32,
        dt.second() as u32,
    )
}
