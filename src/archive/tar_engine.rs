use crate::archive::engine::{
    normalize_entry_path, ArchiveEntry, Engine, EntryKind, EntrySelection,
};
use crate::archive::path_validator::PathValidator;
use crate::error::{AppError, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tar::Archive;
use tracing::{debug, trace, warn};

/**
 * TAR 引擎
 *
 * 只处理未压缩的 tar；`tar.gz` 等复合格式由加载器先剥掉外层压缩
 */
#[derive(Debug, Default)]
pub struct TarEngine {
    validator: PathValidator,
}

impl TarEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn open(path: &Path) -> Result<Archive<BufReader<File>>> {
        let file = File::open(path)?;
        Ok(Archive::new(BufReader::new(file)))
    }

    fn extract_sync(
        validator: &PathValidator,
        archive_path: &Path,
        dest_dir: &Path,
        select: Option<&EntrySelection>,
    ) -> Result<usize> {
        let mut archive = Self::open(archive_path)?;
        archive.set_preserve_permissions(true);
        let entries = archive
            .entries()
            .map_err(|e| invalid(e, archive_path))?;

        let mut written = 0;
        for entry_result in entries {
            let mut entry = entry_result.map_err(|e| invalid(e, archive_path))?;
            let raw_path = entry
                .path()
                .map_err(|e| invalid(e, archive_path))?
                .to_string_lossy()
                .into_owned();

            let relative = match select {
                Some(selection) => match selection.map(&raw_path) {
                    Some(relative) => relative,
                    None => continue,
                },
                None => normalize_entry_path(&raw_path),
            };
            if relative.is_empty() {
                continue;
            }

            let out_path = validator.validate_extraction_path(&relative, dest_dir)?;
            let entry_type = entry.header().entry_type();

            if entry_type.is_dir() {
                std::fs::create_dir_all(&out_path)?;
            } else if entry_type.is_file() || entry_type.is_contiguous() {
                if let Some(parent) = out_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                entry.unpack(&out_path).map_err(|e| {
                    AppError::extraction_failed(
                        format!("Failed to unpack {}: {}", raw_path, e),
                        Some(out_path.clone()),
                    )
                })?;
            } else {
                trace!(entry = %raw_path, kind = ?entry_type, "Skipping non-regular TAR entry");
                continue;
            }
            written += 1;
        }

        Ok(written)
    }
}

#[async_trait]
impl Engine for TarEngine {
    fn id(&self) -> &str {
        "tar"
    }

    async fn load_entries(&self, archive: &Path) -> Result<Vec<ArchiveEntry>> {
        let archive_path = archive.to_path_buf();

        tokio::task::spawn_blocking(move || {
            let mut tar = Self::open(&archive_path)?;
            let mut entries = Vec::new();

            for entry_result in tar.entries().map_err(|e| invalid(e, &archive_path))? {
                let entry = entry_result.map_err(|e| invalid(e, &archive_path))?;
                let header = entry.header();
                let raw_path = entry
                    .path()
                    .map_err(|e| invalid(e, &archive_path))?
                    .to_string_lossy()
                    .into_owned();

                let entry_type = header.entry_type();
                let kind = if entry_type.is_dir() {
                    EntryKind::Directory
                } else if entry_type.is_file() || entry_type.is_contiguous() {
                    EntryKind::File
                } else {
                    EntryKind::Unknown
                };

                let size = header.size().map(|s| s as i64).unwrap_or(-1);
                let listed = ArchiveEntry::new(&raw_path, kind)
                    .with_sizes(size, size)
                    .with_modified(header.mtime().ok().and_then(to_naive))
                    .with_permissions(header.mode().ok());

                if listed.path.is_empty() {
                    warn!(raw = %raw_path, "Skipping TAR entry with empty path");
                    continue;
                }
                entries.push(listed);
            }

            debug!(archive = %archive_path.display(), count = entries.len(), "Listed TAR entries");
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
        if entry.kind == EntryKind::Unknown {
            return Ok(None);
        }

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
            debug!(archive = %archive_path.display(), written, "Extracted TAR archive");
            Ok(())
        })
        .await?
    }
}

fn invalid(error: std::io::Error, path: &Path) -> AppError {
    AppError::invalid_archive(
        format!("Failed to read TAR archive: {}", error),
        Some(path.to_path_buf()),
    )
}

fn to_naive(seconds: u64) -> Option<NaiveDateTime> {
    DateTime::from_timestamp(i64::try_from(seconds).ok()?, 0).map(|dt| dt.naive_utc())
}
