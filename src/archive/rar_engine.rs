use crate::archive::engine::{
    mentions_password, normalize_entry_path, ArchiveEntry, Engine, EntryKind, EntrySelection,
};
use crate::archive::path_validator::PathValidator;
use crate::error::{AppError, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use std::path::{Path, PathBuf};
use tracing::debug;
use unrar::Archive;

/**
 * RAR 引擎 (unrar 库)
 *
 * 需要启用 `rar` feature；未启用时 rar 格式只能通过 7z-cli 引擎处理
 */
#[derive(Debug, Default)]
pub struct UnrarEngine {
    validator: PathValidator,
}

impl UnrarEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn extract_sync(
        validator: &PathValidator,
        archive_path: &Path,
        dest_dir: &Path,
        select: Option<&EntrySelection>,
    ) -> Result<usize> {
        let mut archive = Archive::new(archive_path)
            .open_for_processing()
            .map_err(|e| map_unrar_error(e, archive_path))?;
        let mut written = 0;

        while let Some(header) = archive
            .read_header()
            .map_err(|e| map_unrar_error(e, archive_path))?
        {
            let raw_path = header.entry().filename.to_string_lossy().into_owned();
            let relative = match select {
                Some(selection) => selection.map(&raw_path),
                None => Some(normalize_entry_path(&raw_path)),
            }
            .filter(|relative| !relative.is_empty());

            archive = match relative {
                Some(relative) => {
                    let out_path = validator.validate_extraction_path(&relative, dest_dir)?;
                    written += 1;
                    if header.entry().is_directory() {
                        std::fs::create_dir_all(&out_path)?;
                        header.skip()
                    } else {
                        if let Some(parent) = out_path.parent() {
                            std::fs::create_dir_all(parent)?;
                        }
                        header.extract_to(&out_path)
                    }
                }
                None => header.skip(),
            }
            .map_err(|e| map_unrar_error(e, archive_path))?;
        }

        Ok(written)
    }
}

#[async_trait]
impl Engine for UnrarEngine {
    fn id(&self) -> &str {
        "unrar"
    }

    async fn load_entries(&self, archive: &Path) -> Result<Vec<ArchiveEntry>> {
        let archive_path = archive.to_path_buf();

        tokio::task::spawn_blocking(move || {
            let listing = Archive::new(&archive_path)
                .open_for_listing()
                .map_err(|e| map_unrar_error(e, &archive_path))?;

            let mut entries = Vec::new();
            for header in listing {
                let header = header.map_err(|e| map_unrar_error(e, &archive_path))?;
                if header.is_encrypted() {
                    return Err(AppError::password_required(&archive_path));
                }
                let kind = if header.is_directory() {
                    EntryKind::Directory
                } else {
                    EntryKind::File
                };
                let entry = ArchiveEntry::new(header.filename.to_string_lossy(), kind)
                    .with_sizes(-1, header.unpacked_size as i64)
                    .with_modified(from_dos_time(header.file_time));
                if !entry.path.is_empty() {
                    entries.push(entry);
                }
            }

            debug!(archive = %archive_path.display(), count = entries.len(), "Listed RAR entries");
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
            Self::extract_sync(&validator, &archive_path, &dest, None).map(|_| ())
        })
        .await?
    }
}

fn map_unrar_error(error: unrar::error::UnrarError, path: &Path) -> AppError {
    let message = error.to_string();
    if mentions_password(&message) {
        AppError::password_required(path)
    } else {
        AppError::invalid_archive(
            format!("Failed to read RAR archive: {}", message),
            Some(path.to_path_buf()),
        )
    }
}

/// MS-DOS 日期时间（高 16 位日期，低 16 位时间）
fn from_dos_time(value: u32) -> Option<NaiveDateTime> {
    let date = value >> 16;
    let time = value & 0xFFFF;
    NaiveDate::from_ymd_opt(
        ((date >> 9) & 0x7F) as i32 + 1980,
        (date >> 5) & 0x0F,
        date & 0x1F,
    )?
    .and_hms_opt(time >> 11, (time >> 5) & 0x3F, (time & 0x1F) * 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dos_time_conversion() {
        // 2024-03-15 10:30:20
        let date = ((2024 - 1980) << 9) | (3 << 5) | 15;
        let time = (10 << 11) | (30 << 5) | 10;
        let parsed = from_dos_time((date << 16) | time).unwrap();
        assert_eq!(parsed.to_string(), "2024-03-15 10:30:20");
    }

    #[test]
    fn test_invalid_dos_time() {
        assert!(from_dos_time(0).is_none());
    }

    #[tokio::test]
    async fn test_garbage_is_rejected() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let source = temp_dir.path().join("broken.rar");
        std::fs::write(&source, b"Rar!\x1a\x07\x00garbage").unwrap();

        assert!(UnrarEngine::new().load_entries(&source).await.is_err());
    }
}
