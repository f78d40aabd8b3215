use crate::archive::engine::{
    mentions_password, normalize_entry_path, write_entry_file, ArchiveEntry, Engine, EntryKind,
    EntrySelection,
};
use crate::archive::path_validator::PathValidator;
use crate::error::{AppError, Result};
use async_trait::async_trait;
use sevenz_rust::{Password, SevenZReader};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::debug;

/**
 * 7z 引擎 (sevenz-rust)
 */
#[derive(Debug, Default)]
pub struct SevenZEngine {
    validator: PathValidator,
}

impl SevenZEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn open(path: &Path) -> Result<SevenZReader<File>> {
        SevenZReader::open(path, Password::empty()).map_err(|e| map_sevenz_error(e, path))
    }

    fn extract_sync(
        validator: &PathValidator,
        archive_path: &Path,
        dest_dir: &Path,
        select: Option<&EntrySelection>,
    ) -> Result<usize> {
        let mut reader = Self::open(archive_path)?;
        let mut written = 0;
        // 回调只能返回 sevenz 的错误类型，自己的错误暂存后停止遍历
        let mut failure: Option<AppError> = None;

        reader
            .for_each_entries(|entry, data| {
                let relative = match select {
                    Some(selection) => match selection.map(entry.name()) {
                        Some(relative) => relative,
                        None => return Ok(true),
                    },
                    None => normalize_entry_path(entry.name()),
                };
                if relative.is_empty() {
                    return Ok(true);
                }

                let result = validator
                    .validate_extraction_path(&relative, dest_dir)
                    .and_then(|out_path| {
                        if entry.is_directory() {
                            std::fs::create_dir_all(&out_path).map_err(AppError::from)
                        } else {
                            write_entry_file(data, &out_path).map(|_| ())
                        }
                    });

                match result {
                    Ok(()) => {
                        written += 1;
                        Ok(true)
                    }
                    Err(e) => {
                        failure = Some(e);
                        Ok(false)
                    }
                }
            })
            .map_err(|e| map_sevenz_error(e, archive_path))?;

        match failure {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }
}

#[async_trait]
impl Engine for SevenZEngine {
    fn id(&self) -> &str {
        "sevenz"
    }

    async fn load_entries(&self, archive: &Path) -> Result<Vec<ArchiveEntry>> {
        let archive_path = archive.to_path_buf();

        tokio::task::spawn_blocking(move || {
            let reader = Self::open(&archive_path)?;
            let entries: Vec<ArchiveEntry> = reader
                .archive()
                .files
                .iter()
                .map(|file| {
                    let kind = if file.is_directory() {
                        EntryKind::Directory
                    } else {
                        EntryKind::File
                    };
                    let compressed = if file.has_stream {
                        file.compressed_size as i64
                    } else {
                        0
                    };
                    ArchiveEntry::new(file.name(), kind).with_sizes(compressed, file.size() as i64)
                })
                .filter(|entry| !entry.path.is_empty())
                .collect();

            debug!(archive = %archive_path.display(), count = entries.len(), "Listed 7z entries");
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
            debug!(archive = %archive_path.display(), written, "Extracted 7z archive");
            Ok(())
        })
        .await?
    }
}

fn map_sevenz_error(error: sevenz_rust::Error, path: &Path) -> AppError {
    let message = error.to_string();
    if mentions_password(&message) {
        AppError::password_required(path)
    } else {
        AppError::invalid_archive(
            format!("Failed to read 7z archive: {}", message),
            Some(path.to_path_buf()),
        )
    }
}
