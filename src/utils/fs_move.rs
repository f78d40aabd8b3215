//! 把提取结果移动到目标目录
//!
//! 目录与已存在的同名目录合并，只有冲突的单个文件被覆盖，目标中原有的其他
//! 文件保持不动。文件与文件、文件与目录相撞时替换。每个文件优先 `rename`，
//! 跨设备等失败时复制后删除源。

use crate::error::{AppError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// 删除已存在的文件或目录
pub fn remove_existing(path: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    if metadata.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(())
}

/// 把 `source` 移动为 `dest_dir/<source 的文件名>`，返回新路径
pub fn move_into(source: &Path, dest_dir: &Path) -> Result<PathBuf> {
    let name = source.file_name().ok_or_else(|| {
        AppError::InvalidPath(format!("Source has no file name: {}", source.display()))
    })?;
    fs::create_dir_all(dest_dir)?;
    let target = dest_dir.join(name);

    let source_is_dir = fs::symlink_metadata(source)?.is_dir();
    if source_is_dir && is_real_dir(&target) {
        debug!(target = %target.display(), "Merging into existing directory");
        merge_dir(source, &target)?;
        remove_existing(source)?;
    } else {
        place(source, &target)?;
    }
    Ok(target)
}

fn is_real_dir(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|metadata| metadata.is_dir())
        .unwrap_or(false)
}

/// 把 `source` 放到 `target`，替换 `target` 上已有的项
fn place(source: &Path, target: &Path) -> Result<()> {
    if fs::symlink_metadata(target).is_ok() {
        debug!(target = %target.display(), "Replacing existing destination item");
        remove_existing(target)?;
    }

    if let Err(e) = fs::rename(source, target) {
        debug!(
            source = %source.display(),
            target = %target.display(),
            error = %e,
            "Rename failed, falling back to copy"
        );
        copy_recursive(source, target)?;
        remove_existing(source)?;
    }
    Ok(())
}

/// 逐项合并：缺少的目录创建，文件覆盖各自冲突的目标
fn merge_dir(source: &Path, target: &Path) -> Result<()> {
    // 先收集再移动，遍历过程中不修改正在读取的目录
    let entries = WalkDir::new(source)
        .min_depth(1)
        .into_iter()
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| {
            AppError::extraction_failed(
                format!("Failed to walk {}: {}", source.display(), e),
                Some(source.to_path_buf()),
            )
        })?;

    for entry in entries {
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| AppError::InvalidPath(e.to_string()))?;
        let out_path = target.join(relative);

        if entry.file_type().is_dir() {
            if !is_real_dir(&out_path) {
                if fs::symlink_metadata(&out_path).is_ok() {
                    remove_existing(&out_path)?;
                }
                fs::create_dir_all(&out_path)?;
            }
        } else {
            place(entry.path(), &out_path)?;
        }
    }
    Ok(())
}

fn copy_recursive(source: &Path, target: &Path) -> Result<()> {
    if source.is_file() {
        fs::copy(source, target)?;
        return Ok(());
    }

    for entry in WalkDir::new(source) {
        let entry = entry.map_err(|e| {
            AppError::extraction_failed(
                format!("Failed to walk {}: {}", source.display(), e),
                Some(source.to_path_buf()),
            )
        })?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| AppError::InvalidPath(e.to_string()))?;
        let out_path = target.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&out_path)?;
        } else {
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &out_path)?;
        }
    }
    Ok(())
}
