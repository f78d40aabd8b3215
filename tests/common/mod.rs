//! 集成测试公共夹具
//!
//! 所有归档都在运行时生成到临时目录中。

#![allow(dead_code)]

use archive_explorer::archive::{ArchiveServices, ArchiveState, ItemId};
use archive_explorer::config::Settings;
use archive_explorer::platform::LoggingOpener;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

/// 名称以 `/` 结尾的条目写为目录
pub fn zip_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut zip = ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for (name, content) in files {
        if name.ends_with('/') {
            zip.add_directory(*name, options).unwrap();
        } else {
            zip.start_file(*name, options).unwrap();
            zip.write_all(content).unwrap();
        }
    }
    zip.finish().unwrap().into_inner()
}

/// 在本地头（偏移 6）和中央目录头（偏移 8）的通用标志上置加密位
pub fn mark_zip_encrypted(bytes: &mut [u8]) {
    for i in 0..bytes.len().saturating_sub(4) {
        match &bytes[i..i + 4] {
            [0x50, 0x4b, 0x03, 0x04] => bytes[i + 6] |= 1,
            [0x50, 0x4b, 0x01, 0x02] => bytes[i + 8] |= 1,
            _ => {}
        }
    }
}

pub fn create_zip_archive(path: &Path, files: &[(&str, &[u8])]) {
    std::fs::write(path, zip_bytes(files)).unwrap();
}

pub fn tar_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, content) in files {
        let mut header = tar::Header::new_gnu();
        if name.ends_with('/') {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_mode(0o755);
            builder.append_data(&mut header, name, std::io::empty()).unwrap();
        } else {
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            builder.append_data(&mut header, name, *content).unwrap();
        }
    }
    builder.into_inner().unwrap()
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

pub fn lz4(data: &[u8]) -> Vec<u8> {
    let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::new());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// 临时目录中的设置：缓存和覆盖文件都不触碰用户目录
pub fn test_settings(temp_dir: &TempDir) -> Settings {
    let mut settings = Settings::default();
    settings.temp.cache_root = temp_dir.path().join("cache");
    settings.engines.overrides_file = Some(temp_dir.path().join("engines.json"));
    settings
}

pub fn test_services(temp_dir: &TempDir) -> ArchiveServices {
    ArchiveServices::from_settings(&test_settings(temp_dir))
}

pub fn test_state(services: &ArchiveServices) -> ArchiveState {
    services.new_state().with_opener(Arc::new(LoggingOpener))
}

pub fn child_named(state: &ArchiveState, parent: ItemId, name: &str) -> ItemId {
    state
        .children_sorted(parent)
        .into_iter()
        .find(|id| state.item(*id).map(|item| item.name == name).unwrap_or(false))
        .unwrap_or_else(|| panic!("'{}' not found", name))
}

pub fn child_names(state: &ArchiveState, parent: ItemId) -> Vec<String> {
    state
        .children_sorted(parent)
        .into_iter()
        .map(|id| state.item(id).unwrap().name)
        .collect()
}

pub fn write_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    path
}
