//! 单流压缩引擎
//!
//! gzip / bzip2 / xz / zstd / lz4 文件只包含一个数据流，列出时合成一个以
//! 文件主干名命名的条目（`archive.tar.lz4` -> `archive.tar`）。
//! 编解码器按魔数嗅探，不依赖扩展名。

use crate::archive::engine::{write_entry_file, ArchiveEntry, Engine, EntryKind};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::debug;

/// 支持的压缩流
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCodec {
    Gzip,
    Bzip2,
    Xz,
    Zstd,
    Lz4,
}

impl StreamCodec {
    /// 根据前几个字节识别编解码器
    pub fn sniff(head: &[u8]) -> Option<Self> {
        const SIGNATURES: &[(&[u8], StreamCodec)] = &[
            (&[0x1F, 0x8B], StreamCodec::Gzip),
            (b"BZh", StreamCodec::Bzip2),
            (&[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00], StreamCodec::Xz),
            (&[0x28, 0xB5, 0x2F, 0xFD], StreamCodec::Zstd),
            (&[0x04, 0x22, 0x4D, 0x18], StreamCodec::Lz4),
        ];
        SIGNATURES
            .iter()
            .find(|(magic, _)| head.starts_with(magic))
            .map(|(_, codec)| *codec)
    }

    fn decoder(self, file: File) -> Result<Box<dyn Read>> {
        let reader = BufReader::new(file);
        Ok(match self {
            StreamCodec::Gzip => Box::new(flate2::read::MultiGzDecoder::new(reader)),
            StreamCodec::Bzip2 => Box::new(bzip2::read::MultiBzDecoder::new(reader)),
            StreamCodec::Xz => Box::new(xz2::read::XzDecoder::new_multi_decoder(reader)),
            StreamCodec::Zstd => Box::new(zstd::stream::read::Decoder::with_buffer(reader)?),
            StreamCodec::Lz4 => Box::new(lz4_flex::frame::FrameDecoder::new(reader)),
        })
    }
}

#[derive(Debug, Default)]
pub struct StreamEngine;

impl StreamEngine {
    pub fn new() -> Self {
        Self
    }

    /// 合成条目名：去掉最后一个扩展名，无主干时用 "data"
    pub fn entry_name(archive: &Path) -> String {
        archive
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .filter(|stem| !stem.is_empty())
            .unwrap_or_else(|| "data".to_string())
    }

    fn sniff_file(path: &Path) -> Result<StreamCodec> {
        let mut head = [0u8; 8];
        let mut file = File::open(path)?;
        let read = file.read(&mut head)?;
        StreamCodec::sniff(&head[..read]).ok_or_else(|| {
            AppError::invalid_archive(
                "Unrecognized compression stream",
                Some(path.to_path_buf()),
            )
        })
    }

    fn decompress_sync(archive: &Path, out_path: &Path) -> Result<u64> {
        let codec = Self::sniff_file(archive)?;
        let mut decoder = codec.decoder(File::open(archive)?)?;
        write_entry_file(&mut decoder, out_path).map_err(|e| {
            // 截断或损坏的流在读取时才报错
            AppError::extraction_failed(
                format!("Failed to decompress {:?} stream: {}", codec, e),
                Some(archive.to_path_buf()),
            )
        })
    }
}

#[async_trait]
impl Engine for StreamEngine {
    fn id(&self) -> &str {
        "stream"
    }

    async fn load_entries(&self, archive: &Path) -> Result<Vec<ArchiveEntry>> {
        let archive_path = archive.to_path_buf();

        tokio::task::spawn_blocking(move || {
            let codec = Self::sniff_file(&archive_path)?;
            let compressed = std::fs::metadata(&archive_path)?.len() as i64;
            let entry = ArchiveEntry::new(Self::entry_name(&archive_path), EntryKind::File)
                .with_sizes(compressed, -1);
            debug!(archive = %archive_path.display(), codec = ?codec, entry = %entry.path, "Listed compressed stream");
            Ok(vec![entry])
        })
        .await?
    }

    async fn extract_entry(
        &self,
        entry: &ArchiveEntry,
        archive: &Path,
        dest_dir: &Path,
    ) -> Result<Option<PathBuf>> {
        let name = Self::entry_name(archive);
        if entry.path != name {
            return Ok(None);
        }

        let archive_path = archive.to_path_buf();
        let out_path = dest_dir.join(&name);

        tokio::task::spawn_blocking(move || {
            let written = Self::decompress_sync(&archive_path, &out_path)?;
            debug!(output = %out_path.display(), bytes = written, "Decompressed stream");
            Ok(Some(out_path))
        })
        .await?
    }

    async fn extract_all(&self, archive: &Path, dest_dir: &Path) -> Result<()> {
        let archive_path = archive.to_path_buf();
        let out_path = dest_dir.join(Self::entry_name(archive));

        tokio::task::spawn_blocking(move || Self::decompress_sync(&archive_path, &out_path).map(|_| ()))
            .await?
    }
}
