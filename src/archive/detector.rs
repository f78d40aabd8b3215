//! Archive type detection
//!
//! Resolution order: compound extension, plain extension, magic number. An
//! extension match always wins over magic bytes, so a renamed file is trusted
//! by name first. Compounds are only ever inferred from names.

use crate::archive::catalog::{ArchiveTypeDescriptor, CompositionDescriptor, FormatCatalog};
use serde::Serialize;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace};

/// Leading bytes scanned for magic numbers; covers the ISO descriptor at 0x9001
pub const MAGIC_SCAN_LEN: usize = 65_536;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionSource {
    Extension,
    Magic,
}

/// Result of a successful detection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionResult {
    pub archive_type: Arc<ArchiveTypeDescriptor>,
    pub composition: Option<Arc<CompositionDescriptor>>,
    pub source: DetectionSource,
}

impl DetectionResult {
    pub fn type_id(&self) -> &str {
        &self.archive_type.id
    }

    pub fn is_compound(&self) -> bool {
        self.composition.is_some()
    }
}

pub struct TypeDetector {
    catalog: Arc<FormatCatalog>,
}

impl TypeDetector {
    pub fn new(catalog: Arc<FormatCatalog>) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &Arc<FormatCatalog> {
        &self.catalog
    }

    /// Detect the format of the file at `path`
    ///
    /// `None` means "not an archive"; it is not an error.
    pub fn detect(&self, path: &Path, consider_composition: bool) -> Option<DetectionResult> {
        if let Some(result) = self.detect_by_name(path, consider_composition) {
            return Some(result);
        }

        let buffer = match read_head(path, MAGIC_SCAN_LEN) {
            Ok(buffer) => buffer,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Could not read file for magic detection");
                return None;
            }
        };

        self.detect_by_magic(&buffer).map(|archive_type| {
            debug!(path = %path.display(), format = %archive_type.id, "Detected by magic number");
            DetectionResult {
                archive_type,
                composition: None,
                source: DetectionSource::Magic,
            }
        })
    }

    /// Extension-only detection (steps 1 and 2)
    pub fn detect_by_name(&self, path: &Path, consider_composition: bool) -> Option<DetectionResult> {
        let name = path.file_name()?.to_string_lossy().to_lowercase();

        if consider_composition {
            for composition in self.catalog.all_compositions() {
                if has_extension(&name, &composition.extensions) {
                    let base = self.catalog.type_by_id(composition.base())?;
                    debug!(file = %name, composition = %composition.id, "Detected compound by extension");
                    return Some(DetectionResult {
                        archive_type: base,
                        composition: Some(Arc::clone(composition)),
                        source: DetectionSource::Extension,
                    });
                }
            }
        }

        let archive_type = self
            .catalog
            .find_type(|descriptor| has_extension(&name, &descriptor.extensions))?;
        trace!(file = %name, format = %archive_type.id, "Detected by extension");
        Some(DetectionResult {
            archive_type,
            composition: None,
            source: DetectionSource::Extension,
        })
    }

    /// First descriptor in catalog order whose magic rules accept `buffer`
    pub fn detect_by_magic(&self, buffer: &[u8]) -> Option<Arc<ArchiveTypeDescriptor>> {
        self.catalog
            .find_type(|descriptor| descriptor.matches_magic(buffer))
    }
}

/// `name` must already be lowercase
fn has_extension(name: &str, extensions: &[String]) -> bool {
    extensions.iter().any(|ext| {
        let ext = ext.to_lowercase();
        name.len() > ext.len() + 1
            && name.ends_with(&ext)
            && name.as_bytes()[name.len() - ext.len() - 1] == b'.'
    })
}

fn read_head(path: &Path, limit: usize) -> std::io::Result<Vec<u8>> {
    let file = File::open(path)?;
    let mut buffer = Vec::with_capacity(limit.min(8192));
    file.take(limit as u64).read_to_end(&mut buffer)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn detector() -> TypeDetector {
        TypeDetector::new(Arc::new(FormatCatalog::builtin()))
    }

    fn write(dir: &TempDir, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn tar_header() -> Vec<u8> {
        let mut data = vec![0u8; 1024];
        data[257..263].copy_from_slice(b"ustar\0");
        data
    }

    #[test]
    fn test_compound_extension_resolves_to_container() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "archive.tar.gz", &[0x1F, 0x8B, 0x08, 0x00]);

        let result = detector().detect(&path, true).unwrap();
        assert_eq!(result.type_id(), "tar");
        let composition = result.composition.unwrap();
        assert_eq!(composition.components, vec!["tar".to_string(), "gzip".to_string()]);
        assert_eq!(result.source, DetectionSource::Extension);
    }

    #[test]
    fn test_compound_ignored_without_composition() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "archive.tar.gz", &[0x1F, 0x8B, 0x08, 0x00]);

        let result = detector().detect(&path, false).unwrap();
        assert_eq!(result.type_id(), "gzip");
        assert!(result.composition.is_none());
    }

    #[test]
    fn test_extension_beats_magic() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "disguised.zip", &tar_header());

        let result = detector().detect(&path, true).unwrap();
        assert_eq!(result.type_id(), "zip");
        assert_eq!(result.source, DetectionSource::Extension);
    }

    #[test]
    fn test_magic_fallback_for_extensionless_file() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "payload", &tar_header());

        let result = detector().detect(&path, true).unwrap();
        assert_eq!(result.type_id(), "tar");
        assert_eq!(result.source, DetectionSource::Magic);
    }

    #[test]
    fn test_magic_never_infers_compound() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "blob", &[0x1F, 0x8B, 0x08, 0x00, 0x00]);

        let result = detector().detect(&path, true).unwrap();
        assert_eq!(result.type_id(), "gzip");
        assert!(!result.is_compound());
    }

    #[test]
    fn test_iso_requires_all_offsets() {
        let dir = TempDir::new().unwrap();
        let mut image = vec![0u8; 0x9001 + 16];
        image[0x8001..0x8006].copy_from_slice(b"CD001");
        image[0x8801..0x8806].copy_from_slice(b"CD001");
        let partial = write(&dir, "partial", &image);
        assert!(detector().detect(&partial, true).is_none());

        image[0x9001..0x9006].copy_from_slice(b"CD001");
        let full = write(&dir, "full", &image);
        assert_eq!(detector().detect(&full, true).unwrap().type_id(), "iso");
    }

    #[test]
    fn test_plain_text_is_not_an_archive() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "hello.txt", b"hello world");
        assert!(detector().detect(&path, true).is_none());
    }

    #[test]
    fn test_empty_catalog_detects_nothing() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "archive.zip", &[0x50, 0x4B, 0x03, 0x04]);
        let detector = TypeDetector::new(Arc::new(FormatCatalog::empty()));
        assert!(detector.detect(&path, true).is_none());
    }

    #[test]
    fn test_extension_match_is_case_insensitive() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "BACKUP.TGZ", &[]);
        let result = detector().detect(&path, true).unwrap();
        assert_eq!(result.composition.unwrap().id, "tar.gz");
    }

    #[test]
    fn test_bare_extension_name_is_not_a_match() {
        assert!(!has_extension("zip", &["zip".to_string()]));
        assert!(!has_extension("myzip", &["zip".to_string()]));
        assert!(has_extension("a.zip", &["zip".to_string()]));
    }
}
