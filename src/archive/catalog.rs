//! Format catalog
//!
//! Declarative registry of every archive type the application knows about and
//! of the compound chains (`tar.gz` = `tar` wrapped in `gzip`). The catalog is
//! loaded once from TOML and is read-only afterwards.
//!
//! A malformed source never aborts the process: [`FormatCatalog::load`] logs
//! the error and returns an empty catalog, which makes every detection call
//! report "not an archive".

use crate::error::{AppError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info};

const BUILTIN_CATALOG: &str = include_str!("formats.toml");

/// Broad family of a format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveKind {
    Archive,
    Compression,
    DiskImage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MagicPolicy {
    Any,
    All,
}

/// One byte-signature test: `bytes` expected at `offset`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MagicTest {
    pub offset: usize,
    #[serde(deserialize_with = "deserialize_hex", serialize_with = "serialize_hex")]
    pub bytes: Vec<u8>,
}

impl MagicTest {
    pub fn matches(&self, buffer: &[u8]) -> bool {
        let end = match self.offset.checked_add(self.bytes.len()) {
            Some(end) => end,
            None => return false,
        };
        buffer
            .get(self.offset..end)
            .map(|window| window == self.bytes.as_slice())
            .unwrap_or(false)
    }

    /// Last byte this test needs to look at
    pub fn reach(&self) -> usize {
        self.offset + self.bytes.len()
    }
}

/// A group of tests combined under one policy
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MagicRule {
    pub policy: MagicPolicy,
    pub tests: Vec<MagicTest>,
}

impl MagicRule {
    pub fn matches(&self, buffer: &[u8]) -> bool {
        match self.policy {
            MagicPolicy::Any => self.tests.iter().any(|t| t.matches(buffer)),
            MagicPolicy::All => !self.tests.is_empty() && self.tests.iter().all(|t| t.matches(buffer)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EngineOption {
    pub id: String,
    #[serde(default)]
    pub default: bool,
}

/// A single archive or compression format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveTypeDescriptor {
    pub id: String,
    pub kind: ArchiveKind,
    pub name: String,
    #[serde(default)]
    pub system_types: Vec<String>,
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub magic: Vec<MagicRule>,
    #[serde(default)]
    pub engines: Vec<EngineOption>,
}

impl ArchiveTypeDescriptor {
    pub fn default_engine(&self) -> Option<&str> {
        self.engines
            .iter()
            .find(|option| option.default)
            .map(|option| option.id.as_str())
    }

    pub fn supports_engine(&self, engine_id: &str) -> bool {
        self.engines.iter().any(|option| option.id == engine_id)
    }

    pub fn matches_magic(&self, buffer: &[u8]) -> bool {
        self.magic.iter().any(|rule| rule.matches(buffer))
    }
}

/// A compound format such as `tar.gz`
///
/// `components` runs from the container (reported as the detected base type)
/// to the outermost compression layer (peeled first when loading).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositionDescriptor {
    pub id: String,
    pub name: String,
    pub components: Vec<String>,
    #[serde(default)]
    pub extensions: Vec<String>,
    /// Magic rules of the outer layer, filled in when the catalog is built
    #[serde(default, skip_deserializing)]
    pub magic: Vec<MagicRule>,
}

impl CompositionDescriptor {
    /// Container format id
    pub fn base(&self) -> &str {
        &self.components[0]
    }

    /// Outermost layer id
    pub fn outer(&self) -> &str {
        &self.components[self.components.len() - 1]
    }
}

#[derive(Debug, Deserialize)]
struct CatalogSource {
    #[serde(default)]
    types: Vec<ArchiveTypeDescriptor>,
    #[serde(default)]
    compositions: Vec<CompositionDescriptor>,
}

/// Read-only registry of formats and compositions
#[derive(Debug, Clone, Default)]
pub struct FormatCatalog {
    types: Vec<Arc<ArchiveTypeDescriptor>>,
    compositions: Vec<Arc<CompositionDescriptor>>,
}

impl FormatCatalog {
    /// Catalog with no formats; every detection reports no match
    pub fn empty() -> Self {
        Self::default()
    }

    /// Built-in catalog embedded in the binary
    pub fn builtin() -> Self {
        Self::from_toml_str(BUILTIN_CATALOG).unwrap_or_else(|e| {
            error!(error = %e, "Built-in format catalog is malformed, no formats available");
            Self::empty()
        })
    }

    /// Load a user catalog file, or the built-in one when `path` is `None`
    ///
    /// Never fails: a missing or malformed file degrades to an empty catalog.
    pub fn load(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::builtin();
        };

        let catalog = std::fs::read_to_string(path)
            .map_err(|e| AppError::Catalog(format!("Failed to read {}: {}", path.display(), e)))
            .and_then(|content| Self::from_toml_str(&content));

        match catalog {
            Ok(catalog) => {
                info!(
                    path = %path.display(),
                    types = catalog.types.len(),
                    compositions = catalog.compositions.len(),
                    "Loaded format catalog"
                );
                catalog
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Format catalog unavailable, no formats known");
                Self::empty()
            }
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let source: CatalogSource = toml::from_str(content)
            .map_err(|e| AppError::Catalog(format!("Failed to parse catalog: {}", e)))?;
        Self::from_parts(source.types, source.compositions)
    }

    /// Validate and assemble a catalog
    pub fn from_parts(
        types: Vec<ArchiveTypeDescriptor>,
        compositions: Vec<CompositionDescriptor>,
    ) -> Result<Self> {
        let mut seen = HashSet::new();
        for descriptor in &types {
            if !seen.insert(descriptor.id.as_str()) {
                return Err(AppError::Catalog(format!(
                    "Duplicate format id '{}'",
                    descriptor.id
                )));
            }
            let defaults = descriptor.engines.iter().filter(|o| o.default).count();
            if !descriptor.engines.is_empty() && defaults != 1 {
                return Err(AppError::Catalog(format!(
                    "Format '{}' must mark exactly one default engine, found {}",
                    descriptor.id, defaults
                )));
            }
            if descriptor.magic.iter().any(|rule| rule.tests.is_empty()) {
                return Err(AppError::Catalog(format!(
                    "Format '{}' has a magic rule without tests",
                    descriptor.id
                )));
            }
        }

        let types: Vec<Arc<ArchiveTypeDescriptor>> = types.into_iter().map(Arc::new).collect();

        let mut resolved = Vec::with_capacity(compositions.len());
        for mut composition in compositions {
            if composition.components.len() < 2 {
                return Err(AppError::Catalog(format!(
                    "Composition '{}' needs at least two components",
                    composition.id
                )));
            }
            for component in &composition.components {
                if !types.iter().any(|t| &t.id == component) {
                    return Err(AppError::Catalog(format!(
                        "Composition '{}' references unknown format '{}'",
                        composition.id, component
                    )));
                }
            }
            composition.magic = types
                .iter()
                .find(|t| t.id == composition.outer())
                .map(|t| t.magic.clone())
                .unwrap_or_default();
            resolved.push(Arc::new(composition));
        }

        debug!(
            types = types.len(),
            compositions = resolved.len(),
            "Format catalog assembled"
        );

        Ok(Self {
            types,
            compositions: resolved,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn all_types(&self) -> &[Arc<ArchiveTypeDescriptor>] {
        &self.types
    }

    pub fn type_by_id(&self, id: &str) -> Option<Arc<ArchiveTypeDescriptor>> {
        self.types.iter().find(|t| t.id == id).cloned()
    }

    pub fn find_type(
        &self,
        predicate: impl Fn(&ArchiveTypeDescriptor) -> bool,
    ) -> Option<Arc<ArchiveTypeDescriptor>> {
        self.types.iter().find(|t| predicate(t)).cloned()
    }

    pub fn all_compositions(&self) -> &[Arc<CompositionDescriptor>] {
        &self.compositions
    }

    pub fn composition_by_id(&self, id: &str) -> Option<Arc<CompositionDescriptor>> {
        self.compositions.iter().find(|c| c.id == id).cloned()
    }

    pub fn engine_options(&self, format_id: &str) -> &[EngineOption] {
        self.types
            .iter()
            .find(|t| t.id == format_id)
            .map(|t| t.engines.as_slice())
            .unwrap_or(&[])
    }

    pub fn default_engine(&self, format_id: &str) -> Option<&str> {
        self.types
            .iter()
            .find(|t| t.id == format_id)
            .and_then(|t| t.default_engine())
    }

    /// Number of leading bytes needed to evaluate every magic rule
    pub fn magic_reach(&self) -> usize {
        self.types
            .iter()
            .flat_map(|t| t.magic.iter())
            .flat_map(|rule| rule.tests.iter())
            .map(MagicTest::reach)
            .max()
            .unwrap_or(0)
    }
}

fn deserialize_hex<'de, D>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(&compact).map_err(serde::de::Error::custom)
}

fn serialize_hex<S>(bytes: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    let spaced = bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ");
    serializer.serialize_str(&spaced)
}
