use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Write;
use std::path::Path;

use crate::digest::Digest;
use crate::error::{IoResultExt, PatchError, Result};
use crate::util;

pub const MAGIC: &[u8; 8] = b"DPATCH01";
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatchType {
    OneOff,
    /// Redefines the baseline; the layer reports `resulting_version` afterwards.
    Cumulative { resulting_version: String },
}

/// What a patch is built against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub product_name: String,
    pub product_version: String,
    pub patch_type: PatchType,
}

impl Identity {
    pub fn one_off(name: impl Into<String>, version: impl Into<String>) -> Self {
        Identity {
            product_name: name.into(),
            product_version: version.into(),
            patch_type: PatchType::OneOff,
        }
    }

    pub fn cumulative(
        name: impl Into<String>,
        version: impl Into<String>,
        resulting_version: impl Into<String>,
    ) -> Self {
        Identity {
            product_name: name.into(),
            product_version: version.into(),
            patch_type: PatchType::Cumulative {
                resulting_version: resulting_version.into(),
            },
        }
    }

    pub fn is_cumulative(&self) -> bool {
        matches!(self.patch_type, PatchType::Cumulative { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemType {
    MiscFile,
    Module,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModificationType {
    Add,
    Modify,
    Remove,
}

/// The thing a modification targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentItem {
    /// A plain file addressed by path segments below the distribution root.
    MiscFile { path: Vec<String> },
    /// A whole module directory inside the owning element's layer.
    Module { name: String, slot: String },
}

impl ContentItem {
    pub fn item_type(&self) -> ItemType {
        match self {
            ContentItem::MiscFile { .. } => ItemType::MiscFile,
            ContentItem::Module { .. } => ItemType::Module,
        }
    }

    /// Ordered path segments of the target.
    pub fn target_path(&self) -> Vec<String> {
        match self {
            ContentItem::MiscFile { path } => path.clone(),
            ContentItem::Module { name, slot } => name
                .split('.')
                .map(str::to_string)
                .chain(std::iter::once(slot.clone()))
                .collect(),
        }
    }
}

impl std::fmt::Display for ContentItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentItem::MiscFile { path } => write!(f, "misc:{}", path.join("/")),
            ContentItem::Module { name, slot } => write!(f, "module:{name}:{slot}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentModification {
    pub item: ContentItem,
    pub modification_type: ModificationType,
    /// Content after the modification; absent for REMOVE.
    pub new_hash: Option<Digest>,
    /// Content expected on disk before the modification; absent for ADD.
    pub existing_hash: Option<Digest>,
}

impl ContentModification {
    pub fn add(item: ContentItem, new_hash: Digest) -> Self {
        Self {
            item,
            modification_type: ModificationType::Add,
            new_hash: Some(new_hash),
            existing_hash: None,
        }
    }

    pub fn modify(item: ContentItem, existing_hash: Digest, new_hash: Digest) -> Self {
        Self {
            item,
            modification_type: ModificationType::Modify,
            new_hash: Some(new_hash),
            existing_hash: Some(existing_hash),
        }
    }

    pub fn remove(item: ContentItem, existing_hash: Digest) -> Self {
        Self {
            item,
            modification_type: ModificationType::Remove,
            new_hash: None,
            existing_hash: Some(existing_hash),
        }
    }

    pub fn item_type(&self) -> ItemType {
        self.item.item_type()
    }

    fn validate(&self, patch_id: &str) -> Result<()> {
        let ok = match self.modification_type {
            ModificationType::Add => self.new_hash.is_some() && self.existing_hash.is_none(),
            ModificationType::Modify => self.new_hash.is_some() && self.existing_hash.is_some(),
            ModificationType::Remove => self.new_hash.is_none() && self.existing_hash.is_some(),
        };
        if !ok {
            return Err(PatchError::invalid_patch(
                patch_id,
                format!(
                    "{:?} of {} has inconsistent content hashes",
                    self.modification_type, self.item
                ),
            ));
        }
        let segments = self.item.target_path();
        let bad = segments.is_empty()
            || segments
                .iter()
                .any(|s| s.is_empty() || s == "." || s == ".." || s.contains(['/', '\\']));
        if bad {
            return Err(PatchError::invalid_patch(
                patch_id,
                format!("{} has an unsafe target path", self.item),
            ));
        }
        Ok(())
    }
}

/// Changes to one layer of the distribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchElement {
    pub element_id: String,
    pub layer_name: String,
    pub is_add_on: bool,
    pub description: String,
    pub modifications: Vec<ContentModification>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub patch_id: String,
    pub description: String,
    pub identity: Identity,
    pub elements: Vec<PatchElement>,
    /// Misc-file changes not tied to a layer.
    pub modifications: Vec<ContentModification>,
}

impl Patch {
    pub fn is_cumulative(&self) -> bool {
        self.identity.is_cumulative()
    }

    /// Every modification in application order, paired with the layer it
    /// belongs to (`None` for top-level misc files).
    pub fn ordered_modifications(&self) -> Vec<(Option<&PatchElement>, &ContentModification)> {
        self.modifications
            .iter()
            .map(|m| (None, m))
            .chain(
                self.elements
                    .iter()
                    .flat_map(|e| e.modifications.iter().map(move |m| (Some(e), m))),
            )
            .collect()
    }

    /// Structural checks that do not need the installation.
    pub fn validate(&self) -> Result<()> {
        let id = self.patch_id.as_str();
        if id.trim().is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(PatchError::invalid_patch(id, "patch id must be a plain name"));
        }
        if let PatchType::Cumulative { resulting_version } = &self.identity.patch_type {
            if resulting_version.trim().is_empty() {
                return Err(PatchError::invalid_patch(
                    id,
                    "cumulative patch needs a resulting version",
                ));
            }
        }
        for m in &self.modifications {
            if m.item_type() == ItemType::Module {
                return Err(PatchError::invalid_patch(
                    id,
                    format!("{} must belong to a layer element", m.item),
                ));
            }
        }
        let mut layers = HashSet::new();
        for e in &self.elements {
            if e.element_id.trim().is_empty() || e.layer_name.trim().is_empty() {
                return Err(PatchError::invalid_patch(id, "element without id or layer"));
            }
            if !layers.insert(e.layer_name.as_str()) {
                return Err(PatchError::invalid_patch(
                    id,
                    format!("layer {} appears in more than one element", e.layer_name),
                ));
            }
        }

        let mut targets = HashSet::new();
        for (element, m) in self.ordered_modifications() {
            m.validate(id)?;
            let layer = element.map(|e| e.layer_name.as_str());
            if !targets.insert((layer, &m.item)) {
                return Err(PatchError::invalid_patch(
                    id,
                    format!("{} is modified more than once", m.item),
                ));
            }
        }
        Ok(())
    }
}

/// A patch plus every content blob it references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchBundle {
    pub version: u32,
    pub patch: Patch,
    pub contents: Vec<Vec<u8>>,
}

/// Read a bundle file: magic header, then a zstd stream of the bincode body.
pub fn read_bundle(path: &Path) -> Result<PatchBundle> {
    // mmap the bundle, check magic, then stream-decompress into bincode
    // (avoids allocating a full decompressed Vec)
    let raw = util::mmap_file(path)?;
    let invalid = |reason: String| PatchError::InvalidBundle {
        path: path.to_path_buf(),
        reason,
    };

    if raw.len() < MAGIC.len() || &raw[..MAGIC.len()] != MAGIC {
        return Err(invalid("missing magic header".to_string()));
    }

    let decoder = zstd::Decoder::new(&raw[MAGIC.len()..])
        .map_err(|e| invalid(format!("zstd decoder: {e}")))?;
    let bundle: PatchBundle = bincode::deserialize_from(decoder)
        .map_err(|e| invalid(format!("failed to deserialize bundle: {e}")))?;

    if bundle.version != FORMAT_VERSION {
        return Err(invalid(format!(
            "unsupported bundle version {} (expected {})",
            bundle.version, FORMAT_VERSION
        )));
    }
    Ok(bundle)
}

pub fn write_bundle(bundle: &PatchBundle, output: &Path) -> Result<()> {
    let encoded =
        bincode::serialize(bundle).map_err(|e| PatchError::codec("serialize patch bundle", e))?;
    let compressed = zstd::bulk::compress(&encoded, 3)
        .map_err(|e| PatchError::codec("compress patch bundle", e))?;

    let mut file = std::fs::File::create(output).at(output)?;
    file.write_all(MAGIC).at(output)?;
    file.write_all(&compressed).at(output)?;
    file.flush().at(output)
}

/// Counts reported back to the caller after an apply or rollback.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplySummary {
    pub files_added: usize,
    pub files_modified: usize,
    pub files_removed: usize,
    pub modules_added: usize,
    pub modules_modified: usize,
    pub modules_removed: usize,
}

impl ApplySummary {
    pub fn record(&mut self, m: &ContentModification) {
        let slot = match (m.item_type(), m.modification_type) {
            (ItemType::MiscFile, ModificationType::Add) => &mut self.files_added,
            (ItemType::MiscFile, ModificationType::Modify) => &mut self.files_modified,
            (ItemType::MiscFile, ModificationType::Remove) => &mut self.files_removed,
            (ItemType::Module, ModificationType::Add) => &mut self.modules_added,
            (ItemType::Module, ModificationType::Modify) => &mut self.modules_modified,
            (ItemType::Module, ModificationType::Remove) => &mut self.modules_removed,
        };
        *slot += 1;
    }

    pub fn total(&self) -> usize {
        self.files_added
            + self.files_modified
            + self.files_removed
            + self.modules_added
            + self.modules_modified
            + self.modules_removed
    }
}
