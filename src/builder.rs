//! Assemble [`PatchBundle`]s from raw content.
//!
//! Content bytes handed to the builder are hashed and carried in the bundle,
//! so the resulting bundle is self-contained:
//!
//! ```
//! use distpatch::builder::PatchBuilder;
//!
//! let bundle = PatchBuilder::one_off("p1", "WildFly", "1.0")
//!     .description("A one-off patch adding a misc file.")
//!     .add_misc(&["awesomeDirectory", "awesomeFile"], b"Hello World!")
//!     .element("layer-p1", "base", false, |e| {
//!         e.add_module("org.wildfly.awesomemodule", "main", &[("testFile1", b"content1")])
//!     })
//!     .build()
//!     .unwrap();
//! assert_eq!(bundle.patch.elements.len(), 1);
//! ```

use std::collections::HashSet;

use crate::content_store::ModuleManifest;
use crate::digest::Digest;
use crate::error::{PatchError, Result};
use crate::patch_format::{
    ContentItem, ContentModification, Identity, Patch, PatchBundle, PatchElement, FORMAT_VERSION,
};

/// Collects content blobs once per digest.
#[derive(Debug, Default)]
struct Contents {
    seen: HashSet<Digest>,
    blobs: Vec<Vec<u8>>,
    /// First failure while assembling, reported by `build`.
    error: Option<PatchError>,
}

impl Contents {
    fn add(&mut self, data: &[u8]) -> Digest {
        let digest = Digest::of(data);
        if self.seen.insert(digest) {
            self.blobs.push(data.to_vec());
        }
        digest
    }

    fn add_module(&mut self, entries: &[(&str, &[u8])]) -> Option<Digest> {
        let listed: Vec<(String, Digest)> = entries
            .iter()
            .map(|(path, bytes)| (path.to_string(), self.add(bytes)))
            .collect();
        match ModuleManifest::from_entries(listed).encode() {
            Ok(encoded) => Some(self.add(&encoded)),
            Err(e) => {
                self.fail(e);
                None
            }
        }
    }

    fn fail(&mut self, error: PatchError) {
        self.error.get_or_insert(error);
    }

    fn merge(&mut self, other: Contents) {
        for blob in &other.blobs {
            self.add(blob);
        }
        if let Some(e) = other.error {
            self.fail(e);
        }
    }
}

fn misc_item(path: &[&str]) -> ContentItem {
    ContentItem::MiscFile {
        path: path.iter().map(|s| s.to_string()).collect(),
    }
}

fn module_item(name: &str, slot: &str) -> ContentItem {
    ContentItem::Module {
        name: name.to_string(),
        slot: slot.to_string(),
    }
}

pub struct PatchBuilder {
    patch_id: String,
    description: String,
    identity: Identity,
    elements: Vec<PatchElement>,
    modifications: Vec<ContentModification>,
    contents: Contents,
}

impl PatchBuilder {
    pub fn one_off(patch_id: &str, product: &str, version: &str) -> Self {
        Self::new(patch_id, Identity::one_off(product, version))
    }

    pub fn cumulative(patch_id: &str, product: &str, version: &str, resulting: &str) -> Self {
        Self::new(patch_id, Identity::cumulative(product, version, resulting))
    }

    pub fn new(patch_id: &str, identity: Identity) -> Self {
        Self {
            patch_id: patch_id.to_string(),
            description: String::new(),
            identity,
            elements: Vec::new(),
            modifications: Vec::new(),
            contents: Contents::default(),
        }
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn add_misc(mut self, path: &[&str], content: &[u8]) -> Self {
        let new = self.contents.add(content);
        self.modifications
            .push(ContentModification::add(misc_item(path), new));
        self
    }

    pub fn modify_misc(mut self, path: &[&str], existing: &[u8], content: &[u8]) -> Self {
        let new = self.contents.add(content);
        self.modifications.push(ContentModification::modify(
            misc_item(path),
            Digest::of(existing),
            new,
        ));
        self
    }

    pub fn remove_misc(mut self, path: &[&str], existing: &[u8]) -> Self {
        self.modifications
            .push(ContentModification::remove(misc_item(path), Digest::of(existing)));
        self
    }

    /// Push a prepared modification; its content must be supplied via
    /// [`PatchBuilder::content`] unless already present in the target store.
    pub fn modification(mut self, modification: ContentModification) -> Self {
        self.modifications.push(modification);
        self
    }

    pub fn content(mut self, data: &[u8]) -> Self {
        self.contents.add(data);
        self
    }

    pub fn element<F>(mut self, element_id: &str, layer: &str, add_on: bool, f: F) -> Self
    where
        F: FnOnce(ElementBuilder) -> ElementBuilder,
    {
        let builder = f(ElementBuilder {
            element: PatchElement {
                element_id: element_id.to_string(),
                layer_name: layer.to_string(),
                is_add_on: add_on,
                description: String::new(),
                modifications: Vec::new(),
            },
            contents: Contents::default(),
        });
        self.contents.merge(builder.contents);
        self.elements.push(builder.element);
        self
    }

    pub fn build_patch(&self) -> Patch {
        Patch {
            patch_id: self.patch_id.clone(),
            description: self.description.clone(),
            identity: self.identity.clone(),
            elements: self.elements.clone(),
            modifications: self.modifications.clone(),
        }
    }

    /// Fails when module content could not be encoded.
    pub fn build(self) -> Result<PatchBundle> {
        let patch = self.build_patch();
        if let Some(e) = self.contents.error {
            return Err(e);
        }
        Ok(PatchBundle {
            version: FORMAT_VERSION,
            patch,
            contents: self.contents.blobs,
        })
    }
}

pub struct ElementBuilder {
    element: PatchElement,
    contents: Contents,
}

impl ElementBuilder {
    pub fn description(mut self, description: &str) -> Self {
        self.element.description = description.to_string();
        self
    }

    pub fn add_module(mut self, name: &str, slot: &str, entries: &[(&str, &[u8])]) -> Self {
        if let Some(new) = self.contents.add_module(entries) {
            self.element
                .modifications
                .push(ContentModification::add(module_item(name, slot), new));
        }
        self
    }

    pub fn modify_module(
        mut self,
        name: &str,
        slot: &str,
        existing: &[(&str, &[u8])],
        entries: &[(&str, &[u8])],
    ) -> Self {
        let existing = match module_digest(existing) {
            Ok(digest) => digest,
            Err(e) => {
                self.contents.fail(e);
                return self;
            }
        };
        if let Some(new) = self.contents.add_module(entries) {
            self.element.modifications.push(ContentModification::modify(
                module_item(name, slot),
                existing,
                new,
            ));
        }
        self
    }

    pub fn remove_module(mut self, name: &str, slot: &str, existing: &[(&str, &[u8])]) -> Self {
        match module_digest(existing) {
            Ok(existing) => self.element.modifications.push(ContentModification::remove(
                module_item(name, slot),
                existing,
            )),
            Err(e) => self.contents.fail(e),
        }
        self
    }

    /// Misc files may also be carried by an element; they are recorded
    /// against the element's layer.
    pub fn add_misc(mut self, path: &[&str], content: &[u8]) -> Self {
        let new = self.contents.add(content);
        self.element
            .modifications
            .push(ContentModification::add(misc_item(path), new));
        self
    }
}

/// Digest a module's content set without storing it.
pub fn module_digest(entries: &[(&str, &[u8])]) -> Result<Digest> {
    let manifest = ModuleManifest::from_entries(
        entries
            .iter()
            .map(|(path, bytes)| (path.to_string(), Digest::of(bytes))),
    );
    Ok(Digest::of(&manifest.encode()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contents_are_deduplicated() {
        let bundle = PatchBuilder::one_off("p1", "WildFly", "1.0")
            .add_misc(&["a"], b"same")
            .add_misc(&["b"], b"same")
            .build()
            .unwrap();
        assert_eq!(bundle.contents.len(), 1);
        assert_eq!(bundle.patch.modifications.len(), 2);
        bundle.patch.validate().unwrap();
    }

    #[test]
    fn test_module_element() {
        let entries: &[(&str, &[u8])] = &[("testFile1", b"content1"), ("testFile2", b"content2")];
        let bundle = PatchBuilder::cumulative("cp1", "WildFly", "1.0", "1.1")
            .element("layer-cp1", "base", false, |e| {
                e.description("New module for the base layer")
                    .add_module("patch.cumulative.awesomemodule", "main", entries)
            })
            .build()
            .unwrap();

        let element = &bundle.patch.elements[0];
        assert_eq!(element.layer_name, "base");
        let m = &element.modifications[0];
        assert_eq!(m.new_hash, Some(module_digest(entries).unwrap()));
        // two entries plus the manifest
        assert_eq!(bundle.contents.len(), 3);
        bundle.patch.validate().unwrap();
    }

    #[test]
    fn test_module_digest_matches_store() {
        let temp = tempfile::TempDir::new().unwrap();
        let store = crate::content_store::ContentStore::open(temp.path(), false).unwrap();
        let entries: &[(&str, &[u8])] = &[("lib/a.jar", b"a"), ("module.xml", b"<module/>")];
        let stored = store.put_module(entries).unwrap();
        assert_eq!(module_digest(entries).unwrap(), stored);

        let bundle = PatchBuilder::one_off("p1", "WildFly", "1.0")
            .element("e1", "base", false, |e| {
                e.modify_module("org.acme", "main", entries, &[("module.xml", b"<module/>")])
                    .remove_module("org.gone", "main", entries)
            })
            .build()
            .unwrap();
        let modifications = &bundle.patch.elements[0].modifications;
        assert_eq!(modifications.len(), 2);
        assert!(modifications.iter().all(|m| m.existing_hash == Some(stored)));
    }
}
