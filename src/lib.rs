//! Patch application and rollback for installed product distributions.
//!
//! A distribution tree is split into layers (the base product plus add-ons),
//! each independently versioned. One-off patches stack on top of a layer's
//! baseline; cumulative patches move the baseline and supersede the one-offs
//! below them. [`engine::Engine`] applies and rolls back both kinds, keeping
//! per-layer history and content backups under the tree's metadata directory.

pub mod applier;
pub mod builder;
pub mod config;
pub mod content_store;
pub mod digest;
pub mod engine;
pub mod error;
pub mod history;
pub mod journal;
pub mod lock;
pub mod logging;
pub mod patch_format;
pub mod util;

pub use config::EngineConfig;
pub use digest::Digest;
pub use engine::{Engine, InstalledIdentity, RestoredIdentity};
pub use error::{ErrorKind, PatchError, Result};
pub use history::{InstalledPatch, LayerInfo};
pub use patch_format::{ContentItem, ContentModification, Patch, PatchBundle, PatchElement};
