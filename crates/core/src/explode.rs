//! Exploding archives into directory artifacts

use crate::archive;
use crate::error::{ContentError, Result};
use crate::hash::{ContentHash, CONTENT_NAME};
use crate::path::resolve_securely;
use crate::store::ContentStore;
use crate::tree::{copy_tree, hash_tree};
use std::fs;
use std::io;
use tracing::info;

impl ContentStore {
    /// Unzip the flat archive at `hash` into a new exploded artifact.
    ///
    /// The archive is recognised by its magic bytes. The flat artifact stays
    /// where it is; the returned hash addresses the exploded tree.
    pub fn explode_content(&self, hash: ContentHash) -> Result<ContentHash> {
        let source = self.locate(hash).content_path();
        match fs::metadata(&source) {
            Ok(metadata) if metadata.is_file() => {}
            Ok(_) => return Err(ContentError::NotAnArchive { path: source }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ContentError::ContentNotFound { hash });
            }
            Err(e) => return Err(e.into()),
        }
        if !archive::is_archive(&source) {
            return Err(ContentError::NotAnArchive { path: source });
        }

        let staged = self.stage()?;
        let staged_root = staged.path().join(CONTENT_NAME);
        let entries = archive::extract(&source, &staged_root)?;

        let exploded = hash_tree(&staged_root)?;
        self.publish_tree(staged, exploded)?;
        info!("Exploded {} ({} entries) -> {}", hash, entries, exploded);
        Ok(exploded)
    }

    /// Explode the archive at `relative_path` inside an exploded artifact.
    ///
    /// The archive file is replaced by a directory holding its entries, in a
    /// staged copy of the whole tree, and the copy is published under its
    /// new hash.
    pub fn explode_sub_content(&self, hash: ContentHash, relative_path: &str) -> Result<ContentHash> {
        let tree_root = self.exploded_root(hash)?;
        let source = resolve_securely(&tree_root, relative_path)?;
        if !source.is_file() {
            return Err(ContentError::file_not_found(relative_path));
        }
        if !archive::is_archive(&source) {
            return Err(ContentError::NotAnArchive { path: source });
        }

        let staged = self.stage()?;
        let staged_root = staged.path().join(CONTENT_NAME);
        copy_tree(&tree_root, &staged_root)?;

        let target = resolve_securely(&staged_root, relative_path)?;
        let packed = staged.path().join("packed");
        fs::rename(&target, &packed)?;
        let entries = archive::extract(&packed, &target)?;
        fs::remove_file(&packed)?;

        let exploded = hash_tree(&staged_root)?;
        self.publish_tree(staged, exploded)?;
        info!(
            "Exploded {} in {} ({} entries) -> {}",
            relative_path, hash, entries, exploded
        );
        Ok(exploded)
    }
}
