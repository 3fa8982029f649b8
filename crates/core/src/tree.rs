//! Exploded tree hashing and batched tree edits

use crate::error::{ContentError, Result};
use crate::hash::{digest_file, ContentHash, ContentHasher, CONTENT_NAME};
use crate::path::{normalize_segments, relative_string};
use crate::store::ContentStore;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

const DIRECTORY_TAG: u8 = b'D';
const FILE_TAG: u8 = b'F';

/// Compute the hash of an exploded tree rooted at `root`.
///
/// Entries are folded in byte order of their `/`-separated relative path.
/// A directory contributes `D <path> NUL`, a file contributes
/// `F <path> NUL <digest of its bytes>`. An empty tree therefore hashes the
/// same as the empty byte sequence.
pub fn hash_tree(root: &Path) -> Result<ContentHash> {
    let mut entries: Vec<(String, Option<PathBuf>)> = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).follow_links(false) {
        let entry = entry?;
        let relative = relative_string(root, entry.path());
        if entry.file_type().is_dir() {
            entries.push((relative, None));
        } else if entry.file_type().is_file() {
            entries.push((relative, Some(entry.into_path())));
        }
    }
    entries.sort_unstable_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

    let mut hasher = ContentHasher::new();
    for (relative, file) in &entries {
        match file {
            None => {
                hasher.update(&[DIRECTORY_TAG]);
                hasher.update(relative.as_bytes());
                hasher.update(&[0]);
            }
            Some(path) => {
                hasher.update(&[FILE_TAG]);
                hasher.update(relative.as_bytes());
                hasher.update(&[0]);
                hasher.update(digest_file(path)?.as_bytes());
            }
        }
    }
    Ok(hasher.finalize())
}

/// Recursively copy the tree at `source` to `target`
pub(crate) fn copy_tree(source: &Path, target: &Path) -> Result<()> {
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry?;
        let relative = entry.path().strip_prefix(source).unwrap_or(entry.path());
        let destination = target.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&destination)?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &destination)?;
        }
    }
    Ok(())
}

/// One addition to an exploded tree
///
/// A payload creates or overwrites a file; no payload ensures an empty
/// directory exists.
pub struct ExplodedEntry {
    pub path: String,
    pub content: Option<Box<dyn Read + Send>>,
}

impl ExplodedEntry {
    pub fn file(path: impl Into<String>, content: impl Read + Send + 'static) -> Self {
        Self {
            path: path.into(),
            content: Some(Box::new(content)),
        }
    }

    pub fn directory(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: None,
        }
    }
}

impl std::fmt::Debug for ExplodedEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExplodedEntry")
            .field("path", &self.path)
            .field("has_content", &self.content.is_some())
            .finish()
    }
}

/// Remove directories above `removed` that it left empty, up to `root`
fn prune_empty_parents(root: &Path, removed: &Path) -> Result<()> {
    let mut current = removed.parent();
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        if fs::read_dir(dir)?.next().is_some() {
            break;
        }
        fs::remove_dir(dir)?;
        current = dir.parent();
    }
    Ok(())
}

fn join_segments(root: &Path, segments: &[String]) -> PathBuf {
    segments.iter().fold(root.to_path_buf(), |path, segment| path.join(segment))
}

impl ContentStore {
    /// Add files and directories to an exploded artifact.
    ///
    /// The whole batch is applied to a staged copy of the tree; the first
    /// conflict (an existing target while `overwrite` is false) discards the
    /// copy, so either every entry lands under the new hash or nothing does.
    /// The artifact at `hash` is never modified.
    pub fn add_content_to_exploded(
        &self,
        hash: ContentHash,
        entries: Vec<ExplodedEntry>,
        overwrite: bool,
    ) -> Result<ContentHash> {
        let targets = entries
            .iter()
            .map(|entry| {
                let segments = normalize_segments(&entry.path)?;
                if segments.is_empty() && entry.content.is_some() {
                    return Err(ContentError::file_not_found(entry.path.clone()));
                }
                Ok(segments)
            })
            .collect::<Result<Vec<_>>>()?;

        let tree_root = self.exploded_root(hash)?;
        let staged = self.stage()?;
        let staged_root = staged.path().join(CONTENT_NAME);
        copy_tree(&tree_root, &staged_root)?;

        for (entry, segments) in entries.into_iter().zip(targets) {
            let target = join_segments(&staged_root, &segments);
            let existing = fs::symlink_metadata(&target).ok();
            let conflict = || ContentError::ExplodedContentConflict {
                hash,
                path: segments.join("/"),
            };

            match entry.content {
                Some(mut reader) => {
                    if let Some(metadata) = existing {
                        if !overwrite {
                            return Err(conflict());
                        }
                        if metadata.is_dir() {
                            fs::remove_dir_all(&target)?;
                        }
                    }
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    let mut file = File::create(&target)?;
                    io::copy(&mut reader, &mut file)?;
                }
                None => match existing {
                    Some(metadata) if metadata.is_dir() => {}
                    Some(_) => {
                        if !overwrite {
                            return Err(conflict());
                        }
                        fs::remove_file(&target)?;
                        fs::create_dir_all(&target)?;
                    }
                    None => fs::create_dir_all(&target)?,
                },
            }
        }

        let updated = hash_tree(&staged_root)?;
        self.publish_tree(staged, updated)?;
        info!("Added entries to exploded content {} -> {}", hash, updated);
        Ok(updated)
    }

    /// Remove files or whole subtrees from an exploded artifact.
    ///
    /// Paths that do not exist are skipped. The artifact at `hash` is never
    /// modified.
    pub fn remove_content_from_exploded<I, S>(&self, hash: ContentHash, paths: I) -> Result<ContentHash>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let targets = paths
            .into_iter()
            .map(|path| normalize_segments(path.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        let tree_root = self.exploded_root(hash)?;
        let staged = self.stage()?;
        let staged_root = staged.path().join(CONTENT_NAME);
        copy_tree(&tree_root, &staged_root)?;

        for segments in targets.iter().filter(|segments| !segments.is_empty()) {
            let target = join_segments(&staged_root, segments);
            match fs::symlink_metadata(&target) {
                Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(&target)?,
                Ok(_) => fs::remove_file(&target)?,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("Nothing to remove at {} in {}", segments.join("/"), hash);
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
            prune_empty_parents(&staged_root, &target)?;
        }

        let updated = hash_tree(&staged_root)?;
        self.publish_tree(staged, updated)?;
        info!("Removed entries from exploded content {} -> {}", hash, updated);
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::hash::digest;

    fn open_store() -> anyhow::Result<(tempfile::TempDir, ContentStore)> {
        let dir = tempfile::tempdir()?;
        let store = ContentStore::open(&StoreConfig::new(dir.path().join("repo")))?;
        Ok((dir, store))
    }

    fn exploded_with(store: &ContentStore, files: &[(&str, &'static [u8])]) -> anyhow::Result<ContentHash> {
        let empty = store.add_content(None::<&[u8]>)?;
        let entries = files
            .iter()
            .map(|(path, data)| ExplodedEntry::file(*path, *data))
            .collect();
        Ok(store.add_content_to_exploded(empty, entries, false)?)
    }

    #[test]
    fn test_tree_hash_is_structural() -> anyhow::Result<()> {
        let a = tempfile::tempdir()?;
        let b = tempfile::tempdir()?;
        for dir in [a.path(), b.path()] {
            fs::create_dir_all(dir.join("x"))?;
            fs::write(dir.join("x/file.txt"), b"same bytes")?;
        }
        assert_eq!(hash_tree(a.path())?, hash_tree(b.path())?);

        // same bytes under a different path
        fs::rename(b.path().join("x"), b.path().join("y"))?;
        assert_ne!(hash_tree(a.path())?, hash_tree(b.path())?);

        // an empty directory is part of the structure
        fs::create_dir_all(a.path().join("empty"))?;
        let with_empty = hash_tree(a.path())?;
        fs::remove_dir(a.path().join("empty"))?;
        assert_ne!(with_empty, hash_tree(a.path())?);
        Ok(())
    }

    #[test]
    fn test_empty_tree_matches_empty_bytes() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        assert_eq!(hash_tree(dir.path())?, digest(b""));
        Ok(())
    }

    #[test]
    fn test_add_entries_produces_new_hash() -> anyhow::Result<()> {
        let (_dir, store) = open_store()?;
        let base = exploded_with(&store, &[("index.html", b"<html/>")])?;

        let updated = store.add_content_to_exploded(
            base,
            vec![
                ExplodedEntry::file("WEB-INF/web.xml", &b"<web-app/>"[..]),
                ExplodedEntry::directory("static/img"),
            ],
            false,
        )?;

        assert_ne!(base, updated);
        assert!(store.has_content(base));
        let tree = store.locate(updated).content_path();
        assert_eq!(fs::read(tree.join("WEB-INF/web.xml"))?, b"<web-app/>");
        assert!(tree.join("static/img").is_dir());
        assert!(!store.locate(base).content_path().join("WEB-INF").exists());
        Ok(())
    }

    #[test]
    fn test_conflicting_batch_commits_nothing() -> anyhow::Result<()> {
        let (dir, store) = open_store()?;
        let base = exploded_with(&store, &[("index.html", b"<html/>")])?;
        let before = hash_tree(&store.locate(base).content_path())?;

        let result = store.add_content_to_exploded(
            base,
            vec![
                ExplodedEntry::file("new.txt", &b"new"[..]),
                ExplodedEntry::file("index.html", &b"replaced"[..]),
            ],
            false,
        );

        assert!(matches!(result, Err(ContentError::ExplodedContentConflict { .. })));
        assert_eq!(hash_tree(&store.locate(base).content_path())?, before);
        assert_eq!(before, base);
        // staging was discarded
        let staging = dir.path().join("repo/tmp");
        assert_eq!(fs::read_dir(staging)?.count(), 0);
        Ok(())
    }

    #[test]
    fn test_overwrite_replaces_file() -> anyhow::Result<()> {
        let (_dir, store) = open_store()?;
        let base = exploded_with(&store, &[("index.html", b"<html/>")])?;

        let updated = store.add_content_to_exploded(
            base,
            vec![ExplodedEntry::file("index.html", &b"replaced"[..])],
            true,
        )?;
        let expected = exploded_with(&store, &[("index.html", b"replaced")])?;
        assert_eq!(updated, expected);
        Ok(())
    }

    #[test]
    fn test_add_then_remove_round_trips() -> anyhow::Result<()> {
        let (_dir, store) = open_store()?;
        let base = exploded_with(&store, &[("index.html", b"<html/>")])?;

        let added = store.add_content_to_exploded(
            base,
            vec![
                ExplodedEntry::file("a.txt", &b"a"[..]),
                ExplodedEntry::directory("logs"),
            ],
            false,
        )?;
        let removed = store.remove_content_from_exploded(added, ["a.txt", "logs"])?;
        assert_eq!(removed, base);
        Ok(())
    }

    #[test]
    fn test_add_then_remove_nested_round_trips() -> anyhow::Result<()> {
        let (_dir, store) = open_store()?;
        let base = exploded_with(&store, &[("index.html", b"<html/>")])?;

        let added = store.add_content_to_exploded(
            base,
            vec![
                ExplodedEntry::file("WEB-INF/web.xml", &b"<web-app/>"[..]),
                ExplodedEntry::file("WEB-INF/lib/deep/dep.jar", &b"jar"[..]),
            ],
            false,
        )?;
        let removed = store
            .remove_content_from_exploded(added, ["WEB-INF/web.xml", "WEB-INF/lib/deep/dep.jar"])?;
        assert_eq!(removed, base);
        assert!(!store.locate(removed).content_path().join("WEB-INF").exists());
        Ok(())
    }

    #[test]
    fn test_remove_keeps_populated_parents() -> anyhow::Result<()> {
        let (_dir, store) = open_store()?;
        let base = exploded_with(&store, &[("lib/a.jar", b"a"), ("lib/b.jar", b"b")])?;

        let removed = store.remove_content_from_exploded(base, ["lib/a.jar"])?;
        let expected = exploded_with(&store, &[("lib/b.jar", b"b")])?;
        assert_eq!(removed, expected);
        Ok(())
    }

    #[test]
    fn test_remove_subtree_and_missing_paths() -> anyhow::Result<()> {
        let (_dir, store) = open_store()?;
        let base = exploded_with(
            &store,
            &[("keep.txt", b"keep"), ("lib/a.jar", b"a"), ("lib/b.jar", b"b")],
        )?;

        let pruned = store.remove_content_from_exploded(base, ["lib", "does/not/exist"])?;
        let expected = exploded_with(&store, &[("keep.txt", b"keep")])?;
        assert_eq!(pruned, expected);
        Ok(())
    }

    #[test]
    fn test_edits_require_exploded_content() -> anyhow::Result<()> {
        let (_dir, store) = open_store()?;
        let flat = store.add_content(Some(&b"flat bytes"[..]))?;

        let result = store.add_content_to_exploded(flat, vec![ExplodedEntry::directory("d")], false);
        assert!(matches!(result, Err(ContentError::NotExploded { .. })));

        let result = store.remove_content_from_exploded(flat, ["x"]);
        assert!(matches!(result, Err(ContentError::NotExploded { .. })));

        let missing = digest(b"never stored");
        let result = store.remove_content_from_exploded(missing, ["x"]);
        assert!(matches!(result, Err(ContentError::ContentNotFound { .. })));
        Ok(())
    }

    #[test]
    fn test_edit_paths_cannot_escape() -> anyhow::Result<()> {
        let (_dir, store) = open_store()?;
        let base = store.add_content(None::<&[u8]>)?;

        let result = store.add_content_to_exploded(
            base,
            vec![ExplodedEntry::file("../../escape.txt", &b"x"[..])],
            true,
        );
        assert!(matches!(result, Err(ContentError::PathTraversal { .. })));

        let result = store.remove_content_from_exploded(base, ["a/../../x"]);
        assert!(matches!(result, Err(ContentError::PathTraversal { .. })));
        Ok(())
    }
}
