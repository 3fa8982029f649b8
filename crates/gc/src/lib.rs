//! Mark-and-sweep collection of orphaned shard directories
//!
//! A leaf shard directory is garbage when it holds no `content` artifact:
//! it is empty, holds only ignorable OS metadata, or holds stray files left
//! by an interrupted write. A first-level shard is garbage when it holds no
//! leaves and nothing but ignorable files.
//!
//! Each call to [`GarbageCollector::clean_obsolete_content`] first marks new
//! garbage with the current time, then deletes garbage that was marked by an
//! earlier call and has stayed marked for longer than the grace period.
//! Content that shows up at a marked location clears the mark.
//!
//! A swept directory is first moved into the store's staging area and only
//! deleted once nothing live turned up inside it; content published into it
//! concurrently is moved back.

use contentrepo_core::{is_shard_name, ContentStore, GcConfig, Result, StoreConfig, CONTENT_NAME};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Outcome of one collection pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    /// Directories marked for the first time by this pass
    pub marked: BTreeSet<PathBuf>,
    /// Directories deleted by this pass
    pub deleted: BTreeSet<PathBuf>,
    /// Directories whose deletion failed, with the error
    pub failed: BTreeMap<PathBuf, String>,
}

impl GcReport {
    pub fn is_empty(&self) -> bool {
        self.marked.is_empty() && self.deleted.is_empty() && self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarkKind {
    /// `root/<xx>`
    Shard,
    /// `root/<xx>/<rest>`
    Leaf,
}

#[derive(Debug, Clone, Copy)]
struct PendingMark {
    kind: MarkKind,
    marked_at: SystemTime,
}

/// Two-phase collector over one store root
pub struct GarbageCollector {
    root: PathBuf,
    tmp_dir: PathBuf,
    config: GcConfig,
    marks: Mutex<HashMap<PathBuf, PendingMark>>,
}

impl GarbageCollector {
    /// Collector over `root`, staging sweeps in the default staging area
    pub fn new(root: impl Into<PathBuf>, config: GcConfig) -> Self {
        let root = root.into();
        let tmp_dir = root.join(StoreConfig::default().tmp_dir_name);
        Self {
            root,
            tmp_dir,
            config,
            marks: Mutex::new(HashMap::new()),
        }
    }

    /// Collector over the root of an open store
    pub fn for_store(store: &ContentStore, config: GcConfig) -> Self {
        Self::new(store.root(), config).with_tmp_dir(store.tmp_dir())
    }

    /// Stage sweeps in `tmp_dir`, which must be on the same volume as the root
    pub fn with_tmp_dir(mut self, tmp_dir: impl Into<PathBuf>) -> Self {
        self.tmp_dir = tmp_dir.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn grace_period(&self) -> Duration {
        self.config.grace_period()
    }

    /// Every directory currently marked, with the time it was first marked
    pub fn pending_marks(&self) -> BTreeMap<PathBuf, SystemTime> {
        self.marks
            .lock()
            .iter()
            .map(|(path, mark)| (path.clone(), mark.marked_at))
            .collect()
    }

    /// Run one mark pass and one sweep pass against the wall clock
    pub fn clean_obsolete_content(&self) -> Result<GcReport> {
        self.clean_obsolete_content_at(SystemTime::now())
    }

    /// Run one mark pass and one sweep pass as if the time were `now`
    pub fn clean_obsolete_content_at(&self, now: SystemTime) -> Result<GcReport> {
        let mut report = GcReport::default();
        let mut marks = self.marks.lock();

        // Drop marks whose directory vanished or gained content
        marks.retain(|path, mark| {
            let garbage = self.still_garbage(path, mark.kind);
            if !garbage {
                debug!("Unmarked {}", path.display());
            }
            garbage
        });

        for (path, kind) in self.scan()? {
            if marks.contains_key(&path) {
                continue;
            }
            debug!("Marked {}", path.display());
            marks.insert(path.clone(), PendingMark { kind, marked_at: now });
            report.marked.insert(path);
        }

        let grace = self.config.grace_period();
        let mut expired: Vec<(PathBuf, MarkKind)> = marks
            .iter()
            .filter(|(path, _)| !report.marked.contains(*path))
            .filter(|(_, mark)| {
                now.duration_since(mark.marked_at)
                    .map(|age| age > grace)
                    .unwrap_or(false)
            })
            .map(|(path, mark)| (path.clone(), mark.kind))
            .collect();

        // Leaves before shards, so a shard emptied by this sweep is handled once
        expired.sort_by(|a, b| {
            let depth = |path: &Path| path.components().count();
            depth(&b.0).cmp(&depth(&a.0)).then_with(|| a.0.cmp(&b.0))
        });

        for (path, kind) in expired {
            if !self.still_garbage(&path, kind) {
                marks.remove(&path);
                continue;
            }
            match self.sweep(&path, kind) {
                Ok(true) => {
                    marks.remove(&path);
                    self.remove_empty_shard(&path, kind, &mut marks);
                    report.deleted.insert(path);
                }
                Ok(false) => {
                    debug!("Content arrived in {} while sweeping", path.display());
                    marks.remove(&path);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    marks.remove(&path);
                }
                Err(e) => {
                    warn!("Failed to delete {}: {}", path.display(), e);
                    report.failed.insert(path, e.to_string());
                }
            }
        }

        if !report.is_empty() {
            info!(
                "GC marked {}, deleted {}, failed {}",
                report.marked.len(),
                report.deleted.len(),
                report.failed.len()
            );
        }
        Ok(report)
    }

    /// Every garbage directory currently under the root
    fn scan(&self) -> Result<Vec<(PathBuf, MarkKind)>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut garbage = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            if !name.to_str().is_some_and(is_shard_name) || !entry.file_type()?.is_dir() {
                continue;
            }

            let shard = entry.path();
            if self.is_empty_shard(&shard) {
                garbage.push((shard, MarkKind::Shard));
                continue;
            }

            for leaf in fs::read_dir(&shard)? {
                let leaf = leaf?;
                if leaf.file_type()?.is_dir() && !has_content(&leaf.path()) {
                    garbage.push((leaf.path(), MarkKind::Leaf));
                }
            }
        }
        Ok(garbage)
    }

    fn still_garbage(&self, path: &Path, kind: MarkKind) -> bool {
        match kind {
            MarkKind::Shard => path.is_dir() && self.is_empty_shard(path),
            MarkKind::Leaf => path.is_dir() && !has_content(path),
        }
    }

    /// No leaf directories and nothing but ignorable files
    fn is_empty_shard(&self, shard: &Path) -> bool {
        let Ok(entries) = fs::read_dir(shard) else {
            return false;
        };
        entries.flatten().all(|entry| {
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(true);
            !is_dir && entry.file_name().to_str().is_some_and(|name| self.config.is_ignorable(name))
        })
    }

    /// Move `path` aside, return anything live to where it was, then delete
    /// the rest. Returns false when live content had to be restored.
    fn sweep(&self, path: &Path, kind: MarkKind) -> io::Result<bool> {
        fs::create_dir_all(&self.tmp_dir)?;
        let holding = tempfile::Builder::new()
            .prefix("gc-")
            .keep(true)
            .tempdir_in(&self.tmp_dir)?;
        let holding = holding.path().to_path_buf();
        let moved = holding.join("swept");

        if let Err(e) = fs::rename(path, &moved) {
            let _ = fs::remove_dir(&holding);
            return Err(e);
        }

        // a failed restore leaves the holding directory in place
        let restored = match kind {
            MarkKind::Leaf => restore_leaf(&moved, path)?,
            MarkKind::Shard => {
                let mut restored = false;
                for leaf in fs::read_dir(&moved)? {
                    let leaf = leaf?;
                    if leaf.file_type()?.is_dir() {
                        restored |= restore_leaf(&leaf.path(), &path.join(leaf.file_name()))?;
                    }
                }
                restored
            }
        };

        fs::remove_dir_all(&holding)?;
        Ok(!restored)
    }

    /// Remove the parent of a deleted leaf once it has no other entries
    fn remove_empty_shard(&self, leaf: &Path, kind: MarkKind, marks: &mut HashMap<PathBuf, PendingMark>) {
        if kind != MarkKind::Leaf {
            return;
        }
        let Some(shard) = leaf.parent() else {
            return;
        };
        if shard == self.root {
            return;
        }
        // fails while siblings remain
        if fs::remove_dir(shard).is_ok() {
            debug!("Removed empty shard {}", shard.display());
            marks.remove(shard);
        }
    }
}

/// Whether a leaf holds a `content` file or exploded tree
fn has_content(leaf: &Path) -> bool {
    fs::symlink_metadata(leaf.join(CONTENT_NAME)).is_ok()
}

/// Put a moved leaf's `content` back at `original`, if it has one
fn restore_leaf(moved: &Path, original: &Path) -> io::Result<bool> {
    if !has_content(moved) {
        return Ok(false);
    }
    fs::create_dir_all(original)?;
    let target = original.join(CONTENT_NAME);
    match fs::rename(moved.join(CONTENT_NAME), &target) {
        Ok(()) => {}
        // the same hash was published again meanwhile
        Err(_) if fs::symlink_metadata(&target).is_ok() => {}
        Err(e) => return Err(e),
    }
    warn!("Restored content swept from {}", original.display());
    Ok(true)
}
