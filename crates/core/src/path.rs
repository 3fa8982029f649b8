//! Secure path resolution and bounded directory walking

use crate::archive;
use crate::error::{ContentError, Result};
use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Kind of a listed entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Directory,
}

/// One entry produced by a walk or listing
///
/// Directory paths carry a trailing `/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentEntry {
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
}

impl ContentEntry {
    pub fn file(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::File,
            size,
        }
    }

    pub fn directory(path: impl Into<String>) -> Self {
        let mut path = path.into();
        if !path.ends_with('/') {
            path.push('/');
        }
        Self {
            path,
            kind: EntryKind::Directory,
            size: 0,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Bounds for a walk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentFilter {
    /// Maximum depth below the walk root; -1 is unbounded
    pub depth: i32,
    /// Only report files that sniff as archives
    pub archive_only: bool,
    /// Suppress directory entries
    pub files_only: bool,
}

impl ContentFilter {
    pub fn new(depth: i32, archive_only: bool) -> Self {
        Self {
            depth,
            archive_only,
            files_only: false,
        }
    }

    /// File filter variant: same bounds, no directory entries
    pub fn files(depth: i32, archive_only: bool) -> Self {
        Self {
            depth,
            archive_only,
            files_only: true,
        }
    }

    /// Everything, at any depth
    pub fn all() -> Self {
        Self::new(-1, false)
    }

    pub(crate) fn max_depth(&self) -> usize {
        if self.depth < 0 {
            usize::MAX
        } else {
            self.depth as usize
        }
    }
}

impl Default for ContentFilter {
    fn default() -> Self {
        Self::all()
    }
}

/// Split a user path into normalized segments.
///
/// Backslashes count as separators, empty and `.` segments are dropped and
/// `..` pops the previous segment. Popping past the start is a traversal.
pub fn normalize_segments(user_path: &str) -> Result<Vec<String>> {
    let mut segments: Vec<String> = Vec::new();
    for segment in user_path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(ContentError::traversal(user_path));
                }
            }
            other => segments.push(other.to_string()),
        }
    }
    Ok(segments)
}

/// Resolve `user_path` under `root`, rejecting anything that lands outside it.
///
/// No I/O is performed.
pub fn resolve_securely(root: &Path, user_path: &str) -> Result<PathBuf> {
    let segments = normalize_segments(user_path)?;
    let mut resolved = root.to_path_buf();
    for segment in &segments {
        resolved.push(segment);
    }

    if !resolved.starts_with(root) {
        return Err(ContentError::traversal(user_path));
    }
    Ok(resolved)
}

/// Render a path relative to `root` with `/` separators
pub(crate) fn relative_string(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

enum WalkSource {
    Tree { root: PathBuf, inner: walkdir::IntoIter },
    Listed(std::vec::IntoIter<ContentEntry>),
}

/// Lazy walk over a tree or an archive listing
///
/// Finite; walking again means calling [`walk`] again. A walk over stored
/// content that is removed while it is being consumed ends with a single
/// `ContentNotFound` error.
pub struct ContentWalk {
    source: WalkSource,
    filter: ContentFilter,
    content: Option<ContentHash>,
}

impl ContentWalk {
    /// Report the tree vanishing from under the walk as removal of `hash`
    pub(crate) fn of_content(mut self, hash: ContentHash) -> Self {
        self.content = Some(hash);
        self
    }

    fn vanished(&mut self) -> Option<ContentError> {
        let hash = self.content?;
        match &self.source {
            WalkSource::Tree { root, .. } if !root.exists() => {
                self.source = WalkSource::Listed(Vec::new().into_iter());
                Some(ContentError::ContentNotFound { hash })
            }
            _ => None,
        }
    }

    pub(crate) fn listed(entries: Vec<ContentEntry>, filter: ContentFilter) -> Self {
        Self {
            source: WalkSource::Listed(entries.into_iter()),
            filter,
            content: None,
        }
    }

    fn convert(&self, root: &Path, entry: &walkdir::DirEntry) -> Result<Option<ContentEntry>> {
        let relative = relative_string(root, entry.path());
        let file_type = entry.file_type();

        if file_type.is_dir() {
            if self.filter.files_only {
                return Ok(None);
            }
            return Ok(Some(ContentEntry::directory(relative)));
        }

        if !file_type.is_file() {
            return Ok(None);
        }
        if self.filter.archive_only && !archive::is_archive(entry.path()) {
            return Ok(None);
        }
        let size = entry.metadata()?.len();
        Ok(Some(ContentEntry::file(relative, size)))
    }
}

impl Iterator for ContentWalk {
    type Item = Result<ContentEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (root, entry) = match &mut self.source {
                WalkSource::Listed(entries) => return entries.next().map(Ok),
                WalkSource::Tree { root, inner } => match inner.next()? {
                    Ok(entry) => (root.clone(), entry),
                    Err(e) => {
                        let error = e.into();
                        return Some(Err(self.vanished().unwrap_or(error)));
                    }
                },
            };

            match self.convert(&root, &entry) {
                Ok(Some(entry)) => return Some(Ok(entry)),
                Ok(None) => continue,
                Err(e) => return Some(Err(self.vanished().unwrap_or(e))),
            }
        }
    }
}

/// Walk `root` depth-first in file name order, bounded by `filter`.
///
/// Reported paths are relative to `root`.
pub fn walk(root: &Path, filter: ContentFilter) -> ContentWalk {
    let inner = WalkDir::new(root)
        .min_depth(1)
        .max_depth(filter.max_depth())
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();

    ContentWalk {
        source: WalkSource::Tree {
            root: root.to_path_buf(),
            inner,
        },
        filter,
        content: None,
    }
}
