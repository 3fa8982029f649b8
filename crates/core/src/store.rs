//! On-disk content store
//!
//! Layout under the store root:
//! ```text
//! <root>/
//!   tmp/                staging for adds, tree edits and read snapshots
//!   a9/
//!     993e36...d89d/
//!       content         flat artifact (regular file)
//!   3f/
//!     0c2b...91aa/
//!       content/        exploded artifact (directory tree)
//! ```

use crate::archive;
use crate::config::StoreConfig;
use crate::error::{ContentError, Result};
use crate::hash::{digest, locate, ContentHash, ContentHasher, ContentLocation, CONTENT_NAME};
use crate::lock::ContentLocks;
use crate::path::{normalize_segments, resolve_securely, walk, ContentFilter, ContentWalk};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::{NamedTempFile, TempDir};
use tracing::{debug, info, warn};

/// Caller-owned (name, hash) pair naming content to remove
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentReference {
    pub name: String,
    pub hash: ContentHash,
}

impl ContentReference {
    pub fn new(name: impl Into<String>, hash: ContentHash) -> Self {
        Self {
            name: name.into(),
            hash,
        }
    }
}

/// Representation of the artifact at a location
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Flat,
    Exploded,
    Absent,
}

/// Where a hash lives and what currently sits there
#[derive(Debug, Clone)]
pub struct ContentHandle {
    pub location: ContentLocation,
    pub kind: ContentKind,
}

impl ContentHandle {
    pub fn hash(&self) -> ContentHash {
        self.location.hash()
    }

    pub fn path(&self) -> PathBuf {
        self.location.content_path()
    }
}

/// Private copy of read content, deleted when dropped
pub struct ContentStream {
    snapshot: NamedTempFile,
    len: u64,
}

impl ContentStream {
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Read for ContentStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.snapshot.read(buf)
    }
}

impl std::fmt::Debug for ContentStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentStream")
            .field("snapshot", &self.snapshot.path())
            .field("len", &self.len)
            .finish()
    }
}

/// Publication attempts repeated when a concurrent sweep removes the leaf
const PUBLISH_RETRIES: usize = 3;

/// Content-addressed store of flat and exploded artifacts
pub struct ContentStore {
    root: PathBuf,
    tmp_dir: PathBuf,
    locks: ContentLocks,
}

impl ContentStore {
    /// Open the store at `config.root`, creating the root and staging area
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let root = config.root.clone();
        let tmp_dir = root.join(&config.tmp_dir_name);
        fs::create_dir_all(&tmp_dir)?;

        info!("Opened content store at {}", root.display());
        Ok(Self {
            root,
            tmp_dir,
            locks: ContentLocks::new(config.lock_timeout()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    pub fn locks(&self) -> &ContentLocks {
        &self.locks
    }

    pub fn locate(&self, hash: ContentHash) -> ContentLocation {
        locate(&self.root, hash)
    }

    /// Store the bytes of `stream` and return their hash.
    ///
    /// `None` reserves an empty exploded tree under the hash of the empty byte
    /// sequence, to be filled through `add_content_to_exploded`. Content that
    /// is already present is left alone.
    pub fn add_content<R: Read>(&self, stream: Option<R>) -> Result<ContentHash> {
        let Some(mut reader) = stream else {
            return self.add_empty_tree();
        };

        let mut staged = tempfile::Builder::new()
            .prefix("add-")
            .tempfile_in(&self.tmp_dir)?;
        let mut hasher = ContentHasher::new();
        let mut buffer = [0u8; 8192];
        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
            staged.write_all(&buffer[..bytes_read])?;
        }
        staged.as_file().sync_all()?;
        let hash = hasher.finalize();

        let location = self.locate(hash);
        let target = location.content_path();
        if target.exists() {
            debug!("Content {} already stored", hash);
            return Ok(hash);
        }

        let mut pending = staged;
        let mut retries = 0;
        loop {
            fs::create_dir_all(location.leaf())?;
            match pending.persist_noclobber(&target) {
                Ok(_) => {
                    info!("Stored content {}", hash);
                    return Ok(hash);
                }
                Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                    debug!("Content {} stored concurrently", hash);
                    return Ok(hash);
                }
                // leaf collected between creating and filling it
                Err(e) if e.error.kind() == io::ErrorKind::NotFound && retries < PUBLISH_RETRIES => {
                    retries += 1;
                    pending = e.file;
                }
                Err(e) => return Err(e.error.into()),
            }
        }
    }

    /// Reserve the empty tree. An empty flat artifact at the same hash holds
    /// no bytes either, so it is swapped for the tree that can be grown.
    fn add_empty_tree(&self) -> Result<ContentHash> {
        let hash = digest(b"");
        let target = self.locate(hash).content_path();
        let staged = self.stage()?;
        fs::create_dir(staged.path().join(CONTENT_NAME))?;

        match fs::symlink_metadata(&target) {
            Ok(metadata) if metadata.is_dir() => {
                debug!("Empty tree {} already reserved", hash);
                Ok(hash)
            }
            Ok(_) => self.locks.with_exclusive(hash, || {
                if fs::symlink_metadata(&target).is_ok_and(|m| m.is_file()) {
                    fs::remove_file(&target)?;
                }
                self.publish_tree(staged, hash)?;
                info!("Replaced empty flat content {} with an empty tree", hash);
                Ok(hash)
            }),
            Err(_) => {
                self.publish_tree(staged, hash)?;
                Ok(hash)
            }
        }
    }

    /// Whether an artifact exists for `hash`. Never fails.
    pub fn has_content(&self, hash: ContentHash) -> bool {
        fs::symlink_metadata(self.locate(hash).content_path()).is_ok()
    }

    /// Location and current kind of `hash`; absence is reported, not raised
    pub fn get_content(&self, hash: ContentHash) -> ContentHandle {
        let location = self.locate(hash);
        let kind = match fs::metadata(location.content_path()) {
            Ok(metadata) if metadata.is_dir() => ContentKind::Exploded,
            Ok(_) => ContentKind::Flat,
            Err(_) => ContentKind::Absent,
        };
        ContentHandle { location, kind }
    }

    /// Delete the artifact named by `reference` and any shard directories
    /// left empty by it.
    ///
    /// Holds the location exclusively while deleting; readers that already
    /// took their snapshot are unaffected.
    pub fn remove_content(&self, reference: &ContentReference) -> Result<()> {
        let hash = reference.hash;
        let location = self.locate(hash);

        self.locks.with_exclusive(hash, || {
            let target = location.content_path();
            match fs::symlink_metadata(&target) {
                Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(&target)?,
                Ok(_) => fs::remove_file(&target)?,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("Content {} ({}) already absent", hash, reference.name);
                }
                Err(e) => return Err(e.into()),
            }
            self.prune_empty_ancestors(location.leaf());
            Ok(())
        })?;

        info!("Removed content {} ({})", hash, reference.name);
        Ok(())
    }

    /// Remove `dir` and then its parents while they are empty, stopping at the root
    pub(crate) fn prune_empty_ancestors(&self, dir: &Path) {
        let mut current = Some(dir);
        while let Some(dir) = current {
            if dir == self.root || !dir.starts_with(&self.root) {
                break;
            }
            match fs::remove_dir(dir) {
                Ok(()) => debug!("Removed empty shard {}", dir.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(_) => break,
            }
            current = dir.parent();
        }
    }

    /// Open a private snapshot of stored content.
    ///
    /// For flat content `relative_path` is ignored. For exploded content it is
    /// resolved inside the tree and may cross into archives within it. The
    /// bytes are copied aside while the location is shared, so a removal that
    /// starts afterwards cannot disturb the returned stream.
    pub fn read_content(&self, hash: ContentHash, relative_path: &str) -> Result<ContentStream> {
        let location = self.locate(hash);

        self.locks.with_shared(hash, || {
            let target = location.content_path();
            let mut source: Box<dyn Read + Send> = match fs::metadata(&target) {
                Ok(metadata) if metadata.is_dir() => {
                    let resolved = resolve_securely(&target, relative_path)?;
                    if resolved == target && hash == digest(b"") {
                        // the empty tree reads as the empty byte sequence
                        Box::new(io::empty())
                    } else {
                        archive::read_file(&resolved, &target)?
                    }
                }
                Ok(_) => Box::new(File::open(&target)?),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(ContentError::ContentNotFound { hash });
                }
                Err(e) => return Err(e.into()),
            };
            self.snapshot(&mut source)
        })
    }

    fn snapshot(&self, source: &mut dyn Read) -> Result<ContentStream> {
        let mut snapshot = tempfile::Builder::new()
            .prefix("read-")
            .tempfile_in(&self.tmp_dir)?;
        let len = io::copy(source, &mut snapshot)?;
        snapshot.seek(SeekFrom::Start(0))?;
        Ok(ContentStream { snapshot, len })
    }

    /// Lazily list entries below `path_prefix` of an artifact.
    ///
    /// Exploded trees are walked on disk; flat archives are listed from their
    /// central directory. Reported paths are relative to `path_prefix`.
    ///
    /// The location is shared only while the listing is opened. If the
    /// content is removed while the walk is consumed, the walk ends with
    /// `ContentNotFound`.
    pub fn list_content(
        &self,
        hash: ContentHash,
        path_prefix: &str,
        filter: ContentFilter,
    ) -> Result<ContentWalk> {
        let location = self.locate(hash);

        self.locks.with_shared(hash, || {
            let target = location.content_path();
            match fs::metadata(&target) {
                Ok(metadata) if metadata.is_dir() => {
                    let base = resolve_securely(&target, path_prefix)?;
                    if !base.is_dir() {
                        return Err(ContentError::file_not_found(path_prefix));
                    }
                    Ok(walk(&base, filter).of_content(hash))
                }
                Ok(_) => {
                    let prefix = normalize_segments(path_prefix)?;
                    if !archive::is_archive(&target) {
                        return Err(ContentError::NotAnArchive { path: target });
                    }
                    let entries = archive::list_entries(&target, &prefix, filter)?;
                    Ok(ContentWalk::listed(entries, filter))
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    Err(ContentError::ContentNotFound { hash })
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Tree root of an exploded artifact
    pub(crate) fn exploded_root(&self, hash: ContentHash) -> Result<PathBuf> {
        let target = self.locate(hash).content_path();
        match fs::metadata(&target) {
            Ok(metadata) if metadata.is_dir() => Ok(target),
            Ok(_) => Err(ContentError::NotExploded { hash }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(ContentError::ContentNotFound { hash })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fresh staging directory on the store's volume, removed when dropped
    pub(crate) fn stage(&self) -> Result<TempDir> {
        Ok(tempfile::Builder::new()
            .prefix("stage-")
            .tempdir_in(&self.tmp_dir)?)
    }

    /// Move `staged/content` to the location of `hash`.
    ///
    /// Returns false when the location was already populated, in which case
    /// the staged tree is discarded.
    pub(crate) fn publish_tree(&self, staged: TempDir, hash: ContentHash) -> Result<bool> {
        let location = self.locate(hash);
        let target = location.content_path();
        if fs::symlink_metadata(&target).is_ok() {
            debug!("Exploded content {} already stored", hash);
            return Ok(false);
        }

        let source = staged.path().join(CONTENT_NAME);
        let mut retries = 0;
        loop {
            fs::create_dir_all(location.leaf())?;
            match fs::rename(&source, &target) {
                Ok(()) => {
                    debug!("Published tree {}", hash);
                    return Ok(true);
                }
                Err(_) if fs::symlink_metadata(&target).is_ok() => {
                    debug!("Exploded content {} published concurrently", hash);
                    return Ok(false);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound && retries < PUBLISH_RETRIES => {
                    retries += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Delete leftovers in the staging area, e.g. after a crash.
    ///
    /// Only call this while no other operation is running on the store.
    pub fn purge_staging(&self) -> Result<usize> {
        let mut purged = 0;
        for entry in fs::read_dir(&self.tmp_dir)? {
            let entry = entry?;
            let result = if entry.file_type()?.is_dir() {
                fs::remove_dir_all(entry.path())
            } else {
                fs::remove_file(entry.path())
            };
            match result {
                Ok(()) => purged += 1,
                Err(e) => warn!("Failed to purge {}: {}", entry.path().display(), e),
            }
        }
        Ok(purged)
    }
}
