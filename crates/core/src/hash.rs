//! SHA-1 hashing primitives and shard addressing for content-addressed storage

use crate::error::{ContentError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Files above this size are hashed through a memory map
const MMAP_THRESHOLD: u64 = 4 * 1024 * 1024;

/// Name of the artifact inside a leaf shard directory
pub const CONTENT_NAME: &str = "content";

/// A SHA-1 content hash (20 bytes)
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ContentHash([u8; 20]);

impl ContentHash {
    /// Length of the hex rendering
    pub const HEX_LEN: usize = 40;

    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Lowercase hex rendering used for addressing
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from a 40 character hex string (either case)
    pub fn from_hex(value: &str) -> Result<Self> {
        if value.len() != Self::HEX_LEN {
            return Err(ContentError::InvalidHash {
                value: value.to_string(),
                reason: format!("expected {} characters, got {}", Self::HEX_LEN, value.len()),
            });
        }

        let mut bytes = [0u8; 20];
        hex::decode_to_slice(value, &mut bytes).map_err(|e| ContentError::InvalidHash {
            value: value.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for ContentHash {
    type Err = ContentError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Self::from_hex(&hex).map_err(serde::de::Error::custom)
    }
}

/// Hash bytes
pub fn digest(data: &[u8]) -> ContentHash {
    let mut hasher = ContentHasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Hash everything a reader yields (8KB buffer)
pub fn digest_reader<R: Read>(reader: &mut R) -> Result<ContentHash> {
    let mut hasher = ContentHasher::new();
    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(hasher.finalize())
}

/// Hash a file, memory-mapping it when it is large
pub fn digest_file(path: &Path) -> Result<ContentHash> {
    let file = File::open(path)?;
    let len = file.metadata()?.len();

    if len > MMAP_THRESHOLD {
        // SAFETY: store files are never modified in place once published
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        return Ok(digest(&mmap));
    }

    digest_reader(&mut BufReader::new(file))
}

/// Incremental hasher for building hashes across multiple chunks
pub struct ContentHasher {
    inner: Sha1,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self { inner: Sha1::new() }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finalize(self) -> ContentHash {
        let out = self.inner.finalize();
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&out);
        ContentHash(bytes)
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Filesystem location of a hash: `root/<hex[0:2]>/<hex[2:]>`
///
/// The leaf directory holds a single entry named `content`, which is a
/// regular file for flat artifacts and a directory for exploded ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentLocation {
    hash: ContentHash,
    leaf: PathBuf,
}

impl ContentLocation {
    pub fn hash(&self) -> ContentHash {
        self.hash
    }

    /// The leaf shard directory
    pub fn leaf(&self) -> &Path {
        &self.leaf
    }

    /// The two-character parent shard directory
    pub fn shard(&self) -> &Path {
        self.leaf.parent().unwrap_or(&self.leaf)
    }

    /// The `content` file or exploded tree root
    pub fn content_path(&self) -> PathBuf {
        self.leaf.join(CONTENT_NAME)
    }
}

/// Map a hash to its sharded location. Performs no I/O.
pub fn locate(root: &Path, hash: ContentHash) -> ContentLocation {
    let hex = hash.to_hex();
    let (prefix, rest) = hex.split_at(2);
    ContentLocation {
        hash,
        leaf: root.join(prefix).join(rest),
    }
}

/// Whether `name` can be a first-level shard directory (two lowercase hex digits)
pub fn is_shard_name(name: &str) -> bool {
    name.len() == 2 && name.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_known_digests() {
        assert_eq!(digest(b"").to_hex(), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
        assert_eq!(digest(b"abc").to_hex(), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn test_hash_consistency() {
        assert_eq!(digest(b"hello world"), digest(b"hello world"));
        assert_ne!(digest(b"hello"), digest(b"world"));
    }

    #[test]
    fn test_hex_parsing() {
        let hash = digest(b"abc");
        let upper = hash.to_hex().to_uppercase();
        assert_eq!(ContentHash::from_hex(&upper).unwrap(), hash);
        assert_eq!("a9993e364706816aba3e25717850c26c9cd0d89d".parse::<ContentHash>().unwrap(), hash);

        assert!(ContentHash::from_hex("abc").is_err());
        assert!(ContentHash::from_hex(&"g".repeat(40)).is_err());
    }

    #[test]
    fn test_incremental_matches_direct() {
        let mut incremental = ContentHasher::new();
        incremental.update(b"hello ");
        incremental.update(b"world");
        assert_eq!(incremental.finalize(), digest(b"hello world"));
    }

    #[test]
    fn test_digest_file_small_and_large() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;

        let small = temp_dir.path().join("small.txt");
        std::fs::write(&small, b"test file content")?;
        assert_eq!(digest_file(&small)?, digest(b"test file content"));

        let large = temp_dir.path().join("large.bin");
        let chunk = vec![0xAB; 1024 * 1024];
        let mut file = std::fs::File::create(&large)?;
        for _ in 0..5 {
            file.write_all(&chunk)?;
        }
        drop(file);

        let streamed = digest_reader(&mut std::fs::File::open(&large)?)?;
        assert_eq!(digest_file(&large)?, streamed);
        Ok(())
    }

    #[test]
    fn test_shard_names() {
        assert!(is_shard_name("a9"));
        assert!(!is_shard_name("tmp"));
        assert!(!is_shard_name("A9"));
        assert!(!is_shard_name("g0"));
    }

    #[test]
    fn test_locate_shards_by_prefix() {
        let hash = digest(b"abc");
        let location = locate(Path::new("/repo"), hash);
        assert_eq!(location.shard(), Path::new("/repo/a9"));
        assert_eq!(
            location.leaf(),
            Path::new("/repo/a9/993e364706816aba3e25717850c26c9cd0d89d")
        );
        assert_eq!(
            location.content_path(),
            Path::new("/repo/a9/993e364706816aba3e25717850c26c9cd0d89d/content")
        );
    }
}
