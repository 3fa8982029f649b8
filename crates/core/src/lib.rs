//! Content-addressed archive store
//!
//! This crate provides the storage layer:
//! - SHA-1 hashing and `root/<hh>/<rest>` shard addressing
//! - Flat and exploded (unzipped) artifacts with atomic publication
//! - Batched, all-or-nothing edits of exploded trees
//! - Secure path resolution, archive-aware reads and bounded walks
//! - Per-location locking between readers and removal

pub mod archive;
pub mod config;
pub mod error;
pub mod explode;
pub mod hash;
pub mod lock;
pub mod path;
pub mod store;
pub mod tree;

// Re-export main types for convenience
pub use config::{GcConfig, StoreConfig};
pub use error::{ContentError, Result};
pub use hash::{digest, is_shard_name, locate, ContentHash, ContentHasher, ContentLocation, CONTENT_NAME};
pub use lock::ContentLocks;
pub use path::{resolve_securely, walk, ContentEntry, ContentFilter, ContentWalk, EntryKind};
pub use store::{ContentHandle, ContentKind, ContentReference, ContentStore, ContentStream};
pub use tree::{hash_tree, ExplodedEntry};
