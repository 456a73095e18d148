//! Content fingerprints and the on-disk archive cache used by classpath imports.
//!
//! ## On-disk layout
//!
//! The cache directory is flat:
//! - `<sha256>.jar`: a downloaded archive, named after the fingerprint of its contents
//! - `<sha256>.jar.<pid>.<counter>.part`: an in-flight download; linked into place once
//!   complete and verified, removed on failure
//!
//! Several importers (possibly in separate processes) may share one directory. Publishing
//! never replaces an entry: whoever finishes first wins, later writers discard their
//! `.part` file and reuse the published entry.

mod cache_dir;
mod error;
mod fingerprint;
mod util;

pub use cache_dir::{ArchiveCache, PartFile, PublishOutcome, CACHE_ENTRY_EXTENSION};
pub use error::CacheError;
pub use fingerprint::{ContentFingerprint, Fingerprint};
pub use util::remove_file_best_effort;

pub type Result<T> = std::result::Result<T, CacheError>;
