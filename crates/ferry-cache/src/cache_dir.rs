use crate::error::CacheError;
use crate::fingerprint::{ContentFingerprint, Fingerprint};
use crate::util::{open_unique_part_file, remove_file_best_effort, sync_dir_best_effort};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Extension given to every cached archive.
pub const CACHE_ENTRY_EXTENSION: &str = "jar";

/// A flat directory of archives keyed by content fingerprint.
#[derive(Clone, Debug)]
pub struct ArchiveCache {
    root: PathBuf,
}

impl ArchiveCache {
    /// Open (creating if needed) the cache rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The path an archive with `fingerprint` is published under.
    pub fn entry_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.root
            .join(format!("{}.{CACHE_ENTRY_EXTENSION}", fingerprint.as_str()))
    }

    /// Returns the published entry for `fingerprint`, if present.
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<PathBuf> {
        let path = self.entry_path(fingerprint);
        match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_file() => Some(path),
            Ok(_) => None,
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    tracing::debug!(
                        target: "ferry.cache",
                        path = %path.display(),
                        error = %err,
                        "failed to stat cache entry"
                    );
                }
                None
            }
        }
    }

    /// Start writing the entry for `fingerprint` into a fresh `.part` file.
    pub fn begin_write(&self, fingerprint: &Fingerprint) -> Result<PartFile, CacheError> {
        let dest = self.entry_path(fingerprint);
        let (tmp_path, file) = open_unique_part_file(&dest)?;
        Ok(PartFile {
            dest,
            tmp_path,
            file: Some(file),
        })
    }

    /// List leftover `.part` files, e.g. from crashed importers.
    pub fn stale_part_files(&self) -> Result<Vec<PathBuf>, CacheError> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if entry.file_name().to_string_lossy().ends_with(".part") {
                out.push(entry.path());
            }
        }
        out.sort();
        Ok(out)
    }
}

/// How a [`PartFile`] ended up in the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    /// This writer linked its temp file into place.
    Published,
    /// Another writer published the entry first; this writer's temp file was discarded.
    LostRace,
}

/// An in-flight cache entry.
///
/// Dropping a `PartFile` without committing it removes the temp file.
#[derive(Debug)]
pub struct PartFile {
    dest: PathBuf,
    tmp_path: PathBuf,
    file: Option<fs::File>,
}

impl PartFile {
    pub fn dest(&self) -> &Path {
        &self.dest
    }

    pub fn tmp_path(&self) -> &Path {
        &self.tmp_path
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> Result<(), CacheError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("part file already closed"))?;
        file.write_all(bytes)?;
        Ok(())
    }

    /// Measure what has been written so far.
    pub fn measure(&mut self) -> Result<ContentFingerprint, CacheError> {
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        ContentFingerprint::from_file(&self.tmp_path)
    }

    /// Flush the temp file and move it into place.
    ///
    /// Publishing never replaces an existing entry: if the destination already exists the
    /// temp file is discarded and [`PublishOutcome::LostRace`] is returned, and the caller
    /// is expected to verify whatever file is published.
    pub fn commit(mut self) -> Result<PublishOutcome, CacheError> {
        let Some(file) = self.file.take() else {
            return Err(io::Error::other("part file already closed").into());
        };
        file.sync_all()?;
        drop(file);

        let parent = self
            .dest
            .parent()
            .ok_or_else(|| CacheError::MissingParent {
                path: self.dest.clone(),
            })?
            .to_path_buf();

        let outcome = match fs::hard_link(&self.tmp_path, &self.dest) {
            Ok(()) => Ok(PublishOutcome::Published),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(PublishOutcome::LostRace),
            // Some filesystems have no hard links; fall back to a rename that checks first.
            Err(err) => self.rename_into_place(err),
        };
        remove_file_best_effort(&self.tmp_path, "commit.remove_part");
        if outcome.as_ref().is_ok_and(|o| *o == PublishOutcome::Published) {
            sync_dir_best_effort(&parent, "commit.sync_parent_dir");
        }
        outcome
    }

    fn rename_into_place(&self, link_err: io::Error) -> Result<PublishOutcome, CacheError> {
        tracing::debug!(
            target: "ferry.cache",
            path = %self.dest.display(),
            error = %link_err,
            "hard link failed; publishing by rename"
        );
        if self.dest.exists() {
            return Ok(PublishOutcome::LostRace);
        }
        match fs::rename(&self.tmp_path, &self.dest) {
            Ok(()) => Ok(PublishOutcome::Published),
            Err(_) if self.dest.exists() => Ok(PublishOutcome::LostRace),
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for PartFile {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            remove_file_best_effort(&self.tmp_path, "part_file.abandoned");
        }
    }
}
