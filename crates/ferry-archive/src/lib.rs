//! Reading classpath archives (jars, zips) and exploded directories, and packing directories
//! into archives so they can be served like any other jar.

mod pack;

use std::fs::File;
use std::io::{Cursor, Read, Seek};
use std::path::{Path, PathBuf};

use anyhow::Context;
use zip::ZipArchive;

pub use pack::{count_files, pack_directory, zip_timestamp, PackOptions, PackedArchive};

#[derive(Clone, Debug)]
pub struct Archive {
    path: PathBuf,
}

impl Archive {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read a resource (`com/acme/Foo.class`) from the archive or directory.
    ///
    /// Returns `Ok(None)` when the resource isn't present.
    pub fn read(&self, name: &str) -> anyhow::Result<Option<Vec<u8>>> {
        if self.path.is_dir() {
            if !is_safe_resource_name(name) {
                return Ok(None);
            }
            let candidate = self.path.join(name);
            if !candidate.is_file() {
                return Ok(None);
            }
            let mut buf = Vec::new();
            File::open(&candidate)
                .with_context(|| format!("failed to open {}", candidate.display()))?
                .read_to_end(&mut buf)
                .with_context(|| format!("failed to read {}", candidate.display()))?;
            return Ok(Some(buf));
        }

        let file = File::open(&self.path)
            .with_context(|| format!("failed to open archive {}", self.path.display()))?;
        read_zip_entry(file, name)
            .with_context(|| format!("failed to read {} from {}", name, self.path.display()))
    }

    /// Entry names in archive order (relative paths for directories, sorted).
    pub fn entry_names(&self) -> anyhow::Result<Vec<String>> {
        if self.path.is_dir() {
            let mut names = Vec::new();
            for entry in walkdir::WalkDir::new(&self.path).follow_links(false) {
                let entry = entry?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry.path().strip_prefix(&self.path)?;
                names.push(pack::entry_name(rel));
            }
            names.sort();
            return Ok(names);
        }

        let file = File::open(&self.path)
            .with_context(|| format!("failed to open archive {}", self.path.display()))?;
        let zip = ZipArchive::new(file)
            .with_context(|| format!("failed to read zip {}", self.path.display()))?;
        Ok(zip.file_names().map(str::to_string).collect())
    }
}

/// Read a resource from an archive held in memory (e.g. fetched from a remote URL).
pub fn read_entry_from_bytes(bytes: &[u8], name: &str) -> anyhow::Result<Option<Vec<u8>>> {
    read_zip_entry(Cursor::new(bytes), name)
}

fn read_zip_entry<R: Read + Seek>(reader: R, name: &str) -> anyhow::Result<Option<Vec<u8>>> {
    let mut zip = ZipArchive::new(reader).context("failed to read zip")?;
    let result = match zip.by_name(name) {
        Ok(mut entry) => {
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf)?;
            Ok(Some(buf))
        }
        Err(zip::result::ZipError::FileNotFound) => Ok(None),
        Err(err) => Err(err.into()),
    };
    result
}

// Resource names come from remote peers; never let them escape the directory.
fn is_safe_resource_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('/')
        && !name.contains('\\')
        && name.split('/').all(|seg| !seg.is_empty() && seg != ".." && seg != ".")
}
