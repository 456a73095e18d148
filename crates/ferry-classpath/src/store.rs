use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ferry_archive::{Archive, PackedArchive};
use parking_lot::RwLock;

use crate::element::{ClasspathId, FileId, PathElement, RemoteClasspath};
use crate::loader::ResourceLoader;
use crate::server::ClasspathServer;
use crate::{ClasspathError, Result};

/// A file served by the store: either an original archive or a packed directory.
#[derive(Debug)]
pub(crate) struct ExportedFile {
    pub(crate) id: FileId,
    pub(crate) source: PathBuf,
    pub(crate) archive: Option<PackedArchive>,
}

impl ExportedFile {
    pub(crate) fn served_path(&self) -> &Path {
        match &self.archive {
            Some(archive) => archive.path(),
            None => &self.source,
        }
    }
}

pub(crate) enum ExportedClasspath {
    Flat {
        elements: Vec<PathElement>,
        /// Backing files in classpath order (passthrough elements have none).
        files: Vec<Arc<ExportedFile>>,
    },
    Dynamic {
        loader: Arc<dyn ResourceLoader>,
    },
}

/// Id-addressed store of exported files and classpaths.
///
/// Read-mostly: lookups take a shared lock only long enough to clone an `Arc`; file reads
/// happen on an independent handle with no store lock held. Packed directory archives are
/// deleted once unexported and no download still holds them.
#[derive(Default)]
pub struct BlobStore {
    files: RwLock<HashMap<FileId, Arc<ExportedFile>>>,
    classpaths: RwLock<HashMap<ClasspathId, Arc<ExportedClasspath>>>,
}

impl BlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a classpath together with its backing files in one step.
    pub(crate) fn register(&self, classpath_id: ClasspathId, classpath: ExportedClasspath) {
        let mut files = self.files.write();
        let mut classpaths = self.classpaths.write();
        if let ExportedClasspath::Flat { files: backing, .. } = &classpath {
            for file in backing {
                files.insert(file.id, file.clone());
            }
        }
        classpaths.insert(classpath_id, Arc::new(classpath));
    }

    /// Remove a classpath and its files. Returns `false` if the id was unknown.
    pub(crate) fn remove(&self, classpath_id: ClasspathId) -> bool {
        let mut files = self.files.write();
        let mut classpaths = self.classpaths.write();
        let Some(removed) = classpaths.remove(&classpath_id) else {
            return false;
        };
        if let ExportedClasspath::Flat { files: backing, .. } = &*removed {
            for file in backing {
                files.remove(&file.id);
            }
        }
        true
    }

    pub fn contains_classpath(&self, classpath_id: ClasspathId) -> bool {
        self.classpaths.read().contains_key(&classpath_id)
    }

    pub fn classpath_count(&self) -> usize {
        self.classpaths.read().len()
    }

    pub fn file_count(&self) -> usize {
        self.files.read().len()
    }

    /// Path currently served for `file_id`.
    pub fn served_path(&self, file_id: FileId) -> Option<PathBuf> {
        self.files
            .read()
            .get(&file_id)
            .map(|file| file.served_path().to_path_buf())
    }

    fn classpath(&self, classpath_id: ClasspathId) -> Result<Arc<ExportedClasspath>> {
        self.classpaths
            .read()
            .get(&classpath_id)
            .cloned()
            .ok_or_else(|| ClasspathError::missing_classpath(classpath_id))
    }
}

impl ClasspathServer for BlobStore {
    fn path_elements(&self, classpath_id: ClasspathId) -> Result<RemoteClasspath> {
        Ok(match &*self.classpath(classpath_id)? {
            ExportedClasspath::Flat { elements, .. } => RemoteClasspath::Flat(elements.clone()),
            ExportedClasspath::Dynamic { .. } => RemoteClasspath::Dynamic,
        })
    }

    fn download(&self, file_id: FileId, offset: u64, max_len: u32) -> Result<Vec<u8>> {
        let file = self
            .files
            .read()
            .get(&file_id)
            .cloned()
            .ok_or_else(|| ClasspathError::missing_file(file_id))?;

        let mut handle = File::open(file.served_path())?;
        let length = handle.metadata()?.len();
        if offset >= length {
            return Ok(Vec::new());
        }
        handle.seek(SeekFrom::Start(offset))?;

        let want = u64::from(max_len).min(length - offset);
        let mut buf = Vec::with_capacity(usize::try_from(want).unwrap_or(0));
        handle.take(want).read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn find_resource(&self, classpath_id: ClasspathId, name: &str) -> Result<Option<Vec<u8>>> {
        match &*self.classpath(classpath_id)? {
            ExportedClasspath::Flat { files, .. } => {
                for file in files {
                    if let Some(bytes) = Archive::new(file.served_path()).read(name)? {
                        return Ok(Some(bytes));
                    }
                }
                Ok(None)
            }
            ExportedClasspath::Dynamic { loader } => loader.find_resource(name),
        }
    }
}
