use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ferry_archive::{pack_directory, PackOptions};
use ferry_classpath::{
    BlobStore, ClasspathError, ClasspathExporter, ClasspathId, ClasspathImporter, ClasspathServer,
    FileId, LocalConnector, PathElement, RemoteClasspath, ResourceLoader,
};
use ferry_config::ClasspathConfig;
use tempfile::TempDir;

/// Wraps a store and counts the calls importers make against it.
pub struct CountingServer {
    inner: Arc<BlobStore>,
    pub downloads: AtomicUsize,
    /// Downloads starting at offset zero, i.e. one per fetched archive.
    pub fetches: AtomicUsize,
}

impl CountingServer {
    pub fn new(inner: Arc<BlobStore>) -> Self {
        Self {
            inner,
            downloads: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl ClasspathServer for CountingServer {
    fn path_elements(&self, classpath_id: ClasspathId) -> ferry_classpath::Result<RemoteClasspath> {
        self.inner.path_elements(classpath_id)
    }

    fn download(&self, file_id: FileId, offset: u64, max_len: u32) -> ferry_classpath::Result<Vec<u8>> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        if offset == 0 {
            self.fetches.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.download(file_id, offset, max_len)
    }

    fn find_resource(
        &self,
        classpath_id: ClasspathId,
        name: &str,
    ) -> ferry_classpath::Result<Option<Vec<u8>>> {
        self.inner.find_resource(classpath_id, name)
    }
}

/// Serves only the first half of every chunk.
pub struct TruncatingServer {
    inner: Arc<BlobStore>,
}

impl TruncatingServer {
    pub fn new(inner: Arc<BlobStore>) -> Self {
        Self { inner }
    }
}

impl ClasspathServer for TruncatingServer {
    fn path_elements(&self, classpath_id: ClasspathId) -> ferry_classpath::Result<RemoteClasspath> {
        self.inner.path_elements(classpath_id)
    }

    fn download(&self, file_id: FileId, offset: u64, max_len: u32) -> ferry_classpath::Result<Vec<u8>> {
        let mut chunk = self.inner.download(file_id, offset, max_len)?;
        chunk.truncate(chunk.len() / 2);
        Ok(chunk)
    }

    fn find_resource(
        &self,
        classpath_id: ClasspathId,
        name: &str,
    ) -> ferry_classpath::Result<Option<Vec<u8>>> {
        self.inner.find_resource(classpath_id, name)
    }
}

/// An exporter and an importer wired together in-process.
pub struct Harness {
    pub tmp: TempDir,
    pub store: Arc<BlobStore>,
    pub server: Arc<CountingServer>,
    pub connector: Arc<LocalConnector>,
    pub exporter: ClasspathExporter,
    pub importer: ClasspathImporter,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ClasspathConfig::default())
    }

    pub fn with_config(config: ClasspathConfig) -> Self {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(BlobStore::new());
        let server = Arc::new(CountingServer::new(store.clone()));
        let connector = Arc::new(LocalConnector::new());
        let handle = connector.register("exporter", server.clone()).unwrap();
        let exporter = ClasspathExporter::new(store.clone(), handle, config.clone());
        let importer = ClasspathImporter::new(connector.clone(), config);
        Self {
            tmp,
            store,
            server,
            connector,
            exporter,
            importer,
        }
    }

    /// A scratch path under the harness directory.
    pub fn path(&self, rel: &str) -> PathBuf {
        self.tmp.path().join(rel)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.path("cache")
    }

    pub fn elements(&self, classpath_id: ClasspathId) -> Vec<PathElement> {
        match self.store.path_elements(classpath_id).unwrap() {
            RemoteClasspath::Flat(elements) => elements,
            RemoteClasspath::Dynamic => panic!("expected a flat classpath"),
        }
    }
}

/// Create `files` (relative path -> contents) under `dir`.
pub fn write_tree(dir: &Path, files: &[(&str, &[u8])]) {
    std::fs::create_dir_all(dir).unwrap();
    for (rel, bytes) in files {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, bytes).unwrap();
    }
}

/// Build a real jar at `dest` containing `files`.
pub fn write_jar(dest: &Path, files: &[(&str, &[u8])]) {
    let staging = TempDir::new().unwrap();
    write_tree(staging.path(), files);
    let packed = pack_directory(staging.path(), &PackOptions::default()).unwrap();
    std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
    std::fs::copy(packed.path(), dest).unwrap();
}

/// A loader backed by a fixed map of resources.
#[derive(Default)]
pub struct MapLoader {
    resources: HashMap<String, Vec<u8>>,
    pub lookups: AtomicUsize,
}

impl MapLoader {
    pub fn with(mut self, name: &str, bytes: &[u8]) -> Self {
        self.resources.insert(name.to_string(), bytes.to_vec());
        self
    }
}

impl ResourceLoader for MapLoader {
    fn find_resource(&self, name: &str) -> Result<Option<Vec<u8>>, ClasspathError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.resources.get(name).cloned())
    }
}
