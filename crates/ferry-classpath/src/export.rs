use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ferry_archive::{count_files, pack_directory, PackOptions, PackedArchive};
use ferry_cache::ContentFingerprint;
use ferry_config::ClasspathConfig;
use parking_lot::Mutex;
use url::Url;

use crate::element::{ClasspathFactory, ClasspathId, PathElement, ServerHandle};
use crate::loader::ResourceLoader;
use crate::scope::{ClasspathScope, ScopeArena, ScopeId};
use crate::store::{BlobStore, ExportedClasspath, ExportedFile};
use crate::{ClasspathError, Result};

/// One entry handed to [`ClasspathExporter::export`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClasspathEntry {
    Path(PathBuf),
    Url(Url),
}

impl ClasspathEntry {
    /// Interpret `value` as a URL when it has a scheme, otherwise as a local path.
    pub fn parse(value: &str) -> Self {
        match Url::parse(value) {
            // Single-letter schemes are Windows drive letters.
            Ok(url) if url.scheme().len() > 1 => ClasspathEntry::Url(url),
            _ => ClasspathEntry::Path(PathBuf::from(value)),
        }
    }
}

impl From<PathBuf> for ClasspathEntry {
    fn from(path: PathBuf) -> Self {
        ClasspathEntry::Path(path)
    }
}

impl From<&Path> for ClasspathEntry {
    fn from(path: &Path) -> Self {
        ClasspathEntry::Path(path.to_path_buf())
    }
}

impl From<Url> for ClasspathEntry {
    fn from(url: Url) -> Self {
        ClasspathEntry::Url(url)
    }
}

enum Prepared {
    Passthrough(Url),
    Served {
        source: PathBuf,
        archive: Option<PackedArchive>,
    },
}

/// Exports classpaths into a [`BlobStore`] and hands out [`ClasspathFactory`] references.
///
/// File and classpath ids come from one counter owned by the exporter, so every id is
/// unique for the exporter's lifetime.
pub struct ClasspathExporter {
    store: Arc<BlobStore>,
    handle: ServerHandle,
    config: ClasspathConfig,
    next_id: AtomicU64,
    scopes: Mutex<ScopeArena>,
}

impl ClasspathExporter {
    /// `handle` is how importers reach `store`: a `local://` name registered with a
    /// [`LocalConnector`](crate::LocalConnector) or the address of an export server.
    pub fn new(store: Arc<BlobStore>, handle: ServerHandle, config: ClasspathConfig) -> Self {
        Self {
            store,
            handle,
            config,
            next_id: AtomicU64::new(1),
            scopes: Mutex::new(ScopeArena::default()),
        }
    }

    pub fn store(&self) -> &Arc<BlobStore> {
        &self.store
    }

    pub fn handle(&self) -> &ServerHandle {
        &self.handle
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn factory(&self, classpath_id: ClasspathId) -> ClasspathFactory {
        ClasspathFactory {
            server: self.handle.clone(),
            classpath_id,
        }
    }

    /// Export an ordered list of entries as a new classpath.
    ///
    /// Missing paths, duplicate paths, empty directories, and files without an archive
    /// extension are dropped. Directories are packed into temporary archives.
    pub fn export(&self, entries: &[ClasspathEntry]) -> Result<ClasspathFactory> {
        let mut seen = HashSet::new();
        let mut prepared = Vec::with_capacity(entries.len());
        for entry in entries {
            if let Some(item) = self.prepare(entry, &mut seen)? {
                prepared.push(item);
            }
        }

        let mut elements = Vec::with_capacity(prepared.len());
        let mut files = Vec::new();
        for item in prepared {
            match item {
                Prepared::Passthrough(url) => {
                    elements.push(PathElement::passthrough(self.next_id(), url));
                }
                Prepared::Served { source, archive } => {
                    let file = ExportedFile {
                        id: self.next_id(),
                        source,
                        archive,
                    };
                    let content = ContentFingerprint::from_file(file.served_path())?;
                    elements.push(PathElement::archive(
                        file.id,
                        content.fingerprint,
                        content.length,
                    ));
                    files.push(Arc::new(file));
                }
            }
        }

        let classpath_id = self.next_id();
        let element_count = elements.len();
        self.store
            .register(classpath_id, ExportedClasspath::Flat { elements, files });
        tracing::info!(
            target: "ferry.classpath",
            classpath_id,
            requested = entries.len(),
            elements = element_count,
            "exported classpath"
        );
        Ok(self.factory(classpath_id))
    }

    fn prepare(
        &self,
        entry: &ClasspathEntry,
        seen: &mut HashSet<PathBuf>,
    ) -> Result<Option<Prepared>> {
        let path = match entry {
            ClasspathEntry::Url(url) if url.scheme() == "file" => match url.to_file_path() {
                Ok(path) => path,
                Err(()) => {
                    tracing::warn!(
                        target: "ferry.classpath",
                        url = %url,
                        "dropping file url without a local path"
                    );
                    return Ok(None);
                }
            },
            ClasspathEntry::Url(url) => return Ok(Some(Prepared::Passthrough(url.clone()))),
            ClasspathEntry::Path(path) => path.clone(),
        };

        let canonical = match fs::canonicalize(&path) {
            Ok(canonical) => canonical,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(
                    target: "ferry.classpath",
                    path = %path.display(),
                    "dropping missing classpath entry"
                );
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        if !seen.insert(canonical.clone()) {
            return Ok(None);
        }

        if canonical.is_dir() {
            if count_files(&canonical)? == 0 {
                tracing::debug!(
                    target: "ferry.classpath",
                    path = %canonical.display(),
                    "dropping empty directory"
                );
                return Ok(None);
            }
            let options = PackOptions {
                timestamp_round_up: self.config.timestamp_round_up(),
                temp_dir: None,
            };
            let archive = pack_directory(&canonical, &options)?;
            return Ok(Some(Prepared::Served {
                source: canonical,
                archive: Some(archive),
            }));
        }

        if !self.config.is_archive(&canonical) {
            tracing::warn!(
                target: "ferry.classpath",
                path = %canonical.display(),
                "dropping classpath entry that is not an archive"
            );
            return Ok(None);
        }
        Ok(Some(Prepared::Served {
            source: canonical,
            archive: None,
        }))
    }

    fn export_dynamic(&self, loader: Arc<dyn ResourceLoader>) -> ClasspathFactory {
        let classpath_id = self.next_id();
        self.store
            .register(classpath_id, ExportedClasspath::Dynamic { loader });
        tracing::info!(
            target: "ferry.classpath",
            classpath_id,
            "exported dynamic classpath"
        );
        self.factory(classpath_id)
    }

    pub fn register_scope(&self, scope: ClasspathScope) -> ScopeId {
        self.scopes.lock().insert(scope)
    }

    /// Export a registered scope, flattening up to `max_export_depth` ancestors ahead of it.
    ///
    /// Repeated calls for the same id return the same factory. An opaque scope is exported
    /// as a dynamic classpath; an opaque ancestor ends the walk.
    pub fn export_scope(&self, id: ScopeId) -> Result<ClasspathFactory> {
        let (scope, ancestors) = {
            let arena = self.scopes.lock();
            let record = arena
                .get(id)
                .ok_or(ClasspathError::UnknownScope { scope: id })?;
            if let Some(factory) = &record.exported {
                return Ok(factory.clone());
            }

            let mut ancestors = Vec::new();
            let mut cursor = record.scope.parent();
            while ancestors.len() < self.config.max_export_depth {
                let Some(parent_id) = cursor else { break };
                let Some(parent) = arena.get(parent_id) else {
                    tracing::debug!(
                        target: "ferry.classpath",
                        scope = %parent_id,
                        "parent scope was released"
                    );
                    break;
                };
                match parent.scope.entries() {
                    Ok(entries) => ancestors.push(entries.to_vec()),
                    Err(_) => break,
                }
                cursor = parent.scope.parent();
            }
            (record.scope.clone(), ancestors)
        };

        // Nothing is held across the export itself; a racing caller's result wins below.
        let factory = match &scope {
            ClasspathScope::Flat { entries, .. } => {
                let mut flattened: Vec<ClasspathEntry> =
                    ancestors.into_iter().rev().flatten().collect();
                flattened.extend(entries.iter().cloned());
                self.export(&flattened)?
            }
            ClasspathScope::Opaque { loader, .. } => self.export_dynamic(loader.clone()),
        };

        let previous = {
            let mut arena = self.scopes.lock();
            match arena.get_mut(id) {
                None => Err(ClasspathError::UnknownScope { scope: id }),
                Some(record) => {
                    if let Some(existing) = record.exported.clone() {
                        Ok(Some(existing))
                    } else {
                        record.exported = Some(factory.clone());
                        Ok(None)
                    }
                }
            }
        };
        match previous {
            Ok(None) => Ok(factory),
            Ok(Some(existing)) => {
                self.store.remove(factory.classpath_id);
                Ok(existing)
            }
            Err(err) => {
                self.store.remove(factory.classpath_id);
                Err(err)
            }
        }
    }

    /// Release a scope and unexport its classpath. The id becomes stale.
    pub fn release_scope(&self, id: ScopeId) -> Result<()> {
        let record = self
            .scopes
            .lock()
            .remove(id)
            .ok_or(ClasspathError::UnknownScope { scope: id })?;
        if let Some(factory) = record.exported {
            self.store.remove(factory.classpath_id);
        }
        Ok(())
    }

    /// Stop serving a classpath. Returns `false` if it was not exported.
    pub fn unexport(&self, classpath_id: ClasspathId) -> bool {
        self.scopes.lock().forget_export(classpath_id);
        let removed = self.store.remove(classpath_id);
        if removed {
            tracing::info!(target: "ferry.classpath", classpath_id, "unexported classpath");
        }
        removed
    }
}
