use std::path::{Path, PathBuf};
use std::sync::Arc;

use ferry_cache::{ArchiveCache, ContentFingerprint, Fingerprint, PublishOutcome};
use ferry_config::ClasspathConfig;
use rayon::prelude::*;
use tokio_util::sync::CancellationToken;

use crate::element::{ClasspathFactory, PathElement, RemoteClasspath};
use crate::loader::{
    http_agent, ClasspathSource, DynamicClasspath, ImportedClassLoader, LocalClasspath,
    ResourceLoader,
};
use crate::server::{ClasspathServer, ServerConnector};
use crate::{ClasspathError, Result};

/// Rebuilds exported classpaths locally.
pub struct ClasspathImporter {
    connector: Arc<dyn ServerConnector>,
    config: ClasspathConfig,
    http: ureq::Agent,
}

impl ClasspathImporter {
    pub fn new(connector: Arc<dyn ServerConnector>, config: ClasspathConfig) -> Self {
        let http = http_agent(config.http_timeout());
        Self {
            connector,
            config,
            http,
        }
    }

    pub fn config(&self) -> &ClasspathConfig {
        &self.config
    }

    /// Import into the configured cache directory (`[classpath] cache_dir`, falling back to
    /// `~/.ferry/cache/classpath`).
    pub fn create_class_loader_in_default_cache(
        &self,
        factory: &ClasspathFactory,
        parent: Option<Arc<dyn ResourceLoader>>,
    ) -> Result<ImportedClassLoader> {
        let cache_dir = self
            .config
            .resolved_cache_dir()
            .ok_or(ClasspathError::NoCacheDir)?;
        self.create_class_loader(factory, &cache_dir, parent)
    }

    pub fn create_class_loader(
        &self,
        factory: &ClasspathFactory,
        cache_dir: &Path,
        parent: Option<Arc<dyn ResourceLoader>>,
    ) -> Result<ImportedClassLoader> {
        self.create_class_loader_with_cancel(factory, cache_dir, parent, &CancellationToken::new())
    }

    /// Like [`create_class_loader`](Self::create_class_loader), checking `cancel` before each
    /// downloaded chunk. A cancelled import leaves no partial file behind.
    pub fn create_class_loader_with_cancel(
        &self,
        factory: &ClasspathFactory,
        cache_dir: &Path,
        parent: Option<Arc<dyn ResourceLoader>>,
        cancel: &CancellationToken,
    ) -> Result<ImportedClassLoader> {
        let server = self.connector.connect(&factory.server)?;
        let elements = match server.path_elements(factory.classpath_id)? {
            RemoteClasspath::Dynamic => {
                tracing::debug!(
                    target: "ferry.classpath",
                    classpath_id = factory.classpath_id,
                    server = %factory.server,
                    "importing dynamic classpath"
                );
                return Ok(ImportedClassLoader::Dynamic(DynamicClasspath::new(
                    server,
                    factory.classpath_id,
                    parent,
                )));
            }
            RemoteClasspath::Flat(elements) => elements,
        };

        let cache = ArchiveCache::open(cache_dir)?;
        let resolve = |element: &PathElement| -> Result<ClasspathSource> {
            match &element.url {
                Some(url) => Ok(ClasspathSource::from_url(url, &self.http)),
                None => {
                    let path = self.fetch_archive(&*server, &cache, element, cancel)?;
                    Ok(ClasspathSource::local(path))
                }
            }
        };
        let sources = if self.config.parallel_downloads {
            elements.par_iter().map(resolve).collect::<Result<Vec<_>>>()?
        } else {
            elements.iter().map(resolve).collect::<Result<Vec<_>>>()?
        };

        tracing::info!(
            target: "ferry.classpath",
            classpath_id = factory.classpath_id,
            server = %factory.server,
            elements = sources.len(),
            "imported classpath"
        );
        Ok(ImportedClassLoader::Local(LocalClasspath::new(sources, parent)))
    }

    /// Make sure the archive named by `element` is in the cache and verified.
    fn fetch_archive(
        &self,
        server: &dyn ClasspathServer,
        cache: &ArchiveCache,
        element: &PathElement,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let fingerprint = element
            .fingerprint
            .as_ref()
            .ok_or_else(|| ClasspathError::Remote {
                message: format!("path element {} has neither url nor fingerprint", element.id),
            })?;

        if let Some(path) = cache.lookup(fingerprint) {
            tracing::debug!(
                target: "ferry.classpath",
                fingerprint = %fingerprint,
                path = %path.display(),
                "cache hit"
            );
            verify(&path, fingerprint, element.length)?;
            return Ok(path);
        }

        tracing::debug!(
            target: "ferry.classpath",
            fingerprint = %fingerprint,
            file_id = element.id,
            length = element.length,
            "cache miss; downloading"
        );
        let chunk_size = self.config.chunk_size.max(1);
        let mut part = cache.begin_write(fingerprint)?;
        let mut offset = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Err(ClasspathError::Cancelled);
            }
            let chunk = server.download(element.id, offset, chunk_size)?;
            offset += chunk.len() as u64;
            if offset > element.length {
                let measured = part.measure()?;
                return Err(ClasspathError::Integrity {
                    fingerprint: fingerprint.clone(),
                    expected_len: element.length,
                    actual_len: offset,
                    actual_fingerprint: measured.fingerprint,
                });
            }
            part.write_all(&chunk)?;
            if chunk.len() < chunk_size as usize {
                break;
            }
        }

        // Only content matching the element may ever be published under its fingerprint.
        let measured = part.measure()?;
        if !measured.matches(fingerprint, element.length) {
            tracing::warn!(
                target: "ferry.classpath",
                fingerprint = %fingerprint,
                file_id = element.id,
                actual = %measured.fingerprint,
                actual_len = measured.length,
                "downloaded archive failed verification"
            );
            return Err(ClasspathError::Integrity {
                fingerprint: fingerprint.clone(),
                expected_len: element.length,
                actual_len: measured.length,
                actual_fingerprint: measured.fingerprint,
            });
        }

        let dest = part.dest().to_path_buf();
        match part.commit()? {
            PublishOutcome::Published => {}
            PublishOutcome::LostRace => tracing::debug!(
                target: "ferry.classpath",
                fingerprint = %fingerprint,
                "another import published this archive first"
            ),
        }
        verify(&dest, fingerprint, element.length)?;
        Ok(dest)
    }
}

/// Re-measure a cache entry; any difference from the advertised content is fatal.
fn verify(path: &Path, fingerprint: &Fingerprint, length: u64) -> Result<()> {
    let measured = ContentFingerprint::from_file(path)?;
    if measured.matches(fingerprint, length) {
        return Ok(());
    }
    tracing::warn!(
        target: "ferry.classpath",
        path = %path.display(),
        expected = %fingerprint,
        actual = %measured.fingerprint,
        "cache entry failed verification"
    );
    Err(ClasspathError::Integrity {
        fingerprint: fingerprint.clone(),
        expected_len: length,
        actual_len: measured.length,
        actual_fingerprint: measured.fingerprint,
    })
}
