use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ferry_archive::{read_entry_from_bytes, Archive};
use parking_lot::Mutex;
use url::Url;

use crate::element::ClasspathId;
use crate::server::ClasspathServer;
use crate::{ClasspathError, Result};

/// Raw bytes for a class, as found on a classpath.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassDefinition {
    pub binary_name: String,
    pub bytes: Vec<u8>,
}

/// `com.acme.Foo` -> `com/acme/Foo.class`
pub fn class_resource_name(binary_name: &str) -> String {
    format!("{}.class", binary_name.replace('.', "/"))
}

/// Something classes and resources can be loaded from.
pub trait ResourceLoader: Send + Sync {
    /// Look up a slash-separated resource (`com/acme/app.properties`).
    fn find_resource(&self, name: &str) -> Result<Option<Vec<u8>>>;

    fn load_class(&self, binary_name: &str) -> Result<ClassDefinition> {
        match self.find_resource(&class_resource_name(binary_name))? {
            Some(bytes) => Ok(ClassDefinition {
                binary_name: binary_name.to_string(),
                bytes,
            }),
            None => Err(ClasspathError::ClassNotFound {
                name: binary_name.to_string(),
            }),
        }
    }
}

/// An HTTP agent for passthrough lookups, with `timeout` for connecting and each read.
pub fn http_agent(timeout: Duration) -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(timeout)
        .timeout_read(timeout)
        .build()
}

/// One location on an imported classpath.
#[derive(Debug)]
pub enum ClasspathSource {
    /// A local jar/zip (e.g. a cache entry) or an exploded directory.
    Local(Archive),
    /// `http(s)` base URL; resources are fetched as `<base><name>`.
    RemoteDirectory { base: Url, agent: ureq::Agent },
    /// `http(s)` archive, downloaded on first use and kept in memory.
    RemoteArchive {
        url: Url,
        agent: ureq::Agent,
        bytes: Mutex<Option<Arc<Vec<u8>>>>,
    },
    /// A passthrough URL with a scheme this process can't open (`jar:`, `ftp:`, ...).
    /// It is kept in classpath order but provides no resources.
    Unresolvable(Url),
}

impl ClasspathSource {
    /// Resolve a passthrough URL into a source.
    pub fn from_url(url: &Url, agent: &ureq::Agent) -> Self {
        match url.scheme() {
            "file" => match url.to_file_path() {
                Ok(path) => ClasspathSource::Local(Archive::new(path)),
                Err(()) => ClasspathSource::unresolvable(url),
            },
            "http" | "https" if url.path().ends_with('/') => ClasspathSource::RemoteDirectory {
                base: url.clone(),
                agent: agent.clone(),
            },
            "http" | "https" => ClasspathSource::RemoteArchive {
                url: url.clone(),
                agent: agent.clone(),
                bytes: Mutex::new(None),
            },
            _ => ClasspathSource::unresolvable(url),
        }
    }

    fn unresolvable(url: &Url) -> Self {
        tracing::warn!(
            target: "ferry.classpath",
            url = %url,
            "passthrough url cannot be opened here; it will resolve nothing"
        );
        ClasspathSource::Unresolvable(url.clone())
    }

    pub fn local(path: impl Into<PathBuf>) -> Self {
        ClasspathSource::Local(Archive::new(path))
    }

    /// The local path backing this source, if any.
    pub fn local_path(&self) -> Option<&Path> {
        match self {
            ClasspathSource::Local(archive) => Some(archive.path()),
            _ => None,
        }
    }

    fn find_resource(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match self {
            ClasspathSource::Local(archive) => Ok(archive.read(name)?),
            ClasspathSource::RemoteDirectory { base, agent } => {
                let url = base.join(name).map_err(|err| ClasspathError::Remote {
                    message: format!("invalid resource name {name:?}: {err}"),
                })?;
                http_get(agent, &url)
            }
            ClasspathSource::RemoteArchive { url, agent, bytes } => {
                let archive = {
                    let mut cached = bytes.lock();
                    match &*cached {
                        Some(archive) => archive.clone(),
                        None => {
                            let fetched =
                                http_get(agent, url)?.ok_or_else(|| ClasspathError::Remote {
                                    message: format!("archive {url} not found"),
                                })?;
                            let fetched = Arc::new(fetched);
                            *cached = Some(fetched.clone());
                            fetched
                        }
                    }
                };
                Ok(read_entry_from_bytes(&archive, name)?)
            }
            ClasspathSource::Unresolvable(_) => Ok(None),
        }
    }
}

fn http_get(agent: &ureq::Agent, url: &Url) -> Result<Option<Vec<u8>>> {
    let response = match agent.get(url.as_str()).call() {
        Ok(response) => response,
        Err(ureq::Error::Status(404, _)) => return Ok(None),
        Err(ureq::Error::Status(code, _)) => {
            return Err(ClasspathError::Remote {
                message: format!("server returned status {code} for {url}"),
            })
        }
        Err(ureq::Error::Transport(transport)) => {
            return Err(ClasspathError::Remote {
                message: format!("transport error for {url}: {transport}"),
            })
        }
    };
    let mut buf = Vec::new();
    response.into_reader().read_to_end(&mut buf)?;
    Ok(Some(buf))
}

/// A flat classpath: sources searched in order, then the parent.
pub struct LocalClasspath {
    sources: Vec<ClasspathSource>,
    parent: Option<Arc<dyn ResourceLoader>>,
}

impl LocalClasspath {
    pub fn new(sources: Vec<ClasspathSource>, parent: Option<Arc<dyn ResourceLoader>>) -> Self {
        Self { sources, parent }
    }

    pub fn sources(&self) -> &[ClasspathSource] {
        &self.sources
    }
}

impl std::fmt::Debug for LocalClasspath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalClasspath")
            .field("sources", &self.sources)
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}

impl ResourceLoader for LocalClasspath {
    fn find_resource(&self, name: &str) -> Result<Option<Vec<u8>>> {
        for source in &self.sources {
            if let Some(bytes) = source.find_resource(name)? {
                return Ok(Some(bytes));
            }
        }
        match &self.parent {
            Some(parent) => parent.find_resource(name),
            None => Ok(None),
        }
    }
}

/// Fetches resources from the exporting server one at a time.
///
/// The parent is consulted first; remote answers (including misses) are memoized.
pub struct DynamicClasspath {
    server: Arc<dyn ClasspathServer>,
    classpath_id: ClasspathId,
    parent: Option<Arc<dyn ResourceLoader>>,
    memo: Mutex<HashMap<String, Option<Vec<u8>>>>,
}

impl DynamicClasspath {
    pub fn new(
        server: Arc<dyn ClasspathServer>,
        classpath_id: ClasspathId,
        parent: Option<Arc<dyn ResourceLoader>>,
    ) -> Self {
        Self {
            server,
            classpath_id,
            parent,
            memo: Mutex::new(HashMap::new()),
        }
    }

    pub fn classpath_id(&self) -> ClasspathId {
        self.classpath_id
    }
}

impl std::fmt::Debug for DynamicClasspath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicClasspath")
            .field("classpath_id", &self.classpath_id)
            .field("memoized", &self.memo.lock().len())
            .finish()
    }
}

impl ResourceLoader for DynamicClasspath {
    fn find_resource(&self, name: &str) -> Result<Option<Vec<u8>>> {
        if let Some(parent) = &self.parent {
            if let Some(bytes) = parent.find_resource(name)? {
                return Ok(Some(bytes));
            }
        }
        if let Some(hit) = self.memo.lock().get(name) {
            return Ok(hit.clone());
        }
        let fetched = self.server.find_resource(self.classpath_id, name)?;
        tracing::trace!(
            target: "ferry.classpath",
            classpath_id = self.classpath_id,
            resource = name,
            found = fetched.is_some(),
            "remote resource lookup"
        );
        self.memo.lock().insert(name.to_string(), fetched.clone());
        Ok(fetched)
    }
}

/// The loader produced by an import.
#[derive(Debug)]
pub enum ImportedClassLoader {
    Local(LocalClasspath),
    Dynamic(DynamicClasspath),
}

impl ImportedClassLoader {
    pub fn is_dynamic(&self) -> bool {
        matches!(self, ImportedClassLoader::Dynamic(_))
    }

    pub fn as_local(&self) -> Option<&LocalClasspath> {
        match self {
            ImportedClassLoader::Local(local) => Some(local),
            ImportedClassLoader::Dynamic(_) => None,
        }
    }
}

impl ResourceLoader for ImportedClassLoader {
    fn find_resource(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match self {
            ImportedClassLoader::Local(local) => local.find_resource(name),
            ImportedClassLoader::Dynamic(dynamic) => dynamic.find_resource(name),
        }
    }
}
