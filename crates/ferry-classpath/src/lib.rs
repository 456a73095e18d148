//! Remote classpath export and import.
//!
//! An exporting process registers classpath entries (jars, directories, passthrough URLs)
//! with a [`ClasspathExporter`]; each downloadable entry becomes a fingerprinted
//! [`PathElement`] served in chunks by a [`BlobStore`]. The returned [`ClasspathFactory`] is
//! a plain, serializable reference that a remote process hands to a [`ClasspathImporter`],
//! which downloads missing archives into a fingerprint-keyed cache, verifies them, and builds
//! a local [`ImportedClassLoader`].
//!
//! Scopes that can't be flattened into a list of archives are exported as
//! [`RemoteClasspath::Dynamic`]; importers then fetch resources one at a time.

mod element;
mod envelope;
mod export;
mod import;
mod loader;
mod publish;
mod scope;
mod server;
mod store;

pub use element::{
    ClasspathFactory, ClasspathId, FileId, PathElement, RemoteClasspath, ServerHandle,
};
pub use envelope::Envelope;
pub use export::{ClasspathEntry, ClasspathExporter};
pub use import::ClasspathImporter;
pub use loader::{
    class_resource_name, http_agent, ClassDefinition, ClasspathSource, DynamicClasspath,
    ImportedClassLoader, LocalClasspath, ResourceLoader,
};
pub use publish::{
    discover_factories, discover_factories_with_config, discover_factory,
    discover_factory_with_config, publish_factory,
};
pub use scope::{ClasspathScope, ScopeId};
pub use server::{ClasspathServer, ConnectorChain, LocalConnector, ServerConnector};
pub use store::BlobStore;

use ferry_cache::{CacheError, Fingerprint};
use ferry_registry::RegistryError;
use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, ClasspathError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MissingKind {
    Classpath,
    File,
}

impl std::fmt::Display for MissingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MissingKind::Classpath => f.write_str("classpath"),
            MissingKind::File => f.write_str("file"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClasspathError {
    #[error("unknown {kind} id {id}")]
    NotFound { kind: MissingKind, id: u64 },

    #[error(
        "integrity check failed for {fingerprint}: expected {expected_len} bytes, \
         found {actual_len} bytes with fingerprint {actual_fingerprint}"
    )]
    Integrity {
        fingerprint: Fingerprint,
        expected_len: u64,
        actual_len: u64,
        actual_fingerprint: Fingerprint,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("archive error: {0:#}")]
    Archive(#[from] anyhow::Error),

    #[error("scope cannot be represented as a flat classpath")]
    UnsupportedLoaderShape,

    #[error("class not found: {name}")]
    ClassNotFound { name: String },

    #[error("import cancelled")]
    Cancelled,

    #[error("remote error: {message}")]
    Remote { message: String },

    #[error("unknown or released scope {scope}")]
    UnknownScope { scope: ScopeId },

    #[error("no connector for endpoint {endpoint}")]
    UnsupportedEndpoint { endpoint: String },

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("no cache directory configured and no home directory to default to")]
    NoCacheDir,
}

impl ClasspathError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClasspathError::NotFound { .. })
    }

    pub fn is_integrity(&self) -> bool {
        matches!(self, ClasspathError::Integrity { .. })
    }

    pub(crate) fn missing_classpath(id: ClasspathId) -> Self {
        ClasspathError::NotFound {
            kind: MissingKind::Classpath,
            id,
        }
    }

    pub(crate) fn missing_file(id: FileId) -> Self {
        ClasspathError::NotFound {
            kind: MissingKind::File,
            id,
        }
    }
}
