use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::element::ClasspathFactory;
use crate::import::ClasspathImporter;
use crate::loader::{ImportedClassLoader, ResourceLoader};
use crate::Result;

/// Schema-tagged bytes that can only be decoded against a particular classpath.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub schema: String,
    pub payload: Vec<u8>,
    pub classpath: ClasspathFactory,
}

impl Envelope {
    pub fn new(schema: impl Into<String>, payload: Vec<u8>, classpath: ClasspathFactory) -> Self {
        Self {
            schema: schema.into(),
            payload,
            classpath,
        }
    }

    /// Import the classpath, then hand the loader, schema, and payload to `decoder`.
    ///
    /// Returns the loader alongside the decoded value; whatever was decoded may need it
    /// for further class lookups.
    pub fn decode<T, F>(
        &self,
        importer: &ClasspathImporter,
        cache_dir: &Path,
        parent: Option<Arc<dyn ResourceLoader>>,
        decoder: F,
    ) -> Result<(ImportedClassLoader, T)>
    where
        F: FnOnce(&ImportedClassLoader, &str, &[u8]) -> Result<T>,
    {
        let loader = importer.create_class_loader(&self.classpath, cache_dir, parent)?;
        let value = decoder(&loader, &self.schema, &self.payload)?;
        Ok((loader, value))
    }
}
