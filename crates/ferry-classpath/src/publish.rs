//! Publishing classpath factories through the registry so peers can find them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use ferry_config::RegistryConfig;
use ferry_registry::{
    child_path, wait_for_child, wait_for_children, Registry, RegistryError, RegistryObjects,
};

use crate::element::ClasspathFactory;
use crate::Result;

/// Store `factory` at `<dir>/<name>`, returning the path written.
pub fn publish_factory(
    registry: &dyn Registry,
    dir: &str,
    name: &str,
    factory: &ClasspathFactory,
) -> Result<String> {
    let path = registry.add_object(&child_path(dir, name), false, factory)?;
    tracing::debug!(
        target: "ferry.classpath",
        path = %path,
        classpath_id = factory.classpath_id,
        "published classpath factory"
    );
    Ok(path)
}

/// Wait until `<dir>/<name>` is published and decode it.
pub fn discover_factory(
    registry: Arc<dyn Registry>,
    dir: &str,
    name: &str,
    timeout: Duration,
) -> Result<ClasspathFactory> {
    let data = wait_for_child(registry, dir, name, timeout)?;
    decode(&data)
}

/// Wait until at least `min` factories are published under `dir`.
pub fn discover_factories(
    registry: Arc<dyn Registry>,
    dir: &str,
    min: usize,
    timeout: Duration,
) -> Result<BTreeMap<String, ClasspathFactory>> {
    wait_for_children(registry, dir, min, timeout)?
        .into_iter()
        .map(|(name, data)| Ok((name, decode(&data)?)))
        .collect()
}

/// [`discover_factory`] bounded by the configured `[registry] wait_timeout_ms`.
pub fn discover_factory_with_config(
    registry: Arc<dyn Registry>,
    dir: &str,
    name: &str,
    config: &RegistryConfig,
) -> Result<ClasspathFactory> {
    discover_factory(registry, dir, name, config.wait_timeout())
}

/// [`discover_factories`] bounded by the configured `[registry] wait_timeout_ms`.
pub fn discover_factories_with_config(
    registry: Arc<dyn Registry>,
    dir: &str,
    min: usize,
    config: &RegistryConfig,
) -> Result<BTreeMap<String, ClasspathFactory>> {
    discover_factories(registry, dir, min, config.wait_timeout())
}

fn decode(data: &[u8]) -> Result<ClasspathFactory> {
    serde_json::from_slice(data)
        .map_err(|err| RegistryError::Serialization(err).into())
}
