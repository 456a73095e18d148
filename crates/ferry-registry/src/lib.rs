//! The registry seen by ferry: a hierarchical key/value namespace with child-change
//! notifications, plus a blocking "wait until children appear" primitive built on top.
//!
//! Paths are absolute and slash separated (`/classpaths/worker-1`). The [`Registry`] trait
//! is the boundary to the coordination service; [`MemoryRegistry`] implements it in-process
//! for single-process deployments and tests.

mod memory;
mod path;
mod watch;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use memory::MemoryRegistry;
pub use path::{child_path, validate_path};
pub use watch::{wait_for_child, wait_for_children, RegistryWatchCoordinator, WatchPhase};

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no registry node at {path}")]
    NoNode { path: String },

    #[error("registry node {path} has children")]
    NotEmpty { path: String },

    #[error("invalid registry path {path:?}")]
    InvalidPath { path: String },

    #[error("timed out waiting for {required} children under {path} (found {found})")]
    Timeout {
        path: String,
        required: usize,
        found: usize,
    },

    #[error("watch on {path} already finished")]
    WatchFinished { path: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RegistryError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RegistryError::Timeout { .. })
    }
}

/// Receives child-set changes for a watched path.
///
/// `children` is the complete set of child names (not full paths) at delivery time.
pub trait RegistryWatcher: Send + Sync {
    fn on_children_changed(&self, path: &str, children: &[String]);
}

/// The registry operations ferry depends on.
pub trait Registry: Send + Sync {
    /// Store `data` at `path`, creating missing parents. With `sequential`, a zero-padded
    /// counter unique under the parent is appended to the last segment. Returns the path
    /// actually written.
    fn add_data(&self, path: &str, sequential: bool, data: &[u8]) -> Result<String>;

    fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Child names of `path`, sorted. Fails with [`RegistryError::NoNode`] if `path` does
    /// not exist.
    fn children(&self, path: &str) -> Result<Vec<String>>;

    fn remove(&self, path: &str, recursive: bool) -> Result<()>;

    /// Register `watcher` for child changes under `path`. Registering the same watcher on
    /// the same path again is a no-op. The path does not need to exist yet.
    fn add_watcher(&self, path: &str, watcher: Arc<dyn RegistryWatcher>) -> Result<()>;

    /// Remove a registration; removing an unknown pair is a no-op.
    fn remove_watcher(&self, path: &str, watcher: &Arc<dyn RegistryWatcher>) -> Result<()>;
}

/// Object storage layered over [`Registry::add_data`]/[`Registry::get_data`] using JSON.
pub trait RegistryObjects: Registry {
    fn add_object<T: Serialize + ?Sized>(
        &self,
        path: &str,
        sequential: bool,
        value: &T,
    ) -> Result<String> {
        let bytes = serde_json::to_vec(value)?;
        self.add_data(path, sequential, &bytes)
    }

    fn get_object<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        match self.get_data(path)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl<R: Registry + ?Sized> RegistryObjects for R {}

pub(crate) fn same_watcher(a: &Arc<dyn RegistryWatcher>, b: &Arc<dyn RegistryWatcher>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
