use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::element::{ClasspathId, FileId, RemoteClasspath, ServerHandle};
use crate::{ClasspathError, Result};

/// The remote operations an importer needs from an exporting process.
///
/// Implemented in-process by [`BlobStore`](crate::BlobStore) and over the network by the
/// transport client.
pub trait ClasspathServer: Send + Sync {
    /// Fails with [`ClasspathError::NotFound`] for unknown ids.
    fn path_elements(&self, classpath_id: ClasspathId) -> Result<RemoteClasspath>;

    /// Up to `max_len` bytes of file `file_id` starting at `offset`. Fewer bytes are
    /// returned only at end of file; none when `offset` is at or past the end.
    fn download(&self, file_id: FileId, offset: u64, max_len: u32) -> Result<Vec<u8>>;

    /// Look up a single resource on an exported classpath.
    fn find_resource(&self, classpath_id: ClasspathId, name: &str) -> Result<Option<Vec<u8>>>;
}

/// Resolves a [`ServerHandle`] into something that can be called.
pub trait ServerConnector: Send + Sync {
    fn connect(&self, handle: &ServerHandle) -> Result<Arc<dyn ClasspathServer>>;
}

/// Serves `local://<name>` handles from servers registered in this process.
#[derive(Default)]
pub struct LocalConnector {
    servers: RwLock<HashMap<String, Arc<dyn ClasspathServer>>>,
}

impl LocalConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `server` under `name`, replacing any previous registration.
    pub fn register(&self, name: &str, server: Arc<dyn ClasspathServer>) -> Result<ServerHandle> {
        let handle = ServerHandle::local(name).map_err(|err| ClasspathError::UnsupportedEndpoint {
            endpoint: format!("local://{name} ({err})"),
        })?;
        self.servers.write().insert(handle.authority(), server);
        Ok(handle)
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.servers.write().remove(name).is_some()
    }
}

impl ServerConnector for LocalConnector {
    fn connect(&self, handle: &ServerHandle) -> Result<Arc<dyn ClasspathServer>> {
        if handle.scheme() != ServerHandle::LOCAL_SCHEME {
            return Err(ClasspathError::UnsupportedEndpoint {
                endpoint: handle.to_string(),
            });
        }
        self.servers
            .read()
            .get(&handle.authority())
            .cloned()
            .ok_or_else(|| ClasspathError::Remote {
                message: format!("no local server registered for {handle}"),
            })
    }
}

/// Tries each connector in turn, skipping the ones that don't handle the endpoint.
#[derive(Default)]
pub struct ConnectorChain {
    connectors: Vec<Arc<dyn ServerConnector>>,
}

impl ConnectorChain {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, connector: Arc<dyn ServerConnector>) -> Self {
        self.connectors.push(connector);
        self
    }
}

impl ServerConnector for ConnectorChain {
    fn connect(&self, handle: &ServerHandle) -> Result<Arc<dyn ClasspathServer>> {
        for connector in &self.connectors {
            match connector.connect(handle) {
                Err(ClasspathError::UnsupportedEndpoint { .. }) => continue,
                other => return other,
            }
        }
        Err(ClasspathError::UnsupportedEndpoint {
            endpoint: handle.to_string(),
        })
    }
}
