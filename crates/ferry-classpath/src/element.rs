use std::fmt;
use std::net::SocketAddr;

use ferry_cache::Fingerprint;
use serde::{Deserialize, Serialize};
use url::Url;

pub type ClasspathId = u64;
pub type FileId = u64;

/// One classpath entry as seen by an importer.
///
/// Either `url` is set (a passthrough entry the importer references directly) or
/// `fingerprint` and `length` identify downloadable content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathElement {
    pub id: FileId,
    pub fingerprint: Option<Fingerprint>,
    pub length: u64,
    pub url: Option<Url>,
}

impl PathElement {
    pub fn archive(id: FileId, fingerprint: Fingerprint, length: u64) -> Self {
        Self {
            id,
            fingerprint: Some(fingerprint),
            length,
            url: None,
        }
    }

    pub fn passthrough(id: FileId, url: Url) -> Self {
        Self {
            id,
            fingerprint: None,
            length: 0,
            url: Some(url),
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.url.is_some()
    }
}

/// What a server reports for a classpath id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteClasspath {
    /// Ordered entries; order is classpath precedence.
    Flat(Vec<PathElement>),
    /// The exported scope has no file representation; resources are fetched one by one.
    Dynamic,
}

/// A stable network reference to a classpath server.
///
/// `tcp://host:port` names a remote export server, `local://name` a server registered
/// with a [`LocalConnector`](crate::LocalConnector) in this process.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerHandle(Url);

impl ServerHandle {
    pub const LOCAL_SCHEME: &'static str = "local";
    pub const TCP_SCHEME: &'static str = "tcp";

    pub fn parse(value: &str) -> Result<Self, url::ParseError> {
        Url::parse(value).map(Self)
    }

    pub fn local(name: &str) -> Result<Self, url::ParseError> {
        Self::parse(&format!("{}://{name}", Self::LOCAL_SCHEME))
    }

    pub fn tcp(addr: SocketAddr) -> Result<Self, url::ParseError> {
        Self::parse(&format!("{}://{addr}", Self::TCP_SCHEME))
    }

    pub fn url(&self) -> &Url {
        &self.0
    }

    pub fn scheme(&self) -> &str {
        self.0.scheme()
    }

    /// `host:port` for network handles, the name for local ones.
    pub fn authority(&self) -> String {
        match (self.0.host_str(), self.0.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            _ => String::new(),
        }
    }
}

impl fmt::Display for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// A serializable handle to an exported classpath.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClasspathFactory {
    pub server: ServerHandle,
    pub classpath_id: ClasspathId,
}
