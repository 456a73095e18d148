use std::collections::HashMap;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;

use ferry_classpath::{
    ClasspathError, ClasspathId, ClasspathServer, FileId, RemoteClasspath, ServerConnector,
    ServerHandle,
};
use ferry_config::RemoteConfig;
use parking_lot::Mutex;

use crate::wire::{self, Request, RequestFrame, Response};
use crate::TransportError;

/// Blocking client for an [`ExportServer`](crate::ExportServer).
///
/// Each call checks a connection out of a small idle pool (opening one if the pool is
/// empty), runs one request/response exchange on it, and returns it. Concurrent calls use
/// separate connections; at most `max_idle_connections` are kept between calls.
pub struct TcpClasspathClient {
    addr: String,
    config: RemoteConfig,
    idle: Mutex<Vec<TcpStream>>,
}

impl TcpClasspathClient {
    pub fn new(addr: impl Into<String>, config: RemoteConfig) -> Self {
        Self {
            addr: addr.into(),
            config,
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Connections currently parked in the pool.
    pub fn idle_connections(&self) -> usize {
        self.idle.lock().len()
    }

    fn release(&self, stream: TcpStream) {
        let mut idle = self.idle.lock();
        if idle.len() < self.config.max_idle_connections {
            idle.push(stream);
        }
    }

    fn open(&self) -> Result<TcpStream, TransportError> {
        let mut last_err = None;
        for candidate in self.addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&candidate, self.config.connect_timeout()) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    stream.set_read_timeout(self.config.io_timeout())?;
                    stream.set_write_timeout(self.config.io_timeout())?;
                    tracing::debug!(target: "ferry.remote", addr = %candidate, "connected");
                    return Ok(stream);
                }
                Err(err) => last_err = Some(err),
            }
        }
        Err(match last_err {
            Some(err) => err.into(),
            None => TransportError::Io {
                message: format!("{} did not resolve to any address", self.addr),
            },
        })
    }

    fn call(&self, request: Request) -> Result<Response, TransportError> {
        let max = self.config.max_frame_bytes;
        let payload = wire::encode(&RequestFrame::new(request), max)?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let pooled = self.idle.lock().pop();
            let reused = pooled.is_some();
            let mut stream = match pooled {
                Some(stream) => stream,
                None => self.open()?,
            };
            let outcome = wire::write_frame_blocking(&mut stream, max, &payload)
                .and_then(|()| wire::read_frame_blocking(&mut stream, max));
            match outcome {
                Ok(frame) => {
                    self.release(stream);
                    return wire::decode(&frame, max);
                }
                Err(err) => {
                    // Every request is a read, so replaying on a fresh connection is safe. Only
                    // a connection that sat idle gets a second chance, and its idle siblings
                    // are assumed dead too.
                    if reused && attempt == 1 && is_stale_connection(&err) {
                        self.idle.lock().clear();
                        tracing::debug!(
                            target: "ferry.remote",
                            addr = %self.addr,
                            error = %err,
                            "reconnecting after stale connection"
                        );
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }
}

fn is_stale_connection(err: &TransportError) -> bool {
    matches!(
        err,
        TransportError::Io { .. } | TransportError::ConnectionClosed
    )
}

fn unexpected(response: Response, expected: &str) -> ClasspathError {
    match response {
        Response::Error(err) => err.into_classpath(),
        _ => ClasspathError::Remote {
            message: format!("unexpected response to {expected}"),
        },
    }
}

impl ClasspathServer for TcpClasspathClient {
    fn path_elements(&self, classpath_id: ClasspathId) -> ferry_classpath::Result<RemoteClasspath> {
        match self.call(Request::PathElements { classpath_id })? {
            Response::PathElements(classpath) => Ok(classpath),
            other => Err(unexpected(other, "path_elements")),
        }
    }

    fn download(
        &self,
        file_id: FileId,
        offset: u64,
        max_len: u32,
    ) -> ferry_classpath::Result<Vec<u8>> {
        let request = Request::Download {
            file_id,
            offset,
            max_len,
        };
        match self.call(request)? {
            Response::Chunk(bytes) if bytes.len() <= max_len as usize => Ok(bytes),
            Response::Chunk(bytes) => Err(ClasspathError::Remote {
                message: format!(
                    "server returned {} bytes for a {max_len} byte download",
                    bytes.len()
                ),
            }),
            other => Err(unexpected(other, "download")),
        }
    }

    fn find_resource(
        &self,
        classpath_id: ClasspathId,
        name: &str,
    ) -> ferry_classpath::Result<Option<Vec<u8>>> {
        let request = Request::FindResource {
            classpath_id,
            name: name.to_string(),
        };
        match self.call(request)? {
            Response::Resource(bytes) => Ok(bytes),
            other => Err(unexpected(other, "find_resource")),
        }
    }
}

/// Resolves `tcp://host:port` handles. Clients are kept per address and reused.
#[derive(Default)]
pub struct TcpConnector {
    config: RemoteConfig,
    clients: Mutex<HashMap<String, Arc<TcpClasspathClient>>>,
}

impl TcpConnector {
    pub fn new(config: RemoteConfig) -> Self {
        Self {
            config,
            clients: Mutex::new(HashMap::new()),
        }
    }
}

impl ServerConnector for TcpConnector {
    fn connect(&self, handle: &ServerHandle) -> ferry_classpath::Result<Arc<dyn ClasspathServer>> {
        if handle.scheme() != ServerHandle::TCP_SCHEME {
            return Err(ClasspathError::UnsupportedEndpoint {
                endpoint: handle.to_string(),
            });
        }
        let addr = handle.authority();
        let client: Arc<dyn ClasspathServer> = self
            .clients
            .lock()
            .entry(addr.clone())
            .or_insert_with(|| Arc::new(TcpClasspathClient::new(addr, self.config.clone())))
            .clone();
        Ok(client)
    }
}
