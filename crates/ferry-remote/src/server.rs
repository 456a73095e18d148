use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ferry_classpath::{ClasspathServer, ServerHandle};
use ferry_config::{RemoteConfig, FRAME_OVERHEAD_BYTES};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_util::sync::CancellationToken;

use crate::wire::{self, Request, RequestFrame, Response, WireError, PROTOCOL_VERSION};
use crate::TransportError;

/// Serves a [`ClasspathServer`] over TCP.
///
/// Each connection is handled on its own task. Server calls touch the filesystem, so they
/// run on the blocking pool.
pub struct ExportServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    handle: ServerHandle,
    server: Arc<dyn ClasspathServer>,
    max_frame_len: u32,
}

impl ExportServer {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        server: Arc<dyn ClasspathServer>,
        config: &RemoteConfig,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let handle = ServerHandle::tcp(local_addr).map_err(|err| TransportError::Io {
            message: format!("invalid listen address {local_addr}: {err}"),
        })?;
        tracing::info!(target: "ferry.remote", addr = %local_addr, "export server listening");
        Ok(Self {
            listener,
            local_addr,
            handle,
            server,
            max_frame_len: config.max_frame_bytes,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The handle importers use to reach this server.
    pub fn handle(&self) -> &ServerHandle {
        &self.handle
    }

    /// Accept connections until `shutdown` is cancelled. Open connections are closed at
    /// their next request boundary.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), TransportError> {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::warn!(target: "ferry.remote", error = %err, "accept failed");
                    // Typically fd exhaustion; don't spin.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };
            if let Err(err) = stream.set_nodelay(true) {
                tracing::debug!(
                    target: "ferry.remote",
                    peer = %peer,
                    error = %err,
                    "set_nodelay failed"
                );
            }
            let connection = Connection {
                server: self.server.clone(),
                max_frame_len: self.max_frame_len,
                shutdown: shutdown.child_token(),
            };
            tokio::spawn(async move {
                tracing::debug!(target: "ferry.remote", peer = %peer, "connection opened");
                match connection.serve(stream).await {
                    Ok(()) => {
                        tracing::debug!(target: "ferry.remote", peer = %peer, "connection closed")
                    }
                    Err(err) => tracing::debug!(
                        target: "ferry.remote",
                        peer = %peer,
                        error = %err,
                        "connection failed"
                    ),
                }
            });
        }
        tracing::info!(target: "ferry.remote", addr = %self.local_addr, "export server stopped");
        Ok(())
    }
}

struct Connection {
    server: Arc<dyn ClasspathServer>,
    max_frame_len: u32,
    shutdown: CancellationToken,
}

impl Connection {
    async fn serve(self, stream: TcpStream) -> Result<(), TransportError> {
        let (mut reader, mut writer) = stream.into_split();
        loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                frame = wire::read_frame(&mut reader, self.max_frame_len) => frame?,
            };
            let Some(frame) = frame else {
                return Ok(());
            };
            let response = match wire::decode::<RequestFrame>(&frame, self.max_frame_len) {
                Ok(frame) if frame.version == PROTOCOL_VERSION => {
                    self.dispatch(frame.request).await
                }
                Ok(frame) => Response::Error(WireError::InvalidRequest {
                    message: format!(
                        "unsupported protocol version {} (expected {PROTOCOL_VERSION})",
                        frame.version
                    ),
                }),
                Err(err) => Response::Error(WireError::InvalidRequest {
                    message: err.to_string(),
                }),
            };
            let payload = match wire::encode(&response, self.max_frame_len) {
                Ok(payload) => payload,
                Err(err) => wire::encode(
                    &Response::Error(WireError::Internal {
                        message: err.to_string(),
                    }),
                    self.max_frame_len,
                )?,
            };
            wire::write_frame(&mut writer, self.max_frame_len, &payload).await?;
        }
    }

    async fn dispatch(&self, request: Request) -> Response {
        let kind = request.kind();
        if let Request::Download { max_len, .. } = &request {
            let limit = self.max_frame_len.saturating_sub(FRAME_OVERHEAD_BYTES);
            if *max_len > limit {
                return Response::Error(WireError::InvalidRequest {
                    message: format!("download of {max_len} bytes exceeds the limit of {limit}"),
                });
            }
        }

        let server = self.server.clone();
        let result = tokio::task::spawn_blocking(move || handle(&*server, request)).await;
        match result {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(
                    target: "ferry.remote",
                    request = kind,
                    error = %err,
                    "request handler panicked"
                );
                Response::Error(WireError::Internal {
                    message: format!("{kind} failed"),
                })
            }
        }
    }
}

fn handle(server: &dyn ClasspathServer, request: Request) -> Response {
    let result = match request {
        Request::PathElements { classpath_id } => {
            server.path_elements(classpath_id).map(Response::PathElements)
        }
        Request::Download {
            file_id,
            offset,
            max_len,
        } => server.download(file_id, offset, max_len).map(Response::Chunk),
        Request::FindResource { classpath_id, name } => server
            .find_resource(classpath_id, &name)
            .map(Response::Resource),
    };
    result.unwrap_or_else(|err| {
        if !err.is_not_found() {
            tracing::warn!(target: "ferry.remote", error = %err, "classpath request failed");
        }
        Response::Error(WireError::from_classpath(&err))
    })
}
