//! TCP transport for ferry classpath servers.
//!
//! [`ExportServer`] serves any [`ClasspathServer`](ferry_classpath::ClasspathServer) (in
//! practice a [`BlobStore`](ferry_classpath::BlobStore)) on a socket. Importers reach it
//! through [`TcpConnector`], which turns `tcp://host:port` handles into blocking
//! [`TcpClasspathClient`]s.
//!
//! Requests are answered in order on each connection; a client issues one request at a time.

mod client;
mod server;
pub mod wire;

pub use client::{TcpClasspathClient, TcpConnector};
pub use server::ExportServer;

use ferry_classpath::ClasspathError;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {message}")]
    Io { message: String },

    #[error("allocation failed: {message}")]
    AllocationFailed { message: String },

    #[error("frame too large: {len} > {max}")]
    FrameTooLarge { len: u32, max: u32 },

    #[error("decode error: {message}")]
    DecodeError { message: String },

    #[error("encode error: {message}")]
    EncodeError { message: String },

    #[error("protocol violation: {message}")]
    ProtocolViolation { message: String },

    #[error("connection closed")]
    ConnectionClosed,
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io {
            message: err.to_string(),
        }
    }
}

impl From<TransportError> for ClasspathError {
    fn from(err: TransportError) -> Self {
        ClasspathError::Remote {
            message: err.to_string(),
        }
    }
}
