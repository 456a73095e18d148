//! Messages exchanged between an export server and its clients, and the frame codec.
//!
//! Every frame is a little-endian `u32` length followed by that many bytes of bincode. The
//! length is checked against the configured maximum before the payload buffer is allocated.

use std::io::{self, Read, Write};

use bincode::Options;
use ferry_classpath::{ClasspathError, ClasspathId, FileId, MissingKind, RemoteClasspath};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::TransportError;

/// Bumped whenever [`Request`] or [`Response`] change shape.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub version: u32,
    pub request: Request,
}

impl RequestFrame {
    pub fn new(request: Request) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            request,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    PathElements {
        classpath_id: ClasspathId,
    },
    Download {
        file_id: FileId,
        offset: u64,
        max_len: u32,
    },
    FindResource {
        classpath_id: ClasspathId,
        name: String,
    },
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Request::PathElements { .. } => "path_elements",
            Request::Download { .. } => "download",
            Request::FindResource { .. } => "find_resource",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    PathElements(RemoteClasspath),
    Chunk(Vec<u8>),
    Resource(Option<Vec<u8>>),
    Error(WireError),
}

/// A failure reported by the server. Unknown ids keep their kind so the client can rebuild
/// [`ClasspathError::NotFound`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireError {
    NotFound { kind: MissingKind, id: u64 },
    Io { message: String },
    InvalidRequest { message: String },
    Internal { message: String },
}

impl WireError {
    pub fn from_classpath(err: &ClasspathError) -> Self {
        match err {
            ClasspathError::NotFound { kind, id } => WireError::NotFound {
                kind: *kind,
                id: *id,
            },
            ClasspathError::Io(err) => WireError::Io {
                message: err.to_string(),
            },
            other => WireError::Internal {
                message: other.to_string(),
            },
        }
    }

    pub fn into_classpath(self) -> ClasspathError {
        match self {
            WireError::NotFound { kind, id } => ClasspathError::NotFound { kind, id },
            WireError::Io { message } => ClasspathError::Io(io::Error::other(message)),
            WireError::InvalidRequest { message } => ClasspathError::Remote {
                message: format!("request rejected: {message}"),
            },
            WireError::Internal { message } => ClasspathError::Remote { message },
        }
    }
}

fn bincode_options(limit: u32) -> impl bincode::Options + Copy {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(u64::from(limit))
}

pub fn encode<T: Serialize>(value: &T, max_frame_len: u32) -> Result<Vec<u8>, TransportError> {
    let payload = bincode_options(max_frame_len)
        .serialize(value)
        .map_err(|err| TransportError::EncodeError {
            message: err.to_string(),
        })?;
    check_len(payload.len(), max_frame_len)?;
    Ok(payload)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8], max_frame_len: u32) -> Result<T, TransportError> {
    bincode_options(max_frame_len)
        .deserialize(bytes)
        .map_err(|err| TransportError::DecodeError {
            message: err.to_string(),
        })
}

fn check_len(len: usize, max_frame_len: u32) -> Result<u32, TransportError> {
    let len: u32 = len.try_into().map_err(|_| TransportError::FrameTooLarge {
        len: u32::MAX,
        max: max_frame_len,
    })?;
    if len > max_frame_len {
        return Err(TransportError::FrameTooLarge {
            len,
            max: max_frame_len,
        });
    }
    Ok(len)
}

fn frame_buffer(len: u32, max_frame_len: u32) -> Result<Vec<u8>, TransportError> {
    if len > max_frame_len {
        return Err(TransportError::FrameTooLarge {
            len,
            max: max_frame_len,
        });
    }
    // Reserve fallibly so allocation failure surfaces as an error instead of aborting.
    let len_usize = len as usize;
    let mut buf = Vec::new();
    buf.try_reserve_exact(len_usize)
        .map_err(|err| TransportError::AllocationFailed {
            message: format!("allocate frame buffer ({len} bytes): {err}"),
        })?;
    buf.resize(len_usize, 0);
    Ok(buf)
}

pub async fn write_frame(
    stream: &mut (impl AsyncWrite + Unpin),
    max_frame_len: u32,
    payload: &[u8],
) -> Result<(), TransportError> {
    let len = check_len(payload.len(), max_frame_len)?;
    stream.write_u32_le(len).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one frame. Returns `None` if the peer closed the stream before a length prefix.
pub async fn read_frame(
    stream: &mut (impl AsyncRead + Unpin),
    max_frame_len: u32,
) -> Result<Option<Vec<u8>>, TransportError> {
    let len = match stream.read_u32_le().await {
        Ok(len) => len,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mut buf = frame_buffer(len, max_frame_len)?;
    stream.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

pub fn write_frame_blocking(
    stream: &mut impl Write,
    max_frame_len: u32,
    payload: &[u8],
) -> Result<(), TransportError> {
    let len = check_len(payload.len(), max_frame_len)?;
    stream.write_all(&len.to_le_bytes())?;
    stream.write_all(payload)?;
    stream.flush()?;
    Ok(())
}

pub fn read_frame_blocking(
    stream: &mut impl Read,
    max_frame_len: u32,
) -> Result<Vec<u8>, TransportError> {
    let mut prefix = [0u8; 4];
    match stream.read_exact(&mut prefix) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(TransportError::ConnectionClosed)
        }
        Err(err) => return Err(err.into()),
    }
    let mut buf = frame_buffer(u32::from_le_bytes(prefix), max_frame_len)?;
    stream.read_exact(&mut buf)?;
    Ok(buf)
}
