use crate::error::CacheError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::path::Path;

const HEX_LEN: usize = 64;

/// A stable SHA-256 fingerprint stored as a lowercase hex string.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute the SHA-256 fingerprint of an arbitrary byte slice.
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes.as_ref());
        Self(hex::encode(hasher.finalize()))
    }

    /// Compute the SHA-256 fingerprint of bytes read from `reader`.
    ///
    /// The reader is consumed and dropped before returning, on success and on error alike.
    pub fn from_reader(reader: impl Read) -> Result<Self, CacheError> {
        Ok(ContentFingerprint::from_reader(reader)?.fingerprint)
    }

    /// Compute the SHA-256 fingerprint of a file's contents.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        Ok(ContentFingerprint::from_file(path)?.fingerprint)
    }

    /// Parse a hex fingerprint, e.g. one taken from a cache file name.
    pub fn parse(value: &str) -> Result<Self, CacheError> {
        let valid = value.len() == HEX_LEN
            && value
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid {
            return Err(CacheError::InvalidFingerprint {
                value: value.to_string(),
            });
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = CacheError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Fingerprint> for String {
    fn from(value: Fingerprint) -> Self {
        value.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A fingerprint together with the number of bytes it covers.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentFingerprint {
    pub fingerprint: Fingerprint,
    pub length: u64,
}

impl ContentFingerprint {
    pub fn from_reader(mut reader: impl Read) -> Result<Self, CacheError> {
        let mut hasher = Sha256::new();
        let mut length = 0u64;
        let mut buf = [0_u8; 64 * 1024];
        loop {
            let read = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            };
            hasher.update(&buf[..read]);
            length += read as u64;
        }
        Ok(Self {
            fingerprint: Fingerprint(hex::encode(hasher.finalize())),
            length,
        })
    }

    /// Streams the file so large archives are never read into memory at once.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(file)
    }

    /// Returns `true` if the measured content is `fingerprint` and `length` bytes long.
    pub fn matches(&self, fingerprint: &Fingerprint, length: u64) -> bool {
        &self.fingerprint == fingerprint && self.length == length
    }
}
