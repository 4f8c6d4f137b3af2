//! Peer identifiers.
//!
//! A `PeerId` is four random bytes, generated once per installation and
//! persisted as hex. Team ids use the same type.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Length of a peer or team identifier on the wire.
pub const PEER_ID_LEN: usize = 4;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    pub const fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Fresh random identifier.
    pub fn generate() -> Self {
        Self(rand::random())
    }

    /// Read an identifier from the first four bytes of `buf`.
    pub fn from_slice(buf: &[u8]) -> Option<Self> {
        let bytes: [u8; PEER_ID_LEN] = buf.get(..PEER_ID_LEN)?.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    /// Load the identifier stored at `path`, generating and persisting a new
    /// one if the file does not exist yet.
    pub fn load_or_generate(path: &Path) -> Result<Self, IdentityError> {
        if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| IdentityError::Read(path.to_path_buf(), e))?;
            return text
                .trim()
                .parse()
                .map_err(|_| IdentityError::Malformed(path.to_path_buf()));
        }

        let id = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| IdentityError::Write(path.to_path_buf(), e))?;
        }
        std::fs::write(path, id.to_string())
            .map_err(|e| IdentityError::Write(path.to_path_buf(), e))?;
        Ok(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", hex::encode(self.0))
    }
}

impl FromStr for PeerId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; PEER_ID_LEN];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("failed to read identity {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("identity file {0} is not a {} byte hex id", PEER_ID_LEN)]
    Malformed(PathBuf),
    #[error("failed to write identity {0}: {1}")]
    Write(PathBuf, std::io::Error),
}
