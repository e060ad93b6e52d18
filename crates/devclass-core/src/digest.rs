//! File digests for cheap external-change detection
//!
//! A digest is computed over the raw bytes of a file, never over any
//! in-memory state, so two callers can tell whether a file was rewritten
//! without deserializing it. Files are hashed in fixed-size chunks.

use serde::{Deserialize, Serialize};
use sha2::digest::DynDigest;
use sha2::{Sha256, Sha512};
use std::fmt;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;

use crate::persist::PersistError;

/// Size of each read fed into the hasher
const CHUNK_SIZE: usize = 8 * 1024;

/// Hash algorithm used for file digests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    /// Look up an algorithm by name (`sha256`, `sha-256`, `sha512`, `sha-512`)
    pub fn from_name(name: &str) -> Result<Self, PersistError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "sha512" | "sha-512" => Ok(Self::Sha512),
            _ => Err(PersistError::DigestUnavailable(name.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    /// Digest length in bytes
    pub fn output_len(&self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Sha512 => 64,
        }
    }

    // Built fresh for every digest; hasher state is never kept around.
    fn hasher(&self) -> Box<dyn DynDigest> {
        match self {
            Self::Sha256 => Box::new(Sha256::default()),
            Self::Sha512 => Box::new(Sha512::default()),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for DigestAlgorithm {
    type Err = PersistError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s)
    }
}

/// Fixed-length hash of a file's bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    algorithm: DigestAlgorithm,
    bytes: Vec<u8>,
}

impl Digest {
    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Lowercase hex encoding of the digest
    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Digest an in-memory byte slice
pub fn digest_bytes(data: &[u8], algorithm: DigestAlgorithm) -> Digest {
    let mut hasher = algorithm.hasher();
    hasher.update(data);
    Digest {
        algorithm,
        bytes: hasher.finalize().into_vec(),
    }
}

/// Digest the current contents of a file, reading it chunk by chunk
pub fn digest_file(path: &Path, algorithm: DigestAlgorithm) -> Result<Digest, PersistError> {
    let mut file = File::open(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => PersistError::FileNotFound(path.to_path_buf()),
        _ => PersistError::IoError(e),
    })?;

    let mut hasher = algorithm.hasher();
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(PersistError::IoError(e)),
        };
        hasher.update(&buf[..n]);
    }

    Ok(Digest {
        algorithm,
        bytes: hasher.finalize().into_vec(),
    })
}
