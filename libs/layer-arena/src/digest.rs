//! Content digests identifying layers.
//!
//! A digest is written as `<algorithm>:<hex checksum>`, e.g.
//! `sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4`.
//! The canonical (lowercase) string form is what the arena uses as the
//! dedup key, the refcount key, and the cache file name.

use std::fmt;
use std::str::FromStr;

use sha2::digest::DynDigest;
use sha2::{Sha256, Sha512};
use thiserror::Error;

/// Errors from parsing a digest string.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DigestError {
    #[error("digest missing ':' separator: {0:?}")]
    MissingSeparator(String),

    #[error("unsupported digest algorithm: {0:?}")]
    UnknownAlgorithm(String),

    #[error("invalid hex in digest checksum: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("{algorithm} checksum must be {expected} bytes, got {actual}")]
    WrongLength {
        algorithm: Algorithm,
        expected: usize,
        actual: usize,
    },
}

/// Hash algorithm a digest was computed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Sha256,
    Sha512,
}

impl Algorithm {
    /// Length of a checksum produced by this algorithm, in bytes.
    pub fn output_len(self) -> usize {
        match self {
            Algorithm::Sha256 => 32,
            Algorithm::Sha512 => 64,
        }
    }

    /// A fresh streaming hasher for this algorithm.
    pub fn hasher(self) -> Box<dyn DynDigest + Send> {
        match self {
            Algorithm::Sha256 => Box::new(Sha256::default()),
            Algorithm::Sha512 => Box::new(Sha512::default()),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" => Ok(Algorithm::Sha256),
            "sha512" => Ok(Algorithm::Sha512),
            other => Err(DigestError::UnknownAlgorithm(other.to_string())),
        }
    }
}

/// A content address: hash algorithm plus raw checksum bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    algorithm: Algorithm,
    checksum: Vec<u8>,
}

impl Digest {
    /// Build a digest from raw checksum bytes.
    ///
    /// The length is not checked here; an empty checksum is rejected when
    /// the layer is fetched.
    pub fn new(algorithm: Algorithm, checksum: impl Into<Vec<u8>>) -> Self {
        Self {
            algorithm,
            checksum: checksum.into(),
        }
    }

    /// Compute the sha256 digest of `data`.
    pub fn sha256_of(data: &[u8]) -> Self {
        use sha2::Digest as _;
        Self::new(Algorithm::Sha256, Sha256::digest(data).to_vec())
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn checksum(&self) -> &[u8] {
        &self.checksum
    }

    /// Checksum as lowercase hex.
    pub fn hex(&self) -> String {
        hex::encode(&self.checksum)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex())
    }
}

impl FromStr for Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, checksum) = s
            .split_once(':')
            .ok_or_else(|| DigestError::MissingSeparator(s.to_string()))?;
        let algorithm: Algorithm = algorithm.parse()?;
        let checksum = hex::decode(checksum)?;
        if checksum.len() != algorithm.output_len() {
            return Err(DigestError::WrongLength {
                algorithm,
                expected: algorithm.output_len(),
                actual: checksum.len(),
            });
        }
        Ok(Self {
            algorithm,
            checksum,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str =
        "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_parse_and_display() {
        let digest: Digest = EMPTY_SHA256.parse().unwrap();
        assert_eq!(digest.algorithm(), Algorithm::Sha256);
        assert_eq!(digest.checksum().len(), 32);
        assert_eq!(digest.to_string(), EMPTY_SHA256);
    }

    #[test]
    fn test_display_is_lowercase() {
        let upper = EMPTY_SHA256.to_uppercase().replace("SHA256", "sha256");
        let digest: Digest = upper.parse().unwrap();
        assert_eq!(digest.to_string(), EMPTY_SHA256);
    }

    #[test]
    fn test_sha256_of_matches_parsed() {
        let parsed: Digest = EMPTY_SHA256.parse().unwrap();
        assert_eq!(Digest::sha256_of(b""), parsed);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            "abc".parse::<Digest>(),
            Err(DigestError::MissingSeparator(_))
        ));
        assert!(matches!(
            "md5:abcd".parse::<Digest>(),
            Err(DigestError::UnknownAlgorithm(_))
        ));
        assert!(matches!(
            "sha256:zz".parse::<Digest>(),
            Err(DigestError::InvalidHex(_))
        ));
        assert!(matches!(
            "sha256:abcd".parse::<Digest>(),
            Err(DigestError::WrongLength {
                expected: 32,
                actual: 2,
                ..
            })
        ));
    }

    #[test]
    fn test_invalid_hex_reports_position() {
        assert_eq!(
            "sha256:0g".parse::<Digest>(),
            Err(DigestError::InvalidHex(hex::FromHexError::InvalidHexCharacter {
                c: 'g',
                index: 1,
            }))
        );
    }

    #[test]
    fn test_hasher_matches_algorithm() {
        let mut hasher = Algorithm::Sha512.hasher();
        hasher.update(b"layer");
        assert_eq!(hasher.finalize().len(), Algorithm::Sha512.output_len());
    }
}
