//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use sha1::Digest as Sha1Digest;
use std::fmt;
use std::result::Result as StdResult;
use std::str::FromStr;
use thiserror::Error;

type Result<T> = StdResult<T, DigestError>;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Serialize, Deserialize)]
pub enum DigestAlgorithm {
    #[default]
    SHA1, //Default, sadly
    SHA256,      //sha256t
    SHA512,      //sha512t
    SHA512Half,  //sha512t_256
    SHA3256,     // Sha3 version of sha256t
    SHA3512Half, // Sha3 version of sha512t_256
    SHA3512,     // Sha3 version of sha512t
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Serialize, Deserialize)]
pub enum DigestSource {
    GzipCompressed,
    GNUElf,
    GNUElfUnsigned,
    UncompressedFile,
    Unknown,
    #[default]
    PrimaryPayloadHash,
}

/// A content hash as written on a manifest action, either a bare sha1 hex
/// string or `source:algorithm:hash`.
#[derive(Debug, Default, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Digest {
    pub hash: String,
    pub algorithm: DigestAlgorithm,
    pub source: DigestSource,
}

impl FromStr for Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> StdResult<Self, Self::Err> {
        if !s.contains(':') {
            if s.is_empty() || !s.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(DigestError::InvalidDigestFormat {
                    digest: s.to_string(),
                    details: "bare hashes must be hexadecimal".to_string(),
                });
            }
            return Ok(Digest {
                hash: s.to_ascii_lowercase(),
                algorithm: DigestAlgorithm::SHA1,
                source: DigestSource::PrimaryPayloadHash,
            });
        }

        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 {
            return Err(DigestError::InvalidDigestFormat {
                digest: s.to_string(),
                details: "cannot split into 3 parts".to_string(),
            });
        }

        Ok(Digest {
            source: match parts[0] {
                "file" => DigestSource::UncompressedFile,
                "gzip" => DigestSource::GzipCompressed,
                "gelf" => DigestSource::GNUElf,
                "gelf.unsigned" => DigestSource::GNUElfUnsigned,
                _ => DigestSource::Unknown,
            },
            algorithm: match parts[1] {
                "sha1" => DigestAlgorithm::SHA1,
                "sha256t" => DigestAlgorithm::SHA256,
                "sha512t_256" => DigestAlgorithm::SHA512Half,
                "sha512t" => DigestAlgorithm::SHA512,
                "sha3256t" => DigestAlgorithm::SHA3256,
                "sha3512t_256" => DigestAlgorithm::SHA3512Half,
                "sha3512t" => DigestAlgorithm::SHA3512,
                _ => {
                    return Err(DigestError::UnknownAlgorithm {
                        algorithm: parts[1].to_string(),
                    })
                }
            },
            hash: parts[2].to_ascii_lowercase(),
        })
    }
}

impl Digest {
    pub fn from_bytes(b: &[u8], algo: DigestAlgorithm, src: DigestSource) -> Self {
        let hash = match algo {
            DigestAlgorithm::SHA1 => format!("{:x}", sha1::Sha1::digest(b)),
            DigestAlgorithm::SHA256 => format!("{:x}", sha2::Sha256::digest(b)),
            DigestAlgorithm::SHA512Half => format!("{:x}", sha2::Sha512_256::digest(b)),
            DigestAlgorithm::SHA512 => format!("{:x}", sha2::Sha512::digest(b)),
            DigestAlgorithm::SHA3512Half | DigestAlgorithm::SHA3256 => {
                format!("{:x}", sha3::Sha3_256::digest(b))
            }
            DigestAlgorithm::SHA3512 => format!("{:x}", sha3::Sha3_512::digest(b)),
        };

        Digest {
            source: src,
            algorithm: algo,
            hash,
        }
    }

    /// Recompute the digest over `content` with this digest's algorithm and
    /// compare.
    pub fn verify(&self, content: &[u8]) -> Result<()> {
        let computed = Digest::from_bytes(content, self.algorithm, self.source);
        if computed.hash != self.hash {
            return Err(DigestError::Mismatch {
                expected: self.hash.clone(),
                computed: computed.hash,
            });
        }
        Ok(())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.source == DigestSource::PrimaryPayloadHash && self.algorithm == DigestAlgorithm::SHA1
        {
            return write!(f, "{}", self.hash);
        }
        write!(
            f,
            "{}:{}:{}",
            match self.source {
                DigestSource::UncompressedFile | DigestSource::PrimaryPayloadHash => "file",
                DigestSource::GzipCompressed => "gzip",
                DigestSource::GNUElf => "gelf",
                DigestSource::GNUElfUnsigned => "gelf.unsigned",
                DigestSource::Unknown => "unknown",
            },
            match self.algorithm {
                DigestAlgorithm::SHA1 => "sha1",
                DigestAlgorithm::SHA256 => "sha256t",
                DigestAlgorithm::SHA512Half => "sha512t_256",
                DigestAlgorithm::SHA512 => "sha512t",
                DigestAlgorithm::SHA3256 => "sha3256t",
                DigestAlgorithm::SHA3512Half => "sha3512t_256",
                DigestAlgorithm::SHA3512 => "sha3512t",
            },
            self.hash
        )
    }
}

#[derive(Debug, Error, Diagnostic, PartialEq)]
pub enum DigestError {
    #[error("hashing algorithm {algorithm:?} is not known by this library")]
    #[diagnostic(
        code(ips::digest_error::unknown_algorithm),
        help("Use one of: sha1, sha256t, sha512t_256, sha512t, sha3256t, sha3512t_256, sha3512t")
    )]
    UnknownAlgorithm { algorithm: String },

    #[error("digest {digest:?} is not formatted properly: {details:?}")]
    #[diagnostic(
        code(ips::digest_error::invalid_format),
        help("Digests are either a bare sha1 hex string or 'source:algorithm:hash'")
    )]
    InvalidDigestFormat { digest: String, details: String },

    #[error("content hash mismatch: expected {expected}, computed {computed}")]
    #[diagnostic(
        code(ips::digest_error::mismatch),
        help("The fetched content is corrupt or does not belong to this action")
    )]
    Mismatch { expected: String, computed: String },
}
