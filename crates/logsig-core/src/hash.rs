//! Hash algorithms and imprints.
//!
//! An imprint is the algorithm id byte followed by the digest. Imprints are
//! what the TLV stream carries and what node hashing concatenates.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384, Sha512};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Supported hash functions, identified by their KSI algorithm id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashAlgorithm {
    /// SHA-256, id `0x01`.
    Sha256,
    /// SHA-384, id `0x04`.
    Sha384,
    /// SHA-512, id `0x05`.
    Sha512,
}

impl HashAlgorithm {
    /// Algorithm id as written in imprints and block headers.
    #[must_use]
    pub const fn id(self) -> u8 {
        match self {
            Self::Sha256 => 0x01,
            Self::Sha384 => 0x04,
            Self::Sha512 => 0x05,
        }
    }

    /// Look up an algorithm by id.
    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            0x01 => Ok(Self::Sha256),
            0x04 => Ok(Self::Sha384),
            0x05 => Ok(Self::Sha512),
            other => Err(Error::format(format!("unknown hash algorithm id 0x{other:02x}"))),
        }
    }

    /// Digest length in bytes.
    #[must_use]
    pub const fn digest_len(self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }

    /// Human readable name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Sha256 => "SHA-256",
            Self::Sha384 => "SHA-384",
            Self::Sha512 => "SHA-512",
        }
    }

    /// Start an incremental hash.
    #[must_use]
    pub fn hasher(self) -> DataHasher {
        let inner = match self {
            Self::Sha256 => HasherInner::Sha256(Sha256::new()),
            Self::Sha384 => HasherInner::Sha384(Sha384::new()),
            Self::Sha512 => HasherInner::Sha512(Sha512::new()),
        };
        DataHasher { inner }
    }

    /// One-shot hash of `data`.
    #[must_use]
    pub fn hash(self, data: &[u8]) -> DataHash {
        let mut h = self.hasher();
        h.update(data);
        h.finish()
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().replace('_', "-").as_str() {
            "SHA-256" | "SHA256" | "SHA2-256" => Ok(Self::Sha256),
            "SHA-384" | "SHA384" | "SHA2-384" => Ok(Self::Sha384),
            "SHA-512" | "SHA512" | "SHA2-512" => Ok(Self::Sha512),
            _ => Err(Error::argument(format!("unknown hash algorithm {s:?}"))),
        }
    }
}

enum HasherInner {
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

/// Incremental hasher producing a [`DataHash`].
pub struct DataHasher {
    inner: HasherInner,
}

impl DataHasher {
    /// Feed bytes.
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.inner {
            HasherInner::Sha256(h) => h.update(data),
            HasherInner::Sha384(h) => h.update(data),
            HasherInner::Sha512(h) => h.update(data),
        }
    }

    /// Finish and return the imprint.
    #[must_use]
    pub fn finish(self) -> DataHash {
        let (alg, digest) = match self.inner {
            HasherInner::Sha256(h) => (HashAlgorithm::Sha256, h.finalize().to_vec()),
            HasherInner::Sha384(h) => (HashAlgorithm::Sha384, h.finalize().to_vec()),
            HasherInner::Sha512(h) => (HashAlgorithm::Sha512, h.finalize().to_vec()),
        };
        let mut imprint = Vec::with_capacity(1 + digest.len());
        imprint.push(alg.id());
        imprint.extend_from_slice(&digest);
        DataHash(imprint.into())
    }
}

/// An immutable hash imprint.
///
/// Cloning is cheap: the same value is routinely held by a tree slot, the
/// previous-leaf register and any number of record chains at once.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct DataHash(Arc<[u8]>);

impl DataHash {
    /// Parse an imprint, checking the algorithm id and digest length.
    pub fn from_imprint(bytes: &[u8]) -> Result<Self> {
        let (&id, digest) = bytes
            .split_first()
            .ok_or_else(|| Error::format("empty hash imprint"))?;
        let alg = HashAlgorithm::from_id(id)?;
        if digest.len() != alg.digest_len() {
            return Err(Error::format(format!(
                "{alg} imprint has {} digest bytes, expected {}",
                digest.len(),
                alg.digest_len()
            )));
        }
        Ok(Self(bytes.into()))
    }

    /// Build from an algorithm and a raw digest.
    pub fn from_digest(alg: HashAlgorithm, digest: &[u8]) -> Result<Self> {
        let mut imprint = Vec::with_capacity(1 + digest.len());
        imprint.push(alg.id());
        imprint.extend_from_slice(digest);
        Self::from_imprint(&imprint)
    }

    /// Parse `"<id>:<hex digest>"` (as printed by [`fmt::Display`]) or a bare
    /// hex imprint.
    pub fn from_hex(s: &str) -> Result<Self> {
        let s = s.trim();
        let bytes = match s.split_once(':') {
            Some((id, digest)) => {
                let mut v = hex::decode(id)
                    .map_err(|e| Error::argument(format!("bad imprint {s:?}: {e}")))?;
                v.extend(
                    hex::decode(digest)
                        .map_err(|e| Error::argument(format!("bad imprint {s:?}: {e}")))?,
                );
                v
            }
            None => hex::decode(s).map_err(|e| Error::argument(format!("bad imprint {s:?}: {e}")))?,
        };
        Self::from_imprint(&bytes)
    }

    /// Algorithm of this imprint.
    #[must_use]
    pub fn algorithm(&self) -> HashAlgorithm {
        // from_imprint is the only constructor and validated the id.
        match self.0[0] {
            0x04 => HashAlgorithm::Sha384,
            0x05 => HashAlgorithm::Sha512,
            _ => HashAlgorithm::Sha256,
        }
    }

    /// Full imprint (id byte + digest).
    #[must_use]
    pub fn imprint(&self) -> &[u8] {
        &self.0
    }

    /// Digest without the id byte.
    #[must_use]
    pub fn digest(&self) -> &[u8] {
        &self.0[1..]
    }
}

impl fmt::Display for DataHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{}", self.0[0], hex::encode(self.digest()))
    }
}

impl fmt::Debug for DataHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataHash({self})")
    }
}

impl Serialize for DataHash {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

/* ------------------------- tree hashing rules ------------------------- */

/// Merkle node: `H(left || right || level)`.
#[must_use]
pub fn hash_node(alg: HashAlgorithm, left: &DataHash, right: &DataHash, level: u8) -> DataHash {
    let mut h = alg.hasher();
    h.update(left.imprint());
    h.update(right.imprint());
    h.update(&[level]);
    h.finish()
}

/// Blinding mask for the leaf that follows `prev_leaf`.
#[must_use]
pub fn hash_mask(alg: HashAlgorithm, prev_leaf: &DataHash, seed: &[u8]) -> DataHash {
    let mut h = alg.hasher();
    h.update(prev_leaf.imprint());
    h.update(seed);
    h.finish()
}
