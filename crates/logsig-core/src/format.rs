//! File magic and the element layouts of log signature files.

use crate::error::{Error, Result};
use crate::hash::{DataHash, HashAlgorithm};
use crate::tlv::Tlv;
use serde::Serialize;
use std::fmt;

/// Length of the magic prefix.
pub const MAGIC_LEN: usize = 8;

/// Top-level tags.
pub mod tag {
    /// Block header.
    pub const BLOCK_HEADER: u16 = 0x901;
    /// Record hash.
    pub const RECORD_HASH: u16 = 0x902;
    /// Meta-record.
    pub const META_RECORD: u16 = 0x903;
    /// Block signature, partial block or partial signature.
    pub const BLOCK_SIGNATURE: u16 = 0x904;
    /// Excerpt block signature.
    pub const EXCERPT_SIGNATURE: u16 = 0x905;
    /// Excerpt record chain.
    pub const RECORD_CHAIN: u16 = 0x907;
    /// Tree hash.
    pub const TREE_HASH: u16 = 0x911;
    /// Opaque signature object inside 0x904 / 0x905.
    pub const SIGNATURE: u16 = 0x0800;
}

/// File formats, selected by the magic prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum LogSigVersion {
    /// Legacy log signature.
    LogSig11,
    /// Current log signature.
    LogSig12,
    /// Legacy excerpt.
    RecSig11,
    /// Current excerpt.
    RecSig12,
    /// Blocks part written by an asynchronous signer.
    Log12Blk,
    /// Signatures part written by an asynchronous signer.
    Log12Sig,
}

impl LogSigVersion {
    /// All known versions.
    pub const ALL: [Self; 6] = [
        Self::LogSig11,
        Self::LogSig12,
        Self::RecSig11,
        Self::RecSig12,
        Self::Log12Blk,
        Self::Log12Sig,
    ];

    /// The 8-byte magic.
    #[must_use]
    pub const fn magic(self) -> &'static [u8; MAGIC_LEN] {
        match self {
            Self::LogSig11 => b"LOGSIG11",
            Self::LogSig12 => b"LOGSIG12",
            Self::RecSig11 => b"RECSIG11",
            Self::RecSig12 => b"RECSIG12",
            Self::Log12Blk => b"LOG12BLK",
            Self::Log12Sig => b"LOG12SIG",
        }
    }

    /// Identify a magic prefix; unknown magic is a format error.
    pub fn from_magic(bytes: &[u8]) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|v| v.magic().as_slice() == bytes)
            .ok_or_else(|| {
                Error::format(format!(
                    "unknown file magic {:?}",
                    String::from_utf8_lossy(bytes)
                ))
            })
    }

    /// Full log signature (legacy or current).
    #[must_use]
    pub const fn is_log_signature(self) -> bool {
        matches!(self, Self::LogSig11 | Self::LogSig12)
    }

    /// Excerpt file.
    #[must_use]
    pub const fn is_excerpt(self) -> bool {
        matches!(self, Self::RecSig11 | Self::RecSig12)
    }

    /// Legacy formats that need special treatment.
    #[must_use]
    pub const fn is_legacy(self) -> bool {
        matches!(self, Self::LogSig11 | Self::RecSig11)
    }
}

impl fmt::Display for LogSigVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(self.magic()))
    }
}

/// Level at which a block's root is handed to the signing service.
///
/// Legacy files always sign at level 0 regardless of the tree height.
#[must_use]
pub const fn aggregation_level(version: LogSigVersion, record_count: u64) -> u8 {
    if matches!(version, LogSigVersion::LogSig11) || record_count == 0 {
        return 0;
    }
    let mut level = 1u8;
    let mut c = record_count - 1;
    while c > 0 {
        level += 1;
        c /= 2;
    }
    level
}

/// Reject unknown critical children; non-critical ones are skipped.
fn unknown_child(parent: u16, child: &Tlv) -> Result<()> {
    if child.is_non_critical() {
        Ok(())
    } else {
        Err(Error::format(format!(
            "unknown critical element 0x{:x} in 0x{parent:x}",
            child.tag()
        )))
    }
}

fn missing(parent: u16, what: &str) -> Error {
    Error::format(format!("0x{parent:x} is missing its {what}"))
}

fn expect_tag(tlv: &Tlv, want: u16) -> Result<()> {
    if tlv.tag() == want {
        Ok(())
    } else {
        Err(Error::format(format!(
            "expected TLV 0x{want:x}, found 0x{:x}",
            tlv.tag()
        )))
    }
}

/* ----------------------------- 0x901 header ----------------------------- */

/// Block header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    /// Hash function used for the block's tree.
    pub algorithm: HashAlgorithm,
    /// Per-block random seed mixed into every mask.
    pub random_seed: Vec<u8>,
    /// Last leaf of the previous block.
    pub input_hash: DataHash,
}

impl BlockHeader {
    /// Decode a 0x901 element.
    pub fn from_tlv(tlv: &Tlv) -> Result<Self> {
        expect_tag(tlv, tag::BLOCK_HEADER)?;
        let (mut alg, mut seed, mut input) = (None, None, None);
        for c in tlv.children()? {
            match c.tag() {
                0x01 => {
                    let id = u8::try_from(c.as_uint()?)
                        .map_err(|_| Error::format("hash algorithm id out of range"))?;
                    alg = Some(HashAlgorithm::from_id(id)?);
                }
                0x02 => seed = Some(c.value().to_vec()),
                0x03 => input = Some(c.as_imprint()?),
                _ => unknown_child(tag::BLOCK_HEADER, &c)?,
            }
        }
        Ok(Self {
            algorithm: alg.ok_or_else(|| missing(tag::BLOCK_HEADER, "hash algorithm"))?,
            random_seed: seed.ok_or_else(|| missing(tag::BLOCK_HEADER, "random seed"))?,
            input_hash: input.ok_or_else(|| missing(tag::BLOCK_HEADER, "input hash"))?,
        })
    }

    /// Encode as 0x901.
    pub fn to_tlv(&self) -> Result<Tlv> {
        Tlv::nested(
            tag::BLOCK_HEADER,
            &[
                Tlv::uint(0x01, u64::from(self.algorithm.id()))?,
                Tlv::new(0x02, &self.random_seed)?,
                Tlv::imprint(0x03, &self.input_hash)?,
            ],
        )
    }
}

/* --------------------------- 0x903 meta-record --------------------------- */

/// Key/value pair embedded in the block as its own leaf.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetaRecord {
    /// Number of log records that precede it in the block.
    pub index: u64,
    /// Key.
    pub key: String,
    /// Value.
    pub value: Vec<u8>,
}

impl MetaRecord {
    /// Decode a 0x903 element.
    pub fn from_tlv(tlv: &Tlv) -> Result<Self> {
        expect_tag(tlv, tag::META_RECORD)?;
        let (mut index, mut key, mut value) = (None, None, None);
        for c in tlv.children()? {
            match c.tag() {
                0x01 => index = Some(c.as_uint()?),
                0x02 => key = Some(c.as_utf8()?.to_owned()),
                0x03 => value = Some(c.value().to_vec()),
                _ => unknown_child(tag::META_RECORD, &c)?,
            }
        }
        Ok(Self {
            index: index.ok_or_else(|| missing(tag::META_RECORD, "record index"))?,
            key: key.ok_or_else(|| missing(tag::META_RECORD, "key"))?,
            value: value.unwrap_or_default(),
        })
    }

    /// Encode as 0x903.
    pub fn to_tlv(&self) -> Result<Tlv> {
        Tlv::nested(
            tag::META_RECORD,
            &[
                Tlv::uint(0x01, self.index)?,
                Tlv::utf8(0x02, &self.key)?,
                Tlv::new(0x03, &self.value)?,
            ],
        )
    }
}

/* ------------------------ 0x904 block signature ------------------------ */

/// What closes a block: a real signature or the unsigned marker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SignatureBody {
    /// Opaque signature bytes produced by the signing service.
    Signed(Vec<u8>),
    /// Block not yet signed; carries the root the signer must sign.
    Unsigned {
        /// Declared root hash.
        root_hash: DataHash,
    },
}

/// Block signature element (also used for partial blocks and partial
/// signatures in the asynchronous part files).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockSignature {
    /// Declared number of log records in the block.
    pub record_count: u64,
    /// Signature or unsigned marker.
    pub body: SignatureBody,
}

impl BlockSignature {
    /// Decode a 0x904 element.
    pub fn from_tlv(tlv: &Tlv) -> Result<Self> {
        expect_tag(tlv, tag::BLOCK_SIGNATURE)?;
        let (mut count, mut body) = (None, None);
        for c in tlv.children()? {
            match c.tag() {
                0x01 => count = Some(c.as_uint()?),
                tag::SIGNATURE => body = Some(SignatureBody::Signed(c.value().to_vec())),
                0x02 => {
                    let root = c
                        .children()?
                        .into_iter()
                        .find(|g| g.tag() == 0x01)
                        .ok_or_else(|| missing(tag::BLOCK_SIGNATURE, "unsigned root hash"))?;
                    body = Some(SignatureBody::Unsigned {
                        root_hash: root.as_imprint()?,
                    });
                }
                _ => unknown_child(tag::BLOCK_SIGNATURE, &c)?,
            }
        }
        Ok(Self {
            record_count: count.ok_or_else(|| missing(tag::BLOCK_SIGNATURE, "record count"))?,
            body: body.ok_or_else(|| missing(tag::BLOCK_SIGNATURE, "signature"))?,
        })
    }

    /// Encode as 0x904.
    pub fn to_tlv(&self) -> Result<Tlv> {
        let body = match &self.body {
            SignatureBody::Signed(sig) => Tlv::new(tag::SIGNATURE, sig)?,
            SignatureBody::Unsigned { root_hash } => {
                Tlv::nested(0x02, &[Tlv::imprint(0x01, root_hash)?])?
            }
        };
        Tlv::nested(
            tag::BLOCK_SIGNATURE,
            &[Tlv::uint(0x01, self.record_count)?, body],
        )
    }

    /// Signature bytes, if signed.
    #[must_use]
    pub fn signature(&self) -> Option<&[u8]> {
        match &self.body {
            SignatureBody::Signed(sig) => Some(sig),
            SignatureBody::Unsigned { .. } => None,
        }
    }

    /// Whether the block still lacks a signature.
    #[must_use]
    pub const fn is_unsigned(&self) -> bool {
        matches!(self.body, SignatureBody::Unsigned { .. })
    }
}

/* ----------------------- 0x905 excerpt signature ----------------------- */

/// Decode the signature bytes of a 0x905 element.
pub fn excerpt_signature_from_tlv(tlv: &Tlv) -> Result<Vec<u8>> {
    expect_tag(tlv, tag::EXCERPT_SIGNATURE)?;
    let mut sig = None;
    for c in tlv.children()? {
        match c.tag() {
            tag::SIGNATURE => sig = Some(c.value().to_vec()),
            _ => unknown_child(tag::EXCERPT_SIGNATURE, &c)?,
        }
    }
    sig.ok_or_else(|| missing(tag::EXCERPT_SIGNATURE, "signature"))
}

/// Encode a 0x905 element.
pub fn excerpt_signature_to_tlv(sig: &[u8]) -> Result<Tlv> {
    Tlv::nested(tag::EXCERPT_SIGNATURE, &[Tlv::new(tag::SIGNATURE, sig)?])
}

/// Short name of a top-level tag, for log messages.
#[must_use]
pub const fn tag_name(t: u16) -> &'static str {
    match t {
        tag::BLOCK_HEADER => "block header",
        tag::RECORD_HASH => "record hash",
        tag::META_RECORD => "meta-record",
        tag::BLOCK_SIGNATURE => "block signature",
        tag::EXCERPT_SIGNATURE => "excerpt signature",
        tag::RECORD_CHAIN => "record chain",
        tag::TREE_HASH => "tree hash",
        _ => "unknown element",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn magic_round_trip_and_unknown() {
        for v in LogSigVersion::ALL {
            assert_eq!(LogSigVersion::from_magic(v.magic()).unwrap(), v);
        }
        let e = LogSigVersion::from_magic(b"LOGSIG13").unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidInputFormat);
    }

    #[test]
    fn aggregation_levels() {
        use LogSigVersion::{LogSig11, LogSig12};
        assert_eq!(aggregation_level(LogSig12, 0), 0);
        assert_eq!(aggregation_level(LogSig12, 1), 1);
        assert_eq!(aggregation_level(LogSig12, 2), 2);
        assert_eq!(aggregation_level(LogSig12, 3), 3);
        assert_eq!(aggregation_level(LogSig12, 4), 3);
        assert_eq!(aggregation_level(LogSig12, 5), 4);
        assert_eq!(aggregation_level(LogSig11, 1000), 0);
    }

    #[test]
    fn header_decodes_what_it_encodes() {
        let h = BlockHeader {
            algorithm: HashAlgorithm::Sha256,
            random_seed: vec![9; 32],
            input_hash: HashAlgorithm::Sha256.hash(b"prev"),
        };
        assert_eq!(BlockHeader::from_tlv(&h.to_tlv().unwrap()).unwrap(), h);
    }

    #[test]
    fn header_without_seed_is_rejected() {
        let t = Tlv::nested(
            tag::BLOCK_HEADER,
            &[
                Tlv::uint(0x01, 1).unwrap(),
                Tlv::imprint(0x03, &HashAlgorithm::Sha256.hash(b"")).unwrap(),
            ],
        )
        .unwrap();
        let e = BlockHeader::from_tlv(&t).unwrap_err();
        assert!(e.to_string().contains("random seed"));
    }

    #[test]
    fn unknown_children_follow_criticality() {
        let base = [
            Tlv::uint(0x01, 3).unwrap(),
            Tlv::nested(0x02, &[Tlv::imprint(0x01, &HashAlgorithm::Sha256.hash(b"r")).unwrap()])
                .unwrap(),
        ];
        let mut lenient = base.to_vec();
        lenient.push(Tlv::with_flags(0x1e, true, false, b"x").unwrap());
        let sig = BlockSignature::from_tlv(&Tlv::nested(tag::BLOCK_SIGNATURE, &lenient).unwrap())
            .unwrap();
        assert!(sig.is_unsigned());
        assert_eq!(sig.record_count, 3);

        let mut strict = base.to_vec();
        strict.push(Tlv::new(0x1e, b"x").unwrap());
        assert!(
            BlockSignature::from_tlv(&Tlv::nested(tag::BLOCK_SIGNATURE, &strict).unwrap())
                .is_err()
        );
    }

    #[test]
    fn signed_block_signature_keeps_bytes() {
        let s = BlockSignature {
            record_count: 2,
            body: SignatureBody::Signed(vec![1, 2, 3]),
        };
        let back = BlockSignature::from_tlv(&s.to_tlv().unwrap()).unwrap();
        assert_eq!(back.signature(), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn meta_record_round_trip() {
        let m = MetaRecord {
            index: 4,
            key: "com.example.reason".into(),
            value: b"rotate".to_vec(),
        };
        assert_eq!(MetaRecord::from_tlv(&m.to_tlv().unwrap()).unwrap(), m);
    }
}
