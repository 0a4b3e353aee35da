//! Local signing service: a BLAKE3 keyed MAC over the signed fields.
//!
//! ⚠️ Anyone holding the key can both sign and verify. This service exists so
//! the tool can run end to end without network access (tests, air-gapped
//! archives); it is not a trust anchor.

use crate::service::{SignatureInfo, SignatureService, VerificationResult};
use logsig_core::{DataHash, Error, Result, Tlv};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Domain prefix mixed into every MAC.
const MAC_DOMAIN: &[u8] = b"logsig.local-signature.v1";

const T_DOCUMENT_HASH: u16 = 0x01;
const T_LEVEL: u16 = 0x02;
const T_SIGNING_TIME: u16 = 0x03;
const T_SIGNER_ID: u16 = 0x04;
const T_EXTENDED_TO: u16 = 0x05;
const T_MAC: u16 = 0x06;

/// Where signing and extension times come from.
#[derive(Debug)]
pub enum Clock {
    /// Wall clock.
    System,
    /// Starts at `next` and advances by `step` on every reading.
    Stepping {
        /// Next value handed out.
        next: AtomicU64,
        /// Increment per reading.
        step: u64,
    },
}

impl Clock {
    /// Deterministic clock for reproducible runs.
    #[must_use]
    pub const fn stepping(start: u64, step: u64) -> Self {
        Self::Stepping {
            next: AtomicU64::new(start),
            step,
        }
    }

    fn now(&self) -> u64 {
        match self {
            Self::System => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_secs()),
            Self::Stepping { next, step } => next.fetch_add(*step, Ordering::Relaxed),
        }
    }
}

/// Keyed-MAC signature service.
#[derive(Debug)]
pub struct LocalService {
    key: [u8; 32],
    signer_id: String,
    clock: Clock,
}

impl LocalService {
    /// Service with the wall clock.
    #[must_use]
    pub fn new(key: [u8; 32], signer_id: impl Into<String>) -> Self {
        Self {
            key,
            signer_id: signer_id.into(),
            clock: Clock::System,
        }
    }

    /// Service keyed by 64 hex characters.
    pub fn from_hex_key(key_hex: &str, signer_id: impl Into<String>) -> Result<Self> {
        let bytes = hex::decode(key_hex.trim())
            .map_err(|e| Error::argument(format!("signing key is not hex: {e}")))?;
        let key: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            Error::argument(format!("signing key must be 32 bytes, got {}", v.len()))
        })?;
        Ok(Self::new(key, signer_id))
    }

    /// Replace the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn mac(&self, fields: &[u8]) -> blake3::Hash {
        let mut h = blake3::Hasher::new_keyed(&self.key);
        h.update(MAC_DOMAIN);
        h.update(fields);
        h.finalize()
    }

    fn encode(&self, info: &SignatureInfo) -> Result<Vec<u8>> {
        let mut fields = Vec::new();
        for t in [
            Tlv::imprint(T_DOCUMENT_HASH, &info.document_hash)?,
            Tlv::uint(T_LEVEL, u64::from(info.aggregation_level))?,
            Tlv::uint(T_SIGNING_TIME, info.signing_time)?,
            Tlv::utf8(T_SIGNER_ID, &info.signer_id)?,
        ] {
            fields.extend_from_slice(t.raw());
        }
        if let Some(ext) = info.extended_to {
            fields.extend_from_slice(Tlv::uint(T_EXTENDED_TO, ext)?.raw());
        }
        let mac = self.mac(&fields);
        fields.extend_from_slice(Tlv::new(T_MAC, mac.as_bytes())?.raw());
        Ok(fields)
    }

    /// Decode, returning the claims, the MAC-covered prefix and the MAC.
    fn decode(signature: &[u8]) -> Result<(SignatureInfo, &[u8], [u8; 32])> {
        let (mut doc, mut level, mut time, mut signer, mut ext, mut mac) =
            (None, None, None, None, None, None);
        let mut covered = 0usize;
        let mut rest = signature;
        while !rest.is_empty() {
            if mac.is_some() {
                return Err(Error::format("data after signature MAC"));
            }
            let (t, used) = Tlv::parse_prefix(rest)?;
            match t.tag() {
                T_DOCUMENT_HASH => doc = Some(t.as_imprint()?),
                T_LEVEL => {
                    level = Some(
                        u8::try_from(t.as_uint()?)
                            .map_err(|_| Error::format("signature level out of range"))?,
                    );
                }
                T_SIGNING_TIME => time = Some(t.as_uint()?),
                T_SIGNER_ID => signer = Some(t.as_utf8()?.to_owned()),
                T_EXTENDED_TO => ext = Some(t.as_uint()?),
                T_MAC => {
                    mac = Some(
                        <[u8; 32]>::try_from(t.value())
                            .map_err(|_| Error::format("signature MAC must be 32 bytes"))?,
                    );
                }
                other => {
                    return Err(Error::format(format!(
                        "unknown element 0x{other:x} in signature"
                    )))
                }
            }
            if mac.is_none() {
                covered += used;
            }
            rest = &rest[used..];
        }
        let missing = |what: &str| Error::format(format!("signature is missing its {what}"));
        let info = SignatureInfo {
            document_hash: doc.ok_or_else(|| missing("document hash"))?,
            aggregation_level: level.ok_or_else(|| missing("aggregation level"))?,
            signing_time: time.ok_or_else(|| missing("signing time"))?,
            extended_to: ext,
            signer_id: signer.ok_or_else(|| missing("signer id"))?,
        };
        Ok((
            info,
            &signature[..covered],
            mac.ok_or_else(|| missing("MAC"))?,
        ))
    }

    fn checked(&self, signature: &[u8]) -> Result<SignatureInfo> {
        let (info, covered, mac) = Self::decode(signature)?;
        // blake3::Hash equality is constant time.
        if self.mac(covered) != blake3::Hash::from(mac) {
            return Err(Error::verification("signature MAC does not verify"));
        }
        Ok(info)
    }
}

impl SignatureService for LocalService {
    fn sign(&self, hash: &DataHash, level: u8) -> Result<Vec<u8>> {
        self.encode(&SignatureInfo {
            document_hash: hash.clone(),
            aggregation_level: level,
            signing_time: self.clock.now(),
            extended_to: None,
            signer_id: self.signer_id.clone(),
        })
        .map_err(|e| Error::SigningFailure(e.to_string()))
    }

    fn verify(&self, signature: &[u8], hash: &DataHash) -> Result<VerificationResult> {
        let info = self.checked(signature)?;
        if &info.document_hash != hash {
            return Err(Error::verification(format!(
                "signature covers {}, expected {hash}",
                info.document_hash
            )));
        }
        Ok(VerificationResult {
            signing_time: info.signing_time,
            signer_id: info.signer_id,
            extended_to: info.extended_to,
        })
    }

    fn extend(&self, signature: &[u8]) -> Result<Vec<u8>> {
        let mut info = self.checked(signature)?;
        info.extended_to = Some(self.clock.now().max(info.signing_time));
        self.encode(&info)
    }

    fn inspect(&self, signature: &[u8]) -> Result<SignatureInfo> {
        Self::decode(signature).map(|(info, _, _)| info)
    }
}
