//! The narrow contract the task drivers rely on.
//!
//! Signatures are opaque byte strings: whatever a service returns from
//! [`SignatureService::sign`] or [`SignatureService::extend`] is stored
//! verbatim in the log signature file and handed back unchanged later.

use logsig_core::{DataHash, Result};
use serde::Serialize;

/// What a signature claims, read without checking it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SignatureInfo {
    /// Hash the signature was issued for (the block root).
    pub document_hash: DataHash,
    /// Aggregation level the root was submitted at.
    pub aggregation_level: u8,
    /// Signing time, seconds since the Unix epoch.
    pub signing_time: u64,
    /// Calendar time the signature was extended to, if any.
    pub extended_to: Option<u64>,
    /// Identity of the signer.
    pub signer_id: String,
}

/// Outcome of a successful verification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VerificationResult {
    /// Signing time, seconds since the Unix epoch.
    pub signing_time: u64,
    /// Identity of the signer.
    pub signer_id: String,
    /// Calendar time the signature was extended to, if any.
    pub extended_to: Option<u64>,
}

/// Signing, verifying and extending, as one service.
///
/// Error contract:
/// - `sign` reports refusals as `Error::SigningFailure`; the sign task
///   records those and carries on with the next block.
/// - `verify` reports a signature that does not cover `hash` (or does not
///   check out at all) as `Error::VerificationFailure`.
/// - Undecodable signature bytes are `Error::InvalidInputFormat`.
pub trait SignatureService {
    /// Sign `hash`, a block root submitted at aggregation `level`.
    fn sign(&self, hash: &DataHash, level: u8) -> Result<Vec<u8>>;

    /// Check that `signature` is valid and covers `hash`.
    fn verify(&self, signature: &[u8], hash: &DataHash) -> Result<VerificationResult>;

    /// Move `signature` to a later calendar anchor; hashes are unchanged.
    fn extend(&self, signature: &[u8]) -> Result<Vec<u8>>;

    /// Decode what `signature` claims without verifying it.
    fn inspect(&self, signature: &[u8]) -> Result<SignatureInfo>;
}

impl<S: SignatureService + ?Sized> SignatureService for &S {
    fn sign(&self, hash: &DataHash, level: u8) -> Result<Vec<u8>> {
        (**self).sign(hash, level)
    }

    fn verify(&self, signature: &[u8], hash: &DataHash) -> Result<VerificationResult> {
        (**self).verify(signature, hash)
    }

    fn extend(&self, signature: &[u8]) -> Result<Vec<u8>> {
        (**self).extend(signature)
    }

    fn inspect(&self, signature: &[u8]) -> Result<SignatureInfo> {
        (**self).inspect(signature)
    }
}
