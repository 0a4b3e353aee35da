//! Signature service contract for log signatures.
//!
//! The task drivers never look inside a signature; they go through
//! [`SignatureService`]. [`LocalService`] implements it with a BLAKE3 keyed
//! MAC so that signing, verification and extension work offline.
//!
//! ⚠️ **Security note:** [`LocalService`] is symmetric. Use it for tests and
//! closed environments, not as a substitute for a timestamping authority.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(
    missing_docs,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::unwrap_used,
    clippy::expect_used
)]
#![allow(clippy::missing_errors_doc)]

/// Keyed-MAC service.
pub mod local;
/// Service trait and result types.
pub mod service;

pub use local::{Clock, LocalService};
pub use service::{SignatureInfo, SignatureService, VerificationResult};
