//! logsig-core: hash imprints, the TLV codec, file formats and I/O helpers.
//!
//! This crate is the stable boundary shared by the tree engine, the
//! signature service and the task drivers:
//! - hash algorithms and imprints (`DataHash`) plus the node/mask rules,
//! - a streaming TLV reader/writer that separates clean EOF from truncation,
//! - typed views of the block header, meta-record and block signature
//!   elements, and the file magic,
//! - capped log-line reading, atomic outputs and advisory read locks.
//!
//! ```
//! use logsig_core::prelude::*;
//! let h = HashAlgorithm::Sha256.hash(b"line");
//! let t = Tlv::imprint(tag::RECORD_HASH, &h)?;
//! assert_eq!(Tlv::parse(t.raw())?.as_imprint()?, h);
//! # Ok::<(), logsig_core::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Small, explicit allowlist to keep docs readable and APIs ergonomic.
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::doc_markdown
)]

/// Error type and `Result` alias.
pub mod error;
/// Magic, versions and element layouts.
pub mod format;
/// Hash algorithms, imprints, node and mask hashing.
pub mod hash;
/// Line reader, inputs, atomic outputs, locks.
pub mod io;
/// TLV encoding and streaming.
pub mod tlv;

// ---- Re-exports for workspace convenience ----
pub use error::{Error, ErrorKind, IoContext, Result};
pub use format::{
    aggregation_level, tag, BlockHeader, BlockSignature, LogSigVersion, MetaRecord, SignatureBody,
};
pub use hash::{hash_mask, hash_node, DataHash, DataHasher, HashAlgorithm};
pub use tlv::{Tlv, TlvReader, TlvWriter};

/// Commonly-used items for quick imports.
///
/// ```rust
/// use logsig_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::format::{tag, BlockHeader, BlockSignature, LogSigVersion, SignatureBody};
    pub use crate::hash::{DataHash, HashAlgorithm};
    pub use crate::tlv::{Tlv, TlvReader, TlvWriter};
}
