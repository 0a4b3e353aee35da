//! Per-block Merkle trees for KSI log signatures.
//!
//! - [`MerkleTree`]: online accumulator fed one leaf at a time, closing into
//!   the block root. Leaves are blinded with a mask chained from the
//!   previous leaf.
//! - [`TreeObserver`]: leaf and merge events, consumed by the
//!   [`RecordChainBuilder`] to build [`RecordChain`]s for extraction.
//! - [`RecordChain`]: a record hash plus sibling links; hashing up through
//!   the links reproduces the root.

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
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

/// Record chains and their TLV form.
pub mod chain;
/// Extract positions and the chain-building observer.
pub mod extract;
/// The tree engine and its observer interface.
pub mod tree;

pub use chain::{ChainLink, LinkDirection, RecordChain, MAX_CHAIN_LEN};
pub use extract::{ExtractPositions, ExtractedRecord, RecordChainBuilder};
pub use tree::{
    LeafEvent, LeafKind, MergeEvent, MerkleTree, NoObserver, TreeObserver, MAX_TREE_HEIGHT,
};
