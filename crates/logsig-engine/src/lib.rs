//! Block/file state machine and task drivers for KSI log signatures.
//!
//! Every driver streams a log signature file element by element through
//! the same handlers (block header, record hash, meta-record, tree hash,
//! block signature), rebuilding each block's Merkle tree and checking it
//! against what the file declares. What happens at each block signature
//! is task specific:
//!
//! - [`verify`]: check links, roots and signatures; excerpts too.
//! - [`extend`]: replace signatures by extended ones.
//! - [`sign`]: sign blocks closed with the unsigned marker.
//! - [`integrate`]: merge the part files of asynchronous signing.
//! - [`extract`]: emit record chains for chosen log lines.
//!
//! [`files`] wraps the stream drivers with default paths, atomic outputs
//! and part-file locks.

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

/// Extension of signatures.
pub mod extend;
/// Record extraction into excerpts.
pub mod extract;
/// File-level entry points.
pub mod files;
/// Merging of asynchronous part files.
pub mod integrate;
/// The log file side.
pub mod lines;
/// Element handlers shared by all tasks.
pub mod process;
/// Signing of unsigned blocks.
pub mod sign;
/// Block, file and task state.
pub mod state;
/// Verification of log signatures and excerpts.
pub mod verify;

pub use extend::{extend, ExtendSummary};
pub use extract::{extract, ExtractSummary};
pub use files::{
    extend_file, extract_files, integrate_log, sign_file, verify_file, ExtractFiles,
    IntegrateOutcome,
};
pub use integrate::{integrate, IntegrateSummary};
pub use lines::{record_time, LogLines};
pub use process::read_magic;
pub use sign::{count_blocks, sign, BlockCount, SignSummary};
pub use state::{BlockInfo, FileInfo, FinalTreeHashes, LogSigContext, TaskState};
pub use verify::{verify, ClientIdCheck, VerifyOptions, VerifyRun, VerifySummary};
