//! Per-block and per-file bookkeeping plus the context every task driver
//! threads through the element handlers.

use crate::lines::LogLines;
use logsig_core::{DataHash, Error, HashAlgorithm, LogSigVersion, Result};
use logsig_merkle::{MerkleTree, RecordChainBuilder};
use serde::Serialize;

/// How many of the tree hashes closing a block were present in the file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum FinalTreeHashes {
    /// None of them (or the block keeps no tree hashes).
    #[default]
    None,
    /// Only a prefix; tolerated with a warning.
    Some,
    /// All of them.
    All,
}

/// Counters and flags of the block being processed.
#[derive(Clone, Debug, Default, Serialize)]
pub struct BlockInfo {
    /// 1-based block number within the file.
    pub block_no: u64,
    /// Log line number of the block's first record.
    pub first_line_no: u64,
    /// Record count declared by the block signature.
    pub record_count: u64,
    /// Leaves aggregated so far (records and meta-records).
    pub nof_record_hashes: u64,
    /// Meta-record leaves among them.
    pub nof_meta_records: u64,
    /// Tree hash elements seen.
    pub nof_tree_hashes: u64,
    /// Hash function from the header.
    pub hash_algorithm: Option<HashAlgorithm>,
    /// Input hash from the header.
    pub input_hash: Option<DataHash>,
    /// Root recomputed at the signature (or the declared one).
    pub root_hash: Option<DataHash>,
    /// Earliest record time found in the block's log lines.
    pub rec_time_min: Option<i64>,
    /// Latest record time found in the block's log lines.
    pub rec_time_max: Option<i64>,
    /// The file carries a record hash for every record.
    pub keep_record_hashes: bool,
    /// The file carries tree hashes.
    pub keep_tree_hashes: bool,
    /// Closing tree hashes present.
    pub final_tree_hashes: FinalTreeHashes,
    /// The last leaf was a meta-record.
    pub ends_with_meta_record: bool,
    /// Block closed with the unsigned marker.
    pub not_signed: bool,
    /// Signing time of this block, 0 when unknown.
    pub sig_time: u64,

    #[serde(skip)]
    pub(crate) header_seen: bool,
    #[serde(skip)]
    pub(crate) signature_seen: bool,
    #[serde(skip)]
    pub(crate) closed: bool,
    #[serde(skip)]
    pub(crate) finished: bool,
    #[serde(skip)]
    pub(crate) recomputable: bool,
    #[serde(skip)]
    pub(crate) pending_meta_hash: Option<DataHash>,
    #[serde(skip)]
    pub(crate) final_consumed: usize,
    #[serde(skip)]
    pub(crate) lines_read: u64,
}

impl BlockInfo {
    /// Fresh block `block_no` whose first record is line `first_line_no`.
    #[must_use]
    pub fn start(block_no: u64, first_line_no: u64) -> Self {
        Self {
            block_no,
            first_line_no,
            recomputable: true,
            ..Self::default()
        }
    }

    /// Log records aggregated so far (meta-records excluded).
    #[must_use]
    pub const fn records(&self) -> u64 {
        self.nof_record_hashes - self.nof_meta_records
    }

    /// Line number of the last record of the block.
    #[must_use]
    pub const fn last_line_no(&self) -> u64 {
        self.first_line_no.saturating_add(self.record_count).saturating_sub(1)
    }

    /// Whether the root could be recomputed from what was available.
    #[must_use]
    pub const fn is_recomputable(&self) -> bool {
        self.recomputable
    }

    pub(crate) fn note_time(&mut self, t: i64) {
        self.rec_time_min = Some(self.rec_time_min.map_or(t, |m| m.min(t)));
        self.rec_time_max = Some(self.rec_time_max.map_or(t, |m| m.max(t)));
    }

    pub(crate) fn algorithm(&self) -> Result<HashAlgorithm> {
        self.hash_algorithm
            .ok_or_else(|| Error::format("element outside of a block"))
    }
}

/// Totals and warnings accumulated over one file.
#[derive(Clone, Debug, Serialize)]
pub struct FileInfo {
    /// Format of the file.
    pub version: LogSigVersion,
    /// Blocks seen.
    pub nof_blocks: u64,
    /// Log records covered by the finished blocks.
    pub nof_total_records: u64,
    /// Meta-records in the finished blocks.
    pub nof_total_meta_records: u64,
    /// Blocks that failed verification (continue-on-fail only).
    pub nof_total_failed_blocks: u64,
    /// Record or tree hash mismatches.
    pub nof_total_hash_fails: u64,
    /// Earliest record time in the file.
    pub rec_time_min: Option<i64>,
    /// Latest record time in the file.
    pub rec_time_max: Option<i64>,
    /// Legacy (v1.1) format.
    pub warning_legacy: bool,
    /// Some block carried only part of its closing tree hashes.
    pub warning_tree_hashes: bool,
    /// Some block is unsigned.
    pub warning_unsigned: bool,
}

impl FileInfo {
    /// Empty totals for a file of `version`.
    #[must_use]
    pub const fn new(version: LogSigVersion) -> Self {
        Self {
            version,
            nof_blocks: 0,
            nof_total_records: 0,
            nof_total_meta_records: 0,
            nof_total_failed_blocks: 0,
            nof_total_hash_fails: 0,
            rec_time_min: None,
            rec_time_max: None,
            warning_legacy: version.is_legacy(),
            warning_tree_hashes: false,
            warning_unsigned: false,
        }
    }
}

/// Verify-only state.
#[derive(Debug, Default)]
pub struct VerifyState {
    /// Blocks whose signature verified.
    pub verified: u64,
    /// First block signed earlier than its predecessor, with both times.
    pub sig_time_violation: Option<(u64, u64, u64)>,
    /// Signing time of the first and last verified block.
    pub first_sig_time: Option<u64>,
    /// See above.
    pub last_sig_time: Option<u64>,
}

/// Extend-only state.
#[derive(Debug, Default)]
pub struct ExtendState {
    /// Signatures replaced by extended ones.
    pub extended: u64,
    /// Unsigned blocks copied as they were.
    pub left_unsigned: u64,
}

/// Sign-only state.
#[derive(Debug, Default)]
pub struct SignState {
    /// Blocks counted by the pre-pass, when one ran.
    pub expected_blocks: Option<u64>,
    /// Blocks that were signed on input.
    pub already_signed: u64,
    /// Blocks signed now.
    pub newly_signed: u64,
    /// Blocks the service refused to sign.
    pub failed: u64,
}

/// Integrate-only state.
#[derive(Debug, Default)]
pub struct IntegrateState {
    /// Signatures merged in.
    pub signed: u64,
    /// Partial signatures that were still unsigned.
    pub unsigned: u64,
}

/// Extract-only state.
#[derive(Debug)]
pub struct ExtractState {
    /// Builds record chains while the tree is rebuilt.
    pub builder: RecordChainBuilder,
    /// Records written to the excerpt so far.
    pub extracted: u64,
}

/// The task a context runs, with its private state.
#[derive(Debug)]
pub enum TaskState {
    /// Verify a log signature file.
    Verify(VerifyState),
    /// Extend its signatures.
    Extend(ExtendState),
    /// Sign unsigned blocks.
    Sign(SignState),
    /// Merge asynchronous part files.
    Integrate(IntegrateState),
    /// Extract record chains.
    Extract(ExtractState),
}

impl TaskState {
    /// Name for log messages.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Verify(_) => "verify",
            Self::Extend(_) => "extend",
            Self::Sign(_) => "sign",
            Self::Integrate(_) => "integrate",
            Self::Extract(_) => "extract",
        }
    }
}

/// Everything the element handlers share while one file is processed.
pub struct LogSigContext<'a> {
    pub(crate) task: TaskState,
    pub(crate) file: FileInfo,
    pub(crate) block: BlockInfo,
    pub(crate) tree: MerkleTree,
    pub(crate) lines: Option<LogLines<'a>>,
    /// Signing time of the previous signed block.
    pub(crate) sig_time_0: u64,
    /// Last leaf of the previous block; `None` when unknown.
    pub(crate) last_leaf: Option<DataHash>,
}

impl<'a> LogSigContext<'a> {
    /// Context for one file of `version`, optionally paired with its log.
    #[must_use]
    pub fn new(task: TaskState, version: LogSigVersion, lines: Option<LogLines<'a>>) -> Self {
        Self {
            task,
            file: FileInfo::new(version),
            block: BlockInfo::default(),
            tree: MerkleTree::new(HashAlgorithm::Sha256),
            lines,
            sig_time_0: 0,
            last_leaf: None,
        }
    }

    /// File totals so far.
    #[must_use]
    pub const fn file(&self) -> &FileInfo {
        &self.file
    }

    /// Current (or last) block.
    #[must_use]
    pub const fn block(&self) -> &BlockInfo {
        &self.block
    }

    /// Task state.
    #[must_use]
    pub const fn task(&self) -> &TaskState {
        &self.task
    }

    /// Last leaf of the last closed block.
    #[must_use]
    pub const fn last_leaf(&self) -> Option<&DataHash> {
        self.last_leaf.as_ref()
    }
}
