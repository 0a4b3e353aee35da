//! Element handlers shared by every task.
//!
//! Each handler validates one top-level element against the block state,
//! feeds the Merkle tree and compares what the file claims with what was
//! recomputed. Task-specific work (verifying, signing, writing output)
//! happens in the drivers once [`LogSigContext::process_block_signature`]
//! has closed the block.

use crate::lines::record_time;
use crate::state::{BlockInfo, FinalTreeHashes, LogSigContext, TaskState};
use logsig_core::format::{tag_name, MAGIC_LEN};
use logsig_core::{
    BlockHeader, BlockSignature, DataHash, Error, LogSigVersion, MetaRecord, Result,
    SignatureBody, Tlv, TlvReader,
};
use logsig_merkle::{LeafKind, NoObserver};
use std::io::Read;
use tracing::{debug, trace, warn};

/// Read and identify the file magic.
pub fn read_magic<R: Read>(reader: &mut TlvReader<R>) -> Result<LogSigVersion> {
    let magic = reader.read_exact_bytes(MAGIC_LEN)?;
    LogSigVersion::from_magic(&magic)
}

/// Tolerate an unknown non-critical element, reject anything else.
pub(crate) fn unexpected(tlv: &Tlv, version: LogSigVersion) -> Result<()> {
    if tlv.is_non_critical() {
        trace!(tag = tlv.tag(), "skipping non-critical element");
        return Ok(());
    }
    Err(Error::format(format!(
        "unexpected {} (0x{:x}) in a {version} file",
        tag_name(tlv.tag()),
        tlv.tag()
    )))
}

/// Sign and extend rewrite full log signature files only.
pub(crate) fn require_log_signature(version: LogSigVersion, task: &str) -> Result<()> {
    if version.is_excerpt() {
        return Err(Error::VerificationSkipped(format!(
            "{task} does not apply to excerpt files ({version})"
        )));
    }
    if !version.is_log_signature() {
        return Err(Error::format(format!(
            "{version} is a part file of asynchronous signing; integrate it first"
        )));
    }
    if version.is_legacy() {
        warn!(%version, "legacy log signature format");
    }
    Ok(())
}

/// Running record total after adding `count`; the line after it must
/// still be numbered.
fn check_record_total(total: u64, count: u64) -> Result<u64> {
    total
        .checked_add(count)
        .filter(|t| *t < u64::MAX)
        .ok_or_else(|| {
            Error::format(format!(
                "record count {count} overflows the running total of {total} records"
            ))
        })
}

/// A closed block: the parsed signature element and the recomputed root.
#[derive(Debug)]
pub(crate) struct BlockClose {
    pub signature: BlockSignature,
    /// `None` for empty or non-recomputable blocks.
    pub computed_root: Option<DataHash>,
}

impl LogSigContext<'_> {
    fn init_next_block(&mut self) -> Result<()> {
        if self.block.sig_time > 0 || self.block.not_signed {
            self.sig_time_0 = self.block.sig_time;
        }
        let next = self.block.block_no + 1;
        let first_line_no = self
            .file
            .nof_total_records
            .checked_add(1)
            .ok_or_else(|| Error::format("record total overflows before the next block"))?;
        self.block = BlockInfo::start(next, first_line_no);
        self.file.nof_blocks += 1;
        Ok(())
    }

    fn require_open_block(&self, tlv: &Tlv) -> Result<()> {
        if self.block.header_seen && !self.block.signature_seen {
            return Ok(());
        }
        Err(Error::format(format!(
            "{} (0x{:x}) outside of a block",
            tag_name(tlv.tag()),
            tlv.tag()
        )))
    }

    /// 0x901: start a block and check it continues the previous one.
    pub(crate) fn process_block_header(&mut self, tlv: &Tlv) -> Result<BlockHeader> {
        if self.block.header_seen && !self.block.signature_seen {
            return Err(Error::format(
                "block signature missing before the next block header",
            ));
        }
        let header = BlockHeader::from_tlv(tlv)?;
        self.init_next_block()?;
        self.block.header_seen = true;
        self.block.hash_algorithm = Some(header.algorithm);
        self.block.input_hash = Some(header.input_hash.clone());
        self.tree.reset(
            header.algorithm,
            &header.random_seed,
            header.input_hash.clone(),
        );
        if let TaskState::Extract(x) = &mut self.task {
            x.builder.begin_block(self.block.first_line_no);
        }
        debug!(
            block = self.block.block_no,
            alg = %header.algorithm,
            first_line = self.block.first_line_no,
            "block header"
        );
        if let Some(prev) = &self.last_leaf {
            if *prev != header.input_hash {
                return Err(Error::verification(format!(
                    "input hash {} does not match the last leaf {prev} of the previous block",
                    header.input_hash
                )));
            }
        }
        Ok(header)
    }

    /// 0x902: a record hash (or the hash of the meta-record just seen).
    pub(crate) fn process_record_hash(&mut self, tlv: &Tlv) -> Result<()> {
        self.require_open_block(tlv)?;
        let hash = tlv.as_imprint()?;
        if let Some(meta) = self.block.pending_meta_hash.take() {
            if meta != hash {
                self.file.nof_total_hash_fails += 1;
                return Err(Error::verification(format!(
                    "meta-record hash {hash} does not match the computed {meta}"
                )));
            }
            return Ok(());
        }
        if self.block.final_consumed > 0 {
            return Err(Error::format("record hash after the closing tree hashes"));
        }
        self.block.keep_record_hashes = true;
        if !self.block.recomputable {
            return Ok(());
        }
        if self.lines.is_some() {
            let line_no = self.block.first_line_no.saturating_add(self.block.records());
            let from_log = self.read_log_record()?;
            if from_log != hash {
                self.file.nof_total_hash_fails += 1;
                return Err(Error::verification(format!(
                    "record hash mismatch at line {line_no}: log gives {from_log}, file has {hash}"
                )));
            }
        }
        self.add_leaf(LeafKind::Record, &hash)
    }

    /// 0x903: a meta-record becomes a leaf of its own.
    pub(crate) fn process_meta_record(&mut self, tlv: &Tlv) -> Result<MetaRecord> {
        self.require_open_block(tlv)?;
        let meta = MetaRecord::from_tlv(tlv)?;
        let alg = self.block.algorithm()?;
        if self.block.final_consumed > 0 {
            return Err(Error::format("meta-record after the closing tree hashes"));
        }
        if self.block.recomputable {
            if !self.block.keep_record_hashes && self.lines.is_some() {
                while self.block.records() < meta.index {
                    let h = self.read_log_record()?;
                    self.add_leaf(LeafKind::Record, &h)?;
                }
            }
            if self.block.records() != meta.index {
                if self.block.keep_record_hashes || self.lines.is_some() {
                    return Err(Error::verification(format!(
                        "meta-record index {} does not match the {} records before it",
                        meta.index,
                        self.block.records()
                    )));
                }
                self.block.recomputable = false;
            }
        }
        if self.block.recomputable {
            let h = alg.hash(tlv.raw());
            self.add_leaf(LeafKind::MetaRecord, &h)?;
            self.block.pending_meta_hash = Some(h);
        } else {
            self.block.nof_record_hashes += 1;
            self.block.nof_meta_records += 1;
        }
        debug!(block = self.block.block_no, key = %meta.key, index = meta.index, "meta-record");
        Ok(meta)
    }

    /// 0x911: compare with the next recomputed node.
    ///
    /// With an empty queue the element is either a closing tree hash or,
    /// when the file keeps no record hashes, the leaf of the next log line.
    pub(crate) fn process_tree_hash(&mut self, tlv: &Tlv) -> Result<()> {
        self.require_open_block(tlv)?;
        let hash = tlv.as_imprint()?;
        self.block.keep_tree_hashes = true;
        self.block.nof_tree_hashes += 1;
        self.block.pending_meta_hash = None;
        if !self.block.recomputable {
            return Ok(());
        }
        let expected = if let Some(h) = self.tree.pop_unverified() {
            h
        } else {
            let finals = self.tree.final_hashes();
            let next_final = finals.get(self.block.final_consumed);
            match next_final {
                Some(f) if *f == hash || self.block.keep_record_hashes => {
                    self.block.final_consumed += 1;
                    f.clone()
                }
                _ if self.block.keep_record_hashes => {
                    return Err(Error::format("tree hash without a node to match"));
                }
                _ if self.lines.is_some() => {
                    if self.block.final_consumed > 0 {
                        return Err(Error::format("record after the closing tree hashes"));
                    }
                    let h = self.read_log_record()?;
                    self.add_leaf(LeafKind::Record, &h)?;
                    self.tree
                        .pop_unverified()
                        .ok_or_else(|| Error::format("tree hash without a node to match"))?
                }
                _ => {
                    debug!(block = self.block.block_no, "block cannot be recomputed");
                    self.block.recomputable = false;
                    return Ok(());
                }
            }
        };
        if expected != hash {
            self.file.nof_total_hash_fails += 1;
            return Err(Error::verification(format!(
                "tree hash {hash} does not match the computed {expected}"
            )));
        }
        Ok(())
    }

    /// 0x904: finish the tree and return the block root.
    pub(crate) fn process_block_signature(&mut self, tlv: &Tlv) -> Result<BlockClose> {
        self.require_open_block(tlv)?;
        let sig = BlockSignature::from_tlv(tlv)?;
        check_record_total(self.file.nof_total_records, sig.record_count)?;
        self.block.signature_seen = true;
        self.block.pending_meta_hash = None;
        self.block.record_count = sig.record_count;
        self.block.not_signed = sig.is_unsigned();

        if self.block.recomputable {
            if !self.block.keep_record_hashes && self.lines.is_some() {
                while self.block.records() < sig.record_count {
                    let h = self.read_log_record()?;
                    self.add_leaf(LeafKind::Record, &h)?;
                }
            }
            if self.block.records() < sig.record_count
                && !self.block.keep_record_hashes
                && self.lines.is_none()
            {
                self.block.recomputable = false;
            } else if self.block.records() != sig.record_count {
                return Err(Error::verification(format!(
                    "block declares {} records, {} found",
                    sig.record_count,
                    self.block.records()
                )));
            }
        }

        let computed_root = if self.block.recomputable {
            let pending = self.tree.unverified_len();
            if self.block.keep_tree_hashes && pending > 0 {
                return Err(Error::format(format!(
                    "{pending} tree hashes missing at the end of the block"
                )));
            }
            let finals = self.tree.final_hashes().len();
            self.block.final_tree_hashes = match self.block.final_consumed {
                _ if !self.block.keep_tree_hashes => FinalTreeHashes::None,
                0 if finals > 0 => FinalTreeHashes::None,
                n if n == finals => FinalTreeHashes::All,
                _ => FinalTreeHashes::Some,
            };
            if self.block.final_tree_hashes == FinalTreeHashes::Some {
                self.file.warning_tree_hashes = true;
                warn!(
                    block = self.block.block_no,
                    present = self.block.final_consumed,
                    expected = finals,
                    "only some closing tree hashes are present"
                );
            }
            let root = match &mut self.task {
                TaskState::Extract(x) => self.tree.close(&mut x.builder)?,
                _ => self.tree.close(&mut NoObserver)?,
            };
            self.last_leaf = self.tree.prev_leaf().cloned();
            root
        } else {
            self.last_leaf = None;
            None
        };
        self.block.closed = true;

        if let (SignatureBody::Unsigned { root_hash }, Some(c)) = (&sig.body, &computed_root) {
            if root_hash != c {
                self.file.nof_total_hash_fails += 1;
                return Err(Error::verification(format!(
                    "unsigned block root {root_hash} does not match the computed {c}"
                )));
            }
        }
        self.block.root_hash = match &sig.body {
            SignatureBody::Unsigned { root_hash } if computed_root.is_none() => {
                Some(root_hash.clone())
            }
            _ => computed_root.clone(),
        };
        debug!(
            block = self.block.block_no,
            records = sig.record_count,
            unsigned = sig.is_unsigned(),
            last_line = self.block.last_line_no(),
            recomputed = computed_root.is_some(),
            "block closed"
        );
        Ok(BlockClose {
            signature: sig,
            computed_root,
        })
    }

    /// Fold the block's counters into the file totals (once).
    pub(crate) fn finish_block(&mut self) -> Result<()> {
        if self.block.finished || !self.block.header_seen {
            return Ok(());
        }
        self.block.finished = true;
        let records = if self.block.signature_seen {
            self.block.record_count
        } else {
            self.block.records()
        };
        self.file.nof_total_records = check_record_total(self.file.nof_total_records, records)?;
        self.file.nof_total_meta_records += self.block.nof_meta_records;
        if let Some(t) = self.block.rec_time_min {
            self.file.rec_time_min = Some(self.file.rec_time_min.map_or(t, |m| m.min(t)));
        }
        if let Some(t) = self.block.rec_time_max {
            self.file.rec_time_max = Some(self.file.rec_time_max.map_or(t, |m| m.max(t)));
        }
        if self.block.not_signed {
            self.file.warning_unsigned = true;
        }
        Ok(())
    }

    /// End of the element stream: the last block must be closed.
    pub(crate) fn finish_file(&mut self) -> Result<()> {
        if self.block.header_seen && !self.block.signature_seen {
            return Err(Error::format(
                "file ends inside a block: block signature missing",
            ));
        }
        self.finish_block()
    }

    /// Read the next log line of the block and hash it.
    fn read_log_record(&mut self) -> Result<DataHash> {
        let alg = self.block.algorithm()?;
        let line_no = self.block.first_line_no.saturating_add(self.block.records());
        let Some(lines) = self.lines.as_mut() else {
            return Err(Error::argument("no log file to read records from"));
        };
        let parse_times = lines.parses_times();
        let line = lines.read_line()?.ok_or_else(|| {
            Error::verification(format!("log file ends before line {line_no}"))
        })?;
        let hash = alg.hash(line);
        let time = if parse_times { record_time(line) } else { None };
        if let TaskState::Extract(x) = &mut self.task {
            if x.builder.wants_next_record() {
                x.builder.stage_line(line);
            }
        }
        self.block.lines_read += 1;
        if let Some(t) = time {
            self.block.note_time(t);
        }
        Ok(hash)
    }

    fn add_leaf(&mut self, kind: LeafKind, hash: &DataHash) -> Result<()> {
        if self.block.keep_tree_hashes {
            let pending = self.tree.unverified_len();
            if pending > 0 {
                return Err(Error::format(format!(
                    "{pending} tree hashes missing before the next leaf"
                )));
            }
        } else {
            self.tree.clear_unverified();
        }
        match &mut self.task {
            TaskState::Extract(x) => self.tree.add_leaf(kind, hash, &mut x.builder)?,
            _ => self.tree.add_leaf(kind, hash, &mut NoObserver)?,
        };
        self.block.nof_record_hashes += 1;
        if kind == LeafKind::MetaRecord {
            self.block.nof_meta_records += 1;
        }
        self.block.ends_with_meta_record = kind == LeafKind::MetaRecord;
        Ok(())
    }
}
