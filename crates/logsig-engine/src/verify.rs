//! Verification of log signature files and of excerpts.
//!
//! A file verifies when every block links to its predecessor, every
//! recomputable root matches what the file declares and the signing
//! service accepts every block signature for that root. With
//! `continue_on_fail` a failing block is reported, skipped up to the next
//! block header, and the failure is surfaced once the whole file was read.

use crate::lines::LogLines;
use crate::process::{read_magic, unexpected, BlockClose};
use crate::state::{FileInfo, LogSigContext, TaskState, VerifyState};
use logsig_core::format::excerpt_signature_from_tlv;
use logsig_core::{
    tag, BlockSignature, DataHash, Error, ErrorKind, LogSigVersion, Result, SignatureBody, Tlv,
    TlvReader,
};
use logsig_crypto::SignatureService;
use logsig_merkle::RecordChain;
use serde::Serialize;
use std::io::Read;
use tracing::{debug, error, info, warn};

/// Predicate applied to the signer id of every verified signature.
pub type ClientIdCheck = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// Knobs of [`verify`].
#[derive(Default)]
pub struct VerifyOptions {
    /// Keep going after a block fails verification.
    pub continue_on_fail: bool,
    /// Expected input hash of the first block.
    pub input_hash: Option<DataHash>,
    /// Accept only signatures whose signer id passes this check.
    pub client_id: Option<ClientIdCheck>,
    /// Parse record times from the log and require them to precede the
    /// block's signing time.
    pub check_record_times: bool,
    /// Largest allowed distance, in seconds, between a block's oldest
    /// record and its signing time.
    pub time_diff: Option<i64>,
}

impl VerifyOptions {
    /// Whether log lines need their timestamps parsed.
    #[must_use]
    pub const fn wants_record_times(&self) -> bool {
        self.check_record_times || self.time_diff.is_some()
    }
}

/// State carried from one file to the next when verifying a sequence of
/// rotated log files.
#[derive(Clone, Debug, Default)]
pub struct VerifyRun {
    /// Last leaf of the previous file; the next file must start from it.
    pub last_leaf: Option<DataHash>,
    /// Signing time of the last signed block seen.
    pub last_signing_time: u64,
    /// Files verified so far.
    pub files: u64,
}

/// What a verification found.
#[derive(Clone, Debug, Serialize)]
pub struct VerifySummary {
    /// File totals and warnings.
    pub file: FileInfo,
    /// Blocks (or excerpt blocks) whose signature verified.
    pub verified_blocks: u64,
    /// Signing time of the first verified block.
    pub first_signing_time: Option<u64>,
    /// Signing time of the last verified block.
    pub last_signing_time: Option<u64>,
    /// Last leaf of the last block, when it was recomputed.
    pub last_leaf: Option<DataHash>,
}

/// Verify one log signature file (or excerpt file) read from `input`.
///
/// `log` is the log file it covers; without it, blocks that keep no record
/// hashes cannot be recomputed and their signatures are only checked
/// against the hash they claim. `run` links consecutive files.
pub fn verify<R: Read>(
    input: R,
    log: Option<LogLines<'_>>,
    service: &dyn SignatureService,
    opts: &VerifyOptions,
    run: &mut VerifyRun,
) -> Result<VerifySummary> {
    let mut reader = TlvReader::new(input);
    let version = read_magic(&mut reader)?;
    if version.is_excerpt() {
        return ExcerptVerifier::new(version, log, service, opts, run).run(reader);
    }
    if !version.is_log_signature() {
        return Err(Error::format(format!(
            "{version} is a part file of asynchronous signing; integrate it before verifying"
        )));
    }
    if version.is_legacy() {
        warn!(%version, "legacy log signature format");
    }

    let mut ctx = LogSigContext::new(TaskState::Verify(VerifyState::default()), version, log);
    ctx.last_leaf = opts.input_hash.clone().or_else(|| run.last_leaf.clone());
    ctx.sig_time_0 = run.last_signing_time;

    let mut quiet: Option<Error> = None;
    let mut skipping = false;
    while let Some(tlv) = reader.read_tlv()? {
        if skipping {
            if tlv.tag() != tag::BLOCK_HEADER {
                ctx.note_skipped(&tlv);
                continue;
            }
            ctx.end_skip()?;
            skipping = false;
        }
        match ctx.verify_element(&tlv, service, opts) {
            Ok(()) => {}
            Err(e) if opts.continue_on_fail && e.kind() == ErrorKind::VerificationFailure => {
                let e = e.in_block(ctx.block.block_no);
                error!("{e}; continuing with the next block");
                ctx.file.nof_total_failed_blocks += 1;
                quiet.get_or_insert(e);
                skipping = true;
            }
            Err(e) => return Err(e.in_block(ctx.block.block_no)),
        }
    }
    if skipping {
        ctx.end_skip()?;
    }
    ctx.finish_file()
        .map_err(|e| e.in_block(ctx.block.block_no))?;
    if quiet.is_none() {
        ctx.check_log_exhausted()?;
    }

    let summary = ctx.verify_summary();
    run.last_leaf.clone_from(&summary.last_leaf);
    run.last_signing_time = if ctx.block.sig_time > 0 || ctx.block.not_signed {
        ctx.block.sig_time
    } else {
        ctx.sig_time_0
    };
    run.files += 1;
    info!(
        blocks = summary.file.nof_blocks,
        records = summary.file.nof_total_records,
        failed = summary.file.nof_total_failed_blocks,
        "log signature processed"
    );

    if let Some(e) = quiet {
        return Err(Error::verification(format!(
            "{} block(s) failed verification but processing was continued; first failure: {e}",
            summary.file.nof_total_failed_blocks
        )));
    }
    if let TaskState::Verify(VerifyState {
        sig_time_violation: Some((block_no, earlier, later)),
        ..
    }) = &ctx.task
    {
        return Err(sig_time_error("block", *block_no, *earlier, *later));
    }
    Ok(summary)
}

fn sig_time_error(what: &str, block_no: u64, earlier: u64, later: u64) -> Error {
    let previous = if block_no > 1 {
        format!("{what} {}", block_no - 1)
    } else {
        format!("last {what} of the previous file")
    };
    Error::verification(format!(
        "{previous} has signing time {earlier} more recent than consecutive {what} {block_no} ({later})"
    ))
}

impl LogSigContext<'_> {
    fn verify_element(
        &mut self,
        tlv: &Tlv,
        service: &dyn SignatureService,
        opts: &VerifyOptions,
    ) -> Result<()> {
        match tlv.tag() {
            tag::BLOCK_HEADER => {
                self.process_block_header(tlv)?;
            }
            tag::RECORD_HASH => self.process_record_hash(tlv)?,
            tag::META_RECORD => {
                self.process_meta_record(tlv)?;
            }
            tag::TREE_HASH => self.process_tree_hash(tlv)?,
            tag::BLOCK_SIGNATURE => {
                let close = self.process_block_signature(tlv)?;
                let checked = self.verify_block_signature(close, service, opts);
                self.finish_block()?;
                checked?;
            }
            _ => unexpected(tlv, self.file.version)?,
        }
        Ok(())
    }

    fn verify_block_signature(
        &mut self,
        close: BlockClose,
        service: &dyn SignatureService,
        opts: &VerifyOptions,
    ) -> Result<()> {
        let block_no = self.block.block_no;
        let SignatureBody::Signed(sig) = close.signature.body else {
            return Err(Error::verification("block is unsigned"));
        };
        let hash = if let Some(root) = close.computed_root {
            root
        } else {
            warn!(
                block = block_no,
                "root cannot be recomputed; checking the signature against the hash it claims"
            );
            service.inspect(&sig)?.document_hash
        };
        let res = service.verify(&sig, &hash)?;
        if let Some(check) = &opts.client_id {
            if !check(&res.signer_id) {
                return Err(Error::verification(format!(
                    "signer {:?} does not match the expected client id",
                    res.signer_id
                )));
            }
        }
        self.block.sig_time = res.signing_time;
        if let TaskState::Verify(v) = &mut self.task {
            v.verified += 1;
            v.first_sig_time.get_or_insert(res.signing_time);
            v.last_sig_time = Some(res.signing_time);
            if self.sig_time_0 > res.signing_time && v.sig_time_violation.is_none() {
                warn!(
                    block = block_no,
                    previous = self.sig_time_0,
                    current = res.signing_time,
                    "block is signed earlier than the block before it"
                );
                v.sig_time_violation = Some((block_no, self.sig_time_0, res.signing_time));
            }
        }
        self.check_record_times(res.signing_time, opts)?;
        debug!(
            block = block_no,
            signing_time = res.signing_time,
            signer = %res.signer_id,
            "block signature verified"
        );
        Ok(())
    }

    fn check_record_times(&self, signing_time: u64, opts: &VerifyOptions) -> Result<()> {
        let signed_at = i64::try_from(signing_time).unwrap_or(i64::MAX);
        if let Some(latest) = self.block.rec_time_max {
            if latest > signed_at {
                return Err(Error::verification(format!(
                    "record time {latest} is more recent than the signing time {signed_at}"
                )));
            }
        }
        if let (Some(limit), Some(oldest)) = (opts.time_diff, self.block.rec_time_min) {
            let diff = signed_at.saturating_sub(oldest);
            if diff > limit {
                return Err(Error::verification(format!(
                    "block was signed {diff} s after its oldest record, more than the allowed {limit} s"
                )));
            }
        }
        Ok(())
    }

    /// While skipping a failed block, still pick up its record count.
    fn note_skipped(&mut self, tlv: &Tlv) {
        if tlv.tag() != tag::BLOCK_SIGNATURE || self.block.signature_seen {
            return;
        }
        if let Ok(sig) = BlockSignature::from_tlv(tlv) {
            self.block.record_count = sig.record_count;
            self.block.not_signed = sig.is_unsigned();
            self.block.signature_seen = true;
        }
    }

    /// Leave a skipped block: drop its remaining log lines and totals.
    fn end_skip(&mut self) -> Result<()> {
        if !self.block.closed {
            self.last_leaf = None;
        }
        if let Some(lines) = self.lines.as_mut() {
            let left = self.block.record_count.saturating_sub(self.block.lines_read);
            let skipped = lines.skip(left)?;
            self.block.lines_read += skipped;
        }
        self.finish_block()?;
        debug!(block = self.block.block_no, "skipped failed block");
        Ok(())
    }

    fn check_log_exhausted(&mut self) -> Result<()> {
        let covered = self.file.nof_total_records;
        if let Some(lines) = self.lines.as_mut() {
            if lines.read_line()?.is_some() {
                return Err(Error::verification(format!(
                    "log file has more lines than the {covered} records the signature covers"
                )));
            }
        }
        Ok(())
    }

    fn verify_summary(&self) -> VerifySummary {
        let (verified, first, last) = match &self.task {
            TaskState::Verify(v) => (v.verified, v.first_sig_time, v.last_sig_time),
            _ => (0, None, None),
        };
        VerifySummary {
            file: self.file.clone(),
            verified_blocks: verified,
            first_signing_time: first,
            last_signing_time: last,
            last_leaf: self.last_leaf.clone(),
        }
    }
}

/* ------------------------------- excerpts ------------------------------- */

struct ExcerptBlock {
    signature: Vec<u8>,
    root: Option<DataHash>,
    chains: u64,
}

/// Verifies RECSIG files: every record chain of a block must lead to the
/// same root and the block signature must cover it.
struct ExcerptVerifier<'s, 'l> {
    version: LogSigVersion,
    log: Option<LogLines<'l>>,
    service: &'s dyn SignatureService,
    opts: &'s VerifyOptions,
    carry: &'s mut VerifyRun,
    file: FileInfo,
    block: Option<ExcerptBlock>,
    verified: u64,
    first_sig_time: Option<u64>,
    sig_time_0: u64,
    violation: Option<(u64, u64, u64)>,
}

impl<'s, 'l> ExcerptVerifier<'s, 'l> {
    fn new(
        version: LogSigVersion,
        log: Option<LogLines<'l>>,
        service: &'s dyn SignatureService,
        opts: &'s VerifyOptions,
        run: &'s mut VerifyRun,
    ) -> Self {
        let sig_time_0 = run.last_signing_time;
        Self {
            version,
            log,
            service,
            opts,
            carry: run,
            file: FileInfo::new(version),
            block: None,
            verified: 0,
            first_sig_time: None,
            sig_time_0,
            violation: None,
        }
    }

    fn run<R: Read>(mut self, mut reader: TlvReader<R>) -> Result<VerifySummary> {
        if self.version.is_legacy() {
            warn!(version = %self.version, "legacy excerpt format");
        }
        while let Some(tlv) = reader.read_tlv()? {
            self.element(&tlv)
                .map_err(|e| e.in_block(self.file.nof_blocks))?;
        }
        self.finish_block()
            .map_err(|e| e.in_block(self.file.nof_blocks))?;
        let covered = self.file.nof_total_records;
        if let Some(lines) = self.log.as_mut() {
            if lines.read_line()?.is_some() {
                return Err(Error::verification(format!(
                    "excerpt log has more lines than the {covered} record chains"
                )));
            }
        }
        self.carry.last_signing_time = self.sig_time_0;
        self.carry.last_leaf = None;
        self.carry.files += 1;
        info!(
            blocks = self.file.nof_blocks,
            records = covered,
            "excerpt processed"
        );
        if let Some((block_no, earlier, later)) = self.violation {
            return Err(sig_time_error("excerpt block", block_no, earlier, later));
        }
        Ok(VerifySummary {
            file: self.file,
            verified_blocks: self.verified,
            first_signing_time: self.first_sig_time,
            last_signing_time: (self.verified > 0).then_some(self.sig_time_0),
            last_leaf: None,
        })
    }

    fn element(&mut self, tlv: &Tlv) -> Result<()> {
        match tlv.tag() {
            tag::EXCERPT_SIGNATURE => {
                self.finish_block()?;
                self.file.nof_blocks += 1;
                self.block = Some(ExcerptBlock {
                    signature: excerpt_signature_from_tlv(tlv)?,
                    root: None,
                    chains: 0,
                });
                Ok(())
            }
            tag::RECORD_CHAIN => self.chain(tlv),
            _ => unexpected(tlv, self.version),
        }
    }

    fn chain(&mut self, tlv: &Tlv) -> Result<()> {
        let chain = RecordChain::from_tlv(tlv)?;
        let Some(block) = self.block.as_mut() else {
            return Err(Error::format("record chain before the first excerpt signature"));
        };
        self.file.nof_total_records += 1;
        if let Some(lines) = self.log.as_mut() {
            let n = lines.line_no() + 1;
            let line = lines
                .read_line()?
                .ok_or_else(|| Error::verification(format!("excerpt log ends before line {n}")))?;
            let h = chain.record_hash().algorithm().hash(line);
            if &h != chain.record_hash() {
                self.file.nof_total_hash_fails += 1;
                return Err(Error::verification(format!(
                    "record hash mismatch at excerpt line {n}: log gives {h}, chain has {}",
                    chain.record_hash()
                )));
            }
        }
        let root = chain.root()?;
        block.chains += 1;
        match &block.root {
            Some(r) if *r == root => Ok(()),
            Some(r) => Err(Error::verification(format!(
                "record chain leads to {root}, earlier chains of the block to {r}"
            ))),
            None => {
                block.root = Some(root.clone());
                let signature = block.signature.clone();
                self.check_signature(&signature, &root)
            }
        }
    }

    fn check_signature(&mut self, signature: &[u8], root: &DataHash) -> Result<()> {
        let res = self.service.verify(signature, root)?;
        if let Some(check) = &self.opts.client_id {
            if !check(&res.signer_id) {
                return Err(Error::verification(format!(
                    "signer {:?} does not match the expected client id",
                    res.signer_id
                )));
            }
        }
        if self.sig_time_0 > res.signing_time && self.violation.is_none() {
            self.violation = Some((self.file.nof_blocks, self.sig_time_0, res.signing_time));
        }
        self.sig_time_0 = res.signing_time;
        self.first_sig_time.get_or_insert(res.signing_time);
        self.verified += 1;
        debug!(
            block = self.file.nof_blocks,
            signing_time = res.signing_time,
            "excerpt signature verified"
        );
        Ok(())
    }

    fn finish_block(&mut self) -> Result<()> {
        match self.block.take() {
            Some(b) if b.chains == 0 => Err(Error::format(
                "excerpt signature without any record chain",
            )),
            _ => Ok(()),
        }
    }
}
