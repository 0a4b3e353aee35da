//! Sign the unsigned blocks of a log signature file.
//!
//! Blocks the service refuses to sign are copied unchanged and counted;
//! the run goes on and [`SignSummary::into_result`] turns the count into a
//! [`Error::SigningFailure`] once the output has been dealt with.

use crate::process::{read_magic, require_log_signature, unexpected};
use crate::state::{FileInfo, LogSigContext, SignState, TaskState};
use logsig_core::{
    aggregation_level, tag, BlockSignature, Error, ErrorKind, Result, SignatureBody, Tlv,
    TlvReader, TlvWriter,
};
use logsig_crypto::SignatureService;
use serde::Serialize;
use std::io::{Read, Write};
use tracing::{debug, info, warn};

/// Blocks in a file, from a quick pass that only parses block signatures.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BlockCount {
    /// Blocks in the file.
    pub blocks: u64,
    /// Blocks without a signature.
    pub unsigned: u64,
}

/// Count blocks and unsigned blocks.
pub fn count_blocks<R: Read>(input: R) -> Result<BlockCount> {
    let mut reader = TlvReader::new(input);
    let version = read_magic(&mut reader)?;
    require_log_signature(version, "sign")?;
    let mut count = BlockCount::default();
    let mut buf = Vec::new();
    while let Some(t) = reader.read_tlv_into(&mut buf)? {
        match t {
            tag::BLOCK_HEADER => count.blocks += 1,
            tag::BLOCK_SIGNATURE
                if BlockSignature::from_tlv(&Tlv::parse(&buf)?)?.is_unsigned() =>
            {
                count.unsigned += 1;
            }
            _ => {}
        }
    }
    Ok(count)
}

/// What a signing run did.
#[derive(Clone, Debug, Serialize)]
pub struct SignSummary {
    /// File totals and warnings.
    pub file: FileInfo,
    /// Blocks that were signed on input.
    pub already_signed: u64,
    /// Blocks signed by this run.
    pub newly_signed: u64,
    /// Blocks the service refused to sign, left unsigned.
    pub failed: u64,
}

impl SignSummary {
    /// Whether the output differs from the input.
    #[must_use]
    pub const fn modified(&self) -> bool {
        self.newly_signed > 0
    }

    /// `Err(SigningFailure)` when some block could not be signed.
    pub fn into_result(self) -> Result<Self> {
        if self.failed > 0 {
            return Err(Error::SigningFailure(format!(
                "{} of {} unsigned blocks could not be signed and were left unsigned",
                self.failed,
                self.failed + self.newly_signed
            )));
        }
        Ok(self)
    }
}

/// Copy `input` to `output`, signing every unsigned block.
///
/// `expected` is the result of [`count_blocks`] when the input could be
/// read twice; it only feeds progress messages.
pub fn sign<R: Read, W: Write>(
    input: R,
    output: W,
    service: &dyn SignatureService,
    expected: Option<BlockCount>,
) -> Result<SignSummary> {
    let mut reader = TlvReader::new(input);
    let version = read_magic(&mut reader)?;
    require_log_signature(version, "sign")?;
    let mut writer = TlvWriter::new(output);
    writer.write_raw(version.magic())?;

    let state = SignState {
        expected_blocks: expected.map(|c| c.unsigned),
        ..SignState::default()
    };
    let mut ctx = LogSigContext::new(TaskState::Sign(state), version, None);
    while let Some(tlv) = reader.read_tlv()? {
        ctx.sign_element(&tlv, service, &mut writer)
            .map_err(|e| e.in_block(ctx.block.block_no))?;
    }
    ctx.finish_file()
        .map_err(|e| e.in_block(ctx.block.block_no))?;
    writer.flush()?;

    let (already_signed, newly_signed, failed) = match &ctx.task {
        TaskState::Sign(s) => (s.already_signed, s.newly_signed, s.failed),
        _ => (0, 0, 0),
    };
    info!(
        blocks = ctx.file.nof_blocks,
        already_signed, newly_signed, failed, "log signature signed"
    );
    Ok(SignSummary {
        file: ctx.file,
        already_signed,
        newly_signed,
        failed,
    })
}

impl LogSigContext<'_> {
    fn sign_element<W: Write>(
        &mut self,
        tlv: &Tlv,
        service: &dyn SignatureService,
        writer: &mut TlvWriter<W>,
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
                let block_no = self.block.block_no;
                let version = self.file.version;
                let TaskState::Sign(state) = &mut self.task else {
                    return Err(Error::argument("sign driver without sign state"));
                };
                let record_count = close.signature.record_count;
                match close.signature.body {
                    SignatureBody::Signed(_) => {
                        state.already_signed += 1;
                        writer.write_tlv(tlv)?;
                    }
                    SignatureBody::Unsigned { root_hash } => {
                        let root = close.computed_root.unwrap_or(root_hash);
                        let level = aggregation_level(version, record_count);
                        match service.sign(&root, level) {
                            Ok(sig) => {
                                let signed = BlockSignature {
                                    record_count,
                                    body: SignatureBody::Signed(sig),
                                };
                                writer.write_tlv(&signed.to_tlv()?)?;
                                state.newly_signed += 1;
                                let done = state.newly_signed + state.failed;
                                match state.expected_blocks {
                                    Some(total) => {
                                        debug!(block = block_no, level, "signed {done}/{total}");
                                    }
                                    None => debug!(block = block_no, level, "block signed"),
                                }
                                self.block.not_signed = false;
                            }
                            Err(e) if e.kind() == ErrorKind::SigningFailure => {
                                warn!(block = block_no, "{e}; block left unsigned");
                                state.failed += 1;
                                writer.write_tlv(tlv)?;
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
                self.finish_block()?;
                return Ok(());
            }
            _ => unexpected(tlv, self.file.version)?,
        }
        writer.write_tlv(tlv)
    }
}
