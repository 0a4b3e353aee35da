//! Merge the two part files of asynchronous signing into one log signature.
//!
//! The blocks file (`LOG12BLK`) carries the block structure closed by
//! partial signatures holding the roots; the signatures file (`LOG12SIG`)
//! carries one 0x904 per block, signed or still unsigned, written by the
//! signer as it gets through them.

use crate::process::{read_magic, unexpected};
use crate::state::{FileInfo, IntegrateState, LogSigContext, TaskState};
use logsig_core::{
    tag, BlockSignature, Error, LogSigVersion, Result, SignatureBody, Tlv, TlvReader, TlvWriter,
};
use logsig_crypto::SignatureService;
use serde::Serialize;
use std::io::{Read, Write};
use tracing::{debug, info, warn};

/// What an integration did.
#[derive(Clone, Debug, Serialize)]
pub struct IntegrateSummary {
    /// Totals of the produced file.
    pub file: FileInfo,
    /// Blocks closed by a real signature.
    pub signed: u64,
    /// Blocks whose partial signature was still unsigned.
    pub unsigned: u64,
}

/// Write the `LOGSIG12` merge of `blocks` and `signatures` to `output`.
pub fn integrate<B: Read, S: Read, W: Write>(
    blocks: B,
    signatures: S,
    output: W,
    service: &dyn SignatureService,
) -> Result<IntegrateSummary> {
    let mut blocks = TlvReader::new(blocks);
    let mut signatures = TlvReader::new(signatures);
    expect_version(read_magic(&mut blocks)?, LogSigVersion::Log12Blk, "blocks")?;
    expect_version(
        read_magic(&mut signatures)?,
        LogSigVersion::Log12Sig,
        "signatures",
    )?;
    let mut writer = TlvWriter::new(output);
    writer.write_raw(LogSigVersion::LogSig12.magic())?;

    let mut ctx = LogSigContext::new(
        TaskState::Integrate(IntegrateState::default()),
        LogSigVersion::LogSig12,
        None,
    );
    while let Some(tlv) = blocks.read_tlv()? {
        ctx.integrate_element(&tlv, &mut signatures, service, &mut writer)
            .map_err(|e| e.in_block(ctx.block.block_no))?;
    }
    ctx.finish_file()
        .map_err(|e| e.in_block(ctx.block.block_no))?;
    if next_signature(&mut signatures)?.is_some() {
        return Err(Error::format(format!(
            "signatures file holds more signatures than the {} blocks of the blocks file",
            ctx.file.nof_blocks
        )));
    }
    writer.flush()?;

    let (signed, unsigned) = match &ctx.task {
        TaskState::Integrate(s) => (s.signed, s.unsigned),
        _ => (0, 0),
    };
    info!(
        blocks = ctx.file.nof_blocks,
        signed, unsigned, "part files integrated"
    );
    Ok(IntegrateSummary {
        file: ctx.file,
        signed,
        unsigned,
    })
}

fn expect_version(found: LogSigVersion, want: LogSigVersion, what: &str) -> Result<()> {
    if found == want {
        return Ok(());
    }
    Err(Error::format(format!(
        "{what} file has magic {found}, expected {want}"
    )))
}

/// Next 0x904 of the signatures file; non-critical extras are skipped.
fn next_signature<S: Read>(signatures: &mut TlvReader<S>) -> Result<Option<Tlv>> {
    while let Some(tlv) = signatures.read_tlv()? {
        if tlv.tag() == tag::BLOCK_SIGNATURE {
            return Ok(Some(tlv));
        }
        unexpected(&tlv, LogSigVersion::Log12Sig)?;
    }
    Ok(None)
}

impl LogSigContext<'_> {
    fn integrate_element<S: Read, W: Write>(
        &mut self,
        tlv: &Tlv,
        signatures: &mut TlvReader<S>,
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
                let root = self.block.root_hash.clone();
                let sig_tlv = next_signature(signatures)?.ok_or_else(|| {
                    Error::format("signatures file ends before this block's signature")
                })?;
                let partial = BlockSignature::from_tlv(&sig_tlv)?;
                if partial.record_count != close.signature.record_count {
                    return Err(Error::verification(format!(
                        "record count {} of the signature does not match the block's {}",
                        partial.record_count, close.signature.record_count
                    )));
                }
                let TaskState::Integrate(state) = &mut self.task else {
                    return Err(Error::argument("integrate driver without integrate state"));
                };
                let covered = match &partial.body {
                    SignatureBody::Signed(sig) => {
                        state.signed += 1;
                        service.inspect(sig)?.document_hash
                    }
                    SignatureBody::Unsigned { root_hash } => {
                        warn!(block = block_no, "signature not yet available; block stays unsigned");
                        state.unsigned += 1;
                        root_hash.clone()
                    }
                };
                if let Some(root) = root {
                    if covered != root {
                        return Err(Error::verification(format!(
                            "signature covers {covered}, the block root is {root}"
                        )));
                    }
                }
                self.block.not_signed = partial.is_unsigned();
                writer.write_tlv(&sig_tlv)?;
                self.finish_block()?;
                debug!(block = block_no, "block integrated");
                return Ok(());
            }
            _ => unexpected(tlv, LogSigVersion::Log12Blk)?,
        }
        writer.write_tlv(tlv)
    }
}
