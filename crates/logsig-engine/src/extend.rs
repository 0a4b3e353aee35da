//! Extend every block signature of a file to a later calendar anchor.

use crate::process::{read_magic, require_log_signature, unexpected};
use crate::state::{ExtendState, FileInfo, LogSigContext, TaskState};
use logsig_core::{tag, BlockSignature, Error, Result, SignatureBody, Tlv, TlvReader, TlvWriter};
use logsig_crypto::SignatureService;
use serde::Serialize;
use std::io::{Read, Write};
use tracing::{debug, info, warn};

/// What an extension run did.
#[derive(Clone, Debug, Serialize)]
pub struct ExtendSummary {
    /// File totals and warnings.
    pub file: FileInfo,
    /// Signatures replaced by extended ones.
    pub extended: u64,
    /// Unsigned blocks copied unchanged.
    pub left_unsigned: u64,
}

/// Copy `input` to `output`, extending each block signature on the way.
///
/// Block structure and recomputable roots are checked as the file is
/// copied; any failure aborts before the output could be committed.
pub fn extend<R: Read, W: Write>(
    input: R,
    output: W,
    service: &dyn SignatureService,
) -> Result<ExtendSummary> {
    let mut reader = TlvReader::new(input);
    let version = read_magic(&mut reader)?;
    require_log_signature(version, "extend")?;
    let mut writer = TlvWriter::new(output);
    writer.write_raw(version.magic())?;

    let mut ctx = LogSigContext::new(TaskState::Extend(ExtendState::default()), version, None);
    while let Some(tlv) = reader.read_tlv()? {
        ctx.extend_element(&tlv, service, &mut writer)
            .map_err(|e| e.in_block(ctx.block.block_no))?;
    }
    ctx.finish_file()
        .map_err(|e| e.in_block(ctx.block.block_no))?;
    writer.flush()?;

    let (extended, left_unsigned) = match &ctx.task {
        TaskState::Extend(s) => (s.extended, s.left_unsigned),
        _ => (0, 0),
    };
    info!(
        blocks = ctx.file.nof_blocks,
        extended, left_unsigned, "log signature extended"
    );
    Ok(ExtendSummary {
        file: ctx.file,
        extended,
        left_unsigned,
    })
}

impl LogSigContext<'_> {
    fn extend_element<W: Write>(
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
                let TaskState::Extend(state) = &mut self.task else {
                    return Err(Error::argument("extend driver without extend state"));
                };
                match &close.signature.body {
                    SignatureBody::Signed(sig) => {
                        if let Some(root) = &close.computed_root {
                            let claimed = service.inspect(sig)?.document_hash;
                            if claimed != *root {
                                return Err(Error::verification(format!(
                                    "signature covers {claimed}, the recomputed root is {root}"
                                )));
                            }
                        }
                        let extended = BlockSignature {
                            record_count: close.signature.record_count,
                            body: SignatureBody::Signed(service.extend(sig)?),
                        };
                        writer.write_tlv(&extended.to_tlv()?)?;
                        state.extended += 1;
                        debug!(block = block_no, "signature extended");
                    }
                    SignatureBody::Unsigned { .. } => {
                        warn!(block = block_no, "block is unsigned; copied without extending");
                        state.left_unsigned += 1;
                        writer.write_tlv(tlv)?;
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
