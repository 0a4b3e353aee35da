//! Extract chosen log records together with the hash chains proving
//! them, as an excerpt log and a `RECSIG` file.

use crate::lines::LogLines;
use crate::process::{read_magic, unexpected};
use crate::state::{ExtractState, FileInfo, LogSigContext, TaskState};
use logsig_core::format::excerpt_signature_to_tlv;
use logsig_core::{tag, Error, IoContext, LogSigVersion, Result, Tlv, TlvReader, TlvWriter};
use logsig_crypto::SignatureService;
use logsig_merkle::{ExtractPositions, RecordChainBuilder};
use serde::Serialize;
use std::io::{Read, Write};
use tracing::{debug, info};

/// What an extraction produced.
#[derive(Clone, Debug, Serialize)]
pub struct ExtractSummary {
    /// Totals of the blocks read.
    pub file: FileInfo,
    /// Records written to the excerpt.
    pub extracted: u64,
    /// Excerpt blocks written (one signature each).
    pub excerpt_blocks: u64,
}

/// Extract the lines at `positions` from `log`, covered by the log
/// signature `input`.
///
/// Writes the excerpt signature file to `sig_out` and the extracted lines
/// to `log_out`. Reading stops after the block holding the last position.
pub fn extract<R: Read, WS: Write, WL: Write>(
    input: R,
    log: LogLines<'_>,
    positions: ExtractPositions,
    service: &dyn SignatureService,
    sig_out: WS,
    mut log_out: WL,
) -> Result<ExtractSummary> {
    let mut reader = TlvReader::new(input);
    let version = read_magic(&mut reader)?;
    if !version.is_log_signature() {
        return Err(Error::format(format!(
            "records can only be extracted from a log signature file, not {version}"
        )));
    }
    let out_version = if version.is_legacy() {
        LogSigVersion::RecSig11
    } else {
        LogSigVersion::RecSig12
    };
    let mut sig_writer = TlvWriter::new(sig_out);
    sig_writer.write_raw(out_version.magic())?;

    let state = ExtractState {
        builder: RecordChainBuilder::new(positions),
        extracted: 0,
    };
    let mut ctx = LogSigContext::new(TaskState::Extract(state), version, Some(log));
    let mut excerpt_blocks = 0;
    let mut done = false;
    while let Some(tlv) = reader.read_tlv()? {
        let out = ctx
            .extract_element(&tlv, service, &mut sig_writer, &mut log_out)
            .map_err(|e| e.in_block(ctx.block.block_no))?;
        if out.wrote_block {
            excerpt_blocks += 1;
        }
        if out.all_served {
            done = true;
            break;
        }
    }
    if !done {
        ctx.finish_file()
            .map_err(|e| e.in_block(ctx.block.block_no))?;
    }

    let TaskState::Extract(state) = &ctx.task else {
        return Err(Error::argument("extract driver without extract state"));
    };
    if let Some(p) = state.builder.positions().peek() {
        return Err(Error::argument(format!(
            "extract position {p} is beyond the last record {} covered by the signature",
            ctx.file.nof_total_records
        )));
    }
    let extracted = state.extracted;
    sig_writer.flush()?;
    log_out.flush().io_context(|| "flush excerpt log".into())?;
    info!(extracted, excerpt_blocks, "records extracted");
    Ok(ExtractSummary {
        file: ctx.file,
        extracted,
        excerpt_blocks,
    })
}

#[derive(Default)]
struct ElementOutcome {
    wrote_block: bool,
    all_served: bool,
}

impl LogSigContext<'_> {
    fn extract_element<WS: Write, WL: Write>(
        &mut self,
        tlv: &Tlv,
        service: &dyn SignatureService,
        sig_writer: &mut TlvWriter<WS>,
        log_out: &mut WL,
    ) -> Result<ElementOutcome> {
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
                let TaskState::Extract(state) = &mut self.task else {
                    return Err(Error::argument("extract driver without extract state"));
                };
                let records = state.builder.take_records();
                let mut out = ElementOutcome::default();
                if !records.is_empty() {
                    let sig = close.signature.signature().ok_or_else(|| {
                        Error::format("block is unsigned; sign it before extracting records")
                    })?;
                    let root = close.computed_root.as_ref().ok_or_else(|| {
                        Error::format("block root could not be recomputed")
                    })?;
                    let claimed = service.inspect(sig)?.document_hash;
                    if claimed != *root {
                        return Err(Error::verification(format!(
                            "signature covers {claimed}, the recomputed root is {root}"
                        )));
                    }
                    sig_writer.write_tlv(&excerpt_signature_to_tlv(sig)?)?;
                    for rec in &records {
                        sig_writer.write_tlv(&rec.chain.to_tlv()?)?;
                        log_out
                            .write_all(&rec.line)
                            .and_then(|()| log_out.write_all(b"\n"))
                            .io_context(|| format!("write excerpt line {}", rec.line_no))?;
                        state.extracted += 1;
                    }
                    out.wrote_block = true;
                    debug!(block = block_no, records = records.len(), "records extracted");
                }
                out.all_served = state.builder.positions().is_done();
                self.finish_block()?;
                return Ok(out);
            }
            _ => unexpected(tlv, self.file.version)?,
        }
        Ok(ElementOutcome::default())
    }
}
