//! Path-level wrappers around the stream drivers: default file names,
//! atomic outputs and the locks guarding asynchronous part files.

use crate::extend::{extend, ExtendSummary};
use crate::extract::{extract, ExtractSummary};
use crate::integrate::{integrate, IntegrateSummary};
use crate::lines::LogLines;
use crate::sign::{count_blocks, sign, SignSummary};
use crate::verify::{verify, VerifyOptions, VerifyRun, VerifySummary};
use logsig_core::io::{display, is_std_stream, lock_shared, AtomicOutput, Input};
use logsig_core::{Error, Result};
use logsig_crypto::SignatureService;
use logsig_merkle::ExtractPositions;
use serde::Serialize;
use std::ffi::OsString;
use std::fs;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use tracing::info;

fn with_suffix(p: &Path, suffix: &str) -> PathBuf {
    let mut s = OsString::from(p.as_os_str());
    s.push(suffix);
    PathBuf::from(s)
}

/// `<log>.logsig`
#[must_use]
pub fn signature_path(log: &Path) -> PathBuf {
    with_suffix(log, ".logsig")
}

/// `<log>.logsig.parts`
#[must_use]
pub fn parts_dir(log: &Path) -> PathBuf {
    with_suffix(log, ".logsig.parts")
}

/// `<log>.logsig.parts/blocks.dat`
#[must_use]
pub fn blocks_part(log: &Path) -> PathBuf {
    parts_dir(log).join("blocks.dat")
}

/// `<log>.logsig.parts/block-signatures.dat`
#[must_use]
pub fn signatures_part(log: &Path) -> PathBuf {
    parts_dir(log).join("block-signatures.dat")
}

/// `<log>.excerpt`
#[must_use]
pub fn excerpt_log_path(log: &Path) -> PathBuf {
    with_suffix(log, ".excerpt")
}

/// `<log>.excerpt.logsig`
#[must_use]
pub fn excerpt_signature_path(log: &Path) -> PathBuf {
    with_suffix(log, ".excerpt.logsig")
}

fn open_lines(path: &Path, record_times: bool) -> Result<LogLines<'static>> {
    let input = Input::open(path)?;
    Ok(LogLines::new(input.into_reader()).with_record_times(record_times))
}

fn is_regular_file(p: &Path) -> bool {
    !is_std_stream(p) && fs::metadata(p).is_ok_and(|m| m.is_file())
}

/// Verify `signature` (and `log`, when given), continuing `run`.
pub fn verify_file(
    signature: &Path,
    log: Option<&Path>,
    service: &dyn SignatureService,
    opts: &VerifyOptions,
    run: &mut VerifyRun,
) -> Result<VerifySummary> {
    let input = Input::open(signature)?;
    let lines = log
        .map(|p| open_lines(p, opts.wants_record_times()))
        .transpose()?;
    info!(signature = %signature.display(), log = ?log, "verifying");
    verify(input, lines, service, opts, run)
}

/// Sign `input`, writing to `output` or back into `input`.
///
/// In place, the file is only replaced when something was signed; an
/// explicit output is always written. Blocks that failed to sign surface
/// as an error after the output was committed.
pub fn sign_file(
    input: &Path,
    output: Option<&Path>,
    service: &dyn SignatureService,
) -> Result<SignSummary> {
    let dest = match output {
        Some(p) => p,
        None if is_std_stream(input) => {
            return Err(Error::argument("signing stdin needs an explicit output"))
        }
        None => input,
    };
    let expected = if is_regular_file(input) {
        Some(count_blocks(Input::open(input)?)?)
    } else {
        None
    };
    if let Some(c) = expected {
        info!(input = %input.display(), blocks = c.blocks, unsigned = c.unsigned, "signing");
    }
    let mut out = AtomicOutput::create(dest, true)?;
    let summary = sign(Input::open(input)?, &mut out, service, expected)?;
    if summary.modified() || output.is_some() {
        out.commit()?;
        info!(output = %dest.display(), signed = summary.newly_signed, "signatures written");
    } else {
        out.discard();
        info!(input = %input.display(), "nothing signed; file left untouched");
    }
    summary.into_result()
}

/// Extend `input`, writing to `output` or back into `input`.
pub fn extend_file(
    input: &Path,
    output: Option<&Path>,
    service: &dyn SignatureService,
) -> Result<ExtendSummary> {
    let dest = match output {
        Some(p) => p,
        None if is_std_stream(input) => {
            return Err(Error::argument("extending stdin needs an explicit output"))
        }
        None => input,
    };
    let mut out = AtomicOutput::create(dest, true)?;
    let summary = extend(Input::open(input)?, &mut out, service)?;
    if summary.extended > 0 || output.is_some() {
        out.commit()?;
        info!(output = %dest.display(), extended = summary.extended, "extended signatures written");
    } else {
        out.discard();
    }
    Ok(summary)
}

/// Result of [`integrate_log`].
#[derive(Clone, Debug, Serialize)]
pub enum IntegrateOutcome {
    /// Part files merged into a new log signature file.
    Integrated(IntegrateSummary),
    /// No part files, but the log signature file is already there.
    AlreadyIntegrated(PathBuf),
}

/// Merge the part files of `log` into `output` (default `<log>.logsig`).
///
/// Part files still locked by the signer yield `VerificationSkipped`. An
/// existing output is never overwritten.
pub fn integrate_log(
    log: &Path,
    output: Option<&Path>,
    service: &dyn SignatureService,
) -> Result<IntegrateOutcome> {
    let blocks = blocks_part(log);
    let signatures = signatures_part(log);
    let dest = output.map_or_else(|| signature_path(log), Path::to_path_buf);
    if !blocks.exists() || !signatures.exists() {
        if dest.exists() {
            info!(output = %dest.display(), "already integrated");
            return Ok(IntegrateOutcome::AlreadyIntegrated(dest));
        }
        return Err(Error::io(
            format!(
                "part files {} and {} not found",
                display(&blocks),
                display(&signatures)
            ),
            io::Error::from(io::ErrorKind::NotFound),
        ));
    }
    let blocks_file = lock_shared(&blocks)?;
    let signatures_file = lock_shared(&signatures)?;
    let mut out = AtomicOutput::create(&dest, false)?;
    let summary = integrate(
        BufReader::new(&blocks_file),
        BufReader::new(&signatures_file),
        &mut out,
        service,
    )?;
    out.commit()?;
    info!(output = %dest.display(), blocks = summary.file.nof_blocks, "integrated");
    Ok(IntegrateOutcome::Integrated(summary))
}

/// Paths of an extraction; unset outputs derive from the log name.
#[derive(Clone, Debug, Default)]
pub struct ExtractFiles {
    /// Log file.
    pub log: PathBuf,
    /// Its log signature (default `<log>.logsig`).
    pub signature: Option<PathBuf>,
    /// Excerpt log (default `<log>.excerpt`).
    pub out_log: Option<PathBuf>,
    /// Excerpt signature (default `<log>.excerpt.logsig`).
    pub out_signature: Option<PathBuf>,
    /// Replace existing outputs.
    pub overwrite: bool,
}

/// Extract `positions` from the files in `files`; outputs appear only
/// when the whole extraction succeeded.
pub fn extract_files(
    files: &ExtractFiles,
    positions: ExtractPositions,
    service: &dyn SignatureService,
) -> Result<ExtractSummary> {
    let signature = files
        .signature
        .clone()
        .unwrap_or_else(|| signature_path(&files.log));
    let out_log = files
        .out_log
        .clone()
        .unwrap_or_else(|| excerpt_log_path(&files.log));
    let out_sig = files
        .out_signature
        .clone()
        .unwrap_or_else(|| excerpt_signature_path(&files.log));
    if is_std_stream(&out_log) && is_std_stream(&out_sig) {
        return Err(Error::argument(
            "excerpt log and excerpt signature cannot both go to stdout",
        ));
    }
    let mut log_w = AtomicOutput::create(&out_log, files.overwrite)?;
    let mut sig_w = AtomicOutput::create(&out_sig, files.overwrite)?;
    let summary = extract(
        Input::open(&signature)?,
        open_lines(&files.log, false)?,
        positions,
        service,
        &mut sig_w,
        &mut log_w,
    )?;
    sig_w.commit()?;
    log_w.commit()?;
    info!(
        excerpt = %out_log.display(),
        signature = %out_sig.display(),
        records = summary.extracted,
        "excerpt written"
    );
    Ok(summary)
}
