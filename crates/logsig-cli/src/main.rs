// crates/logsig-cli/src/main.rs

#![forbid(unsafe_code)]
#![deny(
    rust_2018_idioms,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo
)]

mod config;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use logsig_core::{DataHash, ErrorKind};
use logsig_engine::files::{
    excerpt_log_path, excerpt_signature_path, extend_file, extract_files, integrate_log,
    sign_file, signature_path, verify_file, ExtractFiles, IntegrateOutcome,
};
use logsig_engine::{FileInfo, VerifyOptions, VerifyRun};
use logsig_merkle::ExtractPositions;
use regex::Regex;
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(
    name = "logsig",
    about = "KSI log signature tool",
    long_about = "KSI log signature tool.\n\nVerify log files against their log signatures, sign blocks left unsigned, extend signatures, integrate asynchronously signed part files and extract records with their hash chains.",
    version = env!("CARGO_PKG_VERSION"),
    disable_help_subcommand = true
)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Signing key (64 hex digits) for the local signature service
    #[arg(long, global = true, env = "LOGSIG_KEY", hide_env_values = true)]
    key: Option<String>,

    /// Print run summaries as JSON
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Verify log files (in order) against their log signatures.
    /// An excerpt log is verified against its excerpt signature the same way.
    Verify {
        /// Log files; each is checked against `<log>.logsig`
        logs: Vec<PathBuf>,

        /// Log signature file; allowed with at most one log. Without a log,
        /// only the file's internal consistency and signatures are checked.
        #[arg(short, long)]
        signature: Option<PathBuf>,

        /// Expected input hash of the first block (`<alg-id>:<hex>` or `<alg>:<hex>`)
        #[arg(long)]
        input_hash: Option<String>,

        /// Keep verifying after a failed block; the run still fails at the end
        #[arg(long, default_value_t = false)]
        continue_on_fail: bool,

        /// Regular expression the signer id must match
        #[arg(long)]
        client_id: Option<String>,

        /// Max seconds between a block's oldest record and its signing time
        #[arg(long)]
        time_diff: Option<i64>,

        /// Parse leading RFC 3339 timestamps and check them against signing times
        #[arg(long, default_value_t = false)]
        check_times: bool,
    },

    /// Extend every signature of a log signature file
    Extend {
        /// Log signature file (`-` for stdin)
        input: PathBuf,

        /// Output file (`-` for stdout); default replaces the input
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Sign the unsigned blocks of a log signature file
    Sign {
        /// Log signature file (`-` for stdin)
        input: PathBuf,

        /// Output file (`-` for stdout); default replaces the input
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Merge `<log>.logsig.parts` into `<log>.logsig`
    Integrate {
        /// Log file whose part files are merged
        log: PathBuf,

        /// Output file instead of `<log>.logsig`
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Extract records with the hash chains proving them
    Extract {
        /// Log file
        log: PathBuf,

        /// Record positions, e.g. `2,4-7,10` (1-based, increasing)
        #[arg(short, long)]
        records: ExtractPositions,

        /// Log signature file instead of `<log>.logsig`
        #[arg(short, long)]
        signature: Option<PathBuf>,

        /// Excerpt log instead of `<log>.excerpt` (`-` for stdout)
        #[arg(long)]
        out_log: Option<PathBuf>,

        /// Excerpt signature instead of `<log>.excerpt.logsig` (`-` for stdout)
        #[arg(long)]
        out_signature: Option<PathBuf>,

        /// Replace existing outputs
        #[arg(short, long, default_value_t = false)]
        force: bool,
    },
}

fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

/// Initialize tracing with an env-driven filter (default INFO).
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .compact();

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}

/// Exit status from the first typed error in the chain.
fn exit_code(e: &anyhow::Error) -> u8 {
    let kind = e
        .chain()
        .find_map(|c| c.downcast_ref::<logsig_core::Error>())
        .map(logsig_core::Error::kind);
    match kind {
        None => 1,
        Some(ErrorKind::InvalidArgument) => 2,
        Some(ErrorKind::InvalidInputFormat) => 3,
        Some(ErrorKind::VerificationFailure) => 4,
        Some(ErrorKind::SigningFailure) => 5,
        Some(ErrorKind::Io) => 6,
        Some(ErrorKind::VerificationSkipped) => 7,
        Some(ErrorKind::IndexOverflow) => 8,
    }
}

fn run(cli: Cli) -> Result<()> {
    let cfg = Config::load(cli.config.as_deref())?;
    let service = cfg.service(cli.key.as_deref())?;
    let json = cli.json;

    match cli.cmd {
        Cmd::Verify {
            logs,
            signature,
            input_hash,
            continue_on_fail,
            client_id,
            time_diff,
            check_times,
        } => {
            let opts = VerifyOptions {
                continue_on_fail: continue_on_fail || cfg.verify.continue_on_fail,
                input_hash: input_hash
                    .as_deref()
                    .map(DataHash::from_hex)
                    .transpose()
                    .context("parsing --input-hash")?,
                client_id: client_id
                    .or_else(|| cfg.verify.client_id.clone())
                    .map(|re| client_id_check(&re))
                    .transpose()?,
                check_record_times: check_times || cfg.verify.check_record_times,
                time_diff: time_diff.or(cfg.verify.time_diff),
            };
            let pairs = verify_pairs(logs, signature)?;
            let mut run = VerifyRun::default();
            for (sig, log) in &pairs {
                let summary = verify_file(sig, log.as_deref(), &service, &opts, &mut run)
                    .with_context(|| format!("verifying {}", sig.display()))?;
                report(json, &summary, || {
                    format!(
                        "OK: {} ({} blocks, {} records{})",
                        sig.display(),
                        summary.file.nof_blocks,
                        summary.file.nof_total_records,
                        warnings(&summary.file)
                    )
                })?;
            }
            Ok(())
        }

        Cmd::Extend { input, output } => {
            let summary = extend_file(&input, output.as_deref(), &service)
                .with_context(|| format!("extending {}", input.display()))?;
            report(json, &summary, || {
                format!(
                    "Extended {} signature(s) in {}{}",
                    summary.extended,
                    output.as_ref().unwrap_or(&input).display(),
                    warnings(&summary.file)
                )
            })
        }

        Cmd::Sign { input, output } => {
            let summary = sign_file(&input, output.as_deref(), &service)
                .with_context(|| format!("signing {}", input.display()))?;
            report(json, &summary, || {
                format!(
                    "Signed {} block(s), {} already signed, in {}",
                    summary.newly_signed,
                    summary.already_signed,
                    output.as_ref().unwrap_or(&input).display()
                )
            })
        }

        Cmd::Integrate { log, output } => {
            let outcome = integrate_log(&log, output.as_deref(), &service)
                .with_context(|| format!("integrating the part files of {}", log.display()))?;
            report(json, &outcome, || match &outcome {
                IntegrateOutcome::Integrated(s) => format!(
                    "Integrated {} block(s) ({} unsigned) into {}",
                    s.file.nof_blocks,
                    s.unsigned,
                    output
                        .clone()
                        .unwrap_or_else(|| signature_path(&log))
                        .display()
                ),
                IntegrateOutcome::AlreadyIntegrated(p) => {
                    format!("Nothing to integrate; {} already exists", p.display())
                }
            })
        }

        Cmd::Extract {
            log,
            records,
            signature,
            out_log,
            out_signature,
            force,
        } => {
            info!(log = %log.display(), positions = %records, "extracting");
            let files = ExtractFiles {
                log: log.clone(),
                signature,
                out_log: out_log.clone(),
                out_signature: out_signature.clone(),
                overwrite: force,
            };
            let summary = extract_files(&files, records, &service)
                .with_context(|| format!("extracting records of {}", log.display()))?;
            report(json, &summary, || {
                format!(
                    "Extracted {} record(s) → {} and {}",
                    summary.extracted,
                    out_log.unwrap_or_else(|| excerpt_log_path(&log)).display(),
                    out_signature
                        .unwrap_or_else(|| excerpt_signature_path(&log))
                        .display()
                )
            })
        }
    }
}

/// (signature, log) pairs in verification order.
fn verify_pairs(
    logs: Vec<PathBuf>,
    signature: Option<PathBuf>,
) -> Result<Vec<(PathBuf, Option<PathBuf>)>> {
    match signature {
        Some(sig) if logs.len() > 1 => bail!(logsig_core::Error::argument(format!(
            "--signature {} names one file but {} logs were given",
            sig.display(),
            logs.len()
        ))),
        Some(sig) => Ok(vec![(sig, logs.into_iter().next())]),
        None if logs.is_empty() => bail!(logsig_core::Error::argument(
            "nothing to verify: give log files or --signature"
        )),
        None => Ok(logs
            .into_iter()
            .map(|l| (signature_path(&l), Some(l)))
            .collect()),
    }
}

fn client_id_check(pattern: &str) -> Result<logsig_engine::ClientIdCheck> {
    let re = Regex::new(pattern).map_err(|e| {
        logsig_core::Error::argument(format!("invalid --client-id pattern {pattern:?}: {e}"))
    })?;
    Ok(Box::new(move |id: &str| re.is_match(id)))
}

fn warnings(file: &FileInfo) -> String {
    let mut w = Vec::new();
    if file.warning_legacy {
        w.push("legacy format");
    }
    if file.warning_tree_hashes {
        w.push("incomplete closing tree hashes");
    }
    if file.warning_unsigned {
        w.push("unsigned blocks");
    }
    if w.is_empty() {
        String::new()
    } else {
        format!("; warnings: {}", w.join(", "))
    }
}

fn report<T: Serialize>(json: bool, value: &T, text: impl FnOnce() -> String) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string(value).context("serialize summary to JSON")?
        );
    } else {
        println!("{}", text());
    }
    Ok(())
}
