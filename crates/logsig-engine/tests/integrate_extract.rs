//! Merging asynchronous part files and extracting records with their
//! hash chains.

#![allow(clippy::unwrap_used)]

mod common;

use common::{build, build_parts, lines, service, tags, Item, Layout};
use logsig_core::{tag, ErrorKind, LogSigVersion, Result, TlvReader};
use logsig_engine::files::{blocks_part, parts_dir, signature_path, signatures_part};
use logsig_engine::{
    extract, extract_files, integrate, integrate_log, verify, ExtractFiles, ExtractSummary,
    IntegrateOutcome, LogLines, VerifyOptions, VerifyRun, VerifySummary,
};
use logsig_merkle::ExtractPositions;
use std::fs;
use std::io::Cursor;

fn check(sig: &[u8], log: Option<&[u8]>) -> Result<VerifySummary> {
    verify(
        Cursor::new(sig),
        log.map(|l| LogLines::new(Cursor::new(l))),
        &service(),
        &VerifyOptions::default(),
        &mut VerifyRun::default(),
    )
}

fn hashes_only() -> Layout {
    Layout {
        record_hashes: true,
        tree_hashes: false,
        final_hashes: false,
        signed: true,
    }
}

fn raw_tlvs(file: &[u8]) -> Vec<Vec<u8>> {
    TlvReader::new(&file[8..])
        .map(|t| t.unwrap().raw().to_vec())
        .collect()
}

#[test]
fn integrated_file_replaces_the_unsigned_markers() {
    let blocks = vec![lines(&["a", "b"]), lines(&["c"])];
    let (log, blk, sigs) = build_parts(&blocks, hashes_only(), &[], &service());

    let mut out = Vec::new();
    let s = integrate(Cursor::new(&blk), Cursor::new(&sigs), &mut out, &service()).unwrap();
    assert_eq!((s.signed, s.unsigned), (2, 0));
    assert_eq!(&out[..8], LogSigVersion::LogSig12.magic());
    assert_eq!(
        tags(&out),
        [
            tag::BLOCK_HEADER,
            tag::RECORD_HASH,
            tag::RECORD_HASH,
            tag::BLOCK_SIGNATURE,
            tag::BLOCK_HEADER,
            tag::RECORD_HASH,
            tag::BLOCK_SIGNATURE,
        ]
    );
    assert_eq!(check(&out, Some(&log)).unwrap().verified_blocks, 2);
}

#[test]
fn pending_signatures_stay_unsigned() {
    let blocks = vec![lines(&["a", "b"]), lines(&["c"])];
    let (_, blk, sigs) = build_parts(&blocks, Layout::default(), &[false, true], &service());
    let mut out = Vec::new();
    let s = integrate(Cursor::new(&blk), Cursor::new(&sigs), &mut out, &service()).unwrap();
    assert_eq!((s.signed, s.unsigned), (1, 1));
    assert!(s.file.warning_unsigned);
}

#[test]
fn signature_count_must_match_the_blocks() {
    let blocks = vec![lines(&["a", "b"]), lines(&["c"])];
    let (_, blk, sigs) = build_parts(&blocks, Layout::default(), &[], &service());
    let sig_tlvs = raw_tlvs(&sigs);

    let mut extra = sigs.clone();
    extra.extend_from_slice(&sig_tlvs[1]);
    let e = integrate(Cursor::new(&blk), Cursor::new(&extra), Vec::new(), &service()).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::InvalidInputFormat);
    assert!(e.to_string().contains("more signatures"), "{e}");

    let mut short = sigs[..8].to_vec();
    short.extend_from_slice(&sig_tlvs[0]);
    let e = integrate(Cursor::new(&blk), Cursor::new(&short), Vec::new(), &service()).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::InvalidInputFormat);
    assert!(e.to_string().contains("block 2"), "{e}");
}

#[test]
fn signatures_of_other_blocks_are_rejected() {
    let (_, blk, _) = build_parts(&[lines(&["a", "b"])], Layout::default(), &[], &service());
    let (_, _, other) = build_parts(&[lines(&["x", "y"])], Layout::default(), &[], &service());
    let e = integrate(Cursor::new(&blk), Cursor::new(&other), Vec::new(), &service()).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::VerificationFailure);
}

#[test]
fn part_files_must_be_in_the_right_slots() {
    let (_, blk, sigs) = build_parts(&[lines(&["a"])], Layout::default(), &[], &service());
    let e = integrate(Cursor::new(&sigs), Cursor::new(&blk), Vec::new(), &service()).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::InvalidInputFormat);
}

#[test]
fn integrate_log_on_disk() {
    let blocks = vec![lines(&["a", "b", "c"]), lines(&["d"])];
    let (log, blk, sigs) = build_parts(&blocks, Layout::default(), &[], &service());
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("app.log");
    fs::write(&log_path, &log).unwrap();
    fs::create_dir(parts_dir(&log_path)).unwrap();
    fs::write(blocks_part(&log_path), &blk).unwrap();
    fs::write(signatures_part(&log_path), &sigs).unwrap();

    let IntegrateOutcome::Integrated(s) = integrate_log(&log_path, None, &service()).unwrap()
    else {
        panic!("expected a fresh integration");
    };
    assert_eq!(s.signed, 2);
    let merged = fs::read(signature_path(&log_path)).unwrap();
    assert_eq!(check(&merged, Some(&log)).unwrap().verified_blocks, 2);

    let e = integrate_log(&log_path, None, &service()).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::Io);
    assert_eq!(fs::read(signature_path(&log_path)).unwrap(), merged);

    fs::remove_dir_all(parts_dir(&log_path)).unwrap();
    match integrate_log(&log_path, None, &service()).unwrap() {
        IntegrateOutcome::AlreadyIntegrated(p) => assert_eq!(p, signature_path(&log_path)),
        IntegrateOutcome::Integrated(_) => panic!("nothing left to integrate"),
    }

    let missing = dir.path().join("other.log");
    let e = integrate_log(&missing, None, &service()).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::Io);
}

#[test]
fn locked_part_file_skips_integration() {
    let (log, blk, sigs) = build_parts(&[lines(&["a", "b"])], Layout::default(), &[], &service());
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("app.log");
    fs::write(&log_path, &log).unwrap();
    fs::create_dir(parts_dir(&log_path)).unwrap();
    fs::write(blocks_part(&log_path), &blk).unwrap();
    fs::write(signatures_part(&log_path), &sigs).unwrap();

    let signer = fs::File::open(blocks_part(&log_path)).unwrap();
    fs2::FileExt::lock_exclusive(&signer).unwrap();
    let e = integrate_log(&log_path, None, &service()).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::VerificationSkipped, "{e}");
    assert!(!signature_path(&log_path).exists());
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);

    fs2::FileExt::unlock(&signer).unwrap();
    assert!(matches!(
        integrate_log(&log_path, None, &service()).unwrap(),
        IntegrateOutcome::Integrated(_)
    ));
}

fn numbered(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("line {i}")).collect()
}

fn run_extract(sig: &[u8], log: &[u8], positions: &str) -> Result<(ExtractSummary, Vec<u8>, Vec<u8>)> {
    let mut sig_out = Vec::new();
    let mut log_out = Vec::new();
    let positions: ExtractPositions = positions.parse()?;
    let s = extract(
        Cursor::new(sig),
        LogLines::new(Cursor::new(log)),
        positions,
        &service(),
        &mut sig_out,
        &mut log_out,
    )?;
    Ok((s, sig_out, log_out))
}

fn three_and_five(layout: Layout) -> common::Fixture {
    let all = numbered(8);
    let refs: Vec<&str> = all.iter().map(String::as_str).collect();
    build(&[lines(&refs[..3]), lines(&refs[3..])], layout, &service())
}

#[test]
fn extracted_records_verify_against_their_chains() {
    let f = three_and_five(Layout::default());
    let (s, sig, log) = run_extract(&f.signature, &f.log, "2,4-5,8").unwrap();
    assert_eq!((s.extracted, s.excerpt_blocks), (4, 2));
    assert_eq!(log, b"line 2\nline 4\nline 5\nline 8\n");
    assert_eq!(&sig[..8], LogSigVersion::RecSig12.magic());
    assert_eq!(
        tags(&sig),
        [
            tag::EXCERPT_SIGNATURE,
            tag::RECORD_CHAIN,
            tag::EXCERPT_SIGNATURE,
            tag::RECORD_CHAIN,
            tag::RECORD_CHAIN,
            tag::RECORD_CHAIN,
        ]
    );

    let v = check(&sig, Some(&log)).unwrap();
    assert_eq!(v.verified_blocks, 2);
    assert_eq!(v.file.nof_total_records, 4);
    check(&sig, None).unwrap();
}

#[test]
fn extraction_rebuilds_trees_from_the_log() {
    let layout = Layout {
        record_hashes: false,
        ..Layout::default()
    };
    let f = three_and_five(layout);
    let (s, sig, log) = run_extract(&f.signature, &f.log, "1-3,6").unwrap();
    assert_eq!(s.extracted, 4);
    assert_eq!(check(&sig, Some(&log)).unwrap().verified_blocks, 2);
}

#[test]
fn extraction_stops_after_the_last_position() {
    let f = three_and_five(Layout::default());
    let (s, sig, _) = run_extract(&f.signature, &f.log, "1").unwrap();
    assert_eq!(s.excerpt_blocks, 1);
    assert_eq!(s.file.nof_blocks, 1);
    assert_eq!(tags(&sig), [tag::EXCERPT_SIGNATURE, tag::RECORD_CHAIN]);
}

#[test]
fn position_past_the_end_is_rejected() {
    let f = three_and_five(Layout::default());
    let e = run_extract(&f.signature, &f.log, "7-9").unwrap_err();
    assert_eq!(e.kind(), ErrorKind::InvalidArgument);
    assert!(e.to_string().contains("beyond the last record 8"), "{e}");
}

#[test]
fn unsigned_blocks_cannot_be_extracted() {
    let f = three_and_five(Layout {
        signed: false,
        ..Layout::default()
    });
    let e = run_extract(&f.signature, &f.log, "2").unwrap_err();
    assert_eq!(e.kind(), ErrorKind::InvalidInputFormat);
}

#[test]
fn tampered_excerpt_line_fails() {
    let f = three_and_five(Layout::default());
    let (_, sig, log) = run_extract(&f.signature, &f.log, "2,4").unwrap();
    let log = String::from_utf8(log).unwrap().replace("line 4", "line 4!");
    let e = check(&sig, Some(log.as_bytes())).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::VerificationFailure);
}

#[test]
fn extraction_across_a_meta_record() {
    let block = vec![
        Item::Line("first".into()),
        Item::Meta("com.example.marker".into(), b"m".to_vec()),
        Item::Line("second".into()),
        Item::Line("third".into()),
    ];
    let f = build(&[block], Layout::default(), &service());
    let (s, sig, log) = run_extract(&f.signature, &f.log, "1,3").unwrap();
    assert_eq!(s.extracted, 2);
    assert_eq!(log, b"first\nthird\n");
    check(&sig, Some(&log)).unwrap();
}

#[test]
fn extract_files_writes_both_outputs() {
    let f = three_and_five(Layout::default());
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("app.log");
    fs::write(&log_path, &f.log).unwrap();
    fs::write(signature_path(&log_path), &f.signature).unwrap();

    let files = ExtractFiles {
        log: log_path.clone(),
        ..ExtractFiles::default()
    };
    let s = extract_files(&files, "5".parse().unwrap(), &service()).unwrap();
    assert_eq!(s.extracted, 1);
    let excerpt = fs::read(dir.path().join("app.log.excerpt")).unwrap();
    assert_eq!(excerpt, b"line 5\n");
    let sig = fs::read(dir.path().join("app.log.excerpt.logsig")).unwrap();
    check(&sig, Some(&excerpt)).unwrap();

    let e = extract_files(&files, "5".parse().unwrap(), &service()).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::Io);
    let files = ExtractFiles {
        overwrite: true,
        ..files
    };
    extract_files(&files, "6".parse().unwrap(), &service()).unwrap();
    assert_eq!(fs::read(dir.path().join("app.log.excerpt")).unwrap(), b"line 6\n");
}
