//! Builds log signature files the way a signing logger would, so the
//! drivers can be exercised against known-good input.

#![allow(dead_code, clippy::unwrap_used)]

use logsig_core::{
    aggregation_level, tag, BlockHeader, BlockSignature, DataHash, HashAlgorithm, LogSigVersion,
    MetaRecord, SignatureBody, Tlv,
};
use logsig_crypto::{Clock, LocalService, SignatureService};
use logsig_merkle::{LeafKind, MerkleTree, NoObserver};

pub const ALG: HashAlgorithm = HashAlgorithm::Sha256;

/// Service with a deterministic clock: 1 700 000 000, then +60 s per use.
pub fn service() -> LocalService {
    LocalService::new([42u8; 32], "test-signer").with_clock(Clock::stepping(1_700_000_000, 60))
}

/// One entry of a block.
#[derive(Clone, Debug)]
pub enum Item {
    Line(String),
    Meta(String, Vec<u8>),
}

pub fn lines(ls: &[&str]) -> Vec<Item> {
    ls.iter().map(|l| Item::Line((*l).to_owned())).collect()
}

/// What the generated file keeps.
#[derive(Clone, Copy, Debug)]
pub struct Layout {
    pub record_hashes: bool,
    pub tree_hashes: bool,
    pub final_hashes: bool,
    pub signed: bool,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            record_hashes: true,
            tree_hashes: true,
            final_hashes: true,
            signed: true,
        }
    }
}

/// A generated log and its signature file.
pub struct Fixture {
    pub log: Vec<u8>,
    pub signature: Vec<u8>,
    pub last_leaf: DataHash,
    pub roots: Vec<DataHash>,
}

pub fn zero_input() -> DataHash {
    DataHash::from_digest(ALG, &[0u8; 32]).unwrap()
}

fn push(out: &mut Vec<u8>, t: &Tlv) {
    out.extend_from_slice(t.raw());
}

/// Block elements (header through the element before the signature) plus
/// the root and record count.
fn block_body(
    out: &mut Vec<u8>,
    log: &mut Vec<u8>,
    tree: &mut MerkleTree,
    block_no: usize,
    items: &[Item],
    input: &DataHash,
    layout: Layout,
) -> (DataHash, u64) {
    let seed = vec![u8::try_from(block_no).unwrap(); 32];
    push(
        out,
        &BlockHeader {
            algorithm: ALG,
            random_seed: seed.clone(),
            input_hash: input.clone(),
        }
        .to_tlv()
        .unwrap(),
    );
    tree.reset(ALG, &seed, input.clone());
    let mut records = 0u64;
    for item in items {
        let (kind, hash) = match item {
            Item::Line(l) => {
                log.extend_from_slice(l.as_bytes());
                log.push(b'\n');
                records += 1;
                (LeafKind::Record, ALG.hash(l.as_bytes()))
            }
            Item::Meta(key, value) => {
                let t = MetaRecord {
                    index: records,
                    key: key.clone(),
                    value: value.clone(),
                }
                .to_tlv()
                .unwrap();
                push(out, &t);
                (LeafKind::MetaRecord, ALG.hash(t.raw()))
            }
        };
        tree.add_leaf(kind, &hash, &mut NoObserver).unwrap();
        if layout.record_hashes {
            push(out, &Tlv::imprint(tag::RECORD_HASH, &hash).unwrap());
        }
        if layout.tree_hashes {
            while let Some(h) = tree.pop_unverified() {
                push(out, &Tlv::imprint(tag::TREE_HASH, &h).unwrap());
            }
        } else {
            tree.clear_unverified();
        }
    }
    if layout.tree_hashes && layout.final_hashes {
        for h in tree.final_hashes() {
            push(out, &Tlv::imprint(tag::TREE_HASH, &h).unwrap());
        }
    }
    let root = tree.close(&mut NoObserver).unwrap().unwrap();
    (root, records)
}

/// A `LOGSIG12` file over `blocks`, chained from `input`.
pub fn build_from(
    blocks: &[Vec<Item>],
    layout: Layout,
    svc: &dyn SignatureService,
    input: &DataHash,
) -> Fixture {
    let mut signature = LogSigVersion::LogSig12.magic().to_vec();
    let mut log = Vec::new();
    let mut tree = MerkleTree::new(ALG);
    let mut prev = input.clone();
    let mut roots = Vec::new();
    for (i, items) in blocks.iter().enumerate() {
        let (root, count) = block_body(
            &mut signature,
            &mut log,
            &mut tree,
            i + 1,
            items,
            &prev,
            layout,
        );
        prev = tree.prev_leaf().unwrap().clone();
        let body = if layout.signed {
            SignatureBody::Signed(
                svc.sign(&root, aggregation_level(LogSigVersion::LogSig12, count))
                    .unwrap(),
            )
        } else {
            SignatureBody::Unsigned {
                root_hash: root.clone(),
            }
        };
        push(
            &mut signature,
            &BlockSignature {
                record_count: count,
                body,
            }
            .to_tlv()
            .unwrap(),
        );
        roots.push(root);
    }
    Fixture {
        log,
        signature,
        last_leaf: prev,
        roots,
    }
}

pub fn build(blocks: &[Vec<Item>], layout: Layout, svc: &dyn SignatureService) -> Fixture {
    build_from(blocks, layout, svc, &zero_input())
}

/// The two part files of asynchronous signing for `blocks`: the blocks
/// file closes every block with an unsigned marker, the signatures file
/// holds one signature per block (unsigned where `pending` says so).
pub fn build_parts(
    blocks: &[Vec<Item>],
    layout: Layout,
    pending: &[bool],
    svc: &dyn SignatureService,
) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
    let mut blocks_file = LogSigVersion::Log12Blk.magic().to_vec();
    let mut sigs_file = LogSigVersion::Log12Sig.magic().to_vec();
    let mut log = Vec::new();
    let mut tree = MerkleTree::new(ALG);
    let mut prev = zero_input();
    for (i, items) in blocks.iter().enumerate() {
        let (root, count) = block_body(
            &mut blocks_file,
            &mut log,
            &mut tree,
            i + 1,
            items,
            &prev,
            layout,
        );
        prev = tree.prev_leaf().unwrap().clone();
        let unsigned = BlockSignature {
            record_count: count,
            body: SignatureBody::Unsigned {
                root_hash: root.clone(),
            },
        };
        push(&mut blocks_file, &unsigned.to_tlv().unwrap());
        let partial = if pending.get(i).copied().unwrap_or(false) {
            unsigned
        } else {
            BlockSignature {
                record_count: count,
                body: SignatureBody::Signed(
                    svc.sign(&root, aggregation_level(LogSigVersion::LogSig12, count))
                        .unwrap(),
                ),
            }
        };
        push(&mut sigs_file, &partial.to_tlv().unwrap());
    }
    (log, blocks_file, sigs_file)
}

/// Top-level tags of a file, magic skipped.
pub fn tags(file: &[u8]) -> Vec<u16> {
    logsig_core::TlvReader::new(&file[8..])
        .map(|t| t.unwrap().tag())
        .collect()
}

/// `n` syslog-style lines with RFC 3339 timestamps one second apart.
pub fn timed_lines(start: i64, n: usize, app: &str) -> Vec<Item> {
    (0..n)
        .map(|i| {
            let secs = start + i64::try_from(i).unwrap();
            let t = chrono::DateTime::from_timestamp(secs, 0).unwrap();
            Item::Line(format!("{} host {app}[{i}]: message {i}", t.to_rfc3339()))
        })
        .collect()
}
