//! Record chains: the sibling path from one record to its block root.

use crate::tree::MAX_TREE_HEIGHT;
use logsig_core::{hash_node, tag, DataHash, Error, HashAlgorithm, Result, Tlv};
use serde::Serialize;

/// Longest chain: the mask step plus one step per tree level.
pub const MAX_CHAIN_LEN: usize = MAX_TREE_HEIGHT + 1;

const LINK_LEFT: u16 = 0x07;
const LINK_RIGHT: u16 = 0x08;

/// Which side of its parent the running hash sits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum LinkDirection {
    /// Running hash is the left child; the sibling joins on the right.
    Left,
    /// Running hash is the right child; the sibling joins on the left.
    Right,
}

/// One step up the tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChainLink {
    /// Side of the running hash.
    pub direction: LinkDirection,
    /// The other child.
    pub sibling: DataHash,
    /// Levels skipped beyond the usual `+1` (non-zero where a shallower
    /// subtree is folded in while closing).
    pub level_correction: u8,
}

/// A record hash plus the links leading to its block root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RecordChain {
    record_hash: DataHash,
    links: Vec<ChainLink>,
}

impl RecordChain {
    /// Chain with no links yet.
    #[must_use]
    pub const fn new(record_hash: DataHash) -> Self {
        Self {
            record_hash,
            links: Vec::new(),
        }
    }

    /// Hash of the record the chain starts from.
    #[must_use]
    pub const fn record_hash(&self) -> &DataHash {
        &self.record_hash
    }

    /// Links, leaf first.
    #[must_use]
    pub fn links(&self) -> &[ChainLink] {
        &self.links
    }

    /// Append a link.
    pub fn push(&mut self, link: ChainLink) -> Result<()> {
        if self.links.len() >= MAX_CHAIN_LEN {
            return Err(Error::format(format!(
                "record chain longer than {MAX_CHAIN_LEN} links"
            )));
        }
        self.links.push(link);
        Ok(())
    }

    /// Hash function for the nodes: that of the mask sibling, which is
    /// produced with the block's algorithm.
    #[must_use]
    pub fn algorithm(&self) -> HashAlgorithm {
        self.links
            .first()
            .map_or_else(|| self.record_hash.algorithm(), |l| l.sibling.algorithm())
    }

    /// Level reached at the top of the chain.
    pub fn level(&self) -> Result<u8> {
        self.links.iter().try_fold(0u8, |lvl, l| step(lvl, l.level_correction))
    }

    /// Recompute the root by hashing up through every link.
    pub fn root(&self) -> Result<DataHash> {
        let alg = self.algorithm();
        let mut level = 0u8;
        let mut h = self.record_hash.clone();
        for link in &self.links {
            level = step(level, link.level_correction)?;
            h = match link.direction {
                LinkDirection::Left => hash_node(alg, &h, &link.sibling, level),
                LinkDirection::Right => hash_node(alg, &link.sibling, &h, level),
            };
        }
        Ok(h)
    }

    /// Encode as an excerpt record-chain element.
    pub fn to_tlv(&self) -> Result<Tlv> {
        let mut children = Vec::with_capacity(1 + self.links.len());
        children.push(Tlv::imprint(0x01, &self.record_hash)?);
        for l in &self.links {
            let mut inner = Vec::with_capacity(2);
            if l.level_correction != 0 {
                inner.push(Tlv::uint(0x01, u64::from(l.level_correction))?);
            }
            inner.push(Tlv::imprint(0x02, &l.sibling)?);
            let t = match l.direction {
                LinkDirection::Left => LINK_LEFT,
                LinkDirection::Right => LINK_RIGHT,
            };
            children.push(Tlv::nested(t, &inner)?);
        }
        Tlv::nested(tag::RECORD_CHAIN, &children)
    }

    /// Decode an excerpt record-chain element.
    pub fn from_tlv(tlv: &Tlv) -> Result<Self> {
        if tlv.tag() != tag::RECORD_CHAIN {
            return Err(Error::format(format!(
                "expected record chain 0x{:x}, found 0x{:x}",
                tag::RECORD_CHAIN,
                tlv.tag()
            )));
        }
        let mut record_hash = None;
        let mut links = Vec::new();
        for c in tlv.children()? {
            let direction = match c.tag() {
                0x01 => {
                    record_hash = Some(c.as_imprint()?);
                    continue;
                }
                LINK_LEFT => LinkDirection::Left,
                LINK_RIGHT => LinkDirection::Right,
                _ if c.is_non_critical() => continue,
                other => {
                    return Err(Error::format(format!(
                        "unknown critical element 0x{other:x} in record chain"
                    )))
                }
            };
            let (mut corr, mut sibling) = (0u8, None);
            for g in c.children()? {
                match g.tag() {
                    0x01 => {
                        corr = u8::try_from(g.as_uint()?)
                            .map_err(|_| Error::format("level correction out of range"))?;
                    }
                    0x02 => sibling = Some(g.as_imprint()?),
                    _ => {}
                }
            }
            links.push(ChainLink {
                direction,
                sibling: sibling.ok_or_else(|| Error::format("chain link without sibling"))?,
                level_correction: corr,
            });
        }
        let mut chain = Self::new(
            record_hash.ok_or_else(|| Error::format("record chain without record hash"))?,
        );
        for l in links {
            chain.push(l)?;
        }
        Ok(chain)
    }
}

fn step(level: u8, correction: u8) -> Result<u8> {
    level
        .checked_add(1)
        .and_then(|l| l.checked_add(correction))
        .ok_or_else(|| Error::format("record chain level overflows"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use logsig_core::hash_mask;

    const ALG: HashAlgorithm = HashAlgorithm::Sha256;

    #[test]
    fn single_record_chain_is_the_mask_step() {
        let rec = ALG.hash(b"only line");
        let mask = hash_mask(ALG, &ALG.hash(b"input"), b"seed");
        let mut c = RecordChain::new(rec.clone());
        c.push(ChainLink {
            direction: LinkDirection::Right,
            sibling: mask.clone(),
            level_correction: 0,
        })
        .unwrap();
        assert_eq!(c.root().unwrap(), hash_node(ALG, &mask, &rec, 1));
        assert_eq!(c.level().unwrap(), 1);
    }

    #[test]
    fn correction_raises_the_level() {
        let rec = ALG.hash(b"r");
        let sib = ALG.hash(b"s");
        let mut c = RecordChain::new(rec.clone());
        c.push(ChainLink {
            direction: LinkDirection::Left,
            sibling: sib.clone(),
            level_correction: 2,
        })
        .unwrap();
        assert_eq!(c.root().unwrap(), hash_node(ALG, &rec, &sib, 3));
    }

    #[test]
    fn tlv_keeps_directions_and_corrections() {
        let mut c = RecordChain::new(ALG.hash(b"r"));
        for (i, dir) in [LinkDirection::Right, LinkDirection::Left, LinkDirection::Right]
            .into_iter()
            .enumerate()
        {
            c.push(ChainLink {
                direction: dir,
                sibling: ALG.hash(&[i as u8]),
                level_correction: u8::from(i == 2),
            })
            .unwrap();
        }
        let back = RecordChain::from_tlv(&c.to_tlv().unwrap()).unwrap();
        assert_eq!(back, c);
        assert_eq!(back.root().unwrap(), c.root().unwrap());
    }

    #[test]
    fn overlong_chain_is_rejected() {
        let mut c = RecordChain::new(ALG.hash(b"r"));
        let link = ChainLink {
            direction: LinkDirection::Left,
            sibling: ALG.hash(b"s"),
            level_correction: 0,
        };
        for _ in 0..MAX_CHAIN_LEN {
            c.push(link.clone()).unwrap();
        }
        assert!(c.push(link).is_err());
    }

    #[test]
    fn chain_without_record_hash_is_invalid() {
        let t = Tlv::nested(tag::RECORD_CHAIN, &[]).unwrap();
        assert!(RecordChain::from_tlv(&t).is_err());
    }
}
