//! Extraction: which lines to extract and the observer that builds their
//! record chains while a block's tree is being rebuilt.

use crate::chain::{ChainLink, LinkDirection, RecordChain};
use crate::tree::{LeafEvent, LeafKind, MergeEvent, TreeObserver};
use logsig_core::{Error, Result};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Strictly increasing, 1-based line numbers, stored as inclusive ranges.
///
/// Parsed from lists such as `1,3-5,10`. The cursor only moves forward.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtractPositions {
    ranges: Vec<(u64, u64)>,
    idx: usize,
    next: u64,
}

impl ExtractPositions {
    /// Build from ranges; they must be non-empty, 1-based and strictly
    /// increasing without overlap.
    pub fn from_ranges(ranges: Vec<(u64, u64)>) -> Result<Self> {
        if ranges.is_empty() {
            return Err(Error::argument("no extract positions given"));
        }
        let mut last = 0u64;
        for &(a, b) in &ranges {
            if a == 0 {
                return Err(Error::argument("extract positions are 1-based"));
            }
            if b < a {
                return Err(Error::argument(format!("invalid range {a}-{b}")));
            }
            if a <= last {
                return Err(Error::argument(format!(
                    "extract positions must be strictly increasing: {a} follows {last}"
                )));
            }
            last = b;
        }
        let next = ranges[0].0;
        Ok(Self {
            ranges,
            idx: 0,
            next,
        })
    }

    /// Next position still to be served.
    #[must_use]
    pub fn peek(&self) -> Option<u64> {
        (self.idx < self.ranges.len()).then_some(self.next)
    }

    /// Move past the current position.
    pub fn advance(&mut self) {
        let Some(&(_, end)) = self.ranges.get(self.idx) else {
            return;
        };
        if self.next < end {
            self.next += 1;
        } else {
            self.idx += 1;
            if let Some(&(start, _)) = self.ranges.get(self.idx) {
                self.next = start;
            }
        }
    }

    /// `true` once every position was served.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.peek().is_none()
    }

    /// Positions not yet served.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        let Some(next) = self.peek() else { return 0 };
        let current = self.ranges[self.idx].1 - next + 1;
        current
            + self.ranges[self.idx + 1..]
                .iter()
                .map(|(a, b)| b - a + 1)
                .sum::<u64>()
    }
}

impl FromStr for ExtractPositions {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let num = |t: &str| {
            t.trim()
                .parse::<u64>()
                .map_err(|_| Error::argument(format!("invalid extract position {t:?}")))
        };
        let mut ranges = Vec::new();
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                return Err(Error::argument(format!("empty element in positions {s:?}")));
            }
            let r = match part.split_once('-') {
                Some((a, b)) => (num(a)?, num(b)?),
                None => {
                    let n = num(part)?;
                    (n, n)
                }
            };
            ranges.push(r);
        }
        Self::from_ranges(ranges)
    }
}

impl fmt::Display for ExtractPositions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (a, b)) in self.ranges.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            if a == b {
                write!(f, "{a}")?;
            } else {
                write!(f, "{a}-{b}")?;
            }
        }
        Ok(())
    }
}

/// A record picked for extraction together with its chain.
#[derive(Clone, Debug, Serialize)]
pub struct ExtractedRecord {
    /// 1-based line number in the log file.
    pub line_no: u64,
    /// 1-based leaf position in the block (meta-records count too).
    pub offset: u64,
    /// Tree level reached so far.
    pub level: u8,
    /// Log line without newline.
    #[serde(skip)]
    pub line: Vec<u8>,
    /// Path to the root.
    pub chain: RecordChain,
}

/// Observer that opens a chain for each requested record and extends every
/// open chain on each merge covering it.
#[derive(Debug)]
pub struct RecordChainBuilder {
    positions: ExtractPositions,
    open: Vec<ExtractedRecord>,
    staged_line: Option<Vec<u8>>,
    next_line_no: u64,
}

impl RecordChainBuilder {
    /// Builder serving `positions`.
    #[must_use]
    pub const fn new(positions: ExtractPositions) -> Self {
        Self {
            positions,
            open: Vec::new(),
            staged_line: None,
            next_line_no: 1,
        }
    }

    /// A block starts; its first record is line `first_line_no`.
    pub fn begin_block(&mut self, first_line_no: u64) {
        self.open.clear();
        self.staged_line = None;
        self.next_line_no = first_line_no;
    }

    /// Whether the next record leaf is wanted.
    #[must_use]
    pub fn wants_next_record(&self) -> bool {
        self.positions.peek() == Some(self.next_line_no)
    }

    /// Text of the record about to be added as a leaf.
    pub fn stage_line(&mut self, line: &[u8]) {
        self.staged_line = Some(line.to_vec());
    }

    /// Positions still to be served.
    #[must_use]
    pub const fn positions(&self) -> &ExtractPositions {
        &self.positions
    }

    /// Records opened in the current block, chains as far as built.
    #[must_use]
    pub fn open_records(&self) -> &[ExtractedRecord] {
        &self.open
    }

    /// Hand over the block's records; call after the tree was closed.
    pub fn take_records(&mut self) -> Vec<ExtractedRecord> {
        std::mem::take(&mut self.open)
    }
}

impl TreeObserver for RecordChainBuilder {
    fn on_leaf(&mut self, event: &LeafEvent<'_>) -> Result<()> {
        if event.kind == LeafKind::MetaRecord {
            return Ok(());
        }
        let line_no = self.next_line_no;
        self.next_line_no += 1;
        let line = self.staged_line.take();
        if self.positions.peek() != Some(line_no) {
            return Ok(());
        }
        let line = line.ok_or_else(|| {
            Error::argument(format!("log line {line_no} is not available for extraction"))
        })?;
        let mut chain = RecordChain::new(event.record_hash.clone());
        chain.push(ChainLink {
            direction: LinkDirection::Right,
            sibling: event.mask.clone(),
            level_correction: 0,
        })?;
        self.open.push(ExtractedRecord {
            line_no,
            offset: event.offset,
            level: 1,
            line,
            chain,
        });
        self.positions.advance();
        Ok(())
    }

    fn on_merge(&mut self, event: &MergeEvent<'_>) -> Result<()> {
        for rec in &mut self.open {
            let link = if event.left_leaves.contains(&rec.offset) {
                ChainLink {
                    direction: LinkDirection::Left,
                    sibling: event.right.clone(),
                    level_correction: event.parent_level - event.left_level - 1,
                }
            } else if event.right_leaves.contains(&rec.offset) {
                ChainLink {
                    direction: LinkDirection::Right,
                    sibling: event.left.clone(),
                    level_correction: event.parent_level - event.right_level - 1,
                }
            } else {
                continue;
            };
            rec.chain.push(link)?;
            rec.level = event.parent_level;
        }
        Ok(())
    }
}
