//! Directed structural-variant evidence
//!
//! One record per piece of input evidence: a breakend-trimmed, positive
//! strand read with base qualities, a breakend direction, and the genomic
//! support interval of its first k-mer. Forward evidence reads as
//! `[anchor][novel tail]`, backward evidence as `[novel head][anchor]`;
//! evidence extraction from alignments is the producer's concern.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// Side of a breakend junction the novel sequence continues on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BreakendDirection {
    /// Novel sequence continues to the right of the anchor
    Forward,
    /// Novel sequence continues to the left of the anchor
    Backward,
}

impl fmt::Display for BreakendDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakendDirection::Forward => write!(f, "fwd"),
            BreakendDirection::Backward => write!(f, "bwd"),
        }
    }
}

/// Source of a piece of evidence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EvidenceKind {
    /// Soft-clipped read tail: exact breakend position, zero-width interval
    SoftClip,
    /// Discordant read-pair anchor: position known only to fragment-size
    /// uncertainty
    PairAnchor,
}

/// A single piece of directed breakend evidence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectedEvidence {
    pub id: String,
    pub reference_index: usize,
    /// Lowest genomic position the first k-mer may occupy
    pub start: i32,
    /// Highest genomic position the first k-mer may occupy
    pub end: i32,
    pub direction: BreakendDirection,
    pub kind: EvidenceKind,
    pub read_bases: Vec<u8>,
    pub base_qualities: Vec<u8>,
    /// Number of reference-matching bases adjoining the breakend
    pub anchor_length: usize,
}

impl DirectedEvidence {
    pub fn new(
        id: impl Into<String>,
        reference_index: usize,
        start: i32,
        end: i32,
        direction: BreakendDirection,
        kind: EvidenceKind,
        read_bases: Vec<u8>,
        base_qualities: Vec<u8>,
        anchor_length: usize,
    ) -> Result<Self> {
        if read_bases.is_empty() {
            return Err(anyhow!("evidence with no read bases"));
        }
        if read_bases.len() != base_qualities.len() {
            return Err(anyhow!(
                "base/quality length mismatch: {} bases, {} qualities",
                read_bases.len(),
                base_qualities.len()
            ));
        }
        if end < start {
            return Err(anyhow!("inverted support interval [{}, {}]", start, end));
        }
        if anchor_length > read_bases.len() {
            return Err(anyhow!(
                "anchor length {} exceeds read length {}",
                anchor_length,
                read_bases.len()
            ));
        }
        Ok(Self {
            id: id.into(),
            reference_index,
            start,
            end,
            direction,
            kind,
            read_bases,
            base_qualities,
            anchor_length,
        })
    }

    /// Soft-clip evidence: the first k-mer's position is exact
    pub fn soft_clip(
        id: impl Into<String>,
        reference_index: usize,
        start: i32,
        direction: BreakendDirection,
        read_bases: Vec<u8>,
        base_qualities: Vec<u8>,
        anchor_length: usize,
    ) -> Result<Self> {
        Self::new(
            id,
            reference_index,
            start,
            start,
            direction,
            EvidenceKind::SoftClip,
            read_bases,
            base_qualities,
            anchor_length,
        )
    }

    /// Discordant pair-anchor evidence with fragment-size position
    /// uncertainty `[start, end]`
    #[allow(clippy::too_many_arguments)]
    pub fn pair_anchor(
        id: impl Into<String>,
        reference_index: usize,
        start: i32,
        end: i32,
        direction: BreakendDirection,
        read_bases: Vec<u8>,
        base_qualities: Vec<u8>,
    ) -> Result<Self> {
        Self::new(
            id,
            reference_index,
            start,
            end,
            direction,
            EvidenceKind::PairAnchor,
            read_bases,
            base_qualities,
            0,
        )
    }

    pub fn read_length(&self) -> usize {
        self.read_bases.len()
    }

    /// Number of k-mer offsets this read yields
    pub fn kmer_count(&self, k: usize) -> usize {
        (self.read_bases.len() + 1).saturating_sub(k)
    }

    /// Width of the support interval in positions (0 = exact)
    pub fn interval_width(&self) -> i32 {
        self.end - self.start
    }

    /// Read-offset span of the reference-matching bases
    pub fn anchored_range(&self) -> Range<usize> {
        match self.direction {
            BreakendDirection::Forward => 0..self.anchor_length,
            BreakendDirection::Backward => {
                self.read_bases.len() - self.anchor_length..self.read_bases.len()
            }
        }
    }

    /// Whether the k-mer at `offset` lies entirely within the anchor
    pub fn is_anchored_kmer(&self, offset: usize, k: usize) -> bool {
        if self.anchor_length < k {
            return false;
        }
        let range = self.anchored_range();
        offset >= range.start && offset + k <= range.end
    }
}
