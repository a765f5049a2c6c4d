//! Support node generation
//!
//! Fans each piece of evidence out into one weighted, positionally bounded
//! k-mer occurrence per read offset. Output is sorted by `(start, kmer)`;
//! a pending heap holds nodes back until no later evidence can precede
//! them. The only stage that can observe raw input, so sort-order and
//! interval-width violations surface here as `MalformedInput`.

use crate::assembly::tracker::{EvidenceId, EvidenceTracker};
use crate::assembly::{AssemblyError, StageResult};
use crate::core::evidence::{DirectedEvidence, EvidenceKind};
use crate::core::kmer::KmerCoder;
use crate::utils::configuration::AssemblyConfig;
use crate::utils::export::PipelineCounters;
use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::iter::Peekable;
use std::rc::Rc;

/// One (evidence, k-mer offset) occurrence with its positional bounds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupportNode {
    pub kmer: u64,
    /// Lowest genomic start position of this k-mer
    pub start: i32,
    /// Highest genomic start position of this k-mer
    pub end: i32,
    /// Summed `max(1, quality)` over the k-mer's bases
    pub weight: u32,
    pub reference: bool,
    pub evidence: EvidenceId,
    pub offset: u32,
}

impl SupportNode {
    fn order_key(&self) -> (i32, u64, bool, u32, u32) {
        (
            self.start,
            self.kmer,
            self.reference,
            self.evidence.0,
            self.offset,
        )
    }
}

#[derive(PartialEq, Eq)]
struct Ordered(SupportNode);

impl Ord for Ordered {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.order_key().cmp(&other.0.order_key())
    }
}

impl PartialOrd for Ordered {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Evidence stream (one reference index) -> sorted support node stream
pub struct SupportNodeIter<I: Iterator<Item = DirectedEvidence>> {
    input: Peekable<I>,
    coder: KmerCoder,
    include_pair_anchors: bool,
    ignore_end_bases: usize,
    max_interval_positions: i32,
    max_read_length: usize,
    tracker: Rc<RefCell<EvidenceTracker>>,
    counters: Rc<PipelineCounters>,
    pending: BinaryHeap<Reverse<Ordered>>,
    last_start: i32,
    failed: bool,
}

impl<I: Iterator<Item = DirectedEvidence>> SupportNodeIter<I> {
    pub fn new(
        input: I,
        coder: KmerCoder,
        config: &AssemblyConfig,
        tracker: Rc<RefCell<EvidenceTracker>>,
        counters: Rc<PipelineCounters>,
    ) -> Self {
        Self {
            input: input.peekable(),
            coder,
            include_pair_anchors: config.include_pair_anchors,
            ignore_end_bases: config.pair_anchor_mismatch_ignore_end_bases,
            max_interval_positions: config.max_kmer_support_interval_width(),
            max_read_length: config.max_read_length,
            tracker,
            counters,
            pending: BinaryHeap::new(),
            last_start: i32::MIN,
            failed: false,
        }
    }

    fn check(&self, evidence: &DirectedEvidence) -> Result<(), AssemblyError> {
        if evidence.start < self.last_start {
            return Err(AssemblyError::MalformedInput(format!(
                "evidence {} at position {} arrived after position {}",
                evidence.id, evidence.start, self.last_start
            )));
        }
        if evidence.interval_width() + 1 > self.max_interval_positions {
            return Err(AssemblyError::MalformedInput(format!(
                "evidence {} support interval [{}, {}] wider than the concordant \
                 fragment size range allows",
                evidence.id, evidence.start, evidence.end
            )));
        }
        if evidence.read_length() > self.max_read_length {
            return Err(AssemblyError::MalformedInput(format!(
                "evidence {} read length {} exceeds configured maximum {}",
                evidence.id,
                evidence.read_length(),
                self.max_read_length
            )));
        }
        Ok(())
    }

    fn skipped(&self, evidence: &DirectedEvidence, offset: usize) -> bool {
        if evidence.kind != EvidenceKind::PairAnchor || self.ignore_end_bases == 0 {
            return false;
        }
        // skip k-mers spanning the ignored bases at either read end
        offset < self.ignore_end_bases
            || offset + self.coder.k()
                > evidence.read_length().saturating_sub(self.ignore_end_bases)
    }

    fn ingest(&mut self, evidence: DirectedEvidence) {
        let k = self.coder.k();
        let evidence = Rc::new(evidence);
        let id = self.tracker.borrow_mut().insert_evidence(Rc::clone(&evidence));
        let mut produced = 0usize;
        for offset in 0..evidence.kmer_count(k) {
            if self.skipped(&evidence, offset) {
                continue;
            }
            let Some(kmer) = self.coder.encode(&evidence.read_bases[offset..offset + k]) else {
                continue; // ambiguous base
            };
            let weight: u32 = evidence.base_qualities[offset..offset + k]
                .iter()
                .map(|&q| u32::from(q).max(1))
                .sum();
            let node = SupportNode {
                kmer,
                start: evidence.start + offset as i32,
                end: evidence.end + offset as i32,
                weight,
                reference: evidence.is_anchored_kmer(offset, k),
                evidence: id,
                offset: offset as u32,
            };
            self.tracker.borrow_mut().register(&node);
            self.pending.push(Reverse(Ordered(node)));
            produced += 1;
        }
        if produced == 0 {
            // nothing entered the graph; no need to keep tracking it
            self.tracker.borrow_mut().remove(id);
        }
    }
}

impl<I: Iterator<Item = DirectedEvidence>> Iterator for SupportNodeIter<I> {
    type Item = StageResult<SupportNode>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            let upcoming = self.input.peek().map(|e| e.start);
            if let Some(Reverse(top)) = self.pending.peek() {
                let flushable = match upcoming {
                    Some(start) => top.0.start < start,
                    None => true,
                };
                if flushable {
                    let node = self.pending.pop().unwrap().0 .0;
                    PipelineCounters::bump(&self.counters.support_nodes);
                    return Some(Ok(node));
                }
            } else if upcoming.is_none() {
                return None;
            }

            let evidence = self.input.next().unwrap();
            if let Err(e) = self.check(&evidence) {
                self.failed = true;
                return Some(Err(e));
            }
            self.last_start = evidence.start;
            if evidence.kind == EvidenceKind::PairAnchor && !self.include_pair_anchors {
                continue;
            }
            self.ingest(evidence);
        }
    }
}
