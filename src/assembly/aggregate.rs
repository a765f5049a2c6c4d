//! Support aggregation
//!
//! Merges coincident support nodes into maximal k-mer interval nodes. Two
//! occurrences merge when they share `(kmer, reference)` and their position
//! intervals overlap or touch; reference and non-reference support never
//! merge. An aggregate is finalised once the input position has passed
//! `end + 1`, at which point no future support can extend it.

use crate::assembly::support_node::SupportNode;
use crate::assembly::StageResult;
use crate::utils::export::PipelineCounters;
use ahash::AHashMap;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap};
use std::rc::Rc;

/// Aggregated k-mer support over a maximal position interval
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KmerNode {
    pub kmer: u64,
    pub start: i32,
    pub end: i32,
    pub weight: u32,
    pub reference: bool,
}

impl KmerNode {
    fn order_key(&self) -> (i32, u64, bool) {
        (self.start, self.kmer, self.reference)
    }
}

#[derive(PartialEq, Eq)]
struct Ordered(KmerNode);

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

/// Support node stream -> maximal aggregate node stream
pub struct AggregateIter<I> {
    input: I,
    open: AHashMap<(u64, bool), KmerNode>,
    open_by_start: BTreeSet<(i32, u64, bool)>,
    open_by_end: BTreeSet<(i32, u64, bool)>,
    done: BinaryHeap<Reverse<Ordered>>,
    lookahead: Option<SupportNode>,
    counters: Rc<PipelineCounters>,
    finished: bool,
    failed: bool,
}

impl<I: Iterator<Item = StageResult<SupportNode>>> AggregateIter<I> {
    pub fn new(input: I, counters: Rc<PipelineCounters>) -> Self {
        Self {
            input,
            open: AHashMap::new(),
            open_by_start: BTreeSet::new(),
            open_by_end: BTreeSet::new(),
            done: BinaryHeap::new(),
            lookahead: None,
            counters,
            finished: false,
            failed: false,
        }
    }

    fn finalise(&mut self, key: (u64, bool)) {
        let node = self.open.remove(&key).unwrap();
        self.open_by_start.remove(&(node.start, key.0, key.1));
        self.open_by_end.remove(&(node.end, key.0, key.1));
        self.done.push(Reverse(Ordered(node)));
    }

    /// Finalise every open aggregate no future support can reach
    fn finalise_passed(&mut self, input_pos: i32) {
        while let Some(&(end, kmer, reference)) = self.open_by_end.first() {
            if end + 1 >= input_pos {
                break;
            }
            self.finalise((kmer, reference));
        }
    }

    fn finalise_all(&mut self) {
        while let Some(&(_, kmer, reference)) = self.open_by_end.first() {
            self.finalise((kmer, reference));
        }
    }

    fn ingest(&mut self, node: SupportNode) {
        let key = (node.kmer, node.reference);
        if let Some(open) = self.open.get_mut(&key) {
            if node.start <= open.end + 1 {
                // coincident or touching: extend the aggregate
                if node.end > open.end {
                    self.open_by_end.remove(&(open.end, key.0, key.1));
                    open.end = node.end;
                    self.open_by_end.insert((open.end, key.0, key.1));
                }
                open.weight += node.weight;
                return;
            }
            self.finalise(key);
        }
        let aggregate = KmerNode {
            kmer: node.kmer,
            start: node.start,
            end: node.end,
            weight: node.weight,
            reference: node.reference,
        };
        self.open_by_start
            .insert((aggregate.start, key.0, key.1));
        self.open_by_end.insert((aggregate.end, key.0, key.1));
        self.open.insert(key, aggregate);
    }

    /// Whether the lowest finalised aggregate can no longer be preceded by
    /// any open aggregate or future input
    fn emittable(&self) -> bool {
        let Some(Reverse(top)) = self.done.peek() else {
            return false;
        };
        let key = top.0.order_key();
        if let Some(&open_min) = self.open_by_start.first() {
            if open_min <= key {
                return false;
            }
        }
        match &self.lookahead {
            Some(next) => (next.start, next.kmer, next.reference) > key,
            None => self.finished,
        }
    }
}

impl<I: Iterator<Item = StageResult<SupportNode>>> Iterator for AggregateIter<I> {
    type Item = StageResult<KmerNode>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if self.lookahead.is_none() && !self.finished {
                match self.input.next() {
                    None => {
                        self.finished = true;
                        self.finalise_all();
                    }
                    Some(Err(e)) => {
                        self.failed = true;
                        return Some(Err(e));
                    }
                    Some(Ok(node)) => {
                        self.finalise_passed(node.start);
                        self.lookahead = Some(node);
                    }
                }
            }
            if self.emittable() {
                let node = self.done.pop().unwrap().0 .0;
                PipelineCounters::bump(&self.counters.aggregate_nodes);
                return Some(Ok(node));
            }
            if let Some(node) = self.lookahead.take() {
                self.ingest(node);
                continue;
            }
            if self.finished && self.done.is_empty() {
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::tracker::EvidenceId;

    fn support(kmer: u64, start: i32, end: i32, weight: u32, reference: bool) -> SupportNode {
        SupportNode {
            kmer,
            start,
            end,
            weight,
            reference,
            evidence: EvidenceId(0),
            offset: 0,
        }
    }

    fn aggregate(nodes: Vec<SupportNode>) -> Vec<KmerNode> {
        AggregateIter::new(
            nodes.into_iter().map(Ok),
            Rc::new(PipelineCounters::default()),
        )
        .map(|r| r.unwrap())
        .collect()
    }

    #[test]
    fn test_overlapping_support_merges() {
        let out = aggregate(vec![
            support(7, 10, 12, 5, false),
            support(7, 11, 15, 3, false),
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!((out[0].start, out[0].end, out[0].weight), (10, 15, 8));
    }

    #[test]
    fn test_touching_support_merges() {
        let out = aggregate(vec![
            support(7, 10, 10, 5, false),
            support(7, 11, 11, 3, false),
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!((out[0].start, out[0].end), (10, 11));
    }

    #[test]
    fn test_disjoint_support_stays_separate() {
        let out = aggregate(vec![
            support(7, 10, 10, 5, false),
            support(7, 20, 20, 3, false),
        ]);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_reference_flag_never_merges() {
        let out = aggregate(vec![
            support(7, 10, 10, 5, true),
            support(7, 10, 10, 3, false),
        ]);
        assert_eq!(out.len(), 2);
        assert!(out.iter().any(|n| n.reference && n.weight == 5));
        assert!(out.iter().any(|n| !n.reference && n.weight == 3));
    }

    #[test]
    fn test_maximality() {
        // Property: no two emitted nodes share (kmer, reference) with
        // overlapping or touching intervals
        let mut nodes = Vec::new();
        let mut pos = 0;
        for _ in 0..300 {
            pos += fastrand::i32(0..4);
            nodes.push(support(
                fastrand::u64(0..4),
                pos,
                pos + fastrand::i32(0..6),
                1 + fastrand::u32(0..10),
                fastrand::bool(),
            ));
        }
        nodes.sort_by_key(|n| (n.start, n.kmer, n.reference));
        let out = aggregate(nodes);
        for (i, a) in out.iter().enumerate() {
            for b in &out[i + 1..] {
                if a.kmer == b.kmer && a.reference == b.reference {
                    let touch = a.start <= b.end + 1 && b.start <= a.end + 1;
                    assert!(!touch, "non-maximal aggregates {a:?} and {b:?}");
                }
            }
        }
    }

    #[test]
    fn test_output_ordered() {
        let mut nodes = Vec::new();
        let mut pos = 0;
        for _ in 0..200 {
            pos += fastrand::i32(0..3);
            nodes.push(support(fastrand::u64(0..8), pos, pos, 1, false));
        }
        nodes.sort_by_key(|n| (n.start, n.kmer, n.reference));
        let out = aggregate(nodes);
        let keys: Vec<_> = out.iter().map(|n| (n.start, n.kmer)).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }
}
