//! Path node construction
//!
//! Chains unambiguous aggregate nodes into unbranched path nodes. A chain
//! grows one k-mer at a time while the tail has exactly one successor in
//! the buffer, at the exact +1 interval shift, with the same reference
//! flag, and that successor has no other predecessor. Chains stop at
//! branches, at `max_path_length`, or at end of stream.

use crate::assembly::aggregate::KmerNode;
use crate::assembly::StageResult;
use crate::core::kmer::KmerCoder;
use crate::utils::export::PipelineCounters;
use ahash::AHashMap;
use std::collections::{BTreeSet, VecDeque};
use std::rc::Rc;

/// An unbranched chain of k-mers sharing one start interval shifted by one
/// base per step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KmerPathNode {
    pub kmers: Vec<u64>,
    /// Lowest genomic start of the first k-mer
    pub start: i32,
    /// Highest genomic start of the first k-mer
    pub end: i32,
    /// Per-k-mer aggregate weights
    pub weights: Vec<u32>,
    pub reference: bool,
    /// Alternate k-mers folded in by collapse, as `(offset, kmer)` pairs
    pub collapsed: Vec<(u32, u64)>,
}

impl KmerPathNode {
    pub fn len(&self) -> usize {
        self.kmers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kmers.is_empty()
    }

    pub fn first_kmer(&self) -> u64 {
        self.kmers[0]
    }

    pub fn last_kmer(&self) -> u64 {
        *self.kmers.last().unwrap()
    }

    /// Position interval of the k-mer at `offset`
    pub fn interval_at(&self, offset: usize) -> (i32, i32) {
        (self.start + offset as i32, self.end + offset as i32)
    }

    pub fn total_weight(&self) -> u64 {
        self.weights.iter().map(|&w| u64::from(w)).sum()
    }

    /// Interval width in positions
    pub fn width(&self) -> i32 {
        self.end - self.start + 1
    }

    /// Every `(kmer, start, end)` occurrence on this node, primary and
    /// collapsed, for tracker attribution queries
    pub fn occurrences(&self) -> impl Iterator<Item = (u64, i32, i32)> + '_ {
        let primary = self
            .kmers
            .iter()
            .enumerate()
            .map(move |(i, &kmer)| (kmer, self.start + i as i32, self.end + i as i32));
        let folded = self
            .collapsed
            .iter()
            .map(move |&(offset, kmer)| (kmer, self.start + offset as i32, self.end + offset as i32));
        primary.chain(folded)
    }
}

struct BufNode {
    node: KmerNode,
    consumed: bool,
}

/// Aggregate node stream -> path node stream
pub struct PathNodeIter<I> {
    input: I,
    coder: KmerCoder,
    max_path_length: usize,
    /// Positions past a node's start before its whole chain neighbourhood
    /// is guaranteed visible
    horizon: i64,
    arena: Vec<Option<BufNode>>,
    free: Vec<u32>,
    by_kmer: AHashMap<u64, Vec<u32>>,
    pending: BTreeSet<(i32, u64, bool, u32)>,
    retired: BTreeSet<(i32, u32)>,
    out: VecDeque<KmerPathNode>,
    frontier: i64,
    finished: bool,
    failed: bool,
    counters: Rc<PipelineCounters>,
}

impl<I: Iterator<Item = StageResult<KmerNode>>> PathNodeIter<I> {
    pub fn new(
        input: I,
        coder: KmerCoder,
        max_path_length: usize,
        max_interval_width: i32,
        counters: Rc<PipelineCounters>,
    ) -> Self {
        Self {
            input,
            coder,
            max_path_length,
            horizon: max_path_length as i64 + max_interval_width as i64 + 2,
            arena: Vec::new(),
            free: Vec::new(),
            by_kmer: AHashMap::new(),
            pending: BTreeSet::new(),
            retired: BTreeSet::new(),
            out: VecDeque::new(),
            frontier: i64::MIN,
            finished: false,
            failed: false,
            counters,
        }
    }

    fn insert(&mut self, node: KmerNode) {
        let id = match self.free.pop() {
            Some(id) => {
                self.arena[id as usize] = Some(BufNode {
                    node,
                    consumed: false,
                });
                id
            }
            None => {
                self.arena.push(Some(BufNode {
                    node,
                    consumed: false,
                }));
                (self.arena.len() - 1) as u32
            }
        };
        let n = &self.arena[id as usize].as_ref().unwrap().node;
        self.by_kmer.entry(n.kmer).or_default().push(id);
        self.pending.insert((n.start, n.kmer, n.reference, id));
    }

    fn node(&self, id: u32) -> &BufNode {
        self.arena[id as usize].as_ref().unwrap()
    }

    /// Nodes whose interval overlaps `[start, end]` with the given kmer
    fn overlapping(&self, kmer: u64, start: i32, end: i32) -> Vec<u32> {
        let mut hits = Vec::new();
        if let Some(ids) = self.by_kmer.get(&kmer) {
            for &id in ids {
                let n = &self.node(id).node;
                if n.start <= end && start <= n.end {
                    hits.push(id);
                }
            }
        }
        hits
    }

    /// The single chainable successor of `id`, if unambiguous
    fn unique_extension(&self, id: u32) -> Option<u32> {
        let tail = &self.node(id).node;
        let (ts, te) = (tail.start + 1, tail.end + 1);
        let mut candidates = Vec::new();
        for succ in self.coder.successors(tail.kmer) {
            candidates.extend(self.overlapping(succ, ts, te));
        }
        if candidates.len() != 1 {
            return None;
        }
        let cid = candidates[0];
        let c = self.node(cid);
        if c.consumed || c.node.start != ts || c.node.end != te || c.node.reference != tail.reference
        {
            return None;
        }
        // the successor must have no other in-graph predecessor
        let mut preds = 0;
        for pred in self.coder.predecessors(c.node.kmer) {
            preds += self.overlapping(pred, c.node.start - 1, c.node.end - 1).len();
        }
        if preds != 1 {
            return None;
        }
        Some(cid)
    }

    fn consume(&mut self, id: u32) {
        let (start, kmer, reference) = {
            let n = &self.node(id).node;
            (n.start, n.kmer, n.reference)
        };
        self.pending.remove(&(start, kmer, reference, id));
        self.arena[id as usize].as_mut().unwrap().consumed = true;
        self.retired.insert((start, id));
    }

    fn build_path(&mut self, first: u32) {
        let mut chain = vec![first];
        self.consume(first);
        while chain.len() < self.max_path_length {
            let Some(next) = self.unique_extension(*chain.last().unwrap()) else {
                break;
            };
            self.consume(next);
            chain.push(next);
        }
        let (start, end, reference) = {
            let n = &self.node(chain[0]).node;
            (n.start, n.end, n.reference)
        };
        let mut path = KmerPathNode {
            kmers: Vec::with_capacity(chain.len()),
            start,
            end,
            weights: Vec::with_capacity(chain.len()),
            reference,
            collapsed: Vec::new(),
        };
        for &id in &chain {
            let n = &self.node(id).node;
            path.kmers.push(n.kmer);
            path.weights.push(n.weight);
        }
        self.out.push_back(path);
    }

    fn process_ready(&mut self) {
        loop {
            let Some(&(start, _, _, id)) = self.pending.first() else {
                break;
            };
            if !self.finished && i64::from(start) + self.horizon >= self.frontier {
                break;
            }
            self.build_path(id);
        }
    }

    /// Drop consumed nodes that can no longer affect any chain decision
    fn gc(&mut self) {
        while let Some(&(start, id)) = self.retired.first() {
            if i64::from(start) + 2 * self.horizon >= self.frontier {
                break;
            }
            self.retired.remove(&(start, id));
            let buf = self.arena[id as usize].take().unwrap();
            if let Some(ids) = self.by_kmer.get_mut(&buf.node.kmer) {
                ids.retain(|&x| x != id);
                if ids.is_empty() {
                    self.by_kmer.remove(&buf.node.kmer);
                }
            }
            self.free.push(id);
        }
    }
}

impl<I: Iterator<Item = StageResult<KmerNode>>> Iterator for PathNodeIter<I> {
    type Item = StageResult<KmerPathNode>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(path) = self.out.pop_front() {
                PipelineCounters::bump(&self.counters.path_nodes);
                return Some(Ok(path));
            }
            if self.finished && self.pending.is_empty() {
                return None;
            }
            if !self.finished {
                match self.input.next() {
                    None => {
                        self.finished = true;
                        self.frontier = i64::MAX;
                    }
                    Some(Err(e)) => {
                        self.failed = true;
                        return Some(Err(e));
                    }
                    Some(Ok(node)) => {
                        self.frontier = i64::from(node.start);
                        self.insert(node);
                    }
                }
            }
            self.process_ready();
            self.gc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(kmer: u64, start: i32, weight: u32, reference: bool) -> KmerNode {
        KmerNode {
            kmer,
            start,
            end: start,
            weight,
            reference,
        }
    }

    fn paths(coder: KmerCoder, nodes: Vec<KmerNode>) -> Vec<KmerPathNode> {
        PathNodeIter::new(
            nodes.into_iter().map(Ok),
            coder,
            100,
            1,
            Rc::new(PipelineCounters::default()),
        )
        .map(|r| r.unwrap())
        .collect()
    }

    /// Aggregate nodes spelling the read `bases` starting at `start`
    fn read_nodes(coder: &KmerCoder, bases: &[u8], start: i32, weight: u32) -> Vec<KmerNode> {
        (0..=bases.len() - coder.k())
            .map(|i| {
                node(
                    coder.encode(&bases[i..i + coder.k()]).unwrap(),
                    start + i as i32,
                    weight,
                    false,
                )
            })
            .collect()
    }

    #[test]
    fn test_linear_chain_forms_one_path() {
        let coder = KmerCoder::new(4).unwrap();
        let nodes = read_nodes(&coder, b"ACGTACC", 10, 5);
        let out = paths(coder, nodes);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), 4);
        assert_eq!(out[0].start, 10);
        assert_eq!(out[0].weights, vec![5; 4]);
    }

    #[test]
    fn test_branch_splits_paths() {
        let coder = KmerCoder::new(4).unwrap();
        // AAAC has two successors: AACA and AACC
        let mut nodes = read_nodes(&coder, b"AAACA", 10, 5);
        nodes.push(node(coder.encode(b"AACC").unwrap(), 11, 5, false));
        nodes.sort_by_key(|n| (n.start, n.kmer));
        let out = paths(coder, nodes);
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|p| p.len() == 1));
    }

    #[test]
    fn test_reference_flag_breaks_chain() {
        let coder = KmerCoder::new(4).unwrap();
        let mut nodes = read_nodes(&coder, b"AAAACC", 10, 5);
        nodes[0].reference = true;
        let out = paths(coder, nodes);
        assert_eq!(out.len(), 2);
        assert!(out[0].reference);
        assert_eq!(out[0].len(), 1);
        assert_eq!(out[1].len(), 2);
    }

    #[test]
    fn test_max_path_length_caps_chains() {
        let coder = KmerCoder::new(4).unwrap();
        let nodes = read_nodes(&coder, b"ACGTACCGGTT", 10, 5);
        let out: Vec<KmerPathNode> = PathNodeIter::new(
            nodes.into_iter().map(Ok),
            coder,
            3,
            1,
            Rc::new(PipelineCounters::default()),
        )
        .map(|r| r.unwrap())
        .collect();
        assert!(out.iter().all(|p| p.len() <= 3));
        assert_eq!(out.iter().map(KmerPathNode::len).sum::<usize>(), 8);
    }

    #[test]
    fn test_interval_mismatch_breaks_chain() {
        let coder = KmerCoder::new(4).unwrap();
        // same k-mer succession but the second node's interval is wider
        let a = node(coder.encode(b"ACGT").unwrap(), 10, 5, false);
        let mut b = node(coder.encode(b"CGTA").unwrap(), 11, 5, false);
        b.end = 13;
        let out = paths(coder, vec![a, b]);
        assert_eq!(out.len(), 2);
    }
}
