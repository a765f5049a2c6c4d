//! Error-correction by path collapse
//!
//! Folds near-identical sibling paths together within a base-mismatch
//! budget. The lower-weight path's per-offset weights move onto the
//! higher-weight path and its k-mers are recorded as collapsed
//! alternatives so evidence attribution survives; the loser is deleted.
//! Leaf/bubble mode stays linear per window; full path collapse explores
//! divergent-then-reconvergent path pairs and is worst-case exponential on
//! repetitive sequence.

use crate::assembly::path_node::KmerPathNode;
use crate::assembly::window::PathWindow;
use crate::assembly::StageResult;
use crate::core::kmer::KmerCoder;
use crate::utils::export::PipelineCounters;
use std::collections::{BTreeSet, VecDeque};
use std::rc::Rc;

/// Collapse aggressiveness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollapseMode {
    /// Terminal leaves and simple bubbles only
    LeafBubble,
    /// Arbitrary divergent/reconvergent path pairs
    FullPath,
}

/// Which side of a candidate pair loses its identity
enum Loser {
    First,
    Second,
}

/// One k-mer offset of a multi-node path, flattened for comparison
#[derive(Clone, Copy)]
struct FlatKmer {
    node: u32,
    local: usize,
    kmer: u64,
    weight: u32,
    start: i32,
    end: i32,
}

/// Path node stream -> collapsed path node stream
pub struct CollapseIter<I> {
    input: I,
    window: PathWindow,
    mode: CollapseMode,
    max_mismatch: usize,
    max_collapse_kmers: usize,
    horizon: i64,
    pending: BTreeSet<(i32, u64, u32)>,
    retired: BTreeSet<(i32, u32)>,
    out: VecDeque<KmerPathNode>,
    frontier: i64,
    finished: bool,
    failed: bool,
    counters: Rc<PipelineCounters>,
}

impl<I: Iterator<Item = StageResult<KmerPathNode>>> CollapseIter<I> {
    pub fn new(
        input: I,
        coder: KmerCoder,
        mode: CollapseMode,
        max_mismatch: usize,
        max_collapse_kmers: usize,
        max_interval_width: i32,
        counters: Rc<PipelineCounters>,
    ) -> Self {
        Self {
            input,
            window: PathWindow::new(coder),
            mode,
            max_mismatch,
            max_collapse_kmers,
            horizon: max_collapse_kmers as i64 + max_interval_width as i64 + 2,
            pending: BTreeSet::new(),
            retired: BTreeSet::new(),
            out: VecDeque::new(),
            frontier: i64::MIN,
            finished: false,
            failed: false,
            counters,
        }
    }

    fn key(&self, id: u32) -> (i32, u64, u32) {
        let n = self.window.get(id);
        (n.start, n.first_kmer(), id)
    }

    fn is_pending(&self, id: u32) -> bool {
        self.pending.contains(&self.key(id))
    }

    fn delete(&mut self, id: u32) -> KmerPathNode {
        self.pending.remove(&self.key(id));
        self.window.remove(id)
    }

    /// Pick the loser of a sibling pair: lower weight, then non-reference,
    /// then larger k-mer sum
    fn choose_loser(
        first_weight: u64,
        second_weight: u64,
        first_ref: bool,
        second_ref: bool,
        first_kmer_sum: u128,
        second_kmer_sum: u128,
    ) -> Option<Loser> {
        if first_weight != second_weight {
            return Some(if first_weight < second_weight {
                Loser::First
            } else {
                Loser::Second
            });
        }
        if first_ref != second_ref {
            return Some(if second_ref { Loser::First } else { Loser::Second });
        }
        match first_kmer_sum.cmp(&second_kmer_sum) {
            std::cmp::Ordering::Greater => Some(Loser::First),
            std::cmp::Ordering::Less => Some(Loser::Second),
            std::cmp::Ordering::Equal => None,
        }
    }

    fn flatten_nodes(&self, nodes: &[u32]) -> Vec<FlatKmer> {
        let mut flat = Vec::new();
        for &id in nodes {
            let n = self.window.get(id);
            for (local, &kmer) in n.kmers.iter().enumerate() {
                let (start, end) = n.interval_at(local);
                flat.push(FlatKmer {
                    node: id,
                    local,
                    kmer,
                    weight: n.weights[local],
                    start,
                    end,
                });
            }
        }
        flat
    }

    /// Base mismatches between two aligned flattened paths
    fn mismatches(&self, a: &[FlatKmer], b: &[FlatKmer]) -> usize {
        let coder = self.window.coder();
        a.iter()
            .zip(b.iter())
            .filter(|(x, y)| coder.last_base(x.kmer) != coder.last_base(y.kmer))
            .count()
    }

    fn contained(loser: &[FlatKmer], winner: &[FlatKmer]) -> bool {
        loser
            .iter()
            .zip(winner.iter())
            .all(|(l, w)| l.start >= w.start && l.end <= w.end)
    }

    /// Fold loser offsets into the aligned winner offsets and delete the
    /// loser nodes
    fn fold(&mut self, winner: &[FlatKmer], loser_nodes: &[u32], loser: &[FlatKmer]) {
        for (w, l) in winner.iter().zip(loser.iter()) {
            self.window.fold_kmer(w.node, w.local, l.kmer, l.weight);
        }
        // carry the loser's own collapsed k-mers across
        let mut folded: Vec<(usize, u64)> = Vec::new();
        let mut base = 0usize;
        for &id in loser_nodes {
            let n = self.window.get(id);
            for &(offset, kmer) in &n.collapsed {
                folded.push((base + offset as usize, kmer));
            }
            base += n.len();
        }
        for (global, kmer) in folded {
            let w = winner[global];
            self.window.fold_kmer(w.node, w.local, kmer, 0);
        }
        for &id in loser_nodes {
            self.delete(id);
        }
        PipelineCounters::bump(&self.counters.collapsed_paths);
    }

    /// A simple arm of `parent`: sole predecessor is `parent`, one k-mer
    /// chain, still pending
    fn is_simple_arm(&self, parent: u32, arm: u32) -> bool {
        self.is_pending(arm) && self.window.predecessors(arm) == [parent]
    }

    /// Collapse one simple bubble hanging off `parent`; true if anything
    /// changed
    fn try_bubble(&mut self, parent: u32) -> bool {
        let arms = self.window.successors(parent);
        if arms.len() < 2 {
            return false;
        }
        for i in 0..arms.len() {
            for j in i + 1..arms.len() {
                let (a, b) = (arms[i], arms[j]);
                if !self.is_simple_arm(parent, a) || !self.is_simple_arm(parent, b) {
                    continue;
                }
                let (an, bn) = (self.window.get(a), self.window.get(b));
                if an.len() != bn.len() || an.len() > self.max_collapse_kmers {
                    continue;
                }
                let (asucc, bsucc) = (self.window.successors(a), self.window.successors(b));
                if asucc.len() != 1 || asucc != bsucc {
                    continue;
                }
                let flat_a = self.flatten_nodes(&[a]);
                let flat_b = self.flatten_nodes(&[b]);
                if self.mismatches(&flat_a, &flat_b) > self.max_mismatch {
                    continue;
                }
                let (an, bn) = (self.window.get(a), self.window.get(b));
                let loser = Self::choose_loser(
                    an.total_weight(),
                    bn.total_weight(),
                    an.reference,
                    bn.reference,
                    an.kmers.iter().map(|&k| u128::from(k)).sum(),
                    bn.kmers.iter().map(|&k| u128::from(k)).sum(),
                );
                let (loser_id, loser_flat, winner_flat) = match loser {
                    Some(Loser::First) => (a, flat_a, flat_b),
                    Some(Loser::Second) => (b, flat_b, flat_a),
                    None => continue,
                };
                if !Self::contained(&loser_flat, &winner_flat) {
                    continue;
                }
                self.fold(&winner_flat, &[loser_id], &loser_flat);
                return true;
            }
        }
        false
    }

    /// Collapse a forward leaf (no successors) into a heavier sibling arm
    /// of `parent`
    fn try_forward_leaves(&mut self, parent: u32) -> bool {
        let arms = self.window.successors(parent);
        if arms.len() < 2 {
            return false;
        }
        for &leaf in &arms {
            if !self.is_simple_arm(parent, leaf)
                || !self.window.successors(leaf).is_empty()
                || self.window.get(leaf).len() > self.max_collapse_kmers
            {
                continue;
            }
            for &trunk in &arms {
                if trunk == leaf || !self.is_simple_arm(parent, trunk) {
                    continue;
                }
                let (leaf_len, trunk_len) =
                    (self.window.get(leaf).len(), self.window.get(trunk).len());
                if trunk_len < leaf_len {
                    continue;
                }
                let leaf_flat = self.flatten_nodes(&[leaf]);
                let trunk_flat: Vec<FlatKmer> =
                    self.flatten_nodes(&[trunk])[..leaf_len].to_vec();
                if self.mismatches(&leaf_flat, &trunk_flat) > self.max_mismatch {
                    continue;
                }
                // only ever fold the leaf into the trunk
                let leaf_weight = self.window.get(leaf).total_weight();
                let trunk_weight: u64 = trunk_flat.iter().map(|f| u64::from(f.weight)).sum();
                if leaf_weight > trunk_weight {
                    continue;
                }
                if leaf_weight == trunk_weight {
                    let ln = self.window.get(leaf);
                    let tn = self.window.get(trunk);
                    if ln.reference && !tn.reference {
                        continue;
                    }
                }
                if !Self::contained(&leaf_flat, &trunk_flat) {
                    continue;
                }
                self.fold(&trunk_flat, &[leaf], &leaf_flat);
                return true;
            }
        }
        false
    }

    /// Collapse a backward leaf (no predecessors) into the tail of `trunk`,
    /// aligned at their shared successor
    fn try_backward_leaves(&mut self, trunk: u32) -> bool {
        for t in self.window.successors(trunk) {
            for leaf in self.window.predecessors(t) {
                if leaf == trunk
                    || !self.is_pending(leaf)
                    || !self.window.predecessors(leaf).is_empty()
                {
                    continue;
                }
                let leaf_node = self.window.get(leaf);
                if leaf_node.len() > self.max_collapse_kmers
                    || self.window.successors(leaf) != [t]
                {
                    continue;
                }
                let (leaf_len, trunk_len) =
                    (self.window.get(leaf).len(), self.window.get(trunk).len());
                if trunk_len < leaf_len {
                    continue;
                }
                let leaf_flat = self.flatten_nodes(&[leaf]);
                let trunk_flat: Vec<FlatKmer> =
                    self.flatten_nodes(&[trunk])[trunk_len - leaf_len..].to_vec();
                if self.mismatches(&leaf_flat, &trunk_flat) > self.max_mismatch {
                    continue;
                }
                let leaf_weight = self.window.get(leaf).total_weight();
                let trunk_weight: u64 = trunk_flat.iter().map(|f| u64::from(f.weight)).sum();
                if leaf_weight > trunk_weight {
                    continue;
                }
                if leaf_weight == trunk_weight {
                    let ln = self.window.get(leaf);
                    let tn = self.window.get(trunk);
                    if ln.reference && !tn.reference {
                        continue;
                    }
                }
                if !Self::contained(&leaf_flat, &trunk_flat) {
                    continue;
                }
                self.fold(&trunk_flat, &[leaf], &leaf_flat);
                return true;
            }
        }
        false
    }

    /// All pending simple chains from `head`, as node sequences with total
    /// k-mer counts up to the collapse limit
    fn enumerate_paths(&self, head: u32) -> Vec<(Vec<u32>, usize)> {
        let mut found = Vec::new();
        let mut stack = vec![(vec![head], self.window.get(head).len())];
        while let Some((nodes, len)) = stack.pop() {
            if len > self.max_collapse_kmers {
                continue;
            }
            found.push((nodes.clone(), len));
            let tail = *nodes.last().unwrap();
            for next in self.window.successors(tail) {
                if !self.is_pending(next) || nodes.contains(&next) {
                    continue;
                }
                let mut extended = nodes.clone();
                extended.push(next);
                let next_len = len + self.window.get(next).len();
                stack.push((extended, next_len));
            }
        }
        found
    }

    /// Whether `nodes` forms an unbranched chain from `parent` into `conv`
    fn is_unentangled(&self, parent: u32, nodes: &[u32], conv: u32) -> bool {
        for (i, &id) in nodes.iter().enumerate() {
            let expected_pred = if i == 0 { parent } else { nodes[i - 1] };
            if self.window.predecessors(id) != [expected_pred] {
                return false;
            }
            let expected_succ = if i + 1 < nodes.len() {
                nodes[i + 1]
            } else {
                conv
            };
            if self.window.successors(id) != [expected_succ] {
                return false;
            }
        }
        true
    }

    /// Collapse divergent-then-reconvergent path pairs branching at
    /// `parent`
    fn try_full(&mut self, parent: u32) -> bool {
        let arms = self.window.successors(parent);
        if arms.len() < 2 {
            return false;
        }
        for i in 0..arms.len() {
            for j in 0..arms.len() {
                if i == j || !self.is_pending(arms[i]) || !self.is_pending(arms[j]) {
                    continue;
                }
                let left = self.enumerate_paths(arms[i]);
                let right = self.enumerate_paths(arms[j]);
                for (lp, llen) in &left {
                    for (rp, rlen) in &right {
                        if llen != rlen || lp.iter().any(|id| rp.contains(id)) {
                            continue;
                        }
                        let (lt, rt) = (*lp.last().unwrap(), *rp.last().unwrap());
                        let rt_succ = self.window.successors(rt);
                        let lsucc = self.window.successors(lt);
                        let conv = match lsucc.iter().find(|&&s| rt_succ.contains(&s)) {
                            Some(&c) => c,
                            None => continue,
                        };
                        // the loser must be removable without stranding
                        // anything attached to its interior
                        if !self.is_unentangled(parent, lp, conv) {
                            continue;
                        }
                        let flat_l = self.flatten_nodes(lp);
                        let flat_r = self.flatten_nodes(rp);
                        if self.mismatches(&flat_l, &flat_r) > self.max_mismatch {
                            continue;
                        }
                        let lw: u64 = flat_l.iter().map(|f| u64::from(f.weight)).sum();
                        let rw: u64 = flat_r.iter().map(|f| u64::from(f.weight)).sum();
                        let lref = lp.iter().all(|&id| self.window.get(id).reference);
                        let rref = rp.iter().all(|&id| self.window.get(id).reference);
                        let lsum: u128 = flat_l.iter().map(|f| u128::from(f.kmer)).sum();
                        let rsum: u128 = flat_r.iter().map(|f| u128::from(f.kmer)).sum();
                        // the left path plays the loser here; the swapped
                        // pair ordering covers the other outcome
                        match Self::choose_loser(lw, rw, lref, rref, lsum, rsum) {
                            Some(Loser::First) => {}
                            _ => continue,
                        }
                        if !Self::contained(&flat_l, &flat_r) {
                            continue;
                        }
                        let loser_nodes = lp.clone();
                        self.fold(&flat_r, &loser_nodes, &flat_l);
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Run every collapse rule seeded at `id` until the neighbourhood is
    /// stable; true if `id` itself was deleted
    fn collapse_at(&mut self, id: u32) -> bool {
        loop {
            if !self.window.contains(id) {
                return true;
            }
            let changed = match self.mode {
                CollapseMode::LeafBubble => {
                    self.try_bubble(id)
                        || self.try_forward_leaves(id)
                        || self.try_backward_leaves(id)
                }
                CollapseMode::FullPath => self.try_bubble(id) || self.try_full(id),
            };
            if !changed {
                return false;
            }
        }
    }

    fn process_ready(&mut self) {
        loop {
            let Some(&(start, _, id)) = self.pending.first() else {
                break;
            };
            if !self.finished && i64::from(start) + self.horizon >= self.frontier {
                break;
            }
            let deleted = self.collapse_at(id);
            if !deleted {
                self.pending.remove(&self.key(id));
                self.retired.insert((self.window.get(id).start, id));
                self.out.push_back(self.window.get(id).clone());
            }
        }
    }

    fn gc(&mut self) {
        while let Some(&(start, id)) = self.retired.first() {
            if i64::from(start) + 2 * self.horizon >= self.frontier {
                break;
            }
            self.retired.remove(&(start, id));
            self.window.remove(id);
        }
    }
}

impl<I: Iterator<Item = StageResult<KmerPathNode>>> Iterator for CollapseIter<I> {
    type Item = StageResult<KmerPathNode>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(node) = self.out.pop_front() {
                return Some(Ok(node));
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
                        let id = self.window.insert(node);
                        self.pending.insert(self.key(id));
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

    fn path(coder: &KmerCoder, bases: &[u8], start: i32, weight: u32) -> KmerPathNode {
        let k = coder.k();
        let kmers: Vec<u64> = (0..=bases.len() - k)
            .map(|i| coder.encode(&bases[i..i + k]).unwrap())
            .collect();
        let count = kmers.len();
        KmerPathNode {
            kmers,
            start,
            end: start,
            weights: vec![weight; count],
            reference: false,
            collapsed: Vec::new(),
        }
    }

    fn collapse(
        coder: KmerCoder,
        mode: CollapseMode,
        max_mismatch: usize,
        nodes: Vec<KmerPathNode>,
    ) -> Vec<KmerPathNode> {
        CollapseIter::new(
            nodes.into_iter().map(Ok),
            coder,
            mode,
            max_mismatch,
            100,
            1,
            Rc::new(PipelineCounters::default()),
        )
        .map(|r| r.unwrap())
        .collect()
    }

    /// parent AAAC, arms TGGT/AGGT bubble, convergence GGTT
    fn bubble_nodes(coder: &KmerCoder, heavy: u32, light: u32) -> Vec<KmerPathNode> {
        let mut nodes = vec![
            path(coder, b"AAAC", 10, 10),
            path(coder, b"AACTGGT", 11, heavy),
            path(coder, b"AACAGGT", 11, light),
            path(coder, b"GGTT", 15, 10),
        ];
        nodes.sort_by_key(|n| (n.start, n.first_kmer()));
        nodes
    }

    #[test]
    fn test_bubble_collapses_into_heavier_arm() {
        let coder = KmerCoder::new(4).unwrap();
        let out = collapse(coder, CollapseMode::LeafBubble, 1, bubble_nodes(&coder, 9, 4));
        assert_eq!(out.len(), 3);
        let winner = out
            .iter()
            .find(|n| n.len() == 4 && !n.collapsed.is_empty())
            .expect("collapsed winner arm");
        assert_eq!(winner.weights, vec![13; 4]);
        // winner spells the heavier variant
        assert_eq!(winner.first_kmer(), coder.encode(b"AACT").unwrap());
    }

    #[test]
    fn test_bubble_beyond_mismatch_budget_survives() {
        let coder = KmerCoder::new(4).unwrap();
        let out = collapse(coder, CollapseMode::LeafBubble, 0, bubble_nodes(&coder, 9, 4));
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn test_forward_leaf_folds_into_trunk() {
        let coder = KmerCoder::new(4).unwrap();
        // trunk arm continues two k-mers past where the leaf stops
        let mut nodes = vec![
            path(&coder, b"AAAC", 10, 10),
            path(&coder, b"AACTGGTCC", 11, 8),
            path(&coder, b"AACAG", 11, 3),
        ];
        nodes.sort_by_key(|n| (n.start, n.first_kmer()));
        let out = collapse(coder, CollapseMode::LeafBubble, 1, nodes);
        assert_eq!(out.len(), 2);
        let trunk = out.iter().find(|n| n.len() == 6).unwrap();
        assert_eq!(&trunk.weights[..2], &[11, 11]);
        assert_eq!(&trunk.weights[2..], &[8, 8, 8, 8]);
    }

    #[test]
    fn test_full_path_collapse_spans_nodes() {
        let coder = KmerCoder::new(4).unwrap();
        // the light arm is split into two path nodes by an unrelated break;
        // only full-path collapse can fold it
        let mut nodes = vec![
            path(&coder, b"AAAC", 10, 10),
            path(&coder, b"AACTGGT", 11, 9),
            path(&coder, b"AACA", 11, 4),
            path(&coder, b"ACAGGT", 12, 4),
            path(&coder, b"GGTT", 15, 10),
        ];
        nodes.sort_by_key(|n| (n.start, n.first_kmer()));
        let out = collapse(coder, CollapseMode::FullPath, 1, nodes);
        assert_eq!(out.len(), 3);
        let winner = out.iter().find(|n| n.len() == 4).unwrap();
        assert_eq!(winner.weights, vec![13; 4]);
    }

    #[test]
    fn test_full_path_reference_wins_weight_ties() {
        let coder = KmerCoder::new(4).unwrap();
        // tied total weight, reference arm against a split non-reference
        // arm whose k-mer sum is the smaller of the two
        let mut reference_arm = path(&coder, b"AACTGGT", 11, 5);
        reference_arm.reference = true;
        let mut nodes = vec![
            path(&coder, b"AAAC", 10, 10),
            reference_arm,
            path(&coder, b"AACA", 11, 5),
            path(&coder, b"ACAGGT", 12, 5),
            path(&coder, b"GGTT", 15, 10),
        ];
        nodes.sort_by_key(|n| (n.start, n.first_kmer()));
        let out = collapse(coder, CollapseMode::FullPath, 1, nodes);
        assert_eq!(out.len(), 3);
        let winner = out.iter().find(|n| n.len() == 4).unwrap();
        assert!(winner.reference);
        assert_eq!(winner.weights, vec![10; 4]);
    }

    #[test]
    fn test_reference_wins_weight_ties() {
        let coder = KmerCoder::new(4).unwrap();
        let mut nodes = bubble_nodes(&coder, 5, 5);
        for n in &mut nodes {
            if n.first_kmer() == coder.encode(b"AACA").unwrap() {
                n.reference = true;
            }
        }
        let out = collapse(coder, CollapseMode::LeafBubble, 1, nodes);
        let winner = out
            .iter()
            .find(|n| n.len() == 4 && !n.collapsed.is_empty())
            .expect("collapsed winner arm");
        assert!(winner.reference);
        assert_eq!(winner.first_kmer(), coder.encode(b"AACA").unwrap());
    }
}
