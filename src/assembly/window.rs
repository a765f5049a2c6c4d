//! Windowed path-node sub-graph
//!
//! Arena of path nodes keyed by stable 32-bit ids, with k-mer indexes for
//! derived adjacency. Edges are never stored: a successor is any node
//! whose first k-mer follows the tail k-mer with an overlapping, one-step
//! shifted interval. Used by the collapse, simplify, and contig assembly
//! stages, each with its own windowing policy on top.

use crate::assembly::path_node::KmerPathNode;
use crate::core::kmer::KmerCoder;
use ahash::AHashMap;

/// An offset-level k-mer occurrence inside a window node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Occurrence {
    pub node: u32,
    pub offset: u32,
    /// True when this entry came from a collapse fold rather than the
    /// node's own k-mer chain
    pub folded: bool,
}

pub(crate) struct PathWindow {
    coder: KmerCoder,
    arena: Vec<Option<KmerPathNode>>,
    free: Vec<u32>,
    by_first: AHashMap<u64, Vec<u32>>,
    by_last: AHashMap<u64, Vec<u32>>,
    by_any: AHashMap<u64, Vec<Occurrence>>,
}

impl PathWindow {
    pub fn new(coder: KmerCoder) -> Self {
        Self {
            coder,
            arena: Vec::new(),
            free: Vec::new(),
            by_first: AHashMap::new(),
            by_last: AHashMap::new(),
            by_any: AHashMap::new(),
        }
    }

    pub fn insert(&mut self, node: KmerPathNode) -> u32 {
        debug_assert!(!node.is_empty());
        let id = match self.free.pop() {
            Some(id) => {
                self.arena[id as usize] = Some(node);
                id
            }
            None => {
                self.arena.push(Some(node));
                (self.arena.len() - 1) as u32
            }
        };
        let n = self.arena[id as usize].as_ref().unwrap();
        self.by_first.entry(n.first_kmer()).or_default().push(id);
        self.by_last.entry(n.last_kmer()).or_default().push(id);
        let occurrences: Vec<(u64, u32, bool)> = n
            .kmers
            .iter()
            .enumerate()
            .map(|(i, &k)| (k, i as u32, false))
            .chain(n.collapsed.iter().map(|&(o, k)| (k, o, true)))
            .collect();
        for (kmer, offset, folded) in occurrences {
            self.by_any.entry(kmer).or_default().push(Occurrence {
                node: id,
                offset,
                folded,
            });
        }
        id
    }

    pub fn remove(&mut self, id: u32) -> KmerPathNode {
        let node = self.arena[id as usize].take().unwrap();
        Self::unindex(&mut self.by_first, node.first_kmer(), id);
        Self::unindex(&mut self.by_last, node.last_kmer(), id);
        for (kmer, _, _) in node
            .kmers
            .iter()
            .enumerate()
            .map(|(i, &k)| (k, i as u32, false))
            .chain(node.collapsed.iter().map(|&(o, k)| (k, o, true)))
        {
            if let Some(slots) = self.by_any.get_mut(&kmer) {
                slots.retain(|occ| occ.node != id);
                if slots.is_empty() {
                    self.by_any.remove(&kmer);
                }
            }
        }
        self.free.push(id);
        node
    }

    fn unindex(index: &mut AHashMap<u64, Vec<u32>>, kmer: u64, id: u32) {
        if let Some(ids) = index.get_mut(&kmer) {
            ids.retain(|&x| x != id);
            if ids.is_empty() {
                index.remove(&kmer);
            }
        }
    }

    pub fn get(&self, id: u32) -> &KmerPathNode {
        self.arena[id as usize].as_ref().unwrap()
    }

    pub fn get_mut(&mut self, id: u32) -> &mut KmerPathNode {
        self.arena[id as usize].as_mut().unwrap()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.arena.get(id as usize).is_some_and(Option::is_some)
    }

    pub fn coder(&self) -> &KmerCoder {
        &self.coder
    }

    /// Ids of nodes reachable by one k-mer step from the end of `id`,
    /// sorted for determinism
    pub fn successors(&self, id: u32) -> Vec<u32> {
        let n = self.get(id);
        let len = n.len() as i32;
        let (ts, te) = (n.start + len, n.end + len);
        let mut hits = Vec::new();
        for succ in self.coder.successors(n.last_kmer()) {
            if let Some(ids) = self.by_first.get(&succ) {
                for &cid in ids {
                    if cid == id {
                        continue;
                    }
                    let c = self.get(cid);
                    if c.start <= te && ts <= c.end {
                        hits.push(cid);
                    }
                }
            }
        }
        self.sort_ids(&mut hits);
        hits
    }

    /// Ids of nodes whose end reaches the start of `id` by one k-mer step
    pub fn predecessors(&self, id: u32) -> Vec<u32> {
        let n = self.get(id);
        let mut hits = Vec::new();
        for pred in self.coder.predecessors(n.first_kmer()) {
            if let Some(ids) = self.by_last.get(&pred) {
                for &cid in ids {
                    if cid == id {
                        continue;
                    }
                    let c = self.get(cid);
                    let clen = c.len() as i32;
                    if c.start + clen <= n.end && n.start <= c.end + clen {
                        hits.push(cid);
                    }
                }
            }
        }
        self.sort_ids(&mut hits);
        hits
    }

    fn sort_ids(&self, ids: &mut [u32]) {
        ids.sort_by_key(|&id| {
            let n = self.get(id);
            (n.start, n.first_kmer(), id)
        });
    }

    /// Offset-level occurrences of `kmer` across the window
    pub fn occurrences_of(&self, kmer: u64) -> &[Occurrence] {
        self.by_any.get(&kmer).map_or(&[], Vec::as_slice)
    }

    /// Fold one k-mer's weight from a collapsed path into `winner`
    pub fn fold_kmer(&mut self, winner: u32, offset: usize, kmer: u64, weight: u32) {
        let node = self.arena[winner as usize].as_mut().unwrap();
        node.weights[offset] += weight;
        if node.kmers[offset] != kmer
            && !node.collapsed.contains(&(offset as u32, kmer))
        {
            node.collapsed.push((offset as u32, kmer));
            self.by_any.entry(kmer).or_default().push(Occurrence {
                node: winner,
                offset: offset as u32,
                folded: true,
            });
        }
    }

    /// Append `succ` (removed from the window) onto `id`
    pub fn merge_successor(&mut self, id: u32, succ: u32) {
        let tail = self.remove(succ);
        let base = self.get(id).len() as u32;
        let old_last = self.get(id).last_kmer();
        Self::unindex(&mut self.by_last, old_last, id);
        let node = self.arena[id as usize].as_mut().unwrap();
        node.kmers.extend_from_slice(&tail.kmers);
        node.weights.extend_from_slice(&tail.weights);
        for &(offset, kmer) in &tail.collapsed {
            node.collapsed.push((base + offset, kmer));
        }
        let new_occurrences: Vec<(u64, u32, bool)> = tail
            .kmers
            .iter()
            .enumerate()
            .map(|(i, &k)| (k, base + i as u32, false))
            .chain(tail.collapsed.iter().map(|&(o, k)| (k, base + o, true)))
            .collect();
        for (kmer, offset, folded) in new_occurrences {
            self.by_any.entry(kmer).or_default().push(Occurrence {
                node: id,
                offset,
                folded,
            });
        }
        let last = self.get(id).last_kmer();
        self.by_last.entry(last).or_default().push(id);
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
        let weights = vec![weight; kmers.len()];
        KmerPathNode {
            kmers,
            start,
            end: start,
            weights,
            reference: false,
            collapsed: Vec::new(),
        }
    }

    #[test]
    fn test_derived_adjacency() {
        let coder = KmerCoder::new(4).unwrap();
        let mut window = PathWindow::new(coder);
        let a = window.insert(path(&coder, b"AAAC", 10, 5));
        let b = window.insert(path(&coder, b"AACGT", 11, 5));
        let c = window.insert(path(&coder, b"AACT", 11, 5));
        assert_eq!(window.successors(a), vec![b, c]);
        assert_eq!(window.predecessors(b), vec![a]);
        assert_eq!(window.successors(b), Vec::<u32>::new());
    }

    #[test]
    fn test_adjacency_respects_intervals() {
        let coder = KmerCoder::new(4).unwrap();
        let mut window = PathWindow::new(coder);
        let a = window.insert(path(&coder, b"AAAC", 10, 5));
        // right k-mer, wrong position
        let b = window.insert(path(&coder, b"AACG", 40, 5));
        assert_eq!(window.successors(a), Vec::<u32>::new());
        assert_eq!(window.predecessors(b), Vec::<u32>::new());
    }

    #[test]
    fn test_merge_successor() {
        let coder = KmerCoder::new(4).unwrap();
        let mut window = PathWindow::new(coder);
        let a = window.insert(path(&coder, b"AAACG", 10, 5));
        let b = window.insert(path(&coder, b"ACGT", 12, 7));
        window.merge_successor(a, b);
        let merged = window.get(a);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged.weights, vec![5, 5, 7]);
        assert!(!window.contains(b));
        assert_eq!(window.occurrences_of(coder.encode(b"ACGT").unwrap()).len(), 1);
    }

    #[test]
    fn test_fold_kmer_records_collapse() {
        let coder = KmerCoder::new(4).unwrap();
        let mut window = PathWindow::new(coder);
        let a = window.insert(path(&coder, b"AAACG", 10, 5));
        let alt = coder.encode(b"AAAT").unwrap();
        window.fold_kmer(a, 0, alt, 3);
        assert_eq!(window.get(a).weights[0], 8);
        assert_eq!(window.occurrences_of(alt).len(), 1);
        assert!(window.occurrences_of(alt)[0].folded);
    }
}
