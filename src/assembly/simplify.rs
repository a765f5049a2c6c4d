//! Post-collapse path simplification
//!
//! Collapse deletes nodes, so adjacent survivors may satisfy the
//! non-branching condition again. This stage re-merges such pairs into
//! longer path nodes, still bounded by the maximum path length and the
//! support interval width.

use crate::assembly::path_node::KmerPathNode;
use crate::assembly::window::PathWindow;
use crate::assembly::StageResult;
use crate::core::kmer::KmerCoder;
use crate::utils::export::PipelineCounters;
use std::collections::{BTreeSet, VecDeque};
use std::rc::Rc;

/// Path node stream -> re-merged path node stream
pub struct SimplifyIter<I> {
    input: I,
    window: PathWindow,
    max_path_length: usize,
    max_interval_positions: i32,
    horizon: i64,
    pending: BTreeSet<(i32, u64, u32)>,
    retired: BTreeSet<(i32, u32)>,
    out: VecDeque<KmerPathNode>,
    frontier: i64,
    finished: bool,
    failed: bool,
    counters: Rc<PipelineCounters>,
}

impl<I: Iterator<Item = StageResult<KmerPathNode>>> SimplifyIter<I> {
    pub fn new(
        input: I,
        coder: KmerCoder,
        max_path_length: usize,
        max_interval_positions: i32,
        counters: Rc<PipelineCounters>,
    ) -> Self {
        Self {
            input,
            window: PathWindow::new(coder),
            max_path_length,
            max_interval_positions,
            horizon: max_path_length as i64 + max_interval_positions as i64 + 2,
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

    /// Greedily absorb sole successors of `id` while the chain conditions
    /// hold again
    fn simplify(&mut self, id: u32) {
        loop {
            let n = self.window.get(id);
            if n.width() > self.max_interval_positions {
                return;
            }
            let succs = self.window.successors(id);
            let &[next] = succs.as_slice() else {
                return;
            };
            if !self.pending.contains(&self.key(next)) {
                return;
            }
            let m = self.window.get(next);
            let n = self.window.get(id);
            let shift = n.len() as i32;
            if m.reference != n.reference
                || m.start != n.start + shift
                || m.end != n.end + shift
                || n.len() + m.len() > self.max_path_length
            {
                return;
            }
            if self.window.predecessors(next) != [id] {
                return;
            }
            self.pending.remove(&self.key(next));
            self.window.merge_successor(id, next);
            PipelineCounters::bump(&self.counters.simplified_paths);
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
            self.simplify(id);
            self.pending.remove(&self.key(id));
            self.retired.insert((self.window.get(id).start, id));
            self.out.push_back(self.window.get(id).clone());
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

impl<I: Iterator<Item = StageResult<KmerPathNode>>> Iterator for SimplifyIter<I> {
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
