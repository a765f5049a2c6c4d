//! Non-reference contig assembly
//!
//! Maintains a sliding-window sub-graph of path nodes, repeatedly extracts
//! the best-scoring non-reference path anchored to the reference, reads out
//! its bases and qualities, then releases every piece of evidence the
//! emitted contig consumed so the remaining window reflects only unexplained
//! support.

use crate::assembly::path_node::KmerPathNode;
use crate::assembly::tracker::{EvidenceTracker, TrackedSupport};
use crate::assembly::window::PathWindow;
use crate::assembly::StageResult;
use crate::core::evidence::BreakendDirection;
use crate::core::kmer::KmerCoder;
use crate::utils::configuration::{AssemblyConfig, MAX_ASSEMBLY_QUAL};
use crate::utils::export::{ExportTracker, PipelineCounters};
use ahash::AHashSet;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;
use tracing::debug;

/// One assembled breakend contig
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssemblyRecord {
    pub reference_index: usize,
    /// Genomic position of the reference base closest to the breakend;
    /// `None` for contigs that could not be anchored
    pub anchor_position: Option<i32>,
    pub direction: BreakendDirection,
    pub base_calls: Vec<u8>,
    pub base_qualities: Vec<u8>,
    /// Leading (forward) or trailing (backward) bases aligned to the
    /// reference
    pub anchored_base_count: usize,
    /// Ids of the evidence consumed by this contig, sorted
    pub supporting_evidence: Vec<String>,
}

/// One k-mer of a chosen contig path, flattened for readout
#[derive(Clone, Copy)]
struct Flat {
    node: u32,
    local: usize,
    kmer: u64,
    weight: u32,
    start: i32,
    end: i32,
    reference: bool,
}

/// Path node stream -> assembled contig stream for one reference contig
pub struct NonReferenceContigAssembler<I> {
    input: I,
    coder: KmerCoder,
    direction: BreakendDirection,
    reference_index: usize,
    tracker: Rc<RefCell<EvidenceTracker>>,
    window: PathWindow,
    all_nodes: BTreeSet<(i32, u64, u32)>,
    nonref: BTreeSet<(i32, u64, u32)>,
    max_evidence_width: i64,
    call_horizon: i64,
    anchor_kmer_cap: usize,
    frontier: i64,
    finished: bool,
    failed: bool,
    export: Option<ExportTracker>,
    counters: Rc<PipelineCounters>,
}

impl<I: Iterator<Item = StageResult<KmerPathNode>>> NonReferenceContigAssembler<I> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        input: I,
        coder: KmerCoder,
        direction: BreakendDirection,
        reference_index: usize,
        config: &AssemblyConfig,
        tracker: Rc<RefCell<EvidenceTracker>>,
        export: Option<ExportTracker>,
        counters: Rc<PipelineCounters>,
    ) -> Self {
        let max_evidence_width = i64::from(config.max_evidence_support_interval_width());
        Self {
            input,
            coder,
            direction,
            reference_index,
            tracker,
            window: PathWindow::new(coder),
            all_nodes: BTreeSet::new(),
            nonref: BTreeSet::new(),
            max_evidence_width,
            call_horizon: max_evidence_width + config.anchor_length as i64,
            anchor_kmer_cap: config.anchor_length.saturating_sub(config.k - 1).max(1),
            frontier: i64::MIN,
            finished: false,
            failed: false,
            export,
            counters,
        }
    }

    fn key(&self, id: u32) -> (i32, u64, u32) {
        let n = self.window.get(id);
        (n.start, n.first_kmer(), id)
    }

    fn insert(&mut self, node: KmerPathNode) {
        let reference = node.reference;
        let id = self.window.insert(node);
        let key = self.key(id);
        self.all_nodes.insert(key);
        if !reference {
            self.nonref.insert(key);
        }
    }

    fn drop_node(&mut self, id: u32) {
        let key = self.key(id);
        self.all_nodes.remove(&key);
        self.nonref.remove(&key);
        self.window.remove(id);
    }

    fn stable(&self, id: u32, horizon: i64) -> bool {
        self.finished || i64::from(self.window.get(id).start) + horizon <= self.frontier
    }

    /// Highest-weight non-reference node that the window has stabilised
    /// around; ties fall to the earlier, smaller k-mer
    fn best_stable_seed(&self) -> Option<u32> {
        self.nonref
            .iter()
            .filter(|&&(_, _, id)| self.stable(id, self.call_horizon))
            .max_by_key(|&&(start, kmer, id)| {
                (
                    self.window.get(id).total_weight(),
                    std::cmp::Reverse(start),
                    std::cmp::Reverse(kmer),
                    std::cmp::Reverse(id),
                )
            })
            .map(|&(_, _, id)| id)
    }

    /// Greedily grow the best contig path around `seed`, genomic left to
    /// right. `None` when the walk reached a node the window has not yet
    /// stabilised around.
    fn build_contig(&self, seed: u32) -> Option<Vec<u32>> {
        let forward = self.direction == BreakendDirection::Forward;
        let mut path = std::collections::VecDeque::from([seed]);
        let mut visited: AHashSet<u32> = std::iter::once(seed).collect();

        // novel side: never re-enters the reference
        loop {
            let terminal = if forward {
                *path.back().unwrap()
            } else {
                *path.front().unwrap()
            };
            let candidates = if forward {
                self.window.successors(terminal)
            } else {
                self.window.predecessors(terminal)
            };
            let best = candidates
                .into_iter()
                .filter(|&c| !visited.contains(&c) && !self.window.get(c).reference)
                .max_by_key(|&c| {
                    let n = self.window.get(c);
                    (
                        n.total_weight(),
                        std::cmp::Reverse(n.first_kmer()),
                        std::cmp::Reverse(n.start),
                        std::cmp::Reverse(c),
                    )
                });
            let Some(next) = best else {
                break;
            };
            if !self.stable(next, self.max_evidence_width) {
                return None;
            }
            visited.insert(next);
            if forward {
                path.push_back(next);
            } else {
                path.push_front(next);
            }
        }

        // anchor side: walk toward the reference, then along it
        let mut ref_run = 0usize;
        loop {
            if ref_run >= self.anchor_kmer_cap {
                break;
            }
            let terminal = if forward {
                *path.front().unwrap()
            } else {
                *path.back().unwrap()
            };
            let terminal_ref = self.window.get(terminal).reference;
            let candidates = if forward {
                self.window.predecessors(terminal)
            } else {
                self.window.successors(terminal)
            };
            let best = candidates
                .into_iter()
                .filter(|&c| !visited.contains(&c))
                .filter(|&c| !terminal_ref || self.window.get(c).reference)
                .max_by_key(|&c| {
                    let n = self.window.get(c);
                    (
                        n.total_weight(),
                        n.reference,
                        std::cmp::Reverse(n.first_kmer()),
                        std::cmp::Reverse(n.start),
                        std::cmp::Reverse(c),
                    )
                });
            let Some(next) = best else {
                break;
            };
            if !self.stable(next, self.max_evidence_width) {
                return None;
            }
            visited.insert(next);
            let node = self.window.get(next);
            ref_run = if node.reference {
                ref_run + node.len()
            } else {
                0
            };
            if forward {
                path.push_front(next);
            } else {
                path.push_back(next);
            }
        }

        Some(path.into())
    }

    fn flatten_path(&self, path: &[u32]) -> Vec<Flat> {
        let mut flat = Vec::new();
        for &id in path {
            let n = self.window.get(id);
            for (local, &kmer) in n.kmers.iter().enumerate() {
                let (start, end) = n.interval_at(local);
                flat.push(Flat {
                    node: id,
                    local,
                    kmer,
                    weight: n.weights[local],
                    start,
                    end,
                    reference: n.reference,
                });
            }
        }
        flat
    }

    /// Assemble the output record for a chosen path and release everything
    /// it consumed
    fn emit(&mut self, path: Vec<u32>) -> AssemblyRecord {
        let k = self.coder.k();
        let forward = self.direction == BreakendDirection::Forward;
        let mut flat = self.flatten_path(&path);

        // truncate the reference anchor to the configured assembly length
        let ref_run = if forward {
            flat.iter().take_while(|f| f.reference).count()
        } else {
            flat.iter().rev().take_while(|f| f.reference).count()
        };
        let kept_ref = ref_run.min(self.anchor_kmer_cap);
        if forward {
            flat.drain(..ref_run - kept_ref);
        } else {
            flat.truncate(flat.len() - (ref_run - kept_ref));
        }

        // base readout: first k-mer in full, one base per step after
        let mut base_calls = self.coder.decode(flat[0].kmer);
        base_calls.reserve(flat.len() - 1);
        for f in &flat[1..] {
            base_calls.push(self.coder.last_base(f.kmer));
        }

        // per-k-mer qualities, padded k-1 toward the breakend-distal end
        let quals: Vec<u8> = flat
            .iter()
            .map(|f| f.weight.min(MAX_ASSEMBLY_QUAL) as u8)
            .collect();
        let mut base_qualities = Vec::with_capacity(base_calls.len());
        if forward {
            base_qualities.extend_from_slice(&quals);
            base_qualities.resize(base_calls.len(), *quals.last().unwrap());
        } else {
            base_qualities.resize(base_calls.len() - quals.len(), quals[0]);
            base_qualities.extend_from_slice(&quals);
        }

        // anchoring: reference k-mer run, or the longest evidence anchor
        // reaching the breakend-proximal terminal k-mer
        let ref_anchor_bases = if kept_ref > 0 { kept_ref + k - 1 } else { 0 };
        let terminal = if forward { flat[0] } else { *flat.last().unwrap() };
        let mut evidence_anchor = self.tracker.borrow().max_anchor_at(
            terminal.kmer,
            terminal.start,
            terminal.end,
            forward,
        );
        for &(offset, alt) in &self.window.get(terminal.node).collapsed {
            if offset as usize == terminal.local {
                evidence_anchor = evidence_anchor.max(self.tracker.borrow().max_anchor_at(
                    alt,
                    terminal.start,
                    terminal.end,
                    forward,
                ));
            }
        }
        let anchored_base_count = ref_anchor_bases
            .max(evidence_anchor)
            .min(base_calls.len());
        let anchor_position = if anchored_base_count == 0 {
            None
        } else if forward {
            Some(flat[0].start + anchored_base_count as i32 - 1)
        } else {
            Some(flat.last().unwrap().start + k as i32 - anchored_base_count as i32)
        };

        // attribute and release supporting evidence
        let occurrences: Vec<(u64, i32, i32)> = path
            .iter()
            .flat_map(|&id| self.window.get(id).occurrences().collect::<Vec<_>>())
            .collect();
        let supporting = self.tracker.borrow().supporting_evidence(occurrences);
        let mut supporting_evidence: Vec<String> = supporting
            .iter()
            .filter_map(|&eid| self.tracker.borrow().evidence(eid))
            .map(|ev| ev.id.clone())
            .collect();
        supporting_evidence.sort();
        for &eid in &supporting {
            let removed = self.tracker.borrow_mut().remove(eid);
            if let Some(removed) = removed {
                for support in removed.supports {
                    self.subtract(&support);
                }
            }
        }
        for id in path {
            if self.window.contains(id) {
                // attribution slippage must not leave the contig callable
                debug!(node = id, "released contig node retained weight; dropping");
                self.drop_node(id);
            }
        }
        self.evict();

        PipelineCounters::bump(&self.counters.contigs);
        if let Some(export) = self.export.as_mut() {
            export.write_row(&self.counters, &self.tracker.borrow());
        }

        AssemblyRecord {
            reference_index: self.reference_index,
            anchor_position,
            direction: self.direction,
            base_calls,
            base_qualities,
            anchored_base_count,
            supporting_evidence,
        }
    }

    /// Remove one released support occurrence from every window node it
    /// backed, deleting nodes that drop to zero weight
    fn subtract(&mut self, support: &TrackedSupport) {
        let hits: Vec<_> = self.window.occurrences_of(support.kmer).to_vec();
        for occ in hits {
            if !self.window.contains(occ.node) {
                continue;
            }
            let node = self.window.get(occ.node);
            let (start, end) = node.interval_at(occ.offset as usize);
            if support.end < start || end < support.start {
                continue;
            }
            if !occ.folded && node.reference != support.reference {
                continue;
            }
            let remaining = {
                let node = self.window.get_mut(occ.node);
                node.weights[occ.offset as usize] =
                    node.weights[occ.offset as usize].saturating_sub(support.weight);
                node.total_weight()
            };
            if remaining == 0 {
                self.drop_node(occ.node);
            }
        }
    }

    /// Drop nodes (and tracked evidence) whose support interval has passed
    /// out of the active window. Anything an uncalled non-reference seed
    /// could still reach is held back.
    fn evict(&mut self) {
        if self.finished || self.frontier == i64::MIN {
            return;
        }
        let mut horizon = self.frontier - self.max_evidence_width;
        if let Some(&(start, _, _)) = self.nonref.first() {
            horizon = horizon.min(i64::from(start) - self.call_horizon);
        }
        while let Some(&(_, _, id)) = self.all_nodes.first() {
            if i64::from(self.window.get(id).end) >= horizon {
                break;
            }
            self.drop_node(id);
        }
        if horizon > i64::from(i32::MIN) && horizon < i64::from(i32::MAX) {
            self.tracker.borrow_mut().evict_before(horizon as i32);
        }
    }

    fn close(&mut self) {
        if let Some(export) = self.export.as_mut() {
            export.finish();
        }
    }
}

impl<I: Iterator<Item = StageResult<KmerPathNode>>> Iterator for NonReferenceContigAssembler<I> {
    type Item = StageResult<AssemblyRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(seed) = self.best_stable_seed() {
                if let Some(path) = self.build_contig(seed) {
                    let record = self.emit(path);
                    return Some(Ok(record));
                }
            } else if self.finished {
                self.close();
                return None;
            }
            match self.input.next() {
                None => {
                    self.finished = true;
                    self.frontier = i64::MAX;
                }
                Some(Err(e)) => {
                    self.failed = true;
                    self.close();
                    return Some(Err(e));
                }
                Some(Ok(node)) => {
                    self.frontier = i64::from(node.start);
                    self.insert(node);
                    self.evict();
                }
            }
        }
    }
}
