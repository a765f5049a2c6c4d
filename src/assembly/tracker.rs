//! Evidence tracking across pipeline stages
//!
//! The tracker is the pipeline's memory of which evidence produced which
//! k-mer support. Every support node is registered as it is generated;
//! aggregate and path nodes are attributed by interval queries against the
//! registered support, so attribution survives node rewrites without any
//! per-stage re-registration. Removal returns the released support so the
//! contig assembler can subtract it from its window.

use crate::assembly::aggregate::KmerNode;
use crate::assembly::path_node::KmerPathNode;
use crate::assembly::support_node::SupportNode;
use crate::assembly::{AssemblyError, StageResult};
use crate::core::evidence::{BreakendDirection, DirectedEvidence};
use ahash::AHashMap;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

/// Stable identity of a piece of evidence within one pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EvidenceId(pub u32);

/// One registered k-mer occurrence of a piece of evidence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedSupport {
    pub kmer: u64,
    pub start: i32,
    pub end: i32,
    pub weight: u32,
    pub reference: bool,
    pub offset: u32,
}

struct TrackedEvidence {
    evidence: Rc<DirectedEvidence>,
    supports: Vec<TrackedSupport>,
}

/// Evidence removed from the tracker, with the support it held
pub struct RemovedEvidence {
    pub evidence: Rc<DirectedEvidence>,
    pub supports: Vec<TrackedSupport>,
}

/// Bidirectional evidence <-> k-mer support relation for one pipeline
pub struct EvidenceTracker {
    k: usize,
    entries: AHashMap<u32, TrackedEvidence>,
    // (evidence id, support index); stale pairs are skipped on query and
    // compacted on eviction
    by_kmer: AHashMap<u64, Vec<(u32, u32)>>,
    next_id: u32,
    registered_weight: u64,
    removed_weight: u64,
}

impl EvidenceTracker {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            entries: AHashMap::new(),
            by_kmer: AHashMap::new(),
            next_id: 0,
            registered_weight: 0,
            removed_weight: 0,
        }
    }

    /// Start tracking a piece of evidence, assigning its pipeline identity
    pub fn insert_evidence(&mut self, evidence: Rc<DirectedEvidence>) -> EvidenceId {
        let id = EvidenceId(self.next_id);
        self.next_id += 1;
        self.entries.insert(
            id.0,
            TrackedEvidence {
                evidence,
                supports: Vec::new(),
            },
        );
        id
    }

    /// Register one support node produced for already-inserted evidence
    pub fn register(&mut self, node: &SupportNode) {
        let entry = self
            .entries
            .get_mut(&node.evidence.0)
            .expect("support registered for untracked evidence");
        let idx = entry.supports.len() as u32;
        entry.supports.push(TrackedSupport {
            kmer: node.kmer,
            start: node.start,
            end: node.end,
            weight: node.weight,
            reference: node.reference,
            offset: node.offset,
        });
        self.by_kmer
            .entry(node.kmer)
            .or_default()
            .push((node.evidence.0, idx));
        self.registered_weight += u64::from(node.weight);
    }

    pub fn contains(&self, id: EvidenceId) -> bool {
        self.entries.contains_key(&id.0)
    }

    pub fn evidence(&self, id: EvidenceId) -> Option<Rc<DirectedEvidence>> {
        self.entries.get(&id.0).map(|e| Rc::clone(&e.evidence))
    }

    /// Stop tracking `id`, returning its evidence and released support
    pub fn remove(&mut self, id: EvidenceId) -> Option<RemovedEvidence> {
        let entry = self.entries.remove(&id.0)?;
        for s in &entry.supports {
            self.removed_weight += u64::from(s.weight);
        }
        Some(RemovedEvidence {
            evidence: entry.evidence,
            supports: entry.supports,
        })
    }

    /// Evidence whose registered support overlaps any of the given
    /// `(kmer, start, end)` occurrences
    pub fn supporting_evidence<I>(&self, occurrences: I) -> BTreeSet<EvidenceId>
    where
        I: IntoIterator<Item = (u64, i32, i32)>,
    {
        let mut found = BTreeSet::new();
        for (kmer, start, end) in occurrences {
            let Some(slots) = self.by_kmer.get(&kmer) else {
                continue;
            };
            for &(eid, idx) in slots {
                if found.contains(&EvidenceId(eid)) {
                    continue;
                }
                let Some(entry) = self.entries.get(&eid) else {
                    continue;
                };
                let s = &entry.supports[idx as usize];
                if s.start <= end && start <= s.end {
                    found.insert(EvidenceId(eid));
                }
            }
        }
        found
    }

    /// Longest evidence anchor attached to the given contig-terminal k-mer
    /// occurrence. `head` selects forward-style anchors (evidence offset 0);
    /// otherwise backward-style anchors at the evidence's final offset.
    pub fn max_anchor_at(&self, kmer: u64, start: i32, end: i32, head: bool) -> usize {
        let mut best = 0;
        let Some(slots) = self.by_kmer.get(&kmer) else {
            return 0;
        };
        for &(eid, idx) in slots {
            let Some(entry) = self.entries.get(&eid) else {
                continue;
            };
            let s = &entry.supports[idx as usize];
            if s.end < start || end < s.start {
                continue;
            }
            let ev = &entry.evidence;
            let wanted = if head {
                ev.direction == BreakendDirection::Forward && s.offset == 0
            } else {
                ev.direction == BreakendDirection::Backward
                    && s.offset as usize + 1 == ev.kmer_count(self.k)
            };
            if wanted {
                best = best.max(ev.anchor_length);
            }
        }
        best
    }

    /// Drop evidence whose entire support lies before `pos`, compacting the
    /// k-mer index
    pub fn evict_before(&mut self, pos: i32) -> usize {
        let stale: Vec<u32> = self
            .entries
            .iter()
            .filter(|(_, e)| e.supports.iter().all(|s| s.end < pos))
            .map(|(&id, _)| id)
            .collect();
        for id in &stale {
            self.remove(EvidenceId(*id));
        }
        if !stale.is_empty() {
            let entries = &self.entries;
            self.by_kmer.retain(|_, slots| {
                slots.retain(|(eid, _)| entries.contains_key(eid));
                !slots.is_empty()
            });
        }
        stale.len()
    }

    pub fn tracked_evidence(&self) -> usize {
        self.entries.len()
    }

    pub fn tracked_supports(&self) -> usize {
        self.entries.values().map(|e| e.supports.len()).sum()
    }

    /// Total registered weight minus removed weight
    pub fn live_weight(&self) -> u64 {
        self.registered_weight - self.removed_weight
    }

    pub fn removed_weight(&self) -> u64 {
        self.removed_weight
    }

    /// Verify an aggregate node's weight equals the summed support it covers
    pub fn check_aggregate(&self, node: &KmerNode) -> Result<(), String> {
        let mut weight = 0u64;
        if let Some(slots) = self.by_kmer.get(&node.kmer) {
            for &(eid, idx) in slots {
                let Some(entry) = self.entries.get(&eid) else {
                    continue;
                };
                let s = &entry.supports[idx as usize];
                if s.reference == node.reference && s.start >= node.start && s.end <= node.end {
                    weight += u64::from(s.weight);
                }
            }
        }
        if weight != u64::from(node.weight) {
            return Err(format!(
                "aggregate ({:x}@[{},{}] ref={}) weight {} but tracked support sums to {}",
                node.kmer, node.start, node.end, node.reference, node.weight, weight
            ));
        }
        Ok(())
    }

    /// Verify a freshly built path node's per-offset weights against
    /// tracked support
    pub fn check_path(&self, node: &KmerPathNode) -> Result<(), String> {
        for (i, (&kmer, &expected)) in node.kmers.iter().zip(node.weights.iter()).enumerate() {
            let (start, end) = node.interval_at(i);
            let mut weight = 0u64;
            if let Some(slots) = self.by_kmer.get(&kmer) {
                for &(eid, idx) in slots {
                    let Some(entry) = self.entries.get(&eid) else {
                        continue;
                    };
                    let s = &entry.supports[idx as usize];
                    if s.reference == node.reference && s.start >= start && s.end <= end {
                        weight += u64::from(s.weight);
                    }
                }
            }
            if weight != u64::from(expected) {
                return Err(format!(
                    "path offset {} ({:x}@[{},{}]) weight {} but tracked support sums to {}",
                    i, kmer, start, end, expected, weight
                ));
            }
        }
        Ok(())
    }
}

/// Pass-through stage validating aggregate nodes against the tracker
pub struct AggregateAssertion<I> {
    input: I,
    tracker: Rc<RefCell<EvidenceTracker>>,
    failed: bool,
}

impl<I> AggregateAssertion<I> {
    pub fn new(input: I, tracker: Rc<RefCell<EvidenceTracker>>) -> Self {
        Self {
            input,
            tracker,
            failed: false,
        }
    }
}

impl<I: Iterator<Item = StageResult<KmerNode>>> Iterator for AggregateAssertion<I> {
    type Item = StageResult<KmerNode>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.input.next()? {
            Ok(node) => {
                if let Err(message) = self.tracker.borrow().check_aggregate(&node) {
                    self.failed = true;
                    return Some(Err(AssemblyError::InvariantViolation {
                        stage: "AggregateStage",
                        message,
                    }));
                }
                Some(Ok(node))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Pass-through stage validating path nodes against the tracker
///
/// Weight checks only hold before collapse folds sibling support together,
/// so post-collapse layers validate ordering and shape only.
pub struct PathNodeAssertion<I> {
    input: I,
    tracker: Rc<RefCell<EvidenceTracker>>,
    stage: &'static str,
    check_weights: bool,
    max_path_length: usize,
    last_key: Option<(i32, u64)>,
    failed: bool,
}

impl<I> PathNodeAssertion<I> {
    pub fn new(
        input: I,
        tracker: Rc<RefCell<EvidenceTracker>>,
        stage: &'static str,
        check_weights: bool,
        max_path_length: usize,
    ) -> Self {
        Self {
            input,
            tracker,
            stage,
            check_weights,
            max_path_length,
            last_key: None,
            failed: false,
        }
    }

    fn check(&mut self, node: &KmerPathNode) -> Result<(), String> {
        if node.kmers.is_empty() || node.kmers.len() != node.weights.len() {
            return Err("path node with inconsistent kmer/weight vectors".to_string());
        }
        if node.kmers.len() > self.max_path_length {
            return Err(format!(
                "path node of {} kmers exceeds maximum {}",
                node.kmers.len(),
                self.max_path_length
            ));
        }
        if node.end < node.start {
            return Err(format!("inverted interval [{}, {}]", node.start, node.end));
        }
        let key = (node.start, node.first_kmer());
        if let Some(last) = self.last_key {
            if key < last {
                return Err(format!(
                    "emission order regressed from {:?} to {:?}",
                    last, key
                ));
            }
        }
        self.last_key = Some(key);
        if self.check_weights {
            self.tracker.borrow().check_path(node)?;
        }
        Ok(())
    }
}

impl<I: Iterator<Item = StageResult<KmerPathNode>>> Iterator for PathNodeAssertion<I> {
    type Item = StageResult<KmerPathNode>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.input.next()? {
            Ok(node) => {
                if let Err(message) = self.check(&node) {
                    self.failed = true;
                    return Some(Err(AssemblyError::InvariantViolation {
                        stage: self.stage,
                        message,
                    }));
                }
                Some(Ok(node))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
