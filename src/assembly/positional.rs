//! Positional assembly driver
//!
//! Assembles non-reference breakend contigs for one breakend direction
//! across every reference contig in a position-sorted evidence stream. One
//! full stage chain is constructed per reference contig; on per-contig
//! failure the driver either re-raises (strict) or resumes at the next
//! reference index (recovery mode, opt-in).

use crate::assembly::aggregate::{AggregateIter, KmerNode};
use crate::assembly::collapse::{CollapseIter, CollapseMode};
use crate::assembly::contig_assembler::{AssemblyRecord, NonReferenceContigAssembler};
use crate::assembly::path_node::{KmerPathNode, PathNodeIter};
use crate::assembly::simplify::SimplifyIter;
use crate::assembly::support_node::SupportNodeIter;
use crate::assembly::tracker::{AggregateAssertion, EvidenceTracker, PathNodeAssertion};
use crate::assembly::StageResult;
use crate::core::evidence::{BreakendDirection, DirectedEvidence};
use crate::core::kmer::KmerCoder;
use crate::utils::configuration::AssemblyConfig;
use crate::utils::export::{ExportTracker, PipelineCounters};
use crate::Result;
use std::cell::RefCell;
use std::iter::Peekable;
use std::path::PathBuf;
use std::rc::Rc;
use tracing::{debug, error, warn};

/// Everything a driver needs beyond the evidence itself
#[derive(Debug, Clone)]
pub struct AssemblyContext {
    pub config: AssemblyConfig,
    /// Reference contig names by index, for logging and export file names
    pub contig_names: Vec<String>,
    /// Directory for per-pipeline progress CSVs; `None` disables export
    pub export_dir: Option<PathBuf>,
}

impl AssemblyContext {
    pub fn new(config: AssemblyConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            contig_names: Vec::new(),
            export_dir: None,
        })
    }

    pub fn with_contig_names(mut self, names: Vec<String>) -> Self {
        self.contig_names = names;
        self
    }

    pub fn with_export_dir(mut self, dir: PathBuf) -> Self {
        self.export_dir = Some(dir);
        self
    }

    pub fn contig_name(&self, reference_index: usize) -> String {
        self.contig_names
            .get(reference_index)
            .cloned()
            .unwrap_or_else(|| reference_index.to_string())
    }
}

/// Silently drops evidence whose breakend direction differs from the
/// pipeline's
struct DirectionFilter<I> {
    input: I,
    direction: BreakendDirection,
}

impl<I: Iterator<Item = DirectedEvidence>> Iterator for DirectionFilter<I> {
    type Item = DirectedEvidence;

    fn next(&mut self) -> Option<Self::Item> {
        self.input
            .by_ref()
            .find(|evidence| evidence.direction == self.direction)
    }
}

type SharedEvidence<I> = Rc<RefCell<Peekable<DirectionFilter<I>>>>;

/// Restricts the shared evidence stream to a single reference index
struct ReferenceIndexGate<I: Iterator<Item = DirectedEvidence>> {
    shared: SharedEvidence<I>,
    reference_index: usize,
}

impl<I: Iterator<Item = DirectedEvidence>> Iterator for ReferenceIndexGate<I> {
    type Item = DirectedEvidence;

    fn next(&mut self) -> Option<Self::Item> {
        let mut input = self.shared.borrow_mut();
        if input.peek()?.reference_index != self.reference_index {
            return None;
        }
        input.next()
    }
}

type PathNodeStream = Box<dyn Iterator<Item = StageResult<KmerPathNode>>>;
type ContigPipeline = NonReferenceContigAssembler<PathNodeStream>;

/// Lazy iterator of assembled contigs over all reference contigs, for one
/// breakend direction
pub struct PositionalAssembler<I: Iterator<Item = DirectedEvidence>> {
    shared: SharedEvidence<I>,
    context: AssemblyContext,
    direction: BreakendDirection,
    current: Option<ContigPipeline>,
    current_reference_index: usize,
    recovery_spent: bool,
    done: bool,
}

impl<I: Iterator<Item = DirectedEvidence> + 'static> PositionalAssembler<I> {
    pub fn new(evidence: I, context: AssemblyContext, direction: BreakendDirection) -> Self {
        let filtered = DirectionFilter {
            input: evidence,
            direction,
        };
        Self {
            shared: Rc::new(RefCell::new(filtered.peekable())),
            context,
            direction,
            current: None,
            current_reference_index: 0,
            recovery_spent: false,
            done: false,
        }
    }

    /// Build the full stage chain for the reference index at the head of
    /// the stream
    fn create_assembler(&mut self, reference_index: usize) -> ContigPipeline {
        let config = &self.context.config;
        let contig_name = self.context.contig_name(reference_index);
        debug!(contig = %contig_name, direction = %self.direction, "starting assembly pipeline");
        let coder = KmerCoder::new(config.k).expect("validated k");
        let tracker = Rc::new(RefCell::new(EvidenceTracker::new(config.k)));
        let counters = Rc::new(PipelineCounters::default());
        let max_kmer_width = config.max_kmer_support_interval_width();

        let gate = ReferenceIndexGate {
            shared: Rc::clone(&self.shared),
            reference_index,
        };
        let support = SupportNodeIter::new(
            gate,
            coder,
            config,
            Rc::clone(&tracker),
            Rc::clone(&counters),
        );
        let aggregate = AggregateIter::new(support, Rc::clone(&counters));
        let aggregates: Box<dyn Iterator<Item = StageResult<KmerNode>>> = if config.sanity_checks {
            Box::new(AggregateAssertion::new(aggregate, Rc::clone(&tracker)))
        } else {
            Box::new(aggregate)
        };

        let paths = PathNodeIter::new(
            aggregates,
            coder,
            config.max_path_length,
            max_kmer_width,
            Rc::clone(&counters),
        );
        let mut path_nodes: PathNodeStream = if config.sanity_checks {
            Box::new(PathNodeAssertion::new(
                paths,
                Rc::clone(&tracker),
                "PathNodeStage",
                true,
                config.max_path_length,
            ))
        } else {
            Box::new(paths)
        };

        let correction = &config.error_correction;
        if correction.max_base_mismatch_for_collapse > 0 {
            let mode = if correction.collapse_bubbles_only {
                CollapseMode::LeafBubble
            } else {
                warn!(
                    "collapsing all paths is an exponential time operation; assembly may \
                     hang on repetitive sequence"
                );
                CollapseMode::FullPath
            };
            path_nodes = Box::new(CollapseIter::new(
                path_nodes,
                coder,
                mode,
                correction.max_base_mismatch_for_collapse,
                correction.max_path_collapse_length,
                max_kmer_width,
                Rc::clone(&counters),
            ));
            if config.sanity_checks {
                path_nodes = Box::new(PathNodeAssertion::new(
                    path_nodes,
                    Rc::clone(&tracker),
                    "CollapseStage",
                    false,
                    config.max_path_length,
                ));
            }
            path_nodes = Box::new(SimplifyIter::new(
                path_nodes,
                coder,
                config.max_path_length,
                max_kmer_width,
                Rc::clone(&counters),
            ));
            if config.sanity_checks {
                path_nodes = Box::new(PathNodeAssertion::new(
                    path_nodes,
                    Rc::clone(&tracker),
                    "SimplifyStage",
                    false,
                    config.max_path_length,
                ));
            }
        }

        let export = self.context.export_dir.as_ref().and_then(|dir| {
            match ExportTracker::create(dir, &contig_name, self.direction) {
                Ok(tracker) => Some(tracker),
                Err(e) => {
                    debug!(error = %e, "progress export unavailable");
                    None
                }
            }
        });

        NonReferenceContigAssembler::new(
            path_nodes,
            coder,
            self.direction,
            reference_index,
            config,
            tracker,
            export,
            counters,
        )
    }

    /// Discard the rest of the failed reference contig and report where
    /// assembly will resume
    fn skip_to_next_reference(&mut self, failed_index: usize) {
        let mut input = self.shared.borrow_mut();
        while input
            .peek()
            .is_some_and(|e| e.reference_index == failed_index)
        {
            input.next();
        }
        match input.peek() {
            Some(next) => error!(
                contig = %self.context.contig_name(next.reference_index),
                position = next.start,
                "attempting recovery by resuming assembly at next reference contig"
            ),
            None => error!("no further evidence; assembly ends after failure"),
        }
    }
}

impl<I: Iterator<Item = DirectedEvidence> + 'static> Iterator for PositionalAssembler<I> {
    type Item = StageResult<AssemblyRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if self.current.is_none() {
                let reference_index = self.shared.borrow_mut().peek()?.reference_index;
                self.current_reference_index = reference_index;
                self.current = Some(self.create_assembler(reference_index));
            }
            match self.current.as_mut().unwrap().next() {
                Some(Ok(record)) => {
                    self.recovery_spent = false;
                    return Some(Ok(record));
                }
                Some(Err(e)) => {
                    self.current = None;
                    let contig = self.context.contig_name(self.current_reference_index);
                    if !self.context.config.attempt_recovery || self.recovery_spent {
                        error!(contig = %contig, error = %e, "fatal assembly error");
                        self.done = true;
                        return Some(Err(e));
                    }
                    error!(contig = %contig, error = %e, "assembly failed");
                    self.recovery_spent = true;
                    self.skip_to_next_reference(self.current_reference_index);
                }
                None => {
                    // contig exhausted without failure; the next contig gets
                    // its own recovery chance even if it emitted nothing
                    self.recovery_spent = false;
                    self.current = None;
                }
            }
        }
    }
}

/// Run the forward and backward pipelines of one evidence set in parallel.
/// The pipelines share no mutable state; rayon forks one task per
/// direction.
pub fn assemble_both_directions(
    evidence: Vec<DirectedEvidence>,
    context: &AssemblyContext,
) -> Result<(Vec<AssemblyRecord>, Vec<AssemblyRecord>)> {
    let collect = |direction: BreakendDirection| -> Result<Vec<AssemblyRecord>> {
        let assembler =
            PositionalAssembler::new(evidence.clone().into_iter(), context.clone(), direction);
        let mut records = Vec::new();
        for item in assembler {
            records.push(item.map_err(crate::Error::from)?);
        }
        Ok(records)
    };
    let (forward, backward) = rayon::join(
        || collect(BreakendDirection::Forward),
        || collect(BreakendDirection::Backward),
    );
    Ok((forward?, backward?))
}
