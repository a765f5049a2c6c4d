//! Positional de Bruijn graph assembly pipeline
//!
//! A linear chain of lazy, pull-based stages turning a position-sorted
//! evidence stream into assembled breakend contigs:
//!
//! evidence -> support nodes -> aggregate k-mer nodes -> path nodes
//!          -> [collapse -> simplify] -> non-reference contigs
//!
//! Every stage yields `Result` items and fuses after its first error; the
//! outer driver in [`positional`] decides whether an error aborts the run
//! or only the current reference contig.

pub mod aggregate;
pub mod collapse;
pub mod contig_assembler;
pub mod path_node;
pub mod positional;
pub mod simplify;
pub mod support_node;
pub mod tracker;
mod window;

pub use aggregate::{AggregateIter, KmerNode};
pub use collapse::{CollapseIter, CollapseMode};
pub use contig_assembler::{AssemblyRecord, NonReferenceContigAssembler};
pub use path_node::{KmerPathNode, PathNodeIter};
pub use positional::{AssemblyContext, PositionalAssembler};
pub use simplify::SimplifyIter;
pub use support_node::{SupportNode, SupportNodeIter};
pub use tracker::{EvidenceId, EvidenceTracker};

use thiserror::Error;

/// Failure modes of an assembly pipeline
#[derive(Debug, Error)]
pub enum AssemblyError {
    /// Evidence missing required fields or out of sort order; fatal to the
    /// current pipeline
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// A tracker/stage consistency check failed; fatal
    #[error("invariant violation in {stage}: {message}")]
    InvariantViolation {
        stage: &'static str,
        message: String,
    },

    /// Export tracker write failure; the pipeline continues without export
    #[error("export failure: {0}")]
    ResourceFailure(#[from] std::io::Error),

    /// Any other failure while assembling a contig
    #[error("assembly of {contig} failed: {message}")]
    AssemblyFailure { contig: String, message: String },
}

/// Item type flowing between pipeline stages
pub type StageResult<T> = std::result::Result<T, AssemblyError>;
