//! Per-pipeline progress export
//!
//! When an export directory is configured, each `(contig, direction)`
//! pipeline writes one CSV of per-stage counters, one row per emitted
//! contig. Export failures never fail assembly: the first write error is
//! logged at debug level and the tracker goes quiet.

use crate::assembly::tracker::EvidenceTracker;
use crate::core::evidence::BreakendDirection;
use anyhow::{Context, Result};
use std::cell::Cell;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::debug;

/// Shared per-stage item counters for one pipeline
#[derive(Debug, Default)]
pub struct PipelineCounters {
    pub support_nodes: Cell<u64>,
    pub aggregate_nodes: Cell<u64>,
    pub path_nodes: Cell<u64>,
    pub collapsed_paths: Cell<u64>,
    pub simplified_paths: Cell<u64>,
    pub contigs: Cell<u64>,
}

impl PipelineCounters {
    pub fn bump(cell: &Cell<u64>) {
        cell.set(cell.get() + 1);
    }
}

/// CSV progress writer for one `(contig, direction)` pipeline
pub struct ExportTracker {
    writer: Option<BufWriter<File>>,
}

impl ExportTracker {
    /// Open `positional-<contigName>-<direction>.csv` in `dir` and write
    /// the header row
    pub fn create(dir: &Path, contig_name: &str, direction: BreakendDirection) -> Result<Self> {
        let path = dir.join(format!("positional-{contig_name}-{direction}.csv"));
        let file = File::create(&path)
            .with_context(|| format!("creating export file {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        writeln!(
            writer,
            "contigs,supportNodes,aggregateNodes,pathNodes,collapsedPaths,simplifiedPaths,\
             trackedEvidence,trackedSupports,liveWeight"
        )
        .with_context(|| format!("writing export header to {}", path.display()))?;
        Ok(Self {
            writer: Some(writer),
        })
    }

    /// Append one counter snapshot; disables itself on the first failure
    pub fn write_row(&mut self, counters: &PipelineCounters, tracker: &EvidenceTracker) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        let result = writeln!(
            writer,
            "{},{},{},{},{},{},{},{},{}",
            counters.contigs.get(),
            counters.support_nodes.get(),
            counters.aggregate_nodes.get(),
            counters.path_nodes.get(),
            counters.collapsed_paths.get(),
            counters.simplified_paths.get(),
            tracker.tracked_evidence(),
            tracker.tracked_supports(),
            tracker.live_weight(),
        );
        if let Err(e) = result {
            debug!(error = %e, "progress export write failed; disabling export");
            self.writer = None;
        }
    }

    /// Flush buffered rows; further writes remain possible
    pub fn finish(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = writer.flush() {
                debug!(error = %e, "progress export flush failed");
                self.writer = None;
            }
        }
    }
}

impl Drop for ExportTracker {
    fn drop(&mut self) {
        self.finish();
    }
}
