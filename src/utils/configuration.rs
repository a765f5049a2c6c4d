//! Assembly configuration
//!
//! Parameter record for the positional assembly pipeline, with validation,
//! derived window widths, and optional file/environment loading.

use crate::core::kmer::{MAX_K, MIN_K};
use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::warn;

/// Largest base quality written into assembled contigs (matches the FASTQ
/// encodable range used by downstream serialisation)
pub const MAX_ASSEMBLY_QUAL: u32 = 62;

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("k-mer size {0} out of range [{MIN_K}, {MAX_K}]")]
    InvalidKmerSize(usize),
    #[error("concordant fragment size range [{min}, {max}] is inverted")]
    InvalidFragmentSizeRange { min: usize, max: usize },
    #[error("max read length {read} shorter than k-mer size {k}")]
    ReadLengthBelowK { read: usize, k: usize },
    #[error("max path length must be at least 1")]
    InvalidPathLength,
    #[error("max path collapse length {collapse} shorter than k {k}")]
    CollapseLengthBelowK { collapse: usize, k: usize },
    #[error("failed to load configuration: {0}")]
    LoadFailed(#[from] config::ConfigError),
}

/// Error-correction (path collapse) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorCorrectionConfig {
    /// Maximum base mismatches between sibling paths eligible for collapse;
    /// 0 disables the collapse and simplification stages entirely
    pub max_base_mismatch_for_collapse: usize,
    /// Restrict collapse to terminal leaves and simple bubbles
    pub collapse_bubbles_only: bool,
    /// Longest divergent path considered for collapse, in k-mers
    pub max_path_collapse_length: usize,
}

impl Default for ErrorCorrectionConfig {
    fn default() -> Self {
        Self {
            max_base_mismatch_for_collapse: 2,
            collapse_bubbles_only: true,
            max_path_collapse_length: 200,
        }
    }
}

/// Parameters of the positional de Bruijn assembly pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblyConfig {
    /// K-mer size; odd values avoid palindromic k-mers
    pub k: usize,
    /// Reference-anchored bases to include in each assembled contig
    pub anchor_length: usize,
    /// Longest unbranched path node, in k-mers
    pub max_path_length: usize,
    /// Error-correction settings
    pub error_correction: ErrorCorrectionConfig,
    /// Assemble discordant read-pair anchors as well as soft clips
    pub include_pair_anchors: bool,
    /// Bases ignored at each end of a pair anchor read
    pub pair_anchor_mismatch_ignore_end_bases: usize,
    pub min_concordant_fragment_size: usize,
    pub max_concordant_fragment_size: usize,
    pub max_read_length: usize,
    /// Attempt to resume assembly at the next reference contig after a
    /// per-contig failure instead of aborting
    pub attempt_recovery: bool,
    /// Insert tracker-consistency checks between pipeline stages
    pub sanity_checks: bool,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            k: 25,
            anchor_length: 500,
            max_path_length: 200,
            error_correction: ErrorCorrectionConfig::default(),
            include_pair_anchors: true,
            pair_anchor_mismatch_ignore_end_bases: 2,
            min_concordant_fragment_size: 100,
            max_concordant_fragment_size: 600,
            max_read_length: 150,
            attempt_recovery: false,
            sanity_checks: cfg!(debug_assertions),
        }
    }
}

impl AssemblyConfig {
    /// Widest support interval of a single k-mer occurrence, in positions
    pub fn max_kmer_support_interval_width(&self) -> i32 {
        (self.max_concordant_fragment_size - self.min_concordant_fragment_size + 1) as i32
    }

    /// Widest support interval of a whole piece of evidence, in positions
    pub fn max_evidence_support_interval_width(&self) -> i32 {
        self.max_kmer_support_interval_width() + (self.max_read_length - self.k + 2) as i32
    }

    /// Validate parameter consistency, logging non-fatal oddities
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !(MIN_K..=MAX_K).contains(&self.k) {
            return Err(ConfigurationError::InvalidKmerSize(self.k));
        }
        if self.k % 2 == 0 {
            warn!(k = self.k, "even k-mer size allows palindromic k-mers");
        }
        if self.min_concordant_fragment_size > self.max_concordant_fragment_size {
            return Err(ConfigurationError::InvalidFragmentSizeRange {
                min: self.min_concordant_fragment_size,
                max: self.max_concordant_fragment_size,
            });
        }
        if self.max_read_length < self.k {
            return Err(ConfigurationError::ReadLengthBelowK {
                read: self.max_read_length,
                k: self.k,
            });
        }
        if self.max_path_length == 0 {
            return Err(ConfigurationError::InvalidPathLength);
        }
        if self.error_correction.max_base_mismatch_for_collapse > 0
            && self.error_correction.max_path_collapse_length < self.k
        {
            return Err(ConfigurationError::CollapseLengthBelowK {
                collapse: self.error_correction.max_path_collapse_length,
                k: self.k,
            });
        }
        if self.error_correction.max_base_mismatch_for_collapse > 0
            && !self.error_correction.collapse_bubbles_only
        {
            warn!(
                "collapsing all paths is an exponential time operation; assembly may hang \
                 on repetitive sequence"
            );
        }
        Ok(())
    }

    /// Load from a TOML/JSON file with `BREAK_FORGE_`-prefixed environment
    /// overrides
    pub fn from_file(path: &Path) -> Result<Self, ConfigurationError> {
        let settings = Config::builder()
            .add_source(File::from(path))
            .add_source(Environment::with_prefix("BREAK_FORGE").separator("__"))
            .build()?;
        let config: AssemblyConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }
}
