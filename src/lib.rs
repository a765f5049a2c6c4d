//! # BreakForge - Breakend Contig Assembly
//!
//! A streaming positional de Bruijn graph assembler for structural-variant
//! breakend contigs. Converts a position-sorted stream of directed evidence
//! (soft-clipped read tails and discordant read-pair anchors) into assembled
//! non-reference contigs, one per distinct breakend region, without ever
//! materialising the full de Bruijn graph in memory.

pub mod assembly;
pub mod core;
pub mod utils;

// Re-export commonly used types at crate level
pub use crate::assembly::contig_assembler::AssemblyRecord;
pub use crate::assembly::positional::{AssemblyContext, PositionalAssembler};
pub use crate::assembly::AssemblyError;
pub use crate::core::evidence::{BreakendDirection, DirectedEvidence, EvidenceKind};
pub use crate::utils::configuration::AssemblyConfig;

/// Result type used throughout the crate
pub type Result<T> = anyhow::Result<T>;

/// Error type used throughout the crate
pub type Error = anyhow::Error;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crate_result_type() -> Result<()> {
        let success: Result<i32> = Ok(42);
        assert_eq!(success?, 42);

        let error: Result<i32> = Err(anyhow::anyhow!("test error"));
        assert!(error.is_err());
        Ok(())
    }

    #[test]
    fn test_config_reexport() {
        let config = AssemblyConfig::default();
        assert!(config.validate().is_ok());
    }
}
