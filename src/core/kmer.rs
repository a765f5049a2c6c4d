//! 2-bit packed k-mer encoding
//!
//! DNA words of fixed length `k` packed into a single `u64`, two bits per
//! base (A=00, C=01, G=10, T=11), first base in the highest occupied bits.
//! Ambiguous bases refuse to encode, forcing the containing k-mer offset to
//! be skipped upstream.

use anyhow::{anyhow, Result};

/// Smallest supported k-mer size
pub const MIN_K: usize = 4;
/// Largest k-mer size that fits a 64-bit word at 2 bits per base
pub const MAX_K: usize = 31;

/// Encoder/decoder for fixed-length 2-bit packed k-mers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KmerCoder {
    k: usize,
    mask: u64,
}

impl KmerCoder {
    pub fn new(k: usize) -> Result<Self> {
        if !(MIN_K..=MAX_K).contains(&k) {
            return Err(anyhow!(
                "k-mer size {} out of supported range [{}, {}]",
                k,
                MIN_K,
                MAX_K
            ));
        }
        Ok(Self {
            k,
            mask: (1u64 << (2 * k)) - 1,
        })
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// 2-bit code for a single base, `None` for ambiguous bases
    pub fn encode_base(base: u8) -> Option<u64> {
        match base.to_ascii_uppercase() {
            b'A' => Some(0b00),
            b'C' => Some(0b01),
            b'G' => Some(0b10),
            b'T' => Some(0b11),
            _ => None,
        }
    }

    /// Encode exactly `k` bases; `None` if the slice length differs or any
    /// base is ambiguous.
    pub fn encode(&self, bases: &[u8]) -> Option<u64> {
        if bases.len() != self.k {
            return None;
        }
        let mut packed = 0u64;
        for &b in bases {
            packed = (packed << 2) | Self::encode_base(b)?;
        }
        Some(packed)
    }

    /// Decode back to upper-case ASCII bases
    pub fn decode(&self, kmer: u64) -> Vec<u8> {
        let mut bases = vec![0u8; self.k];
        for (i, slot) in bases.iter_mut().enumerate() {
            let bits = (kmer >> (2 * (self.k - 1 - i))) & 0b11;
            *slot = Self::decode_bits(bits);
        }
        bases
    }

    fn decode_bits(bits: u64) -> u8 {
        match bits {
            0b00 => b'A',
            0b01 => b'C',
            0b10 => b'G',
            _ => b'T',
        }
    }

    /// ASCII base contributed by the final position of the k-mer
    pub fn last_base(&self, kmer: u64) -> u8 {
        Self::decode_bits(kmer & 0b11)
    }

    /// Shift one encoded base in at the end, dropping the first base
    pub fn extend(&self, kmer: u64, base_bits: u64) -> u64 {
        ((kmer << 2) | base_bits) & self.mask
    }

    /// The four k-mers reachable by shifting in one base at the end
    pub fn successors(&self, kmer: u64) -> [u64; 4] {
        [
            self.extend(kmer, 0b00),
            self.extend(kmer, 0b01),
            self.extend(kmer, 0b10),
            self.extend(kmer, 0b11),
        ]
    }

    /// The four k-mers reachable by shifting in one base at the front
    pub fn predecessors(&self, kmer: u64) -> [u64; 4] {
        let tail = kmer >> 2;
        let high = 2 * (self.k - 1);
        [
            tail,
            tail | (0b01 << high),
            tail | (0b10 << high),
            tail | (0b11 << high),
        ]
    }
}
