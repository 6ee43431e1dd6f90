use bitvec::prelude::*;
use blake3::Hasher;
use dmesh_types::{Address, FilterProof};
use std::f64::consts::LN_2;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("Malformed filter proof: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, FilterError>;

/// Compact probabilistic membership filter keyed to a single node address.
/// The relay tests candidate recipients against it without learning the
/// plaintext address; rare false-positive deliveries are rejected later by
/// the authenticity check.
#[derive(Clone, Debug)]
pub struct AddressFilter {
    bits: BitVec<u8, Lsb0>,
    hash_functions: u8,
}

impl AddressFilter {
    /// Build a filter sized for `capacity` items at `fp_rate`, empty.
    pub fn new(capacity: usize, fp_rate: f64) -> Self {
        let capped_fp = fp_rate.clamp(1e-6, 0.25);
        let cap = capacity.max(1);
        let m = ((-1.0 * (cap as f64) * capped_fp.ln()) / (LN_2 * LN_2)).ceil() as usize;
        let k = ((m as f64 / cap as f64) * LN_2).ceil().max(1.0) as u8;
        // Whole bytes, so the serialized proof restores to the same modulus.
        let m = m.max(8).div_ceil(8) * 8;
        Self {
            bits: bitvec![u8, Lsb0; 0; m],
            hash_functions: k,
        }
    }

    /// Filter for one address, sized to the address length at the given
    /// false-positive rate.
    pub fn for_address(address: &Address, fp_rate: f64) -> Self {
        let mut filter = Self::new(address.as_bytes().len(), fp_rate);
        filter.insert(address.as_bytes());
        filter
    }

    pub fn insert(&mut self, value: &[u8]) {
        for index in self.indexes(value) {
            self.bits.set(index, true);
        }
    }

    pub fn contains(&self, value: &[u8]) -> bool {
        self.indexes(value)
            .into_iter()
            .all(|idx| self.bits.get(idx).map(|bit| *bit).unwrap_or(false))
    }

    pub fn contains_address(&self, address: &Address) -> bool {
        self.contains(address.as_bytes())
    }

    /// Serialized form embedded in the task envelope.
    pub fn proof(&self) -> FilterProof {
        FilterProof {
            hex: hex::encode(self.bits.as_raw_slice()),
            hashes: self.hash_functions,
        }
    }

    pub fn from_proof(proof: &FilterProof) -> Result<Self> {
        if proof.hashes == 0 {
            return Err(FilterError::Malformed("zero hash functions".into()));
        }
        let bytes = hex::decode(&proof.hex).map_err(|e| FilterError::Malformed(e.to_string()))?;
        if bytes.is_empty() {
            return Err(FilterError::Malformed("empty bit array".into()));
        }
        Ok(Self {
            bits: BitVec::from_vec(bytes),
            hash_functions: proof.hashes,
        })
    }

    pub fn bit_len(&self) -> usize {
        self.bits.len()
    }

    pub fn hash_functions(&self) -> u8 {
        self.hash_functions
    }

    fn indexes(&self, value: &[u8]) -> Vec<usize> {
        (0..self.hash_functions)
            .map(|salt| {
                let mut hasher = Hasher::new();
                hasher.update(&salt.to_le_bytes());
                hasher.update(value);
                let digest = hasher.finalize();
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&digest.as_bytes()[..8]);
                (u64::from_le_bytes(buf) as usize) % self.bits.len().max(1)
            })
            .collect()
    }
}
