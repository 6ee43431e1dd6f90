use dmesh_types::Address;
use rand::Rng;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SelectionError {
    #[error("No nodes available for selection")]
    NoNodes,

    #[error("Invalid batch size: {0}")]
    InvalidBatchSize(usize),
}

/// Weighted node sampler over a reliability score table.
pub struct NodeSelector {
    /// How often one address may be picked within a batch before it is
    /// removed from the pool.
    reuse_cap: usize,
}

impl NodeSelector {
    pub fn new(reuse_cap: usize) -> Self {
        Self {
            reuse_cap: reuse_cap.max(1),
        }
    }

    /// Sample `batch_size` addresses proportionally to their scores.
    ///
    /// Negative scores are discarded up front. When the batch fits in the
    /// pool, sampling is without replacement with probability mass
    /// redistributed after each pick, except that an address may recur up to
    /// the reuse cap before its permanent removal. A batch larger than the
    /// pool falls back to sampling with replacement.
    pub fn select_nodes<R: Rng>(
        &self,
        scores: &HashMap<Address, f64>,
        batch_size: usize,
        rng: &mut R,
    ) -> Result<Vec<Address>, SelectionError> {
        if batch_size == 0 {
            return Err(SelectionError::InvalidBatchSize(0));
        }

        let mut pool: Vec<(Address, f64)> = scores
            .iter()
            .filter(|(_, score)| **score >= 0.0)
            .map(|(addr, score)| (*addr, *score))
            .collect();
        if pool.is_empty() {
            return Err(SelectionError::NoNodes);
        }
        // Deterministic iteration base for a given table
        pool.sort_by(|a, b| a.0.cmp(&b.0));

        let mut picked = Vec::with_capacity(batch_size);

        if batch_size <= pool.len() {
            let mut counts: HashMap<Address, usize> = HashMap::new();
            while picked.len() < batch_size && !pool.is_empty() {
                let idx = weighted_pick(&pool, rng);
                let (address, _) = pool[idx];
                picked.push(address);

                let count = counts.entry(address).or_insert(0);
                *count += 1;
                if *count >= self.reuse_cap {
                    pool.remove(idx);
                }
            }
        } else {
            for _ in 0..batch_size {
                let idx = weighted_pick(&pool, rng);
                picked.push(pool[idx].0);
            }
        }

        Ok(picked)
    }
}

/// Pick an index proportionally to weight, uniform when total mass is zero.
fn weighted_pick<R: Rng>(pool: &[(Address, f64)], rng: &mut R) -> usize {
    let total: f64 = pool.iter().map(|(_, w)| w.max(0.0)).sum();
    if total <= 0.0 {
        return rng.gen_range(0..pool.len());
    }

    let mut target = rng.gen::<f64>() * total;
    for (idx, (_, weight)) in pool.iter().enumerate() {
        target -= weight.max(0.0);
        if target <= 0.0 {
            return idx;
        }
    }
    pool.len() - 1
}
