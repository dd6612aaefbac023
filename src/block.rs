use rand::rngs::SmallRng;
use rand::{Rng, RngCore, SeedableRng};

use crate::error::ConfigError;

/// A validated, non-empty `[min, max)` range of block lengths in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSize {
    min: usize,
    max: usize,
}

impl BlockSize {
    pub fn new(min: usize, max: usize) -> Result<Self, ConfigError> {
        if max <= min {
            return Err(ConfigError::BlockSize { min, max });
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> usize {
        self.min
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

/// Produces blocks of random, non-compressible bytes.
///
/// Every writer owns one generator, so the random source is never shared between tasks.
/// Uniformly random contents keep the storage engine from compressing the payload, which
/// makes the measured throughput reflect the raw write cost.
#[derive(Debug)]
pub struct BlockGenerator {
    size: BlockSize,
    rng: SmallRng,
}

impl BlockGenerator {
    pub fn new(size: BlockSize) -> Self {
        Self {
            size,
            rng: SmallRng::from_entropy(),
        }
    }

    #[cfg(test)]
    pub fn with_seed(size: BlockSize, seed: u64) -> Self {
        Self {
            size,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// A random non-negative block id, used as the leading key column.
    pub fn block_id(&mut self) -> i64 {
        self.rng.gen_range(0..=i64::MAX)
    }

    pub fn block(&mut self) -> Vec<u8> {
        let len = self.rng.gen_range(self.size.min..self.size.max);
        let mut data = vec![0; len];
        self.rng.fill_bytes(&mut data);
        data
    }
}
