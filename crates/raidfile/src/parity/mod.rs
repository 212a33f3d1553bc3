//! Group parity: computing parity blocks and rebuilding lost blocks.
//!
//! A single parity stripe holds the XOR of the data blocks of each group. Two parity stripes
//! hold a systematic Reed-Solomon code over GF(2^8), so any two lost blocks of a group can be
//! rebuilt.

mod block;

pub use block::Block;

use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::error::{LayoutError, Result};

enum Codec {
    Xor,
    ReedSolomon(ReedSolomon),
}

/// ParityEngine computes and consumes the parity of one redundancy group.
pub struct ParityEngine {
    data: usize,
    parity: usize,
    codec: Codec,
}

impl ParityEngine {
    /// Build an engine for `data` data blocks and `parity` parity blocks per group.
    ///
    /// # Errors
    /// Returns [`LayoutError::Config`] if there are no data blocks or the parity count is not
    /// 1 or 2.
    pub fn new(data: usize, parity: usize) -> Result<Self> {
        if data == 0 {
            return Err(LayoutError::Config("parity needs at least one data block".to_string()));
        }
        let codec = match parity {
            1 => Codec::Xor,
            2 => Codec::ReedSolomon(ReedSolomon::new(data, parity).map_err(|e| {
                LayoutError::Config(format!("failed to create Reed-Solomon codec: {e}"))
            })?),
            n => {
                return Err(LayoutError::Config(format!(
                    "parity count must be 1 or 2, got {n}"
                )));
            }
        };
        Ok(Self {
            data,
            parity,
            codec,
        })
    }

    #[must_use]
    pub const fn data_blocks(&self) -> usize {
        self.data
    }

    #[must_use]
    pub const fn parity_blocks(&self) -> usize {
        self.parity
    }

    /// Return the parity blocks for one group of equally sized data blocks.
    ///
    /// # Errors
    /// Returns [`LayoutError::Codec`] if the block count or sizes do not fit the engine.
    pub fn compute(&self, data: &[Block]) -> Result<Vec<Block>> {
        let len = Self::check_blocks(data.len(), self.data, data.iter().map(Block::len))?;
        match &self.codec {
            Codec::Xor => {
                let mut p = Block::zero(len);
                for block in data {
                    p ^= block;
                }
                Ok(vec![p])
            }
            Codec::ReedSolomon(rs) => {
                let mut shards: Vec<Vec<u8>> = data.iter().map(|b| b.as_bytes().to_vec()).collect();
                shards.extend((0..self.parity).map(|_| vec![0u8; len]));
                rs.encode(&mut shards)
                    .map_err(|e| LayoutError::Codec(format!("Reed-Solomon encoding failed: {e}")))?;
                Ok(shards.split_off(self.data).into_iter().map(Block::from).collect())
            }
        }
    }

    /// Fill in the missing blocks of a group.
    ///
    /// Hold the data blocks followed by the parity blocks, `None` marking lost ones.
    /// Returns the indices that were rebuilt.
    ///
    /// # Errors
    /// Returns [`LayoutError::UnrecoverableGroup`] if more blocks are missing than parity
    /// covers, or [`LayoutError::Codec`] if the surviving blocks are malformed.
    pub fn reconstruct(&self, group_offset: u64, shards: &mut [Option<Block>]) -> Result<Vec<usize>> {
        let total = self.data + self.parity;
        if shards.len() != total {
            return Err(LayoutError::Codec(format!(
                "expected {total} shards, got {}",
                shards.len()
            )));
        }
        let missing: Vec<usize> = (0..total).filter(|&i| shards[i].is_none()).collect();
        if missing.is_empty() {
            return Ok(missing);
        }
        if missing.len() > self.parity {
            return Err(LayoutError::UnrecoverableGroup {
                group_offset,
                missing: missing.len(),
                parity: self.parity,
            });
        }
        let survivors = total - missing.len();
        let len = Self::check_blocks(survivors, survivors, shards.iter().flatten().map(Block::len))?;

        match &self.codec {
            Codec::Xor => {
                let mut rebuilt = Block::zero(len);
                for block in shards.iter().flatten() {
                    rebuilt ^= block;
                }
                shards[missing[0]] = Some(rebuilt);
            }
            Codec::ReedSolomon(rs) => {
                let mut raw: Vec<Option<Vec<u8>>> = shards
                    .iter_mut()
                    .map(|s| s.take().map(Block::into_vec))
                    .collect();
                let result = rs.reconstruct(&mut raw);
                for (slot, shard) in shards.iter_mut().zip(raw) {
                    *slot = shard.map(Block::from);
                }
                result.map_err(|e| {
                    LayoutError::Codec(format!("Reed-Solomon reconstruction failed: {e}"))
                })?;
            }
        }
        Ok(missing)
    }

    fn check_blocks(got: usize, want: usize, mut lens: impl Iterator<Item = usize>) -> Result<usize> {
        if got != want {
            return Err(LayoutError::Codec(format!("expected {want} blocks, got {got}")));
        }
        let Some(len) = lens.next() else {
            return Err(LayoutError::Codec("no blocks supplied".to_string()));
        };
        if lens.any(|l| l != len) {
            return Err(LayoutError::Codec("blocks differ in length".to_string()));
        }
        Ok(len)
    }
}
