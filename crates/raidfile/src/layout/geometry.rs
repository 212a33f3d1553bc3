//! Geometry helpers for mapping logical file offsets onto stripes.

use crate::config::LayoutConfig;

/// Geometry describes the byte layout of a striped file.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub stripe_width: u64,
    pub data_stripes: usize,
    pub parity_stripes: usize,
    pub header_size: u64,
}

/// Chunk is the part of a request that falls into a single block.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    /// Logical file offset.
    pub offset: u64,
    pub len: usize,
    /// Logical index of the data stripe holding the block.
    pub logical: usize,
    /// Offset inside the stripe, header region included.
    pub local: u64,
    /// Position of the chunk inside the caller's buffer.
    pub buf_pos: usize,
}

impl Geometry {
    #[must_use]
    pub const fn new(stripe_width: u64, data_stripes: usize, parity_stripes: usize) -> Self {
        Self {
            stripe_width,
            data_stripes,
            parity_stripes,
            header_size: stripe_width,
        }
    }

    #[must_use]
    pub fn from_config(config: &LayoutConfig) -> Self {
        Self::new(
            config.stripe_width,
            config.data_stripes(),
            config.parity_stripes(),
        )
    }

    #[must_use]
    pub const fn total_stripes(&self) -> usize {
        self.data_stripes + self.parity_stripes
    }

    #[must_use]
    pub const fn group_size(&self) -> u64 {
        self.data_stripes as u64 * self.stripe_width
    }

    /// Widen `[offset, offset + length)` outward to block boundaries.
    ///
    /// # Returns
    /// A tuple of `(aligned_offset, aligned_length)`.
    #[must_use]
    pub const fn align_expand(&self, offset: u64, length: u64) -> (u64, u64) {
        let sw = self.stripe_width;
        let start = offset / sw * sw;
        let end = (offset + length).div_ceil(sw) * sw;
        (start, end - start)
    }

    /// Map a logical offset to its data stripe and stripe-local offset.
    ///
    /// # Returns
    /// A tuple of `(logical_stripe, local_offset)`.
    #[must_use]
    pub const fn locate(&self, offset: u64) -> (usize, u64) {
        let sw = self.stripe_width;
        let logical = ((offset / sw) % self.data_stripes as u64) as usize;
        let local = (offset / self.group_size()) * sw + offset % sw + self.header_size;
        (logical, local)
    }

    #[must_use]
    pub const fn group_offset(&self, offset: u64) -> u64 {
        offset / self.group_size() * self.group_size()
    }

    /// Return the stripe-local offset of the blocks of the group starting at
    /// `group_offset`; data and parity blocks of one group share it.
    #[must_use]
    pub const fn group_local(&self, group_offset: u64) -> u64 {
        group_offset / self.group_size() * self.stripe_width + self.header_size
    }

    /// Return the physical stripe size holding a file of `file_size` bytes.
    #[must_use]
    pub const fn stripe_size_for(&self, file_size: u64) -> u64 {
        file_size.div_ceil(self.group_size()) * self.stripe_width + self.header_size
    }

    /// Largest logical end offset whose groups and stripe offsets still fit in a `u64`.
    #[must_use]
    pub const fn max_file_size(&self) -> u64 {
        let group = if self.group_size() == 0 { 1 } else { self.group_size() };
        (u64::MAX / group).saturating_sub(1) * group
    }

    /// Cut `[offset, offset + len)` at block boundaries.
    pub fn split(&self, offset: u64, len: usize) -> impl Iterator<Item = Chunk> + '_ {
        let end = offset + len as u64;
        let mut pos = offset;
        std::iter::from_fn(move || {
            if pos >= end {
                return None;
            }
            let block_end = (pos / self.stripe_width + 1) * self.stripe_width;
            let chunk_end = block_end.min(end);
            let (logical, local) = self.locate(pos);
            let chunk = Chunk {
                offset: pos,
                len: (chunk_end - pos) as usize,
                logical,
                local,
                buf_pos: (pos - offset) as usize,
            };
            pos = chunk_end;
            Some(chunk)
        })
    }
}
