//! Per-stripe metadata block stored at offset 0 of every stripe.
//!
//! On-disk format (little-endian), padded with zeros to the header region size:
//!
//! | bytes  | field             |
//! |--------|-------------------|
//! | 0..8   | magic `RAIDFHD1`  |
//! | 8..12  | logical index     |
//! | 12..20 | block count       |
//! | 20..24 | last block size   |
//! | 24..56 | SHA-256 of 0..24  |


use std::io;

use sha2::{Digest, Sha256};
use tracing::warn;

use crate::channel::{StripeChannel, read_full};

pub const HEADER_MAGIC: &[u8; 8] = b"RAIDFHD1";
const FIELDS_LEN: usize = 24;
pub const HEADER_LEN: usize = FIELDS_LEN + 32;

/// HeaderState classifies what was found at the start of a stripe.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HeaderState {
    /// Nothing was ever written: the stripe is empty or zero-filled.
    New,
    Valid,
    /// Something is there but it does not check out.
    Corrupt,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StripeHeader {
    logical_index: u32,
    block_count: u64,
    last_block_size: u32,
    region_size: u64,
    state: HeaderState,
}

impl StripeHeader {
    /// Return an invalid header occupying `region_size` bytes on disk.
    ///
    /// # Panics
    /// Panics if `region_size` cannot hold the encoded header.
    #[must_use]
    pub fn new(region_size: u64) -> Self {
        assert!(
            region_size >= HEADER_LEN as u64,
            "header region of {region_size} bytes is smaller than {HEADER_LEN}"
        );
        Self {
            logical_index: 0,
            block_count: 0,
            last_block_size: 0,
            region_size,
            state: HeaderState::New,
        }
    }

    #[must_use]
    pub const fn state(&self) -> HeaderState {
        self.state
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.state == HeaderState::Valid
    }

    #[must_use]
    pub const fn logical_index(&self) -> usize {
        self.logical_index as usize
    }

    #[must_use]
    pub const fn block_count(&self) -> u64 {
        self.block_count
    }

    #[must_use]
    pub const fn last_block_size(&self) -> u64 {
        self.last_block_size as u64
    }

    #[must_use]
    pub const fn region_size(&self) -> u64 {
        self.region_size
    }

    pub fn assign(&mut self, logical_index: usize, block_count: u64, last_block_size: u64) {
        self.logical_index = logical_index as u32;
        self.block_count = block_count;
        self.last_block_size = last_block_size as u32;
        self.state = HeaderState::Valid;
    }

    pub fn set_logical_index(&mut self, logical_index: usize) {
        self.logical_index = logical_index as u32;
    }

    pub fn mark_corrupt(&mut self) {
        self.state = HeaderState::Corrupt;
    }

    /// Return the logical file size recorded in the header, or `None` when the
    /// header is invalid or describes no blocks.
    #[must_use]
    pub fn file_size(&self, stripe_width: u64) -> Option<u64> {
        if !self.is_valid() || self.block_count == 0 {
            return None;
        }
        Some((self.block_count - 1) * stripe_width + self.last_block_size())
    }

    /// Store the block count and last block size describing `size`.
    ///
    /// Returns `true` if either value changed. `stripe_width` must fit in 32 bits, which
    /// [`crate::LayoutConfig::validate`] enforces.
    pub fn set_file_size(&mut self, size: u64, stripe_width: u64) -> bool {
        let block_count = size / stripe_width + 1;
        let last = (size % stripe_width) as u32;
        let changed = block_count != self.block_count || last != self.last_block_size;
        self.block_count = block_count;
        self.last_block_size = last;
        changed
    }

    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..8].copy_from_slice(HEADER_MAGIC);
        out[8..12].copy_from_slice(&self.logical_index.to_le_bytes());
        out[12..20].copy_from_slice(&self.block_count.to_le_bytes());
        out[20..24].copy_from_slice(&self.last_block_size.to_le_bytes());
        let digest = Sha256::digest(&out[..FIELDS_LEN]);
        out[FIELDS_LEN..].copy_from_slice(&digest);
        out
    }

    /// Return `(logical_index, block_count, last_block_size)` if `bytes` holds a
    /// well-formed header.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<(u32, u64, u32)> {
        if bytes.len() < HEADER_LEN || &bytes[0..8] != HEADER_MAGIC {
            return None;
        }
        let digest = Sha256::digest(&bytes[..FIELDS_LEN]);
        if digest.as_slice() != &bytes[FIELDS_LEN..HEADER_LEN] {
            return None;
        }
        let logical = u32::from_le_bytes(bytes[8..12].try_into().ok()?);
        let blocks = u64::from_le_bytes(bytes[12..20].try_into().ok()?);
        let last = u32::from_le_bytes(bytes[20..24].try_into().ok()?);
        Some((logical, blocks, last))
    }

    /// Load the header stored in `channel` and report whether it is valid.
    ///
    /// An unreadable, empty or malformed header is not an error; it leaves the header invalid
    /// with [`HeaderState::New`] or [`HeaderState::Corrupt`].
    pub fn read_from(&mut self, channel: &dyn StripeChannel) -> bool {
        let mut buf = [0u8; HEADER_LEN];
        let n = match read_full(channel, 0, &mut buf) {
            Ok(n) => n,
            Err(e) => {
                warn!(url = channel.url(), error = %e, "failed to read stripe header");
                self.state = HeaderState::Corrupt;
                return false;
            }
        };
        match Self::decode(&buf[..n]) {
            Some((logical, blocks, last)) => {
                self.logical_index = logical;
                self.block_count = blocks;
                self.last_block_size = last;
                self.state = HeaderState::Valid;
                true
            }
            None => {
                self.state = if buf[..n].iter().all(|&b| b == 0) {
                    HeaderState::New
                } else {
                    HeaderState::Corrupt
                };
                false
            }
        }
    }

    /// Write the whole header region to `channel` and mark the header valid.
    ///
    /// # Errors
    /// Returns the I/O error raised by the channel.
    pub fn write_to(&mut self, channel: &dyn StripeChannel) -> io::Result<()> {
        let region = usize::try_from(self.region_size)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "header region too large"))?;
        let mut buf = vec![0u8; region];
        buf[..HEADER_LEN].copy_from_slice(&self.encode());
        channel.write_at(0, &buf)?;
        self.state = HeaderState::Valid;
        Ok(())
    }
}
