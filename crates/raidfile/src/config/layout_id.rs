use std::fmt;

use crate::config::{LayoutKind, MAX_STRIPES};
use crate::error::{LayoutError, Result};

const CHECKSUM_NONE: u64 = 0x1;

/// BlockSize enumerates the stripe widths a [`LayoutId`] can encode.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlockSize {
    K4,
    K64,
    K128,
    K512,
    M1,
    M4,
    M16,
    M64,
}

impl BlockSize {
    const ALL: [Self; 8] = [
        Self::K4,
        Self::K64,
        Self::K128,
        Self::K512,
        Self::M1,
        Self::M4,
        Self::M16,
        Self::M64,
    ];

    #[must_use]
    pub const fn bytes(self) -> u64 {
        match self {
            Self::K4 => 4 * 1024,
            Self::K64 => 64 * 1024,
            Self::K128 => 128 * 1024,
            Self::K512 => 512 * 1024,
            Self::M1 => 1024 * 1024,
            Self::M4 => 4 * 1024 * 1024,
            Self::M16 => 16 * 1024 * 1024,
            Self::M64 => 64 * 1024 * 1024,
        }
    }

    /// Return the encoding for an exact byte size.
    #[must_use]
    pub fn from_bytes(bytes: u64) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.bytes() == bytes)
    }

    const fn code(self) -> u64 {
        self as u64
    }

    fn from_code(code: u64) -> Option<Self> {
        Self::ALL.get(usize::try_from(code).ok()?).copied()
    }
}

/// LayoutId is the packed 64-bit layout descriptor stored with file metadata.
///
/// Bit layout: 0-3 checksum, 4-7 layout kind, 8-15 stripe count minus one, 16-19 block size,
/// 28-30 redundancy stripes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct LayoutId(u64);

impl LayoutId {
    /// Pack a layout kind, stripe count and block size.
    ///
    /// # Errors
    /// Returns [`LayoutError::Config`] if the stripe count is out of range or the block size has
    /// no encoding.
    pub fn new(kind: LayoutKind, stripes: usize, block_size: u64) -> Result<Self> {
        if stripes == 0 || stripes > MAX_STRIPES {
            return Err(LayoutError::Config(format!(
                "stripe count {stripes} cannot be encoded in a layout id"
            )));
        }
        let bs = BlockSize::from_bytes(block_size).ok_or_else(|| {
            LayoutError::Config(format!("block size {block_size} has no layout id encoding"))
        })?;
        let id = CHECKSUM_NONE
            | (kind.code() << 4)
            | (((stripes as u64 - 1) & 0xff) << 8)
            | (bs.code() << 16)
            | ((kind.redundancy() as u64 & 0x7) << 28);
        Ok(Self(id))
    }

    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn checksum(self) -> u64 {
        self.0 & 0xf
    }

    /// Decode the layout type nibble.
    ///
    /// # Errors
    /// Returns [`LayoutError::Config`] for layout types this crate does not implement.
    pub fn kind(self) -> Result<LayoutKind> {
        let code = (self.0 >> 4) & 0xf;
        LayoutKind::from_code(code).ok_or_else(|| {
            LayoutError::Config(format!("unsupported layout type {code:#x} in layout id {self}"))
        })
    }

    #[must_use]
    pub const fn stripe_count(self) -> usize {
        ((self.0 >> 8) & 0xff) as usize + 1
    }

    #[must_use]
    pub fn block_size(self) -> Option<u64> {
        BlockSize::from_code((self.0 >> 16) & 0xf).map(BlockSize::bytes)
    }

    #[must_use]
    pub const fn redundancy(self) -> usize {
        ((self.0 >> 28) & 0x7) as usize
    }

    #[must_use]
    pub const fn min_online_stripes(self) -> usize {
        self.stripe_count().saturating_sub(self.redundancy())
    }

    /// Return physical bytes stored per logical byte.
    #[must_use]
    pub fn size_factor(self) -> f64 {
        match self.kind() {
            Ok(LayoutKind::Replica) => self.stripe_count() as f64,
            Ok(LayoutKind::Raid5 | LayoutKind::Raid6) => {
                let data = self.stripe_count().saturating_sub(self.redundancy());
                if data == 0 {
                    1.0
                } else {
                    self.stripe_count() as f64 / data as f64
                }
            }
            _ => 1.0,
        }
    }

    /// Return the physical size of one stripe for a logical file size,
    /// header region included.
    #[must_use]
    pub fn stripe_file_size(self, file_size: u64) -> u64 {
        let Ok(kind) = self.kind() else {
            return file_size;
        };
        if !kind.is_striped() {
            return file_size;
        }
        let Some(block) = self.block_size() else {
            return file_size;
        };
        let data = self.stripe_count().saturating_sub(self.redundancy()) as u64;
        if data == 0 {
            return file_size;
        }
        let group = data * block;
        file_size.div_ceil(group) * block + block
    }
}

impl fmt::Display for LayoutId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}
