//! Layout parameters supplied by the surrounding service at open time.

mod layout_id;

use std::fmt;
use std::time::Duration;

pub use layout_id::{BlockSize, LayoutId};

use crate::channel::OpenMode;
use crate::error::{LayoutError, Result};

/// Smallest stripe width accepted by striped layouts.
pub const MIN_STRIPE_WIDTH: u64 = 64;
/// Largest stripe width; the header stores the last block size in 32 bits.
pub const MAX_STRIPE_WIDTH: u64 = u32::MAX as u64;
pub const DEFAULT_STRIPE_WIDTH: u64 = 4 * 1024;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Upper bound on stripes per file, shared by the layout id encoding and the GF(2^8) codec.
pub const MAX_STRIPES: usize = 256;

/// LayoutKind selects the layout implementation built by [`crate::open_layout`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum LayoutKind {
    /// Single stripe, no redundancy.
    Plain,
    /// Every stripe holds a full copy.
    Replica,
    /// Striped data plus one XOR parity stripe.
    Raid5,
    /// Striped data plus two Reed-Solomon parity stripes.
    Raid6,
}

impl LayoutKind {
    #[must_use]
    pub const fn redundancy(self) -> usize {
        match self {
            Self::Plain | Self::Replica => 0,
            Self::Raid5 => 1,
            Self::Raid6 => 2,
        }
    }

    #[must_use]
    pub const fn is_striped(self) -> bool {
        matches!(self, Self::Raid5 | Self::Raid6)
    }

    /// Pick the striped kind for a parity stripe count.
    ///
    /// # Errors
    /// Returns [`LayoutError::Config`] for counts other than 1 or 2.
    pub fn by_parity(parity_stripes: usize) -> Result<Self> {
        match parity_stripes {
            1 => Ok(Self::Raid5),
            2 => Ok(Self::Raid6),
            n => Err(LayoutError::Config(format!(
                "parity stripe count must be 1 or 2, got {n}"
            ))),
        }
    }

    pub(crate) const fn code(self) -> u64 {
        match self {
            Self::Plain => 0x0,
            Self::Replica => 0x1,
            Self::Raid6 => 0x4,
            Self::Raid5 => 0x6,
        }
    }

    pub(crate) const fn from_code(code: u64) -> Option<Self> {
        match code {
            0x0 => Some(Self::Plain),
            0x1 => Some(Self::Replica),
            0x4 => Some(Self::Raid6),
            0x6 => Some(Self::Raid5),
            _ => None,
        }
    }
}

impl fmt::Display for LayoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain => write!(f, "plain"),
            Self::Replica => write!(f, "replica"),
            Self::Raid5 => write!(f, "raid5"),
            Self::Raid6 => write!(f, "raid6"),
        }
    }
}

/// LayoutConfig carries everything a layout needs to open its stripes.
#[derive(Clone, Debug)]
pub struct LayoutConfig {
    pub kind: LayoutKind,
    /// Stripe locations in physical order; the first one is the entry stripe.
    pub stripe_urls: Vec<String>,
    /// Bytes per block; also the size of the header region at the start of every stripe.
    pub stripe_width: u64,
    /// Writes arrive strictly sequentially, so parity is computed per group as it fills.
    pub streaming: bool,
    /// Persist header repairs and recovered blocks immediately.
    pub store_recovery: bool,
    /// Per stripe request timeout.
    pub timeout: Duration,
    /// Expected final size, used for space reservation hints.
    pub target_size: Option<u64>,
    pub mode: OpenMode,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            kind: LayoutKind::Raid5,
            stripe_urls: Vec::new(),
            stripe_width: DEFAULT_STRIPE_WIDTH,
            streaming: false,
            store_recovery: false,
            timeout: DEFAULT_TIMEOUT,
            target_size: None,
            mode: OpenMode::ReadWrite,
        }
    }
}

impl LayoutConfig {
    /// Build a striped configuration.
    ///
    /// # Arguments
    /// * `stripe_urls` - Stripe locations, data and parity alike.
    /// * `parity_stripes` - Number of parity stripes (1 or 2).
    /// * `stripe_width` - Block size in bytes.
    ///
    /// # Errors
    /// Returns [`LayoutError::Config`] if the parity count is unsupported.
    pub fn raid(stripe_urls: Vec<String>, parity_stripes: usize, stripe_width: u64) -> Result<Self> {
        Ok(Self {
            kind: LayoutKind::by_parity(parity_stripes)?,
            stripe_urls,
            stripe_width,
            ..Self::default()
        })
    }

    /// Expand a packed layout id into a configuration.
    ///
    /// # Errors
    /// Returns [`LayoutError::Config`] if the id is malformed or disagrees with the number of
    /// stripe urls.
    pub fn from_layout_id(id: LayoutId, stripe_urls: Vec<String>) -> Result<Self> {
        let kind = id.kind()?;
        let stripe_width = id
            .block_size()
            .ok_or_else(|| LayoutError::Config(format!("layout id {id} has no block size")))?;
        if kind != LayoutKind::Plain && id.stripe_count() != stripe_urls.len() {
            return Err(LayoutError::Config(format!(
                "layout id {id} expects {} stripes, got {}",
                id.stripe_count(),
                stripe_urls.len()
            )));
        }
        if id.redundancy() != kind.redundancy() {
            return Err(LayoutError::Config(format!(
                "layout id {id} declares {} parity stripes for a {kind} layout",
                id.redundancy()
            )));
        }
        Ok(Self {
            kind,
            stripe_urls,
            stripe_width,
            ..Self::default()
        })
    }

    #[must_use]
    pub const fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    #[must_use]
    pub const fn with_store_recovery(mut self, store_recovery: bool) -> Self {
        self.store_recovery = store_recovery;
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_mode(mut self, mode: OpenMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub const fn with_target_size(mut self, target_size: Option<u64>) -> Self {
        self.target_size = target_size;
        self
    }

    #[must_use]
    pub const fn parity_stripes(&self) -> usize {
        self.kind.redundancy()
    }

    #[must_use]
    pub fn total_stripes(&self) -> usize {
        self.stripe_urls.len()
    }

    #[must_use]
    pub fn data_stripes(&self) -> usize {
        self.total_stripes().saturating_sub(self.parity_stripes())
    }

    #[must_use]
    pub fn group_size(&self) -> u64 {
        self.data_stripes() as u64 * self.stripe_width
    }

    #[must_use]
    pub const fn header_size(&self) -> u64 {
        self.stripe_width
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.mode != OpenMode::ReadOnly
    }

    /// Check the configuration against the requirements of its layout kind.
    ///
    /// # Errors
    /// Returns [`LayoutError::Config`] describing the first violated requirement.
    pub fn validate(&self) -> Result<()> {
        let stripes = self.total_stripes();
        if stripes > MAX_STRIPES {
            return Err(LayoutError::Config(format!(
                "at most {MAX_STRIPES} stripes are supported, got {stripes}"
            )));
        }
        match self.kind {
            LayoutKind::Plain if stripes != 1 => Err(LayoutError::Config(format!(
                "plain layout needs exactly one stripe, got {stripes}"
            ))),
            LayoutKind::Replica if stripes == 0 => Err(LayoutError::Config(
                "replica layout needs at least one stripe".to_string(),
            )),
            LayoutKind::Raid5 | LayoutKind::Raid6 => {
                if stripes < 2 {
                    return Err(LayoutError::Config(format!(
                        "striped layout needs at least 2 stripes, got {stripes}"
                    )));
                }
                if self.stripe_width < MIN_STRIPE_WIDTH {
                    return Err(LayoutError::Config(format!(
                        "stripe width must be at least {MIN_STRIPE_WIDTH}, got {}",
                        self.stripe_width
                    )));
                }
                if self.stripe_width > MAX_STRIPE_WIDTH {
                    return Err(LayoutError::Config(format!(
                        "stripe width must be at most {MAX_STRIPE_WIDTH}, got {}",
                        self.stripe_width
                    )));
                }
                if self.parity_stripes() >= stripes {
                    return Err(LayoutError::Config(format!(
                        "{} parity stripes leave no data stripe out of {stripes}",
                        self.parity_stripes()
                    )));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Pack the configuration into a [`LayoutId`].
    ///
    /// # Errors
    /// Returns [`LayoutError::Config`] if the stripe width has no block size encoding.
    pub fn layout_id(&self) -> Result<LayoutId> {
        LayoutId::new(self.kind, self.total_stripes(), self.stripe_width)
    }
}
