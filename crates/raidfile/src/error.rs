//! Error types for striped layouts.

use std::io;

use thiserror::Error;

/// Result type alias using [`LayoutError`].
pub type Result<T> = std::result::Result<T, LayoutError>;

/// Errors surfaced by layouts and their stripe plumbing.
#[derive(Error, Debug)]
pub enum LayoutError {
    /// Layout parameters are unusable (too few stripes, stripe width too small, ...).
    #[error("invalid layout configuration: {0}")]
    Config(String),

    /// One physical stripe failed an operation.
    #[error("I/O error on stripe {stripe} at offset {offset} (length {length}): {source}")]
    StripeIo {
        stripe: usize,
        offset: u64,
        length: u64,
        #[source]
        source: io::Error,
    },

    /// An asynchronous stripe request did not complete in time.
    #[error("stripe {stripe} timed out at offset {offset} (length {length})")]
    Timeout {
        stripe: usize,
        offset: u64,
        length: u64,
    },

    /// More stripe headers are invalid than parity stripes can cover.
    #[error("{invalid} stripe headers are invalid, only {parity} can be recovered")]
    HeaderCorrupt { invalid: usize, parity: usize },

    /// More blocks of one redundancy group are lost than parity can rebuild.
    #[error("group at offset {group_offset} lost {missing} blocks, parity covers {parity}")]
    UnrecoverableGroup {
        group_offset: u64,
        missing: usize,
        parity: usize,
    },

    /// A degraded range could not be rebuilt for a reason other than lost redundancy.
    #[error("failed to recover range at offset {offset} (length {length})")]
    RecoveryFailed { offset: u64, length: u64 },

    /// The request reaches past the largest offset the layout can address.
    #[error("range at offset {offset} (length {length}) is out of bounds")]
    InvalidRange { offset: u64, length: u64 },

    /// Parity encoder/decoder failure.
    #[error("parity coding failed: {0}")]
    Codec(String),

    #[error("layout is not open")]
    NotOpen,

    #[error("layout is already open")]
    AlreadyOpen,

    #[error("layout is opened read-only")]
    ReadOnly,
}

impl LayoutError {
    pub(crate) fn stripe_io(stripe: usize, offset: u64, length: u64, source: io::Error) -> Self {
        Self::StripeIo {
            stripe,
            offset,
            length,
            source,
        }
    }

    /// Report whether the error is attributable to a single stripe and
    /// can therefore be absorbed by parity.
    #[must_use]
    pub const fn is_stripe_failure(&self) -> bool {
        matches!(self, Self::StripeIo { .. } | Self::Timeout { .. })
    }

    #[must_use]
    pub const fn stripe(&self) -> Option<usize> {
        match self {
            Self::StripeIo { stripe, .. } | Self::Timeout { stripe, .. } => Some(*stripe),
            _ => None,
        }
    }
}
