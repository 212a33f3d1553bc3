//! File layouts built on top of stripe channels.

pub mod geometry;
pub mod plain;
pub mod raid;
pub mod replica;

#[cfg(test)]
mod replica_tests;

use std::sync::Arc;

use crate::channel::StripeOpener;
use crate::config::{LayoutConfig, LayoutKind};
use crate::error::{LayoutError, Result};
use crate::metrics::Metrics;

pub use plain::PlainLayout;
pub use raid::{LayoutState, RaidLayout, StripeHealth};
pub use replica::ReplicaLayout;

/// LayoutStat describes a layout as seen by the file-serving layer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LayoutStat {
    /// Logical file size; zero while unknown.
    pub size: u64,
    pub stripes: usize,
    /// Sum of the stripe sizes, headers and parity included.
    pub physical_size: u64,
}

/// ReadChunk is one piece of a vector read.
#[derive(Debug)]
pub struct ReadChunk<'a> {
    pub offset: u64,
    pub buf: &'a mut [u8],
}

/// Layout is the file surface every layout kind implements.
///
/// Calls on one instance must be serialized by the caller.
pub trait Layout: Send {
    fn kind(&self) -> LayoutKind;

    /// # Errors
    /// Fails if the layout is already open, the configuration is invalid, or a stripe cannot
    /// be opened.
    fn open(&mut self) -> Result<()>;

    /// Fill `buf` from `offset`. The returned count falls
    /// short at the end of the file.
    ///
    /// # Errors
    /// Fails if the range cannot be read even with parity.
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// # Errors
    /// Fails if any stripe write fails.
    fn write(&mut self, offset: u64, data: &[u8]) -> Result<usize>;

    /// # Errors
    /// Returns the first stripe failure; every stripe is still attempted.
    fn truncate(&mut self, size: u64) -> Result<()>;

    /// # Errors
    /// Returns the first stripe failure; every stripe is still attempted.
    fn sync(&mut self) -> Result<()>;

    /// # Errors
    /// Returns the first failure; every stripe is still closed.
    fn close(&mut self) -> Result<()>;

    /// # Errors
    /// Returns the first stripe failure; every stripe is still attempted.
    fn remove(&mut self) -> Result<()>;

    /// # Errors
    /// Returns the first stripe failure.
    fn stat(&mut self) -> Result<LayoutStat>;

    /// Return the logical file size, or `None` for a file that was never written.
    fn size(&self) -> Option<u64>;

    /// Reserve backing space for a file of `length` bytes.
    ///
    /// # Errors
    /// Returns the first stripe failure.
    fn fallocate(&mut self, length: u64) -> Result<()>;

    /// Release backing space for `[from, to)`.
    ///
    /// # Errors
    /// Returns the first stripe failure.
    fn fdeallocate(&mut self, from: u64, to: u64) -> Result<()>;

    /// Serve every chunk in order, returning the total number of bytes read.
    ///
    /// # Errors
    /// Stops at the first chunk that fails.
    fn read_v(&mut self, chunks: &mut [ReadChunk<'_>]) -> Result<usize> {
        let mut total = 0;
        for chunk in chunks.iter_mut() {
            total += self.read(chunk.offset, chunk.buf)?;
        }
        Ok(total)
    }
}

/// Build the layout selected by `config.kind` and open it.
///
/// # Errors
/// Returns the error raised while opening the layout.
pub fn open_layout(
    config: LayoutConfig,
    opener: Arc<dyn StripeOpener>,
    metrics: Metrics,
) -> Result<Box<dyn Layout>> {
    let mut layout: Box<dyn Layout> = match config.kind {
        LayoutKind::Plain => Box::new(PlainLayout::new(config, opener, metrics)),
        LayoutKind::Replica => Box::new(ReplicaLayout::new(config, opener, metrics)),
        LayoutKind::Raid5 | LayoutKind::Raid6 => Box::new(RaidLayout::new(config, opener, metrics)),
    };
    layout.open()?;
    Ok(layout)
}

/// Keep the earliest failure of a fan-out.
pub(crate) fn first_error(slot: &mut Option<LayoutError>, result: Result<()>) {
    if let Err(e) = result {
        if slot.is_none() {
            *slot = Some(e);
        }
    }
}
