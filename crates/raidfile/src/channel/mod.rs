//! Physical stripe access.
//!
//! A [`StripeChannel`] is one byte-addressable backing object. Channels are shared between the
//! layout and its per-stripe dispatch worker, so every method takes `&self` and implementations
//! use interior mutability.

pub mod dispatch;
pub mod mem;
pub mod mmap;

#[cfg(test)]
mod dispatch_tests;

use std::io;
use std::sync::Arc;
use std::time::Duration;

pub use dispatch::AsyncStripe;
pub use mem::{Faults, MemOpener, MemStripe};
pub use mmap::{FileOpener, MmapStripe};

/// OpenMode controls how stripe objects are opened.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum OpenMode {
    ReadOnly,
    /// Open existing stripes for update, creating missing ones.
    #[default]
    ReadWrite,
    /// Create stripes, discarding any previous contents.
    Create,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StripeStat {
    pub size: u64,
}

pub trait StripeChannel: Send + Sync {
    fn url(&self) -> &str;

    /// Fill `buf` from `offset`, returning the number of bytes read. Reading past
    /// the end of the stripe is a short read, not an error.
    ///
    /// # Errors
    /// Returns the underlying I/O error.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Write all of `data` at `offset`, growing the stripe when needed.
    ///
    /// # Errors
    /// Returns the underlying I/O error.
    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()>;

    /// # Errors
    /// Returns the underlying I/O error.
    fn sync(&self) -> io::Result<()>;

    /// # Errors
    /// Returns the underlying I/O error.
    fn truncate(&self, size: u64) -> io::Result<()>;

    /// Make sure at least `size` bytes are backed. Shrinking is never done here.
    ///
    /// # Errors
    /// Returns the underlying I/O error.
    fn fallocate(&self, size: u64) -> io::Result<()> {
        if self.stat()?.size < size {
            self.truncate(size)?;
        }
        Ok(())
    }

    /// Release backing space for `[from, to)`. Stores that cannot punch holes
    /// keep the space.
    ///
    /// # Errors
    /// Returns the underlying I/O error.
    fn deallocate(&self, _from: u64, _to: u64) -> io::Result<()> {
        Ok(())
    }

    /// # Errors
    /// Returns the underlying I/O error.
    fn stat(&self) -> io::Result<StripeStat>;

    /// # Errors
    /// Returns the underlying I/O error.
    fn close(&self) -> io::Result<()>;

    /// # Errors
    /// Returns the underlying I/O error.
    fn remove(&self) -> io::Result<()>;
}

/// StripeOpener resolves stripe urls into channels.
pub trait StripeOpener: Send + Sync {
    /// # Errors
    /// Returns the I/O error raised while opening the stripe.
    fn open(&self, url: &str, mode: OpenMode, timeout: Duration) -> io::Result<Arc<dyn StripeChannel>>;
}

/// Keep reading until `buf` is full or the stripe ends.
///
/// # Errors
/// Returns the first I/O error.
pub fn read_full(channel: &dyn StripeChannel, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        let n = channel.read_at(offset + done as u64, &mut buf[done..])?;
        if n == 0 {
            break;
        }
        done += n;
    }
    Ok(done)
}

pub(crate) fn closed_error(url: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, format!("stripe {url} is closed"))
}
