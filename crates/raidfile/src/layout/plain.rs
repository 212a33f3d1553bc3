use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::channel::{StripeChannel, StripeOpener, read_full};
use crate::config::{LayoutConfig, LayoutKind};
use crate::error::{LayoutError, Result};
use crate::layout::{Layout, LayoutStat};
use crate::metrics::{IoOpType, Metrics};

/// PlainLayout stores the file as-is in a single stripe.
pub struct PlainLayout {
    config: LayoutConfig,
    opener: Arc<dyn StripeOpener>,
    metrics: Metrics,
    channel: Option<Arc<dyn StripeChannel>>,
    size: u64,
}

impl PlainLayout {
    #[must_use]
    pub fn new(config: LayoutConfig, opener: Arc<dyn StripeOpener>, metrics: Metrics) -> Self {
        Self {
            config,
            opener,
            metrics,
            channel: None,
            size: 0,
        }
    }

    fn channel(&self) -> Result<&Arc<dyn StripeChannel>> {
        self.channel.as_ref().ok_or(LayoutError::NotOpen)
    }

    fn writable_channel(&self) -> Result<&Arc<dyn StripeChannel>> {
        if !self.config.is_writable() {
            return Err(LayoutError::ReadOnly);
        }
        self.channel()
    }
}

impl Layout for PlainLayout {
    fn kind(&self) -> LayoutKind {
        LayoutKind::Plain
    }

    fn open(&mut self) -> Result<()> {
        if self.channel.is_some() {
            return Err(LayoutError::AlreadyOpen);
        }
        self.config.validate()?;
        let url = &self.config.stripe_urls[0];
        let channel = self
            .opener
            .open(url, self.config.mode, self.config.timeout)
            .map_err(|e| LayoutError::stripe_io(0, 0, 0, e))?;
        self.size = channel
            .stat()
            .map_err(|e| LayoutError::stripe_io(0, 0, 0, e))?
            .size;
        debug!(url, size = self.size, "opened plain layout");
        self.channel = Some(channel);
        Ok(())
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let started = Instant::now();
        let channel = self.channel()?;
        let result = read_full(channel.as_ref(), offset, buf)
            .map_err(|e| LayoutError::stripe_io(0, offset, buf.len() as u64, e));
        self.metrics.layout(
            IoOpType::Read,
            buf.len() as u64,
            started,
            result.is_err(),
            false,
        );
        result
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
        let length = data.len() as u64;
        let end = offset
            .checked_add(length)
            .ok_or(LayoutError::InvalidRange { offset, length })?;
        let started = Instant::now();
        let result = self
            .writable_channel()?
            .write_at(offset, data)
            .map_err(|e| LayoutError::stripe_io(0, offset, data.len() as u64, e));
        self.metrics.layout(
            IoOpType::Write,
            data.len() as u64,
            started,
            result.is_err(),
            false,
        );
        result?;
        self.size = self.size.max(end);
        Ok(data.len())
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.writable_channel()?
            .truncate(size)
            .map_err(|e| LayoutError::stripe_io(0, size, 0, e))?;
        self.size = size;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.channel()?
            .sync()
            .map_err(|e| LayoutError::stripe_io(0, 0, 0, e))
    }

    fn close(&mut self) -> Result<()> {
        let channel = self.channel.take().ok_or(LayoutError::NotOpen)?;
        channel.close().map_err(|e| LayoutError::stripe_io(0, 0, 0, e))
    }

    fn remove(&mut self) -> Result<()> {
        let channel = self.channel.take().ok_or(LayoutError::NotOpen)?;
        channel.remove().map_err(|e| LayoutError::stripe_io(0, 0, 0, e))
    }

    fn stat(&mut self) -> Result<LayoutStat> {
        let physical = self
            .channel()?
            .stat()
            .map_err(|e| LayoutError::stripe_io(0, 0, 0, e))?;
        Ok(LayoutStat {
            size: self.size,
            stripes: 1,
            physical_size: physical.size,
        })
    }

    fn size(&self) -> Option<u64> {
        self.channel.as_ref().map(|_| self.size)
    }

    fn fallocate(&mut self, length: u64) -> Result<()> {
        self.writable_channel()?
            .fallocate(length)
            .map_err(|e| LayoutError::stripe_io(0, 0, length, e))
    }

    fn fdeallocate(&mut self, from: u64, to: u64) -> Result<()> {
        self.writable_channel()?
            .deallocate(from, to)
            .map_err(|e| LayoutError::stripe_io(0, from, to.saturating_sub(from), e))
    }
}
