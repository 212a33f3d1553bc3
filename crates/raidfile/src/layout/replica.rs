use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::channel::{AsyncStripe, StripeOpener, read_full};
use crate::config::{LayoutConfig, LayoutKind};
use crate::error::{LayoutError, Result};
use crate::layout::{Layout, LayoutStat, first_error};
use crate::metrics::{IoOpType, Metrics};
use crate::tracker::AsyncCompletionTracker;

struct Replica {
    io: AsyncStripe,
    tracker: AsyncCompletionTracker,
}

/// ReplicaLayout keeps a full copy of the file on every stripe. Writes go to all replicas in
/// parallel; reads are served by the first replica that answers.
pub struct ReplicaLayout {
    config: LayoutConfig,
    opener: Arc<dyn StripeOpener>,
    metrics: Metrics,
    replicas: Vec<Replica>,
    size: Option<u64>,
}

impl ReplicaLayout {
    #[must_use]
    pub fn new(config: LayoutConfig, opener: Arc<dyn StripeOpener>, metrics: Metrics) -> Self {
        Self {
            config,
            opener,
            metrics,
            replicas: Vec::new(),
            size: None,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.replicas.is_empty() {
            return Err(LayoutError::NotOpen);
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_open()?;
        if !self.config.is_writable() {
            return Err(LayoutError::ReadOnly);
        }
        Ok(())
    }

    /// Apply `op` to every replica; the first failure wins.
    fn fan_out(
        &self,
        offset: u64,
        length: u64,
        op: impl Fn(&dyn crate::channel::StripeChannel) -> std::io::Result<()>,
    ) -> Result<()> {
        let mut first = None;
        for (i, replica) in self.replicas.iter().enumerate() {
            first_error(
                &mut first,
                op(replica.io.channel().as_ref())
                    .map_err(|e| LayoutError::stripe_io(i, offset, length, e)),
            );
        }
        first.map_or(Ok(()), Err)
    }
}

impl Layout for ReplicaLayout {
    fn kind(&self) -> LayoutKind {
        LayoutKind::Replica
    }

    fn open(&mut self) -> Result<()> {
        if !self.replicas.is_empty() {
            return Err(LayoutError::AlreadyOpen);
        }
        self.config.validate()?;
        let mut replicas = Vec::with_capacity(self.config.total_stripes());
        for (i, url) in self.config.stripe_urls.iter().enumerate() {
            let opened = self
                .opener
                .open(url, self.config.mode, self.config.timeout)
                .and_then(|channel| AsyncStripe::spawn(i, channel, self.metrics.clone()));
            match opened {
                Ok(io) => replicas.push(Replica {
                    io,
                    tracker: AsyncCompletionTracker::new(),
                }),
                Err(e) => {
                    for r in &replicas {
                        let _ = r.io.channel().close();
                    }
                    return Err(LayoutError::stripe_io(i, 0, 0, e));
                }
            }
        }
        let size = replicas[0]
            .io
            .channel()
            .stat()
            .map_err(|e| LayoutError::stripe_io(0, 0, 0, e))?
            .size;
        debug!(replicas = replicas.len(), size, "opened replica layout");
        self.size = Some(size);
        self.replicas = replicas;
        Ok(())
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        let started = Instant::now();
        let mut first = None;
        for (i, replica) in self.replicas.iter().enumerate() {
            match read_full(replica.io.channel().as_ref(), offset, buf) {
                Ok(n) => {
                    self.metrics
                        .layout(IoOpType::Read, n as u64, started, false, i > 0);
                    return Ok(n);
                }
                Err(e) => {
                    warn!(replica = i, offset, error = %e, "replica read failed, trying next");
                    first_error(
                        &mut first,
                        Err(LayoutError::stripe_io(i, offset, buf.len() as u64, e)),
                    );
                }
            }
        }
        self.metrics
            .layout(IoOpType::Read, 0, started, true, true);
        Err(first.unwrap_or(LayoutError::RecoveryFailed {
            offset,
            length: buf.len() as u64,
        }))
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
        self.ensure_writable()?;
        let length = data.len() as u64;
        let end = offset
            .checked_add(length)
            .ok_or(LayoutError::InvalidRange { offset, length })?;
        let started = Instant::now();
        for replica in &mut self.replicas {
            replica.tracker.reset();
            let op = replica.tracker.register(offset, data.len() as u64);
            replica.io.write_async(offset, data.to_vec(), op);
        }
        let mut first = None;
        for (i, replica) in self.replicas.iter_mut().enumerate() {
            if !replica.tracker.wait_all(self.config.timeout) {
                if let Some(e) = replica.tracker.take_first_error() {
                    first_error(&mut first, Err(e.into_layout_error(i)));
                }
            }
        }
        self.metrics.layout(
            IoOpType::Write,
            data.len() as u64,
            started,
            first.is_some(),
            false,
        );
        if let Some(e) = first {
            return Err(e);
        }
        self.size = Some(self.size.map_or(end, |s| s.max(end)));
        Ok(data.len())
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.ensure_writable()?;
        self.fan_out(size, 0, |c| c.truncate(size))?;
        self.size = Some(size);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.fan_out(0, 0, |c| c.sync())
    }

    fn close(&mut self) -> Result<()> {
        self.ensure_open()?;
        let result = self.fan_out(0, 0, |c| c.close());
        self.replicas.clear();
        result
    }

    fn remove(&mut self) -> Result<()> {
        self.ensure_open()?;
        let result = self.fan_out(0, 0, |c| c.remove());
        self.replicas.clear();
        self.size = None;
        result
    }

    fn stat(&mut self) -> Result<LayoutStat> {
        self.ensure_open()?;
        let mut physical_size = 0;
        for (i, replica) in self.replicas.iter().enumerate() {
            physical_size += replica
                .io
                .channel()
                .stat()
                .map_err(|e| LayoutError::stripe_io(i, 0, 0, e))?
                .size;
        }
        Ok(LayoutStat {
            size: self.size.unwrap_or(0),
            stripes: self.replicas.len(),
            physical_size,
        })
    }

    fn size(&self) -> Option<u64> {
        self.size
    }

    fn fallocate(&mut self, length: u64) -> Result<()> {
        self.ensure_writable()?;
        self.fan_out(0, length, |c| c.fallocate(length))
    }

    fn fdeallocate(&mut self, from: u64, to: u64) -> Result<()> {
        self.ensure_writable()?;
        self.fan_out(from, to.saturating_sub(from), |c| c.deallocate(from, to))
    }
}
