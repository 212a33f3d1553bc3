//! Striped layout with one or two parity stripes.
//!
//! Every stripe starts with a header region of `stripe_width` bytes followed by blocks of
//! `stripe_width` bytes. Logical block `b` of the file lives on data stripe `b % data` at block
//! row `b / (data * width)`; the parity blocks of a row sit on the parity stripes at the same
//! stripe-local offset. Parity is computed lazily: as soon as a row (redundancy group) is
//! complete, or at close for whatever is left.

mod read;
mod write;

#[cfg(test)]
mod degraded_tests;
#[cfg(test)]
mod raid_tests;

use std::collections::BTreeSet;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, instrument, warn};

use crate::channel::{AsyncStripe, StripeChannel, StripeOpener};
use crate::config::{LayoutConfig, LayoutKind};
use crate::error::{LayoutError, Result};
use crate::header::{HeaderState, StripeHeader};
use crate::layout::geometry::Geometry;
use crate::layout::{Layout, LayoutStat, first_error};
use crate::map::{StripeMap, validate_headers};
use crate::metrics::{IoOpType, Metrics};
use crate::parity::ParityEngine;
use crate::pieces::PendingPieces;
use crate::tracker::AsyncCompletionTracker;

use write::GroupBuffer;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LayoutState {
    Closed,
    Opening,
    Open,
    Closing,
}

/// StripeHealth summarizes what one session saw of a physical stripe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StripeHealth {
    pub physical: usize,
    pub logical: usize,
    pub url: String,
    /// Header state found at open, before any repair.
    pub header_state: HeaderState,
    pub header_repaired: bool,
    pub io_errors: u64,
}

impl StripeHealth {
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.io_errors == 0 && !self.header_repaired && self.header_state != HeaderState::Corrupt
    }
}

struct StripeSlot {
    io: AsyncStripe,
    tracker: AsyncCompletionTracker,
    io_errors: u64,
}

/// Handle of one dispatched request: the physical stripe and its tracker ticket.
#[derive(Copy, Clone, Debug)]
struct Issued {
    physical: usize,
    ticket: u64,
}

/// RaidLayout spreads a file over data stripes and keeps parity stripes next to them.
///
/// Calls are serialized by the caller; inside one call the stripes are driven in parallel.
pub struct RaidLayout {
    config: LayoutConfig,
    geometry: Geometry,
    opener: Arc<dyn StripeOpener>,
    metrics: Metrics,
    state: LayoutState,
    engine: Option<ParityEngine>,
    stripes: Vec<StripeSlot>,
    headers: Vec<StripeHeader>,
    found: Vec<HeaderState>,
    map: StripeMap,
    pieces: PendingPieces,
    stream: Option<GroupBuffer>,
    file_size: Option<u64>,
    needs_truncate: bool,
    done_recovery: bool,
    repaired: Vec<usize>,
    recovered_groups: BTreeSet<u64>,
}

impl RaidLayout {
    #[must_use]
    pub fn new(config: LayoutConfig, opener: Arc<dyn StripeOpener>, metrics: Metrics) -> Self {
        let geometry = Geometry::from_config(&config);
        Self {
            config,
            geometry,
            opener,
            metrics,
            state: LayoutState::Closed,
            engine: None,
            stripes: Vec::new(),
            headers: Vec::new(),
            found: Vec::new(),
            map: StripeMap::identity(0),
            pieces: PendingPieces::new(),
            stream: None,
            file_size: None,
            needs_truncate: false,
            done_recovery: false,
            repaired: Vec::new(),
            recovered_groups: BTreeSet::new(),
        }
    }

    #[must_use]
    pub const fn state(&self) -> LayoutState {
        self.state
    }

    #[must_use]
    pub const fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    #[must_use]
    pub const fn stripe_map(&self) -> &StripeMap {
        &self.map
    }

    #[must_use]
    pub fn headers(&self) -> &[StripeHeader] {
        &self.headers
    }

    /// Report per physical stripe what this session has seen so far. Empty
    /// while the layout is closed.
    #[must_use]
    pub fn stripe_health(&self) -> Vec<StripeHealth> {
        self.stripes
            .iter()
            .enumerate()
            .map(|(physical, slot)| StripeHealth {
                physical,
                logical: self.map.logical_of(physical),
                url: slot.io.channel().url().to_string(),
                header_state: self.found[physical],
                header_repaired: self.repaired.contains(&physical),
                io_errors: slot.io_errors,
            })
            .collect()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state != LayoutState::Open {
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

    /// Requests must end within the offsets the geometry can address.
    fn check_range(&self, offset: u64, length: u64) -> Result<u64> {
        offset
            .checked_add(length)
            .filter(|&end| end <= self.geometry.max_file_size())
            .ok_or(LayoutError::InvalidRange { offset, length })
    }

    fn engine(&self) -> Result<&ParityEngine> {
        self.engine.as_ref().ok_or(LayoutError::NotOpen)
    }

    #[instrument(skip(self), fields(kind = %self.config.kind, stripes = self.config.total_stripes()))]
    fn open_stripes(&mut self) -> Result<()> {
        if self.state != LayoutState::Closed {
            return Err(LayoutError::AlreadyOpen);
        }
        self.config.validate()?;
        if !self.config.kind.is_striped() {
            return Err(LayoutError::Config(format!(
                "{} layout cannot be opened as a striped layout",
                self.config.kind
            )));
        }
        self.state = LayoutState::Opening;
        if let Err(e) = self.load() {
            warn!(error = %e, "failed to open striped layout");
            for slot in &self.stripes {
                let _ = slot.io.channel().close();
            }
            self.reset_session();
            return Err(e);
        }
        self.state = LayoutState::Open;
        info!(
            size = ?self.file_size,
            recovered = self.done_recovery,
            identity = self.map.is_identity(),
            "opened striped layout"
        );
        Ok(())
    }

    fn load(&mut self) -> Result<()> {
        self.geometry = Geometry::from_config(&self.config);
        self.engine = Some(ParityEngine::new(
            self.geometry.data_stripes,
            self.geometry.parity_stripes,
        )?);

        for (i, url) in self.config.stripe_urls.iter().enumerate() {
            let channel = self
                .opener
                .open(url, self.config.mode, self.config.timeout)
                .map_err(|e| LayoutError::stripe_io(i, 0, 0, e))?;
            let io = AsyncStripe::spawn(i, Arc::clone(&channel), self.metrics.clone()).map_err(|e| {
                let _ = channel.close();
                LayoutError::stripe_io(i, 0, 0, e)
            })?;
            self.stripes.push(StripeSlot {
                io,
                tracker: AsyncCompletionTracker::new(),
                io_errors: 0,
            });
        }

        let mut headers = Vec::with_capacity(self.stripes.len());
        for slot in &self.stripes {
            let mut header = StripeHeader::new(self.geometry.header_size);
            header.read_from(slot.io.channel().as_ref());
            headers.push(header);
        }
        self.found = headers.iter().map(StripeHeader::state).collect();

        let validation = validate_headers(&mut headers, self.geometry.parity_stripes)?;
        if validation.recovered() && self.config.store_recovery && self.config.is_writable() {
            for &physical in &validation.repaired {
                let slot = &mut self.stripes[physical];
                match headers[physical].write_to(slot.io.channel().as_ref()) {
                    Ok(()) => info!(stripe = physical, "stored recovered stripe header"),
                    Err(e) => {
                        slot.io_errors += 1;
                        warn!(stripe = physical, error = %e, "failed to store recovered stripe header");
                    }
                }
            }
        }

        self.file_size = if validation.new_file {
            None
        } else {
            headers[0].file_size(self.geometry.stripe_width)
        };
        self.done_recovery = validation.recovered();
        self.repaired = validation.repaired;
        self.map = validation.map;
        self.headers = headers;

        if let Some(target) = self.config.target_size.filter(|_| self.config.is_writable()) {
            let length = self.geometry.stripe_size_for(target);
            for (physical, slot) in self.stripes.iter().enumerate() {
                if let Err(e) = slot.io.channel().fallocate(length) {
                    debug!(stripe = physical, error = %e, "space reservation failed");
                }
            }
        }
        Ok(())
    }

    fn reset_session(&mut self) {
        self.stripes.clear();
        self.headers.clear();
        self.found.clear();
        self.map = StripeMap::identity(0);
        self.pieces.clear();
        self.stream = None;
        self.engine = None;
        self.file_size = None;
        self.needs_truncate = false;
        self.done_recovery = false;
        self.repaired.clear();
        self.recovered_groups.clear();
        self.state = LayoutState::Closed;
    }

    #[instrument(skip(self), fields(size = ?self.file_size))]
    fn close_stripes(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.state = LayoutState::Closing;
        let mut first = None;
        if self.config.is_writable() {
            if self.done_recovery || self.needs_truncate {
                if let Some(size) = self.file_size {
                    first_error(&mut first, self.truncate_stripes(size));
                }
                self.needs_truncate = false;
            }
            first_error(&mut first, self.flush_parity());
            first_error(&mut first, self.update_headers());
        }
        first_error(&mut first, self.fan_out(0, 0, |c| c.close()));
        self.reset_session();
        match first {
            Some(e) => {
                warn!(error = %e, "striped layout closed with errors");
                Err(e)
            }
            None => {
                debug!("closed striped layout");
                Ok(())
            }
        }
    }

    /// Writes the header of every stripe whose content changed, or all of them after a recovery.
    fn update_headers(&mut self) -> Result<()> {
        let Some(size) = self.file_size else {
            return Ok(());
        };
        let sw = self.geometry.stripe_width;
        let mut first = None;
        for (physical, header) in self.headers.iter_mut().enumerate() {
            let logical = self.map.logical_of(physical);
            let moved = header.logical_index() != logical;
            header.set_logical_index(logical);
            let resized = header.set_file_size(size, sw);
            if !(resized || moved || self.done_recovery || !header.is_valid()) {
                continue;
            }
            let slot = &mut self.stripes[physical];
            if let Err(e) = header.write_to(slot.io.channel().as_ref()) {
                slot.io_errors += 1;
                first_error(&mut first, Err(LayoutError::stripe_io(physical, 0, sw, e)));
            }
        }
        first.map_or(Ok(()), Err)
    }

    fn truncate_stripes(&mut self, size: u64) -> Result<()> {
        let length = self.geometry.stripe_size_for(size);
        debug!(size, stripe_length = length, "truncating stripes");
        self.fan_out(size, 0, |c| c.truncate(length))
    }

    fn fan_out(
        &mut self,
        offset: u64,
        length: u64,
        op: impl Fn(&dyn StripeChannel) -> io::Result<()>,
    ) -> Result<()> {
        let mut first = None;
        for (physical, slot) in self.stripes.iter_mut().enumerate() {
            if let Err(e) = op(slot.io.channel().as_ref()) {
                slot.io_errors += 1;
                first_error(
                    &mut first,
                    Err(LayoutError::stripe_io(physical, offset, length, e)),
                );
            }
        }
        first.map_or(Ok(()), Err)
    }

    fn reset_trackers(&mut self) {
        for slot in &mut self.stripes {
            slot.tracker.reset();
        }
    }

    fn dispatch_read(&mut self, physical: usize, local: u64, len: usize, offset: u64) -> Issued {
        let slot = &mut self.stripes[physical];
        let op = slot.tracker.register(offset, len as u64);
        let ticket = op.ticket();
        slot.io.read_async(local, len, op);
        Issued { physical, ticket }
    }

    fn dispatch_write(&mut self, physical: usize, local: u64, data: Vec<u8>, offset: u64) -> Issued {
        let slot = &mut self.stripes[physical];
        let op = slot.tracker.register(offset, data.len() as u64);
        let ticket = op.ticket();
        slot.io.write_async(local, data, op);
        Issued { physical, ticket }
    }

    fn take_data(&mut self, issued: Issued) -> Option<Vec<u8>> {
        self.stripes[issued.physical].tracker.take_data(issued.ticket)
    }

    /// Wait for every stripe against one deadline, collecting the physical
    /// stripes that saw a failure.
    fn wait_batch(&mut self) -> Vec<usize> {
        let deadline = Instant::now() + self.config.timeout;
        let mut failed = Vec::new();
        for (physical, slot) in self.stripes.iter_mut().enumerate() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !slot.tracker.wait_all(remaining) {
                slot.io_errors += slot.tracker.errors().len() as u64;
                failed.push(physical);
            }
        }
        failed
    }

    /// Wait for the batch and turn the first stripe failure into an error.
    fn wait_checked(&mut self) -> Result<()> {
        let failed = self.wait_batch();
        let Some(&physical) = failed.first() else {
            return Ok(());
        };
        let err = match self.stripes[physical].tracker.take_first_error() {
            Some(e) => e.into_layout_error(physical),
            None => LayoutError::stripe_io(physical, 0, 0, io::Error::other("stripe request failed")),
        };
        Err(err)
    }
}

impl Layout for RaidLayout {
    fn kind(&self) -> LayoutKind {
        self.config.kind
    }

    fn open(&mut self) -> Result<()> {
        self.open_stripes()
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.read_range(offset, buf)
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
        self.write_range(offset, data)
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.ensure_writable()?;
        self.check_range(size, 0)?;
        let started = Instant::now();
        self.retire_stream();
        let result = self.truncate_stripes(size);
        self.metrics
            .layout(IoOpType::Truncate, size, started, result.is_err(), false);
        result?;
        self.pieces.remove_range(size, u64::MAX);
        self.file_size = Some(size);
        self.needs_truncate = false;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.ensure_open()?;
        let started = Instant::now();
        let result = self.fan_out(0, 0, |c| c.sync());
        self.metrics
            .layout(IoOpType::Sync, 0, started, result.is_err(), false);
        result
    }

    fn close(&mut self) -> Result<()> {
        self.close_stripes()
    }

    fn remove(&mut self) -> Result<()> {
        self.ensure_open()?;
        let result = self.fan_out(0, 0, |c| c.remove());
        info!(ok = result.is_ok(), "removed striped layout");
        self.reset_session();
        result
    }

    fn stat(&mut self) -> Result<LayoutStat> {
        self.ensure_open()?;
        let mut first = None;
        let mut physical_size = 0;
        for (physical, slot) in self.stripes.iter().enumerate() {
            match slot.io.channel().stat() {
                Ok(stat) => physical_size += stat.size,
                Err(e) => first_error(&mut first, Err(LayoutError::stripe_io(physical, 0, 0, e))),
            }
        }
        if let Some(e) = first {
            return Err(e);
        }
        Ok(LayoutStat {
            size: self.file_size.unwrap_or(0),
            stripes: self.stripes.len(),
            physical_size,
        })
    }

    fn size(&self) -> Option<u64> {
        self.file_size
    }

    fn fallocate(&mut self, length: u64) -> Result<()> {
        self.ensure_writable()?;
        self.check_range(length, 0)?;
        let stripe_length = self.geometry.stripe_size_for(length);
        self.fan_out(0, length, |c| c.fallocate(stripe_length))
    }

    fn fdeallocate(&mut self, from: u64, to: u64) -> Result<()> {
        self.ensure_writable()?;
        self.check_range(from, 0)?;
        self.check_range(to, 0)?;
        let start = self.geometry.stripe_size_for(from);
        let end = self.geometry.stripe_size_for(to);
        self.fan_out(from, to.saturating_sub(from), |c| c.deallocate(start, end))
    }
}

impl Drop for RaidLayout {
    fn drop(&mut self) {
        if self.state == LayoutState::Open {
            if let Err(e) = self.close_stripes() {
                warn!(error = %e, "failed to close striped layout on drop");
            }
        }
    }
}
