use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use tracing::{error, info, instrument, warn};

use crate::error::{LayoutError, Result};
use crate::metrics::IoOpType;
use crate::parity::Block;

use super::RaidLayout;

/// Every block of one redundancy group after reconstruction, data blocks first.
pub(super) struct RebuiltGroup {
    group_offset: u64,
    shards: Vec<Block>,
    /// Logical indices of the blocks that had to be rebuilt.
    rebuilt: Vec<usize>,
}

/// Copy the part of `src` (starting at logical `src_offset`) that overlaps the
/// destination window starting at logical `dst_offset`.
fn copy_overlap(dst_offset: u64, dst: &mut [u8], src_offset: u64, src: &[u8]) {
    let start = dst_offset.max(src_offset);
    let end = (dst_offset + dst.len() as u64).min(src_offset + src.len() as u64);
    if start >= end {
        return;
    }
    let len = (end - start) as usize;
    let d = (start - dst_offset) as usize;
    let s = (start - src_offset) as usize;
    dst[d..d + len].copy_from_slice(&src[s..s + len]);
}

impl RaidLayout {
    pub(super) fn read_range(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        let Some(size) = self.file_size else {
            return Ok(0);
        };
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let started = Instant::now();
        let len = (size - offset).min(buf.len() as u64) as usize;
        self.check_range(offset, len as u64)?;
        let buf = &mut buf[..len];

        let failed = self.read_blocks(offset, buf);
        let degraded = !failed.is_empty();
        let result = if degraded {
            warn!(offset, length = len, failed = failed.len(), "degraded read, rebuilding from parity");
            self.repair(offset, buf, &failed)
        } else {
            Ok(())
        };
        self.metrics
            .layout(IoOpType::Read, len as u64, started, result.is_err(), degraded);
        result.map(|()| len)
    }

    /// Read every block touched by the request, copy what arrived into `buf`
    /// and return the failed ranges clipped to the request, keyed by logical offset.
    fn read_blocks(&mut self, offset: u64, buf: &mut [u8]) -> BTreeMap<u64, u64> {
        let sw = self.geometry.stripe_width;
        let (aligned, aligned_len) = self.geometry.align_expand(offset, buf.len() as u64);
        self.reset_trackers();
        let mut issued = Vec::new();
        let mut block = aligned;
        while block < aligned + aligned_len {
            let (logical, local) = self.geometry.locate(block);
            let physical = self.map.physical_of(logical);
            issued.push((block, self.dispatch_read(physical, local, sw as usize, block)));
            block += sw;
        }

        let end = offset + buf.len() as u64;
        let mut failed = BTreeMap::new();
        for physical in self.wait_batch() {
            for (&o, &l) in self.stripes[physical].tracker.errors() {
                let start = o.max(offset);
                let stop = (o + l).min(end);
                if start < stop {
                    failed.insert(start, stop - start);
                }
            }
        }
        for (block, is) in issued {
            if let Some(data) = self.take_data(is) {
                copy_overlap(offset, buf, block, &data);
            }
        }
        failed
    }

    fn repair(&mut self, offset: u64, buf: &mut [u8], failed: &BTreeMap<u64, u64>) -> Result<()> {
        let sw = self.geometry.stripe_width;
        let groups: BTreeSet<u64> = failed.keys().map(|&o| self.geometry.group_offset(o)).collect();
        for group in groups {
            let blocks: BTreeSet<u64> = failed
                .range(group..group + self.geometry.group_size())
                .map(|(&o, _)| o / sw * sw)
                .collect();
            if self.copy_from_stream(group, offset, buf, failed) {
                continue;
            }
            // Parity that does not cover the latest writes would rebuild the wrong bytes.
            if let Err(e) = self.settle_parity(group) {
                error!(group, error = %e, "group parity is out of date and cannot be refreshed");
                return Err(LayoutError::RecoveryFailed {
                    offset,
                    length: buf.len() as u64,
                });
            }
            let rebuilt = self.rebuild_group(group, &[]).map_err(|e| match e {
                LayoutError::UnrecoverableGroup { .. } => e,
                other => {
                    error!(group, error = %other, "group reconstruction failed");
                    LayoutError::RecoveryFailed {
                        offset,
                        length: buf.len() as u64,
                    }
                }
            })?;
            for block in blocks {
                let logical = ((block - group) / sw) as usize;
                copy_overlap(offset, buf, block, rebuilt.shards[logical].as_bytes());
            }
            if self.config.store_recovery && self.config.is_writable() && !rebuilt.rebuilt.is_empty() {
                if let Err(e) = self.store_blocks(&rebuilt) {
                    warn!(group, error = %e, "failed to store recovered blocks");
                }
            }
        }
        Ok(())
    }

    /// A group still being filled by a streaming writer is served from memory; its parity is not
    /// on the stripes yet.
    fn copy_from_stream(
        &self,
        group: u64,
        offset: u64,
        buf: &mut [u8],
        failed: &BTreeMap<u64, u64>,
    ) -> bool {
        let Some(stream) = self.stream.as_ref().filter(|s| s.group_offset == group) else {
            return false;
        };
        let buffered_end = group + stream.filled();
        let covered = failed
            .range(group..group + self.geometry.group_size())
            .all(|(&o, &l)| o + l <= buffered_end);
        if covered {
            copy_overlap(offset, buf, group, stream.bytes());
        }
        covered
    }

    /// Read every block of a group and reconstruct the ones that cannot be
    /// read. Blocks of `suspect` logical stripes are rebuilt even when readable.
    pub(super) fn rebuild_group(&mut self, group: u64, suspect: &[usize]) -> Result<RebuiltGroup> {
        let sw = self.geometry.stripe_width;
        let local = self.geometry.group_local(group);
        self.reset_trackers();
        let mut issued = Vec::with_capacity(self.geometry.total_stripes());
        for logical in 0..self.geometry.total_stripes() {
            let physical = self.map.physical_of(logical);
            issued.push(self.dispatch_read(physical, local, sw as usize, group + logical as u64 * sw));
        }
        self.wait_batch();

        let mut shards: Vec<Option<Block>> = Vec::with_capacity(issued.len());
        for (logical, is) in issued.into_iter().enumerate() {
            let data = self.take_data(is);
            shards.push(if suspect.contains(&logical) {
                None
            } else {
                data.map(Block::from_vec)
            });
        }
        let rebuilt = self.engine()?.reconstruct(group, &mut shards)?;
        let shards = shards
            .into_iter()
            .map(|s| s.ok_or_else(|| LayoutError::Codec("reconstruction left a gap".to_string())))
            .collect::<Result<Vec<Block>>>()?;
        Ok(RebuiltGroup {
            group_offset: group,
            shards,
            rebuilt,
        })
    }

    /// Write the rebuilt blocks of a group back to their stripes.
    fn store_blocks(&mut self, group: &RebuiltGroup) -> Result<()> {
        let sw = self.geometry.stripe_width;
        let local = self.geometry.group_local(group.group_offset);
        self.reset_trackers();
        for &logical in &group.rebuilt {
            let physical = self.map.physical_of(logical);
            let bytes = group.shards[logical].as_bytes().to_vec();
            self.dispatch_write(physical, local, bytes, group.group_offset + logical as u64 * sw);
        }
        self.wait_checked()
    }

    /// Rebuild every group of the file, rewriting the blocks that could not be
    /// read or that live on a stripe whose header had to be repaired at open.
    ///
    /// Returns the number of blocks rewritten.
    ///
    /// # Errors
    /// Fails on the first group that cannot be rebuilt or stored.
    #[instrument(skip(self), fields(size = ?self.file_size))]
    pub fn recover_all(&mut self) -> Result<usize> {
        self.ensure_writable()?;
        self.flush_parity()?;
        let Some(size) = self.file_size else {
            return Ok(0);
        };
        let suspect: Vec<usize> = self.repaired.iter().map(|&p| self.map.logical_of(p)).collect();
        let group_size = self.geometry.group_size();
        let mut rewritten = 0;
        let mut group = 0;
        while group < size {
            let rebuilt = self.rebuild_group(group, &suspect)?;
            if !rebuilt.rebuilt.is_empty() {
                self.store_blocks(&rebuilt)?;
                rewritten += rebuilt.rebuilt.len();
            }
            self.recovered_groups.insert(group / group_size);
            group += group_size;
        }
        self.done_recovery = true;
        info!(rewritten, "recovered all groups");
        Ok(rewritten)
    }

    /// Rebuild every group the range touches, once per session, then
    /// read the range. Rebuilt blocks are stored when `store_recovery` is set.
    ///
    /// # Errors
    /// Fails if a touched group cannot be rebuilt or the read fails.
    pub fn read_force_recovery(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        let end = self
            .check_range(offset, buf.len() as u64)?
            .min(self.file_size.unwrap_or(0));
        let group_size = self.geometry.group_size();
        let mut group = self.geometry.group_offset(offset);
        while group < end {
            let index = group / group_size;
            if !self.recovered_groups.contains(&index) {
                self.settle_parity(group)?;
                let rebuilt = self.rebuild_group(group, &[])?;
                if self.config.store_recovery && self.config.is_writable() && !rebuilt.rebuilt.is_empty() {
                    if let Err(e) = self.store_blocks(&rebuilt) {
                        warn!(group, error = %e, "failed to store recovered blocks");
                    }
                }
                self.recovered_groups.insert(index);
            }
            group += group_size;
        }
        self.read_range(offset, buf)
    }
}
