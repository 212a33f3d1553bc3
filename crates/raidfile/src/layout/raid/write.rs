use std::time::Instant;

use tracing::{debug, trace};

use crate::error::Result;
use crate::layout::geometry::Chunk;
use crate::metrics::IoOpType;
use crate::parity::Block;

use super::RaidLayout;

/// GroupBuffer holds the bytes of one redundancy group written sequentially from its start.
pub(super) struct GroupBuffer {
    pub(super) group_offset: u64,
    size: usize,
    data: Vec<u8>,
}

impl GroupBuffer {
    fn new(group_offset: u64, size: usize) -> Self {
        Self {
            group_offset,
            size,
            data: Vec::with_capacity(size),
        }
    }

    /// Bytes filled from the start of the group.
    pub(super) fn filled(&self) -> u64 {
        self.data.len() as u64
    }

    pub(super) fn bytes(&self) -> &[u8] {
        &self.data
    }

    fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    fn is_full(&self) -> bool {
        self.data.len() >= self.size
    }

    /// Cut the group into data blocks, zero padding what was never written.
    fn blocks(&self, block_size: usize) -> Vec<Block> {
        let mut padded = self.data.clone();
        padded.resize(self.size, 0);
        padded
            .chunks(block_size)
            .map(|c| Block::from_vec(c.to_vec()))
            .collect()
    }
}

impl RaidLayout {
    pub(super) fn write_range(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
        self.ensure_writable()?;
        if data.is_empty() {
            return Ok(0);
        }
        self.check_range(offset, data.len() as u64)?;
        let started = Instant::now();
        let result = self.write_blocks(offset, data);
        self.metrics.layout(
            IoOpType::Write,
            data.len() as u64,
            started,
            result.is_err(),
            false,
        );
        result.map(|()| data.len())
    }

    fn write_blocks(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.reset_trackers();
        let chunks: Vec<Chunk> = self.geometry.split(offset, data.len()).collect();
        for chunk in &chunks {
            let physical = self.map.physical_of(chunk.logical);
            let bytes = data[chunk.buf_pos..chunk.buf_pos + chunk.len].to_vec();
            self.dispatch_write(physical, chunk.local, bytes, chunk.offset);
        }
        trace!(offset, length = data.len(), chunks = chunks.len(), "dispatched data writes");

        let ready = if self.config.streaming {
            self.stream_data(offset, data)
        } else {
            self.pieces.insert(offset, data.len() as u64);
            Vec::new()
        };
        if let Err(e) = self.wait_checked() {
            self.keep_pending(&ready);
            return Err(e);
        }

        let end = offset + data.len() as u64;
        if self.file_size.is_none_or(|size| end > size) {
            self.file_size = Some(end);
            self.needs_truncate = true;
        }

        for (i, buffer) in ready.iter().enumerate() {
            let blocks = buffer.blocks(self.geometry.stripe_width as usize);
            if let Err(e) = self.write_parity(buffer.group_offset, &blocks) {
                self.keep_pending(&ready[i..]);
                return Err(e);
            }
        }
        let groups = self.pieces.take_complete_groups(self.geometry.group_size());
        self.parity_from_stripes(&groups)
    }

    fn keep_pending(&mut self, buffers: &[GroupBuffer]) {
        for buffer in buffers {
            self.pieces.insert(buffer.group_offset, buffer.filled());
        }
    }

    /// Feed a write into the group buffer, yielding the groups it completed.
    /// Bytes that do not continue the buffered group fall back to sparse tracking.
    fn stream_data(&mut self, offset: u64, data: &[u8]) -> Vec<GroupBuffer> {
        let group_size = self.geometry.group_size();
        let end = offset + data.len() as u64;
        let mut ready = Vec::new();
        let mut pos = offset;
        while pos < end {
            let group = self.geometry.group_offset(pos);
            let take = (group + group_size).min(end) - pos;
            let from = (pos - offset) as usize;
            let bytes = &data[from..from + take as usize];

            let continues = self
                .stream
                .as_ref()
                .is_some_and(|b| b.group_offset == group && b.group_offset + b.filled() == pos);
            if !continues {
                self.retire_stream();
                if pos == group {
                    self.stream = Some(GroupBuffer::new(group, group_size as usize));
                }
            }

            let full = if let Some(buffer) = self.stream.as_mut() {
                buffer.append(bytes);
                buffer.is_full()
            } else {
                self.pieces.insert(pos, take);
                false
            };
            if full {
                ready.extend(self.stream.take());
            }
            pos += take;
        }
        ready
    }

    pub(super) fn retire_stream(&mut self) {
        if let Some(buffer) = self.stream.take() {
            if buffer.filled() > 0 {
                self.pieces.insert(buffer.group_offset, buffer.filled());
            }
        }
    }

    /// Compute parity for every group still pending, complete or not.
    ///
    /// A partly filled stream buffer is not trusted for this: the rest of its group may hold
    /// older bytes on the stripes, so the group is read back like any sparse one.
    pub(super) fn flush_parity(&mut self) -> Result<()> {
        self.retire_stream();
        let groups = self.pieces.take_all_groups(self.geometry.group_size());
        if !groups.is_empty() {
            debug!(groups = groups.len(), "flushing pending parity groups");
        }
        self.parity_from_stripes(&groups)
    }

    /// Brings the parity of one group up to date if writes to it, an unfinished stream buffer
    /// included, are still pending. On failure the group stays pending.
    pub(super) fn settle_parity(&mut self, group: u64) -> Result<()> {
        if self.stream.as_ref().is_some_and(|b| b.group_offset == group) {
            self.retire_stream();
        }
        let end = group + self.geometry.group_size();
        if !self.pieces.overlaps(group, end) {
            return Ok(());
        }
        self.pieces.remove_range(group, end);
        debug!(group, "computing pending parity before a rebuild");
        self.parity_from_stripes(&[group])
    }

    /// Read back the data blocks of each group and write its parity.
    /// Groups left unprocessed by a failure stay pending.
    pub(super) fn parity_from_stripes(&mut self, groups: &[u64]) -> Result<()> {
        let group_size = self.geometry.group_size();
        for (i, &group) in groups.iter().enumerate() {
            let result = self
                .read_data_blocks(group)
                .and_then(|blocks| self.write_parity(group, &blocks));
            if let Err(e) = result {
                for &g in &groups[i..] {
                    self.pieces.insert(g, group_size);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn read_data_blocks(&mut self, group: u64) -> Result<Vec<Block>> {
        let sw = self.geometry.stripe_width;
        let local = self.geometry.group_local(group);
        self.reset_trackers();
        let mut issued = Vec::with_capacity(self.geometry.data_stripes);
        for logical in 0..self.geometry.data_stripes {
            let physical = self.map.physical_of(logical);
            issued.push(self.dispatch_read(physical, local, sw as usize, group + logical as u64 * sw));
        }
        self.wait_checked()?;
        Ok(issued
            .into_iter()
            .map(|is| Block::from_vec(self.take_data(is).unwrap_or_else(|| vec![0u8; sw as usize])))
            .collect())
    }

    /// Compute the parity of one group and write it to the parity stripes.
    pub(super) fn write_parity(&mut self, group: u64, data: &[Block]) -> Result<()> {
        let parity = self.engine()?.compute(data)?;
        let local = self.geometry.group_local(group);
        let sw = self.geometry.stripe_width;
        self.reset_trackers();
        for (k, block) in parity.into_iter().enumerate() {
            let logical = self.geometry.data_stripes + k;
            let physical = self.map.physical_of(logical);
            self.dispatch_write(physical, local, block.into_vec(), group + logical as u64 * sw);
        }
        self.wait_checked()?;
        trace!(group, "wrote group parity");
        Ok(())
    }
}
