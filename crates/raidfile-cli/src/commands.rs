use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use raidfile::channel::{FileOpener, OpenMode, StripeOpener};
use raidfile::header::{HeaderState, StripeHeader};
use raidfile::metrics::{IoOpType, Metrics, RecordingSink};
use raidfile::{Layout, LayoutConfig, LayoutStat, RaidLayout, StripeHealth};
use tracing::{info, warn};

use crate::cli::{CorruptArgs, LayoutArgs, ReadArgs, WriteArgs};

/// Bytes moved per layout call when copying files in and out.
pub const COPY_CHUNK: usize = 1024 * 1024;

/// Where a corrupted header gets scribbled; inside the checksummed fields.
const CORRUPT_AT: u64 = 8;

#[must_use]
pub fn stripe_urls(dir: &Path, stripes: usize) -> Vec<String> {
    (0..stripes)
        .map(|i| {
            dir.join(format!("stripe-{i}.dat"))
                .to_string_lossy()
                .into_owned()
        })
        .collect()
}

/// Turn the command line into a layout configuration.
///
/// # Errors
/// Fails if the layout id or parity settings do not describe a striped layout.
pub fn layout_config(args: &LayoutArgs, mode: OpenMode) -> Result<LayoutConfig> {
    let urls = stripe_urls(&args.stripe_dir, args.stripes);
    let config = match args.layout_id {
        Some(id) => LayoutConfig::from_layout_id(id, urls)
            .with_context(|| format!("layout id {id} does not match {} stripes", args.stripes))?,
        None => LayoutConfig::raid(urls, args.parity, args.stripe_width)
            .context("invalid parity stripe count")?,
    };
    if !config.kind.is_striped() {
        bail!("{} layouts are not handled by this tool", config.kind);
    }
    let config = config
        .with_streaming(args.streaming)
        .with_store_recovery(args.store_recovery)
        .with_timeout(Duration::from_millis(args.timeout_ms))
        .with_mode(mode);
    config.validate().context("invalid layout configuration")?;
    Ok(config)
}

fn open(config: LayoutConfig, metrics: &Metrics) -> Result<RaidLayout> {
    let stripe_dir = config
        .stripe_urls
        .first()
        .and_then(|url| Path::new(url).parent().map(Path::to_path_buf));
    let mut layout = RaidLayout::new(config, Arc::new(FileOpener), metrics.clone());
    layout.open().with_context(|| match stripe_dir {
        Some(dir) => format!("failed to open stripes in {}", dir.display()),
        None => "failed to open stripes".to_string(),
    })?;
    Ok(layout)
}

/// Copy `input` into the striped file and close it, so parity and headers are
/// on disk when it returns.
///
/// # Errors
/// Fails on the first read or layout error.
pub fn write_file(args: &LayoutArgs, write: &WriteArgs, metrics: &Metrics) -> Result<u64> {
    std::fs::create_dir_all(&args.stripe_dir).with_context(|| {
        format!("failed to create stripe directory {}", args.stripe_dir.display())
    })?;
    let mut input = File::open(&write.input)
        .with_context(|| format!("failed to open {}", write.input.display()))?;
    let mut layout = open(layout_config(args, OpenMode::ReadWrite)?, metrics)?;

    let mut chunk = vec![0u8; COPY_CHUNK];
    let mut offset = write.offset;
    loop {
        let n = input
            .read(&mut chunk)
            .with_context(|| format!("failed to read {}", write.input.display()))?;
        if n == 0 {
            break;
        }
        layout
            .write(offset, &chunk[..n])
            .with_context(|| format!("write of {n} bytes at {offset} failed"))?;
        offset += n as u64;
    }
    layout.close().context("failed to close the striped file")?;
    let written = offset - write.offset;
    info!(written, size = ?layout.size(), "write finished");
    Ok(written)
}

/// Copy a range of the striped file into `out`.
///
/// # Errors
/// Fails if the range cannot be read, even from parity.
pub fn read_file(
    args: &LayoutArgs,
    read: &ReadArgs,
    metrics: &Metrics,
    out: &mut dyn Write,
) -> Result<u64> {
    let mode = if args.store_recovery {
        OpenMode::ReadWrite
    } else {
        OpenMode::ReadOnly
    };
    let mut layout = open(layout_config(args, mode)?, metrics)?;
    let size = layout.size().unwrap_or(0);
    let end = read
        .length
        .map_or(size, |len| read.offset.saturating_add(len).min(size));

    let mut chunk = vec![0u8; COPY_CHUNK];
    let mut offset = read.offset;
    while offset < end {
        let want = ((end - offset) as usize).min(COPY_CHUNK);
        let buf = &mut chunk[..want];
        let result = if read.force_recovery {
            layout.read_force_recovery(offset, buf)
        } else {
            layout.read(offset, buf)
        };
        let n = result.with_context(|| format!("read of {want} bytes at {offset} failed"))?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n]).context("failed to write output")?;
        offset += n as u64;
    }
    out.flush().context("failed to flush output")?;
    layout.close().context("failed to close the striped file")?;
    Ok(offset.saturating_sub(read.offset))
}

/// Stat is what `stat` reports about the striped file.
#[derive(Debug)]
pub struct Stat {
    pub size: Option<u64>,
    pub stat: LayoutStat,
    pub health: Vec<StripeHealth>,
}

/// # Errors
/// Fails if the stripes cannot be opened.
pub fn stat(args: &LayoutArgs, metrics: &Metrics) -> Result<Stat> {
    let mut layout = open(layout_config(args, OpenMode::ReadOnly)?, metrics)?;
    let stat = layout.stat().context("failed to stat stripes")?;
    let report = Stat {
        size: layout.size(),
        stat,
        health: layout.stripe_health(),
    };
    layout.close().context("failed to close the striped file")?;
    Ok(report)
}

/// Rebuild the whole file in place. Returns how many blocks were rewritten.
///
/// # Errors
/// Fails if a group has more lost blocks than parity stripes.
pub fn recover(args: &LayoutArgs, metrics: &Metrics) -> Result<usize> {
    let config = layout_config(args, OpenMode::ReadWrite)?.with_store_recovery(true);
    let mut layout = open(config, metrics)?;
    let rewritten = layout.recover_all().context("recovery failed")?;
    layout.close().context("failed to close the striped file")?;
    Ok(rewritten)
}

/// HeaderRow pairs a validated header with the state found on disk.
#[derive(Debug)]
pub struct HeaderRow {
    pub physical: usize,
    pub found: HeaderState,
    pub header: StripeHeader,
}

/// # Errors
/// Fails if the stripes cannot be opened or too many headers are corrupt.
pub fn headers(args: &LayoutArgs, metrics: &Metrics) -> Result<Vec<HeaderRow>> {
    let mut layout = open(layout_config(args, OpenMode::ReadOnly)?, metrics)?;
    let rows = layout
        .stripe_health()
        .into_iter()
        .zip(layout.headers().iter().cloned())
        .map(|(health, header)| HeaderRow {
            physical: health.physical,
            found: health.header_state,
            header,
        })
        .collect();
    layout.close().context("failed to close the striped file")?;
    Ok(rows)
}

/// Overwrite part of one stripe header without touching the data blocks.
///
/// # Errors
/// Fails if the stripe index is out of range or the stripe cannot be written.
pub fn corrupt_header(args: &LayoutArgs, corrupt: &CorruptArgs) -> Result<()> {
    let urls = stripe_urls(&args.stripe_dir, args.stripes);
    let Some(url) = urls.get(corrupt.stripe) else {
        bail!("stripe {} does not exist, there are {}", corrupt.stripe, urls.len());
    };
    let channel = FileOpener
        .open(url, OpenMode::ReadWrite, Duration::from_millis(args.timeout_ms))
        .with_context(|| format!("failed to open {url}"))?;
    channel
        .write_at(CORRUPT_AT, &[0xde, 0xad, 0xbe, 0xef])
        .with_context(|| format!("failed to write {url}"))?;
    channel.close().with_context(|| format!("failed to close {url}"))?;
    warn!(stripe = corrupt.stripe, url, "header corrupted");
    Ok(())
}

/// # Errors
/// Fails if the stripes cannot be opened or a stripe file cannot be deleted.
pub fn remove(args: &LayoutArgs, metrics: &Metrics) -> Result<()> {
    let mut layout = open(layout_config(args, OpenMode::ReadWrite)?, metrics)?;
    layout.remove().context("failed to remove stripes")
}

pub fn print_stats(sink: &RecordingSink, stripes: usize, out: &mut dyn Write) -> io::Result<()> {
    let layout_ops = sink.layout_ops();
    for op in [IoOpType::Read, IoOpType::Write] {
        let ops: Vec<_> = layout_ops.iter().filter(|o| o.op == op).collect();
        if ops.is_empty() {
            continue;
        }
        let bytes: u64 = ops.iter().map(|o| o.bytes).sum();
        let degraded = ops.iter().filter(|o| o.degraded).count();
        let errors = ops.iter().filter(|o| o.error).count();
        writeln!(
            out,
            "layout {op:?}: ops={} bytes={bytes} degraded={degraded} errors={errors}",
            ops.len()
        )?;
    }
    let stripe_ops = sink.stripe_ops();
    for stripe in 0..stripes {
        let ops: Vec<_> = stripe_ops.iter().filter(|o| o.stripe == stripe).collect();
        let reads = ops.iter().filter(|o| o.op == IoOpType::Read).count();
        let writes = ops.iter().filter(|o| o.op == IoOpType::Write).count();
        let errors = ops.iter().filter(|o| o.error).count();
        writeln!(out, "stripe {stripe}: reads={reads} writes={writes} errors={errors}")?;
    }
    Ok(())
}
