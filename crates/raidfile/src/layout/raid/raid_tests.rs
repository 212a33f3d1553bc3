use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use rand::{Rng, SeedableRng, rngs::StdRng};
use tempfile::TempDir;

use crate::channel::{FileOpener, MemOpener, OpenMode};
use crate::config::{LayoutConfig, LayoutKind};
use crate::error::LayoutError;
use crate::header::HeaderState;
use crate::layout::geometry::Geometry;
use crate::layout::raid::{LayoutState, RaidLayout};
use crate::layout::{Layout, open_layout};
use crate::metrics::{IoOpType, Metrics, RecordingSink};

pub(super) const WIDTH: u64 = 64;

pub(super) fn urls(prefix: &str, n: usize) -> Vec<String> {
    (0..n).map(|i| format!("mem://{prefix}/{i}")).collect()
}

pub(super) fn config(prefix: &str, n: usize, parity: usize) -> LayoutConfig {
    LayoutConfig::raid(urls(prefix, n), parity, WIDTH)
        .expect("raid config")
        .with_timeout(Duration::from_secs(2))
}

pub(super) fn open(config: LayoutConfig, opener: &Arc<MemOpener>) -> RaidLayout {
    let mut layout = RaidLayout::new(config, opener.clone(), Metrics::disabled());
    layout.open().expect("open raid layout");
    layout
}

pub(super) fn payload(len: usize, seed: u64) -> Vec<u8> {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill(&mut data[..]);
    data
}

pub(super) fn read_all(layout: &mut RaidLayout, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    let n = layout.read(0, &mut buf).expect("read whole file");
    buf.truncate(n);
    buf
}

/// Writes `data` at offset 0 into a fresh layout and closes it.
pub(super) fn store(config: LayoutConfig, opener: &Arc<MemOpener>, data: &[u8]) {
    let mut layout = open(config, opener);
    assert_eq!(layout.write(0, data).expect("write"), data.len());
    layout.close().expect("close");
}

fn corrupt_header(opener: &MemOpener, url: &str) {
    opener.stripe(url).overwrite(30, &[0xa5; 4]);
}

fn data_writes(opener: &MemOpener, url: &str) -> usize {
    opener
        .stripe(url)
        .write_log()
        .iter()
        .filter(|&&(offset, _)| offset >= WIDTH)
        .count()
}

#[test]
fn write_200_bytes_on_three_data_one_parity() {
    let opener = Arc::new(MemOpener::new());
    let cfg = config("a", 4, 1);
    let names = cfg.stripe_urls.clone();
    let data = payload(200, 1);

    let mut layout = open(cfg.clone(), &opener);
    layout.write(0, &data).expect("write");
    assert_eq!(layout.size(), Some(200));

    assert_eq!(data_writes(&opener, &names[0]), 2);
    assert_eq!(data_writes(&opener, &names[1]), 1);
    assert_eq!(data_writes(&opener, &names[2]), 1);
    assert_eq!(
        opener.stripe(&names[3]).write_log(),
        vec![(WIDTH, WIDTH)],
        "first group is complete, its parity is written right away"
    );

    layout.close().expect("close");
    assert_eq!(
        data_writes(&opener, &names[3]),
        2,
        "the partial second group gets parity at close"
    );
    for name in &names {
        let stripe = opener.stripe(name);
        assert!(stripe.write_log().contains(&(0, WIDTH)), "{name} header written");
        assert_eq!(stripe.contents().len(), 192, "{name} truncated to two block rows");
    }

    let parity = opener.stripe(&names[3]).contents();
    let row0: Vec<u8> = (0..64).map(|i| data[i] ^ data[64 + i] ^ data[128 + i]).collect();
    assert_eq!(&parity[64..128], &row0[..]);
    let row1: Vec<u8> = (0..64).map(|i| if i < 8 { data[192 + i] } else { 0 }).collect();
    assert_eq!(&parity[128..192], &row1[..]);

    let mut again = open(cfg, &opener);
    assert_eq!(again.size(), Some(200));
    assert_eq!(read_all(&mut again, 300), data);
}

#[test]
fn fresh_stripes_open_as_new_file() {
    let opener = Arc::new(MemOpener::new());
    let cfg = config("b", 4, 1);
    let mut layout = open(cfg.clone(), &opener);

    assert_eq!(layout.size(), None);
    assert!(layout.stripe_map().is_identity());
    assert!(layout.headers().iter().all(|h| h.state() == HeaderState::New));
    assert_eq!(layout.read(0, &mut [0u8; 16]).expect("read"), 0);
    layout.close().expect("close");

    for name in &cfg.stripe_urls {
        assert!(opener.stripe(name).write_log().is_empty(), "untouched file writes nothing");
    }
    let again = open(cfg, &opener);
    assert_eq!(again.size(), None);
}

#[test]
fn single_corrupt_header_is_rebuilt_and_stored() {
    let opener = Arc::new(MemOpener::new());
    let cfg = config("c", 5, 1);
    let names = cfg.stripe_urls.clone();
    let data = payload(1000, 3);
    store(cfg.clone(), &opener, &data);

    corrupt_header(&opener, &names[2]);
    for name in &names {
        opener.stripe(name).reset_counters();
    }

    let mut layout = open(cfg.with_store_recovery(true), &opener);
    assert_eq!(layout.size(), Some(1000));
    assert_eq!(layout.stripe_map().logical_of(2), 2);
    assert_eq!(opener.stripe(&names[2]).write_log(), vec![(0, WIDTH)]);
    for name in names.iter().filter(|n| **n != names[2]) {
        assert!(opener.stripe(name).write_log().is_empty());
    }

    let headers = layout.headers();
    assert!(headers[2].is_valid());
    assert_eq!(headers[2].block_count(), headers[0].block_count());
    assert_eq!(headers[2].last_block_size(), headers[0].last_block_size());

    let health = layout.stripe_health();
    assert_eq!(health[2].header_state, HeaderState::Corrupt);
    assert!(health[2].header_repaired);
    assert!(!health[2].is_healthy());
    assert!(health[0].is_healthy());

    assert_eq!(read_all(&mut layout, 1000), data);
}

#[test]
fn recovery_threshold_follows_parity_count() {
    let opener = Arc::new(MemOpener::new());
    let cfg = config("threshold5", 4, 1);
    let names = cfg.stripe_urls.clone();
    store(cfg.clone(), &opener, &payload(500, 4));

    corrupt_header(&opener, &names[1]);
    corrupt_header(&opener, &names[3]);
    let mut layout = RaidLayout::new(cfg, opener.clone(), Metrics::disabled());
    let err = layout.open().expect_err("two invalid headers with one parity stripe");
    assert!(matches!(err, LayoutError::HeaderCorrupt { invalid: 2, parity: 1 }));
    assert_eq!(layout.state(), LayoutState::Closed);
    for name in &names {
        assert!(opener.stripe(name).is_closed(), "{name} left open after failed open");
    }

    let cfg6 = config("threshold6", 6, 2);
    let names6 = cfg6.stripe_urls.clone();
    let data = payload(900, 5);
    store(cfg6.clone(), &opener, &data);
    corrupt_header(&opener, &names6[0]);
    corrupt_header(&opener, &names6[4]);

    let mut layout = open(cfg6.with_store_recovery(true), &opener);
    let map = layout.stripe_map().clone();
    let mut seen: Vec<usize> = (0..6).map(|p| map.logical_of(p)).collect();
    seen.sort_unstable();
    assert_eq!(seen, (0..6).collect::<Vec<_>>());
    assert_eq!(map.logical_of(4), 0, "last invalid stripe takes the lowest free index");
    assert_eq!(map.logical_of(0), 4);

    // Both swapped stripes are suspect, so every group rewrites two blocks.
    assert_eq!(layout.recover_all().expect("recover"), 2 * 4);
    assert_eq!(read_all(&mut layout, 900), data);
}

#[test]
fn stripe_order_comes_from_headers() {
    let opener = Arc::new(MemOpener::new());
    let cfg = config("order", 4, 1);
    let data = payload(777, 6);
    store(cfg.clone(), &opener, &data);

    let mut reversed = cfg.stripe_urls.clone();
    reversed.reverse();
    let cfg = LayoutConfig {
        stripe_urls: reversed,
        ..cfg
    };
    let mut layout = open(cfg, &opener);
    let map = layout.stripe_map().clone();
    for p in 0..4 {
        assert_eq!(map.logical_of(p), 3 - p);
        assert_eq!(map.physical_of(map.logical_of(p)), p);
    }
    assert_eq!(read_all(&mut layout, 1000), data);
    layout.close().expect("close");
}

#[test]
fn unaligned_writes_read_back() {
    let opener = Arc::new(MemOpener::new());
    let mut layout = open(config("unaligned", 4, 1), &opener);
    let mut model = vec![0u8; 0];
    for (i, &(offset, len)) in [(5u64, 10usize), (60, 200), (0, 3), (500, 64), (191, 2)].iter().enumerate() {
        let chunk = payload(len, 10 + i as u64);
        layout.write(offset, &chunk).expect("write");
        let end = offset as usize + len;
        if model.len() < end {
            model.resize(end, 0);
        }
        model[offset as usize..end].copy_from_slice(&chunk);
    }
    assert_eq!(layout.size(), Some(model.len() as u64));

    let mut window = vec![0u8; 100];
    assert_eq!(layout.read(57, &mut window).expect("read window"), 100);
    assert_eq!(&window[..], &model[57..157]);
    assert_eq!(read_all(&mut layout, 2000), model);
}

#[test]
fn reads_are_clamped_to_file_size() {
    let opener = Arc::new(MemOpener::new());
    let mut layout = open(config("clamp", 3, 1), &opener);
    let data = payload(150, 7);
    layout.write(0, &data).expect("write");

    let mut buf = vec![0u8; 100];
    assert_eq!(layout.read(100, &mut buf).expect("tail read"), 50);
    assert_eq!(&buf[..50], &data[100..]);
    assert_eq!(layout.read(150, &mut buf).expect("read at end"), 0);
    assert_eq!(layout.read(4000, &mut buf).expect("read past end"), 0);
}

#[test]
fn streaming_writes_compute_parity_per_group() {
    let opener = Arc::new(MemOpener::new());
    let cfg = config("stream", 4, 1).with_streaming(true);
    let names = cfg.stripe_urls.clone();
    let data = payload(500, 8);

    let mut layout = open(cfg.clone(), &opener);
    for piece in data.chunks(50) {
        let offset = layout.size().unwrap_or(0);
        layout.write(offset, piece).expect("sequential write");
    }
    assert_eq!(
        opener.stripe(&names[3]).write_log(),
        vec![(WIDTH, WIDTH), (2 * WIDTH, WIDTH)],
        "two full groups got parity while streaming"
    );

    // A write that breaks the sequence falls back to sparse tracking.
    layout.write(10, &data[..20]).expect("rewrite");
    let mut model = data.clone();
    model.copy_within(0..20, 10);
    layout.close().expect("close");

    let mut again = open(cfg, &opener);
    for victim in &names {
        opener.stripe(victim).fail_all();
        assert_eq!(read_all(&mut again, 600), model, "degraded read with {victim} down");
        opener.stripe(victim).heal();
    }
}

#[test]
fn streaming_degraded_read_uses_buffered_group() {
    let opener = Arc::new(MemOpener::new());
    let cfg = config("stream-buf", 4, 1).with_streaming(true);
    let names = cfg.stripe_urls.clone();
    let data = payload(250, 9);

    let mut layout = open(cfg, &opener);
    layout.write(0, &data).expect("write");
    opener.stripe(&names[0]).set_faults(crate::channel::Faults {
        fail_reads: true,
        ..crate::channel::Faults::default()
    });
    let mut buf = vec![0u8; 58];
    assert_eq!(layout.read(192, &mut buf).expect("read buffered group"), 58);
    assert_eq!(&buf[..], &data[192..]);
    opener.stripe(&names[0]).heal();
}

#[test]
fn truncate_resizes_stripes_and_file() {
    let opener = Arc::new(MemOpener::new());
    let cfg = config("trunc", 4, 1);
    let names = cfg.stripe_urls.clone();
    let data = payload(500, 11);

    let mut layout = open(cfg.clone(), &opener);
    layout.write(0, &data).expect("write");
    layout.truncate(100).expect("truncate down");
    assert_eq!(layout.size(), Some(100));
    for name in &names {
        assert_eq!(opener.stripe(name).contents().len(), 128);
    }
    layout.close().expect("close");

    let mut layout = open(cfg, &opener);
    assert_eq!(layout.size(), Some(100));
    assert_eq!(read_all(&mut layout, 500), &data[..100]);

    layout.truncate(1000).expect("truncate up");
    let stat = layout.stat().expect("stat");
    assert_eq!(stat.size, 1000);
    assert_eq!(stat.stripes, 4);
    assert_eq!(stat.physical_size, 4 * 448);
}

#[test]
fn read_only_layout_refuses_updates_and_writes_nothing() {
    let opener = Arc::new(MemOpener::new());
    let cfg = config("ro", 4, 1);
    let names = cfg.stripe_urls.clone();
    let data = payload(300, 12);
    store(cfg.clone(), &opener, &data);
    corrupt_header(&opener, &names[1]);
    for name in &names {
        opener.stripe(name).reset_counters();
    }

    let mut layout = open(
        cfg.with_mode(OpenMode::ReadOnly).with_store_recovery(true),
        &opener,
    );
    assert!(matches!(layout.write(0, b"x"), Err(LayoutError::ReadOnly)));
    assert!(matches!(layout.truncate(0), Err(LayoutError::ReadOnly)));
    assert!(matches!(layout.recover_all(), Err(LayoutError::ReadOnly)));
    assert_eq!(read_all(&mut layout, 300), data);
    layout.close().expect("close");

    for name in &names {
        assert!(opener.stripe(name).write_log().is_empty(), "{name} was written");
    }
}

#[test]
fn state_machine_rejects_misuse() {
    let opener = Arc::new(MemOpener::new());
    let mut layout = RaidLayout::new(config("state", 3, 1), opener.clone(), Metrics::disabled());
    assert_eq!(layout.state(), LayoutState::Closed);
    assert!(matches!(layout.read(0, &mut [0u8; 4]), Err(LayoutError::NotOpen)));
    assert!(matches!(layout.close(), Err(LayoutError::NotOpen)));

    layout.open().expect("open");
    assert_eq!(layout.state(), LayoutState::Open);
    assert!(matches!(layout.open(), Err(LayoutError::AlreadyOpen)));
    layout.close().expect("close");
    assert_eq!(layout.state(), LayoutState::Closed);
    assert!(layout.stripe_health().is_empty());

    let narrow = LayoutConfig::raid(urls("narrow", 3), 1, 32).expect("config");
    let mut layout = RaidLayout::new(narrow, opener.clone(), Metrics::disabled());
    assert!(matches!(layout.open(), Err(LayoutError::Config(_))));

    let single = LayoutConfig::raid(urls("single", 1), 1, WIDTH).expect("config");
    let mut layout = RaidLayout::new(single, opener.clone(), Metrics::disabled());
    assert!(matches!(layout.open(), Err(LayoutError::Config(_))));

    let plain = LayoutConfig {
        kind: LayoutKind::Plain,
        ..config("plain", 1, 1)
    };
    let mut layout = RaidLayout::new(plain, opener, Metrics::disabled());
    assert!(matches!(layout.open(), Err(LayoutError::Config(_))));
}

#[test]
fn failed_stripe_open_closes_the_others() {
    let opener = Arc::new(MemOpener::new());
    let cfg = config("openfail", 4, 1);
    let names = cfg.stripe_urls.clone();
    opener.stripe(&names[2]).set_faults(crate::channel::Faults {
        fail_open: true,
        ..crate::channel::Faults::default()
    });

    let mut layout = RaidLayout::new(cfg, opener.clone(), Metrics::disabled());
    let err = layout.open().expect_err("stripe 2 cannot be opened");
    assert_eq!(err.stripe(), Some(2));
    assert!(opener.stripe(&names[0]).is_closed());
    assert!(opener.stripe(&names[1]).is_closed());
}

#[test]
fn factory_builds_raid_layouts_and_remove_clears_stripes() {
    let opener = Arc::new(MemOpener::new());
    let cfg = config("factory", 6, 2);
    let names = cfg.stripe_urls.clone();
    let mut layout = open_layout(cfg, opener.clone(), Metrics::disabled()).expect("open layout");
    assert_eq!(layout.kind(), LayoutKind::Raid6);

    layout.write(0, &payload(400, 13)).expect("write");
    layout.sync().expect("sync");
    layout.fallocate(2000).expect("fallocate");
    for name in &names {
        assert!(opener.stripe(name).contents().len() >= 64 + 8 * 64);
    }
    layout.fdeallocate(0, 2000).expect("fdeallocate");
    layout.remove().expect("remove");
    for name in &names {
        assert!(opener.stripe(name).is_removed());
    }
    assert!(matches!(layout.close(), Err(LayoutError::NotOpen)));
}

#[test]
fn metrics_report_layout_and_stripe_operations() {
    let opener = Arc::new(MemOpener::new());
    let sink = Arc::new(RecordingSink::default());
    let mut layout = RaidLayout::new(config("metrics", 4, 1), opener, Metrics::new(sink.clone()));
    layout.open().expect("open");
    layout.write(0, &payload(300, 14)).expect("write");
    read_all(&mut layout, 300);

    let ops = sink.layout_ops();
    assert!(ops.iter().any(|op| op.op == IoOpType::Write && op.bytes == 300 && !op.error));
    assert!(ops.iter().any(|op| op.op == IoOpType::Read && op.bytes == 300 && !op.degraded));
    let stripe_ops = sink.stripe_ops();
    assert!(!stripe_ops.is_empty());
    assert!(stripe_ops.iter().all(|op| op.stripe < 4 && !op.error));
}

#[test]
fn file_backed_stripes_survive_reopen() {
    let dir = TempDir::new().expect("tmp dir");
    let names: Vec<String> = (0..5)
        .map(|i| format!("file://{}", dir.path().join(format!("stripe-{i}.dat")).display()))
        .collect();
    let cfg = LayoutConfig::raid(names.clone(), 1, 128).expect("config");
    let data = payload(10_000, 15);

    let opener: Arc<FileOpener> = Arc::new(FileOpener);
    let mut layout = RaidLayout::new(cfg.clone(), opener.clone(), Metrics::disabled());
    layout.open().expect("open");
    layout.write(0, &data).expect("write");
    layout.close().expect("close");

    let expected = Geometry::from_config(&cfg).stripe_size_for(10_000);
    assert_eq!(expected, 20 * 128 + 128);
    for name in &names {
        let len = std::fs::metadata(FileOpener::path_of(name)).expect("stripe file").len();
        assert_eq!(len, expected, "{name}");
    }

    let mut layout = RaidLayout::new(cfg.with_mode(OpenMode::ReadOnly), opener, Metrics::disabled());
    layout.open().expect("reopen");
    assert_eq!(layout.size(), Some(10_000));
    let mut back = vec![0u8; 10_000];
    assert_eq!(layout.read(0, &mut back).expect("read"), 10_000);
    assert_eq!(back, data);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn random_writes_survive_a_lost_stripe(
        writes in prop::collection::vec((0u64..700, 1usize..300), 1..6),
        streaming in any::<bool>(),
        victim in 0usize..4,
        seed in any::<u64>(),
    ) {
        let opener = Arc::new(MemOpener::new());
        let cfg = config("prop", 4, 1).with_streaming(streaming);
        let names = cfg.stripe_urls.clone();
        let mut model = Vec::new();

        let mut layout = open(cfg.clone(), &opener);
        for (i, &(offset, len)) in writes.iter().enumerate() {
            let chunk = payload(len, seed.wrapping_add(i as u64));
            layout.write(offset, &chunk).expect("write");
            let end = offset as usize + len;
            if model.len() < end {
                model.resize(end, 0);
            }
            model[offset as usize..end].copy_from_slice(&chunk);
        }
        prop_assert_eq!(read_all(&mut layout, 1200), model.clone());
        layout.close().expect("close");

        let mut layout = open(cfg, &opener);
        opener.stripe(&names[victim]).fail_all();
        prop_assert_eq!(read_all(&mut layout, 1200), model);
        opener.stripe(&names[victim]).heal();
    }
}

#[test]
fn requests_past_the_addressable_range_are_rejected() {
    let opener = Arc::new(MemOpener::new());
    let mut layout = open(config("range", 4, 1), &opener);

    let err = layout.write(u64::MAX - 10, &[1; 100]).expect_err("end overflows");
    assert!(matches!(
        err,
        LayoutError::InvalidRange { offset, length: 100 } if offset == u64::MAX - 10
    ));
    let limit = layout.geometry().max_file_size();
    assert!(matches!(layout.write(limit, &[1]), Err(LayoutError::InvalidRange { .. })));
    assert!(matches!(layout.truncate(u64::MAX), Err(LayoutError::InvalidRange { .. })));
    let mut buf = vec![0u8; 100];
    assert!(matches!(
        layout.read_force_recovery(u64::MAX - 5, &mut buf),
        Err(LayoutError::InvalidRange { .. })
    ));
    assert_eq!(layout.size(), None, "rejected requests change nothing");

    layout.write(0, &[7; 10]).expect("write in range");
    assert_eq!(layout.read(u64::MAX - 5, &mut buf).expect("read past end"), 0);
}
