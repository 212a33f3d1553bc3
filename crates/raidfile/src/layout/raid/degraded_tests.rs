use std::sync::Arc;
use std::time::Duration;

use super::raid_tests::{WIDTH, config, open, payload, read_all, store};
use crate::channel::{Faults, MemOpener, OpenMode};
use crate::error::LayoutError;
use crate::header::HeaderState;
use crate::layout::Layout;
use crate::layout::raid::RaidLayout;
use crate::metrics::{IoOpType, Metrics, RecordingSink};

fn read_faults() -> Faults {
    Faults {
        fail_reads: true,
        ..Faults::default()
    }
}

#[test]
fn any_single_lost_stripe_is_rebuilt() {
    let opener = Arc::new(MemOpener::new());
    let cfg = config("deg5", 4, 1);
    let names = cfg.stripe_urls.clone();
    let data = payload(1000, 21);
    store(cfg.clone(), &opener, &data);

    let sink = Arc::new(RecordingSink::default());
    let mut layout = RaidLayout::new(cfg, opener.clone(), Metrics::new(sink.clone()));
    layout.open().expect("open");
    for victim in &names {
        opener.stripe(victim).fail_all();
        assert_eq!(read_all(&mut layout, 1000), data, "{victim} down");

        let mut window = vec![0u8; 77];
        assert_eq!(layout.read(333, &mut window).expect("window read"), 77);
        assert_eq!(&window[..], &data[333..410]);
        opener.stripe(victim).heal();
    }

    let reads: Vec<_> = sink
        .layout_ops()
        .into_iter()
        .filter(|op| op.op == IoOpType::Read)
        .collect();
    assert!(reads.iter().all(|op| !op.error));
    assert!(reads.iter().any(|op| op.degraded));
}

#[test]
fn one_stripe_too_many_is_unrecoverable() {
    let opener = Arc::new(MemOpener::new());
    let cfg = config("deg5x2", 4, 1);
    let names = cfg.stripe_urls.clone();
    let data = payload(600, 22);
    store(cfg.clone(), &opener, &data);

    let mut layout = open(cfg, &opener);
    opener.stripe(&names[0]).fail_all();
    opener.stripe(&names[3]).fail_all();
    let mut buf = vec![0u8; 600];
    let err = layout.read(0, &mut buf).expect_err("two lost stripes with one parity");
    assert!(matches!(
        err,
        LayoutError::UnrecoverableGroup {
            group_offset: 0,
            missing: 2,
            parity: 1
        }
    ));

    // The session stays usable once the stripes come back.
    opener.stripe(&names[0]).heal();
    opener.stripe(&names[3]).heal();
    assert_eq!(read_all(&mut layout, 600), data);
}

#[test]
fn double_parity_survives_any_two_lost_stripes() {
    let opener = Arc::new(MemOpener::new());
    let cfg = config("deg6", 6, 2);
    let names = cfg.stripe_urls.clone();
    let data = payload(1500, 23);
    store(cfg.clone(), &opener, &data);

    let mut layout = open(cfg, &opener);
    for a in 0..names.len() {
        for b in a + 1..names.len() {
            opener.stripe(&names[a]).fail_all();
            opener.stripe(&names[b]).fail_all();
            assert_eq!(read_all(&mut layout, 1500), data, "stripes {a} and {b} down");
            opener.stripe(&names[a]).heal();
            opener.stripe(&names[b]).heal();
        }
    }

    for name in &names[..3] {
        opener.stripe(name).fail_all();
    }
    let mut buf = vec![0u8; 1500];
    let err = layout.read(0, &mut buf).expect_err("three lost stripes with two parity");
    assert!(matches!(err, LayoutError::UnrecoverableGroup { missing: 3, parity: 2, .. }));
    for name in &names[..3] {
        opener.stripe(name).heal();
    }
}

#[test]
fn unreadable_header_at_open_is_absorbed_by_parity() {
    let opener = Arc::new(MemOpener::new());
    let cfg = config("deghdr", 4, 1);
    let names = cfg.stripe_urls.clone();
    let data = payload(700, 24);
    store(cfg.clone(), &opener, &data);

    opener.stripe(&names[1]).set_faults(read_faults());
    let mut layout = open(cfg, &opener);
    assert_eq!(layout.size(), Some(700));
    assert_eq!(layout.stripe_map().logical_of(1), 1);
    assert_eq!(read_all(&mut layout, 700), data);

    let health = layout.stripe_health();
    assert_eq!(health[1].header_state, HeaderState::Corrupt);
    assert!(health[1].header_repaired);
    assert!(health[1].io_errors > 0);
    assert!(health.iter().filter(|h| h.physical != 1).all(|h| h.is_healthy()));

    opener.stripe(&names[1]).heal();
    layout.close().expect("close");
}

#[test]
fn degraded_read_stores_rebuilt_blocks() {
    let opener = Arc::new(MemOpener::new());
    let cfg = config("degstore", 4, 1).with_store_recovery(true);
    let names = cfg.stripe_urls.clone();
    let data = payload(400, 25);
    store(cfg.clone(), &opener, &data);
    let original = opener.stripe(&names[2]).contents();

    let mut layout = open(cfg, &opener);
    opener.stripe(&names[2]).set_faults(read_faults());
    opener.stripe(&names[2]).reset_counters();
    assert_eq!(read_all(&mut layout, 400), data);

    let log = opener.stripe(&names[2]).write_log();
    assert!(!log.is_empty(), "rebuilt blocks are written back");
    assert!(log.iter().all(|&(offset, len)| offset >= WIDTH && len == WIDTH));
    opener.stripe(&names[2]).heal();
    assert_eq!(opener.stripe(&names[2]).contents(), original);
}

#[test]
fn slow_stripe_is_treated_as_failed() {
    let opener = Arc::new(MemOpener::new());
    let cfg = config("slow", 4, 1);
    let names = cfg.stripe_urls.clone();
    let data = payload(400, 26);
    store(cfg.clone(), &opener, &data);

    let timeout = Duration::from_millis(30);
    let mut reader = open(
        cfg.clone().with_mode(OpenMode::ReadOnly).with_timeout(timeout),
        &opener,
    );
    opener.stripe(&names[2]).set_faults(Faults {
        delay: Some(Duration::from_millis(100)),
        ..Faults::default()
    });
    assert_eq!(read_all(&mut reader, 400), data);
    assert!(reader.stripe_health()[2].io_errors > 0);

    let mut writer = open(cfg.with_timeout(timeout), &opener);
    let err = writer.write(0, &data).expect_err("write must time out");
    assert!(matches!(err, LayoutError::Timeout { stripe: 2, .. }));
    opener.stripe(&names[2]).heal();
}

#[test]
fn recover_all_rebuilds_a_replaced_stripe() {
    let opener = Arc::new(MemOpener::new());
    let cfg = config("replace", 4, 1);
    let names = cfg.stripe_urls.clone();
    let data = payload(1000, 27);
    store(cfg.clone(), &opener, &data);

    let replaced = opener.stripe(&names[1]);
    let original = replaced.contents();
    replaced.overwrite(0, &vec![0u8; original.len()]);

    let mut layout = open(cfg.with_store_recovery(true), &opener);
    assert_eq!(layout.stripe_health()[1].header_state, HeaderState::New);
    assert_eq!(layout.recover_all().expect("recover all"), 6);
    assert_eq!(read_all(&mut layout, 1000), data);
    layout.close().expect("close");

    assert_eq!(replaced.contents(), original);
}

#[test]
fn forced_recovery_reads_through_a_lost_stripe() {
    let opener = Arc::new(MemOpener::new());
    let cfg = config("force", 4, 1).with_store_recovery(true);
    let names = cfg.stripe_urls.clone();
    let data = payload(800, 28);
    store(cfg.clone(), &opener, &data);

    let mut layout = open(cfg, &opener);
    opener.stripe(&names[0]).set_faults(read_faults());
    opener.stripe(&names[0]).reset_counters();

    let mut buf = vec![0u8; 300];
    assert_eq!(layout.read_force_recovery(100, &mut buf).expect("forced read"), 300);
    assert_eq!(&buf[..], &data[100..400]);
    let stored = opener.stripe(&names[0]).write_log().len();
    assert!(stored > 0);

    // Groups already rebuilt in this session are not rebuilt again.
    opener.stripe(&names[0]).heal();
    assert_eq!(layout.read_force_recovery(100, &mut buf).expect("second read"), 300);
    assert_eq!(&buf[..], &data[100..400]);
    assert_eq!(opener.stripe(&names[0]).write_log().len(), stored);
}

#[test]
fn lost_stripe_in_group_without_parity_fails_instead_of_guessing() {
    let opener = Arc::new(MemOpener::new());
    let cfg = config("pending", 4, 1);
    let names = cfg.stripe_urls.clone();
    let data = payload(100, 29);

    let mut layout = open(cfg, &opener);
    layout.write(0, &data).expect("partial group write");
    opener.stripe(&names[0]).fail_all();
    let mut buf = vec![0u8; 100];
    let err = layout.read(0, &mut buf).expect_err("group parity was never written");
    assert!(matches!(err, LayoutError::RecoveryFailed { offset: 0, length: 100 }));

    // The group stays pending and gets its parity once the stripe is back.
    opener.stripe(&names[0]).heal();
    assert_eq!(read_all(&mut layout, 100), data);
    layout.close().expect("close");

    let mut again = open(config("pending", 4, 1), &opener);
    opener.stripe(&names[0]).fail_all();
    assert_eq!(read_all(&mut again, 100), data);
    opener.stripe(&names[0]).heal();
}

#[test]
fn overwrite_after_parity_fails_degraded_read_of_that_group_only() {
    let opener = Arc::new(MemOpener::new());
    let cfg = config("overwrite", 4, 1);
    let names = cfg.stripe_urls.clone();
    let mut model = payload(384, 30);

    let mut layout = open(cfg, &opener);
    layout.write(0, &model).expect("two full groups");
    let patch = payload(10, 31);
    layout.write(197, &patch).expect("overwrite inside group 1");
    model[197..207].copy_from_slice(&patch);

    opener.stripe(&names[0]).fail_all();
    let mut first = vec![0u8; 192];
    assert_eq!(layout.read(0, &mut first).expect("group 0 parity is current"), 192);
    assert_eq!(&first[..], &model[..192]);

    let mut second = vec![0u8; 192];
    let err = layout
        .read(192, &mut second)
        .expect_err("group 1 parity predates the overwrite");
    assert!(matches!(err, LayoutError::RecoveryFailed { offset: 192, .. }));
    opener.stripe(&names[0]).heal();
    layout.close().expect("close");

    let mut again = open(config("overwrite", 4, 1), &opener);
    opener.stripe(&names[0]).fail_all();
    assert_eq!(read_all(&mut again, 384), model);
    opener.stripe(&names[0]).heal();
}

#[test]
fn degraded_read_inside_the_write_session_uses_fresh_parity() {
    let opener = Arc::new(MemOpener::new());
    let cfg = config("session", 4, 1);
    let names = cfg.stripe_urls.clone();
    let data = payload(576, 32);

    let mut layout = open(cfg, &opener);
    for piece in data.chunks(96) {
        let offset = layout.size().unwrap_or(0);
        layout.write(offset, piece).expect("sparse write");
    }
    for victim in &names {
        opener.stripe(victim).fail_all();
        assert_eq!(read_all(&mut layout, 576), data, "{victim} down");
        opener.stripe(victim).heal();
    }
}

#[test]
fn unfinished_stream_group_over_older_data_is_not_rebuilt() {
    let opener = Arc::new(MemOpener::new());
    let cfg = config("restream", 4, 1);
    let names = cfg.stripe_urls.clone();
    store(cfg.clone(), &opener, &payload(192, 33));

    let mut layout = open(cfg.with_streaming(true), &opener);
    layout.write(0, &payload(64, 34)).expect("stream the first block");
    opener.stripe(&names[2]).fail_all();
    let mut buf = vec![0u8; 64];
    let err = layout
        .read(128, &mut buf)
        .expect_err("parity still describes the old first block");
    assert!(matches!(err, LayoutError::RecoveryFailed { offset: 128, length: 64 }));
    opener.stripe(&names[2]).heal();
}
