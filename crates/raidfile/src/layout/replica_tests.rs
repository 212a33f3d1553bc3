use std::sync::Arc;
use std::time::Duration;

use crate::channel::{Faults, MemOpener};
use crate::config::{LayoutConfig, LayoutKind};
use crate::error::LayoutError;
use crate::layout::{Layout, ReplicaLayout, open_layout};
use crate::metrics::{Metrics, RecordingSink};

fn replica_config(n: usize) -> LayoutConfig {
    LayoutConfig {
        kind: LayoutKind::Replica,
        stripe_urls: (0..n).map(|i| format!("mem://replica-{i}")).collect(),
        timeout: Duration::from_millis(500),
        ..LayoutConfig::default()
    }
}

#[test]
fn writes_land_on_every_replica() {
    let opener = Arc::new(MemOpener::new());
    let mut layout = open_layout(replica_config(3), opener.clone(), Metrics::disabled())
        .expect("open replica layout");
    layout.write(0, b"replicated").expect("write");
    layout.write(4, b"ICA").expect("overwrite");
    layout.close().expect("close");

    for i in 0..3 {
        let stripe = opener.stripe(&format!("mem://replica-{i}"));
        assert_eq!(stripe.contents(), b"replICAted", "replica {i} diverged");
        assert!(stripe.is_closed());
    }
}

#[test]
fn read_falls_back_to_next_replica() {
    let opener = Arc::new(MemOpener::new());
    let sink = Arc::new(RecordingSink::default());
    let mut layout = ReplicaLayout::new(replica_config(2), opener.clone(), Metrics::new(sink.clone()));
    layout.open().expect("open");
    layout.write(0, b"payload").expect("write");

    opener.stripe("mem://replica-0").fail_all();
    let mut buf = [0u8; 7];
    assert_eq!(layout.read(0, &mut buf).expect("degraded read"), 7);
    assert_eq!(&buf, b"payload");

    let last = sink.layout_ops().pop().expect("read recorded");
    assert!(last.degraded);
    assert!(!last.error);

    opener.stripe("mem://replica-1").fail_all();
    let err = layout.read(0, &mut buf).expect_err("no healthy replica left");
    assert_eq!(err.stripe(), Some(0));
}

#[test]
fn write_fails_when_any_replica_fails() {
    let opener = Arc::new(MemOpener::new());
    let mut layout = ReplicaLayout::new(replica_config(3), opener.clone(), Metrics::disabled());
    layout.open().expect("open");
    opener.stripe("mem://replica-2").set_faults(Faults {
        fail_writes: true,
        ..Faults::default()
    });

    let err = layout.write(0, b"abc").expect_err("one replica refuses writes");
    assert!(matches!(err, LayoutError::StripeIo { stripe: 2, .. }));
    assert_eq!(layout.size(), Some(0), "failed write must not grow the file");
}

#[test]
fn slow_replica_times_out() {
    let opener = Arc::new(MemOpener::new());
    let config = replica_config(2).with_timeout(Duration::from_millis(20));
    let mut layout = ReplicaLayout::new(config, opener.clone(), Metrics::disabled());
    layout.open().expect("open");
    opener.stripe("mem://replica-1").set_faults(Faults {
        delay: Some(Duration::from_millis(300)),
        ..Faults::default()
    });

    let err = layout.write(0, b"late").expect_err("write must time out");
    assert!(matches!(err, LayoutError::Timeout { stripe: 1, .. }));
}

#[test]
fn size_comes_from_first_replica() {
    let opener = Arc::new(MemOpener::new());
    opener.stripe("mem://replica-0").overwrite(0, &[7u8; 42]);
    let mut layout = ReplicaLayout::new(replica_config(2), opener, Metrics::disabled());
    layout.open().expect("open");
    assert_eq!(layout.size(), Some(42));

    layout.truncate(10).expect("truncate");
    let stat = layout.stat().expect("stat");
    assert_eq!(stat.size, 10);
    assert_eq!(stat.stripes, 2);
    assert_eq!(stat.physical_size, 20);
}
