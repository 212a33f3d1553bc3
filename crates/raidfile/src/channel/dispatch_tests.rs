use crate::channel::{AsyncStripe, Faults, MemStripe, StripeChannel};
use crate::metrics::{IoOpType, Metrics, RecordingSink};
use crate::tracker::AsyncCompletionTracker;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn async_write_then_read() {
    let mem = Arc::new(MemStripe::new("mem://0"));
    let sink = Arc::new(RecordingSink::default());
    let stripe = AsyncStripe::spawn(0, mem.clone(), Metrics::new(sink.clone())).expect("spawn");
    let mut tracker = AsyncCompletionTracker::new();

    let op = tracker.register(64, 4);
    stripe.write_async(64, b"abcd".to_vec(), op);
    assert!(tracker.wait_all(WAIT));
    assert_eq!(&mem.contents()[64..68], b"abcd");

    tracker.reset();
    let op = tracker.register(62, 8);
    let ticket = op.ticket();
    stripe.read_async(62, 8, op);
    assert!(tracker.wait_all(WAIT));
    let data = tracker.take_data(ticket).expect("payload");
    assert_eq!(data, vec![0, 0, b'a', b'b', b'c', b'd', 0, 0], "past the end reads zeros");

    let ops = sink.stripe_ops();
    assert_eq!(ops.len(), 2);
    assert_eq!(ops[0].op, IoOpType::Write);
    assert_eq!(ops[1].op, IoOpType::Read);
}

#[test]
fn failures_reach_the_tracker() {
    let mem = Arc::new(MemStripe::new("mem://1"));
    mem.fail_all();
    let stripe = AsyncStripe::spawn(1, mem.clone(), Metrics::disabled()).expect("spawn");
    let mut tracker = AsyncCompletionTracker::new();

    stripe.read_async(0, 16, tracker.register(0, 16));
    stripe.write_async(16, vec![1; 16], tracker.register(16, 16));
    assert!(!tracker.wait_all(WAIT));
    assert_eq!(tracker.errors().len(), 2);
}

#[test]
fn slow_stripe_times_out() {
    let mem = Arc::new(MemStripe::new("mem://2"));
    mem.set_faults(Faults {
        delay: Some(Duration::from_millis(200)),
        ..Faults::default()
    });
    let stripe = AsyncStripe::spawn(2, mem.clone(), Metrics::disabled()).expect("spawn");
    let mut tracker = AsyncCompletionTracker::new();

    stripe.read_async(0, 8, tracker.register(0, 8));
    assert!(!tracker.wait_all(Duration::from_millis(10)));
    assert_eq!(tracker.errors().get(&0), Some(&8));
    drop(stripe);
    assert_eq!(mem.reads(), 1, "worker finishes the request before exiting");
}

#[test]
fn channel_is_shared_with_the_worker() {
    let mem = Arc::new(MemStripe::new("mem://3"));
    let stripe = AsyncStripe::spawn(3, mem.clone(), Metrics::disabled()).expect("spawn");
    assert_eq!(stripe.index(), 3);
    assert_eq!(stripe.channel().url(), "mem://3");
}
