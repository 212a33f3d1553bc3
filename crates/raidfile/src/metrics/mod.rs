//! Operation metrics. Layouts report through a [`Metrics`] handle injected at construction; a
//! handle without a sink records nothing.


use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IoOpType {
    Read,
    Write,
    Truncate,
    Sync,
}

/// One request against a single physical stripe.
#[derive(Clone, Debug)]
pub struct StripeOp {
    pub stripe: usize,
    pub op: IoOpType,
    pub bytes: u64,
    pub latency_seconds: f64,
    pub error: bool,
}

/// One logical operation against the whole layout.
#[derive(Copy, Clone, Debug)]
pub struct LayoutOp {
    pub op: IoOpType,
    pub bytes: u64,
    pub latency_seconds: f64,
    pub error: bool,
    /// The operation needed parity reconstruction.
    pub degraded: bool,
}

pub trait MetricsSink: Send + Sync + 'static {
    fn record_stripe_op(&self, op: StripeOp);
    fn record_layout_op(&self, op: LayoutOp);
}

/// Metrics is a cheap, cloneable handle to an optional sink.
#[derive(Clone, Default)]
pub struct Metrics {
    sink: Option<Arc<dyn MetricsSink>>,
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl Metrics {
    #[must_use]
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self { sink: Some(sink) }
    }

    #[must_use]
    pub const fn disabled() -> Self {
        Self { sink: None }
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    pub fn record_stripe_op(&self, op: StripeOp) {
        if let Some(sink) = &self.sink {
            sink.record_stripe_op(op);
        }
    }

    pub fn record_layout_op(&self, op: LayoutOp) {
        if let Some(sink) = &self.sink {
            sink.record_layout_op(op);
        }
    }

    /// Record a stripe request that started at `started`.
    pub(crate) fn stripe(&self, stripe: usize, op: IoOpType, bytes: u64, started: Instant, error: bool) {
        if self.is_enabled() {
            self.record_stripe_op(StripeOp {
                stripe,
                op,
                bytes,
                latency_seconds: started.elapsed().as_secs_f64(),
                error,
            });
        }
    }

    pub(crate) fn layout(&self, op: IoOpType, bytes: u64, started: Instant, error: bool, degraded: bool) {
        if self.is_enabled() {
            self.record_layout_op(LayoutOp {
                op,
                bytes,
                latency_seconds: started.elapsed().as_secs_f64(),
                error,
                degraded,
            });
        }
    }
}

/// RecordingSink keeps every reported operation in memory.
#[derive(Default)]
pub struct RecordingSink {
    stripe_ops: Mutex<Vec<StripeOp>>,
    layout_ops: Mutex<Vec<LayoutOp>>,
}

impl RecordingSink {
    #[must_use]
    pub fn stripe_ops(&self) -> Vec<StripeOp> {
        self.stripe_ops.lock().clone()
    }

    #[must_use]
    pub fn layout_ops(&self) -> Vec<LayoutOp> {
        self.layout_ops.lock().clone()
    }
}

impl MetricsSink for RecordingSink {
    fn record_stripe_op(&self, op: StripeOp) {
        self.stripe_ops.lock().push(op);
    }

    fn record_layout_op(&self, op: LayoutOp) {
        self.layout_ops.lock().push(op);
    }
}
