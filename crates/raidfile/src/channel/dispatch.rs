use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam::channel::{self, Sender};
use tracing::{debug, trace};

use crate::channel::{StripeChannel, read_full};
use crate::metrics::{IoOpType, Metrics};
use crate::tracker::PendingOp;

enum Request {
    Read { offset: u64, len: usize, op: PendingOp },
    Write { offset: u64, data: Vec<u8>, op: PendingOp },
}

/// AsyncStripe runs the requests for one stripe on a dedicated worker thread and resolves
/// each request's [`PendingOp`] when it finishes.
pub struct AsyncStripe {
    index: usize,
    channel: Arc<dyn StripeChannel>,
    tx: Option<Sender<Request>>,
    worker: Option<JoinHandle<()>>,
}

impl AsyncStripe {
    /// Start the worker for physical stripe `index`.
    ///
    /// # Errors
    /// Returns an error if the worker thread cannot be spawned.
    pub fn spawn(index: usize, channel: Arc<dyn StripeChannel>, metrics: Metrics) -> io::Result<Self> {
        let (tx, rx) = channel::unbounded::<Request>();
        let worker_channel = Arc::clone(&channel);
        let worker = thread::Builder::new()
            .name(format!("stripe-{index}"))
            .spawn(move || {
                for request in rx {
                    serve(index, worker_channel.as_ref(), &metrics, request);
                }
                trace!(stripe = index, "stripe worker exiting");
            })?;
        debug!(stripe = index, url = channel.url(), "stripe worker started");
        Ok(Self {
            index,
            channel,
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn channel(&self) -> &Arc<dyn StripeChannel> {
        &self.channel
    }

    /// Queue a read of `len` bytes. The payload is always `len` bytes long; bytes
    /// past the end of the stripe read as zero.
    pub fn read_async(&self, offset: u64, len: usize, op: PendingOp) {
        self.submit(Request::Read { offset, len, op });
    }

    pub fn write_async(&self, offset: u64, data: Vec<u8>, op: PendingOp) {
        self.submit(Request::Write { offset, data, op });
    }

    fn submit(&self, request: Request) {
        // A request that cannot be queued is dropped, which resolves its handle as failed.
        if let Some(tx) = &self.tx {
            let _ = tx.send(request);
        }
    }
}

fn serve(index: usize, channel: &dyn StripeChannel, metrics: &Metrics, request: Request) {
    let started = Instant::now();
    match request {
        Request::Read { offset, len, op } => {
            let mut buf = vec![0u8; len];
            let result = read_full(channel, offset, &mut buf).map(|_| Some(buf));
            metrics.stripe(index, IoOpType::Read, len as u64, started, result.is_err());
            op.complete(result);
        }
        Request::Write { offset, data, op } => {
            let result = channel.write_at(offset, &data).map(|()| None);
            metrics.stripe(index, IoOpType::Write, data.len() as u64, started, result.is_err());
            op.complete(result);
        }
    }
}

impl Drop for AsyncStripe {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
