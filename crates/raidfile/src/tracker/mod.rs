//! Per-stripe collection of outstanding asynchronous requests.
//!
//! Every request dispatched to a stripe carries a [`PendingOp`] registered with that stripe's
//! [`AsyncCompletionTracker`]. The handle resolves exactly once: explicitly through
//! [`PendingOp::complete`], or as a failure when it is dropped unresolved. Completions travel
//! over a channel owned by the tracker, so a late completion for a batch that was abandoned
//! (timed out or reset) lands in a dropped receiver instead of touching freed state.


use std::collections::{BTreeMap, HashMap};
use std::io;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use tracing::warn;

use crate::error::LayoutError;

struct Completion {
    ticket: u64,
    result: io::Result<Option<Vec<u8>>>,
}

/// PendingOp is the completion handle handed to one asynchronous stripe request.
pub struct PendingOp {
    ticket: u64,
    offset: u64,
    length: u64,
    tx: Option<Sender<Completion>>,
}

impl PendingOp {
    #[must_use]
    pub const fn ticket(&self) -> u64 {
        self.ticket
    }

    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub const fn length(&self) -> u64 {
        self.length
    }

    /// Resolve the request. Reads pass their payload, writes pass `None`.
    pub fn complete(mut self, result: io::Result<Option<Vec<u8>>>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Completion {
                ticket: self.ticket,
                result,
            });
        }
    }
}

impl Drop for PendingOp {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Completion {
                ticket: self.ticket,
                result: Err(io::Error::new(
                    io::ErrorKind::Interrupted,
                    "request dropped before completion",
                )),
            });
        }
    }
}

#[derive(Debug)]
pub enum TrackedErrorKind {
    Io(io::Error),
    TimedOut,
}

/// TrackedError is the first failure seen by a tracker since its last reset.
#[derive(Debug)]
pub struct TrackedError {
    pub offset: u64,
    pub length: u64,
    pub kind: TrackedErrorKind,
}

impl TrackedError {
    /// Attribute the failure to physical stripe `stripe`.
    #[must_use]
    pub fn into_layout_error(self, stripe: usize) -> LayoutError {
        match self.kind {
            TrackedErrorKind::Io(source) => {
                LayoutError::stripe_io(stripe, self.offset, self.length, source)
            }
            TrackedErrorKind::TimedOut => LayoutError::Timeout {
                stripe,
                offset: self.offset,
                length: self.length,
            },
        }
    }
}

#[derive(Copy, Clone)]
struct Outstanding {
    offset: u64,
    length: u64,
}

/// AsyncCompletionTracker collects the outcome of every request registered for one stripe.
pub struct AsyncCompletionTracker {
    tx: Sender<Completion>,
    rx: Receiver<Completion>,
    next_ticket: u64,
    outstanding: HashMap<u64, Outstanding>,
    errors: BTreeMap<u64, u64>,
    data: HashMap<u64, Vec<u8>>,
    first_error: Option<TrackedError>,
}

impl Default for AsyncCompletionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncCompletionTracker {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            tx,
            rx,
            next_ticket: 0,
            outstanding: HashMap::new(),
            errors: BTreeMap::new(),
            data: HashMap::new(),
            first_error: None,
        }
    }

    /// Register a new outstanding request.
    pub fn register(&mut self, offset: u64, length: u64) -> PendingOp {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.outstanding.insert(ticket, Outstanding { offset, length });
        PendingOp {
            ticket,
            offset,
            length,
            tx: Some(self.tx.clone()),
        }
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.outstanding.len()
    }

    /// Block until every registered request resolved or `timeout` elapsed.
    ///
    /// Requests still outstanding at the deadline are recorded as failed ranges and abandoned.
    /// Returns `false` if any request since the last reset failed.
    pub fn wait_all(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.outstanding.is_empty() {
            match self.rx.recv_deadline(deadline) {
                Ok(completion) => self.absorb(completion),
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {
                    self.abandon_outstanding();
                    break;
                }
            }
        }
        self.ok()
    }

    #[must_use]
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }

    #[must_use]
    pub const fn errors(&self) -> &BTreeMap<u64, u64> {
        &self.errors
    }

    /// Hand out the payload of a completed read.
    pub fn take_data(&mut self, ticket: u64) -> Option<Vec<u8>> {
        self.data.remove(&ticket)
    }

    pub fn take_first_error(&mut self) -> Option<TrackedError> {
        self.first_error.take()
    }

    /// Abandon whatever is still in flight and clear all recorded outcomes.
    pub fn reset(&mut self) {
        if !self.outstanding.is_empty() {
            self.renew_queue();
            self.outstanding.clear();
        }
        self.errors.clear();
        self.data.clear();
        self.first_error = None;
    }

    fn absorb(&mut self, completion: Completion) {
        let Some(op) = self.outstanding.remove(&completion.ticket) else {
            return;
        };
        match completion.result {
            Ok(Some(payload)) => {
                self.data.insert(completion.ticket, payload);
            }
            Ok(None) => {}
            Err(e) => self.record(op, TrackedErrorKind::Io(e)),
        }
    }

    fn abandon_outstanding(&mut self) {
        let timed_out: Vec<Outstanding> = self.outstanding.drain().map(|(_, op)| op).collect();
        for op in timed_out {
            warn!(offset = op.offset, length = op.length, "stripe request timed out");
            self.record(op, TrackedErrorKind::TimedOut);
        }
        self.renew_queue();
    }

    fn record(&mut self, op: Outstanding, kind: TrackedErrorKind) {
        let len = self.errors.entry(op.offset).or_insert(0);
        *len = (*len).max(op.length);
        if self.first_error.is_none() {
            self.first_error = Some(TrackedError {
                offset: op.offset,
                length: op.length,
                kind,
            });
        }
    }

    /// Late completions for abandoned requests go to the old receiver, which is dropped here.
    fn renew_queue(&mut self) {
        let (tx, rx) = channel::unbounded();
        self.tx = tx;
        self.rx = rx;
    }
}
