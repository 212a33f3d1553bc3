use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::channel::{OpenMode, StripeChannel, StripeOpener, StripeStat, closed_error};

/// Faults injected into a [`MemStripe`].
#[derive(Clone, Debug, Default)]
pub struct Faults {
    pub fail_reads: bool,
    pub fail_writes: bool,
    pub fail_open: bool,
    /// Applied before every read and write.
    pub delay: Option<Duration>,
}

impl Faults {
    #[must_use]
    pub fn all() -> Self {
        Self {
            fail_reads: true,
            fail_writes: true,
            fail_open: false,
            delay: None,
        }
    }
}

/// MemStripe is an in-memory stripe with fault injection and request counters.
pub struct MemStripe {
    url: String,
    data: Mutex<Vec<u8>>,
    faults: Mutex<Faults>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    write_log: Mutex<Vec<(u64, u64)>>,
    closed: AtomicBool,
    removed: AtomicBool,
}

impl MemStripe {
    #[must_use]
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            data: Mutex::new(Vec::new()),
            faults: Mutex::new(Faults::default()),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            write_log: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            removed: AtomicBool::new(false),
        }
    }

    pub fn set_faults(&self, faults: Faults) {
        *self.faults.lock() = faults;
    }

    #[must_use]
    pub fn faults(&self) -> Faults {
        self.faults.lock().clone()
    }

    pub fn fail_all(&self) {
        self.set_faults(Faults::all());
    }

    pub fn heal(&self) {
        self.set_faults(Faults::default());
    }

    /// Return a copy of the stored bytes, bypassing faults.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Store `bytes` at `offset` directly, bypassing faults and counters.
    pub fn overwrite(&self, offset: usize, bytes: &[u8]) {
        let mut data = self.data.lock();
        let end = offset + bytes.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(bytes);
    }

    #[must_use]
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Return `(offset, length)` for every successful write, in arrival order.
    #[must_use]
    pub fn write_log(&self) -> Vec<(u64, u64)> {
        self.write_log.lock().clone()
    }

    pub fn reset_counters(&self) {
        self.reads.store(0, Ordering::SeqCst);
        self.writes.store(0, Ordering::SeqCst);
        self.write_log.lock().clear();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> io::Result<()> {
        if self.is_closed() {
            return Err(closed_error(&self.url));
        }
        Ok(())
    }

    fn pause(&self) {
        let delay = self.faults.lock().delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
    }
}

impl StripeChannel for MemStripe {
    fn url(&self) -> &str {
        &self.url
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.check_open()?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.pause();
        if self.faults.lock().fail_reads {
            return Err(io::Error::other(format!("injected read failure on {}", self.url)));
        }
        let data = self.data.lock();
        let Ok(off) = usize::try_from(offset) else {
            return Ok(0);
        };
        if off >= data.len() {
            return Ok(0);
        }
        let end = off.saturating_add(buf.len()).min(data.len());
        let n = end - off;
        buf[..n].copy_from_slice(&data[off..end]);
        Ok(n)
    }

    fn write_at(&self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        self.check_open()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.pause();
        if self.faults.lock().fail_writes {
            return Err(io::Error::other(format!("injected write failure on {}", self.url)));
        }
        let off = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset overflow"))?;
        self.overwrite(off, bytes);
        self.write_log.lock().push((offset, bytes.len() as u64));
        Ok(())
    }

    fn sync(&self) -> io::Result<()> {
        self.check_open()
    }

    fn truncate(&self, size: u64) -> io::Result<()> {
        self.check_open()?;
        if self.faults.lock().fail_writes {
            return Err(io::Error::other(format!("injected truncate failure on {}", self.url)));
        }
        let size = usize::try_from(size)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "size overflow"))?;
        self.data.lock().resize(size, 0);
        Ok(())
    }

    fn stat(&self) -> io::Result<StripeStat> {
        Ok(StripeStat {
            size: self.data.lock().len() as u64,
        })
    }

    fn close(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn remove(&self) -> io::Result<()> {
        self.data.lock().clear();
        self.removed.store(true, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// MemOpener hands out shared [`MemStripe`]s keyed by url; reopening a url yields the same
/// stripe with its contents intact.
#[derive(Default)]
pub struct MemOpener {
    stripes: Mutex<HashMap<String, Arc<MemStripe>>>,
}

impl MemOpener {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the stripe registered for `url`, creating an empty one if needed.
    pub fn stripe(&self, url: &str) -> Arc<MemStripe> {
        self.stripes
            .lock()
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(MemStripe::new(url)))
            .clone()
    }
}

impl StripeOpener for MemOpener {
    fn open(&self, url: &str, mode: OpenMode, _timeout: Duration) -> io::Result<Arc<dyn StripeChannel>> {
        let existing = self.stripes.lock().get(url).cloned();
        let stripe = match existing {
            Some(stripe) if !stripe.is_removed() => stripe,
            _ if mode == OpenMode::ReadOnly => {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("stripe {url} does not exist"),
                ));
            }
            Some(stripe) => {
                stripe.removed.store(false, Ordering::SeqCst);
                stripe
            }
            None => self.stripe(url),
        };
        if stripe.faults.lock().fail_open {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("injected open failure on {url}"),
            ));
        }
        if mode == OpenMode::Create {
            stripe.data.lock().clear();
        }
        stripe.closed.store(false, Ordering::SeqCst);
        Ok(stripe)
    }
}
