use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use memmap2::{Mmap, MmapMut, MmapOptions};
use parking_lot::Mutex;
use tracing::debug;

use crate::channel::{OpenMode, StripeChannel, StripeOpener, StripeStat, closed_error};

enum Mapping {
    Ro(Mmap),
    Rw(MmapMut),
}

impl Mapping {
    fn as_slice(&self) -> &[u8] {
        match self {
            Self::Ro(m) => &m[..],
            Self::Rw(m) => &m[..],
        }
    }
}

struct Backing {
    file: File,
    /// `None` while the file is empty; zero-length files cannot be mapped.
    map: Option<Mapping>,
    len: u64,
}

impl Backing {
    fn remap(&mut self, writable: bool) -> io::Result<()> {
        self.map = None;
        self.len = self.file.metadata()?.len();
        if self.len == 0 {
            return Ok(());
        }
        let map_len = usize::try_from(self.len).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("stripe length {} exceeds addressable size", self.len),
            )
        })?;
        // SAFETY: the file stays open for the lifetime of the mapping and is only resized
        // after the mapping has been dropped.
        let map = unsafe {
            if writable {
                Mapping::Rw(MmapOptions::new().len(map_len).map_mut(&self.file)?)
            } else {
                Mapping::Ro(MmapOptions::new().len(map_len).map(&self.file)?)
            }
        };
        self.map = Some(map);
        Ok(())
    }

    fn resize(&mut self, len: u64, writable: bool) -> io::Result<()> {
        self.map = None;
        self.file.set_len(len)?;
        self.remap(writable)
    }
}

/// MmapStripe is a local stripe file accessed through a memory mapping.
pub struct MmapStripe {
    url: String,
    path: PathBuf,
    writable: bool,
    backing: Mutex<Option<Backing>>,
}

impl MmapStripe {
    /// Open (or create) the stripe file at `path` and map it.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or mapped. Read-only opens of a missing
    /// file fail with [`io::ErrorKind::NotFound`].
    pub fn open(url: &str, path: &Path, mode: OpenMode) -> io::Result<Self> {
        let writable = mode != OpenMode::ReadOnly;
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .create(writable)
            .truncate(mode == OpenMode::Create)
            .open(path)?;
        let mut backing = Backing {
            file,
            map: None,
            len: 0,
        };
        backing.remap(writable)?;
        debug!(url, len = backing.len, ?mode, "opened stripe file");
        Ok(Self {
            url: url.to_string(),
            path: path.to_path_buf(),
            writable,
            backing: Mutex::new(Some(backing)),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_only_error(&self) -> io::Error {
        io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("stripe {} is opened read-only", self.url),
        )
    }
}

impl StripeChannel for MmapStripe {
    fn url(&self) -> &str {
        &self.url
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let guard = self.backing.lock();
        let backing = guard.as_ref().ok_or_else(|| closed_error(&self.url))?;
        let Some(map) = backing.map.as_ref() else {
            return Ok(0);
        };
        let data = map.as_slice();
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

    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        if !self.writable {
            return Err(self.read_only_error());
        }
        if data.is_empty() {
            return Ok(());
        }
        let mut guard = self.backing.lock();
        let backing = guard.as_mut().ok_or_else(|| closed_error(&self.url))?;
        let end = offset + data.len() as u64;
        if end > backing.len {
            backing.resize(end, true)?;
        }
        match backing.map.as_mut() {
            Some(Mapping::Rw(map)) => {
                let off = usize::try_from(offset)
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset overflow"))?;
                map[off..off + data.len()].copy_from_slice(data);
                Ok(())
            }
            _ => Err(self.read_only_error()),
        }
    }

    fn sync(&self) -> io::Result<()> {
        let guard = self.backing.lock();
        let backing = guard.as_ref().ok_or_else(|| closed_error(&self.url))?;
        if let Some(Mapping::Rw(map)) = backing.map.as_ref() {
            map.flush()?;
        }
        if self.writable {
            backing.file.sync_all()?;
        }
        Ok(())
    }

    fn truncate(&self, size: u64) -> io::Result<()> {
        if !self.writable {
            return Err(self.read_only_error());
        }
        let mut guard = self.backing.lock();
        let backing = guard.as_mut().ok_or_else(|| closed_error(&self.url))?;
        backing.resize(size, true)
    }

    fn stat(&self) -> io::Result<StripeStat> {
        let guard = self.backing.lock();
        match guard.as_ref() {
            Some(backing) => Ok(StripeStat { size: backing.len }),
            None => Ok(StripeStat {
                size: std::fs::metadata(&self.path)?.len(),
            }),
        }
    }

    fn close(&self) -> io::Result<()> {
        let Some(backing) = self.backing.lock().take() else {
            return Ok(());
        };
        if let Some(Mapping::Rw(map)) = backing.map.as_ref() {
            map.flush()?;
        }
        Ok(())
    }

    fn remove(&self) -> io::Result<()> {
        self.backing.lock().take();
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// FileOpener opens local stripe files; a `file://` prefix on the url is accepted.
#[derive(Clone, Debug, Default)]
pub struct FileOpener;

impl FileOpener {
    #[must_use]
    pub fn path_of(url: &str) -> PathBuf {
        PathBuf::from(url.strip_prefix("file://").unwrap_or(url))
    }
}

impl StripeOpener for FileOpener {
    fn open(&self, url: &str, mode: OpenMode, _timeout: Duration) -> io::Result<Arc<dyn StripeChannel>> {
        let stripe = MmapStripe::open(url, &Self::path_of(url), mode)?;
        Ok(Arc::new(stripe))
    }
}
