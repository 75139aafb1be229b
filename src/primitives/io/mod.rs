#![deny(unsafe_code)]

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Arc;

use crate::types::{Result, StoreError};

pub mod mmap;

/// Positioned access to the backing store file.
///
/// Offsets are absolute; implementations never move a shared cursor, so
/// readers on other threads can use the same handle concurrently.
pub trait FileIo: Send + Sync + 'static {
    /// Fills `dst` from `off`. Short files surface as `UnexpectedEof`.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes all of `src` at `off`, extending the file if needed.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Flushes data and metadata to stable storage.
    fn sync_all(&self) -> Result<()>;
    /// Current file length in bytes.
    fn len(&self) -> Result<u64>;
    /// Sets the file length, zero-filling any extension.
    fn truncate(&self, len: u64) -> Result<()>;
}

/// How [`StdFileIo::open_with`] should open the file.
#[derive(Clone, Copy, Debug)]
pub struct OpenMode {
    /// Open without write access; the file must exist.
    pub readonly: bool,
    /// Permission bits for a newly created file (unix only).
    pub mode: u32,
}

impl Default for OpenMode {
    fn default() -> Self {
        Self {
            readonly: false,
            mode: 0o600,
        }
    }
}

impl OpenMode {
    fn options(&self) -> OpenOptions {
        let mut opts = OpenOptions::new();
        opts.read(true);
        if !self.readonly {
            opts.write(true).create(true).truncate(false);
            #[cfg(unix)]
            std::os::unix::fs::OpenOptionsExt::mode(&mut opts, self.mode);
        }
        opts
    }
}

#[cfg(unix)]
fn pread(file: &File, buf: &mut [u8], off: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, off)
}

#[cfg(unix)]
fn pwrite(file: &File, buf: &[u8], off: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::write_at(file, buf, off)
}

// seek_read moves the handle cursor, which nothing else here relies on.
#[cfg(windows)]
fn pread(file: &File, buf: &mut [u8], off: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, off)
}

#[cfg(windows)]
fn pwrite(file: &File, buf: &[u8], off: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_write(file, buf, off)
}

#[cfg(not(any(unix, windows)))]
fn pread(_file: &File, _buf: &mut [u8], _off: u64) -> io::Result<usize> {
    Err(io::ErrorKind::Unsupported.into())
}

#[cfg(not(any(unix, windows)))]
fn pwrite(_file: &File, _buf: &[u8], _off: u64) -> io::Result<usize> {
    Err(io::ErrorKind::Unsupported.into())
}

/// Retries `pread` until `dst` is full.
fn read_full(file: &File, mut off: u64, dst: &mut [u8]) -> io::Result<()> {
    let mut done = 0;
    while done < dst.len() {
        match pread(file, &mut dst[done..], off) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("short read at offset {off}"),
                ))
            }
            Ok(n) => {
                done += n;
                off += n as u64;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Retries `pwrite` until all of `src` is written.
fn write_full(file: &File, mut off: u64, src: &[u8]) -> io::Result<()> {
    let mut done = 0;
    while done < src.len() {
        match pwrite(file, &src[done..], off) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                done += n;
                off += n as u64;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// [`FileIo`] over a shared `std::fs::File`.
#[derive(Clone)]
pub struct StdFileIo {
    file: Arc<File>,
    readonly: bool,
}

impl StdFileIo {
    /// Opens `path` read-write, creating it if missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, OpenMode::default())
    }

    /// Opens `path` as described by `mode`.
    pub fn open_with(path: impl AsRef<Path>, mode: OpenMode) -> Result<Self> {
        let file = mode.options().open(path)?;
        Ok(Self {
            file: Arc::new(file),
            readonly: mode.readonly,
        })
    }

    /// The OS handle, used for mapping and advisory locks.
    pub fn file(&self) -> &File {
        &self.file
    }

    /// True when opened without write access.
    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    fn writable(&self) -> Result<&File> {
        if self.readonly {
            Err(StoreError::ReadOnly)
        } else {
            Ok(&self.file)
        }
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        Ok(read_full(&self.file, off, dst)?)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        Ok(write_full(self.writable()?, off, src)?)
    }

    fn sync_all(&self) -> Result<()> {
        Ok(self.file.sync_all()?)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        Ok(self.writable()?.set_len(len)?)
    }
}
