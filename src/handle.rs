//! The public file handle.
//!
//! Wraps a [`Reader`] or [`Writer`] behind one type with the classic
//! open/read/write/seek/flush/close surface and mode-string parsing.

use std::io::{Read, Seek, Write};
use std::path::Path;
use std::sync::Arc;

use zstd_safe::CompressionLevel;

use crate::{
    BGZF2_DEFAULT_LEVEL,
    error::{Error, Result},
    reader::{EofStatus, Reader},
    tpool::ThreadPool,
    writer::Writer,
};

/// A parsed mode string: `"r"` or `"w"`, optionally followed by decimal
/// digits forming a compression level in `1..=19`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Mode {
    write: bool,
    level: CompressionLevel,
}

impl Mode {
    fn parse(mode: &str) -> Result<Self> {
        let mut chars = mode.bytes();
        let write = match chars.next() {
            Some(b'r') => false,
            Some(b'w') => true,
            _ => return Err(Error::invalid_mode()),
        };

        let digits = &mode[1..];
        let level = if digits.is_empty() {
            BGZF2_DEFAULT_LEVEL
        } else {
            let level: CompressionLevel = digits.parse().map_err(|_| Error::invalid_mode())?;
            if !(1..=19).contains(&level) {
                return Err(Error::invalid_mode());
            }
            level
        };

        Ok(Self { write, level })
    }
}

enum Inner<F> {
    Read(Reader<F>),
    Write(Writer<F>),
}

/// A bgzf2 file handle, open for either reading or writing.
///
/// # Examples
///
/// ```no_run
/// use bgzf2::Bgzf2;
///
/// let mut out = Bgzf2::open("data.bgz2", "w9")?;
/// out.write(b"payload", true)?;
/// out.close()?;
///
/// let mut src = Bgzf2::open("data.bgz2", "r")?;
/// let mut buf = [0u8; 7];
/// let n = src.read(&mut buf)?;
/// assert_eq!(&buf[..n], b"payload");
/// # Ok::<(), bgzf2::Error>(())
/// ```
pub struct Bgzf2<F> {
    inner: Inner<F>,
}

impl Bgzf2<std::fs::File> {
    /// Opens the file at `path` for read (`"r"`) or write (`"w"`,
    /// optionally with a compression level, e.g. `"w9"` or `"w19"`).
    ///
    /// # Errors
    ///
    /// Fails if the mode string is unrecognized or the file cannot be
    /// opened.
    pub fn open(path: impl AsRef<Path>, mode: &str) -> Result<Self> {
        let parsed = Mode::parse(mode)?;
        let file = if parsed.write {
            std::fs::File::create(path)?
        } else {
            std::fs::File::open(path)?
        };

        Self::with_mode(file, mode)
    }
}

impl<F> Bgzf2<F> {
    /// Wraps an already-open handle, like [`Bgzf2::open`] does for paths.
    ///
    /// Opening for read performs no I/O until the first operation.
    pub fn with_mode(file: F, mode: &str) -> Result<Self>
    where
        F: Read + Seek + Write,
    {
        let parsed = Mode::parse(mode)?;
        let inner = if parsed.write {
            Inner::Write(Writer::new(file, parsed.level))
        } else {
            Inner::Read(Reader::new(file))
        };

        Ok(Self { inner })
    }

    /// Wraps `src` as a read handle.
    pub fn from_reader(src: F) -> Self
    where
        F: Read + Seek,
    {
        Self {
            inner: Inner::Read(Reader::new(src)),
        }
    }

    /// Wraps `out` as a write handle with the given compression level.
    pub fn from_writer(out: F, level: CompressionLevel) -> Self
    where
        F: Write,
    {
        Self {
            inner: Inner::Write(Writer::new(out, level)),
        }
    }

    fn as_reader(&mut self) -> Result<&mut Reader<F>> {
        match &mut self.inner {
            Inner::Read(r) => Ok(r),
            Inner::Write(_) => Err(Error::invalid_mode()),
        }
    }

    fn as_writer(&mut self) -> Result<&mut Writer<F>> {
        match &mut self.inner {
            Inner::Write(w) => Ok(w),
            Inner::Read(_) => Err(Error::invalid_mode()),
        }
    }
}

impl<F: Write> Bgzf2<F> {
    /// Writes `buf`, flushing blocks as they fill. See [`Writer::write`].
    pub fn write(&mut self, buf: &[u8], can_split: bool) -> Result<usize> {
        self.as_writer()?.write(buf, can_split)
    }

    /// Emits the current partial block. See [`Writer::flush`].
    pub fn flush(&mut self) -> Result<()> {
        self.as_writer()?.flush()
    }

    /// Flushes if the next `size` bytes would cross a block boundary.
    pub fn flush_try(&mut self, size: usize) -> Result<()> {
        self.as_writer()?.flush_try(size)
    }

    /// Flushes, then grows the block target size.
    pub fn set_block_size(&mut self, sz: usize) -> Result<()> {
        self.as_writer()?.set_block_size(sz)
    }

    /// Records the genomic interval of the record about to be written.
    pub fn idx_add(&mut self, tid: i32, beg: i64, end: i64) -> Result<()> {
        self.as_writer()?.idx_add(tid, beg, end)
    }
}

impl<F: Read + Seek> Bgzf2<F> {
    /// Copies up to `buf.len()` decoded bytes into `buf`; 0 at EOF.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.as_reader()?.read(buf)
    }

    /// Borrows up to `n` decoded bytes out of the internal buffer.
    pub fn read_zero_copy(&mut self, n: usize) -> Result<&[u8]> {
        match &mut self.inner {
            Inner::Read(r) => r.read_zero_copy(n),
            Inner::Write(_) => Err(Error::invalid_mode()),
        }
    }

    /// Reads one delimited record. See [`Reader::getline`].
    pub fn getline(&mut self, delim: u8, out: &mut Vec<u8>) -> Result<Option<usize>> {
        self.as_reader()?.getline(delim, out)
    }

    /// Returns the next byte without consuming it.
    pub fn peek(&mut self) -> Result<Option<u8>> {
        self.as_reader()?.peek()
    }

    /// Repositions to uncompressed offset `upos`.
    pub fn seek(&mut self, upos: u64) -> Result<()> {
        self.as_reader()?.seek(upos)
    }

    /// Resolves a genomic range to an offset for [`Bgzf2::seek`].
    pub fn query(&mut self, tid: i32, beg: i64, end: i64) -> Result<u64> {
        self.as_reader()?.query(tid, beg, end)
    }

    /// Checks for the seekable-index sentinel at the end of the file.
    pub fn check_eof(&mut self) -> Result<EofStatus> {
        self.as_reader()?.check_eof()
    }
}

impl<F: Read + Seek + Write + Send + 'static> Bgzf2<F> {
    /// Attaches a shared worker pool, starting the appropriate I/O task
    /// thread for this handle's mode. `qsize` bounds the in-flight jobs,
    /// 0 for auto.
    pub fn thread_pool(&mut self, pool: &Arc<ThreadPool>, qsize: usize) -> Result<()> {
        match &mut self.inner {
            Inner::Read(r) => r.thread_pool(pool, qsize),
            Inner::Write(w) => w.thread_pool(pool, qsize),
        }
    }
}

impl<F: Read + Seek + Write> Bgzf2<F> {
    /// Closes the handle and returns the underlying file.
    ///
    /// Write handles drain asynchronous work and append the genomic and
    /// seekable index frames; read handles signal the reader thread to shut
    /// down. Closing is best-effort and reports the first failure.
    pub fn close(self) -> Result<F> {
        match self.inner {
            Inner::Read(r) => r.finish(),
            Inner::Write(w) => w.finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_strings() {
        assert_eq!(
            Mode::parse("r").unwrap(),
            Mode {
                write: false,
                level: BGZF2_DEFAULT_LEVEL
            }
        );
        assert_eq!(
            Mode::parse("w").unwrap(),
            Mode {
                write: true,
                level: 5
            }
        );
        assert_eq!(
            Mode::parse("w1").unwrap(),
            Mode {
                write: true,
                level: 1
            }
        );
        assert_eq!(
            Mode::parse("w19").unwrap(),
            Mode {
                write: true,
                level: 19
            }
        );

        for bad in ["", "a", "w0", "w20", "w-1", "wx", "w1x", "rw"] {
            assert!(Mode::parse(bad).unwrap_err().is_invalid_mode(), "{bad}");
        }
    }

    #[test]
    fn wrong_mode_operations_fail() {
        let mut w = Bgzf2::with_mode(std::io::Cursor::new(Vec::new()), "w").unwrap();
        assert!(w.read(&mut [0u8; 4]).unwrap_err().is_invalid_mode());
        assert!(w.peek().unwrap_err().is_invalid_mode());

        let mut r = Bgzf2::with_mode(std::io::Cursor::new(Vec::new()), "r").unwrap();
        assert!(r.write(b"x", true).unwrap_err().is_invalid_mode());
        assert!(r.flush().unwrap_err().is_invalid_mode());
    }
}
