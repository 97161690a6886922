use crate::error::Result;

/// Where to position a [`Seekable`] source.
#[derive(Debug, Clone, Copy)]
pub enum OffsetFrom {
    /// Offset from the start of the source.
    Start(u64),
    /// Negative offset from the end of the source.
    End(i64),
}

/// Represents a seekable source of compressed data.
///
/// Anything that implements [`std::io::Read`] and [`std::io::Seek`] is
/// `Seekable`. A source backed by a pipe still qualifies; operations that
/// require repositioning fail at run time with a not-seekable error, which
/// downgrades index loading to "not available" rather than "corrupt".
pub trait Seekable {
    /// Repositions the source.
    fn set_offset(&mut self, offset: OffsetFrom) -> Result<()>;

    /// Pull some bytes from this source into the specified buffer, returning
    /// how many bytes were read.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// The current byte position in the source.
    fn offset(&mut self) -> Result<u64>;

    /// Fills `buf` completely or fails.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut read = 0;
        while read < buf.len() {
            let n = self.read(&mut buf[read..])?;
            if n == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
            read += n;
        }

        Ok(())
    }
}

impl<T> Seekable for T
where
    T: std::io::Read + std::io::Seek,
{
    fn set_offset(&mut self, offset: OffsetFrom) -> Result<()> {
        match offset {
            OffsetFrom::Start(pos) => self.seek(std::io::SeekFrom::Start(pos))?,
            OffsetFrom::End(n) => self.seek(std::io::SeekFrom::End(n))?,
        };

        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(std::io::Read::read(self, buf)?)
    }

    fn offset(&mut self) -> Result<u64> {
        Ok(self.stream_position()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_is_seekable() {
        let mut src = std::io::Cursor::new(vec![1u8, 2, 3, 4, 5]);

        src.set_offset(OffsetFrom::End(-2)).unwrap();
        assert_eq!(src.offset().unwrap(), 3);

        let mut buf = [0u8; 2];
        Seekable::read_exact(&mut src, &mut buf).unwrap();
        assert_eq!(buf, [4, 5]);

        src.set_offset(OffsetFrom::Start(1)).unwrap();
        let mut buf = [0u8; 3];
        Seekable::read_exact(&mut src, &mut buf).unwrap();
        assert_eq!(buf, [2, 3, 4]);

        // Reading past the end fails
        let mut buf = [0u8; 3];
        assert!(Seekable::read_exact(&mut src, &mut buf).is_err());
    }
}
