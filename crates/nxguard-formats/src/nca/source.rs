//! Positional byte sources
//!
//! Every read names its own offset, so one source can serve any number of
//! partition readers at once without a shared seek cursor.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use parking_lot::Mutex;

/// Read-only, randomly addressable bytes
pub trait ByteSource: Send + Sync {
    /// Total size in bytes
    fn size(&self) -> u64;

    /// Fill `buf` with the bytes starting at `offset`
    ///
    /// Fails with `UnexpectedEof` if the range extends past [`size`](Self::size).
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
}

fn slice_range(len: usize, offset: u64, wanted: usize) -> io::Result<std::ops::Range<usize>> {
    usize::try_from(offset)
        .ok()
        .and_then(|start| Some(start..start.checked_add(wanted)?))
        .filter(|range| range.end <= len)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("read of {wanted:#x} bytes at {offset:#x} exceeds size {len:#x}"),
            )
        })
}

impl ByteSource for [u8] {
    fn size(&self) -> u64 {
        self.len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let range = slice_range(self.len(), offset, buf.len())?;
        buf.copy_from_slice(&self[range]);
        Ok(())
    }
}

impl ByteSource for Vec<u8> {
    fn size(&self) -> u64 {
        self.as_slice().size()
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.as_slice().read_at(offset, buf)
    }
}

impl<T: ByteSource + ?Sized> ByteSource for &T {
    fn size(&self) -> u64 {
        (**self).size()
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        (**self).read_at(offset, buf)
    }
}

impl<T: ByteSource + ?Sized> ByteSource for Arc<T> {
    fn size(&self) -> u64 {
        (**self).size()
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        (**self).read_at(offset, buf)
    }
}

/// Adapts any `Read + Seek` (such as a `File`) into a [`ByteSource`]
///
/// The reader sits behind a mutex; each request seeks and reads while
/// holding it, so callers never observe each other's position.
#[derive(Debug)]
pub struct ReaderSource<R> {
    inner: Mutex<R>,
    size: u64,
}

impl<R: Read + Seek> ReaderSource<R> {
    /// Wrap a reader, measuring its size by seeking to the end
    pub fn new(mut reader: R) -> io::Result<Self> {
        let size = reader.seek(SeekFrom::End(0))?;
        Ok(Self {
            inner: Mutex::new(reader),
            size,
        })
    }

    /// Recover the wrapped reader
    pub fn into_inner(self) -> R {
        self.inner.into_inner()
    }
}

impl<R: Read + Seek + Send> ByteSource for ReaderSource<R> {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let end = offset.checked_add(buf.len() as u64);
        if end.is_none_or(|end| end > self.size) {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "read of {:#x} bytes at {offset:#x} exceeds size {:#x}",
                    buf.len(),
                    self.size
                ),
            ));
        }

        let mut reader = self.inner.lock();
        reader.seek(SeekFrom::Start(offset))?;
        reader.read_exact(buf)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    #[test]
    fn test_slice_source() {
        let data: Vec<u8> = (0..=255).collect();
        let mut buf = [0u8; 4];
        data.read_at(10, &mut buf).unwrap();
        assert_eq!(buf, [10, 11, 12, 13]);

        data.read_at(252, &mut buf).unwrap();
        assert_eq!(buf, [252, 253, 254, 255]);

        let err = data.read_at(253, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert!(data.read_at(u64::MAX, &mut buf).is_err());
    }

    #[test]
    fn test_shared_sources() {
        let data: Arc<[u8]> = Arc::from(vec![1u8, 2, 3, 4]);
        let shared: Arc<dyn ByteSource> = Arc::new(Arc::clone(&data));
        assert_eq!(shared.size(), 4);

        let by_ref = &*data;
        let mut buf = [0u8; 2];
        by_ref.read_at(2, &mut buf).unwrap();
        assert_eq!(buf, [3, 4]);
    }

    #[test]
    fn test_reader_source() {
        let source = ReaderSource::new(Cursor::new(vec![9u8; 100])).unwrap();
        assert_eq!(source.size(), 100);

        let mut buf = [0u8; 10];
        source.read_at(90, &mut buf).unwrap();
        assert_eq!(buf, [9u8; 10]);
        assert!(source.read_at(91, &mut buf).is_err());
    }

    #[test]
    fn test_reader_source_from_file() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"0123456789").unwrap();

        let source = ReaderSource::new(file).unwrap();
        let mut buf = [0u8; 3];
        source.read_at(7, &mut buf).unwrap();
        assert_eq!(&buf, b"789");
        source.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"012");
    }
}
