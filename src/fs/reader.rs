//! Readers: the byte sources behind open file handles.
//!
//! A [`Reader`] pairs a [`FileIndex`] and a sharer count with one of three
//! byte sources: the base file itself, a completed cached image, or a live
//! transcode. The factory owns every reader; the sharer count is only ever
//! touched under the factory lock, and a reader whose count reaches zero
//! is torn down by the factory.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::fs::cache::ImageHandle;
use crate::fs::image::Image;
use crate::fs::index::FileIndex;
use crate::fs::transcode::TranscodeReader;

/// The three byte sources a reader can serve from.
pub enum ReaderKind {
    /// Positional reads from an open base file.
    File(FileReader),
    /// Reads from a completed artifact owned by the cache.
    Image(ImageReader),
    /// Reads from an artifact still being produced.
    Transcode(TranscodeReader),
}

/// A shared, reference-counted byte source for one [`FileIndex`].
pub struct Reader {
    file_index: FileIndex,
    sharers: AtomicUsize,
    kind: ReaderKind,
}

impl Reader {
    pub fn new(file_index: FileIndex, kind: ReaderKind) -> Self {
        Self {
            file_index,
            sharers: AtomicUsize::new(0),
            kind,
        }
    }

    pub fn file_index(&self) -> FileIndex {
        self.file_index
    }

    /// Fill `buf` from `offset`, waiting on a live transcode as necessary.
    ///
    /// Returns the number of bytes copied (0 at or past the end) or an
    /// errno value.
    pub fn read(&self, buf: &mut [u8], offset: i64) -> Result<usize, i32> {
        if offset < 0 {
            return Err(libc::EINVAL);
        }
        match &self.kind {
            ReaderKind::File(reader) => reader.read(buf, offset as u64),
            ReaderKind::Image(reader) => Ok(reader.read(buf, offset as usize)),
            ReaderKind::Transcode(reader) => reader.read(buf, offset as usize),
        }
    }

    /// Size of the underlying artifact. With `wait`, blocks until the
    /// artifact is final; otherwise reports the current size.
    pub fn size(&self, wait: bool) -> u64 {
        match &self.kind {
            ReaderKind::File(reader) => reader.size(),
            ReaderKind::Image(reader) => reader.size(),
            ReaderKind::Transcode(reader) => reader.size(wait),
        }
    }

    /// Take the completed artifact out of the reader, if it has one.
    ///
    /// Only a finished transcode yields an image, and only once; cached
    /// images stay with the cache.
    pub fn take_image(&self) -> Option<Image> {
        match &self.kind {
            ReaderKind::Transcode(reader) => reader.take_image(),
            _ => None,
        }
    }

    /// Add a sharer. Called under the factory lock.
    pub(crate) fn retain(&self) {
        self.sharers.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop a sharer and return the remaining count. Called under the
    /// factory lock.
    pub(crate) fn unshare(&self) -> usize {
        let previous = self.sharers.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "reader released more often than shared");
        previous - 1
    }

    #[cfg(test)]
    pub(crate) fn sharers(&self) -> usize {
        self.sharers.load(Ordering::SeqCst)
    }
}

/// Direct positional reads from an owned descriptor to a static file.
pub struct FileReader {
    file: File,
}

impl FileReader {
    pub fn new(file: File) -> Self {
        Self { file }
    }

    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize, i32> {
        self.file
            .read_at(buf, offset)
            .map_err(|error| error.raw_os_error().unwrap_or(libc::EIO))
    }

    fn size(&self) -> u64 {
        // the underlying file is static, so no waiting variant exists
        self.file.metadata().map(|meta| meta.len()).unwrap_or(0)
    }
}

/// Reads from a completed artifact acquired from the image cache. The
/// acquire handle keeps the entry pinned against eviction until the
/// reader is destroyed.
pub struct ImageReader {
    handle: ImageHandle,
}

impl ImageReader {
    pub fn new(handle: ImageHandle) -> Self {
        Self { handle }
    }

    fn read(&self, buf: &mut [u8], offset: usize) -> usize {
        self.handle.read_at(offset, buf)
    }

    fn size(&self) -> u64 {
        self.handle.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn file_reader(contents: &[u8]) -> Reader {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        file.flush().unwrap();
        let meta = file.path().metadata().unwrap();
        let reopened = File::open(file.path()).unwrap();
        // the open descriptor outlives the unlinked temp path
        Reader::new(
            FileIndex::from(&meta),
            ReaderKind::File(FileReader::new(reopened)),
        )
    }

    #[test]
    fn test_file_reader_positional_reads() {
        let reader = file_reader(b"0123456789");
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf, 0).unwrap(), 4);
        assert_eq!(&buf, b"0123");
        assert_eq!(reader.read(&mut buf, 6).unwrap(), 4);
        assert_eq!(&buf, b"6789");
        assert_eq!(reader.read(&mut buf, 10).unwrap(), 0);
        assert_eq!(reader.size(false), 10);
        assert_eq!(reader.size(true), 10);
    }

    #[test]
    fn test_negative_offset_is_einval() {
        let reader = file_reader(b"abc");
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf, -1), Err(libc::EINVAL));
    }

    #[test]
    fn test_file_reader_has_no_image() {
        let reader = file_reader(b"abc");
        assert!(reader.take_image().is_none());
    }

    #[test]
    fn test_sharer_accounting() {
        let reader = file_reader(b"abc");
        assert_eq!(reader.sharers(), 0);
        reader.retain();
        reader.retain();
        assert_eq!(reader.sharers(), 2);
        assert_eq!(reader.unshare(), 1);
        assert_eq!(reader.unshare(), 0);
    }
}
