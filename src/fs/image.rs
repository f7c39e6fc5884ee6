//! Append-only byte storage for transcoded artifacts.
//!
//! An [`Image`] accumulates transcoder output as it is produced and later
//! serves random-range reads from the cache. Both halves matter: the
//! builder thread appends small tiles thousands of times, and FUSE reads
//! land anywhere in the finished artifact. Storage is a list of fixed-size
//! segments, so an append never moves previously written bytes and a read
//! locates its segment with one division.

use std::io::{self, Write};

/// Size of one storage segment. Every segment except the last is full.
const SEGMENT_SIZE: usize = 128 * 1024;

/// An append-only byte sequence with cheap repeated append and positional
/// copy-out. The size only grows until the producer freezes it by dropping
/// its handle.
#[derive(Debug, Default)]
pub struct Image {
    segments: Vec<Vec<u8>>,
    len: usize,
}

impl Image {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes appended so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append `data`, filling the current tail segment before opening a
    /// new one.
    pub fn append(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let tail_room = match self.segments.last() {
                Some(tail) if tail.len() < SEGMENT_SIZE => SEGMENT_SIZE - tail.len(),
                _ => {
                    self.segments.push(Vec::with_capacity(SEGMENT_SIZE));
                    SEGMENT_SIZE
                }
            };
            let take = tail_room.min(data.len());
            let tail = self.segments.last_mut().expect("tail segment exists");
            tail.extend_from_slice(&data[..take]);
            self.len += take;
            data = &data[take..];
        }
    }

    /// Copy out up to `buf.len()` bytes starting at `offset`.
    ///
    /// Returns the number of bytes copied; 0 when `offset` is at or past
    /// the end.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        if offset >= self.len {
            return 0;
        }
        let count = buf.len().min(self.len - offset);
        let mut copied = 0;
        while copied < count {
            let at = offset + copied;
            let segment = &self.segments[at / SEGMENT_SIZE];
            let within = at % SEGMENT_SIZE;
            let take = (count - copied).min(segment.len() - within);
            buf[copied..copied + take].copy_from_slice(&segment[within..within + take]);
            copied += take;
        }
        count
    }

    /// Stream the whole image to a writer, segment by segment.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        for segment in &self.segments {
            writer.write_all(segment)?;
        }
        Ok(())
    }
}

impl From<&[u8]> for Image {
    fn from(data: &[u8]) -> Self {
        let mut image = Image::new();
        image.append(data);
        image
    }
}
