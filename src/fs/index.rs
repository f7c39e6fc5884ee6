//! Stable identity for files in the base directory.
//!
//! A [`FileIndex`] identifies a base file by `(device, inode, mtime)` taken
//! from a stat probe. Unlike a path it survives renames, and the mtime
//! component makes it sensitive to content changes, so a stale cached
//! transcode is simply never found again. The textual form
//! `device.inode.mtime` doubles as the spill filename in the persist
//! directory.

use std::fmt;
use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::str::FromStr;

/// Identity of a base-directory file: `(device, inode, mtime)`.
///
/// Totally ordered lexicographically over the three fields, which makes it
/// usable as a map key for the reader factory and the image cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileIndex {
    /// Device the file lives on (`st_dev`).
    pub device: u64,
    /// Inode number (`st_ino`).
    pub inode: u64,
    /// Last modification time in seconds (`st_mtime`).
    pub mtime: i64,
}

impl FileIndex {
    pub fn new(device: u64, inode: u64, mtime: i64) -> Self {
        Self { device, inode, mtime }
    }
}

impl From<&Metadata> for FileIndex {
    fn from(meta: &Metadata) -> Self {
        Self {
            device: meta.dev(),
            inode: meta.ino(),
            mtime: meta.mtime(),
        }
    }
}

impl fmt::Display for FileIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.device, self.inode, self.mtime)
    }
}

/// Error parsing a [`FileIndex`] from its `device.inode.mtime` form.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("not a device.inode.mtime file index")]
pub struct ParseFileIndexError;

impl FromStr for FileIndex {
    type Err = ParseFileIndexError;

    /// Strict parse of the `device.inode.mtime` form.
    ///
    /// Anything that is not exactly three dot-separated integers fails, so
    /// that unrelated files in a persist directory are never mistaken for
    /// spilled artifacts.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.');
        let device = parts.next().ok_or(ParseFileIndexError)?;
        let inode = parts.next().ok_or(ParseFileIndexError)?;
        let mtime = parts.next().ok_or(ParseFileIndexError)?;
        if parts.next().is_some() {
            return Err(ParseFileIndexError);
        }
        Ok(Self {
            device: device.parse().map_err(|_| ParseFileIndexError)?,
            inode: inode.parse().map_err(|_| ParseFileIndexError)?,
            mtime: mtime.parse().map_err(|_| ParseFileIndexError)?,
        })
    }
}
