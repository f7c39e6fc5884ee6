//! Depth-first directory traversal with visitor control.
//!
//! The cache reconciliation pass needs a walk that follows symlinks
//! without looping and that shrugs off the errors a live filesystem throws
//! at it (permission holes, links that vanished mid-walk). Visitors are
//! called before and after each node and steer the traversal with a
//! [`Flow`] verdict.

use std::fs::{self, Metadata};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

/// Traversal verdict returned by visitor callbacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    /// Keep walking.
    Continue,
    /// Terminate the whole walk.
    Stop,
    /// Skip this node's children only.
    Prune,
    /// Unwind to the root, running `after` callbacks on the way out.
    Return,
}

/// One node of the traversal.
#[derive(Debug)]
pub struct WalkEntry<'a> {
    /// Full path of the node.
    pub path: &'a Path,
    /// Depth below the root (the root itself is 0).
    pub depth: usize,
    /// Stat result; `None` when the probe failed with a tolerated error
    /// (the node is "undefined" and has no children).
    pub metadata: Option<&'a Metadata>,
    /// True when an ancestor has the same `(device, inode)`, i.e. a
    /// symlink cycle leads back into the current chain.
    pub revisit: bool,
}

/// Visitor over a depth-first walk.
///
/// The default `before` prunes cycles, the default `after` does nothing.
pub trait Visitor {
    fn before(&mut self, entry: &WalkEntry<'_>) -> Flow {
        if entry.revisit {
            Flow::Prune
        } else {
            Flow::Continue
        }
    }

    fn after(&mut self, _entry: &WalkEntry<'_>) -> Flow {
        Flow::Continue
    }
}

/// Walk `root` depth-first.
///
/// `EACCES` is tolerated everywhere; `ENOENT` is tolerated when following
/// links (a broken or racing symlink). Tolerated stat failures still visit
/// the node, with no metadata. Any other error aborts the walk.
pub fn walk<V: Visitor>(root: &Path, follow_links: bool, visitor: &mut V) -> io::Result<Flow> {
    let mut ancestors = Vec::new();
    walk_at(root, 0, follow_links, &mut ancestors, visitor)
}

fn tolerated(error: &io::Error, follow_links: bool) -> bool {
    match error.raw_os_error() {
        Some(libc::EACCES) => true,
        Some(libc::ENOENT) => follow_links,
        _ => false,
    }
}

fn walk_at<V: Visitor>(
    path: &Path,
    depth: usize,
    follow_links: bool,
    ancestors: &mut Vec<(u64, u64)>,
    visitor: &mut V,
) -> io::Result<Flow> {
    let metadata = {
        let probe = if follow_links {
            fs::metadata(path)
        } else {
            fs::symlink_metadata(path)
        };
        match probe {
            Ok(metadata) => Some(metadata),
            Err(error) if tolerated(&error, follow_links) => None,
            Err(error) => return Err(error),
        }
    };
    let identity = metadata.as_ref().map(|m| (m.dev(), m.ino()));
    let revisit = identity.is_some_and(|id| ancestors.contains(&id));

    let entry = WalkEntry {
        path,
        depth,
        metadata: metadata.as_ref(),
        revisit,
    };
    let mut direction = visitor.before(&entry);

    let is_dir = metadata.as_ref().is_some_and(|m| m.is_dir());
    if direction == Flow::Continue && is_dir {
        let identity = identity.expect("directories always have metadata");
        ancestors.push(identity);
        let children = match fs::read_dir(path) {
            Ok(children) => Some(children),
            Err(error) if tolerated(&error, follow_links) => None,
            Err(error) => {
                ancestors.pop();
                return Err(error);
            }
        };
        if let Some(children) = children {
            for child in children {
                let child = match child {
                    Ok(child) => child,
                    Err(error) => {
                        ancestors.pop();
                        return Err(error);
                    }
                };
                let flow =
                    walk_at(&child.path(), depth + 1, follow_links, ancestors, visitor);
                match flow {
                    Ok(Flow::Continue) | Ok(Flow::Prune) => {}
                    Ok(Flow::Stop) => {
                        ancestors.pop();
                        return Ok(Flow::Stop);
                    }
                    Ok(Flow::Return) => {
                        direction = Flow::Return;
                        break;
                    }
                    Err(error) => {
                        ancestors.pop();
                        return Err(error);
                    }
                }
            }
        }
        ancestors.pop();
    }

    if direction == Flow::Stop {
        return Ok(Flow::Stop);
    }
    Ok(match visitor.after(&entry) {
        Flow::Stop => Flow::Stop,
        _ if direction == Flow::Return => Flow::Return,
        Flow::Return => Flow::Return,
        _ => Flow::Continue,
    })
}
