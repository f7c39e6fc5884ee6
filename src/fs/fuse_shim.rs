//! FUSE host for the transcoding filesystem.
//!
//! This module adapts the path-oriented core (reader factory, transcode
//! mapping) to fuser's inode-oriented protocol. Inodes are interned
//! lazily as paths are looked up; handles index small registries of live
//! readers and directory snapshots.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                      Linux Kernel VFS                      │
//! └────────────────────────────────────────────────────────────┘
//!                    │ FUSE protocol (fuser)
//!                    ▼
//! ┌────────────────────────────────────────────────────────────┐
//! │                 TranscodeFs (this module)                  │
//! │   ino ⇄ virtual path   fh → Reader   fh → dir snapshot     │
//! └────────────────────────────────────────────────────────────┘
//!                    │ virtual paths
//!                    ▼
//! ┌────────────────────────────────────────────────────────────┐
//! │   ReaderFactory → TranscodeMapping / ImageCache / Readers  │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Directory listings show translated names: a base `song.flac` under a
//! `flac → mp3` rule lists as `song.mp3`, and producing that listing
//! kicks off a speculative read-ahead transcode for the entry.
//!
//! The factory (and all of its threads) is constructed in `init`, after
//! the mount is established, mirroring the original constraint that a
//! daemonizing host must not spawn threads before it forks.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::config::Config;
use crate::fs::attr::FileKind;
use crate::fs::factory::{FactoryOptions, ReaderFactory};
use crate::fs::mapping::TranscodeMapping;
use crate::fs::pipeline::PipelineLauncher;
use crate::fs::reader::Reader;

/// Root inode; FUSE convention.
const ROOT_INO: u64 = 1;

/// One entry of a directory snapshot, already name-translated.
struct DirEntry {
    name: String,
    kind: FileKind,
}

/// An opendir handle: the virtual directory path and, once the first
/// readdir enumerated it, a snapshot serving stable offsets.
struct DirHandle {
    path: String,
    entries: Option<Vec<DirEntry>>,
}

/// The fuser-facing filesystem.
pub struct TranscodeFs {
    base: PathBuf,
    mapping: Arc<TranscodeMapping>,
    options: FactoryOptions,
    launcher: Option<Box<dyn PipelineLauncher>>,
    factory: Option<ReaderFactory>,

    /// ino → virtual path (lock-free reads, copy-on-write updates)
    inode_paths: ArcSwap<FxHashMap<u64, String>>,
    /// virtual path → ino
    path_inodes: ArcSwap<FxHashMap<String, u64>>,
    next_ino: AtomicU64,

    next_fh: AtomicU64,
    files: FxHashMap<u64, Arc<Reader>>,
    dirs: FxHashMap<u64, DirHandle>,

    attr_ttl: Duration,
    entry_ttl: Duration,
}

fn join_virtual(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(pos) => &path[..pos],
        None => "",
    }
}

impl TranscodeFs {
    pub fn new(config: Config, launcher: Box<dyn PipelineLauncher>) -> Self {
        let mut inode_paths = FxHashMap::default();
        inode_paths.insert(ROOT_INO, String::new());
        let mut path_inodes = FxHashMap::default();
        path_inodes.insert(String::new(), ROOT_INO);

        Self {
            base: config.base,
            mapping: Arc::new(config.mapping),
            options: config.factory,
            launcher: Some(launcher),
            factory: None,
            inode_paths: ArcSwap::from_pointee(inode_paths),
            path_inodes: ArcSwap::from_pointee(path_inodes),
            next_ino: AtomicU64::new(ROOT_INO + 1),
            next_fh: AtomicU64::new(1),
            files: FxHashMap::default(),
            dirs: FxHashMap::default(),
            attr_ttl: Duration::from_secs(1),
            entry_ttl: Duration::from_secs(1),
        }
    }

    /// Construct the factory and everything that spawns threads. Kept out
    /// of `new` so it runs after the mount (and any daemonization).
    fn start(&mut self) {
        if self.factory.is_some() {
            return;
        }
        let Some(launcher) = self.launcher.take() else {
            return;
        };
        self.factory = Some(ReaderFactory::new(
            self.base.clone(),
            Arc::clone(&self.mapping),
            launcher,
            self.options.clone(),
        ));
    }

    fn factory(&self) -> &ReaderFactory {
        self.factory
            .as_ref()
            .expect("filesystem initialized before use")
    }

    /// Stable inode for a virtual path, allocated on first sight.
    fn intern(&self, path: &str) -> u64 {
        if let Some(&ino) = self.path_inodes.load().get(path) {
            return ino;
        }
        let ino = self.next_ino.fetch_add(1, Ordering::SeqCst);
        self.path_inodes.rcu(|map| {
            let mut map = (**map).clone();
            map.insert(path.to_string(), ino);
            map
        });
        self.inode_paths.rcu(|map| {
            let mut map = (**map).clone();
            map.insert(ino, path.to_string());
            map
        });
        ino
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.inode_paths.load().get(&ino).cloned()
    }

    /// Enumerate a virtual directory: translate entry names through the
    /// mapping and fire a read-ahead for every translated entry.
    fn list_virtual(&self, path: &str) -> io::Result<Vec<DirEntry>> {
        // the empty sub-path reopens the base by path so directory
        // streams never share state
        let real = if path.is_empty() {
            self.base.clone()
        } else {
            self.base.join(path)
        };
        let mut entries = Vec::new();
        for entry in fs::read_dir(real)? {
            let entry = entry?;
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            let kind = entry
                .file_type()
                .map(|file_type| {
                    if file_type.is_dir() {
                        FileKind::Directory
                    } else if file_type.is_symlink() {
                        FileKind::Symlink
                    } else {
                        FileKind::RegularFile
                    }
                })
                .unwrap_or(FileKind::RegularFile);

            let (translated, element) = self.mapping.target_from(&name);
            if element.is_some() {
                self.factory().read_ahead(&join_virtual(path, &translated));
            }
            entries.push(DirEntry {
                name: translated.into_owned(),
                kind,
            });
        }
        Ok(entries)
    }
}

#[cfg(feature = "fuse")]
impl fuser::Filesystem for TranscodeFs {
    fn init(
        &mut self,
        _req: &fuser::Request<'_>,
        _config: &mut fuser::KernelConfig,
    ) -> Result<(), libc::c_int> {
        self.start();
        debug!(base = ?self.base, "filesystem initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        // tears down read-ahead, harvests, and spills the cache
        self.factory = None;
    }

    fn lookup(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &std::ffi::OsStr,
        reply: fuser::ReplyEntry,
    ) {
        let Some(parent_path) = self.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = join_virtual(&parent_path, name);
        match self.factory().stat(&path) {
            Ok(mut attr) => {
                attr.ino = self.intern(&path);
                reply.entry(&self.entry_ttl, &(&attr).into(), 0);
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn getattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: Option<u64>,
        reply: fuser::ReplyAttr,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.factory().stat(&path) {
            Ok(mut attr) => {
                attr.ino = ino;
                reply.attr(&self.attr_ttl, &(&attr).into());
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn open(&mut self, _req: &fuser::Request<'_>, ino: u64, flags: i32, reply: fuser::ReplyOpen) {
        if flags & libc::O_ACCMODE != libc::O_RDONLY {
            reply.error(libc::EACCES);
            return;
        }
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        if path.is_empty() {
            reply.error(libc::EACCES);
            return;
        }
        match self.factory().open(&path) {
            Some(reader) => {
                let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
                self.files.insert(fh, reader);
                reply.opened(fh, 0);
            }
            None => reply.error(libc::EACCES),
        }
    }

    fn read(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        let Some(reader) = self.files.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let mut buf = vec![0u8; size as usize];
        match reader.read(&mut buf, offset) {
            Ok(count) => reply.data(&buf[..count]),
            Err(errno) => reply.error(errno),
        }
    }

    fn release(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        if let Some(reader) = self.files.remove(&fh) {
            self.factory().release(&reader);
        }
        reply.ok();
    }

    fn opendir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _flags: i32,
        reply: fuser::ReplyOpen,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let real = if path.is_empty() {
            self.base.clone()
        } else {
            self.base.join(&path)
        };
        match fs::metadata(&real) {
            Ok(meta) if meta.is_dir() => {
                let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
                self.dirs.insert(
                    fh,
                    DirHandle {
                        path,
                        entries: None,
                    },
                );
                reply.opened(fh, 0);
            }
            Ok(_) => reply.error(libc::ENOTDIR),
            Err(err) => reply.error(err.raw_os_error().unwrap_or(libc::EIO)),
        }
    }

    fn readdir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: fuser::ReplyDirectory,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let Some(path) = self.dirs.get(&fh).map(|handle| handle.path.clone()) else {
            reply.error(libc::EBADF);
            return;
        };

        if self
            .dirs
            .get(&fh)
            .is_some_and(|handle| handle.entries.is_none())
        {
            match self.list_virtual(&path) {
                Ok(entries) => {
                    if let Some(handle) = self.dirs.get_mut(&fh) {
                        handle.entries = Some(entries);
                    }
                }
                Err(err) => {
                    reply.error(err.raw_os_error().unwrap_or(libc::EIO));
                    return;
                }
            }
        }

        let parent_ino = self.intern(parent_of(&path));
        let mut listed: Vec<(u64, FileKind, String)> = vec![
            (ino, FileKind::Directory, ".".to_string()),
            (parent_ino, FileKind::Directory, "..".to_string()),
        ];
        if let Some(entries) = self.dirs.get(&fh).and_then(|handle| handle.entries.as_ref()) {
            for entry in entries {
                let child_ino = self.intern(&join_virtual(&path, &entry.name));
                listed.push((child_ino, entry.kind, entry.name.clone()));
            }
        }

        for (index, (entry_ino, kind, name)) in
            listed.into_iter().enumerate().skip(offset as usize)
        {
            if reply.add(entry_ino, (index + 1) as i64, kind.into(), &name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        reply: fuser::ReplyEmpty,
    ) {
        // release unconditionally; there is nothing left that can fail
        self.dirs.remove(&fh);
        reply.ok();
    }
}

/// Mount options assembled by the host binary.
#[derive(Clone, Debug)]
pub struct MountOptions {
    /// Allow other users to access the mount.
    pub allow_other: bool,
    /// Allow root to access the mount.
    pub allow_root: bool,
    /// Filesystem name shown in mount output.
    pub fsname: String,
    /// Unmount automatically when the process exits.
    pub auto_unmount: bool,
    /// Raw options passed through from the command line.
    pub extra: Vec<String>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            allow_other: false,
            allow_root: false,
            fsname: "transcodefs".to_string(),
            auto_unmount: true,
            extra: Vec::new(),
        }
    }
}

#[cfg(feature = "fuse")]
fn fuser_options(options: &MountOptions) -> Vec<fuser::MountOption> {
    use fuser::MountOption;

    let mut mount_options = vec![
        MountOption::FSName(options.fsname.clone()),
        MountOption::RO,
        MountOption::DefaultPermissions,
    ];
    if options.auto_unmount {
        mount_options.push(MountOption::AutoUnmount);
    }
    if options.allow_other {
        mount_options.push(MountOption::AllowOther);
    } else if options.allow_root {
        mount_options.push(MountOption::AllowRoot);
    }
    for extra in &options.extra {
        mount_options.push(MountOption::CUSTOM(extra.clone()));
    }
    mount_options
}

/// Mount and serve until unmounted.
#[cfg(feature = "fuse")]
pub fn mount<P: AsRef<Path>>(
    fs: TranscodeFs,
    mountpoint: P,
    options: MountOptions,
) -> io::Result<()> {
    fuser::mount2(fs, mountpoint.as_ref(), &fuser_options(&options))
}

/// Mount in a background session; unmounts when the session drops.
#[cfg(feature = "fuse")]
pub fn spawn_mount<P: AsRef<Path>>(
    fs: TranscodeFs,
    mountpoint: P,
    options: MountOptions,
) -> io::Result<fuser::BackgroundSession> {
    fuser::spawn_mount2(fs, mountpoint.as_ref(), &fuser_options(&options))
}
