//! LRU cache of completed transcode artifacts.
//!
//! Completed [`Image`]s are indexed by [`FileIndex`] and ordered for
//! eviction by `(live_uses, last_idle_time)`: an artifact someone is
//! reading is never evicted, and among the idle ones the longest-idle
//! goes first. Eviction is bounded three ways (entry count, summed bytes,
//! idle age) and every evicted artifact is offered to the spill directory
//! before it is dropped, so a later open can still be served from disk
//! by a plain file reader.
//!
//! With a spill directory configured, startup walks the base tree
//! (following symlinks, pruning revisits) to collect the set of live
//! [`FileIndex`]es and removes any spilled artifact that no longer has a
//! source file behind it.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rustc_hash::FxHashSet;
use tracing::{debug, warn};

use crate::fs::image::Image;
use crate::fs::index::FileIndex;
use crate::fs::reader::{FileReader, ImageReader, Reader, ReaderKind};
use crate::fs::walk::{walk, Flow, Visitor, WalkEntry};

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

/// Eviction sort key. Ascending order puts unused, longest-idle entries
/// first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
struct LruKey {
    live_uses: u32,
    idle_since: i64,
}

struct Entry {
    image: Arc<Image>,
    lru: LruKey,
}

#[derive(Default)]
struct CacheInner {
    entries: BTreeMap<FileIndex, Entry>,
    lru: BTreeSet<(LruKey, FileIndex)>,
    count: usize,
    memory: u64,
}

struct CacheShared {
    inner: Mutex<CacheInner>,
    stop: Mutex<bool>,
    culler_wake: Condvar,
    count_limit: usize,
    memory_limit: u64,
    time_limit: Option<Duration>,
    persist_dir: Option<PathBuf>,
}

/// Shared hold on a cached artifact.
///
/// While any handle for an entry is live the entry cannot be evicted;
/// dropping the last handle stamps the entry's idle time and gives the
/// culler a chance to run.
pub struct ImageHandle {
    shared: Arc<CacheShared>,
    file_index: FileIndex,
    image: Arc<Image>,
}

impl ImageHandle {
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        self.image.read_at(offset, buf)
    }

    pub fn len(&self) -> usize {
        self.image.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image.is_empty()
    }
}

impl Drop for ImageHandle {
    fn drop(&mut self) {
        self.shared.release(self.file_index);
    }
}

/// The cache itself: an LRU over completed artifacts plus the culler
/// thread enforcing the idle-age limit.
pub struct ImageCache {
    shared: Arc<CacheShared>,
    culler: Option<JoinHandle<()>>,
}

impl ImageCache {
    /// Build the cache and, when a persist directory is configured,
    /// reconcile it against the live base tree before anything is served
    /// from it.
    pub fn new(
        count_limit: usize,
        memory_limit: u64,
        time_limit: Option<Duration>,
        base: &Path,
        persist_dir: Option<PathBuf>,
    ) -> Self {
        let shared = Arc::new(CacheShared {
            inner: Mutex::new(CacheInner::default()),
            stop: Mutex::new(false),
            culler_wake: Condvar::new(),
            count_limit,
            memory_limit,
            time_limit,
            persist_dir,
        });

        if let Some(persist_dir) = shared.persist_dir.clone() {
            reconcile(base, &persist_dir);
        }

        let culler_shared = Arc::clone(&shared);
        let culler = thread::spawn(move || culler_shared.run_culler());
        Self {
            shared,
            culler: Some(culler),
        }
    }

    /// Take ownership of a completed artifact. Runs the cull afterwards,
    /// so an over-limit cache sheds its longest-idle entries immediately.
    pub fn add(&self, file_index: FileIndex, image: Image) {
        let mut inner = self.shared.inner.lock().unwrap();
        let image = Arc::new(image);
        let size = image.len() as u64;
        let lru = LruKey {
            live_uses: 0,
            idle_since: unix_now(),
        };
        let replaced = inner.entries.insert(file_index, Entry { image, lru });
        debug_assert!(replaced.is_none(), "duplicate cache entry for {file_index}");
        if let Some(old) = replaced {
            inner.lru.remove(&(old.lru, file_index));
            inner.count -= 1;
            inner.memory -= old.image.len() as u64;
        }
        inner.lru.insert((lru, file_index));
        inner.count += 1;
        inner.memory += size;
        self.shared.cull(&mut inner);
    }

    /// Open a reader for the artifact: an [`ImageReader`] over the cached
    /// image, a [`FileReader`] over its spill file, or nothing.
    pub fn open(&self, file_index: FileIndex) -> Option<Reader> {
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if let Some(handle) = acquire(&self.shared, &mut inner, file_index) {
                return Some(Reader::new(
                    file_index,
                    ReaderKind::Image(ImageReader::new(handle)),
                ));
            }
        }
        let persist_dir = self.shared.persist_dir.as_ref()?;
        let file = File::open(persist_dir.join(file_index.to_string())).ok()?;
        Some(Reader::new(file_index, ReaderKind::File(FileReader::new(file))))
    }

    /// Known size of the artifact for `file_index`: cached, spilled, or
    /// unknown.
    pub fn size_of(&self, file_index: FileIndex) -> Option<u64> {
        {
            let inner = self.shared.inner.lock().unwrap();
            if let Some(entry) = inner.entries.get(&file_index) {
                return Some(entry.image.len() as u64);
            }
        }
        let persist_dir = self.shared.persist_dir.as_ref()?;
        fs::metadata(persist_dir.join(file_index.to_string()))
            .ok()
            .map(|meta| meta.len())
    }

    #[cfg(test)]
    fn set_idle_since(&self, file_index: FileIndex, idle_since: i64) {
        let mut inner = self.shared.inner.lock().unwrap();
        let Some(entry) = inner.entries.get_mut(&file_index) else {
            return;
        };
        let old = entry.lru;
        entry.lru.idle_since = idle_since;
        let new = entry.lru;
        inner.lru.remove(&(old, file_index));
        inner.lru.insert((new, file_index));
    }

    #[cfg(test)]
    fn totals(&self) -> (usize, u64) {
        let inner = self.shared.inner.lock().unwrap();
        (inner.count, inner.memory)
    }
}

impl Drop for ImageCache {
    fn drop(&mut self) {
        *self.shared.stop.lock().unwrap() = true;
        self.shared.culler_wake.notify_all();
        if let Some(culler) = self.culler.take() {
            let _ = culler.join();
        }

        // spill whatever survives, longest-idle first
        let mut inner = self.shared.inner.lock().unwrap();
        let order: Vec<(LruKey, FileIndex)> = inner.lru.iter().copied().collect();
        for (_, file_index) in order {
            if let Some(entry) = inner.entries.remove(&file_index) {
                self.shared.persist(file_index, &entry.image);
            }
        }
        inner.lru.clear();
        inner.count = 0;
        inner.memory = 0;
    }
}

/// Pin the entry and hand out a shared read handle. Caller holds the
/// inner lock.
fn acquire(
    shared: &Arc<CacheShared>,
    inner: &mut CacheInner,
    file_index: FileIndex,
) -> Option<ImageHandle> {
    let entry = inner.entries.get_mut(&file_index)?;
    let old = entry.lru;
    entry.lru.live_uses += 1;
    let new = entry.lru;
    let image = Arc::clone(&entry.image);
    inner.lru.remove(&(old, file_index));
    inner.lru.insert((new, file_index));
    Some(ImageHandle {
        shared: Arc::clone(shared),
        file_index,
        image,
    })
}

impl CacheShared {
    /// Unpin after the last clone of an acquire handle drops.
    fn release(&self, file_index: FileIndex) {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.entries.get_mut(&file_index) else {
            return;
        };
        let old = entry.lru;
        entry.lru.live_uses -= 1;
        if entry.lru.live_uses == 0 {
            entry.lru.idle_since = unix_now();
        }
        let new = entry.lru;
        inner.lru.remove(&(old, file_index));
        inner.lru.insert((new, file_index));
        if new.live_uses == 0 {
            self.cull(&mut inner);
        }
    }

    /// Evict unused entries, longest idle first, while any limit is
    /// exceeded. Caller holds the inner lock.
    fn cull(&self, inner: &mut CacheInner) {
        let now = unix_now();
        let cutoff = self
            .time_limit
            .map(|limit| now.saturating_sub(limit.as_secs() as i64));
        while let Some(&(key, file_index)) = inner.lru.iter().next() {
            if key.live_uses != 0 {
                break;
            }
            let over = inner.count > self.count_limit
                || inner.memory > self.memory_limit
                || cutoff.is_some_and(|cutoff| key.idle_since < cutoff);
            if !over {
                break;
            }
            inner.lru.remove(&(key, file_index));
            let Some(entry) = inner.entries.remove(&file_index) else {
                continue;
            };
            inner.count -= 1;
            inner.memory -= entry.image.len() as u64;
            debug!(%file_index, "evicting artifact");
            self.persist(file_index, &entry.image);
        }
    }

    /// Best-effort spill: write to `<index>.tmp`, rename into place, or
    /// unlink the temporary and lose the artifact.
    fn persist(&self, file_index: FileIndex, image: &Image) {
        let Some(persist_dir) = self.persist_dir.as_ref() else {
            return;
        };
        let name = persist_dir.join(file_index.to_string());
        let temp = persist_dir.join(format!("{file_index}.tmp"));
        let written = File::create(&temp).and_then(|mut file| image.write_to(&mut file));
        match written {
            Ok(()) => {
                if let Err(error) = fs::rename(&temp, &name) {
                    warn!(%file_index, %error, "spill rename failed");
                    let _ = fs::remove_file(&temp);
                }
            }
            Err(error) => {
                warn!(%file_index, %error, "spill write failed");
                let _ = fs::remove_file(&temp);
            }
        }
    }

    /// Culler loop: cull by idle age every `time_limit`, polling the stop
    /// flag every five seconds so shutdown never waits long. Without a
    /// time limit there is nothing age-based to do and the thread exits
    /// immediately.
    fn run_culler(&self) {
        let Some(time_limit) = self.time_limit else {
            return;
        };
        let period = time_limit.as_secs() as i64;
        let mut next = unix_now() + period;
        loop {
            {
                let stop = self.stop.lock().unwrap();
                if *stop {
                    return;
                }
                let (stop, _) = self
                    .culler_wake
                    .wait_timeout(stop, Duration::from_secs(5))
                    .unwrap();
                if *stop {
                    return;
                }
            }
            let now = unix_now();
            if now > next {
                let mut inner = self.inner.lock().unwrap();
                self.cull(&mut inner);
                next = now + period;
            }
        }
    }
}

/// Collects the [`FileIndex`] of everything reachable under the base,
/// following symlinks and visiting each file once.
#[derive(Default)]
struct LiveFiles {
    set: FxHashSet<FileIndex>,
}

impl Visitor for LiveFiles {
    fn before(&mut self, entry: &WalkEntry<'_>) -> Flow {
        if entry.revisit {
            return Flow::Prune;
        }
        let Some(meta) = entry.metadata else {
            return Flow::Prune;
        };
        if !self.set.insert(FileIndex::from(meta)) {
            // reached through another link earlier
            return Flow::Prune;
        }
        Flow::Continue
    }
}

/// Removes depth-1 regular files whose names parse as a [`FileIndex`]
/// absent from the live set.
struct RemoveUnreferenced<'a> {
    references: &'a FxHashSet<FileIndex>,
}

impl Visitor for RemoveUnreferenced<'_> {
    fn before(&mut self, entry: &WalkEntry<'_>) -> Flow {
        if entry.depth == 0 {
            return Flow::Continue;
        }
        if let Some(meta) = entry.metadata {
            if meta.is_file() {
                let name = entry
                    .path
                    .file_name()
                    .map(|name| name.to_string_lossy())
                    .unwrap_or_default();
                if let Ok(file_index) = name.parse::<FileIndex>() {
                    if !self.references.contains(&file_index) {
                        debug!(%file_index, "removing unreferenced spill file");
                        if let Err(error) = fs::remove_file(entry.path) {
                            warn!(path = ?entry.path, %error, "spill cleanup failed");
                        }
                    }
                }
            }
        }
        Flow::Prune
    }
}

/// Startup pass dropping spilled artifacts whose source files are gone.
/// Errors are logged; startup proceeds regardless.
fn reconcile(base: &Path, persist_dir: &Path) {
    let mut live = LiveFiles::default();
    if let Err(error) = walk(base, true, &mut live) {
        warn!(?base, %error, "base walk failed; skipping spill cleanup");
        return;
    }
    let mut cleanup = RemoveUnreferenced {
        references: &live.set,
    };
    if let Err(error) = walk(persist_dir, false, &mut cleanup) {
        warn!(?persist_dir, %error, "spill cleanup failed");
    }
}
