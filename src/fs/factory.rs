//! Reader factory: the coordinator that turns virtual paths into readers.
//!
//! The factory owns every live [`Reader`], keyed by [`FileIndex`]:
//! exactly one reader per source file, shared by however many open handles
//! (and read-ahead holds) reference it. The last release harvests the
//! completed artifact into the [`ImageCache`] and tears the reader down.
//!
//! Read-ahead is a speculative transcode started from directory listings:
//! it takes its own sharer hold, and a done-callback hands the reader to a
//! background worker for release once production finishes, so the artifact
//! reaches the cache even if no client ever read it. The done path touches
//! only an atomic and the worker's queue, never the factory lock, so a
//! pipeline that fails during construction (while the lock is held) cannot
//! deadlock.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::fs::attr::FileAttr;
use crate::fs::cache::ImageCache;
use crate::fs::index::FileIndex;
use crate::fs::mapping::TranscodeMapping;
use crate::fs::pipeline::PipelineLauncher;
use crate::fs::reader::{FileReader, Reader, ReaderKind};
use crate::fs::transcode::{DoneGuard, TranscodeReader};

fn errno_of(error: &io::Error) -> i32 {
    error.raw_os_error().unwrap_or(libc::EIO)
}

/// Tunables the host passes through from its option machinery.
#[derive(Clone, Debug)]
pub struct FactoryOptions {
    /// Block `stat` until the transcoded size is exact.
    pub true_size: bool,
    /// Maximum concurrent speculative transcodes.
    pub read_ahead_limit: usize,
    pub cache_count_limit: usize,
    pub cache_memory_limit: u64,
    pub cache_time_limit: Option<Duration>,
    pub cache_persist_dir: Option<PathBuf>,
}

impl Default for FactoryOptions {
    fn default() -> Self {
        Self {
            true_size: false,
            read_ahead_limit: 16,
            cache_count_limit: 50,
            cache_memory_limit: u64::MAX,
            cache_time_limit: Some(Duration::from_secs(60 * 60)),
            cache_persist_dir: None,
        }
    }
}

struct QueueState {
    deque: VecDeque<FileIndex>,
    stop: bool,
}

/// FIFO of readers whose read-ahead production has finished, drained by
/// the release worker.
struct ReleaseQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl ReleaseQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                deque: VecDeque::new(),
                stop: false,
            }),
            available: Condvar::new(),
        }
    }

    fn push(&self, file_index: FileIndex) {
        let mut state = self.state.lock().unwrap();
        state.deque.push_back(file_index);
        self.available.notify_one();
    }

    /// Next finished read-ahead, or `None` once stopped, drained, and no
    /// read-ahead remains outstanding.
    fn pop(&self, outstanding: &AtomicUsize) -> Option<FileIndex> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(file_index) = state.deque.pop_front() {
                return Some(file_index);
            }
            if state.stop && outstanding.load(Ordering::SeqCst) == 0 {
                return None;
            }
            state = self.available.wait(state).unwrap();
        }
    }

    fn stop(&self) {
        self.state.lock().unwrap().stop = true;
        self.available.notify_all();
    }
}

struct FactoryCore {
    base: PathBuf,
    mapping: Arc<TranscodeMapping>,
    launcher: Box<dyn PipelineLauncher>,
    true_size: bool,
    read_ahead_limit: usize,
    cache: ImageCache,
    map: Mutex<FxHashMap<FileIndex, Arc<Reader>>>,
    read_ahead_active: AtomicUsize,
    release_queue: ReleaseQueue,
}

impl FactoryCore {
    fn release(&self, reader: &Arc<Reader>) {
        let mut map = self.map.lock().unwrap();
        if reader.unshare() == 0 {
            if let Some(image) = reader.take_image() {
                self.cache.add(reader.file_index(), image);
            }
            map.remove(&reader.file_index());
        }
    }

    /// Fires when a read-ahead transcode finishes, from whichever thread
    /// ended production. Must not touch the factory lock.
    fn read_ahead_done(&self, file_index: FileIndex) {
        self.read_ahead_active.fetch_sub(1, Ordering::SeqCst);
        self.release_queue.push(file_index);
    }

    fn run_release_worker(self: Arc<Self>) {
        while let Some(file_index) = self.release_queue.pop(&self.read_ahead_active) {
            let reader = self.map.lock().unwrap().get(&file_index).cloned();
            match reader {
                Some(reader) => self.release(&reader),
                // the terminal release already removed it
                None => debug!(%file_index, "read-ahead reader already gone"),
            }
        }
    }
}

/// Construct a transcode reader, optionally with a read-ahead hold that
/// is released asynchronously once production ends. Caller holds the
/// factory lock.
fn new_transcode_reader(
    core: &Arc<FactoryCore>,
    file_index: FileIndex,
    file: File,
    spec: &str,
    want_hold: bool,
) -> Arc<Reader> {
    let done = if want_hold {
        // armed before construction so a synchronous failure cannot
        // underflow the counter
        core.read_ahead_active.fetch_add(1, Ordering::SeqCst);
        let done_core = Arc::clone(core);
        DoneGuard::new(move || done_core.read_ahead_done(file_index))
    } else {
        DoneGuard::new(|| {})
    };
    let transcode = TranscodeReader::new(file_index, file, spec, &*core.launcher, done);
    let reader = Arc::new(Reader::new(file_index, ReaderKind::Transcode(transcode)));
    if want_hold {
        reader.retain();
    }
    reader
}

/// Manufactures and tracks [`Reader`]s, one per [`FileIndex`].
pub struct ReaderFactory {
    core: Arc<FactoryCore>,
    worker: Option<JoinHandle<()>>,
}

impl ReaderFactory {
    /// Build the factory, its cache (reconciling any persist directory),
    /// and the read-ahead release worker.
    pub fn new(
        base: PathBuf,
        mapping: Arc<TranscodeMapping>,
        launcher: Box<dyn PipelineLauncher>,
        options: FactoryOptions,
    ) -> Self {
        let cache = ImageCache::new(
            options.cache_count_limit,
            options.cache_memory_limit,
            options.cache_time_limit,
            &base,
            options.cache_persist_dir,
        );
        let core = Arc::new(FactoryCore {
            base,
            mapping,
            launcher,
            true_size: options.true_size,
            read_ahead_limit: options.read_ahead_limit,
            cache,
            map: Mutex::new(FxHashMap::default()),
            read_ahead_active: AtomicUsize::new(0),
            release_queue: ReleaseQueue::new(),
        });
        let worker_core = Arc::clone(&core);
        let worker = thread::spawn(move || worker_core.run_release_worker());
        Self {
            core,
            worker: Some(worker),
        }
    }

    pub fn base(&self) -> &Path {
        &self.core.base
    }

    /// Open a reader for the virtual `path` (relative to the base, no
    /// leading slash). Every successful open must be paired with a
    /// [`release`](Self::release).
    pub fn open(&self, path: &str) -> Option<Arc<Reader>> {
        let core = &self.core;
        let mut map = core.map.lock().unwrap();

        // an existing directory is never served through a reader
        let target_meta = fs::metadata(core.base.join(path));
        if let Ok(meta) = &target_meta {
            if meta.is_dir() {
                return None;
            }
        }

        let (source, element) = core.mapping.source_from(path);
        let source_meta = if element.is_some() {
            match fs::metadata(core.base.join(source.as_ref())) {
                Ok(meta) => meta,
                Err(_) => return None,
            }
        } else {
            match target_meta {
                Ok(meta) => meta,
                Err(_) => return None,
            }
        };
        let file_index = FileIndex::from(&source_meta);

        let reader = match map.get(&file_index) {
            Some(reader) => Arc::clone(reader),
            None => {
                let reader = match core.cache.open(file_index) {
                    Some(reader) => Arc::new(reader),
                    None => {
                        let file = match File::open(core.base.join(source.as_ref())) {
                            Ok(file) => file,
                            Err(_) => return None,
                        };
                        match element {
                            None => Arc::new(Reader::new(
                                file_index,
                                ReaderKind::File(FileReader::new(file)),
                            )),
                            Some(element) => {
                                let capacity = core.read_ahead_active.load(Ordering::SeqCst)
                                    < core.read_ahead_limit;
                                new_transcode_reader(
                                    core,
                                    file_index,
                                    file,
                                    &element.pipeline,
                                    capacity,
                                )
                            }
                        }
                    }
                };
                map.insert(file_index, Arc::clone(&reader));
                reader
            }
        };

        reader.retain();
        Some(reader)
    }

    /// Drop one share of the reader; the share that reaches zero harvests
    /// the artifact into the cache and destroys the reader.
    pub fn release(&self, reader: &Arc<Reader>) {
        self.core.release(reader);
    }

    /// Stat the virtual `path`. The reported size is the transcoded size
    /// when it is known (cache, spill, or live reader), exact when
    /// `trueSize` is configured, in which case this blocks until the
    /// transcode finishes.
    pub fn stat(&self, path: &str) -> Result<FileAttr, i32> {
        let core = &self.core;

        if path.is_empty() {
            return fs::metadata(&core.base)
                .map(|meta| FileAttr::from(&meta))
                .map_err(|error| errno_of(&error));
        }

        let held;
        let mut attr;
        {
            let mut map = core.map.lock().unwrap();

            let target_meta = fs::metadata(core.base.join(path));
            if let Ok(meta) = &target_meta {
                if meta.is_dir() {
                    return Ok(FileAttr::from(meta));
                }
            }

            let (source, element) = core.mapping.source_from(path);
            let Some(element) = element else {
                // no mapping: report the plain stat result
                return target_meta
                    .map(|meta| FileAttr::from(&meta))
                    .map_err(|error| errno_of(&error));
            };

            let source_meta = fs::metadata(core.base.join(source.as_ref()))
                .map_err(|error| errno_of(&error))?;
            attr = FileAttr::from(&source_meta);
            let file_index = FileIndex::from(&source_meta);

            if let Some(size) = core.cache.size_of(file_index) {
                attr.size = size;
                return Ok(attr);
            }

            let capacity =
                core.read_ahead_active.load(Ordering::SeqCst) < core.read_ahead_limit;
            if let Some(reader) = map.get(&file_index) {
                reader.retain();
                held = Arc::clone(reader);
            } else if core.true_size || capacity {
                let file = File::open(core.base.join(source.as_ref()))
                    .map_err(|error| errno_of(&error))?;
                let reader = new_transcode_reader(core, file_index, file, &element.pipeline, true);
                map.insert(file_index, Arc::clone(&reader));
                reader.retain();
                held = reader;
            } else {
                // no reader and no room to start one: admit the source
                // size, which is all we know
                return Ok(attr);
            }
            // a trueSize query blocks; never while holding the lock
        }

        attr.size = held.size(core.true_size);
        core.release(&held);
        Ok(attr)
    }

    /// Speculatively start transcoding the virtual `path` if capacity,
    /// mapping, cache, and the reader map all agree it is worthwhile.
    pub fn read_ahead(&self, path: &str) {
        let core = &self.core;
        let mut map = core.map.lock().unwrap();

        if core.read_ahead_active.load(Ordering::SeqCst) >= core.read_ahead_limit {
            return;
        }
        if let Ok(meta) = fs::metadata(core.base.join(path)) {
            if meta.is_dir() {
                return;
            }
        }
        let (source, element) = core.mapping.source_from(path);
        let Some(element) = element else {
            return;
        };
        let Ok(source_meta) = fs::metadata(core.base.join(source.as_ref())) else {
            return;
        };
        let file_index = FileIndex::from(&source_meta);
        if core.cache.size_of(file_index).is_some() {
            return;
        }
        if map.contains_key(&file_index) {
            return;
        }
        let Ok(file) = File::open(core.base.join(source.as_ref())) else {
            return;
        };

        debug!(path, "read-ahead transcode");
        let reader = new_transcode_reader(core, file_index, file, &element.pipeline, true);
        map.insert(file_index, reader);
    }

    #[cfg(test)]
    fn reader_count(&self) -> usize {
        self.core.map.lock().unwrap().len()
    }

    #[cfg(test)]
    fn read_ahead_active(&self) -> usize {
        self.core.read_ahead_active.load(Ordering::SeqCst)
    }
}

impl Drop for ReaderFactory {
    fn drop(&mut self) {
        // wait for in-flight read-aheads to finish and be harvested, then
        // let the cache drop (persisting what it holds)
        self.core.release_queue.stop();
        if let Some(worker) = self.worker.take() {
            if let Err(error) = worker.join() {
                warn!(?error, "release worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::pipeline::testing::MockLauncher;

    fn base_with_flac(contents: &[u8]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("album")).unwrap();
        fs::write(dir.path().join("album/song.flac"), contents).unwrap();
        fs::write(dir.path().join("readme.txt"), b"plain text").unwrap();
        dir
    }

    fn mapping() -> Arc<TranscodeMapping> {
        let mut mapping = TranscodeMapping::new();
        mapping.add("flac", "mp3", "");
        Arc::new(mapping)
    }

    fn factory_with(
        base: &Path,
        launcher: MockLauncher,
        options: FactoryOptions,
    ) -> ReaderFactory {
        ReaderFactory::new(
            base.to_path_buf(),
            mapping(),
            Box::new(launcher),
            options,
        )
    }

    fn wait_for<F: Fn() -> bool>(what: &str, predicate: F) {
        for _ in 0..1000 {
            if predicate() {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("timed out waiting for {what}");
    }

    #[test]
    fn test_open_plain_file_uses_file_reader() {
        let base = base_with_flac(b"flac data");
        let factory = factory_with(
            base.path(),
            MockLauncher::with_data(b""),
            FactoryOptions::default(),
        );

        let reader = factory.open("readme.txt").expect("plain file opens");
        let mut buf = [0u8; 5];
        assert_eq!(reader.read(&mut buf, 0).unwrap(), 5);
        assert_eq!(&buf, b"plain");
        assert!(reader.take_image().is_none());
        factory.release(&reader);
        assert_eq!(factory.reader_count(), 0);
    }

    #[test]
    fn test_open_directory_and_missing_file_fail() {
        let base = base_with_flac(b"flac data");
        let factory = factory_with(
            base.path(),
            MockLauncher::with_data(b""),
            FactoryOptions::default(),
        );

        assert!(factory.open("album").is_none());
        assert!(factory.open("missing.mp3").is_none());
        assert!(factory.open("missing.txt").is_none());
    }

    #[test]
    fn test_concurrent_opens_share_one_reader() {
        let base = base_with_flac(b"flac data");
        let options = FactoryOptions {
            read_ahead_limit: 0,
            ..FactoryOptions::default()
        };
        let factory = factory_with(
            base.path(),
            MockLauncher::with_data(b"mp3 bytes"),
            options,
        );

        let first = factory.open("album/song.mp3").expect("transcode opens");
        let second = factory.open("album/song.mp3").expect("dedup open");
        assert!(Arc::ptr_eq(&first, &second), "same reader for same source");
        assert_eq!(first.sharers(), 2);
        assert_eq!(factory.reader_count(), 1);

        factory.release(&second);
        assert_eq!(factory.reader_count(), 1, "still shared");
        factory.release(&first);
        assert_eq!(factory.reader_count(), 0, "destroyed exactly once");
    }

    #[test]
    fn test_terminal_release_caches_artifact() {
        let base = base_with_flac(b"flac data");
        let options = FactoryOptions {
            read_ahead_limit: 0,
            ..FactoryOptions::default()
        };
        let factory = factory_with(
            base.path(),
            MockLauncher::with_data(b"mp3 bytes"),
            options,
        );

        let reader = factory.open("album/song.mp3").unwrap();
        // size(wait) returns only after production ended, so the terminal
        // release below harvests a complete artifact
        assert_eq!(reader.size(true), 9);
        factory.release(&reader);

        // a new open is served from the cache, not a fresh transcode
        let cached = factory.open("album/song.mp3").expect("cache hit");
        let mut buf = [0u8; 4];
        assert_eq!(cached.read(&mut buf, 0).unwrap(), 4);
        assert_eq!(&buf, b"mp3 ");
        assert_eq!(cached.size(false), 9);
        assert!(cached.take_image().is_none(), "cache keeps the image");
        factory.release(&cached);
    }

    #[test]
    fn test_read_ahead_populates_cache_without_client() {
        let base = base_with_flac(b"flac data");
        let factory = factory_with(
            base.path(),
            MockLauncher::with_data(b"speculative"),
            FactoryOptions::default(),
        );

        factory.read_ahead("album/song.mp3");
        assert!(factory.read_ahead_active() <= 1);

        // the release worker harvests the artifact once production ends
        wait_for("read-ahead harvest", || {
            factory.read_ahead_active() == 0 && factory.reader_count() == 0
        });

        let cached = factory.open("album/song.mp3").expect("cache hit");
        assert_eq!(cached.size(false), 11);
        factory.release(&cached);
    }

    #[test]
    fn test_read_ahead_respects_limit_and_existing_state() {
        let base = base_with_flac(b"flac data");
        let options = FactoryOptions {
            read_ahead_limit: 0,
            ..FactoryOptions::default()
        };
        let factory = factory_with(
            base.path(),
            MockLauncher::with_data(b"unused"),
            options,
        );

        factory.read_ahead("album/song.mp3");
        assert_eq!(factory.reader_count(), 0, "no capacity, no reader");
        factory.read_ahead("readme.txt");
        assert_eq!(factory.reader_count(), 0, "unmapped path ignored");
    }

    #[test]
    fn test_stat_plain_and_directory() {
        let base = base_with_flac(b"flac data");
        let factory = factory_with(
            base.path(),
            MockLauncher::with_data(b""),
            FactoryOptions::default(),
        );

        let attr = factory.stat("").expect("base stats");
        assert_eq!(attr.kind, crate::fs::attr::FileKind::Directory);

        let attr = factory.stat("album").expect("directory stats");
        assert_eq!(attr.kind, crate::fs::attr::FileKind::Directory);

        let attr = factory.stat("readme.txt").expect("plain file stats");
        assert_eq!(attr.size, 10);

        assert!(factory.stat("missing.mp3").is_err());
        assert!(factory.stat("missing.txt").is_err());
    }

    #[test]
    fn test_stat_true_size_blocks_for_exact_size() {
        let base = base_with_flac(b"flac data");
        let options = FactoryOptions {
            true_size: true,
            read_ahead_limit: 16,
            ..FactoryOptions::default()
        };
        let factory = factory_with(
            base.path(),
            MockLauncher {
                data: b"exactly 18 bytes!!".to_vec(),
                chunk: 2,
                delay: Duration::from_millis(2),
                error: None,
            },
            options,
        );

        let attr = factory.stat("album/song.mp3").expect("stat succeeds");
        assert_eq!(attr.size, 18, "true size reported");

        // the transcode it started is harvested into the cache
        wait_for("harvest", || factory.reader_count() == 0);
        let attr = factory.stat("album/song.mp3").unwrap();
        assert_eq!(attr.size, 18, "second stat served from cache");
    }

    #[test]
    fn test_stat_without_capacity_admits_source_size() {
        let base = base_with_flac(b"flac data");
        let options = FactoryOptions {
            true_size: false,
            read_ahead_limit: 0,
            ..FactoryOptions::default()
        };
        let factory = factory_with(
            base.path(),
            MockLauncher::with_data(b"never used"),
            options,
        );

        let attr = factory.stat("album/song.mp3").expect("stat succeeds");
        assert_eq!(attr.size, 9, "source size admitted");
        assert_eq!(factory.reader_count(), 0, "no transcode started");
    }

    #[test]
    fn test_shutdown_waits_for_read_ahead_and_persists() {
        let base = base_with_flac(b"flac data");
        let spill = tempfile::tempdir().unwrap();
        let source_index =
            FileIndex::from(&base.path().join("album/song.flac").metadata().unwrap());
        let options = FactoryOptions {
            cache_persist_dir: Some(spill.path().to_path_buf()),
            ..FactoryOptions::default()
        };
        let factory = factory_with(
            base.path(),
            MockLauncher::with_data(b"persisted artifact"),
            options,
        );

        factory.read_ahead("album/song.mp3");
        drop(factory);

        let spilled = spill.path().join(source_index.to_string());
        assert_eq!(fs::read(&spilled).unwrap(), b"persisted artifact");
    }

    #[test]
    fn test_early_caller_release_still_caches() {
        let base = base_with_flac(b"flac data");
        let factory = factory_with(
            base.path(),
            MockLauncher {
                data: vec![3u8; 64],
                chunk: 4,
                delay: Duration::from_millis(2),
                error: None,
            },
            FactoryOptions::default(),
        );

        // the open also took a read-ahead hold, so a caller that loses
        // interest early does not abort the transcode
        let reader = factory.open("album/song.mp3").unwrap();
        factory.release(&reader);
        assert_eq!(factory.reader_count(), 1, "read-ahead hold keeps it alive");

        wait_for("read-ahead harvest", || {
            factory.reader_count() == 0 && factory.read_ahead_active() == 0
        });
        let cached = factory.open("album/song.mp3").expect("artifact cached anyway");
        assert_eq!(cached.size(false), 64);
        factory.release(&cached);
    }
}
