//! Transcoding reader: drives a pipeline and serves the artifact while it
//! grows.
//!
//! A [`TranscodeReader`] wires the source file into a pipeline whose
//! output lands in a byte pipe. A single builder thread drains the pipe
//! into an [`Image`] under the reader's mutex and broadcasts a condvar so
//! readers blocked on not-yet-produced ranges wake as bytes arrive.
//! End-of-stream from the pipeline closes the parent's write side of the
//! pipe, the drain loop sees EOF, and the artifact freezes.
//!
//! Construction failures are logged and leave the reader without a
//! builder; reads then fail with `EIO` but nothing panics, since a broken
//! rule spec must not take the mount down.

use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, warn};

use crate::fs::cwd::CwdGuard;
use crate::fs::image::Image;
use crate::fs::index::FileIndex;
use crate::fs::pipeline::{EventSink, Pipeline, PipelineEvent, PipelineInput, PipelineLauncher};

/// Drain tile size. One pipe read appends at most this many bytes.
const TILE: usize = 8192;

/// Fires its callback exactly once, when dropped.
///
/// The factory arms one of these per transcode so it learns when
/// production ends: on the builder thread for a healthy pipeline, or
/// right inside construction when the pipeline never came up.
pub struct DoneGuard {
    callback: Option<Box<dyn FnOnce() + Send>>,
}

impl DoneGuard {
    pub fn new(callback: impl FnOnce() + Send + 'static) -> Self {
        Self {
            callback: Some(Box::new(callback)),
        }
    }
}

impl Drop for DoneGuard {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback();
        }
    }
}

/// Resolve the path behind an open descriptor through procfs.
fn fd_location(fd: RawFd) -> io::Result<PathBuf> {
    std::fs::read_link(format!("/proc/self/fd/{fd}"))
}

fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0; 2];
    // SAFETY: pipe(2) fills both slots on success and we own both ends.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

struct BuilderState {
    /// The drain thread has not yet seen EOF.
    running: bool,
    /// The pipeline has not yet posted end-of-stream.
    streaming: bool,
    /// The artifact; `None` once taken by the terminal release.
    image: Option<Image>,
    /// Parent's write side of the pipe. Closing it is how the drain loop
    /// is told to finish.
    out: Option<OwnedFd>,
}

struct BuilderShared {
    state: Mutex<BuilderState>,
    grown: Condvar,
}

impl BuilderShared {
    fn read(&self, buf: &mut [u8], offset: usize) -> usize {
        let mut state = self.state.lock().unwrap();
        // wait until the request can be answered
        while state.running
            && offset.saturating_add(buf.len())
                > state.image.as_ref().map_or(0, Image::len)
        {
            state = self.grown.wait(state).unwrap();
        }
        state
            .image
            .as_ref()
            .map_or(0, |image| image.read_at(offset, buf))
    }

    fn size(&self, wait: bool) -> u64 {
        let mut state = self.state.lock().unwrap();
        if wait {
            while state.running {
                state = self.grown.wait(state).unwrap();
            }
        }
        state.image.as_ref().map_or(0, Image::len) as u64
    }

    fn take_image(&self) -> Option<Image> {
        let mut state = self.state.lock().unwrap();
        if state.streaming {
            // production has not ended; the artifact is incomplete
            return None;
        }
        state.image.take()
    }

    /// End-of-stream: no more pipeline output. Close the parent's write
    /// side so the drain loop runs out.
    fn stop_streaming(&self) {
        let mut state = self.state.lock().unwrap();
        state.streaming = false;
        state.out.take();
    }

    /// Unblock and finish the drain loop regardless of pipeline state.
    fn stop_running(&self) {
        self.state.lock().unwrap().out.take();
    }
}

/// Owns the drain thread building the artifact from the pipe.
struct ImageBuilder {
    shared: Arc<BuilderShared>,
    thread: Option<JoinHandle<()>>,
}

impl ImageBuilder {
    fn spawn(pipe_read: OwnedFd, pipe_write: OwnedFd, done: DoneGuard) -> Self {
        let shared = Arc::new(BuilderShared {
            state: Mutex::new(BuilderState {
                running: true,
                streaming: true,
                image: Some(Image::new()),
                out: Some(pipe_write),
            }),
            grown: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        let thread = thread::spawn(move || Self::run(pipe_read, thread_shared, done));
        Self {
            shared,
            thread: Some(thread),
        }
    }

    fn run(pipe_read: OwnedFd, shared: Arc<BuilderShared>, done: DoneGuard) {
        let mut input = File::from(pipe_read);
        let mut tile = [0u8; TILE];
        loop {
            match input.read(&mut tile) {
                Ok(0) => break,
                Ok(count) => {
                    let mut state = shared.state.lock().unwrap();
                    if let Some(image) = state.image.as_mut() {
                        image.append(&tile[..count]);
                    }
                    shared.grown.notify_all();
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    warn!(%error, "artifact pipe read failed");
                    break;
                }
            }
        }
        drop(input);
        let mut state = shared.state.lock().unwrap();
        state.running = false;
        shared.grown.notify_all();
        drop(state);
        // fulfill the done guarantee now that production has ended
        drop(done);
    }
}

impl Drop for ImageBuilder {
    fn drop(&mut self) {
        self.shared.stop_running();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Reader variant producing its artifact through an external pipeline.
pub struct TranscodeReader {
    /// Keeps the source descriptor alive for the pipeline's lifetime.
    _source: File,
    pipeline: Mutex<Option<Box<dyn Pipeline>>>,
    builder: Option<ImageBuilder>,
}

impl TranscodeReader {
    /// Start transcoding `source` through the wrapped pipeline `spec`.
    ///
    /// `done` fires when production ends, from the builder thread on
    /// success, or during construction when the pipeline cannot be built.
    pub fn new(
        file_index: FileIndex,
        source: File,
        spec: &str,
        launcher: &dyn PipelineLauncher,
        done: DoneGuard,
    ) -> Self {
        let mut reader = Self {
            _source: source,
            pipeline: Mutex::new(None),
            builder: None,
        };
        let fd = reader._source.as_raw_fd();

        let location = match fd_location(fd) {
            Ok(location) => location,
            Err(error) => {
                error!(%file_index, %error, "cannot resolve source location");
                return reader;
            }
        };

        // pipelines resolve helper files relative to the source directory
        let directory = location.parent().unwrap_or(Path::new("/"));
        let _cwd = match CwdGuard::enter(directory) {
            Ok(guard) => Some(guard),
            Err(error) => {
                warn!(?directory, %error, "cannot enter source directory");
                None
            }
        };

        let (pipe_read, pipe_write) = match pipe() {
            Ok(ends) => ends,
            Err(error) => {
                error!(%file_index, %error, "pipe failed");
                return reader;
            }
        };
        let sink = match pipe_write.try_clone() {
            Ok(sink) => sink,
            Err(error) => {
                error!(%file_index, %error, "pipe clone failed");
                return reader;
            }
        };

        let builder = ImageBuilder::spawn(pipe_read, pipe_write, done);
        let events = Self::event_sink(Arc::clone(&builder.shared));

        let input = PipelineInput {
            location: &location,
            fd,
        };
        match launcher.launch(spec, input, sink, events) {
            Ok(mut pipeline) => match pipeline.play() {
                Ok(()) => {
                    debug!(%file_index, ?location, "transcode started");
                    *reader.pipeline.lock().unwrap() = Some(pipeline);
                    reader.builder = Some(builder);
                }
                Err(error) => {
                    error!(%file_index, %error, "pipeline start failed");
                    pipeline.shutdown();
                }
            },
            Err(error) => {
                error!(%file_index, %error, "pipeline construction failed");
            }
        }
        reader
    }

    /// Bus watch: EOS finishes the build, diagnostics are logged and never
    /// abort the stream.
    fn event_sink(shared: Arc<BuilderShared>) -> EventSink {
        Box::new(move |event| match event {
            PipelineEvent::Eos => shared.stop_streaming(),
            PipelineEvent::Error(message) => error!("pipeline: {message}"),
            PipelineEvent::Warning(message) => warn!("pipeline: {message}"),
        })
    }

    pub fn read(&self, buf: &mut [u8], offset: usize) -> Result<usize, i32> {
        match &self.builder {
            Some(builder) => Ok(builder.shared.read(buf, offset)),
            None => Err(libc::EIO),
        }
    }

    pub fn size(&self, wait: bool) -> u64 {
        self.builder
            .as_ref()
            .map_or(0, |builder| builder.shared.size(wait))
    }

    pub fn take_image(&self) -> Option<Image> {
        self.builder.as_ref()?.shared.take_image()
    }
}

impl Drop for TranscodeReader {
    fn drop(&mut self) {
        // idle the pipeline first so no more bytes arrive, then stop and
        // join the builder
        if let Some(mut pipeline) = self.pipeline.lock().unwrap().take() {
            pipeline.shutdown();
        }
        self.builder.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::pipeline::testing::MockLauncher;
    use crate::fs::pipeline::PipelineError;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    fn source_file(contents: &[u8]) -> (tempfile::TempDir, File, FileIndex) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("song.flac");
        let mut file = File::create(&path).unwrap();
        file.write_all(contents).unwrap();
        drop(file);
        let meta = path.metadata().unwrap();
        (dir, File::open(&path).unwrap(), FileIndex::from(&meta))
    }

    fn counting_guard() -> (Arc<AtomicUsize>, DoneGuard) {
        let fired = Arc::new(AtomicUsize::new(0));
        let clone = Arc::clone(&fired);
        (
            fired,
            DoneGuard::new(move || {
                clone.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    /// The guard fires on the builder thread moments after waiters wake;
    /// give it a beat instead of asserting instantly.
    fn wait_for_count(counter: &AtomicUsize, expected: usize) {
        for _ in 0..500 {
            if counter.load(Ordering::SeqCst) == expected {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(counter.load(Ordering::SeqCst), expected);
    }

    #[test]
    fn test_streams_and_freezes_artifact() {
        let (_dir, file, index) = source_file(b"ignored");
        let launcher = MockLauncher::with_data(b"transcoded bytes");
        let (fired, done) = counting_guard();

        let reader = TranscodeReader::new(index, file, "spec", &launcher, done);

        assert_eq!(reader.size(true), 16);
        let mut buf = [0u8; 10];
        assert_eq!(reader.read(&mut buf, 0).unwrap(), 10);
        assert_eq!(&buf, b"transcoded");
        assert_eq!(reader.read(&mut buf, 11).unwrap(), 5);
        assert_eq!(&buf[..5], b"bytes");
        assert_eq!(reader.read(&mut buf, 16).unwrap(), 0);
        assert_eq!(reader.read(&mut buf, 100).unwrap(), 0);

        wait_for_count(&fired, 1);
        let image = reader.take_image().expect("artifact complete");
        assert_eq!(image.len(), 16);
        assert!(reader.take_image().is_none(), "image taken twice");
    }

    #[test]
    fn test_read_blocks_for_slow_producer() {
        let (_dir, file, index) = source_file(b"ignored");
        let launcher = MockLauncher {
            data: b"slow but steady".to_vec(),
            chunk: 3,
            delay: Duration::from_millis(5),
            error: None,
        };
        let (_fired, done) = counting_guard();

        let reader = TranscodeReader::new(index, file, "spec", &launcher, done);

        // spans the still-growing end; must block until available
        let mut buf = [0u8; 15];
        assert_eq!(reader.read(&mut buf, 0).unwrap(), 15);
        assert_eq!(&buf, b"slow but steady");
    }

    /// Launcher whose producer finishes only when signalled, to observe
    /// the streaming state deterministically.
    struct GatedLauncher {
        data: Vec<u8>,
        gate: Mutex<Option<mpsc::Receiver<()>>>,
    }

    struct GatedPipeline {
        data: Vec<u8>,
        gate: Option<mpsc::Receiver<()>>,
        sink: Option<OwnedFd>,
        events: Option<EventSink>,
        producer: Option<JoinHandle<()>>,
    }

    impl PipelineLauncher for GatedLauncher {
        fn launch(
            &self,
            _spec: &str,
            _input: PipelineInput<'_>,
            sink: OwnedFd,
            events: EventSink,
        ) -> Result<Box<dyn Pipeline>, PipelineError> {
            Ok(Box::new(GatedPipeline {
                data: self.data.clone(),
                gate: self.gate.lock().unwrap().take(),
                sink: Some(sink),
                events: Some(events),
                producer: None,
            }))
        }
    }

    impl Pipeline for GatedPipeline {
        fn play(&mut self) -> Result<(), PipelineError> {
            let mut sink = File::from(self.sink.take().unwrap());
            let events = self.events.take().unwrap();
            let gate = self.gate.take().unwrap();
            let data = std::mem::take(&mut self.data);
            self.producer = Some(thread::spawn(move || {
                sink.write_all(&data).unwrap();
                drop(sink);
                let _ = gate.recv();
                events(PipelineEvent::Eos);
            }));
            Ok(())
        }

        fn shutdown(&mut self) {
            if let Some(producer) = self.producer.take() {
                let _ = producer.join();
            }
        }
    }

    #[test]
    fn test_no_image_while_streaming() {
        let (_dir, file, index) = source_file(b"ignored");
        let (open_gate, gate) = mpsc::channel();
        let launcher = GatedLauncher {
            data: b"abcd".to_vec(),
            gate: Mutex::new(Some(gate)),
        };
        let (fired, done) = counting_guard();

        let reader = TranscodeReader::new(index, file, "spec", &launcher, done);

        // all bytes are readable, but the stream has not ended
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf, 0).unwrap(), 4);
        assert!(reader.take_image().is_none());
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        open_gate.send(()).unwrap();
        assert_eq!(reader.size(true), 4);
        wait_for_count(&fired, 1);
        assert!(reader.take_image().is_some());
    }

    /// Launcher that always fails, as a broken pipeline spec would.
    struct FailingLauncher;

    impl PipelineLauncher for FailingLauncher {
        fn launch(
            &self,
            spec: &str,
            _input: PipelineInput<'_>,
            _sink: OwnedFd,
            _events: EventSink,
        ) -> Result<Box<dyn Pipeline>, PipelineError> {
            Err(PipelineError::MissingSink(spec.to_string()))
        }
    }

    #[test]
    fn test_construction_failure_reads_eio_and_fires_done() {
        let (_dir, file, index) = source_file(b"ignored");
        let (fired, done) = counting_guard();

        let reader = TranscodeReader::new(index, file, "spec", &FailingLauncher, done);

        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf, 0), Err(libc::EIO));
        assert_eq!(reader.size(false), 0);
        assert!(reader.take_image().is_none());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_mid_stream_joins_cleanly() {
        let (_dir, file, index) = source_file(b"ignored");
        let launcher = MockLauncher {
            data: vec![7u8; 1 << 16],
            chunk: 512,
            delay: Duration::from_millis(2),
            error: None,
        };
        let (fired, done) = counting_guard();

        let reader = TranscodeReader::new(index, file, "spec", &launcher, done);
        let mut buf = [0u8; 16];
        let _ = reader.read(&mut buf, 0);
        drop(reader);

        assert_eq!(fired.load(Ordering::SeqCst), 1, "done fires on teardown");
    }
}
