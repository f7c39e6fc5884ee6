//! Boundary to the transcoding pipeline collaborator.
//!
//! The core hands a wrapped pipeline spec (`filesrc name=filesrc ! ... !
//! fdsink name=fdsink`), the source file, and the write side of the
//! artifact pipe to a [`PipelineLauncher`]; everything about how bytes are
//! actually produced stays behind the [`Pipeline`] trait. End-of-stream
//! and diagnostics come back through an event callback, the moral
//! equivalent of a bus watch.
//!
//! The shipped [`CommandLauncher`] interprets the interior pipeline stages
//! as a shell command chain: `flac -dc ! lame -` becomes
//! `flac -dc | lame -` with stdin wired to the source and stdout to the
//! artifact pipe. An empty interior copies bytes through unchanged.

use std::fs::File;
use std::io;
use std::os::fd::{BorrowedFd, OwnedFd, RawFd};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::fs::mapping::{FDSINK, FDSRC, FILESRC};

/// Messages a running pipeline posts back to its owner.
#[derive(Debug)]
pub enum PipelineEvent {
    /// Production finished; no more bytes will arrive.
    Eos,
    Error(String),
    Warning(String),
}

/// Callback receiving [`PipelineEvent`]s, possibly from a pipeline-owned
/// thread.
pub type EventSink = Box<dyn Fn(PipelineEvent) + Send + Sync>;

/// The source file a pipeline consumes, by resolved location and by
/// descriptor. Which one is used depends on the spec's source marker.
#[derive(Clone, Copy, Debug)]
pub struct PipelineInput<'a> {
    pub location: &'a Path,
    pub fd: RawFd,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{0}: no element named fdsrc or filesrc")]
    MissingSource(String),
    #[error("{0}: no element named fdsink")]
    MissingSink(String),
    #[error("pipeline source: {0}")]
    Source(#[source] io::Error),
    #[error("pipeline spawn: {0}")]
    Spawn(#[source] io::Error),
}

/// A constructed, not-yet-started pipeline.
pub trait Pipeline: Send {
    /// Start producing, blocking until the state transition completes.
    fn play(&mut self) -> Result<(), PipelineError>;

    /// Transition to idle, aborting any transcode in progress, and block
    /// until the pipeline is torn down.
    fn shutdown(&mut self);
}

/// Builds a [`Pipeline`] from a wrapped spec.
pub trait PipelineLauncher: Send + Sync {
    fn launch(
        &self,
        spec: &str,
        input: PipelineInput<'_>,
        sink: OwnedFd,
        events: EventSink,
    ) -> Result<Box<dyn Pipeline>, PipelineError>;
}

/// Launcher that runs the interior pipeline stages as a `sh -c` command
/// chain.
#[derive(Debug, Default)]
pub struct CommandLauncher;

impl CommandLauncher {
    pub fn new() -> Self {
        Self
    }
}

impl PipelineLauncher for CommandLauncher {
    fn launch(
        &self,
        spec: &str,
        input: PipelineInput<'_>,
        sink: OwnedFd,
        events: EventSink,
    ) -> Result<Box<dyn Pipeline>, PipelineError> {
        let stages: Vec<&str> = spec.split(" ! ").map(str::trim).collect();
        let (first, interior) = match stages.split_first() {
            Some(split) => split,
            None => return Err(PipelineError::MissingSource(spec.to_string())),
        };
        let (last, interior) = match interior.split_last() {
            Some(split) => split,
            None => return Err(PipelineError::MissingSink(spec.to_string())),
        };
        if *last != FDSINK {
            return Err(PipelineError::MissingSink(spec.to_string()));
        }

        let stdin = match *first {
            FILESRC => File::open(input.location).map_err(PipelineError::Source)?,
            FDSRC => {
                // SAFETY: the caller keeps the source fd open for the
                // duration of launch; the clone is ours afterwards.
                let borrowed = unsafe { BorrowedFd::borrow_raw(input.fd) };
                File::from(borrowed.try_clone_to_owned().map_err(PipelineError::Source)?)
            }
            _ => return Err(PipelineError::MissingSource(spec.to_string())),
        };

        let command = if interior.is_empty() {
            "cat".to_string()
        } else {
            interior.join(" | ")
        };

        Ok(Box::new(CommandPipeline {
            command,
            stdin: Some(stdin),
            sink: Some(sink),
            events: Some(events),
            child: Arc::new(Mutex::new(None)),
            monitor: None,
        }))
    }
}

/// One shell command chain producing into the artifact pipe, with a
/// monitor thread that reaps the child and posts Eos.
struct CommandPipeline {
    command: String,
    stdin: Option<File>,
    sink: Option<OwnedFd>,
    events: Option<EventSink>,
    child: Arc<Mutex<Option<Child>>>,
    monitor: Option<JoinHandle<()>>,
}

impl Pipeline for CommandPipeline {
    fn play(&mut self) -> Result<(), PipelineError> {
        if self.monitor.is_some() {
            return Ok(());
        }
        let stdin = self.stdin.take().ok_or_else(|| {
            PipelineError::Spawn(io::Error::new(io::ErrorKind::Other, "pipeline already consumed"))
        })?;
        let sink = self.sink.take().ok_or_else(|| {
            PipelineError::Spawn(io::Error::new(io::ErrorKind::Other, "pipeline already consumed"))
        })?;
        let events = self.events.take().expect("events present until played");

        let spawned = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::from(stdin))
            .stdout(Stdio::from(sink))
            .spawn()
            .map_err(PipelineError::Spawn)?;
        *self.child.lock().unwrap() = Some(spawned);

        let child = Arc::clone(&self.child);
        self.monitor = Some(thread::spawn(move || loop {
            let status = {
                let mut slot = child.lock().unwrap();
                match slot.as_mut().map(Child::try_wait) {
                    None => break,
                    Some(Ok(None)) => None,
                    Some(Ok(Some(status))) => {
                        slot.take();
                        Some(Ok(status))
                    }
                    Some(Err(error)) => {
                        slot.take();
                        Some(Err(error))
                    }
                }
            };
            match status {
                None => thread::sleep(Duration::from_millis(20)),
                Some(Ok(status)) => {
                    if !status.success() {
                        events(PipelineEvent::Error(format!(
                            "pipeline exited with {status}"
                        )));
                    }
                    events(PipelineEvent::Eos);
                    break;
                }
                Some(Err(error)) => {
                    events(PipelineEvent::Error(format!("pipeline wait: {error}")));
                    events(PipelineEvent::Eos);
                    break;
                }
            }
        }));
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Some(child) = self.child.lock().unwrap().as_mut() {
            let _ = child.kill();
        }
        if let Some(monitor) = self.monitor.take() {
            let _ = monitor.join();
        }
    }
}

impl Drop for CommandPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A launcher that produces canned bytes, for exercising readers and
    //! the factory without a shell.

    use super::*;
    use std::io::Write;

    pub(crate) struct MockLauncher {
        pub data: Vec<u8>,
        pub chunk: usize,
        pub delay: Duration,
        pub error: Option<String>,
    }

    impl MockLauncher {
        pub(crate) fn with_data(data: &[u8]) -> Self {
            Self {
                data: data.to_vec(),
                chunk: 4,
                delay: Duration::ZERO,
                error: None,
            }
        }
    }

    impl PipelineLauncher for MockLauncher {
        fn launch(
            &self,
            _spec: &str,
            _input: PipelineInput<'_>,
            sink: OwnedFd,
            events: EventSink,
        ) -> Result<Box<dyn Pipeline>, PipelineError> {
            Ok(Box::new(MockPipeline {
                data: self.data.clone(),
                chunk: self.chunk.max(1),
                delay: self.delay,
                error: self.error.clone(),
                sink: Some(sink),
                events: Some(events),
                producer: None,
            }))
        }
    }

    struct MockPipeline {
        data: Vec<u8>,
        chunk: usize,
        delay: Duration,
        error: Option<String>,
        sink: Option<OwnedFd>,
        events: Option<EventSink>,
        producer: Option<JoinHandle<()>>,
    }

    impl Pipeline for MockPipeline {
        fn play(&mut self) -> Result<(), PipelineError> {
            let sink = self.sink.take().expect("played once");
            let events = self.events.take().expect("played once");
            let data = std::mem::take(&mut self.data);
            let chunk = self.chunk;
            let delay = self.delay;
            let error = self.error.take();
            self.producer = Some(thread::spawn(move || {
                let mut sink = File::from(sink);
                for piece in data.chunks(chunk) {
                    if sink.write_all(piece).is_err() {
                        break;
                    }
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                }
                drop(sink);
                if let Some(message) = error {
                    events(PipelineEvent::Error(message));
                }
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::fd::{AsRawFd, FromRawFd};
    use std::sync::mpsc;

    fn pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0; 2];
        // SAFETY: plain pipe(2); both ends are freshly owned on success.
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        unsafe {
            (
                OwnedFd::from_raw_fd(fds[0]),
                OwnedFd::from_raw_fd(fds[1]),
            )
        }
    }

    #[test]
    fn test_command_launcher_copies_bytes_through() {
        let source = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(source.path(), b"raw bytes").unwrap();
        let file = File::open(source.path()).unwrap();

        let (read_end, write_end) = pipe();
        let (tx, rx) = mpsc::channel();
        let events: EventSink = Box::new(move |event| {
            if matches!(event, PipelineEvent::Eos) {
                let _ = tx.send(());
            }
        });

        let mut pipeline = CommandLauncher::new()
            .launch(
                "filesrc name=filesrc ! fdsink name=fdsink",
                PipelineInput {
                    location: source.path(),
                    fd: file.as_raw_fd(),
                },
                write_end,
                events,
            )
            .unwrap();
        pipeline.play().unwrap();

        let mut out = Vec::new();
        File::from(read_end).read_to_end(&mut out).unwrap();
        assert_eq!(out, b"raw bytes");
        rx.recv_timeout(Duration::from_secs(10)).unwrap();
        pipeline.shutdown();
    }

    #[test]
    fn test_command_launcher_runs_interior_stages() {
        let source = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(source.path(), b"abc").unwrap();
        let file = File::open(source.path()).unwrap();

        let (read_end, write_end) = pipe();
        let mut pipeline = CommandLauncher::new()
            .launch(
                "filesrc name=filesrc ! tr a-z A-Z ! fdsink name=fdsink",
                PipelineInput {
                    location: source.path(),
                    fd: file.as_raw_fd(),
                },
                write_end,
                Box::new(|_| {}),
            )
            .unwrap();
        pipeline.play().unwrap();

        let mut out = Vec::new();
        File::from(read_end).read_to_end(&mut out).unwrap();
        assert_eq!(out, b"ABC");
        pipeline.shutdown();
    }

    #[test]
    fn test_launch_rejects_specs_without_markers() {
        let source = tempfile::NamedTempFile::new().unwrap();
        let file = File::open(source.path()).unwrap();
        let input = PipelineInput {
            location: source.path(),
            fd: file.as_raw_fd(),
        };

        let (_read_end, write_end) = pipe();
        let result = CommandLauncher::new().launch(
            "decode ! fdsink name=fdsink",
            input,
            write_end,
            Box::new(|_| {}),
        );
        assert!(matches!(result, Err(PipelineError::MissingSource(_))));

        let (_read_end, write_end) = pipe();
        let result = CommandLauncher::new().launch(
            "filesrc name=filesrc ! encode",
            input,
            write_end,
            Box::new(|_| {}),
        );
        assert!(matches!(result, Err(PipelineError::MissingSink(_))));
    }

    #[test]
    fn test_failing_command_posts_error_then_eos() {
        let source = tempfile::NamedTempFile::new().unwrap();
        let file = File::open(source.path()).unwrap();

        let (read_end, write_end) = pipe();
        let (tx, rx) = mpsc::channel();
        let events: EventSink = Box::new(move |event| {
            let _ = tx.send(match event {
                PipelineEvent::Eos => "eos",
                PipelineEvent::Error(_) => "error",
                PipelineEvent::Warning(_) => "warning",
            });
        });

        let mut pipeline = CommandLauncher::new()
            .launch(
                "filesrc name=filesrc ! false ! fdsink name=fdsink",
                PipelineInput {
                    location: source.path(),
                    fd: file.as_raw_fd(),
                },
                write_end,
                events,
            )
            .unwrap();
        pipeline.play().unwrap();
        drop(read_end);

        assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), "error");
        assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), "eos");
        pipeline.shutdown();
    }
}
