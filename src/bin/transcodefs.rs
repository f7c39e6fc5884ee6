//! transcodefs CLI
//!
//! Mounts a base directory as a read-only filesystem whose mapped files
//! are transcoded on the fly:
//!
//! ```bash
//! transcodefs /music /mnt/music \
//!     -o source=flac,target=mp3,pipeline='flac -dcs - | lame --quiet - -'
//!
//! ls /mnt/music          # *.flac entries list as *.mp3
//! cp /mnt/music/a.mp3 .  # transcoded while you copy
//! fusermount -u /mnt/music
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use transcodefs::fs::fuse_shim;
use transcodefs::{CommandLauncher, ConfigBuilder, MountOptions, TranscodeFs};

#[derive(Parser)]
#[command(name = "transcodefs")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Mount a directory with on-the-fly media transcoding")]
#[command(long_about = "transcodefs - transcoding FUSE filesystem\n\n\
    Presents a read-only mirror of a base directory in which files with a\n\
    mapped source extension appear under the target extension and are\n\
    transcoded on demand by the configured pipeline. Artifacts stream\n\
    while they are produced, are cached in memory, and can spill to a\n\
    persist directory across mounts.\n\n\
    Options (give with -o, mount(8) style):\n\
      base=PATH | src=PATH      directory to mirror (or first positional)\n\
      source=EXT target=EXT pipeline=SPEC\n\
                                one transcode rule (repeat for more)\n\
      trueSize                  stat blocks for the exact transcoded size\n\
      readAhead=N               concurrent speculative transcodes\n\
      cacheCount=N[k|m|g]       cached artifact limit\n\
      cacheMemory=N[k|m|g|%]    cached bytes limit\n\
      cacheTime=N[s|m|h|d|w|y]  idle artifact lifetime\n\
      cachePersist=PATH         spill directory for evicted artifacts\n\n\
    Example:\n\
      transcodefs /music /mnt/music \\\n\
          -o source=flac,target=mp3,pipeline='flac -dcs - | lame --quiet - -'")]
struct Cli {
    /// Mount options, comma separated or repeated
    #[arg(short = 'o', value_name = "OPT[,OPT...]", value_delimiter = ',')]
    options: Vec<String>,

    /// Base directory and mountpoint, or just the mountpoint when the
    /// base is given with -o base=PATH
    #[arg(required = true, num_args = 1..=2, value_name = "PATH")]
    paths: Vec<PathBuf>,

    /// Allow other users to access the mount
    #[arg(long)]
    allow_other: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut builder = ConfigBuilder::new();
    for option in &cli.options {
        if let Err(err) = builder.option(option) {
            error!("{err}");
            return ExitCode::FAILURE;
        }
    }
    let (positional_base, mountpoint) = match cli.paths.as_slice() {
        [base, mountpoint] => (Some(base), mountpoint),
        [mountpoint] => (None, mountpoint),
        _ => unreachable!("clap enforces 1..=2 paths"),
    };
    if let Some(base) = positional_base {
        if let Err(err) = builder.positional(&base.to_string_lossy()) {
            error!("{err}");
            return ExitCode::FAILURE;
        }
    }
    let config = match builder.finish() {
        Ok(config) => config,
        Err(err) => {
            error!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let mount_options = MountOptions {
        allow_other: cli.allow_other,
        extra: config.passthrough.clone(),
        ..MountOptions::default()
    };
    let base = config.base.clone();
    let fs = TranscodeFs::new(config, Box::new(CommandLauncher::new()));

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        if let Err(err) = signal_hook::flag::register(signal, Arc::clone(&shutdown)) {
            error!("cannot install signal handler: {err}");
            return ExitCode::FAILURE;
        }
    }

    let session = match fuse_shim::spawn_mount(fs, mountpoint, mount_options) {
        Ok(session) => session,
        Err(err) => {
            error!("mount failed: {err}");
            return ExitCode::FAILURE;
        }
    };
    info!(base = %base.display(), mountpoint = %mountpoint.display(), "mounted");

    while !shutdown.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(200));
    }
    info!("unmounting");
    drop(session);
    ExitCode::SUCCESS
}
