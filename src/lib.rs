//! # transcodefs
//!
//! A read-only FUSE filesystem that mirrors a base directory and exposes
//! selected files through on-the-fly transcoding pipelines: a client
//! reading `song.mp3` under the mount observes the bytes produced by
//! feeding the real `song.flac` through a configured pipeline. Output is
//! streamable while it is still being produced, and finished artifacts
//! are cached in memory with an optional on-disk spill directory.
//!
//! # Feature Flags
//!
//! - **`fuse`**: the kernel mount layer (requires the `fuser` crate);
//!   everything else (mapping, readers, cache, factory) works without
//!   it and is what the test suite drives.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    TranscodeFs (fuse_shim)                  │
//! │          getattr / open / read / readdir / release          │
//! └──────────────────────────────┬──────────────────────────────┘
//!                                ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        ReaderFactory                        │
//! │   one Reader per FileIndex · read-ahead · release worker    │
//! └───────┬──────────────────────┬──────────────────────┬───────┘
//!         ▼                      ▼                      ▼
//! ┌───────────────┐    ┌──────────────────┐    ┌───────────────┐
//! │ TranscodeMap  │    │ TranscodeReader  │    │  ImageCache   │
//! │ ext ⇄ ext     │    │ pipeline + build │    │ LRU + spill   │
//! └───────────────┘    └──────────────────┘    └───────────────┘
//! ```

pub mod config;
pub mod fs;

pub use config::{Config, ConfigBuilder, ConfigError};
pub use fs::*;
