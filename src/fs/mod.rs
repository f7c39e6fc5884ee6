pub mod attr;
pub mod cache;
pub mod cwd;
pub mod factory;
pub mod fuse_shim;
pub mod image;
pub mod index;
pub mod mapping;
pub mod pipeline;
pub mod reader;
pub mod transcode;
pub mod walk;

pub use attr::{FileAttr, FileKind};
pub use cache::{ImageCache, ImageHandle};
pub use factory::{FactoryOptions, ReaderFactory};
pub use fuse_shim::{MountOptions, TranscodeFs};
pub use image::Image;
pub use index::FileIndex;
pub use mapping::{TranscodeElement, TranscodeMapping};
pub use pipeline::{CommandLauncher, Pipeline, PipelineEvent, PipelineLauncher};
pub use reader::Reader;
pub use transcode::{DoneGuard, TranscodeReader};

#[cfg(feature = "fuse")]
pub use fuse_shim::{mount, spawn_mount};
