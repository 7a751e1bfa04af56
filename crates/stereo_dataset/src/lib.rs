//! Stereo pair and semantic label loading for semantic-depth training.
//!
//! This crate provides utilities for:
//! - Reading KITTI / Cityscapes file lists and resolving their path layouts
//! - Decoding and area-resizing images, nearest-resizing label maps
//! - Semantic validity masks by category policy
//! - Synchronized flip and photometric augmentation of stereo pairs
//! - Parallel batch assembly (ordered or shuffle-buffered) and test-time loading

// Module declarations
pub mod aug;
pub mod batch;
pub mod codec;
pub mod filelist;
pub mod loader;
pub mod semantic;
pub mod shutdown;
pub mod types;

// Re-export public API
pub use aug::{AugmentConfig, AugmentDraws, PhotometricShift};
pub use batch::{
    AssemblerConfig, AssemblerStats, BatchAssembler, StereoBatch, TestLoader,
    DEFAULT_MIN_AFTER_DEQUEUE,
};
pub use codec::{read_image, ImageFormatHint};
pub use filelist::{read_file_list, DataLayout, FileListEntry, SamplePaths};
pub use loader::SampleLoader;
pub use semantic::{read_semantic, validity_mask};
pub use shutdown::ShutdownSignal;
pub use types::*;

#[cfg(feature = "burn-runtime")]
pub use batch::BurnStereoBatch;
