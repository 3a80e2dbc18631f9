//! Volumetric dataset loading for Decathlon segmentation tasks.
//!
//! This crate provides:
//! - NIfTI reading/writing into channel-first volumes with their affine
//! - Dictionary-style transforms (load, BraTS region conversion, reorientation,
//!   resampling, cropping, flipping, intensity augmentation, inversion)
//! - Decathlon download, manifest parsing, and seeded train/validation split
//! - Parallel, Burn-compatible batch iteration

pub mod decathlon;
pub mod io;
pub mod loader;
pub mod transforms;
pub mod types;

pub use decathlon::{
    ensure_task, split_indices, DecathlonConfig, DecathlonDataset, DecathlonResource, Section,
    BRAIN_TUMOUR,
};
pub use io::{read_nifti, write_nifti};
pub use loader::{collate, LoaderConfig, VolumeBatch, VolumeLoader};
pub use transforms::{Compose, MapTransform};
pub use types::*;
