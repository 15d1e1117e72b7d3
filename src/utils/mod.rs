//! Utility functions
//!
//! - Mask binarization and voxel coordinate enumeration

pub mod mask;

pub use mask::*;
