//! SHPower-Core: per-shell spherical-harmonic power of diffusion MRI
//!
//! This crate decomposes the angular signal of each diffusion shell into
//! even-degree real spherical harmonics and reports the energy per degree
//! (band power), voxel by voxel.
//!
//! # Modules
//! - `config`: Run configuration (SH order, b-values, basis, smoothing)
//! - `acquisition`: b-value / b-vector tables
//! - `sphere`: Hemisphere projection of gradient directions
//! - `shells`: Shell partitioning of the acquisition
//! - `sh`: SH basis, band layout and per-shell fitting
//! - `solvers`: Pseudo-inverse solvers
//! - `driver`: Voxel-parallel fitting over a mask
//! - `output`: Output image materialization
//! - `utils`: Mask helpers

// Core modules
pub mod error;
pub mod config;

// Algorithm modules
pub mod acquisition;
pub mod sphere;
pub mod shells;
pub mod sh;
pub mod solvers;
pub mod driver;
pub mod utils;

// I/O modules
pub mod nifti_io;
pub mod output;

pub use config::{DegeneratePolicy, ShBasis, ShPowerConfig};
pub use driver::{resume, run, run_with_control, CancelToken, RunControl, RunReport, ShPowerMaps};
pub use error::{Error, Result};
