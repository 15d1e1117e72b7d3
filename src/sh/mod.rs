//! Spherical-harmonic decomposition of shell signals
//!
//! - `basis`: even-degree real SH bases and Laplace-Beltrami eigenvalues
//! - `bands`: band layout by degree and band power
//! - `fit`: precomputed per-shell fits applied voxel by voxel

pub mod bands;
pub mod basis;
pub mod fit;

pub use bands::BandLayout;
pub use basis::{laplace_beltrami, real_sh, sh_basis_matrix, sh_indices};
pub use fit::{fit_shell, FitScratch, ShFitter, ShellModel, VoxelStatus};
