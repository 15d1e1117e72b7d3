//! Linear solvers for SH fitting
//!
//! - pinv: SVD pseudo-inverse and Laplace-Beltrami smoothed pseudo-inverse

pub mod pinv;

pub use pinv::*;
