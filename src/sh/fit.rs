//! Per-shell SH fitting
//!
//! The fit matrix of a shell depends only on its directions, so it is built
//! once per dataset ([`ShFitter::new`]) and shared read-only by all voxels.
//! Per voxel the signal is divided by the mean baseline intensity and
//! multiplied by each shell's smoothed pseudo-inverse.

use log::{info, warn};
use nalgebra::DMatrix;

use crate::config::{DegeneratePolicy, ShBasis, ShPowerConfig};
use crate::error::{Error, Result};
use crate::sh::bands::BandLayout;
use crate::sh::basis::{laplace_beltrami, sh_basis_matrix};
use crate::shells::ShellPartition;
use crate::solvers::smooth_pinv;
use crate::sphere::{cart_to_sphere, normalize};

/// Precomputed fit for one shell
#[derive(Clone, Debug)]
pub struct ShellModel {
    pub bvalue: f64,
    /// Sample indices into the voxel signal
    pub indices: Vec<usize>,
    /// n_coeff × k smoothed pseudo-inverse of the shell basis
    pub inverse: DMatrix<f64>,
    /// Numerical rank of the (regularized) basis
    pub rank: usize,
    /// Fewer usable directions than coefficients, or rank-deficient basis
    pub degraded: bool,
}

impl ShellModel {
    /// Build the model of one shell from its sample indices and the
    /// (polar, azimuth) angles of their directions, one pair per index
    pub fn new(
        bvalue: f64,
        indices: Vec<usize>,
        angles: &[(f64, f64)],
        basis: ShBasis,
        order: usize,
        smooth: f64,
    ) -> Result<Self> {
        let n_coeff = BandLayout::new(order).n_coeff();
        let b = sh_basis_matrix(basis, order, angles);
        let weights: Vec<f64> = laplace_beltrami(order)
            .into_iter()
            .map(|l| smooth.sqrt() * l)
            .collect();
        let pinv = smooth_pinv(&b, &weights)?;
        let degraded = indices.len() < n_coeff || pinv.rank < n_coeff;

        Ok(Self {
            bvalue,
            indices,
            inverse: pinv.inverse,
            rank: pinv.rank,
            degraded,
        })
    }

    /// Coefficients for this shell from a full voxel signal, scaled by
    /// `1 / avg_b0`
    pub fn apply(&self, signal: &[f64], avg_b0: f64, out: &mut [f64]) {
        for (r, c) in out.iter_mut().enumerate() {
            let mut acc = 0.0;
            for (j, &idx) in self.indices.iter().enumerate() {
                acc += self.inverse[(r, j)] * (signal[idx] / avg_b0);
            }
            *c = acc;
        }
    }
}

/// Anomalies seen while fitting one voxel
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VoxelStatus {
    /// Mean baseline intensity was zero, negative or not finite
    pub invalid_baseline: bool,
    /// At least one coefficient or power value was not finite
    pub non_finite: bool,
}

/// Reusable per-worker buffers
#[derive(Clone, Debug)]
pub struct FitScratch {
    pub signal: Vec<f64>,
    coeffs: Vec<f64>,
    power: Vec<f64>,
}

/// All shells of a dataset, ready to fit voxels
#[derive(Clone, Debug)]
pub struct ShFitter {
    layout: BandLayout,
    baseline: Vec<usize>,
    shells: Vec<ShellModel>,
    policy: DegeneratePolicy,
}

impl ShFitter {
    pub fn new(partition: &ShellPartition, config: &ShPowerConfig) -> Result<Self> {
        let layout = BandLayout::new(config.sh_order);
        let n_coeff = layout.n_coeff();

        let shells = partition
            .shells
            .iter()
            .map(|shell| {
                let model = ShellModel::new(
                    shell.bvalue,
                    shell.indices.clone(),
                    &shell.hemisphere.angles(),
                    config.basis,
                    config.sh_order,
                    config.smooth,
                )?;
                info!(
                    "shell b={}: {} of {} samples used, rank {}/{}",
                    shell.bvalue,
                    model.indices.len(),
                    shell.n_candidates,
                    model.rank,
                    n_coeff
                );
                if model.degraded {
                    warn!(
                        "shell b={} is degraded: {} directions, rank {} for {} coefficients",
                        shell.bvalue,
                        model.indices.len(),
                        model.rank,
                        n_coeff
                    );
                }
                Ok(model)
            })
            .collect::<Result<Vec<_>>>()?;

        if partition.baseline.is_empty() {
            warn!("no baseline volumes found; every voxel will have an invalid b0");
        }

        Ok(Self {
            layout,
            baseline: partition.baseline.clone(),
            shells,
            policy: config.degenerate_policy,
        })
    }

    pub fn layout(&self) -> &BandLayout {
        &self.layout
    }

    pub fn shells(&self) -> &[ShellModel] {
        &self.shells
    }

    pub fn n_shells(&self) -> usize {
        self.shells.len()
    }

    /// Coefficient values per voxel ((M-1) · n_coeff)
    pub fn coeff_slot_len(&self) -> usize {
        self.shells.len() * self.layout.n_coeff()
    }

    /// Power values per voxel ((M-1) · n_bands)
    pub fn power_slot_len(&self) -> usize {
        self.shells.len() * self.layout.n_bands()
    }

    /// Indices of degraded shells
    pub fn degraded_shells(&self) -> Vec<usize> {
        self.shells
            .iter()
            .enumerate()
            .filter(|(_, s)| s.degraded)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn scratch(&self) -> FitScratch {
        FitScratch {
            signal: Vec::new(),
            coeffs: vec![0.0; self.layout.n_coeff()],
            power: vec![0.0; self.layout.n_bands()],
        }
    }

    /// Arithmetic mean of the baseline samples (NaN without baseline)
    pub fn mean_baseline(&self, signal: &[f64]) -> f64 {
        let sum: f64 = self.baseline.iter().map(|&i| signal[i]).sum();
        sum / self.baseline.len() as f64
    }

    /// Fit one voxel signal, writing all shells into the two output slots
    pub fn fit_voxel(
        &self,
        signal: &[f64],
        scratch: &mut FitScratch,
        coeff_slot: &mut [f32],
        power_slot: &mut [f32],
    ) -> VoxelStatus {
        let n_coeff = self.layout.n_coeff();
        let n_bands = self.layout.n_bands();
        let avg_b0 = self.mean_baseline(signal);
        let invalid_baseline = !(avg_b0.is_finite() && avg_b0 > 0.0);
        let strict = self.policy == DegeneratePolicy::Strict;

        let mut status = VoxelStatus {
            invalid_baseline,
            non_finite: false,
        };

        for (s, shell) in self.shells.iter().enumerate() {
            let coeff_out = &mut coeff_slot[s * n_coeff..(s + 1) * n_coeff];
            let power_out = &mut power_slot[s * n_bands..(s + 1) * n_bands];

            if strict && (invalid_baseline || shell.degraded) {
                coeff_out.fill(f32::NAN);
                power_out.fill(f32::NAN);
                continue;
            }

            shell.apply(signal, avg_b0, &mut scratch.coeffs);
            self.layout.band_power_into(&scratch.coeffs, &mut scratch.power);

            for (o, &c) in coeff_out.iter_mut().zip(&scratch.coeffs) {
                *o = c as f32;
            }
            for (o, &p) in power_out.iter_mut().zip(&scratch.power) {
                *o = p as f32;
            }
            if scratch.coeffs.iter().chain(&scratch.power).any(|v| !v.is_finite()) {
                status.non_finite = true;
            }
        }

        status
    }
}

/// Fit a single shell signal against its directions
///
/// `signal_shell` is already baseline-normalized and `directions` holds the
/// gradient direction of each sample, in the same order. Every sample gets
/// its own basis row; repeated directions are kept as repeated measurements.
pub fn fit_shell(
    signal_shell: &[f64],
    directions: &[[f64; 3]],
    order: usize,
    basis: ShBasis,
    smooth: f64,
) -> Result<Vec<f64>> {
    if signal_shell.len() != directions.len() {
        return Err(Error::InvalidAcquisition(format!(
            "{} samples but {} directions",
            signal_shell.len(),
            directions.len()
        )));
    }
    let angles = directions
        .iter()
        .enumerate()
        .map(|(i, d)| {
            normalize(d).map(|u| cart_to_sphere(&u)).ok_or_else(|| {
                Error::InvalidAcquisition(format!("direction {} is not a valid vector: {:?}", i, d))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let model = ShellModel::new(0.0, (0..signal_shell.len()).collect(), &angles, basis, order, smooth)?;
    let mut coeffs = vec![0.0; BandLayout::new(order).n_coeff()];
    model.apply(signal_shell, 1.0, &mut coeffs);
    Ok(coeffs)
}
