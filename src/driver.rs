//! Voxel-parallel driver
//!
//! Fits every masked voxel of a DWI volume and stores the per-shell SH
//! coefficients and band powers in two voxel-major arenas. Each voxel owns a
//! fixed slot in both arenas, handed out as disjoint `&mut` chunks by
//! `par_chunks_mut`, so workers never share a write location and the result
//! does not depend on the number of workers.
//!
//! A run can be cancelled through [`RunControl`]; the completion map kept in
//! [`ShPowerMaps`] lets [`resume`] finish only the voxels still missing.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use rayon::prelude::*;

use crate::acquisition::Acquisition;
use crate::config::ShPowerConfig;
use crate::error::{Error, Result};
use crate::nifti_io::DwiVolume;
use crate::sh::ShFitter;
use crate::shells::partition;
use crate::utils::{coord3d, count_masked, idx3d};

/// Default number of completed voxels between two progress callbacks
const PROGRESS_STEP: usize = 1024;

type ProgressFn = dyn Fn(usize, usize) + Send + Sync;

/// Cancel flag that can be cloned into callbacks and other threads
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Shared cancel flag, completion counter and optional progress callback
pub struct RunControl {
    cancel: CancelToken,
    completed: AtomicUsize,
    progress: Option<Box<ProgressFn>>,
    progress_step: usize,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

impl RunControl {
    pub fn new() -> Self {
        Self {
            cancel: CancelToken::new(),
            completed: AtomicUsize::new(0),
            progress: None,
            progress_step: PROGRESS_STEP,
        }
    }

    /// Control reporting `(done, total)` masked voxels as the run advances
    pub fn with_progress<F>(callback: F) -> Self
    where
        F: Fn(usize, usize) + Send + Sync + 'static,
    {
        Self {
            progress: Some(Box::new(callback)),
            ..Self::new()
        }
    }

    /// Observe `token` instead of a private cancel flag
    pub fn with_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Report progress every `step` completed voxels (at least 1)
    pub fn progress_every(mut self, step: usize) -> Self {
        self.progress_step = step.max(1);
        self
    }

    /// Handle that cancels this run from elsewhere
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Ask workers to stop; voxels already started still finish
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Masked voxels completed so far, including those of earlier runs
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Relaxed)
    }

    fn reset(&self, already_done: usize) {
        self.completed.store(already_done, Ordering::Relaxed);
    }

    fn voxel_done(&self, total: usize) {
        let done = self.completed.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(progress) = &self.progress {
            if done % self.progress_step == 0 || done == total {
                progress(done, total);
            }
        }
    }
}

/// Per-voxel output arenas
///
/// Slot `v` of `coefficients` holds `n_shells · n_coeff` values (shell-major),
/// slot `v` of `power` holds `n_shells · n_bands`, with `v` the Fortran
/// linear index of the voxel. Unmasked voxels stay zero.
#[derive(Clone, Debug)]
pub struct ShPowerMaps {
    pub dims: (usize, usize, usize),
    pub n_shells: usize,
    pub n_coeff: usize,
    pub n_bands: usize,
    /// Target b-value of each shell
    pub bvalues: Vec<f64>,
    pub coefficients: Vec<f32>,
    pub power: Vec<f32>,
    completed: Vec<bool>,
    config: ShPowerConfig,
}

impl ShPowerMaps {
    fn allocate(dims: (usize, usize, usize), fitter: &ShFitter, config: &ShPowerConfig) -> Self {
        let n_voxels = dims.0 * dims.1 * dims.2;
        Self {
            dims,
            n_shells: fitter.n_shells(),
            n_coeff: fitter.layout().n_coeff(),
            n_bands: fitter.layout().n_bands(),
            bvalues: fitter.shells().iter().map(|s| s.bvalue).collect(),
            coefficients: vec![0.0; n_voxels * fitter.coeff_slot_len()],
            power: vec![0.0; n_voxels * fitter.power_slot_len()],
            completed: vec![false; n_voxels],
            config: config.clone(),
        }
    }

    /// Configuration the maps were fitted with
    pub fn config(&self) -> &ShPowerConfig {
        &self.config
    }

    pub fn n_voxels(&self) -> usize {
        self.dims.0 * self.dims.1 * self.dims.2
    }

    pub fn coeff_slot_len(&self) -> usize {
        self.n_shells * self.n_coeff
    }

    pub fn power_slot_len(&self) -> usize {
        self.n_shells * self.n_bands
    }

    /// All coefficients of voxel (x, y, z), shell-major
    pub fn coefficients_at(&self, x: usize, y: usize, z: usize) -> &[f32] {
        let len = self.coeff_slot_len();
        let v = idx3d(x, y, z, self.dims.0, self.dims.1);
        &self.coefficients[v * len..(v + 1) * len]
    }

    /// All band powers of voxel (x, y, z), shell-major
    pub fn power_at(&self, x: usize, y: usize, z: usize) -> &[f32] {
        let len = self.power_slot_len();
        let v = idx3d(x, y, z, self.dims.0, self.dims.1);
        &self.power[v * len..(v + 1) * len]
    }

    pub fn is_complete_at(&self, x: usize, y: usize, z: usize) -> bool {
        self.completed[idx3d(x, y, z, self.dims.0, self.dims.1)]
    }

    /// Number of voxels written so far
    pub fn n_completed(&self) -> usize {
        self.completed.iter().filter(|&&c| c).count()
    }
}

/// Summary of one driver invocation
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunReport {
    pub masked_voxels: usize,
    /// Voxels fitted by this invocation
    pub processed_voxels: usize,
    /// Some masked voxels are still missing (the run was cancelled)
    pub cancelled: bool,
    /// b-values of shells with fewer usable directions than coefficients or
    /// a rank-deficient basis
    pub degraded_shells: Vec<f64>,
    pub invalid_baseline_voxels: usize,
    pub non_finite_voxels: usize,
}

#[derive(Clone, Copy, Default)]
struct Tally {
    processed: usize,
    invalid_baseline: usize,
    non_finite: usize,
}

impl Tally {
    fn merge(self, other: Tally) -> Tally {
        Tally {
            processed: self.processed + other.processed,
            invalid_baseline: self.invalid_baseline + other.invalid_baseline,
            non_finite: self.non_finite + other.non_finite,
        }
    }
}

/// Fit all masked voxels with a fresh control
pub fn run(
    dwi: &DwiVolume,
    mask: &[u8],
    mask_dims: (usize, usize, usize),
    acq: &Acquisition,
    config: &ShPowerConfig,
) -> Result<(ShPowerMaps, RunReport)> {
    run_with_control(dwi, mask, mask_dims, acq, config, &RunControl::new())
}

/// Fit all masked voxels, observing `control` for progress and cancellation
pub fn run_with_control(
    dwi: &DwiVolume,
    mask: &[u8],
    mask_dims: (usize, usize, usize),
    acq: &Acquisition,
    config: &ShPowerConfig,
    control: &RunControl,
) -> Result<(ShPowerMaps, RunReport)> {
    let fitter = prepare(dwi, mask, mask_dims, acq, config)?;
    let mut maps = ShPowerMaps::allocate(dwi.spatial_dims(), &fitter, config);
    let report = fill(&mut maps, &fitter, dwi, mask, config, control)?;
    Ok((maps, report))
}

/// Same fit settings, ignoring the worker count
fn same_fit(a: &ShPowerConfig, b: &ShPowerConfig) -> bool {
    ShPowerConfig {
        n_workers: b.n_workers,
        ..a.clone()
    } == *b
}

/// Complete a cancelled run, fitting only masked voxels not yet written
///
/// `config` must match the one the maps were started with, except for the
/// worker count.
pub fn resume(
    maps: &mut ShPowerMaps,
    dwi: &DwiVolume,
    mask: &[u8],
    mask_dims: (usize, usize, usize),
    acq: &Acquisition,
    config: &ShPowerConfig,
    control: &RunControl,
) -> Result<RunReport> {
    if !same_fit(&maps.config, config) {
        return Err(Error::InvalidConfig(format!(
            "cannot resume maps fitted with {:?} using {:?}",
            maps.config, config
        )));
    }
    let fitter = prepare(dwi, mask, mask_dims, acq, config)?;
    if maps.dims != dwi.spatial_dims()
        || maps.n_shells != fitter.n_shells()
        || maps.n_coeff != fitter.layout().n_coeff()
    {
        return Err(Error::InvalidConfig(format!(
            "cannot resume maps of {:?} with {} shells x {} coefficients using volume {:?} with {} shells x {} coefficients",
            maps.dims,
            maps.n_shells,
            maps.n_coeff,
            dwi.spatial_dims(),
            fitter.n_shells(),
            fitter.layout().n_coeff()
        )));
    }
    fill(maps, &fitter, dwi, mask, config, control)
}

/// Check every precondition and precompute the shell fits
fn prepare(
    dwi: &DwiVolume,
    mask: &[u8],
    mask_dims: (usize, usize, usize),
    acq: &Acquisition,
    config: &ShPowerConfig,
) -> Result<ShFitter> {
    config.validate()?;

    let dims = dwi.spatial_dims();
    if mask_dims != dims {
        return Err(Error::InvalidDimensions(format!(
            "mask dimensions {:?} do not match volume dimensions {:?}",
            mask_dims, dims
        )));
    }
    if mask.len() != dims.0 * dims.1 * dims.2 {
        return Err(Error::InvalidDimensions(format!(
            "mask has {} voxels, expected {}",
            mask.len(),
            dims.0 * dims.1 * dims.2
        )));
    }
    acq.check_volume_count(dwi.n_volumes())?;

    let part = partition(acq, &config.bvalues, config.bval_tol);
    debug!(
        "{} baseline volumes, shell sizes {:?}",
        part.baseline.len(),
        part.shells.iter().map(|s| s.len()).collect::<Vec<_>>()
    );
    ShFitter::new(&part, config)
}

fn fill(
    maps: &mut ShPowerMaps,
    fitter: &ShFitter,
    dwi: &DwiVolume,
    mask: &[u8],
    config: &ShPowerConfig,
    control: &RunControl,
) -> Result<RunReport> {
    let (nx, ny, _) = maps.dims;
    let masked = count_masked(mask);
    let already_done = maps
        .completed
        .iter()
        .zip(mask)
        .filter(|(&c, &m)| c && m != 0)
        .count();
    control.reset(already_done);

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.n_workers)
        .build()?;
    info!(
        "fitting {} masked voxels ({} already done) on {} workers",
        masked,
        already_done,
        pool.current_num_threads()
    );

    let coeff_len = maps.coeff_slot_len();
    let power_len = maps.power_slot_len();
    let ShPowerMaps {
        coefficients,
        power,
        completed,
        ..
    } = maps;

    let tally = pool.install(|| {
        coefficients
            .par_chunks_mut(coeff_len)
            .zip(power.par_chunks_mut(power_len))
            .zip(completed.par_iter_mut())
            .enumerate()
            .map_init(
                || fitter.scratch(),
                |scratch, (v, ((coeff_slot, power_slot), done))| {
                    if mask[v] == 0 || *done || control.is_cancelled() {
                        return Tally::default();
                    }
                    let (x, y, z) = coord3d(v, nx, ny);
                    dwi.signal_into(x, y, z, &mut scratch.signal);

                    let signal = std::mem::take(&mut scratch.signal);
                    let status = fitter.fit_voxel(&signal, scratch, coeff_slot, power_slot);
                    scratch.signal = signal;

                    *done = true;
                    control.voxel_done(masked);
                    Tally {
                        processed: 1,
                        invalid_baseline: status.invalid_baseline as usize,
                        non_finite: status.non_finite as usize,
                    }
                },
            )
            .reduce(Tally::default, Tally::merge)
    });

    let remaining = masked - (already_done + tally.processed);
    let report = RunReport {
        masked_voxels: masked,
        processed_voxels: tally.processed,
        cancelled: remaining > 0,
        degraded_shells: fitter
            .degraded_shells()
            .into_iter()
            .map(|i| fitter.shells()[i].bvalue)
            .collect(),
        invalid_baseline_voxels: tally.invalid_baseline,
        non_finite_voxels: tally.non_finite,
    };

    if report.cancelled {
        warn!("run cancelled with {} of {} masked voxels missing", remaining, masked);
    } else {
        info!("fitted {} voxels", tally.processed);
    }
    if report.invalid_baseline_voxels > 0 {
        warn!(
            "{} voxels have a non-positive or non-finite mean baseline",
            report.invalid_baseline_voxels
        );
    }
    if report.non_finite_voxels > 0 {
        warn!("{} voxels produced non-finite values", report.non_finite_voxels);
    }

    Ok(report)
}
