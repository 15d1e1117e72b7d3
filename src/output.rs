//! Output materialization
//!
//! Streams the voxel-major arenas of [`ShPowerMaps`] into 5D images of
//! shape (X, Y, Z, shells, coefficients|bands) in NIfTI (Fortran) order,
//! one 3D volume at a time, next to the input.

use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use rayon::prelude::*;

use crate::driver::ShPowerMaps;
use crate::error::{Error, Result};
use crate::nifti_io::save_nifti_volumes_to_file;

/// Coefficient image file name
pub const SH_SIGNAL_FILE: &str = "SH_signal.nii.gz";

/// Band power image file name
pub const POWER_FILE: &str = "power_SH.nii.gz";

/// Sub-directory created next to an input when no output directory is given
pub const DEFAULT_OUTPUT_SUBDIR: &str = "data.SH";

/// Paths of the two images written for one input
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputPaths {
    pub sh_signal: PathBuf,
    pub power: PathBuf,
}

/// Copy value `offset` of every voxel slot into one 3D volume
///
/// `arena` holds `out.len()` slots of `slot` values each.
pub fn gather_volume(arena: &[f32], slot: usize, offset: usize, out: &mut [f32]) {
    debug_assert_eq!(arena.len(), out.len() * slot);
    out.par_iter_mut()
        .enumerate()
        .for_each(|(v, o)| *o = arena[v * slot + offset]);
}

/// Write a voxel-major arena as a (X, Y, Z, shells, inner) image
///
/// Volume `s + n_shells · c` holds value `c` of shell `s` for every voxel.
fn save_arena(
    path: &Path,
    arena: &[f32],
    dims: (usize, usize, usize),
    n_shells: usize,
    inner: usize,
    voxel_size: (f64, f64, f64),
    affine: &[f64; 16],
) -> Result<()> {
    let (nx, ny, nz) = dims;
    let slot = n_shells * inner;
    save_nifti_volumes_to_file(
        path,
        &[nx, ny, nz, n_shells, inner],
        voxel_size,
        affine,
        |block, volume| {
            let s = block % n_shells;
            let c = block / n_shells;
            gather_volume(arena, slot, s * inner + c, volume);
        },
    )?;
    info!("wrote {}", path.display());
    Ok(())
}

/// Output directory for `input`
///
/// Without `out_dir` this is `<input dir>/data.SH`; otherwise
/// `<out_dir>/<input stem>` so several inputs can share one directory.
pub fn output_dir_for(input: &Path, out_dir: Option<&Path>) -> PathBuf {
    match out_dir {
        Some(dir) => dir.join(input_stem(input)),
        None => input
            .parent()
            .unwrap_or_else(|| Path::new(""))
            .join(DEFAULT_OUTPUT_SUBDIR),
    }
}

/// File name without .nii / .nii.gz
fn input_stem(input: &Path) -> String {
    let name = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.strip_suffix(".nii.gz")
        .or_else(|| name.strip_suffix(".nii"))
        .unwrap_or(&name)
        .to_string()
}

/// Write `SH_signal.nii.gz` and `power_SH.nii.gz` into `dir`
pub fn save_maps(
    maps: &ShPowerMaps,
    voxel_size: (f64, f64, f64),
    affine: &[f64; 16],
    dir: &Path,
) -> Result<OutputPaths> {
    fs::create_dir_all(dir).map_err(|e| {
        Error::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to create output directory '{}': {}", dir.display(), e),
        ))
    })?;

    let sh_signal = dir.join(SH_SIGNAL_FILE);
    save_arena(
        &sh_signal,
        &maps.coefficients,
        maps.dims,
        maps.n_shells,
        maps.n_coeff,
        voxel_size,
        affine,
    )?;

    let power = dir.join(POWER_FILE);
    save_arena(
        &power,
        &maps.power,
        maps.dims,
        maps.n_shells,
        maps.n_bands,
        voxel_size,
        affine,
    )?;

    Ok(OutputPaths { sh_signal, power })
}
