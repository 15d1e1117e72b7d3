//! Common test utilities for shpower-core integration tests

#![allow(dead_code)]

use std::f64::consts::PI;
use std::fs;
use std::path::{Path, PathBuf};

use ndarray::Array4;
use shpower_core::acquisition::Acquisition;
use shpower_core::nifti_io::{save_nifti_to_file, DwiVolume};
use shpower_core::utils::idx3d;

pub const IDENTITY: [f64; 16] = [
    1.0, 0.0, 0.0, 0.0,
    0.0, 1.0, 0.0, 0.0,
    0.0, 0.0, 1.0, 0.0,
    0.0, 0.0, 0.0, 1.0,
];

/// Largest absolute difference between two buffers
pub fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}

/// Upper-hemisphere directions on a golden-angle spiral, rotated by `phase`
///
/// Every direction has a distinct x component at 4 decimals for the sizes
/// used in these tests.
pub fn spiral_dirs(n: usize, phase: f64) -> Vec<[f64; 3]> {
    let golden = PI * (3.0 - 5f64.sqrt());
    (0..n)
        .map(|i| {
            let z = 1.0 - (i as f64 + 0.5) / n as f64;
            let r = (1.0 - z * z).sqrt();
            let a = golden * i as f64 + phase;
            [r * a.cos(), r * a.sin(), z]
        })
        .collect()
}

/// One b0 followed by `per_shell` directions for each b-value in `shells`
pub fn multi_shell_acquisition(shells: &[f64], per_shell: usize) -> Acquisition {
    let mut bvals = vec![0.0];
    let mut bvecs = vec![[0.0; 3]];
    for (s, &b) in shells.iter().enumerate() {
        for d in spiral_dirs(per_shell, 0.3 * s as f64) {
            bvals.push(b);
            bvecs.push(d);
        }
    }
    Acquisition::new(bvals, bvecs).expect("valid acquisition")
}

/// Mask with the given voxels set
pub fn mask_with(dims: (usize, usize, usize), voxels: &[(usize, usize, usize)]) -> Vec<u8> {
    let mut mask = vec![0u8; dims.0 * dims.1 * dims.2];
    for &(x, y, z) in voxels {
        mask[idx3d(x, y, z, dims.0, dims.1)] = 1;
    }
    mask
}

/// Volume whose every voxel holds `signal(x, y, z, b, g)` for sample (b, g)
pub fn volume_from<F>(dims: (usize, usize, usize), acq: &Acquisition, signal: F) -> DwiVolume
where
    F: Fn(usize, usize, usize, f64, &[f64; 3]) -> f64,
{
    let n = acq.len();
    let data = Array4::from_shape_fn((dims.0, dims.1, dims.2, n), |(x, y, z, t)| {
        signal(x, y, z, acq.bvals[t], &acq.bvecs[t]) as f32
    });
    DwiVolume::from_array(data, (2.0, 2.0, 2.0), IDENTITY)
}

/// Signal of a single prolate tensor along x with baseline `s0`
pub fn tensor_signal(s0: f64, b: f64, g: &[f64; 3]) -> f64 {
    let (l1, l2) = (1.7e-3, 0.3e-3);
    let adc = l1 * g[0] * g[0] + l2 * (g[1] * g[1] + g[2] * g[2]);
    s0 * (-b * adc).exp()
}

/// Paths of inputs written by [`write_inputs`]
pub struct InputFiles {
    pub dwi: PathBuf,
    pub mask: PathBuf,
    pub bvals: PathBuf,
    pub bvecs: PathBuf,
}

/// Write a DWI volume to `path` as float32, gzipped for .nii.gz
pub fn write_dwi(path: &Path, dwi: &DwiVolume) {
    let (nx, ny, nz, n) = dwi.dims();

    // Fortran order, x fastest
    let mut data = Vec::with_capacity(nx * ny * nz * n);
    for t in 0..n {
        for z in 0..nz {
            for y in 0..ny {
                for x in 0..nx {
                    data.push(dwi.value(x, y, z, t) as f32);
                }
            }
        }
    }
    save_nifti_to_file(path, &data, &[nx, ny, nz, n], dwi.voxel_size, &dwi.affine).expect("write dwi");
}

/// Write a DWI volume, mask and FSL-style tables into `dir`
pub fn write_inputs(dir: &Path, dwi: &DwiVolume, mask: &[u8], acq: &Acquisition) -> InputFiles {
    let (nx, ny, nz) = dwi.spatial_dims();
    let files = InputFiles {
        dwi: dir.join("dwi.nii.gz"),
        mask: dir.join("mask.nii"),
        bvals: dir.join("dwi.bval"),
        bvecs: dir.join("dwi.bvec"),
    };
    write_dwi(&files.dwi, dwi);

    let mask_f32: Vec<f32> = mask.iter().map(|&m| m as f32).collect();
    save_nifti_to_file(&files.mask, &mask_f32, &[nx, ny, nz], dwi.voxel_size, &dwi.affine)
        .expect("write mask");

    let bvals: Vec<String> = acq.bvals.iter().map(|b| b.to_string()).collect();
    fs::write(&files.bvals, bvals.join(" ") + "\n").expect("write bvals");

    let mut bvecs = String::new();
    for axis in 0..3 {
        let row: Vec<String> = acq.bvecs.iter().map(|g| format!("{:.6}", g[axis])).collect();
        bvecs.push_str(&row.join(" "));
        bvecs.push('\n');
    }
    fs::write(&files.bvecs, bvecs).expect("write bvecs");

    files
}
