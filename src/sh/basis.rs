//! Real even-degree spherical-harmonic bases
//!
//! Coefficients are ordered by degree l = 0, 2, ..., L and, within a
//! degree, by order m = -l..=l. Both conventions follow the dipy legacy
//! definitions built on the complex harmonic
//! Y_l^m(θ, φ) = N_l^m P_l^m(cos θ) e^{imφ} with the Condon-Shortley phase
//! included in P_l^m.
//!
//! Reference:
//! Descoteaux, M., Angelino, E., Fitzgibbons, S., Deriche, R. (2007).
//! "Regularized, fast, and robust analytical Q-ball imaging."
//! Magnetic Resonance in Medicine, 58:497-510. https://doi.org/10.1002/mrm.21277

use std::f64::consts::{PI, SQRT_2};

use nalgebra::DMatrix;

use crate::config::ShBasis;

/// (m, l) pairs of the even-degree basis up to `order`
pub fn sh_indices(order: usize) -> Vec<(i32, u32)> {
    let mut out = Vec::new();
    for l in (0..=order).step_by(2) {
        let l = l as i32;
        for m in -l..=l {
            out.push((m, l as u32));
        }
    }
    out
}

/// Eigenvalues -l(l+1) of the Laplace-Beltrami operator per coefficient
pub fn laplace_beltrami(order: usize) -> Vec<f64> {
    sh_indices(order)
        .into_iter()
        .map(|(_, l)| {
            let l = l as f64;
            -l * (l + 1.0)
        })
        .collect()
}

/// Associated Legendre function P_l^m(x), m >= 0, with Condon-Shortley phase
pub fn assoc_legendre(l: u32, m: u32, x: f64) -> f64 {
    if m > l {
        return 0.0;
    }

    // P_m^m = (-1)^m (2m-1)!! (1-x²)^{m/2}
    let mut pmm = 1.0;
    if m > 0 {
        let somx2 = ((1.0 - x) * (1.0 + x)).max(0.0).sqrt();
        let mut fact = 1.0;
        for _ in 0..m {
            pmm *= -fact * somx2;
            fact += 2.0;
        }
    }
    if l == m {
        return pmm;
    }

    let mut pmmp1 = x * (2 * m + 1) as f64 * pmm;
    if l == m + 1 {
        return pmmp1;
    }

    let mut pll = 0.0;
    for ll in (m + 2)..=l {
        pll = ((2 * ll - 1) as f64 * x * pmmp1 - (ll + m - 1) as f64 * pmm) / (ll - m) as f64;
        pmm = pmmp1;
        pmmp1 = pll;
    }
    pll
}

/// Normalization sqrt((2l+1)/(4π) · (l-m)!/(l+m)!)
fn sh_norm(l: u32, m: u32) -> f64 {
    let mut ratio = 1.0;
    for k in (l - m + 1)..=(l + m) {
        ratio /= k as f64;
    }
    ((2 * l + 1) as f64 / (4.0 * PI) * ratio).sqrt()
}

/// Real SH basis function of order `m`, degree `l` at polar `theta`, azimuth `phi`
pub fn real_sh(basis: ShBasis, m: i32, l: u32, theta: f64, phi: f64) -> f64 {
    let am = m.unsigned_abs();
    let radial = sh_norm(l, am) * assoc_legendre(l, am, theta.cos());
    let angle = am as f64 * phi;

    match basis {
        ShBasis::Descoteaux07 => match m {
            m if m < 0 => SQRT_2 * radial * angle.cos(),
            0 => radial,
            _ => SQRT_2 * radial * angle.sin(),
        },
        ShBasis::Tournier07 => {
            if m < 0 {
                radial * angle.sin()
            } else {
                radial * angle.cos()
            }
        }
    }
}

/// Basis matrix with one row per (θ, φ) sample and one column per coefficient
pub fn sh_basis_matrix(basis: ShBasis, order: usize, angles: &[(f64, f64)]) -> DMatrix<f64> {
    let indices = sh_indices(order);
    DMatrix::from_fn(angles.len(), indices.len(), |r, c| {
        let (theta, phi) = angles[r];
        let (m, l) = indices[c];
        real_sh(basis, m, l, theta, phi)
    })
}
