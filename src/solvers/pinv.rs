//! Pseudo-inverse solvers
//!
//! Minimum-norm least squares through the SVD. Singular values below
//! `PINV_RCOND · σ_max` are treated as zero, so rank-deficient and
//! underdetermined systems still return the minimum-norm solution.
//!
//! The smoothed variant solves
//!   min ||Bx - s||² + ||diag(w) x||²
//! by taking the pseudo-inverse of the stacked matrix [B; diag(w)] and
//! keeping the columns that act on s.

use nalgebra::DMatrix;

use crate::error::{Error, Result};

/// Relative cutoff for small singular values
pub const PINV_RCOND: f64 = 1e-15;

/// Pseudo-inverse together with the numerical rank of the input
#[derive(Clone, Debug)]
pub struct Pinv {
    /// ncols × nrows inverse
    pub inverse: DMatrix<f64>,
    /// Number of singular values above the cutoff
    pub rank: usize,
}

/// Moore-Penrose pseudo-inverse of `a`
pub fn pinv(a: &DMatrix<f64>) -> Result<Pinv> {
    let (m, n) = a.shape();
    if m == 0 || n == 0 {
        return Ok(Pinv {
            inverse: DMatrix::zeros(n, m),
            rank: 0,
        });
    }
    if a.iter().any(|v| !v.is_finite()) {
        return Err(Error::LinearAlgebra(
            "pseudo-inverse input contains non-finite values".to_string(),
        ));
    }

    let svd = a.clone().svd(true, true);
    let sigma_max = svd.singular_values.max();
    let eps = PINV_RCOND * sigma_max;
    let rank = svd.singular_values.iter().filter(|&&s| s > eps).count();
    let inverse = svd
        .pseudo_inverse(eps)
        .map_err(|e| Error::LinearAlgebra(e.to_string()))?;

    Ok(Pinv { inverse, rank })
}

/// Pseudo-inverse of `b` regularized by a diagonal penalty `weights`
///
/// Returns an ncols × nrows matrix. The reported rank is the rank of the
/// stacked system, so a penalty can lift an underdetermined basis to full
/// column rank.
pub fn smooth_pinv(b: &DMatrix<f64>, weights: &[f64]) -> Result<Pinv> {
    let (k, n) = b.shape();
    if weights.len() != n {
        return Err(Error::LinearAlgebra(format!(
            "{} penalty weights for {} basis columns",
            weights.len(),
            n
        )));
    }
    if weights.iter().all(|&w| w == 0.0) {
        return pinv(b);
    }

    let mut stacked = DMatrix::zeros(k + n, n);
    stacked.view_mut((0, 0), (k, n)).copy_from(b);
    for (j, &w) in weights.iter().enumerate() {
        stacked[(k + j, j)] = w;
    }

    let full = pinv(&stacked)?;
    let inverse = full.inverse.columns(0, k).into_owned();
    Ok(Pinv {
        inverse,
        rank: full.rank,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_mat_close(a: &DMatrix<f64>, b: &DMatrix<f64>, tol: f64) {
        assert_eq!(a.shape(), b.shape());
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < tol, "{} vs {}", x, y);
        }
    }

    #[test]
    fn test_pinv_square_matches_inverse() {
        let a = DMatrix::from_row_slice(3, 3, &[4.0, 1.0, 0.0, 1.0, 3.0, 1.0, 0.0, 1.0, 2.0]);
        let p = pinv(&a).unwrap();
        assert_eq!(p.rank, 3);
        let identity = &a * &p.inverse;
        assert_mat_close(&identity, &DMatrix::identity(3, 3), 1e-12);
    }

    #[test]
    fn test_pinv_tall_least_squares() {
        // Fit y = c0 + c1 x to exact line data
        let a = DMatrix::from_row_slice(4, 2, &[1.0, 0.0, 1.0, 1.0, 1.0, 2.0, 1.0, 3.0]);
        let y = nalgebra::DVector::from_vec(vec![1.0, 3.0, 5.0, 7.0]);
        let p = pinv(&a).unwrap();
        let c = &p.inverse * y;
        assert!((c[0] - 1.0).abs() < 1e-12);
        assert!((c[1] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_pinv_underdetermined_min_norm() {
        // x0 + x1 = 2 → minimum-norm solution (1, 1)
        let a = DMatrix::from_row_slice(1, 2, &[1.0, 1.0]);
        let p = pinv(&a).unwrap();
        assert_eq!(p.rank, 1);
        let x = &p.inverse * nalgebra::DVector::from_vec(vec![2.0]);
        assert!((x[0] - 1.0).abs() < 1e-12);
        assert!((x[1] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_pinv_rank_deficient() {
        let a = DMatrix::from_row_slice(3, 2, &[1.0, 2.0, 2.0, 4.0, 3.0, 6.0]);
        let p = pinv(&a).unwrap();
        assert_eq!(p.rank, 1);
        // Penrose condition A A⁺ A = A
        let back = &a * &p.inverse * &a;
        assert_mat_close(&back, &a, 1e-10);
    }

    #[test]
    fn test_pinv_empty() {
        let a = DMatrix::<f64>::zeros(0, 6);
        let p = pinv(&a).unwrap();
        assert_eq!(p.inverse.shape(), (6, 0));
        assert_eq!(p.rank, 0);
    }

    #[test]
    fn test_pinv_non_finite() {
        let a = DMatrix::from_row_slice(1, 1, &[f64::NAN]);
        assert!(matches!(pinv(&a), Err(Error::LinearAlgebra(_))));
    }

    #[test]
    fn test_smooth_pinv_zero_weights_is_pinv() {
        let b = DMatrix::from_row_slice(3, 2, &[1.0, 0.5, 0.2, 1.0, 0.7, 0.3]);
        let plain = pinv(&b).unwrap();
        let smooth = smooth_pinv(&b, &[0.0, 0.0]).unwrap();
        assert_mat_close(&plain.inverse, &smooth.inverse, 1e-14);
    }

    #[test]
    fn test_smooth_pinv_matches_ridge_normal_equations() {
        let b = DMatrix::from_row_slice(4, 2, &[1.0, 0.1, 1.0, 0.9, 1.0, -0.4, 1.0, 0.3]);
        let w = [0.0, 0.5];
        let p = smooth_pinv(&b, &w).unwrap();
        assert_eq!(p.inverse.shape(), (2, 4));

        // (BᵀB + W²)⁻¹ Bᵀ
        let mut normal = b.transpose() * &b;
        normal[(1, 1)] += 0.25;
        let expected = normal.try_inverse().unwrap() * b.transpose();
        assert_mat_close(&p.inverse, &expected, 1e-12);
    }

    #[test]
    fn test_smooth_pinv_lifts_rank() {
        // One sample, two unknowns; penalty on the second makes it full rank
        let b = DMatrix::from_row_slice(1, 2, &[1.0, 1.0]);
        let p = smooth_pinv(&b, &[0.0, 1.0]).unwrap();
        assert_eq!(p.rank, 2);
    }

    #[test]
    fn test_smooth_pinv_weight_mismatch() {
        let b = DMatrix::from_row_slice(1, 2, &[1.0, 1.0]);
        assert!(smooth_pinv(&b, &[1.0]).is_err());
    }
}
