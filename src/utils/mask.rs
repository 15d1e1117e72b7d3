//! Mask utilities
//!
//! Masks are flat `u8` buffers in Fortran (column-major) order to match
//! the NIfTI convention: index = x + y*nx + z*nx*ny.

/// Index into 3D array (Fortran/column-major order)
#[inline(always)]
pub fn idx3d(i: usize, j: usize, k: usize, nx: usize, ny: usize) -> usize {
    i + j * nx + k * nx * ny
}

/// Inverse of [`idx3d`]
#[inline(always)]
pub fn coord3d(index: usize, nx: usize, ny: usize) -> (usize, usize, usize) {
    (index % nx, (index / nx) % ny, index / (nx * ny))
}

/// Binary mask from image intensities: any nonzero value is included
///
/// NaN counts as nonzero, matching a plain `mask != 0` test.
pub fn binarize_mask(data: &[f64]) -> Vec<u8> {
    data.iter().map(|&v| if v != 0.0 { 1 } else { 0 }).collect()
}

/// Number of voxels inside the mask
pub fn count_masked(mask: &[u8]) -> usize {
    mask.iter().filter(|&&m| m != 0).count()
}

/// Coordinates of all masked voxels, x varying fastest, then y, then z
///
/// The order only depends on the mask, so reruns enumerate identically.
pub fn mask_coordinates(mask: &[u8], nx: usize, ny: usize, nz: usize) -> Vec<(usize, usize, usize)> {
    debug_assert_eq!(mask.len(), nx * ny * nz);
    let mut coords = Vec::with_capacity(count_masked(mask));
    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                if mask[idx3d(i, j, k, nx, ny)] != 0 {
                    coords.push((i, j, k));
                }
            }
        }
    }
    coords
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idx3d_roundtrip() {
        let (nx, ny, nz) = (4, 3, 5);
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let idx = idx3d(i, j, k, nx, ny);
                    assert_eq!(coord3d(idx, nx, ny), (i, j, k));
                }
            }
        }
        assert_eq!(idx3d(1, 2, 3, 4, 3), 1 + 8 + 36);
    }

    #[test]
    fn test_binarize_mask() {
        let mask = binarize_mask(&[0.0, 1.0, 0.5, -2.0, 0.0, f64::NAN]);
        assert_eq!(mask, vec![0, 1, 1, 1, 0, 1]);
    }

    #[test]
    fn test_mask_coordinates_order() {
        let (nx, ny, nz) = (3, 2, 2);
        let mut mask = vec![0u8; nx * ny * nz];
        mask[idx3d(2, 1, 1, nx, ny)] = 1;
        mask[idx3d(0, 0, 1, nx, ny)] = 1;
        mask[idx3d(1, 1, 0, nx, ny)] = 1;

        let coords = mask_coordinates(&mask, nx, ny, nz);
        assert_eq!(coords, vec![(1, 1, 0), (0, 0, 1), (2, 1, 1)]);
        assert_eq!(count_masked(&mask), 3);
    }

    #[test]
    fn test_mask_coordinates_empty() {
        let mask = vec![0u8; 8];
        assert!(mask_coordinates(&mask, 2, 2, 2).is_empty());
    }
}
