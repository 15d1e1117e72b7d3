//! Hemisphere geometry for gradient directions
//!
//! Diffusion signal is antipodally symmetric, so a direction and its
//! opposite sample the same point. Projecting a shell onto the upper
//! hemisphere merges such pairs and exact repeats before fitting.

/// Angular tolerance (degrees) below which two directions are merged
pub const HEMISPHERE_TOL_DEG: f64 = 1e-5;

/// Unique directions on the z >= 0 hemisphere
#[derive(Clone, Debug, PartialEq)]
pub struct HemiSphere {
    /// Unit vectors in first-occurrence order
    pub vertices: Vec<[f64; 3]>,
}

impl HemiSphere {
    /// Project directions onto the hemisphere
    ///
    /// Zero-length and non-finite vectors are skipped. A vector whose
    /// |cos angle| to an already kept vertex exceeds cos(`tol_deg`) is
    /// dropped. Kept vertices with negative z are flipped.
    pub fn from_directions(directions: &[[f64; 3]], tol_deg: f64) -> Self {
        let cos_similar = (tol_deg.to_radians()).cos();
        let mut vertices: Vec<[f64; 3]> = Vec::with_capacity(directions.len());

        for d in directions {
            let Some(u) = normalize(d) else {
                continue;
            };
            let similar = vertices.iter().any(|v| dot(v, &u).abs() > cos_similar);
            if !similar {
                vertices.push(u);
            }
        }

        for v in vertices.iter_mut() {
            if v[2] < 0.0 {
                *v = [-v[0], -v[1], -v[2]];
            }
        }

        Self { vertices }
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// (polar, azimuth) angles of each vertex
    pub fn angles(&self) -> Vec<(f64, f64)> {
        self.vertices.iter().map(cart_to_sphere).collect()
    }
}

#[inline]
fn dot(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

/// Unit vector, or `None` for zero-length / non-finite input
#[inline]
pub fn normalize(v: &[f64; 3]) -> Option<[f64; 3]> {
    let r = dot(v, v).sqrt();
    if !r.is_finite() || r <= f64::EPSILON {
        return None;
    }
    Some([v[0] / r, v[1] / r, v[2] / r])
}

/// Cartesian direction to (polar θ from +z, azimuth φ from +x)
#[inline]
pub fn cart_to_sphere(v: &[f64; 3]) -> (f64, f64) {
    let r = dot(v, v).sqrt();
    let theta = if r > 0.0 { (v[2] / r).clamp(-1.0, 1.0).acos() } else { 0.0 };
    let phi = v[1].atan2(v[0]);
    (theta, phi)
}
