//! Band layout and band power
//!
//! Band j holds the 1 + 4j coefficients of degree l = 2j. Its power is the
//! sum of squared coefficients, i.e. the angular energy at that frequency.

use std::ops::Range;

/// Coefficient ranges of each even-degree band
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BandLayout {
    ranges: Vec<Range<usize>>,
}

impl BandLayout {
    /// Layout for maximum even degree `order`
    pub fn new(order: usize) -> Self {
        let mut ranges = Vec::with_capacity(order / 2 + 1);
        let mut start = 0;
        for l in (0..=order).step_by(2) {
            let size = 1 + 4 * (l / 2);
            ranges.push(start..start + size);
            start += size;
        }
        Self { ranges }
    }

    /// Total number of coefficients
    pub fn n_coeff(&self) -> usize {
        self.ranges.last().map_or(0, |r| r.end)
    }

    pub fn n_bands(&self) -> usize {
        self.ranges.len()
    }

    /// Coefficient positions of band `j` (degree 2j)
    pub fn band(&self, j: usize) -> Range<usize> {
        self.ranges[j].clone()
    }

    pub fn bands(&self) -> &[Range<usize>] {
        &self.ranges
    }

    /// Write the power of each band of `coeffs` into `power`
    pub fn band_power_into(&self, coeffs: &[f64], power: &mut [f64]) {
        debug_assert_eq!(coeffs.len(), self.n_coeff());
        debug_assert_eq!(power.len(), self.n_bands());
        for (p, range) in power.iter_mut().zip(&self.ranges) {
            *p = coeffs[range.clone()].iter().map(|c| c * c).sum();
        }
    }

    /// Power of each band of `coeffs`
    pub fn band_power(&self, coeffs: &[f64]) -> Vec<f64> {
        let mut power = vec![0.0; self.n_bands()];
        self.band_power_into(coeffs, &mut power);
        power
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_sizes_order_8() {
        let layout = BandLayout::new(8);
        let sizes: Vec<usize> = layout.bands().iter().map(|r| r.len()).collect();
        assert_eq!(sizes, vec![1, 5, 9, 13, 17]);
        assert_eq!(layout.n_coeff(), 45);
        assert_eq!(layout.n_bands(), 5);
        assert_eq!(layout.band(2), 6..15);
    }

    #[test]
    fn test_band_size_law() {
        for order in (2..=16).step_by(2) {
            let layout = BandLayout::new(order);
            let total: usize = (0..=order).step_by(2).map(|l| 1 + 4 * (l / 2)).sum();
            assert_eq!(layout.n_coeff(), total);
            assert_eq!(layout.n_coeff(), (order + 1) * (order + 2) / 2);
            assert_eq!(layout.n_bands(), order / 2 + 1);
        }
    }

    #[test]
    fn test_power_conserves_energy() {
        let layout = BandLayout::new(8);
        let coeffs: Vec<f64> = (0..45).map(|i| ((i * 7 % 13) as f64 - 6.0) * 0.37).collect();
        let power = layout.band_power(&coeffs);
        let band_total: f64 = power.iter().sum();
        let energy: f64 = coeffs.iter().map(|c| c * c).sum();
        assert!((band_total - energy).abs() < 1e-10 * energy.max(1.0));
    }

    #[test]
    fn test_power_per_band() {
        let layout = BandLayout::new(2);
        let coeffs = [2.0, 1.0, 0.0, -1.0, 0.0, 3.0];
        assert_eq!(layout.band_power(&coeffs), vec![4.0, 11.0]);
    }
}
