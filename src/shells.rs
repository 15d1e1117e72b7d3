//! Shell partitioning
//!
//! Splits the acquisition into the baseline (b ≈ 0) group and one group per
//! target b-value. Each diffusion shell is trimmed so it holds no more
//! samples than it has distinct directions, which drops repeated
//! acquisitions appended at the end of a shell (e.g. the extra reverse
//! phase-encode volumes of the UK Biobank scheme).

use log::debug;

use crate::acquisition::Acquisition;
use crate::sphere::{HemiSphere, HEMISPHERE_TOL_DEG};

/// Decimal places used when counting distinct directions
const DIRECTION_ROUND_DECIMALS: i32 = 4;

/// One non-baseline shell after trimming
#[derive(Clone, Debug)]
pub struct Shell {
    /// Target b-value
    pub bvalue: f64,
    /// Number of samples inside the b-value window before trimming
    pub n_candidates: usize,
    /// Kept sample indices, in acquisition order
    pub indices: Vec<usize>,
    /// Hemisphere projection of the kept directions; the fit basis is
    /// evaluated at these vertices
    pub hemisphere: HemiSphere,
}

impl Shell {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Baseline indices plus one [`Shell`] per non-zero target b-value
#[derive(Clone, Debug)]
pub struct ShellPartition {
    pub baseline: Vec<usize>,
    pub shells: Vec<Shell>,
}

impl ShellPartition {
    /// Index sets in target order: baseline first, then each shell
    pub fn index_sets(&self) -> Vec<Vec<usize>> {
        std::iter::once(self.baseline.clone())
            .chain(self.shells.iter().map(|s| s.indices.clone()))
            .collect()
    }
}

/// Number of distinct values of the first direction coordinate, rounded
/// to four decimals, among `indices`
pub fn count_distinct_directions(bvecs: &[[f64; 3]], indices: &[usize]) -> usize {
    let scale = 10f64.powi(DIRECTION_ROUND_DECIMALS);
    let mut keys: Vec<i64> = indices
        .iter()
        .map(|&i| (bvecs[i][0] * scale).round_ties_even() as i64)
        .collect();
    keys.sort_unstable();
    keys.dedup();
    keys.len()
}

/// Samples inside the open window (bvalue - tol, bvalue + tol)
pub fn shell_candidates(bvals: &[f64], bvalue: f64, tol: f64) -> Vec<usize> {
    bvals
        .iter()
        .enumerate()
        .filter(|(_, &b)| b > bvalue - tol && b < bvalue + tol)
        .map(|(i, _)| i)
        .collect()
}

/// Partition the acquisition into baseline and shells
///
/// `bvalues` must start with 0 and hold at least two entries (see
/// [`crate::config::ShPowerConfig::validate`]). Undersized or empty shells
/// are kept as they are; nothing here fails.
pub fn partition(acq: &Acquisition, bvalues: &[f64], tol: f64) -> ShellPartition {
    let baseline_limit = bvalues.get(1).copied().unwrap_or(f64::INFINITY) - tol;
    let baseline: Vec<usize> = acq
        .bvals
        .iter()
        .enumerate()
        .filter(|(_, &b)| b < baseline_limit)
        .map(|(i, _)| i)
        .collect();

    let shells = bvalues
        .iter()
        .skip(1)
        .map(|&bvalue| {
            let candidates = shell_candidates(&acq.bvals, bvalue, tol);
            let n_distinct = count_distinct_directions(&acq.bvecs, &candidates);
            let mut indices = candidates.clone();
            indices.truncate(n_distinct);

            let directions: Vec<[f64; 3]> = indices.iter().map(|&i| acq.bvecs[i]).collect();
            let hemisphere = HemiSphere::from_directions(&directions, HEMISPHERE_TOL_DEG);
            indices.truncate(hemisphere.len());

            debug!(
                "shell b={}: {} candidates, {} distinct, {} kept",
                bvalue,
                candidates.len(),
                n_distinct,
                indices.len()
            );

            Shell {
                bvalue,
                n_candidates: candidates.len(),
                indices,
                hemisphere,
            }
        })
        .collect();

    ShellPartition { baseline, shells }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Directions with pairwise distinct x components
    fn distinct_dirs(n: usize) -> Vec<[f64; 3]> {
        (0..n)
            .map(|i| {
                let t = 0.3 + 0.45 * i as f64;
                let x = 0.1 + 0.8 * (i as f64) / (n as f64);
                let rest = (1.0 - x * x).sqrt();
                [x, rest * t.cos(), rest * t.sin().abs()]
            })
            .collect()
    }

    #[test]
    fn test_partition_completeness() {
        let bvals = vec![0.0, 5.0, 995.0, 1000.0, 1010.0, 1990.0, 2000.0, 0.0, 2050.0];
        let acq = Acquisition::new(bvals.clone(), distinct_dirs(bvals.len())).unwrap();
        let part = partition(&acq, &[0.0, 1000.0, 2000.0], 100.0);

        let mut seen = vec![0usize; bvals.len()];
        for set in part.index_sets() {
            for i in set {
                seen[i] += 1;
            }
        }
        assert!(seen.iter().all(|&c| c == 1), "membership counts: {:?}", seen);
        assert_eq!(part.baseline, vec![0, 1, 7]);
        assert_eq!(part.shells[0].indices, vec![2, 3, 4]);
        assert_eq!(part.shells[1].indices, vec![5, 6, 8]);
    }

    #[test]
    fn test_window_is_open() {
        let bvals = vec![900.0, 1100.0, 1000.0];
        assert_eq!(shell_candidates(&bvals, 1000.0, 100.0), vec![2]);
    }

    #[test]
    fn test_dedup_truncates_trailing_repeats() {
        let mut dirs = distinct_dirs(6);
        dirs.push(dirs[0]);
        dirs.push(dirs[1]);
        let mut bvals = vec![1000.0; 8];
        bvals.insert(0, 0.0);
        dirs.insert(0, [0.0, 0.0, 0.0]);

        let acq = Acquisition::new(bvals, dirs).unwrap();
        let part = partition(&acq, &[0.0, 1000.0], 100.0);
        let shell = &part.shells[0];
        assert_eq!(shell.n_candidates, 8);
        assert_eq!(shell.indices, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(shell.hemisphere.len(), 6);
    }

    #[test]
    fn test_distinct_count_uses_rounded_x() {
        let bvecs = vec![
            [0.12341, 0.5, 0.5],
            [0.12344, 0.1, 0.9],
            [0.5, 0.5, 0.5],
            [0.0, 1.0, 0.0],
            [-0.0, 0.0, 1.0],
        ];
        assert_eq!(count_distinct_directions(&bvecs, &[0, 1, 2, 3, 4]), 3);
        assert_eq!(count_distinct_directions(&bvecs, &[]), 0);
    }

    #[test]
    fn test_hemisphere_truncation() {
        // Distinct x values but two samples are antipodal
        let dirs = vec![
            [0.6, 0.0, 0.8],
            [-0.6, 0.0, -0.8],
            [0.0, 0.6, 0.8],
            [0.8, 0.6, 0.0],
        ];
        let acq = Acquisition::new(vec![1000.0; 4], dirs).unwrap();
        let part = partition(&acq, &[0.0, 1000.0], 100.0);
        let shell = &part.shells[0];
        assert_eq!(shell.hemisphere.len(), 3);
        assert_eq!(shell.indices, vec![0, 1, 2]);
        assert!(part.baseline.is_empty());
    }

    #[test]
    fn test_empty_shell_is_not_an_error() {
        let acq = Acquisition::new(vec![0.0, 1000.0], vec![[0.0; 3], [1.0, 0.0, 0.0]]).unwrap();
        let part = partition(&acq, &[0.0, 1000.0, 3000.0], 100.0);
        assert_eq!(part.shells.len(), 2);
        assert!(part.shells[1].is_empty());
        assert!(part.shells[1].hemisphere.is_empty());
    }
}
