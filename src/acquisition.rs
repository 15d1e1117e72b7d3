//! Diffusion acquisition table (b-values and gradient directions)
//!
//! Tables are read from the usual whitespace-delimited text files. b-vectors
//! may be stored FSL style (3 rows × N columns) or as N rows of 3 columns.

use std::path::Path;

use crate::error::{Error, Result};

/// Per-volume b-values and gradient directions, index aligned
#[derive(Clone, Debug, PartialEq)]
pub struct Acquisition {
    pub bvals: Vec<f64>,
    pub bvecs: Vec<[f64; 3]>,
}

impl Acquisition {
    /// Build an acquisition, checking that both tables describe the same
    /// number of volumes and contain only finite values.
    pub fn new(bvals: Vec<f64>, bvecs: Vec<[f64; 3]>) -> Result<Self> {
        if bvals.len() != bvecs.len() {
            return Err(Error::InvalidAcquisition(format!(
                "{} b-values but {} b-vectors",
                bvals.len(),
                bvecs.len()
            )));
        }
        if let Some(i) = bvals.iter().position(|b| !b.is_finite() || *b < 0.0) {
            return Err(Error::InvalidAcquisition(format!(
                "b-value {} at index {} is negative or not finite",
                bvals[i], i
            )));
        }
        if let Some(i) = bvecs.iter().position(|v| v.iter().any(|c| !c.is_finite())) {
            return Err(Error::InvalidAcquisition(format!(
                "b-vector at index {} is not finite: {:?}",
                i, bvecs[i]
            )));
        }
        Ok(Self { bvals, bvecs })
    }

    /// Read `.bval` / `.bvec` text files
    pub fn from_files(bvals_path: &Path, bvecs_path: &Path) -> Result<Self> {
        let bvals_text = std::fs::read_to_string(bvals_path)?;
        let bvecs_text = std::fs::read_to_string(bvecs_path)?;
        let bvals = parse_bvals(&bvals_text)?;
        let bvecs = parse_bvecs(&bvecs_text)?;
        Self::new(bvals, bvecs)
    }

    /// Number of acquired volumes (N)
    pub fn len(&self) -> usize {
        self.bvals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bvals.is_empty()
    }

    /// Check the table against the 4th dimension of a DWI volume
    pub fn check_volume_count(&self, n_volumes: usize) -> Result<()> {
        if self.len() != n_volumes {
            return Err(Error::InvalidAcquisition(format!(
                "acquisition lists {} volumes but the image has {}",
                self.len(),
                n_volumes
            )));
        }
        Ok(())
    }
}

fn parse_rows(text: &str) -> Result<Vec<Vec<f64>>> {
    let mut rows = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let row = line
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|tok| !tok.is_empty())
            .map(|tok| {
                tok.parse::<f64>().map_err(|e| {
                    Error::Parse(format!("line {}: cannot parse '{}': {}", line_no + 1, tok, e))
                })
            })
            .collect::<Result<Vec<f64>>>()?;
        rows.push(row);
    }
    Ok(rows)
}

/// Parse b-values: any number of whitespace-separated values, any line layout
pub fn parse_bvals(text: &str) -> Result<Vec<f64>> {
    Ok(parse_rows(text)?.into_iter().flatten().collect())
}

/// Parse b-vectors in 3×N (FSL) or N×3 layout
///
/// A 3×3 table is read as FSL layout.
pub fn parse_bvecs(text: &str) -> Result<Vec<[f64; 3]>> {
    let rows = parse_rows(text)?;
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    if rows.len() == 3 && rows.iter().all(|r| r.len() == rows[0].len()) {
        let n = rows[0].len();
        return Ok((0..n).map(|i| [rows[0][i], rows[1][i], rows[2][i]]).collect());
    }

    if rows.iter().all(|r| r.len() == 3) {
        return Ok(rows.iter().map(|r| [r[0], r[1], r[2]]).collect());
    }

    Err(Error::InvalidAcquisition(format!(
        "b-vectors must be 3 rows × N columns or N rows × 3 columns (got {} rows, first row has {} values)",
        rows.len(),
        rows[0].len()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bvals_single_line() {
        let bvals = parse_bvals("0 1000 1000 2000\n").unwrap();
        assert_eq!(bvals, vec![0.0, 1000.0, 1000.0, 2000.0]);
    }

    #[test]
    fn test_parse_bvals_multi_line() {
        let bvals = parse_bvals("0\n5\n\n995\n  2005  \n").unwrap();
        assert_eq!(bvals, vec![0.0, 5.0, 995.0, 2005.0]);
    }

    #[test]
    fn test_parse_bvals_invalid_token() {
        let result = parse_bvals("0 1000 abc");
        assert!(matches!(result, Err(Error::Parse(_))));
    }

    #[test]
    fn test_parse_bvecs_fsl_layout() {
        let text = "1 0 0 0.5\n0 1 0 0.5\n0 0 1 0.7071\n";
        let bvecs = parse_bvecs(text).unwrap();
        assert_eq!(bvecs.len(), 4);
        assert_eq!(bvecs[0], [1.0, 0.0, 0.0]);
        assert_eq!(bvecs[2], [0.0, 0.0, 1.0]);
        assert_eq!(bvecs[3], [0.5, 0.5, 0.7071]);
    }

    #[test]
    fn test_parse_bvecs_row_layout() {
        let text = "1 0 0\n0 1 0\n0 0 1\n0.6 0.8 0\n";
        let bvecs = parse_bvecs(text).unwrap();
        assert_eq!(bvecs.len(), 4);
        assert_eq!(bvecs[3], [0.6, 0.8, 0.0]);
    }

    #[test]
    fn test_parse_bvecs_ragged() {
        let result = parse_bvecs("1 0\n0 1 0\n");
        assert!(matches!(result, Err(Error::InvalidAcquisition(_))));
    }

    #[test]
    fn test_acquisition_length_mismatch() {
        let result = Acquisition::new(vec![0.0, 1000.0], vec![[1.0, 0.0, 0.0]]);
        assert!(matches!(result, Err(Error::InvalidAcquisition(_))));
    }

    #[test]
    fn test_acquisition_rejects_negative_bval() {
        let result = Acquisition::new(vec![-1.0], vec![[1.0, 0.0, 0.0]]);
        assert!(result.is_err());
    }

    #[test]
    fn test_check_volume_count() {
        let acq = Acquisition::new(vec![0.0, 1000.0], vec![[0.0; 3], [1.0, 0.0, 0.0]]).unwrap();
        assert!(acq.check_volume_count(2).is_ok());
        assert!(acq.check_volume_count(3).is_err());
    }

    #[test]
    fn test_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let bval_path = dir.path().join("AP.bvals");
        let bvec_path = dir.path().join("AP.bvecs");
        std::fs::write(&bval_path, "0 1000 2000\n").unwrap();
        std::fs::write(&bvec_path, "0 1 0\n0 0 1\n0 0 0\n").unwrap();

        let acq = Acquisition::from_files(&bval_path, &bvec_path).unwrap();
        assert_eq!(acq.len(), 3);
        assert_eq!(acq.bvecs[1], [1.0, 0.0, 0.0]);
        assert_eq!(acq.bvecs[2], [0.0, 1.0, 0.0]);
    }
}
