//! Run configuration
//!
//! A single explicit record passed to the driver. Defaults follow the
//! usual multi-shell SH power setup (order 8, descoteaux07 basis,
//! Laplace-Beltrami smoothing 0.006, ±100 s/mm² shell tolerance); the
//! target b-value list has no default and must always be supplied.

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default maximum even SH degree
pub const DEFAULT_SH_ORDER: usize = 8;

/// Default half-width of the b-value window around each shell
pub const DEFAULT_BVAL_TOL: f64 = 100.0;

/// Default Laplace-Beltrami regularization weight
pub const DEFAULT_SMOOTH: f64 = 0.006;

/// Real spherical-harmonic basis conventions
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShBasis {
    /// Descoteaux et al. 2007 (dipy legacy convention)
    #[default]
    Descoteaux07,
    /// Tournier et al. 2007 (dipy legacy convention)
    Tournier07,
}

impl ShBasis {
    pub fn name(&self) -> &'static str {
        match self {
            ShBasis::Descoteaux07 => "descoteaux07",
            ShBasis::Tournier07 => "tournier07",
        }
    }
}

impl FromStr for ShBasis {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "descoteaux07" | "descoteaux" => Ok(ShBasis::Descoteaux07),
            "tournier07" | "tournier" => Ok(ShBasis::Tournier07),
            other => Err(Error::InvalidConfig(format!("unknown SH basis '{}'", other))),
        }
    }
}

/// What to do with shells that cannot support a stable fit
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DegeneratePolicy {
    /// Keep the minimum-norm least-squares result
    #[default]
    Lenient,
    /// Write NaN into degraded shells and invalid-baseline voxels
    Strict,
}

impl FromStr for DegeneratePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "lenient" => Ok(DegeneratePolicy::Lenient),
            "strict" => Ok(DegeneratePolicy::Strict),
            other => Err(Error::InvalidConfig(format!("unknown degenerate policy '{}'", other))),
        }
    }
}

fn default_sh_order() -> usize {
    DEFAULT_SH_ORDER
}

fn default_bval_tol() -> f64 {
    DEFAULT_BVAL_TOL
}

fn default_smooth() -> f64 {
    DEFAULT_SMOOTH
}

/// Configuration for one SH power run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShPowerConfig {
    /// Maximum even SH degree L. Default: 8
    #[serde(default = "default_sh_order")]
    pub sh_order: usize,
    /// Target b-values, 0 first, strictly increasing
    pub bvalues: Vec<f64>,
    /// Shell matching half-width. Default: 100
    #[serde(default = "default_bval_tol")]
    pub bval_tol: f64,
    /// Basis convention. Default: descoteaux07
    #[serde(default)]
    pub basis: ShBasis,
    /// Laplace-Beltrami regularization weight. Default: 0.006
    #[serde(default = "default_smooth")]
    pub smooth: f64,
    /// Worker threads, 0 = available parallelism. Default: 0
    #[serde(default)]
    pub n_workers: usize,
    /// Degraded-fit handling. Default: lenient
    #[serde(default)]
    pub degenerate_policy: DegeneratePolicy,
}

impl ShPowerConfig {
    /// Create a configuration with default values for everything except
    /// the target b-value list.
    pub fn new(bvalues: Vec<f64>) -> Self {
        Self {
            sh_order: DEFAULT_SH_ORDER,
            bvalues,
            bval_tol: DEFAULT_BVAL_TOL,
            basis: ShBasis::default(),
            smooth: DEFAULT_SMOOTH,
            n_workers: 0,
            degenerate_policy: DegeneratePolicy::default(),
        }
    }

    /// Load a configuration from a YAML file
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Self = serde_yml::from_str(text)
            .map_err(|e| Error::Parse(format!("invalid YAML configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Number of non-baseline shells (M - 1)
    pub fn n_shells(&self) -> usize {
        self.bvalues.len().saturating_sub(1)
    }

    /// Validate the configuration parameters.
    pub fn validate(&self) -> Result<()> {
        if self.sh_order < 2 || self.sh_order % 2 != 0 {
            return Err(Error::InvalidConfig(format!(
                "sh_order must be even and >= 2, got {}",
                self.sh_order
            )));
        }
        if self.bvalues.len() < 2 {
            return Err(Error::InvalidConfig(format!(
                "bvalues needs the baseline plus at least one shell, got {} entries",
                self.bvalues.len()
            )));
        }
        if self.bvalues[0] != 0.0 {
            return Err(Error::InvalidConfig(format!(
                "first target b-value must be 0, got {}",
                self.bvalues[0]
            )));
        }
        if self.bvalues.iter().any(|b| !b.is_finite()) {
            return Err(Error::InvalidConfig("bvalues must be finite".to_string()));
        }
        if self.bvalues.windows(2).any(|w| w[1] <= w[0]) {
            return Err(Error::InvalidConfig(format!(
                "bvalues must be strictly increasing, got {:?}",
                self.bvalues
            )));
        }
        if !self.bval_tol.is_finite() || self.bval_tol <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "bval_tol must be finite and > 0, got {}",
                self.bval_tol
            )));
        }
        if !self.smooth.is_finite() || self.smooth < 0.0 {
            return Err(Error::InvalidConfig(format!(
                "smooth must be finite and >= 0, got {}",
                self.smooth
            )));
        }
        Ok(())
    }
}
