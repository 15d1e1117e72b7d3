//! shpower CLI
//!
//! Computes per-shell SH coefficients and band power for one or more DWI
//! volumes that share a mask and an acquisition scheme.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};

use clap::Parser;
use flexi_logger::{Cleanup, Criterion, Duplicate, FileSpec, FlexiLoggerError, Logger, LoggerHandle, Naming};
use log::{error, info};

use shpower_core::acquisition::Acquisition;
use shpower_core::config::ShPowerConfig;
use shpower_core::nifti_io::{read_dwi_file, read_nifti_file};
use shpower_core::output::{output_dir_for, save_maps};
use shpower_core::utils::binarize_mask;
use shpower_core::{run_with_control, DegeneratePolicy, Error, Result, RunControl, ShBasis};

#[derive(Parser, Debug)]
#[command(name = "shpower")]
#[command(about = "Per-shell spherical-harmonic decomposition and band power of diffusion MRI")]
#[command(version)]
struct Args {
    /// DWI volumes (4D NIfTI), all sharing the mask and acquisition
    #[arg(long, required = true, num_args = 1..)]
    data: Vec<PathBuf>,

    /// Binary mask (3D NIfTI); nonzero voxels are processed
    #[arg(long)]
    mask: PathBuf,

    /// b-value table
    #[arg(long)]
    bvals: PathBuf,

    /// b-vector table (3 x N or N x 3)
    #[arg(long)]
    bvecs: PathBuf,

    /// YAML run configuration; flags below override its fields
    #[arg(long)]
    config: Option<PathBuf>,

    /// Shell b-values starting with 0, e.g. 0,1000,2000
    #[arg(long, value_delimiter = ',')]
    bvalues: Option<Vec<f64>>,

    /// Maximum even SH degree
    #[arg(long)]
    sh_order: Option<usize>,

    /// Half-width of the b-value window of each shell
    #[arg(long)]
    tol: Option<f64>,

    /// SH basis (descoteaux07, tournier07)
    #[arg(long)]
    basis: Option<ShBasis>,

    /// Laplace-Beltrami smoothing weight
    #[arg(long)]
    smooth: Option<f64>,

    /// Worker threads (0 = all available)
    #[arg(long)]
    workers: Option<usize>,

    /// Write NaN for degraded shells and invalid baselines
    #[arg(long)]
    strict: bool,

    /// Output directory (default: <input dir>/data.SH)
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Also write rotated log files into this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

fn setup_logging(level: &str, log_dir: Option<&Path>) -> std::result::Result<LoggerHandle, FlexiLoggerError> {
    let logger = Logger::try_with_env_or_str(level)?;
    let logger = match log_dir {
        Some(dir) => logger
            .log_to_file(FileSpec::default().directory(dir))
            .duplicate_to_stderr(Duplicate::All)
            .rotate(
                Criterion::Size(1024 * 1024),
                Naming::Timestamps,
                Cleanup::KeepLogFiles(5),
            ),
        None => logger.log_to_stderr(),
    };
    logger.start()
}

fn build_config(args: &Args) -> Result<ShPowerConfig> {
    let mut config = match (&args.config, &args.bvalues) {
        (Some(path), _) => ShPowerConfig::from_yaml_file(path)?,
        (None, Some(bvalues)) => ShPowerConfig::new(bvalues.clone()),
        (None, None) => {
            return Err(Error::InvalidConfig(
                "shell b-values are required (--bvalues or --config)".to_string(),
            ))
        }
    };

    if let Some(bvalues) = &args.bvalues {
        config.bvalues = bvalues.clone();
    }
    if let Some(order) = args.sh_order {
        config.sh_order = order;
    }
    if let Some(tol) = args.tol {
        config.bval_tol = tol;
    }
    if let Some(basis) = args.basis {
        config.basis = basis;
    }
    if let Some(smooth) = args.smooth {
        config.smooth = smooth;
    }
    if let Some(workers) = args.workers {
        config.n_workers = workers;
    }
    if args.strict {
        config.degenerate_policy = DegeneratePolicy::Strict;
    }

    config.validate()?;
    Ok(config)
}

fn progress_logger() -> RunControl {
    let last_decile = AtomicUsize::new(0);
    RunControl::with_progress(move |done, total| {
        let decile = done * 10 / total.max(1);
        if last_decile.fetch_max(decile, Ordering::Relaxed) < decile {
            info!("{}% ({}/{} voxels)", decile * 10, done, total);
        }
    })
}

fn run(args: &Args) -> Result<()> {
    let config = build_config(args)?;
    info!(
        "b-values {:?}, order {}, basis {}, smooth {}, tol {}",
        config.bvalues,
        config.sh_order,
        config.basis.name(),
        config.smooth,
        config.bval_tol
    );

    let acq = Acquisition::from_files(&args.bvals, &args.bvecs)?;
    let mask_img = read_nifti_file(&args.mask)?;
    let mask = binarize_mask(&mask_img.data);

    for input in &args.data {
        info!("processing {}", input.display());
        let dwi = read_dwi_file(input)?;

        let control = progress_logger();
        let (maps, report) = run_with_control(&dwi, &mask, mask_img.dims, &acq, &config, &control)?;
        info!(
            "{}: {} voxels fitted, degraded shells {:?}",
            input.display(),
            report.processed_voxels,
            report.degraded_shells
        );

        let dir = output_dir_for(input, args.out_dir.as_deref());
        save_maps(&maps, dwi.voxel_size, &dwi.affine, &dir)?;
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    let _logger = match setup_logging(&args.log_level, args.log_dir.as_deref()) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Logger initialization failed with {}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
