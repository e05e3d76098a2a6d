// ========================================================================================
//
//                        The diagnostic orchestrator: gp-lnlike
//
// ========================================================================================
//
// A thin command-line shell around the covariance engine. It loads a kernel
// configuration and one residual spectrum, reports the Gaussian Process
// log-likelihood, and can optionally write the in-sample posterior of the
// correlated residual component. Sampling, mean models and result files live
// elsewhere; this binary exists to inspect a single kernel/data configuration.

use bsfh_gp::data::read_spectrum_csv;
use bsfh_gp::{ConfiguredProcess, GpConfig};
use clap::Parser;
use ndarray::{Array1, Array2};
use std::path::{Path, PathBuf};
use std::process;
use std::time::Instant;

// ========================================================================================
//                         Command-line interface definition
// ========================================================================================

#[derive(Parser, Debug)]
#[clap(
    name = "gp-lnlike",
    version,
    about = "Evaluate a Gaussian Process log-likelihood for a residual spectrum."
)]
struct Args {
    /// CSV with wavelength, uncertainty, residual and optional flux columns.
    spectrum: PathBuf,

    /// TOML file selecting the kernel family and its raw parameter vector.
    #[clap(long)]
    config: PathBuf,

    /// Write the in-sample posterior mean and standard deviation to this CSV.
    #[clap(long)]
    predict: Option<PathBuf>,
}

// ========================================================================================
//                           The main orchestration logic
// ========================================================================================

fn main() {
    env_logger::init();
    let start_time = Instant::now();
    let args = Args::parse();

    // --- Phase 1: Configuration and Data ---
    let config = match GpConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            process::exit(1);
        }
    };
    let (data, residual) = match read_spectrum_csv(&args.spectrum) {
        Ok(parts) => parts,
        Err(e) => {
            eprintln!("Error reading spectrum: {}", e);
            process::exit(1);
        }
    };
    let wavelength = data.view().wavelength.to_owned();
    eprintln!("> Loaded {} pixels from {}", data.len(), args.spectrum.display());

    let mut gp = match config.build(Some(data)) {
        Ok(gp) => gp,
        Err(e) => {
            eprintln!("Error building the {} engine: {}", config.kernel.family, e);
            process::exit(1);
        }
    };

    // --- Phase 2: Likelihood ---
    let lnl = match gp.lnlikelihood(residual.view()) {
        Ok(lnl) => lnl,
        Err(e) if e.is_invalid_region() => {
            eprintln!("> Kernel parameters are outside the valid region: {}", e);
            f64::NEG_INFINITY
        }
        Err(e) => {
            eprintln!("Error evaluating the likelihood: {}", e);
            process::exit(1);
        }
    };
    println!("{}", lnl);

    // --- Phase 3: Optional Posterior ---
    if let Some(out_path) = &args.predict {
        if let Err(e) = write_prediction(&mut gp, &wavelength, &residual, out_path) {
            eprintln!("Error writing prediction: {}", e);
            process::exit(1);
        }
        eprintln!("> Wrote posterior to {}", out_path.display());
    }

    eprintln!("> Done in {:.2?}", start_time.elapsed());
}

// ========================================================================================
//                                  Helper functions
// ========================================================================================

fn write_prediction(
    gp: &mut ConfiguredProcess,
    wavelength: &Array1<f64>,
    residual: &Array1<f64>,
    path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let (mean, cov): (Array1<f64>, Array2<f64>) = gp.predict(residual.view(), None)?;
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["wavelength", "mean", "sd"])?;
    for ((w, m), v) in wavelength.iter().zip(mean.iter()).zip(cov.diag().iter()) {
        writer.write_record(&[w.to_string(), m.to_string(), v.max(0.0).sqrt().to_string()])?;
    }
    writer.flush()?;
    Ok(())
}
