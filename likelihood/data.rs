//! Observational data consumed by the covariance engine.
//!
//! The engine only ever sees three aligned vectors (wavelength, uncertainty and
//! an optional multiplicative flux scale). Masking, unit handling and the mean
//! model all live with the caller; what arrives here is already the subset of
//! pixels that enters the likelihood.

use crate::errors::{GpError, ensure_len};
use ndarray::{Array1, ArrayView1};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Elementwise scaling applied to the kernel cross terms.
///
/// `Unit` is the plain additive-noise model. A vector turns the kernel into a
/// fractional-noise model, `Σᵢⱼ = fᵢ Kᵢⱼ fⱼ`.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum FluxScale {
    #[default]
    Unit,
    Vector(Array1<f64>),
}

impl FluxScale {
    /// True if applying this scale would leave the kernel unchanged.
    pub fn is_trivial(&self) -> bool {
        match self {
            FluxScale::Unit => true,
            FluxScale::Vector(flux) => flux.iter().all(|&f| f == 1.0),
        }
    }

    /// The scale as an explicit length-`n` vector.
    pub fn to_vector(&self, n: usize) -> Array1<f64> {
        match self {
            FluxScale::Unit => Array1::ones(n),
            FluxScale::Vector(flux) => flux.clone(),
        }
    }

    /// Length check; `Unit` broadcasts to any length.
    pub fn check_len(&self, quantity: &'static str, n: usize) -> Result<(), GpError> {
        match self {
            FluxScale::Unit => Ok(()),
            FluxScale::Vector(flux) => ensure_len(quantity, n, flux.len()),
        }
    }
}

impl From<Array1<f64>> for FluxScale {
    fn from(flux: Array1<f64>) -> Self {
        FluxScale::Vector(flux)
    }
}

/// Owned, length-checked observational data for one object.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationData {
    wavelength: Array1<f64>,
    uncertainty: Array1<f64>,
    flux_scale: FluxScale,
}

impl ObservationData {
    pub fn new(
        wavelength: Array1<f64>,
        uncertainty: Array1<f64>,
        flux_scale: FluxScale,
    ) -> Result<Self, GpError> {
        let n = wavelength.len();
        ensure_len("uncertainty", n, uncertainty.len())?;
        flux_scale.check_len("flux scale", n)?;
        Ok(Self {
            wavelength,
            uncertainty,
            flux_scale,
        })
    }

    pub fn len(&self) -> usize {
        self.wavelength.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wavelength.is_empty()
    }

    pub fn view(&self) -> ObservationView<'_> {
        ObservationView {
            wavelength: self.wavelength.view(),
            uncertainty: self.uncertainty.view(),
            flux_scale: &self.flux_scale,
        }
    }

    pub fn into_parts(self) -> (Array1<f64>, Array1<f64>, FluxScale) {
        (self.wavelength, self.uncertainty, self.flux_scale)
    }
}

/// Borrowed, already validated view over the data a covariance is built from.
#[derive(Debug, Clone, Copy)]
pub struct ObservationView<'a> {
    pub wavelength: ArrayView1<'a, f64>,
    pub uncertainty: ArrayView1<'a, f64>,
    pub flux_scale: &'a FluxScale,
}

impl<'a> ObservationView<'a> {
    /// Builds a view, checking that all three quantities share one length.
    pub fn new(
        wavelength: ArrayView1<'a, f64>,
        uncertainty: ArrayView1<'a, f64>,
        flux_scale: &'a FluxScale,
    ) -> Result<Self, GpError> {
        let n = wavelength.len();
        ensure_len("uncertainty", n, uncertainty.len())?;
        flux_scale.check_len("flux scale", n)?;
        Ok(Self {
            wavelength,
            uncertainty,
            flux_scale,
        })
    }

    pub fn len(&self) -> usize {
        self.wavelength.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wavelength.is_empty()
    }
}

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Failed to read spectrum CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("Spectrum file '{0}' contains no rows.")]
    Empty(String),

    #[error("Row {row} has no flux value, but other rows do. The flux column must be complete or absent.")]
    PartialFlux { row: usize },

    #[error(transparent)]
    Gp(#[from] GpError),
}

#[derive(Debug, Deserialize)]
struct SpectrumRecord {
    wavelength: f64,
    uncertainty: f64,
    residual: f64,
    #[serde(default)]
    flux: Option<f64>,
}

/// Reads a headed CSV with `wavelength`, `uncertainty`, `residual` and an
/// optional `flux` column. Returns the observational data and the residual.
pub fn read_spectrum_csv(path: &Path) -> Result<(ObservationData, Array1<f64>), DataError> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_path(path)?;

    let mut wavelength = Vec::new();
    let mut uncertainty = Vec::new();
    let mut residual = Vec::new();
    let mut flux = Vec::new();

    for (row, record) in reader.deserialize::<SpectrumRecord>().enumerate() {
        let record = record?;
        wavelength.push(record.wavelength);
        uncertainty.push(record.uncertainty);
        residual.push(record.residual);
        flux.push(record.flux);
        if flux[0].is_some() != record.flux.is_some() {
            return Err(DataError::PartialFlux { row });
        }
    }

    if wavelength.is_empty() {
        return Err(DataError::Empty(path.display().to_string()));
    }

    let flux_scale = if flux[0].is_some() {
        FluxScale::Vector(flux.into_iter().flatten().collect())
    } else {
        FluxScale::Unit
    };
    log::info!(
        "Read {} pixels from {} (flux scaling: {})",
        wavelength.len(),
        path.display(),
        if flux_scale.is_trivial() { "none" } else { "fractional" }
    );

    let data = ObservationData::new(
        Array1::from(wavelength),
        Array1::from(uncertainty),
        flux_scale,
    )?;
    Ok((data, Array1::from(residual)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::io::Write;

    #[test]
    fn mismatched_lengths_are_rejected() {
        let err = ObservationData::new(array![1.0, 2.0, 3.0], array![0.1, 0.1], FluxScale::Unit)
            .unwrap_err();
        assert!(matches!(
            err,
            GpError::ShapeMismatch {
                quantity: "uncertainty",
                expected: 3,
                found: 2
            }
        ));

        let err = ObservationData::new(
            array![1.0, 2.0],
            array![0.1, 0.1],
            FluxScale::Vector(array![1.0, 2.0, 3.0]),
        )
        .unwrap_err();
        assert!(matches!(err, GpError::ShapeMismatch { quantity: "flux scale", .. }));
    }

    #[test]
    fn flux_of_ones_is_trivial() {
        assert!(FluxScale::Unit.is_trivial());
        assert!(FluxScale::Vector(array![1.0, 1.0]).is_trivial());
        assert!(!FluxScale::Vector(array![1.0, 0.5]).is_trivial());
        assert_ne!(FluxScale::Unit, FluxScale::Vector(array![1.0, 1.0]));
        assert_eq!(FluxScale::Unit.to_vector(3), array![1.0, 1.0, 1.0]);
    }

    #[test]
    fn reads_spectrum_without_flux() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "wavelength,uncertainty,residual").unwrap();
        writeln!(file, "4000.0, 0.1, 0.05").unwrap();
        writeln!(file, "4001.0, 0.2, -0.02").unwrap();
        file.flush().unwrap();

        let (data, residual) = read_spectrum_csv(file.path()).unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(residual, array![0.05, -0.02]);
        assert_eq!(data.view().flux_scale, &FluxScale::Unit);
        assert_eq!(data.view().uncertainty, array![0.1, 0.2].view());
    }

    #[test]
    fn reads_spectrum_with_flux() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "wavelength,uncertainty,residual,flux").unwrap();
        writeln!(file, "1.0,0.1,0.0,2.0").unwrap();
        writeln!(file, "2.0,0.1,0.0,3.0").unwrap();
        file.flush().unwrap();

        let (data, _) = read_spectrum_csv(file.path()).unwrap();
        assert_eq!(
            data.view().flux_scale,
            &FluxScale::Vector(array![2.0, 3.0])
        );
    }

    #[test]
    fn partial_flux_column_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "wavelength,uncertainty,residual,flux").unwrap();
        writeln!(file, "1.0,0.1,0.0,2.0").unwrap();
        writeln!(file, "2.0,0.1,0.0,").unwrap();
        file.flush().unwrap();

        assert!(matches!(
            read_spectrum_csv(file.path()),
            Err(DataError::PartialFlux { row: 1 })
        ));
    }

    #[test]
    fn empty_file_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "wavelength,uncertainty,residual").unwrap();
        file.flush().unwrap();
        assert!(matches!(
            read_spectrum_csv(file.path()),
            Err(DataError::Empty(_))
        ));
    }
}
