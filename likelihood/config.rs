use crate::data::ObservationData;
use crate::errors::GpError;
use crate::gp::{DataUpdate, GaussianProcess};
use crate::kernel::{KernelFamily, Matern32, PredictionPoints, SparseOutlier, SquaredExponential};
use ndarray::{Array1, Array2, ArrayView1, ArrayViewMut1};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

// --- Public Data Structures ---
// These structs define the human-readable TOML format that selects a kernel
// family and its starting parameters for one inference run.

/// Kernel selection and its initial raw parameter vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelConfig {
    /// One of `squared_exponential`, `matern32`, `sparse_outlier`.
    pub family: String,
    /// Raw parameter vector. Log-space for the smooth kernels. Defaults to zeros.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<f64>>,
    /// Number of point-mass outliers (`sparse_outlier` only).
    #[serde(default)]
    pub outliers: usize,
    /// Whether the outlier vector ends in a jitter term (`sparse_outlier` only).
    #[serde(default)]
    pub jitter: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpConfig {
    #[serde(default)]
    pub check_finite: bool,
    pub kernel: KernelConfig,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error(transparent)]
    Gp(#[from] GpError),
}

/// The concrete kernel family named by a [`KernelConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelChoice {
    SquaredExponential,
    Matern32,
    SparseOutlier(SparseOutlier),
}

impl KernelChoice {
    pub fn from_config(config: &KernelConfig) -> Result<Self, GpError> {
        match config.family.as_str() {
            "squared_exponential" => Ok(KernelChoice::SquaredExponential),
            "matern32" => Ok(KernelChoice::Matern32),
            "sparse_outlier" => Ok(KernelChoice::SparseOutlier(SparseOutlier::new(
                config.outliers,
                config.jitter,
            ))),
            other => Err(GpError::UnimplementedKernel(other.to_string())),
        }
    }
}

impl GpConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        log::info!(
            "Loaded GP configuration from {} (kernel family: {})",
            path.display(),
            config.kernel.family
        );
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Builds an engine for the configured kernel, optionally seeded with data.
    pub fn build(&self, data: Option<ObservationData>) -> Result<ConfiguredProcess, GpError> {
        Ok(match KernelChoice::from_config(&self.kernel)? {
            KernelChoice::SquaredExponential => {
                ConfiguredProcess::SquaredExponential(self.engine(SquaredExponential, data)?)
            }
            KernelChoice::Matern32 => ConfiguredProcess::Matern32(self.engine(Matern32, data)?),
            KernelChoice::SparseOutlier(family) => {
                ConfiguredProcess::SparseOutlier(self.engine(family, data)?)
            }
        })
    }

    fn engine<K: KernelFamily>(
        &self,
        family: K,
        data: Option<ObservationData>,
    ) -> Result<GaussianProcess<K>, GpError> {
        let mut gp = GaussianProcess::new(family).with_check_finite(self.check_finite);
        if let Some(values) = &self.kernel.values {
            gp.set_kernel(Array1::from(values.clone()))?;
        }
        if let Some(data) = data {
            gp.set_data(data);
        }
        Ok(gp)
    }
}

/// An engine whose kernel family was chosen at run time.
pub enum ConfiguredProcess {
    SquaredExponential(GaussianProcess<SquaredExponential>),
    Matern32(GaussianProcess<Matern32>),
    SparseOutlier(GaussianProcess<SparseOutlier>),
}

macro_rules! dispatch {
    ($self:expr, $gp:ident => $body:expr) => {
        match $self {
            ConfiguredProcess::SquaredExponential($gp) => $body,
            ConfiguredProcess::Matern32($gp) => $body,
            ConfiguredProcess::SparseOutlier($gp) => $body,
        }
    };
}

impl ConfiguredProcess {
    pub fn name(&self) -> &'static str {
        dispatch!(self, gp => gp.family().name())
    }

    pub fn kernel(&self) -> ArrayView1<'_, f64> {
        dispatch!(self, gp => gp.kernel())
    }

    pub fn kernel_mut(&mut self) -> ArrayViewMut1<'_, f64> {
        dispatch!(self, gp => gp.kernel_mut())
    }

    pub fn set_kernel(&mut self, kernel: Array1<f64>) -> Result<(), GpError> {
        dispatch!(self, gp => gp.set_kernel(kernel))
    }

    pub fn set_data(&mut self, data: ObservationData) {
        dispatch!(self, gp => gp.set_data(data))
    }

    pub fn reset(&mut self) {
        dispatch!(self, gp => gp.reset())
    }

    pub fn compute(&mut self) -> Result<(), GpError> {
        dispatch!(self, gp => gp.compute())
    }

    pub fn compute_with(&mut self, update: DataUpdate, force: bool) -> Result<(), GpError> {
        dispatch!(self, gp => gp.compute_with(update, force))
    }

    pub fn lnlikelihood(&mut self, residual: ArrayView1<f64>) -> Result<f64, GpError> {
        dispatch!(self, gp => gp.lnlikelihood(residual))
    }

    pub fn predict(
        &mut self,
        residual: ArrayView1<f64>,
        at: Option<PredictionPoints<'_>>,
    ) -> Result<(Array1<f64>, Array2<f64>), GpError> {
        dispatch!(self, gp => gp.predict(residual, at))
    }

    pub fn log_determinant(&self) -> Option<f64> {
        dispatch!(self, gp => gp.log_determinant())
    }

    pub fn rebuild_count(&self) -> usize {
        dispatch!(self, gp => gp.rebuild_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::FluxScale;
    use ndarray::array;

    const SMOOTH: &str = r#"
check_finite = true

[kernel]
family = "matern32"
values = [-3.0, -2.0, 0.5]
"#;

    #[test]
    fn parses_smooth_kernel_config() {
        let config = GpConfig::from_toml_str(SMOOTH).unwrap();
        assert!(config.check_finite);
        assert_eq!(config.kernel.family, "matern32");
        assert_eq!(config.kernel.values, Some(vec![-3.0, -2.0, 0.5]));
        assert_eq!(
            KernelChoice::from_config(&config.kernel).unwrap(),
            KernelChoice::Matern32
        );
        let gp = config.build(None).unwrap();
        assert_eq!(gp.name(), "matern32");
        assert_eq!(gp.kernel(), array![-3.0, -2.0, 0.5].view());
    }

    #[test]
    fn outlier_shape_comes_from_config() {
        let config = GpConfig::from_toml_str(
            r#"
[kernel]
family = "sparse_outlier"
outliers = 2
jitter = true
"#,
        )
        .unwrap();
        assert!(!config.check_finite);
        assert_eq!(
            KernelChoice::from_config(&config.kernel).unwrap(),
            KernelChoice::SparseOutlier(SparseOutlier::new(2, true))
        );
        let gp = config.build(None).unwrap();
        assert_eq!(gp.kernel().len(), 5);
    }

    #[test]
    fn unknown_family_is_unimplemented() {
        let config = GpConfig::from_toml_str("[kernel]\nfamily = \"periodic\"\n").unwrap();
        assert!(matches!(
            config.build(None),
            Err(GpError::UnimplementedKernel(name)) if name == "periodic"
        ));
    }

    #[test]
    fn wrong_value_count_is_rejected() {
        let config = GpConfig::from_toml_str(
            "[kernel]\nfamily = \"squared_exponential\"\nvalues = [0.0, 1.0]\n",
        )
        .unwrap();
        assert!(matches!(
            config.build(None),
            Err(GpError::KernelLength { expected: 3, found: 2, .. })
        ));
    }

    #[test]
    fn missing_kernel_table_is_a_parse_error() {
        assert!(matches!(
            GpConfig::from_toml_str("check_finite = true\n"),
            Err(ConfigError::TomlParseError(_))
        ));
    }

    #[test]
    fn saved_config_loads_back() {
        let config = GpConfig::from_toml_str(SMOOTH).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gp.toml");
        config.save(&path).unwrap();
        assert_eq!(GpConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn configured_process_evaluates_likelihood() {
        let config = GpConfig::from_toml_str(SMOOTH).unwrap();
        let data = ObservationData::new(
            array![1.0, 2.0, 3.0],
            array![0.2, 0.2, 0.2],
            FluxScale::Unit,
        )
        .unwrap();
        let mut gp = config.build(Some(data)).unwrap();
        let residual = array![0.1, -0.1, 0.05];
        let first = gp.lnlikelihood(residual.view()).unwrap();
        assert!(first.is_finite());
        assert_eq!(gp.rebuild_count(), 1);

        gp.kernel_mut()[1] = -1.0;
        let second = gp.lnlikelihood(residual.view()).unwrap();
        assert_ne!(first, second);
        assert_eq!(gp.rebuild_count(), 2);
        assert!(gp.log_determinant().is_some());
    }

    #[test]
    fn configured_process_swaps_kernel_and_data() {
        let config = GpConfig::from_toml_str(SMOOTH).unwrap();
        let mut gp = config.build(None).unwrap();
        assert!(matches!(
            gp.compute(),
            Err(GpError::MissingFactorization(_))
        ));

        gp.set_data(
            ObservationData::new(array![1.0, 2.0], array![0.1, 0.1], FluxScale::Unit).unwrap(),
        );
        assert!(matches!(
            gp.set_kernel(array![0.0]),
            Err(GpError::KernelLength { expected: 3, found: 1, .. })
        ));
        gp.set_kernel(array![-4.0, -1.0, 0.0]).unwrap();
        gp.compute().unwrap();
        assert_eq!(gp.rebuild_count(), 1);

        let update = DataUpdate {
            uncertainty: Some(array![0.2, 0.2]),
            ..DataUpdate::default()
        };
        gp.compute_with(update, false).unwrap();
        assert_eq!(gp.rebuild_count(), 2);
        gp.compute_with(DataUpdate::default(), true).unwrap();
        assert_eq!(gp.rebuild_count(), 3);

        gp.reset();
        assert_eq!(gp.kernel(), array![0.0, 0.0, 0.0].view());
        assert!(gp.log_determinant().is_none());
        assert!(matches!(
            gp.lnlikelihood(array![0.0, 0.0].view()),
            Err(GpError::MissingFactorization(_))
        ));
    }
}
