#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

pub mod cache;
pub mod config;
pub mod data;
pub mod errors;
pub mod faer_ndarray;
pub mod gp;
pub mod kernel;

pub use config::{ConfigError, ConfiguredProcess, GpConfig, KernelChoice, KernelConfig};
pub use data::{FluxScale, ObservationData};
pub use errors::GpError;
pub use gp::{DataUpdate, FactorizedCovariance, GaussianProcess};
pub use kernel::{KernelFamily, Matern32, PredictionPoints, SparseOutlier, SquaredExponential};
