//! The Gaussian Process likelihood engine.
//!
//! # Lifecycle
//!
//! One engine lives for one inference run. The caller overwrites the raw
//! kernel vector every sampler step (through [`GaussianProcess::kernel_mut`]),
//! optionally swaps the observational data, and asks for a log-likelihood.
//! Every consumer of the factorization first runs [`GaussianProcess::compute`],
//! which decodes the kernel vector, compares it and the data against what the
//! current factorization was built from, and rebuilds only when something
//! differs. The factorization is discarded before any rebuild, so a failed
//! rebuild can never leave an older factor behind to be reused.
//!
//! # Concurrency
//!
//! The engine is plain mutable state with no interior synchronization. Use one
//! engine per worker thread when walkers are evaluated in parallel.

use crate::cache::CovarianceCache;
use crate::data::{FluxScale, ObservationData};
use crate::errors::{GpError, ensure_len};
use crate::faer_ndarray::{FaerCholesky, FaerCholeskyFactor};
use crate::kernel::{KernelFamily, PredictionPoints};
use faer::Side;
use ndarray::{Array1, Array2, ArrayView1, ArrayViewMut1};
use std::f64::consts::PI;

/// Cholesky factor of the full covariance together with its log-determinant.
pub struct FactorizedCovariance {
    factor: FaerCholeskyFactor,
    log_det: f64,
}

impl FactorizedCovariance {
    pub fn factor(&self) -> &FaerCholeskyFactor {
        &self.factor
    }

    pub fn log_determinant(&self) -> f64 {
        self.log_det
    }

    pub fn dim(&self) -> usize {
        self.factor.dim()
    }
}

/// Data to swap in before a `compute`. `None` fields keep the cached values.
#[derive(Debug, Clone, Default)]
pub struct DataUpdate {
    pub wavelength: Option<Array1<f64>>,
    pub uncertainty: Option<Array1<f64>>,
    pub flux: Option<FluxScale>,
}

impl From<ObservationData> for DataUpdate {
    fn from(data: ObservationData) -> Self {
        let (wavelength, uncertainty, flux) = data.into_parts();
        Self {
            wavelength: Some(wavelength),
            uncertainty: Some(uncertainty),
            flux: Some(flux),
        }
    }
}

pub struct GaussianProcess<K: KernelFamily> {
    family: K,
    kernel: Array1<f64>,
    cache: CovarianceCache<K::Params>,
    factorized: Option<FactorizedCovariance>,
    check_finite: bool,
    rebuilds: usize,
}

impl<K: KernelFamily> GaussianProcess<K> {
    /// An engine with no data and an all-zero raw kernel vector.
    pub fn new(family: K) -> Self {
        let num_params = family.kernel_properties().num_params;
        Self {
            family,
            kernel: Array1::zeros(num_params),
            cache: CovarianceCache::new(),
            factorized: None,
            check_finite: false,
            rebuilds: 0,
        }
    }

    pub fn with_data(family: K, data: ObservationData) -> Self {
        let mut gp = Self::new(family);
        gp.set_data(data);
        gp
    }

    /// Replaces the initial raw kernel vector, checking its length.
    pub fn with_kernel(mut self, kernel: Array1<f64>) -> Result<Self, GpError> {
        self.set_kernel(kernel)?;
        Ok(self)
    }

    /// Scan the covariance and residuals for NaN/inf before using them.
    pub fn with_check_finite(mut self, check_finite: bool) -> Self {
        self.check_finite = check_finite;
        self
    }

    pub fn family(&self) -> &K {
        &self.family
    }

    pub fn kernel(&self) -> ArrayView1<'_, f64> {
        self.kernel.view()
    }

    /// Mutable access to the raw kernel vector. The length is fixed.
    pub fn kernel_mut(&mut self) -> ArrayViewMut1<'_, f64> {
        self.kernel.view_mut()
    }

    pub fn set_kernel(&mut self, kernel: Array1<f64>) -> Result<(), GpError> {
        self.family.check_kernel_len(kernel.view())?;
        self.kernel = kernel;
        Ok(())
    }

    /// Caches new observational data; unset fields keep their cached values.
    /// Returns whether everything supplied matched the cache.
    pub fn update_data(&mut self, update: DataUpdate) -> bool {
        self.cache
            .update_data(update.wavelength, update.uncertainty, update.flux)
    }

    pub fn set_data(&mut self, data: ObservationData) {
        self.update_data(data.into());
    }

    /// Blanks out the cached data, parameters and factorization, and zeroes
    /// the raw kernel vector.
    pub fn reset(&mut self) {
        self.cache.reset();
        self.factorized = None;
        self.kernel.fill(0.0);
    }

    pub fn params(&self) -> Option<&K::Params> {
        self.cache.params()
    }

    pub fn num_points(&self) -> Option<usize> {
        self.cache.num_points()
    }

    pub fn factorization(&self) -> Option<&FactorizedCovariance> {
        self.factorized.as_ref()
    }

    pub fn log_determinant(&self) -> Option<f64> {
        self.factorized.as_ref().map(FactorizedCovariance::log_determinant)
    }

    /// Number of covariance factorizations performed so far.
    pub fn rebuild_count(&self) -> usize {
        self.rebuilds
    }

    /// Rebuilds the factorization if the kernel vector or the data changed
    /// since the last successful rebuild.
    pub fn compute(&mut self) -> Result<(), GpError> {
        self.compute_with(DataUpdate::default(), false)
    }

    /// Caches `update`, then rebuilds if anything changed or `force` is set.
    pub fn compute_with(&mut self, update: DataUpdate, force: bool) -> Result<(), GpError> {
        let params = self.family.kernel_to_params(self.kernel.view())?;
        let params_unchanged = self.cache.update_params(params);
        let data_unchanged = self.update_data(update);

        if self.cache.is_clean() && self.factorized.is_some() && !force {
            return Ok(());
        }

        self.factorized = None;
        let params = self
            .cache
            .params()
            .ok_or(GpError::MissingFactorization("kernel parameters were never decoded"))?;
        let data = self.cache.observations()?;
        let sigma = self.family.construct_covariance(params, &data)?;
        if self.check_finite && sigma.iter().any(|v| !v.is_finite()) {
            return Err(GpError::NonFiniteInput {
                quantity: "covariance matrix",
            });
        }

        let factor = sigma.cholesky(Side::Lower)?;
        let log_det = factor.log_determinant();
        if !log_det.is_finite() {
            log::warn!(
                "Non-finite log-determinant ({}) for {} kernel with parameters {:?}",
                log_det,
                self.family.name(),
                params
            );
            return Err(GpError::NonFiniteLogDeterminant { log_det });
        }

        log::debug!(
            "Rebuilt {}x{} {} covariance (params unchanged: {}, data unchanged: {}, forced: {})",
            data.len(),
            data.len(),
            self.family.name(),
            params_unchanged,
            data_unchanged,
            force
        );
        self.factorized = Some(FactorizedCovariance { factor, log_det });
        self.cache.mark_clean();
        self.rebuilds += 1;
        Ok(())
    }

    fn check_residual(&self, residual: ArrayView1<f64>) -> Result<usize, GpError> {
        let n = self
            .cache
            .num_points()
            .ok_or(GpError::MissingFactorization("no uncertainty vector has been supplied"))?;
        ensure_len("residual", n, residual.len())?;
        if self.check_finite && residual.iter().any(|v| !v.is_finite()) {
            return Err(GpError::NonFiniteInput { quantity: "residual" });
        }
        Ok(n)
    }

    fn current_factorization(&self) -> Result<&FactorizedCovariance, GpError> {
        self.factorized
            .as_ref()
            .ok_or(GpError::MissingFactorization("compute has not succeeded"))
    }

    /// Multivariate normal log-density of `residual` under the current
    /// covariance, `−½ (rᵀ Σ⁻¹ r + log|Σ| + N log 2π)`.
    pub fn lnlikelihood(&mut self, residual: ArrayView1<f64>) -> Result<f64, GpError> {
        let n = self.check_residual(residual)?;
        self.compute()?;
        let factorized = self.current_factorization()?;

        let alpha = factorized.factor.solve_vec(&residual);
        let quadratic = residual.dot(&alpha);
        Ok(-0.5 * (quadratic + factorized.log_det + n as f64 * (2.0 * PI).ln()))
    }

    /// Posterior mean and covariance of the correlated component at `at`, or
    /// at the training locations when `at` is `None`.
    ///
    /// Out-of-sample prediction relies on the caller supplying query flux
    /// consistent with the training flux convention; validate against a
    /// brute-force computation before trusting it.
    pub fn predict(
        &mut self,
        residual: ArrayView1<f64>,
        at: Option<PredictionPoints<'_>>,
    ) -> Result<(Array1<f64>, Array2<f64>), GpError> {
        self.check_residual(residual)?;
        self.compute()?;

        let params = self
            .cache
            .params()
            .ok_or(GpError::MissingFactorization("kernel parameters were never decoded"))?;
        let data = self.cache.observations()?;
        let (cross, test) = match at {
            Some(query) => (
                self.family.construct_covariance_cross(params, &data, &query)?,
                self.family.construct_covariance_test(params, &data, &query)?,
            ),
            None => {
                let in_sample = PredictionPoints {
                    wavelength: data.wavelength,
                    flux: match data.flux_scale {
                        FluxScale::Vector(flux) => Some(flux.view()),
                        FluxScale::Unit => None,
                    },
                };
                (
                    self.family.construct_covariance_cross(params, &data, &in_sample)?,
                    self.family.construct_covariance_test(params, &data, &in_sample)?,
                )
            }
        };
        let factorized = self.current_factorization()?;

        let mean = cross.dot(&factorized.factor.solve_vec(&residual));
        let solved = factorized.factor.solve_mat(&cross.t());
        let cov = test - cross.dot(&solved);
        Ok((mean, cov))
    }

    /// The training covariance for the current kernel vector and data.
    pub fn construct_covariance(&self) -> Result<Array2<f64>, GpError> {
        let params = self.family.kernel_to_params(self.kernel.view())?;
        self.family
            .construct_covariance(&params, &self.cache.observations()?)
    }

    pub fn construct_covariance_cross(
        &self,
        query: &PredictionPoints<'_>,
    ) -> Result<Array2<f64>, GpError> {
        let params = self.family.kernel_to_params(self.kernel.view())?;
        self.family
            .construct_covariance_cross(&params, &self.cache.observations()?, query)
    }

    pub fn construct_covariance_test(
        &self,
        query: &PredictionPoints<'_>,
    ) -> Result<Array2<f64>, GpError> {
        let params = self.family.kernel_to_params(self.kernel.view())?;
        self.family
            .construct_covariance_test(&params, &self.cache.observations()?, query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{Matern32, SparseOutlier, SquaredExponential};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn spectrum() -> ObservationData {
        ObservationData::new(
            array![5000.0, 5000.5, 5001.0, 5001.5, 5002.5],
            array![0.1, 0.12, 0.08, 0.1, 0.2],
            FluxScale::Unit,
        )
        .unwrap()
    }

    fn engine() -> GaussianProcess<SquaredExponential> {
        GaussianProcess::with_data(SquaredExponential, spectrum())
            .with_kernel(array![(0.01_f64).ln(), (0.04_f64).ln(), (1.0_f64).ln()])
            .unwrap()
    }

    #[test]
    fn new_engine_has_zero_kernel_of_declared_length() {
        let gp = GaussianProcess::new(Matern32);
        assert_eq!(gp.kernel(), array![0.0, 0.0, 0.0].view());
        assert!(gp.factorization().is_none());
        assert_eq!(gp.rebuild_count(), 0);

        let gp = GaussianProcess::new(SparseOutlier::new(2, true));
        assert_eq!(gp.kernel().len(), 5);
    }

    #[test]
    fn compute_twice_factorizes_once() {
        let mut gp = engine();
        gp.compute().unwrap();
        gp.compute().unwrap();
        assert_eq!(gp.rebuild_count(), 1);
        assert_eq!(gp.factorization().map(FactorizedCovariance::dim), Some(5));
    }

    #[test]
    fn kernel_change_forces_one_rebuild() {
        let mut gp = engine();
        gp.compute().unwrap();
        gp.kernel_mut()[2] += 0.25;
        gp.compute().unwrap();
        gp.compute().unwrap();
        assert_eq!(gp.rebuild_count(), 2);
    }

    #[test]
    fn data_change_forces_one_rebuild() {
        let mut gp = engine();
        gp.compute().unwrap();

        let mut sigma = array![0.1, 0.12, 0.08, 0.1, 0.2];
        gp.compute_with(
            DataUpdate {
                uncertainty: Some(sigma.clone()),
                ..DataUpdate::default()
            },
            false,
        )
        .unwrap();
        assert_eq!(gp.rebuild_count(), 1);

        sigma[3] = 0.11;
        gp.compute_with(
            DataUpdate {
                uncertainty: Some(sigma),
                ..DataUpdate::default()
            },
            false,
        )
        .unwrap();
        gp.compute().unwrap();
        assert_eq!(gp.rebuild_count(), 2);
    }

    #[test]
    fn force_always_rebuilds() {
        let mut gp = engine();
        gp.compute().unwrap();
        gp.compute_with(DataUpdate::default(), true).unwrap();
        gp.compute_with(DataUpdate::default(), true).unwrap();
        assert_eq!(gp.rebuild_count(), 3);
    }

    #[test]
    fn compute_without_data_is_missing_factorization() {
        let mut gp = GaussianProcess::new(SquaredExponential);
        assert!(matches!(
            gp.compute(),
            Err(GpError::MissingFactorization(_))
        ));
        assert!(matches!(
            gp.lnlikelihood(array![0.0].view()),
            Err(GpError::MissingFactorization(_))
        ));
    }

    #[test]
    fn set_kernel_checks_length() {
        let mut gp = engine();
        assert!(matches!(
            gp.set_kernel(array![0.0, 0.0]),
            Err(GpError::KernelLength { expected: 3, found: 2, .. })
        ));
        assert_eq!(gp.kernel().len(), 3);
    }

    #[test]
    fn residual_length_mismatch_is_rejected() {
        let mut gp = engine();
        let err = gp.lnlikelihood(array![0.1, 0.2].view()).unwrap_err();
        assert!(matches!(
            err,
            GpError::ShapeMismatch {
                quantity: "residual",
                expected: 5,
                found: 2
            }
        ));
        assert!(matches!(
            gp.predict(Array1::from_elem(6, 0.1).view(), None),
            Err(GpError::ShapeMismatch { quantity: "residual", .. })
        ));
    }

    #[test]
    fn failed_rebuild_is_not_reused() {
        let data = ObservationData::new(array![0.0, 1.0], array![0.0, 0.0], FluxScale::Unit).unwrap();
        let mut gp = GaussianProcess::with_data(SquaredExponential, data)
            .with_kernel(array![-800.0, -800.0, 0.0])
            .unwrap();
        let first = gp.compute().unwrap_err();
        assert!(first.is_invalid_region());
        assert!(gp.factorization().is_none());
        assert!(gp.compute().is_err());
        assert_eq!(gp.rebuild_count(), 0);
    }

    #[test]
    fn check_finite_rejects_nan_residuals() {
        let mut gp = engine().with_check_finite(true);
        let residual = array![0.0, f64::NAN, 0.0, 0.0, 0.0];
        assert!(matches!(
            gp.lnlikelihood(residual.view()),
            Err(GpError::NonFiniteInput { quantity: "residual" })
        ));
    }

    #[test]
    fn lnlikelihood_is_deterministic() {
        let mut gp = engine();
        let residual = array![0.05, -0.1, 0.02, 0.0, 0.3];
        let first = gp.lnlikelihood(residual.view()).unwrap();
        let second = gp.lnlikelihood(residual.view()).unwrap();
        assert_eq!(first.to_bits(), second.to_bits());
        assert_eq!(gp.rebuild_count(), 1);
    }

    #[test]
    fn reset_clears_state() {
        let mut gp = engine();
        gp.compute().unwrap();
        gp.reset();
        assert!(gp.factorization().is_none());
        assert!(gp.params().is_none());
        assert!(gp.num_points().is_none());
        assert_eq!(gp.kernel(), array![0.0, 0.0, 0.0].view());
        gp.set_data(spectrum());
        gp.compute().unwrap();
        assert_eq!(gp.rebuild_count(), 2);
    }

    #[test]
    fn log_determinant_matches_diagonal_product() {
        let data = ObservationData::new(array![0.0, 10.0], array![0.5, 2.0], FluxScale::Unit).unwrap();
        let mut gp = GaussianProcess::with_data(SquaredExponential, data)
            .with_kernel(array![-800.0, -800.0, 0.0])
            .unwrap();
        gp.compute().unwrap();
        assert_abs_diff_eq!(
            gp.log_determinant().unwrap(),
            (0.25_f64 * 4.0).ln(),
            epsilon = 1e-12
        );
    }
}
