//! Dirty tracking for the cached covariance factorization.
//!
//! Kernel parameters change on every sampler step while the observational data
//! usually stay fixed for a whole run, so the two halves are tracked with
//! separate flags. Both flags can only be lowered by an update; the only way
//! back to clean is [`CovarianceCache::mark_clean`] after a successful rebuild.
//! A failed rebuild therefore leaves the cache dirty and the next `compute`
//! tries again instead of reusing an older factorization.

use crate::data::{FluxScale, ObservationView};
use crate::errors::GpError;
use ndarray::Array1;

#[derive(Debug, Clone)]
pub struct CovarianceCache<P> {
    params: Option<P>,
    wavelength: Option<Array1<f64>>,
    uncertainty: Option<Array1<f64>>,
    flux: FluxScale,
    params_clean: bool,
    data_clean: bool,
}

impl<P> Default for CovarianceCache<P> {
    fn default() -> Self {
        Self {
            params: None,
            wavelength: None,
            uncertainty: None,
            flux: FluxScale::Unit,
            params_clean: false,
            data_clean: false,
        }
    }
}

impl<P: PartialEq> CovarianceCache<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caches the transformed kernel parameters, lowering `params_clean` if
    /// they differ from the previous ones. Returns whether they were equal.
    pub fn update_params(&mut self, params: P) -> bool {
        let unchanged = self.params.as_ref() == Some(&params);
        self.params_clean &= unchanged;
        self.params = Some(params);
        unchanged
    }

    /// Caches whichever quantities are supplied; `None` keeps the cached value.
    /// Any supplied quantity that differs from the cached one lowers
    /// `data_clean`. Returns whether everything supplied was unchanged.
    pub fn update_data(
        &mut self,
        wavelength: Option<Array1<f64>>,
        uncertainty: Option<Array1<f64>>,
        flux: Option<FluxScale>,
    ) -> bool {
        let mut unchanged = true;
        if let Some(wavelength) = wavelength {
            unchanged &= self.wavelength.as_ref() == Some(&wavelength);
            self.wavelength = Some(wavelength);
        }
        if let Some(uncertainty) = uncertainty {
            unchanged &= self.uncertainty.as_ref() == Some(&uncertainty);
            self.uncertainty = Some(uncertainty);
        }
        if let Some(flux) = flux {
            unchanged &= self.flux == flux;
            self.flux = flux;
        }
        self.data_clean &= unchanged;
        unchanged
    }

    pub fn params_clean(&self) -> bool {
        self.params_clean
    }

    pub fn data_clean(&self) -> bool {
        self.data_clean
    }

    pub fn is_clean(&self) -> bool {
        self.params_clean && self.data_clean
    }

    /// Called only after the factorization has been rebuilt from the currently
    /// cached parameters and data.
    pub fn mark_clean(&mut self) {
        self.params_clean = true;
        self.data_clean = true;
    }

    pub fn params(&self) -> Option<&P> {
        self.params.as_ref()
    }

    pub fn num_points(&self) -> Option<usize> {
        self.uncertainty.as_ref().map(|u| u.len())
    }

    /// The cached data as one validated view.
    pub fn observations(&self) -> Result<ObservationView<'_>, GpError> {
        let wavelength = self
            .wavelength
            .as_ref()
            .ok_or(GpError::MissingFactorization("no wavelength vector has been supplied"))?;
        let uncertainty = self
            .uncertainty
            .as_ref()
            .ok_or(GpError::MissingFactorization("no uncertainty vector has been supplied"))?;
        ObservationView::new(wavelength.view(), uncertainty.view(), &self.flux)
    }

    /// Forgets every cached value.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
