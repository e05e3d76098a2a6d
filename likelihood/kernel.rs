//! Covariance kernel families.
//!
//! Every family answers the same four questions: how to read its raw parameter
//! vector, how to build the cross-covariance block `K(x*, x)`, what noise goes on
//! the diagonal, and how those pieces assemble into the training, cross and test
//! covariance blocks. The assembly has default implementations; the sparse
//! outlier family only overrides the prediction blocks, which it restricts to
//! the training points.
//!
//! Conventions:
//! - `construct_kernel(x, x_star)` returns a `len(x*) × len(x)` matrix, rows
//!   indexed by the query coordinates.
//! - Smooth kernels read `[ln s, ln a², ln l²]` and exponentiate, so any real
//!   vector maps to positive jitter, amplitude and length scale.

use crate::data::{FluxScale, ObservationView};
use crate::errors::{GpError, ensure_len};
use ndarray::{Array1, Array2, ArrayView1, Zip, s};
use std::fmt;

/// Static description of a kernel family's raw parameter vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelProperties {
    pub num_params: usize,
}

/// Locations at which a posterior prediction is requested.
#[derive(Debug, Clone, Copy)]
pub struct PredictionPoints<'a> {
    pub wavelength: ArrayView1<'a, f64>,
    /// Mean-model flux at `wavelength`; required when the training data carry
    /// a non-trivial flux scale.
    pub flux: Option<ArrayView1<'a, f64>>,
}

pub trait KernelFamily {
    /// Typed parameters decoded from the raw vector. Equality decides whether
    /// a cached factorization may be reused.
    type Params: Clone + PartialEq + fmt::Debug;

    fn name(&self) -> &'static str;

    fn kernel_properties(&self) -> KernelProperties;

    /// Decodes the raw vector. Implementations must reject wrong lengths via
    /// [`KernelFamily::check_kernel_len`].
    fn kernel_to_params(&self, kernel: ArrayView1<f64>) -> Result<Self::Params, GpError>;

    /// `K(x*, x)`, shape `len(x*) × len(x)`, without flux scaling or noise.
    fn construct_kernel(
        &self,
        params: &Self::Params,
        x: ArrayView1<f64>,
        x_star: ArrayView1<f64>,
    ) -> Result<Array2<f64>, GpError>;

    /// Noise variance added to the diagonal of the training covariance.
    fn construct_diagonal(&self, params: &Self::Params, data: &ObservationView<'_>)
    -> Array1<f64>;

    fn check_kernel_len(&self, kernel: ArrayView1<f64>) -> Result<(), GpError> {
        let expected = self.kernel_properties().num_params;
        if kernel.len() == expected {
            Ok(())
        } else {
            Err(GpError::KernelLength {
                kernel: self.name(),
                expected,
                found: kernel.len(),
            })
        }
    }

    /// Full training covariance: kernel on `(wave, wave)`, flux-scaled when the
    /// flux is non-trivial, plus the diagonal noise.
    fn construct_covariance(
        &self,
        params: &Self::Params,
        data: &ObservationView<'_>,
    ) -> Result<Array2<f64>, GpError> {
        let mut sigma = flux_scaled_training_kernel(self, params, data)?;
        let diagonal = self.construct_diagonal(params, data);
        sigma.diag_mut().scaled_add(1.0, &diagonal);
        Ok(sigma)
    }

    /// Covariance between query points (rows) and training points (columns).
    fn construct_covariance_cross(
        &self,
        params: &Self::Params,
        data: &ObservationView<'_>,
        query: &PredictionPoints<'_>,
    ) -> Result<Array2<f64>, GpError> {
        let sigma = self.construct_kernel(params, data.wavelength, query.wavelength)?;
        match data.flux_scale {
            FluxScale::Vector(flux) if !data.flux_scale.is_trivial() => {
                let query_flux = required_query_flux(query)?;
                Ok(scale_by_flux(&sigma, query_flux, flux.view()))
            }
            _ => Ok(sigma),
        }
    }

    /// Covariance among the query points. Query points carry no observational
    /// noise, so nothing is added to the diagonal.
    ///
    /// The query flux scales both sides, so the block stays symmetric.
    fn construct_covariance_test(
        &self,
        params: &Self::Params,
        data: &ObservationView<'_>,
        query: &PredictionPoints<'_>,
    ) -> Result<Array2<f64>, GpError> {
        let mut sigma = self.construct_kernel(params, query.wavelength, query.wavelength)?;
        if !data.flux_scale.is_trivial() {
            let query_flux = required_query_flux(query)?;
            sigma = scale_by_flux(&sigma, query_flux, query_flux);
        }
        Ok(sigma)
    }
}

/// `K(x, x)` on the training points, flux-scaled on both sides when the flux
/// is non-trivial.
fn flux_scaled_training_kernel<K: KernelFamily + ?Sized>(
    family: &K,
    params: &K::Params,
    data: &ObservationView<'_>,
) -> Result<Array2<f64>, GpError> {
    let sigma = family.construct_kernel(params, data.wavelength, data.wavelength)?;
    if data.flux_scale.is_trivial() {
        return Ok(sigma);
    }
    let flux = data.flux_scale.to_vector(data.len());
    Ok(scale_by_flux(&sigma, flux.view(), flux.view()))
}

/// `leftᵢ · Kᵢⱼ · rightⱼ`. The flux product is formed first so that equal
/// flux vectors keep the result exactly symmetric.
fn scale_by_flux(
    kernel: &Array2<f64>,
    left: ArrayView1<f64>,
    right: ArrayView1<f64>,
) -> Array2<f64> {
    Array2::from_shape_fn(kernel.dim(), |(i, j)| kernel[(i, j)] * (left[i] * right[j]))
}

fn required_query_flux<'a>(query: &PredictionPoints<'a>) -> Result<ArrayView1<'a, f64>, GpError> {
    let n = query.wavelength.len();
    match query.flux {
        Some(flux) => {
            ensure_len("query flux", n, flux.len())?;
            Ok(flux)
        }
        None => Err(GpError::ShapeMismatch {
            quantity: "query flux",
            expected: n,
            found: 0,
        }),
    }
}

/// Jitter, squared amplitude and squared length scale of the smooth kernels,
/// already exponentiated out of log space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmoothParams {
    pub jitter: f64,
    pub amplitude_sq: f64,
    pub lengthscale_sq: f64,
}

fn smooth_params_from_log<K: KernelFamily + ?Sized>(
    family: &K,
    kernel: ArrayView1<f64>,
) -> Result<SmoothParams, GpError> {
    family.check_kernel_len(kernel)?;
    Ok(SmoothParams {
        jitter: kernel[0].exp(),
        amplitude_sq: kernel[1].exp(),
        lengthscale_sq: kernel[2].exp(),
    })
}

fn smooth_diagonal(params: &SmoothParams, data: &ObservationView<'_>) -> Array1<f64> {
    let jitter_sq = params.jitter * params.jitter;
    data.uncertainty.mapv(|s| s * s + jitter_sq)
}

/// `K = a² exp(−(x* − x)² / 2l²)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SquaredExponential;

impl KernelFamily for SquaredExponential {
    type Params = SmoothParams;

    fn name(&self) -> &'static str {
        "squared_exponential"
    }

    fn kernel_properties(&self) -> KernelProperties {
        KernelProperties { num_params: 3 }
    }

    fn kernel_to_params(&self, kernel: ArrayView1<f64>) -> Result<SmoothParams, GpError> {
        smooth_params_from_log(self, kernel)
    }

    fn construct_kernel(
        &self,
        params: &SmoothParams,
        x: ArrayView1<f64>,
        x_star: ArrayView1<f64>,
    ) -> Result<Array2<f64>, GpError> {
        let two_lsq = 2.0 * params.lengthscale_sq;
        Ok(Array2::from_shape_fn((x_star.len(), x.len()), |(i, j)| {
            let delta = x_star[i] - x[j];
            params.amplitude_sq * (-(delta * delta) / two_lsq).exp()
        }))
    }

    fn construct_diagonal(&self, params: &SmoothParams, data: &ObservationView<'_>) -> Array1<f64> {
        smooth_diagonal(params, data)
    }
}

/// Matérn ν = 3/2: with `d = √3 |x* − x| / l`, `K = a² (1 + d) e^{−d}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Matern32;

impl KernelFamily for Matern32 {
    type Params = SmoothParams;

    fn name(&self) -> &'static str {
        "matern32"
    }

    fn kernel_properties(&self) -> KernelProperties {
        KernelProperties { num_params: 3 }
    }

    fn kernel_to_params(&self, kernel: ArrayView1<f64>) -> Result<SmoothParams, GpError> {
        smooth_params_from_log(self, kernel)
    }

    fn construct_kernel(
        &self,
        params: &SmoothParams,
        x: ArrayView1<f64>,
        x_star: ArrayView1<f64>,
    ) -> Result<Array2<f64>, GpError> {
        let scale = 3.0_f64.sqrt() / params.lengthscale_sq.sqrt();
        Ok(Array2::from_shape_fn((x_star.len(), x.len()), |(i, j)| {
            let d = scale * (x_star[i] - x[j]).abs();
            params.amplitude_sq * (1.0 + d) * (-d).exp()
        }))
    }

    fn construct_diagonal(&self, params: &SmoothParams, data: &ObservationView<'_>) -> Array1<f64> {
        smooth_diagonal(params, data)
    }
}

/// Decoded sparse outlier parameters. Locations are already truncated to
/// whole pixel indices but kept as floats until they are checked against the
/// data length.
#[derive(Debug, Clone, PartialEq)]
pub struct OutlierParams {
    pub jitter: f64,
    pub locations: Vec<f64>,
    pub amplitudes: Vec<f64>,
}

/// Point-mass variance at individual pixels, for isolated bad pixels.
///
/// Raw layout: `[amplitudes (n), locations (n), jitter?]`. Values are used as
/// given, not in log space. Locations are pixel indices, so this family only
/// makes sense when the data are on a fixed pixel grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseOutlier {
    pub outliers: usize,
    pub jitter: bool,
}

impl SparseOutlier {
    pub fn new(outliers: usize, jitter: bool) -> Self {
        Self { outliers, jitter }
    }

    fn indices(&self, params: &OutlierParams, n: usize) -> Result<Vec<usize>, GpError> {
        params
            .locations
            .iter()
            .map(|&location| {
                if location.is_finite() && location >= 0.0 && (location as usize) < n {
                    Ok(location as usize)
                } else {
                    Err(GpError::OutlierLocation { location, n })
                }
            })
            .collect()
    }

    /// Flux-scaled jitter variance `(s fᵢ)²` on every pixel.
    fn jitter_variance(&self, params: &OutlierParams, data: &ObservationView<'_>) -> Array1<f64> {
        data.flux_scale
            .to_vector(data.len())
            .mapv(|f| (params.jitter * f).powi(2))
    }

    /// Everything except the observational variance: flux-scaled point masses
    /// plus the jitter term.
    fn signal_block(
        &self,
        params: &OutlierParams,
        data: &ObservationView<'_>,
    ) -> Result<Array2<f64>, GpError> {
        let mut sigma = flux_scaled_training_kernel(self, params, data)?;
        sigma
            .diag_mut()
            .scaled_add(1.0, &self.jitter_variance(params, data));
        Ok(sigma)
    }

    /// Point masses are tied to pixel indices, so a query must be exactly the
    /// training grid (and flux, when one is given).
    fn in_sample_only(
        &self,
        data: &ObservationView<'_>,
        query: &PredictionPoints<'_>,
    ) -> Result<(), GpError> {
        ensure_len("query wavelength", data.len(), query.wavelength.len())?;
        if query.wavelength != data.wavelength {
            return Err(GpError::OutOfSampleQuery {
                kernel: self.name(),
                quantity: "wavelength",
            });
        }
        if let Some(flux) = query.flux {
            if flux != data.flux_scale.to_vector(data.len()) {
                return Err(GpError::OutOfSampleQuery {
                    kernel: self.name(),
                    quantity: "flux",
                });
            }
        }
        Ok(())
    }
}

impl KernelFamily for SparseOutlier {
    type Params = OutlierParams;

    fn name(&self) -> &'static str {
        "sparse_outlier"
    }

    fn kernel_properties(&self) -> KernelProperties {
        KernelProperties {
            num_params: 2 * self.outliers + usize::from(self.jitter),
        }
    }

    fn kernel_to_params(&self, kernel: ArrayView1<f64>) -> Result<OutlierParams, GpError> {
        self.check_kernel_len(kernel)?;
        let nout = self.outliers;
        Ok(OutlierParams {
            jitter: if self.jitter { kernel[2 * nout] } else { 0.0 },
            locations: kernel
                .slice(s![nout..2 * nout])
                .iter()
                .map(|loc| loc.trunc())
                .collect(),
            amplitudes: kernel.slice(s![..nout]).to_vec(),
        })
    }

    /// Point masses `a²` at `(loc, loc)`. Coordinates are ignored; both sides
    /// must be the same pixel grid.
    fn construct_kernel(
        &self,
        params: &OutlierParams,
        x: ArrayView1<f64>,
        x_star: ArrayView1<f64>,
    ) -> Result<Array2<f64>, GpError> {
        let n = x.len();
        ensure_len("query wavelength", n, x_star.len())?;
        let mut sigma = Array2::zeros((n, n));
        for (idx, &amp) in self.indices(params, n)?.into_iter().zip(&params.amplitudes) {
            sigma[(idx, idx)] += amp * amp;
        }
        Ok(sigma)
    }

    fn construct_diagonal(&self, params: &OutlierParams, data: &ObservationView<'_>) -> Array1<f64> {
        let mut diagonal = self.jitter_variance(params, data);
        Zip::from(&mut diagonal)
            .and(&data.uncertainty)
            .for_each(|d, &s| *d += s * s);
        diagonal
    }

    /// The signal block on the training grid: the covariance without `σ²`.
    fn construct_covariance_cross(
        &self,
        params: &OutlierParams,
        data: &ObservationView<'_>,
        query: &PredictionPoints<'_>,
    ) -> Result<Array2<f64>, GpError> {
        self.in_sample_only(data, query)?;
        self.signal_block(params, data)
    }

    fn construct_covariance_test(
        &self,
        params: &OutlierParams,
        data: &ObservationView<'_>,
        query: &PredictionPoints<'_>,
    ) -> Result<Array2<f64>, GpError> {
        self.in_sample_only(data, query)?;
        self.signal_block(params, data)
    }
}
