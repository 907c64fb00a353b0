//! Synthetic field maps from known sources.
//!
//! A [`ScanGrid`] describes the planar sensor raster of a scanning
//! magnetometer; a [`FieldAccumulator`] evaluates the Bz (or full dipole
//! field) of a [`MultipoleSources`] set on it.
//!
//! The accumulator reuses the operator's [`ForwardEvaluator`], so a synthetic
//! map is exactly `A m` for the same geometry: data generated here and data
//! fitted by an inversion share every formula.
//!
//! [`add_gaussian_noise`] perturbs a synthetic map with seeded, uncorrelated
//! sensor noise; the same seed always gives the same noisy map.

use std::sync::Arc;

use magpole_compute::{ComputeBackend, SequentialBackend};
use ndarray::{Array, Array1, Array2, Dimension};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::basis::dipole_field;
use crate::layout::MultipoleLayout;
use crate::operator::{contiguous, validate_geometry, ForwardEvaluator, OperatorError};
use crate::types::{ExpansionLimit, MultipoleSources};

/// Regular planar scan at constant height.
///
/// Sensors sit at `origin + (k·step_x, l·step_y, height)` with
/// `k < nx = round(span_x / step_x)` and `l < ny = round(span_y / step_y)`.
/// The flattened order is row-major with y outer and x inner, matching the
/// `(ny, nx)` shape of the maps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanGrid {
    /// Scan height Hz (m).
    pub height: f64,
    /// Scan extent [Sx, Sy] (m).
    pub span: [f64; 2],
    /// Scan step [Sdx, Sdy] (m).
    pub step: [f64; 2],
    /// Position of the first sensor [x0, y0] (m).
    #[serde(default)]
    pub origin: [f64; 2],
}

impl ScanGrid {
    pub fn new(height: f64, span: [f64; 2], step: [f64; 2]) -> Self {
        Self {
            height,
            span,
            step,
            origin: [0.0, 0.0],
        }
    }

    pub fn with_origin(mut self, origin: [f64; 2]) -> Self {
        self.origin = origin;
        self
    }

    /// Number of sensors along x.
    pub fn nx(&self) -> usize {
        axis_count(self.span[0], self.step[0]).unwrap_or(usize::MAX)
    }

    /// Number of sensors along y.
    pub fn ny(&self) -> usize {
        axis_count(self.span[1], self.step[1]).unwrap_or(usize::MAX)
    }

    /// Map shape `(ny, nx)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.ny(), self.nx())
    }

    /// Total sensor count, `None` when it does not fit in `usize`.
    pub fn checked_len(&self) -> Option<usize> {
        let nx = axis_count(self.span[0], self.step[0])?;
        let ny = axis_count(self.span[1], self.step[1])?;
        nx.checked_mul(ny)
    }

    /// Total sensor count, saturating at `usize::MAX`. [`validate`](Self::validate)
    /// rejects grids where that happens.
    pub fn len(&self) -> usize {
        self.checked_len().unwrap_or(usize::MAX)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn x_coords(&self) -> Vec<f64> {
        (0..self.nx())
            .map(|k| self.origin[0] + k as f64 * self.step[0])
            .collect()
    }

    pub fn y_coords(&self) -> Vec<f64> {
        (0..self.ny())
            .map(|l| self.origin[1] + l as f64 * self.step[1])
            .collect()
    }

    /// Reject non-finite values, non-positive steps, and grids that are empty
    /// or whose sensor count overflows `usize`.
    pub fn validate(&self) -> Result<(), OperatorError> {
        let values = [
            self.height,
            self.span[0],
            self.span[1],
            self.step[0],
            self.step[1],
            self.origin[0],
            self.origin[1],
        ];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(OperatorError::InvalidConfiguration(format!(
                "Scan grid has non-finite parameters: {:?}",
                self
            )));
        }
        if self.step[0] <= 0.0 || self.step[1] <= 0.0 {
            return Err(OperatorError::InvalidConfiguration(format!(
                "Scan step must be positive, got {:?}",
                self.step
            )));
        }
        if self.checked_len().is_none() {
            return Err(OperatorError::InvalidConfiguration(format!(
                "Scan grid is too large: span {:?} with step {:?}",
                self.span, self.step
            )));
        }
        if self.is_empty() {
            return Err(OperatorError::InvalidConfiguration(format!(
                "Scan grid is empty: span {:?} with step {:?}",
                self.span, self.step
            )));
        }
        Ok(())
    }

    /// Sensor positions, y outer and x inner.
    pub fn sensor_positions(&self) -> Result<Vec<[f64; 3]>, OperatorError> {
        self.validate()?;
        let xs = self.x_coords();
        Ok(self
            .y_coords()
            .into_iter()
            .flat_map(|y| xs.iter().map(move |&x| [x, y, self.height]))
            .collect())
    }
}

/// `round(span / step)`, or `None` when the ratio is not a representable
/// count.
fn axis_count(span: f64, step: f64) -> Option<usize> {
    let n = (span / step).round();
    if !n.is_finite() {
        return None;
    }
    if n <= 0.0 {
        return Some(0);
    }
    // usize::MAX as f64 rounds up to 2^64, which itself does not fit.
    if n >= usize::MAX as f64 {
        return None;
    }
    Some(n as usize)
}

/// Evaluates the field of known sources at arbitrary sensors.
pub struct FieldAccumulator {
    backend: Arc<dyn ComputeBackend>,
}

impl FieldAccumulator {
    pub fn new(backend: Arc<dyn ComputeBackend>) -> Self {
        Self { backend }
    }

    /// Accumulator on the calling thread.
    pub fn sequential() -> Self {
        Self::new(Arc::new(SequentialBackend::new()))
    }

    /// Bz at each sensor, including orders up to `limit`.
    ///
    /// Orders within `limit` that `sources` does not carry contribute zero.
    pub fn bz_at(
        &self,
        sources: &MultipoleSources,
        sensors: &[[f64; 3]],
        limit: ExpansionLimit,
    ) -> Result<Array1<f64>, OperatorError> {
        validate_geometry(sensors.len(), sources.len(), sources.positions(), sensors)?;
        let layout = MultipoleLayout::new(limit);
        let moments = sources.moment_vector(limit)?;
        let moments = contiguous(&moments);

        ForwardEvaluator::new(sources.positions(), sensors, &layout)
            .evaluate(self.backend.as_ref(), &moments)
    }

    /// Bz map on `grid`, shape `(ny, nx)`.
    pub fn bz_grid(
        &self,
        sources: &MultipoleSources,
        grid: &ScanGrid,
        limit: ExpansionLimit,
    ) -> Result<Array2<f64>, OperatorError> {
        let sensors = grid.sensor_positions()?;
        let bz = self.bz_at(sources, &sensors, limit)?;
        let len = bz.len();
        bz.into_shape_with_order(grid.shape())
            .map_err(|_| OperatorError::ShapeMismatch {
                what: "scan grid",
                expected: grid.len(),
                actual: len,
            })
    }

    /// Full dipole field vector at each sensor, shape `(N_sensors, 3)`.
    ///
    /// Only the dipole moments of `sources` are used.
    pub fn dipole_field_at(
        &self,
        sources: &MultipoleSources,
        sensors: &[[f64; 3]],
    ) -> Result<Array2<f64>, OperatorError> {
        validate_geometry(sensors.len(), sources.len(), sources.positions(), sensors)?;
        let positions = sources.positions();
        let dipoles = sources.per_particle(ExpansionLimit::Dipole);

        let data = self.backend.parallel_rows(sensors.len(), 3, &|i, out| {
            for (j, source) in positions.iter().enumerate() {
                let m = [dipoles[[j, 0]], dipoles[[j, 1]], dipoles[[j, 2]]];
                let b = dipole_field(source, &m, &sensors[i]);
                out[0] += b[0];
                out[1] += b[1];
                out[2] += b[2];
            }
        })?;

        let len = data.len();
        Array2::from_shape_vec((sensors.len(), 3), data).map_err(|_| OperatorError::ShapeMismatch {
            what: "dipole field",
            expected: sensors.len() * 3,
            actual: len,
        })
    }
}

/// Add zero-mean Gaussian noise of standard deviation `std_dev` (tesla) to
/// every entry of `map`, drawn from a ChaCha8 stream seeded with `seed`.
pub fn add_gaussian_noise<D: Dimension>(
    map: &mut Array<f64, D>,
    std_dev: f64,
    seed: u64,
) -> Result<(), OperatorError> {
    if !std_dev.is_finite() || std_dev < 0.0 {
        return Err(OperatorError::InvalidConfiguration(format!(
            "Noise standard deviation must be finite and non-negative, got {}",
            std_dev
        )));
    }
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    for v in map.iter_mut() {
        *v += std_dev * standard_normal(&mut rng);
    }
    Ok(())
}

/// Box-Muller sample from N(0, 1).
fn standard_normal(rng: &mut ChaCha8Rng) -> f64 {
    let u1: f64 = rng.random::<f64>().max(1e-300); // ln(0)
    let u2: f64 = rng.random();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

impl Default for FieldAccumulator {
    fn default() -> Self {
        Self::sequential()
    }
}
