//! Forward map: moments to Bz per sensor.

use magpole_compute::ComputeBackend;
use ndarray::Array1;

use crate::basis::{bz_coefficients, displacement, MAX_COMPONENTS};
use crate::layout::MultipoleLayout;

use super::OperatorError;

/// Evaluates `d = A m` one sensor at a time.
///
/// Each sensor's value is a single scalar accumulation over order blocks,
/// then sources, then components, always in that order. Backends only decide
/// which thread owns which sensor, never how a sum is formed.
pub struct ForwardEvaluator<'a> {
    sources: &'a [[f64; 3]],
    sensors: &'a [[f64; 3]],
    layout: &'a MultipoleLayout,
}

impl<'a> ForwardEvaluator<'a> {
    pub fn new(sources: &'a [[f64; 3]], sensors: &'a [[f64; 3]], layout: &'a MultipoleLayout) -> Self {
        Self {
            sources,
            sensors,
            layout,
        }
    }

    /// Bz at sensor `sensor` for component-major `moments`.
    pub fn sensor_value(&self, sensor: usize, moments: &[f64]) -> f64 {
        let n = self.sources.len();
        let position = &self.sensors[sensor];
        let mut coeffs = [0.0; MAX_COMPONENTS];
        let mut bz = 0.0;

        for block in self.layout.blocks() {
            for (j, source) in self.sources.iter().enumerate() {
                let width = bz_coefficients(block.order, &displacement(position, source), &mut coeffs);
                for (k, c) in coeffs[..width].iter().enumerate() {
                    bz += c * moments[(block.offset + k) * n + j];
                }
            }
        }

        bz
    }

    /// Evaluate every sensor on `backend`.
    ///
    /// `moments` must have length `N_particles · n_cols`; anything else is a
    /// [`OperatorError::ShapeMismatch`] before any sensor is evaluated.
    pub fn evaluate(&self, backend: &dyn ComputeBackend, moments: &[f64]) -> Result<Array1<f64>, OperatorError> {
        let expected = self.layout.moment_len(self.sources.len());
        if moments.len() != expected {
            return Err(OperatorError::ShapeMismatch {
                what: "moment vector",
                expected,
                actual: moments.len(),
            });
        }
        let bz = backend.parallel_rows(self.sensors.len(), 1, &|i, out| {
            out[0] = self.sensor_value(i, moments);
        })?;
        Ok(Array1::from_vec(bz))
    }
}
