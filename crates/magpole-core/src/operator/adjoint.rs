//! Adjoint map: Bz residual to moment gradient.

use magpole_compute::ComputeBackend;
use ndarray::Array1;

use crate::basis::{bz_coefficients, displacement, MAX_COMPONENTS};
use crate::layout::MultipoleLayout;

use super::OperatorError;

/// Evaluates `m = Aᵀ d` one source at a time.
///
/// The coefficients are the same ones the forward map uses, evaluated at the
/// same displacement `sensor - source`; only the contraction axis changes.
/// Each source fills its own `n_cols`-wide row, and the rows are then
/// scattered into the component-major layout.
pub struct AdjointEvaluator<'a> {
    sources: &'a [[f64; 3]],
    sensors: &'a [[f64; 3]],
    layout: &'a MultipoleLayout,
}

impl<'a> AdjointEvaluator<'a> {
    pub fn new(sources: &'a [[f64; 3]], sensors: &'a [[f64; 3]], layout: &'a MultipoleLayout) -> Self {
        Self {
            sources,
            sensors,
            layout,
        }
    }

    /// Accumulate the gradient of source `source` into `row` (`n_cols` wide).
    pub fn source_row(&self, source: usize, data: &[f64], row: &mut [f64]) {
        let position = &self.sources[source];
        let mut coeffs = [0.0; MAX_COMPONENTS];

        for block in self.layout.blocks() {
            let out = &mut row[block.columns()];
            for (sensor, &d) in self.sensors.iter().zip(data) {
                let width = bz_coefficients(block.order, &displacement(sensor, position), &mut coeffs);
                for (slot, c) in out.iter_mut().zip(&coeffs[..width]) {
                    *slot += c * d;
                }
            }
        }
    }

    /// Evaluate every source on `backend` and return the component-major
    /// gradient. `data` must hold one value per sensor.
    pub fn evaluate(&self, backend: &dyn ComputeBackend, data: &[f64]) -> Result<Array1<f64>, OperatorError> {
        if data.len() != self.sensors.len() {
            return Err(OperatorError::ShapeMismatch {
                what: "data vector",
                expected: self.sensors.len(),
                actual: data.len(),
            });
        }
        let n = self.sources.len();
        let rows = backend.parallel_rows(n, self.layout.n_cols(), &|j, row| {
            self.source_row(j, data, row);
        })?;
        self.layout.scatter_rows(&rows, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExpansionLimit;
    use approx::assert_relative_eq;
    use magpole_compute::SequentialBackend;

    #[test]
    fn test_single_pair_gradient_is_basis_row() {
        let layout = MultipoleLayout::new(ExpansionLimit::Dipole);
        let sources = [[0.0, 0.0, 0.0]];
        let sensors = [[0.0, 0.0, 1.0]];

        let eval = AdjointEvaluator::new(&sources, &sensors, &layout);
        let grad = eval.evaluate(&SequentialBackend::new(), &[1.0]).unwrap();
        assert_eq!(grad.len(), 3);
        assert_relative_eq!(grad[0], 0.0);
        assert_relative_eq!(grad[1], 0.0);
        assert_relative_eq!(grad[2], 2e-7, max_relative = 1e-15);
    }

    #[test]
    fn test_rows_land_in_component_major_slots() {
        let layout = MultipoleLayout::new(ExpansionLimit::Dipole);
        // Second source sits further away; its z component must land at index 2·N + 1.
        let sources = [[0.0, 0.0, 0.0], [0.0, 0.0, -1.0]];
        let sensors = [[0.0, 0.0, 1.0]];

        let eval = AdjointEvaluator::new(&sources, &sensors, &layout);
        let grad = eval.evaluate(&SequentialBackend::new(), &[1.0]).unwrap();
        assert_relative_eq!(grad[4], 2e-7, max_relative = 1e-15);
        assert_relative_eq!(grad[5], 2e-7 / 8.0, max_relative = 1e-14);
    }

    #[test]
    fn test_short_data_rejected() {
        let layout = MultipoleLayout::new(ExpansionLimit::Dipole);
        let sources = [[0.0, 0.0, 0.0]];
        let sensors = [[0.0, 0.0, 1.0], [0.0, 0.0, 2.0]];

        let eval = AdjointEvaluator::new(&sources, &sensors, &layout);
        assert!(matches!(
            eval.evaluate(&SequentialBackend::new(), &[1.0]),
            Err(OperatorError::ShapeMismatch { expected: 2, actual: 1, .. })
        ));
        assert!(matches!(
            eval.evaluate(&SequentialBackend::new(), &[1.0, 1.0, 1.0]),
            Err(OperatorError::ShapeMismatch { expected: 2, actual: 3, .. })
        ));
    }
}
