//! Compute backend trait and device abstraction.
//!
//! The [`ComputeBackend`] trait abstracts over execution environments
//! (sequential, multi-threaded CPU, GPU) so that the multipole operator in
//! `magpole-core` stays device-agnostic.
//!
//! Every backend works on the same unit of work: one *row* of output owned by
//! exactly one element of the outer axis (a sensor for the forward map, a
//! source for the adjoint). Rows never share output cells, so a backend is
//! free to schedule them in any order without changing a single bit of the
//! result.

use thiserror::Error;

/// Errors originating from compute backends.
#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("Backend not available: {0}")]
    Unavailable(String),

    #[error("Device error: {0}")]
    DeviceError(String),

    #[error("Out of memory: requested {requested} bytes, available {available}")]
    OutOfMemory { requested: usize, available: usize },
}

/// Describes the capabilities of a compute backend.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub backend_type: BackendType,
    pub memory_bytes: Option<usize>,
    pub compute_units: Option<usize>,
}

/// The type of compute backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    Sequential,
    Cpu,
    Gpu,
}

/// Which side of the multipole operator a device kernel evaluates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelDirection {
    /// Moments (component-major) to Bz per sensor.
    Forward,
    /// Bz residual per sensor to moment gradient (component-major).
    Adjoint,
}

/// Geometry handed to a device-resident multipole kernel.
///
/// `orders` is the number of active multipole orders, starting from the
/// dipole (1 = dipole, 2 = up to quadrupole, 3 = up to octupole). The moment
/// vector exchanged with the kernel uses the component-major layout with
/// `n_cols = orders * (orders + 2)` components per source.
#[derive(Debug, Clone, Copy)]
pub struct KernelGeometry<'a> {
    pub sources: &'a [[f64; 3]],
    pub sensors: &'a [[f64; 3]],
    pub orders: usize,
    /// Reduced vacuum permeability $\mu_0 / 4\pi$ (T m / A).
    pub mu0_reduced: f64,
}

impl KernelGeometry<'_> {
    /// Number of moment components per source.
    pub fn n_cols(&self) -> usize {
        self.orders * (self.orders + 2)
    }

    /// Length of the input vector expected for `direction`.
    pub fn input_len(&self, direction: KernelDirection) -> usize {
        match direction {
            KernelDirection::Forward => self.sources.len() * self.n_cols(),
            KernelDirection::Adjoint => self.sensors.len(),
        }
    }

    /// Length of the output vector produced for `direction`.
    pub fn output_len(&self, direction: KernelDirection) -> usize {
        match direction {
            KernelDirection::Forward => self.sensors.len(),
            KernelDirection::Adjoint => self.sources.len() * self.n_cols(),
        }
    }
}

/// Abstraction over compute backends.
///
/// The multipole evaluators operate against this trait. Implementations only
/// decide *where* rows run; the arithmetic inside a row is supplied by the
/// caller and is identical on every backend.
pub trait ComputeBackend: Send + Sync {
    /// Return information about the device.
    fn device_info(&self) -> DeviceInfo;

    /// Fill a `rows × width` row-major buffer, one row per call of `row_fn`.
    ///
    /// `row_fn(row, out)` receives a zeroed slice of length `width` and must
    /// only write to it. This is the entry point for both the forward map
    /// (one row per sensor, `width = 1`) and the adjoint (one row per source,
    /// `width = n_cols`).
    fn parallel_rows(
        &self,
        rows: usize,
        width: usize,
        row_fn: &(dyn Fn(usize, &mut [f64]) + Send + Sync),
    ) -> Result<Vec<f64>, ComputeError>;

    /// Whether this backend evaluates the multipole kernel on its own device
    /// instead of running host closures through [`parallel_rows`](Self::parallel_rows).
    fn offloads_multipole_kernel(&self) -> bool {
        false
    }

    /// Evaluate the multipole operator in `direction` on the device.
    fn multipole_kernel(
        &self,
        geometry: &KernelGeometry<'_>,
        direction: KernelDirection,
        input: &[f64],
    ) -> Result<Vec<f64>, ComputeError> {
        // Default: not supported. Device backends override this.
        let _ = (geometry, direction, input);
        Err(ComputeError::Unavailable(
            "Multipole kernel not implemented for this backend".into(),
        ))
    }
}

/// Check that a row buffer request fits in addressable memory.
pub(crate) fn row_buffer_len(rows: usize, width: usize) -> Result<usize, ComputeError> {
    rows.checked_mul(width)
        .filter(|len| len.checked_mul(std::mem::size_of::<f64>()).is_some())
        .ok_or(ComputeError::OutOfMemory {
            requested: usize::MAX,
            available: isize::MAX as usize,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_geometry_column_counts() {
        let sources = [[0.0; 3]; 4];
        let sensors = [[0.0, 0.0, 1.0]; 6];
        for (orders, n_cols) in [(1, 3), (2, 8), (3, 15)] {
            let geometry = KernelGeometry {
                sources: &sources,
                sensors: &sensors,
                orders,
                mu0_reduced: 1e-7,
            };
            assert_eq!(geometry.n_cols(), n_cols);
            assert_eq!(geometry.input_len(KernelDirection::Forward), 4 * n_cols);
            assert_eq!(geometry.output_len(KernelDirection::Forward), 6);
            assert_eq!(geometry.input_len(KernelDirection::Adjoint), 6);
            assert_eq!(geometry.output_len(KernelDirection::Adjoint), 4 * n_cols);
        }
    }

    #[test]
    fn test_row_buffer_overflow_is_reported() {
        assert_eq!(row_buffer_len(4, 15).unwrap(), 60);
        assert!(matches!(
            row_buffer_len(usize::MAX, 2),
            Err(ComputeError::OutOfMemory { .. })
        ));
    }
}
