//! Matrix-free multipole operator.
//!
//! [`MultipoleOperator`] maps a component-major moment vector to Bz at every
//! sensor ([`apply_forward`](LinearOperator::apply_forward)) and a Bz residual
//! back to a moment gradient ([`apply_adjoint`](LinearOperator::apply_adjoint)),
//! without ever materialising the `N_sensors × N_particles·n_cols` matrix.
//!
//! Iterative least-squares solvers consume the operator through the
//! [`LinearOperator`] trait and must only ever call those two maps.

pub mod adjoint;
pub mod forward;

pub use adjoint::AdjointEvaluator;
pub use forward::ForwardEvaluator;

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use magpole_compute::{
    ComputeBackend, ComputeError, DeviceInfo, KernelDirection, KernelGeometry, SequentialBackend,
};
use ndarray::Array1;
use thiserror::Error;

use crate::basis::{displacement, BasisConvention};
use crate::layout::MultipoleLayout;
use crate::types::{ExecutionBackend, ExpansionLimit, MU0_REDUCED};

/// Errors raised while building or applying the operator.
#[derive(Debug, Error)]
pub enum OperatorError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Shape mismatch for {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Degenerate geometry: sensor {sensor} coincides with particle {particle}")]
    DegenerateGeometry { sensor: usize, particle: usize },

    #[error("Compute backend error: {0}")]
    Backend(#[from] ComputeError),
}

/// A linear map exposed only through its action and the action of its
/// transpose.
///
/// Implementors are *not explicit*: solvers must not try to assemble a dense
/// matrix from them.
pub trait LinearOperator: Send + Sync {
    /// `(rows, cols)` = `(N_sensors, N_particles · n_cols)`.
    fn shape(&self) -> (usize, usize);

    /// Whether a dense matrix is stored. Always `false` for matrix-free
    /// operators.
    fn is_explicit(&self) -> bool {
        false
    }

    /// y = A x
    fn apply_forward(&self, x: &Array1<f64>) -> Result<Array1<f64>, OperatorError>;

    /// x = Aᵀ y
    fn apply_adjoint(&self, y: &Array1<f64>) -> Result<Array1<f64>, OperatorError>;
}

/// Resolve an execution-backend selector into a compute backend.
///
/// Called once per operator; the result is shared by every subsequent call.
pub fn resolve_backend(selector: ExecutionBackend) -> Result<Arc<dyn ComputeBackend>, OperatorError> {
    let backend: Arc<dyn ComputeBackend> = match selector {
        ExecutionBackend::Sequential => Arc::new(SequentialBackend::new()),

        #[cfg(feature = "cpu")]
        ExecutionBackend::DataParallelCpu => Arc::new(magpole_compute::CpuBackend::new()),
        #[cfg(not(feature = "cpu"))]
        ExecutionBackend::DataParallelCpu => {
            return Err(OperatorError::InvalidConfiguration(
                "CPU backend requested but magpole was built without the `cpu` feature".into(),
            ))
        }

        #[cfg(feature = "gpu")]
        ExecutionBackend::DataParallelGpu => Arc::new(magpole_compute::GpuBackend::new_blocking()?),
        #[cfg(not(feature = "gpu"))]
        ExecutionBackend::DataParallelGpu => {
            return Err(OperatorError::InvalidConfiguration(
                "GPU backend requested but magpole was built without the `gpu` feature".into(),
            ))
        }
    };

    log::debug!("Resolved {} backend: {}", selector, backend.device_info().name);
    Ok(backend)
}

/// Check declared counts, finiteness and sensor/source separation.
///
/// Runs once before any evaluation so the hot loops never see r = 0.
pub(crate) fn validate_geometry(
    n_sensors: usize,
    n_particles: usize,
    sources: &[[f64; 3]],
    sensors: &[[f64; 3]],
) -> Result<(), OperatorError> {
    if sources.len() != n_particles {
        return Err(OperatorError::InvalidConfiguration(format!(
            "Expected {} source positions, got {}",
            n_particles,
            sources.len()
        )));
    }
    if sensors.len() != n_sensors {
        return Err(OperatorError::InvalidConfiguration(format!(
            "Expected {} sensor positions, got {}",
            n_sensors,
            sensors.len()
        )));
    }

    let non_finite = |points: &[[f64; 3]]| points.iter().position(|p| p.iter().any(|v| !v.is_finite()));
    if let Some(j) = non_finite(sources) {
        return Err(OperatorError::InvalidConfiguration(format!(
            "Source position {} is not finite: {:?}",
            j, sources[j]
        )));
    }
    if let Some(i) = non_finite(sensors) {
        return Err(OperatorError::InvalidConfiguration(format!(
            "Sensor position {} is not finite: {:?}",
            i, sensors[i]
        )));
    }

    for (i, sensor) in sensors.iter().enumerate() {
        for (j, source) in sources.iter().enumerate() {
            let d = displacement(sensor, source);
            if d[0] * d[0] + d[1] * d[1] + d[2] * d[2] == 0.0 {
                return Err(OperatorError::DegenerateGeometry {
                    sensor: i,
                    particle: j,
                });
            }
        }
    }

    Ok(())
}

/// Borrow a contiguous view of `v`, copying only if it is strided.
pub(crate) fn contiguous(v: &Array1<f64>) -> Cow<'_, [f64]> {
    match v.as_slice() {
        Some(slice) => Cow::Borrowed(slice),
        None => Cow::Owned(v.to_vec()),
    }
}

/// Matrix-free Bz operator for point multipoles on a planar scan.
///
/// Immutable after construction: positions, layout and the resolved backend
/// are shared read-only by every call, so one operator may be used from many
/// threads at once.
pub struct MultipoleOperator {
    sources: Vec<[f64; 3]>,
    sensors: Vec<[f64; 3]>,
    layout: MultipoleLayout,
    convention: BasisConvention,
    backend: Arc<dyn ComputeBackend>,
}

impl MultipoleOperator {
    /// Build an operator and resolve `backend` into a compute backend.
    ///
    /// # Arguments
    /// * `n_sensors` - Number of sensors; must equal `sensors.len()`.
    /// * `n_particles` - Number of sources; must equal `sources.len()`.
    /// * `limit` - Highest multipole order of the model.
    /// * `sources` - Source positions (m).
    /// * `sensors` - Sensor positions (m), typically a flattened scan grid.
    /// * `backend` - Where to evaluate the forward and adjoint maps.
    pub fn new(
        n_sensors: usize,
        n_particles: usize,
        limit: ExpansionLimit,
        sources: Vec<[f64; 3]>,
        sensors: Vec<[f64; 3]>,
        backend: ExecutionBackend,
    ) -> Result<Self, OperatorError> {
        validate_geometry(n_sensors, n_particles, &sources, &sensors)?;
        let backend = resolve_backend(backend)?;
        Ok(Self::assemble(limit, sources, sensors, backend))
    }

    /// Build an operator on an already constructed compute backend.
    pub fn with_compute_backend(
        n_sensors: usize,
        n_particles: usize,
        limit: ExpansionLimit,
        sources: Vec<[f64; 3]>,
        sensors: Vec<[f64; 3]>,
        backend: Arc<dyn ComputeBackend>,
    ) -> Result<Self, OperatorError> {
        validate_geometry(n_sensors, n_particles, &sources, &sensors)?;
        Ok(Self::assemble(limit, sources, sensors, backend))
    }

    fn assemble(
        limit: ExpansionLimit,
        sources: Vec<[f64; 3]>,
        sensors: Vec<[f64; 3]>,
        backend: Arc<dyn ComputeBackend>,
    ) -> Self {
        let layout = MultipoleLayout::new(limit);
        log::debug!(
            "Multipole operator: {} sensors x {} particles, {} expansion ({} cols), basis {}, on {}",
            sensors.len(),
            sources.len(),
            limit,
            layout.n_cols(),
            BasisConvention::V1,
            backend.device_info().name
        );
        Self {
            sources,
            sensors,
            layout,
            convention: BasisConvention::V1,
            backend,
        }
    }

    pub fn n_sensors(&self) -> usize {
        self.sensors.len()
    }

    pub fn n_particles(&self) -> usize {
        self.sources.len()
    }

    pub fn layout(&self) -> &MultipoleLayout {
        &self.layout
    }

    pub fn expansion_limit(&self) -> ExpansionLimit {
        self.layout.expansion_limit()
    }

    pub fn basis_convention(&self) -> BasisConvention {
        self.convention
    }

    pub fn sources(&self) -> &[[f64; 3]] {
        &self.sources
    }

    pub fn sensors(&self) -> &[[f64; 3]] {
        &self.sensors
    }

    pub fn device_info(&self) -> DeviceInfo {
        self.backend.device_info()
    }

    fn kernel_geometry(&self) -> KernelGeometry<'_> {
        KernelGeometry {
            sources: &self.sources,
            sensors: &self.sensors,
            orders: self.layout.expansion_limit().num_orders(),
            mu0_reduced: MU0_REDUCED,
        }
    }

    fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<(), OperatorError> {
        if expected != actual {
            return Err(OperatorError::ShapeMismatch {
                what,
                expected,
                actual,
            });
        }
        Ok(())
    }
}

impl LinearOperator for MultipoleOperator {
    fn shape(&self) -> (usize, usize) {
        (self.n_sensors(), self.layout.moment_len(self.n_particles()))
    }

    fn apply_forward(&self, moments: &Array1<f64>) -> Result<Array1<f64>, OperatorError> {
        Self::check_len("moment vector", self.layout.moment_len(self.n_particles()), moments.len())?;
        let moments = contiguous(moments);

        if self.backend.offloads_multipole_kernel() {
            let bz = self
                .backend
                .multipole_kernel(&self.kernel_geometry(), KernelDirection::Forward, &moments)?;
            return Ok(Array1::from_vec(bz));
        }

        ForwardEvaluator::new(&self.sources, &self.sensors, &self.layout)
            .evaluate(self.backend.as_ref(), &moments)
    }

    fn apply_adjoint(&self, data: &Array1<f64>) -> Result<Array1<f64>, OperatorError> {
        Self::check_len("data vector", self.n_sensors(), data.len())?;
        let data = contiguous(data);

        if self.backend.offloads_multipole_kernel() {
            let gradient = self
                .backend
                .multipole_kernel(&self.kernel_geometry(), KernelDirection::Adjoint, &data)?;
            return Ok(Array1::from_vec(gradient));
        }

        AdjointEvaluator::new(&self.sources, &self.sensors, &self.layout)
            .evaluate(self.backend.as_ref(), &data)
    }
}

impl fmt::Debug for MultipoleOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultipoleOperator")
            .field("shape", &self.shape())
            .field("expansion_limit", &self.expansion_limit())
            .field("basis_convention", &self.convention)
            .field("backend", &self.backend.device_info().name)
            .finish()
    }
}
