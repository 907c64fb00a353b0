//! # Magpole Core
//!
//! Matrix-free forward and adjoint operator mapping point-source magnetic
//! multipole moments (dipole, quadrupole, octupole) to the vertical field Bz
//! measured on a planar scan grid. Iterative least-squares inversions call
//! only [`LinearOperator::apply_forward`](operator::LinearOperator::apply_forward)
//! and [`LinearOperator::apply_adjoint`](operator::LinearOperator::apply_adjoint);
//! the dense sensitivity matrix is never formed.
//!
//! ## Modules
//!
//! - [`types`]: Orders, expansion limit, backend selector, source sets.
//! - [`basis`]: Closed-form Bz coefficients shared by every evaluator.
//! - [`layout`]: Component-major moment layout and its named conversions.
//! - [`operator`]: [`MultipoleOperator`](operator::MultipoleOperator) and
//!   its forward/adjoint evaluators.
//! - [`fields`]: Scan grids and synthetic (optionally noisy) field maps.

pub mod basis;
pub mod fields;
pub mod layout;
pub mod operator;
pub mod types;

pub use basis::BasisConvention;
pub use fields::{add_gaussian_noise, FieldAccumulator, ScanGrid};
pub use layout::{MultipoleLayout, OrderBlock};
pub use operator::{LinearOperator, MultipoleOperator, OperatorError};
pub use types::{ExecutionBackend, ExpansionLimit, MultipoleOrder, MultipoleSources, MU0_REDUCED};
