//! Core types shared across the magpole crates.
//!
//! This module defines the small vocabulary of the operator: multipole
//! orders, the expansion limit, the execution-backend selector and the set of
//! point sources with their moments.

use std::fmt;
use std::str::FromStr;

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::layout::MultipoleLayout;
use crate::operator::OperatorError;

/// Reduced vacuum permeability $\mu_0 / 4\pi$ in T·m/A.
pub const MU0_REDUCED: f64 = 1e-7;

/// One order of the multipole expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MultipoleOrder {
    Dipole,
    Quadrupole,
    Octupole,
}

impl MultipoleOrder {
    /// All orders, lowest first.
    pub const ALL: [MultipoleOrder; 3] = [
        MultipoleOrder::Dipole,
        MultipoleOrder::Quadrupole,
        MultipoleOrder::Octupole,
    ];

    /// Number of independent moment components of this order.
    pub fn components(self) -> usize {
        match self {
            MultipoleOrder::Dipole => 3,
            MultipoleOrder::Quadrupole => 5,
            MultipoleOrder::Octupole => 7,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MultipoleOrder::Dipole => "dipole",
            MultipoleOrder::Quadrupole => "quadrupole",
            MultipoleOrder::Octupole => "octupole",
        }
    }
}

impl fmt::Display for MultipoleOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Highest multipole order included in the model.
///
/// The number of moment components per particle (`n_cols`) is 3, 8 or 15.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpansionLimit {
    Dipole,
    Quadrupole,
    Octupole,
}

impl ExpansionLimit {
    /// Number of active orders (1 = dipole only, 3 = up to octupole).
    pub fn num_orders(self) -> usize {
        match self {
            ExpansionLimit::Dipole => 1,
            ExpansionLimit::Quadrupole => 2,
            ExpansionLimit::Octupole => 3,
        }
    }

    /// Active orders, lowest first.
    pub fn orders(self) -> &'static [MultipoleOrder] {
        &MultipoleOrder::ALL[..self.num_orders()]
    }

    /// Moment components per particle.
    pub fn n_cols(self) -> usize {
        self.orders().iter().map(|o| o.components()).sum()
    }

    pub fn highest_order(self) -> MultipoleOrder {
        MultipoleOrder::ALL[self.num_orders() - 1]
    }

    /// Whether `order` is part of this expansion.
    pub fn includes(self, order: MultipoleOrder) -> bool {
        order <= self.highest_order()
    }

    pub fn name(self) -> &'static str {
        self.highest_order().name()
    }
}

impl From<MultipoleOrder> for ExpansionLimit {
    fn from(order: MultipoleOrder) -> Self {
        match order {
            MultipoleOrder::Dipole => ExpansionLimit::Dipole,
            MultipoleOrder::Quadrupole => ExpansionLimit::Quadrupole,
            MultipoleOrder::Octupole => ExpansionLimit::Octupole,
        }
    }
}

impl fmt::Display for ExpansionLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ExpansionLimit {
    type Err = OperatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dipole" => Ok(ExpansionLimit::Dipole),
            "quadrupole" => Ok(ExpansionLimit::Quadrupole),
            "octupole" => Ok(ExpansionLimit::Octupole),
            other => Err(OperatorError::InvalidConfiguration(format!(
                "Unknown expansion limit '{}' (expected dipole, quadrupole or octupole)",
                other
            ))),
        }
    }
}

impl TryFrom<u8> for ExpansionLimit {
    type Error = OperatorError;

    /// Parse from the number of orders (1..=3).
    fn try_from(num_orders: u8) -> Result<Self, Self::Error> {
        match num_orders {
            1 => Ok(ExpansionLimit::Dipole),
            2 => Ok(ExpansionLimit::Quadrupole),
            3 => Ok(ExpansionLimit::Octupole),
            n => Err(OperatorError::InvalidConfiguration(format!(
                "Expansion must include 1 to 3 orders, got {}",
                n
            ))),
        }
    }
}

/// Where the forward and adjoint maps are evaluated.
///
/// Resolved once into a compute backend when the operator is built; every
/// variant computes the same mathematical map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionBackend {
    #[serde(rename = "sequential")]
    Sequential,
    #[serde(rename = "cpu")]
    DataParallelCpu,
    #[serde(rename = "gpu")]
    DataParallelGpu,
}

impl ExecutionBackend {
    pub const ALL: [ExecutionBackend; 3] = [
        ExecutionBackend::Sequential,
        ExecutionBackend::DataParallelCpu,
        ExecutionBackend::DataParallelGpu,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ExecutionBackend::Sequential => "sequential",
            ExecutionBackend::DataParallelCpu => "cpu",
            ExecutionBackend::DataParallelGpu => "gpu",
        }
    }
}

impl fmt::Display for ExecutionBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ExecutionBackend {
    type Err = OperatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(ExecutionBackend::Sequential),
            "cpu" => Ok(ExecutionBackend::DataParallelCpu),
            "gpu" => Ok(ExecutionBackend::DataParallelGpu),
            other => Err(OperatorError::InvalidConfiguration(format!(
                "Unknown backend '{}' (expected sequential, cpu or gpu)",
                other
            ))),
        }
    }
}

/// A set of point sources and their multipole moments.
///
/// Moments are stored per particle: row `j` of each array belongs to
/// `positions[j]`. Quadrupole and octupole moments are optional; a missing
/// order contributes nothing to the field.
#[derive(Debug, Clone)]
pub struct MultipoleSources {
    positions: Vec<[f64; 3]>,
    /// Dipole moments, shape (N, 3), A·m².
    dipoles: Array2<f64>,
    /// Quadrupole moments, shape (N, 5).
    quadrupoles: Option<Array2<f64>>,
    /// Octupole moments, shape (N, 7).
    octupoles: Option<Array2<f64>>,
}

impl MultipoleSources {
    /// Create a source set with dipole moments only.
    pub fn new(positions: Vec<[f64; 3]>, dipoles: Array2<f64>) -> Result<Self, OperatorError> {
        check_moment_shape("dipole moments", &dipoles, positions.len(), 3)?;
        Ok(Self {
            positions,
            dipoles,
            quadrupoles: None,
            octupoles: None,
        })
    }

    /// Attach quadrupole moments, shape (N, 5).
    pub fn with_quadrupoles(mut self, quadrupoles: Array2<f64>) -> Result<Self, OperatorError> {
        check_moment_shape("quadrupole moments", &quadrupoles, self.len(), 5)?;
        self.quadrupoles = Some(quadrupoles);
        Ok(self)
    }

    /// Attach octupole moments, shape (N, 7).
    pub fn with_octupoles(mut self, octupoles: Array2<f64>) -> Result<Self, OperatorError> {
        check_moment_shape("octupole moments", &octupoles, self.len(), 7)?;
        self.octupoles = Some(octupoles);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn positions(&self) -> &[[f64; 3]] {
        &self.positions
    }

    /// Per-particle moments of one order, if present.
    pub fn moments(&self, order: MultipoleOrder) -> Option<&Array2<f64>> {
        match order {
            MultipoleOrder::Dipole => Some(&self.dipoles),
            MultipoleOrder::Quadrupole => self.quadrupoles.as_ref(),
            MultipoleOrder::Octupole => self.octupoles.as_ref(),
        }
    }

    /// Highest order with moments attached.
    pub fn max_order(&self) -> ExpansionLimit {
        if self.octupoles.is_some() {
            ExpansionLimit::Octupole
        } else if self.quadrupoles.is_some() {
            ExpansionLimit::Quadrupole
        } else {
            ExpansionLimit::Dipole
        }
    }

    /// Per-particle moment table `(N, n_cols)` for `limit`.
    ///
    /// Orders above `limit` are dropped; orders within it but absent from
    /// the set are zero.
    pub fn per_particle(&self, limit: ExpansionLimit) -> Array2<f64> {
        let layout = MultipoleLayout::new(limit);
        let mut table = Array2::zeros((self.len(), layout.n_cols()));
        for block in layout.blocks() {
            if let Some(moments) = self.moments(block.order) {
                table
                    .slice_mut(ndarray::s![.., block.columns()])
                    .assign(moments);
            }
        }
        table
    }

    /// Component-major moment vector for `limit`.
    pub fn moment_vector(&self, limit: ExpansionLimit) -> Result<Array1<f64>, OperatorError> {
        MultipoleLayout::new(limit).to_component_major(self.per_particle(limit).view())
    }
}

fn check_moment_shape(
    what: &'static str,
    moments: &Array2<f64>,
    rows: usize,
    cols: usize,
) -> Result<(), OperatorError> {
    let (r, c) = moments.dim();
    if c != cols {
        return Err(OperatorError::ShapeMismatch {
            what,
            expected: cols,
            actual: c,
        });
    }
    if r != rows {
        return Err(OperatorError::ShapeMismatch {
            what,
            expected: rows,
            actual: r,
        });
    }
    Ok(())
}
