//! Column layout of the moment vector.
//!
//! A moment vector for `N` particles and expansion limit `L` has
//! `N × n_cols(L)` entries stored **component-major**: all particles'
//! component 0, then all particles' component 1, and so on. Component `c` of
//! particle `j` lives at `c·N + j`.
//!
//! Components are grouped by order into contiguous blocks:
//!
//! | Order      | Columns   |
//! |------------|-----------|
//! | dipole     | `[0, 3)`  |
//! | quadrupole | `[3, 8)`  |
//! | octupole   | `[8, 15)` |

use std::ops::Range;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

use crate::operator::OperatorError;
use crate::types::{ExpansionLimit, MultipoleOrder};

/// One order's slice of the moment columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderBlock {
    pub order: MultipoleOrder,
    /// First column of the block.
    pub offset: usize,
    pub components: usize,
}

impl OrderBlock {
    pub fn columns(&self) -> Range<usize> {
        self.offset..self.offset + self.components
    }
}

/// Order blocks of an expansion limit, built once and read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipoleLayout {
    limit: ExpansionLimit,
    blocks: Vec<OrderBlock>,
    n_cols: usize,
}

impl MultipoleLayout {
    pub fn new(limit: ExpansionLimit) -> Self {
        let mut offset = 0;
        let blocks = limit
            .orders()
            .iter()
            .map(|&order| {
                let block = OrderBlock {
                    order,
                    offset,
                    components: order.components(),
                };
                offset += block.components;
                block
            })
            .collect();

        Self {
            limit,
            blocks,
            n_cols: offset,
        }
    }

    pub fn expansion_limit(&self) -> ExpansionLimit {
        self.limit
    }

    /// Active blocks, lowest order first.
    pub fn blocks(&self) -> &[OrderBlock] {
        &self.blocks
    }

    pub fn block(&self, order: MultipoleOrder) -> Option<&OrderBlock> {
        self.blocks.iter().find(|b| b.order == order)
    }

    /// Moment components per particle (3, 8 or 15).
    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    /// Length of a moment vector for `n_particles`.
    pub fn moment_len(&self, n_particles: usize) -> usize {
        self.n_cols * n_particles
    }

    /// Position of component `component` of particle `particle`.
    #[inline]
    pub fn index(&self, component: usize, particle: usize, n_particles: usize) -> usize {
        debug_assert!(component < self.n_cols && particle < n_particles);
        component * n_particles + particle
    }

    /// Convert a per-particle table `(N, n_cols)` into a component-major
    /// moment vector.
    pub fn to_component_major(&self, per_particle: ArrayView2<'_, f64>) -> Result<Array1<f64>, OperatorError> {
        let (_, cols) = per_particle.dim();
        if cols != self.n_cols {
            return Err(OperatorError::ShapeMismatch {
                what: "moment columns",
                expected: self.n_cols,
                actual: cols,
            });
        }
        // Iterating the transpose in logical order walks component by component.
        Ok(per_particle.t().iter().copied().collect())
    }

    /// Convert a component-major moment vector back into a per-particle
    /// table `(N, n_cols)`.
    pub fn from_component_major(
        &self,
        moments: ArrayView1<'_, f64>,
        n_particles: usize,
    ) -> Result<Array2<f64>, OperatorError> {
        let expected = self.moment_len(n_particles);
        if moments.len() != expected {
            return Err(OperatorError::ShapeMismatch {
                what: "moment vector",
                expected,
                actual: moments.len(),
            });
        }
        Ok(Array2::from_shape_fn((n_particles, self.n_cols), |(j, c)| {
            moments[self.index(c, j, n_particles)]
        }))
    }

    /// Scatter row-major per-particle rows (`N × n_cols` flat) into a
    /// component-major moment vector.
    pub(crate) fn scatter_rows(&self, rows: &[f64], n_particles: usize) -> Result<Array1<f64>, OperatorError> {
        let view = ArrayView2::from_shape((n_particles, self.n_cols), rows).map_err(|_| {
            OperatorError::ShapeMismatch {
                what: "per-particle rows",
                expected: self.moment_len(n_particles),
                actual: rows.len(),
            }
        })?;
        self.to_component_major(view)
    }
}
