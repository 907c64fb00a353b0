//! Closed-form Bz basis functions of point multipoles.
//!
//! For a source at $\mathbf{r}'$ and a sensor at $\mathbf{r}$, the vertical
//! field of a multipole of order $\ell$ is linear in its moment components:
//!
//! $$
//! B_z(\mathbf{r}) = \sum_k c_k(\mathbf{r} - \mathbf{r}')\, m_k
//! $$
//!
//! with $c_k$ homogeneous of degree $-(\ell + 2)$ in the displacement. This
//! module provides the coefficients $c_k$ for the dipole ($\ell = 1$, 3
//! components), quadrupole ($\ell = 2$, 5 components) and octupole
//! ($\ell = 3$, 7 components).
//!
//! Every evaluator in the crate goes through [`bz_coefficients`], so the
//! forward map, the adjoint and the synthetic-field accumulator can never
//! disagree on a formula.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{MultipoleOrder, MU0_REDUCED};

/// Largest number of components of any supported order (octupole).
pub const MAX_COMPONENTS: usize = 7;

/// Normalisation convention of the quadrupole and octupole moments.
///
/// The coefficients of the higher orders depend on how the moment basis is
/// normalised. `V1` freezes the formulas implemented here; a different basis
/// must be introduced as a new variant, never as an edit of `V1`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BasisConvention {
    #[default]
    V1,
}

impl fmt::Display for BasisConvention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BasisConvention::V1 => f.write_str("v1"),
        }
    }
}

/// Displacement `sensor - source`.
#[inline]
pub fn displacement(sensor: &[f64; 3], source: &[f64; 3]) -> [f64; 3] {
    [
        sensor[0] - source[0],
        sensor[1] - source[1],
        sensor[2] - source[2],
    ]
}

/// Dipole Bz coefficients `[c_x, c_y, c_z]`.
///
/// $c = \frac{\mu_0}{4\pi r^5}\,(3xz,\; 3yz,\; 3z^2 - r^2)$
///
/// # Arguments
/// * `d` - Displacement sensor − source (m). Must be non-zero.
#[inline]
pub fn dipole_bz(d: &[f64; 3]) -> [f64; 3] {
    let [x, y, z] = *d;
    let r2 = x * x + y * y + z * z;
    let r = r2.sqrt();
    let f = MU0_REDUCED / (r2 * r2 * r);

    [f * 3.0 * x * z, f * 3.0 * y * z, f * (3.0 * z * z - r2)]
}

/// Quadrupole Bz coefficients (5 components), prefactor $\mu_0 / 4\pi r^7$.
///
/// # Arguments
/// * `d` - Displacement sensor − source (m). Must be non-zero.
#[inline]
pub fn quadrupole_bz(d: &[f64; 3]) -> [f64; 5] {
    let [x, y, z] = *d;
    let (x2, y2, z2) = (x * x, y * y, z * z);
    let r2 = x2 + y2 + z2;
    let r = r2.sqrt();
    let g = MU0_REDUCED / (r2 * r2 * r2 * r);
    let sqrt2 = 2.0_f64.sqrt();

    [
        g * 1.5_f64.sqrt() * z * (5.0 * z2 - 3.0 * r2),
        -g * sqrt2 * x * (r2 - 5.0 * z2),
        -g * sqrt2 * y * (r2 - 5.0 * z2),
        g * (5.0 / sqrt2) * (x2 - y2) * z,
        g * 5.0 * sqrt2 * x * y * z,
    ]
}

/// Octupole Bz coefficients (7 components), prefactor $\mu_0 / 4\pi r^9$.
///
/// # Arguments
/// * `d` - Displacement sensor − source (m). Must be non-zero.
#[inline]
pub fn octupole_bz(d: &[f64; 3]) -> [f64; 7] {
    let [x, y, z] = *d;
    let (x2, y2, z2) = (x * x, y * y, z * z);
    let r2 = x2 + y2 + z2;
    let r = r2.sqrt();
    let r4 = r2 * r2;
    let h = MU0_REDUCED / (r4 * r4 * r);
    let sqrt15 = 15.0_f64.sqrt();

    [
        h * (3.0 * r4 - 30.0 * r2 * z2 + 35.0 * z2 * z2) / 10.0_f64.sqrt(),
        h * sqrt15 * x * z * (7.0 * z2 - 3.0 * r2) / 2.0,
        h * sqrt15 * y * z * (7.0 * z2 - 3.0 * r2) / 2.0,
        -h * 1.5_f64.sqrt() * (x2 - y2) * (r2 - 7.0 * z2),
        -h * 6.0_f64.sqrt() * x * y * (r2 - 7.0 * z2),
        h * 7.0 * x * (x2 - 3.0 * y2) * z / 2.0,
        -h * 7.0 * y * (y2 - 3.0 * x2) * z / 2.0,
    ]
}

/// Write the coefficients of `order` at displacement `d` into `out`.
///
/// Returns the number of components written (`order.components()`); the
/// remaining entries of `out` are left untouched. Uses a stack buffer so the
/// inner loops of the evaluators never allocate.
#[inline]
pub fn bz_coefficients(order: MultipoleOrder, d: &[f64; 3], out: &mut [f64; MAX_COMPONENTS]) -> usize {
    match order {
        MultipoleOrder::Dipole => out[..3].copy_from_slice(&dipole_bz(d)),
        MultipoleOrder::Quadrupole => out[..5].copy_from_slice(&quadrupole_bz(d)),
        MultipoleOrder::Octupole => out.copy_from_slice(&octupole_bz(d)),
    }
    order.components()
}

/// Full magnetic flux density of a point dipole.
///
/// $\mathbf{B} = \frac{\mu_0}{4\pi}\left(\frac{3(\mathbf{m}\cdot\mathbf{r})\mathbf{r}}{r^5} - \frac{\mathbf{m}}{r^3}\right)$
///
/// The z component equals `dipole_bz(d) · m`.
///
/// # Arguments
/// * `source` - Dipole position (m).
/// * `moment` - Dipole moment (A·m²).
/// * `sensor` - Observation point (m). Must differ from `source`.
pub fn dipole_field(source: &[f64; 3], moment: &[f64; 3], sensor: &[f64; 3]) -> [f64; 3] {
    let d = displacement(sensor, source);
    let r2 = d[0] * d[0] + d[1] * d[1] + d[2] * d[2];
    let r = r2.sqrt();
    let m_dot_r = moment[0] * d[0] + moment[1] * d[1] + moment[2] * d[2];
    let a = 3.0 * MU0_REDUCED * m_dot_r / (r2 * r2 * r);
    let b = MU0_REDUCED / (r2 * r);

    [
        a * d[0] - b * moment[0],
        a * d[1] - b * moment[1],
        a * d[2] - b * moment[2],
    ]
}
