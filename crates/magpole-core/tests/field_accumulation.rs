//! Synthetic Bz maps must be exactly what the operator predicts.

use std::sync::Arc;

use approx::assert_relative_eq;
use magpole_compute::CpuBackend;
use magpole_core::{
    ExecutionBackend, ExpansionLimit, FieldAccumulator, LinearOperator, MultipoleOperator,
    MultipoleSources, OperatorError, ScanGrid,
};
use ndarray::Array2;

fn sources_with_all_orders() -> MultipoleSources {
    let positions = vec![
        [2.0e-6, 2.0e-6, -1.0e-6],
        [4.5e-6, 3.0e-6, -1.8e-6],
        [3.0e-6, 5.5e-6, -1.3e-6],
    ];
    let n = positions.len();
    let cell = |j: usize, k: usize, scale: f64| (((j * 31 + k * 17) % 13) as f64 - 6.0) * scale;

    MultipoleSources::new(positions, Array2::from_shape_fn((n, 3), |(j, k)| cell(j, k, 1e-14)))
        .unwrap()
        .with_quadrupoles(Array2::from_shape_fn((n, 5), |(j, k)| cell(j, k + 3, 1e-20)))
        .unwrap()
        .with_octupoles(Array2::from_shape_fn((n, 7), |(j, k)| cell(j, k + 8, 1e-26)))
        .unwrap()
}

fn grid() -> ScanGrid {
    ScanGrid::new(0.6e-6, [8e-6, 8e-6], [0.5e-6, 0.5e-6])
}

#[test]
fn test_accumulator_equals_operator_forward() {
    let sources = sources_with_all_orders();
    let sensors = grid().sensor_positions().unwrap();
    let acc = FieldAccumulator::sequential();

    for limit in [
        ExpansionLimit::Dipole,
        ExpansionLimit::Quadrupole,
        ExpansionLimit::Octupole,
    ] {
        let op = MultipoleOperator::new(
            sensors.len(),
            sources.len(),
            limit,
            sources.positions().to_vec(),
            sensors.clone(),
            ExecutionBackend::Sequential,
        )
        .unwrap();

        let predicted = op.apply_forward(&sources.moment_vector(limit).unwrap()).unwrap();
        let synthetic = acc.bz_at(&sources, &sensors, limit).unwrap();
        assert_eq!(predicted, synthetic, "{} map differs from operator", limit);
    }
}

#[test]
fn test_missing_orders_contribute_nothing() {
    let full = sources_with_all_orders();
    let dipole_only = MultipoleSources::new(
        full.positions().to_vec(),
        full.per_particle(ExpansionLimit::Dipole),
    )
    .unwrap();
    let sensors = grid().sensor_positions().unwrap();
    let acc = FieldAccumulator::sequential();

    let a = acc.bz_at(&dipole_only, &sensors, ExpansionLimit::Octupole).unwrap();
    let b = acc.bz_at(&full, &sensors, ExpansionLimit::Dipole).unwrap();
    for i in 0..a.len() {
        assert_relative_eq!(a[i], b[i], max_relative = 1e-12, epsilon = 1e-25);
    }
}

#[test]
fn test_higher_orders_change_the_map() {
    let sources = sources_with_all_orders();
    let acc = FieldAccumulator::sequential();
    let dip = acc.bz_grid(&sources, &grid(), ExpansionLimit::Dipole).unwrap();
    let oct = acc.bz_grid(&sources, &grid(), ExpansionLimit::Octupole).unwrap();
    assert_eq!(dip.dim(), (16, 16));
    let max_diff = (&oct - &dip).iter().fold(0.0_f64, |m, v| m.max(v.abs()));
    eprintln!("max |Bz_oct - Bz_dip| = {:.3e} T", max_diff);
    assert!(max_diff > 0.0);
}

#[test]
fn test_parallel_accumulator_matches_sequential() {
    let sources = sources_with_all_orders();
    let seq = FieldAccumulator::sequential();
    let par = FieldAccumulator::new(Arc::new(CpuBackend::new()));
    assert_eq!(
        seq.bz_grid(&sources, &grid(), ExpansionLimit::Octupole).unwrap(),
        par.bz_grid(&sources, &grid(), ExpansionLimit::Octupole).unwrap()
    );
}

#[test]
fn test_sensor_on_a_source_is_rejected() {
    let sources = MultipoleSources::new(vec![[1e-6, 1e-6, 0.6e-6]], Array2::zeros((1, 3))).unwrap();
    let grid = grid();
    let err = FieldAccumulator::sequential()
        .bz_grid(&sources, &grid, ExpansionLimit::Dipole)
        .unwrap_err();
    // (1e-6, 1e-6) is sensor (row 2, column 2) of the 16 × 16 raster.
    assert!(matches!(
        err,
        OperatorError::DegenerateGeometry { sensor: 34, particle: 0 }
    ));
}
