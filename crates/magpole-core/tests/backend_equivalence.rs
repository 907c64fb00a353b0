//! Sequential, Rayon and (when built with `--features gpu`) wgpu backends
//! must produce the same forward and adjoint maps.
//!
//! Run the GPU comparison with:
//!   cargo test -p magpole-core --features gpu --release -- backend --nocapture

use std::sync::Arc;
use std::time::Instant;

use approx::assert_relative_eq;
use magpole_compute::{ComputeBackend, CpuBackend, SequentialBackend};
use magpole_core::{ExpansionLimit, LinearOperator, MultipoleOperator, ScanGrid};
use ndarray::Array1;

fn random_vector(len: usize, seed: usize) -> Array1<f64> {
    Array1::from_iter((0..len).map(|i| ((i * 229 + seed * 67 + 59) % 977) as f64 / 977.0 - 0.5))
}

/// Measure how long a closure takes and return (result, elapsed_ms).
fn timed<T>(f: impl FnOnce() -> T) -> (T, f64) {
    let start = Instant::now();
    let result = f();
    let elapsed = start.elapsed().as_secs_f64() * 1000.0;
    (result, elapsed)
}

fn build(
    sources: &[[f64; 3]],
    sensors: &[[f64; 3]],
    limit: ExpansionLimit,
    backend: Arc<dyn ComputeBackend>,
) -> MultipoleOperator {
    MultipoleOperator::with_compute_backend(
        sensors.len(),
        sources.len(),
        limit,
        sources.to_vec(),
        sensors.to_vec(),
        backend,
    )
    .unwrap()
}

fn assert_close(a: &Array1<f64>, b: &Array1<f64>, tol: f64) {
    assert_eq!(a.len(), b.len());
    let scale = a.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
    for (x, y) in a.iter().zip(b.iter()) {
        assert_relative_eq!(*x, *y, max_relative = tol, epsilon = tol * scale);
    }
}

#[test]
fn test_small_octupole_case_sequential_vs_cpu() {
    // 3 sources, 4 sensors, full octupole expansion.
    let sources = [[0.0, 0.0, -1e-6], [1.5e-6, 0.5e-6, -2e-6], [-1e-6, 2e-6, -1.5e-6]];
    let sensors = [
        [0.0, 0.0, 0.5e-6],
        [1e-6, 0.0, 0.5e-6],
        [0.0, 1e-6, 0.5e-6],
        [1e-6, 1e-6, 0.5e-6],
    ];

    let seq = build(&sources, &sensors, ExpansionLimit::Octupole, Arc::new(SequentialBackend::new()));
    let cpu = build(&sources, &sensors, ExpansionLimit::Octupole, Arc::new(CpuBackend::new()));

    let m = random_vector(45, 1);
    let d = random_vector(4, 2);

    // Rows are evaluated by the same scalar code, so results are bit-identical.
    assert_eq!(seq.apply_forward(&m).unwrap(), cpu.apply_forward(&m).unwrap());
    assert_eq!(seq.apply_adjoint(&d).unwrap(), cpu.apply_adjoint(&d).unwrap());
}

#[test]
fn test_dedicated_thread_pool_matches_sequential() {
    let sources: Vec<[f64; 3]> = (0..7)
        .map(|j| [j as f64 * 0.7e-6, (j % 3) as f64 * 0.9e-6, -1e-6 - j as f64 * 0.2e-6])
        .collect();
    let sensors = ScanGrid::new(0.4e-6, [5e-6, 3e-6], [0.5e-6, 0.5e-6])
        .sensor_positions()
        .unwrap();

    let seq = build(&sources, &sensors, ExpansionLimit::Quadrupole, Arc::new(SequentialBackend::new()));
    let pool = build(
        &sources,
        &sensors,
        ExpansionLimit::Quadrupole,
        Arc::new(CpuBackend::with_threads(3).unwrap()),
    );
    assert_eq!(pool.device_info().compute_units, Some(3));

    let m = random_vector(seq.shape().1, 3);
    let d = random_vector(seq.shape().0, 4);
    assert_eq!(seq.apply_forward(&m).unwrap(), pool.apply_forward(&m).unwrap());
    assert_eq!(seq.apply_adjoint(&d).unwrap(), pool.apply_adjoint(&d).unwrap());
}

/// Every quadrupole and octupole shader term against the Rust basis, one
/// isolated component at a time so a wrong constant names its column.
#[cfg(feature = "gpu")]
#[test]
fn test_gpu_octupole_columns_match_sequential() {
    let gpu: Arc<dyn ComputeBackend> = match magpole_compute::GpuBackend::new_blocking() {
        Ok(gpu) => Arc::new(gpu),
        Err(e) => {
            println!("Skipping: {}", e);
            return;
        }
    };

    let sources = [[0.3e-6, -0.2e-6, -1e-6], [1.1e-6, 0.7e-6, -1.8e-6]];
    let sensors = ScanGrid::new(0.5e-6, [3e-6, 2e-6], [0.5e-6, 0.5e-6])
        .sensor_positions()
        .unwrap();
    let seq = build(&sources, &sensors, ExpansionLimit::Octupole, Arc::new(SequentialBackend::new()));
    let dev = build(&sources, &sensors, ExpansionLimit::Octupole, gpu);

    let (rows, cols) = seq.shape();
    for col in 0..cols {
        let mut unit = Array1::zeros(cols);
        unit[col] = 1.0;
        assert_close(&dev.apply_forward(&unit).unwrap(), &seq.apply_forward(&unit).unwrap(), 1e-9);
    }

    let d = random_vector(rows, 5);
    assert_close(&dev.apply_adjoint(&d).unwrap(), &seq.apply_adjoint(&d).unwrap(), 1e-9);
}

#[test]
fn backend_timing_table() {
    let sources: Vec<[f64; 3]> = (0..40)
        .map(|j| {
            let t = j as f64;
            [
                (t * 0.37).sin() * 4e-6 + 5e-6,
                (t * 0.61).cos() * 4e-6 + 5e-6,
                -1e-6 - (j % 5) as f64 * 0.3e-6,
            ]
        })
        .collect();
    let sensors = ScanGrid::new(0.5e-6, [10e-6, 10e-6], [0.25e-6, 0.25e-6])
        .sensor_positions()
        .unwrap();

    let sequential: Arc<dyn ComputeBackend> = Arc::new(SequentialBackend::new());
    let cpu: Arc<dyn ComputeBackend> = Arc::new(CpuBackend::new());
    let mut backends = vec![("sequential", sequential), ("cpu", cpu)];

    #[cfg(feature = "gpu")]
    let gpu: Option<Arc<dyn ComputeBackend>> = match magpole_compute::GpuBackend::new_blocking() {
        Ok(gpu) => Some(Arc::new(gpu)),
        Err(e) => {
            eprintln!("GPU not available, skipping: {}", e);
            None
        }
    };
    #[cfg(not(feature = "gpu"))]
    let gpu: Option<Arc<dyn ComputeBackend>> = None;
    backends.extend(gpu.map(|g| ("gpu", g)));

    let reference = build(&sources, &sensors, ExpansionLimit::Octupole, backends[0].1.clone());
    let m = random_vector(reference.shape().1, 5);
    let d = random_vector(reference.shape().0, 6);
    let forward_ref = reference.apply_forward(&m).unwrap();
    let adjoint_ref = reference.apply_adjoint(&d).unwrap();

    eprintln!(
        "{} sensors x {} particles (octupole)",
        sensors.len(),
        sources.len()
    );
    eprintln!("{:>12} {:>14} {:>14}", "backend", "forward (ms)", "adjoint (ms)");
    for (name, backend) in &backends {
        let op = build(&sources, &sensors, ExpansionLimit::Octupole, backend.clone());
        let (forward, t_fwd) = timed(|| op.apply_forward(&m).unwrap());
        let (adjoint, t_adj) = timed(|| op.apply_adjoint(&d).unwrap());
        eprintln!("{:>12} {:>14.2} {:>14.2}", name, t_fwd, t_adj);

        assert_close(&forward, &forward_ref, 1e-9);
        assert_close(&adjoint, &adjoint_ref, 1e-9);
    }
}
