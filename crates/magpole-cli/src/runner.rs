//! Job runner: ties together scan grid, sources and the multipole operator.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use ndarray::{Array1, Array2};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;

use magpole_compute::ComputeBackend;
use magpole_core::operator::resolve_backend;
use magpole_core::{
    add_gaussian_noise, ExecutionBackend, ExpansionLimit, LinearOperator, MultipoleOperator,
    MultipoleSources, ScanGrid,
};

use crate::config::JobConfig;

/// Dot-test tolerance on |<Am,d> - <m,Aᵀd>| / max(|<Am,d>|, |<m,Aᵀd>|).
pub const ADJOINT_TOLERANCE: f64 = 1e-10;

/// Results from a forward simulation.
pub struct SimulationOutput {
    pub grid: ScanGrid,
    pub sensors: Vec<[f64; 3]>,
    /// Bz map, shape (ny, nx), in tesla.
    pub bz: Array2<f64>,
    /// `bz` plus sensor noise, when the job has a `[noise]` section.
    pub bz_noised: Option<Array2<f64>>,
    pub expansion_limit: ExpansionLimit,
    pub backend_name: String,
}

/// Outcome of one adjoint dot-test.
#[derive(Debug)]
pub struct AdjointReport {
    pub backend: String,
    pub forward_dot: f64,
    pub adjoint_dot: f64,
    pub relative_error: f64,
}

impl AdjointReport {
    pub fn passed(&self) -> bool {
        self.relative_error < ADJOINT_TOLERANCE
    }
}

/// Build the source set from the `[[source]]` entries.
///
/// An order is attached when any source carries it; sources without it get
/// zero moments for that order.
pub fn build_sources(job: &JobConfig) -> Result<MultipoleSources> {
    let n = job.sources.len();
    let positions = job.sources.iter().map(|s| s.position).collect();
    let dipoles = Array2::from_shape_fn((n, 3), |(j, k)| job.sources[j].dipole[k]);
    let mut sources = MultipoleSources::new(positions, dipoles)?;

    if job.sources.iter().any(|s| s.quadrupole.is_some()) {
        let quadrupoles = Array2::from_shape_fn((n, 5), |(j, k)| {
            job.sources[j].quadrupole.map_or(0.0, |q| q[k])
        });
        sources = sources.with_quadrupoles(quadrupoles)?;
    }
    if job.sources.iter().any(|s| s.octupole.is_some()) {
        let octupoles = Array2::from_shape_fn((n, 7), |(j, k)| {
            job.sources[j].octupole.map_or(0.0, |o| o[k])
        });
        sources = sources.with_octupoles(octupoles)?;
    }

    if sources.max_order() > job.expansion_limit()? {
        log::warn!(
            "Sources carry {} moments but the model stops at {}; higher orders are ignored",
            sources.max_order(),
            job.model.expansion_limit
        );
    }

    Ok(sources)
}

/// Build the operator for the job's scan grid and sources.
fn build_operator(
    job: &JobConfig,
    sources: &MultipoleSources,
    backend: Arc<dyn ComputeBackend>,
) -> Result<MultipoleOperator> {
    let sensors = job.scan.sensor_positions()?;
    let op = MultipoleOperator::with_compute_backend(
        sensors.len(),
        sources.len(),
        job.expansion_limit()?,
        sources.positions().to_vec(),
        sensors,
        backend,
    )
    .context("Cannot build multipole operator")?;
    Ok(op)
}

/// Run a forward simulation from a parsed job configuration.
pub fn run_simulation(job: &JobConfig) -> Result<SimulationOutput> {
    job.validate()?;
    let limit = job.expansion_limit()?;
    let sources = build_sources(job)?;
    let backend = create_backend(&job.model.backend, job.model.threads)?;
    let backend_name = backend.device_info().name;

    let op = build_operator(job, &sources, backend)?;
    let (ny, nx) = job.scan.shape();
    println!(
        "  Scan: {} x {} sensors at height {:.3e} m",
        nx, ny, job.scan.height
    );
    println!(
        "  Model: {} particles, {} expansion ({} unknowns)",
        sources.len(),
        limit,
        op.shape().1
    );

    let moments = sources.moment_vector(limit)?;
    let bz = op.apply_forward(&moments)?;
    let bz = bz
        .into_shape_with_order((ny, nx))
        .context("Bz vector does not match the scan grid")?;

    let bz_noised = match &job.noise {
        Some(noise) => {
            println!("  Noise: std dev {:.3e} T, seed {}", noise.std_dev, noise.seed);
            let mut noised = bz.clone();
            add_gaussian_noise(&mut noised, noise.std_dev, noise.seed)?;
            Some(noised)
        }
        None => None,
    };

    Ok(SimulationOutput {
        grid: job.scan.clone(),
        sensors: op.sensors().to_vec(),
        bz,
        bz_noised,
        expansion_limit: limit,
        backend_name,
    })
}

/// Seeded pseudo-random vector in [-0.5, 0.5).
fn random_vector(len: usize, seed: u64) -> Array1<f64> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    Array1::from_iter((0..len).map(|_| rng.random::<f64>() - 0.5))
}

/// Dot-test `<A m, d> = <m, Aᵀ d>` on one operator.
pub fn dot_test(op: &MultipoleOperator) -> Result<AdjointReport> {
    let (rows, cols) = op.shape();
    let m = random_vector(cols, 1);
    let d = random_vector(rows, 2);

    let forward_dot = op.apply_forward(&m)?.dot(&d);
    let adjoint_dot = m.dot(&op.apply_adjoint(&d)?);
    let scale = forward_dot.abs().max(adjoint_dot.abs());
    let relative_error = if scale > 0.0 {
        (forward_dot - adjoint_dot).abs() / scale
    } else {
        0.0
    };

    Ok(AdjointReport {
        backend: op.device_info().name,
        forward_dot,
        adjoint_dot,
        relative_error,
    })
}

/// Run the adjoint dot-test on every backend this build can create.
///
/// Backends that are unavailable on this machine are skipped with a warning.
pub fn check_adjoint(job: &JobConfig) -> Result<Vec<AdjointReport>> {
    job.validate()?;
    let sources = build_sources(job)?;

    let mut reports = Vec::new();
    for selector in ExecutionBackend::ALL {
        let backend = match resolve_backend(selector) {
            Ok(backend) => backend,
            Err(e) => {
                log::warn!("Skipping {} backend: {}", selector, e);
                continue;
            }
        };
        let op = build_operator(job, &sources, backend)?;
        reports.push(dot_test(&op)?);
    }

    if reports.is_empty() {
        anyhow::bail!("No compute backend available");
    }
    Ok(reports)
}

/// Pick the clean or the noised map of a simulation.
fn select_map(output: &SimulationOutput, noised: bool) -> Result<&Array2<f64>> {
    if noised {
        output
            .bz_noised
            .as_ref()
            .context("No noised map: the job has no [noise] section")
    } else {
        Ok(&output.bz)
    }
}

/// Write the Bz map (or its noised copy) to a CSV file, one sensor per line.
pub fn write_bz_csv(output: &SimulationOutput, path: &Path, job: &JobConfig, noised: bool) -> Result<()> {
    use std::io::Write;

    let map = select_map(output, noised)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut file = std::fs::File::create(path)
        .with_context(|| format!("Cannot create {}", path.display()))?;
    let (ny, nx) = output.grid.shape();
    writeln!(file, "# magpole Bz scan map")?;
    writeln!(file, "# Expansion: {}", output.expansion_limit)?;
    writeln!(file, "# Backend: {}", output.backend_name)?;
    writeln!(
        file,
        "# Grid: {}x{}, step [{:.4e}, {:.4e}] m, height {:.4e} m",
        nx, ny, output.grid.step[0], output.grid.step[1], output.grid.height
    )?;
    for (j, source) in job.sources.iter().enumerate() {
        writeln!(
            file,
            "# source {}: position=[{:.4e}, {:.4e}, {:.4e}] m",
            j, source.position[0], source.position[1], source.position[2]
        )?;
    }
    if let (true, Some(noise)) = (noised, &job.noise) {
        writeln!(file, "# Noise: std dev {:.4e} T, seed {}", noise.std_dev, noise.seed)?;
    }
    writeln!(file, "#")?;
    writeln!(file, "x_m,y_m,z_m,bz_T")?;

    for (pos, bz) in output.sensors.iter().zip(map.iter()) {
        writeln!(file, "{:.6e},{:.6e},{:.6e},{:.8e}", pos[0], pos[1], pos[2], bz)?;
    }

    println!("Bz map written to: {}", path.display());
    Ok(())
}

#[derive(Serialize)]
struct BzMapJson<'a> {
    expansion_limit: ExpansionLimit,
    backend: &'a str,
    height: f64,
    shape: [usize; 2],
    x: Vec<f64>,
    y: Vec<f64>,
    noised: bool,
    /// Rows of constant y.
    bz: Vec<Vec<f64>>,
}

/// Write the Bz map (or its noised copy) to a JSON file.
pub fn write_bz_json(output: &SimulationOutput, path: &Path, noised: bool) -> Result<()> {
    let bz = select_map(output, noised)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let (ny, nx) = output.grid.shape();
    let map = BzMapJson {
        expansion_limit: output.expansion_limit,
        backend: &output.backend_name,
        height: output.grid.height,
        shape: [ny, nx],
        x: output.grid.x_coords(),
        y: output.grid.y_coords(),
        noised,
        bz: bz.rows().into_iter().map(|row| row.to_vec()).collect(),
    };

    let json = serde_json::to_string_pretty(&map)
        .map_err(|e| anyhow::anyhow!("JSON serialisation error: {}", e))?;
    std::fs::write(path, json)?;

    println!("Bz map (JSON) written to: {}", path.display());
    Ok(())
}

/// Create a compute backend based on the user's preference string.
///
/// - `"sequential"`: single thread.
/// - `"cpu"`: Rayon, optionally with a dedicated pool of `threads` workers.
/// - `"gpu"`: wgpu, fail if unavailable.
/// - `"auto"`: try GPU, fall back to CPU.
pub fn create_backend(preference: &str, threads: Option<usize>) -> Result<Arc<dyn ComputeBackend>> {
    let backend: Arc<dyn ComputeBackend> = match preference {
        "cpu" => match threads {
            Some(n) => Arc::new(magpole_compute::CpuBackend::with_threads(n)?),
            None => resolve_backend(ExecutionBackend::DataParallelCpu)?,
        },
        "auto" => match resolve_backend(ExecutionBackend::DataParallelGpu) {
            Ok(gpu) => gpu,
            Err(e) => {
                log::warn!("GPU not available ({}), using CPU", e);
                return create_backend("cpu", threads);
            }
        },
        other => {
            let selector: ExecutionBackend = other.parse()?;
            resolve_backend(selector).with_context(|| format!("Cannot create {} backend", selector))?
        }
    };

    println!("Backend: {}", backend.device_info().name);
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    const JOB: &str = r#"
        [scan]
        height = 0.5e-6
        span = [3e-6, 2e-6]
        step = [1e-6, 1e-6]

        [model]
        expansion_limit = "quadrupole"
        backend = "sequential"

        [[source]]
        position = [1e-6, 1e-6, -1e-6]
        dipole = [0.0, 0.0, 1e-14]

        [[source]]
        position = [2e-6, 0.5e-6, -1.5e-6]
        dipole = [1e-14, 0.0, 0.0]
        quadrupole = [1e-20, 0.0, 0.0, 0.0, 0.0]
    "#;

    #[test]
    fn test_build_sources_fills_missing_orders() {
        let job = parse_config(JOB).unwrap();
        let sources = build_sources(&job).unwrap();
        assert_eq!(sources.max_order(), ExpansionLimit::Quadrupole);
        let quad = sources.moments(magpole_core::MultipoleOrder::Quadrupole).unwrap();
        assert_eq!(quad.row(0).to_vec(), vec![0.0; 5]);
        assert_eq!(quad[[1, 0]], 1e-20);
    }

    #[test]
    fn test_simulation_shape() {
        let job = parse_config(JOB).unwrap();
        let out = run_simulation(&job).unwrap();
        assert_eq!(out.bz.dim(), (2, 3));
        assert_eq!(out.sensors.len(), 6);
        assert!(out.bz.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_dot_test_passes_on_every_backend() {
        let job = parse_config(JOB).unwrap();
        let reports = check_adjoint(&job).unwrap();
        assert!(!reports.is_empty());
        for report in &reports {
            assert!(report.passed(), "{}: rel err {:.2e}", report.backend, report.relative_error);
        }
    }

    #[test]
    fn test_writers_create_files() {
        let job = parse_config(JOB).unwrap();
        let out = run_simulation(&job).unwrap();
        let dir = std::env::temp_dir().join(format!("magpole-cli-test-{}", std::process::id()));

        let csv = dir.join("bz_map.csv");
        write_bz_csv(&out, &csv, &job, false).unwrap();
        let text = std::fs::read_to_string(&csv).unwrap();
        let data_lines = text.lines().filter(|l| !l.starts_with('#')).count();
        assert_eq!(data_lines, 1 + 6);

        let json = dir.join("bz_map.json");
        write_bz_json(&out, &json, false).unwrap();
        let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&json).unwrap()).unwrap();
        assert_eq!(value["shape"], serde_json::json!([2, 3]));
        assert_eq!(value["expansion_limit"], "quadrupole");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_noise_section_adds_seeded_noise() {
        let job = parse_config(&format!("{}\n[noise]\nstd_dev = 1e-12\nseed = 11\n", JOB)).unwrap();
        let first = run_simulation(&job).unwrap();
        let second = run_simulation(&job).unwrap();

        let noised = first.bz_noised.as_ref().unwrap();
        assert_eq!(Some(noised), second.bz_noised.as_ref());
        assert_ne!(noised, &first.bz);
        assert!(noised.iter().zip(first.bz.iter()).all(|(n, c)| (n - c).abs() < 1e-10));

        let clean = run_simulation(&parse_config(JOB).unwrap()).unwrap();
        assert!(clean.bz_noised.is_none());
        assert_eq!(clean.bz, first.bz);
        assert!(write_bz_json(&clean, &std::env::temp_dir().join("unused.json"), true).is_err());
    }

    #[test]
    fn test_unknown_backend_is_an_error() {
        assert!(create_backend("tpu", None).is_err());
    }
}
