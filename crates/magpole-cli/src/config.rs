//! TOML configuration deserialisation for simulation jobs.
//!
//! ```toml
//! [scan]
//! height = 2e-6
//! span = [20e-6, 20e-6]
//! step = [0.5e-6, 0.5e-6]
//!
//! [model]
//! expansion_limit = "quadrupole"
//! backend = "cpu"
//!
//! [[source]]
//! position = [10e-6, 10e-6, -3e-6]
//! dipole = [0.0, 0.0, 1e-14]
//! quadrupole = [1e-20, 0.0, 0.0, 0.0, 0.0]
//!
//! [noise]
//! std_dev = 1e-9
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use magpole_core::{ExpansionLimit, ScanGrid};

/// Top-level job configuration.
#[derive(Debug, Deserialize)]
pub struct JobConfig {
    pub scan: ScanGrid,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(rename = "source", default)]
    pub sources: Vec<SourceConfig>,
    /// Optional sensor noise on the simulated map.
    #[serde(default)]
    pub noise: Option<NoiseConfig>,
    #[serde(default)]
    pub output: OutputConfig,
}

/// Gaussian sensor noise added to the simulated Bz map.
#[derive(Debug, Deserialize)]
pub struct NoiseConfig {
    /// Standard deviation in tesla.
    pub std_dev: f64,
    /// RNG seed. Default: 4242.
    #[serde(default = "default_noise_seed")]
    pub seed: u64,
}

fn default_noise_seed() -> u64 {
    4242
}

/// Model parameters from TOML.
#[derive(Debug, Deserialize)]
pub struct ModelConfig {
    /// "dipole", "quadrupole" or "octupole". Default: "dipole".
    #[serde(default = "default_expansion_limit")]
    pub expansion_limit: String,
    /// Compute backend: "sequential", "cpu", "gpu" or "auto". Default: "cpu".
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Worker threads for the CPU backend. Default: all cores.
    #[serde(default)]
    pub threads: Option<usize>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            expansion_limit: default_expansion_limit(),
            backend: default_backend(),
            threads: None,
        }
    }
}

fn default_expansion_limit() -> String {
    "dipole".into()
}

fn default_backend() -> String {
    "cpu".into()
}

/// A single point source. Moments in SI units (A·m² for dipoles).
#[derive(Debug, Deserialize)]
pub struct SourceConfig {
    pub position: [f64; 3],
    pub dipole: [f64; 3],
    #[serde(default)]
    pub quadrupole: Option<[f64; 5]>,
    #[serde(default)]
    pub octupole: Option<[f64; 7]>,
}

/// Output configuration.
#[derive(Debug, Deserialize)]
pub struct OutputConfig {
    /// Output directory (default: "./output").
    #[serde(default = "default_output_dir")]
    pub directory: String,
    /// Whether to save the Bz map as CSV (default: true).
    #[serde(default = "default_true")]
    pub save_csv: bool,
    /// Whether to also save the Bz map as JSON (default: false).
    #[serde(default)]
    pub save_json: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: default_output_dir(),
            save_csv: true,
            save_json: false,
        }
    }
}

fn default_output_dir() -> String {
    "./output".into()
}
fn default_true() -> bool {
    true
}

impl JobConfig {
    pub fn expansion_limit(&self) -> Result<ExpansionLimit> {
        Ok(self.model.expansion_limit.parse::<ExpansionLimit>()?)
    }

    /// Check everything that can be checked without building the operator.
    pub fn validate(&self) -> Result<()> {
        self.scan.validate().context("Invalid [scan] section")?;
        self.expansion_limit().context("Invalid [model] section")?;
        if !matches!(self.model.backend.as_str(), "sequential" | "cpu" | "gpu" | "auto") {
            anyhow::bail!(
                "Unknown backend '{}' (expected sequential, cpu, gpu or auto)",
                self.model.backend
            );
        }
        if self.model.threads == Some(0) {
            anyhow::bail!("[model] threads must be at least 1");
        }
        if let Some(noise) = &self.noise {
            if !noise.std_dev.is_finite() || noise.std_dev < 0.0 {
                anyhow::bail!("[noise] std_dev must be finite and non-negative, got {}", noise.std_dev);
            }
        }
        if self.sources.is_empty() {
            anyhow::bail!("No [[source]] entries in job file");
        }
        Ok(())
    }
}

/// Parse a TOML job configuration from a string.
pub fn parse_config(content: &str) -> Result<JobConfig> {
    let config: JobConfig = toml::from_str(content)?;
    Ok(config)
}

/// Load and parse a TOML job configuration file.
pub fn load_config(path: &Path) -> Result<JobConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read job file {}", path.display()))?;
    parse_config(&content).with_context(|| format!("Cannot parse job file {}", path.display()))
}
