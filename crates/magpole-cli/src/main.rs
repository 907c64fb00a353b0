//! magpole command-line interface.
//!
//! Simulate Bz scan maps and check the multipole operator from TOML job
//! files:
//! ```sh
//! magpole simulate job.toml
//! magpole check-adjoint job.toml
//! magpole validate job.toml
//! ```

mod config;
mod runner;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "magpole")]
#[command(about = "magpole: matrix-free multipole Bz operator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute the Bz scan map of the sources in a job file.
    Simulate {
        /// Path to the job configuration file.
        config: PathBuf,
        /// Output directory (overrides config file setting).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Run the adjoint dot-test on every available backend.
    CheckAdjoint {
        /// Path to the job configuration file.
        config: PathBuf,
    },
    /// Validate a configuration file without running anything.
    Validate {
        /// Path to the job configuration file.
        config: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate { config, output } => {
            println!("magpole Bz simulation");
            println!("=====================");
            let job = config::load_config(&config)?;
            println!("Configuration: {}", config.display());

            let result = runner::run_simulation(&job)?;

            // Determine output directory
            let out_dir = output.unwrap_or_else(|| PathBuf::from(&job.output.directory));

            if job.output.save_csv {
                runner::write_bz_csv(&result, &out_dir.join("bz_map.csv"), &job, false)?;
            }
            if job.output.save_json {
                runner::write_bz_json(&result, &out_dir.join("bz_map.json"), false)?;
            }
            if result.bz_noised.is_some() {
                if job.output.save_csv {
                    runner::write_bz_csv(&result, &out_dir.join("bz_map_noised.csv"), &job, true)?;
                }
                if job.output.save_json {
                    runner::write_bz_json(&result, &out_dir.join("bz_map_noised.json"), true)?;
                }
            }

            println!("Simulation complete.");
            Ok(())
        }
        Commands::CheckAdjoint { config } => {
            let job = config::load_config(&config)?;
            let reports = runner::check_adjoint(&job)?;

            println!(
                "{:<32} {:>16} {:>16} {:>10}",
                "backend", "<Am,d>", "<m,A'd>", "rel err"
            );
            for r in &reports {
                println!(
                    "{:<32} {:>16.8e} {:>16.8e} {:>10.2e}",
                    r.backend, r.forward_dot, r.adjoint_dot, r.relative_error
                );
            }

            if let Some(failed) = reports.iter().find(|r| !r.passed()) {
                anyhow::bail!(
                    "Adjoint mismatch on {}: relative error {:.2e} exceeds {:.0e}",
                    failed.backend,
                    failed.relative_error,
                    runner::ADJOINT_TOLERANCE
                );
            }
            println!("Adjoint consistent on {} backend(s).", reports.len());
            Ok(())
        }
        Commands::Validate { config } => {
            let job = config::load_config(&config)?;
            job.validate()?;
            println!("Configuration is valid: {}", config.display());
            Ok(())
        }
    }
}
