// SPDX-License-Identifier: AGPL-3.0-only

//! `spikegrid`: command-line interface for spikegrid scenario directories.
//!
//! ```text
//! USAGE:
//!   spikegrid inspect <dir>                 Architecture, schedules and cores
//!   spikegrid analyze <dir>                 Per-core usage and components
//!   spikegrid compress <dir> <out> [opts]   Pack the model onto fewer cores
//!   spikegrid simulate <dir>...             Run against the software device
//!   spikegrid record <dir>                  Capture expected outputs
//! ```
//!
//! `simulate` and `record` need the `software-device` feature.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use spikegrid_chip::ArchitectureParams;
#[cfg(feature = "software-device")]
use spikegrid_driver::{ScenarioDriver, SoftwareDevice};
use spikegrid_models::prelude::*;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "spikegrid", about = "Spiking core-array model tools", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Summarise a scenario directory.
    Inspect {
        /// Scenario directory.
        dir: PathBuf,
    },
    /// Print used axons, used neurons and components of every core.
    Analyze {
        /// Scenario directory.
        dir: PathBuf,
    },
    /// Compress a scenario onto as few cores as possible.
    Compress {
        /// Scenario directory to read.
        dir: PathBuf,
        /// Directory to write the compressed scenario to.
        out: PathBuf,
        /// Architecture JSON to compress onto (defaults to the scenario's).
        #[arg(long)]
        target: Option<PathBuf>,
        /// Keep the grid dimensions instead of shrinking them.
        #[arg(long)]
        keep_grid: bool,
        /// Keep `num_outputs` instead of shrinking it.
        #[arg(long)]
        keep_outputs: bool,
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Run scenarios in one session against the software device.
    #[cfg(feature = "software-device")]
    Simulate {
        /// Scenario directories, run in order.
        #[arg(required = true)]
        dirs: Vec<PathBuf>,
    },
    /// Run a scenario on the software device and write what it outputs as
    /// the scenario's expected outputs.
    #[cfg(feature = "software-device")]
    Record {
        /// Scenario directory, updated in place.
        dir: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Inspect { dir } => cmd_inspect(&dir)?,
        Cmd::Analyze { dir } => cmd_analyze(&dir)?,
        Cmd::Compress {
            dir,
            out,
            target,
            keep_grid,
            keep_outputs,
            json,
        } => {
            let options = CompressionOptions {
                minimise_grid: !keep_grid,
                minimise_outputs: !keep_outputs,
            };
            cmd_compress(&dir, &out, target.as_deref(), options, json)?;
        }
        #[cfg(feature = "software-device")]
        Cmd::Simulate { dirs } => cmd_simulate(&dirs)?,
        #[cfg(feature = "software-device")]
        Cmd::Record { dir } => cmd_record(&dir)?,
    }

    Ok(())
}

fn load(dir: &Path) -> Result<Scenario> {
    load_scenario(dir, None).with_context(|| format!("loading {}", dir.display()))
}

fn cmd_inspect(dir: &Path) -> Result<()> {
    let scenario = load(dir)?;
    let model = &scenario.model;
    let a = model.arch();
    let (ex, ey) = model.extent();

    println!("Scenario     : {}", dir.display());
    println!(
        "Grid         : {}×{}  (output core at {}, {})",
        a.grid_dimension_x, a.grid_dimension_y, a.output_core_x, a.output_core_y
    );
    println!("Core         : {} axons, {} neurons, {} weights", a.num_axons, a.num_neurons, a.num_weights);
    println!("Outputs      : {}", a.num_outputs);
    println!("DMA bus      : {} bits, {}-bit header words", a.dma_bus_width, a.dma_frame_header_word_width);
    println!("Cores        : {}  (extent {ex}×{ey})", model.cores().len());
    println!(
        "Inputs       : {} packets over {} ticks",
        model.inputs().len(),
        model.inputs().tick_count()
    );
    println!(
        "Outputs      : {} packets over {} ticks",
        model.outputs().len(),
        model.outputs().tick_count()
    );
    println!("Tick latency : {}", scenario.params.tick_latency);
    if let Some(n) = scenario.params.num_ticks_to_check {
        println!("Check ticks  : {n}");
    }
    println!(
        "Ordering     : {}",
        if scenario.params.relax_packet_ordering { "relaxed" } else { "strict" }
    );
    Ok(())
}

fn cmd_analyze(dir: &Path) -> Result<()> {
    let scenario = load(dir)?;
    let arch = scenario.model.arch();

    for core in scenario.model.cores() {
        let usage = core.usage();
        println!(
            "({}, {})  axons {}/{}  neurons {}/{}  components {}",
            core.x(),
            core.y(),
            usage.used_axons.len(),
            arch.num_axons,
            usage.used_neurons.len(),
            arch.num_neurons,
            usage.components.len()
        );
        for c in &usage.components {
            println!("     {:>3} axons {:?} -> neurons {:?}", c.axons.len(), c.axons, c.neurons);
        }
    }
    Ok(())
}

fn cmd_compress(
    dir: &Path,
    out: &Path,
    target: Option<&Path>,
    options: CompressionOptions,
    json: bool,
) -> Result<()> {
    let scenario = load(dir)?;
    let target = match target {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str::<ArchitectureParams>(&text)
                .with_context(|| format!("parsing {}", path.display()))?
        }
        None => *scenario.model.arch(),
    };

    let (model, report) = compress(
        &scenario.model,
        &target,
        options,
        &BranchAndBoundSolver::default(),
    )?;
    write_scenario(
        out,
        &Scenario {
            params: scenario.params,
            model,
        },
    )?;
    info!("compressed scenario written to {}", out.display());

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    println!(
        "Cores        : {} -> {}  (grid {}×{} -> {}×{})",
        report.old_cores,
        report.new_cores,
        report.old_shape.0,
        report.old_shape.1,
        report.new_shape.0,
        report.new_shape.1
    );
    println!("Components   : {}", report.components);
    if let Some(s) = &report.component_stats {
        println!(
            "  axons      : {}..{}   neurons {}..{}",
            s.min_axons, s.max_axons, s.min_neurons, s.max_neurons
        );
    }
    println!(
        "Utilisation  : axons {:.1}% -> {:.1}%  neurons {:.1}% -> {:.1}%",
        report.old_utilisation.axons,
        report.new_utilisation.axons,
        report.old_utilisation.neurons,
        report.new_utilisation.neurons
    );
    println!(
        "  padded     : axons {:.1}% -> {:.1}%  neurons {:.1}% -> {:.1}%",
        report.old_utilisation_padded.axons,
        report.new_utilisation_padded.axons,
        report.old_utilisation_padded.neurons,
        report.new_utilisation_padded.neurons
    );
    println!(
        "Removed      : {} empty cores, {} dud neurons, {} dud packets",
        report.empty_cores_removed, report.dud_neurons_removed, report.dud_packets_removed
    );
    println!("Outputs      : {} -> {}", report.old_num_outputs, report.new_num_outputs);
    Ok(())
}

#[cfg(feature = "software-device")]
fn cmd_simulate(dirs: &[PathBuf]) -> Result<()> {
    let scenarios = dirs.iter().map(|d| load(d)).collect::<Result<Vec<_>>>()?;
    let mut driver = ScenarioDriver::for_scenarios(
        SoftwareDevice::new(covering_arch(&scenarios)?)?,
        &scenarios,
    )?;
    let reports = driver.run_all(&scenarios)?;

    for (dir, r) in dirs.iter().zip(&reports) {
        println!(
            "{}: {} outputs correct, {} ticks, {} cores, {} cycles",
            dir.display(),
            r.packets_checked,
            r.ticks_sent,
            r.cores_uploaded,
            r.steps
        );
    }
    Ok(())
}

#[cfg(feature = "software-device")]
fn cmd_record(dir: &Path) -> Result<()> {
    let scenario = load(dir)?;
    let arch = *scenario.model.arch();
    let mut driver = ScenarioDriver::new(SoftwareDevice::new(arch)?, arch)?;
    driver.initialise()?;
    let (outputs, report) = driver.record(&scenario.model, &scenario.params)?;
    spikegrid_models::scenario::write_expected_outputs(dir, &outputs, &arch)
        .with_context(|| format!("writing outputs to {}", dir.display()))?;
    println!(
        "{}: {} outputs over {} ticks recorded, {} ticks sent",
        dir.display(),
        outputs.len(),
        outputs.tick_count(),
        report.ticks_sent
    );
    Ok(())
}

#[cfg(feature = "software-device")]
fn covering_arch(scenarios: &[Scenario]) -> Result<ArchitectureParams> {
    let archs: Vec<ArchitectureParams> = scenarios.iter().map(|s| *s.model.arch()).collect();
    Ok(ArchitectureParams::covering(&archs)?)
}
