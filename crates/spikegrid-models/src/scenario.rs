// SPDX-License-Identifier: AGPL-3.0-only

//! Scenario directories.
//!
//! ```text
//! scenario.json          architecture + test settings
//! axons_<idx>.mem        axon table of core idx = x + y * grid_dimension_x
//! neurons_<idx>.mem      neuron table of the same core
//! input_packets.txt      host-injected packets, absolute coordinates
//! input_counts.txt       input packets per tick
//! expected_outputs.txt   expected output axons
//! output_counts.txt      expected outputs per tick
//! ```
//!
//! Core indices are zero-padded to the width of the largest index. A core
//! missing either image file is treated as structurally empty and skipped.

use crate::error::Result;
use crate::grid::GridModel;
use crate::memory::MemoryImage;
use crate::packet::{
    format_counts, format_output_packets, format_packets, parse_counts, parse_output_packets,
    parse_packets, PacketSchedule,
};
use crate::record::CoreRecord;
use serde::{Deserialize, Serialize};
use spikegrid_chip::ArchitectureParams;
use std::fs;
use std::path::{Path, PathBuf};

/// Scenario configuration file name.
pub const CONFIG_FILE: &str = "scenario.json";
/// Input packet file name.
pub const INPUT_PACKETS_FILE: &str = "input_packets.txt";
/// Input count file name.
pub const INPUT_COUNTS_FILE: &str = "input_counts.txt";
/// Expected output file name.
pub const EXPECTED_OUTPUTS_FILE: &str = "expected_outputs.txt";
/// Output count file name.
pub const OUTPUT_COUNTS_FILE: &str = "output_counts.txt";

/// Per-scenario test settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioParams {
    /// Ticks before the first expected output.
    pub tick_latency: u32,
    /// Stop checking outputs after this many ticks.
    pub num_ticks_to_check: Option<u32>,
    /// Accept any order within a tick.
    pub relax_packet_ordering: bool,
}

/// On-disk form of `scenario.json`: both records flattened into one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioConfig {
    /// Architecture the images were generated for.
    #[serde(flatten)]
    pub arch: ArchitectureParams,
    /// Test settings.
    #[serde(flatten)]
    pub params: ScenarioParams,
}

/// A loaded scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scenario {
    /// Test settings.
    pub params: ScenarioParams,
    /// The compiled model.
    pub model: GridModel,
}

fn core_file(dir: &Path, prefix: &str, arch: &ArchitectureParams, x: u32, y: u32) -> PathBuf {
    let width = (arch.cell_count().saturating_sub(1)).to_string().len();
    let index = arch.core_index(x, y);
    dir.join(format!("{prefix}_{index:0width$}.mem"))
}

/// Axon and neuron image paths of core `(x, y)`.
#[must_use]
pub fn core_paths(dir: &Path, arch: &ArchitectureParams, x: u32, y: u32) -> (PathBuf, PathBuf) {
    (
        core_file(dir, "axons", arch, x, y),
        core_file(dir, "neurons", arch, x, y),
    )
}

fn read_optional(path: &Path) -> Result<String> {
    if path.exists() {
        Ok(fs::read_to_string(path)?)
    } else {
        tracing::warn!("{} missing, treating as empty", path.display());
        Ok(String::new())
    }
}

/// Read only the configuration of a scenario directory.
///
/// # Errors
///
/// I/O or JSON errors, or an invalid architecture.
pub fn load_config(dir: &Path) -> Result<ScenarioConfig> {
    let text = fs::read_to_string(dir.join(CONFIG_FILE))?;
    let config: ScenarioConfig = serde_json::from_str(&text)?;
    config.arch.validate()?;
    Ok(config)
}

/// Load a scenario, optionally re-targeting it to a wider architecture.
///
/// See [`GridModel::retarget`] for how a target architecture is applied.
///
/// # Errors
///
/// Any I/O, parse, configuration or round-trip error.
pub fn load_scenario(dir: &Path, target: Option<&ArchitectureParams>) -> Result<Scenario> {
    let config = load_config(dir)?;
    let source = config.arch;

    let mut cores = Vec::new();
    for y in 0..source.grid_dimension_y {
        for x in 0..source.grid_dimension_x {
            if source.is_output_core(x, y) {
                continue;
            }
            let (axon_path, neuron_path) = core_paths(dir, &source, x, y);
            if !axon_path.exists() || !neuron_path.exists() {
                continue;
            }
            let image = MemoryImage::read(&axon_path, &neuron_path)?;
            cores.push(CoreRecord::decode(&image, &source, &source, x, y)?);
        }
    }

    let inputs = PacketSchedule::new(
        parse_packets(&read_optional(&dir.join(INPUT_PACKETS_FILE))?, &source)?,
        parse_counts(&read_optional(&dir.join(INPUT_COUNTS_FILE))?)?,
    )?;
    let outputs = PacketSchedule::new(
        parse_output_packets(
            &read_optional(&dir.join(EXPECTED_OUTPUTS_FILE))?,
            source.num_outputs,
        )?,
        parse_counts(&read_optional(&dir.join(OUTPUT_COUNTS_FILE))?)?,
    )?;

    tracing::info!(
        "Loaded scenario {} with {} cores, {} input and {} expected output packets",
        dir.display(),
        cores.len(),
        inputs.len(),
        outputs.len()
    );
    let model = GridModel::new(source, cores, inputs, outputs)?;
    Ok(Scenario {
        params: config.params,
        model: match target {
            Some(target) => model.retarget(target)?,
            None => model,
        },
    })
}

/// Write a scenario directory, creating it if needed.
///
/// # Errors
///
/// I/O, JSON or encoding errors.
pub fn write_scenario(dir: &Path, scenario: &Scenario) -> Result<()> {
    let model = &scenario.model;
    let arch = model.arch();
    fs::create_dir_all(dir)?;
    let config = ScenarioConfig {
        arch: *arch,
        params: scenario.params,
    };
    fs::write(dir.join(CONFIG_FILE), serde_json::to_string_pretty(&config)?)?;

    for core in model.cores() {
        let (axon_path, neuron_path) = core_paths(dir, arch, core.x(), core.y());
        core.encode(arch)?.write(&axon_path, &neuron_path)?;
    }
    fs::write(
        dir.join(INPUT_PACKETS_FILE),
        format_packets(model.inputs().packets(), arch)?,
    )?;
    fs::write(
        dir.join(INPUT_COUNTS_FILE),
        format_counts(model.inputs().counts()),
    )?;
    write_expected_outputs(dir, model.outputs(), arch)?;
    tracing::info!("Wrote scenario {} ({} cores)", dir.display(), model.cores().len());
    Ok(())
}

/// Replace only the expected-output files of a scenario directory.
///
/// # Errors
///
/// I/O errors.
pub fn write_expected_outputs(
    dir: &Path,
    outputs: &PacketSchedule<u32>,
    arch: &ArchitectureParams,
) -> Result<()> {
    fs::write(
        dir.join(EXPECTED_OUTPUTS_FILE),
        format_output_packets(outputs.packets(), arch.output_packet_width()),
    )?;
    fs::write(dir.join(OUTPUT_COUNTS_FILE), format_counts(outputs.counts()))?;
    Ok(())
}
