// SPDX-License-Identifier: AGPL-3.0-only
#![deny(unsafe_code)]

//! Model compilation for the spikegrid core array
//!
//! This crate turns per-core memory images into structured records, finds
//! the relocatable units inside each core, and repacks a whole grid model
//! onto the fewest cores of a (possibly different) architecture while
//! keeping every address consistent.
//!
//! # Pipeline
//!
//! - **Decode**: `.mem` text lines into [`CoreRecord`]s ([`record`], [`memory`])
//! - **Analyse**: axon/neuron connectivity and minimal connected components ([`usage`])
//! - **Allocate**: 2-D bin packing of components onto cores ([`solver`], [`allocator`])
//! - **Remap**: translation table, relocation, output-axon packing ([`remap`])
//! - **Compress**: the full pass with before/after statistics ([`compress`])
//!
//! # Example
//!
//! ```no_run
//! use spikegrid_models::compress::{compress, CompressionOptions};
//! use spikegrid_models::scenario::{load_scenario, write_scenario, Scenario};
//! use spikegrid_models::solver::BranchAndBoundSolver;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let scenario = load_scenario(Path::new("scenarios/mnist"), None)?;
//! let target = *scenario.model.arch();
//! let (model, report) = compress(
//!     &scenario.model,
//!     &target,
//!     CompressionOptions::default(),
//!     &BranchAndBoundSolver::default(),
//! )?;
//! println!("{} -> {} cores", report.old_cores, report.new_cores);
//! write_scenario(Path::new("scenarios/mnist_packed"), &Scenario { params: scenario.params, model })?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod allocator;
pub mod compress;
mod error;
pub mod grid;
pub mod memory;
pub mod packet;
pub mod record;
pub mod remap;
pub mod scenario;
pub mod solver;
pub mod usage;

pub use crate::record::{CoreRecord, Destination, NeuronRecord};
pub use error::{AddressingConflict, ModelError, Result};
pub use grid::GridModel;
pub use memory::MemoryImage;
pub use packet::{Packet, PacketSchedule};
pub use usage::{Component, CoreUsage};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::compress::{compress, CompressionOptions, CompressionReport};
    pub use crate::scenario::{load_scenario, write_scenario, Scenario, ScenarioParams};
    pub use crate::solver::{BinPackingSolver, BranchAndBoundSolver};
    pub use crate::{CoreRecord, GridModel, ModelError, Packet, Result};
}
