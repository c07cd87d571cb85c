// SPDX-License-Identifier: AGPL-3.0-only

//! Host-side runtime protocol for the spikegrid core array.
//!
//! The driver talks to a cycle-stepped device through a
//! [`SimulationOracle`]: it uploads every core's tables, streams input
//! packets tick by tick, checks the output packets the device writes back
//! and shuts the session down cleanly.
//!
//! # Layers
//!
//! ```text
//! ScenarioDriver   scenario flow, output validation
//!   FrameManager   128-bit headers, payloads, read/write cursors
//!     DmaLink      valid/ready handshakes, bounded waits, debug check
//!       SimulationOracle   HDL co-simulation, FPGA bridge
//! ```
//!
//! # Features
//!
//! - `software-device`: [`SoftwareDevice`], a cycle-stepped stand-in for the
//!   hardware that lets the whole protocol run without a simulator.
//!
//! # Quick start
//!
//! ```no_run
//! use spikegrid_driver::prelude::*;
//! use std::path::Path;
//!
//! fn check<O: SimulationOracle>(device: O) -> Result<(), Box<dyn std::error::Error>> {
//!     let scenario = load_scenario(Path::new("scenarios/relay"), None)?;
//!     let mut driver = ScenarioDriver::for_scenarios(device, std::slice::from_ref(&scenario))?;
//!     let reports = driver.run_all(std::slice::from_ref(&scenario))?;
//!     println!("{} output packets correct", reports[0].packets_checked);
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

pub mod beats;
pub mod driver;
mod error;
pub mod frames;
pub mod link;
pub mod oracle;
#[cfg(any(test, feature = "software-device"))]
pub mod software;
pub mod validation;

pub use driver::{ScenarioDriver, ScenarioReport};
pub use error::{DriverError, Result};
pub use frames::FrameManager;
pub use link::{DmaLink, DmaRequest};
pub use oracle::{DeviceSignal, HostSignal, SimulationOracle};
#[cfg(any(test, feature = "software-device"))]
pub use software::SoftwareDevice;
pub use validation::{OutputHandler, OutputRecorder, OutputValidator};

/// Everything needed to run a scenario directory.
pub mod prelude {
    #[cfg(any(test, feature = "software-device"))]
    pub use crate::SoftwareDevice;
    pub use crate::{DriverError, ScenarioDriver, ScenarioReport, SimulationOracle};
    pub use spikegrid_models::scenario::{load_scenario, Scenario, ScenarioParams};
}
