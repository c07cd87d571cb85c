// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for driver operations

use spikegrid_chip::ChipError;
use spikegrid_models::ModelError;
use thiserror::Error;

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, DriverError>;

/// Errors that can occur while driving a scenario
#[derive(Debug, Error)]
pub enum DriverError {
    /// Model loading or encoding failed
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    /// Hardware contract violated (field widths, frame layout)
    #[error("Chip error: {0}")]
    Chip(#[from] ChipError),

    /// Driver configured inconsistently with the scenario
    #[error("Configuration error: {reason}")]
    Configuration {
        /// Reason for failure
        reason: String,
    },

    /// Handshake deadline exceeded
    #[error("Timed out after {steps} steps waiting for {waiting_for}")]
    ProtocolTimeout {
        /// Condition that never became true
        waiting_for: String,
        /// Steps waited
        steps: u64,
    },

    /// Device request disagrees with the host's view of the transfer
    #[error("Protocol mismatch on {field}: expected {expected}, device reported {observed}")]
    ProtocolMismatch {
        /// Request field
        field: &'static str,
        /// Host's value
        expected: u64,
        /// Device's value
        observed: u64,
    },

    /// Diagnostic signal went nonzero
    #[error("Device fault, debug signal {code:#x}")]
    DeviceFault {
        /// Raw value of the diagnostic signal
        code: u128,
    },

    /// Output packet failed validation
    #[error("Output mismatch at tick {tick}, packet {packet:#b}: {reason}")]
    OutputMismatch {
        /// Tick the packet arrived on
        tick: u32,
        /// Received output axon
        packet: u32,
        /// What was wrong
        reason: String,
    },

    /// The scenario finished without a single checked output packet
    #[error("No output packets were observed")]
    NoOutputObserved,
}

impl DriverError {
    /// Create a configuration error
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(waiting_for: impl Into<String>, steps: u64) -> Self {
        Self::ProtocolTimeout {
            waiting_for: waiting_for.into(),
            steps,
        }
    }

    /// Create an output mismatch error
    pub fn output_mismatch(tick: u32, packet: u32, reason: impl Into<String>) -> Self {
        Self::OutputMismatch {
            tick,
            packet,
            reason: reason.into(),
        }
    }
}
