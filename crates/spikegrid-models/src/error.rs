// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for model compilation

use spikegrid_chip::ChipError;
use thiserror::Error;

/// Result type alias for model compilation
pub type Result<T> = std::result::Result<T, ModelError>;

/// A relocation or renumbering would leave an address inconsistent
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressingConflict {
    /// Two sources would land on the same destination axon
    #[error("axon {axon} of core ({x}, {y}) is already occupied")]
    OccupiedDestination {
        /// Destination core X
        x: i64,
        /// Destination core Y
        y: i64,
        /// Destination axon
        axon: u32,
    },

    /// An axon nothing connects to was selected for relocation
    #[error("axon {axon} of core ({x}, {y}) is unused and cannot be moved")]
    UnusedAxonMoved {
        /// Source core X
        x: i64,
        /// Source core Y
        y: i64,
        /// Source axon
        axon: u32,
    },

    /// An expected output names an axon no neuron drives
    #[error("output axon {axon} is expected to fire but nothing targets it")]
    UnexpectedOutputAxon {
        /// Output axon index
        axon: u32,
    },

    /// A neuron or packet addresses an axon with no translation
    #[error("no translation for axon {axon} of core ({x}, {y})")]
    UnresolvedDestination {
        /// Addressed core X
        x: i64,
        /// Addressed core Y
        y: i64,
        /// Addressed axon
        axon: u32,
    },

    /// A core about to be dropped is still addressed
    #[error("empty core ({x}, {y}) is still addressed by {by}")]
    EmptyCoreTargeted {
        /// Core X
        x: u32,
        /// Core Y
        y: u32,
        /// What addresses it
        by: String,
    },
}

/// Errors that can occur while building, transforming or persisting a grid model
#[derive(Debug, Error)]
pub enum ModelError {
    /// Bit-level codec or architecture error
    #[error(transparent)]
    Chip(#[from] ChipError),

    /// Malformed model text
    #[error("Parse error: {reason}")]
    Parse {
        /// Reason for failure
        reason: String,
    },

    /// Inconsistent architecture or model layout
    #[error("Configuration error: {reason}")]
    Configuration {
        /// Reason for failure
        reason: String,
    },

    /// Re-encoding under an unchanged architecture changed the bits
    #[error("Round trip of core ({}, {}) {table} table did not reproduce the original bits", core.0, core.1)]
    RoundTripViolation {
        /// Core position
        core: (u32, u32),
        /// Which table differed
        table: &'static str,
    },

    /// Components cannot be packed into the available cores
    #[error("Infeasible allocation: {reason}")]
    InfeasibleAllocation {
        /// Reason for failure
        reason: String,
    },

    /// Address translation conflict
    #[error("Addressing conflict: {0}")]
    Addressing(#[from] AddressingConflict),

    /// I/O error
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Scenario configuration (de)serialisation error
    #[error("JSON error: {source}")]
    Json {
        /// Underlying serde error
        #[from]
        source: serde_json::Error,
    },
}

impl ModelError {
    /// Create a parse error
    pub fn parse_error(reason: impl Into<String>) -> Self {
        Self::Parse {
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Create an infeasible-allocation error
    pub fn infeasible(reason: impl Into<String>) -> Self {
        Self::InfeasibleAllocation {
            reason: reason.into(),
        }
    }
}
