// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the hardware model

use thiserror::Error;

/// Result type alias for hardware model operations
pub type Result<T> = std::result::Result<T, ChipError>;

/// Errors raised while encoding fields, parsing bit text or validating an architecture
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChipError {
    /// Requested field width exceeds the 64-bit codec limit
    #[error("Field width {width} exceeds the 64-bit limit")]
    WidthTooLarge {
        /// Requested width in bits
        width: u32,
    },

    /// Value cannot be represented in the requested field width
    #[error("Value {value} does not fit in a {width}-bit field")]
    ValueOutOfRange {
        /// Offending value
        value: i128,
        /// Field width in bits
        width: u32,
    },

    /// Malformed bit text or truncated bit stream
    #[error("Parse error: {reason}")]
    ParseError {
        /// Reason for failure
        reason: String,
    },

    /// Inconsistent or unsupported architecture
    #[error("Configuration error: {reason}")]
    Configuration {
        /// Reason for failure
        reason: String,
    },
}

impl ChipError {
    /// Create a parse error
    pub fn parse_error(reason: impl Into<String>) -> Self {
        Self::ParseError {
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a value-out-of-range error
    pub fn out_of_range(value: impl Into<i128>, width: u32) -> Self {
        Self::ValueOutOfRange {
            value: value.into(),
            width,
        }
    }
}
