// SPDX-License-Identifier: AGPL-3.0-only

//! Hardware model for the spikegrid core array.
//!
//! This crate has **no I/O** - it is a pure model of the device contract:
//! the architecture record and the field widths it implies, the bit-field
//! codec every table and packet is built from, and the fixed DMA frame
//! layout shared with the device.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`arch`] | `ArchitectureParams`, derived widths, cross-scenario field rules |
//! | [`bitfield`] | Signed/unsigned field codec, LSB-first bit streams, bit-text parsing |
//! | [`frame`] | Frame tags, 128-bit header layout, DMA size codes |
//! | [`error`] | `ChipError` |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod arch;
pub mod bitfield;
pub mod error;
pub mod frame;

pub use arch::{ArchField, ArchitectureParams, FieldRule};
pub use bitfield::{BitReader, BitString, BitWriter};
pub use error::{ChipError, Result};
pub use frame::{FrameHeader, FrameTag, ResetFlags};
