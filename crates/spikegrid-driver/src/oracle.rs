// SPDX-License-Identifier: AGPL-3.0-only

//! Cycle-stepped simulation oracle interface
//!
//! The driver never talks to a device directly. It drives host-side wires,
//! advances the clock one edge at a time and samples the device-side wires.
//! An HDL co-simulation, an FPGA bridge or the `software-device` feature's
//! `SoftwareDevice` can sit behind this trait.
//!
//! # Timing contract
//!
//! ```text
//!          drive()          step()           sample()
//! host ──► next value ──► edge k: device ──► value present on the wire
//!                         sees host wires     just before edge k
//! ```
//!
//! Values driven between two edges are seen by the device at the next edge.
//! [`SimulationOracle::sample`] returns what the device presented during the
//! cycle that ended at the last edge, so a valid/ready pair observed high on
//! both sides after a step means one transfer happened at that edge.

use crate::error::Result;

/// Wires driven by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostSignal {
    /// Active-low reset.
    Reset,
    /// One-cycle configuration strobe.
    ConfDone,
    /// Bytes the device may read.
    ConfTxSize,
    /// Bytes the device may write.
    ConfRxSize,
    /// Host can accept a read request.
    ReadCtrlReady,
    /// Read data on the bus is valid.
    ReadChnlValid,
    /// Read data beat.
    ReadChnlData,
    /// Host can accept a write request.
    WriteCtrlReady,
    /// Host can accept a write data beat.
    WriteChnlReady,
}

/// Wires driven by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceSignal {
    /// Device requests a read.
    ReadCtrlValid,
    /// Beat offset of the read.
    ReadCtrlIndex,
    /// Beat count of the read.
    ReadCtrlLength,
    /// Word-size code of the read.
    ReadCtrlSize,
    /// Device can accept a read data beat.
    ReadChnlReady,
    /// Device requests a write.
    WriteCtrlValid,
    /// Beat offset of the write.
    WriteCtrlIndex,
    /// Beat count of the write.
    WriteCtrlLength,
    /// Word-size code of the write.
    WriteCtrlSize,
    /// Write data on the bus is valid.
    WriteChnlValid,
    /// Write data beat.
    WriteChnlData,
    /// Device finished its session.
    AccDone,
    /// Diagnostic code, zero while healthy.
    Debug,
}

/// A clocked device the driver can exchange signals with.
pub trait SimulationOracle {
    /// Set a host wire for the next edge.
    fn drive(&mut self, signal: HostSignal, value: u128);

    /// Value of a device wire at the last edge.
    fn sample(&self, signal: DeviceSignal) -> u128;

    /// Advance one clock edge.
    ///
    /// # Errors
    ///
    /// Returns error if the underlying simulator fails.
    fn step(&mut self) -> Result<()>;
}

impl<T: SimulationOracle + ?Sized> SimulationOracle for &mut T {
    fn drive(&mut self, signal: HostSignal, value: u128) {
        (**self).drive(signal, value);
    }

    fn sample(&self, signal: DeviceSignal) -> u128 {
        (**self).sample(signal)
    }

    fn step(&mut self) -> Result<()> {
        (**self).step()
    }
}
