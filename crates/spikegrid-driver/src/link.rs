// SPDX-License-Identifier: AGPL-3.0-only

//! DMA valid/ready handshakes over a [`SimulationOracle`].
//!
//! Every transfer starts with a control handshake (the device presents
//! offset, length and word size), then moves one beat per accepted
//! valid/ready pair. All waits are bounded; the diagnostic signal is checked
//! after every clock edge.

use crate::beats::{pack_beat, unpack_beats};
use crate::error::{DriverError, Result};
use crate::oracle::{DeviceSignal, HostSignal, SimulationOracle};
use spikegrid_chip::frame::dma_word_size_code;
use tracing::trace;

/// One DMA transfer as the host expects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaRequest {
    /// Offset in bus beats.
    pub index: u64,
    /// Length in bus beats.
    pub length: u64,
    /// Logical word width carried by the beats.
    pub word_width: u32,
}

/// Host side of the DMA bus.
#[derive(Debug)]
pub struct DmaLink<O> {
    oracle: O,
    bus_width: u32,
    timeout: u64,
    steps: u64,
}

impl<O: SimulationOracle> DmaLink<O> {
    /// Wrap `oracle`; every wait gives up after `timeout` steps.
    pub fn new(oracle: O, bus_width: u32, timeout: u64) -> Self {
        Self {
            oracle,
            bus_width,
            timeout,
            steps: 0,
        }
    }

    /// The wrapped oracle.
    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    /// Unwrap the oracle.
    pub fn into_oracle(self) -> O {
        self.oracle
    }

    /// Bus width in bits.
    pub const fn bus_width(&self) -> u32 {
        self.bus_width
    }

    /// Clock edges stepped so far.
    pub const fn steps(&self) -> u64 {
        self.steps
    }

    /// Step bound for a single wait.
    pub const fn timeout(&self) -> u64 {
        self.timeout
    }

    /// True if `signal` was nonzero at the last edge.
    pub fn is_high(&self, signal: DeviceSignal) -> bool {
        self.oracle.sample(signal) != 0
    }

    /// Advance one edge and check the diagnostic signal.
    ///
    /// # Errors
    ///
    /// [`DriverError::DeviceFault`] if the diagnostic signal is nonzero.
    pub fn step(&mut self) -> Result<()> {
        self.oracle.step()?;
        self.steps += 1;
        match self.oracle.sample(DeviceSignal::Debug) {
            0 => Ok(()),
            code => Err(DriverError::DeviceFault { code }),
        }
    }

    /// Step `n` edges.
    ///
    /// # Errors
    ///
    /// See [`DmaLink::step`].
    pub fn idle(&mut self, n: u64) -> Result<()> {
        for _ in 0..n {
            self.step()?;
        }
        Ok(())
    }

    /// Step until `signal` is high.
    ///
    /// # Errors
    ///
    /// [`DriverError::ProtocolTimeout`] after [`DmaLink::timeout`] steps.
    pub fn wait_for(&mut self, signal: DeviceSignal) -> Result<()> {
        for _ in 0..self.timeout {
            if self.is_high(signal) {
                return Ok(());
            }
            self.step()?;
        }
        Err(DriverError::timeout(format!("{signal:?}"), self.timeout))
    }

    /// Bring the device out of reset and configure it.
    ///
    /// # Errors
    ///
    /// See [`DmaLink::step`].
    pub fn initialise(&mut self, tx_size: u64, rx_size: u64) -> Result<()> {
        for signal in [
            HostSignal::ConfDone,
            HostSignal::ReadCtrlReady,
            HostSignal::ReadChnlValid,
            HostSignal::WriteCtrlReady,
            HostSignal::WriteChnlReady,
        ] {
            self.oracle.drive(signal, 0);
        }
        self.idle(3)?;
        self.oracle.drive(HostSignal::Reset, 0);
        self.idle(16)?;
        self.oracle.drive(HostSignal::Reset, 1);
        self.idle(6)?;
        self.configure(tx_size, rx_size)
    }

    /// Strobe the configuration registers.
    ///
    /// # Errors
    ///
    /// See [`DmaLink::step`].
    pub fn configure(&mut self, tx_size: u64, rx_size: u64) -> Result<()> {
        self.oracle.drive(HostSignal::ConfTxSize, u128::from(tx_size));
        self.oracle.drive(HostSignal::ConfRxSize, u128::from(rx_size));
        self.oracle.drive(HostSignal::ConfDone, 1);
        self.step()?;
        self.oracle.drive(HostSignal::ConfDone, 0);
        self.step()
    }

    /// Pulse the reset line, then let the device settle.
    ///
    /// # Errors
    ///
    /// See [`DmaLink::step`].
    pub fn pulse_reset(&mut self, settle: u64) -> Result<()> {
        self.step()?;
        self.oracle.drive(HostSignal::Reset, 0);
        self.step()?;
        self.oracle.drive(HostSignal::Reset, 1);
        self.idle(settle)
    }

    fn check_request(
        &self,
        request: &DmaRequest,
        index: DeviceSignal,
        length: DeviceSignal,
        size: DeviceSignal,
    ) -> Result<()> {
        let expected_size = dma_word_size_code(request.word_width)?;
        for (field, expected, signal) in [
            ("index", request.index, index),
            ("length", request.length, length),
            ("size", u64::from(expected_size), size),
        ] {
            let observed = self.oracle.sample(signal);
            if observed != u128::from(expected) {
                return Err(DriverError::ProtocolMismatch {
                    field,
                    expected,
                    observed: u64::try_from(observed).unwrap_or(u64::MAX),
                });
            }
        }
        Ok(())
    }

    /// Answer a device read: accept the request, check it, stream `words`.
    ///
    /// # Errors
    ///
    /// [`DriverError::ProtocolMismatch`] if the request differs from
    /// `request`, [`DriverError::ProtocolTimeout`] on a stalled handshake.
    pub fn service_read(&mut self, request: DmaRequest, words: &[u64]) -> Result<()> {
        self.oracle.drive(HostSignal::ReadCtrlReady, 1);
        self.step()?;
        self.wait_for(DeviceSignal::ReadCtrlValid)?;
        self.oracle.drive(HostSignal::ReadCtrlReady, 0);
        self.check_request(
            &request,
            DeviceSignal::ReadCtrlIndex,
            DeviceSignal::ReadCtrlLength,
            DeviceSignal::ReadCtrlSize,
        )?;
        trace!(
            "read {} beats at {} ({}-bit words)",
            request.length,
            request.index,
            request.word_width
        );

        for beat in 0..request.length {
            let data = pack_beat(words, beat as usize, request.word_width, self.bus_width);
            self.oracle.drive(HostSignal::ReadChnlData, data);
            self.oracle.drive(HostSignal::ReadChnlValid, 1);
            self.step()?;
            self.wait_for(DeviceSignal::ReadChnlReady)?;
            self.oracle.drive(HostSignal::ReadChnlValid, 0);
        }
        Ok(())
    }

    /// Answer a device write: accept the request, check it, collect the words.
    ///
    /// Every word slot the beats cover is returned.
    ///
    /// # Errors
    ///
    /// As for [`DmaLink::service_read`].
    pub fn service_write(&mut self, request: DmaRequest) -> Result<Vec<u64>> {
        self.oracle.drive(HostSignal::WriteCtrlReady, 1);
        self.step()?;
        self.wait_for(DeviceSignal::WriteCtrlValid)?;
        self.oracle.drive(HostSignal::WriteCtrlReady, 0);
        self.check_request(
            &request,
            DeviceSignal::WriteCtrlIndex,
            DeviceSignal::WriteCtrlLength,
            DeviceSignal::WriteCtrlSize,
        )?;
        trace!(
            "write {} beats at {} ({}-bit words)",
            request.length,
            request.index,
            request.word_width
        );

        let mut beats = Vec::new();
        for _ in 0..request.length {
            self.oracle.drive(HostSignal::WriteChnlReady, 1);
            self.step()?;
            self.wait_for(DeviceSignal::WriteChnlValid)?;
            self.oracle.drive(HostSignal::WriteChnlReady, 0);
            beats.push(self.oracle.sample(DeviceSignal::WriteChnlData));
        }
        Ok(unpack_beats(&beats, request.word_width, self.bus_width))
    }
}
