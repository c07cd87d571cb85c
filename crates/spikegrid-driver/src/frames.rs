// SPDX-License-Identifier: AGPL-3.0-only

//! Frame-level transfers with the host's read and write cursors.
//!
//! The read cursor walks the host-to-device stream from zero; the write
//! cursor walks the device-to-host stream from `2^31` bytes. Both count bus
//! beats, only ever move forward, and advance by exactly the beats moved.

use crate::error::{DriverError, Result};
use crate::link::{DmaLink, DmaRequest};
use crate::oracle::SimulationOracle;
use spikegrid_chip::bitfield::PAYLOAD_WORD_WIDTH;
use spikegrid_chip::frame::payload_beats;
use spikegrid_chip::{ArchitectureParams, FrameHeader, ResetFlags};
use tracing::debug;

/// Byte offset of the device-to-host stream.
pub const WRITE_BASE_BYTES: u64 = 1 << 31;

/// Host side of the frame protocol.
#[derive(Debug)]
pub struct FrameManager<O> {
    link: DmaLink<O>,
    arch: ArchitectureParams,
    header_beats: u64,
    read_offset: u64,
    write_offset: u64,
    device_terminated: bool,
}

impl<O: SimulationOracle> FrameManager<O> {
    /// Frame manager for `arch`; waits are bounded by two ticks of clock.
    ///
    /// # Errors
    ///
    /// [`DriverError::Chip`] if the bus width does not divide the header.
    pub fn new(oracle: O, arch: ArchitectureParams) -> Result<Self> {
        let header_beats = u64::from(arch.header_beats()?);
        let timeout = 2 * arch.clock_cycles_per_tick;
        let mut frames = Self {
            link: DmaLink::new(oracle, arch.dma_bus_width, timeout),
            arch,
            header_beats,
            read_offset: 0,
            write_offset: 0,
            device_terminated: false,
        };
        frames.rewind();
        Ok(frames)
    }

    /// The underlying link.
    pub fn link(&self) -> &DmaLink<O> {
        &self.link
    }

    /// The underlying link, mutably.
    pub fn link_mut(&mut self) -> &mut DmaLink<O> {
        &mut self.link
    }

    /// Unwrap the oracle.
    pub fn into_oracle(self) -> O {
        self.link.into_oracle()
    }

    /// Read cursor in beats.
    pub const fn read_offset(&self) -> u64 {
        self.read_offset
    }

    /// Write cursor in beats.
    pub const fn write_offset(&self) -> u64 {
        self.write_offset
    }

    /// True once the device has written a TERMINATE frame.
    pub const fn device_terminated(&self) -> bool {
        self.device_terminated
    }

    /// Reset both cursors and the termination latch for a new session.
    pub fn rewind(&mut self) {
        self.read_offset = 0;
        self.write_offset = WRITE_BASE_BYTES / u64::from(self.arch.dma_bus_width / 8);
        self.device_terminated = false;
    }

    fn bus_bytes(&self) -> u64 {
        u64::from(self.arch.dma_bus_width / 8)
    }

    fn payload_address(&self) -> u64 {
        (self.read_offset + self.header_beats) * self.bus_bytes()
    }

    fn read_header(&mut self, header: FrameHeader, advance: bool) -> Result<()> {
        let word_width = self.arch.dma_frame_header_word_width;
        let words = header.to_words(word_width)?;
        let request = DmaRequest {
            index: self.read_offset,
            length: self.header_beats,
            word_width,
        };
        self.link.service_read(request, &words)?;
        debug!("sent {:?} at beat {}", header, self.read_offset);
        if advance {
            self.read_offset += self.header_beats;
        }
        Ok(())
    }

    fn read_payload(&mut self, words: &[u64], word_width: u32) -> Result<()> {
        if words.is_empty() {
            return Ok(());
        }
        let request = DmaRequest {
            index: self.read_offset,
            length: payload_beats(words.len(), word_width, self.arch.dma_bus_width),
            word_width,
        };
        self.link.service_read(request, words)?;
        self.read_offset += request.length;
        Ok(())
    }

    /// Idle answer; the device re-reads the same slot, so the cursor stays.
    ///
    /// # Errors
    ///
    /// Any handshake error.
    pub fn noop(&mut self) -> Result<()> {
        self.read_header(FrameHeader::Noop, false)
    }

    /// Set the device's NOOP back-off.
    ///
    /// # Errors
    ///
    /// Any handshake error.
    pub fn configure_noop(&mut self, amount: u64) -> Result<()> {
        self.read_header(FrameHeader::NoopConf { amount }, true)
    }

    /// End the session.
    ///
    /// # Errors
    ///
    /// Any handshake error.
    pub fn terminate(&mut self) -> Result<()> {
        self.read_header(FrameHeader::Terminate, true)
    }

    /// Advance `amount` ticks, each lasting `delay` cycles (one tick's worth
    /// of clock by default).
    ///
    /// # Errors
    ///
    /// [`DriverError::Chip`] for an amount of zero or above 15 bits, or any
    /// handshake error.
    pub fn tick(&mut self, amount: u16, delay: Option<u64>) -> Result<()> {
        let delay = delay.unwrap_or(self.arch.clock_cycles_per_tick);
        self.read_header(FrameHeader::Tick { amount, delay }, true)
    }

    /// Reset device state.
    ///
    /// # Errors
    ///
    /// Any handshake error.
    pub fn reset(&mut self, flags: ResetFlags) -> Result<()> {
        self.read_header(FrameHeader::Reset(flags), true)
    }

    /// IN_PACKETS header announcing `count` packets.
    ///
    /// # Errors
    ///
    /// Any handshake error.
    pub fn in_packets_header(&mut self, count: usize) -> Result<()> {
        let count = u32::try_from(count)
            .map_err(|_| DriverError::configuration(format!("{count} packets in one frame")))?;
        let payload_address = self.payload_address();
        self.read_header(
            FrameHeader::InPackets {
                count,
                payload_address,
            },
            true,
        )
    }

    /// IN_PACKETS payload of encoded packets.
    ///
    /// # Errors
    ///
    /// Any handshake error.
    pub fn in_packets_payload(&mut self, packets: &[u64]) -> Result<()> {
        let width = self.arch.packet_word_width()?;
        self.read_payload(packets, width)
    }

    /// CORE_DATA header for the core at grid index `core_index`.
    ///
    /// # Errors
    ///
    /// Any handshake error.
    pub fn core_data_header(&mut self, core_index: u32) -> Result<()> {
        let payload_address = self.payload_address();
        self.read_header(
            FrameHeader::CoreData {
                core_index,
                payload_address,
            },
            true,
        )
    }

    /// CORE_DATA payload: the core's 64-bit table words.
    ///
    /// # Errors
    ///
    /// Any handshake error.
    pub fn core_data_payload(&mut self, words: &[u64]) -> Result<()> {
        self.read_payload(words, PAYLOAD_WORD_WIDTH)
    }

    /// Service one device-initiated frame.
    ///
    /// OUT_PACKETS payload words go to `sink` with the frame's tick; a
    /// TERMINATE frame latches [`FrameManager::device_terminated`].
    ///
    /// # Errors
    ///
    /// [`DriverError::ProtocolMismatch`] for any other frame type, errors
    /// from `sink`, or any handshake error.
    pub fn out_frame(
        &mut self,
        sink: &mut dyn FnMut(u32, u32) -> Result<()>,
    ) -> Result<FrameHeader> {
        let word_width = self.arch.dma_frame_header_word_width;
        let words = self.link.service_write(DmaRequest {
            index: self.write_offset,
            length: self.header_beats,
            word_width,
        })?;
        self.write_offset += self.header_beats;
        let header = FrameHeader::from_words(&words, word_width)?;
        debug!("received {:?}", header);

        match header {
            FrameHeader::Terminate => self.device_terminated = true,
            FrameHeader::OutPackets { count, tick, .. } => {
                if count > 0 {
                    let width = self.arch.output_word_width()?;
                    let request = DmaRequest {
                        index: self.write_offset,
                        length: payload_beats(
                            usize::from(count),
                            width,
                            self.arch.dma_bus_width,
                        ),
                        word_width: width,
                    };
                    let words = self.link.service_write(request)?;
                    self.write_offset += request.length;
                    for word in words.into_iter().take(usize::from(count)) {
                        let packet = u32::try_from(word).unwrap_or(u32::MAX);
                        sink(u32::from(tick), packet)?;
                    }
                }
            }
            other => {
                return Err(DriverError::ProtocolMismatch {
                    field: "frame tag",
                    expected: spikegrid_chip::FrameTag::OutPackets as u64,
                    observed: other.tag() as u64,
                });
            }
        }
        Ok(header)
    }
}
