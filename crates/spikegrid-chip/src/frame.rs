// SPDX-License-Identifier: AGPL-3.0-only

//! DMA frame layout.
//!
//! Every transaction on the bus is a fixed 128-bit header, optionally
//! followed by a payload. The header is four 32-bit sub-words; sub-word 0
//! always carries the tag.
//!
//! | Tag | Frame | Sub-word 1 | Sub-words 2, 3 |
//! |-----|-------|------------|----------------|
//! | 0 | NOOP | - | - |
//! | 1 | NOOP_CONF | 0 | amount (lo, hi) |
//! | 2 | TERMINATE | - | - |
//! | 3 | IN_PACKETS | packet count | payload byte address (lo, hi) |
//! | 4 | OUT_PACKETS | count[15:0], tick[31:16] | payload byte address (lo, hi) |
//! | 5 | TICK | amount[14:0] | delay (lo, hi) |
//! | 6 | CORE_DATA | core index `x + y*grid_x` | payload byte address (lo, hi) |
//! | 7 | RESET | tick index[0], network[1], model[2] | - |
//!
//! With 64-bit header words, logical word `i` is `sub[2i] | sub[2i+1] << 32`.

use crate::error::{ChipError, Result};

/// 32-bit sub-words per header.
pub const HEADER_SUBWORDS: usize = 4;

/// Largest TICK amount (15-bit field).
pub const TICK_AMOUNT_MAX: u16 = 0x7FFF;

/// Frame type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum FrameTag {
    /// Idle poll; host answers when it has nothing to send.
    Noop = 0,
    /// Configure the device-side NOOP back-off.
    NoopConf = 1,
    /// End of session.
    Terminate = 2,
    /// Input packets follow.
    InPackets = 3,
    /// Output packets written by the device.
    OutPackets = 4,
    /// Advance simulated time.
    Tick = 5,
    /// One core's memory image follows.
    CoreData = 6,
    /// Reset device state.
    Reset = 7,
}

impl TryFrom<u32> for FrameTag {
    type Error = ChipError;

    fn try_from(value: u32) -> Result<Self> {
        Ok(match value {
            0 => Self::Noop,
            1 => Self::NoopConf,
            2 => Self::Terminate,
            3 => Self::InPackets,
            4 => Self::OutPackets,
            5 => Self::Tick,
            6 => Self::CoreData,
            7 => Self::Reset,
            other => {
                return Err(ChipError::parse_error(format!("unknown frame tag {other}")));
            }
        })
    }
}

/// RESET flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResetFlags {
    /// Reset the tick counter.
    pub tick_index: bool,
    /// Clear in-flight network state (router buffers, scheduler).
    pub network: bool,
    /// Reload neuron state from the model tables.
    pub model: bool,
}

impl ResetFlags {
    /// Everything reset.
    pub const ALL: Self = Self {
        tick_index: true,
        network: true,
        model: true,
    };

    /// Packed into sub-word 1.
    #[must_use]
    pub const fn bits(self) -> u32 {
        (self.tick_index as u32) | ((self.network as u32) << 1) | ((self.model as u32) << 2)
    }

    /// Unpack from sub-word 1.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self {
            tick_index: bits & 1 != 0,
            network: bits & 2 != 0,
            model: bits & 4 != 0,
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameHeader {
    /// Nothing to do.
    Noop,
    /// NOOP back-off configuration.
    NoopConf {
        /// Back-off amount in clock cycles.
        amount: u64,
    },
    /// Session end.
    Terminate,
    /// Host-to-device packets.
    InPackets {
        /// Packets in the payload.
        count: u32,
        /// Byte address of the payload.
        payload_address: u64,
    },
    /// Device-to-host packets.
    OutPackets {
        /// Packets in the payload.
        count: u16,
        /// Tick the packets arrived on.
        tick: u16,
        /// Byte address of the payload.
        payload_address: u64,
    },
    /// Advance time.
    Tick {
        /// Ticks to advance (at most [`TICK_AMOUNT_MAX`]).
        amount: u16,
        /// Clock cycles per tick.
        delay: u64,
    },
    /// Core memory image.
    CoreData {
        /// Row-major core index.
        core_index: u32,
        /// Byte address of the payload.
        payload_address: u64,
    },
    /// Reset.
    Reset(ResetFlags),
}

#[allow(clippy::cast_possible_truncation)]
const fn split(value: u64) -> (u32, u32) {
    (value as u32, (value >> 32) as u32)
}

const fn join(lo: u32, hi: u32) -> u64 {
    (lo as u64) | ((hi as u64) << 32)
}

impl FrameHeader {
    /// Tag of this header.
    #[must_use]
    pub const fn tag(&self) -> FrameTag {
        match self {
            Self::Noop => FrameTag::Noop,
            Self::NoopConf { .. } => FrameTag::NoopConf,
            Self::Terminate => FrameTag::Terminate,
            Self::InPackets { .. } => FrameTag::InPackets,
            Self::OutPackets { .. } => FrameTag::OutPackets,
            Self::Tick { .. } => FrameTag::Tick,
            Self::CoreData { .. } => FrameTag::CoreData,
            Self::Reset(_) => FrameTag::Reset,
        }
    }

    /// Encode as four 32-bit sub-words.
    ///
    /// # Errors
    ///
    /// [`ChipError::ValueOutOfRange`] for a TICK amount of zero or above 15 bits.
    pub fn to_subwords(&self) -> Result<[u32; HEADER_SUBWORDS]> {
        let tag = self.tag() as u32;
        Ok(match *self {
            Self::Noop | Self::Terminate => [tag, 0, 0, 0],
            Self::NoopConf { amount } => {
                let (lo, hi) = split(amount);
                [tag, 0, lo, hi]
            }
            Self::InPackets {
                count,
                payload_address,
            } => {
                let (lo, hi) = split(payload_address);
                [tag, count, lo, hi]
            }
            Self::OutPackets {
                count,
                tick,
                payload_address,
            } => {
                let (lo, hi) = split(payload_address);
                [tag, u32::from(count) | (u32::from(tick) << 16), lo, hi]
            }
            Self::Tick { amount, delay } => {
                if amount == 0 || amount > TICK_AMOUNT_MAX {
                    return Err(ChipError::out_of_range(amount, 15));
                }
                let (lo, hi) = split(delay);
                [tag, u32::from(amount), lo, hi]
            }
            Self::CoreData {
                core_index,
                payload_address,
            } => {
                let (lo, hi) = split(payload_address);
                [tag, core_index, lo, hi]
            }
            Self::Reset(flags) => [tag, flags.bits(), 0, 0],
        })
    }

    /// Decode four sub-words.
    ///
    /// # Errors
    ///
    /// [`ChipError::ParseError`] for an unknown tag.
    pub fn from_subwords(sub: &[u32; HEADER_SUBWORDS]) -> Result<Self> {
        let addr = join(sub[2], sub[3]);
        Ok(match FrameTag::try_from(sub[0])? {
            FrameTag::Noop => Self::Noop,
            FrameTag::NoopConf => Self::NoopConf { amount: addr },
            FrameTag::Terminate => Self::Terminate,
            FrameTag::InPackets => Self::InPackets {
                count: sub[1],
                payload_address: addr,
            },
            #[allow(clippy::cast_possible_truncation)]
            FrameTag::OutPackets => Self::OutPackets {
                count: sub[1] as u16,
                tick: (sub[1] >> 16) as u16,
                payload_address: addr,
            },
            #[allow(clippy::cast_possible_truncation)]
            FrameTag::Tick => Self::Tick {
                amount: (sub[1] & u32::from(TICK_AMOUNT_MAX)) as u16,
                delay: addr,
            },
            FrameTag::CoreData => Self::CoreData {
                core_index: sub[1],
                payload_address: addr,
            },
            FrameTag::Reset => Self::Reset(ResetFlags::from_bits(sub[1])),
        })
    }

    /// Encode as logical header words of `word_width` bits (32 or 64).
    ///
    /// # Errors
    ///
    /// [`ChipError::Configuration`] for other word widths; see
    /// [`FrameHeader::to_subwords`].
    pub fn to_words(&self, word_width: u32) -> Result<Vec<u64>> {
        let sub = self.to_subwords()?;
        match word_width {
            32 => Ok(sub.iter().map(|s| u64::from(*s)).collect()),
            64 => Ok(sub.chunks(2).map(|p| join(p[0], p[1])).collect()),
            other => Err(header_width_error(other)),
        }
    }

    /// Decode logical header words.
    ///
    /// # Errors
    ///
    /// [`ChipError::Configuration`] for a bad word width,
    /// [`ChipError::ParseError`] for a short slice or an unknown tag.
    pub fn from_words(words: &[u64], word_width: u32) -> Result<Self> {
        let mut sub = [0u32; HEADER_SUBWORDS];
        match word_width {
            32 => {
                if words.len() < HEADER_SUBWORDS {
                    return Err(ChipError::parse_error("short 32-bit frame header"));
                }
                for (dst, src) in sub.iter_mut().zip(words) {
                    *dst = split(*src).0;
                }
            }
            64 => {
                if words.len() < HEADER_SUBWORDS / 2 {
                    return Err(ChipError::parse_error("short 64-bit frame header"));
                }
                for (i, word) in words.iter().take(HEADER_SUBWORDS / 2).enumerate() {
                    let (lo, hi) = split(*word);
                    sub[2 * i] = lo;
                    sub[2 * i + 1] = hi;
                }
            }
            other => return Err(header_width_error(other)),
        }
        Self::from_subwords(&sub)
    }
}

fn header_width_error(width: u32) -> ChipError {
    ChipError::configuration(format!("header word width {width} must be 32 or 64"))
}

/// Word-size code reported by the device on a DMA request.
///
/// # Errors
///
/// [`ChipError::Configuration`] for widths other than 8/16/32/64.
pub fn dma_word_size_code(width: u32) -> Result<u32> {
    match width {
        8 => Ok(0),
        16 => Ok(1),
        32 => Ok(2),
        64 => Ok(3),
        other => Err(ChipError::configuration(format!(
            "no DMA size code for {other}-bit words"
        ))),
    }
}

/// Bus beats needed for `items` logical words of `item_width` bits.
#[must_use]
pub fn payload_beats(items: usize, item_width: u32, bus_width: u32) -> u64 {
    (items as u64 * u64::from(item_width)).div_ceil(u64::from(bus_width.max(1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples() -> Vec<FrameHeader> {
        vec![
            FrameHeader::Noop,
            FrameHeader::NoopConf { amount: 0x1_0000_0002 },
            FrameHeader::Terminate,
            FrameHeader::InPackets {
                count: 7,
                payload_address: 0x40,
            },
            FrameHeader::OutPackets {
                count: 3,
                tick: 9,
                payload_address: 0x2000_0000,
            },
            FrameHeader::Tick {
                amount: 1,
                delay: 1000,
            },
            FrameHeader::CoreData {
                core_index: 5,
                payload_address: 0x80,
            },
            FrameHeader::Reset(ResetFlags::ALL),
        ]
    }

    #[test]
    fn tags_are_fixed() {
        for (i, header) in samples().iter().enumerate() {
            assert_eq!(header.tag() as usize, i);
            assert_eq!(header.to_subwords().unwrap()[0] as usize, i);
        }
        assert!(FrameTag::try_from(8).is_err());
    }

    #[test]
    fn subword_layout() {
        let out = FrameHeader::OutPackets {
            count: 3,
            tick: 9,
            payload_address: 0x1_0000_0040,
        };
        assert_eq!(out.to_subwords().unwrap(), [4, 3 | (9 << 16), 0x40, 1]);
        assert_eq!(ResetFlags::ALL.bits(), 0b111);
        assert_eq!(
            ResetFlags {
                tick_index: false,
                network: true,
                model: false
            }
            .bits(),
            0b010
        );
    }

    #[test]
    fn word_widths() {
        for header in samples() {
            let w32 = header.to_words(32).unwrap();
            assert_eq!(w32.len(), 4);
            assert_eq!(FrameHeader::from_words(&w32, 32).unwrap(), header);
            let w64 = header.to_words(64).unwrap();
            assert_eq!(w64.len(), 2);
            assert_eq!(w64[0] & 0xFFFF_FFFF, header.tag() as u64);
            assert_eq!(FrameHeader::from_words(&w64, 64).unwrap(), header);
        }
        assert!(FrameHeader::Noop.to_words(16).is_err());
    }

    #[test]
    fn tick_amount_limits() {
        let too_big = FrameHeader::Tick {
            amount: 0x8000,
            delay: 1,
        };
        assert!(too_big.to_subwords().is_err());
        let zero = FrameHeader::Tick { amount: 0, delay: 1 };
        assert!(zero.to_subwords().is_err());
    }

    #[test]
    fn size_codes_and_beats() {
        assert_eq!(dma_word_size_code(8).unwrap(), 0);
        assert_eq!(dma_word_size_code(64).unwrap(), 3);
        assert!(dma_word_size_code(24).is_err());
        assert_eq!(payload_beats(16, 8, 32), 4);
        assert_eq!(payload_beats(3, 8, 32), 1);
        assert_eq!(payload_beats(16, 64, 32), 32);
        assert_eq!(payload_beats(0, 64, 32), 0);
    }
}
