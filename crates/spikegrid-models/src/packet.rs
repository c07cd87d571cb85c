// SPDX-License-Identifier: AGPL-3.0-only

//! Routed packets and per-tick packet schedules.
//!
//! A routed packet is `{tick, axon, dy, dx}` laid out LSB first. Packets the
//! host injects carry absolute core coordinates in `dx`/`dy`; packets a
//! neuron emits carry offsets. Output packets are just the axon index that
//! fired on the output core.

use crate::error::{ModelError, Result};
use spikegrid_chip::bitfield::{format_bits, parse_bit_line, BitReader, BitWriter};
use spikegrid_chip::ArchitectureParams;
use std::fmt::Write as _;

/// A routed packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Packet {
    /// Tick delay.
    pub tick: u32,
    /// Destination axon.
    pub axon: u32,
    /// Destination core X (absolute for injected packets).
    pub dx: i64,
    /// Destination core Y (absolute for injected packets).
    pub dy: i64,
}

impl Packet {
    /// Pack into `arch.packet_width()` bits.
    ///
    /// # Errors
    ///
    /// [`ModelError::Chip`] if a field does not fit.
    pub fn encode(&self, arch: &ArchitectureParams) -> Result<u64> {
        let mut w = BitWriter::new();
        w.push(u64::from(self.tick), arch.tick_width())?;
        w.push(u64::from(self.axon), arch.dst_axon_width())?;
        w.push_field(self.dy, arch.dy_width(), true)?;
        w.push_field(self.dx, arch.dx_width(), true)?;
        Ok(w.finish().words().first().copied().unwrap_or(0))
    }

    /// Unpack from `arch.packet_width()` bits.
    ///
    /// # Errors
    ///
    /// [`ModelError::Chip`] if `bits` is wider than a packet.
    pub fn decode(bits: u64, arch: &ArchitectureParams) -> Result<Self> {
        let words = [bits];
        let mut r = BitReader::new(&words, 64);
        let tick = r.read(arch.tick_width())?;
        let axon = r.read(arch.dst_axon_width())?;
        let dy = r.read_field(arch.dy_width(), true)?;
        let dx = r.read_field(arch.dx_width(), true)?;
        let used = r.position();
        if used < 64 && bits >> used != 0 {
            return Err(ModelError::parse_error(format!(
                "packet {bits:#x} wider than {used} bits"
            )));
        }
        Ok(Self {
            tick: u32::try_from(tick).unwrap_or(u32::MAX),
            axon: u32::try_from(axon).unwrap_or(u32::MAX),
            dx,
            dy,
        })
    }

    /// One text line, MSB first.
    ///
    /// # Errors
    ///
    /// See [`Packet::encode`].
    pub fn to_line(&self, arch: &ArchitectureParams) -> Result<String> {
        Ok(format_bits(self.encode(arch)?, arch.packet_width()))
    }

    /// Destination as `(x, y, axon)`.
    #[must_use]
    pub const fn address(&self) -> (i64, i64, u32) {
        (self.dx, self.dy, self.axon)
    }
}

/// Packets grouped by tick: `counts[t]` packets belong to tick `t`, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketSchedule<P> {
    packets: Vec<P>,
    counts: Vec<usize>,
}

impl<P> Default for PacketSchedule<P> {
    fn default() -> Self {
        Self {
            packets: Vec::new(),
            counts: Vec::new(),
        }
    }
}

impl<P> PacketSchedule<P> {
    /// Pair packets with per-tick counts.
    ///
    /// # Errors
    ///
    /// [`ModelError::Configuration`] if the counts do not sum to the packet count.
    pub fn new(packets: Vec<P>, counts: Vec<usize>) -> Result<Self> {
        let total: usize = counts.iter().sum();
        if total != packets.len() {
            return Err(ModelError::configuration(format!(
                "per-tick counts sum to {total} but there are {} packets",
                packets.len()
            )));
        }
        Ok(Self { packets, counts })
    }

    /// All packets in order.
    #[must_use]
    pub fn packets(&self) -> &[P] {
        &self.packets
    }

    /// Per-tick counts.
    #[must_use]
    pub fn counts(&self) -> &[usize] {
        &self.counts
    }

    /// Total packets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    /// True when no packets are scheduled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Number of ticks with a count entry.
    #[must_use]
    pub fn tick_count(&self) -> usize {
        self.counts.len()
    }

    /// Packets of each tick, in tick order.
    pub fn ticks(&self) -> impl Iterator<Item = &[P]> + '_ {
        let mut start = 0;
        self.counts.iter().map(move |&count| {
            let slice = &self.packets[start..start + count];
            start += count;
            slice
        })
    }

    /// Remove packet `index`, decrementing its tick's count.
    pub fn remove(&mut self, index: usize) -> Option<P> {
        if index >= self.packets.len() {
            return None;
        }
        let mut start = 0;
        for count in &mut self.counts {
            if index < start + *count {
                *count -= 1;
                return Some(self.packets.remove(index));
            }
            start += *count;
        }
        None
    }

    /// Keep packets matching `keep`; returns how many were dropped.
    pub fn retain(&mut self, mut keep: impl FnMut(&P) -> bool) -> usize {
        let mut dropped = 0;
        let mut index = 0;
        while index < self.packets.len() {
            if keep(&self.packets[index]) {
                index += 1;
            } else {
                self.remove(index);
                dropped += 1;
            }
        }
        dropped
    }

    /// Rewrite every packet in place.
    ///
    /// # Errors
    ///
    /// The first error `f` returns.
    pub fn try_for_each_mut<E>(
        &mut self,
        f: impl FnMut(&mut P) -> std::result::Result<(), E>,
    ) -> std::result::Result<(), E> {
        self.packets.iter_mut().try_for_each(f)
    }
}

/// Parse routed packets, one per line.
///
/// # Errors
///
/// [`ModelError::Parse`] for lines of the wrong width or non-binary content.
pub fn parse_packets(text: &str, arch: &ArchitectureParams) -> Result<Vec<Packet>> {
    let width = arch.packet_width() as usize;
    let mut out = Vec::new();
    for line in text.lines() {
        let Some(bits) = parse_bit_line(line)? else {
            continue;
        };
        if bits.len() != width {
            return Err(ModelError::parse_error(format!(
                "packet line has {} bits, expected {width}",
                bits.len()
            )));
        }
        out.push(Packet::decode(bits.words().first().copied().unwrap_or(0), arch)?);
    }
    Ok(out)
}

/// Render routed packets, one per line.
///
/// # Errors
///
/// See [`Packet::encode`].
pub fn format_packets(packets: &[Packet], arch: &ArchitectureParams) -> Result<String> {
    let mut out = String::new();
    for packet in packets {
        out.push_str(&packet.to_line(arch)?);
        out.push('\n');
    }
    Ok(out)
}

/// Parse output axon indices, one binary value per line.
///
/// # Errors
///
/// [`ModelError::Parse`] for malformed lines or axons at or above `num_outputs`.
pub fn parse_output_packets(text: &str, num_outputs: u32) -> Result<Vec<u32>> {
    let mut out = Vec::new();
    for line in text.lines() {
        let Some(bits) = parse_bit_line(line)? else {
            continue;
        };
        if bits.ones().any(|i| i >= 32) {
            return Err(ModelError::parse_error("output packet wider than 32 bits"));
        }
        let axon = u32::try_from(bits.words().first().copied().unwrap_or(0))
            .map_err(|_| ModelError::parse_error("output packet wider than 32 bits"))?;
        if axon >= num_outputs {
            return Err(ModelError::parse_error(format!(
                "output axon {axon} outside {num_outputs} outputs"
            )));
        }
        out.push(axon);
    }
    Ok(out)
}

/// Render output axon indices at `width` bits each.
#[must_use]
pub fn format_output_packets(axons: &[u32], width: u32) -> String {
    let mut out = String::new();
    for axon in axons {
        out.push_str(&format_bits(u64::from(*axon), width.max(1)));
        out.push('\n');
    }
    out
}

/// Parse a per-tick count file: one decimal integer per line.
///
/// # Errors
///
/// [`ModelError::Parse`] for anything that is not a non-negative integer.
pub fn parse_counts(text: &str) -> Result<Vec<usize>> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.parse::<usize>()
                .map_err(|e| ModelError::parse_error(format!("bad count {line:?}: {e}")))
        })
        .collect()
}

/// Render a per-tick count file.
#[must_use]
pub fn format_counts(counts: &[usize]) -> String {
    counts.iter().fold(String::new(), |mut out, c| {
        let _ = writeln!(out, "{c}");
        out
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_layout() {
        let arch = ArchitectureParams::REFERENCE;
        let p = Packet {
            tick: 1,
            axon: 3,
            dx: 1,
            dy: 0,
        };
        let bits = p.encode(&arch).unwrap();
        // tick (4) | axon (5) | dy (9) | dx (9)
        assert_eq!(bits, 1 | (3 << 4) | (1 << 18));
        assert_eq!(Packet::decode(bits, &arch).unwrap(), p);
        let negative = Packet { dx: -2, ..p };
        assert_eq!(
            Packet::decode(negative.encode(&arch).unwrap(), &arch).unwrap(),
            negative
        );
        assert!(Packet::decode(1 << 27, &arch).is_err());
    }

    #[test]
    fn test_packet_text() {
        let arch = ArchitectureParams::REFERENCE;
        let p = Packet {
            tick: 2,
            axon: 1,
            dx: 3,
            dy: 1,
        };
        let text = format_packets(&[p, p], &arch).unwrap();
        assert_eq!(text.lines().next().unwrap().len(), 27);
        assert_eq!(parse_packets(&text, &arch).unwrap(), vec![p, p]);
        assert!(parse_packets("0101\n", &arch).is_err());
    }

    #[test]
    fn test_schedule_ticks_and_remove() {
        let mut s = PacketSchedule::new(vec!['a', 'b', 'c', 'd'], vec![2, 0, 1, 1]).unwrap();
        let ticks: Vec<&[char]> = s.ticks().collect();
        assert_eq!(ticks, vec![&['a', 'b'][..], &[][..], &['c'][..], &['d'][..]]);
        assert_eq!(s.remove(2), Some('c'));
        assert_eq!(s.counts(), &[2, 0, 0, 1]);
        assert_eq!(s.retain(|c| *c != 'a'), 1);
        assert_eq!(s.counts(), &[1, 0, 0, 1]);
        assert_eq!(s.remove(9), None);
        assert!(PacketSchedule::new(vec![1], vec![2]).is_err());
    }

    #[test]
    fn test_outputs_and_counts() {
        assert_eq!(parse_output_packets("0101\n0000\n", 16).unwrap(), vec![5, 0]);
        assert!(parse_output_packets("10000\n", 16).is_err());
        assert_eq!(format_output_packets(&[5, 0], 4), "0101\n0000\n");
        assert_eq!(parse_counts("1\n0\n\n3\n").unwrap(), vec![1, 0, 3]);
        assert!(parse_counts("x\n").is_err());
        assert_eq!(format_counts(&[1, 0, 3]), "1\n0\n3\n");
    }
}
