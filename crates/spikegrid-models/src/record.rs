// SPDX-License-Identifier: AGPL-3.0-only

//! Decoded core records.
//!
//! A neuron-table line, most significant bit first:
//!
//! ```text
//! [axon bitmap A][current P][reset P][w0 W]..[wn W][leak L][pos T][neg T][reset mode][dx][dy][dst axon][dst tick]
//! ```
//!
//! Bit `a` of the bitmap (counting from its least significant end) marks
//! axon `a`. Potentials, weights, leak, thresholds and the core offsets are
//! signed; everything else is unsigned.

use crate::error::{ModelError, Result};
use crate::memory::MemoryImage;
use crate::usage::CoreUsage;
use spikegrid_chip::bitfield::BitWriter;
use spikegrid_chip::{ArchitectureParams, BitString};
use std::cell::OnceCell;

/// Where a neuron sends its spike: a core offset, an axon and a tick delay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Destination {
    /// Core offset along X.
    pub dx: i64,
    /// Core offset along Y.
    pub dy: i64,
    /// Axon on the destination core.
    pub axon: u32,
    /// Delivery delay in ticks.
    pub tick: u32,
}

/// One decoded neuron-table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeuronRecord {
    /// Axon presence bitmap.
    pub axons: BitString,
    /// Membrane potential.
    pub current_potential: i64,
    /// Potential after firing.
    pub reset_potential: i64,
    /// Synaptic weights, indexed by axon weight selector.
    pub weights: Vec<i64>,
    /// Leak added each tick.
    pub leak: i64,
    /// Firing threshold.
    pub positive_threshold: i64,
    /// Lower saturation threshold.
    pub negative_threshold: i64,
    /// Reset mode.
    pub reset_mode: u32,
    /// Spike destination.
    pub destination: Destination,
}

impl NeuronRecord {
    /// Canonical padding neuron: empty bitmap, positive threshold 1, all else zero.
    #[must_use]
    pub fn unused(arch: &ArchitectureParams) -> Self {
        Self {
            axons: BitString::zeros(arch.num_axons as usize),
            current_potential: 0,
            reset_potential: 0,
            weights: vec![0; arch.num_weights as usize],
            leak: 0,
            positive_threshold: 1,
            negative_threshold: 0,
            reset_mode: 0,
            destination: Destination::default(),
        }
    }

    /// True if no axon feeds this neuron.
    #[must_use]
    pub fn is_unused(&self) -> bool {
        self.axons.is_zero()
    }

    /// Decode one neuron-table line.
    ///
    /// # Errors
    ///
    /// [`ModelError::Parse`] if the line width does not match `arch`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn decode(bits: &BitString, arch: &ArchitectureParams) -> Result<Self> {
        let width = arch.neuron_record_width() as usize;
        if bits.len() != width {
            return Err(ModelError::parse_error(format!(
                "neuron line has {} bits, expected {width}",
                bits.len()
            )));
        }
        let mut r = bits.reader();
        let tick = r.read(arch.tick_width())?;
        let axon = r.read(arch.dst_axon_width())?;
        let dy = r.read_field(arch.dy_width(), true)?;
        let dx = r.read_field(arch.dx_width(), true)?;
        let reset_mode = r.read(arch.reset_mode_width())?;
        let negative_threshold = r.read_field(arch.threshold_width, true)?;
        let positive_threshold = r.read_field(arch.threshold_width, true)?;
        let leak = r.read_field(arch.leak_width, true)?;
        let mut weights = (0..arch.num_weights)
            .map(|_| r.read_field(arch.weight_width, true))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        weights.reverse();
        let reset_potential = r.read_field(arch.potential_width, true)?;
        let current_potential = r.read_field(arch.potential_width, true)?;
        let axons = r.read_bits(arch.num_axons as usize)?;
        Ok(Self {
            axons,
            current_potential,
            reset_potential,
            weights,
            leak,
            positive_threshold,
            negative_threshold,
            reset_mode: reset_mode as u32,
            destination: Destination {
                dx,
                dy,
                axon: axon as u32,
                tick: tick as u32,
            },
        })
    }

    /// Encode as a neuron-table line for `arch`.
    ///
    /// A shorter bitmap or weight vector is zero-extended.
    ///
    /// # Errors
    ///
    /// [`ModelError::Chip`] if a field does not fit, [`ModelError::Configuration`]
    /// if the record addresses more axons or weights than `arch` has.
    pub fn encode(&self, arch: &ArchitectureParams) -> Result<BitString> {
        if self.axons.ones().any(|a| a >= arch.num_axons as usize) {
            return Err(ModelError::configuration(format!(
                "neuron bitmap addresses axons beyond {}",
                arch.num_axons
            )));
        }
        if self.weights.len() > arch.num_weights as usize {
            return Err(ModelError::configuration(format!(
                "neuron has {} weights, architecture allows {}",
                self.weights.len(),
                arch.num_weights
            )));
        }
        let mut w = BitWriter::new();
        w.push(u64::from(self.destination.tick), arch.tick_width())?;
        w.push(u64::from(self.destination.axon), arch.dst_axon_width())?;
        w.push_field(self.destination.dy, arch.dy_width(), true)?;
        w.push_field(self.destination.dx, arch.dx_width(), true)?;
        w.push(u64::from(self.reset_mode), arch.reset_mode_width())?;
        w.push_field(self.negative_threshold, arch.threshold_width, true)?;
        w.push_field(self.positive_threshold, arch.threshold_width, true)?;
        w.push_field(self.leak, arch.leak_width, true)?;
        for i in (0..arch.num_weights as usize).rev() {
            let weight = self.weights.get(i).copied().unwrap_or(0);
            w.push_field(weight, arch.weight_width, true)?;
        }
        w.push_field(self.reset_potential, arch.potential_width, true)?;
        w.push_field(self.current_potential, arch.potential_width, true)?;
        w.push_bits(&widen(&self.axons, arch.num_axons as usize));
        Ok(w.finish())
    }
}

/// Copy of `bits` resized to exactly `len` bits.
pub(crate) fn widen(bits: &BitString, len: usize) -> BitString {
    let mut out = BitString::zeros(len);
    for a in bits.ones().take_while(|a| *a < len) {
        out.set(a, true);
    }
    out
}

/// A decoded core at a grid position.
///
/// Usage metadata is computed on first access and dropped by every mutation.
#[derive(Debug, Clone)]
pub struct CoreRecord {
    x: u32,
    y: u32,
    axons: Vec<u32>,
    neurons: Vec<NeuronRecord>,
    usage: OnceCell<CoreUsage>,
}

impl PartialEq for CoreRecord {
    fn eq(&self, other: &Self) -> bool {
        self.x == other.x
            && self.y == other.y
            && self.axons == other.axons
            && self.neurons == other.neurons
    }
}

impl Eq for CoreRecord {}

impl CoreRecord {
    /// Build from already-decoded tables.
    #[must_use]
    pub fn new(x: u32, y: u32, axons: Vec<u32>, neurons: Vec<NeuronRecord>) -> Self {
        Self {
            x,
            y,
            axons,
            neurons,
            usage: OnceCell::new(),
        }
    }

    /// Structurally empty core: every axon selector zero, every neuron unused.
    #[must_use]
    pub fn empty(x: u32, y: u32, arch: &ArchitectureParams) -> Self {
        Self::new(
            x,
            y,
            vec![0; arch.num_axons as usize],
            vec![NeuronRecord::unused(arch); arch.num_neurons as usize],
        )
    }

    /// Decode an image generated for `source` into a record for `target`.
    ///
    /// `(x, y)` is the core's position in the source grid. When the two
    /// architectures place the output core differently, the core sitting at
    /// the target's output coordinate moves to the source's output coordinate,
    /// and destinations pointing at either coordinate are swapped. Tail axons
    /// and neurons are padded with the canonical unused pattern.
    ///
    /// # Errors
    ///
    /// [`ModelError::Parse`] on malformed lines, [`ModelError::Configuration`]
    /// if `target` is smaller than `source` or the core sits on the source
    /// output coordinate, [`ModelError::RoundTripViolation`] if re-encoding
    /// under an unchanged architecture alters any bit.
    pub fn decode(
        image: &MemoryImage,
        source: &ArchitectureParams,
        target: &ArchitectureParams,
        x: u32,
        y: u32,
    ) -> Result<Self> {
        if source.is_output_core(x, y) {
            return Err(ModelError::configuration(format!(
                "core image at output coordinate ({x}, {y})"
            )));
        }
        if image.axons.len() != source.num_axons as usize
            || image.neurons.len() != source.num_neurons as usize
        {
            return Err(ModelError::parse_error(format!(
                "core ({x}, {y}) image has {} axon / {} neuron lines, expected {} / {}",
                image.axons.len(),
                image.neurons.len(),
                source.num_axons,
                source.num_neurons
            )));
        }
        if target.num_axons < source.num_axons
            || target.num_neurons < source.num_neurons
            || target.num_weights < source.num_weights
        {
            return Err(ModelError::configuration(
                "target architecture has fewer axons, neurons or weights than the source",
            ));
        }

        let select_width = source.weight_select_width() as usize;
        let mut axons = Vec::with_capacity(target.num_axons as usize);
        for line in &image.axons {
            if line.len() != select_width {
                return Err(ModelError::parse_error(format!(
                    "axon line has {} bits, expected {select_width}",
                    line.len()
                )));
            }
            let selector = line.reader().read(source.weight_select_width())?;
            axons.push(u32::try_from(selector).unwrap_or(u32::MAX));
        }
        axons.resize(target.num_axons as usize, 0);

        let mut neurons = Vec::with_capacity(target.num_neurons as usize);
        for line in &image.neurons {
            let mut neuron = NeuronRecord::decode(line, source)?;
            neuron.destination = swap_output_offset(neuron.destination, source, target, x, y);
            neuron.axons = widen(&neuron.axons, target.num_axons as usize);
            neuron.weights.resize(target.num_weights as usize, 0);
            neurons.push(neuron);
        }
        neurons.resize(target.num_neurons as usize, NeuronRecord::unused(target));

        let (x, y) = if target.is_output_core(x, y) {
            source.output_core()
        } else {
            (x, y)
        };
        let core = Self::new(x, y, axons, neurons);

        if source == target {
            let encoded = core.encode(target)?;
            if encoded.axons != image.axons {
                return Err(ModelError::RoundTripViolation {
                    core: (x, y),
                    table: "axon",
                });
            }
            if encoded.neurons != image.neurons {
                return Err(ModelError::RoundTripViolation {
                    core: (x, y),
                    table: "neuron",
                });
            }
        }
        tracing::debug!(
            "Decoded core ({}, {}): {} axons, {} neurons",
            x,
            y,
            core.axons.len(),
            core.neurons.len()
        );
        Ok(core)
    }

    /// Encode both tables for `arch`.
    ///
    /// # Errors
    ///
    /// [`ModelError::Configuration`] if the record does not match `arch`'s
    /// table sizes, [`ModelError::Chip`] if a field does not fit.
    pub fn encode(&self, arch: &ArchitectureParams) -> Result<MemoryImage> {
        if self.axons.len() != arch.num_axons as usize
            || self.neurons.len() != arch.num_neurons as usize
        {
            return Err(ModelError::configuration(format!(
                "core ({}, {}) has {} axons / {} neurons, architecture expects {} / {}",
                self.x,
                self.y,
                self.axons.len(),
                self.neurons.len(),
                arch.num_axons,
                arch.num_neurons
            )));
        }
        let mut axons = Vec::with_capacity(self.axons.len());
        for selector in &self.axons {
            let mut w = BitWriter::new();
            w.push(u64::from(*selector), arch.weight_select_width())?;
            axons.push(w.finish());
        }
        let neurons = self
            .neurons
            .iter()
            .map(|n| n.encode(arch))
            .collect::<Result<Vec<_>>>()?;
        Ok(MemoryImage { axons, neurons })
    }

    /// CORE_DATA payload words.
    ///
    /// # Errors
    ///
    /// See [`CoreRecord::encode`].
    pub fn to_words(&self, arch: &ArchitectureParams) -> Result<Vec<u64>> {
        self.encode(arch)?.to_words(arch)
    }

    /// Decode a CORE_DATA payload.
    ///
    /// # Errors
    ///
    /// [`ModelError::Parse`] for a payload of the wrong length.
    pub fn from_words(words: &[u64], arch: &ArchitectureParams, x: u32, y: u32) -> Result<Self> {
        let image = MemoryImage::from_words(words, arch)?;
        Self::decode(&image, arch, arch, x, y)
    }

    /// Re-encode, re-decode and compare payload words.
    ///
    /// # Errors
    ///
    /// [`ModelError::RoundTripViolation`] if any word differs.
    pub fn verify_round_trip(&self, arch: &ArchitectureParams) -> Result<()> {
        let image = self.encode(arch)?;
        let words = image.to_words(arch)?;
        let again = Self::decode(&image, arch, arch, self.x, self.y)?;
        let image_again = again.encode(arch)?;
        if image_again.axons != image.axons {
            return Err(ModelError::RoundTripViolation {
                core: (self.x, self.y),
                table: "axon",
            });
        }
        if image_again.to_words(arch)? != words {
            return Err(ModelError::RoundTripViolation {
                core: (self.x, self.y),
                table: "neuron",
            });
        }
        Ok(())
    }

    /// Grid X.
    #[must_use]
    pub const fn x(&self) -> u32 {
        self.x
    }

    /// Grid Y.
    #[must_use]
    pub const fn y(&self) -> u32 {
        self.y
    }

    /// Grid position.
    #[must_use]
    pub const fn position(&self) -> (u32, u32) {
        (self.x, self.y)
    }

    /// Weight selector per axon.
    #[must_use]
    pub fn axons(&self) -> &[u32] {
        &self.axons
    }

    /// Neuron records.
    #[must_use]
    pub fn neurons(&self) -> &[NeuronRecord] {
        &self.neurons
    }

    /// Absolute destination `(x, y, axon)` of neuron `index`.
    #[must_use]
    pub fn destination_of(&self, index: usize) -> Option<(i64, i64, u32)> {
        self.neurons.get(index).map(|n| {
            (
                i64::from(self.x) + n.destination.dx,
                i64::from(self.y) + n.destination.dy,
                n.destination.axon,
            )
        })
    }

    /// Connectivity metadata, computed on demand.
    pub fn usage(&self) -> &CoreUsage {
        self.usage.get_or_init(|| CoreUsage::analyze(self))
    }

    /// Replace an axon's weight selector.
    ///
    /// # Errors
    ///
    /// [`ModelError::Configuration`] for an index outside the table.
    pub fn set_axon(&mut self, index: usize, selector: u32) -> Result<()> {
        let slot = self
            .axons
            .get_mut(index)
            .ok_or_else(|| ModelError::configuration(format!("axon {index} out of range")))?;
        *slot = selector;
        self.usage.take();
        Ok(())
    }

    /// Replace a neuron record.
    ///
    /// # Errors
    ///
    /// [`ModelError::Configuration`] for an index outside the table.
    pub fn set_neuron(&mut self, index: usize, neuron: NeuronRecord) -> Result<()> {
        let slot = self
            .neurons
            .get_mut(index)
            .ok_or_else(|| ModelError::configuration(format!("neuron {index} out of range")))?;
        *slot = neuron;
        self.usage.take();
        Ok(())
    }

    /// Move the core to a new position.
    pub fn set_position(&mut self, x: u32, y: u32) {
        self.x = x;
        self.y = y;
    }
}

/// Rewrite a destination offset for a change of output-core coordinate.
fn swap_output_offset(
    dst: Destination,
    source: &ArchitectureParams,
    target: &ArchitectureParams,
    x: u32,
    y: u32,
) -> Destination {
    if dst.dx == 0 && dst.dy == 0 {
        return dst;
    }
    let (sx, sy) = (i64::from(source.output_core_x), i64::from(source.output_core_y));
    let (tx, ty) = (i64::from(target.output_core_x), i64::from(target.output_core_y));
    let (cx, cy) = (i64::from(x), i64::from(y));
    let (to_x, to_y) = (cx + dst.dx, cy + dst.dy);

    let (dx, dy) = if target.is_output_core(x, y) {
        // this core moves to the source output coordinate
        if (to_x, to_y) == (sx, sy) {
            (tx - sx, ty - sy)
        } else {
            (to_x - sx, to_y - sy)
        }
    } else if (to_x, to_y) == (sx, sy) {
        (tx - cx, ty - cy)
    } else if (to_x, to_y) == (tx, ty) {
        (sx - cx, sy - cy)
    } else {
        (dst.dx, dst.dy)
    };
    Destination { dx, dy, ..dst }
}
