// SPDX-License-Identifier: AGPL-3.0-only

//! Architecture record and derived field widths.
//!
//! An [`ArchitectureParams`] is created once per scenario and never mutated;
//! variants are produced with [`ArchitectureParams::with_field`].
//!
//! ## Derived widths
//!
//! | Width | Rule |
//! |-------|------|
//! | weight select | `clog2(num_weights)` |
//! | reset mode | `clog2(num_reset_modes)` |
//! | dx / dy | `clog2(max_dimension_x)` / `clog2(max_dimension_y)` |
//! | destination axon | `clog2(num_axons)` |
//! | tick | `clog2(num_ticks)` |
//! | packet | dx + dy + axon + tick |
//! | neuron record | `A + 2P + W*nw + L + 2T + reset + packet` |
//!
//! Memory tables pad each element to the next power of two before packing
//! them into 64-bit words.

use crate::bitfield::{ceil_word_width, clog2, padded_width, MAX_FIELD_WIDTH, PAYLOAD_WORD_WIDTH};
use crate::error::{ChipError, Result};
use serde::{Deserialize, Serialize};

/// Header length in bits, fixed for every frame.
pub const HEADER_WIDTH: u32 = 128;

/// Core-array architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArchitectureParams {
    /// Cores along X.
    pub grid_dimension_x: u32,
    /// Cores along Y.
    pub grid_dimension_y: u32,
    /// X coordinate of the reserved output core.
    pub output_core_x: u32,
    /// Y coordinate of the reserved output core.
    pub output_core_y: u32,
    /// Distinct output axons collected by the output core.
    pub num_outputs: u32,
    /// Neurons per core.
    pub num_neurons: u32,
    /// Axons per core.
    pub num_axons: u32,
    /// Ticks a packet may be delayed by.
    pub num_ticks: u32,
    /// Weight slots per neuron.
    pub num_weights: u32,
    /// Reset modes.
    pub num_reset_modes: u32,
    /// Membrane potential width.
    pub potential_width: u32,
    /// Synaptic weight width.
    pub weight_width: u32,
    /// Leak width.
    pub leak_width: u32,
    /// Threshold width.
    pub threshold_width: u32,
    /// Largest routable X hop (exclusive bound for the dx field range).
    pub max_dimension_x: u32,
    /// Largest routable Y hop.
    pub max_dimension_y: u32,
    /// Router FIFO depth (device-side only).
    pub router_buffer_depth: u32,
    /// DMA bus width in bits.
    pub dma_bus_width: u32,
    /// Logical header word width (32 or 64).
    pub dma_frame_header_word_width: u32,
    /// Clock cycles in one tick; bounds protocol waits.
    pub clock_cycles_per_tick: u64,
}

impl ArchitectureParams {
    /// Reference 4×4 grid with 32 axons and 32 neurons per core.
    pub const REFERENCE: Self = Self {
        grid_dimension_x: 4,
        grid_dimension_y: 4,
        output_core_x: 0,
        output_core_y: 0,
        num_outputs: 16,
        num_neurons: 32,
        num_axons: 32,
        num_ticks: 16,
        num_weights: 4,
        num_reset_modes: 4,
        potential_width: 9,
        weight_width: 9,
        leak_width: 9,
        threshold_width: 9,
        max_dimension_x: 512,
        max_dimension_y: 512,
        router_buffer_depth: 4,
        dma_bus_width: 32,
        dma_frame_header_word_width: 32,
        clock_cycles_per_tick: 1000,
    };

    /// Copy with one field overridden.
    ///
    /// # Errors
    ///
    /// Returns [`ChipError::ValueOutOfRange`] if `value` does not fit the field.
    pub fn with_field(&self, field: ArchField, value: u64) -> Result<Self> {
        let mut out = *self;
        let narrow = || u32::try_from(value).map_err(|_| ChipError::out_of_range(value, 32));
        match field {
            ArchField::GridDimensionX => out.grid_dimension_x = narrow()?,
            ArchField::GridDimensionY => out.grid_dimension_y = narrow()?,
            ArchField::OutputCoreX => out.output_core_x = narrow()?,
            ArchField::OutputCoreY => out.output_core_y = narrow()?,
            ArchField::NumOutputs => out.num_outputs = narrow()?,
            ArchField::NumNeurons => out.num_neurons = narrow()?,
            ArchField::NumAxons => out.num_axons = narrow()?,
            ArchField::NumTicks => out.num_ticks = narrow()?,
            ArchField::NumWeights => out.num_weights = narrow()?,
            ArchField::NumResetModes => out.num_reset_modes = narrow()?,
            ArchField::PotentialWidth => out.potential_width = narrow()?,
            ArchField::WeightWidth => out.weight_width = narrow()?,
            ArchField::LeakWidth => out.leak_width = narrow()?,
            ArchField::ThresholdWidth => out.threshold_width = narrow()?,
            ArchField::MaxDimensionX => out.max_dimension_x = narrow()?,
            ArchField::MaxDimensionY => out.max_dimension_y = narrow()?,
            ArchField::RouterBufferDepth => out.router_buffer_depth = narrow()?,
            ArchField::DmaBusWidth => out.dma_bus_width = narrow()?,
            ArchField::DmaFrameHeaderWordWidth => out.dma_frame_header_word_width = narrow()?,
            ArchField::ClockCyclesPerTick => out.clock_cycles_per_tick = value,
        }
        Ok(out)
    }

    /// Read one field by name.
    #[must_use]
    pub fn get(&self, field: ArchField) -> u64 {
        match field {
            ArchField::GridDimensionX => self.grid_dimension_x.into(),
            ArchField::GridDimensionY => self.grid_dimension_y.into(),
            ArchField::OutputCoreX => self.output_core_x.into(),
            ArchField::OutputCoreY => self.output_core_y.into(),
            ArchField::NumOutputs => self.num_outputs.into(),
            ArchField::NumNeurons => self.num_neurons.into(),
            ArchField::NumAxons => self.num_axons.into(),
            ArchField::NumTicks => self.num_ticks.into(),
            ArchField::NumWeights => self.num_weights.into(),
            ArchField::NumResetModes => self.num_reset_modes.into(),
            ArchField::PotentialWidth => self.potential_width.into(),
            ArchField::WeightWidth => self.weight_width.into(),
            ArchField::LeakWidth => self.leak_width.into(),
            ArchField::ThresholdWidth => self.threshold_width.into(),
            ArchField::MaxDimensionX => self.max_dimension_x.into(),
            ArchField::MaxDimensionY => self.max_dimension_y.into(),
            ArchField::RouterBufferDepth => self.router_buffer_depth.into(),
            ArchField::DmaBusWidth => self.dma_bus_width.into(),
            ArchField::DmaFrameHeaderWordWidth => self.dma_frame_header_word_width.into(),
            ArchField::ClockCyclesPerTick => self.clock_cycles_per_tick,
        }
    }

    /// Output core coordinate.
    #[must_use]
    pub const fn output_core(&self) -> (u32, u32) {
        (self.output_core_x, self.output_core_y)
    }

    /// True if `(x, y)` is the output core.
    #[must_use]
    pub const fn is_output_core(&self, x: u32, y: u32) -> bool {
        x == self.output_core_x && y == self.output_core_y
    }

    /// Row-major core index `x + y * grid_dimension_x`.
    #[must_use]
    pub const fn core_index(&self, x: u32, y: u32) -> u32 {
        x + y * self.grid_dimension_x
    }

    /// Total grid cells including the output core.
    #[must_use]
    pub const fn cell_count(&self) -> u32 {
        self.grid_dimension_x * self.grid_dimension_y
    }

    /// Width of an axon-table entry.
    #[must_use]
    pub const fn weight_select_width(&self) -> u32 {
        clog2(self.num_weights as u64)
    }

    /// Width of the reset-mode field.
    #[must_use]
    pub const fn reset_mode_width(&self) -> u32 {
        clog2(self.num_reset_modes as u64)
    }

    /// Width of the signed dx field.
    #[must_use]
    pub const fn dx_width(&self) -> u32 {
        clog2(self.max_dimension_x as u64)
    }

    /// Width of the signed dy field.
    #[must_use]
    pub const fn dy_width(&self) -> u32 {
        clog2(self.max_dimension_y as u64)
    }

    /// Width of the tick field.
    #[must_use]
    pub const fn tick_width(&self) -> u32 {
        clog2(self.num_ticks as u64)
    }

    /// Width of a destination axon index.
    #[must_use]
    pub const fn dst_axon_width(&self) -> u32 {
        clog2(self.num_axons as u64)
    }

    /// Width of a routed packet `{tick, axon, dy, dx}`.
    #[must_use]
    pub const fn packet_width(&self) -> u32 {
        self.dx_width() + self.dy_width() + self.dst_axon_width() + self.tick_width()
    }

    /// Width of an output packet (axon index at the output core).
    #[must_use]
    pub const fn output_packet_width(&self) -> u32 {
        clog2(self.num_outputs as u64)
    }

    /// Width of one neuron-table line.
    #[must_use]
    pub const fn neuron_record_width(&self) -> u32 {
        self.num_axons
            + 2 * self.potential_width
            + self.weight_width * self.num_weights
            + self.leak_width
            + 2 * self.threshold_width
            + self.reset_mode_width()
            + self.packet_width()
    }

    /// Padded element width of the axon table.
    #[must_use]
    pub fn axon_element_width(&self) -> u32 {
        padded_width(self.weight_select_width())
    }

    /// Padded element width of the neuron table.
    #[must_use]
    pub fn neuron_element_width(&self) -> u32 {
        padded_width(self.neuron_record_width())
    }

    /// 64-bit words in one core's axon table.
    #[must_use]
    pub fn axon_table_words(&self) -> usize {
        (self.axon_element_width() as usize * self.num_axons as usize)
            .div_ceil(PAYLOAD_WORD_WIDTH as usize)
    }

    /// 64-bit words in one core's neuron table.
    #[must_use]
    pub fn neuron_table_words(&self) -> usize {
        (self.neuron_element_width() as usize * self.num_neurons as usize)
            .div_ceil(PAYLOAD_WORD_WIDTH as usize)
    }

    /// 64-bit words in a CORE_DATA payload (axon table then neuron table).
    #[must_use]
    pub fn core_data_words(&self) -> usize {
        self.axon_table_words() + self.neuron_table_words()
    }

    /// Logical word width of an input packet on the bus.
    ///
    /// # Errors
    ///
    /// [`ChipError::WidthTooLarge`] if the packet is wider than 64 bits.
    pub fn packet_word_width(&self) -> Result<u32> {
        ceil_word_width(self.packet_width())
    }

    /// Logical word width of an output packet on the bus.
    ///
    /// # Errors
    ///
    /// [`ChipError::WidthTooLarge`] if the output packet is wider than 64 bits.
    pub fn output_word_width(&self) -> Result<u32> {
        ceil_word_width(self.output_packet_width())
    }

    /// Beats per frame header.
    ///
    /// # Errors
    ///
    /// [`ChipError::Configuration`] unless the bus width divides 128.
    pub fn header_beats(&self) -> Result<u32> {
        let bus = self.dma_bus_width;
        if bus < 8 || bus > HEADER_WIDTH || HEADER_WIDTH % bus != 0 {
            return Err(ChipError::configuration(format!(
                "DMA bus width {bus} must divide the {HEADER_WIDTH}-bit header"
            )));
        }
        Ok(HEADER_WIDTH / bus)
    }

    /// Check internal consistency.
    ///
    /// # Errors
    ///
    /// [`ChipError::Configuration`] on the first violated constraint,
    /// [`ChipError::WidthTooLarge`] on an oversized field.
    pub fn validate(&self) -> Result<()> {
        if self.grid_dimension_x == 0 || self.grid_dimension_y == 0 {
            return Err(ChipError::configuration("grid dimensions must be nonzero"));
        }
        if self.output_core_x >= self.grid_dimension_x || self.output_core_y >= self.grid_dimension_y {
            return Err(ChipError::configuration(format!(
                "output core ({}, {}) outside {}x{} grid",
                self.output_core_x, self.output_core_y, self.grid_dimension_x, self.grid_dimension_y
            )));
        }
        for (name, count) in [
            ("num_axons", self.num_axons),
            ("num_neurons", self.num_neurons),
            ("num_outputs", self.num_outputs),
            ("num_ticks", self.num_ticks),
            ("num_weights", self.num_weights),
            ("num_reset_modes", self.num_reset_modes),
            ("max_dimension_x", self.max_dimension_x),
            ("max_dimension_y", self.max_dimension_y),
        ] {
            if count == 0 {
                return Err(ChipError::configuration(format!("{name} must be nonzero")));
            }
        }
        if self.num_weights < 2 {
            return Err(ChipError::configuration(
                "num_weights must be at least 2 so axon-table lines are non-empty",
            ));
        }
        if self.num_axons < self.num_outputs {
            return Err(ChipError::configuration(format!(
                "output core has {} axons but the model needs {} outputs",
                self.num_axons, self.num_outputs
            )));
        }
        for width in [
            self.potential_width,
            self.weight_width,
            self.leak_width,
            self.threshold_width,
            self.packet_width(),
        ] {
            if width > MAX_FIELD_WIDTH {
                return Err(ChipError::WidthTooLarge { width });
            }
        }
        self.header_beats()?;
        if !matches!(self.dma_frame_header_word_width, 32 | 64) {
            return Err(ChipError::configuration(format!(
                "header word width {} must be 32 or 64",
                self.dma_frame_header_word_width
            )));
        }
        if self.clock_cycles_per_tick == 0 {
            return Err(ChipError::configuration("clock_cycles_per_tick must be nonzero"));
        }
        Ok(())
    }

    /// Smallest architecture that runs every scenario in `scenarios`.
    ///
    /// `Equal` fields must agree, `AtLeast` fields take the maximum and `Any`
    /// fields come from the first scenario.
    ///
    /// # Errors
    ///
    /// [`ChipError::Configuration`] for an empty list or disagreeing `Equal`
    /// fields.
    pub fn covering(scenarios: &[Self]) -> Result<Self> {
        let Some(first) = scenarios.first() else {
            return Err(ChipError::configuration("no scenarios to cover"));
        };
        let mut out = *first;
        for scenario in &scenarios[1..] {
            for field in ArchField::ALL {
                if field.rule() == FieldRule::AtLeast && scenario.get(field) > out.get(field) {
                    out = out.with_field(field, scenario.get(field))?;
                }
            }
        }
        for scenario in scenarios {
            out.check_covers(scenario)?;
        }
        Ok(out)
    }

    /// Check that `self` can run a scenario generated for `scenario`.
    ///
    /// # Errors
    ///
    /// [`ChipError::Configuration`] naming the first violated field.
    pub fn check_covers(&self, scenario: &Self) -> Result<()> {
        for field in ArchField::ALL {
            let (have, need) = (self.get(field), scenario.get(field));
            match field.rule() {
                FieldRule::Equal if have != need => {
                    return Err(ChipError::configuration(format!(
                        "{} must be identical across scenarios ({have} vs {need})",
                        field.name()
                    )));
                }
                FieldRule::AtLeast if have < need => {
                    return Err(ChipError::configuration(format!(
                        "{} is {have}, scenario needs at least {need}",
                        field.name()
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl Default for ArchitectureParams {
    fn default() -> Self {
        Self::REFERENCE
    }
}

/// How a field must relate across scenarios sharing one architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRule {
    /// Identical in every scenario.
    Equal,
    /// Free to differ.
    Any,
    /// Shared architecture must be at least as large.
    AtLeast,
}

/// Field selector for [`ArchitectureParams`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ArchField {
    GridDimensionX,
    GridDimensionY,
    OutputCoreX,
    OutputCoreY,
    NumOutputs,
    NumNeurons,
    NumAxons,
    NumTicks,
    NumWeights,
    NumResetModes,
    PotentialWidth,
    WeightWidth,
    LeakWidth,
    ThresholdWidth,
    MaxDimensionX,
    MaxDimensionY,
    RouterBufferDepth,
    DmaBusWidth,
    DmaFrameHeaderWordWidth,
    ClockCyclesPerTick,
}

/// Cross-scenario rule for every field.
pub const FIELD_RULES: [(ArchField, FieldRule); 20] = [
    (ArchField::GridDimensionX, FieldRule::AtLeast),
    (ArchField::GridDimensionY, FieldRule::AtLeast),
    (ArchField::OutputCoreX, FieldRule::Any),
    (ArchField::OutputCoreY, FieldRule::Any),
    (ArchField::NumOutputs, FieldRule::AtLeast),
    (ArchField::NumNeurons, FieldRule::AtLeast),
    (ArchField::NumAxons, FieldRule::AtLeast),
    (ArchField::NumTicks, FieldRule::AtLeast),
    (ArchField::NumWeights, FieldRule::AtLeast),
    (ArchField::NumResetModes, FieldRule::AtLeast),
    (ArchField::PotentialWidth, FieldRule::AtLeast),
    (ArchField::WeightWidth, FieldRule::AtLeast),
    (ArchField::LeakWidth, FieldRule::AtLeast),
    (ArchField::ThresholdWidth, FieldRule::AtLeast),
    (ArchField::MaxDimensionX, FieldRule::AtLeast),
    (ArchField::MaxDimensionY, FieldRule::AtLeast),
    (ArchField::RouterBufferDepth, FieldRule::AtLeast),
    (ArchField::DmaBusWidth, FieldRule::Equal),
    (ArchField::DmaFrameHeaderWordWidth, FieldRule::Equal),
    (ArchField::ClockCyclesPerTick, FieldRule::AtLeast),
];

impl ArchField {
    /// Every field, in declaration order.
    pub const ALL: [Self; 20] = {
        let mut out = [Self::GridDimensionX; 20];
        let mut i = 0;
        while i < 20 {
            out[i] = FIELD_RULES[i].0;
            i += 1;
        }
        out
    };

    /// Cross-scenario rule.
    #[must_use]
    pub const fn rule(self) -> FieldRule {
        FIELD_RULES[self as usize].1
    }

    /// Serialized name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::GridDimensionX => "grid_dimension_x",
            Self::GridDimensionY => "grid_dimension_y",
            Self::OutputCoreX => "output_core_x",
            Self::OutputCoreY => "output_core_y",
            Self::NumOutputs => "num_outputs",
            Self::NumNeurons => "num_neurons",
            Self::NumAxons => "num_axons",
            Self::NumTicks => "num_ticks",
            Self::NumWeights => "num_weights",
            Self::NumResetModes => "num_reset_modes",
            Self::PotentialWidth => "potential_width",
            Self::WeightWidth => "weight_width",
            Self::LeakWidth => "leak_width",
            Self::ThresholdWidth => "threshold_width",
            Self::MaxDimensionX => "max_dimension_x",
            Self::MaxDimensionY => "max_dimension_y",
            Self::RouterBufferDepth => "router_buffer_depth",
            Self::DmaBusWidth => "dma_bus_width",
            Self::DmaFrameHeaderWordWidth => "dma_frame_header_word_width",
            Self::ClockCyclesPerTick => "clock_cycles_per_tick",
        }
    }

    /// Look a field up by its serialized name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.name() == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_widths() {
        let a = ArchitectureParams::REFERENCE;
        a.validate().unwrap();
        assert_eq!(a.weight_select_width(), 2);
        assert_eq!(a.reset_mode_width(), 2);
        assert_eq!(a.dx_width(), 9);
        assert_eq!(a.dst_axon_width(), 5);
        assert_eq!(a.tick_width(), 4);
        assert_eq!(a.packet_width(), 27);
        // 32 + 18 + 36 + 9 + 18 + 2 + 27
        assert_eq!(a.neuron_record_width(), 142);
        assert_eq!(a.neuron_element_width(), 256);
        assert_eq!(a.neuron_table_words(), 128);
        assert_eq!(a.axon_table_words(), 1);
        assert_eq!(a.packet_word_width().unwrap(), 32);
        assert_eq!(a.output_word_width().unwrap(), 8);
        assert_eq!(a.header_beats().unwrap(), 4);
    }

    #[test]
    fn fields_ordered_by_discriminant() {
        for (i, field) in ArchField::ALL.iter().enumerate() {
            assert_eq!(*field as usize, i);
            assert_eq!(ArchField::from_name(field.name()), Some(*field));
        }
    }

    #[test]
    fn with_field_copies() {
        let a = ArchitectureParams::REFERENCE;
        let b = a.with_field(ArchField::NumAxons, 64).unwrap();
        assert_eq!(a.num_axons, 32);
        assert_eq!(b.num_axons, 64);
        assert_eq!(b.get(ArchField::NumAxons), 64);
        assert!(a.with_field(ArchField::NumAxons, u64::MAX).is_err());
    }

    #[test]
    fn validate_rejects_bad_configs() {
        let a = ArchitectureParams::REFERENCE;
        assert!(a.with_field(ArchField::OutputCoreX, 4).unwrap().validate().is_err());
        assert!(a.with_field(ArchField::NumOutputs, 33).unwrap().validate().is_err());
        assert!(a.with_field(ArchField::DmaBusWidth, 48).unwrap().validate().is_err());
        assert!(a
            .with_field(ArchField::DmaFrameHeaderWordWidth, 16)
            .unwrap()
            .validate()
            .is_err());
        assert!(matches!(
            a.with_field(ArchField::PotentialWidth, 65).unwrap().validate(),
            Err(ChipError::WidthTooLarge { width: 65 })
        ));
        for bus in [8, 16, 32, 64, 128] {
            let ok = a.with_field(ArchField::DmaBusWidth, bus).unwrap();
            assert_eq!(ok.header_beats().unwrap(), 128 / bus as u32);
        }
    }

    #[test]
    fn covering_applies_rules() {
        let a = ArchitectureParams::REFERENCE;
        let b = a
            .with_field(ArchField::NumAxons, 64)
            .unwrap()
            .with_field(ArchField::OutputCoreX, 3)
            .unwrap();
        let c = ArchitectureParams::covering(&[a, b]).unwrap();
        assert_eq!(c.num_axons, 64);
        assert_eq!(c.output_core_x, 0);

        let d = a.with_field(ArchField::DmaBusWidth, 64).unwrap();
        assert!(ArchitectureParams::covering(&[a, d]).is_err());
        assert!(ArchitectureParams::covering(&[]).is_err());
        assert!(a.check_covers(&b).is_err());
    }

    #[test]
    fn json_round_trip() {
        let a = ArchitectureParams::REFERENCE;
        let text = serde_json::to_string(&a).unwrap();
        assert!(text.contains("\"dma_bus_width\":32"));
        let back: ArchitectureParams = serde_json::from_str(&text).unwrap();
        assert_eq!(a, back);
    }
}
