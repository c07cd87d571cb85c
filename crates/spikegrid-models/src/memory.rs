// SPDX-License-Identifier: AGPL-3.0-only

//! Per-core memory images.
//!
//! A core's memory is two tables: the axon table (one weight-selector field
//! per axon) and the neuron table (one full neuron record per neuron). On
//! disk each table is a text file with one binary line per element, most
//! significant bit first. On the bus both tables travel as 64-bit words,
//! each element padded to the next power of two.

use crate::error::{ModelError, Result};
use spikegrid_chip::bitfield::{pack_elements, parse_bit_lines, unpack_elements};
use spikegrid_chip::{ArchitectureParams, BitString};
use std::fs;
use std::path::Path;

/// Raw axon and neuron table lines of one core.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryImage {
    /// Axon table, one weight-selector line per axon.
    pub axons: Vec<BitString>,
    /// Neuron table, one record line per neuron.
    pub neurons: Vec<BitString>,
}

impl MemoryImage {
    /// Parse both tables from text.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Chip`] wrapping a parse error for non-binary content.
    pub fn parse(axon_text: &str, neuron_text: &str) -> Result<Self> {
        Ok(Self {
            axons: parse_bit_lines(axon_text)?,
            neurons: parse_bit_lines(neuron_text)?,
        })
    }

    /// Read both tables from disk.
    ///
    /// # Errors
    ///
    /// I/O or parse errors.
    pub fn read(axon_path: &Path, neuron_path: &Path) -> Result<Self> {
        tracing::debug!(
            "Reading memory image {} / {}",
            axon_path.display(),
            neuron_path.display()
        );
        let axon_text = fs::read_to_string(axon_path)?;
        let neuron_text = fs::read_to_string(neuron_path)?;
        Self::parse(&axon_text, &neuron_text)
    }

    /// Write both tables to disk.
    ///
    /// # Errors
    ///
    /// I/O errors.
    pub fn write(&self, axon_path: &Path, neuron_path: &Path) -> Result<()> {
        fs::write(axon_path, self.axon_text())?;
        fs::write(neuron_path, self.neuron_text())?;
        Ok(())
    }

    /// Axon table as text.
    #[must_use]
    pub fn axon_text(&self) -> String {
        render(&self.axons)
    }

    /// Neuron table as text.
    #[must_use]
    pub fn neuron_text(&self) -> String {
        render(&self.neurons)
    }

    /// Pack into the CORE_DATA payload: axon table words then neuron table words.
    ///
    /// # Errors
    ///
    /// [`ModelError::Configuration`] if the table sizes do not match `arch`.
    pub fn to_words(&self, arch: &ArchitectureParams) -> Result<Vec<u64>> {
        self.check_shape(arch)?;
        let mut words = pack_elements(&self.axons, arch.weight_select_width() as usize)?;
        words.extend(pack_elements(
            &self.neurons,
            arch.neuron_record_width() as usize,
        )?);
        Ok(words)
    }

    /// Inverse of [`MemoryImage::to_words`].
    ///
    /// # Errors
    ///
    /// [`ModelError::Parse`] if `words` has the wrong length.
    pub fn from_words(words: &[u64], arch: &ArchitectureParams) -> Result<Self> {
        let split = arch.axon_table_words();
        if words.len() != arch.core_data_words() {
            return Err(ModelError::parse_error(format!(
                "core payload has {} words, expected {}",
                words.len(),
                arch.core_data_words()
            )));
        }
        Ok(Self {
            axons: unpack_elements(
                &words[..split],
                arch.weight_select_width() as usize,
                arch.num_axons as usize,
            )?,
            neurons: unpack_elements(
                &words[split..],
                arch.neuron_record_width() as usize,
                arch.num_neurons as usize,
            )?,
        })
    }

    fn check_shape(&self, arch: &ArchitectureParams) -> Result<()> {
        if self.axons.len() != arch.num_axons as usize
            || self.neurons.len() != arch.num_neurons as usize
        {
            return Err(ModelError::configuration(format!(
                "image has {} axons / {} neurons, architecture expects {} / {}",
                self.axons.len(),
                self.neurons.len(),
                arch.num_axons,
                arch.num_neurons
            )));
        }
        Ok(())
    }
}

fn render(lines: &[BitString]) -> String {
    let mut out = String::new();
    for line in lines {
        out.push_str(&line.to_string());
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use spikegrid_chip::ArchField;

    fn tiny() -> ArchitectureParams {
        ArchitectureParams::REFERENCE
            .with_field(ArchField::NumAxons, 4)
            .unwrap()
            .with_field(ArchField::NumNeurons, 2)
            .unwrap()
            .with_field(ArchField::NumOutputs, 4)
            .unwrap()
    }

    #[test]
    fn test_parse_skips_comments() {
        let image = MemoryImage::parse("// axons\n01\n10\n\n00\n11\n", "").unwrap();
        assert_eq!(image.axons.len(), 4);
        assert_eq!(image.axons[1].to_string(), "10");
        assert!(image.neurons.is_empty());
        assert!(MemoryImage::parse("0a\n", "").is_err());
    }

    #[test]
    fn test_words_round_trip() {
        let arch = tiny();
        let width = arch.neuron_record_width() as usize;
        let mut n0 = BitString::zeros(width);
        n0.set(0, true);
        n0.set(width - 1, true);
        let image = MemoryImage {
            axons: ["01", "10", "00", "11"]
                .iter()
                .map(|s| BitString::parse(s).unwrap())
                .collect(),
            neurons: vec![n0, BitString::zeros(width)],
        };
        let words = image.to_words(&arch).unwrap();
        assert_eq!(words.len(), arch.core_data_words());
        // axon selectors, two bits each
        assert_eq!(words[0], 0b11_00_10_01);
        let back = MemoryImage::from_words(&words, &arch).unwrap();
        assert_eq!(back, image);
        assert!(MemoryImage::from_words(&words[1..], &arch).is_err());
    }

    #[test]
    fn test_text_files() {
        let dir = tempfile::tempdir().unwrap();
        let image = MemoryImage::parse("01\n10\n", "111\n").unwrap();
        let (a, n) = (dir.path().join("a.mem"), dir.path().join("n.mem"));
        image.write(&a, &n).unwrap();
        assert_eq!(MemoryImage::read(&a, &n).unwrap(), image);
    }
}
