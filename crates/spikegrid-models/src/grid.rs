// SPDX-License-Identifier: AGPL-3.0-only

//! The compiled grid model handed to the driver.

use crate::error::{AddressingConflict, ModelError, Result};
use crate::packet::{Packet, PacketSchedule};
use crate::record::CoreRecord;
use spikegrid_chip::ArchitectureParams;

/// Cores in row-major order plus the input and expected-output schedules.
///
/// The output coordinate never holds a core, positions are unique and lie
/// inside the grid, and every core's tables match the architecture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridModel {
    arch: ArchitectureParams,
    cores: Vec<CoreRecord>,
    inputs: PacketSchedule<Packet>,
    outputs: PacketSchedule<u32>,
}

impl GridModel {
    /// Assemble a model, sorting cores row-major.
    ///
    /// # Errors
    ///
    /// [`ModelError::Configuration`] if any structural invariant fails.
    pub fn new(
        arch: ArchitectureParams,
        mut cores: Vec<CoreRecord>,
        inputs: PacketSchedule<Packet>,
        outputs: PacketSchedule<u32>,
    ) -> Result<Self> {
        arch.validate()?;
        cores.sort_by_key(|c| (c.y(), c.x()));
        for pair in cores.windows(2) {
            if pair[0].position() == pair[1].position() {
                return Err(ModelError::configuration(format!(
                    "two cores at {:?}",
                    pair[0].position()
                )));
            }
        }
        for core in &cores {
            check_core(&arch, core)?;
        }
        if let Some(axon) = outputs.packets().iter().find(|a| **a >= arch.num_outputs) {
            return Err(ModelError::configuration(format!(
                "expected output axon {axon} outside {} outputs",
                arch.num_outputs
            )));
        }
        Ok(Self {
            arch,
            cores,
            inputs,
            outputs,
        })
    }

    /// Architecture the model is encoded for.
    #[must_use]
    pub const fn arch(&self) -> &ArchitectureParams {
        &self.arch
    }

    /// Cores in row-major order.
    #[must_use]
    pub fn cores(&self) -> &[CoreRecord] {
        &self.cores
    }

    /// Host-injected packets per tick.
    #[must_use]
    pub const fn inputs(&self) -> &PacketSchedule<Packet> {
        &self.inputs
    }

    /// Expected output axons per tick.
    #[must_use]
    pub const fn outputs(&self) -> &PacketSchedule<u32> {
        &self.outputs
    }

    /// Core at `(x, y)`, if present.
    #[must_use]
    pub fn core(&self, x: u32, y: u32) -> Option<&CoreRecord> {
        self.cores
            .binary_search_by_key(&(y, x), |c| (c.y(), c.x()))
            .ok()
            .map(|i| &self.cores[i])
    }

    pub(crate) fn cores_mut(&mut self) -> &mut [CoreRecord] {
        &mut self.cores
    }

    pub(crate) fn inputs_mut(&mut self) -> &mut PacketSchedule<Packet> {
        &mut self.inputs
    }

    pub(crate) fn outputs_mut(&mut self) -> &mut PacketSchedule<u32> {
        &mut self.outputs
    }

    /// Insert a core, or replace the one at its position.
    ///
    /// # Errors
    ///
    /// [`ModelError::Configuration`] if the core violates a grid invariant.
    pub fn insert_core(&mut self, core: CoreRecord) -> Result<Option<CoreRecord>> {
        check_core(&self.arch, &core)?;
        let key = (core.y(), core.x());
        match self.cores.binary_search_by_key(&key, |c| (c.y(), c.x())) {
            Ok(i) => Ok(Some(std::mem::replace(&mut self.cores[i], core))),
            Err(i) => {
                self.cores.insert(i, core);
                Ok(None)
            }
        }
    }

    /// Remove the core at `(x, y)`.
    pub fn remove_core(&mut self, x: u32, y: u32) -> Option<CoreRecord> {
        self.cores
            .binary_search_by_key(&(y, x), |c| (c.y(), c.x()))
            .ok()
            .map(|i| self.cores.remove(i))
    }

    /// True if `(x, y, axon)` is a live target: a used axon of a present
    /// core, or an output axon.
    #[must_use]
    pub fn is_live_axon(&self, x: i64, y: i64, axon: u32) -> bool {
        let (Ok(ux), Ok(uy)) = (u32::try_from(x), u32::try_from(y)) else {
            return false;
        };
        if self.arch.is_output_core(ux, uy) {
            return axon < self.arch.num_outputs;
        }
        self.core(ux, uy)
            .is_some_and(|c| c.usage().used_axons.binary_search(&axon).is_ok())
    }

    /// Smallest `(x, y)` extent covering every core and the output core.
    #[must_use]
    pub fn extent(&self) -> (u32, u32) {
        self.cores.iter().fold(
            (self.arch.output_core_x + 1, self.arch.output_core_y + 1),
            |(x, y), c| (x.max(c.x() + 1), y.max(c.y() + 1)),
        )
    }

    /// Re-encode the model for a wider `target`.
    ///
    /// Cores and input packets on the two output coordinates trade places
    /// when the architectures disagree on where the output core sits.
    ///
    /// # Errors
    ///
    /// [`ModelError::Configuration`] if `target` cannot hold the model, or
    /// any encoding error.
    pub fn retarget(&self, target: &ArchitectureParams) -> Result<Self> {
        if *target == self.arch {
            return Ok(self.clone());
        }
        target.validate()?;
        let source = &self.arch;
        let mut cores = Vec::with_capacity(self.cores.len());
        for core in &self.cores {
            let image = core.encode(source)?;
            cores.push(CoreRecord::decode(&image, source, target, core.x(), core.y())?);
        }
        let mut inputs = self.inputs.clone();
        if source.output_core() != target.output_core() {
            let s = (i64::from(source.output_core_x), i64::from(source.output_core_y));
            let t = (i64::from(target.output_core_x), i64::from(target.output_core_y));
            inputs.try_for_each_mut(|p| {
                if (p.dx, p.dy) == s {
                    (p.dx, p.dy) = t;
                } else if (p.dx, p.dy) == t {
                    (p.dx, p.dy) = s;
                }
                Ok::<(), ModelError>(())
            })?;
        }
        tracing::debug!(
            "Retargeted {} cores from {}x{} to {}x{}",
            cores.len(),
            source.grid_dimension_x,
            source.grid_dimension_y,
            target.grid_dimension_x,
            target.grid_dimension_y
        );
        Self::new(*target, cores, inputs, self.outputs.clone())
    }

    /// Check that every used neuron and every input packet reaches a core
    /// in the grid (or an output axon).
    ///
    /// # Errors
    ///
    /// [`AddressingConflict::UnresolvedDestination`] for the first dangling
    /// address.
    pub fn check_destinations(&self) -> Result<()> {
        let reachable = |x: i64, y: i64, axon: u32| {
            let (Ok(ux), Ok(uy)) = (u32::try_from(x), u32::try_from(y)) else {
                return false;
            };
            if self.arch.is_output_core(ux, uy) {
                axon < self.arch.num_outputs
            } else {
                self.core(ux, uy).is_some() && axon < self.arch.num_axons
            }
        };
        for core in &self.cores {
            for &n in &core.usage().used_neurons {
                if let Some((x, y, axon)) = core.destination_of(n as usize) {
                    if !reachable(x, y, axon) {
                        return Err(AddressingConflict::UnresolvedDestination { x, y, axon }.into());
                    }
                }
            }
        }
        for packet in self.inputs.packets() {
            let (x, y, axon) = packet.address();
            if !reachable(x, y, axon) {
                return Err(AddressingConflict::UnresolvedDestination { x, y, axon }.into());
            }
        }
        Ok(())
    }
}

fn check_core(arch: &ArchitectureParams, core: &CoreRecord) -> Result<()> {
    let (x, y) = core.position();
    if arch.is_output_core(x, y) {
        return Err(ModelError::configuration(format!(
            "core placed on the output coordinate ({x}, {y})"
        )));
    }
    if x >= arch.grid_dimension_x || y >= arch.grid_dimension_y {
        return Err(ModelError::configuration(format!(
            "core ({x}, {y}) outside {}x{} grid",
            arch.grid_dimension_x, arch.grid_dimension_y
        )));
    }
    if core.axons().len() != arch.num_axons as usize
        || core.neurons().len() != arch.num_neurons as usize
    {
        return Err(ModelError::configuration(format!(
            "core ({x}, {y}) tables do not match the architecture"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Destination, NeuronRecord};

    fn wired(arch: &ArchitectureParams, x: u32, y: u32, dst: Destination) -> CoreRecord {
        let mut core = CoreRecord::empty(x, y, arch);
        let mut n = NeuronRecord::unused(arch);
        n.axons.set(3, true);
        n.destination = dst;
        core.set_neuron(0, n).unwrap();
        core
    }

    #[test]
    fn test_cores_sorted_and_unique() {
        let arch = ArchitectureParams::REFERENCE;
        let cores = vec![
            CoreRecord::empty(1, 1, &arch),
            CoreRecord::empty(2, 0, &arch),
            CoreRecord::empty(1, 0, &arch),
        ];
        let mut model =
            GridModel::new(arch, cores, PacketSchedule::default(), PacketSchedule::default())
                .unwrap();
        let order: Vec<_> = model.cores().iter().map(CoreRecord::position).collect();
        assert_eq!(order, vec![(1, 0), (2, 0), (1, 1)]);
        assert!(model.core(2, 0).is_some());
        assert!(model.core(3, 0).is_none());
        assert!(model.insert_core(CoreRecord::empty(0, 0, &arch)).is_err());
        assert!(model
            .insert_core(CoreRecord::empty(1, 0, &arch))
            .unwrap()
            .is_some());
        assert!(model.remove_core(2, 0).is_some());
        assert_eq!(model.extent(), (2, 2));

        let dup = vec![CoreRecord::empty(1, 0, &arch), CoreRecord::empty(1, 0, &arch)];
        assert!(GridModel::new(arch, dup, PacketSchedule::default(), PacketSchedule::default())
            .is_err());
    }

    #[test]
    fn test_destinations_and_live_axons() {
        let arch = ArchitectureParams::REFERENCE;
        let to_output = Destination {
            dx: -1,
            dy: 0,
            axon: 5,
            tick: 2,
        };
        let core = wired(&arch, 1, 0, to_output);
        let inputs = PacketSchedule::new(
            vec![Packet {
                tick: 1,
                axon: 3,
                dx: 1,
                dy: 0,
            }],
            vec![1],
        )
        .unwrap();
        let model =
            GridModel::new(arch, vec![core], inputs, PacketSchedule::default()).unwrap();
        model.check_destinations().unwrap();
        assert!(model.is_live_axon(1, 0, 3));
        assert!(!model.is_live_axon(1, 0, 4));
        assert!(model.is_live_axon(0, 0, 5));
        assert!(!model.is_live_axon(-1, 0, 0));

        let dangling = wired(
            &arch,
            1,
            0,
            Destination {
                dx: 1,
                ..to_output
            },
        );
        let model = GridModel::new(
            arch,
            vec![dangling],
            PacketSchedule::default(),
            PacketSchedule::default(),
        )
        .unwrap();
        assert!(matches!(
            model.check_destinations(),
            Err(ModelError::Addressing(
                AddressingConflict::UnresolvedDestination { x: 2, y: 0, axon: 5 }
            ))
        ));
    }
}
