// SPDX-License-Identifier: AGPL-3.0-only

//! Address translation for relocated components.
//!
//! Every relocated axon gets one entry `(old core, old axon) -> (new core,
//! new axon)`; output axons map to themselves at the (possibly moved) output
//! coordinate. Neuron destinations and input packets are rewritten through
//! the table, and an address with no entry is an error rather than a silent
//! pass-through.

use crate::error::{AddressingConflict, ModelError, Result};
use crate::grid::GridModel;
use crate::packet::{Packet, PacketSchedule};
use crate::record::CoreRecord;
use crate::usage::Component;
use spikegrid_chip::{ArchitectureParams, BitString};
use std::collections::{BTreeMap, BTreeSet};

/// An absolute `(x, y, axon)` address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AxonAddress {
    /// Core X.
    pub x: i64,
    /// Core Y.
    pub y: i64,
    /// Axon index.
    pub axon: u32,
}

impl AxonAddress {
    /// Address of `axon` on core `(x, y)`.
    #[must_use]
    pub fn new(x: impl Into<i64>, y: impl Into<i64>, axon: u32) -> Self {
        Self {
            x: x.into(),
            y: y.into(),
            axon,
        }
    }

    fn occupied(self) -> AddressingConflict {
        AddressingConflict::OccupiedDestination {
            x: self.x,
            y: self.y,
            axon: self.axon,
        }
    }

    fn unresolved(self) -> AddressingConflict {
        AddressingConflict::UnresolvedDestination {
            x: self.x,
            y: self.y,
            axon: self.axon,
        }
    }
}

/// Injective map from old to new axon addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranslationTable {
    forward: BTreeMap<AxonAddress, AxonAddress>,
    targets: BTreeSet<AxonAddress>,
}

impl TranslationTable {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `from` to `to`.
    ///
    /// # Errors
    ///
    /// [`AddressingConflict::OccupiedDestination`] if another source already
    /// maps to `to`; [`ModelError::Configuration`] if `from` is already
    /// mapped elsewhere.
    pub fn insert(&mut self, from: AxonAddress, to: AxonAddress) -> Result<()> {
        match self.forward.get(&from) {
            Some(existing) if *existing == to => return Ok(()),
            Some(existing) => {
                return Err(ModelError::configuration(format!(
                    "{from:?} already maps to {existing:?}"
                )))
            }
            None => {}
        }
        if !self.targets.insert(to) {
            return Err(to.occupied().into());
        }
        self.forward.insert(from, to);
        Ok(())
    }

    /// Image of `from`, if mapped.
    #[must_use]
    pub fn resolve(&self, from: AxonAddress) -> Option<AxonAddress> {
        self.forward.get(&from).copied()
    }

    /// Entries in address order.
    pub fn iter(&self) -> impl Iterator<Item = (&AxonAddress, &AxonAddress)> {
        self.forward.iter()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    /// True if nothing is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}

/// Copy `component` of `source` onto `destination`.
///
/// The component's axons land at `base_axon..base_axon + len` and its
/// neurons on the destination's lowest unused neurons. Bitmaps are remapped
/// to the new axon numbering and every neuron destination is rewritten
/// through `table` relative to the destination core. Returns the neuron
/// slots used.
///
/// # Errors
///
/// - [`ModelError::Configuration`] if the architectures differ in weight or
///   tick count
/// - [`AddressingConflict::OccupiedDestination`] if a target axon is in use
/// - [`AddressingConflict::UnusedAxonMoved`] if a source axon is unused
/// - [`ModelError::InfeasibleAllocation`] if too few neurons are free
/// - [`AddressingConflict::UnresolvedDestination`] for an untranslated
///   neuron destination
pub fn relocate_component(
    source: &CoreRecord,
    component: &Component,
    destination: &mut CoreRecord,
    base_axon: u32,
    table: &TranslationTable,
    source_arch: &ArchitectureParams,
    target_arch: &ArchitectureParams,
) -> Result<Vec<u32>> {
    if source_arch.num_weights != target_arch.num_weights
        || source_arch.num_ticks != target_arch.num_ticks
    {
        return Err(ModelError::configuration(
            "relocation requires matching weight and tick counts",
        ));
    }
    let (dx0, dy0) = destination.position();
    let new_axons: Vec<u32> = (base_axon..).take(component.axons.len()).collect();

    let dst_usage = destination.usage();
    for &a in &new_axons {
        if a >= target_arch.num_axons || dst_usage.unused_axons.binary_search(&a).is_err() {
            return Err(AxonAddress::new(dx0, dy0, a).occupied().into());
        }
    }
    let src_usage = source.usage();
    for &a in &component.axons {
        if src_usage.used_axons.binary_search(&a).is_err() {
            return Err(AddressingConflict::UnusedAxonMoved {
                x: i64::from(source.x()),
                y: i64::from(source.y()),
                axon: a,
            }
            .into());
        }
    }
    if dst_usage.unused_neurons.len() < component.neurons.len() {
        return Err(ModelError::infeasible(format!(
            "core ({dx0}, {dy0}) has {} free neurons, component needs {}",
            dst_usage.unused_neurons.len(),
            component.neurons.len()
        )));
    }
    let new_neurons: Vec<u32> = dst_usage.unused_neurons[..component.neurons.len()].to_vec();

    for (&old, &new) in component.axons.iter().zip(&new_axons) {
        destination.set_axon(new as usize, source.axons()[old as usize])?;
    }

    for (&old, &new) in component.neurons.iter().zip(&new_neurons) {
        let mut neuron = source.neurons()[old as usize].clone();
        let mut bitmap = BitString::zeros(target_arch.num_axons as usize);
        for a in neuron.axons.ones() {
            let a = u32::try_from(a).unwrap_or(u32::MAX);
            let slot = component.axons.binary_search(&a).map_err(|_| {
                ModelError::configuration(format!(
                    "neuron {old} of core {:?} listens outside its component",
                    source.position()
                ))
            })?;
            bitmap.set(new_axons[slot] as usize, true);
        }
        neuron.axons = bitmap;
        neuron.weights.resize(target_arch.num_weights as usize, 0);

        let (x, y, axon) = source
            .destination_of(old as usize)
            .ok_or_else(|| ModelError::configuration(format!("neuron {old} out of range")))?;
        let from = AxonAddress::new(x, y, axon);
        let to = table.resolve(from).ok_or_else(|| from.unresolved())?;
        neuron.destination.dx = to.x - i64::from(dx0);
        neuron.destination.dy = to.y - i64::from(dy0);
        neuron.destination.axon = to.axon;
        destination.set_neuron(new as usize, neuron)?;
    }

    tracing::debug!(
        "Moved axons {:?} of core {:?} to axons {}..{} of core ({}, {})",
        component.axons,
        source.position(),
        base_axon,
        base_axon as usize + new_axons.len(),
        dx0,
        dy0
    );
    Ok(new_neurons)
}

/// Rewrite every input packet's absolute destination through `table`.
///
/// # Errors
///
/// [`AddressingConflict::UnresolvedDestination`] for a packet that addresses
/// nothing in the table.
pub fn retarget_packets(
    schedule: &mut PacketSchedule<Packet>,
    table: &TranslationTable,
) -> Result<()> {
    schedule.try_for_each_mut(|packet: &mut Packet| {
        let (x, y, axon) = packet.address();
        let from = AxonAddress::new(x, y, axon);
        let to = table.resolve(from).ok_or_else(|| from.unresolved())?;
        packet.dx = to.x;
        packet.dy = to.y;
        packet.axon = to.axon;
        Ok::<(), ModelError>(())
    })
}

/// Renumber the output axons actually driven to a dense `0..K` range.
///
/// Updates every neuron and input packet that targets the output core and
/// every expected output. Returns `K`.
///
/// # Errors
///
/// [`AddressingConflict::UnexpectedOutputAxon`] if an expected output names
/// an axon nothing drives.
pub fn pack_output_axons(model: &mut GridModel) -> Result<u32> {
    let (ox, oy) = model.arch().output_core();
    let (ox, oy) = (i64::from(ox), i64::from(oy));

    let mut driven = BTreeSet::new();
    for core in model.cores() {
        for &n in &core.usage().used_neurons {
            if let Some((x, y, axon)) = core.destination_of(n as usize) {
                if (x, y) == (ox, oy) {
                    driven.insert(axon);
                }
            }
        }
    }
    for packet in model.inputs().packets() {
        if (packet.dx, packet.dy) == (ox, oy) {
            driven.insert(packet.axon);
        }
    }
    let renumber: BTreeMap<u32, u32> = driven.iter().copied().zip(0..).collect();
    for (old, new) in &renumber {
        if old != new {
            tracing::debug!("Output axon {} becomes {}", old, new);
        }
    }

    let outputs = model.outputs_mut();
    if let Some(axon) = outputs
        .packets()
        .iter()
        .find(|a| !renumber.contains_key(*a))
    {
        return Err(AddressingConflict::UnexpectedOutputAxon { axon: *axon }.into());
    }
    outputs.try_for_each_mut(|axon: &mut u32| {
        *axon = renumber[&*axon];
        Ok::<(), ModelError>(())
    })?;

    model.inputs_mut().try_for_each_mut(|packet: &mut Packet| {
        if (packet.dx, packet.dy) == (ox, oy) {
            packet.axon = renumber[&packet.axon];
        }
        Ok::<(), ModelError>(())
    })?;

    for core in model.cores_mut() {
        let retarget: Vec<(usize, u32)> = core
            .usage()
            .used_neurons
            .iter()
            .filter_map(|&n| {
                let (x, y, axon) = core.destination_of(n as usize)?;
                if (x, y) != (ox, oy) {
                    return None;
                }
                let packed = *renumber.get(&axon)?;
                (packed != axon).then_some((n as usize, packed))
            })
            .collect();
        for (n, axon) in retarget {
            let mut neuron = core.neurons()[n].clone();
            neuron.destination.axon = axon;
            core.set_neuron(n, neuron)?;
        }
    }

    let count = u32::try_from(renumber.len()).unwrap_or(u32::MAX);
    tracing::info!("Packed {} output axons", count);
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Destination, NeuronRecord};
    use spikegrid_chip::ArchField;

    fn arch() -> ArchitectureParams {
        ArchitectureParams::REFERENCE
            .with_field(ArchField::NumAxons, 8)
            .unwrap()
            .with_field(ArchField::NumNeurons, 4)
            .unwrap()
            .with_field(ArchField::NumOutputs, 8)
            .unwrap()
    }

    fn neuron(arch: &ArchitectureParams, axons: &[usize], dx: i64, dy: i64, axon: u32) -> NeuronRecord {
        let mut n = NeuronRecord::unused(arch);
        for a in axons {
            n.axons.set(*a, true);
        }
        n.weights = vec![1, 2, 3, 4];
        n.destination = Destination {
            dx,
            dy,
            axon,
            tick: 1,
        };
        n
    }

    #[test]
    fn test_table_rejects_collisions() {
        let mut t = TranslationTable::new();
        let a = AxonAddress::new(1, 0, 3);
        let b = AxonAddress::new(2, 0, 3);
        let to = AxonAddress::new(1, 1, 0);
        t.insert(a, to).unwrap();
        t.insert(a, to).unwrap();
        assert_eq!(t.len(), 1);
        assert!(matches!(
            t.insert(b, to),
            Err(ModelError::Addressing(
                AddressingConflict::OccupiedDestination { x: 1, y: 1, axon: 0 }
            ))
        ));
        assert!(t.insert(a, AxonAddress::new(1, 1, 1)).is_err());
        assert_eq!(t.resolve(a), Some(to));
        assert_eq!(t.resolve(b), None);
    }

    #[test]
    fn test_relocate_component() {
        let arch = arch();
        // neuron 1 listens to axons 2 and 6 and sends to axon 0 of output (0,0)
        let mut src = CoreRecord::empty(2, 0, &arch);
        src.set_axon(2, 1).unwrap();
        src.set_axon(6, 3).unwrap();
        src.set_neuron(1, neuron(&arch, &[2, 6], -2, 0, 0)).unwrap();
        let component = src.usage().components[0].clone();

        let mut table = TranslationTable::new();
        table
            .insert(AxonAddress::new(2, 0, 2), AxonAddress::new(1, 1, 4))
            .unwrap();
        table
            .insert(AxonAddress::new(2, 0, 6), AxonAddress::new(1, 1, 5))
            .unwrap();
        table
            .insert(AxonAddress::new(0, 0, 0), AxonAddress::new(0, 0, 0))
            .unwrap();

        let mut dst = CoreRecord::empty(1, 1, &arch);
        dst.set_neuron(0, neuron(&arch, &[0], -1, -1, 1)).unwrap();
        let slots = relocate_component(&src, &component, &mut dst, 4, &table, &arch, &arch).unwrap();
        assert_eq!(slots, vec![1]);
        assert_eq!(dst.axons()[4], 1);
        assert_eq!(dst.axons()[5], 3);
        let moved = &dst.neurons()[1];
        assert_eq!(moved.axons.ones().collect::<Vec<_>>(), vec![4, 5]);
        assert_eq!(dst.destination_of(1), Some((0, 0, 0)));
        assert_eq!(moved.weights, vec![1, 2, 3, 4]);

        // the same axons are now taken
        assert!(matches!(
            relocate_component(&src, &component, &mut dst, 4, &table, &arch, &arch),
            Err(ModelError::Addressing(
                AddressingConflict::OccupiedDestination { .. }
            ))
        ));
    }

    #[test]
    fn test_relocate_rejects_unused_and_unresolved() {
        let arch = arch();
        let mut src = CoreRecord::empty(2, 0, &arch);
        src.set_neuron(0, neuron(&arch, &[1], 0, 1, 7)).unwrap();
        let table = TranslationTable::new();
        let mut dst = CoreRecord::empty(1, 0, &arch);

        let bogus = Component {
            axons: vec![0],
            neurons: vec![],
        };
        assert!(matches!(
            relocate_component(&src, &bogus, &mut dst, 0, &table, &arch, &arch),
            Err(ModelError::Addressing(AddressingConflict::UnusedAxonMoved { axon: 0, .. }))
        ));

        let component = src.usage().components[0].clone();
        assert!(matches!(
            relocate_component(&src, &component, &mut dst, 0, &table, &arch, &arch),
            Err(ModelError::Addressing(
                AddressingConflict::UnresolvedDestination { x: 2, y: 1, axon: 7 }
            ))
        ));
    }

    #[test]
    fn test_retarget_packets() {
        let mut table = TranslationTable::new();
        table
            .insert(AxonAddress::new(2, 0, 1), AxonAddress::new(1, 0, 0))
            .unwrap();
        let p = Packet {
            tick: 3,
            axon: 1,
            dx: 2,
            dy: 0,
        };
        let mut s = PacketSchedule::new(vec![p], vec![1]).unwrap();
        retarget_packets(&mut s, &table).unwrap();
        assert_eq!(
            s.packets()[0],
            Packet {
                tick: 3,
                axon: 0,
                dx: 1,
                dy: 0
            }
        );
        let mut dangling = PacketSchedule::new(vec![p], vec![1]).unwrap();
        assert!(retarget_packets(&mut dangling, &TranslationTable::new()).is_err());
    }

    #[test]
    fn test_pack_output_axons_leaves_core_links_alone() {
        let arch = arch();
        // (1,0) feeds axon 7 of (2,0), which is above every driven output axon
        let mut first = CoreRecord::empty(1, 0, &arch);
        first.set_neuron(0, neuron(&arch, &[0], 1, 0, 7)).unwrap();
        let mut second = CoreRecord::empty(2, 0, &arch);
        second.set_axon(7, 1).unwrap();
        second.set_neuron(0, neuron(&arch, &[7], -2, 0, 4)).unwrap();
        let outputs = PacketSchedule::new(vec![4], vec![1]).unwrap();
        let mut model =
            GridModel::new(arch, vec![first, second], PacketSchedule::default(), outputs).unwrap();

        assert_eq!(pack_output_axons(&mut model).unwrap(), 1);
        assert_eq!(model.outputs().packets(), &[0]);
        assert_eq!(model.core(1, 0).unwrap().destination_of(0), Some((2, 0, 7)));
        assert_eq!(model.core(2, 0).unwrap().destination_of(0), Some((0, 0, 0)));
    }

    #[test]
    fn test_pack_output_axons() {
        let arch = arch();
        let mut core = CoreRecord::empty(1, 0, &arch);
        core.set_neuron(0, neuron(&arch, &[0], -1, 0, 6)).unwrap();
        core.set_neuron(1, neuron(&arch, &[1], -1, 0, 3)).unwrap();
        core.set_neuron(2, neuron(&arch, &[2], 0, 0, 0)).unwrap();
        let outputs = PacketSchedule::new(vec![6, 3, 6], vec![1, 2]).unwrap();
        let mut model =
            GridModel::new(arch, vec![core.clone()], PacketSchedule::default(), outputs).unwrap();
        assert_eq!(pack_output_axons(&mut model).unwrap(), 2);
        assert_eq!(model.outputs().packets(), &[1, 0, 1]);
        let packed = model.core(1, 0).unwrap();
        assert_eq!(packed.destination_of(0), Some((0, 0, 1)));
        assert_eq!(packed.destination_of(1), Some((0, 0, 0)));
        assert_eq!(packed.destination_of(2), Some((1, 0, 0)));

        let outputs = PacketSchedule::new(vec![5], vec![1]).unwrap();
        let mut model =
            GridModel::new(arch, vec![core], PacketSchedule::default(), outputs).unwrap();
        assert!(matches!(
            pack_output_axons(&mut model),
            Err(ModelError::Addressing(AddressingConflict::UnexpectedOutputAxon { axon: 5 }))
        ));
    }
}
