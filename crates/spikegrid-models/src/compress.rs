// SPDX-License-Identifier: AGPL-3.0-only

//! Model compression: repack a grid model onto the fewest cores of a target
//! architecture.
//!
//! | Stage | Effect |
//! |-------|--------|
//! | Empty cores | dropped, unless something still addresses them |
//! | Dud neurons / packets | cleared until nothing targets a dead axon |
//! | Output axons | renumbered densely |
//! | Allocation | components packed into bins, bins placed on the grid |
//! | Relocation | components copied, destinations and inputs rewritten |
//!
//! The result is validated before it is returned.

use crate::allocator::allocate;
use crate::error::{AddressingConflict, ModelError, Result};
use crate::grid::GridModel;
use crate::record::{CoreRecord, NeuronRecord};
use crate::remap::{
    pack_output_axons, relocate_component, retarget_packets, AxonAddress, TranslationTable,
};
use crate::solver::{BinPackingSolver, PackingItem};
use serde::Serialize;
use spikegrid_chip::bitfield::next_pow2;
use spikegrid_chip::{ArchField, ArchitectureParams};
use std::collections::{BTreeMap, BTreeSet};

/// What [`compress`] may shrink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionOptions {
    /// Shrink the grid dimensions to the selected shape.
    pub minimise_grid: bool,
    /// Shrink `num_outputs` to the next power of two above the driven outputs.
    pub minimise_outputs: bool,
}

impl Default for CompressionOptions {
    fn default() -> Self {
        Self {
            minimise_grid: true,
            minimise_outputs: true,
        }
    }
}

/// Component size extremes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ComponentStats {
    /// Fewest axons in a component.
    pub min_axons: usize,
    /// Most axons in a component.
    pub max_axons: usize,
    /// Fewest neurons in a component.
    pub min_neurons: usize,
    /// Most neurons in a component.
    pub max_neurons: usize,
    /// Smallest axons x neurons.
    pub min_size: usize,
    /// Largest axons x neurons.
    pub max_size: usize,
}

/// Mean utilisation in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Utilisation {
    /// Used axons per core over capacity.
    pub axons: f64,
    /// Used neurons per core over capacity.
    pub neurons: f64,
}

impl Utilisation {
    #[allow(clippy::cast_precision_loss)]
    fn mean(loads: &[(usize, usize)], padding: usize, arch: &ArchitectureParams) -> Self {
        let cores = loads.len() + padding;
        if cores == 0 {
            return Self::default();
        }
        let axons: usize = loads.iter().map(|l| l.0).sum();
        let neurons: usize = loads.iter().map(|l| l.1).sum();
        Self {
            axons: axons as f64 / cores as f64 / f64::from(arch.num_axons) * 100.0,
            neurons: neurons as f64 / cores as f64 / f64::from(arch.num_neurons) * 100.0,
        }
    }
}

/// Before/after statistics of one compression.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompressionReport {
    /// Components packed.
    pub components: usize,
    /// Component size extremes, if there were any.
    pub component_stats: Option<ComponentStats>,
    /// Grid extent before.
    pub old_shape: (u32, u32),
    /// Grid extent after.
    pub new_shape: (u32, u32),
    /// Cores holding data before (after dropping empty cores).
    pub old_cores: usize,
    /// Cores holding data after.
    pub new_cores: usize,
    /// Empty cells inside the old extent.
    pub old_padding_cores: usize,
    /// Empty cells inside the new extent.
    pub new_padding_cores: usize,
    /// Utilisation over data cores only, before.
    pub old_utilisation: Utilisation,
    /// Utilisation over data cores only, after.
    pub new_utilisation: Utilisation,
    /// Utilisation including padding cores, before.
    pub old_utilisation_padded: Utilisation,
    /// Utilisation including padding cores, after.
    pub new_utilisation_padded: Utilisation,
    /// Empty cores dropped.
    pub empty_cores_removed: usize,
    /// Dud neurons cleared.
    pub dud_neurons_removed: usize,
    /// Dud input packets dropped.
    pub dud_packets_removed: usize,
    /// `num_outputs` before.
    pub old_num_outputs: u32,
    /// `num_outputs` after.
    pub new_num_outputs: u32,
}

/// Drop cores with no used axon.
///
/// # Errors
///
/// [`AddressingConflict::EmptyCoreTargeted`] if a neuron or input packet
/// still addresses an empty core.
pub fn remove_empty_cores(model: &mut GridModel) -> Result<usize> {
    let empty: Vec<(u32, u32)> = model
        .cores()
        .iter()
        .filter(|c| c.usage().is_empty())
        .map(CoreRecord::position)
        .collect();
    for &(x, y) in &empty {
        let target = (i64::from(x), i64::from(y));
        for core in model.cores() {
            for &n in &core.usage().used_neurons {
                if let Some((dx, dy, _)) = core.destination_of(n as usize) {
                    if (dx, dy) == target {
                        return Err(AddressingConflict::EmptyCoreTargeted {
                            x,
                            y,
                            by: format!("neuron {n} of core {:?}", core.position()),
                        }
                        .into());
                    }
                }
            }
        }
        if let Some(i) = model
            .inputs()
            .packets()
            .iter()
            .position(|p| (p.dx, p.dy) == target)
        {
            return Err(AddressingConflict::EmptyCoreTargeted {
                x,
                y,
                by: format!("input packet {i}"),
            }
            .into());
        }
    }
    for &(x, y) in &empty {
        model.remove_core(x, y);
        tracing::debug!("Removed empty core ({}, {})", x, y);
    }
    tracing::info!(
        "Removed {} empty cores, {} remaining",
        empty.len(),
        model.cores().len()
    );
    Ok(empty.len())
}

/// Clear neurons and drop input packets aimed at dead axons, repeating until
/// nothing changes. Returns `(neurons, packets)` removed.
///
/// # Errors
///
/// Propagates core mutation errors.
pub fn remove_dud_neurons(model: &mut GridModel) -> Result<(usize, usize)> {
    let arch = *model.arch();
    let (mut neurons, mut packets) = (0, 0);
    loop {
        let mut live: BTreeSet<(i64, i64, u32)> = (0..arch.num_outputs)
            .map(|a| (i64::from(arch.output_core_x), i64::from(arch.output_core_y), a))
            .collect();
        for core in model.cores() {
            for &a in &core.usage().used_axons {
                live.insert((i64::from(core.x()), i64::from(core.y()), a));
            }
        }

        let mut changed = false;
        for core in model.cores_mut() {
            let duds: Vec<usize> = core
                .usage()
                .used_neurons
                .iter()
                .map(|&n| n as usize)
                .filter(|&n| core.destination_of(n).is_some_and(|d| !live.contains(&d)))
                .collect();
            for n in duds {
                tracing::debug!("Removed dud neuron {} of core {:?}", n, core.position());
                core.set_neuron(n, NeuronRecord::unused(&arch))?;
                neurons += 1;
                changed = true;
            }
        }
        packets += model
            .inputs_mut()
            .retain(|p| live.contains(&(p.dx, p.dy, p.axon)));
        if !changed {
            break;
        }
    }
    tracing::info!(
        "Removed {} dud neurons and {} dud input packets",
        neurons,
        packets
    );
    Ok((neurons, packets))
}

fn loads(model: &GridModel) -> Vec<(usize, usize)> {
    model
        .cores()
        .iter()
        .map(|c| (c.usage().used_axons.len(), c.usage().used_neurons.len()))
        .collect()
}

fn padding(shape: (u32, u32), cores: usize) -> usize {
    (shape.0 as usize * shape.1 as usize).saturating_sub(cores + 1)
}

/// Repack `model` onto `target`.
///
/// `target` must agree with the model on weight and tick counts. Its output
/// coordinate may differ; output axons follow the output core.
///
/// # Errors
///
/// Any [`ModelError`] raised by a stage; nothing is partially applied to
/// `model`.
pub fn compress(
    model: &GridModel,
    target: &ArchitectureParams,
    options: CompressionOptions,
    solver: &dyn BinPackingSolver,
) -> Result<(GridModel, CompressionReport)> {
    let source = *model.arch();
    tracing::info!(
        "Compressing {} cores: {} -> {} axons, {} -> {} neurons per core",
        model.cores().len(),
        source.num_axons,
        target.num_axons,
        source.num_neurons,
        target.num_neurons
    );
    let mut work = model.clone();
    let mut report = CompressionReport {
        old_shape: work.extent(),
        old_num_outputs: source.num_outputs,
        ..CompressionReport::default()
    };

    report.empty_cores_removed = remove_empty_cores(&mut work)?;
    let (neurons, packets) = remove_dud_neurons(&mut work)?;
    report.dud_neurons_removed = neurons;
    report.dud_packets_removed = packets;
    report.empty_cores_removed += remove_empty_cores(&mut work)?;

    let driven = pack_output_axons(&mut work)?;
    let packed_outputs = u32::try_from(next_pow2(u64::from(driven))).unwrap_or(u32::MAX);
    let mut target = *target;
    if options.minimise_outputs {
        target = target.with_field(ArchField::NumOutputs, u64::from(packed_outputs))?;
    }
    if target.num_outputs < driven {
        return Err(ModelError::configuration(format!(
            "target has {} outputs but {driven} are driven",
            target.num_outputs
        )));
    }
    target.validate()?;

    // one item per component, in core then component order
    let mut sources: Vec<(usize, usize)> = Vec::new();
    let mut items = Vec::new();
    for (ci, core) in work.cores().iter().enumerate() {
        for (mi, component) in core.usage().components.iter().enumerate() {
            sources.push((ci, mi));
            items.push(PackingItem {
                axons: u32::try_from(component.axons.len()).unwrap_or(u32::MAX),
                neurons: u32::try_from(component.neurons.len()).unwrap_or(u32::MAX),
            });
        }
    }
    report.components = items.len();
    report.component_stats = component_stats(&work);

    let allocation = allocate(items, &target, solver)?;

    let mut table = TranslationTable::new();
    let mut moves = Vec::with_capacity(sources.len());
    for (bin, &(px, py)) in allocation.positions.iter().enumerate() {
        let mut base = 0u32;
        for item in allocation.solution.items_in(bin) {
            let (ci, mi) = sources[item];
            let core = &work.cores()[ci];
            let component = &core.usage().components[mi];
            for (a, new) in component.axons.iter().zip(base..) {
                table.insert(
                    AxonAddress::new(core.x(), core.y(), *a),
                    AxonAddress::new(px, py, new),
                )?;
            }
            moves.push((item, (px, py), base));
            base += u32::try_from(component.axons.len()).unwrap_or(u32::MAX);
        }
    }
    let (sx, sy) = source.output_core();
    let (tx, ty) = target.output_core();
    for a in 0..driven {
        table.insert(AxonAddress::new(sx, sy, a), AxonAddress::new(tx, ty, a))?;
    }

    let mut cores: BTreeMap<(u32, u32), CoreRecord> = allocation
        .positions
        .iter()
        .map(|&(x, y)| ((x, y), CoreRecord::empty(x, y, &target)))
        .collect();
    for (item, position, base) in moves {
        let (ci, mi) = sources[item];
        let core = &work.cores()[ci];
        let component = &core.usage().components[mi];
        let destination = cores
            .get_mut(&position)
            .ok_or_else(|| ModelError::configuration(format!("no core at {position:?}")))?;
        relocate_component(core, component, destination, base, &table, &source, &target)?;
    }

    let mut inputs = work.inputs().clone();
    retarget_packets(&mut inputs, &table)?;
    let outputs = work.outputs().clone();

    if options.minimise_grid {
        target = target
            .with_field(ArchField::GridDimensionX, u64::from(allocation.shape.0))?
            .with_field(ArchField::GridDimensionY, u64::from(allocation.shape.1))?;
    }
    let compressed = GridModel::new(target, cores.into_values().collect(), inputs, outputs)?;
    compressed.check_destinations()?;

    let old_loads = loads(&work);
    let new_loads = loads(&compressed);
    report.new_shape = allocation.shape;
    report.old_cores = old_loads.len();
    report.new_cores = new_loads.len();
    report.old_padding_cores = padding(report.old_shape, report.old_cores);
    report.new_padding_cores = padding(report.new_shape, report.new_cores);
    report.old_utilisation = Utilisation::mean(&old_loads, 0, &source);
    report.new_utilisation = Utilisation::mean(&new_loads, 0, &target);
    report.old_utilisation_padded = Utilisation::mean(&old_loads, report.old_padding_cores, &source);
    report.new_utilisation_padded = Utilisation::mean(&new_loads, report.new_padding_cores, &target);
    report.new_num_outputs = target.num_outputs;

    tracing::info!(
        "Compressed {} cores on {:?} into {} cores on {:?}",
        report.old_cores,
        report.old_shape,
        report.new_cores,
        report.new_shape
    );
    Ok((compressed, report))
}

fn component_stats(model: &GridModel) -> Option<ComponentStats> {
    let mut all = model
        .cores()
        .iter()
        .flat_map(|c| c.usage().components.iter())
        .map(|m| (m.axons.len(), m.neurons.len(), m.size()));
    let (a, n, s) = all.next()?;
    let first = ComponentStats {
        min_axons: a,
        max_axons: a,
        min_neurons: n,
        max_neurons: n,
        min_size: s,
        max_size: s,
    };
    Some(all.fold(first, |acc, (a, n, s)| ComponentStats {
        min_axons: acc.min_axons.min(a),
        max_axons: acc.max_axons.max(a),
        min_neurons: acc.min_neurons.min(n),
        max_neurons: acc.max_neurons.max(n),
        min_size: acc.min_size.min(s),
        max_size: acc.max_size.max(s),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Packet, PacketSchedule};
    use crate::record::Destination;
    use crate::solver::BranchAndBoundSolver;

    fn arch() -> ArchitectureParams {
        ArchitectureParams::REFERENCE
            .with_field(ArchField::NumAxons, 8)
            .unwrap()
            .with_field(ArchField::NumNeurons, 4)
            .unwrap()
            .with_field(ArchField::NumOutputs, 8)
            .unwrap()
    }

    fn neuron(arch: &ArchitectureParams, axons: &[usize], dst: (i64, i64, u32)) -> NeuronRecord {
        let mut n = NeuronRecord::unused(arch);
        for a in axons {
            n.axons.set(*a, true);
        }
        n.weights = vec![1, 1, 1, 1];
        n.destination = Destination {
            dx: dst.0,
            dy: dst.1,
            axon: dst.2,
            tick: 0,
        };
        n
    }

    /// Two sparse cores at (1,0) and (2,1) feeding output axons 4 and 6,
    /// an empty core at (3,3), and a dud neuron on (1,0).
    fn sparse() -> GridModel {
        let arch = arch();
        let mut a = CoreRecord::empty(1, 0, &arch);
        a.set_neuron(0, neuron(&arch, &[2], (-1, 0, 4))).unwrap();
        a.set_neuron(1, neuron(&arch, &[5], (1, 1, 7))).unwrap();
        let mut b = CoreRecord::empty(2, 1, &arch);
        b.set_neuron(2, neuron(&arch, &[0, 1], (-2, -1, 6))).unwrap();
        let empty = CoreRecord::empty(3, 3, &arch);
        let inputs = PacketSchedule::new(
            vec![
                Packet {
                    tick: 0,
                    axon: 2,
                    dx: 1,
                    dy: 0,
                },
                Packet {
                    tick: 0,
                    axon: 1,
                    dx: 2,
                    dy: 1,
                },
                Packet {
                    tick: 0,
                    axon: 3,
                    dx: 2,
                    dy: 1,
                },
            ],
            vec![2, 1],
        )
        .unwrap();
        let outputs = PacketSchedule::new(vec![4, 6], vec![0, 1, 1]).unwrap();
        GridModel::new(arch, vec![a, b, empty], inputs, outputs).unwrap()
    }

    #[test]
    fn test_remove_duds_iterates() {
        let mut model = sparse();
        assert_eq!(remove_empty_cores(&mut model).unwrap(), 1);
        // neuron 1 of (1,0) targets unused axon 7 of (2,1), and nothing on
        // (2,1) listens to axon 3
        let (neurons, packets) = remove_dud_neurons(&mut model).unwrap();
        assert_eq!(neurons, 1);
        assert_eq!(packets, 1);
        assert_eq!(model.inputs().counts(), &[2, 0]);
    }

    #[test]
    fn test_empty_core_still_targeted() {
        let arch = arch();
        let mut a = CoreRecord::empty(1, 0, &arch);
        a.set_neuron(0, neuron(&arch, &[2], (1, 0, 0))).unwrap();
        let empty = CoreRecord::empty(2, 0, &arch);
        let mut model = GridModel::new(
            arch,
            vec![a, empty],
            PacketSchedule::default(),
            PacketSchedule::default(),
        )
        .unwrap();
        assert!(matches!(
            remove_empty_cores(&mut model),
            Err(ModelError::Addressing(AddressingConflict::EmptyCoreTargeted { x: 2, y: 0, .. }))
        ));
    }

    #[test]
    fn test_compress_onto_one_core() {
        let model = sparse();
        let (packed, report) = compress(
            &model,
            &arch(),
            CompressionOptions::default(),
            &BranchAndBoundSolver::default(),
        )
        .unwrap();
        assert_eq!(report.empty_cores_removed, 1);
        assert_eq!(report.dud_neurons_removed, 1);
        assert_eq!(report.components, 2);
        assert_eq!(report.new_cores, 1);
        assert_eq!(report.new_shape, (2, 1));
        assert_eq!(report.new_num_outputs, 2);

        let arch = packed.arch();
        assert_eq!((arch.grid_dimension_x, arch.grid_dimension_y), (2, 1));
        assert_eq!(arch.num_outputs, 2);
        assert_eq!(packed.cores().len(), 1);
        let core = &packed.cores()[0];
        assert_eq!(core.position(), (1, 0));
        // component {2} from (1,0) lands first, then {0,1} from (2,1)
        assert_eq!(core.usage().used_axons, vec![0, 1, 2]);
        assert_eq!(core.destination_of(0), Some((0, 0, 0)));
        assert_eq!(core.neurons()[1].axons.ones().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(core.destination_of(1), Some((0, 0, 1)));
        assert_eq!(packed.outputs().packets(), &[0, 1]);
        let inputs: Vec<_> = packed.inputs().packets().iter().map(Packet::address).collect();
        assert_eq!(inputs, vec![(1, 0, 0), (1, 0, 2)]);
        for core in packed.cores() {
            core.verify_round_trip(packed.arch()).unwrap();
        }
    }

    #[test]
    fn test_compress_keeps_grid_and_outputs() {
        let model = sparse();
        let options = CompressionOptions {
            minimise_grid: false,
            minimise_outputs: false,
        };
        let (packed, report) =
            compress(&model, &arch(), options, &BranchAndBoundSolver::default()).unwrap();
        assert_eq!(packed.arch().grid_dimension_x, 4);
        assert_eq!(packed.arch().num_outputs, 8);
        assert_eq!(report.old_num_outputs, 8);
        assert!(report.new_utilisation.axons > report.old_utilisation.axons);
    }
}
