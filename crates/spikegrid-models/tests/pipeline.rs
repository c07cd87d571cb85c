//! Integration tests for the compression pipeline
//!
//! A three-core chain is packed onto two cores, then written out and loaded
//! back through the scenario directory format.

use spikegrid_chip::{ArchField, ArchitectureParams};
use spikegrid_models::compress::{compress, CompressionOptions};
use spikegrid_models::scenario::{load_scenario, write_scenario, Scenario, ScenarioParams};
use spikegrid_models::solver::BranchAndBoundSolver;
use spikegrid_models::{CoreRecord, Destination, GridModel, NeuronRecord, Packet, PacketSchedule};

fn arch() -> ArchitectureParams {
    ArchitectureParams::REFERENCE
        .with_field(ArchField::NumAxons, 4)
        .and_then(|a| a.with_field(ArchField::NumNeurons, 4))
        .and_then(|a| a.with_field(ArchField::NumOutputs, 4))
        .expect("valid architecture")
}

fn neuron(arch: &ArchitectureParams, axons: &[usize], dx: i64, dy: i64, axon: u32) -> NeuronRecord {
    let mut n = NeuronRecord::unused(arch);
    for a in axons {
        n.axons.set(*a, true);
    }
    n.weights = vec![1, 1, 1, 1];
    n.positive_threshold = 1;
    n.destination = Destination {
        dx,
        dy,
        axon,
        tick: 0,
    };
    n
}

fn packet(tick: u32, x: i64, y: i64, axon: u32) -> Packet {
    Packet {
        tick,
        axon,
        dx: x,
        dy: y,
    }
}

/// (1,0) feeds (2,0), which feeds outputs 1 and 3; (3,0) feeds outputs 0
/// and 2. Each core holds one two-axon, two-neuron component.
fn chain() -> GridModel {
    let arch = arch();
    let mut first = CoreRecord::empty(1, 0, &arch);
    first.set_neuron(0, neuron(&arch, &[0, 1], 1, 0, 2)).expect("neuron");
    first.set_neuron(1, neuron(&arch, &[0, 1], 1, 0, 3)).expect("neuron");
    let mut second = CoreRecord::empty(2, 0, &arch);
    second.set_neuron(0, neuron(&arch, &[2, 3], -2, 0, 1)).expect("neuron");
    second.set_neuron(1, neuron(&arch, &[2, 3], -2, 0, 3)).expect("neuron");
    let mut third = CoreRecord::empty(3, 0, &arch);
    third.set_neuron(0, neuron(&arch, &[0, 1], -3, 0, 0)).expect("neuron");
    third.set_neuron(1, neuron(&arch, &[0, 1], -3, 0, 2)).expect("neuron");

    let inputs = PacketSchedule::new(
        vec![packet(0, 1, 0, 0), packet(0, 1, 0, 1), packet(1, 3, 0, 0)],
        vec![2, 1],
    )
    .expect("inputs");
    let outputs = PacketSchedule::new(vec![1, 3, 2], vec![0, 2, 1]).expect("outputs");
    GridModel::new(arch, vec![first, second, third], inputs, outputs).expect("model")
}

fn used_neurons(model: &GridModel) -> usize {
    model
        .cores()
        .iter()
        .map(|c| c.usage().used_neurons.len())
        .sum()
}

#[test]
fn test_chain_packs_onto_two_cores() {
    let model = chain();
    let (packed, report) = compress(
        &model,
        model.arch(),
        CompressionOptions::default(),
        &BranchAndBoundSolver::default(),
    )
    .expect("compress");

    assert_eq!(report.old_cores, 3);
    assert_eq!(report.new_cores, 2);
    assert_eq!(report.components, 3);
    assert_eq!(report.new_shape, (2, 2));
    assert_eq!(report.new_num_outputs, 4);
    assert_eq!(report.dud_neurons_removed, 0);

    assert_eq!(packed.arch().num_outputs, 4);
    assert_eq!(packed.outputs().packets(), &[1, 3, 2]);
    assert_eq!(packed.outputs().counts(), model.outputs().counts());
    assert_eq!(packed.inputs().counts(), model.inputs().counts());
    assert_eq!(used_neurons(&packed), used_neurons(&model));
}

#[test]
fn test_packed_references_stay_consistent() {
    let model = chain();
    let (packed, _) = compress(
        &model,
        model.arch(),
        CompressionOptions::default(),
        &BranchAndBoundSolver::default(),
    )
    .expect("compress");

    packed.check_destinations().expect("destinations");
    for core in packed.cores() {
        core.verify_round_trip(packed.arch()).expect("round trip");
        for &n in &core.usage().used_neurons {
            let (x, y, axon) = core.destination_of(n as usize).expect("destination");
            assert!(
                packed.is_live_axon(x, y, axon),
                "neuron {n} of {:?} targets dead axon ({x}, {y}, {axon})",
                core.position()
            );
        }
    }
    for p in packed.inputs().packets() {
        let (x, y, axon) = p.address();
        assert!(packed.is_live_axon(x, y, axon));
    }

    // relocated components never overlap
    let axons: usize = packed.cores().iter().map(|c| c.usage().used_axons.len()).sum();
    assert_eq!(axons, 6);
    assert_eq!(used_neurons(&packed), 6);
}

#[test]
fn test_packed_scenario_survives_disk() {
    let model = chain();
    let (packed, _) = compress(
        &model,
        model.arch(),
        CompressionOptions::default(),
        &BranchAndBoundSolver::default(),
    )
    .expect("compress");
    let scenario = Scenario {
        params: ScenarioParams {
            tick_latency: 2,
            num_ticks_to_check: Some(6),
            relax_packet_ordering: true,
        },
        model: packed,
    };

    let dir = tempfile::tempdir().expect("tempdir");
    write_scenario(dir.path(), &scenario).expect("write");
    let loaded = load_scenario(dir.path(), None).expect("load");
    assert_eq!(loaded, scenario);
}

#[test]
fn test_compressing_twice_is_stable() {
    let model = chain();
    let solver = BranchAndBoundSolver::default();
    let (once, _) = compress(&model, model.arch(), CompressionOptions::default(), &solver)
        .expect("first pass");
    let (twice, report) = compress(&once, once.arch(), CompressionOptions::default(), &solver)
        .expect("second pass");
    assert_eq!(report.new_cores, once.cores().len());
    assert_eq!(twice.arch().num_outputs, once.arch().num_outputs);
    assert_eq!(twice.outputs(), once.outputs());
}
