// SPDX-License-Identifier: AGPL-3.0-only

//! Axon/neuron connectivity within one core.
//!
//! A neuron with an empty axon bitmap is unused, whatever its other fields
//! hold. An axon is used when at least one used neuron listens to it. The
//! bipartite graph of used axons and neurons splits into minimal connected
//! components (MCCs), the unit the packer relocates.

use crate::record::CoreRecord;
use std::collections::{BTreeMap, BTreeSet};

/// One minimal connected component.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Component {
    /// Axon indices, ascending.
    pub axons: Vec<u32>,
    /// Neuron indices, ascending.
    pub neurons: Vec<u32>,
}

impl Component {
    /// Axons times neurons, a rough footprint.
    #[must_use]
    pub fn size(&self) -> usize {
        self.axons.len() * self.neurons.len()
    }
}

/// Connectivity of one core.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoreUsage {
    /// Axons at least one used neuron listens to.
    pub used_axons: Vec<u32>,
    /// All other axons.
    pub unused_axons: Vec<u32>,
    /// Neurons with a non-empty bitmap.
    pub used_neurons: Vec<u32>,
    /// Neurons with an empty bitmap.
    pub unused_neurons: Vec<u32>,
    /// Used axon to the neurons it feeds.
    pub axon_to_neurons: BTreeMap<u32, Vec<u32>>,
    /// Used neuron to the axons it listens to.
    pub neuron_to_axons: BTreeMap<u32, Vec<u32>>,
    /// Components ordered by their lowest axon.
    pub components: Vec<Component>,
}

impl CoreUsage {
    /// Analyse `core`.
    #[must_use]
    pub fn analyze(core: &CoreRecord) -> Self {
        let mut usage = Self::default();
        for (n, neuron) in (0u32..).zip(core.neurons()) {
            if neuron.is_unused() {
                usage.unused_neurons.push(n);
                continue;
            }
            usage.used_neurons.push(n);
            for a in neuron.axons.ones() {
                let a = u32::try_from(a).unwrap_or(u32::MAX);
                usage.axon_to_neurons.entry(a).or_default().push(n);
                usage.neuron_to_axons.entry(n).or_default().push(a);
            }
        }
        for a in (0u32..).take(core.axons().len()) {
            if usage.axon_to_neurons.contains_key(&a) {
                usage.used_axons.push(a);
            } else {
                usage.unused_axons.push(a);
            }
        }
        usage.components = usage.find_components();
        usage
    }

    /// Frontier traversal from each unvisited axon until closure.
    fn find_components(&self) -> Vec<Component> {
        let mut visited: BTreeSet<u32> = BTreeSet::new();
        let mut components = Vec::new();
        for &seed in self.axon_to_neurons.keys() {
            if visited.contains(&seed) {
                continue;
            }
            let mut axons = BTreeSet::from([seed]);
            let mut neurons = BTreeSet::new();
            let mut frontier = vec![seed];
            while let Some(a) = frontier.pop() {
                for &n in &self.axon_to_neurons[&a] {
                    if !neurons.insert(n) {
                        continue;
                    }
                    for &next in &self.neuron_to_axons[&n] {
                        if axons.insert(next) {
                            frontier.push(next);
                        }
                    }
                }
            }
            visited.extend(axons.iter().copied());
            components.push(Component {
                axons: axons.into_iter().collect(),
                neurons: neurons.into_iter().collect(),
            });
        }
        components
    }

    /// True if nothing on the core is in use.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.used_axons.is_empty()
    }
}
