// SPDX-License-Identifier: AGPL-3.0-only

//! Two-dimensional bin packing.
//!
//! Each item is a component with an axon and a neuron footprint; each bin is
//! a core with axon and neuron capacity. The objective is the fewest bins.
//! [`BinPackingSolver`] is the seam for plugging in an external optimiser;
//! [`BranchAndBoundSolver`] is the exact in-process implementation.
//!
//! ## Search
//!
//! | Step | Detail |
//! |------|--------|
//! | Order | items by normalised footprint, largest first |
//! | Upper bound | first-fit decreasing |
//! | Lower bound | `max(ceil(sum axons / A), ceil(sum neurons / N))` |
//! | Branching | existing bins (skipping bins with identical load), then one new bin |
//! | Budget | node count; exhausting it reports a non-optimal result |

use crate::error::{ModelError, Result};

/// One item to pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PackingItem {
    /// Axons the item needs.
    pub axons: u32,
    /// Neurons the item needs.
    pub neurons: u32,
}

/// A bin-packing instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackingProblem {
    /// Items to pack.
    pub items: Vec<PackingItem>,
    /// Bins available.
    pub bins: usize,
    /// Axon capacity per bin.
    pub axon_capacity: u32,
    /// Neuron capacity per bin.
    pub neuron_capacity: u32,
}

impl PackingProblem {
    fn fits(&self, load: (u32, u32), item: PackingItem) -> bool {
        load.0 + item.axons <= self.axon_capacity && load.1 + item.neurons <= self.neuron_capacity
    }

    /// Volume lower bound on the bins needed.
    #[must_use]
    pub fn lower_bound(&self) -> usize {
        if self.items.is_empty() {
            return 0;
        }
        let axons: u64 = self.items.iter().map(|i| u64::from(i.axons)).sum();
        let neurons: u64 = self.items.iter().map(|i| u64::from(i.neurons)).sum();
        let by_axons = axons.div_ceil(u64::from(self.axon_capacity.max(1)));
        let by_neurons = neurons.div_ceil(u64::from(self.neuron_capacity.max(1)));
        usize::try_from(by_axons.max(by_neurons).max(1)).unwrap_or(usize::MAX)
    }
}

/// Result of a solve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackingSolution {
    /// Bin of each item, bins numbered `0..bins_used`.
    pub assignment: Vec<usize>,
    /// Bins in use.
    pub bins_used: usize,
    /// True if `bins_used` is proven minimal.
    pub optimal: bool,
}

impl PackingSolution {
    /// Item indices in `bin`, ascending.
    pub fn items_in(&self, bin: usize) -> impl Iterator<Item = usize> + '_ {
        self.assignment
            .iter()
            .enumerate()
            .filter(move |(_, b)| **b == bin)
            .map(|(i, _)| i)
    }

    /// `(axons, neurons)` used in every bin.
    #[must_use]
    pub fn loads(&self, problem: &PackingProblem) -> Vec<(u32, u32)> {
        let mut loads = vec![(0, 0); self.bins_used];
        for (item, bin) in problem.items.iter().zip(&self.assignment) {
            loads[*bin].0 += item.axons;
            loads[*bin].1 += item.neurons;
        }
        loads
    }
}

/// Solves [`PackingProblem`]s.
pub trait BinPackingSolver {
    /// Pack every item.
    ///
    /// # Errors
    ///
    /// [`ModelError::InfeasibleAllocation`] if the items cannot fit in
    /// `problem.bins` bins.
    fn solve(&self, problem: &PackingProblem) -> Result<PackingSolution>;
}

/// Exact depth-first branch and bound.
#[derive(Debug, Clone, Copy)]
pub struct BranchAndBoundSolver {
    /// Search nodes to visit before giving up on proving optimality.
    pub node_budget: u64,
}

impl Default for BranchAndBoundSolver {
    fn default() -> Self {
        Self {
            node_budget: 2_000_000,
        }
    }
}

struct Search<'a> {
    problem: &'a PackingProblem,
    order: Vec<usize>,
    loads: Vec<(u32, u32)>,
    current: Vec<usize>,
    best: Vec<usize>,
    best_bins: usize,
    lower_bound: usize,
    nodes: u64,
    budget: u64,
    exhausted: bool,
}

impl Search<'_> {
    fn run(&mut self, depth: usize) {
        if self.exhausted || self.best_bins == self.lower_bound {
            return;
        }
        self.nodes += 1;
        if self.nodes > self.budget {
            self.exhausted = true;
            return;
        }
        if depth == self.order.len() {
            if self.loads.len() < self.best_bins {
                self.best_bins = self.loads.len();
                self.best.clone_from(&self.current);
            }
            return;
        }
        let item = self.problem.items[self.order[depth]];
        for bin in 0..self.loads.len() {
            let load = self.loads[bin];
            if !self.problem.fits(load, item) || self.loads[..bin].contains(&load) {
                continue;
            }
            self.loads[bin] = (load.0 + item.axons, load.1 + item.neurons);
            self.current[depth] = bin;
            self.run(depth + 1);
            self.loads[bin] = load;
        }
        if self.loads.len() + 1 < self.best_bins {
            self.loads.push((item.axons, item.neurons));
            self.current[depth] = self.loads.len() - 1;
            self.run(depth + 1);
            self.loads.pop();
        }
    }
}

fn first_fit(problem: &PackingProblem, order: &[usize]) -> (Vec<usize>, usize) {
    let mut loads: Vec<(u32, u32)> = Vec::new();
    let mut assignment = Vec::with_capacity(order.len());
    for &i in order {
        let item = problem.items[i];
        let bin = if let Some(bin) = loads.iter().position(|l| problem.fits(*l, item)) {
            bin
        } else {
            loads.push((0, 0));
            loads.len() - 1
        };
        loads[bin].0 += item.axons;
        loads[bin].1 += item.neurons;
        assignment.push(bin);
    }
    (assignment, loads.len())
}

impl BinPackingSolver for BranchAndBoundSolver {
    fn solve(&self, problem: &PackingProblem) -> Result<PackingSolution> {
        for (i, item) in problem.items.iter().enumerate() {
            if item.axons > problem.axon_capacity || item.neurons > problem.neuron_capacity {
                return Err(ModelError::infeasible(format!(
                    "item {i} needs {} axons / {} neurons, bins hold {} / {}",
                    item.axons, item.neurons, problem.axon_capacity, problem.neuron_capacity
                )));
            }
        }

        let (a_cap, n_cap) = (
            u64::from(problem.axon_capacity.max(1)),
            u64::from(problem.neuron_capacity.max(1)),
        );
        let mut order: Vec<usize> = (0..problem.items.len()).collect();
        order.sort_by_key(|&i| {
            let item = problem.items[i];
            let footprint = (u64::from(item.axons) * n_cap).max(u64::from(item.neurons) * a_cap);
            (
                std::cmp::Reverse(footprint),
                std::cmp::Reverse(item.axons + item.neurons),
                i,
            )
        });

        let lower_bound = problem.lower_bound();
        let (ffd, ffd_bins) = first_fit(problem, &order);
        let mut search = Search {
            problem,
            current: vec![0; order.len()],
            order,
            loads: Vec::new(),
            best: ffd,
            best_bins: ffd_bins,
            lower_bound,
            nodes: 0,
            budget: self.node_budget,
            exhausted: false,
        };
        search.run(0);
        let optimal = !search.exhausted || search.best_bins == lower_bound;
        tracing::debug!(
            "Packed {} items into {} bins (lower bound {}, {} nodes, optimal: {})",
            problem.items.len(),
            search.best_bins,
            lower_bound,
            search.nodes,
            optimal
        );

        if search.best_bins > problem.bins {
            return Err(ModelError::infeasible(format!(
                "{} bins needed but only {} available",
                search.best_bins, problem.bins
            )));
        }

        // number bins by their lowest item index
        let mut by_item = vec![0; problem.items.len()];
        for (pos, &item) in search.order.iter().enumerate() {
            by_item[item] = search.best[pos];
        }
        let mut renumber: Vec<Option<usize>> = vec![None; search.best_bins];
        let mut next = 0;
        for bin in &mut by_item {
            let new = *renumber[*bin].get_or_insert_with(|| {
                next += 1;
                next - 1
            });
            *bin = new;
        }

        Ok(PackingSolution {
            assignment: by_item,
            bins_used: search.best_bins,
            optimal,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn problem(items: &[(u32, u32)], bins: usize, cap: (u32, u32)) -> PackingProblem {
        PackingProblem {
            items: items
                .iter()
                .map(|&(axons, neurons)| PackingItem { axons, neurons })
                .collect(),
            bins,
            axon_capacity: cap.0,
            neuron_capacity: cap.1,
        }
    }

    fn check_capacity(p: &PackingProblem, s: &PackingSolution) {
        for (a, n) in s.loads(p) {
            assert!(a <= p.axon_capacity && n <= p.neuron_capacity);
        }
        assert!(s.assignment.iter().all(|b| *b < s.bins_used));
    }

    #[test]
    fn test_three_items_two_bins() {
        let p = problem(&[(2, 2), (3, 1), (1, 3)], 8, (4, 4));
        let s = BranchAndBoundSolver::default().solve(&p).unwrap();
        assert_eq!(s.bins_used, 2);
        assert!(s.optimal);
        check_capacity(&p, &s);
    }

    #[test]
    fn test_fills_bins_to_capacity() {
        // {4,3} and {3,2,2} at capacity 7
        let p = problem(&[(4, 1), (3, 1), (3, 1), (2, 1), (2, 1)], 8, (7, 7));
        let s = BranchAndBoundSolver::default().solve(&p).unwrap();
        assert_eq!(s.bins_used, 2);
        check_capacity(&p, &s);
    }

    #[test]
    fn test_bins_numbered_by_first_item() {
        let p = problem(&[(1, 1), (4, 4), (1, 1)], 8, (4, 4));
        let s = BranchAndBoundSolver::default().solve(&p).unwrap();
        assert_eq!(s.bins_used, 2);
        assert_eq!(s.assignment[0], 0);
        assert_eq!(s.assignment[1], 1);
        assert_eq!(s.assignment[2], 0);
        assert_eq!(s.items_in(0).collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn test_infeasible() {
        let too_big = problem(&[(5, 1)], 4, (4, 4));
        assert!(matches!(
            BranchAndBoundSolver::default().solve(&too_big),
            Err(ModelError::InfeasibleAllocation { .. })
        ));
        let too_many = problem(&[(3, 3), (3, 3), (3, 3)], 2, (4, 4));
        assert!(BranchAndBoundSolver::default().solve(&too_many).is_err());
    }

    #[test]
    fn test_empty_and_budget() {
        let empty = problem(&[], 3, (4, 4));
        let s = BranchAndBoundSolver::default().solve(&empty).unwrap();
        assert_eq!(s.bins_used, 0);
        assert!(s.optimal);

        // volume bound is 2 but three bins are needed
        let p = problem(&[(3, 3), (3, 3), (2, 2)], 8, (4, 4));
        let s = BranchAndBoundSolver { node_budget: 1 }.solve(&p).unwrap();
        assert!(!s.optimal);
        assert_eq!(s.bins_used, 3);
        check_capacity(&p, &s);
        let s = BranchAndBoundSolver::default().solve(&p).unwrap();
        assert!(s.optimal);
    }
}
