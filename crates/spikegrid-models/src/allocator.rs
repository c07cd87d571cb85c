// SPDX-License-Identifier: AGPL-3.0-only

//! Core allocation: pack components into bins, pick a grid shape, place bins.
//!
//! Bins are numbered `0..bins_used` and laid out row-major over the selected
//! shape, skipping the output-core cell.

use crate::error::{ModelError, Result};
use crate::solver::{BinPackingSolver, PackingItem, PackingProblem, PackingSolution};
use spikegrid_chip::ArchitectureParams;

/// A solved allocation and where each bin lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    /// Item-to-bin assignment.
    pub solution: PackingSolution,
    /// Selected grid shape `(x, y)`.
    pub shape: (u32, u32),
    /// Grid coordinate of each bin.
    pub positions: Vec<(u32, u32)>,
}

/// Smallest grid shape, grown from the output coordinate, that holds
/// `bins_used` cores plus the output core.
///
/// The smaller axis grows first (X on ties) and neither axis exceeds the
/// target grid.
///
/// # Errors
///
/// [`ModelError::InfeasibleAllocation`] if the target grid is too small.
pub fn select_grid_shape(bins_used: usize, target: &ArchitectureParams) -> Result<(u32, u32)> {
    let cells = target.cell_count() as usize;
    if bins_used + 1 > cells {
        return Err(ModelError::infeasible(format!(
            "{bins_used} cores plus the output core exceed the {}x{} grid",
            target.grid_dimension_x, target.grid_dimension_y
        )));
    }
    let (mut x, mut y) = (target.output_core_x + 1, target.output_core_y + 1);
    while (x as usize) * (y as usize) < bins_used + 1 {
        let can_x = x < target.grid_dimension_x;
        let can_y = y < target.grid_dimension_y;
        if can_x && (x <= y || !can_y) {
            x += 1;
        } else if can_y {
            y += 1;
        } else {
            break;
        }
    }
    Ok((x, y))
}

/// Row-major coordinates for `bins_used` bins over `shape`, skipping `output`.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn place_bins(bins_used: usize, shape: (u32, u32), output: (u32, u32)) -> Vec<(u32, u32)> {
    let width = shape.0.max(1) as usize;
    let output_index = output.0 as usize + width * output.1 as usize;
    (0..bins_used)
        .map(|k| {
            let index = k + usize::from(output_index <= k);
            ((index % width) as u32, (index / width) as u32)
        })
        .collect()
}

/// Pack `items` into `target`'s cores and place the used bins.
///
/// # Errors
///
/// [`ModelError::InfeasibleAllocation`] if the items do not fit, or if the
/// solver could not prove its bin count optimal.
pub fn allocate(
    items: Vec<PackingItem>,
    target: &ArchitectureParams,
    solver: &dyn BinPackingSolver,
) -> Result<Allocation> {
    let problem = PackingProblem {
        items,
        bins: (target.cell_count() as usize).saturating_sub(1),
        axon_capacity: target.num_axons,
        neuron_capacity: target.num_neurons,
    };
    let solution = solver.solve(&problem)?;
    if !solution.optimal {
        return Err(ModelError::infeasible(format!(
            "solver stopped at {} cores without proving optimality",
            solution.bins_used
        )));
    }
    let shape = select_grid_shape(solution.bins_used, target)?;
    let positions = place_bins(solution.bins_used, shape, target.output_core());
    for (bin, ((axons, neurons), pos)) in solution.loads(&problem).iter().zip(&positions).enumerate() {
        tracing::debug!(
            "Bin {} -> core {:?}: {}/{} axons, {}/{} neurons",
            bin,
            pos,
            axons,
            target.num_axons,
            neurons,
            target.num_neurons
        );
    }
    tracing::info!(
        "Allocated {} components to {} cores on a {}x{} grid",
        problem.items.len(),
        solution.bins_used,
        shape.0,
        shape.1
    );
    Ok(Allocation {
        solution,
        shape,
        positions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::BranchAndBoundSolver;
    use spikegrid_chip::ArchField;

    fn grid(x: u64, y: u64, out: (u64, u64)) -> ArchitectureParams {
        ArchitectureParams::REFERENCE
            .with_field(ArchField::GridDimensionX, x)
            .unwrap()
            .with_field(ArchField::GridDimensionY, y)
            .unwrap()
            .with_field(ArchField::OutputCoreX, out.0)
            .unwrap()
            .with_field(ArchField::OutputCoreY, out.1)
            .unwrap()
    }

    #[test]
    fn test_shape_grows_smaller_axis() {
        let arch = grid(4, 4, (0, 0));
        assert_eq!(select_grid_shape(0, &arch).unwrap(), (1, 1));
        assert_eq!(select_grid_shape(1, &arch).unwrap(), (2, 1));
        assert_eq!(select_grid_shape(3, &arch).unwrap(), (2, 2));
        assert_eq!(select_grid_shape(4, &arch).unwrap(), (3, 2));
        assert_eq!(select_grid_shape(15, &arch).unwrap(), (4, 4));
        assert!(select_grid_shape(16, &arch).is_err());
    }

    #[test]
    fn test_shape_respects_output_and_bounds() {
        let arch = grid(8, 2, (1, 1));
        // never below the output row/column
        assert_eq!(select_grid_shape(1, &arch).unwrap(), (2, 2));
        // y is capped at 2, so x keeps growing
        assert_eq!(select_grid_shape(7, &arch).unwrap(), (4, 2));
    }

    #[test]
    fn test_placement_skips_output() {
        assert_eq!(
            place_bins(3, (2, 2), (0, 0)),
            vec![(1, 0), (0, 1), (1, 1)]
        );
        assert_eq!(
            place_bins(3, (2, 2), (1, 0)),
            vec![(0, 0), (0, 1), (1, 1)]
        );
        assert_eq!(place_bins(2, (3, 1), (2, 0)), vec![(0, 0), (1, 0)]);
    }

    #[test]
    fn test_allocate() {
        let arch = grid(4, 4, (0, 0))
            .with_field(ArchField::NumAxons, 4)
            .unwrap()
            .with_field(ArchField::NumNeurons, 4)
            .unwrap()
            .with_field(ArchField::NumOutputs, 4)
            .unwrap();
        let items = vec![
            PackingItem {
                axons: 2,
                neurons: 2,
            },
            PackingItem {
                axons: 3,
                neurons: 1,
            },
            PackingItem {
                axons: 1,
                neurons: 3,
            },
        ];
        let a = allocate(items, &arch, &BranchAndBoundSolver::default()).unwrap();
        assert_eq!(a.solution.bins_used, 2);
        assert_eq!(a.shape, (2, 2));
        assert_eq!(a.positions, vec![(1, 0), (0, 1)]);
    }

    #[test]
    fn test_allocate_rejects_unproven() {
        let arch = grid(4, 4, (0, 0))
            .with_field(ArchField::NumAxons, 4)
            .unwrap()
            .with_field(ArchField::NumNeurons, 4)
            .unwrap()
            .with_field(ArchField::NumOutputs, 4)
            .unwrap();
        let items: Vec<PackingItem> = [3, 3, 2]
            .iter()
            .map(|&n| PackingItem {
                axons: n,
                neurons: n,
            })
            .collect();
        assert!(matches!(
            allocate(items.clone(), &arch, &BranchAndBoundSolver { node_budget: 1 }),
            Err(ModelError::InfeasibleAllocation { .. })
        ));
        let a = allocate(items, &arch, &BranchAndBoundSolver::default()).unwrap();
        assert_eq!(a.solution.bins_used, 3);
    }
}
