//! Grid updater: applies tracked cell changes to the spatial grid.

use crate::membership::MoveRecord;
use swarmgrid_index::{BucketOverflow, CellId, GridError, SpatialGrid};

/// Drain `moves` into `grid`, returning agents that could not be indexed.
///
/// `stranded` lists agents left unindexed by an earlier tick. Each record
/// removes the agent from its old bucket (a no-op for agents that were never
/// indexed) and appends it to the new one. Stranded agents without a record
/// are then retried against their stored cell in `cells`, so space freed by
/// this tick's moves is reused immediately.
pub fn apply_moves(
    grid: &mut SpatialGrid,
    moves: &mut Vec<MoveRecord>,
    stranded: &[u32],
    cells: &[CellId],
) -> Vec<BucketOverflow> {
    let retries: Vec<(u32, CellId)> = stranded
        .iter()
        .filter(|&&agent| {
            moves
                .binary_search_by_key(&agent, |record| record.agent)
                .is_err()
        })
        .filter_map(|&agent| cells.get(agent as usize).map(|&cell| (agent, cell)))
        .collect();

    let mut overflows = Vec::new();
    for record in moves.drain(..) {
        if record.old.is_assigned() {
            grid.remove(record.old, record.agent);
        }
        place(grid, record.new, record.agent, &mut overflows);
    }
    for (agent, cell) in retries {
        place(grid, cell, agent, &mut overflows);
    }
    overflows.sort_unstable_by_key(|overflow| overflow.agent);
    overflows
}

fn place(grid: &mut SpatialGrid, cell: CellId, agent: u32, overflows: &mut Vec<BucketOverflow>) {
    match grid.insert(cell, agent) {
        Ok(_) => {}
        Err(GridError::BucketFull { cell, agent }) => {
            overflows.push(BucketOverflow { cell, agent });
        }
        Err(err) => {
            tracing::warn!(agent, error = %err, "move record rejected");
        }
    }
}
