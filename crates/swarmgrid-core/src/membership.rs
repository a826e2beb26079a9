//! Cell membership tracking: detects agents whose cell changed since the last tick.

use crate::agents::Position;
use rayon::prelude::*;
use swarmgrid_index::{CellId, GridGeometry};

/// A cell change for one agent, consumed once by the grid updater.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveRecord {
    pub agent: u32,
    /// Previous cell, or [`CellId::UNASSIGNED`] for agents never indexed.
    pub old: CellId,
    pub new: CellId,
}

/// Result of one tracking pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TrackOutcome {
    /// Move records in ascending agent order.
    pub moves: Vec<MoveRecord>,
    /// Agents whose position had to be clamped onto the grid.
    pub out_of_bounds: usize,
}

impl TrackOutcome {
    fn merge(mut self, other: Self) -> Self {
        self.moves.extend(other.moves);
        self.out_of_bounds += other.out_of_bounds;
        self
    }
}

/// Recompute every agent's cell, storing it immediately and emitting a record when it changed.
///
/// Touches no grid state; records are applied later by [`crate::updater::apply_moves`].
pub fn track_cells(
    geometry: &GridGeometry,
    positions: &[Position],
    cells: &mut [CellId],
    batch: usize,
) -> TrackOutcome {
    debug_assert_eq!(positions.len(), cells.len());
    positions
        .par_iter()
        .zip(cells.par_iter_mut())
        .enumerate()
        .with_min_len(batch.max(1))
        .fold(TrackOutcome::default, |mut acc, (idx, (position, stored))| {
            let lookup = geometry.locate(position.x, position.z);
            if lookup.clamped {
                acc.out_of_bounds += 1;
            }
            if lookup.cell != *stored {
                acc.moves.push(MoveRecord {
                    agent: idx as u32,
                    old: *stored,
                    new: lookup.cell,
                });
                *stored = lookup.cell;
            }
            acc
        })
        .reduce(TrackOutcome::default, TrackOutcome::merge)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> GridGeometry {
        GridGeometry::new(1.0, 10).expect("geometry")
    }

    #[test]
    fn unchanged_cells_emit_nothing() {
        let geometry = geometry();
        let positions = vec![Position::flat(1.5, 1.5), Position::flat(4.2, 7.9)];
        let mut cells = vec![geometry.cell_of(1.5, 1.5), geometry.cell_of(4.2, 7.9)];
        let before = cells.clone();

        let outcome = track_cells(&geometry, &positions, &mut cells, 1);
        assert!(outcome.moves.is_empty());
        assert_eq!(outcome.out_of_bounds, 0);
        assert_eq!(cells, before);
    }

    #[test]
    fn changed_cells_are_recorded_and_stored() {
        let geometry = geometry();
        let positions = vec![
            Position::flat(1.5, 1.5),
            Position::flat(2.1, 1.5),
            Position::flat(3.0, 3.0),
        ];
        let mut cells = vec![
            geometry.cell_of(1.5, 1.5),
            geometry.cell_of(1.9, 1.5),
            CellId::UNASSIGNED,
        ];

        let outcome = track_cells(&geometry, &positions, &mut cells, 1);
        assert_eq!(
            outcome.moves,
            vec![
                MoveRecord {
                    agent: 1,
                    old: CellId(11),
                    new: CellId(12)
                },
                MoveRecord {
                    agent: 2,
                    old: CellId::UNASSIGNED,
                    new: CellId(33)
                },
            ]
        );
        assert_eq!(cells[1], CellId(12));
        assert_eq!(cells[2], CellId(33));
    }

    #[test]
    fn clamped_agents_are_counted() {
        let geometry = geometry();
        let positions = vec![Position::flat(-2.0, 5.0), Position::flat(f32::NAN, 0.5)];
        let mut cells = vec![CellId::UNASSIGNED; 2];
        let outcome = track_cells(&geometry, &positions, &mut cells, 4);
        assert_eq!(outcome.out_of_bounds, 2);
        assert_eq!(cells, vec![CellId(50), CellId(0)]);
    }

    #[test]
    fn large_batches_keep_agent_order() {
        let geometry = geometry();
        let positions: Vec<Position> = (0..500)
            .map(|i| Position::flat((i % 10) as f32 + 0.5, (i / 50) as f32 + 0.5))
            .collect();
        let mut cells = vec![CellId::UNASSIGNED; positions.len()];
        let outcome = track_cells(&geometry, &positions, &mut cells, 16);
        assert_eq!(outcome.moves.len(), positions.len());
        assert!(
            outcome
                .moves
                .windows(2)
                .all(|pair| pair[0].agent < pair[1].agent)
        );
    }
}
