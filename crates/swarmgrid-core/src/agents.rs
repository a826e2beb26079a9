//! Agent state buffer: structure-of-arrays columns behind generational handles.

use serde::{Deserialize, Serialize};
use slotmap::{SecondaryMap, SlotMap, new_key_type};
use std::collections::HashSet;
use swarmgrid_index::{CellId, Planar};

new_key_type! {
    /// Stable handle for agents backed by a generational slot map.
    pub struct AgentId;
}

/// Convenience alias for associating side data with agents.
pub type AgentMap<T> = SecondaryMap<AgentId, T>;

/// World-space position. `y` is carried through the pipeline untouched.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Position {
    #[must_use]
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Position on the ground plane (`y = 0`).
    #[must_use]
    pub const fn flat(x: f32, z: f32) -> Self {
        Self { x, y: 0.0, z }
    }

    /// Distance to `other` in the x/z plane.
    #[must_use]
    pub fn planar_distance(&self, other: &Self) -> f32 {
        swarmgrid_index::planar_distance((self.x, self.z), (other.x, other.z))
    }
}

impl Planar for Position {
    fn planar(&self) -> (f32, f32) {
        (self.x, self.z)
    }
}

/// Velocity in world units per second.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Velocity {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Velocity {
    #[must_use]
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    #[must_use]
    pub const fn flat(x: f32, z: f32) -> Self {
        Self { x, y: 0.0, z }
    }
}

/// Scalar fields stored for each agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AgentData {
    pub position: Position,
    pub velocity: Velocity,
    /// Positive mass used by the impulse response.
    pub mass: f32,
    /// Cell the agent is currently indexed under.
    pub cell: CellId,
}

impl AgentData {
    /// Unit-mass agent that has not been placed into the grid yet.
    #[must_use]
    pub const fn new(position: Position, velocity: Velocity) -> Self {
        Self {
            position,
            velocity,
            mass: 1.0,
            cell: CellId::UNASSIGNED,
        }
    }

    #[must_use]
    pub const fn with_mass(mut self, mass: f32) -> Self {
        self.mass = mass;
        self
    }
}

impl Default for AgentData {
    fn default() -> Self {
        Self::new(Position::default(), Velocity::default())
    }
}

/// Collection of per-agent columns for hot-path iteration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AgentColumns {
    positions: Vec<Position>,
    velocities: Vec<Velocity>,
    masses: Vec<f32>,
    cells: Vec<CellId>,
}

impl AgentColumns {
    /// Create a collection with reserved capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            positions: Vec::with_capacity(capacity),
            velocities: Vec::with_capacity(capacity),
            masses: Vec::with_capacity(capacity),
            cells: Vec::with_capacity(capacity),
        }
    }

    /// Number of active rows in the columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push a new row onto each column.
    pub fn push(&mut self, agent: AgentData) {
        self.positions.push(agent.position);
        self.velocities.push(agent.velocity);
        self.masses.push(agent.mass);
        self.cells.push(agent.cell);
        self.debug_assert_coherent();
    }

    /// Swap-remove the row at `index` and return its scalar fields.
    pub fn swap_remove(&mut self, index: usize) -> AgentData {
        let removed = AgentData {
            position: self.positions.swap_remove(index),
            velocity: self.velocities.swap_remove(index),
            mass: self.masses.swap_remove(index),
            cell: self.cells.swap_remove(index),
        };
        self.debug_assert_coherent();
        removed
    }

    /// Copy the row at `from` into position `to` without altering length.
    pub fn move_row(&mut self, from: usize, to: usize) {
        debug_assert!(from < self.len(), "move_row from out of bounds");
        debug_assert!(to < self.len(), "move_row to out of bounds");
        if from == to {
            return;
        }
        self.positions[to] = self.positions[from];
        self.velocities[to] = self.velocities[from];
        self.masses[to] = self.masses[from];
        self.cells[to] = self.cells[from];
    }

    pub fn truncate(&mut self, len: usize) {
        self.positions.truncate(len);
        self.velocities.truncate(len);
        self.masses.truncate(len);
        self.cells.truncate(len);
        self.debug_assert_coherent();
    }

    /// Return a copy of the scalar fields at `index`.
    #[must_use]
    pub fn snapshot(&self, index: usize) -> AgentData {
        AgentData {
            position: self.positions[index],
            velocity: self.velocities[index],
            mass: self.masses[index],
            cell: self.cells[index],
        }
    }

    #[must_use]
    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    #[must_use]
    pub fn velocities(&self) -> &[Velocity] {
        &self.velocities
    }

    #[must_use]
    pub fn masses(&self) -> &[f32] {
        &self.masses
    }

    /// Cell each agent is indexed under, as last recorded by the tracker.
    #[must_use]
    pub fn cells(&self) -> &[CellId] {
        &self.cells
    }

    /// Positions alongside their recorded cells, for the membership tracker.
    pub(crate) fn tracking_view(&mut self) -> (&[Position], &mut [CellId]) {
        (&self.positions, &mut self.cells)
    }

    /// Mutable motion columns with read-only masses; row count and cells stay fixed.
    pub(crate) fn motion_mut(&mut self) -> (&mut [Position], &mut [Velocity], &[f32]) {
        (&mut self.positions, &mut self.velocities, &self.masses)
    }

    /// Every kinematic column, for the pipeline's write-back.
    pub(crate) fn kinematics_mut(&mut self) -> (&mut [Position], &mut [Velocity], &mut [f32]) {
        (&mut self.positions, &mut self.velocities, &mut self.masses)
    }

    #[inline]
    fn debug_assert_coherent(&self) {
        debug_assert_eq!(self.positions.len(), self.velocities.len());
        debug_assert_eq!(self.positions.len(), self.masses.len());
        debug_assert_eq!(self.positions.len(), self.cells.len());
    }
}

/// Mutable view over the kinematic columns, indexed by dense slot.
///
/// Rows cannot be added or removed through this view, so grid membership
/// stays valid while external systems edit positions and velocities. Masses
/// are fixed at spawn and only readable here.
#[derive(Debug)]
pub struct KinematicsMut<'a> {
    pub handles: &'a [AgentId],
    pub positions: &'a mut [Position],
    pub velocities: &'a mut [Velocity],
    pub masses: &'a [f32],
}

impl KinematicsMut<'_> {
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

/// Dense SoA storage with generational handles for agent access.
#[derive(Debug, Default)]
pub struct AgentArena {
    slots: SlotMap<AgentId, usize>,
    handles: Vec<AgentId>,
    columns: AgentColumns,
}

impl AgentArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an arena with reserved capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: SlotMap::with_capacity_and_key(capacity),
            handles: Vec::with_capacity(capacity),
            columns: AgentColumns::with_capacity(capacity),
        }
    }

    /// Number of live agents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Iterate over live agent handles in dense slot order.
    pub fn iter_handles(&self) -> impl Iterator<Item = AgentId> + '_ {
        self.handles.iter().copied()
    }

    /// Handle of the agent stored at `slot`.
    #[must_use]
    pub fn handle_at(&self, slot: usize) -> Option<AgentId> {
        self.handles.get(slot).copied()
    }

    #[must_use]
    pub fn columns(&self) -> &AgentColumns {
        &self.columns
    }

    pub(crate) fn columns_mut(&mut self) -> &mut AgentColumns {
        &mut self.columns
    }

    /// Mutable motion state for every live agent, paired with their handles.
    pub fn kinematics_mut(&mut self) -> KinematicsMut<'_> {
        let (positions, velocities, masses) = self.columns.motion_mut();
        KinematicsMut {
            handles: &self.handles,
            positions,
            velocities,
            masses,
        }
    }

    /// Returns the dense slot for `id`, if present.
    #[must_use]
    pub fn index_of(&self, id: AgentId) -> Option<usize> {
        self.slots.get(id).copied()
    }

    #[must_use]
    pub fn contains(&self, id: AgentId) -> bool {
        self.slots.contains_key(id)
    }

    /// Insert a new agent and return its handle.
    pub fn insert(&mut self, agent: AgentData) -> AgentId {
        let index = self.columns.len();
        self.columns.push(agent);
        let id = self.slots.insert(index);
        self.handles.push(id);
        id
    }

    /// Swap-remove `id`, returning its data. The previous last row now lives in the freed slot.
    pub fn remove(&mut self, id: AgentId) -> Option<AgentData> {
        let index = self.slots.remove(id)?;
        let removed = self.columns.swap_remove(index);
        let removed_handle = self.handles.swap_remove(index);
        debug_assert_eq!(removed_handle, id);
        if let Some(&moved) = self.handles.get(index)
            && let Some(slot) = self.slots.get_mut(moved)
        {
            *slot = index;
        }
        Some(removed)
    }

    /// Remove every agent in `dead`, preserving the relative order of survivors.
    pub fn remove_many(&mut self, dead: &HashSet<AgentId>) -> usize {
        if dead.is_empty() {
            return 0;
        }
        let mut write = 0;
        for read in 0..self.handles.len() {
            let id = self.handles[read];
            if dead.contains(&id) {
                self.slots.remove(id);
                continue;
            }
            if write != read {
                self.handles[write] = id;
                self.columns.move_row(read, write);
            }
            if let Some(slot) = self.slots.get_mut(id) {
                *slot = write;
            }
            write += 1;
        }
        let removed = self.handles.len() - write;
        self.handles.truncate(write);
        self.columns.truncate(write);
        removed
    }

    /// Copy of the scalar data for `id`.
    #[must_use]
    pub fn snapshot(&self, id: AgentId) -> Option<AgentData> {
        let index = self.index_of(id)?;
        Some(self.columns.snapshot(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(x: f32) -> AgentData {
        AgentData::new(Position::flat(x, 0.0), Velocity::default())
    }

    #[test]
    fn remove_relocates_last_row() {
        let mut arena = AgentArena::new();
        let a = arena.insert(agent(1.0));
        let b = arena.insert(agent(2.0));
        let c = arena.insert(agent(3.0));

        let removed = arena.remove(a).expect("present");
        assert_eq!(removed.position.x, 1.0);
        assert!(!arena.contains(a));
        assert_eq!(arena.index_of(c), Some(0));
        assert_eq!(arena.index_of(b), Some(1));
        assert_eq!(arena.columns().positions()[0].x, 3.0);
        assert_eq!(arena.handle_at(0), Some(c));
        assert!(arena.remove(a).is_none(), "stale handles are rejected");
    }

    #[test]
    fn remove_many_preserves_order() {
        let mut arena = AgentArena::with_capacity(8);
        let ids: Vec<_> = (0..6).map(|i| arena.insert(agent(i as f32))).collect();
        let dead: HashSet<_> = [ids[1], ids[4]].into_iter().collect();

        assert_eq!(arena.remove_many(&dead), 2);
        let xs: Vec<f32> = arena.columns().positions().iter().map(|p| p.x).collect();
        assert_eq!(xs, vec![0.0, 2.0, 3.0, 5.0]);
        assert_eq!(arena.index_of(ids[5]), Some(3));
        assert_eq!(arena.iter_handles().count(), 4);
    }

    #[test]
    fn fresh_agents_start_unassigned() {
        let data = AgentData::default().with_mass(2.5);
        assert_eq!(data.cell, CellId::UNASSIGNED);
        assert_eq!(data.mass, 2.5);
        let mut arena = AgentArena::new();
        let id = arena.insert(data);
        assert_eq!(arena.snapshot(id), Some(data));
    }

    #[test]
    fn side_tables_follow_handles() {
        let mut arena = AgentArena::new();
        let a = arena.insert(agent(0.0));
        let b = arena.insert(agent(1.0));
        let mut labels: AgentMap<&str> = AgentMap::new();
        labels.insert(a, "a");
        labels.insert(b, "b");
        arena.remove(a);
        assert!(!arena.contains(a));
        let slot = arena.index_of(b).expect("live");
        assert_eq!(arena.handle_at(slot).and_then(|id| labels.get(id)), Some(&"b"));
    }
}
