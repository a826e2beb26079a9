//! Spatial indexing for dense agent crowds.
//!
//! The grid is a flat array of fixed-capacity buckets. Bucket `c` owns the
//! slots `c * capacity .. (c + 1) * capacity`; occupied slots always form a
//! prefix of the bucket and the remainder holds [`VOID_SLOT`]. Membership is
//! maintained incrementally (insert / remove with compaction) and can be
//! re-derived from scratch with [`SpatialGrid::rebuild`].

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use std::ops::Range;
use thiserror::Error;

/// Sentinel stored in bucket slots that hold no agent.
pub const VOID_SLOT: u32 = u32::MAX;

/// Upper bound on the number of cells a single broad-phase query inspects.
pub const MAX_QUERY_CELLS: usize = 9;

/// Forward neighbours visited by the half-shell traversal (east, north-west, north, north-east).
const HALF_SHELL: [(i64, i64); 4] = [(1, 0), (-1, 1), (0, 1), (1, 1)];

/// Cells inspected by a single broad-phase query.
pub type CellSet = SmallVec<[CellId; MAX_QUERY_CELLS]>;

/// Agent slots gathered from the cells of a [`CellSet`].
pub type CandidateSet = SmallVec<[u32; 32]>;

/// Errors emitted when constructing spatial index structures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used (e.g., non-positive cell size).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Failures of individual grid operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GridError {
    /// Every slot of the bucket is occupied; the agent was not indexed.
    #[error("cell {cell} is full; agent {agent} was not indexed")]
    BucketFull { cell: CellId, agent: u32 },
    /// The cell id does not address a bucket of this grid.
    #[error("cell {0} lies outside the grid")]
    CellOutOfRange(CellId),
    /// The agent slot collides with the void sentinel.
    #[error("agent slot {0} cannot be stored in a bucket")]
    SlotOutOfRange(u32),
}

/// Structural problems detected by [`SpatialGrid::check_invariants`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    /// An occupied slot follows a void slot inside a bucket.
    #[error("cell {cell} has an occupied slot after a gap at offset {offset}")]
    Gap { cell: CellId, offset: usize },
    /// The active-cell list disagrees with bucket contents.
    #[error("active-cell bookkeeping disagrees with bucket contents for cell {0}")]
    ActiveMismatch(CellId),
}

/// Linear id of a grid cell: `cx + cz * cells_across`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct CellId(pub u32);

impl CellId {
    /// Marker for agents that have not been placed into the grid yet.
    pub const UNASSIGNED: Self = Self(u32::MAX);

    /// Returns true unless this is [`CellId::UNASSIGNED`].
    #[must_use]
    pub const fn is_assigned(self) -> bool {
        self.0 != Self::UNASSIGNED.0
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_assigned() {
            write!(f, "#{}", self.0)
        } else {
            f.write_str("#unassigned")
        }
    }
}

/// An agent that could not be stored because its bucket was full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketOverflow {
    pub cell: CellId,
    pub agent: u32,
}

/// Anything with a planar (x, z) location.
pub trait Planar {
    /// Horizontal coordinates used for cell assignment and distance tests.
    fn planar(&self) -> (f32, f32);
}

impl Planar for (f32, f32) {
    fn planar(&self) -> (f32, f32) {
        *self
    }
}

/// Planar distance between two points.
#[inline]
#[must_use]
pub fn planar_distance(a: (f32, f32), b: (f32, f32)) -> f32 {
    let dx = a.0 - b.0;
    let dz = a.1 - b.1;
    (dx * dx + dz * dz).sqrt()
}

/// Result of mapping a position onto the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellLookup {
    pub cell: CellId,
    /// True when the position lay outside the world and was clamped onto the border.
    pub clamped: bool,
}

/// Square grid layout shared by every component that computes cell ids.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridGeometry {
    cell_size: f32,
    cells_across: u32,
}

impl GridGeometry {
    /// Describe a `cells_across × cells_across` grid of `cell_size` wide cells anchored at the origin.
    pub fn new(cell_size: f32, cells_across: u32) -> Result<Self, IndexError> {
        if !cell_size.is_finite() || cell_size <= 0.0 {
            return Err(IndexError::InvalidConfig(
                "cell_size must be positive and finite",
            ));
        }
        if cells_across == 0 {
            return Err(IndexError::InvalidConfig("cells_across must be non-zero"));
        }
        match cells_across.checked_mul(cells_across) {
            Some(total) if total < CellId::UNASSIGNED.0 => {}
            _ => {
                return Err(IndexError::InvalidConfig(
                    "cells_across squared must fit below the unassigned cell marker",
                ));
            }
        }
        Ok(Self {
            cell_size,
            cells_across,
        })
    }

    #[must_use]
    pub const fn cell_size(&self) -> f32 {
        self.cell_size
    }

    #[must_use]
    pub const fn cells_across(&self) -> u32 {
        self.cells_across
    }

    /// Total number of cells.
    #[must_use]
    pub const fn cell_count(&self) -> usize {
        (self.cells_across as usize) * (self.cells_across as usize)
    }

    /// World length covered along each axis.
    #[must_use]
    pub fn extent(&self) -> f32 {
        self.cell_size * self.cells_across as f32
    }

    /// Clamp one axis onto `[0, cells_across)`, reporting whether clamping happened.
    fn axis(&self, value: f32) -> (u32, bool) {
        let scaled = (value / self.cell_size).floor();
        if !scaled.is_finite() || scaled < 0.0 {
            return (0, true);
        }
        let last = self.cells_across - 1;
        if scaled > last as f32 {
            return (last, true);
        }
        (scaled as u32, false)
    }

    /// Map a planar position to its cell, clamping positions outside the world.
    #[must_use]
    pub fn locate(&self, x: f32, z: f32) -> CellLookup {
        let (cx, clamped_x) = self.axis(x);
        let (cz, clamped_z) = self.axis(z);
        CellLookup {
            cell: CellId(cx + cz * self.cells_across),
            clamped: clamped_x || clamped_z,
        }
    }

    /// Shorthand for `locate(x, z).cell`.
    #[must_use]
    pub fn cell_of(&self, x: f32, z: f32) -> CellId {
        self.locate(x, z).cell
    }

    /// Column and row of a cell.
    #[must_use]
    pub const fn coords(&self, cell: CellId) -> (u32, u32) {
        (cell.0 % self.cells_across, cell.0 / self.cells_across)
    }

    /// Cell at signed coordinates, or `None` when outside the grid (no row wrapping).
    #[must_use]
    pub fn cell_at(&self, cx: i64, cz: i64) -> Option<CellId> {
        let across = i64::from(self.cells_across);
        if (0..across).contains(&cx) && (0..across).contains(&cz) {
            Some(CellId((cx + cz * across) as u32))
        } else {
            None
        }
    }

    #[must_use]
    pub const fn contains(&self, cell: CellId) -> bool {
        (cell.0 as usize) < self.cell_count()
    }

    /// Position inside the cell along one axis, in `[0, 1)`.
    fn fraction(&self, value: f32) -> f32 {
        let scaled = value / self.cell_size;
        scaled - scaled.floor()
    }
}

/// Neighbour-gathering scheme used to build candidate sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum BroadPhase {
    /// Current cell plus the three neighbours in the quadrant the agent leans toward.
    #[default]
    Quadrant4,
    /// Cells under the four corners of the agent's bounding square.
    AabbCorners,
    /// Active-cell traversal pairing each cell with its forward half of the 3×3 block.
    ActiveCellHalfShell,
}

impl BroadPhase {
    /// Whether contacts are gathered per agent (as opposed to per active cell).
    #[must_use]
    pub const fn is_per_agent(self) -> bool {
        !matches!(self, Self::ActiveCellHalfShell)
    }

    /// Cells whose occupants may touch an agent at `(x, z)` within `reach`.
    ///
    /// Assumes `2 * reach <= cell_size`; under that sizing every agent closer
    /// than `reach` lives in one of the returned cells. The half-shell scheme
    /// has no per-agent form and falls back to the full 3×3 block.
    #[must_use]
    pub fn cells_for_agent(self, geometry: &GridGeometry, x: f32, z: f32, reach: f32) -> CellSet {
        let mut cells = CellSet::new();
        match self {
            Self::Quadrant4 => {
                let (cx, cz) = geometry.coords(geometry.cell_of(x, z));
                let dx = if geometry.fraction(x) < 0.5 { -1 } else { 1 };
                let dz = if geometry.fraction(z) < 0.5 { -1 } else { 1 };
                let offsets = [(0, 0), (dx, 0), (0, dz), (dx, dz)];
                cells.extend(
                    offsets
                        .iter()
                        .filter_map(|&(ox, oz)| {
                            geometry.cell_at(i64::from(cx) + ox, i64::from(cz) + oz)
                        }),
                );
            }
            Self::AabbCorners => {
                let corners = [
                    (x - reach, z - reach),
                    (x + reach, z - reach),
                    (x - reach, z + reach),
                    (x + reach, z + reach),
                ];
                for (px, pz) in corners {
                    let cell = geometry.cell_of(px, pz);
                    if !cells.contains(&cell) {
                        cells.push(cell);
                    }
                }
            }
            Self::ActiveCellHalfShell => {
                let (cx, cz) = geometry.coords(geometry.cell_of(x, z));
                for oz in -1..=1 {
                    for ox in -1..=1 {
                        if let Some(cell) =
                            geometry.cell_at(i64::from(cx) + ox, i64::from(cz) + oz)
                        {
                            cells.push(cell);
                        }
                    }
                }
            }
        }
        cells
    }
}

/// Outcome of a full grid rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildReport {
    /// Agents successfully stored in a bucket.
    pub indexed: usize,
    /// Agents whose position had to be clamped onto the grid border.
    pub out_of_bounds: usize,
    /// Agents rejected because their bucket was already full.
    pub overflows: Vec<BucketOverflow>,
}

/// Common behaviour exposed by neighbourhood indices.
pub trait NeighborhoodIndex {
    /// Re-derive the index from agent positions, writing each agent's cell into `cells`.
    fn rebuild<P: Planar>(&mut self, positions: &[P], cells: &mut [CellId]) -> RebuildReport;

    /// Visit agents closer than `radius` to `agent_idx`, excluding the agent itself.
    fn neighbors_within<P: Planar>(
        &self,
        agent_idx: usize,
        positions: &[P],
        radius: f32,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    );
}

/// Bucketed uniform grid with incremental membership and active-cell tracking.
#[derive(Debug, Clone)]
pub struct SpatialGrid {
    geometry: GridGeometry,
    capacity: usize,
    broad_phase: BroadPhase,
    slots: Vec<u32>,
    active: Vec<CellId>,
    active_slot: Vec<u32>,
}

impl SpatialGrid {
    /// Allocate a grid and fill every bucket with the void sentinel.
    pub fn new(
        geometry: GridGeometry,
        capacity: usize,
        broad_phase: BroadPhase,
    ) -> Result<Self, IndexError> {
        if capacity == 0 {
            return Err(IndexError::InvalidConfig("cell capacity must be non-zero"));
        }
        let Some(total) = geometry.cell_count().checked_mul(capacity) else {
            return Err(IndexError::InvalidConfig(
                "cell count times capacity overflows the address space",
            ));
        };
        let mut grid = Self {
            geometry,
            capacity,
            broad_phase,
            slots: vec![VOID_SLOT; total],
            active: Vec::new(),
            active_slot: vec![VOID_SLOT; geometry.cell_count()],
        };
        grid.init();
        Ok(grid)
    }

    /// Reset every slot to the void sentinel and forget all active cells.
    pub fn init(&mut self) {
        self.slots.fill(VOID_SLOT);
        self.active_slot.fill(VOID_SLOT);
        self.active.clear();
    }

    #[must_use]
    pub const fn geometry(&self) -> &GridGeometry {
        &self.geometry
    }

    /// Slots per bucket.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub const fn broad_phase(&self) -> BroadPhase {
        self.broad_phase
    }

    fn bucket_range(&self, cell: CellId) -> Result<Range<usize>, GridError> {
        if !self.geometry.contains(cell) {
            return Err(GridError::CellOutOfRange(cell));
        }
        let start = cell.index() * self.capacity;
        Ok(start..start + self.capacity)
    }

    fn occupied_len(bucket: &[u32]) -> usize {
        bucket
            .iter()
            .position(|&slot| slot == VOID_SLOT)
            .unwrap_or(bucket.len())
    }

    /// Raw bucket contents, sentinels included. Empty for cells outside the grid.
    #[must_use]
    pub fn bucket(&self, cell: CellId) -> &[u32] {
        match self.bucket_range(cell) {
            Ok(range) => &self.slots[range],
            Err(_) => &[],
        }
    }

    /// Occupied prefix of a bucket.
    #[must_use]
    pub fn occupants(&self, cell: CellId) -> &[u32] {
        let bucket = self.bucket(cell);
        &bucket[..Self::occupied_len(bucket)]
    }

    /// Store `agent` in the first void slot of `cell`, returning its offset.
    pub fn insert(&mut self, cell: CellId, agent: u32) -> Result<usize, GridError> {
        if agent == VOID_SLOT {
            return Err(GridError::SlotOutOfRange(agent));
        }
        let range = self.bucket_range(cell)?;
        let bucket = &mut self.slots[range];
        let len = Self::occupied_len(bucket);
        if len == bucket.len() {
            return Err(GridError::BucketFull { cell, agent });
        }
        bucket[len] = agent;
        if len == 0 {
            self.activate(cell);
        }
        Ok(len)
    }

    /// Remove `agent` from `cell`, shifting later occupants down. Returns false if absent.
    pub fn remove(&mut self, cell: CellId, agent: u32) -> bool {
        let Ok(range) = self.bucket_range(cell) else {
            return false;
        };
        let bucket = &mut self.slots[range];
        let len = Self::occupied_len(bucket);
        let Some(offset) = bucket[..len].iter().position(|&slot| slot == agent) else {
            return false;
        };
        bucket.copy_within(offset + 1..len, offset);
        bucket[len - 1] = VOID_SLOT;
        if len == 1 {
            self.deactivate(cell);
        }
        true
    }

    fn activate(&mut self, cell: CellId) {
        self.active_slot[cell.index()] = self.active.len() as u32;
        self.active.push(cell);
    }

    fn deactivate(&mut self, cell: CellId) {
        let idx = self.active_slot[cell.index()];
        if idx == VOID_SLOT {
            return;
        }
        let idx = idx as usize;
        self.active.swap_remove(idx);
        if let Some(&moved) = self.active.get(idx) {
            self.active_slot[moved.index()] = idx as u32;
        }
        self.active_slot[cell.index()] = VOID_SLOT;
    }

    /// Cells currently holding at least one agent, in no particular order.
    #[must_use]
    pub fn active_cells(&self) -> &[CellId] {
        &self.active
    }

    #[must_use]
    pub fn is_active(&self, cell: CellId) -> bool {
        self.geometry.contains(cell) && self.active_slot[cell.index()] != VOID_SLOT
    }

    /// Number of agents currently stored across all buckets.
    #[must_use]
    pub fn indexed_agents(&self) -> usize {
        self.active
            .iter()
            .map(|&cell| self.occupants(cell).len())
            .sum()
    }

    /// Append the occupants of `cells` to `out`.
    pub fn gather_candidates(&self, cells: &CellSet, out: &mut CandidateSet) {
        for &cell in cells {
            out.extend_from_slice(self.occupants(cell));
        }
    }

    /// Candidate set for an agent at `(x, z)` under this grid's broad-phase scheme.
    #[must_use]
    pub fn candidates_for(&self, x: f32, z: f32, reach: f32) -> CandidateSet {
        let cells = self
            .broad_phase
            .cells_for_agent(&self.geometry, x, z, reach);
        let mut out = CandidateSet::new();
        self.gather_candidates(&cells, &mut out);
        out
    }

    /// Visit every pair closer than `reach` that involves an occupant of `cell`
    /// and an agent in `cell` or one of its forward neighbours.
    ///
    /// Pairs are reported as `(low, high, distance)`. Walking every active cell
    /// this way visits each pair of adjacent-cell agents exactly once.
    pub fn visit_half_shell<P: Planar>(
        &self,
        cell: CellId,
        positions: &[P],
        reach: f32,
        visitor: &mut dyn FnMut(u32, u32, OrderedFloat<f32>),
    ) {
        let own = self.occupants(cell);
        if own.is_empty() {
            return;
        }
        let mut candidates: CandidateSet = own.iter().copied().collect();
        let (cx, cz) = self.geometry.coords(cell);
        for (ox, oz) in HALF_SHELL {
            if let Some(neighbor) = self.geometry.cell_at(i64::from(cx) + ox, i64::from(cz) + oz) {
                candidates.extend_from_slice(self.occupants(neighbor));
            }
        }
        for i in 0..own.len() {
            let a = candidates[i];
            let Some(pa) = positions.get(a as usize) else {
                continue;
            };
            for &b in &candidates[i + 1..] {
                let Some(pb) = positions.get(b as usize) else {
                    continue;
                };
                let distance = planar_distance(pa.planar(), pb.planar());
                if distance < reach && a != b {
                    visitor(a.min(b), a.max(b), OrderedFloat(distance));
                }
            }
        }
    }

    /// Verify bucket compaction and active-cell bookkeeping.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        for raw in 0..self.geometry.cell_count() {
            let cell = CellId(raw as u32);
            let bucket = self.bucket(cell);
            let len = Self::occupied_len(bucket);
            if let Some(offset) = bucket[len..].iter().position(|&slot| slot != VOID_SLOT) {
                return Err(InvariantViolation::Gap {
                    cell,
                    offset: len + offset,
                });
            }
            let listed = self.active_slot[raw] != VOID_SLOT;
            if listed != (len > 0) {
                return Err(InvariantViolation::ActiveMismatch(cell));
            }
            if listed && self.active.get(self.active_slot[raw] as usize) != Some(&cell) {
                return Err(InvariantViolation::ActiveMismatch(cell));
            }
        }
        Ok(())
    }
}

impl NeighborhoodIndex for SpatialGrid {
    fn rebuild<P: Planar>(&mut self, positions: &[P], cells: &mut [CellId]) -> RebuildReport {
        debug_assert_eq!(positions.len(), cells.len(), "one cell per agent");
        self.init();
        let mut report = RebuildReport::default();
        for (idx, (position, stored)) in positions.iter().zip(cells.iter_mut()).enumerate() {
            let (x, z) = position.planar();
            let lookup = self.geometry.locate(x, z);
            *stored = lookup.cell;
            if lookup.clamped {
                report.out_of_bounds += 1;
            }
            let agent = u32::try_from(idx).unwrap_or(VOID_SLOT);
            match self.insert(lookup.cell, agent) {
                Ok(_) => report.indexed += 1,
                Err(GridError::BucketFull { cell, agent }) => {
                    report.overflows.push(BucketOverflow { cell, agent });
                }
                Err(_) => {}
            }
        }
        report
    }

    fn neighbors_within<P: Planar>(
        &self,
        agent_idx: usize,
        positions: &[P],
        radius: f32,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    ) {
        let Some(origin) = positions.get(agent_idx).map(Planar::planar) else {
            return;
        };
        let candidates = self.candidates_for(origin.0, origin.1, radius);
        for other in candidates {
            let other = other as usize;
            if other == agent_idx {
                continue;
            }
            let Some(position) = positions.get(other) else {
                continue;
            };
            let distance = planar_distance(origin, position.planar());
            if distance < radius {
                visitor(other, OrderedFloat(distance));
            }
        }
    }
}
