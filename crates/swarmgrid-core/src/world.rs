//! The per-tick collision pipeline.

use crate::agents::{AgentArena, AgentColumns, AgentData, AgentId, KinematicsMut};
use crate::config::{CollisionConfig, ResolveMode};
use crate::membership::{MoveRecord, track_cells};
use crate::narrowphase::{
    Body, ContactPair, ResolveOutcome, ResolveParams, detect_contacts, resolve_accumulate,
    resolve_sequential,
};
use crate::updater::apply_moves;
use crate::{CollisionError, Tick};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use swarmgrid_index::{BucketOverflow, CellId, NeighborhoodIndex, SpatialGrid};
use tracing::{debug, info, warn};

/// Per-frame input supplied by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TickInput {
    /// Frame delta in seconds. Recorded in the report; resolution is instantaneous.
    pub dt: f32,
    /// Re-derive the grid from scratch before tracking.
    pub force_rebuild: bool,
}

impl TickInput {
    #[must_use]
    pub const fn new(dt: f32) -> Self {
        Self {
            dt,
            force_rebuild: false,
        }
    }

    #[must_use]
    pub const fn with_rebuild(mut self) -> Self {
        self.force_rebuild = true;
        self
    }
}

/// Everything observed while processing one tick.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TickReport {
    pub tick: Tick,
    pub dt: f32,
    pub agents: usize,
    /// True when the grid was rebuilt instead of incrementally updated.
    pub rebuilt: bool,
    /// Cell changes applied to the grid; every indexed agent on rebuild ticks.
    pub moves: usize,
    /// Contact pairs found by detection.
    pub contacts: usize,
    pub resolved: usize,
    pub impulses: usize,
    pub out_of_bounds: usize,
    /// Agents unindexed at the end of the tick because their bucket was full.
    ///
    /// Stranded agents are retried every tick, so they appear here until they fit.
    pub overflows: Vec<BucketOverflow>,
}

impl TickReport {
    #[must_use]
    pub fn summary(&self) -> TickSummary {
        TickSummary {
            tick: self.tick,
            agents: self.agents,
            rebuilt: self.rebuilt,
            moves: self.moves,
            contacts: self.contacts,
            resolved: self.resolved,
            overflows: self.overflows.len(),
            out_of_bounds: self.out_of_bounds,
        }
    }
}

/// Compact per-tick record retained in the world history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TickSummary {
    pub tick: Tick,
    pub agents: usize,
    pub rebuilt: bool,
    pub moves: usize,
    pub contacts: usize,
    pub resolved: usize,
    pub overflows: usize,
    pub out_of_bounds: usize,
}

/// Cumulative counters since the world was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PipelineStats {
    pub ticks: u64,
    pub rebuilds: u64,
    pub moves: u64,
    pub contacts: u64,
    pub resolved: u64,
    pub overflows: u64,
    pub out_of_bounds: u64,
    pub spawned: u64,
    pub despawned: u64,
}

impl PipelineStats {
    fn record(&mut self, report: &TickReport) {
        self.ticks += 1;
        self.rebuilds += u64::from(report.rebuilt);
        self.moves += report.moves as u64;
        self.contacts += report.contacts as u64;
        self.resolved += report.resolved as u64;
        self.overflows += report.overflows.len() as u64;
        self.out_of_bounds += report.out_of_bounds as u64;
    }
}

#[derive(Debug, Default)]
struct MembershipOutcome {
    rebuilt: bool,
    moves: usize,
    out_of_bounds: usize,
    overflows: Vec<BucketOverflow>,
}

/// Agent buffer, spatial grid and scratch state for one collision domain.
pub struct CollisionWorld {
    config: CollisionConfig,
    params: ResolveParams,
    tick: Tick,
    agents: AgentArena,
    grid: SpatialGrid,
    moves: Vec<MoveRecord>,
    /// Slots rejected by a full bucket, ascending.
    unindexed: Vec<u32>,
    scratch: Vec<Body>,
    pending_rebuild: bool,
    structural_changes: usize,
    stats: PipelineStats,
    history: VecDeque<TickSummary>,
}

impl fmt::Debug for CollisionWorld {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollisionWorld")
            .field("config", &self.config)
            .field("tick", &self.tick)
            .field("agent_count", &self.agents.len())
            .field("active_cells", &self.grid.active_cells().len())
            .field("unindexed", &self.unindexed.len())
            .field("pending_rebuild", &self.pending_rebuild)
            .finish()
    }
}

impl CollisionWorld {
    /// Validate `config` and allocate the grid.
    pub fn new(config: CollisionConfig) -> Result<Self, CollisionError> {
        let geometry = config.validate()?;
        let grid = SpatialGrid::new(geometry, config.cell_capacity, config.broad_phase)?;
        debug!(
            cells = geometry.cell_count(),
            capacity = config.cell_capacity,
            broad_phase = ?config.broad_phase,
            "collision grid allocated"
        );
        Ok(Self {
            params: ResolveParams::from_config(&config),
            history: VecDeque::with_capacity(config.history_capacity),
            config,
            tick: Tick::zero(),
            agents: AgentArena::new(),
            grid,
            moves: Vec::new(),
            unindexed: Vec::new(),
            scratch: Vec::new(),
            pending_rebuild: false,
            structural_changes: 0,
            stats: PipelineStats::default(),
        })
    }

    /// Add an agent. It is indexed by the next [`CollisionWorld::step`].
    pub fn spawn(&mut self, agent: AgentData) -> Result<AgentId, CollisionError> {
        if self.agents.len() >= self.config.max_agents {
            return Err(CollisionError::CapacityExceeded(self.config.max_agents));
        }
        if !agent.mass.is_finite() || agent.mass <= 0.0 {
            return Err(CollisionError::InvalidAgent("mass must be positive and finite"));
        }
        let id = self.agents.insert(AgentData {
            cell: CellId::UNASSIGNED,
            ..agent
        });
        self.stats.spawned += 1;
        Ok(id)
    }

    /// Remove one agent, patching the grid for the row that fills its slot.
    pub fn despawn(&mut self, id: AgentId) -> Option<AgentData> {
        let slot = self.agents.index_of(id)?;
        let last = self.agents.len() - 1;
        let cells = self.agents.columns().cells();
        let (own_cell, last_cell) = (cells[slot], cells[last]);

        if own_cell.is_assigned() {
            self.grid.remove(own_cell, slot as u32);
        }
        if slot != last && last_cell.is_assigned() && self.grid.remove(last_cell, last as u32) {
            // A slot was just freed in this bucket, so the insert cannot overflow.
            if let Err(err) = self.grid.insert(last_cell, slot as u32) {
                warn!(error = %err, "failed to re-index relocated agent");
                self.pending_rebuild = true;
            }
        }

        let (slot, last) = (slot as u32, last as u32);
        self.unindexed.retain(|&agent| agent != slot);
        if let Some(moved) = self.unindexed.iter_mut().find(|agent| **agent == last) {
            *moved = slot;
            self.unindexed.sort_unstable();
        }

        let removed = self.agents.remove(id)?;
        self.stats.despawned += 1;
        self.note_structural_change(1);
        Some(removed)
    }

    /// Remove many agents at once and schedule a grid rebuild.
    pub fn despawn_many(&mut self, ids: &[AgentId]) -> usize {
        let dead: HashSet<AgentId> = ids.iter().copied().collect();
        let removed = self.agents.remove_many(&dead);
        if removed > 0 {
            // Slot numbers shift; the rebuild recomputes the stranded set.
            self.unindexed.clear();
            self.pending_rebuild = true;
            self.stats.despawned += removed as u64;
            self.note_structural_change(removed);
        }
        removed
    }

    fn note_structural_change(&mut self, count: usize) {
        self.structural_changes += count;
        let threshold = self.config.rebuild_after_despawns;
        if threshold > 0 && self.structural_changes >= threshold {
            self.pending_rebuild = true;
        }
    }

    /// Rebuild the grid from scratch at the start of the next tick.
    pub fn request_rebuild(&mut self) {
        self.pending_rebuild = true;
    }

    /// Run one tick: membership, grid update, contact detection, resolution and write-back.
    pub fn step(&mut self, input: TickInput) -> TickReport {
        let next_tick = self.tick.next();
        let membership = self.stage_membership(input.force_rebuild || self.pending_rebuild);
        let pairs = self.stage_detect();
        let resolved = self.stage_resolve(&pairs);
        self.stage_write_back();

        let report = TickReport {
            tick: next_tick,
            dt: input.dt,
            agents: self.agents.len(),
            rebuilt: membership.rebuilt,
            moves: membership.moves,
            contacts: pairs.len(),
            resolved: resolved.resolved,
            impulses: resolved.impulses,
            out_of_bounds: membership.out_of_bounds,
            overflows: membership.overflows,
        };
        self.stage_record(&report);
        self.tick = next_tick;
        report
    }

    fn stage_membership(&mut self, rebuild: bool) -> MembershipOutcome {
        if rebuild {
            let (positions, cells) = self.agents.columns_mut().tracking_view();
            let report = self.grid.rebuild(positions, cells);
            self.moves.clear();
            self.unindexed = report.overflows.iter().map(|o| o.agent).collect();
            self.pending_rebuild = false;
            self.structural_changes = 0;
            load_scratch(self.agents.columns(), &mut self.scratch, self.config.parallel_batch);
            info!(
                tick = self.tick.next().0,
                agents = self.agents.len(),
                indexed = report.indexed,
                active_cells = self.grid.active_cells().len(),
                "collision grid rebuilt"
            );
            return MembershipOutcome {
                rebuilt: true,
                moves: report.indexed,
                out_of_bounds: report.out_of_bounds,
                overflows: report.overflows,
            };
        }

        let batch = self.config.parallel_batch;
        let (positions, cells) = self.agents.columns_mut().tracking_view();
        let tracked = track_cells(self.grid.geometry(), positions, cells, batch);
        let move_count = tracked.moves.len();
        self.moves = tracked.moves;

        let grid = &mut self.grid;
        let moves = &mut self.moves;
        let stranded = &self.unindexed;
        let scratch = &mut self.scratch;
        let columns = self.agents.columns();
        let (overflows, ()) = rayon::join(
            || apply_moves(grid, moves, stranded, columns.cells()),
            || load_scratch(columns, scratch, batch),
        );
        self.unindexed = overflows.iter().map(|o| o.agent).collect();
        MembershipOutcome {
            rebuilt: false,
            moves: move_count,
            out_of_bounds: tracked.out_of_bounds,
            overflows,
        }
    }

    fn stage_detect(&self) -> Vec<ContactPair> {
        detect_contacts(
            &self.grid,
            self.agents.columns().positions(),
            self.params.trigger,
            self.config.parallel_batch,
        )
    }

    fn stage_resolve(&mut self, pairs: &[ContactPair]) -> ResolveOutcome {
        match self.config.resolve {
            ResolveMode::Sequential => resolve_sequential(pairs, &mut self.scratch, &self.params),
            ResolveMode::Accumulate => resolve_accumulate(
                pairs,
                &mut self.scratch,
                &self.params,
                self.config.parallel_batch,
            ),
        }
    }

    fn stage_write_back(&mut self) {
        let batch = self.config.parallel_batch;
        let (positions, velocities, masses) = self.agents.columns_mut().kinematics_mut();
        positions
            .par_iter_mut()
            .zip(velocities.par_iter_mut())
            .zip(masses.par_iter_mut())
            .zip(self.scratch.par_iter())
            .with_min_len(batch)
            .for_each(|(((position, velocity), mass), body)| {
                *position = body.position;
                *velocity = body.velocity;
                *mass = body.mass;
            });
    }

    fn stage_record(&mut self, report: &TickReport) {
        if let Some(first) = report.overflows.first() {
            warn!(
                tick = report.tick.0,
                count = report.overflows.len(),
                cell = %first.cell,
                agent = first.agent,
                "cell buckets full; agents left unindexed"
            );
        }
        if report.out_of_bounds > 0 {
            warn!(
                tick = report.tick.0,
                count = report.out_of_bounds,
                "agents outside the grid were clamped onto its border"
            );
        }
        debug!(
            tick = report.tick.0,
            agents = report.agents,
            moves = report.moves,
            contacts = report.contacts,
            resolved = report.resolved,
            "collision tick complete"
        );
        self.stats.record(report);
        if self.history.len() == self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(report.summary());
    }

    /// Returns an immutable reference to configuration.
    #[must_use]
    pub fn config(&self) -> &CollisionConfig {
        &self.config
    }

    /// Number of ticks processed so far.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Read-only access to the agent arena.
    #[must_use]
    pub fn agents(&self) -> &AgentArena {
        &self.agents
    }

    /// Mutable positions and velocities, read-only masses; the next tick picks up moves.
    pub fn agents_mut(&mut self) -> KinematicsMut<'_> {
        self.agents.kinematics_mut()
    }

    /// Number of live agents.
    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// Copy of one agent's state.
    #[must_use]
    pub fn snapshot(&self, id: AgentId) -> Option<AgentData> {
        self.agents.snapshot(id)
    }

    /// The spatial grid as of the last tick.
    #[must_use]
    pub fn grid(&self) -> &SpatialGrid {
        &self.grid
    }

    /// Agents currently missing from the grid because their bucket was full.
    #[must_use]
    pub fn unindexed(&self) -> &[u32] {
        &self.unindexed
    }

    /// Whether the next tick will rebuild the grid.
    #[must_use]
    pub const fn rebuild_pending(&self) -> bool {
        self.pending_rebuild
    }

    /// Iterate over retained tick summaries, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &TickSummary> {
        self.history.iter()
    }

    /// Cumulative pipeline counters.
    #[must_use]
    pub const fn stats(&self) -> &PipelineStats {
        &self.stats
    }
}

fn load_scratch(columns: &AgentColumns, scratch: &mut Vec<Body>, batch: usize) {
    columns
        .positions()
        .par_iter()
        .zip(columns.velocities().par_iter())
        .zip(columns.masses().par_iter())
        .with_min_len(batch)
        .map(|((&position, &velocity), &mass)| Body {
            position,
            velocity,
            mass,
        })
        .collect_into_vec(scratch);
}
