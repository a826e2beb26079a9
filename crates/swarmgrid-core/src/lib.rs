//! Collision pipeline for dense crowds of equal-radius agents on a bounded plane.
//!
//! Each [`CollisionWorld::step`] runs the same stages in order:
//!
//! 1. membership tracking: recompute every agent's grid cell and record changes;
//! 2. grid update: apply the recorded moves to the bucketed grid (concurrently
//!    with loading the resolver's scratch copy);
//! 3. contact detection: gather bounded candidate sets and test distances;
//! 4. resolution: push overlapping pairs apart and exchange impulses;
//! 5. write-back: copy the scratch state into the agent columns.

pub mod agents;
pub mod config;
pub mod membership;
pub mod narrowphase;
pub mod updater;
pub mod world;

use serde::{Deserialize, Serialize};
use swarmgrid_index::IndexError;
use thiserror::Error;

pub use agents::{
    AgentArena, AgentColumns, AgentData, AgentId, AgentMap, KinematicsMut, Position, Velocity,
};
pub use config::{
    CollisionConfig, ContactThreshold, ImpulseModel, MAX_GRID_SLOTS, MAX_HISTORY_CAPACITY,
    ResolveMode,
};
pub use narrowphase::ContactPair;
pub use swarmgrid_index::{BroadPhase, BucketOverflow, CellId, GridGeometry, SpatialGrid};
pub use world::{CollisionWorld, PipelineStats, TickInput, TickReport, TickSummary};

/// Collision clock (ticks processed since construction).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the next sequential tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// Errors raised by the collision world.
#[derive(Debug, Error)]
pub enum CollisionError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// The spatial index rejected its parameters.
    #[error(transparent)]
    Index(#[from] IndexError),
    /// Spawning would exceed the configured agent limit.
    #[error("agent limit of {0} reached")]
    CapacityExceeded(usize),
    /// The agent's scalar fields cannot be simulated.
    #[error("invalid agent: {0}")]
    InvalidAgent(&'static str),
}
