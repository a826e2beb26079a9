//! Static configuration for a collision world.

use crate::CollisionError;
use serde::{Deserialize, Serialize};
use swarmgrid_index::{BroadPhase, GridGeometry};

/// Largest retained tick history.
pub const MAX_HISTORY_CAPACITY: usize = 1 << 16;
/// Largest bucket allocation (`cell_capacity` times cell count); 1 GiB of slots.
pub const MAX_GRID_SLOTS: usize = 1 << 28;

/// Which separation distance counts as contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ContactThreshold {
    /// Centres closer than one radius. Agents may visually overlap by up to a radius.
    #[default]
    Radius,
    /// Centres closer than two radii: true contact of two discs.
    Diameter,
}

/// How contact pairs are applied to the scratch buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ResolveMode {
    /// Pairs resolved one after another in sorted order against the mutated scratch.
    #[default]
    Sequential,
    /// Responses computed in parallel from the pre-resolution snapshot, then summed per agent.
    Accumulate,
}

/// Velocity response applied on contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ImpulseModel {
    /// Both agents are scaled by the partner's mass; momentum is not conserved for unequal masses.
    #[default]
    Legacy,
    /// Each agent is scaled by the other's mass so the pair's momentum is conserved.
    MomentumConserving,
    /// Positional correction only.
    None,
}

/// Static configuration for a collision world.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CollisionConfig {
    /// Edge length of one grid cell in world units.
    pub cell_size: f32,
    /// Number of cells along each axis; the world spans `cell_size * cells_across`.
    pub cells_across: u32,
    /// Agent slots per cell bucket.
    pub cell_capacity: usize,
    /// Agent radius shared by every agent.
    pub radius: f32,
    /// Distance below which two agents are considered touching.
    pub contact: ContactThreshold,
    /// Neighbour-gathering scheme.
    pub broad_phase: BroadPhase,
    /// Pair application strategy.
    pub resolve: ResolveMode,
    /// Velocity response on contact.
    pub impulse: ImpulseModel,
    /// Skip the impulse for pairs that are already moving apart. Off by default,
    /// so every overlapping pair is answered with an impulse.
    pub skip_separating: bool,
    /// Distances at or below this are treated as coincident centres.
    pub degenerate_distance: f32,
    /// Minimum number of agents handed to one worker in parallel stages.
    pub parallel_batch: usize,
    /// Destructive structural changes tolerated before the grid is rebuilt; 0 disables.
    pub rebuild_after_despawns: usize,
    /// Number of tick summaries retained in memory.
    pub history_capacity: usize,
    /// Upper bound on live agents.
    pub max_agents: usize,
}

impl Default for CollisionConfig {
    fn default() -> Self {
        Self {
            cell_size: 1.0,
            cells_across: 1024,
            cell_capacity: 6,
            radius: 0.5,
            contact: ContactThreshold::Radius,
            broad_phase: BroadPhase::Quadrant4,
            resolve: ResolveMode::Sequential,
            impulse: ImpulseModel::Legacy,
            skip_separating: false,
            degenerate_distance: 1e-4,
            parallel_batch: 80,
            rebuild_after_despawns: 1500,
            history_capacity: 256,
            max_agents: 100_000,
        }
    }
}

impl CollisionConfig {
    /// Centre distance that triggers a contact.
    #[must_use]
    pub fn contact_distance(&self) -> f32 {
        match self.contact {
            ContactThreshold::Radius => self.radius,
            ContactThreshold::Diameter => 2.0 * self.radius,
        }
    }

    /// Validates the configuration, returning the derived grid geometry.
    pub fn validate(&self) -> Result<GridGeometry, CollisionError> {
        if !self.radius.is_finite() || self.radius <= 0.0 {
            return Err(CollisionError::InvalidConfig(
                "radius must be positive and finite",
            ));
        }
        if !self.degenerate_distance.is_finite() || self.degenerate_distance <= 0.0 {
            return Err(CollisionError::InvalidConfig(
                "degenerate_distance must be positive",
            ));
        }
        if self.cell_capacity == 0 {
            return Err(CollisionError::InvalidConfig(
                "cell_capacity must be non-zero",
            ));
        }
        if self.parallel_batch == 0 || self.history_capacity == 0 {
            return Err(CollisionError::InvalidConfig(
                "parallel_batch and history_capacity must be non-zero",
            ));
        }
        if self.history_capacity > MAX_HISTORY_CAPACITY {
            return Err(CollisionError::InvalidConfig(
                "history_capacity exceeds MAX_HISTORY_CAPACITY",
            ));
        }
        if self.max_agents == 0 || self.max_agents >= u32::MAX as usize {
            return Err(CollisionError::InvalidConfig(
                "max_agents must be non-zero and fit in a bucket slot",
            ));
        }
        let geometry = GridGeometry::new(self.cell_size, self.cells_across)?;
        match geometry.cell_count().checked_mul(self.cell_capacity) {
            Some(slots) if slots <= MAX_GRID_SLOTS => {}
            _ => {
                return Err(CollisionError::InvalidConfig(
                    "cell_capacity times cell count exceeds MAX_GRID_SLOTS",
                ));
            }
        }
        if self.cell_size < 2.0 * self.contact_distance() {
            return Err(CollisionError::InvalidConfig(
                "cell_size must be at least twice the contact distance",
            ));
        }
        Ok(geometry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CollisionWorld;

    #[test]
    fn defaults_validate() {
        let config = CollisionConfig::default();
        let geometry = config.validate().expect("default config is valid");
        assert_eq!(geometry.cells_across(), 1024);
        assert_eq!(config.contact_distance(), 0.5);
    }

    #[test]
    fn rejects_undersized_cells() {
        let config = CollisionConfig {
            contact: ContactThreshold::Diameter,
            ..CollisionConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(CollisionError::InvalidConfig(_))
        ));

        let widened = CollisionConfig {
            cell_size: 2.0,
            ..config
        };
        assert!(widened.validate().is_ok());
    }

    #[test]
    fn rejects_degenerate_values() {
        let zero_capacity = CollisionConfig {
            cell_capacity: 0,
            ..CollisionConfig::default()
        };
        assert!(zero_capacity.validate().is_err());

        let negative_radius = CollisionConfig {
            radius: -1.0,
            ..CollisionConfig::default()
        };
        assert!(negative_radius.validate().is_err());

        let no_grid = CollisionConfig {
            cells_across: 0,
            ..CollisionConfig::default()
        };
        assert!(matches!(no_grid.validate(), Err(CollisionError::Index(_))));
    }

    #[test]
    fn rejects_oversized_allocations() {
        let history = CollisionConfig {
            history_capacity: usize::MAX,
            ..CollisionConfig::default()
        };
        assert!(matches!(
            history.validate(),
            Err(CollisionError::InvalidConfig(_))
        ));
        assert!(CollisionWorld::new(history).is_err());

        let buckets = CollisionConfig {
            cells_across: 60_000,
            cell_capacity: 1_000,
            ..CollisionConfig::default()
        };
        assert!(matches!(
            buckets.validate(),
            Err(CollisionError::InvalidConfig(_))
        ));

        let parsed: CollisionConfig =
            serde_json::from_str(r#"{ "history_capacity": 18446744073709551615 }"#)
                .expect("parse");
        assert!(parsed.validate().is_err());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: CollisionConfig =
            serde_json::from_str(r#"{ "cells_across": 64, "broad_phase": "AabbCorners" }"#)
                .expect("parse");
        assert_eq!(config.cells_across, 64);
        assert_eq!(config.broad_phase, BroadPhase::AabbCorners);
        assert_eq!(config.cell_capacity, 6);
        assert_eq!(config.impulse, ImpulseModel::Legacy);
    }
}
