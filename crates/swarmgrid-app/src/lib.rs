//! Headless demo scenario: formations of units marching toward random targets
//! while the collision pipeline keeps them apart.

use anyhow::{Result, bail};
use rand::{Rng, SeedableRng, rngs::SmallRng};
use swarmgrid_core::{
    AgentData, AgentId, AgentMap, CollisionConfig, CollisionWorld, Position, TickInput, TickReport,
    Velocity,
};
use tracing::info;

/// Units per formation row.
pub const FORMATION_COLUMNS: usize = 8;
/// Rows per formation.
pub const FORMATION_ROWS: usize = 25;
/// Gap between neighbouring units in a formation.
pub const UNIT_SPACING: f32 = 0.75;
/// Empty space between formations.
const FORMATION_GAP: f32 = 2.0;

/// Knobs for the demo steering and layout.
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioSettings {
    /// Number of units to spawn.
    pub agents: usize,
    /// Seed for formation targets.
    pub seed: u64,
    /// Top speed in world units per second.
    pub max_speed: f32,
    /// Fraction of the desired velocity change applied per second.
    pub acceleration: f32,
    /// Linear velocity damping per second.
    pub drag: f32,
    /// Distance at which a unit picks a new target.
    pub arrive_radius: f32,
    /// Keep-out band along the world border for spawns and targets.
    pub margin: f32,
}

impl Default for ScenarioSettings {
    fn default() -> Self {
        Self {
            agents: 2_000,
            seed: 0x5EED,
            max_speed: 3.0,
            acceleration: 4.0,
            drag: 0.5,
            arrive_radius: 1.0,
            margin: 4.0,
        }
    }
}

/// Top-left corners of the formations needed for `agents` units.
pub fn formation_origins(agents: usize, extent: f32, margin: f32) -> Result<Vec<(f32, f32)>> {
    let per_formation = FORMATION_COLUMNS * FORMATION_ROWS;
    let formations = agents.div_ceil(per_formation);
    let width = FORMATION_COLUMNS as f32 * UNIT_SPACING + FORMATION_GAP;
    let depth = FORMATION_ROWS as f32 * UNIT_SPACING + FORMATION_GAP;
    let usable = extent - 2.0 * margin;
    let per_row = (usable / width).floor() as usize;
    let rows = (usable / depth).floor() as usize;
    if per_row == 0 || formations > per_row * rows {
        bail!(
            "{agents} agents need {formations} formations but a {extent} unit world fits {}",
            per_row * rows
        );
    }
    Ok((0..formations)
        .map(|i| {
            let col = (i % per_row) as f32;
            let row = (i / per_row) as f32;
            (margin + col * width, margin + row * depth)
        })
        .collect())
}

/// A collision world plus the toy steering that drives it.
#[derive(Debug)]
pub struct Scenario {
    world: CollisionWorld,
    settings: ScenarioSettings,
    targets: AgentMap<(f32, f32)>,
    rng: SmallRng,
    extent: f32,
}

impl Scenario {
    /// Build the world and spawn every formation.
    pub fn new(config: CollisionConfig, settings: ScenarioSettings) -> Result<Self> {
        let world = CollisionWorld::new(config)?;
        let extent = world.grid().geometry().extent();
        let rng = SmallRng::seed_from_u64(settings.seed);
        let mut scenario = Self {
            world,
            settings,
            targets: AgentMap::new(),
            rng,
            extent,
        };
        scenario.spawn_formations()?;
        Ok(scenario)
    }

    fn spawn_formations(&mut self) -> Result<()> {
        let origins = formation_origins(self.settings.agents, self.extent, self.settings.margin)?;
        let mut remaining = self.settings.agents;
        for &(ox, oz) in &origins {
            let target = self.random_point();
            for row in 0..FORMATION_ROWS {
                for col in 0..FORMATION_COLUMNS {
                    if remaining == 0 {
                        break;
                    }
                    let position = Position::flat(
                        ox + col as f32 * UNIT_SPACING,
                        oz + row as f32 * UNIT_SPACING,
                    );
                    let id = self
                        .world
                        .spawn(AgentData::new(position, Velocity::default()))?;
                    self.targets.insert(id, target);
                    remaining -= 1;
                }
            }
        }
        info!(
            agents = self.world.agent_count(),
            formations = origins.len(),
            extent = self.extent,
            "formations spawned"
        );
        Ok(())
    }

    fn random_point(&mut self) -> (f32, f32) {
        let low = self.settings.margin;
        let high = (self.extent - self.settings.margin).max(low + f32::EPSILON);
        (
            self.rng.gen_range(low..high),
            self.rng.gen_range(low..high),
        )
    }

    /// Steer every unit toward its target, integrate, then run the collision tick.
    pub fn frame(&mut self, dt: f32) -> TickReport {
        let arrived = self.steer(dt);
        for id in arrived {
            let target = self.random_point();
            self.targets.insert(id, target);
        }
        self.world.step(TickInput::new(dt))
    }

    fn steer(&mut self, dt: f32) -> Vec<AgentId> {
        let settings = &self.settings;
        let blend = (settings.acceleration * dt).clamp(0.0, 1.0);
        let damping = (1.0 - settings.drag * dt).max(0.0);
        let mut view = self.world.agents_mut();
        let mut arrived = Vec::new();
        for (slot, &id) in view.handles.iter().enumerate() {
            let Some(&(tx, tz)) = self.targets.get(id) else {
                continue;
            };
            let position = &mut view.positions[slot];
            let velocity = &mut view.velocities[slot];
            let (dx, dz) = (tx - position.x, tz - position.z);
            let distance = (dx * dx + dz * dz).sqrt();
            if distance < settings.arrive_radius {
                arrived.push(id);
            }
            let (desired_x, desired_z) = if distance > f32::EPSILON {
                (
                    dx / distance * settings.max_speed,
                    dz / distance * settings.max_speed,
                )
            } else {
                (0.0, 0.0)
            };
            velocity.x = (velocity.x + (desired_x - velocity.x) * blend) * damping;
            velocity.z = (velocity.z + (desired_z - velocity.z) * blend) * damping;
            position.x += velocity.x * dt;
            position.z += velocity.z * dt;
        }
        arrived
    }

    #[must_use]
    pub fn world(&self) -> &CollisionWorld {
        &self.world
    }

    #[must_use]
    pub fn settings(&self) -> &ScenarioSettings {
        &self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CollisionConfig {
        CollisionConfig {
            cells_across: 128,
            parallel_batch: 16,
            ..CollisionConfig::default()
        }
    }

    #[test]
    fn formations_cover_requested_agents() {
        let origins = formation_origins(450, 128.0, 4.0).expect("fits");
        assert_eq!(origins.len(), 3);
        assert_eq!(origins[0], (4.0, 4.0));
        assert!(origins[1].0 > origins[0].0);
        assert!(formation_origins(100_000, 64.0, 4.0).is_err());
    }

    #[test]
    fn scenario_spawns_without_initial_contacts() {
        let settings = ScenarioSettings {
            agents: 450,
            ..ScenarioSettings::default()
        };
        let mut scenario = Scenario::new(config(), settings).expect("scenario");
        assert_eq!(scenario.world().agent_count(), 450);
        let report = scenario.frame(0.0);
        assert_eq!(report.contacts, 0);
        assert!(report.overflows.is_empty());
    }

    #[test]
    fn units_move_toward_targets() {
        let settings = ScenarioSettings {
            agents: 200,
            ..ScenarioSettings::default()
        };
        let mut scenario = Scenario::new(config(), settings).expect("scenario");
        let start = scenario.world().agents().columns().positions().to_vec();
        for _ in 0..30 {
            scenario.frame(1.0 / 30.0);
        }
        let end = scenario.world().agents().columns().positions();
        let moved = start
            .iter()
            .zip(end)
            .filter(|(a, b)| a.planar_distance(b) > 0.5)
            .count();
        assert!(moved > 150, "only {moved} units moved");
        assert_eq!(scenario.world().tick().0, 30);
    }

    #[test]
    fn seeded_scenarios_match() {
        let run = || {
            let settings = ScenarioSettings {
                agents: 300,
                seed: 77,
                ..ScenarioSettings::default()
            };
            let mut scenario = Scenario::new(config(), settings).expect("scenario");
            for _ in 0..20 {
                scenario.frame(1.0 / 60.0);
            }
            scenario.world().agents().columns().positions().to_vec()
        };
        assert_eq!(run(), run());
    }
}
