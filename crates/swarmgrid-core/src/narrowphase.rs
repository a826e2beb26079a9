//! Contact detection and pair resolution.

use crate::agents::{Position, Velocity};
use crate::config::{CollisionConfig, ImpulseModel};
use ordered_float::OrderedFloat;
use rayon::prelude::*;
use swarmgrid_index::{NeighborhoodIndex, SpatialGrid};

/// Two agents closer than the contact distance, with `a < b`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContactPair {
    pub a: u32,
    pub b: u32,
    pub distance: OrderedFloat<f32>,
}

impl ContactPair {
    fn new(first: usize, second: usize, distance: OrderedFloat<f32>) -> Self {
        Self {
            a: first.min(second) as u32,
            b: first.max(second) as u32,
            distance,
        }
    }
}

/// Scratch copy of the fields the resolver reads and writes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Body {
    pub position: Position,
    pub velocity: Velocity,
    pub mass: f32,
}

/// Parameters shared by every pair resolution in a tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolveParams {
    /// Centre distance below which agents are pushed apart.
    pub trigger: f32,
    /// Distances at or below this use a fixed separation normal.
    pub epsilon: f32,
    pub impulse: ImpulseModel,
    pub skip_separating: bool,
}

impl ResolveParams {
    #[must_use]
    pub fn from_config(config: &CollisionConfig) -> Self {
        Self {
            trigger: config.contact_distance(),
            epsilon: config.degenerate_distance,
            impulse: config.impulse,
            skip_separating: config.skip_separating,
        }
    }
}

/// Correction for one pair: `shift` is added to `a` and subtracted from `b`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PairResponse {
    pub shift: (f32, f32),
    pub dv_a: (f32, f32),
    pub dv_b: (f32, f32),
    pub impulse_applied: bool,
}

impl PairResponse {
    fn apply(&self, bodies: &mut [Body], a: usize, b: usize) {
        let body_a = &mut bodies[a];
        body_a.position.x += self.shift.0;
        body_a.position.z += self.shift.1;
        body_a.velocity.x += self.dv_a.0;
        body_a.velocity.z += self.dv_a.1;
        let body_b = &mut bodies[b];
        body_b.position.x -= self.shift.0;
        body_b.position.z -= self.shift.1;
        body_b.velocity.x += self.dv_b.0;
        body_b.velocity.z += self.dv_b.1;
    }
}

/// Counters produced by a resolve pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveOutcome {
    /// Pairs that were still in contact and received a positional correction.
    pub resolved: usize,
    /// Pairs that also received a velocity impulse.
    pub impulses: usize,
}

/// Collect every contact pair currently in the grid, sorted and de-duplicated.
///
/// Slots at or beyond `positions.len()` are treated as stale and skipped.
pub fn detect_contacts(
    grid: &SpatialGrid,
    positions: &[Position],
    trigger: f32,
    batch: usize,
) -> Vec<ContactPair> {
    let mut pairs = if grid.broad_phase().is_per_agent() {
        per_agent_contacts(grid, positions, trigger, batch)
    } else {
        half_shell_contacts(grid, positions, trigger, batch)
    };
    pairs.par_sort_unstable();
    pairs.dedup_by_key(|pair| (pair.a, pair.b));
    pairs
}

fn per_agent_contacts<I>(
    index: &I,
    positions: &[Position],
    trigger: f32,
    batch: usize,
) -> Vec<ContactPair>
where
    I: NeighborhoodIndex + Sync,
{
    (0..positions.len())
        .into_par_iter()
        .with_min_len(batch.max(1))
        .flat_map_iter(|idx| {
            let mut local = Vec::new();
            index.neighbors_within(idx, positions, trigger, &mut |other, distance| {
                local.push(ContactPair::new(idx, other, distance));
            });
            local
        })
        .collect()
}

fn half_shell_contacts(
    grid: &SpatialGrid,
    positions: &[Position],
    trigger: f32,
    batch: usize,
) -> Vec<ContactPair> {
    let cells_per_job = (batch / grid.capacity()).max(1);
    grid.active_cells()
        .par_iter()
        .with_min_len(cells_per_job)
        .flat_map_iter(|&cell| {
            let mut local = Vec::new();
            grid.visit_half_shell(cell, positions, trigger, &mut |a, b, distance| {
                local.push(ContactPair::new(a as usize, b as usize, distance));
            });
            local
        })
        .collect()
}

/// Separation and impulse for two bodies, or `None` when they are not in contact.
#[must_use]
pub fn pair_response(a: &Body, b: &Body, params: &ResolveParams) -> Option<PairResponse> {
    let dx = a.position.x - b.position.x;
    let dz = a.position.z - b.position.z;
    let distance = (dx * dx + dz * dz).sqrt();
    if distance.is_nan() || distance >= params.trigger {
        return None;
    }
    let normal = if distance <= params.epsilon {
        (1.0, 0.0)
    } else {
        (dx / distance, dz / distance)
    };
    let push = 0.5 * (params.trigger - distance);
    let mut response = PairResponse {
        shift: (normal.0 * push, normal.1 * push),
        ..PairResponse::default()
    };

    let closing =
        (a.velocity.x - b.velocity.x) * normal.0 + (a.velocity.z - b.velocity.z) * normal.1;
    if params.skip_separating && closing >= 0.0 {
        return Some(response);
    }
    let total_mass = a.mass + b.mass;
    if total_mass <= 0.0 {
        return Some(response);
    }
    let p = 2.0 * closing / total_mass;
    let (scale_a, scale_b) = match params.impulse {
        ImpulseModel::None => return Some(response),
        ImpulseModel::Legacy => (b.mass, b.mass),
        ImpulseModel::MomentumConserving => (b.mass, a.mass),
    };
    response.dv_a = (-p * scale_a * normal.0, -p * scale_a * normal.1);
    response.dv_b = (p * scale_b * normal.0, p * scale_b * normal.1);
    response.impulse_applied = true;
    Some(response)
}

/// Resolve pairs one at a time in slice order against the mutated bodies.
///
/// Distances are recomputed per pair, so pairs separated by an earlier
/// correction are skipped.
pub fn resolve_sequential(
    pairs: &[ContactPair],
    bodies: &mut [Body],
    params: &ResolveParams,
) -> ResolveOutcome {
    let mut outcome = ResolveOutcome::default();
    for pair in pairs {
        let (a, b) = (pair.a as usize, pair.b as usize);
        if a == b || b >= bodies.len() {
            continue;
        }
        if let Some(response) = pair_response(&bodies[a], &bodies[b], params) {
            response.apply(bodies, a, b);
            outcome.resolved += 1;
            outcome.impulses += usize::from(response.impulse_applied);
        }
    }
    outcome
}

/// Compute every response from the unmodified bodies in parallel, then commit them serially.
pub fn resolve_accumulate(
    pairs: &[ContactPair],
    bodies: &mut [Body],
    params: &ResolveParams,
    batch: usize,
) -> ResolveOutcome {
    let snapshot: &[Body] = bodies;
    let responses: Vec<(usize, usize, PairResponse)> = pairs
        .par_iter()
        .with_min_len(batch.max(1))
        .filter_map(|pair| {
            let (a, b) = (pair.a as usize, pair.b as usize);
            if a == b || b >= snapshot.len() {
                return None;
            }
            pair_response(&snapshot[a], &snapshot[b], params).map(|response| (a, b, response))
        })
        .collect();

    let mut outcome = ResolveOutcome::default();
    for (a, b, response) in responses {
        response.apply(bodies, a, b);
        outcome.resolved += 1;
        outcome.impulses += usize::from(response.impulse_applied);
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarmgrid_index::{BroadPhase, CellId, GridGeometry};

    fn params() -> ResolveParams {
        ResolveParams::from_config(&CollisionConfig::default())
    }

    fn body(x: f32, z: f32, vx: f32, vz: f32, mass: f32) -> Body {
        Body {
            position: Position::new(x, 3.0, z),
            velocity: Velocity::new(vx, -2.0, vz),
            mass,
        }
    }

    fn pair(a: u32, b: u32) -> ContactPair {
        ContactPair {
            a,
            b,
            distance: OrderedFloat(0.0),
        }
    }

    #[test]
    fn equal_masses_separate_and_swap_velocities() {
        let mut bodies = vec![body(0.0, 0.0, 1.0, 0.0, 1.0), body(0.4, 0.0, -1.0, 0.0, 1.0)];
        let outcome = resolve_sequential(&[pair(0, 1)], &mut bodies, &params());
        assert_eq!(outcome.resolved, 1);
        assert_eq!(outcome.impulses, 1);

        let distance = bodies[0].position.planar_distance(&bodies[1].position);
        assert!(distance >= 0.5 - 1e-5, "distance {distance}");
        assert!((bodies[0].velocity.x + 1.0).abs() < 1e-5);
        assert!((bodies[1].velocity.x - 1.0).abs() < 1e-5);
        assert_eq!(bodies[0].position.y, 3.0);
        assert_eq!(bodies[1].velocity.y, -2.0);
    }

    #[test]
    fn isolated_pair_reaches_trigger_distance() {
        let mut bodies = vec![body(5.0, 5.0, 0.0, 0.0, 1.0), body(5.1, 5.2, 0.0, 0.0, 1.0)];
        let params = ResolveParams {
            trigger: 1.0,
            ..params()
        };
        resolve_sequential(&[pair(0, 1)], &mut bodies, &params);
        let distance = bodies[0].position.planar_distance(&bodies[1].position);
        assert!((distance - 1.0).abs() < 1e-5, "distance {distance}");
    }

    #[test]
    fn coincident_centres_still_separate() {
        let mut bodies = vec![body(2.0, 2.0, 0.0, 0.0, 1.0), body(2.0, 2.0, 0.0, 0.0, 1.0)];
        resolve_sequential(&[pair(0, 1)], &mut bodies, &params());
        assert!(bodies.iter().all(|b| b.position.x.is_finite() && b.position.z.is_finite()));
        let distance = bodies[0].position.planar_distance(&bodies[1].position);
        assert!((distance - 0.5).abs() < 1e-5);
        assert!(bodies[0].position.x > bodies[1].position.x);
    }

    #[test]
    fn separating_pairs_keep_their_velocities() {
        let mut bodies = vec![body(0.0, 0.0, -1.0, 0.0, 1.0), body(0.3, 0.0, 1.0, 0.0, 1.0)];
        let params = ResolveParams {
            skip_separating: true,
            ..params()
        };
        let outcome = resolve_sequential(&[pair(0, 1)], &mut bodies, &params);
        assert_eq!(outcome.resolved, 1);
        assert_eq!(outcome.impulses, 0);
        assert_eq!(bodies[0].velocity.x, -1.0);
        assert_eq!(bodies[1].velocity.x, 1.0);
    }

    #[test]
    fn separating_pairs_are_turned_around_by_default() {
        let mut bodies = vec![body(5.0, 0.0, -1.0, 0.0, 1.0), body(5.3, 0.0, 1.0, 0.0, 1.0)];
        let outcome = resolve_sequential(&[pair(0, 1)], &mut bodies, &params());
        assert_eq!(outcome.impulses, 1);
        // normal = (-1, 0), closing = 2, p = 2; both sides scaled by m_b = 1.
        assert!((bodies[0].velocity.x - 1.0).abs() < 1e-5);
        assert!((bodies[1].velocity.x + 1.0).abs() < 1e-5);
    }

    #[test]
    fn legacy_and_momentum_models_differ_for_unequal_masses() {
        let a = body(0.0, 0.0, 1.0, 0.0, 1.0);
        let b = body(0.4, 0.0, 0.0, 0.0, 3.0);

        let legacy = pair_response(&a, &b, &params()).expect("contact");
        // p = 2 * (-1) / 4 = -0.5, normal = (-1, 0); both sides scaled by m_b = 3.
        assert!((legacy.dv_a.0 + 1.5).abs() < 1e-6);
        assert!((legacy.dv_b.0 - 1.5).abs() < 1e-6);

        let conserving = ResolveParams {
            impulse: ImpulseModel::MomentumConserving,
            ..params()
        };
        let response = pair_response(&a, &b, &conserving).expect("contact");
        let momentum_change = a.mass * response.dv_a.0 + b.mass * response.dv_b.0;
        assert!(momentum_change.abs() < 1e-6);
        assert!((response.dv_a.0 + 1.5).abs() < 1e-6);
        assert!((response.dv_b.0 - 0.5).abs() < 1e-6);

        let positional = ResolveParams {
            impulse: ImpulseModel::None,
            ..params()
        };
        let response = pair_response(&a, &b, &positional).expect("contact");
        assert_eq!(response.dv_a, (0.0, 0.0));
        assert!(!response.impulse_applied);
    }

    #[test]
    fn pairs_out_of_contact_are_skipped() {
        let a = body(0.0, 0.0, 0.0, 0.0, 1.0);
        let b = body(0.5, 0.0, 0.0, 0.0, 1.0);
        assert!(pair_response(&a, &b, &params()).is_none());

        let mut bodies = vec![a, b];
        let outcome = resolve_sequential(&[pair(0, 1), pair(0, 7)], &mut bodies, &params());
        assert_eq!(outcome.resolved, 0);
    }

    #[test]
    fn accumulate_matches_sequential_for_disjoint_pairs() {
        let bodies = vec![
            body(1.0, 1.0, 0.5, 0.0, 1.0),
            body(1.3, 1.0, -0.5, 0.0, 1.0),
            body(4.0, 4.0, 0.0, 0.2, 2.0),
            body(4.0, 4.2, 0.0, -0.2, 1.0),
        ];
        let pairs = [pair(0, 1), pair(2, 3)];
        let mut sequential = bodies.clone();
        let mut accumulated = bodies;
        let a = resolve_sequential(&pairs, &mut sequential, &params());
        let b = resolve_accumulate(&pairs, &mut accumulated, &params(), 1);
        assert_eq!(a, b);
        assert_eq!(sequential, accumulated);
    }

    #[test]
    fn accumulate_sums_every_response_for_shared_agents() {
        let bodies = vec![
            body(2.0, 1.0, 1.0, 0.0, 1.0),
            body(2.3, 1.1, 0.0, 0.5, 2.0),
            body(2.6, 1.0, -1.0, 0.0, 1.0),
        ];
        let first = pair_response(&bodies[0], &bodies[1], &params()).expect("contact");
        let second = pair_response(&bodies[1], &bodies[2], &params()).expect("contact");
        assert!(pair_response(&bodies[0], &bodies[2], &params()).is_none());

        let mut accumulated = bodies.clone();
        let pairs = [pair(0, 1), pair(0, 2), pair(1, 2)];
        let outcome = resolve_accumulate(&pairs, &mut accumulated, &params(), 1);
        assert_eq!(outcome.resolved, 2);

        let middle = &accumulated[1];
        let expected_x = bodies[1].position.x - first.shift.0 + second.shift.0;
        let expected_z = bodies[1].position.z - first.shift.1 + second.shift.1;
        let expected_vx = bodies[1].velocity.x + first.dv_b.0 + second.dv_a.0;
        let expected_vz = bodies[1].velocity.z + first.dv_b.1 + second.dv_a.1;
        assert!((middle.position.x - expected_x).abs() < 1e-6);
        assert!((middle.position.z - expected_z).abs() < 1e-6);
        assert!((middle.velocity.x - expected_vx).abs() < 1e-6);
        assert!((middle.velocity.z - expected_vz).abs() < 1e-6);
        assert!((accumulated[0].position.x - (bodies[0].position.x + first.shift.0)).abs() < 1e-6);
        assert!((accumulated[2].velocity.x - (bodies[2].velocity.x + second.dv_b.0)).abs() < 1e-6);
    }

    #[test]
    fn detection_normalises_and_deduplicates() {
        let geometry = GridGeometry::new(1.0, 16).expect("geometry");
        for broad_phase in [
            BroadPhase::Quadrant4,
            BroadPhase::AabbCorners,
            BroadPhase::ActiveCellHalfShell,
        ] {
            let mut grid = SpatialGrid::new(geometry, 6, broad_phase).expect("grid");
            let positions = vec![
                Position::flat(3.9, 3.5),
                Position::flat(4.1, 3.5),
                Position::flat(8.0, 8.0),
                Position::flat(4.0, 3.8),
            ];
            let mut cells = vec![CellId::UNASSIGNED; positions.len()];
            grid.rebuild(&positions, &mut cells);

            let pairs = detect_contacts(&grid, &positions, 0.5, 1);
            let ids: Vec<(u32, u32)> = pairs.iter().map(|p| (p.a, p.b)).collect();
            assert_eq!(ids, vec![(0, 1), (0, 3), (1, 3)], "{broad_phase:?}");
        }
    }

    #[test]
    fn detection_skips_stale_slots() {
        let geometry = GridGeometry::new(1.0, 8).expect("geometry");
        let mut grid = SpatialGrid::new(geometry, 6, BroadPhase::Quadrant4).expect("grid");
        let positions = vec![Position::flat(2.5, 2.5), Position::flat(2.6, 2.5)];
        let cell = geometry.cell_of(2.5, 2.5);
        for slot in [0, 1, 5] {
            grid.insert(cell, slot).expect("insert");
        }
        let pairs = detect_contacts(&grid, &positions, 0.5, 1);
        assert_eq!(pairs.len(), 1);
        assert_eq!((pairs[0].a, pairs[0].b), (0, 1));
    }
}
