use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Instant;
use swarmgrid_app::{Scenario, ScenarioSettings};
use swarmgrid_core::{BroadPhase, CollisionConfig, ResolveMode};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "swarmgrid-app",
    version,
    about = "Run the SwarmGrid collision pipeline over marching formations"
)]
struct Cli {
    /// Number of units to spawn.
    #[arg(long, env = "SWARMGRID_AGENTS", default_value_t = 2_000)]
    agents: usize,

    /// Frames to simulate.
    #[arg(long, default_value_t = 600)]
    ticks: u64,

    /// Seed for formation targets.
    #[arg(long, env = "SWARMGRID_SEED", default_value_t = 0x5EED)]
    seed: u64,

    /// JSON collision config; omitted fields keep their defaults.
    #[arg(long, env = "SWARMGRID_CONFIG")]
    config: Option<PathBuf>,

    /// Override the neighbour-gathering scheme.
    #[arg(long, value_enum)]
    broad_phase: Option<BroadPhaseArg>,

    /// Override how contact pairs are applied.
    #[arg(long, value_enum)]
    resolve: Option<ResolveArg>,

    /// Frame delta in seconds.
    #[arg(long, default_value_t = 1.0 / 60.0)]
    dt: f32,

    /// Log a tick summary every N frames; 0 logs only the final aggregate.
    #[arg(long, default_value_t = 60)]
    report_every: u64,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BroadPhaseArg {
    Quadrant,
    Aabb,
    HalfShell,
}

impl From<BroadPhaseArg> for BroadPhase {
    fn from(value: BroadPhaseArg) -> Self {
        match value {
            BroadPhaseArg::Quadrant => BroadPhase::Quadrant4,
            BroadPhaseArg::Aabb => BroadPhase::AabbCorners,
            BroadPhaseArg::HalfShell => BroadPhase::ActiveCellHalfShell,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ResolveArg {
    Sequential,
    Accumulate,
}

impl From<ResolveArg> for ResolveMode {
    fn from(value: ResolveArg) -> Self {
        match value {
            ResolveArg::Sequential => ResolveMode::Sequential,
            ResolveArg::Accumulate => ResolveMode::Accumulate,
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let settings = ScenarioSettings {
        agents: cli.agents,
        seed: cli.seed,
        ..ScenarioSettings::default()
    };

    info!(
        agents = settings.agents,
        ticks = cli.ticks,
        broad_phase = ?config.broad_phase,
        resolve = ?config.resolve,
        "starting swarmgrid demo"
    );
    let mut scenario = Scenario::new(config, settings).context("failed to build scenario")?;

    let started = Instant::now();
    for frame in 1..=cli.ticks {
        let report = scenario.frame(cli.dt);
        if cli.report_every > 0 && frame.is_multiple_of(cli.report_every) {
            info!(
                tick = report.tick.0,
                agents = report.agents,
                moves = report.moves,
                contacts = report.contacts,
                resolved = report.resolved,
                overflows = report.overflows.len(),
                "tick summary"
            );
        }
    }

    let elapsed = started.elapsed();
    let stats = scenario.world().stats();
    info!(
        ticks = stats.ticks,
        elapsed_ms = elapsed.as_millis() as u64,
        stats = %serde_json::to_string(stats).context("failed to encode stats")?,
        "demo finished"
    );
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn load_config(cli: &Cli) -> Result<CollisionConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse config {}", path.display()))?
        }
        None => CollisionConfig::default(),
    };
    if let Some(broad_phase) = cli.broad_phase {
        config.broad_phase = broad_phase.into();
    }
    if let Some(resolve) = cli.resolve {
        config.resolve = resolve.into();
    }
    Ok(config)
}
