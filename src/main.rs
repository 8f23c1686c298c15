use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use dioguard::sim::{self, DEFAULT_RADIO_RANGE, ScenarioConfig};
use dioguard::{
    DEFAULT_HISTORY_CAPACITY, DEFAULT_SAME_SOURCE_SUSPICION_PROBABILITY,
    DEFAULT_SUSPICION_THRESHOLD, DrmConfig,
};

#[derive(Parser, Debug)]
#[command(name = "dioguard")]
#[command(
    author,
    version,
    about = "DIO replay attack scenario with per-receiver mitigation",
    long_about = None
)]
struct Args {
    /// Number of nodes (root is node 0, attacker is the last node).
    #[arg(long, default_value_t = 20)]
    n_nodes: usize,

    /// Grid spacing in metres.
    #[arg(long, default_value_t = 20.0)]
    spacing: f64,

    /// Nodes per grid row.
    #[arg(long, default_value_t = 5)]
    grid_width: usize,

    /// Broadcast reach in metres.
    #[arg(long, default_value_t = DEFAULT_RADIO_RANGE)]
    radio_range: f64,

    /// Simulated run length in seconds.
    #[arg(long, default_value_t = 60.0)]
    sim_time: f64,

    /// Send a fixed DIO payload instead of random ones.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    deterministic_root: bool,

    /// Seconds between root DIOs.
    #[arg(long, default_value_t = 5.0)]
    root_interval: f64,

    /// Replay with a small random change.
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set)]
    randomize_attacker: bool,

    /// Disable detection on every receiver (baseline run).
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    disable_root_protection: bool,

    /// Replays per second.
    #[arg(long, default_value_t = 5.0)]
    attacker_rate: f64,

    /// Delay in seconds from attacker start-up (at 0.5s) to its first replay.
    #[arg(long, default_value_t = 12.0)]
    attack_start: f64,

    #[arg(long, default_value_t = DEFAULT_HISTORY_CAPACITY)]
    history_capacity: usize,

    #[arg(long, default_value_t = DEFAULT_SUSPICION_THRESHOLD)]
    suspicion_threshold: u32,

    /// Chance that a same-source duplicate counts as suspicious.
    #[arg(long, default_value_t = DEFAULT_SAME_SOURCE_SUSPICION_PROBABILITY)]
    suspicion_probability: f64,

    /// Replay window and blacklist duration in seconds.
    #[arg(long, default_value_t = 60.0)]
    replay_window: f64,

    /// Seed for a reproducible run.
    #[arg(long)]
    seed: Option<u64>,

    /// Print the summary as JSON.
    #[arg(long)]
    json: bool,
}

fn seconds(name: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .with_context(|| format!("--{name} must be a non-negative number of seconds"))
}

impl Args {
    fn scenario(&self) -> Result<ScenarioConfig> {
        Ok(ScenarioConfig {
            n_nodes: self.n_nodes,
            spacing: self.spacing,
            grid_width: self.grid_width,
            radio_range: self.radio_range,
            sim_time: seconds("sim-time", self.sim_time)?,
            deterministic_root: self.deterministic_root,
            root_interval: seconds("root-interval", self.root_interval)?,
            randomize_attacker: self.randomize_attacker,
            attacker_rate: self.attacker_rate,
            attack_start: seconds("attack-start", self.attack_start)?,
            seed: self.seed,
            drm: DrmConfig {
                bypass_detection: self.disable_root_protection,
                history_capacity: self.history_capacity,
                suspicion_threshold: self.suspicion_threshold,
                same_source_suspicion_probability: self.suspicion_probability,
                replay_window: seconds("replay-window", self.replay_window)?,
            },
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let config = args.scenario()?;
    info!(
        protection = !config.drm.bypass_detection,
        deterministic_root = config.deterministic_root,
        randomize_attacker = config.randomize_attacker,
        "configured scenario"
    );

    let report = sim::run(config).await.context("scenario failed")?;

    if args.json {
        println!("{}", report.summary.to_json()?);
    } else {
        println!();
        println!("{}", report.summary);
    }

    Ok(())
}
