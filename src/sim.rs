//! # Replay Attack Scenario
//!
//! Plays the collaborators the detection engine never implements itself: a
//! root that periodically broadcasts a DIO, an attacker that captures and
//! replays it, and a broadcast medium that hands each transmission to every
//! receiver in radio range.
//!
//! Time is simulated. Events run in timestamp order (ties in scheduling
//! order) and a broadcast is fully classified by every in-range receiver
//! before the next event runs. Receivers are [`ReceiverHandle`] actors, so the
//! receivers of one broadcast classify it concurrently.
//!
//! ## Layout
//!
//! Nodes sit on a row-first grid. Node `0` is the root, node `n - 1` the
//! attacker, node `i` is addressed `10.1.1.(i + 1)`. Every node, root and
//! attacker included, runs its own independently seeded engine.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info, trace};

use crate::drm::{Decision, DrmConfig, DrmCounters, DrmEngine};
use crate::fingerprint::fingerprint;
use crate::receiver::ReceiverHandle;
use crate::summary::{AttackProfile, RunSummary};

/// Payload the root broadcasts in deterministic mode.
pub const DETERMINISTIC_DIO: [u8; 8] = [0xAA, 0xBB, 0xCC, 0xDD, 0x11, 0x22, 0x33, 0x44];

/// Length of a randomly generated DIO.
pub const DIO_LEN: usize = 8;

/// Time of the root's first DIO.
pub const ROOT_START: Duration = Duration::from_secs(1);

pub const DEFAULT_ROOT_INTERVAL: Duration = Duration::from_secs(5);

/// Time the attacker comes up; its first replay is `attack_start` after this.
pub const ATTACKER_START: Duration = Duration::from_millis(500);

/// Delay before an attacker with nothing captured tries again.
pub const ATTACKER_RETRY: Duration = Duration::from_millis(500);

/// Air time between a broadcast and its reception.
pub const DELIVERY_DELAY: Duration = Duration::from_millis(2);

/// Disc radius within which a broadcast is heard, in metres.
pub const DEFAULT_RADIO_RANGE: f64 = 250.0;

/// Node addresses are `10.1.1.(i + 1)`.
pub const MAX_NODES: usize = 254;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Debug)]
pub struct ScenarioConfig {
    pub n_nodes: usize,
    /// Grid spacing in metres.
    pub spacing: f64,
    /// Nodes per grid row.
    pub grid_width: usize,
    pub radio_range: f64,
    pub sim_time: Duration,
    /// Broadcast [`DETERMINISTIC_DIO`] instead of random payloads.
    pub deterministic_root: bool,
    pub root_interval: Duration,
    /// XOR one byte of each replay with a small random value.
    pub randomize_attacker: bool,
    /// Replays per second.
    pub attacker_rate: f64,
    /// Delay from attacker start-up to its first replay.
    pub attack_start: Duration,
    /// Master seed. `None` seeds from OS entropy.
    pub seed: Option<u64>,
    pub drm: DrmConfig,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            n_nodes: 20,
            spacing: 20.0,
            grid_width: 5,
            radio_range: DEFAULT_RADIO_RANGE,
            sim_time: Duration::from_secs(60),
            deterministic_root: true,
            root_interval: DEFAULT_ROOT_INTERVAL,
            randomize_attacker: false,
            attacker_rate: 5.0,
            attack_start: Duration::from_secs(12),
            seed: None,
            drm: DrmConfig {
                bypass_detection: true,
                ..DrmConfig::default()
            },
        }
    }
}

impl ScenarioConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            (2..=MAX_NODES).contains(&self.n_nodes),
            "n_nodes must be between 2 and {MAX_NODES}, got {}",
            self.n_nodes
        );
        ensure!(self.grid_width > 0, "grid_width must be at least 1");
        ensure!(
            self.spacing.is_finite() && self.spacing >= 0.0,
            "spacing must be a non-negative distance, got {}",
            self.spacing
        );
        ensure!(
            self.radio_range >= 0.0,
            "radio_range must be non-negative, got {}",
            self.radio_range
        );
        ensure!(
            self.attacker_rate.is_finite() && self.attacker_rate > 0.0,
            "attacker_rate must be positive, got {}",
            self.attacker_rate
        );
        self.replay_interval()?;
        ensure!(!self.root_interval.is_zero(), "root_interval must be non-zero");
        self.drm.validate().context("invalid detection settings")?;
        Ok(())
    }

    /// Spacing between replays, `1 / attacker_rate` seconds.
    pub fn replay_interval(&self) -> Result<Duration> {
        let interval = Duration::try_from_secs_f64(1.0 / self.attacker_rate).with_context(|| {
            format!("attacker_rate {} gives no usable interval", self.attacker_rate)
        })?;
        ensure!(
            !interval.is_zero(),
            "attacker_rate {} is too high to schedule",
            self.attacker_rate
        );
        Ok(interval)
    }
}

// ============================================================================
// Topology
// ============================================================================

#[derive(Clone, Debug)]
pub struct Topology {
    positions: Vec<(f64, f64)>,
    range: f64,
}

impl Topology {
    /// Row-first grid starting at the origin.
    pub fn grid(n_nodes: usize, grid_width: usize, spacing: f64, range: f64) -> Self {
        let width = grid_width.max(1);
        let positions = (0..n_nodes)
            .map(|i| ((i % width) as f64 * spacing, (i / width) as f64 * spacing))
            .collect();
        Self { positions, range }
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn position(&self, node: usize) -> Option<(f64, f64)> {
        self.positions.get(node).copied()
    }

    pub fn distance(&self, a: usize, b: usize) -> f64 {
        let (ax, ay) = self.positions[a];
        let (bx, by) = self.positions[b];
        (ax - bx).hypot(ay - by)
    }

    /// True if `b` hears broadcasts from `a`. A node never hears itself.
    pub fn in_range(&self, a: usize, b: usize) -> bool {
        a != b && self.distance(a, b) <= self.range
    }

    pub fn hearers(&self, from: usize) -> impl Iterator<Item = usize> + '_ {
        (0..self.positions.len()).filter(move |&b| self.in_range(from, b))
    }
}

pub fn node_addr(node: usize) -> Ipv4Addr {
    Ipv4Addr::new(10, 1, 1, (node + 1) as u8)
}

// ============================================================================
// Event Queue
// ============================================================================

#[derive(Debug)]
enum Event {
    RootSend,
    AttackerReplay,
    Deliver { from: usize, payload: Vec<u8> },
}

#[derive(Debug)]
struct Scheduled {
    at: Duration,
    seq: u64,
    event: Event,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // Reversed so the BinaryHeap pops the earliest event first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.at.cmp(&self.at).then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct EventQueue {
    heap: BinaryHeap<Scheduled>,
    next_seq: u64,
}

impl EventQueue {
    fn schedule(&mut self, at: Duration, event: Event) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Scheduled { at, seq, event });
    }

    fn pop(&mut self) -> Option<Scheduled> {
        self.heap.pop()
    }
}

// ============================================================================
// Report
// ============================================================================

/// Network-wide count of each decision.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DecisionTally {
    pub accepted: u64,
    pub dropped_blacklisted: u64,
    pub dropped_cross_replay: u64,
    pub dropped_same_source_replay: u64,
}

impl DecisionTally {
    fn record(&mut self, decision: Decision) {
        match decision {
            Decision::Accepted => self.accepted += 1,
            Decision::DroppedBlacklisted => self.dropped_blacklisted += 1,
            Decision::DroppedCrossReplay => self.dropped_cross_replay += 1,
            Decision::DroppedSameSourceReplay => self.dropped_same_source_replay += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.accepted
            + self.dropped_blacklisted
            + self.dropped_cross_replay
            + self.dropped_same_source_replay
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ScenarioReport {
    pub summary: RunSummary,
    pub decisions: DecisionTally,
    pub root_sends: u64,
    pub replays_sent: u64,
    /// Counters per node, indexed by node number.
    pub per_node: Vec<DrmCounters>,
}

// ============================================================================
// Driver
// ============================================================================

struct Scenario {
    config: ScenarioConfig,
    topology: Topology,
    receivers: Vec<ReceiverHandle<Ipv4Addr>>,
    rng: ChaCha8Rng,
    queue: EventQueue,
    captured: Option<Vec<u8>>,
    replay_interval: Duration,
    decisions: DecisionTally,
    root_sends: u64,
    replays_sent: u64,
}

/// Run one scenario to completion and collect its report.
pub async fn run(config: ScenarioConfig) -> Result<ScenarioReport> {
    config.validate()?;
    let mut scenario = Scenario::new(config)?;
    let outcome = scenario.run().await;
    scenario.shutdown().await;
    outcome
}

impl Scenario {
    const ROOT: usize = 0;

    fn new(config: ScenarioConfig) -> Result<Self> {
        let mut rng = match config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        let replay_interval = config.replay_interval()?;
        let topology = Topology::grid(
            config.n_nodes,
            config.grid_width,
            config.spacing,
            config.radio_range,
        );

        let mut receivers = Vec::with_capacity(config.n_nodes);
        for node in 0..config.n_nodes {
            let engine = DrmEngine::seeded(config.drm.clone(), rng.next_u64())
                .context("failed to build detection engine")?;
            receivers.push(ReceiverHandle::spawn(engine, node_addr(node).to_string()));
        }

        Ok(Self {
            config,
            topology,
            receivers,
            rng,
            queue: EventQueue::default(),
            captured: None,
            replay_interval,
            decisions: DecisionTally::default(),
            root_sends: 0,
            replays_sent: 0,
        })
    }

    fn attacker(&self) -> usize {
        self.config.n_nodes - 1
    }

    async fn run(&mut self) -> Result<ScenarioReport> {
        info!(
            nodes = self.config.n_nodes,
            sim_secs = self.config.sim_time.as_secs_f64(),
            protection = !self.config.drm.bypass_detection,
            "starting replay scenario"
        );

        self.queue.schedule(ROOT_START, Event::RootSend);
        self.queue.schedule(
            ATTACKER_START.saturating_add(self.config.attack_start),
            Event::AttackerReplay,
        );

        while let Some(Scheduled { at, event, .. }) = self.queue.pop() {
            if at >= self.config.sim_time {
                break;
            }
            match event {
                Event::RootSend => self.root_send(at),
                Event::AttackerReplay => self.attacker_replay(at),
                Event::Deliver { from, payload } => self.deliver(from, payload, at).await?,
            }
        }

        let mut per_node = Vec::with_capacity(self.receivers.len());
        for receiver in &self.receivers {
            per_node.push(receiver.counters().await?);
        }

        let summary = RunSummary::aggregate(self.root_sends, &per_node).with_attack(AttackProfile {
            rate: self.config.attacker_rate,
            start_secs: self.config.attack_start.as_secs_f64(),
        });
        info!(
            root_sends = self.root_sends,
            replays = self.replays_sent,
            blacklists = summary.blacklist_events,
            "scenario complete"
        );

        Ok(ScenarioReport {
            summary,
            decisions: self.decisions,
            root_sends: self.root_sends,
            replays_sent: self.replays_sent,
            per_node,
        })
    }

    fn root_send(&mut self, now: Duration) {
        let payload = if self.config.deterministic_root {
            DETERMINISTIC_DIO.to_vec()
        } else {
            let mut payload = vec![0u8; DIO_LEN];
            self.rng.fill_bytes(&mut payload);
            payload
        };
        self.root_sends += 1;
        debug!(
            fingerprint = %fingerprint(&payload),
            t = now.as_secs_f64(),
            "root sent DIO"
        );
        self.broadcast(Self::ROOT, payload, now);
        self.queue.schedule(now.saturating_add(self.config.root_interval), Event::RootSend);
    }

    fn attacker_replay(&mut self, now: Duration) {
        let Some(mut payload) = self.captured.clone() else {
            trace!(t = now.as_secs_f64(), "attacker has nothing to replay yet");
            self.queue.schedule(now.saturating_add(ATTACKER_RETRY), Event::AttackerReplay);
            return;
        };

        if self.config.randomize_attacker && !payload.is_empty() {
            let idx = self.rng.gen_range(0..payload.len());
            payload[idx] ^= self.rng.gen_range(0..4u8);
        }
        if self.replays_sent == 0 {
            info!(t = now.as_secs_f64(), "attacker started replaying");
        }
        self.replays_sent += 1;
        trace!(
            fingerprint = %fingerprint(&payload),
            t = now.as_secs_f64(),
            "attacker replayed DIO"
        );

        let attacker = self.attacker();
        self.broadcast(attacker, payload, now);
        self.queue.schedule(now.saturating_add(self.replay_interval), Event::AttackerReplay);
    }

    fn broadcast(&mut self, from: usize, payload: Vec<u8>, now: Duration) {
        self.queue.schedule(now.saturating_add(DELIVERY_DELAY), Event::Deliver { from, payload });
    }

    async fn deliver(&mut self, from: usize, payload: Vec<u8>, now: Duration) -> Result<()> {
        let sender = node_addr(from);
        let attacker = self.attacker();

        let mut pending = JoinSet::new();
        for node in self.topology.hearers(from) {
            let receiver = self.receivers[node].clone();
            let payload = payload.clone();
            pending.spawn(async move { receiver.deliver(sender, payload, now).await });
        }
        while let Some(joined) = pending.join_next().await {
            let decision = joined.context("delivery task panicked")??;
            self.decisions.record(decision);
        }

        if from != attacker && self.topology.in_range(from, attacker) {
            trace!(len = payload.len(), "attacker captured DIO");
            self.captured = Some(payload);
        }
        Ok(())
    }

    async fn shutdown(&self) {
        for receiver in &self.receivers {
            receiver.quit().await;
        }
    }
}
