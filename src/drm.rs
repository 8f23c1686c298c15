//! # Detection & Rate Mitigation Engine
//!
//! One [`DrmEngine`] runs per receiver. For every DIO it is handed it decides
//! whether to accept the message, drop it, and whether the sender has earned a
//! temporary blacklist. Two independent windows feed that decision:
//!
//! | Window | Catches | Reaction |
//! |--------|---------|----------|
//! | Global fingerprint index | Same content from a *different* sender | Always suspicious, always dropped |
//! | Per-sender history ring | Same content repeated by the *same* sender | Always dropped, suspicious with probability `p` |
//!
//! A sender whose suspicion reaches the threshold is blacklisted for one
//! replay window. Suspicion never decays.
//!
//! ## Classification Order
//!
//! 1. Bypass mode records the fingerprint and accepts.
//! 2. Blacklisted senders are dropped before any bookkeeping.
//! 3. Cross-source replay (global index).
//! 4. Global index attribution is recorded.
//! 5. Same-source duplicate (history ring).
//! 6. Accept and record in the ring.
//!
//! The engine is a synchronous state machine driven by caller-supplied time.
//! It holds no locks and never blocks; see [`crate::receiver`] for an actor
//! wrapper.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::fingerprint::fingerprint;
use crate::history::{DEFAULT_HISTORY_CAPACITY, NeighborState};
use crate::index::{GlobalFingerprintIndex, Sighting};
use crate::protocols::{RngSource, UniformSource};

// ============================================================================
// Configuration
// ============================================================================

/// Suspicion count at which a sender is blacklisted.
pub const DEFAULT_SUSPICION_THRESHOLD: u32 = 5;

/// Probability that a same-source duplicate counts as suspicious.
pub const DEFAULT_SAME_SOURCE_SUSPICION_PROBABILITY: f64 = 0.30;

/// Replay window. Also the blacklist duration.
pub const DEFAULT_REPLAY_WINDOW: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DrmConfig {
    /// Skip all detection; every message is accepted. Used to measure the
    /// undefended baseline.
    pub bypass_detection: bool,
    /// Ring slots per sender.
    pub history_capacity: usize,
    /// Suspicion count that triggers a blacklist.
    pub suspicion_threshold: u32,
    /// Chance in `[0, 1]` that a same-source duplicate raises suspicion.
    pub same_source_suspicion_probability: f64,
    /// Duplicate detection window and blacklist duration.
    pub replay_window: Duration,
}

impl Default for DrmConfig {
    fn default() -> Self {
        Self {
            bypass_detection: false,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            suspicion_threshold: DEFAULT_SUSPICION_THRESHOLD,
            same_source_suspicion_probability: DEFAULT_SAME_SOURCE_SUSPICION_PROBABILITY,
            replay_window: DEFAULT_REPLAY_WINDOW,
        }
    }
}

impl DrmConfig {
    /// Check the invariants the engine relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history_capacity == 0 {
            return Err(ConfigError::ZeroHistoryCapacity);
        }
        if self.suspicion_threshold == 0 {
            return Err(ConfigError::ZeroSuspicionThreshold);
        }
        if !(0.0..=1.0).contains(&self.same_source_suspicion_probability) {
            return Err(ConfigError::ProbabilityOutOfRange(self.same_source_suspicion_probability));
        }
        if self.replay_window.is_zero() {
            return Err(ConfigError::ZeroReplayWindow);
        }
        Ok(())
    }
}

/// Rejected [`DrmConfig`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConfigError {
    ZeroHistoryCapacity,
    ZeroSuspicionThreshold,
    /// Probability outside `[0, 1]`, or NaN.
    ProbabilityOutOfRange(f64),
    ZeroReplayWindow,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroHistoryCapacity => write!(f, "history capacity must be at least 1"),
            Self::ZeroSuspicionThreshold => write!(f, "suspicion threshold must be at least 1"),
            Self::ProbabilityOutOfRange(p) => {
                write!(f, "same-source suspicion probability must be within [0, 1], got {p}")
            }
            Self::ZeroReplayWindow => write!(f, "replay window must be non-zero"),
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================================================
// Decisions and Counters
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum Decision {
    Accepted,
    /// Sender is inside its blacklist period.
    DroppedBlacklisted,
    /// Fingerprint is attributed to another sender within the window.
    DroppedCrossReplay,
    /// Sender already delivered this fingerprint within the window.
    DroppedSameSourceReplay,
}

impl Decision {
    pub fn is_drop(self) -> bool {
        !matches!(self, Self::Accepted)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Accepted => "accepted",
            Self::DroppedBlacklisted => "dropped (blacklisted)",
            Self::DroppedCrossReplay => "dropped (cross-source replay)",
            Self::DroppedSameSourceReplay => "dropped (same-source replay)",
        };
        f.write_str(label)
    }
}

/// Cumulative per-engine counters, summed across receivers for the run summary.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DrmCounters {
    pub received: u64,
    pub dropped: u64,
    /// Drops caused by detection logic. Equal to `dropped`: bypass mode never
    /// drops.
    pub mitigation_drops: u64,
    pub suspicious_events: u64,
    pub blacklist_events: u64,
    pub first_blacklist_at: Option<Duration>,
}

// ============================================================================
// Engine
// ============================================================================

pub struct DrmEngine<S, U = RngSource<rand_chacha::ChaCha8Rng>> {
    config: DrmConfig,
    neighbors: HashMap<S, NeighborState>,
    index: GlobalFingerprintIndex<S>,
    source: U,
    counters: DrmCounters,
    last_prune: Duration,
}

impl<S> DrmEngine<S>
where
    S: Clone + Eq + Hash + fmt::Debug,
{
    /// Engine with an entropy-seeded random source.
    pub fn new(config: DrmConfig) -> Result<Self, ConfigError> {
        Self::with_source(config, RngSource::from_entropy())
    }

    /// Engine with a reproducible random source.
    pub fn seeded(config: DrmConfig, seed: u64) -> Result<Self, ConfigError> {
        Self::with_source(config, RngSource::seeded(seed))
    }
}

impl<S, U> DrmEngine<S, U>
where
    S: Clone + Eq + Hash + fmt::Debug,
    U: UniformSource,
{
    pub fn with_source(config: DrmConfig, source: U) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            index: GlobalFingerprintIndex::new(config.replay_window),
            neighbors: HashMap::new(),
            source,
            counters: DrmCounters::default(),
            last_prune: Duration::ZERO,
            config,
        })
    }

    pub fn config(&self) -> &DrmConfig {
        &self.config
    }

    pub fn counters(&self) -> DrmCounters {
        self.counters
    }

    pub fn received(&self) -> u64 {
        self.counters.received
    }

    pub fn dropped(&self) -> u64 {
        self.counters.dropped
    }

    pub fn mitigation_drops(&self) -> u64 {
        self.counters.mitigation_drops
    }

    pub fn suspicious_events(&self) -> u64 {
        self.counters.suspicious_events
    }

    pub fn blacklist_events(&self) -> u64 {
        self.counters.blacklist_events
    }

    pub fn first_blacklist_at(&self) -> Option<Duration> {
        self.counters.first_blacklist_at
    }

    pub fn neighbor(&self, sender: &S) -> Option<&NeighborState> {
        self.neighbors.get(sender)
    }

    pub fn neighbor_count(&self) -> usize {
        self.neighbors.len()
    }

    pub fn index(&self) -> &GlobalFingerprintIndex<S> {
        &self.index
    }

    pub fn is_blacklisted(&self, sender: &S, now: Duration) -> bool {
        self.neighbors
            .get(sender)
            .is_some_and(|state| state.is_blacklisted(now))
    }

    /// Remove stale global index entries. Returns how many were removed.
    pub fn prune(&mut self, now: Duration) -> usize {
        self.last_prune = now;
        self.index.prune(now)
    }

    /// Classify one received DIO.
    pub fn on_message(&mut self, sender: S, payload: &[u8], now: Duration) -> Decision {
        let fp = fingerprint(payload);
        self.counters.received += 1;

        let capacity = self.config.history_capacity;
        let state = self
            .neighbors
            .entry(sender.clone())
            .or_insert_with(|| NeighborState::new(capacity));

        if self.config.bypass_detection {
            state.record(fp, now);
            state.touch(now);
            trace!(sender = ?sender, fingerprint = %fp, "accepted DIO (detection bypassed)");
            return Decision::Accepted;
        }

        if state.is_blacklisted(now) {
            self.counters.dropped += 1;
            self.counters.mitigation_drops += 1;
            debug!(sender = ?sender, fingerprint = %fp, "dropped DIO from blacklisted sender");
            return Decision::DroppedBlacklisted;
        }
        state.touch(now);

        if now.saturating_sub(self.last_prune) >= self.config.replay_window {
            let pruned = self.prune(now);
            if pruned > 0 {
                trace!(pruned, remaining = self.index.len(), "pruned stale fingerprints");
            }
        }

        if self.index.check(fp, &sender, now) == Sighting::CrossSource {
            debug!(
                sender = ?sender,
                original = ?self.index.lookup(fp, now).map(|entry| &entry.sender),
                fingerprint = %fp,
                "cross-source replay"
            );
            self.raise_suspicion(&sender, now);
            return self.drop_with(Decision::DroppedCrossReplay);
        }
        self.index.observe(fp, &sender, now);

        let window = self.config.replay_window;
        let duplicate = self
            .neighbors
            .get(&sender)
            .is_some_and(|state| state.contains_recent(fp, now, window));

        if duplicate {
            let sample = self.source.next_uniform();
            if sample < self.config.same_source_suspicion_probability {
                self.raise_suspicion(&sender, now);
            } else {
                trace!(sender = ?sender, fingerprint = %fp, "same-source duplicate tolerated");
            }
            return self.drop_with(Decision::DroppedSameSourceReplay);
        }

        if let Some(state) = self.neighbors.get_mut(&sender) {
            state.record(fp, now);
        }
        trace!(
            sender = ?sender,
            fingerprint = %fp,
            payload = %hex::encode(payload),
            "accepted DIO"
        );
        Decision::Accepted
    }

    fn drop_with(&mut self, decision: Decision) -> Decision {
        self.counters.dropped += 1;
        self.counters.mitigation_drops += 1;
        decision
    }

    /// Count a suspicious event and blacklist the sender once the threshold
    /// is reached.
    fn raise_suspicion(&mut self, sender: &S, now: Duration) {
        let Some(state) = self.neighbors.get_mut(sender) else {
            return;
        };
        let suspicion = state.raise_suspicion();
        self.counters.suspicious_events += 1;
        debug!(sender = ?sender, suspicion, "suspicious DIO");

        if suspicion >= self.config.suspicion_threshold {
            let until = now.saturating_add(self.config.replay_window);
            state.blacklist_until(until);
            self.counters.blacklist_events += 1;
            if self.counters.first_blacklist_at.is_none() {
                self.counters.first_blacklist_at = Some(now);
            }
            warn!(
                sender = ?sender,
                suspicion,
                until_secs = until.as_secs_f64(),
                "blacklisted sender"
            );
        }
    }
}

impl<S: fmt::Debug, U> fmt::Debug for DrmEngine<S, U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrmEngine")
            .field("config", &self.config)
            .field("neighbors", &self.neighbors.len())
            .field("indexed", &self.index)
            .field("counters", &self.counters)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIO: [u8; 8] = [0xAA, 0xBB, 0xCC, 0xDD, 0x11, 0x22, 0x33, 0x44];

    /// Always yields the same sample.
    struct Fixed(f64);

    impl UniformSource for Fixed {
        fn next_uniform(&mut self) -> f64 {
            self.0
        }
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn engine(sample: f64) -> DrmEngine<&'static str, Fixed> {
        DrmEngine::with_source(DrmConfig::default(), Fixed(sample))
            .expect("default config is valid")
    }

    #[test]
    fn config_defaults_match_published_constants() {
        let config = DrmConfig::default();
        assert!(!config.bypass_detection);
        assert_eq!(config.history_capacity, 8);
        assert_eq!(config.suspicion_threshold, 5);
        assert_eq!(config.same_source_suspicion_probability, 0.30);
        assert_eq!(config.replay_window, secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let cases = [
            (
                DrmConfig {
                    history_capacity: 0,
                    ..Default::default()
                },
                ConfigError::ZeroHistoryCapacity,
            ),
            (
                DrmConfig {
                    suspicion_threshold: 0,
                    ..Default::default()
                },
                ConfigError::ZeroSuspicionThreshold,
            ),
            (
                DrmConfig {
                    same_source_suspicion_probability: 1.5,
                    ..Default::default()
                },
                ConfigError::ProbabilityOutOfRange(1.5),
            ),
            (
                DrmConfig {
                    replay_window: Duration::ZERO,
                    ..Default::default()
                },
                ConfigError::ZeroReplayWindow,
            ),
        ];
        for (config, expected) in cases {
            assert_eq!(config.validate(), Err(expected));
            assert!(DrmEngine::<u32, Fixed>::with_source(config, Fixed(0.0)).is_err());
        }

        let nan = DrmConfig {
            same_source_suspicion_probability: f64::NAN,
            ..Default::default()
        };
        assert!(matches!(nan.validate(), Err(ConfigError::ProbabilityOutOfRange(_))));
    }

    #[test]
    fn config_error_display() {
        assert_eq!(
            ConfigError::ZeroHistoryCapacity.to_string(),
            "history capacity must be at least 1"
        );
        assert!(ConfigError::ProbabilityOutOfRange(2.0).to_string().contains("got 2"));
    }

    #[test]
    fn first_message_is_accepted_and_recorded() {
        let mut drm = engine(0.99);
        assert_eq!(drm.on_message("root", &DIO, secs(1)), Decision::Accepted);

        let state = drm.neighbor(&"root").expect("neighbor created lazily");
        assert_eq!(state.write_index(), 1);
        assert_eq!(state.last_seen(), secs(1));
        assert_eq!(drm.index().lookup(fingerprint(&DIO), secs(1)).map(|e| e.sender), Some("root"));
        assert_eq!(drm.received(), 1);
        assert_eq!(drm.dropped(), 0);
    }

    #[test]
    fn empty_payload_is_an_ordinary_message() {
        let mut drm = engine(0.99);
        assert_eq!(drm.on_message("a", &[], secs(0)), Decision::Accepted);
        assert_eq!(drm.on_message("a", &[], secs(1)), Decision::DroppedSameSourceReplay);
    }

    #[test]
    fn cross_source_replay_leaves_history_untouched() {
        let mut drm = engine(0.99);
        drm.on_message("root", &DIO, secs(0));
        assert_eq!(drm.on_message("attacker", &DIO, secs(10)), Decision::DroppedCrossReplay);

        let attacker = drm.neighbor(&"attacker").expect("attacker tracked");
        assert_eq!(attacker.suspicion(), 1);
        assert_eq!(attacker.write_index(), 0);
        assert_eq!(drm.suspicious_events(), 1);
        assert_eq!(drm.mitigation_drops(), 1);
    }

    #[test]
    fn same_source_duplicate_suspicion_follows_sample() {
        let mut tolerant = engine(0.30);
        tolerant.on_message("root", &DIO, secs(0));
        assert_eq!(tolerant.on_message("root", &DIO, secs(5)), Decision::DroppedSameSourceReplay);
        assert_eq!(tolerant.neighbor(&"root").map(|s| s.suspicion()), Some(0));

        let mut strict = engine(0.29);
        strict.on_message("root", &DIO, secs(0));
        assert_eq!(strict.on_message("root", &DIO, secs(5)), Decision::DroppedSameSourceReplay);
        assert_eq!(strict.neighbor(&"root").map(|s| s.suspicion()), Some(1));
        assert_eq!(strict.suspicious_events(), 1);
    }

    #[test]
    fn detected_duplicate_is_not_cached() {
        let mut drm = engine(0.99);
        drm.on_message("root", &DIO, secs(0));
        drm.on_message("root", &DIO, secs(5));
        assert_eq!(drm.neighbor(&"root").map(|s| s.write_index()), Some(1));
    }

    #[test]
    fn threshold_blacklists_for_one_window() {
        let mut drm = engine(0.99);
        drm.on_message("root", &DIO, secs(0));
        for t in 1..=5 {
            assert_eq!(drm.on_message("attacker", &DIO, secs(t)), Decision::DroppedCrossReplay);
        }
        assert_eq!(drm.blacklist_events(), 1);
        assert_eq!(drm.first_blacklist_at(), Some(secs(5)));
        assert!(drm.is_blacklisted(&"attacker", secs(64)));
        assert!(!drm.is_blacklisted(&"attacker", secs(65)));

        let fresh = [0x01, 0x02, 0x03];
        assert_eq!(drm.on_message("attacker", &fresh, secs(30)), Decision::DroppedBlacklisted);
        assert!(drm.index().lookup(fingerprint(&fresh), secs(30)).is_none());
        assert_eq!(drm.neighbor(&"attacker").map(|s| s.write_index()), Some(0));
    }

    #[test]
    fn blacklisted_drop_does_not_raise_suspicion() {
        let mut drm = engine(0.0);
        drm.on_message("root", &DIO, secs(0));
        for t in 1..=5 {
            drm.on_message("attacker", &DIO, secs(t));
        }
        drm.on_message("attacker", &DIO, secs(6));
        assert_eq!(drm.neighbor(&"attacker").map(|s| s.suspicion()), Some(5));
        assert_eq!(drm.suspicious_events(), 5);
        assert_eq!(drm.dropped(), 6);
    }

    #[test]
    fn first_blacklist_time_keeps_earliest() {
        let mut drm = engine(0.0);
        drm.on_message("root", &DIO, secs(0));
        for t in 1..=5 {
            drm.on_message("a", &DIO, secs(t));
        }
        for t in 10..=14 {
            drm.on_message("b", &DIO, secs(t));
        }
        assert_eq!(drm.blacklist_events(), 2);
        assert_eq!(drm.first_blacklist_at(), Some(secs(5)));
    }

    #[test]
    fn bypass_accepts_everything() {
        let config = DrmConfig {
            bypass_detection: true,
            ..Default::default()
        };
        let mut drm: DrmEngine<&str, Fixed> = DrmEngine::with_source(config, Fixed(0.0)).unwrap();
        for t in 0..20 {
            assert_eq!(drm.on_message("root", &DIO, secs(t)), Decision::Accepted);
            assert_eq!(drm.on_message("attacker", &DIO, secs(t)), Decision::Accepted);
        }
        assert_eq!(drm.received(), 40);
        assert_eq!(drm.dropped(), 0);
        assert_eq!(drm.suspicious_events(), 0);
        assert_eq!(drm.blacklist_events(), 0);
        assert_eq!(drm.first_blacklist_at(), None);
        assert!(drm.index().is_empty());
        assert_eq!(drm.neighbor(&"root").map(|s| s.write_index()), Some(20 % 8));
    }

    #[test]
    fn stale_index_entry_allows_new_attribution() {
        let mut drm = engine(0.99);
        drm.on_message("root", &DIO, secs(0));
        assert_eq!(drm.on_message("other", &DIO, secs(60)), Decision::Accepted);
        assert_eq!(
            drm.index().lookup(fingerprint(&DIO), secs(60)).map(|e| e.sender),
            Some("other")
        );
    }

    #[test]
    fn lazy_prune_bounds_index() {
        let mut drm = engine(0.99);
        for i in 0..10u8 {
            drm.on_message("root", &[i], secs(i as u64));
        }
        assert_eq!(drm.index().len(), 10);
        drm.on_message("root", &[0xFF], secs(200));
        assert_eq!(drm.index().len(), 1);
    }

    #[test]
    fn explicit_prune_reports_removed() {
        let mut drm = engine(0.99);
        drm.on_message("a", &[1], secs(0));
        drm.on_message("b", &[2], secs(30));
        assert_eq!(drm.prune(secs(70)), 1);
        assert_eq!(drm.index().len(), 1);
    }

    #[test]
    fn clock_going_backwards_is_tolerated() {
        let mut drm = engine(0.99);
        drm.on_message("root", &DIO, secs(100));
        assert_eq!(drm.on_message("root", &DIO, secs(50)), Decision::DroppedSameSourceReplay);
        assert_eq!(drm.on_message("attacker", &DIO, secs(40)), Decision::DroppedCrossReplay);
    }

    #[test]
    fn decision_helpers() {
        assert!(!Decision::Accepted.is_drop());
        assert!(Decision::DroppedBlacklisted.is_drop());
        assert_eq!(Decision::DroppedCrossReplay.to_string(), "dropped (cross-source replay)");
    }
}
