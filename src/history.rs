//! # Per-Sender History
//!
//! Each sender a receiver has heard from gets a [`NeighborState`]: a small
//! ring of recently accepted fingerprints, a suspicion counter that never
//! decays, and a blacklist expiry. Blacklist status is derived from the expiry
//! alone so there is no second flag to fall out of sync.

use std::time::Duration;

use crate::fingerprint::Fingerprint;

/// Default number of ring slots per sender.
pub const DEFAULT_HISTORY_CAPACITY: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Slot {
    fingerprint: Fingerprint,
    seen_at: Duration,
}

#[derive(Clone, Debug)]
pub struct NeighborState {
    /// `None` until first written; empty slots never match.
    history: Box<[Option<Slot>]>,
    /// Next slot to overwrite. Always `< history.len()`.
    write_index: usize,
    suspicion: u32,
    blacklisted_until: Duration,
    last_seen: Duration,
}

impl NeighborState {
    /// Fresh state with empty slots.
    ///
    /// # Panics
    /// Panics if `capacity` is zero. [`DrmConfig::validate`](crate::DrmConfig::validate)
    /// rejects that before any state is built.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "history capacity must be non-zero");
        Self {
            history: vec![None; capacity].into_boxed_slice(),
            write_index: 0,
            suspicion: 0,
            blacklisted_until: Duration::ZERO,
            last_seen: Duration::ZERO,
        }
    }

    pub fn capacity(&self) -> usize {
        self.history.len()
    }

    pub fn write_index(&self) -> usize {
        self.write_index
    }

    pub fn suspicion(&self) -> u32 {
        self.suspicion
    }

    pub fn blacklisted_until(&self) -> Duration {
        self.blacklisted_until
    }

    pub fn last_seen(&self) -> Duration {
        self.last_seen
    }

    #[inline]
    pub fn is_blacklisted(&self, now: Duration) -> bool {
        now < self.blacklisted_until
    }

    /// Overwrite the oldest slot and advance the write index.
    pub fn record(&mut self, fingerprint: Fingerprint, now: Duration) {
        self.history[self.write_index] = Some(Slot { fingerprint, seen_at: now });
        self.write_index = (self.write_index + 1) % self.history.len();
    }

    /// True if `fingerprint` occupies a slot younger than `window`.
    ///
    /// A slot stamped after `now` (caller clock went backwards) counts as age
    /// zero.
    pub fn contains_recent(
        &self,
        fingerprint: Fingerprint,
        now: Duration,
        window: Duration,
    ) -> bool {
        self.history.iter().flatten().any(|slot| {
            slot.fingerprint == fingerprint && now.saturating_sub(slot.seen_at) < window
        })
    }

    pub(crate) fn touch(&mut self, now: Duration) {
        self.last_seen = now;
    }

    /// Bump suspicion; returns the new count.
    pub(crate) fn raise_suspicion(&mut self) -> u32 {
        self.suspicion = self.suspicion.saturating_add(1);
        self.suspicion
    }

    pub(crate) fn blacklist_until(&mut self, until: Duration) {
        self.blacklisted_until = until;
    }
}
