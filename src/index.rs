//! # Global Fingerprint Index
//!
//! Maps each fingerprint to the first sender that delivered it inside the
//! current replay window. The same fingerprint arriving from a *different*
//! sender while the entry is live is the signature of a cross-source replay.
//!
//! Entries are stale once `now - seen_at >= window`. Staleness is checked at
//! lookup time, so [`GlobalFingerprintIndex::prune`] only bounds memory.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use crate::fingerprint::Fingerprint;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexEntry<S> {
    pub sender: S,
    pub seen_at: Duration,
}

impl<S> IndexEntry<S> {
    #[inline]
    pub fn is_live(&self, now: Duration, window: Duration) -> bool {
        now.saturating_sub(self.seen_at) < window
    }
}

/// Outcome of checking a fingerprint against the index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sighting {
    /// No live entry, or the live entry belongs to this sender.
    Fresh,
    /// A live entry attributes this fingerprint to another sender.
    CrossSource,
}

#[derive(Debug)]
pub struct GlobalFingerprintIndex<S> {
    entries: HashMap<Fingerprint, IndexEntry<S>>,
    window: Duration,
}

impl<S: Clone + Eq + Hash> GlobalFingerprintIndex<S> {
    pub fn new(window: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            window,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Live entry for `fingerprint`, if any.
    pub fn lookup(&self, fingerprint: Fingerprint, now: Duration) -> Option<&IndexEntry<S>> {
        self.entries
            .get(&fingerprint)
            .filter(|entry| entry.is_live(now, self.window))
    }

    /// Classify a sighting without mutating the index.
    pub fn check(&self, fingerprint: Fingerprint, sender: &S, now: Duration) -> Sighting {
        match self.lookup(fingerprint, now) {
            Some(entry) if entry.sender != *sender => Sighting::CrossSource,
            _ => Sighting::Fresh,
        }
    }

    /// Attribute `fingerprint` to `sender`.
    ///
    /// A live entry owned by another sender is left untouched so the original
    /// attribution survives a replay. A live entry owned by `sender` has its
    /// timestamp refreshed, keeping a sender that repeats itself inside the
    /// window attributed. Absent or stale entries are (re)created.
    pub fn observe(&mut self, fingerprint: Fingerprint, sender: &S, now: Duration) {
        let window = self.window;
        match self.entries.get_mut(&fingerprint) {
            Some(entry) if entry.is_live(now, window) => {
                if entry.sender == *sender {
                    entry.seen_at = now;
                }
            }
            Some(entry) => {
                entry.sender = sender.clone();
                entry.seen_at = now;
            }
            None => {
                self.entries.insert(
                    fingerprint,
                    IndexEntry {
                        sender: sender.clone(),
                        seen_at: now,
                    },
                );
            }
        }
    }

    /// Drop every stale entry. Returns how many were removed.
    pub fn prune(&mut self, now: Duration) -> usize {
        let window = self.window;
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now, window));
        before - self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(60);

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn unknown_fingerprint_is_fresh() {
        let index: GlobalFingerprintIndex<&str> = GlobalFingerprintIndex::new(WINDOW);
        assert_eq!(index.check(Fingerprint::from_raw(1), &"a", secs(0)), Sighting::Fresh);
        assert!(index.is_empty());
    }

    #[test]
    fn other_sender_within_window_is_cross_source() {
        let mut index = GlobalFingerprintIndex::new(WINDOW);
        let fp = Fingerprint::from_raw(0xD0B6);
        index.observe(fp, &"root", secs(0));

        assert_eq!(index.check(fp, &"attacker", secs(10)), Sighting::CrossSource);
        assert_eq!(index.check(fp, &"root", secs(10)), Sighting::Fresh);
    }

    #[test]
    fn replay_does_not_steal_attribution() {
        let mut index = GlobalFingerprintIndex::new(WINDOW);
        let fp = Fingerprint::from_raw(0x0042);
        index.observe(fp, &"root", secs(0));
        index.observe(fp, &"attacker", secs(5));

        let entry = index.lookup(fp, secs(5)).expect("entry should be live");
        assert_eq!(entry.sender, "root");
        assert_eq!(entry.seen_at, secs(0));
    }

    #[test]
    fn same_sender_resighting_keeps_entry_live() {
        let mut index = GlobalFingerprintIndex::new(WINDOW);
        let fp = Fingerprint::from_raw(0x0042);
        index.observe(fp, &"root", secs(0));
        index.observe(fp, &"root", secs(50));

        let entry = index.lookup(fp, secs(100)).expect("refreshed entry should be live");
        assert_eq!(entry.sender, "root");
        assert_eq!(entry.seen_at, secs(50));
    }

    #[test]
    fn stale_entry_is_replaced() {
        let mut index = GlobalFingerprintIndex::new(WINDOW);
        let fp = Fingerprint::from_raw(0x0042);
        index.observe(fp, &"root", secs(0));

        assert!(index.lookup(fp, secs(60)).is_none());
        assert_eq!(index.check(fp, &"other", secs(60)), Sighting::Fresh);

        index.observe(fp, &"other", secs(60));
        let entry = index.lookup(fp, secs(61)).expect("entry should be live");
        assert_eq!(entry.sender, "other");
        assert_eq!(entry.seen_at, secs(60));
    }

    #[test]
    fn prune_removes_only_stale_entries() {
        let mut index = GlobalFingerprintIndex::new(WINDOW);
        index.observe(Fingerprint::from_raw(1), &"a", secs(0));
        index.observe(Fingerprint::from_raw(2), &"b", secs(30));
        index.observe(Fingerprint::from_raw(3), &"c", secs(59));

        assert_eq!(index.prune(secs(90)), 2);
        assert_eq!(index.len(), 1);
        assert!(index.lookup(Fingerprint::from_raw(3), secs(90)).is_some());
    }
}
