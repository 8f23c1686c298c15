//! End-of-run aggregation across every receiver's [`DrmCounters`].

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::drm::DrmCounters;

/// Attack parameters echoed in the summary.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct AttackProfile {
    /// Replays per second.
    pub rate: f64,
    pub start_secs: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RunSummary {
    /// DIOs originated by the root.
    pub processed: u64,
    pub dropped: u64,
    pub mitigation_drops: u64,
    pub received: u64,
    pub suspicious_events: u64,
    pub blacklist_events: u64,
    /// Earliest blacklist transition across all receivers, in seconds.
    pub detection_time_secs: Option<f64>,
    pub receivers: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attack: Option<AttackProfile>,
}

impl RunSummary {
    pub fn new(processed: u64) -> Self {
        Self {
            processed,
            ..Default::default()
        }
    }

    /// Fold one receiver's counters into the totals.
    pub fn absorb(&mut self, counters: &DrmCounters) {
        self.receivers += 1;
        self.dropped += counters.dropped;
        self.mitigation_drops += counters.mitigation_drops;
        self.received += counters.received;
        self.suspicious_events += counters.suspicious_events;
        self.blacklist_events += counters.blacklist_events;
        if let Some(at) = counters.first_blacklist_at {
            let secs = at.as_secs_f64();
            self.detection_time_secs = Some(match self.detection_time_secs {
                Some(existing) => existing.min(secs),
                None => secs,
            });
        }
    }

    pub fn aggregate<'a>(
        processed: u64,
        counters: impl IntoIterator<Item = &'a DrmCounters>,
    ) -> Self {
        let mut summary = Self::new(processed);
        for c in counters {
            summary.absorb(c);
        }
        summary
    }

    pub fn with_attack(mut self, attack: AttackProfile) -> Self {
        self.attack = Some(attack);
        self
    }

    pub fn detection_time(&self) -> Option<Duration> {
        self.detection_time_secs.map(Duration::from_secs_f64)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== SIMULATION COMPLETE ===")?;
        writeln!(f, "Total DIOs processed: {}", self.processed)?;
        writeln!(f, "Total DIOs dropped (blacklisted + others): {}", self.dropped)?;
        writeln!(f, "DIOs dropped due to mitigation: {}", self.mitigation_drops)?;
        if let Some(attack) = &self.attack {
            writeln!(
                f,
                "Attack rate: {} per sec, started at {}s",
                attack.rate, attack.start_secs
            )?;
        }
        writeln!(f, "Total DIOs received: {}", self.received)?;
        writeln!(f, "Total suspicious events: {}", self.suspicious_events)?;
        writeln!(f, "Total blacklist events: {}", self.blacklist_events)?;
        match self.detection_time_secs {
            Some(secs) => writeln!(f, "Detection time (first blacklist): {secs}s")?,
            None => writeln!(f, "Detection time: NONE (no node blacklisted attacker)")?,
        }
        write!(f, "============================")
    }
}
