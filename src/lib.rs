//! # dioguard - Replay Detection for Broadcast DIO Control Messages
//!
//! A root periodically broadcasts a DIO; a compromised node captures and
//! rebroadcasts it, optionally perturbed, to disrupt topology formation.
//! `dioguard` implements the per-receiver **Detection & Rate Mitigation**
//! engine that decides, for every received DIO, whether to accept or drop it
//! and whether to temporarily blacklist its sender.
//!
//! ## Architecture
//!
//! - Each receiver owns one [`DrmEngine`]: a synchronous state machine driven
//!   by caller-supplied time. Receivers share nothing.
//! - Randomness is injected through [`UniformSource`] so every engine can be
//!   seeded independently, or scripted in tests.
//! - [`ReceiverHandle`] moves an engine into an actor task for async callers.
//!
//! ## Security Model
//!
//! DIOs are unauthenticated, which is exactly what makes replay possible.
//! Detection is heuristic: a 16-bit content fingerprint, a cross-sender
//! window, a per-sender window and a suspicion threshold. It is not a
//! substitute for signatures.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `fingerprint` | CRC-16/XMODEM payload fingerprints |
//! | `history` | Per-sender ring buffer, suspicion and blacklist state |
//! | `index` | Time-windowed cross-sender fingerprint index |
//! | `drm` | Classification engine, configuration, counters |
//! | `protocols` | Random source seam |
//! | `receiver` | Actor wrapper around an engine |
//! | `summary` | Run-wide aggregation and reporting |
//! | `sim` | Root/attacker scenario over a grid topology |

mod drm;
mod fingerprint;
mod history;
mod index;
mod protocols;
mod receiver;
pub mod sim;
mod summary;

pub use drm::{
    ConfigError, DEFAULT_REPLAY_WINDOW, DEFAULT_SAME_SOURCE_SUSPICION_PROBABILITY,
    DEFAULT_SUSPICION_THRESHOLD, Decision, DrmConfig, DrmCounters, DrmEngine,
};
pub use fingerprint::{Fingerprint, fingerprint};
pub use history::{DEFAULT_HISTORY_CAPACITY, NeighborState};
pub use index::{GlobalFingerprintIndex, IndexEntry, Sighting};
pub use protocols::{RngSource, UniformSource};
pub use receiver::ReceiverHandle;
pub use summary::{AttackProfile, RunSummary};
