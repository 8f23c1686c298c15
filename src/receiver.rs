//! # Receiver Actor
//!
//! Wraps a [`DrmEngine`] in a tokio task so that many receivers can be driven
//! from async code at once. The [`ReceiverHandle`] is cheap to clone and talks
//! to the actor over a bounded channel; the actor owns the engine and applies
//! commands strictly in arrival order, so no two classifications on the same
//! receiver ever interleave.

use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::{Instrument, debug, info_span};

use crate::drm::{Decision, DrmCounters, DrmEngine};
use crate::protocols::UniformSource;

/// Commands queued per receiver before senders back off.
const COMMAND_QUEUE_DEPTH: usize = 256;

enum Command<S> {
    Deliver {
        sender: S,
        payload: Vec<u8>,
        now: Duration,
        reply: oneshot::Sender<Decision>,
    },
    Counters(oneshot::Sender<DrmCounters>),
    Prune(Duration, oneshot::Sender<usize>),
    Quit,
}

#[derive(Clone)]
pub struct ReceiverHandle<S> {
    cmd_tx: mpsc::Sender<Command<S>>,
    label: String,
}

impl<S> ReceiverHandle<S>
where
    S: Clone + Eq + Hash + Debug + Send + 'static,
{
    /// Move `engine` into a new actor task. `label` tags the actor's log
    /// output.
    pub fn spawn<U>(engine: DrmEngine<S, U>, label: impl Into<String>) -> Self
    where
        U: UniformSource + 'static,
    {
        let label = label.into();
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let actor = ReceiverActor { engine, cmd_rx };
        let span = info_span!("receiver", node = %label);
        tokio::spawn(actor.run().instrument(span));
        Self { cmd_tx, label }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Hand one DIO to the receiver and wait for its classification.
    pub async fn deliver(&self, sender: S, payload: Vec<u8>, now: Duration) -> Result<Decision> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Deliver { sender, payload, now, reply })
            .await
            .ok()
            .with_context(|| format!("receiver {} has shut down", self.label))?;
        rx.await
            .with_context(|| format!("receiver {} dropped the reply", self.label))
    }

    pub async fn counters(&self) -> Result<DrmCounters> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Counters(tx))
            .await
            .ok()
            .with_context(|| format!("receiver {} has shut down", self.label))?;
        rx.await
            .with_context(|| format!("receiver {} dropped the reply", self.label))
    }

    /// Prune stale global index entries. Returns how many were removed.
    pub async fn prune(&self, now: Duration) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Prune(now, tx))
            .await
            .ok()
            .with_context(|| format!("receiver {} has shut down", self.label))?;
        rx.await
            .with_context(|| format!("receiver {} dropped the reply", self.label))
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

struct ReceiverActor<S, U> {
    engine: DrmEngine<S, U>,
    cmd_rx: mpsc::Receiver<Command<S>>,
}

impl<S, U> ReceiverActor<S, U>
where
    S: Clone + Eq + Hash + Debug + Send + 'static,
    U: UniformSource + 'static,
{
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::Deliver { sender, payload, now, reply } => {
                    let decision = self.engine.on_message(sender, &payload, now);
                    let _ = reply.send(decision);
                }
                Command::Counters(reply) => {
                    let _ = reply.send(self.engine.counters());
                }
                Command::Prune(now, reply) => {
                    let _ = reply.send(self.engine.prune(now));
                }
                Command::Quit => break,
            }
        }
        debug!(
            received = self.engine.received(),
            dropped = self.engine.dropped(),
            "receiver stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drm::DrmConfig;

    const DIO: [u8; 8] = [0xAA, 0xBB, 0xCC, 0xDD, 0x11, 0x22, 0x33, 0x44];

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn spawn_receiver() -> ReceiverHandle<u32> {
        let engine = DrmEngine::seeded(DrmConfig::default(), 1).expect("valid config");
        ReceiverHandle::spawn(engine, "node-1")
    }

    #[tokio::test]
    async fn deliver_returns_engine_decision() {
        let handle = spawn_receiver();
        assert_eq!(handle.deliver(0, DIO.to_vec(), secs(0)).await.unwrap(), Decision::Accepted);
        assert_eq!(
            handle.deliver(19, DIO.to_vec(), secs(1)).await.unwrap(),
            Decision::DroppedCrossReplay
        );

        let counters = handle.counters().await.unwrap();
        assert_eq!(counters.received, 2);
        assert_eq!(counters.dropped, 1);
        assert_eq!(counters.suspicious_events, 1);
    }

    #[tokio::test]
    async fn commands_apply_in_order_across_clones() {
        let handle = spawn_receiver();
        let clone = handle.clone();
        for t in 0..10 {
            let target = if t % 2 == 0 { &handle } else { &clone };
            target.deliver(0, vec![t as u8], secs(t)).await.unwrap();
        }
        assert_eq!(handle.counters().await.unwrap().received, 10);
    }

    #[tokio::test]
    async fn prune_reaches_engine() {
        let handle = spawn_receiver();
        handle.deliver(0, vec![1], secs(0)).await.unwrap();
        handle.deliver(0, vec![2], secs(30)).await.unwrap();
        assert_eq!(handle.prune(secs(75)).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn calls_fail_after_quit() {
        let handle = spawn_receiver();
        handle.quit().await;
        // The actor drains Quit and drops its receiver.
        tokio::task::yield_now().await;
        let mut failed = false;
        for _ in 0..50 {
            if handle.counters().await.is_err() {
                failed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(failed, "handle should report the actor is gone");
        assert_eq!(handle.label(), "node-1");
    }
}
