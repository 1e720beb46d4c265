//! Desired/observed convergence for a single attribute
//!
//! A [`Reconciler`] is driven by three kinds of input: an operator setting a
//! desired value, its own timer ticks, and observations arriving from the
//! device. It never performs I/O; `tick` hands back the [`Action`] the session
//! should put on the wire.

use crate::config::secs;
use crate::store::StateStore;
use crate::types::{Attribute, Composite, Value};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Derive the externally visible state from desired and raw values
///
/// `None` desired shows raw as-is; a mismatch shows `Partially <desired>`.
pub fn composite(desired: Option<&Value>, raw: Option<&Value>) -> Option<Composite> {
    match (desired, raw) {
        (None, None) => None,
        (None, Some(r)) => Some(Composite::Settled(r.clone())),
        (Some(d), Some(r)) if d == r => Some(Composite::Settled(r.clone())),
        (Some(d), _) => Some(Composite::Partially(d.clone())),
    }
}

/// Timing for one attribute's reconciliation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Passive polling interval while idle or after giving up
    #[serde(with = "secs")]
    pub poll_interval: Duration,
    /// Interval between corrective commands while converging
    #[serde(with = "secs")]
    pub retry_interval: Duration,
    /// How long corrective commands are attempted after an operator action
    #[serde(with = "secs")]
    pub enforcement_window: Duration,
    /// Delay before the first tick after an action or a connect
    #[serde(with = "secs")]
    pub initial_delay: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            retry_interval: Duration::from_secs(5),
            enforcement_window: Duration::from_secs(60),
            initial_delay: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Desired unset or reached; passive polling only
    Idle,
    /// Actively correcting the device
    Converging,
    /// Enforcement window elapsed; desired kept for display only
    GivingUp,
}

/// What the session should send on behalf of a reconciler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Drive the device to this value
    Correct(Value),
    /// Enquire the current value
    Poll,
}

/// Convergence state machine for one attribute
#[derive(Debug)]
pub struct Reconciler {
    attribute: Attribute,
    config: ReconcileConfig,
    phase: Phase,
    linked: bool,
    next_tick: Option<Instant>,
}

impl Reconciler {
    pub fn new(attribute: impl Into<Attribute>, config: ReconcileConfig) -> Self {
        Self {
            attribute: attribute.into(),
            config,
            phase: Phase::Idle,
            linked: false,
            next_tick: None,
        }
    }

    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    pub fn next_tick(&self) -> Option<Instant> {
        self.next_tick
    }

    /// Operator action
    ///
    /// Returns `false` when already converging toward `value`; the enforcement
    /// window is left untouched in that case.
    pub fn set_desired(&mut self, value: Value, now: Instant, store: &mut StateStore) -> bool {
        if self.phase == Phase::Converging && store.desired_value(&self.attribute) == Some(&value) {
            tracing::debug!("{}: already converging toward {}", self.attribute, value);
            return false;
        }

        tracing::info!("{}: desired set to {}", self.attribute, value);
        store.set_desired(&self.attribute, value, now);
        self.phase = Phase::Converging;
        self.next_tick = Some(now + self.config.initial_delay);
        true
    }

    /// Timer tick; does nothing unless due
    pub fn tick(&mut self, now: Instant, store: &StateStore) -> Option<Action> {
        if !self.next_tick.is_some_and(|t| now >= t) {
            return None;
        }

        match self.phase {
            Phase::Idle | Phase::GivingUp => self.passive(now),
            Phase::Converging => {
                if store.is_converged(&self.attribute) {
                    tracing::debug!("{}: raw matches desired, going idle", self.attribute);
                    self.phase = Phase::Idle;
                    self.next_tick = Some(now + self.config.poll_interval);
                    return None;
                }

                let desired = store.desired(&self.attribute)?;
                if now.saturating_duration_since(desired.at) > self.config.enforcement_window {
                    tracing::warn!(
                        "{}: not {} after {:?}, giving up active retries",
                        self.attribute,
                        desired.value,
                        self.config.enforcement_window
                    );
                    self.phase = Phase::GivingUp;
                    return self.passive(now);
                }

                if !self.linked {
                    self.next_tick = Some(now + self.config.poll_interval);
                    return None;
                }

                tracing::debug!(
                    "{}: forcing {}, will check again in {:?}",
                    self.attribute,
                    desired.value,
                    self.config.retry_interval
                );
                self.next_tick = Some(now + self.config.retry_interval);
                Some(Action::Correct(desired.value.clone()))
            }
        }
    }

    /// Re-evaluate after a raw update
    ///
    /// Returns `true` when this observation completed convergence.
    pub fn observe(&mut self, now: Instant, store: &StateStore) -> bool {
        if self.phase == Phase::Idle || !store.is_converged(&self.attribute) {
            return false;
        }

        tracing::info!("{}: reached desired state", self.attribute);
        self.phase = Phase::Idle;
        self.next_tick = Some(now + self.config.poll_interval);
        true
    }

    /// Connection established: poll soon and resume corrections
    pub fn link_up(&mut self, now: Instant) {
        self.linked = true;
        self.next_tick = Some(now + self.config.initial_delay);
    }

    /// Connection lost: fall back to passive cadence
    pub fn link_down(&mut self, now: Instant) {
        self.linked = false;
        self.next_tick = Some(now + self.config.poll_interval);
    }

    fn passive(&mut self, now: Instant) -> Option<Action> {
        self.next_tick = Some(now + self.config.poll_interval);
        self.linked.then_some(Action::Poll)
    }
}
