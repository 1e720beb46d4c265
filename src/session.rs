//! The per-device actor
//!
//! A [`DeviceSession`] runs as a single tokio task and owns everything that
//! describes one device: the transport, the request correlator, the desired
//! and raw stores, one reconciler per attribute and the health monitor. Client
//! handles talk to it through [`Command`]s; it wakes for those, for link events
//! and for the earliest pending deadline, so no state is ever shared or locked.

use crate::config::SessionConfig;
use crate::connection::{LinkEvent, Transition, Transport};
use crate::correlator::{Correlator, Submitted};
use crate::error::{LinkError, Result};
use crate::health::HealthMonitor;
use crate::protocol::{DeviceProtocol, FrameKind, Reply};
use crate::reconcile::{Action, Phase, Reconciler};
use crate::snapshot::CompositeSnapshot;
use crate::store::StateStore;
use crate::subscription::SessionEvent;
use crate::types::{Attribute, Composite, ConnectionState, Epoch, Observation, Status, Value};
use bytes::Bytes;
use chrono::Local;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{sleep_until, Instant};

/// Request from a client handle
pub(crate) enum Command {
    SetDesired {
        attribute: Attribute,
        value: Value,
        reply: oneshot::Sender<Result<bool>>,
    },
    ForceRaw {
        attribute: Attribute,
        value: Value,
        reply: oneshot::Sender<Result<Reply>>,
    },
    Poll {
        attribute: Attribute,
    },
    Request {
        bytes: Bytes,
        reply: oneshot::Sender<Result<Reply>>,
    },
    Send {
        bytes: Bytes,
    },
    SetFault {
        fault: Option<String>,
    },
    Composite {
        attribute: Attribute,
        reply: oneshot::Sender<Option<Composite>>,
    },
    Status {
        reply: oneshot::Sender<Option<Status>>,
    },
    Phase {
        attribute: Attribute,
        reply: oneshot::Sender<Option<Phase>>,
    },
    Snapshot {
        reply: oneshot::Sender<CompositeSnapshot>,
    },
    Shutdown,
}

/// Why a request was put on the wire
enum Purpose {
    Poll(Attribute),
    Enforce(Attribute),
    Force {
        attribute: Attribute,
        reply: oneshot::Sender<Result<Reply>>,
    },
    Passthrough(oneshot::Sender<Result<Reply>>),
}

impl Purpose {
    fn describe(&self) -> String {
        match self {
            Purpose::Poll(a) => format!("poll of {}", a),
            Purpose::Enforce(a) => format!("correction of {}", a),
            Purpose::Force { attribute, .. } => format!("forced set of {}", attribute),
            Purpose::Passthrough(_) => "request".to_string(),
        }
    }
}

pub(crate) struct DeviceSession {
    config: SessionConfig,
    protocol: Box<dyn DeviceProtocol>,
    transport: Transport,
    correlator: Correlator<Purpose>,
    store: StateStore,
    reconcilers: BTreeMap<Attribute, Reconciler>,
    health: HealthMonitor,
    status: Option<Status>,
    connection: ConnectionState,
    /// Last composite emitted per attribute
    published: HashMap<Attribute, Composite>,
    /// Composites carried over from a previous run, shown until observed
    warm: HashMap<Attribute, Composite>,
    events: broadcast::Sender<SessionEvent>,
    link_rx: mpsc::UnboundedReceiver<LinkEvent>,
    commands: mpsc::Receiver<Command>,
    reconnect_at: Option<Instant>,
    backoff: Duration,
    next_health_check: Instant,
}

impl DeviceSession {
    pub(crate) fn new(
        config: SessionConfig,
        protocol: Box<dyn DeviceProtocol>,
        snapshot: CompositeSnapshot,
        commands: mpsc::Receiver<Command>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let transport = Transport::new(&config, protocol.framing(), link_tx);
        let correlator = Correlator::new(
            config.request_timeout,
            config.max_queued_requests,
            config.max_in_flight,
        );
        let reconcilers = config
            .attributes
            .keys()
            .map(|a| (a.clone(), Reconciler::new(a.clone(), config.reconcile_for(a))))
            .collect();

        Self {
            health: HealthMonitor::new(config.health.clone()),
            next_health_check: Instant::now() + config.health.check_interval,
            backoff: config.reconnect_delay,
            protocol,
            transport,
            correlator,
            store: StateStore::new(),
            reconcilers,
            status: None,
            connection: ConnectionState::Disconnected,
            published: HashMap::new(),
            warm: snapshot.composites.into_iter().collect(),
            events,
            link_rx,
            commands,
            reconnect_at: None,
            config,
        }
    }

    pub(crate) async fn run(mut self) {
        self.open();

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.on_command(cmd, Instant::now()),
                },
                Some(event) = self.link_rx.recv() => self.on_link_event(event, Instant::now()),
                _ = sleep_until(deadline) => {}
            }

            let now = Instant::now();
            self.on_timers(now);
            self.flush(now);
        }

        tracing::info!("Session for {} stopping", self.transport.destination());
        for pending in self.correlator.reset(self.transport.epoch()) {
            self.fail(pending.context, LinkError::SessionStopped);
        }
    }

    fn next_deadline(&self) -> Instant {
        let mut deadline = self.next_health_check;
        let candidates = self
            .reconcilers
            .values()
            .filter_map(Reconciler::next_tick)
            .chain(self.correlator.next_deadline())
            .chain(self.reconnect_at);
        for t in candidates {
            deadline = deadline.min(t);
        }
        deadline
    }

    fn open(&mut self) {
        if self.transport.open() {
            self.set_connection(ConnectionState::Connecting);
        }
    }

    fn on_command(&mut self, cmd: Command, now: Instant) {
        match cmd {
            Command::SetDesired { attribute, value, reply } => {
                let _ = reply.send(self.set_desired(attribute, value, now));
            }
            Command::ForceRaw { attribute, value, reply } => {
                match self.protocol.set_command(&attribute, &value) {
                    Some(bytes) => {
                        tracing::info!("{}: forcing {} without reconciliation", attribute, value);
                        self.submit(Bytes::from(bytes), Purpose::Force { attribute, reply });
                    }
                    None => {
                        let _ = reply.send(Err(LinkError::UnsupportedAttribute(attribute)));
                    }
                }
            }
            Command::Poll { attribute } => self.request_poll(attribute),
            Command::Request { bytes, reply } => self.submit(bytes, Purpose::Passthrough(reply)),
            Command::Send { bytes } => {
                self.transport.send(bytes);
            }
            Command::SetFault { fault } => {
                self.health.set_fault(fault);
                if self.status.is_some() {
                    self.check_health(now);
                }
            }
            Command::Composite { attribute, reply } => {
                let _ = reply.send(self.composite(&attribute));
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status.clone());
            }
            Command::Phase { attribute, reply } => {
                let _ = reply.send(self.reconcilers.get(&attribute).map(Reconciler::phase));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown => {}
        }
    }

    fn set_desired(&mut self, attribute: Attribute, value: Value, now: Instant) -> Result<bool> {
        if self.protocol.set_command(&attribute, &value).is_none() {
            return Err(LinkError::UnsupportedAttribute(attribute));
        }

        let linked = self.transport.is_connected();
        let reconciler = self.reconcilers.entry(attribute.clone()).or_insert_with(|| {
            let mut r = Reconciler::new(attribute.clone(), self.config.reconcile_for(&attribute));
            if linked {
                r.link_up(now);
            }
            r
        });
        let changed = reconciler.set_desired(value, now, &mut self.store);
        self.publish_composite(&attribute);
        Ok(changed)
    }

    fn composite(&self, attribute: &str) -> Option<Composite> {
        self.store
            .composite(attribute)
            .or_else(|| self.warm.get(attribute).cloned())
    }

    fn snapshot(&self) -> CompositeSnapshot {
        let mut composites: BTreeMap<Attribute, Composite> = self
            .warm
            .iter()
            .map(|(a, c)| (a.clone(), c.clone()))
            .collect();
        composites.extend(self.published.iter().map(|(a, c)| (a.clone(), c.clone())));
        CompositeSnapshot { composites }
    }

    fn on_link_event(&mut self, event: LinkEvent, now: Instant) {
        match event {
            LinkEvent::Opened { epoch } => {
                if let Some(transition) = self.transport.on_opened(epoch) {
                    self.on_transition(transition, now);
                }
            }
            LinkEvent::Frame { epoch, frame } => self.on_frame(epoch, frame, now),
            LinkEvent::Closed { epoch, reason } => {
                for transition in self.transport.on_closed(epoch, reason) {
                    self.on_transition(transition, now);
                }
            }
        }
    }

    fn on_transition(&mut self, transition: Transition, now: Instant) {
        match transition {
            Transition::Connected(epoch) => {
                for pending in self.correlator.reset(epoch) {
                    self.fail(pending.context, LinkError::Dropped);
                }
                for r in self.reconcilers.values_mut() {
                    r.link_up(now);
                }
                self.backoff = self.config.reconnect_delay;
                self.reconnect_at = None;
                self.set_connection(ConnectionState::Connected);
            }
            Transition::TimedOut => self.set_connection(ConnectionState::TimedOut),
            Transition::Disconnected => {
                for pending in self.correlator.reset(self.transport.epoch()) {
                    self.fail(pending.context, LinkError::Dropped);
                }
                for r in self.reconcilers.values_mut() {
                    r.link_down(now);
                }
                tracing::debug!("Reconnecting to {} in {:?}", self.transport.destination(), self.backoff);
                self.reconnect_at = Some(now + self.backoff);
                self.backoff = (self.backoff * 2).min(self.config.max_reconnect_delay);
                self.set_connection(ConnectionState::Disconnected);
            }
        }
    }

    fn on_frame(&mut self, epoch: Epoch, frame: Bytes, now: Instant) {
        if epoch != self.transport.epoch() || !self.transport.is_connected() {
            tracing::debug!("Discarding frame from stale connection (epoch {})", epoch);
            return;
        }

        match self.protocol.classify(&frame) {
            FrameKind::Noise => {
                tracing::trace!("Ignoring: {}", String::from_utf8_lossy(&frame));
            }
            FrameKind::Notification => match self.protocol.parse_notification(&frame) {
                Ok(observations) => {
                    self.health.record_contact(now);
                    for observation in observations {
                        self.apply(observation, now);
                    }
                }
                Err(e) => {
                    tracing::warn!("Malformed notification {:?}: {}", String::from_utf8_lossy(&frame), e);
                }
            },
            FrameKind::Response { token } => {
                let Some(pending) = self.correlator.on_response(epoch, token) else {
                    return;
                };
                match self.protocol.parse_response(&pending.bytes, &frame) {
                    Ok(reply) => {
                        self.health.record_contact(now);
                        self.complete(pending.context, reply, now);
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Response {:?} does not match {}: {}",
                            String::from_utf8_lossy(&frame),
                            pending.context.describe(),
                            e
                        );
                        self.fail(pending.context, e.into());
                        for transition in self.transport.drop_link(false) {
                            self.on_transition(transition, now);
                        }
                    }
                }
            }
        }
    }

    fn complete(&mut self, purpose: Purpose, reply: Reply, now: Instant) {
        match &reply {
            Reply::Observed(observations) => {
                for observation in observations.iter().cloned() {
                    self.apply(observation, now);
                }
            }
            Reply::Ack => {}
            Reply::Rejected(detail) => {
                tracing::warn!("Device rejected {}: {}", purpose.describe(), detail);
            }
        }

        let acked = reply == Reply::Ack;
        let result = match reply {
            Reply::Rejected(detail) => Err(LinkError::DeviceReported { detail }),
            other => Ok(other),
        };

        match purpose {
            Purpose::Poll(_) => {}
            Purpose::Enforce(attribute) => {
                if acked {
                    self.request_poll(attribute);
                }
            }
            Purpose::Force { attribute, reply } => {
                if acked {
                    self.request_poll(attribute);
                }
                let _ = reply.send(result);
            }
            Purpose::Passthrough(reply) => {
                let _ = reply.send(result);
            }
        }
    }

    fn apply(&mut self, observation: Observation, now: Instant) {
        let Observation { attribute, value } = observation;
        if self.store.set_raw(&attribute, value.clone(), now) {
            tracing::debug!("{} is now {}", attribute, value);
            self.emit(SessionEvent::Raw {
                attribute: attribute.clone(),
                value,
            });
        }
        self.warm.remove(&attribute);

        if let Some(r) = self.reconcilers.get_mut(&attribute) {
            r.observe(now, &self.store);
        }
        self.publish_composite(&attribute);
    }

    fn publish_composite(&mut self, attribute: &str) {
        let Some(composite) = self.store.composite(attribute) else {
            return;
        };
        if self.published.get(attribute) == Some(&composite) {
            return;
        }
        self.published.insert(attribute.to_string(), composite.clone());
        self.emit(SessionEvent::Composite {
            attribute: attribute.to_string(),
            value: composite,
        });
    }

    fn on_timers(&mut self, now: Instant) {
        if self.reconnect_at.is_some_and(|t| now >= t) {
            self.reconnect_at = None;
            self.open();
        }

        if let Some(expired) = self.correlator.expire(now) {
            tracing::warn!("No response to {} within {:?}", expired.context.describe(), self.config.request_timeout);
            self.fail(expired.context, LinkError::Timeout);
            for transition in self.transport.drop_link(true) {
                self.on_transition(transition, now);
            }
        }

        if now >= self.next_health_check {
            self.check_health(now);
            self.next_health_check = now + self.config.health.check_interval;
        }

        let actions: Vec<(Attribute, Action)> = self
            .reconcilers
            .values_mut()
            .filter_map(|r| r.tick(now, &self.store).map(|a| (r.attribute().to_string(), a)))
            .collect();
        for (attribute, action) in actions {
            match action {
                Action::Poll => self.request_poll(attribute),
                Action::Correct(value) => self.request_correction(attribute, value),
            }
        }
    }

    /// Write whatever the correlator releases
    fn flush(&mut self, now: Instant) {
        if !self.transport.is_connected() {
            return;
        }
        for bytes in self.correlator.dispatch(now) {
            self.transport.send(bytes);
        }
    }

    fn request_poll(&mut self, attribute: Attribute) {
        if self
            .correlator
            .any_pending(|p| matches!(p, Purpose::Poll(a) if *a == attribute))
        {
            return;
        }
        match self.protocol.poll_command(&attribute) {
            Some(bytes) => self.submit(Bytes::from(bytes), Purpose::Poll(attribute)),
            None => tracing::debug!("{}: no poll command", attribute),
        }
    }

    fn request_correction(&mut self, attribute: Attribute, value: Value) {
        if self
            .correlator
            .any_pending(|p| matches!(p, Purpose::Enforce(a) if *a == attribute))
        {
            return;
        }
        match self.protocol.set_command(&attribute, &value) {
            Some(bytes) => self.submit(Bytes::from(bytes), Purpose::Enforce(attribute)),
            None => tracing::warn!("{}: no command to set {}", attribute, value),
        }
    }

    fn submit(&mut self, bytes: Bytes, purpose: Purpose) {
        if !self.transport.is_connected() {
            tracing::debug!("Not connected, skipping {}", purpose.describe());
            self.fail(purpose, LinkError::ConnectionClosed);
            return;
        }
        let token = self.protocol.request_token(&bytes);
        if let Submitted::Overflow(purpose) = self.correlator.submit(bytes, token, purpose) {
            self.fail(purpose, LinkError::QueueFull);
        }
    }

    fn fail(&self, purpose: Purpose, error: LinkError) {
        match purpose {
            Purpose::Force { reply, .. } | Purpose::Passthrough(reply) => {
                let _ = reply.send(Err(error));
            }
            other => tracing::debug!("{} failed: {}", other.describe(), error),
        }
    }

    fn check_health(&mut self, now: Instant) {
        let status = self.health.check(now, Local::now());
        if self.status.as_ref() == Some(&status) {
            return;
        }
        tracing::info!(
            "Status of {}: {:?} {}",
            self.transport.destination(),
            status.level,
            status.message
        );
        self.status = Some(status.clone());
        self.emit(SessionEvent::Status(status));
    }

    fn set_connection(&mut self, state: ConnectionState) {
        if self.connection != state {
            self.connection = state;
            self.emit(SessionEvent::Connection(state));
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }
}
