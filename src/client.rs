use crate::config::SessionConfig;
use crate::error::{LinkError, Result};
use crate::protocol::{DeviceProtocol, Reply};
use crate::reconcile::Phase;
use crate::session::{Command, DeviceSession};
use crate::snapshot::CompositeSnapshot;
use crate::subscription::{EventReceiver, SessionEvent};
use crate::types::{Attribute, Composite, Status, Value};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};

const COMMAND_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 100;

/// Handle to a running device session
///
/// Cloning is cheap; every clone talks to the same session task. The session
/// keeps running until [`DeviceClient::shutdown`] is called or every handle
/// has been dropped.
#[derive(Clone)]
pub struct DeviceClient {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<SessionEvent>,
    destination: Arc<str>,
}

impl DeviceClient {
    /// Start a session for one device
    ///
    /// Must be called from within a tokio runtime. The session starts
    /// connecting immediately and reconnects on its own after any drop.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use avlink::{DeviceClient, DeviceProtocol, SessionConfig};
    ///
    /// # async fn demo(protocol: impl DeviceProtocol) -> avlink::Result<()> {
    /// let config = SessionConfig::new("10.0.0.20", 4352).with_attribute("Power");
    /// let client = DeviceClient::spawn(config, protocol)?;
    /// client.set_desired("Power", "On").await?;
    /// println!("{:?}", client.composite("Power").await?);
    /// # Ok(())
    /// # }
    /// ```
    pub fn spawn(config: SessionConfig, protocol: impl DeviceProtocol) -> Result<Self> {
        Self::spawn_with_snapshot(config, protocol, CompositeSnapshot::default())
    }

    /// Start a session seeded with composites saved by a previous run
    ///
    /// Seeded values are reported by [`DeviceClient::composite`] until the
    /// device reports the attribute itself.
    pub fn spawn_with_snapshot(
        config: SessionConfig,
        protocol: impl DeviceProtocol,
        snapshot: CompositeSnapshot,
    ) -> Result<Self> {
        config.validate()?;

        let (commands, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let destination: Arc<str> = Arc::from(config.destination());

        let session = DeviceSession::new(config, Box::new(protocol), snapshot, commands_rx, events.clone());
        tokio::spawn(session.run());

        Ok(Self {
            commands,
            events,
            destination,
        })
    }

    /// `host:port` of the device
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Operator action: drive `attribute` toward `value`
    ///
    /// Returns `false` when the session was already converging toward the same
    /// value, in which case nothing changes.
    pub async fn set_desired(&self, attribute: impl Into<Attribute>, value: impl Into<Value>) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::SetDesired {
            attribute: attribute.into(),
            value: value.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| LinkError::SessionStopped)?
    }

    /// Send a set command right away, bypassing reconciliation
    ///
    /// Resolves with the device's answer. A negative answer is returned as
    /// [`LinkError::DeviceReported`].
    pub async fn force_raw(&self, attribute: impl Into<Attribute>, value: impl Into<Value>) -> Result<Reply> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::ForceRaw {
            attribute: attribute.into(),
            value: value.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| LinkError::SessionStopped)?
    }

    /// Ask the device for the current value of `attribute`
    pub async fn poll(&self, attribute: impl Into<Attribute>) -> Result<()> {
        self.send_command(Command::Poll {
            attribute: attribute.into(),
        })
        .await
    }

    /// Send a vendor command through the correlator and await its answer
    pub async fn request(&self, bytes: impl Into<Bytes>) -> Result<Reply> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::Request {
            bytes: bytes.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| LinkError::SessionStopped)?
    }

    /// Write raw bytes without expecting an answer
    pub async fn send(&self, bytes: impl Into<Bytes>) -> Result<()> {
        self.send_command(Command::Send { bytes: bytes.into() }).await
    }

    /// Report (or clear) a device fault, shown as a warning while reachable
    pub async fn set_fault(&self, fault: Option<String>) -> Result<()> {
        self.send_command(Command::SetFault { fault }).await
    }

    /// Externally visible state of `attribute`
    pub async fn composite(&self, attribute: impl Into<Attribute>) -> Result<Option<Composite>> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::Composite {
            attribute: attribute.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| LinkError::SessionStopped)
    }

    /// Most recent health status; `None` before the first check
    pub async fn status(&self) -> Result<Option<Status>> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::Status { reply }).await?;
        rx.await.map_err(|_| LinkError::SessionStopped)
    }

    /// Reconciliation phase of `attribute`, if it is reconciled
    pub async fn phase(&self, attribute: impl Into<Attribute>) -> Result<Option<Phase>> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::Phase {
            attribute: attribute.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| LinkError::SessionStopped)
    }

    /// Current composites, for seeding the next run
    pub async fn snapshot(&self) -> Result<CompositeSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::Snapshot { reply }).await?;
        rx.await.map_err(|_| LinkError::SessionStopped)
    }

    /// Subscribe to session events
    ///
    /// Multiple subscriptions can be active simultaneously.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # async fn demo(client: avlink::DeviceClient) {
    /// let mut events = client.subscribe();
    /// while let Ok(event) = events.recv().await {
    ///     println!("{:?}", event);
    /// }
    /// # }
    /// ```
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver::new(self.events.subscribe())
    }

    /// Stop the session; pending requests fail with `SessionStopped`
    pub async fn shutdown(&self) -> Result<()> {
        self.send_command(Command::Shutdown).await
    }

    async fn send_command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| LinkError::SessionStopped)
    }
}
