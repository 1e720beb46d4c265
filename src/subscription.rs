use crate::error::{LinkError, Result};
use crate::types::{Attribute, Composite, ConnectionState, Status, Value};
use tokio::sync::broadcast;

/// Change published by a device session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Transport lifecycle transition
    Connection(ConnectionState),

    /// Device reported a new value
    Raw { attribute: Attribute, value: Value },

    /// Externally visible state changed
    Composite { attribute: Attribute, value: Composite },

    /// Health status changed
    Status(Status),
}

/// Receiver for session events
pub struct EventReceiver {
    rx: broadcast::Receiver<SessionEvent>,
}

impl EventReceiver {
    /// Create a new event receiver
    pub(crate) fn new(rx: broadcast::Receiver<SessionEvent>) -> Self {
        Self { rx }
    }

    /// Receive the next event
    ///
    /// Fails with `SessionStopped` once the session has shut down.
    pub async fn recv(&mut self) -> Result<SessionEvent> {
        self.rx.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => LinkError::SessionStopped,
            broadcast::error::RecvError::Lagged(n) => {
                LinkError::ChannelError(format!("Lagged by {} messages", n))
            }
        })
    }

    /// Try to receive an event without blocking
    ///
    /// Returns `None` if no event is available.
    pub fn try_recv(&mut self) -> Result<Option<SessionEvent>> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Closed) => Err(LinkError::SessionStopped),
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                Err(LinkError::ChannelError(format!("Lagged by {} messages", n)))
            }
        }
    }
}
