use crate::config::{SessionConfig, TransportKind};
use crate::framing::{FrameBuffer, Framing};
use crate::types::{ConnectionState, Epoch};
use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const READ_CHUNK: usize = 4096;

/// Event produced by a connection's I/O task, tagged with its epoch
#[derive(Debug)]
pub enum LinkEvent {
    Opened { epoch: Epoch },
    Frame { epoch: Epoch, frame: Bytes },
    Closed { epoch: Epoch, reason: CloseReason },
}

/// Why an I/O task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    ConnectFailed(String),
    PeerClosed,
    Io(String),
    WriteTimeout,
    /// The owning transport went away
    Abandoned,
}

/// Lifecycle transition, reported once per change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Connected(Epoch),
    TimedOut,
    Disconnected,
}

#[derive(Clone)]
struct IoSettings {
    destination: String,
    kind: TransportKind,
    framing: Framing,
    max_frame_len: usize,
    connect_timeout: Duration,
    write_timeout: Duration,
}

/// Owns the single live connection to one device
///
/// Socket I/O runs in a spawned task that reports back through `LinkEvent`s;
/// the transport itself is only touched by the session task.
pub struct Transport {
    settings: IoSettings,
    state: ConnectionState,
    epoch: Epoch,
    /// Epoch tag of the I/O task currently connecting or connected
    attempt: Option<Epoch>,
    writer: Option<mpsc::UnboundedSender<Bytes>>,
    task: Option<JoinHandle<()>>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl Transport {
    pub fn new(config: &SessionConfig, framing: Framing, events: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self {
            settings: IoSettings {
                destination: config.destination(),
                kind: config.transport,
                framing,
                max_frame_len: config.max_frame_len,
                connect_timeout: config.connect_timeout,
                write_timeout: config.write_timeout,
            },
            state: ConnectionState::Disconnected,
            epoch: 0,
            attempt: None,
            writer: None,
            task: None,
            events,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Epoch of the current (or most recent) connection
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn destination(&self) -> &str {
        &self.settings.destination
    }

    /// Start connecting; no-op while connecting or connected
    pub fn open(&mut self) -> bool {
        if matches!(self.state, ConnectionState::Connecting | ConnectionState::Connected) {
            return false;
        }

        let attempt = self.epoch + 1;
        let (writer, outbound) = mpsc::unbounded_channel();
        tracing::info!("Connecting to {}", self.settings.destination);

        let task = tokio::spawn(run_connection(
            self.settings.clone(),
            attempt,
            outbound,
            self.events.clone(),
        ));

        self.attempt = Some(attempt);
        self.writer = Some(writer);
        self.task = Some(task);
        self.state = ConnectionState::Connecting;
        true
    }

    /// Fire-and-forget write; discarded with a warning when not connected
    pub fn send(&self, bytes: Bytes) -> bool {
        if !self.is_connected() {
            tracing::warn!("Not connected, discarding {} byte(s)", bytes.len());
            return false;
        }
        match &self.writer {
            Some(writer) => {
                tracing::trace!("Sending: {}", String::from_utf8_lossy(&bytes).trim_end());
                writer.send(bytes).is_ok()
            }
            None => false,
        }
    }

    /// The I/O task reports a successful connect
    pub fn on_opened(&mut self, epoch: Epoch) -> Option<Transition> {
        if self.attempt != Some(epoch) || self.state != ConnectionState::Connecting {
            return None;
        }
        self.state = ConnectionState::Connected;
        self.epoch = epoch;
        tracing::info!("Connected to {} (epoch {})", self.settings.destination, epoch);
        Some(Transition::Connected(epoch))
    }

    /// The I/O task ended on its own
    pub fn on_closed(&mut self, epoch: Epoch, reason: CloseReason) -> Vec<Transition> {
        if self.attempt != Some(epoch) {
            return Vec::new();
        }
        match &reason {
            CloseReason::ConnectFailed(e) => {
                tracing::warn!("Failed to connect to {}: {}", self.settings.destination, e)
            }
            CloseReason::PeerClosed => tracing::info!("Connection closed by {}", self.settings.destination),
            other => tracing::warn!("Connection to {} lost: {:?}", self.settings.destination, other),
        }
        self.teardown(reason == CloseReason::WriteTimeout)
    }

    /// Force the connection down, e.g. after a request timeout or desync
    pub fn drop_link(&mut self, timed_out: bool) -> Vec<Transition> {
        if self.attempt.is_none() {
            return Vec::new();
        }
        tracing::warn!("Dropping connection to {}", self.settings.destination);
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.teardown(timed_out)
    }

    fn teardown(&mut self, timed_out: bool) -> Vec<Transition> {
        let was_connected = self.state == ConnectionState::Connected;
        self.attempt = None;
        self.writer = None;
        self.task = None;

        let mut transitions = Vec::new();
        if timed_out && was_connected {
            transitions.push(Transition::TimedOut);
        }
        self.state = ConnectionState::Disconnected;
        transitions.push(Transition::Disconnected);
        transitions
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run_connection(
    settings: IoSettings,
    epoch: Epoch,
    outbound: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    let reason = match settings.kind {
        TransportKind::Tcp => run_tcp(&settings, epoch, outbound, &events).await,
        TransportKind::Udp => run_udp(&settings, epoch, outbound, &events).await,
    };
    let _ = events.send(LinkEvent::Closed { epoch, reason });
}

async fn run_tcp(
    settings: &IoSettings,
    epoch: Epoch,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    events: &mpsc::UnboundedSender<LinkEvent>,
) -> CloseReason {
    let stream = match timeout(settings.connect_timeout, TcpStream::connect(&settings.destination)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return CloseReason::ConnectFailed(e.to_string()),
        Err(_) => return CloseReason::ConnectFailed("connect timed out".to_string()),
    };
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("Could not set TCP_NODELAY: {}", e);
    }
    if events.send(LinkEvent::Opened { epoch }).is_err() {
        return CloseReason::Abandoned;
    }

    let (mut reader, mut writer) = stream.into_split();
    let mut frames = FrameBuffer::new(settings.framing.clone(), settings.max_frame_len);
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => return CloseReason::PeerClosed,
                Ok(n) => {
                    for frame in frames.push(&buf[..n]) {
                        if events.send(LinkEvent::Frame { epoch, frame }).is_err() {
                            return CloseReason::Abandoned;
                        }
                    }
                }
                Err(e) => return CloseReason::Io(e.to_string()),
            },
            msg = outbound.recv() => match msg {
                Some(bytes) => match timeout(settings.write_timeout, writer.write_all(&bytes)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => return CloseReason::Io(e.to_string()),
                    Err(_) => return CloseReason::WriteTimeout,
                },
                None => return CloseReason::Abandoned,
            },
        }
    }
}

async fn run_udp(
    settings: &IoSettings,
    epoch: Epoch,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    events: &mpsc::UnboundedSender<LinkEvent>,
) -> CloseReason {
    let socket = match open_udp(&settings.destination).await {
        Ok(socket) => socket,
        Err(e) => return CloseReason::ConnectFailed(e.to_string()),
    };
    if events.send(LinkEvent::Opened { epoch }).is_err() {
        return CloseReason::Abandoned;
    }

    let mut frames = FrameBuffer::new(settings.framing.clone(), settings.max_frame_len);
    // One spare byte so an oversized datagram is seen as such, not truncated
    let mut buf = vec![0u8; settings.max_frame_len + 1];

    loop {
        tokio::select! {
            read = socket.recv(&mut buf) => match read {
                Ok(n) => {
                    for frame in frames.push(&buf[..n]) {
                        if events.send(LinkEvent::Frame { epoch, frame }).is_err() {
                            return CloseReason::Abandoned;
                        }
                    }
                }
                Err(e) => return CloseReason::Io(e.to_string()),
            },
            msg = outbound.recv() => match msg {
                Some(bytes) => match timeout(settings.write_timeout, socket.send(&bytes)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => return CloseReason::Io(e.to_string()),
                    Err(_) => return CloseReason::WriteTimeout,
                },
                None => return CloseReason::Abandoned,
            },
        }
    }
}

async fn open_udp(destination: &str) -> std::io::Result<UdpSocket> {
    let remote = tokio::net::lookup_host(destination).await?.next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, format!("no address for {}", destination))
    })?;
    let local = if remote.is_ipv4() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    } else {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(remote).await?;
    Ok(socket)
}
