use avlink::{
    Composite, ConnectionState, DeviceClient, DeviceProtocol, EventReceiver, FrameKind, Framing,
    LinkError, Observation, ParseError, Phase, ReconcileConfig, Reply, SessionConfig, SessionEvent,
    Status, StatusLevel, Value,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

/// Line protocol of the simulated display
struct LineDisplay;

impl DeviceProtocol for LineDisplay {
    fn framing(&self) -> Framing {
        Framing::lines()
    }

    fn classify(&self, frame: &[u8]) -> FrameKind {
        if frame.starts_with(b"NOTIFY ") {
            FrameKind::Notification
        } else if frame == b"HELLO" {
            FrameKind::Noise
        } else {
            FrameKind::Response { token: None }
        }
    }

    fn parse_response(&self, request: &[u8], frame: &[u8]) -> Result<Reply, ParseError> {
        let text = std::str::from_utf8(frame).map_err(|e| ParseError::new(e.to_string()))?;
        if text == "OK" {
            return Ok(Reply::Ack);
        }
        if let Some(detail) = text.strip_prefix("ERR ") {
            return Ok(Reply::Rejected(detail.to_string()));
        }
        if let Some(v) = text.strip_prefix("POWR ") {
            if request.starts_with(b"POWR") {
                return Ok(Reply::Observed(vec![Observation::new("Power", v)]));
            }
        }
        if let Some(v) = text.strip_prefix("LAMP ") {
            if request.starts_with(b"LAMP") {
                let hours: i64 = v.parse().map_err(|_| ParseError::new(text))?;
                return Ok(Reply::Observed(vec![Observation::new("Lamp", hours)]));
            }
        }
        Err(ParseError::new(format!("unexpected answer {:?}", text)))
    }

    fn parse_notification(&self, frame: &[u8]) -> Result<Vec<Observation>, ParseError> {
        let text = String::from_utf8_lossy(frame);
        match text.strip_prefix("NOTIFY POWR=") {
            Some(v) => Ok(vec![Observation::new("Power", v)]),
            None => Err(ParseError::new(text)),
        }
    }

    fn poll_command(&self, attribute: &str) -> Option<Vec<u8>> {
        match attribute {
            "Power" => Some(b"POWR?\n".to_vec()),
            "Lamp" => Some(b"LAMP?\n".to_vec()),
            _ => None,
        }
    }

    fn set_command(&self, attribute: &str, value: &Value) -> Option<Vec<u8>> {
        (attribute == "Power").then(|| format!("POWR {}\n", value).into_bytes())
    }
}

/// Start a display on a local port; returns the port and its power state
async fn simulated_display() -> (u16, Arc<Mutex<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let power = Arc::new(Mutex::new("Off".to_string()));

    let state = power.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve(stream, state.clone()));
        }
    });

    (port, power)
}

async fn serve(stream: TcpStream, power: Arc<Mutex<String>>) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    if writer.write_all(b"HELLO\n").await.is_err() {
        return;
    }

    while let Ok(Some(line)) = lines.next_line().await {
        let reply = match line.trim() {
            "POWR?" => Some(format!("POWR {}", power.lock().unwrap())),
            "LAMP?" => Some("LAMP 2000".to_string()),
            "MIXUP?" => Some("POWR On".to_string()),
            "SILENT?" => None,
            "QUIT" => return,
            "PUSH" => {
                *power.lock().unwrap() = "Standby".to_string();
                Some("NOTIFY POWR=Standby".to_string())
            }
            other => match other.strip_prefix("POWR ") {
                Some(v @ ("On" | "Off")) => {
                    *power.lock().unwrap() = v.to_string();
                    Some("OK".to_string())
                }
                Some(_) => Some("ERR invalid".to_string()),
                None => Some("ERR unknown".to_string()),
            },
        };

        if let Some(reply) = reply {
            if writer.write_all(format!("{}\n", reply).as_bytes()).await.is_err() {
                return;
            }
        }
    }
}

fn config(port: u16) -> SessionConfig {
    let mut config = SessionConfig::new("127.0.0.1", port).with_attribute("Power");
    config.request_timeout = Duration::from_millis(500);
    config.reconnect_delay = Duration::from_millis(50);
    config.reconcile = ReconcileConfig {
        poll_interval: Duration::from_secs(1),
        retry_interval: Duration::from_millis(200),
        enforcement_window: Duration::from_secs(5),
        initial_delay: Duration::from_millis(10),
    };
    config
}

async fn wait_for(events: &mut EventReceiver, mut pred: impl FnMut(&SessionEvent) -> bool) -> SessionEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("session running");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event within timeout")
}

async fn connected(events: &mut EventReceiver) {
    wait_for(events, |e| *e == SessionEvent::Connection(ConnectionState::Connected)).await;
}

#[tokio::test]
async fn desired_state_converges_on_the_device() {
    let (port, power) = simulated_display().await;
    let client = DeviceClient::spawn(config(port), LineDisplay).unwrap();
    let mut events = client.subscribe();

    assert!(client.set_desired("Power", "On").await.unwrap());
    // Repeating the action while converging changes nothing
    assert!(!client.set_desired("Power", "On").await.unwrap());

    let mut seen = Vec::new();
    wait_for(&mut events, |e| match e {
        SessionEvent::Composite { attribute, value } if attribute == "Power" => {
            seen.push(value.clone());
            value.is_settled()
        }
        _ => false,
    })
    .await;

    assert_eq!(
        seen,
        vec![
            Composite::Partially(Value::from("On")),
            Composite::Settled(Value::from("On"))
        ]
    );
    assert_eq!(*power.lock().unwrap(), "On");
    assert_eq!(client.phase("Power").await.unwrap(), Some(Phase::Idle));
    assert_eq!(
        client.composite("Power").await.unwrap(),
        Some(Composite::Settled(Value::from("On")))
    );

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn rejected_force_leaves_raw_unchanged() {
    let (port, _power) = simulated_display().await;
    let client = DeviceClient::spawn(config(port), LineDisplay).unwrap();
    let mut events = client.subscribe();
    connected(&mut events).await;

    match client.force_raw("Power", "Sideways").await {
        Err(LinkError::DeviceReported { detail }) => assert_eq!(detail, "invalid"),
        other => panic!("unexpected {:?}", other),
    }
    let power = client.composite("Power").await.unwrap();
    assert_ne!(power.as_ref().map(Composite::value), Some(&Value::from("Sideways")));

    assert_eq!(client.force_raw("Power", "On").await.unwrap(), Reply::Ack);
    wait_for(&mut events, |e| {
        *e == SessionEvent::Raw {
            attribute: "Power".to_string(),
            value: Value::from("On"),
        }
    })
    .await;

    assert!(matches!(
        client.force_raw("Input", "HDMI1").await,
        Err(LinkError::UnsupportedAttribute(_))
    ));
}

#[tokio::test]
async fn passthrough_request_updates_raw() {
    let (port, _power) = simulated_display().await;
    let client = DeviceClient::spawn(config(port), LineDisplay).unwrap();
    let mut events = client.subscribe();
    connected(&mut events).await;

    let reply = client.request(&b"LAMP?\n"[..]).await.unwrap();
    assert_eq!(reply, Reply::Observed(vec![Observation::new("Lamp", 2000i64)]));
    assert_eq!(
        client.composite("Lamp").await.unwrap(),
        Some(Composite::Settled(Value::Int(2000)))
    );
}

#[tokio::test]
async fn notifications_update_raw_without_a_request() {
    let (port, _power) = simulated_display().await;
    let client = DeviceClient::spawn(config(port), LineDisplay).unwrap();
    let mut events = client.subscribe();
    connected(&mut events).await;

    client.send(&b"PUSH\n"[..]).await.unwrap();
    wait_for(&mut events, |e| {
        *e == SessionEvent::Composite {
            attribute: "Power".to_string(),
            value: Composite::Settled(Value::from("Standby")),
        }
    })
    .await;
}

#[tokio::test]
async fn reconnects_after_the_device_hangs_up() {
    let (port, _power) = simulated_display().await;
    let client = DeviceClient::spawn(config(port), LineDisplay).unwrap();
    let mut events = client.subscribe();
    connected(&mut events).await;

    client.send(&b"QUIT\n"[..]).await.unwrap();
    wait_for(&mut events, |e| *e == SessionEvent::Connection(ConnectionState::Disconnected)).await;
    connected(&mut events).await;

    let reply = client.request(&b"POWR?\n"[..]).await.unwrap();
    assert_eq!(reply, Reply::Observed(vec![Observation::new("Power", "Off")]));
}

#[tokio::test]
async fn unanswered_request_times_out_and_drops_the_link() {
    let (port, _power) = simulated_display().await;
    let client = DeviceClient::spawn(config(port), LineDisplay).unwrap();
    let mut events = client.subscribe();
    connected(&mut events).await;

    assert!(matches!(
        client.request(&b"SILENT?\n"[..]).await,
        Err(LinkError::Timeout)
    ));
    wait_for(&mut events, |e| *e == SessionEvent::Connection(ConnectionState::TimedOut)).await;
    connected(&mut events).await;
}

#[tokio::test]
async fn mismatched_answer_is_a_desync() {
    let (port, _power) = simulated_display().await;
    let client = DeviceClient::spawn(config(port), LineDisplay).unwrap();
    let mut events = client.subscribe();
    connected(&mut events).await;

    assert!(matches!(
        client.request(&b"MIXUP?\n"[..]).await,
        Err(LinkError::ProtocolDesync(_))
    ));
    wait_for(&mut events, |e| *e == SessionEvent::Connection(ConnectionState::Disconnected)).await;
}

#[tokio::test]
async fn unreachable_device_fails_requests_and_reports_no_composite() {
    // Bind and drop to get a port nobody listens on
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let client = DeviceClient::spawn(config(port), LineDisplay).unwrap();

    assert!(matches!(
        client.request(&b"POWR?\n"[..]).await,
        Err(LinkError::ConnectionClosed)
    ));
    assert_eq!(client.composite("Power").await.unwrap(), None);
    assert_eq!(client.status().await.unwrap(), None);
}

#[tokio::test]
async fn snapshot_seeds_composites_until_observed() {
    let (port, _power) = simulated_display().await;
    let mut snapshot = avlink::CompositeSnapshot::default();
    snapshot
        .composites
        .insert("Power".to_string(), Composite::Partially(Value::from("On")));
    snapshot
        .composites
        .insert("Input".to_string(), Composite::Settled(Value::from("HDMI1")));

    let client = DeviceClient::spawn_with_snapshot(config(port), LineDisplay, snapshot).unwrap();
    let mut events = client.subscribe();
    assert_eq!(
        client.composite("Input").await.unwrap(),
        Some(Composite::Settled(Value::from("HDMI1")))
    );

    // The first poll replaces the seeded value
    wait_for(&mut events, |e| matches!(e, SessionEvent::Raw { attribute, .. } if attribute == "Power")).await;
    assert_eq!(
        client.composite("Power").await.unwrap(),
        Some(Composite::Settled(Value::from("Off")))
    );

    let saved = client.snapshot().await.unwrap();
    assert_eq!(saved.composites.len(), 2);
    assert_eq!(saved.composites["Power"], Composite::Settled(Value::from("Off")));
}

#[tokio::test]
async fn status_follows_contact_and_reported_faults() {
    let (port, _power) = simulated_display().await;
    let mut config = config(port);
    config.health.check_interval = Duration::from_millis(200);
    let client = DeviceClient::spawn(config, LineDisplay).unwrap();
    let mut events = client.subscribe();
    connected(&mut events).await;

    // The first poll after connecting counts as contact
    wait_for(&mut events, |e| *e == SessionEvent::Status(Status::ok())).await;

    client.set_fault(Some("Lamp needs replacing".to_string())).await.unwrap();
    let event = wait_for(&mut events, |e| matches!(e, SessionEvent::Status(s) if s.level != StatusLevel::Ok)).await;
    assert_eq!(event, SessionEvent::Status(Status::warning("Lamp needs replacing")));
    assert_eq!(
        client.status().await.unwrap(),
        Some(Status::warning("Lamp needs replacing"))
    );

    client.set_fault(None).await.unwrap();
    wait_for(&mut events, |e| *e == SessionEvent::Status(Status::ok())).await;
}

#[tokio::test]
async fn stopped_session_rejects_commands() {
    let (port, _power) = simulated_display().await;
    let client = DeviceClient::spawn(config(port), LineDisplay).unwrap();
    client.shutdown().await.unwrap();

    assert!(matches!(
        client.composite("Power").await,
        Err(LinkError::SessionStopped)
    ));
}

#[test]
fn invalid_config_is_rejected_before_spawning() {
    let config = SessionConfig::new("", 4352);
    assert!(matches!(
        DeviceClient::spawn(config, LineDisplay),
        Err(LinkError::InvalidConfig(_))
    ));
}
