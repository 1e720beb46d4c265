//! Drive a simulated display from a device session
//!
//! The display answers `POWR?`, takes `POWR 1` / `POWR 0`, and needs a few
//! seconds to warm up before it reports the new state, so the composite shows
//! `Partially On` for a while.
//!
//! Run with `cargo run --example simulated_display`.

use avlink::{
    combine, lamp_usage_fault, DeviceClient, DeviceProtocol, FrameKind, Framing, Observation,
    ParseError, Reply, SessionConfig, SessionEvent, Value,
};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::watch;

struct Display;

impl DeviceProtocol for Display {
    fn framing(&self) -> Framing {
        Framing::Delimited(b"\r\n".to_vec())
    }

    fn classify(&self, _frame: &[u8]) -> FrameKind {
        FrameKind::Response { token: None }
    }

    fn parse_response(&self, _request: &[u8], frame: &[u8]) -> Result<Reply, ParseError> {
        let text = String::from_utf8_lossy(frame);
        match text.as_ref() {
            "OK" => Ok(Reply::Ack),
            "POWR 1" => Ok(Reply::Observed(vec![Observation::new("Power", true)])),
            "POWR 0" => Ok(Reply::Observed(vec![Observation::new("Power", false)])),
            other => Err(ParseError::new(other)),
        }
    }

    fn parse_notification(&self, frame: &[u8]) -> Result<Vec<Observation>, ParseError> {
        Err(ParseError::new(String::from_utf8_lossy(frame)))
    }

    fn poll_command(&self, attribute: &str) -> Option<Vec<u8>> {
        (attribute == "Power").then(|| b"POWR?\r\n".to_vec())
    }

    fn set_command(&self, attribute: &str, value: &Value) -> Option<Vec<u8>> {
        match (attribute, value) {
            ("Power", Value::Bool(on)) => Some(format!("POWR {}\r\n", u8::from(*on)).into_bytes()),
            _ => None,
        }
    }
}

/// Accepts one client; power changes take effect after a warm-up period
async fn run_display(listener: TcpListener) -> std::io::Result<()> {
    let (stream, peer) = listener.accept().await?;
    tracing::info!("Display: controller connected from {}", peer);

    let (power_tx, power_rx) = watch::channel(false);
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let reply = match line.as_str() {
            "POWR?" => format!("POWR {}", u8::from(*power_rx.borrow())),
            "POWR 1" | "POWR 0" => {
                let on = line.ends_with('1');
                let tx = power_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    let _ = tx.send(on);
                });
                "OK".to_string()
            }
            _ => "ERR".to_string(),
        };
        writer.write_all(format!("{}\r\n", reply).as_bytes()).await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(async move {
        if let Err(e) = run_display(listener).await {
            tracing::error!("Display stopped: {}", e);
        }
    });

    let config = SessionConfig::from_toml_str(&format!(
        r#"
        host = "127.0.0.1"
        port = {port}

        [health]
        check_interval = 2
        poll_interval = 5

        [attributes.Power]
        retry_interval = 1
        poll_interval = 5
        "#
    ))?;

    let client = DeviceClient::spawn(config, Display)?;
    let mut events = client.subscribe();
    client.set_desired("Power", true).await?;

    let watcher = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::Composite { attribute, value } => println!("{} -> {}", attribute, value),
                SessionEvent::Status(status) => println!("status: {:?} {}", status.level, status.message),
                other => println!("{:?}", other),
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(6)).await;
    client.set_fault(lamp_usage_fault(2100, 2000)).await?;
    tokio::time::sleep(Duration::from_secs(3)).await;

    let status = client.status().await?;
    let combined = combine([("Display", status.as_ref()), ("Amplifier", None)]);
    println!("combined: {:?} {}", combined.level, combined.message);

    println!("snapshot: {}", client.snapshot().await?.to_json()?);
    client.shutdown().await?;
    watcher.abort();
    Ok(())
}
