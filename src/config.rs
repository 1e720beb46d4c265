use crate::error::{LinkError, Result};
use crate::framing::DEFAULT_MAX_FRAME_LEN;
use crate::health::HealthConfig;
use crate::reconcile::ReconcileConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Socket type used to reach the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Tcp,
    Udp,
}

/// Everything a device session needs, normally supplied by the host
///
/// Durations are written in (fractional) seconds:
///
/// ```toml
/// host = "10.0.0.20"
/// port = 20060
/// request_timeout = 5
///
/// [reconcile]
/// enforcement_window = 90
///
/// [attributes.Power]
/// retry_interval = 16
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub transport: TransportKind,
    #[serde(with = "secs")]
    pub connect_timeout: Duration,
    #[serde(with = "secs")]
    pub request_timeout: Duration,
    #[serde(with = "secs")]
    pub write_timeout: Duration,
    /// First reconnect delay, doubled after each failure
    #[serde(with = "secs")]
    pub reconnect_delay: Duration,
    #[serde(with = "secs")]
    pub max_reconnect_delay: Duration,
    pub max_queued_requests: usize,
    /// More than one only for protocols carrying correlation tokens
    pub max_in_flight: usize,
    pub max_frame_len: usize,
    pub health: HealthConfig,
    /// Defaults for every reconciled attribute
    pub reconcile: ReconcileConfig,
    /// Attributes to reconcile, with optional timing overrides
    pub attributes: BTreeMap<String, AttributeConfig>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 0,
            transport: TransportKind::Tcp,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
            max_queued_requests: 32,
            max_in_flight: 1,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            health: HealthConfig::default(),
            reconcile: ReconcileConfig::default(),
            attributes: BTreeMap::new(),
        }
    }
}

/// Per-attribute overrides of [`ReconcileConfig`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributeConfig {
    #[serde(with = "opt_secs", skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<Duration>,
    #[serde(with = "opt_secs", skip_serializing_if = "Option::is_none")]
    pub retry_interval: Option<Duration>,
    #[serde(with = "opt_secs", skip_serializing_if = "Option::is_none")]
    pub enforcement_window: Option<Duration>,
    #[serde(with = "opt_secs", skip_serializing_if = "Option::is_none")]
    pub initial_delay: Option<Duration>,
}

impl SessionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Reconcile `attribute` using the session defaults
    pub fn with_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.attributes.insert(attribute.into(), AttributeConfig::default());
        self
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// `host:port` as used for connecting
    pub fn destination(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Effective reconciliation timing for `attribute`
    pub fn reconcile_for(&self, attribute: &str) -> ReconcileConfig {
        let base = self.reconcile.clone();
        match self.attributes.get(attribute) {
            None => base,
            Some(o) => ReconcileConfig {
                poll_interval: o.poll_interval.unwrap_or(base.poll_interval),
                retry_interval: o.retry_interval.unwrap_or(base.retry_interval),
                enforcement_window: o.enforcement_window.unwrap_or(base.enforcement_window),
                initial_delay: o.initial_delay.unwrap_or(base.initial_delay),
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(LinkError::InvalidConfig("host is empty".to_string()));
        }
        if self.port == 0 {
            return Err(LinkError::InvalidConfig("port is 0".to_string()));
        }
        if self.max_queued_requests == 0 || self.max_in_flight == 0 {
            return Err(LinkError::InvalidConfig(
                "request queue and in-flight limits must be at least 1".to_string(),
            ));
        }
        if self.max_frame_len == 0 {
            return Err(LinkError::InvalidConfig("max_frame_len is 0".to_string()));
        }

        let intervals = [
            ("connect_timeout", self.connect_timeout),
            ("request_timeout", self.request_timeout),
            ("write_timeout", self.write_timeout),
            ("reconnect_delay", self.reconnect_delay),
            ("health.check_interval", self.health.check_interval),
            ("health.poll_interval", self.health.poll_interval),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(LinkError::InvalidConfig(format!("{} must be positive", name)));
            }
        }
        if self.max_reconnect_delay < self.reconnect_delay {
            return Err(LinkError::InvalidConfig(
                "max_reconnect_delay is shorter than reconnect_delay".to_string(),
            ));
        }

        for attribute in std::iter::once(None).chain(self.attributes.keys().map(Some)) {
            let rc = match attribute {
                Some(a) => self.reconcile_for(a),
                None => self.reconcile.clone(),
            };
            if rc.poll_interval.is_zero() || rc.retry_interval.is_zero() {
                return Err(LinkError::InvalidConfig(format!(
                    "{}: poll and retry intervals must be positive",
                    attribute.map(String::as_str).unwrap_or("reconcile")
                )));
            }
        }

        Ok(())
    }
}

/// Serde helpers for durations written as seconds
pub(crate) mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let v = f64::deserialize(d)?;
        Duration::try_from_secs_f64(v).map_err(serde::de::Error::custom)
    }
}

pub(crate) mod opt_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        match Option::<f64>::deserialize(d)? {
            Some(v) => Duration::try_from_secs_f64(v)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = SessionConfig::from_toml_str("host = \"10.0.0.5\"\nport = 4352\n").unwrap();
        assert_eq!(config.destination(), "10.0.0.5:4352");
        assert_eq!(config.transport, TransportKind::Tcp);
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.health.grace, Duration::from_secs(15));
        assert_eq!(config.reconcile_for("Power"), ReconcileConfig::default());
    }

    #[test]
    fn attribute_overrides_merge_with_defaults() {
        let text = r#"
            host = "display.local"
            port = 20060
            transport = "udp"
            request_timeout = 2.5

            [reconcile]
            enforcement_window = 90

            [attributes.Power]
            retry_interval = 16
            enforcement_window = 180

            [attributes.Input]
        "#;
        let config = SessionConfig::from_toml_str(text).unwrap();
        assert_eq!(config.transport, TransportKind::Udp);
        assert_eq!(config.request_timeout, Duration::from_millis(2500));

        let power = config.reconcile_for("Power");
        assert_eq!(power.retry_interval, Duration::from_secs(16));
        assert_eq!(power.enforcement_window, Duration::from_secs(180));
        assert_eq!(power.poll_interval, Duration::from_secs(60));

        let input = config.reconcile_for("Input");
        assert_eq!(input.enforcement_window, Duration::from_secs(90));
        assert_eq!(input.retry_interval, Duration::from_secs(5));
    }

    #[test]
    fn invalid_configs_are_rejected() {
        assert!(matches!(
            SessionConfig::from_toml_str("port = 1"),
            Err(LinkError::InvalidConfig(_))
        ));
        assert!(matches!(
            SessionConfig::from_toml_str("host = \"a\"\nport = 1\n[attributes.Power]\nretry_interval = 0"),
            Err(LinkError::InvalidConfig(_))
        ));
        for zero in ["reconnect_delay", "connect_timeout", "write_timeout"] {
            let text = format!("host = \"a\"\nport = 1\n{} = 0", zero);
            assert!(
                matches!(SessionConfig::from_toml_str(&text), Err(LinkError::InvalidConfig(_))),
                "{} = 0 accepted",
                zero
            );
        }
        assert!(matches!(
            SessionConfig::from_toml_str("host = \"a\"\nport = 1\nreconnect_delay = 30\nmax_reconnect_delay = 5"),
            Err(LinkError::InvalidConfig(_))
        ));
        assert!(matches!(
            SessionConfig::from_toml_str("host = \"a\"\nport = \"x\""),
            Err(LinkError::Config(_))
        ));
    }
}
