//! Contact tracking and operator-facing status

use crate::config::secs;
use crate::types::{Status, StatusLevel};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::time::Duration;
use tokio::time::Instant;

/// Status check timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// How often status is re-derived
    #[serde(with = "secs")]
    pub check_interval: Duration,
    /// Expected interval between frames from a healthy device
    #[serde(with = "secs")]
    pub poll_interval: Duration,
    /// Extra silence tolerated on top of `poll_interval`
    #[serde(with = "secs")]
    pub grace: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(75),
            poll_interval: Duration::from_secs(75),
            grace: Duration::from_secs(15),
        }
    }
}

/// Liveness classification for one device
#[derive(Debug)]
pub struct HealthMonitor {
    config: HealthConfig,
    last_receive_at: Option<Instant>,
    last_confirmed_ok_at: Option<DateTime<Utc>>,
    fault: Option<String>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            last_receive_at: None,
            last_confirmed_ok_at: None,
            fault: None,
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Stamp the contact clock; called for every successfully parsed frame
    pub fn record_contact(&mut self, now: Instant) {
        self.last_receive_at = Some(now);
    }

    pub fn last_receive_at(&self) -> Option<Instant> {
        self.last_receive_at
    }

    /// Wall-clock time of the last check that found the device responsive
    pub fn last_confirmed_ok_at(&self) -> Option<DateTime<Utc>> {
        self.last_confirmed_ok_at
    }

    /// Device-reported problem shown as a warning while reachable
    pub fn set_fault(&mut self, fault: Option<String>) {
        self.fault = fault;
    }

    /// Derive the current status from scratch
    pub fn check<Tz>(&mut self, now: Instant, wall: DateTime<Tz>) -> Status
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        let Some(last) = self.last_receive_at else {
            return Status::critical("Always been missing");
        };

        let silence = now.saturating_duration_since(last);
        if silence > self.config.poll_interval + self.config.grace {
            return Status::critical(format!("Missing {}", format_period(silence, &wall)));
        }

        self.last_confirmed_ok_at = Some(wall.with_timezone(&Utc));
        match &self.fault {
            Some(fault) => Status::warning(fault.clone()),
            None => Status::ok(),
        }
    }
}

/// Describe how long something has been gone, relative to `now`
///
/// Short periods read as a duration, longer ones as the moment it went
/// missing: time of day within a day, date and time beyond that.
pub fn format_period<Tz>(elapsed: Duration, now: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let mins = elapsed.as_secs() / 60;
    if mins == 0 {
        return "for <1 min".to_string();
    }
    if mins == 1 {
        return "for approx. 1 min".to_string();
    }
    if mins < 60 {
        return format!("for approx. {} mins", mins);
    }

    let since = chrono::Duration::from_std(elapsed)
        .ok()
        .and_then(|d| now.clone().checked_sub_signed(d));
    let Some(since) = since else {
        return "for unknown period".to_string();
    };

    if mins < 60 * 24 {
        format!("since {}", since.format("%-I:%M:%S %p"))
    } else {
        format!("since {}", since.format("%a %-d-%b %-I:%M %p"))
    }
}

/// Warning text for consumables past their replacement threshold
pub fn lamp_usage_fault(hours: u32, threshold: u32) -> Option<String> {
    (hours > threshold).then(|| {
        format!(
            "Lamp usage is {} hours which is {} above the replacement threshold of {}. It may need replacement.",
            hours,
            hours - threshold,
            threshold
        )
    })
}

/// Fold several member statuses into one
///
/// The highest level wins. A member that has never reported counts as critical.
pub fn combine<'a, I>(members: I) -> Status
where
    I: IntoIterator<Item = (&'a str, Option<&'a Status>)>,
{
    let mut level = StatusLevel::Ok;
    let mut messages = Vec::new();

    for (name, status) in members {
        let (member_level, message) = match status {
            Some(s) => (s.level, s.message.as_str()),
            None => (StatusLevel::Critical, "Has never been seen"),
        };

        level = level.max(member_level);
        if member_level > StatusLevel::Ok {
            if message.trim().is_empty() {
                messages.push(name.to_string());
            } else {
                messages.push(format!("{}: [{}]", name, message));
            }
        }
    }

    if messages.is_empty() {
        Status::ok()
    } else {
        Status {
            level,
            message: messages.join(", "),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn afternoon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 3, 14, 0, 0).unwrap()
    }

    #[test]
    fn never_seen_is_critical() {
        let mut health = HealthMonitor::new(HealthConfig::default());
        let status = health.check(Instant::now(), afternoon());
        assert_eq!(status, Status::critical("Always been missing"));
        assert!(health.last_confirmed_ok_at().is_none());
    }

    #[test]
    fn silence_beyond_grace_reports_minutes() {
        let now = Instant::now() + Duration::from_secs(3600);
        let mut health = HealthMonitor::new(HealthConfig {
            check_interval: Duration::from_secs(75),
            poll_interval: Duration::from_secs(75),
            grace: Duration::from_secs(15),
        });
        health.record_contact(now - Duration::from_secs(200));

        let status = health.check(now, afternoon());
        assert_eq!(status.level, StatusLevel::Critical);
        assert_eq!(status.message, "Missing for approx. 3 mins");
    }

    #[test]
    fn long_silence_reports_time_of_day_then_date() {
        let now = Instant::now() + Duration::from_secs(3 * 24 * 3600);
        let mut health = HealthMonitor::new(HealthConfig::default());

        health.record_contact(now - Duration::from_secs(2 * 3600 + 5));
        let status = health.check(now, afternoon());
        assert_eq!(status.level, StatusLevel::Critical);
        assert_eq!(status.message, "Missing since 11:59:55 AM");

        health.record_contact(now - Duration::from_secs(2 * 24 * 3600));
        let status = health.check(now, afternoon());
        assert_eq!(status.message, "Missing since Sun 1-Mar 2:00 PM");
    }

    #[test]
    fn recent_contact_is_ok_and_confirms() {
        let now = Instant::now() + Duration::from_secs(600);
        let mut health = HealthMonitor::new(HealthConfig::default());
        health.record_contact(now - Duration::from_secs(80));

        assert_eq!(health.check(now, afternoon()), Status::ok());
        assert_eq!(health.last_confirmed_ok_at(), Some(afternoon()));
    }

    #[test]
    fn fault_downgrades_to_warning_only_when_reachable() {
        let now = Instant::now() + Duration::from_secs(600);
        let mut health = HealthMonitor::new(HealthConfig::default());
        health.set_fault(lamp_usage_fault(2000, 1800));
        health.record_contact(now);

        let status = health.check(now, afternoon());
        assert_eq!(status.level, StatusLevel::Warning);
        assert!(status.message.starts_with("Lamp usage is 2000 hours which is 200 above"));

        let later = now + Duration::from_secs(120);
        assert_eq!(health.check(later, afternoon()).level, StatusLevel::Critical);
    }

    #[test]
    fn period_tiers() {
        let wall = afternoon();
        assert_eq!(format_period(Duration::from_secs(30), &wall), "for <1 min");
        assert_eq!(format_period(Duration::from_secs(59 * 60), &wall), "for approx. 59 mins");
        assert_eq!(format_period(Duration::from_secs(60 * 60), &wall), "since 1:00:00 PM");
    }

    #[test]
    fn combined_status_takes_worst_member() {
        let projector = Status::warning("Lamp");
        let display = Status::ok();
        let combined = combine([
            ("Projector", Some(&projector)),
            ("Display", Some(&display)),
            ("Amp", None),
        ]);
        assert_eq!(combined.level, StatusLevel::Critical);
        assert_eq!(combined.message, "Projector: [Lamp], Amp: [Has never been seen]");

        assert_eq!(combine([("Display", Some(&display))]), Status::ok());
    }
}
