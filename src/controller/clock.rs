//! Time source for duration and timestamp logic
//!
//! `SystemClock` in production; tests inject a `ManualClock` and move it
//! forward explicitly.

use chrono::{DateTime, SecondsFormat, Utc};

/// RFC3339 status timestamp, second precision with a `Z` suffix
pub fn status_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Current time as an RFC3339 status timestamp
    fn now_rfc3339(&self) -> String {
        status_timestamp(self.now())
    }
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[cfg(test)]
pub struct ManualClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

#[cfg(test)]
#[allow(clippy::expect_used)]
impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Mutex::new(now),
        }
    }

    /// A clock at 2024-01-01T00:00:00Z
    pub fn fixed() -> Self {
        Self::new(
            DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
                .expect("valid timestamp")
                .with_timezone(&Utc),
        )
    }

    pub fn advance(&self, duration: chrono::Duration) {
        *self.now.lock().expect("clock lock poisoned") += duration;
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock poisoned")
    }
}
