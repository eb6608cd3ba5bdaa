use std::fmt;
use std::time;

use chrono::{DateTime, Duration, Utc};
use tokio::time::{interval, Interval, MissedTickBehavior};

use super::SessionError;
use crate::utils::format_elapsed_time;

// How often deadlines are checked
const CHECK_INTERVAL_MS: u64 = 100;

/// Keepalive and hold deadlines for one connection
///
/// A negotiated hold time of 0 disables both (RFC 4271 [4.2]).
#[derive(Debug)]
pub struct HoldTimer {
    hold_time: u16,
    keepalive_interval: u16,
    check: Interval,
    last_sent: DateTime<Utc>,
    last_received: DateTime<Utc>,
}

impl HoldTimer {
    pub fn new(hold_time: u16) -> Self {
        let mut check = interval(time::Duration::from_millis(CHECK_INTERVAL_MS));
        check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let now = Utc::now();
        Self {
            hold_time,
            keepalive_interval: if hold_time == 0 { 0 } else { (hold_time / 3).max(1) },
            check,
            last_sent: now,
            last_received: now,
        }
    }

    pub fn hold_time(&self) -> u16 {
        self.hold_time
    }

    pub fn keepalive_interval(&self) -> u16 {
        self.keepalive_interval
    }

    pub fn last_sent(&self) -> DateTime<Utc> {
        self.last_sent
    }

    pub fn last_received(&self) -> DateTime<Utc> {
        self.last_received
    }

    pub fn received(&mut self) {
        self.last_received = Utc::now();
    }

    pub fn sent(&mut self) {
        self.last_sent = Utc::now();
    }

    /// Wait for the next deadline check. Ok(true) means a KEEPALIVE is due,
    /// an error means nothing was heard from the peer for the whole hold time.
    pub async fn keepalive_due(&mut self) -> Result<bool, SessionError> {
        self.check.tick().await;
        if self.hold_time == 0 {
            return Ok(false);
        }
        let now = Utc::now();
        if self.remaining(now) <= Duration::zero() {
            return Err(SessionError::HoldTimeExpired(self.hold_time));
        }
        let since_sent = now.signed_duration_since(self.last_sent);
        Ok(since_sent >= Duration::seconds(self.keepalive_interval.into()))
    }

    // Time left before the peer is considered dead
    fn remaining(&self, now: DateTime<Utc>) -> Duration {
        let deadline = self.last_received + Duration::seconds(self.hold_time.into());
        deadline.signed_duration_since(now)
    }
}

impl fmt::Display for HoldTimer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.hold_time == 0 {
            return write!(f, "disabled");
        }
        let remaining = self.remaining(Utc::now()).max(Duration::zero());
        write!(f, "{} ({})", self.hold_time, format_elapsed_time(remaining))
    }
}
