//! Robot/host clock synchronisation.
//!
//! One four-timestamp exchange suffices: the host stamps the request
//! (`originate`) and the reply arrival (`destination`), the robot stamps
//! reception (`receive`) and reply emission (`transmit`) on its own
//! millisecond clock. The companion reissues exchanges periodically; there
//! is no retry protocol.

use serde::{Deserialize, Serialize};
use tracing::trace;

/// Offset estimate between the robot clock and the host clock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockSync {
    offset: i64,
    latency: i64,
    receive: i64,
}

impl ClockSync {
    /// Estimate from one exchange. All timestamps in milliseconds;
    /// `originate`/`destination` on the host clock, `receive`/`transmit`
    /// on the robot clock.
    pub fn estimate(originate: i64, receive: i64, transmit: i64, destination: i64) -> Self {
        let latency = (destination - originate + 1) / 2;
        let offset = originate + latency - receive;
        let processing = transmit - receive;
        trace!(latency, offset, processing, "clock exchange");
        Self {
            offset,
            latency,
            receive,
        }
    }

    /// Rebuild an estimate from persisted parts.
    pub fn from_parts(offset: i64, latency: i64, receive: i64) -> Self {
        Self {
            offset,
            latency,
            receive,
        }
    }

    /// One-way latency estimate in milliseconds.
    pub fn latency(&self) -> i64 {
        self.latency
    }

    /// Robot-to-host clock offset in milliseconds.
    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// The robot-clock reception timestamp of the exchange.
    pub fn receive_timestamp(&self) -> i64 {
        self.receive
    }

    /// Map a robot-clock timestamp to the host clock.
    pub fn from_remote(&self, t: i64) -> i64 {
        t + self.offset
    }

    /// Map a host-clock timestamp to the robot clock.
    pub fn to_remote(&self, t: i64) -> i64 {
        t - self.offset
    }
}
