use std::time::{Duration, Instant};

/// initial retransmission timeout.
pub const RTO: Duration = Duration::from_millis(500);

/// total transmissions per transaction (Rc).
pub const MAX_TRANSMITS: u32 = 7;

/// multiplier for the wait after the final transmission (Rm).
const FINAL_WAIT: u32 = 16;

/// an in-flight STUN request.
///
/// the schedule doubles the interval on every retransmission and, after
/// the seventh transmission, waits Rm times the RTO before declaring
/// the transaction dead: 500 + 1000 + ... + 16000 + 8000 ms, a
/// cumulative 39.5 times the RTO.
#[derive(Debug, Clone)]
pub struct Transaction {
    /// 96-bit cryptographically random transaction id.
    pub token: [u8; 12],
    /// when the next retransmission (or the failure) is due.
    pub deadline: Instant,
    /// time of the most recent transmission, for RTT sampling.
    pub sent_at: Instant,
    interval: Duration,
    transmits: u32,
}

impl Transaction {
    pub fn new(now: Instant) -> Self {
        Self {
            token: rand::random(),
            deadline: now + RTO,
            sent_at: now,
            interval: RTO,
            transmits: 1,
        }
    }

    /// advance the schedule at a deadline.
    ///
    /// returns true when the request should be retransmitted, false
    /// when the transaction has exhausted its schedule.
    pub fn on_timeout(&mut self, now: Instant) -> bool {
        if self.transmits >= MAX_TRANSMITS {
            return false;
        }

        self.transmits += 1;
        self.sent_at = now;
        if self.transmits == MAX_TRANSMITS {
            self.deadline = now + RTO * FINAL_WAIT;
        } else {
            self.interval *= 2;
            self.deadline = now + self.interval;
        }

        true
    }
}
