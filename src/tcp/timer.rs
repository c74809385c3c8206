use std::time::Duration;

/// A one-shot countdown driven by [`Timer::advance`]. Time only passes when
/// the owner says so, which keeps the state machine deterministic under test.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Timer {
    remaining: Option<Duration>,
}

impl Timer {
    /// Starts the countdown, replacing any running one.
    pub fn arm(&mut self, after: Duration) {
        self.remaining = Some(after);
    }

    /// Stops the countdown. Returns whether it was running.
    pub fn cancel(&mut self) -> bool {
        self.remaining.take().is_some()
    }

    pub fn is_active(&self) -> bool {
        self.remaining.is_some()
    }

    /// Lets `elapsed` pass. Returns true exactly once, when the countdown
    /// reaches zero.
    pub fn advance(&mut self, elapsed: Duration) -> bool {
        match self.remaining {
            Some(remaining) if remaining <= elapsed => {
                self.remaining = None;
                true
            }
            Some(remaining) => {
                self.remaining = Some(remaining - elapsed);
                false
            }
            None => false,
        }
    }
}

/// The timers each connection owns.
#[derive(Debug, Default, Clone, Copy)]
pub struct Timers {
    /// Resends unacknowledged data.
    pub retransmit: Timer,
    /// Probes a peer that advertised a zero window.
    pub persist: Timer,
    /// Bounds how long an acknowledgment is held back.
    pub delayed_ack: Timer,
    /// Reclaims the connection after TIME_WAIT or a deferred free.
    pub time_wait: Timer,
}

impl Timers {
    /// Stops the timers that only matter while the connection is open.
    pub fn cancel_transfer(&mut self) {
        self.retransmit.cancel();
        self.persist.cancel();
        self.delayed_ack.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_once() {
        let mut timer = Timer::default();
        assert!(!timer.advance(Duration::from_secs(10)));

        timer.arm(Duration::from_millis(100));
        assert!(timer.is_active());
        assert!(!timer.advance(Duration::from_millis(60)));
        assert!(timer.advance(Duration::from_millis(60)));
        assert!(!timer.is_active());
        assert!(!timer.advance(Duration::from_millis(60)));
    }

    #[test]
    fn cancel_reports_activity() {
        let mut timer = Timer::default();
        assert!(!timer.cancel());
        timer.arm(Duration::from_secs(1));
        assert!(timer.cancel());
        assert!(!timer.advance(Duration::from_secs(2)));
    }
}
