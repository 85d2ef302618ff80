//! Keepalive timer.

use std::time::{Duration, Instant};

/// Idle time before a ping is sent.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Time allowed for the pong.
pub const PONG_TIMEOUT: Duration = Duration::from_secs(5);

/// What the connection loop should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// Peer has been quiet; send a ping.
    Idle,
    /// Ping went unanswered; close the connection.
    Timeout,
}

/// Tracks inbound activity for one connection.
#[derive(Debug)]
pub struct PeerTimer {
    idle_timeout: Duration,
    pong_timeout: Duration,
    last_activity: Instant,
    ping_sent: Option<Instant>,
}

impl PeerTimer {
    pub fn new() -> Self {
        Self::with_timeouts(IDLE_TIMEOUT, PONG_TIMEOUT)
    }

    pub fn with_timeouts(idle_timeout: Duration, pong_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            pong_timeout,
            last_activity: Instant::now(),
            ping_sent: None,
        }
    }

    /// Call on every inbound message.
    pub fn restart(&mut self) {
        self.last_activity = Instant::now();
        self.ping_sent = None;
    }

    /// Poll the timer. `Idle` is returned once per quiet period.
    pub fn check(&mut self, now: Instant) -> Option<TimerEvent> {
        match self.ping_sent {
            Some(sent) if now.duration_since(sent) >= self.pong_timeout => Some(TimerEvent::Timeout),
            Some(_) => None,
            None if now.duration_since(self.last_activity) >= self.idle_timeout => {
                self.ping_sent = Some(now);
                Some(TimerEvent::Idle)
            }
            None => None,
        }
    }
}

impl Default for PeerTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quiet_connection_pings_then_times_out() {
        let mut timer = PeerTimer::new();
        let start = Instant::now();

        assert_eq!(timer.check(start + Duration::from_secs(30)), None);
        assert_eq!(timer.check(start + IDLE_TIMEOUT), Some(TimerEvent::Idle));
        assert_eq!(timer.check(start + IDLE_TIMEOUT + Duration::from_secs(1)), None);
        assert_eq!(
            timer.check(start + IDLE_TIMEOUT + PONG_TIMEOUT),
            Some(TimerEvent::Timeout)
        );
    }

    #[test]
    fn test_restart_clears_pending_ping() {
        let mut timer = PeerTimer::with_timeouts(Duration::from_secs(1), Duration::from_secs(1));
        let later = Instant::now() + Duration::from_secs(2);
        assert_eq!(timer.check(later), Some(TimerEvent::Idle));

        timer.restart();
        assert_eq!(timer.check(Instant::now()), None);
    }
}
