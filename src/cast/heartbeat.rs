//! Liveness policy for the receive loop.
//!
//! The receiver pings roughly every five seconds. Silence longer than the ping
//! budget triggers a probe; probes that go unanswered exhaust the retry budget
//! and declare the connection dead. Any inbound traffic counts as proof of
//! life, regardless of channel.

use std::time::Duration;

use crate::config::CastConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send a PING and a receiver status query, then keep waiting.
    SendProbe,
    Dead,
}

#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    ping_wait: Duration,
    pong_wait: Duration,
    pong_retries: u8,
    expecting_pong: bool,
    retries_left: u8,
}

impl HeartbeatMonitor {
    pub fn new(config: &CastConfig) -> Self {
        Self::with_timings(config.ping_wait(), config.pong_wait(), config.pong_retries)
    }

    pub fn with_timings(ping_wait: Duration, pong_wait: Duration, pong_retries: u8) -> Self {
        Self {
            ping_wait,
            pong_wait,
            pong_retries,
            expecting_pong: false,
            retries_left: pong_retries,
        }
    }

    /// How long the next receive may block.
    pub fn wait_budget(&self) -> Duration {
        if self.expecting_pong {
            self.pong_wait
        } else {
            self.ping_wait
        }
    }

    pub fn is_expecting_pong(&self) -> bool {
        self.expecting_pong
    }

    pub fn retries_left(&self) -> u8 {
        self.retries_left
    }

    pub fn on_traffic(&mut self) {
        self.expecting_pong = false;
        self.retries_left = self.pong_retries;
    }

    pub fn on_timeout(&mut self) -> HeartbeatAction {
        if !self.expecting_pong {
            self.expecting_pong = true;
            self.retries_left = self.pong_retries;
            return HeartbeatAction::SendProbe;
        }
        self.retries_left = self.retries_left.saturating_sub(1);
        if self.retries_left == 0 {
            HeartbeatAction::Dead
        } else {
            HeartbeatAction::SendProbe
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{HeartbeatAction, HeartbeatMonitor};
    use crate::config::CastConfig;

    #[test]
    fn test_defaults_wait_for_ping_first() {
        let monitor = HeartbeatMonitor::new(&CastConfig::default());
        assert!(!monitor.is_expecting_pong());
        assert_eq!(monitor.wait_budget(), Duration::from_millis(6_000));
    }

    #[test]
    fn test_silence_escalates_to_dead_after_two_missed_pongs() {
        let mut monitor = HeartbeatMonitor::new(&CastConfig::default());

        assert_eq!(monitor.on_timeout(), HeartbeatAction::SendProbe);
        assert!(monitor.is_expecting_pong());
        assert_eq!(monitor.wait_budget(), Duration::from_millis(500));
        assert_eq!(monitor.retries_left(), 2);

        assert_eq!(monitor.on_timeout(), HeartbeatAction::SendProbe);
        assert_eq!(monitor.retries_left(), 1);
        assert_eq!(monitor.on_timeout(), HeartbeatAction::Dead);
    }

    #[test]
    fn test_traffic_restores_full_budget() {
        let mut monitor = HeartbeatMonitor::new(&CastConfig::default());
        monitor.on_timeout();
        monitor.on_timeout();
        monitor.on_traffic();

        assert!(!monitor.is_expecting_pong());
        assert_eq!(monitor.retries_left(), 2);
        assert_eq!(monitor.wait_budget(), Duration::from_millis(6_000));
    }

    #[test]
    fn test_exhausted_budget_dies_within_one_cycle() {
        let mut monitor =
            HeartbeatMonitor::with_timings(Duration::from_secs(6), Duration::from_millis(500), 0);
        assert_eq!(monitor.on_timeout(), HeartbeatAction::SendProbe);
        assert_eq!(monitor.retries_left(), 0);
        assert_eq!(monitor.on_timeout(), HeartbeatAction::Dead);
    }
}
