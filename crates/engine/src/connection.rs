use std::time::Duration;

use serde::Serialize;

/// Link state of a streaming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Connected but silent past the heartbeat timeout.
    Degraded,
}

/// Inputs that move a [`ConnectionState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Dial,
    Established,
    HeartbeatMissed,
    Lost,
}

impl ConnectionState {
    /// Apply `event`. Events that make no sense in the current state leave
    /// it unchanged.
    pub fn on(self, event: ConnectionEvent) -> Self {
        use ConnectionEvent::*;
        use ConnectionState::*;
        match (self, event) {
            (Disconnected, Dial) => Connecting,
            (Connecting, Established) => Connected,
            (Connected, HeartbeatMissed) => Degraded,
            (Connecting | Connected | Degraded, Lost) => Disconnected,
            (state, _) => state,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Degraded => write!(f, "degraded"),
        }
    }
}

/// Exponential backoff: starts at `initial`, doubles per failure, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; the following call returns double, up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_and_degradation() {
        let s = ConnectionState::default();
        let s = s.on(ConnectionEvent::Dial);
        assert_eq!(s, ConnectionState::Connecting);
        let s = s.on(ConnectionEvent::Established);
        assert_eq!(s, ConnectionState::Connected);
        let s = s.on(ConnectionEvent::HeartbeatMissed);
        assert_eq!(s, ConnectionState::Degraded);
        assert_eq!(s.on(ConnectionEvent::Lost), ConnectionState::Disconnected);
    }

    #[test]
    fn nonsense_events_are_ignored() {
        assert_eq!(
            ConnectionState::Disconnected.on(ConnectionEvent::Established),
            ConnectionState::Disconnected
        );
        assert_eq!(
            ConnectionState::Connecting.on(ConnectionEvent::HeartbeatMissed),
            ConnectionState::Connecting
        );
        assert_eq!(
            ConnectionState::Connected.on(ConnectionEvent::Dial),
            ConnectionState::Connected
        );
    }

    #[test]
    fn backoff_doubles_to_cap_and_resets() {
        let mut b = Backoff::default();
        let delays: Vec<u64> = (0..8).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_secs(1));
    }
}
