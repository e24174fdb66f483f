//! Connection state machine, broker failover list, timings, and the
//! exponential-backoff reconnect schedule (§3, §4.1).

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use pcp_protocol::constants::{
    DEFAULT_BACKOFF_JITTER_MS, DEFAULT_BACKOFF_MULTIPLIER_MAX, DEFAULT_BACKOFF_MULTIPLIER_MIN,
    DEFAULT_INITIAL_BACKOFF_MS, DEFAULT_MAX_BACKOFF_MS,
};

/// Connection lifecycle states (§4.1). Transitions are driven by
/// `Connection::connect` and the read pump's close/fail handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Initialized,
    Connecting,
    Open,
    Closing,
    Closed,
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Initialized
    }
}

/// An ordered, non-empty list of broker WebSocket URIs with a failover
/// cursor. The cursor advances on a failed connect attempt and on the
/// first reconnect after a previously successful session (§3, §4.1).
#[derive(Debug)]
pub struct BrokerList {
    uris: Vec<String>,
    cursor: AtomicU32,
}

impl BrokerList {
    /// Panics if `uris` is empty: a `BrokerList` is only ever constructed
    /// from validated `ClientIdentity` configuration, never from untrusted
    /// input, so an empty list is a caller bug rather than a runtime error.
    pub fn new(uris: Vec<String>) -> Self {
        assert!(!uris.is_empty(), "BrokerList must not be empty");
        Self {
            uris,
            cursor: AtomicU32::new(0),
        }
    }

    pub fn current(&self) -> &str {
        let idx = self.cursor.load(Ordering::SeqCst) as usize % self.uris.len();
        &self.uris[idx]
    }

    /// Advances the failover cursor to the next broker.
    pub fn advance(&self) {
        self.cursor.fetch_add(1, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.uris.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Monotonic timing marks for one `connect` attempt (§3). All fields are
/// reset at the start of each attempt.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTimings {
    pub start: Option<std::time::Instant>,
    pub tcp_pre_init: Option<std::time::Instant>,
    pub tcp_post_init: Option<std::time::Instant>,
    pub open: Option<std::time::Instant>,
    pub closing_handshake: Option<std::time::Instant>,
    pub close: Option<std::time::Instant>,
    pub connection_started: bool,
    pub connection_failed: bool,
}

impl ConnectionTimings {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Monotonic timing marks for one Session Association attempt (v1 only,
/// §3). Reset before each associate-request is sent.
#[derive(Debug, Clone, Default)]
pub struct AssociationTimings {
    pub start: Option<std::time::Instant>,
    pub association: Option<std::time::Instant>,
    pub close: Option<std::time::Instant>,
    pub completed: bool,
    pub success: bool,
    pub closed: bool,
}

impl AssociationTimings {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Exponential backoff schedule for reconnect attempts (§4.1): starts at
/// `initial_backoff_ms`, multiplied by a jittered factor in
/// `[multiplier_min, multiplier_max)` per failure, capped at
/// `max_backoff_ms`; the sleep itself is additionally jittered by
/// `±jitter_ms`. Resets to `initial_backoff_ms` on a successful connect.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier_min: f64,
    pub multiplier_max: f64,
    pub jitter_ms: i64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            multiplier_min: DEFAULT_BACKOFF_MULTIPLIER_MIN,
            multiplier_max: DEFAULT_BACKOFF_MULTIPLIER_MAX,
            jitter_ms: DEFAULT_BACKOFF_JITTER_MS,
        }
    }
}

impl ReconnectConfig {
    /// The backoff value *before* jitter for the given failure count (0 =
    /// first failure), following the multiply-then-cap rule. `rand_unit` is
    /// a caller-supplied value in `[0, 1)` used to pick the multiplier,
    /// decoupling the schedule from any particular RNG source (and making
    /// it trivial to test deterministically).
    pub fn backoff_for_attempt(&self, attempt: u32, rand_unit: f64) -> u64 {
        let mut backoff = self.initial_backoff_ms as f64;
        for _ in 0..attempt {
            let multiplier =
                self.multiplier_min + rand_unit * (self.multiplier_max - self.multiplier_min);
            backoff = (backoff * multiplier).min(self.max_backoff_ms as f64);
        }
        backoff as u64
    }

    /// Applies the `±jitter_ms` sleep jitter on top of a base backoff,
    /// clamped to never go negative. `rand_unit` is in `[0, 1)`, mapped onto
    /// `[-jitter_ms, jitter_ms)`.
    pub fn jittered_sleep(&self, base_ms: u64, rand_unit: f64) -> Duration {
        let jitter = (rand_unit * (2.0 * self.jitter_ms as f64)) as i64 - self.jitter_ms;
        let total = (base_ms as i64 + jitter).max(0);
        Duration::from_millis(total as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_list_cursor_wraps() {
        let list = BrokerList::new(vec!["wss://a".into(), "wss://b".into()]);
        assert_eq!(list.current(), "wss://a");
        list.advance();
        assert_eq!(list.current(), "wss://b");
        list.advance();
        assert_eq!(list.current(), "wss://a");
    }

    #[test]
    #[should_panic]
    fn broker_list_rejects_empty() {
        BrokerList::new(vec![]);
    }

    #[test]
    fn backoff_starts_at_initial_value() {
        let cfg = ReconnectConfig::default();
        assert_eq!(cfg.backoff_for_attempt(0, 0.0), cfg.initial_backoff_ms);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let cfg = ReconnectConfig::default();
        // rand_unit = 1.0 selects the maximum multiplier each time.
        let grown = cfg.backoff_for_attempt(1, 1.0);
        assert!(grown > cfg.initial_backoff_ms);
        let many = cfg.backoff_for_attempt(20, 1.0);
        assert_eq!(many, cfg.max_backoff_ms);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let cfg = ReconnectConfig::default();
        let low = cfg.jittered_sleep(10_000, 0.0).as_millis() as i64;
        let high = cfg.jittered_sleep(10_000, 0.999).as_millis() as i64;
        assert!(low >= 10_000 - cfg.jitter_ms);
        assert!(high <= 10_000 + cfg.jitter_ms);
    }

    #[test]
    fn jitter_never_goes_negative() {
        let cfg = ReconnectConfig::default();
        let sleep = cfg.jittered_sleep(100, 0.0);
        assert!(sleep.as_millis() >= 0);
    }
}
