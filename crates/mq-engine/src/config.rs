//! Broker engine configuration.

use std::time::Duration;

/// Tunables for one broker engine.
///
/// Out-of-range values are clamped back to their defaults by
/// [`clean`](Config::clean), which the engine applies on construction, so a
/// hand-built config can never produce an unbounded slot table or ring.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP bind host.
    pub host: String,
    /// TCP bind port.
    pub port: u16,
    /// Slots per role table; total open registrations ≤ 2 × this.
    pub max_open_conn: usize,
    /// Per-topic retained-history ring size.
    pub buffer_size: usize,
    /// A slot whose last heartbeat is older than this is evicted.
    pub heartbeat_timeout: Duration,
    /// A connection that has not registered within this window is closed.
    pub register_timeout: Duration,
    /// Send cadence hint returned to producers at register time.
    pub producer_send_interval: Duration,
    /// Shared auth token; empty disables auth and register-body encryption.
    pub token: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "0.0.0.0".to_owned(),
            port: 7270,
            max_open_conn: 50,
            buffer_size: 100,
            heartbeat_timeout: Duration::from_secs(60),
            register_timeout: Duration::from_secs(10),
            producer_send_interval: Duration::from_millis(500),
            token: String::new(),
        }
    }
}

impl Config {
    /// Clamp out-of-range values to their defaults.
    pub fn clean(mut self) -> Self {
        if self.max_open_conn == 0 || self.max_open_conn > 100 {
            self.max_open_conn = 50;
        }
        if self.buffer_size == 0 || self.buffer_size > 5000 {
            self.buffer_size = 100;
        }
        if self.heartbeat_timeout.is_zero() {
            self.heartbeat_timeout = Duration::from_secs(60);
        }
        if self.register_timeout.is_zero() {
            self.register_timeout = Duration::from_secs(10);
        }
        if self.producer_send_interval.is_zero() {
            self.producer_send_interval = Duration::from_millis(500);
        }
        self
    }

    /// Legacy alias for sizing the per-topic retained history.
    ///
    /// Values outside `[1, 10000)` are ignored.
    pub fn set_topic_history_buffer_size(&mut self, size: usize) {
        if (1..10_000).contains(&size) {
            self.buffer_size = size;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_clamps_out_of_range_values() {
        let conf = Config {
            max_open_conn: 5000,
            buffer_size: 0,
            ..Config::default()
        }
        .clean();
        assert_eq!(conf.max_open_conn, 50);
        assert_eq!(conf.buffer_size, 100);
    }

    #[test]
    fn clean_keeps_valid_values() {
        let conf = Config {
            max_open_conn: 4,
            buffer_size: 8,
            ..Config::default()
        }
        .clean();
        assert_eq!(conf.max_open_conn, 4);
        assert_eq!(conf.buffer_size, 8);
    }

    #[test]
    fn legacy_history_setter_validates_range() {
        let mut conf = Config::default();
        conf.set_topic_history_buffer_size(250);
        assert_eq!(conf.buffer_size, 250);
        conf.set_topic_history_buffer_size(10_000);
        assert_eq!(conf.buffer_size, 250);
        conf.set_topic_history_buffer_size(0);
        assert_eq!(conf.buffer_size, 250);
    }
}
