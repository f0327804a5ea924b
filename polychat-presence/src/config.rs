//! Tunables for the presence hub and its entry point.
//!
//! Defaults mirror the deployed service: 256-slot outbound queues,
//! 512-byte frames, a 60s read-inactivity deadline with probes every 54s,
//! and a 10s write deadline.

use std::str::FromStr;
use std::time::Duration;

use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

use crate::error::HubError;

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Address the entry point binds to
    pub bind_addr: String,
    /// HTTP path that accepts WebSocket upgrades
    pub ws_path: String,
    /// Outbound queue slots per connection
    pub queue_capacity: usize,
    /// Largest inbound application frame, in bytes
    pub max_frame_size: usize,
    /// Rolling read-inactivity deadline
    pub pong_wait: Duration,
    /// Deadline for a single transport write
    pub write_wait: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            ws_path: "/ws".to_string(),
            queue_capacity: 256,
            max_frame_size: 512,
            pong_wait: Duration::from_secs(60),
            write_wait: Duration::from_secs(10),
        }
    }
}

impl HubConfig {
    /// Heartbeat interval: 9/10 of the read deadline.
    pub fn ping_period(&self) -> Duration {
        self.pong_wait * 9 / 10
    }

    /// Transport settings that make the WebSocket layer itself refuse
    /// messages over `max_frame_size` before buffering them.
    pub fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig::default()
            .max_message_size(Some(self.max_frame_size))
            .max_frame_size(Some(self.max_frame_size))
    }

    /// Build a config from `PRESENCE_*` environment variables, falling back
    /// to the defaults for anything unset.
    pub fn from_env() -> Result<Self, HubError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, HubError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("PRESENCE_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(path) = lookup("PRESENCE_WS_PATH") {
            config.ws_path = path;
        }
        if let Some(raw) = lookup("PRESENCE_QUEUE_CAPACITY") {
            config.queue_capacity = parse_var("PRESENCE_QUEUE_CAPACITY", &raw)?;
        }
        if let Some(raw) = lookup("PRESENCE_MAX_FRAME_SIZE") {
            config.max_frame_size = parse_var("PRESENCE_MAX_FRAME_SIZE", &raw)?;
        }
        if let Some(raw) = lookup("PRESENCE_PONG_WAIT_SECS") {
            config.pong_wait = Duration::from_secs(parse_var("PRESENCE_PONG_WAIT_SECS", &raw)?);
        }
        if let Some(raw) = lookup("PRESENCE_WRITE_WAIT_SECS") {
            config.write_wait = Duration::from_secs(parse_var("PRESENCE_WRITE_WAIT_SECS", &raw)?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the loops cannot run with.
    pub fn validate(&self) -> Result<(), HubError> {
        if self.queue_capacity == 0 {
            return Err(HubError::Config("queue_capacity must be at least 1".into()));
        }
        if self.max_frame_size == 0 {
            return Err(HubError::Config("max_frame_size must be at least 1".into()));
        }
        if self.pong_wait.is_zero() || self.write_wait.is_zero() {
            return Err(HubError::Config("deadlines must be non-zero".into()));
        }
        if self.ping_period().is_zero() {
            return Err(HubError::Config(format!(
                "pong_wait {:?} leaves no room for a ping period",
                self.pong_wait
            )));
        }
        if !self.ws_path.starts_with('/') {
            return Err(HubError::Config(format!(
                "ws_path must start with '/': {}",
                self.ws_path
            )));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(key: &str, raw: &str) -> Result<T, HubError> {
    raw.trim()
        .parse()
        .map_err(|_| HubError::Config(format!("{key}: invalid value {raw:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_config_default() {
        let config = HubConfig::default();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.ws_path, "/ws");
        assert_eq!(config.queue_capacity, 256);
        assert_eq!(config.max_frame_size, 512);
        assert_eq!(config.pong_wait, Duration::from_secs(60));
        assert_eq!(config.write_wait, Duration::from_secs(10));
    }

    #[test]
    fn test_ping_period_is_nine_tenths() {
        let config = HubConfig::default();
        assert_eq!(config.ping_period(), Duration::from_secs(54));

        let fast = HubConfig {
            pong_wait: Duration::from_millis(500),
            ..HubConfig::default()
        };
        assert_eq!(fast.ping_period(), Duration::from_millis(450));
        assert!(fast.ping_period() < fast.pong_wait);
    }

    #[test]
    fn test_from_lookup_overrides() {
        let vars: HashMap<&str, &str> = [
            ("PRESENCE_BIND_ADDR", "127.0.0.1:9000"),
            ("PRESENCE_QUEUE_CAPACITY", "32"),
            ("PRESENCE_PONG_WAIT_SECS", " 20 "),
        ]
        .into_iter()
        .collect();

        let config = HubConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.queue_capacity, 32);
        assert_eq!(config.pong_wait, Duration::from_secs(20));
        // Untouched values keep their defaults
        assert_eq!(config.max_frame_size, 512);
        assert_eq!(config.ws_path, "/ws");
    }

    #[test]
    fn test_from_lookup_empty_is_default() {
        let config = HubConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.queue_capacity, 256);
    }

    #[test]
    fn test_from_lookup_invalid_number() {
        let err = HubConfig::from_lookup(|k| {
            (k == "PRESENCE_MAX_FRAME_SIZE").then(|| "lots".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, HubError::Config(ref msg) if msg.contains("PRESENCE_MAX_FRAME_SIZE")));
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = HubConfig {
            queue_capacity: 0,
            ..HubConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_relative_path() {
        let config = HubConfig {
            ws_path: "ws".into(),
            ..HubConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_ping_period() {
        let config = HubConfig {
            pong_wait: Duration::from_nanos(5),
            ..HubConfig::default()
        };
        assert!(config.ping_period().is_zero());
        assert!(matches!(config.validate(), Err(HubError::Config(ref msg)) if msg.contains("ping period")));
    }

    #[test]
    fn test_websocket_config_caps_reads() {
        let config = HubConfig {
            max_frame_size: 1024,
            ..HubConfig::default()
        };
        let ws = config.websocket_config();
        assert_eq!(ws.max_message_size, Some(1024));
        assert_eq!(ws.max_frame_size, Some(1024));
    }
}
