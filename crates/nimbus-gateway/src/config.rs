//! Gateway tuning knobs, the `[gateway]` table of the config file

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Mint an ephemeral session for a subscribe without a known session id
    #[serde(default = "default_probe_sessions")]
    pub probe_sessions: bool,

    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Events retained per session; 0 keeps everything
    #[serde(default = "default_max_events")]
    pub max_events_per_session: usize,

    /// Close sessions idle longer than this; 0 disables expiry
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
}

fn default_probe_sessions() -> bool {
    true
}

fn default_max_sessions() -> usize {
    1000
}

fn default_max_events() -> usize {
    1024
}

fn default_idle_timeout_secs() -> u64 {
    1800
}

fn default_reap_interval_secs() -> u64 {
    60
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            probe_sessions: default_probe_sessions(),
            max_sessions: default_max_sessions(),
            max_events_per_session: default_max_events(),
            idle_timeout_secs: default_idle_timeout_secs(),
            reap_interval_secs: default_reap_interval_secs(),
        }
    }
}

impl GatewayConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert!(config.probe_sessions);
        assert_eq!(config.max_sessions, 1000);
        assert_eq!(config.max_events_per_session, 1024);
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(1800)));
        assert_eq!(config.reap_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_zero_idle_timeout_disables_expiry() {
        let config = GatewayConfig {
            idle_timeout_secs: 0,
            ..GatewayConfig::default()
        };
        assert_eq!(config.idle_timeout(), None);
    }

    #[test]
    fn test_partial_table_uses_defaults() {
        let config: GatewayConfig = serde_json::from_value(serde_json::json!({
            "probe_sessions": false,
            "max_events_per_session": 16
        }))
        .unwrap();
        assert!(!config.probe_sessions);
        assert_eq!(config.max_events_per_session, 16);
        assert_eq!(config.max_sessions, 1000);
    }
}
