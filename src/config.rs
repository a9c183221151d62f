//! Configuration for call sessions

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};

/// Main configuration for a [`crate::CallSession`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// STUN server URLs (at least one required)
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional; without a relay, peers behind
    /// symmetric NAT may be unable to connect)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Retry schedule for automatic reconnection after a connection failure
    pub reconnect: RetryPolicy,

    /// Retry schedule for transient signaling send failures
    pub signaling_send: RetryPolicy,

    /// Packet-loss bands for quality classification
    pub quality: QualityThresholds,

    /// Interval between quality samples in milliseconds (default: 2000ms)
    pub quality_interval_ms: u64,

    /// Consecutive `poor` samples required before the session reports
    /// degradation (default: 2)
    pub degrade_after_ticks: u32,

    /// How long a `disconnected` peer connection may linger before
    /// reconnection starts, in milliseconds (default: 5000ms)
    pub disconnect_grace_ms: u64,

    /// Per-attempt budget for the reconnection offer/answer handshake,
    /// in milliseconds (default: 10000ms)
    pub handshake_timeout_ms: u64,
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn:// or turns://)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// Monotonic packet-loss bands mapped to quality tiers
///
/// Loss at or below `excellent_max_loss` is excellent, at or below
/// `good_max_loss` good, at or below `fair_max_loss` fair, and anything
/// above fair is poor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityThresholds {
    pub excellent_max_loss: f64,
    pub good_max_loss: f64,
    pub fair_max_loss: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            excellent_max_loss: 0.005,
            good_max_loss: 0.02,
            fair_max_loss: 0.05,
        }
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            turn_servers: Vec::new(),
            reconnect: RetryPolicy::new(3, 1000, 2.0, 30_000),
            signaling_send: RetryPolicy::new(3, 200, 2.0, 2_000),
            quality: QualityThresholds::default(),
            quality_interval_ms: 2_000,
            degrade_after_ticks: 2,
            disconnect_grace_ms: 5_000,
            handshake_timeout_ms: 10_000,
        }
    }
}

impl CallConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `stun_servers` is empty
    /// - `quality_interval_ms` is not in range 250-30000
    /// - `degrade_after_ticks` is zero
    /// - `handshake_timeout_ms` is zero
    /// - the quality bands are not strictly increasing
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.stun_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one STUN server is required".to_string(),
            ));
        }

        if self.quality_interval_ms < 250 || self.quality_interval_ms > 30_000 {
            return Err(Error::InvalidConfig(format!(
                "quality_interval_ms must be in range 250-30000, got {}",
                self.quality_interval_ms
            )));
        }

        if self.degrade_after_ticks == 0 {
            return Err(Error::InvalidConfig(
                "degrade_after_ticks must be at least 1".to_string(),
            ));
        }

        if self.handshake_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "handshake_timeout_ms must be positive".to_string(),
            ));
        }

        let q = &self.quality;
        if !(q.excellent_max_loss < q.good_max_loss && q.good_max_loss < q.fair_max_loss) {
            return Err(Error::InvalidConfig(format!(
                "quality bands must be strictly increasing, got {} / {} / {}",
                q.excellent_max_loss, q.good_max_loss, q.fair_max_loss
            )));
        }

        Ok(())
    }

    /// Create a configuration preset for unstable networks
    ///
    /// Best for cellular or otherwise lossy links: a longer disconnect grace
    /// period, a larger reconnection budget, and faster quality sampling so
    /// degradation is noticed sooner.
    pub fn unstable_network_preset() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
            ],
            reconnect: RetryPolicy::new(5, 2000, 1.5, 60_000),
            quality_interval_ms: 1_000,
            disconnect_grace_ms: 10_000,
            handshake_timeout_ms: 20_000,
            ..Self::default()
        }
    }

    /// Add TURN servers to this configuration
    ///
    /// Useful for chaining with preset methods.
    pub fn with_turn_servers(mut self, turn_servers: Vec<TurnServerConfig>) -> Self {
        self.turn_servers = turn_servers;
        self
    }

    /// Replace the reconnection retry schedule
    pub fn with_reconnect(mut self, reconnect: RetryPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CallConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_stun_servers_fails() {
        let mut config = CallConfig::default();
        config.stun_servers.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_quality_interval_fails() {
        let mut config = CallConfig::default();
        config.quality_interval_ms = 100;
        assert!(config.validate().is_err());

        config.quality_interval_ms = 60_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_debounce_fails() {
        let mut config = CallConfig::default();
        config.degrade_after_ticks = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_non_monotonic_quality_bands_fail() {
        let mut config = CallConfig::default();
        config.quality.good_max_loss = config.quality.fair_max_loss;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unstable_network_preset() {
        let config = CallConfig::unstable_network_preset();
        assert!(config.validate().is_ok());
        assert_eq!(config.stun_servers.len(), 3);
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.disconnect_grace_ms, 10_000);
    }

    #[test]
    fn test_preset_with_turn_servers() {
        let config = CallConfig::unstable_network_preset().with_turn_servers(vec![
            TurnServerConfig {
                url: "turn:turn.example.com:3478".to_string(),
                username: "user".to_string(),
                credential: "pass".to_string(),
            },
        ]);
        assert!(config.validate().is_ok());
        assert_eq!(config.turn_servers.len(), 1);
    }

    #[test]
    fn test_config_serialization() {
        let config = CallConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: CallConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config.stun_servers, parsed.stun_servers);
        assert_eq!(config.reconnect, parsed.reconnect);
    }
}
