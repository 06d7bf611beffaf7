use std::env;
use std::time::Duration;

use crate::negotiation::NegotiationTimeouts;

/// Call client configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Base websocket URL of the signaling relay
    pub relay_url: String,
    /// Endpoint returning `{"iceServers": [...]}`; static STUN when unset
    pub ice_url: Option<String>,
    pub heartbeat_interval: Duration,
    pub timeouts: NegotiationTimeouts,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let relay_url = env::var("TANDEM_RELAY_URL").unwrap_or(defaults.relay_url);
        // Normalize localhost to IPv4 to avoid IPv6 (::1) preference on macOS
        let relay_url = relay_url.replacen("://localhost", "://127.0.0.1", 1);

        let heartbeat_interval = env::var("TANDEM_HEARTBEAT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.heartbeat_interval);

        let timeouts = NegotiationTimeouts {
            join_ack: timeout_var("TANDEM_JOIN_TIMEOUT_SECS", defaults.timeouts.join_ack),
            offer: timeout_var("TANDEM_OFFER_TIMEOUT_SECS", defaults.timeouts.offer),
            answer: timeout_var("TANDEM_ANSWER_TIMEOUT_SECS", defaults.timeouts.answer),
            connect: timeout_var("TANDEM_CONNECT_TIMEOUT_SECS", defaults.timeouts.connect),
        };

        Self {
            relay_url,
            ice_url: env::var("TANDEM_ICE_URL").ok().filter(|v| !v.is_empty()),
            heartbeat_interval,
            timeouts,
        }
    }
}

/// `0` disables the timeout; unparsable values keep the default.
fn timeout_var(name: &str, default: Option<Duration>) -> Option<Duration> {
    match env::var(name).ok().and_then(|v| v.parse::<u64>().ok()) {
        Some(0) => None,
        Some(secs) => Some(Duration::from_secs(secs)),
        None => default,
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:8080".to_string(),
            ice_url: None,
            heartbeat_interval: Duration::from_secs(10),
            timeouts: NegotiationTimeouts::default(),
        }
    }
}
