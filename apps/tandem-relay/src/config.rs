use std::env;
use std::time::Duration;

use tandem_proto::IceServer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    /// Served verbatim from `GET /ice-servers`.
    pub ice_servers: Vec<IceServer>,
    /// Participants silent for longer than this are evicted.
    pub heartbeat_timeout: Duration,
    /// When set, websocket upgrades must present `Authorization: Bearer <token>`.
    pub required_token: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let ice_urls: Vec<String> = env::var("TANDEM_RELAY_ICE_URLS")
            .map(|urls| {
                urls.split(',')
                    .map(str::trim)
                    .filter(|u| !u.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let ice_servers = if ice_urls.is_empty() {
            defaults.ice_servers
        } else {
            vec![IceServer {
                urls: ice_urls,
                username: env::var("TANDEM_RELAY_ICE_USERNAME").ok(),
                credential: env::var("TANDEM_RELAY_ICE_CREDENTIAL").ok(),
            }]
        };

        Self {
            port: env::var("TANDEM_RELAY_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            ice_servers,
            heartbeat_timeout: env::var("TANDEM_RELAY_HEARTBEAT_TIMEOUT_SECS")
                .ok()
                .and_then(|t| t.parse().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_timeout),
            required_token: env::var("TANDEM_RELAY_TOKEN")
                .ok()
                .filter(|t| !t.is_empty()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            ice_servers: vec![IceServer {
                urls: vec!["stun:stun.l.google.com:19302".to_string()],
                username: None,
                credential: None,
            }],
            heartbeat_timeout: Duration::from_secs(60),
            required_token: None,
        }
    }
}
