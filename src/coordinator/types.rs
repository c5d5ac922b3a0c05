/**
 * coordinator/types.rs
 *
 * Core types for the rendezvous client
 */

use crate::network::Family;
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

/// Default rendezvous service
pub const DEFAULT_COORDINATOR_SERVER: &str = "coordinator.openttd.org:3976";

/// Default STUN relay
pub const DEFAULT_STUN_SERVER: &str = "stun.openttd.org:3975";

pub const COORDINATOR_PORT: u16 = 3976;
pub const STUN_PORT: u16 = 3975;

/// How others can reach a hosted game, as judged by the rendezvous service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    /// No registration acknowledged yet
    Unknown,
    /// Nobody can reach the game
    Isolated,
    Direct,
    Stun,
}

impl ConnectionType {
    pub fn to_wire(self) -> u8 {
        match self {
            ConnectionType::Unknown => 0,
            ConnectionType::Isolated => 1,
            ConnectionType::Direct => 2,
            ConnectionType::Stun => 3,
        }
    }

    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(ConnectionType::Unknown),
            1 => Some(ConnectionType::Isolated),
            2 => Some(ConnectionType::Direct),
            3 => Some(ConnectionType::Stun),
            _ => None,
        }
    }
}

/// Who may see a hosted game in listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Visibility {
    FriendsOnly,
    Public,
}

impl Visibility {
    pub fn to_wire(self) -> u8 {
        match self {
            Visibility::FriendsOnly => 0,
            Visibility::Public => 1,
        }
    }

    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Visibility::FriendsOnly),
            1 => Some(Visibility::Public),
            _ => None,
        }
    }
}

/// Rendezvous client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Rendezvous service (host:port)
    pub coordinator_server: String,

    /// STUN relay (host:port)
    pub stun_server: String,

    /// Revision string advertised and used for compatibility checks
    pub revision: String,

    /// Seconds between server updates while registered
    pub update_interval_secs: u64,

    /// First reconnect delay, in seconds
    pub reconnect_base_secs: u64,

    /// Reconnect delay ceiling, in seconds
    pub reconnect_max_secs: u64,

    /// Per-dial connect timeout, in seconds
    pub connect_timeout_secs: u64,

    /// Give up on a join attempt after this many seconds
    pub join_timeout_secs: u64,

    /// Packets handled per `send_receive` call
    pub max_packets_per_tick: usize,

    /// Families to STUN over; `None` probes the host
    pub stun_families: Option<Vec<Family>>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            coordinator_server: DEFAULT_COORDINATOR_SERVER.to_string(),
            stun_server: DEFAULT_STUN_SERVER.to_string(),
            revision: env!("CARGO_PKG_VERSION").to_string(),
            update_interval_secs: 30,
            reconnect_base_secs: 1,
            reconnect_max_secs: 32,
            connect_timeout_secs: 10,
            join_timeout_secs: 60,
            max_packets_per_tick: 20,
            stun_families: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }
}

/// Notifications for the embedding application, drained with
/// `CoordinatorClient::take_events`
#[derive(Debug)]
pub enum CoordinatorEvent {
    /// The service acknowledged our registration
    Registered {
        join_key: String,
        connection_type: ConnectionType,
    },
    /// A listing pass finished; the game list was refreshed
    ListingChanged,
    /// A joining peer reached our hosted game
    IncomingPeer {
        token: String,
        stream: TcpStream,
        peer: SocketAddr,
    },
    /// The control connection was lost or closed
    Disconnected,
    /// The service refused to list our game; hosting stopped
    RegistrationRejected {
        detail: String,
    },
}

/// Exponential reconnect delay
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, current: base }
    }

    /// Delay before the next attempt; doubles for the one after, up to the ceiling
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.checked_mul(2).unwrap_or(self.max).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_to_ceiling() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(32));
        let delays: Vec<u64> = (0..8).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 32, 32]);
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(32));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_huge_base_stays_at_ceiling() {
        let huge = Duration::from_secs(u64::MAX / 2 + 1);
        let mut backoff = Backoff::new(huge, Duration::from_secs(u64::MAX));
        assert_eq!(backoff.next_delay(), huge);
        assert_eq!(backoff.next_delay(), Duration::from_secs(u64::MAX));
        assert_eq!(backoff.next_delay(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn test_config_defaults_fill_missing_fields() {
        let config: CoordinatorConfig =
            serde_json::from_str(r#"{"coordinator_server": "127.0.0.1:9000", "stun_families": ["v4"]}"#).unwrap();
        assert_eq!(config.coordinator_server, "127.0.0.1:9000");
        assert_eq!(config.stun_server, DEFAULT_STUN_SERVER);
        assert_eq!(config.update_interval(), Duration::from_secs(30));
        assert_eq!(config.stun_families, Some(vec![Family::V4]));
    }

    #[test]
    fn test_wire_values() {
        for t in [ConnectionType::Unknown, ConnectionType::Isolated, ConnectionType::Direct, ConnectionType::Stun] {
            assert_eq!(ConnectionType::from_wire(t.to_wire()), Some(t));
        }
        assert_eq!(Visibility::from_wire(1), Some(Visibility::Public));
        assert_eq!(Visibility::from_wire(2), None);
    }
}
