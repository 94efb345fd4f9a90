//! # Peer Configuration
//!
//! All knobs a peer honors, loadable from TOML. The peer takes ownership of
//! the configuration at start, so a running peer's configuration cannot be
//! mutated — rebuild a config and start a new peer to change it.

use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CourierError, Result};
use crate::message::KindMask;
use crate::seq::SEQUENCE_COUNT;

/// Peer-wide configuration, fixed for the lifetime of a peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Identifier that both sides of a handshake must agree on.
    pub app_identifier: String,
    /// Bind address (IPv4 or IPv6).
    pub local_address: IpAddr,
    /// Bind port; 0 lets the OS choose.
    pub port: u16,
    /// Accept IPv4 traffic on an IPv6 socket.
    pub dual_stack: bool,
    /// Socket receive buffer size in bytes; 0 keeps the OS default.
    pub receive_buffer_size: usize,
    /// Socket send buffer size in bytes; 0 keeps the OS default.
    pub send_buffer_size: usize,
    /// Connection cap, handshakes included.
    pub maximum_connections: usize,
    /// Keepalive ping cadence.
    #[serde(with = "duration_secs")]
    pub ping_interval: Duration,
    /// Silence on a connection before it is declared dead.
    #[serde(with = "duration_secs")]
    pub connection_timeout: Duration,
    /// Starting datagram size.
    pub default_mtu: usize,
    /// Ceiling for MTU expansion probing.
    pub maximum_mtu: usize,
    /// Probe for a larger MTU after connecting.
    pub expand_mtu: bool,
    /// Floor for the first retransmission delay.
    #[serde(with = "duration_secs")]
    pub resend_base_delay: Duration,
    /// Retransmit budget per reliable message before the connection is
    /// considered timed out.
    pub max_retransmits: u32,
    /// Allow inbound `Connect` handshakes.
    pub accept_incoming_connections: bool,
    /// Ask an external port mapper to open the bound port. The library only
    /// records the intent; mapping is the embedding application's adapter.
    pub enable_upnp: bool,
    /// Flush send channels every heartbeat; when false, sends wait for an
    /// explicit flush.
    pub auto_flush_send_queue: bool,
    /// Incoming kinds the application wants delivered.
    pub enabled_message_types: KindMask,
    /// Reliable window size per channel; power of two, at most 1024.
    pub window_size: usize,
    /// How long half-assembled fragment groups are kept.
    #[serde(with = "duration_secs")]
    pub fragment_group_ttl: Duration,
    /// Capacity of the received-message hand-off queue.
    pub received_queue_capacity: usize,
    /// Handshake (re)send attempts before giving up.
    pub handshake_attempts: u32,
    /// Cadence of handshake resends.
    #[serde(with = "duration_secs")]
    pub handshake_resend_interval: Duration,
    /// Hardware address mixed into the peer id; `None` uses random bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardware_address: Option<[u8; 6]>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        PeerConfig {
            app_identifier: String::new(),
            local_address: IpAddr::from([0, 0, 0, 0]),
            port: 0,
            dual_stack: false,
            receive_buffer_size: 0,
            send_buffer_size: 0,
            maximum_connections: 32,
            ping_interval: Duration::from_secs(4),
            connection_timeout: Duration::from_secs(25),
            default_mtu: 1408,
            maximum_mtu: 8192,
            expand_mtu: false,
            resend_base_delay: Duration::from_millis(100),
            max_retransmits: 3,
            accept_incoming_connections: false,
            enable_upnp: false,
            auto_flush_send_queue: true,
            enabled_message_types: KindMask::default(),
            window_size: 64,
            fragment_group_ttl: Duration::from_secs(60),
            received_queue_capacity: 1024,
            handshake_attempts: 5,
            handshake_resend_interval: Duration::from_secs(1),
            hardware_address: None,
        }
    }
}

impl PeerConfig {
    /// A config with the identifier both handshake sides must present.
    pub fn new(app_identifier: impl Into<String>) -> Self {
        PeerConfig {
            app_identifier: app_identifier.into(),
            ..Default::default()
        }
    }

    /// Parse a TOML document into a config (missing fields default).
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: PeerConfig =
            toml::from_str(text).map_err(|e| CourierError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency; called by `Peer::start`.
    pub fn validate(&self) -> Result<()> {
        if self.app_identifier.is_empty() {
            return Err(CourierError::Config("app_identifier must be set".into()));
        }
        if !self.window_size.is_power_of_two() || self.window_size > 1024 {
            return Err(CourierError::Config(
                "window_size must be a power of two, at most 1024".into(),
            ));
        }
        debug_assert_eq!(usize::from(SEQUENCE_COUNT) % self.window_size, 0);
        if self.default_mtu < 128 {
            return Err(CourierError::Config("default_mtu must be at least 128".into()));
        }
        if self.maximum_mtu < self.default_mtu {
            return Err(CourierError::Config(
                "maximum_mtu must be at least default_mtu".into(),
            ));
        }
        // The header's 16-bit payload bit length caps a framed message.
        if self.maximum_mtu > 8192 {
            return Err(CourierError::Config("maximum_mtu must be at most 8192".into()));
        }
        if self.maximum_connections == 0 {
            return Err(CourierError::Config("maximum_connections must be positive".into()));
        }
        if self.received_queue_capacity == 0 {
            return Err(CourierError::Config(
                "received_queue_capacity must be positive".into(),
            ));
        }
        if self.handshake_attempts == 0 {
            return Err(CourierError::Config("handshake_attempts must be positive".into()));
        }
        Ok(())
    }
}

/// Serialize durations as fractional seconds in config files.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}
