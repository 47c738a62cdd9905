//! Configuration for a [`Zeroconf`](crate::Zeroconf) instance and the
//! protocol constants shared across the crate.

use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::time::Duration;

/// The standard mDNS port (5353).
pub const MDNS_PORT: u16 = 5353;

/// The mDNS IPv4 multicast group (224.0.0.251).
pub const MDNS_MULTICAST_IPV4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);

/// The mDNS IPv6 multicast group (ff02::fb).
pub const MDNS_MULTICAST_IPV6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xfb);

pub(crate) const MDNS_DEST_V4: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(MDNS_MULTICAST_IPV4, MDNS_PORT));
pub(crate) const MDNS_DEST_V6: SocketAddr =
    SocketAddr::V6(SocketAddrV6::new(MDNS_MULTICAST_IPV6, MDNS_PORT, 0, 0));

/// The DNS-SD service type enumeration name.
pub(crate) const DISCOVERY_NAME: &str = "_services._dns-sd._udp.local";

/// How long a NIC stays quarantined after a failed send.
pub(crate) const RECOVERY_TIME: Duration = Duration::from_secs(10);

/// The selector wait; expiry and topology work runs at most this far apart.
pub(crate) const SELECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Spacing between the three probe questions sent before claiming a name.
pub(crate) const PROBE_INTERVAL: Duration = Duration::from_millis(250);
pub(crate) const PROBE_ROUNDS: usize = 3;

/// Size of the reusable send/receive buffer. mDNS packets may exceed the
/// classic 512-byte DNS limit.
pub(crate) const MAX_PACKET_SIZE: usize = 64 * 1024;

/// Default TTL for PTR records (8 hours).
pub const TTL_PTR: u32 = 28_800;
/// Default TTL for SRV records.
pub const TTL_SRV: u32 = 120;
/// Default TTL for TXT records (75 minutes).
pub const TTL_TXT: u32 = 4_500;
/// Default TTL for A/AAAA records.
pub const TTL_A: u32 = 120;

pub(crate) const TTL_MIN: u32 = 5;
pub(crate) const TTL_MAX: u32 = 86_400;

/// Configuration for a `Zeroconf` instance.
///
/// ```rust
/// use zeroconf::Config;
///
/// let config = Config::default()
///     .with_local_host_name("myhost")
///     .with_ipv6(false);
/// ```
#[derive(Clone, Debug)]
pub struct Config {
    /// Service discovery domain, dotted; `.local` by default.
    pub domain: String,

    /// The undotted local host name, used as the SRV target of announced
    /// services. Defaults to the system hostname.
    pub local_host_name: String,

    /// Whether to open IPv4 sockets and announce IPv4 addresses.
    pub ipv4_enabled: bool,

    /// Whether to open IPv6 sockets and announce IPv6 addresses.
    pub ipv6_enabled: bool,

    /// The interfaces to use, by name. `None` means every interface that
    /// is up, multicast-capable and not a loopback.
    pub network_interfaces: Option<HashSet<String>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            domain: ".local".to_string(),
            local_host_name: system_hostname(),
            ipv4_enabled: true,
            ipv6_enabled: true,
            network_interfaces: None,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn with_local_host_name(mut self, name: impl Into<String>) -> Self {
        self.local_host_name = name.into();
        self
    }

    pub fn with_ipv4(mut self, enabled: bool) -> Self {
        self.ipv4_enabled = enabled;
        self
    }

    pub fn with_ipv6(mut self, enabled: bool) -> Self {
        self.ipv6_enabled = enabled;
        self
    }

    pub fn with_network_interfaces(
        mut self,
        names: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.network_interfaces = Some(names.into_iter().map(Into::into).collect());
        self
    }
}

fn system_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}
