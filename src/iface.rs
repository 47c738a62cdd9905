//! Per-interface multicast socket lifecycle and topology reconciliation.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Instant;

use if_addrs::IfAddr;
use mio::{Interest, Registry, Token};
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::{MDNS_MULTICAST_IPV4, MDNS_MULTICAST_IPV6, MDNS_PORT, RECOVERY_TIME};

/// One address of an interface together with its netmask, which
/// `Packet::applied_to` needs for subnet matching.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct IfaceAddr {
    pub(crate) addr: IpAddr,
    pub(crate) netmask: IpAddr,
}

/// The view of an interface the packet filter works against.
#[derive(Clone, Debug)]
pub(crate) struct NicInfo {
    pub(crate) name: String,
    pub(crate) addrs: Vec<IfaceAddr>,
}

/// Engine-owned state for one interface: its sockets, current addresses
/// and fault quarantine.
pub(crate) struct NicState {
    pub(crate) name: String,
    index: Option<u32>,
    addrs: Vec<IfaceAddr>,
    pub(crate) sock_v4: Option<mio::net::UdpSocket>,
    token_v4: Option<Token>,
    pub(crate) sock_v6: Option<mio::net::UdpSocket>,
    token_v6: Option<Token>,
    disabled_until: Option<Instant>,
    packets_sent: u32,
    /// True when the interface was added explicitly rather than found by
    /// the startup scan; failures on it are always logged.
    pub(crate) manually_added: bool,
}

impl NicState {
    pub(crate) fn new(name: String, manually_added: bool) -> NicState {
        NicState {
            name,
            index: None,
            addrs: Vec::new(),
            sock_v4: None,
            token_v4: None,
            sock_v6: None,
            token_v6: None,
            disabled_until: None,
            packets_sent: 0,
            manually_added,
        }
    }

    pub(crate) fn info(&self) -> NicInfo {
        NicInfo {
            name: self.name.clone(),
            addrs: self.addrs.clone(),
        }
    }

    pub(crate) fn addresses(&self) -> Vec<IpAddr> {
        self.addrs.iter().map(|a| a.addr).collect()
    }

    pub(crate) fn has_sockets(&self) -> bool {
        self.sock_v4.is_some() || self.sock_v6.is_some()
    }

    pub(crate) fn socket_for(&self, token: Token) -> Option<&mio::net::UdpSocket> {
        if self.token_v4 == Some(token) {
            return self.sock_v4.as_ref();
        }
        if self.token_v6 == Some(token) {
            return self.sock_v6.as_ref();
        }
        None
    }

    pub(crate) fn is_disabled(&self) -> bool {
        matches!(self.disabled_until, Some(until) if Instant::now() < until)
    }

    pub(crate) fn note_sent(&mut self) {
        self.packets_sent = self.packets_sent.saturating_add(1);
    }

    /// A send failed on this interface. Quarantine it; log unless this is
    /// the very first send on an auto-scanned interface, which is usually
    /// just a NIC that claims to be up and isn't.
    pub(crate) fn note_send_failure(&mut self, err: &io::Error) {
        if self.packets_sent > 0 || self.manually_added {
            log::warn!(
                "send on \"{}\" failed with \"{}\", disabling interface for {}s",
                self.name,
                err,
                RECOVERY_TIME.as_secs()
            );
        }
        self.disabled_until = Some(Instant::now() + RECOVERY_TIME);
    }

    /// Bring this interface's state in line with the system: open sockets
    /// when addresses appear, close them when every address is gone, and
    /// diff the list otherwise. Returns true when anything changed.
    pub(crate) fn reconcile(
        &mut self,
        scan: &[if_addrs::Interface],
        registry: &Registry,
        next_token: &mut usize,
        ipv4_enabled: bool,
        ipv6_enabled: bool,
        remove: bool,
    ) -> bool {
        let mut new_addrs: Vec<IfaceAddr> = Vec::new();
        let mut have_v4 = false;
        let mut have_v6 = false;
        if !remove {
            for entry in scan.iter().filter(|e| e.name == self.name) {
                if self.index.is_none() {
                    self.index = entry.index;
                }
                let ip = entry.ip();
                if entry.is_loopback() || ip.is_multicast() {
                    continue;
                }
                let netmask = match &entry.addr {
                    IfAddr::V4(a) => IpAddr::V4(a.netmask),
                    IfAddr::V6(a) => IpAddr::V6(a.netmask),
                };
                match ip {
                    IpAddr::V4(_) if ipv4_enabled => {
                        have_v4 = true;
                        new_addrs.push(IfaceAddr { addr: ip, netmask });
                    }
                    IpAddr::V6(_) if ipv6_enabled => {
                        have_v6 = true;
                        new_addrs.push(IfaceAddr { addr: ip, netmask });
                    }
                    _ => {}
                }
            }
        }

        let mut changed = false;
        if self.addrs.is_empty() && !new_addrs.is_empty() {
            if have_v4 {
                let local = first_v4(&new_addrs).unwrap_or(Ipv4Addr::UNSPECIFIED);
                let token = Token(*next_token);
                *next_token += 1;
                match open_v4(registry, token, local) {
                    Ok(sock) => {
                        self.sock_v4 = Some(sock);
                        self.token_v4 = Some(token);
                    }
                    Err(e) => {
                        // This runs on every loop pass; nothing the caller
                        // can do about it, so keep it quiet.
                        log::debug!("open v4 socket on \"{}\": {}", self.name, e);
                        new_addrs.retain(|a| !a.addr.is_ipv4());
                    }
                }
            }
            if have_v6 {
                let token = Token(*next_token);
                *next_token += 1;
                match open_v6(registry, token, self.index.unwrap_or(0)) {
                    Ok(sock) => {
                        self.sock_v6 = Some(sock);
                        self.token_v6 = Some(token);
                    }
                    Err(e) => {
                        log::debug!("open v6 socket on \"{}\": {}", self.name, e);
                        new_addrs.retain(|a| !a.addr.is_ipv6());
                    }
                }
            }
            if !new_addrs.is_empty() {
                self.addrs = new_addrs;
                changed = true;
            }
        } else if !self.addrs.is_empty() && new_addrs.is_empty() {
            self.close_sockets(registry);
            self.addrs.clear();
            changed = true;
        } else {
            let before = self.addrs.len();
            self.addrs.retain(|a| new_addrs.contains(a));
            changed |= self.addrs.len() != before;
            for a in new_addrs {
                if !self.addrs.contains(&a) {
                    self.addrs.push(a);
                    changed = true;
                }
            }
        }
        changed
    }

    pub(crate) fn close_sockets(&mut self, registry: &Registry) {
        if let Some(mut sock) = self.sock_v4.take() {
            let _ = registry.deregister(&mut sock);
        }
        if let Some(mut sock) = self.sock_v6.take() {
            let _ = registry.deregister(&mut sock);
        }
        self.token_v4 = None;
        self.token_v6 = None;
    }
}

fn first_v4(addrs: &[IfaceAddr]) -> Option<Ipv4Addr> {
    addrs.iter().find_map(|a| match a.addr {
        IpAddr::V4(v4) => Some(v4),
        _ => None,
    })
}

fn open_v4(registry: &Registry, token: Token, local: Ipv4Addr) -> io::Result<mio::net::UdpSocket> {
    let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_reuse_address(true)?;
    #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
    sock.set_reuse_port(true)?;
    sock.set_nonblocking(true)?;
    sock.set_multicast_ttl_v4(255)?;
    sock.set_multicast_if_v4(&local)?;
    let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), MDNS_PORT);
    sock.bind(&bind.into())?;
    sock.join_multicast_v4(&MDNS_MULTICAST_IPV4, &local)?;
    let mut sock = mio::net::UdpSocket::from_std(sock.into());
    registry.register(&mut sock, token, Interest::READABLE)?;
    Ok(sock)
}

fn open_v6(registry: &Registry, token: Token, index: u32) -> io::Result<mio::net::UdpSocket> {
    let sock = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_reuse_address(true)?;
    #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
    sock.set_reuse_port(true)?;
    sock.set_nonblocking(true)?;
    sock.set_only_v6(true)?;
    sock.set_multicast_hops_v6(255)?;
    sock.set_multicast_if_v6(index)?;
    let bind = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), MDNS_PORT);
    sock.bind(&bind.into())?;
    sock.join_multicast_v6(&MDNS_MULTICAST_IPV6, index)?;
    let mut sock = mio::net::UdpSocket::from_std(sock.into());
    registry.register(&mut sock, token, Interest::READABLE)?;
    Ok(sock)
}

/// Enumerate the system's interfaces, or nothing when the platform call
/// fails.
pub(crate) fn scan_interfaces() -> Vec<if_addrs::Interface> {
    match if_addrs::get_if_addrs() {
        Ok(list) => list,
        Err(e) => {
            log::debug!("get_if_addrs failed: {e}");
            Vec::new()
        }
    }
}

/// Distinct names of interfaces worth using: up (they have addresses),
/// not loopback.
pub(crate) fn usable_interface_names(scan: &[if_addrs::Interface]) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for entry in scan {
        if entry.is_loopback() || entry.ip().is_multicast() {
            continue;
        }
        if !names.iter().any(|n| n == &entry.name) {
            names.push(entry.name.clone());
        }
    }
    names
}
