//! Services: the unit of announcement and discovery.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use crate::config::{TTL_A, TTL_MAX, TTL_MIN, TTL_PTR, TTL_SRV, TTL_TXT};
use crate::engine::Shared;
use crate::error::{Error, Result};
use crate::message::record::{quote, TxtData};
use crate::Zeroconf;

#[derive(Default)]
struct ServiceState {
    host: Option<String>,
    port: Option<u16>,
    text: Option<TxtData>,
    /// Address to the set of interfaces it was heard on. Builder-supplied
    /// addresses have an empty set.
    addresses: HashMap<IpAddr, HashSet<String>>,
}

struct ServiceInner {
    engine: Weak<Shared>,
    engine_id: u64,
    /// Stored exactly as heard or built; escapes preserved.
    fqdn: String,
    name: String,
    stype: String,
    domain: String,
    ttl_ptr: u32,
    ttl_srv: u32,
    ttl_txt: u32,
    ttl_a: u32,
    /// True when this service was built locally rather than heard.
    owned: bool,
    cancelled: AtomicBool,
    state: RwLock<ServiceState>,
}

/// A service instance, either one we announce or one heard on the link.
///
/// A `Service` is a cheap handle; clones share state. Identity is the
/// fully-qualified name within one `Zeroconf` instance. Announce with
/// [`Service::announce`], withdraw with [`Service::cancel`]:
///
/// ```rust,no_run
/// use zeroconf::{ServiceBuilder, Zeroconf};
///
/// let zc = Zeroconf::new()?;
/// let service = ServiceBuilder::new("MyWeb", "_http._tcp")
///     .port(8080)
///     .text("path", "/path/to/service")
///     .build(&zc)?;
/// service.announce();
/// // time passes
/// service.cancel();
/// zc.close();
/// # Ok::<(), zeroconf::Error>(())
/// ```
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

impl Service {
    #[allow(clippy::too_many_arguments)]
    fn new(
        engine: Weak<Shared>,
        engine_id: u64,
        fqdn: String,
        name: String,
        stype: String,
        domain: String,
        owned: bool,
        ttls: [u32; 4],
    ) -> Service {
        Service {
            inner: Arc::new(ServiceInner {
                engine,
                engine_id,
                fqdn,
                name,
                stype,
                domain,
                ttl_ptr: ttls[0],
                ttl_srv: ttls[1],
                ttl_txt: ttls[2],
                ttl_a: ttls[3],
                owned,
                cancelled: AtomicBool::new(false),
                state: RwLock::new(ServiceState::default()),
            }),
        }
    }

    /// A service created from a heard SRV record.
    pub(crate) fn new_heard(
        engine: Weak<Shared>,
        engine_id: u64,
        fqdn: &str,
        name: String,
        stype: String,
        domain: String,
    ) -> Service {
        Service::new(
            engine,
            engine_id,
            fqdn.to_string(),
            name,
            stype,
            domain,
            false,
            [TTL_PTR, TTL_SRV, TTL_TXT, TTL_A],
        )
    }

    /// The fully-qualified name, e.g. `MyWeb._http._tcp.local`.
    pub fn fqdn(&self) -> &str {
        &self.inner.fqdn
    }

    /// The unescaped instance name, e.g. `MyWeb`.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Service plus protocol, e.g. `_http._tcp`.
    pub fn service_type(&self) -> &str {
        &self.inner.stype
    }

    /// The domain, usually `.local`.
    pub fn domain(&self) -> &str {
        &self.inner.domain
    }

    /// True when this service was built locally and may be announced.
    pub fn is_owned(&self) -> bool {
        self.inner.owned
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Relaxed)
    }

    pub fn host(&self) -> Option<String> {
        self.inner.state.read().unwrap().host.clone()
    }

    pub fn port(&self) -> Option<u16> {
        self.inner.state.read().unwrap().port
    }

    pub fn text(&self) -> Option<TxtData> {
        self.inner.state.read().unwrap().text.clone()
    }

    pub fn addresses(&self) -> Vec<IpAddr> {
        self.inner
            .state
            .read()
            .unwrap()
            .addresses
            .keys()
            .copied()
            .collect()
    }

    pub fn ttl_ptr(&self) -> u32 {
        self.inner.ttl_ptr
    }

    pub fn ttl_srv(&self) -> u32 {
        self.inner.ttl_srv
    }

    pub fn ttl_txt(&self) -> u32 {
        self.inner.ttl_txt
    }

    pub fn ttl_a(&self) -> u32 {
        self.inner.ttl_a
    }

    /// The host this service names: the stored one, or the engine's local
    /// host name plus domain when none was ever set.
    pub fn effective_host(&self) -> String {
        if let Some(host) = self.host() {
            return host;
        }
        match self.inner.engine.upgrade() {
            Some(shared) => {
                let config = shared.config.read().unwrap();
                format!("{}{}", config.local_host_name, config.domain)
            }
            None => String::new(),
        }
    }

    /// The addresses to advertise: the stored ones, or every local address
    /// the engine currently knows when none are stored.
    pub(crate) fn effective_addresses(&self) -> Vec<IpAddr> {
        let stored = self.addresses();
        if !stored.is_empty() {
            return stored;
        }
        match self.inner.engine.upgrade() {
            Some(shared) => shared.local_addresses(),
            None => Vec::new(),
        }
    }

    /// Announce this service on the link. Probes first; returns false when
    /// the name is already taken, already announced, or the probe heard a
    /// matching answer.
    pub fn announce(&self) -> bool {
        match self.inner.engine.upgrade() {
            Some(shared) => {
                let ok = shared.announce(self);
                if ok {
                    self.inner.cancelled.store(false, Ordering::Relaxed);
                }
                ok
            }
            None => false,
        }
    }

    /// Withdraw the announcement by sending a goodbye (every record with
    /// TTL 0). Returns false when the service was not announced.
    pub fn cancel(&self) -> bool {
        self.inner.cancelled.store(true, Ordering::Relaxed);
        match self.inner.engine.upgrade() {
            Some(shared) => shared.unannounce(self),
            None => false,
        }
    }

    /// Replace the TXT contents. On an announced service this triggers a
    /// reannounce so the link sees the new text.
    pub fn set_text(&self, text: TxtData) {
        let modified = self.set_text_internal(Some(text));
        if modified && self.inner.owned {
            if let Some(shared) = self.inner.engine.upgrade() {
                if shared.cache.is_announced(self.fqdn()) {
                    shared.reannounce(self);
                }
            }
        }
    }

    pub(crate) fn set_host(&self, host: &str, port: u16) -> bool {
        let mut state = self.inner.state.write().unwrap();
        let mut modified = false;
        if state.port != Some(port) {
            state.port = Some(port);
            modified = true;
        }
        if state.host.as_deref() != Some(host) {
            state.host = Some(host.to_string());
            modified = true;
        }
        modified
    }

    pub(crate) fn set_text_internal(&self, text: Option<TxtData>) -> bool {
        let mut state = self.inner.state.write().unwrap();
        if state.text != text {
            state.text = text;
            true
        } else {
            false
        }
    }

    /// Record that `addr` was seen for this service on `nic`; true when
    /// the address itself is new.
    pub(crate) fn add_address(&self, addr: IpAddr, nic: Option<&str>) -> bool {
        let mut state = self.inner.state.write().unwrap();
        let added = !state.addresses.contains_key(&addr);
        let nics = state.addresses.entry(addr).or_default();
        if let Some(nic) = nic {
            nics.insert(nic.to_string());
        }
        added
    }

    pub(crate) fn remove_address(&self, addr: IpAddr) -> bool {
        self.inner
            .state
            .write()
            .unwrap()
            .addresses
            .remove(&addr)
            .is_some()
    }
}

impl PartialEq for Service {
    fn eq(&self, other: &Self) -> bool {
        self.inner.engine_id == other.inner.engine_id && self.inner.fqdn == other.inner.fqdn
    }
}

impl Eq for Service {}

impl Hash for Service {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.fqdn.hash(state);
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{\"name\":{},\"type\":{},\"domain\":{}",
            quote(&self.inner.name),
            quote(&self.inner.stype),
            quote(&self.inner.domain)
        )?;
        let state = self.inner.state.read().unwrap();
        if let Some(host) = &state.host {
            write!(f, ",\"host\":{},\"port\":{}", quote(host), state.port.unwrap_or(0))?;
        }
        if let Some(text) = &state.text {
            write!(f, ",\"text\":{{")?;
            for (i, (k, v)) in text.iter().enumerate() {
                if i > 0 {
                    write!(f, ",")?;
                }
                match v {
                    Some(v) => write!(f, "{}:{}", quote(k), quote(v))?,
                    None => write!(f, "{}:null", quote(k))?,
                }
            }
            write!(f, "}}")?;
        }
        if !state.addresses.is_empty() {
            write!(f, ",\"addresses\":[")?;
            for (i, addr) in state.addresses.keys().enumerate() {
                if i > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{}", quote(&addr.to_string()))?;
            }
            write!(f, "]")?;
        }
        write!(f, "}}")
    }
}

/// Split a fully-qualified service name into (instance, type, domain),
/// e.g. `MyWeb._http._tcp.local` into `MyWeb`, `_http._tcp`, `.local`.
/// Backslash escapes in the instance label are honoured. Returns `None`
/// when no `_tcp`/`_udp`/double-underscore pair is found to anchor the
/// type.
pub(crate) fn split_fqdn(fqdn: &str) -> Option<(String, String, String)> {
    let mut labels: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut chars = fqdn.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                current.push(next);
            }
        } else if c == '.' {
            labels.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    labels.push(current);

    // The split point is not always obvious, e.g.
    // 99.0.110-FOO.123abcde._nvstream_dbd._udp.foo.com. Anchor on "_tcp",
    // "_udp" or two consecutive underscore labels and build outwards.
    for i in (2..labels.len().saturating_sub(1)).rev() {
        let s = &labels[i];
        let anchored = s == "_tcp"
            || s == "_udp"
            || (s.starts_with('_') && labels[i - 1].starts_with('_'));
        if !anchored {
            continue;
        }
        let stype = format!("{}.{}", labels[i - 1], s);
        let mut domain = String::new();
        for label in &labels[i + 1..] {
            domain.push('.');
            domain.push_str(label);
        }
        let instance = labels[..i - 1].join(".");
        return Some((instance, stype, domain));
    }
    None
}

/// Escape `.` and `\` in an instance name so it can be embedded as the
/// first label of a fully-qualified name.
pub(crate) fn escape_label(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c == '.' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Builds a [`Service`] to announce.
///
/// Name, type and port are required; the domain and host default from the
/// `Zeroconf` instance the service is built against. TTLs outside
/// `[5, 86400]` seconds are rejected.
#[derive(Clone, Debug)]
pub struct ServiceBuilder {
    name: String,
    stype: String,
    domain: Option<String>,
    host: Option<String>,
    port: u16,
    text: TxtData,
    addresses: Vec<IpAddr>,
    ttl_ptr: u32,
    ttl_srv: u32,
    ttl_txt: u32,
    ttl_a: u32,
}

impl ServiceBuilder {
    pub fn new(name: impl Into<String>, stype: impl Into<String>) -> ServiceBuilder {
        ServiceBuilder {
            name: name.into(),
            stype: stype.into(),
            domain: None,
            host: None,
            port: 0,
            text: TxtData::new(),
            addresses: Vec::new(),
            ttl_ptr: TTL_PTR,
            ttl_srv: TTL_SRV,
            ttl_txt: TTL_TXT,
            ttl_a: TTL_A,
        }
    }

    /// The domain to announce into; must start with a dot, e.g. `.local`.
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// The host the SRV record points at; defaults to the local host name.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Add a `key=value` TXT entry.
    pub fn text(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.text.insert(key, Some(value.into()));
        self
    }

    /// Add a bare-key TXT entry.
    pub fn text_flag(mut self, key: impl Into<String>) -> Self {
        self.text.insert(key, None);
        self
    }

    pub fn text_all(mut self, text: TxtData) -> Self {
        for (k, v) in text.iter() {
            self.text.insert(k, v.map(str::to_string));
        }
        self
    }

    /// Advertise a specific address instead of every local address.
    pub fn address(mut self, addr: IpAddr) -> Self {
        self.addresses.push(addr);
        self
    }

    pub fn ttl_ptr(mut self, ttl: u32) -> Self {
        self.ttl_ptr = ttl;
        self
    }

    pub fn ttl_srv(mut self, ttl: u32) -> Self {
        self.ttl_srv = ttl;
        self
    }

    pub fn ttl_txt(mut self, ttl: u32) -> Self {
        self.ttl_txt = ttl;
        self
    }

    pub fn ttl_a(mut self, ttl: u32) -> Self {
        self.ttl_a = ttl;
        self
    }

    pub fn build(self, zeroconf: &Zeroconf) -> Result<Service> {
        self.build_with_shared(zeroconf.shared())
    }

    pub(crate) fn build_with_shared(self, shared: &Arc<Shared>) -> Result<Service> {
        if self.name.is_empty() {
            return Err(Error::ErrInvalidServiceName);
        }
        if !self.name.chars().all(|c| (' '..='~').contains(&c)) {
            return Err(Error::ErrInvalidServiceName);
        }
        let dot = match self.stype.find('.') {
            Some(ix) if ix > 0 && ix + 1 < self.stype.len() => ix,
            _ => return Err(Error::ErrInvalidServiceType),
        };
        if !self.stype.starts_with('_') || self.stype.as_bytes()[dot + 1] != b'_' {
            return Err(Error::ErrInvalidServiceType);
        }
        if let Some(domain) = &self.domain {
            if domain.len() < 2 || !domain.starts_with('.') {
                return Err(Error::ErrInvalidDomain);
            }
        }
        if let Some(host) = &self.host {
            if host.is_empty() {
                return Err(Error::ErrInvalidServiceName);
            }
        }
        if self.port == 0 {
            return Err(Error::ErrInvalidPortNumber);
        }
        for ttl in [self.ttl_ptr, self.ttl_srv, self.ttl_txt, self.ttl_a] {
            if !(TTL_MIN..=TTL_MAX).contains(&ttl) {
                return Err(Error::ErrTtlOutOfRange);
            }
        }

        let domain = self
            .domain
            .unwrap_or_else(|| shared.config.read().unwrap().domain.clone());
        let fqdn = format!("{}.{}{}", escape_label(&self.name), self.stype, domain);
        let service = Service::new(
            Arc::downgrade(shared),
            shared.id,
            fqdn,
            self.name,
            self.stype,
            domain,
            true,
            [self.ttl_ptr, self.ttl_srv, self.ttl_txt, self.ttl_a],
        );
        // Only store an explicit host; otherwise the local host name is
        // resolved live whenever the announcement packet is built.
        match self.host {
            Some(host) => {
                service.set_host(&host, self.port);
            }
            None => {
                service.inner.state.write().unwrap().port = Some(self.port);
            }
        }
        for addr in self.addresses {
            service.add_address(addr, None);
        }
        if !self.text.is_empty() {
            service.set_text_internal(Some(self.text));
        }
        Ok(service)
    }
}
