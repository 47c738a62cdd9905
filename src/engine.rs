//! The engine: one thread that owns every piece of mutable state and runs
//! the multicast I/O loop.
//!
//! External threads interact with the engine in exactly three ways: they
//! enqueue a packet and wake the selector, they push an interface intent,
//! or they read snapshots of the cache. Everything else - socket work,
//! packet dispatch, expiry, topology reconciliation - happens inside the
//! loop, in a fixed order per iteration:
//!
//! 1. pop one outbound packet and fan it out to the matching interfaces
//! 2. wait for readable sockets (at most five seconds)
//! 3. decode and dispatch whatever arrived
//! 4. run the expiry wheel
//! 5. reconcile interface addresses, reannouncing owned services on change

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Duration;

use bytes::BytesMut;
use mio::{Events, Poll, Token, Waker};

use crate::cache::ServiceCache;
use crate::config::{
    Config, DISCOVERY_NAME, MAX_PACKET_SIZE, MDNS_DEST_V4, MDNS_DEST_V6, PROBE_INTERVAL,
    PROBE_ROUNDS, SELECT_TIMEOUT,
};
use crate::events::{self, ZeroconfListener};
use crate::expiry::{ExpiryKey, ExpiryWheel};
use crate::iface::{scan_interfaces, NicInfo, NicState};
use crate::message::packet::Packet;
use crate::message::record::Record;
use crate::message::RecordType;
use crate::service::{escape_label, split_fqdn, Service};

pub(crate) const WAKER_TOKEN: Token = Token(0);

pub(crate) const STATE_NEW: u8 = 0;
pub(crate) const STATE_RUNNING: u8 = 1;
pub(crate) const STATE_CANCELLED: u8 = 2;

static ENGINE_IDS: AtomicU64 = AtomicU64::new(1);

pub(crate) enum NicIntent {
    Add { name: String, manual: bool },
    Remove(String),
}

/// State shared between the engine thread and the public handles. The
/// engine is the only writer of the cache and address map; the queues are
/// the only way in.
pub(crate) struct Shared {
    pub(crate) id: u64,
    pub(crate) config: RwLock<Config>,
    pub(crate) cache: ServiceCache,
    listeners: RwLock<Vec<Arc<dyn ZeroconfListener>>>,
    sendq: Mutex<VecDeque<Packet>>,
    intents: Mutex<Vec<NicIntent>>,
    local_addrs: RwLock<BTreeMap<String, Vec<IpAddr>>>,
    state: AtomicU8,
    waker: Waker,
}

impl Shared {
    pub(crate) fn new(config: Config, waker: Waker) -> Shared {
        Shared {
            id: ENGINE_IDS.fetch_add(1, Ordering::Relaxed),
            config: RwLock::new(config),
            cache: ServiceCache::new(),
            listeners: RwLock::new(Vec::new()),
            sendq: Mutex::new(VecDeque::new()),
            intents: Mutex::new(Vec::new()),
            local_addrs: RwLock::new(BTreeMap::new()),
            state: AtomicU8::new(STATE_NEW),
            waker,
        }
    }

    pub(crate) fn state(&self) -> u8 {
        self.state.load(Ordering::SeqCst)
    }

    pub(crate) fn set_state(&self, state: u8) {
        self.state.store(state, Ordering::SeqCst);
    }

    pub(crate) fn wake(&self) {
        let _ = self.waker.wake();
    }

    /// Queue a packet for the loop to send and wake the selector.
    pub(crate) fn send(&self, packet: Packet) {
        self.sendq.lock().unwrap().push_back(packet);
        self.wake();
    }

    pub(crate) fn pop(&self) -> Option<Packet> {
        self.sendq.lock().unwrap().pop_front()
    }

    pub(crate) fn push_intent(&self, intent: NicIntent) {
        self.intents.lock().unwrap().push(intent);
        self.wake();
    }

    pub(crate) fn take_intents(&self) -> Vec<NicIntent> {
        std::mem::take(&mut *self.intents.lock().unwrap())
    }

    pub(crate) fn add_listener(&self, listener: Arc<dyn ZeroconfListener>) {
        let mut listeners = self.listeners.write().unwrap();
        if !listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            listeners.push(listener);
        }
    }

    pub(crate) fn remove_listener(&self, listener: &Arc<dyn ZeroconfListener>) {
        self.listeners
            .write()
            .unwrap()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub(crate) fn notify<F>(&self, f: F)
    where
        F: Fn(&dyn ZeroconfListener),
    {
        let listeners = self.listeners.read().unwrap().clone();
        events::notify(&listeners, f);
    }

    pub(crate) fn set_local_addresses(&self, nic: &str, addrs: Vec<IpAddr>) {
        self.local_addrs
            .write()
            .unwrap()
            .insert(nic.to_string(), addrs);
    }

    pub(crate) fn clear_local_addresses(&self, nic: &str) {
        self.local_addrs.write().unwrap().remove(nic);
    }

    /// Every address of every interface in use.
    pub(crate) fn local_addresses(&self) -> Vec<IpAddr> {
        let map = self.local_addrs.read().unwrap();
        let mut out: Vec<IpAddr> = Vec::new();
        for addrs in map.values() {
            for addr in addrs {
                if !out.contains(addr) {
                    out.push(*addr);
                }
            }
        }
        out
    }

    pub(crate) fn interface_names(&self) -> Vec<String> {
        self.local_addrs.read().unwrap().keys().cloned().collect()
    }

    /// Probe for the name and, when the link stays quiet, announce the
    /// service. Blocks the calling thread for up to three probe rounds.
    pub(crate) fn announce(&self, service: &Service) -> bool {
        let fqdn = service.fqdn().to_string();
        if self.cache.is_announced(&fqdn) || self.cache.contains_heard(&fqdn) {
            return false;
        }

        let probe = Packet::question(Record::question(RecordType::Any, fqdn.clone()));
        let watch = Arc::new(ProbeWatch {
            fqdn,
            matched: Mutex::new(false),
            cond: Condvar::new(),
        });
        let listener: Arc<dyn ZeroconfListener> = watch.clone();
        self.add_listener(listener.clone());
        for _ in 0..PROBE_ROUNDS {
            if watch.is_matched() {
                break;
            }
            self.send(probe.clone());
            watch.wait(PROBE_INTERVAL);
        }
        self.remove_listener(&listener);

        if watch.is_matched() {
            return false;
        }
        self.reannounce(service);
        true
    }

    /// Build the announcement packet, retain it and queue it.
    pub(crate) fn reannounce(&self, service: &Service) {
        let packet = Packet::announcement(service);
        self.cache.insert_announced(service.clone(), packet.clone());
        self.send(packet);
    }

    /// Send the goodbye (every record with TTL 0) and drop the service
    /// from the announced map.
    pub(crate) fn unannounce(&self, service: &Service) -> bool {
        match self.cache.remove_announced(service.fqdn()) {
            Some((_, packet)) => {
                self.send(packet.goodbye());
                true
            }
            None => false,
        }
    }

    /// Ask the link about types or services. `stype` of `None` enumerates
    /// known types; a bare name asks for instances of the type; both ask
    /// for one instance's details.
    pub(crate) fn query(&self, stype: Option<&str>, name: Option<&str>, rtype: RecordType) {
        let stype = match stype {
            None => {
                self.send(Packet::question(Record::question(
                    RecordType::Ptr,
                    DISCOVERY_NAME,
                )));
                return;
            }
            Some(s) => s,
        };
        let mut full = stype.trim_end_matches('.').to_string();
        if let Some(ix) = full.find('.') {
            if ix > 0 && full[ix + 1..].find('.').is_none() {
                full.push_str(&self.config.read().unwrap().domain);
            }
        }
        match name {
            None => self.send(Packet::question(Record::question(RecordType::Ptr, full))),
            Some(name) => {
                let fqdn = format!("{}.{}", escape_label(name), full);
                self.send(Packet::question(Record::question(rtype, fqdn)));
            }
        }
    }
}

/// Watches probe responses; any answer whose name matches the probed fqdn
/// (case-insensitively) aborts the claim.
struct ProbeWatch {
    fqdn: String,
    matched: Mutex<bool>,
    cond: Condvar,
}

impl ProbeWatch {
    fn is_matched(&self) -> bool {
        *self.matched.lock().unwrap()
    }

    fn wait(&self, timeout: Duration) {
        let guard = self.matched.lock().unwrap();
        let _ = self
            .cond
            .wait_timeout_while(guard, timeout, |matched| !*matched);
    }
}

impl ZeroconfListener for ProbeWatch {
    fn packet_received(&self, packet: &Packet) {
        if !packet.is_response() {
            return;
        }
        for r in packet.answers() {
            if r.name().eq_ignore_ascii_case(&self.fqdn) {
                *self.matched.lock().unwrap() = true;
                self.cond.notify_all();
            }
        }
    }
}

/// The loop itself, owned by the engine thread.
pub(crate) struct Engine {
    shared: Arc<Shared>,
    poll: Poll,
    events: Events,
    nics: Vec<NicState>,
    next_token: usize,
    expiry: ExpiryWheel,
    rx_buf: BytesMut,
    tx_buf: Vec<u8>,
}

impl Engine {
    pub(crate) fn new(shared: Arc<Shared>, poll: Poll) -> Engine {
        Engine {
            shared,
            poll,
            events: Events::with_capacity(64),
            nics: Vec::new(),
            next_token: 1,
            expiry: ExpiryWheel::new(),
            rx_buf: BytesMut::zeroed(MAX_PACKET_SIZE),
            tx_buf: Vec::with_capacity(MAX_PACKET_SIZE),
        }
    }

    pub(crate) fn run(mut self) {
        log::debug!("engine thread started");
        while self.shared.state() == STATE_RUNNING {
            self.apply_intents();

            if let Some(packet) = self.shared.pop() {
                self.transmit(&packet);
            }

            if let Err(e) = self.poll.poll(&mut self.events, Some(SELECT_TIMEOUT)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    log::debug!("poll error: {e}");
                }
            }
            let tokens: Vec<Token> = self.events.iter().map(|e| e.token()).collect();
            for token in tokens {
                if token != WAKER_TOKEN {
                    self.drain_socket(token);
                }
            }

            self.expiry.tick();
            self.reconcile_all();
        }
        self.shutdown();
    }

    fn families(&self) -> (bool, bool) {
        let config = self.shared.config.read().unwrap();
        (config.ipv4_enabled, config.ipv6_enabled)
    }

    fn apply_intents(&mut self) {
        let intents = self.shared.take_intents();
        if intents.is_empty() {
            return;
        }
        let scan = scan_interfaces();
        let (ipv4, ipv6) = self.families();
        for intent in intents {
            match intent {
                NicIntent::Add { name, manual } => {
                    if self.nics.iter().any(|n| n.name == name) {
                        continue;
                    }
                    let mut nic = NicState::new(name, manual);
                    let changed = nic.reconcile(
                        &scan,
                        self.poll.registry(),
                        &mut self.next_token,
                        ipv4,
                        ipv6,
                        false,
                    );
                    self.shared.set_local_addresses(&nic.name, nic.addresses());
                    let name = nic.name.clone();
                    self.nics.push(nic);
                    if changed {
                        self.shared.notify(|l| l.topology_change(&name));
                    }
                }
                NicIntent::Remove(name) => {
                    let pos = match self.nics.iter().position(|n| n.name == name) {
                        Some(pos) => pos,
                        None => continue,
                    };
                    let mut nic = self.nics.remove(pos);
                    let changed = nic.reconcile(
                        &scan,
                        self.poll.registry(),
                        &mut self.next_token,
                        ipv4,
                        ipv6,
                        true,
                    );
                    nic.close_sockets(self.poll.registry());
                    self.shared.clear_local_addresses(&name);
                    if changed {
                        self.shared.notify(|l| l.topology_change(&name));
                    }
                }
            }
        }
    }

    /// Fan one packet out to every ready interface it applies to. A
    /// response goes only to the interface its question arrived on.
    fn transmit(&mut self, packet: &Packet) {
        let infos: Vec<NicInfo> = self.nics.iter().map(NicState::info).collect();
        for (i, nic) in self.nics.iter_mut().enumerate() {
            if !nic.has_sockets() || nic.is_disabled() {
                continue;
            }
            if let Some(target) = packet.nic() {
                if target != nic.name {
                    continue;
                }
            }
            let dup = match packet.applied_to(&infos[i], &infos) {
                Some(dup) => dup,
                None => continue,
            };
            self.tx_buf.clear();
            if let Err(e) = dup.encode(&mut self.tx_buf) {
                log::debug!("encode failed: {e}");
                continue;
            }
            let mut sent = false;
            let mut failure: Option<io::Error> = None;
            if let Some(sock) = &nic.sock_v4 {
                match sock.send_to(&self.tx_buf, MDNS_DEST_V4) {
                    Ok(_) => sent = true,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => failure = Some(e),
                }
            }
            if let Some(sock) = &nic.sock_v6 {
                match sock.send_to(&self.tx_buf, MDNS_DEST_V6) {
                    Ok(_) => sent = true,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => failure = Some(e),
                }
            }
            if sent {
                nic.note_sent();
            }
            if let Some(e) = failure {
                nic.note_send_failure(&e);
            }
            if sent {
                self.shared.notify(|l| l.packet_sent(&dup));
            }
        }
    }

    fn drain_socket(&mut self, token: Token) {
        let mut packets: Vec<Packet> = Vec::new();
        let mut parse_errors: Vec<String> = Vec::new();
        let nic_name;
        {
            let nic = match self.nics.iter().find(|n| n.socket_for(token).is_some()) {
                Some(nic) => nic,
                None => return,
            };
            nic_name = nic.name.clone();
            let sock = match nic.socket_for(token) {
                Some(sock) => sock,
                None => return,
            };
            loop {
                match sock.recv_from(&mut self.rx_buf[..]) {
                    Ok((len, _src)) if len > 0 => {
                        match Packet::decode(&self.rx_buf[..len], Some(nic_name.clone())) {
                            Ok(packet) => packets.push(packet),
                            Err(e) => parse_errors.push(e.to_string()),
                        }
                    }
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        log::debug!("recv on \"{nic_name}\": {e}");
                        break;
                    }
                }
            }
        }
        for message in parse_errors {
            log::debug!("dropping undecodable packet on \"{nic_name}\": {message}");
            let placeholder = Packet::empty(Some(nic_name.clone()));
            self.shared.notify(|l| l.packet_error(&placeholder, &message));
        }
        for packet in packets {
            self.process_packet(packet);
        }
    }

    /// Dispatch one inbound packet: listeners first, then our answers to
    /// its questions, then integration of its answers into the cache.
    ///
    /// Integration runs in six passes - PTR answers, PTR additionals, SRV
    /// answers, SRV additionals, everything else in answers, everything
    /// else in additionals - so a record never arrives before the record
    /// it depends on.
    pub(crate) fn process_packet(&mut self, packet: Packet) {
        self.shared.notify(|l| l.packet_received(&packet));
        self.process_questions(&packet);

        let mut added: Vec<Service> = Vec::new();
        let mut modified: Vec<Service> = Vec::new();
        for pass in 0..6 {
            let records: Vec<Record> = if pass % 2 == 0 {
                packet.answers().to_vec()
            } else {
                packet.additionals().to_vec()
            };
            for r in &records {
                let wanted = match pass {
                    0 | 1 => r.rtype() == RecordType::Ptr,
                    2 | 3 => r.rtype() == RecordType::Srv,
                    _ => r.rtype() != RecordType::Ptr && r.rtype() != RecordType::Srv,
                };
                if !wanted {
                    continue;
                }
                for service in self.integrate(r, &packet, None) {
                    if self.shared.cache.insert_heard_if_absent(&service) {
                        if !added.contains(&service) {
                            added.push(service);
                        }
                    } else if !modified.contains(&service) {
                        modified.push(service);
                    }
                }
            }
        }
        modified.retain(|s| !added.contains(s));
        for service in &modified {
            self.shared.notify(|l| l.service_modified(service));
        }
        for service in &added {
            self.shared.notify(|l| l.service_announced(service));
        }
    }

    /// Answer the questions we are authoritative for, with the DNS-SD
    /// additionals of RFC 6763 section 12.
    fn process_questions(&self, packet: &Packet) {
        let mut answers: Vec<Record> = Vec::new();
        let mut additionals: Vec<Record> = Vec::new();
        for question in packet.questions() {
            if question.name() == DISCOVERY_NAME
                && matches!(question.rtype(), RecordType::Ptr | RecordType::Any)
            {
                // One PTR per distinct announced type, at the largest PTR
                // TTL among that type's services.
                let mut ttls: BTreeMap<String, u32> = BTreeMap::new();
                for service in self.shared.cache.announced_services() {
                    let type_domain =
                        format!("{}{}", service.service_type(), service.domain());
                    let ttl = ttls.entry(type_domain).or_insert(0);
                    *ttl = (*ttl).max(service.ttl_ptr());
                }
                for (type_domain, ttl) in ttls {
                    answers.push(Record::ptr(ttl, DISCOVERY_NAME, type_domain));
                }
            } else {
                for (_, announced) in self.shared.cache.announced_packets() {
                    for answer in announced.answers() {
                        if question.name() != answer.name() {
                            continue;
                        }
                        if question.rtype() != answer.rtype()
                            && question.rtype() != RecordType::Any
                        {
                            continue;
                        }
                        answers.push(answer.clone());
                        if answer.rtype() == RecordType::Ptr
                            && question.rtype() != RecordType::Any
                        {
                            for a in announced.answers().iter().chain(announced.additionals()) {
                                if matches!(
                                    a.rtype(),
                                    RecordType::Srv
                                        | RecordType::A
                                        | RecordType::Aaaa
                                        | RecordType::Txt
                                ) {
                                    additionals.push(a.clone());
                                }
                            }
                        } else if answer.rtype() == RecordType::Srv
                            && question.rtype() != RecordType::Any
                        {
                            for a in announced.answers().iter().chain(announced.additionals()) {
                                if matches!(
                                    a.rtype(),
                                    RecordType::A | RecordType::Aaaa | RecordType::Txt
                                ) {
                                    additionals.push(a.clone());
                                }
                            }
                        }
                    }
                }
            }
        }
        if !answers.is_empty() {
            self.shared
                .send(Packet::response_to(packet, answers, additionals));
        }
    }

    /// Fold one answer record into the cache. Returns the services it
    /// touched. A record with TTL 0 is a goodbye: it never creates or
    /// modifies anything, it only schedules removal at the next tick.
    fn integrate(&mut self, r: &Record, packet: &Packet, service: Option<Service>) -> Vec<Service> {
        let expiring = r.ttl() == 0;
        let shared = Arc::clone(&self.shared);
        match r.rtype() {
            RecordType::Ptr if r.name() == DISCOVERY_NAME => {
                // rdata names a service type
                if let Some(stype) = r.ptr_value().map(str::to_string) {
                    self.integrate_type(&stype, r.ttl(), expiring);
                }
                Vec::new()
            }
            RecordType::Ptr => {
                let stype = r.name().to_string();
                let fqdn = match r.ptr_value().map(str::to_string) {
                    Some(fqdn) => fqdn,
                    None => return Vec::new(),
                };
                self.integrate_type(&stype, r.ttl(), expiring);
                if fqdn.ends_with(&stype) && fqdn.len() > stype.len() {
                    if expiring || shared.cache.add_name(&fqdn) {
                        let name = fqdn[..fqdn.len() - stype.len() - 1].to_string();
                        if !expiring {
                            shared.notify(|l| l.service_named(&stype, &name));
                        }
                        let f = fqdn.clone();
                        self.expiry.schedule(
                            ExpiryKey::Name(fqdn),
                            r.ttl(),
                            Box::new(move || {
                                shared.cache.remove_name(&f);
                                shared.notify(|l| l.service_name_expired(&stype, &name));
                            }),
                        );
                    }
                } else {
                    let message =
                        format!("PTR name \"{fqdn}\" doesn't end with type \"{stype}\"");
                    shared.notify(|l| l.packet_error(packet, &message));
                }
                Vec::new()
            }
            RecordType::Srv => {
                let fqdn = r.name().to_string();
                let target = match r.srv_target().map(str::to_string) {
                    Some(target) => target,
                    None => return Vec::new(),
                };
                let port = r.srv_port().unwrap_or(0);
                let mut service = shared.cache.get_heard(&fqdn);
                let mut modified = false;
                if service.is_none() {
                    match split_fqdn(&fqdn) {
                        Some((name, stype, domain)) => {
                            if let Some(own) = shared.cache.get_announced(&fqdn) {
                                service = Some(own);
                                modified = true;
                            } else if !expiring {
                                service = Some(Service::new_heard(
                                    Arc::downgrade(&self.shared),
                                    self.shared.id,
                                    &fqdn,
                                    name,
                                    stype,
                                    domain,
                                ));
                                modified = true;
                            }
                        }
                        None => {
                            let message = format!("couldn't split SRV name \"{fqdn}\"");
                            shared.notify(|l| l.packet_error(packet, &message));
                        }
                    }
                }
                let service = match service {
                    Some(service) => service,
                    None => return Vec::new(),
                };
                if shared.cache.is_announced(&fqdn) {
                    // Our own record echoed back; refresh it shortly
                    // before the link would expire it.
                    let ttl = std::cmp::min(
                        r.ttl().saturating_mul(9) / 10,
                        r.ttl().saturating_sub(5),
                    );
                    let refresh = service.clone();
                    self.expiry.schedule(
                        ExpiryKey::Service(fqdn),
                        ttl,
                        Box::new(move || {
                            if shared.cache.is_announced(refresh.fqdn()) {
                                shared.reannounce(&refresh);
                            }
                        }),
                    );
                    vec![service]
                } else {
                    if !expiring && service.set_host(&target, port) {
                        modified = true;
                    }
                    let expired = service.clone();
                    let f = fqdn.clone();
                    self.expiry.schedule(
                        ExpiryKey::Service(fqdn),
                        r.ttl(),
                        Box::new(move || {
                            shared.cache.remove_heard(&f);
                            shared.notify(|l| l.service_expired(&expired));
                        }),
                    );
                    if modified {
                        vec![service]
                    } else {
                        Vec::new()
                    }
                }
            }
            RecordType::Txt => {
                let fqdn = r.name().to_string();
                let service = match service.or_else(|| shared.cache.get_heard(&fqdn)) {
                    Some(service) => service,
                    None => return Vec::new(),
                };
                if service.fqdn() != fqdn || shared.cache.is_announced(&fqdn) {
                    return Vec::new();
                }
                let text = r.text().cloned().unwrap_or_default();
                let modified = !expiring && service.set_text_internal(Some(text));
                let wiped = service.clone();
                self.expiry.schedule(
                    ExpiryKey::Txt(fqdn),
                    r.ttl(),
                    Box::new(move || {
                        if wiped.set_text_internal(None) {
                            shared.notify(|l| l.service_modified(&wiped));
                        }
                    }),
                );
                if modified {
                    vec![service]
                } else {
                    Vec::new()
                }
            }
            RecordType::A | RecordType::Aaaa => {
                let host = r.name().to_string();
                let addr = match r.address() {
                    Some(addr) => addr,
                    None => return Vec::new(),
                };
                match service {
                    None => {
                        let mut out = Vec::new();
                        for candidate in shared.cache.heard_services() {
                            if candidate.host().as_deref() == Some(host.as_str()) {
                                out.extend(self.integrate(r, packet, Some(candidate)));
                            }
                        }
                        out
                    }
                    Some(service) => {
                        if service.host().as_deref() != Some(host.as_str())
                            || shared.cache.is_announced(service.fqdn())
                        {
                            return Vec::new();
                        }
                        let modified = !expiring && service.add_address(addr, packet.nic());
                        let dropped = service.clone();
                        self.expiry.schedule(
                            ExpiryKey::Addr(host, addr),
                            r.ttl(),
                            Box::new(move || {
                                if dropped.remove_address(addr) {
                                    shared.notify(|l| l.service_modified(&dropped));
                                }
                            }),
                        );
                        if modified {
                            vec![service]
                        } else {
                            Vec::new()
                        }
                    }
                }
            }
            // NSEC and CNAME decode but carry nothing the cache wants.
            _ => Vec::new(),
        }
    }

    fn integrate_type(&mut self, stype: &str, ttl: u32, expiring: bool) {
        let shared = Arc::clone(&self.shared);
        if expiring || shared.cache.add_type(stype) {
            if !expiring {
                let stype = stype.to_string();
                shared.notify(|l| l.type_named(&stype));
            }
            let t = stype.to_string();
            self.expiry.schedule(
                ExpiryKey::Type(stype.to_string()),
                ttl,
                Box::new(move || {
                    shared.cache.remove_type(&t);
                    shared.notify(|l| l.type_name_expired(&t));
                }),
            );
        }
    }

    fn reconcile_all(&mut self) {
        if self.nics.is_empty() {
            return;
        }
        let scan = scan_interfaces();
        let (ipv4, ipv6) = self.families();
        let mut changed: Vec<String> = Vec::new();
        for nic in &mut self.nics {
            if nic.reconcile(
                &scan,
                self.poll.registry(),
                &mut self.next_token,
                ipv4,
                ipv6,
                false,
            ) {
                self.shared.set_local_addresses(&nic.name, nic.addresses());
                changed.push(nic.name.clone());
            }
        }
        if changed.is_empty() {
            return;
        }
        // Address changes must reach the link: every owned service is
        // reannounced with the fresh address set.
        for service in self.shared.cache.announced_services() {
            self.shared.reannounce(&service);
        }
        for name in changed {
            self.shared.notify(|l| l.topology_change(&name));
        }
    }

    fn shutdown(&mut self) {
        // Goodbyes queued by close() are still in the send queue.
        while let Some(packet) = self.shared.pop() {
            self.transmit(&packet);
        }
        for nic in &mut self.nics {
            nic.close_sockets(self.poll.registry());
        }
        log::debug!("engine thread stopped");
    }

    #[cfg(test)]
    pub(crate) fn expiry(&self) -> &ExpiryWheel {
        &self.expiry
    }

    #[cfg(test)]
    pub(crate) fn tick_expiry(&mut self) {
        self.expiry.tick();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ServiceBuilder;
    use std::net::Ipv4Addr;
    use std::time::Instant;

    fn test_engine() -> (Engine, Arc<Shared>) {
        let poll = Poll::new().unwrap();
        let waker = Waker::new(poll.registry(), WAKER_TOKEN).unwrap();
        let config = Config::default()
            .with_local_host_name("h")
            .with_network_interfaces(Vec::<String>::new());
        let shared = Arc::new(Shared::new(config, waker));
        shared.set_state(STATE_RUNNING);
        (Engine::new(Arc::clone(&shared), poll), shared)
    }

    fn web_service(shared: &Arc<Shared>) -> Service {
        ServiceBuilder::new("MyWeb", "_http._tcp")
            .port(8080)
            .text("path", "/path/to/service")
            .address(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)))
            .build_with_shared(shared)
            .unwrap()
    }

    fn parse(json: &str) -> Packet {
        Packet::parse(json).unwrap()
    }

    /// An unsolicited response announcing Other._http._tcp.local at
    /// peer.local:9000 with a 60 second SRV TTL.
    fn other_announcement() -> Packet {
        parse(
            r#"{"id":0,"flags":33792,"response":true,"answers":[
                {"type":"ptr","name":"_http._tcp.local","class":1,"ttl":120,
                 "value":"Other._http._tcp.local"},
                {"type":"srv","name":"Other._http._tcp.local","class":1,"ttl":60,
                 "host":"peer.local","port":9000,"priority":0,"weight":0}]}"#,
        )
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl ZeroconfListener for Recorder {
        fn type_named(&self, stype: &str) {
            self.push(format!("type_named {stype}"));
        }

        fn type_name_expired(&self, stype: &str) {
            self.push(format!("type_name_expired {stype}"));
        }

        fn service_named(&self, stype: &str, name: &str) {
            self.push(format!("service_named {stype} {name}"));
        }

        fn service_announced(&self, service: &Service) {
            self.push(format!("service_announced {}", service.fqdn()));
        }

        fn service_modified(&self, service: &Service) {
            self.push(format!("service_modified {}", service.fqdn()));
        }

        fn service_expired(&self, service: &Service) {
            self.push(format!("service_expired {}", service.fqdn()));
        }

        fn packet_error(&self, _packet: &Packet, message: &str) {
            self.push(format!("packet_error {message}"));
        }
    }

    #[test]
    fn announcement_carries_full_service_tuple() {
        let (_engine, shared) = test_engine();
        let service = web_service(&shared);
        shared.reannounce(&service);

        let packet = shared.pop().expect("announcement queued");
        assert!(packet.is_response());
        assert!(packet.is_authoritative());

        let answers = packet.answers();
        assert_eq!(answers.len(), 3);
        assert_eq!(answers[0].rtype(), RecordType::Ptr);
        assert_eq!(answers[0].name(), "_http._tcp.local");
        assert_eq!(answers[0].ptr_value(), Some("MyWeb._http._tcp.local"));
        assert_eq!(answers[0].ttl(), 28_800);
        assert_eq!(answers[1].rtype(), RecordType::Srv);
        assert_eq!(answers[1].name(), "MyWeb._http._tcp.local");
        assert_eq!(answers[1].srv_target(), Some("h.local"));
        assert_eq!(answers[1].srv_port(), Some(8080));
        assert_eq!(answers[1].ttl(), 120);
        assert_eq!(answers[2].rtype(), RecordType::Txt);
        assert_eq!(
            answers[2].text().unwrap().get("path"),
            Some(&Some("/path/to/service".to_string()))
        );
        assert_eq!(answers[2].ttl(), 4_500);

        let additionals = packet.additionals();
        assert_eq!(additionals.len(), 1);
        assert_eq!(additionals[0].name(), "h.local");
        assert_eq!(
            additionals[0].address(),
            Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)))
        );
        assert_eq!(additionals[0].ttl(), 120);
    }

    #[test]
    fn goodbye_zeroes_every_record_and_forgets_the_service() {
        let (_engine, shared) = test_engine();
        let service = web_service(&shared);
        shared.reannounce(&service);
        let _ = shared.pop();

        assert!(shared.unannounce(&service));
        let goodbye = shared.pop().expect("goodbye queued");
        assert_eq!(goodbye.answers().len(), 3);
        assert_eq!(goodbye.additionals().len(), 1);
        for r in goodbye.answers().iter().chain(goodbye.additionals()) {
            assert_eq!(r.ttl(), 0);
        }
        assert!(shared.cache.announced_services().is_empty());
        assert!(!shared.unannounce(&service));
    }

    #[test]
    fn discovery_question_yields_one_ptr_per_type() {
        let (mut engine, shared) = test_engine();
        let service = web_service(&shared);
        shared.reannounce(&service);
        let _ = shared.pop();

        let question = Packet::question(Record::question(RecordType::Ptr, DISCOVERY_NAME));
        engine.process_packet(question);

        let response = shared.pop().expect("response queued");
        assert!(response.is_response());
        assert!(response.is_authoritative());
        assert_eq!(response.answers().len(), 1);
        let answer = &response.answers()[0];
        assert_eq!(answer.name(), DISCOVERY_NAME);
        assert_eq!(answer.ptr_value(), Some("_http._tcp.local"));
        assert_eq!(answer.ttl(), 28_800);
        assert!(response.additionals().is_empty());
    }

    #[test]
    fn targeted_ptr_question_gets_dns_sd_additionals() {
        let (mut engine, shared) = test_engine();
        let service = web_service(&shared);
        shared.reannounce(&service);
        let _ = shared.pop();

        let question = Packet::question(Record::question(RecordType::Ptr, "_http._tcp.local"));
        engine.process_packet(question);

        let response = shared.pop().expect("response queued");
        assert_eq!(response.answers().len(), 1);
        assert_eq!(
            response.answers()[0].ptr_value(),
            Some("MyWeb._http._tcp.local")
        );
        let kinds: Vec<RecordType> = response
            .additionals()
            .iter()
            .map(|r| r.rtype())
            .collect();
        assert_eq!(kinds, vec![RecordType::Srv, RecordType::Txt, RecordType::A]);
    }

    #[test]
    fn any_question_suppresses_additionals() {
        let (mut engine, shared) = test_engine();
        let service = web_service(&shared);
        shared.reannounce(&service);
        let _ = shared.pop();

        let question = Packet::question(Record::question(RecordType::Any, "_http._tcp.local"));
        engine.process_packet(question);

        let response = shared.pop().expect("response queued");
        assert_eq!(response.answers().len(), 1);
        assert!(response.additionals().is_empty());
    }

    #[test]
    fn unrelated_question_gets_no_answer() {
        let (mut engine, shared) = test_engine();
        let service = web_service(&shared);
        shared.reannounce(&service);
        let _ = shared.pop();

        let question = Packet::question(Record::question(RecordType::Ptr, "_ipp._tcp.local"));
        engine.process_packet(question);
        assert!(shared.pop().is_none());
    }

    #[test]
    fn incoming_srv_creates_service_and_schedules_expiry() {
        let (mut engine, shared) = test_engine();
        let recorder = Arc::new(Recorder::default());
        shared.add_listener(recorder.clone());

        let before = Instant::now();
        engine.process_packet(other_announcement());

        let events = recorder.events();
        assert!(events.contains(&"type_named _http._tcp.local".to_string()));
        assert!(events.contains(&"service_named _http._tcp.local Other".to_string()));
        assert!(events.contains(&"service_announced Other._http._tcp.local".to_string()));

        let service = shared
            .cache
            .get_heard("Other._http._tcp.local")
            .expect("service cached");
        assert_eq!(service.host().as_deref(), Some("peer.local"));
        assert_eq!(service.port(), Some(9000));
        assert!(!service.is_owned());

        // The expiry entry sits at now + ttl seconds, give or take the
        // tick granularity.
        let deadline = engine
            .expiry()
            .deadline(&ExpiryKey::Service("Other._http._tcp.local".to_string()))
            .expect("expiry scheduled");
        assert!(deadline >= before + Duration::from_secs(59));
        assert!(deadline <= Instant::now() + Duration::from_secs(61));
    }

    #[test]
    fn srv_goodbye_expires_service_on_next_tick() {
        let (mut engine, shared) = test_engine();
        engine.process_packet(other_announcement());
        assert!(shared.cache.contains_heard("Other._http._tcp.local"));

        let recorder = Arc::new(Recorder::default());
        shared.add_listener(recorder.clone());

        let goodbye = parse(
            r#"{"id":0,"flags":33792,"response":true,"answers":[
                {"type":"srv","name":"Other._http._tcp.local","class":1,"ttl":0,
                 "host":"peer.local","port":9000,"priority":0,"weight":0}]}"#,
        );
        engine.process_packet(goodbye);
        // The goodbye itself modifies nothing.
        assert!(shared.cache.contains_heard("Other._http._tcp.local"));
        assert!(recorder.events().is_empty());

        std::thread::sleep(Duration::from_millis(10));
        engine.tick_expiry();
        assert!(!shared.cache.contains_heard("Other._http._tcp.local"));
        assert!(recorder
            .events()
            .contains(&"service_expired Other._http._tcp.local".to_string()));
    }

    #[test]
    fn goodbye_for_unknown_name_creates_nothing() {
        let (mut engine, shared) = test_engine();
        let recorder = Arc::new(Recorder::default());
        shared.add_listener(recorder.clone());

        let goodbye = parse(
            r#"{"id":0,"flags":33792,"response":true,"answers":[
                {"type":"ptr","name":"_http._tcp.local","class":1,"ttl":0,
                 "value":"Gone._http._tcp.local"},
                {"type":"srv","name":"Gone._http._tcp.local","class":1,"ttl":0,
                 "host":"peer.local","port":9000,"priority":0,"weight":0}]}"#,
        );
        engine.process_packet(goodbye);

        assert!(shared.cache.heard_services().is_empty());
        assert!(shared.cache.types().is_empty());
        assert!(shared.cache.names().is_empty());
        let events = recorder.events();
        assert!(!events
            .iter()
            .any(|e| e.starts_with("service_announced") || e.starts_with("type_named")));
    }

    #[test]
    fn txt_update_modifies_but_never_creates() {
        let (mut engine, shared) = test_engine();
        let recorder = Arc::new(Recorder::default());
        shared.add_listener(recorder.clone());

        // TXT alone for an unknown service does nothing.
        let orphan_txt = r#"{"id":0,"flags":33792,"response":true,"answers":[
            {"type":"txt","name":"Other._http._tcp.local","class":1,"ttl":4500,
             "data":{"path":"/x"}}]}"#;
        engine.process_packet(parse(orphan_txt));
        assert!(shared.cache.heard_services().is_empty());

        engine.process_packet(other_announcement());
        engine.process_packet(parse(orphan_txt));

        let service = shared.cache.get_heard("Other._http._tcp.local").unwrap();
        assert_eq!(
            service.text().unwrap().get("path"),
            Some(&Some("/x".to_string()))
        );
        assert!(recorder
            .events()
            .contains(&"service_modified Other._http._tcp.local".to_string()));
    }

    #[test]
    fn address_binds_to_services_by_host() {
        let (mut engine, shared) = test_engine();
        engine.process_packet(other_announcement());

        let addresses = parse(
            r#"{"id":0,"flags":33792,"response":true,"answers":[
                {"type":"a","name":"peer.local","class":1,"ttl":120,
                 "address":"192.0.2.77"}]}"#,
        );
        engine.process_packet(addresses);

        let service = shared.cache.get_heard("Other._http._tcp.local").unwrap();
        assert_eq!(
            service.addresses(),
            vec![IpAddr::V4(Ipv4Addr::new(192, 0, 2, 77))]
        );
        // Address records alone never create services.
        assert_eq!(shared.cache.heard_services().len(), 1);
    }

    #[test]
    fn own_echo_schedules_refresh_before_ttl() {
        let (mut engine, shared) = test_engine();
        let service = web_service(&shared);
        shared.reannounce(&service);
        let announcement = shared.pop().unwrap();

        let before = Instant::now();
        engine.process_packet(announcement);

        // min(120 * 9/10, 120 - 5) = 108 seconds.
        let deadline = engine
            .expiry()
            .deadline(&ExpiryKey::Service("MyWeb._http._tcp.local".to_string()))
            .expect("refresh scheduled");
        assert!(deadline >= before + Duration::from_secs(107));
        assert!(deadline <= Instant::now() + Duration::from_secs(109));
    }

    #[test]
    fn probe_match_aborts_announce() {
        let (mut engine, shared) = test_engine();
        let service = web_service(&shared);

        let announcer = {
            let shared = Arc::clone(&shared);
            let service = service.clone();
            std::thread::spawn(move || shared.announce(&service))
        };

        // Let the first probe go out, then claim the name from "elsewhere".
        std::thread::sleep(Duration::from_millis(120));
        let defender = parse(
            r#"{"id":0,"flags":33792,"response":true,"answers":[
                {"type":"srv","name":"myweb._HTTP._tcp.local","class":1,"ttl":120,
                 "host":"peer.local","port":9000,"priority":0,"weight":0}]}"#,
        );
        engine.process_packet(defender);

        assert!(!announcer.join().unwrap());
        assert!(!shared.cache.is_announced("MyWeb._http._tcp.local"));
    }

    #[test]
    fn announce_refuses_names_already_heard() {
        let (mut engine, shared) = test_engine();
        let defender = parse(
            r#"{"id":0,"flags":33792,"response":true,"answers":[
                {"type":"srv","name":"MyWeb._http._tcp.local","class":1,"ttl":120,
                 "host":"peer.local","port":9000,"priority":0,"weight":0}]}"#,
        );
        engine.process_packet(defender);

        let service = web_service(&shared);
        assert!(!shared.announce(&service));
        assert!(shared.cache.announced_services().is_empty());
    }

    #[test]
    fn ptr_rdata_must_end_with_type() {
        let (mut engine, shared) = test_engine();
        let recorder = Arc::new(Recorder::default());
        shared.add_listener(recorder.clone());

        let bogus = parse(
            r#"{"id":0,"flags":33792,"response":true,"answers":[
                {"type":"ptr","name":"_http._tcp.local","class":1,"ttl":120,
                 "value":"Other._ipp._tcp.local"}]}"#,
        );
        engine.process_packet(bogus);

        assert!(shared.cache.names().is_empty());
        assert!(recorder
            .events()
            .iter()
            .any(|e| e.starts_with("packet_error")));
    }

    #[test]
    fn modified_set_excludes_new_services() {
        let (mut engine, shared) = test_engine();
        let recorder = Arc::new(Recorder::default());
        shared.add_listener(recorder.clone());

        // PTR, SRV and TXT in one packet: the service is new, so only
        // service_announced fires even though TXT also touched it.
        let combined = parse(
            r#"{"id":0,"flags":33792,"response":true,"answers":[
                {"type":"ptr","name":"_http._tcp.local","class":1,"ttl":120,
                 "value":"Other._http._tcp.local"},
                {"type":"srv","name":"Other._http._tcp.local","class":1,"ttl":60,
                 "host":"peer.local","port":9000,"priority":0,"weight":0},
                {"type":"txt","name":"Other._http._tcp.local","class":1,"ttl":4500,
                 "data":{"path":"/x"}}]}"#,
        );
        engine.process_packet(combined);

        let events = recorder.events();
        assert!(events.contains(&"service_announced Other._http._tcp.local".to_string()));
        assert!(!events.contains(&"service_modified Other._http._tcp.local".to_string()));
    }
}
