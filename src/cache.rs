//! The live cache of announced and heard services.
//!
//! Only the engine thread mutates these maps; everything else reads
//! snapshots through the accessors, so no reader can observe a service
//! mid-integration.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::message::packet::Packet;
use crate::service::Service;

#[derive(Default)]
pub(crate) struct ServiceCache {
    /// Heard services keyed by fqdn.
    heard: RwLock<HashMap<String, Service>>,
    /// Heard service types, e.g. `_http._tcp.local`.
    types: RwLock<HashSet<String>>,
    /// Heard fully-qualified instance names.
    names: RwLock<HashSet<String>>,
    /// Announced services with their retained announcement packet, keyed
    /// by fqdn. The packet is reused for reannounce and goodbye.
    announced: RwLock<HashMap<String, (Service, Packet)>>,
}

impl ServiceCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    // Heard services.

    pub(crate) fn heard_services(&self) -> Vec<Service> {
        self.heard.read().unwrap().values().cloned().collect()
    }

    pub(crate) fn get_heard(&self, fqdn: &str) -> Option<Service> {
        self.heard.read().unwrap().get(fqdn).cloned()
    }

    pub(crate) fn contains_heard(&self, fqdn: &str) -> bool {
        self.heard.read().unwrap().contains_key(fqdn)
    }

    /// Insert unless present; returns true when the service was new.
    pub(crate) fn insert_heard_if_absent(&self, service: &Service) -> bool {
        let mut heard = self.heard.write().unwrap();
        if heard.contains_key(service.fqdn()) {
            false
        } else {
            heard.insert(service.fqdn().to_string(), service.clone());
            true
        }
    }

    pub(crate) fn remove_heard(&self, fqdn: &str) -> Option<Service> {
        self.heard.write().unwrap().remove(fqdn)
    }

    // Heard type and instance names.

    pub(crate) fn types(&self) -> Vec<String> {
        self.types.read().unwrap().iter().cloned().collect()
    }

    pub(crate) fn add_type(&self, stype: &str) -> bool {
        self.types.write().unwrap().insert(stype.to_string())
    }

    pub(crate) fn remove_type(&self, stype: &str) -> bool {
        self.types.write().unwrap().remove(stype)
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.names.read().unwrap().iter().cloned().collect()
    }

    pub(crate) fn add_name(&self, fqdn: &str) -> bool {
        self.names.write().unwrap().insert(fqdn.to_string())
    }

    pub(crate) fn remove_name(&self, fqdn: &str) -> bool {
        self.names.write().unwrap().remove(fqdn)
    }

    // Announced services.

    pub(crate) fn announced_services(&self) -> Vec<Service> {
        self.announced
            .read()
            .unwrap()
            .values()
            .map(|(s, _)| s.clone())
            .collect()
    }

    pub(crate) fn announced_packets(&self) -> Vec<(Service, Packet)> {
        self.announced.read().unwrap().values().cloned().collect()
    }

    pub(crate) fn is_announced(&self, fqdn: &str) -> bool {
        self.announced.read().unwrap().contains_key(fqdn)
    }

    pub(crate) fn get_announced(&self, fqdn: &str) -> Option<Service> {
        self.announced
            .read()
            .unwrap()
            .get(fqdn)
            .map(|(s, _)| s.clone())
    }

    pub(crate) fn insert_announced(&self, service: Service, packet: Packet) {
        self.announced
            .write()
            .unwrap()
            .insert(service.fqdn().to_string(), (service, packet));
    }

    pub(crate) fn remove_announced(&self, fqdn: &str) -> Option<(Service, Packet)> {
        self.announced.write().unwrap().remove(fqdn)
    }
}
