//! Listener interface for everything the engine observes.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::message::packet::Packet;
use crate::service::Service;

/// Receives events from the engine thread.
///
/// Every method has a no-op default, so an implementation only overrides
/// what it cares about. Callbacks run inline on the engine thread and must
/// not block; a panicking callback is caught and logged so it cannot halt
/// the loop.
#[allow(unused_variables)]
pub trait ZeroconfListener: Send + Sync {
    /// A packet was sent on an interface.
    fn packet_sent(&self, packet: &Packet) {}

    /// A packet was received and decoded.
    fn packet_received(&self, packet: &Packet) {}

    /// Something about a packet could not be handled; the packet (possibly
    /// empty, when it never decoded) and a description are supplied.
    fn packet_error(&self, packet: &Packet, message: &str) {}

    /// The address list of an interface changed.
    fn topology_change(&self, nic: &str) {}

    /// A service type was heard for the first time, e.g. `_http._tcp.local`.
    fn type_named(&self, stype: &str) {}

    /// A previously heard service type expired.
    fn type_name_expired(&self, stype: &str) {}

    /// A service instance name was heard for the first time.
    fn service_named(&self, stype: &str, name: &str) {}

    /// A previously heard service instance name expired.
    fn service_name_expired(&self, stype: &str, name: &str) {}

    /// A service became known: heard with enough detail to be useful, or
    /// announced locally.
    fn service_announced(&self, service: &Service) {}

    /// A known service changed host, port, text or addresses.
    fn service_modified(&self, service: &Service) {}

    /// A heard service reached its TTL without being refreshed.
    fn service_expired(&self, service: &Service) {}
}

/// Run `f` against every listener, isolating panics.
pub(crate) fn notify<F>(listeners: &[Arc<dyn ZeroconfListener>], f: F)
where
    F: Fn(&dyn ZeroconfListener),
{
    for listener in listeners {
        if catch_unwind(AssertUnwindSafe(|| f(listener.as_ref()))).is_err() {
            log::warn!("listener panicked, continuing");
        }
    }
}
