//! # zeroconf
//!
//! A Multicast DNS / DNS-Service-Discovery (mDNS/DNS-SD) responder and
//! resolver for the local link, per RFC 6762 and RFC 6763.
//!
//! The crate runs a single engine thread that owns every multicast socket
//! and every piece of mutable state. It listens for queries and
//! announcements on all cooperating interfaces, keeps a TTL-driven cache
//! of the services it hears, answers queries for the services it
//! announces, and probes the link before claiming a name.
//!
//! ## Announcing a service
//!
//! ```rust,no_run
//! use zeroconf::{ServiceBuilder, Zeroconf};
//!
//! let zc = Zeroconf::new()?;
//! let service = ServiceBuilder::new("MyWeb", "_http._tcp")
//!     .port(8080)
//!     .text("path", "/path/to/service")
//!     .build(&zc)?;
//! service.announce();
//! // time passes
//! service.cancel();
//! zc.close();
//! # Ok::<(), zeroconf::Error>(())
//! ```
//!
//! ## Discovering services
//!
//! Either poll the live views, or subscribe to events:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use zeroconf::{Zeroconf, ZeroconfListener};
//!
//! struct Watcher;
//!
//! impl ZeroconfListener for Watcher {
//!     fn service_named(&self, stype: &str, name: &str) {
//!         println!("heard {name} of type {stype}");
//!     }
//! }
//!
//! let zc = Zeroconf::new()?;
//! zc.add_listener(Arc::new(Watcher));
//! zc.query(Some("_http._tcp"), None)?;
//! // time passes
//! for service in zc.services() {
//!     println!("{service}");
//! }
//! zc.close();
//! # Ok::<(), zeroconf::Error>(())
//! ```
//!
//! ## Behaviour notes
//!
//! - Queries and responses go to `224.0.0.251:5353` and `[ff02::fb]:5353`,
//!   one socket pair per interface.
//! - A service is announced only after three probes, 250 ms apart, draw no
//!   matching answer; cancelling re-sends its records with TTL 0.
//! - Heard records expire at their TTL; our own records are refreshed at
//!   90% of theirs.
//! - Interface addresses are reconciled on every loop pass; address
//!   changes reannounce every owned service.
//! - Listener callbacks run inline on the engine thread and must not
//!   block.

#![warn(rust_2018_idioms)]

pub(crate) mod cache;
pub mod config;
pub(crate) mod engine;
pub mod error;
pub mod events;
pub(crate) mod expiry;
pub(crate) mod iface;
pub mod message;
pub mod service;
mod zeroconf;

pub use config::{
    Config, MDNS_MULTICAST_IPV4, MDNS_MULTICAST_IPV6, MDNS_PORT, TTL_A, TTL_PTR, TTL_SRV, TTL_TXT,
};
pub use error::{Error, Result};
pub use events::ZeroconfListener;
pub use message::packet::Packet;
pub use message::record::{Record, RecordData, TxtData};
pub use message::RecordType;
pub use service::{Service, ServiceBuilder};
pub use zeroconf::Zeroconf;
