//! The public handle over the engine thread.

use std::net::IpAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use mio::{Poll, Waker};

use crate::config::Config;
use crate::engine::{Engine, NicIntent, Shared, STATE_CANCELLED, STATE_RUNNING, WAKER_TOKEN};
use crate::error::{Error, Result};
use crate::events::ZeroconfListener;
use crate::iface::{scan_interfaces, usable_interface_names};
use crate::message::RecordType;
use crate::service::Service;

/// The root service-discovery object: announce services through it, listen
/// for announcements, or both.
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
///
/// Heard services accumulate as announcements arrive; ask the network to
/// produce them with [`Zeroconf::query`] and read them back with
/// [`Zeroconf::services`], or subscribe with [`Zeroconf::add_listener`].
///
/// Construction spawns the engine thread; [`Zeroconf::close`] (or drop)
/// sends a goodbye for every announced service and stops it.
pub struct Zeroconf {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl Zeroconf {
    /// Create an instance with the default configuration, using every
    /// usable interface.
    pub fn new() -> Result<Zeroconf> {
        Zeroconf::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Result<Zeroconf> {
        // A selector that cannot open is the one startup failure that
        // surfaces to the caller.
        let poll = Poll::new().map_err(Error::from)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN).map_err(Error::from)?;
        let shared = Arc::new(Shared::new(config, waker));

        let configured = shared.config.read().unwrap().network_interfaces.clone();
        match configured {
            Some(names) => {
                for name in names {
                    shared.push_intent(NicIntent::Add { name, manual: true });
                }
            }
            None => {
                let scan = scan_interfaces();
                for name in usable_interface_names(&scan) {
                    shared.push_intent(NicIntent::Add {
                        name,
                        manual: false,
                    });
                }
            }
        }

        shared.set_state(STATE_RUNNING);
        let engine = Engine::new(Arc::clone(&shared), poll);
        let handle = thread::Builder::new()
            .name("zeroconf-engine".to_string())
            .spawn(move || engine.run())
            .map_err(Error::from)?;
        Ok(Zeroconf {
            shared,
            handle: Some(handle),
        })
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Subscribe to engine events. Callbacks run on the engine thread and
    /// must not block.
    pub fn add_listener(&self, listener: Arc<dyn ZeroconfListener>) {
        self.shared.add_listener(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ZeroconfListener>) {
        self.shared.remove_listener(listener);
    }

    /// The service discovery domain, `.local` unless configured otherwise.
    pub fn domain(&self) -> String {
        self.shared.config.read().unwrap().domain.clone()
    }

    pub fn set_domain(&self, domain: impl Into<String>) {
        self.shared.config.write().unwrap().domain = domain.into();
    }

    pub fn local_host_name(&self) -> String {
        self.shared.config.read().unwrap().local_host_name.clone()
    }

    /// Set the undotted local host name used as the SRV target of
    /// announced services.
    pub fn set_local_host_name(&self, name: impl Into<String>) {
        self.shared.config.write().unwrap().local_host_name = name.into();
    }

    /// Probe the network for types or services. Responses update the
    /// cache, usually within a second or two.
    ///
    /// `query(None, _)` asks for known service types;
    /// `query(Some("_http._tcp"), None)` for instances of a type (the
    /// domain is appended when missing); `query(Some(type), Some(name))`
    /// for one instance's details.
    pub fn query(&self, stype: Option<&str>, name: Option<&str>) -> Result<()> {
        if let Some(stype) = stype {
            if stype.ends_with('.') {
                return Err(Error::ErrInvalidServiceType);
            }
        }
        self.shared.query(stype, name, RecordType::Srv);
        Ok(())
    }

    /// Every service heard on the network (announced ones included once
    /// their records echo back).
    pub fn services(&self) -> Vec<Service> {
        self.shared.cache.heard_services()
    }

    /// Heard service types, e.g. `_http._tcp.local`.
    pub fn service_types(&self) -> Vec<String> {
        self.shared.cache.types()
    }

    /// Heard fully-qualified service names.
    pub fn service_names(&self) -> Vec<String> {
        self.shared.cache.names()
    }

    /// Services this instance is announcing.
    pub fn announced_services(&self) -> Vec<Service> {
        self.shared.cache.announced_services()
    }

    /// Every address of every interface in use.
    pub fn local_addresses(&self) -> Vec<IpAddr> {
        self.shared.local_addresses()
    }

    /// Names of the interfaces currently in use.
    pub fn interfaces(&self) -> Vec<String> {
        self.shared.interface_names()
    }

    /// Start using an interface. The engine opens its sockets on the next
    /// loop pass.
    pub fn add_interface(&self, name: impl Into<String>) {
        self.shared.push_intent(NicIntent::Add {
            name: name.into(),
            manual: true,
        });
    }

    pub fn remove_interface(&self, name: impl Into<String>) {
        self.shared.push_intent(NicIntent::Remove(name.into()));
    }

    /// Cancel every announced service and stop the engine thread. Safe to
    /// call once; dropping the handle does the same.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.shared.state() == STATE_CANCELLED {
            return;
        }
        for service in self.shared.cache.announced_services() {
            self.shared.unannounce(&service);
        }
        self.shared.set_state(STATE_CANCELLED);
        self.shared.wake();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Zeroconf {
    fn drop(&mut self) {
        self.shutdown();
    }
}
