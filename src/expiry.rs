//! Keyed, coalescing timer queue driving TTL expiry and refresh.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// What a deadline belongs to. Re-scheduling the same key replaces the
/// pending entry, which is how a record refresh pushes its expiry out.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum ExpiryKey {
    /// A heard service type, e.g. `_http._tcp.local`.
    Type(String),
    /// A heard service instance name (fqdn).
    Name(String),
    /// A heard or owned service, by fqdn.
    Service(String),
    /// The TXT contents of a service, by fqdn.
    Txt(String),
    /// One address record bound to a host.
    Addr(String, IpAddr),
}

pub(crate) type ExpiryAction = Box<dyn FnOnce() + Send>;

struct Entry {
    deadline: Instant,
    action: ExpiryAction,
}

/// A map of pending deadlines. There is no ordering by deadline; the loop
/// wakes at most five seconds apart and scans everything, which is cheap at
/// the sizes mDNS caches reach.
#[derive(Default)]
pub(crate) struct ExpiryWheel {
    entries: HashMap<ExpiryKey, Entry>,
}

impl ExpiryWheel {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Schedule `action` to run once `ttl_secs` from now. A TTL of zero
    /// runs at the next tick.
    pub(crate) fn schedule(&mut self, key: ExpiryKey, ttl_secs: u32, action: ExpiryAction) {
        let deadline = Instant::now() + Duration::from_millis(u64::from(ttl_secs) * 1000);
        self.entries.insert(key, Entry { deadline, action });
    }

    /// Run every entry whose deadline has passed.
    pub(crate) fn tick(&mut self) {
        let now = Instant::now();
        let expired: Vec<ExpiryKey> = self
            .entries
            .iter()
            .filter(|(_, e)| now >= e.deadline)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            if let Some(entry) = self.entries.remove(&key) {
                (entry.action)();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn deadline(&self, key: &ExpiryKey) -> Option<Instant> {
        self.entries.get(key).map(|e| e.deadline)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn zero_ttl_runs_on_next_tick() {
        let mut wheel = ExpiryWheel::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        wheel.schedule(
            ExpiryKey::Type("_http._tcp.local".into()),
            0,
            Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );
        wheel.tick();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(wheel.len(), 0);
    }

    #[test]
    fn reschedule_replaces_entry() {
        let mut wheel = ExpiryWheel::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let key = ExpiryKey::Service("Web._http._tcp.local".into());

        let h = hits.clone();
        wheel.schedule(key.clone(), 0, Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        // Replacement pushes the deadline out, so the first action never runs.
        let h = hits.clone();
        wheel.schedule(key.clone(), 600, Box::new(move || {
            h.fetch_add(100, Ordering::SeqCst);
        }));

        assert_eq!(wheel.len(), 1);
        wheel.tick();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(wheel.deadline(&key).is_some());
    }

    #[test]
    fn deadline_is_ttl_seconds_out() {
        let mut wheel = ExpiryWheel::new();
        let key = ExpiryKey::Txt("Web._http._tcp.local".into());
        let before = Instant::now();
        wheel.schedule(key.clone(), 60, Box::new(|| {}));
        let deadline = wheel.deadline(&key).unwrap();
        let lo = before + Duration::from_secs(60);
        let hi = Instant::now() + Duration::from_secs(60);
        assert!(deadline >= lo && deadline <= hi);
    }
}
