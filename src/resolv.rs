//! Background reverse-DNS service with an address-to-name cache.
//!
//! The actual lookup primitive is injected; platform resolvers are external
//! collaborators. Until (or unless) a lookup succeeds, the cache answers
//! with the numeric address it was seeded with.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;

pub struct ResolvService {
    tx: Option<Sender<(String, IpAddr)>>,
    cache: Arc<Mutex<HashMap<String, String>>>,
    worker: Option<JoinHandle<()>>,
}

impl ResolvService {
    /// A service with no lookup backend; entries keep their numeric form.
    pub fn new() -> Self {
        ResolvService::with_lookup(|_| None)
    }

    pub fn with_lookup(lookup: impl Fn(IpAddr) -> Option<String> + Send + 'static) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded::<(String, IpAddr)>();
        let cache = Arc::new(Mutex::new(HashMap::new()));
        let worker = {
            let cache = Arc::clone(&cache);
            thread::Builder::new()
                .name("rinspect-resolv".into())
                .spawn(move || {
                    for (addr, ip) in rx {
                        if let Some(name) = lookup(ip) {
                            cache.lock().unwrap_or_else(|e| e.into_inner()).insert(addr, name);
                        }
                    }
                })
                .ok()
        };
        ResolvService { tx: Some(tx), cache, worker }
    }

    /// Seeds the cache with the numeric address and schedules a lookup.
    /// Repeat queries for a known address are no-ops.
    pub fn query(&self, addr: &str, ip: IpAddr) {
        {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if cache.contains_key(addr) {
                return;
            }
            cache.insert(addr.to_string(), addr.to_string());
        }
        if let Some(tx) = &self.tx {
            let _ = tx.send((addr.to_string(), ip));
        }
    }

    pub fn get(&self, addr: &str) -> Option<String> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).get(addr).cloned()
    }
}

impl Default for ResolvService {
    fn default() -> Self {
        ResolvService::new()
    }
}

impl Drop for ResolvService {
    fn drop(&mut self) {
        // disconnect the channel so the worker's iterator ends
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::{Duration, Instant};

    #[test]
    fn lookup_populates_cache_asynchronously() {
        let service = ResolvService::with_lookup(|ip| match ip {
            IpAddr::V4(v4) if v4 == Ipv4Addr::new(10, 0, 0, 1) => Some("render-box".into()),
            _ => None,
        });
        service.query("10.0.0.1", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(service.get("10.0.0.1"), Some("10.0.0.1".into()));

        let deadline = Instant::now() + Duration::from_secs(5);
        while service.get("10.0.0.1").as_deref() != Some("render-box") {
            assert!(Instant::now() < deadline, "lookup never landed");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn unresolvable_addresses_stay_numeric() {
        let service = ResolvService::new();
        service.query("192.168.1.7", IpAddr::V4(Ipv4Addr::new(192, 168, 1, 7)));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(service.get("192.168.1.7"), Some("192.168.1.7".into()));
        assert_eq!(service.get("unknown"), None);
    }
}
