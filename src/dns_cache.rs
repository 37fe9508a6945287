//! In-memory DNS resolution cache for the Grouping Engine.
//!
//! Unlike the teacher's `resolved.txt`-backed cache, this never persists
//! resolutions across runs (spec's Non-goal on persistent state). It caches
//! the *full* address list per domain: a host with multiple `A` records
//! must keep producing one membership per resolved IP (spec §3) regardless
//! of whether it's resolved fresh or served from cache.

use std::net::IpAddr;

use ahash::{HashMap, HashMapExt as _};

#[derive(Default)]
pub struct DnsCache {
    cache: HashMap<String, Vec<IpAddr>>,
}

impl DnsCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            cache: HashMap::new(),
        }
    }

    #[must_use]
    pub fn get(&self, domain: &str) -> Option<Vec<IpAddr>> {
        self.cache.get(domain).cloned()
    }

    pub fn insert(&mut self, domain: String, ips: Vec<IpAddr>) {
        self.cache.insert(domain, ips);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_get_round_trips() {
        let mut cache = DnsCache::new();
        let ip: IpAddr = "203.0.112.7".parse().unwrap();
        assert!(cache.get("example.com").is_none());
        cache.insert("example.com".to_owned(), vec![ip]);
        assert_eq!(cache.get("example.com"), Some(vec![ip]));
    }

    #[test]
    fn caches_every_resolved_address_not_just_the_first() {
        let mut cache = DnsCache::new();
        let first: IpAddr = "203.0.113.1".parse().unwrap();
        let second: IpAddr = "203.0.113.2".parse().unwrap();
        cache.insert("multi.example".to_owned(), vec![first, second]);
        assert_eq!(cache.get("multi.example"), Some(vec![first, second]));
    }
}
