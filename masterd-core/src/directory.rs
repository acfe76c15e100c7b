use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use crate::record::ServerRecord;

/// In-memory mapping from remote address to server record. Sole owner of
/// server records; per spec.md §5 every mutation happens from the single
/// event-loop task, so no internal locking is required.
#[derive(Debug, Default)]
pub struct Directory {
    servers: HashMap<SocketAddr, ServerRecord>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<&ServerRecord> {
        self.servers.get(addr)
    }

    pub fn get_mut(&mut self, addr: &SocketAddr) -> Option<&mut ServerRecord> {
        self.servers.get_mut(addr)
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.servers.contains_key(addr)
    }

    /// Create a new record, or bump `refresh_time` on an existing one.
    /// Returns `true` when a new record was created.
    pub fn upsert(&mut self, addr: SocketAddr, now: Instant) -> bool {
        match self.servers.get_mut(&addr) {
            Some(record) => {
                record.refresh(now);
                false
            }
            None => {
                self.servers.insert(addr, ServerRecord::new(addr, now));
                true
            }
        }
    }

    pub fn remove(&mut self, addr: &SocketAddr) -> Option<ServerRecord> {
        self.servers.remove(addr)
    }

    /// Records visible to clients: query and metadata responses must only
    /// ever surface these (invariant 4).
    pub fn verified_snapshot(&self) -> impl Iterator<Item = &ServerRecord> {
        self.servers.values().filter(|r| r.verified)
    }

    pub fn all_snapshot(&self) -> impl Iterator<Item = &ServerRecord> {
        self.servers.values()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_creates_then_refreshes() {
        let mut dir = Directory::new();
        let addr: SocketAddr = "203.0.113.5:2342".parse().unwrap();
        let t0 = Instant::now();
        assert!(dir.upsert(addr, t0));
        assert!(!dir.upsert(addr, t0));
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn only_verified_records_are_snapshotted() {
        let mut dir = Directory::new();
        let now = Instant::now();
        let a: SocketAddr = "203.0.113.5:1".parse().unwrap();
        let b: SocketAddr = "203.0.113.5:2".parse().unwrap();
        dir.upsert(a, now);
        dir.upsert(b, now);
        dir.get_mut(&b).unwrap().verified = true;

        let verified: Vec<_> = dir.verified_snapshot().map(|r| r.addr).collect();
        assert_eq!(verified, vec![b]);
        assert_eq!(dir.all_snapshot().count(), 2);
    }
}
