use std::net::SocketAddr;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::codec::ServerQueryResponse;

/// Descriptive data about a registered game server, as returned by
/// GET_METADATA. Typed rather than an open key/value bag (spec.md §9's
/// design note): `version`, `max_players`, and `name` are the fields the
/// wire protocol actually carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerMetadata {
    pub version: String,
    pub max_players: u8,
    pub name: String,
}

impl From<&ServerQueryResponse> for ServerMetadata {
    fn from(r: &ServerQueryResponse) -> Self {
        Self {
            version: r.version.clone(),
            max_players: r.max_players,
            name: r.name.clone(),
        }
    }
}

/// One registered server, keyed by its remote address in the directory.
#[derive(Debug, Clone)]
pub struct ServerRecord {
    pub addr: SocketAddr,
    pub add_time: Instant,
    pub refresh_time: Instant,
    pub verified: bool,
    pub needs_hole_punch: bool,
    pub metadata: Option<ServerMetadata>,
    pub metadata_time: Option<Instant>,
}

impl ServerRecord {
    pub fn new(addr: SocketAddr, now: Instant) -> Self {
        Self {
            addr,
            add_time: now,
            refresh_time: now,
            verified: false,
            needs_hole_punch: false,
            metadata: None,
            metadata_time: None,
        }
    }

    pub fn refresh(&mut self, now: Instant) {
        self.refresh_time = now;
    }

    pub fn set_metadata(&mut self, metadata: ServerMetadata, now: Instant) {
        self.metadata = Some(metadata);
        self.metadata_time = Some(now);
    }

    /// Clear verification and the hole-punch flag so the next ADD forces a
    /// fresh verification round trip (spec.md §4.3 metadata-refresh case).
    pub fn mark_stale(&mut self) {
        self.verified = false;
        self.needs_hole_punch = false;
    }

    pub fn metadata_age(&self, now: Instant) -> Option<Duration> {
        self.metadata_time.map(|t| now.saturating_duration_since(t))
    }

    pub fn silence(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.refresh_time)
    }

    /// JSON object for GET_METADATA_RESPONSE: the stored metadata augmented
    /// with the derived `address`, `port`, and `age` fields (spec.md §3, §4.3).
    /// Returns `None` for an unverified record, which per invariant 4 should
    /// never be offered to this function by a well-behaved caller.
    pub fn to_metadata_json(&self, now: Instant) -> Option<serde_json::Value> {
        let metadata = self.metadata.as_ref()?;
        Some(serde_json::json!({
            "version": metadata.version,
            "max_players": metadata.max_players,
            "name": metadata.name,
            "address": self.addr.ip().to_string(),
            "port": self.addr.port(),
            "age": now.saturating_duration_since(self.add_time).as_secs(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_record_is_unverified_with_equal_timestamps() {
        let now = Instant::now();
        let addr: SocketAddr = "203.0.113.5:2342".parse().unwrap();
        let record = ServerRecord::new(addr, now);
        assert!(!record.verified);
        assert_eq!(record.add_time, record.refresh_time);
        assert!(record.metadata_time.is_none());
    }

    #[test]
    fn metadata_json_includes_derived_fields() {
        let now = Instant::now();
        let addr: SocketAddr = "203.0.113.5:2342".parse().unwrap();
        let mut record = ServerRecord::new(addr, now);
        record.set_metadata(
            ServerMetadata {
                version: "Chocolate Doom 3.0.1".into(),
                max_players: 4,
                name: "Arena".into(),
            },
            now,
        );
        let json = record.to_metadata_json(now).unwrap();
        assert_eq!(json["name"], "Arena");
        assert_eq!(json["port"], 2342);
        assert_eq!(json["age"], 0);
    }
}
